//! Interactive directory selection, used when no database is named on the
//! command line.
//!
//! The chosen source and persist directories are written back to `.env` so
//! the next run's "use current directory" picks them up.

use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Input, Select};
use std::path::{Path, PathBuf};

use crate::layout;

/// How the menu ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Selected { source: PathBuf, persist: PathBuf },
    /// Quit from the top-level menu.
    Quit,
    /// Quit from inside a sub-menu.
    Abort,
}

const MAIN_ITEMS: [&str; 4] = [
    "Select an existing directory",
    "Create a new directory",
    "Use the current configured directory",
    "Quit",
];

/// Run the menu until the user picks a directory or quits.
///
/// `current` is the source/persist pair from the environment or defaults.
pub fn choose_directories(
    root: &Path,
    env_file: &Path,
    current: (PathBuf, PathBuf),
) -> Result<PromptOutcome> {
    let theme = ColorfulTheme::default();

    loop {
        let choice = Select::with_theme(&theme)
            .with_prompt("What would you like to ingest?")
            .items(&MAIN_ITEMS)
            .default(0)
            .interact()?;

        let outcome = match choice {
            0 => select_existing(&theme, root, env_file)?,
            1 => Some(create_new(&theme, root, env_file)?),
            2 => use_current(&current),
            _ => Some(PromptOutcome::Quit),
        };
        if let Some(outcome) = outcome {
            return Ok(outcome);
        }
    }
}

/// `None` means "back to the main menu".
fn select_existing(
    theme: &ColorfulTheme,
    root: &Path,
    env_file: &Path,
) -> Result<Option<PromptOutcome>> {
    let databases = layout::list_databases(root)?;
    if databases.is_empty() {
        eprintln!(
            "No directories under {}. Create one first.",
            root.join(layout::SOURCE_DOCUMENTS).display()
        );
        return Ok(None);
    }

    let mut items: Vec<&str> = databases.iter().map(String::as_str).collect();
    items.push("Back");
    items.push("Quit");
    let back = databases.len();

    loop {
        let choice = Select::with_theme(theme)
            .with_prompt("Select a directory")
            .items(&items)
            .default(0)
            .interact()?;

        if choice == back {
            return Ok(None);
        }
        if choice > back {
            return Ok(Some(PromptOutcome::Abort));
        }

        let name = &databases[choice];
        let source = layout::source_dir(root, name);
        if layout::is_empty_dir(&source)? {
            eprintln!("'{}' is empty. Add documents to {} first.", name, source.display());
            continue;
        }
        return Ok(Some(apply_selection(root, env_file, name)?));
    }
}

fn create_new(theme: &ColorfulTheme, root: &Path, env_file: &Path) -> Result<PromptOutcome> {
    let name: String = Input::with_theme(theme)
        .with_prompt("Name of the new directory")
        .validate_with(|input: &String| validate_database_name(input).map_err(|e| e.to_string()))
        .interact_text()?;

    let outcome = apply_selection(root, env_file, name.trim())?;
    if let PromptOutcome::Selected { source, .. } = &outcome {
        println!("Put your documents into {}", source.display());
        let _: String = Input::with_theme(theme)
            .with_prompt("Press Enter when ready")
            .allow_empty(true)
            .interact_text()?;
    }
    Ok(outcome)
}

fn use_current(current: &(PathBuf, PathBuf)) -> Option<PromptOutcome> {
    let (source, persist) = current;
    if !source.is_dir() {
        eprintln!("Configured source directory {} does not exist.", source.display());
        return None;
    }
    Some(PromptOutcome::Selected {
        source: source.clone(),
        persist: persist.clone(),
    })
}

/// Create the directories for `name` and record them in `env_file`.
pub fn apply_selection(root: &Path, env_file: &Path, name: &str) -> Result<PromptOutcome> {
    let (source, persist) = layout::ensure_database_dirs(root, name)?;
    layout::set_env_key(
        env_file,
        layout::ENV_SOURCE_DIRECTORY,
        &source.to_string_lossy(),
    )?;
    layout::set_env_key(
        env_file,
        layout::ENV_PERSIST_DIRECTORY,
        &persist.to_string_lossy(),
    )?;
    tracing::info!(source = %source.display(), persist = %persist.display(), "directories selected");
    Ok(PromptOutcome::Selected { source, persist })
}

/// A database name becomes a single directory component.
pub fn validate_database_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("name must be a single directory name");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_must_be_single_components() {
        assert!(validate_database_name("papers").is_ok());
        assert!(validate_database_name("  ").is_err());
        assert!(validate_database_name("..").is_err());
        assert!(validate_database_name("a/b").is_err());
    }

    #[test]
    fn selection_creates_dirs_and_records_env() {
        let tmp = TempDir::new().unwrap();
        let env_file = tmp.path().join(".env");
        let outcome = apply_selection(tmp.path(), &env_file, "notes").unwrap();

        let PromptOutcome::Selected { source, persist } = outcome else {
            panic!("expected a selection");
        };
        assert!(source.is_dir());
        assert!(persist.is_dir());

        let env = std::fs::read_to_string(&env_file).unwrap();
        assert!(env.contains(&format!("INGEST_SOURCE_DIRECTORY=\"{}\"", source.display())));
        assert!(env.contains(&format!("INGEST_PERSIST_DIRECTORY=\"{}\"", persist.display())));
    }

    #[test]
    fn current_directory_must_exist() {
        let missing = (PathBuf::from("/no/such/source"), PathBuf::from("/no/such/db"));
        assert_eq!(use_current(&missing), None);

        let tmp = TempDir::new().unwrap();
        let present = (tmp.path().to_path_buf(), tmp.path().join("db"));
        assert!(matches!(
            use_current(&present),
            Some(PromptOutcome::Selected { .. })
        ));
    }
}
