//! On-disk workspace layout.
//!
//! ```text
//! <root>/source_documents/<database>/   source material
//! <root>/db/<database>/                 persisted collections
//! <root>/.env                           last selected directories
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SOURCE_DOCUMENTS: &str = "source_documents";
pub const DB: &str = "db";

pub const ENV_SOURCE_DIRECTORY: &str = "INGEST_SOURCE_DIRECTORY";
pub const ENV_PERSIST_DIRECTORY: &str = "INGEST_PERSIST_DIRECTORY";

pub fn source_dir(root: &Path, database: &str) -> PathBuf {
    root.join(SOURCE_DOCUMENTS).join(database)
}

pub fn persist_dir(root: &Path, database: &str) -> PathBuf {
    root.join(DB).join(database)
}

/// Create both directories for `database` if missing.
pub fn ensure_database_dirs(root: &Path, database: &str) -> Result<(PathBuf, PathBuf)> {
    let source = source_dir(root, database);
    let persist = persist_dir(root, database);
    std::fs::create_dir_all(&source)
        .with_context(|| format!("Failed to create {}", source.display()))?;
    std::fs::create_dir_all(&persist)
        .with_context(|| format!("Failed to create {}", persist.display()))?;
    Ok((source, persist))
}

/// Names of the database directories under `<root>/source_documents`, sorted.
pub fn list_databases(root: &Path) -> Result<Vec<String>> {
    let dir = root.join(SOURCE_DOCUMENTS);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries =
        std::fs::read_dir(path).with_context(|| format!("Failed to list {}", path.display()))?;
    Ok(entries.next().is_none())
}

/// Insert or replace `key` in a dotenv file, keeping every other line.
pub fn set_env_key(env_file: &Path, key: &str, value: &str) -> Result<()> {
    let existing = match std::fs::read_to_string(env_file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", env_file.display()))
        }
    };

    let assignment = format!("{}=\"{}\"", key, escape_env_value(value));
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let name = line
                .trim_start()
                .trim_start_matches("export ")
                .split('=')
                .next()
                .unwrap_or("")
                .trim();
            if name == key && !replaced {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    std::fs::write(env_file, out).with_context(|| format!("Failed to write {}", env_file.display()))
}

/// Escape a value for a double-quoted dotenv assignment. `$` is escaped so
/// dotenv loaders do not substitute variables inside paths.
fn escape_env_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
