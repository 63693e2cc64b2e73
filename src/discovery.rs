//! Source file discovery.
//!
//! Walks the source root recursively and returns every file whose extension
//! is registered in the [`LoaderRegistry`], minus the ones already known to
//! the target collection. Paths are made absolute so they can be compared
//! against persisted `source` metadata. Discovery only reads the filesystem.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::loader::LoaderRegistry;
use crate::models::SourceFile;

/// Directories never worth ingesting.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

pub struct FileDiscovery<'a> {
    registry: &'a LoaderRegistry,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl<'a> FileDiscovery<'a> {
    pub fn new(
        registry: &'a LoaderRegistry,
        exclude_globs: &[String],
        follow_symlinks: bool,
    ) -> Result<Self> {
        let patterns = DEFAULT_EXCLUDES
            .iter()
            .map(|p| p.to_string())
            .chain(exclude_globs.iter().cloned());
        Ok(Self {
            registry,
            exclude: build_globset(patterns)?,
            follow_symlinks,
        })
    }

    /// Files under `source_root` that are new relative to `known_source_paths`.
    ///
    /// The result has no duplicate paths and is sorted by path.
    pub fn discover(
        &self,
        source_root: &Path,
        known_source_paths: &HashSet<String>,
    ) -> Result<Vec<SourceFile>> {
        if !source_root.is_dir() {
            bail!("source directory does not exist: {}", source_root.display());
        }
        let root = absolute(source_root)?;

        let mut found: BTreeMap<PathBuf, SourceFile> = BTreeMap::new();
        let mut skipped_known = 0usize;

        for entry in WalkDir::new(&root).follow_links(self.follow_symlinks) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            if self.exclude.is_match(relative) {
                continue;
            }

            let Some(extension) = dotted_extension(path) else {
                continue;
            };
            if !self.registry.supports(&extension) {
                continue;
            }

            if known_source_paths.contains(path.to_string_lossy().as_ref()) {
                skipped_known += 1;
                continue;
            }

            found
                .entry(path.to_path_buf())
                .or_insert_with(|| SourceFile::new(path.to_path_buf(), extension));
        }

        tracing::debug!(
            root = %root.display(),
            new = found.len(),
            already_ingested = skipped_known,
            "discovery finished"
        );
        Ok(found.into_values().collect())
    }
}

/// Extension with its leading dot, as written on disk (no case folding).
fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
}

/// Absolute, normalized form of `path` (symlinks in the root resolved).
pub fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve path: {}", path.display()))
}

fn build_globset(patterns: impl IntoIterator<Item = String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(&pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("nested/b.md"), "b").unwrap();
        fs::write(root.join("nested/deeper/c.pdf"), "c").unwrap();
        fs::write(root.join("ignored.exe"), "x").unwrap();
        fs::write(root.join("UPPER.TXT"), "x").unwrap();
        fs::write(root.join("noext"), "x").unwrap();
        fs::write(root.join(".git/config.txt"), "x").unwrap();
        tmp
    }

    fn names(files: &[SourceFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn finds_registered_extensions_recursively() {
        let tmp = tree();
        let registry = LoaderRegistry::default();
        let discovery = FileDiscovery::new(&registry, &[], false).unwrap();

        let files = discovery.discover(tmp.path(), &HashSet::new()).unwrap();
        let mut found = names(&files);
        found.sort();
        assert_eq!(found, vec!["a.txt", "b.md", "c.pdf"]);
        assert!(files.iter().all(|f| f.path.is_absolute()));
        assert_eq!(
            files.iter().find(|f| f.extension == ".pdf").map(|f| names(std::slice::from_ref(f))),
            Some(vec!["c.pdf".to_string()])
        );
    }

    #[test]
    fn known_paths_are_excluded() {
        let tmp = tree();
        let registry = LoaderRegistry::default();
        let discovery = FileDiscovery::new(&registry, &[], false).unwrap();

        let first = discovery.discover(tmp.path(), &HashSet::new()).unwrap();
        let known: HashSet<String> = first.iter().map(SourceFile::source_key).collect();
        let second = discovery.discover(tmp.path(), &known).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn user_excludes_apply_relative_to_root() {
        let tmp = tree();
        let registry = LoaderRegistry::default();
        let discovery =
            FileDiscovery::new(&registry, &["nested/**".to_string()], false).unwrap();

        let files = discovery.discover(tmp.path(), &HashSet::new()).unwrap();
        assert_eq!(names(&files), vec!["a.txt"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let registry = LoaderRegistry::default();
        let discovery = FileDiscovery::new(&registry, &[], false).unwrap();
        assert!(discovery
            .discover(Path::new("/definitely/not/here"), &HashSet::new())
            .is_err());
    }
}
