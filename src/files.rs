//! Source file listing for the indexing UI.
//!
//! Walks the configured files root and returns the indexable source files
//! (name, path, size), filtered by include/exclude globs. This is the
//! external file-browsing collaborator; the pipeline itself only ever sees
//! paths handed to the indexer.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::FilesConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// List indexable files under the configured root, sorted by relative path.
pub fn list_files(config: &FilesConfig) -> Result<Vec<SourceFile>> {
    if !config.root.exists() {
        return Err(PipelineError::invalid(format!(
            "files root does not exist: {}",
            config.root.display()
        )));
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(&config.root) {
        let entry = entry.map_err(|e| PipelineError::invalid(format!("walk failed: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&config.root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push(SourceFile {
            name: entry.file_name().to_string_lossy().to_string(),
            path: path.to_string_lossy().to_string(),
            size,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| PipelineError::invalid(format!("bad glob '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| PipelineError::invalid(format!("glob set build failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_for(root: PathBuf) -> FilesConfig {
        FilesConfig {
            root,
            include_globs: vec!["**/*.txt".to_string(), "**/*.pdf".to_string()],
            exclude_globs: vec!["**/skip/**".to_string()],
        }
    }

    #[test]
    fn lists_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("c.rs"), "ignored").unwrap();

        let files = list_files(&config_for(dir.path().to_path_buf())).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(files[0].size > 0);
    }

    #[test]
    fn exclude_globs_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("skip")).unwrap();
        std::fs::write(dir.path().join("skip/hidden.txt"), "x").unwrap();
        std::fs::write(dir.path().join("seen.txt"), "x").unwrap();

        let files = list_files(&config_for(dir.path().to_path_buf())).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "seen.txt");
    }

    #[test]
    fn missing_root_is_invalid() {
        let err = list_files(&config_for(PathBuf::from("/nonexistent/root"))).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
