#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_STORE_DIRNAME: &str = ".tether";
pub(crate) const DEFAULT_PROVIDER_BIN: &str = "claude";
pub(crate) const DEFAULT_MAX_PARALLEL: usize = 2;

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

fn normalize_runner_prefix(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "runner".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The store lives at the repository root so runners started from a subdirectory share it.
pub(crate) fn default_storage_dir_from_start(start: &Path) -> PathBuf {
    find_repo_root(start)
        .unwrap_or_else(|| start.to_path_buf())
        .join(DEFAULT_STORE_DIRNAME)
}

pub(crate) fn default_runner_id_from_start(start: &Path, pid: u32) -> String {
    let root = find_repo_root(start).unwrap_or_else(|| start.to_path_buf());
    let raw = root
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("runner");
    format!("{}-{pid}", normalize_runner_prefix(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_repo_root_over_subdir() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let root = tmp.path().join("My Project");
        std::fs::create_dir_all(root.join(".git")).expect("create fake .git");
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested dir");

        assert_eq!(
            default_storage_dir_from_start(&nested),
            root.join(DEFAULT_STORE_DIRNAME)
        );
        assert_eq!(default_runner_id_from_start(&nested, 42), "my-project-42");
    }

    #[test]
    fn runner_prefix_falls_back_when_nothing_survives() {
        assert_eq!(normalize_runner_prefix("???"), "runner");
        assert_eq!(normalize_runner_prefix("Box_01.dev"), "box_01.dev");
    }
}
