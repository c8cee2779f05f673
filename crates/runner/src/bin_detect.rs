#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn path_contains_separator(cmd: &str) -> bool {
    cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/')
}

fn search_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|raw| std::env::split_paths(&raw).collect())
        .unwrap_or_default()
}

pub(crate) fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolves the provider command to an executable path: a command containing a path separator
/// must point at an executable file, a bare name is looked up in `dirs`.
pub(crate) fn resolve_command_in(cmd: &str, dirs: &[PathBuf]) -> Result<PathBuf, String> {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return Err("provider binary must not be empty".to_string());
    }
    if path_contains_separator(trimmed) {
        let path = PathBuf::from(trimmed);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(format!("provider binary {trimmed} is not an executable file"));
    }
    find_executable_in_dirs(trimmed, dirs)
        .ok_or_else(|| format!("provider binary {trimmed} not found on PATH"))
}

pub(crate) fn resolve_command(cmd: &str) -> Result<PathBuf, String> {
    resolve_command_in(cmd, &search_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn stub(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\necho ok\n").expect("write stub");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod");
        }
        path
    }

    #[test]
    fn bare_names_are_found_in_the_search_dirs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = stub(dir.path(), "claude");
        let dirs = vec![PathBuf::new(), dir.path().to_path_buf()];

        assert_eq!(find_executable_in_dirs("claude", &dirs), Some(path.clone()));
        assert_eq!(resolve_command_in("claude", &dirs), Ok(path));
        assert!(resolve_command_in("missing-provider", &dirs).is_err());
        assert!(resolve_command_in("   ", &dirs).is_err());
    }

    #[test]
    fn explicit_paths_must_be_executable_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = stub(dir.path(), "provider");
        let explicit = path.to_string_lossy().to_string();

        assert_eq!(resolve_command_in(&explicit, &[]), Ok(path));
        let missing = dir.path().join("nope").to_string_lossy().to_string();
        assert!(resolve_command_in(&missing, &[]).is_err());
    }
}
