use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const CONTEXT_FILE_PREFIX: &str = "context-";
pub const CONTEXT_FILE_SUFFIX: &str = ".json";
const HASH_HEX_LEN: usize = 16;

/// Directory holding persisted windows. They sit directly in the
/// configuration directory next to `settings.json`; listing only picks up
/// `context-*.json` names.
#[must_use]
pub fn context_root(config_dir: &Path) -> PathBuf {
    config_dir.to_path_buf()
}

/// Stable project identity: leading hex of SHA-256 over the canonical path.
#[must_use]
pub fn project_hash(project_path: &Path) -> String {
    let canonical = project_path
        .canonicalize()
        .unwrap_or_else(|_| project_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(HASH_HEX_LEN);
    digest
}

#[must_use]
pub fn context_file_name(project_path: &Path) -> String {
    format!(
        "{CONTEXT_FILE_PREFIX}{}{CONTEXT_FILE_SUFFIX}",
        project_hash(project_path)
    )
}

#[must_use]
pub fn context_file_path(dir: &Path, project_path: &Path) -> PathBuf {
    dir.join(context_file_name(project_path))
}

/// Session id encoded in a context file name, if it is one.
pub(crate) fn session_id_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(CONTEXT_FILE_PREFIX)?
        .strip_suffix(CONTEXT_FILE_SUFFIX)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_sixteen_hex_chars() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = project_hash(dir.path());
        let second = project_hash(dir.path());

        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn windows_live_directly_in_the_config_dir() {
        let config = Path::new("/home/dev/.config/zagent");
        let path = context_file_path(&context_root(config), Path::new("/definitely/not/existing"));
        assert_eq!(path.parent(), Some(config));
    }

    #[test]
    fn different_projects_get_different_files() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        assert_ne!(context_file_name(a.path()), context_file_name(b.path()));
    }

    #[test]
    fn session_id_round_trips_through_file_name() {
        let name = context_file_name(Path::new("/definitely/not/existing"));
        let id = session_id_from_file_name(&name).expect("context file name");
        assert_eq!(id.len(), 16);
        assert_eq!(session_id_from_file_name("settings.json"), None);
        assert_eq!(session_id_from_file_name("context-.json"), None);
    }
}
