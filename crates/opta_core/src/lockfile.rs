//! Per-directory process lock under `~/.opta`.
//!
//! Two opta runs from the same working directory would fight over
//! `main.tf.json` and `.terraform/`. Each mutating command holds an
//! `opta_lock_<dir>_<digest>_<pid>` file for its whole run; another live process
//! holding one for the same directory makes the command refuse to start.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{OptaError, OptaResult};

const LOCK_PREFIX: &str = "opta_lock_";

/// File name stem for `cwd`: its last component for readability, then a
/// digest of the canonical path so distinct directories never share a stem.
fn lock_stem(cwd: &Path) -> String {
    let canonical = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let digest: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    let dir: String = canonical
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", dir, digest)
}

fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new("/proc").join(pid.to_string()).exists()
    } else {
        true
    }
}

/// Lock file removed when dropped.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(opta_home: &Path, cwd: &Path) -> OptaResult<Self> {
        Self::acquire_as(opta_home, cwd, std::process::id())
    }

    fn acquire_as(opta_home: &Path, cwd: &Path, pid: u32) -> OptaResult<Self> {
        std::fs::create_dir_all(opta_home)?;
        let prefix = format!("{}{}_", LOCK_PREFIX, lock_stem(cwd));

        for entry in std::fs::read_dir(opta_home)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(other) = name.strip_prefix(&prefix).and_then(|p| p.parse::<u32>().ok()) else {
                continue;
            };
            if other == pid {
                continue;
            }
            if pid_alive(other) {
                return Err(OptaError::user(format!(
                    "Another opta process (pid {}) is running in {}; wait for it to finish",
                    other,
                    cwd.display()
                )));
            }
            debug!("Removing stale lock of pid {}", other);
            if let Err(e) = std::fs::remove_file(opta_home.join(&name)) {
                warn!("Could not remove stale process lock {}: {}", name, e);
            }
        }

        let path = opta_home.join(format!("{}{}", prefix, pid));
        std::fs::write(&path, pid.to_string())?;
        debug!("Acquired process lock {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove process lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_file_removed_on_drop() {
        let home = tempdir().unwrap();
        let path = {
            let lock = ProcessLock::acquire(home.path(), Path::new("/src/app")).unwrap();
            assert!(lock.path().exists());
            assert!(lock
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("opta_lock_app_"));
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_live_holder_blocks() {
        let home = tempdir().unwrap();
        let cwd = Path::new("/src/app");
        let _held = ProcessLock::acquire(home.path(), cwd).unwrap();
        // Our own pid is alive, so pretending to be someone else must fail.
        let err = ProcessLock::acquire_as(home.path(), cwd, u32::MAX).unwrap_err();
        assert!(err.is_user_error());
        assert!(ProcessLock::acquire_as(home.path(), Path::new("/src/other"), u32::MAX).is_ok());
    }

    #[test]
    fn test_similar_paths_do_not_collide() {
        // Both squash to `_src_my_app` when only punctuation is replaced.
        let home = tempdir().unwrap();
        let _held = ProcessLock::acquire(home.path(), Path::new("/src/my-app")).unwrap();
        assert!(ProcessLock::acquire_as(home.path(), Path::new("/src/my_app"), u32::MAX).is_ok());
        assert_ne!(lock_stem(Path::new("/src/my-app")), lock_stem(Path::new("/src/my_app")));
    }

    #[test]
    fn test_stem_uses_canonical_path() {
        let root = tempdir().unwrap();
        let dir = root.path().join("app");
        std::fs::create_dir(&dir).unwrap();
        assert_eq!(lock_stem(&dir), lock_stem(&dir.join("..").join("app")));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_stale_lock_is_replaced() {
        let home = tempdir().unwrap();
        let cwd = Path::new("/src/app");
        let stale = home
            .path()
            .join(format!("{}{}_{}", LOCK_PREFIX, lock_stem(cwd), u32::MAX));
        std::fs::write(&stale, "0").unwrap();
        let lock = ProcessLock::acquire(home.path(), cwd).unwrap();
        assert!(!stale.exists());
        assert!(lock.path().exists());
    }
}
