//! Workspace staging
//!
//! Files staged on a sandbox are copied into a private directory for every
//! new execution context. Guest writes land in that copy and are discarded
//! with it, so no state carries over between runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, SandboxError};

/// In-memory set of files to expose to guests
#[derive(Debug, Clone, Default)]
pub struct VirtualFs {
    files: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a file, replacing any previous content at that path
    pub fn write_file(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        let key = normalize(path)?;
        self.write_guard().insert(key, content.into());
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let key = normalize(path)?;
        self.read_guard()
            .get(&key)
            .cloned()
            .ok_or_else(|| SandboxError::Workspace(format!("file not found: {}", path)))
    }

    pub fn exists(&self, path: &str) -> bool {
        match normalize(path) {
            Ok(key) => self.read_guard().contains_key(&key),
            Err(_) => false,
        }
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        let key = normalize(path)?;
        match self.write_guard().remove(&key) {
            Some(_) => Ok(()),
            None => Err(SandboxError::Workspace(format!("file not found: {}", path))),
        }
    }

    /// Staged paths in sorted order
    pub fn list(&self) -> Vec<String> {
        self.read_guard().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    /// Write every staged file below `dir`
    pub(crate) fn materialize(&self, dir: &Path) -> Result<()> {
        for (path, content) in self.read_guard().iter() {
            let dest = dir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    SandboxError::host_io(format!("failed to create {:?}", parent), e)
                })?;
            }
            fs::write(&dest, content)
                .map_err(|e| SandboxError::host_io(format!("failed to write {:?}", dest), e))?;
        }
        Ok(())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reject paths that could land outside the workspace directory
fn normalize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(SandboxError::Workspace(format!(
                    "path must stay inside the workspace: {}",
                    path
                )))
            }
        }
    }

    if parts.is_empty() {
        return Err(SandboxError::Workspace(format!("empty path: {:?}", path)));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vfs_ops() {
        let fs = VirtualFs::new();
        fs.write_file("test.txt", b"hello".to_vec()).unwrap();
        assert_eq!(fs.read_file("test.txt").unwrap(), b"hello");
        assert!(fs.exists("test.txt"));
        fs.remove_file("test.txt").unwrap();
        assert!(!fs.exists("test.txt"));
        assert!(fs.is_empty());
    }

    #[test]
    fn test_paths_are_normalized() {
        let fs = VirtualFs::new();
        fs.write_file("./data/in.txt", "1 2 3").unwrap();
        assert!(fs.exists("data/in.txt"));
        assert_eq!(fs.list(), vec!["data/in.txt".to_string()]);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let fs = VirtualFs::new();
        for path in ["../secret", "/etc/passwd", "a/../../b", "", "."] {
            assert!(
                matches!(fs.write_file(path, "x"), Err(SandboxError::Workspace(_))),
                "accepted {:?}",
                path
            );
        }
        assert!(!fs.exists("../secret"));
    }

    #[test]
    fn test_missing_file() {
        let fs = VirtualFs::new();
        assert!(matches!(
            fs.read_file("nope.txt"),
            Err(SandboxError::Workspace(_))
        ));
        assert!(matches!(
            fs.remove_file("nope.txt"),
            Err(SandboxError::Workspace(_))
        ));
    }

    #[test]
    fn test_clones_share_files() {
        let fs = VirtualFs::new();
        let other = fs.clone();
        other.write_file("shared.txt", "x").unwrap();
        assert!(fs.exists("shared.txt"));
    }

    #[test]
    fn test_materialize() {
        let fs = VirtualFs::new();
        fs.write_file("input.txt", "hello").unwrap();
        fs.write_file("nested/deep/data.bin", vec![0u8, 1, 2]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        fs.materialize(dir.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("input.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read(dir.path().join("nested/deep/data.bin")).unwrap(),
            vec![0u8, 1, 2]
        );
    }
}
