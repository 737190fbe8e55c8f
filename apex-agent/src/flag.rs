use crate::error::Result;
use std::path::{Path, PathBuf};

/// A presence flag that survives restarts.
pub trait DurableFlag: Send + Sync {
    fn is_set(&self) -> bool;
    /// Contents written by the last `set`, if the flag is present.
    fn details(&self) -> Option<String>;
    fn set(&self, contents: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Flag backed by the existence of a file. An operator can also create or remove it by hand.
#[derive(Debug, Clone)]
pub struct FileFlag {
    path: PathBuf,
}

impl FileFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableFlag for FileFlag {
    fn is_set(&self) -> bool {
        self.path.exists()
    }

    fn details(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }

    fn set(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_flag_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let flag = FileFlag::new(dir.path().join("state/KILL"));
        assert!(!flag.is_set());
        assert!(flag.details().is_none());

        flag.set("reason: test").unwrap();
        assert!(flag.is_set());
        assert_eq!(flag.details().as_deref(), Some("reason: test"));

        flag.clear().unwrap();
        assert!(!flag.is_set());
        flag.clear().unwrap();
    }
}
