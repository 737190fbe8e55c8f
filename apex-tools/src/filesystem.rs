use crate::error::{Result, ToolError};
use crate::policy::Policy;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWritten {
    pub path: String,
    pub bytes: usize,
}

/// Resolves `user_path` against `work_root` and checks the result against the path allow-list.
///
/// `..` is collapsed lexically, then the deepest ancestor that already exists is canonicalized so
/// a symlink inside the work root cannot point the final path somewhere else.
pub fn resolve_allowed(policy: &Policy, work_root: &Path, user_path: &str) -> Result<PathBuf> {
    let user_path = user_path.trim();
    if user_path.is_empty() {
        return Err(ToolError::InvalidArguments("path must not be empty".to_string()));
    }
    let lexical = normalize_lexically(&work_root.join(user_path));
    let resolved = canonicalize_existing_prefix(&lexical)?;
    if !policy.path_ok(&resolved) {
        return Err(ToolError::PolicyViolation(format!(
            "path not allowed by policy.paths_allow: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Popping past the root is a no-op, same as the OS does.
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        // symlink_metadata stops at dangling links so canonicalize fails on them.
        if std::fs::symlink_metadata(existing).is_ok() {
            break;
        }
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            return Err(ToolError::InvalidArguments(format!(
                "path has no existing ancestor: {}",
                path.display()
            )));
        };
        rest.push(name.to_os_string());
        existing = parent;
    }
    let mut resolved = std::fs::canonicalize(existing)?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[tracing::instrument(level = "info", skip_all, fields(path = %path.display(), bytes = content.len()))]
pub async fn write_file(path: &Path, content: &str, overwrite: bool) -> Result<FileWritten> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !overwrite {
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ToolError::Conflict(format!(
                    "file exists and overwrite=false: {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
    } else {
        if path.is_dir() {
            return Err(ToolError::Conflict(format!(
                "path is a directory: {}",
                path.display()
            )));
        }
        tokio::fs::write(path, content.as_bytes()).await?;
    }
    tracing::info!("file written");
    Ok(FileWritten {
        path: path.display().to_string(),
        bytes: content.len(),
    })
}
