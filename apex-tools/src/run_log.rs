use crate::error::{Result, ToolError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Append-only per-run audit log: one JSON line per executed step in `<dir>/<run_id>.log`.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ToolError::InvalidArguments(format!("invalid run id {run_id:?}")));
        }
        Ok(self.dir.join(format!("{run_id}.log")))
    }

    pub async fn append(
        &self,
        run_id: &str,
        step: &serde_json::Value,
        result: &serde_json::Value,
    ) -> Result<()> {
        let path = self.path_for(run_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(&serde_json::json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "step": step,
            "result": result,
        }))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub fn new_run_id(prefix: &str) -> String {
    format!("{prefix}_{}", ulid::Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("logs"));
        let run_id = new_run_id("run");
        log.append(&run_id, &serde_json::json!({"tool": "shell"}), &serde_json::json!({"ok": 1}))
            .await
            .unwrap();
        log.append(&run_id, &serde_json::json!({"tool": "python"}), &serde_json::json!({"ok": 2}))
            .await
            .unwrap();

        let text = std::fs::read_to_string(log.path_for(&run_id).unwrap()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"]["tool"], "python");
        assert!(lines[0]["time"].is_string());
    }

    #[test]
    fn run_id_cannot_escape_log_dir() {
        let log = RunLog::new("/tmp/logs");
        assert!(log.path_for("../etc/passwd").is_err());
        assert!(log.path_for("").is_err());
        assert!(log.path_for("op_01HZX").is_ok());
    }
}
