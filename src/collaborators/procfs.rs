//! Linux detector backed by `/proc`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{AppProcess, DataInfo, ExternalAppDetector};
use crate::config::DetectorConfig;
use crate::error::DetectionError;

/// Finds the external application by scanning `/proc/<pid>/comm`.
#[derive(Debug, Clone)]
pub struct ProcfsDetector {
    config: DetectorConfig,
    proc_root: PathBuf,
}

impl ProcfsDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Scan a different procfs mount.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    fn matches_name(&self, comm: &str) -> bool {
        self.config
            .process_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(comm))
    }

    async fn scan(&self) -> Result<Vec<AppProcess>, DetectionError> {
        let mut entries = match tokio::fs::read_dir(&self.proc_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DetectionError::Unsupported(format!(
                    "{} is not available",
                    self.proc_root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can exit mid-scan; unreadable entries are skipped.
            let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await else {
                continue;
            };
            let comm = comm.trim();
            if !self.matches_name(comm) {
                continue;
            }
            let executable_path = tokio::fs::read_link(entry.path().join("exe"))
                .await
                .unwrap_or_default();
            found.push(AppProcess {
                pid,
                name: comm.to_string(),
                executable_path,
            });
        }

        found.sort_by_key(|p| p.pid);
        debug!(app = %self.config.app_name, count = found.len(), "Process scan finished");
        Ok(found)
    }
}

#[async_trait]
impl ExternalAppDetector for ProcfsDetector {
    async fn is_running(&self) -> bool {
        matches!(self.scan().await, Ok(found) if !found.is_empty())
    }

    async fn detect_processes(&self) -> Result<Vec<AppProcess>, DetectionError> {
        let found = self.scan().await?;
        if found.is_empty() {
            return Err(DetectionError::ProcessNotFound {
                app: self.config.app_name.clone(),
            });
        }
        Ok(found)
    }

    async fn detect_data_directory(&self) -> Result<DataInfo, DetectionError> {
        for candidate in &self.config.data_dirs {
            if is_dir(candidate).await {
                return Ok(DataInfo {
                    data_dir: candidate.clone(),
                    account: account_from_dir(candidate),
                });
            }
        }
        Err(DetectionError::DataDirNotFound(format!(
            "none of {} candidate directories for {} exist",
            self.config.data_dirs.len(),
            self.config.app_name
        )))
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Account directories are named after the account id.
fn account_from_dir(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| n.starts_with("wxid_"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for (pid, comm) in entries {
            let dir = tmp.path().join(pid);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("sys")).unwrap();
        tmp
    }

    fn detector(root: &Path, data_dirs: Vec<PathBuf>) -> ProcfsDetector {
        ProcfsDetector::new(DetectorConfig {
            app_name: "WeChat".into(),
            process_names: vec!["wechat".into(), "WeChatAppEx".into()],
            data_dirs,
        })
        .with_proc_root(root)
    }

    #[tokio::test]
    async fn finds_matching_processes() {
        let proc = fake_proc(&[("42", "WeChat"), ("7", "bash"), ("100", "wechatappex")]);
        let det = detector(proc.path(), vec![]);

        assert!(det.is_running().await);
        let found = det.detect_processes().await.unwrap();
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![42, 100]);
        assert_eq!(found[0].name, "WeChat");
    }

    #[tokio::test]
    async fn reports_not_running() {
        let proc = fake_proc(&[("7", "bash")]);
        let det = detector(proc.path(), vec![]);

        assert!(!det.is_running().await);
        assert!(matches!(
            det.detect_processes().await,
            Err(DetectionError::ProcessNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_proc_is_unsupported() {
        let det = detector(Path::new("/definitely/not/proc"), vec![]);
        assert!(matches!(
            det.detect_processes().await,
            Err(DetectionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn first_existing_data_dir_wins() {
        let proc = fake_proc(&[]);
        let data = tempfile::tempdir().unwrap();
        let account = data.path().join("wxid_abc123");
        std::fs::create_dir_all(&account).unwrap();

        let det = detector(
            proc.path(),
            vec![data.path().join("missing"), account.clone()],
        );
        let info = det.detect_data_directory().await.unwrap();
        assert_eq!(info.data_dir, account);
        assert_eq!(info.account.as_deref(), Some("wxid_abc123"));

        let det = detector(proc.path(), vec![data.path().join("missing")]);
        assert!(matches!(
            det.detect_data_directory().await,
            Err(DetectionError::DataDirNotFound(_))
        ));
    }
}
