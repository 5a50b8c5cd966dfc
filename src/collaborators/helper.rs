//! Adapters that drive the external helper executable.
//!
//! The helper is a separate program that knows how to read the external
//! application's memory and its encrypted database. It is invoked with a
//! subcommand and reports through stdout lines and its exit code:
//!
//! - `key --exe <path>`: prints diagnostics, then the hex key as the last line.
//! - `decrypt --src <dir> --out <dir> --exe <path>`: key in the environment,
//!   prints `progress <n>` lines; exit 2 = key rejected, 3 = corrupt source.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::ExposeSecret;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Credential, CredentialService, DataStoreDecryptor, ProgressReporter};
use crate::config::HelperConfig;
use crate::error::{CredentialError, DecryptionError, HelperError};
use crate::output::{LossyLines, discard};

/// Maximum stderr kept for error messages (16KB).
const MAX_STDERR_SIZE: usize = 16 * 1024;

/// Environment variable carrying the key to `decrypt`.
pub const KEY_ENV: &str = "VAULT_PILOT_DATA_KEY";

/// Exit code of `key` when the OS refused access to the application.
const EXIT_ACCESS_DENIED: i32 = 2;
/// Exit code of `decrypt` when the key does not open the store.
const EXIT_BAD_KEY: i32 = 2;
/// Exit code of `decrypt` when the source data cannot be parsed.
const EXIT_CORRUPT_SOURCE: i32 = 3;

/// Decrypted databases are looked for at most this deep under the work dir.
const MAX_SCAN_DEPTH: usize = 4;

static HEX_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9a-fA-F]{2}){16,64}$").expect("valid hex key regex")
});

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^progress\s+(\d{1,3})\b").expect("valid progress regex")
});

/// Captured result of a successful helper run.
#[derive(Debug, Default)]
pub struct HelperOutput {
    pub stdout_lines: Vec<String>,
    pub stderr: String,
}

/// Runs the helper executable with a timeout.
#[derive(Debug, Clone)]
pub struct HelperTool {
    executable_path: PathBuf,
    /// Placed before the subcommand, e.g. a script for an interpreter.
    base_args: Vec<String>,
    timeout: Duration,
}

impl HelperTool {
    pub fn new(config: &HelperConfig) -> Self {
        Self {
            executable_path: config.executable_path.clone(),
            base_args: Vec::new(),
            timeout: config.timeout,
        }
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the helper, feeding every stdout line to `on_line`.
    ///
    /// Non-zero exits become [`HelperError::Failed`]; the child is killed
    /// when the timeout elapses.
    pub async fn run<F>(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
        mut on_line: F,
    ) -> Result<HelperOutput, HelperError>
    where
        F: FnMut(&str) + Send,
    {
        if tokio::fs::metadata(&self.executable_path).await.is_err() {
            return Err(HelperError::NotFound(self.executable_path.clone()));
        }

        let mut command = Command::new(&self.executable_path);
        command
            .args(&self.base_args)
            .args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(HelperError::Spawn)?;
        debug!(
            helper = %self.executable_path.display(),
            subcommand = args.first().copied().unwrap_or_default(),
            pid = ?child.id(),
            "Helper started"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let result = tokio::time::timeout(self.timeout, async {
            let stderr_task = tokio::spawn(async move {
                let mut captured = Vec::new();
                if let Some(err) = stderr {
                    let mut limited = err.take(MAX_STDERR_SIZE as u64);
                    let _ = limited.read_to_end(&mut captured).await;
                    // Keep draining so a chatty helper is not killed by SIGPIPE.
                    let _ = discard(limited.into_inner()).await;
                }
                String::from_utf8_lossy(&captured).trim_end().to_string()
            });

            let mut lines_out = Vec::new();
            if let Some(out) = stdout {
                let mut lines = LossyLines::new(BufReader::new(out));
                while let Some(line) = lines.next_line().await? {
                    on_line(&line);
                    lines_out.push(line);
                }
            }

            let status = child.wait().await?;
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, lines_out, stderr))
        })
        .await;

        match result {
            Ok(Ok((status, stdout_lines, stderr))) => {
                if status.success() {
                    Ok(HelperOutput {
                        stdout_lines,
                        stderr,
                    })
                } else {
                    Err(HelperError::Failed {
                        code: status.code().unwrap_or(-1),
                        stderr: truncate_for_error(&stderr),
                    })
                }
            }
            Ok(Err(e)) => Err(HelperError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                warn!(
                    helper = %self.executable_path.display(),
                    timeout = ?self.timeout,
                    "Helper timed out and was killed"
                );
                Err(HelperError::Timeout(self.timeout))
            }
        }
    }
}

/// Obtains the key through `helper key`.
pub struct HelperCredentialService {
    tool: HelperTool,
}

impl HelperCredentialService {
    pub fn new(tool: HelperTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl CredentialService for HelperCredentialService {
    async fn obtain_credential(
        &self,
        executable_path: &Path,
    ) -> Result<Credential, CredentialError> {
        let exe = executable_path.to_string_lossy();
        let output = match self.tool.run(&["key", "--exe", &exe], &[], |_| {}).await {
            Ok(output) => output,
            Err(HelperError::Failed { code, stderr }) if code == EXIT_ACCESS_DENIED => {
                return Err(CredentialError::Denied(stderr));
            }
            Err(e) => return Err(e.into()),
        };

        let key = output
            .stdout_lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .ok_or_else(|| CredentialError::Malformed("helper printed no key".to_string()))?;

        if !HEX_KEY.is_match(key) {
            return Err(CredentialError::Malformed(format!(
                "expected a hex key, got {} characters",
                key.len()
            )));
        }

        info!(key_len = key.len(), "Credential obtained");
        Ok(Credential::new(key.to_ascii_lowercase()))
    }
}

/// Decrypts through `helper decrypt`.
pub struct HelperDecryptor {
    tool: HelperTool,
}

impl HelperDecryptor {
    pub fn new(tool: HelperTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl DataStoreDecryptor for HelperDecryptor {
    async fn decrypt(
        &self,
        source_dir: &Path,
        work_dir: &Path,
        credential: &Credential,
        executable_path: &Path,
        progress: ProgressReporter,
    ) -> Result<(), DecryptionError> {
        tokio::fs::create_dir_all(work_dir).await?;

        let src = source_dir.to_string_lossy();
        let out = work_dir.to_string_lossy();
        let exe = executable_path.to_string_lossy();
        let args = ["decrypt", "--src", &src, "--out", &out, "--exe", &exe];
        let env = [(KEY_ENV, credential.secret().expose_secret())];

        let result = self
            .tool
            .run(&args, &env, |line| {
                if let Some(percent) = parse_progress(line) {
                    progress.report(percent);
                }
            })
            .await;

        match result {
            Ok(_) => {}
            Err(HelperError::Failed { code, stderr }) if code == EXIT_BAD_KEY => {
                return Err(DecryptionError::BadCredential(stderr));
            }
            Err(HelperError::Failed { code, stderr }) if code == EXIT_CORRUPT_SOURCE => {
                return Err(DecryptionError::CorruptSource(stderr));
            }
            Err(e) => return Err(e.into()),
        }

        if !self.check_decrypted(work_dir).await {
            return Err(DecryptionError::NotDecrypted(work_dir.to_path_buf()));
        }
        info!(work_dir = %work_dir.display(), "Data store decrypted");
        Ok(())
    }

    async fn check_decrypted(&self, work_dir: &Path) -> bool {
        find_database(work_dir).await
    }
}

fn parse_progress(line: &str) -> Option<u8> {
    let caps = PROGRESS_LINE.captures(line.trim())?;
    let value: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.min(100) as u8)
}

/// Depth-first search for a non-empty `*.db` file, at most
/// `MAX_SCAN_DEPTH` directories deep.
async fn find_database(root: &Path) -> bool {
    let mut pending = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let path = entry.path();
            if meta.is_dir() {
                if depth < MAX_SCAN_DEPTH {
                    pending.push((path, depth + 1));
                }
            } else if meta.len() > 0 && path.extension().is_some_and(|ext| ext == "db") {
                return true;
            }
        }
    }
    false
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    const LIMIT: usize = 2048;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        format!("{}...", &s[..floor_char_boundary(s, LIMIT)])
    }
}
