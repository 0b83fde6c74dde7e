//! External format conversion (EPUB → MOBI/AZW3/…).
//!
//! The converter runs once per run as a child process. Waiting for it is
//! raced against the run's cancellation token: whichever resolves first
//! wins, and a cancelled converter is killed rather than left orphaned.
//! Any non-zero exit status is fatal.
//!
//! The converter's stdout goes straight to the operator's terminal. Its
//! stderr is logged line by line and the last lines travel with
//! [`P2kError::ConverterFailed`].

use crate::error::P2kError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of converter stderr kept for the error report.
const STDERR_TAIL_LINES: usize = 10;

/// Turns the assembled EPUB into the delivery format.
#[async_trait]
pub trait BookConverter: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), P2kError>;
}

/// Locate `program` on `PATH` (or accept an existing path).
pub fn lookup_binary(program: &str) -> Result<PathBuf, P2kError> {
    which::which(program).map_err(|_| P2kError::BinaryNotFound {
        program: program.to_string(),
    })
}

/// Runs `<program> [extra_args…] <input> <output>`, e.g. calibre's
/// `ebook-convert`.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    program: String,
    extra_args: Vec<String>,
}

impl ExternalConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl BookConverter for ExternalConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), P2kError> {
        info!(
            "Converting {} → {} with {}",
            input.display(),
            output.display(),
            self.program
        );
        let mut child = Command::new(&self.program)
            .args(&self.extra_args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| P2kError::ConverterSpawn {
                program: self.program.clone(),
                source,
            })?;
        let stderr = tokio::spawn(collect_stderr(self.program.clone(), child.stderr.take()));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Conversion cancelled; killing {}", self.program);
                if let Err(e) = child.kill().await {
                    debug!("Kill failed (already exited?): {}", e);
                }
                stderr.abort();
                return Err(P2kError::Cancelled { stage: "conversion" });
            }
            status = child.wait() => status.map_err(|source| P2kError::ConverterSpawn {
                program: self.program.clone(),
                source,
            })?,
        };

        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(P2kError::ConverterFailed {
                program: self.program.clone(),
                code: status.code(),
                stderr,
            });
        }
        debug!("{} exited successfully", self.program);
        Ok(())
    }
}

/// Log every stderr line and return the last [`STDERR_TAIL_LINES`].
async fn collect_stderr(program: String, pipe: Option<ChildStderr>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!("{}: {}", program, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Reading {} stderr failed: {}", program, e);
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let c = ExternalConverter::new("true");
        c.convert(Path::new("in.epub"), Path::new("out.mobi"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_fatal() {
        let c = ExternalConverter::new("false");
        let err = c
            .convert(Path::new("in.epub"), Path::new("out.mobi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, P2kError::ConverterFailed { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn failure_reports_the_end_of_stderr() {
        let script = "for i in $(seq 1 15); do echo line $i >&2; done; exit 3";
        let c = ExternalConverter::new("sh").with_args(["-c", script]);
        let err = c
            .convert(Path::new("in"), Path::new("out"), &CancellationToken::new())
            .await
            .unwrap_err();
        let P2kError::ConverterFailed { code, stderr, .. } = err else {
            panic!("expected ConverterFailed");
        };
        assert_eq!(code, Some(3));
        assert_eq!(stderr.lines().count(), STDERR_TAIL_LINES);
        assert!(stderr.starts_with("line 6"));
        assert!(stderr.ends_with("line 15"));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let c = ExternalConverter::new("definitely-not-a-converter-xyz");
        let err = c
            .convert(Path::new("a"), Path::new("b"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, P2kError::ConverterSpawn { .. }));
        assert!(matches!(
            lookup_binary("definitely-not-a-converter-xyz"),
            Err(P2kError::BinaryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_kills_a_running_converter() {
        // `sh -c 'sleep 30' <input> <output>`: the paths become $0 and $1.
        let c = ExternalConverter::new("sh").with_args(["-c", "sleep 30"]);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = c
            .convert(Path::new("in"), Path::new("out"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, P2kError::Cancelled { stage: "conversion" }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
