//! The exec helper: supervises one subprocess per request.
//!
//! Every child runs in its own process group so that cancel can kill the
//! entire tree, grandchildren included, with one SIGKILL to `-pgid`.
//! Stdout and stderr are pumped by separate tasks into framed
//! `exec-output` messages, so neither pipe can backpressure the other.
//! Pipes are read as raw bytes and drained to EOF; wire fields are UTF-8,
//! so a line of binary output travels base64-encoded.

use crate::error::{DistbuildError, DistbuildResult};
use crate::protocol::{Message, StreamKind};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Wire fields are UTF-8; a non-UTF-8 output line is base64-encoded.
fn line_to_text(line: &[u8]) -> String {
    let mut line = line;
    if line.last() == Some(&b'\n') {
        line = &line[..line.len() - 1];
    }
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    match std::str::from_utf8(line) {
        Ok(text) => text.to_string(),
        Err(_) => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(line)
        }
    }
}

/// A handle that can kill the whole process group. Cheap to copy and
/// safe to use after the child has died: killing a dead group is a no-op.
#[derive(Clone, Copy, Debug)]
pub struct ExecControl {
    pgid: i32,
}

impl ExecControl {
    /// SIGKILL the entire process group. Idempotent.
    pub fn kill(&self) {
        // ESRCH just means everything is already gone.
        unsafe {
            libc::killpg(self.pgid, libc::SIGKILL);
        }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }
}

/// One running exec request.
pub struct RunningExec {
    id: String,
    child: Child,
    pgid: i32,
    pumps: Vec<JoinHandle<()>>,
}

impl RunningExec {
    /// Spawn `argv` in a fresh process group, feeding `stdin_contents` to
    /// its stdin and streaming output lines to `output` as framed
    /// messages tagged with `id`.
    pub async fn spawn(
        id: &str,
        argv: &[String],
        stdin_contents: &str,
        output: mpsc::Sender<Message>,
    ) -> DistbuildResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DistbuildError::Exec("empty argv".to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DistbuildError::Exec(format!("spawn {program}: {e}")))?;

        let pgid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| DistbuildError::Exec("child has no pid".to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let contents = stdin_contents.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&contents).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DistbuildError::Exec("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DistbuildError::Exec("child stderr unavailable".to_string()))?;

        let mut pumps = Vec::new();
        for (stream, kind) in [
            (Box::pin(stdout) as std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>, StreamKind::Stdout),
            (Box::pin(stderr), StreamKind::Stderr),
        ] {
            let output = output.clone();
            let id = id.to_string();
            pumps.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let message = Message::ExecOutput {
                                id: id.clone(),
                                stream: kind,
                                text: line_to_text(&buf),
                            };
                            if output.send(message).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        Ok(Self {
            id: id.to_string(),
            child,
            pgid,
            pumps,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn control(&self) -> ExecControl {
        ExecControl { pgid: self.pgid }
    }

    /// Wait for the child and both pumps; returns the exit code, or the
    /// negated signal number if a signal killed it.
    pub async fn wait(mut self) -> DistbuildResult<i32> {
        let status = self.child.wait().await?;
        for pump in self.pumps {
            let _ = pump.await;
        }
        // Kill whatever the child may have left running in its group.
        unsafe {
            libc::killpg(self.pgid, libc::SIGKILL);
        }
        let exit = match status.code() {
            Some(code) => code,
            None => {
                use std::os::unix::process::ExitStatusExt;
                -status.signal().unwrap_or(0)
            }
        };
        Ok(exit)
    }
}
