//! The worker daemon.
//!
//! A long-lived process that serves one controller connection at a time.
//! Each `exec-request` becomes a helper-supervised subprocess whose output
//! is relayed back as `exec-output` frames and whose exit lands in an
//! `exec-response`; `exec-cancel` kills the subprocess's whole group.

use crate::error::{DistbuildError, DistbuildResult};
use crate::helper::{ExecControl, RunningExec};
use crate::protocol::{Message, read_message, write_message};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};

/// The worker daemon.
pub struct WorkerDaemon {
    listener: TcpListener,
}

impl WorkerDaemon {
    /// Bind the daemon to `addr`.
    pub async fn bind(addr: &str) -> DistbuildResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> DistbuildResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept controllers forever, one at a time.
    pub async fn run(self) -> DistbuildResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!(peer = %peer, "controller connected");
            if let Err(err) = serve_controller(stream).await {
                tracing::warn!(peer = %peer, error = %err, "controller connection ended");
            } else {
                tracing::info!(peer = %peer, "controller disconnected");
            }
        }
    }
}

/// Serve one controller until it disconnects or breaks protocol. All
/// still-running subprocesses are killed when the connection ends.
async fn serve_controller(stream: TcpStream) -> DistbuildResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Everything going back to the controller funnels through one queue
    // so output pumps and response reporters cannot interleave frames.
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write_message(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    });

    let running: Arc<Mutex<HashMap<String, ExecControl>>> = Arc::new(Mutex::new(HashMap::new()));
    let result = loop {
        match read_message(&mut reader).await {
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
            Ok(Some(Message::ExecRequest {
                id,
                argv,
                stdin_contents,
            })) => {
                handle_exec_request(id, argv, stdin_contents, tx.clone(), running.clone()).await;
            }
            Ok(Some(Message::ExecCancel { id })) => {
                // Idempotent: cancelling an unknown or finished id is fine.
                if let Some(control) = running.lock().await.get(&id) {
                    tracing::info!(id = %id, "exec-cancel, killing process group");
                    control.kill();
                }
            }
            Ok(Some(other)) => {
                break Err(DistbuildError::Protocol(format!(
                    "unexpected message type for worker: {:?}",
                    other.id()
                )));
            }
        }
    };

    // Connection gone: anything still running must not outlive it.
    for (id, control) in running.lock().await.drain() {
        tracing::warn!(id = %id, "killing orphaned exec on disconnect");
        control.kill();
    }
    drop(tx);
    let _ = writer.await;
    result
}

async fn handle_exec_request(
    id: String,
    argv: Vec<String>,
    stdin_contents: String,
    tx: mpsc::Sender<Message>,
    running: Arc<Mutex<HashMap<String, ExecControl>>>,
) {
    tracing::info!(id = %id, argv = ?argv, "exec-request");
    let exec = match RunningExec::spawn(&id, &argv, &stdin_contents, tx.clone()).await {
        Ok(exec) => exec,
        Err(err) => {
            tracing::warn!(id = %id, error = %err, "spawn failed");
            let _ = tx
                .send(Message::ExecResponse {
                    id,
                    exit: 127,
                })
                .await;
            return;
        }
    };
    running.lock().await.insert(id.clone(), exec.control());

    tokio::spawn(async move {
        let exit = exec.wait().await.unwrap_or(127);
        running.lock().await.remove(&id);
        tracing::info!(id = %id, exit, "exec finished");
        let _ = tx.send(Message::ExecResponse { id, exit }).await;
    });
}
