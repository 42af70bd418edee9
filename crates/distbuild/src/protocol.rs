//! The distbuild wire protocol.
//!
//! One JSON object per `\n`-terminated line over TCP, no length prefix.
//! Every message has a `type` tag and a free-form `id` correlating
//! requests with responses. Text fields are UTF-8; binary payloads travel
//! base64-encoded.

use crate::error::{DistbuildError, DistbuildResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Which pipe a line of subprocess output came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Every message of the protocol, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Initiator -> controller: build this system.
    BuildRequest {
        id: String,
        repo: String,
        #[serde(rename = "ref")]
        ref_: String,
        morphology: String,
    },
    /// Initiator -> controller: abandon the request.
    BuildCancel { id: String },
    /// Controller -> initiator: a scheduling step happened.
    BuildProgress {
        id: String,
        step: String,
        n: usize,
        total: usize,
        message: String,
    },
    /// Controller -> initiator: relayed build output.
    BuildOutput {
        id: String,
        stream: StreamKind,
        text: String,
    },
    /// Controller -> initiator: terminal success.
    BuildFinished { id: String },
    /// Controller -> initiator: terminal failure.
    BuildFailed { id: String, reason: String },
    /// Controller -> worker: run one subprocess.
    ExecRequest {
        id: String,
        argv: Vec<String>,
        stdin_contents: String,
    },
    /// Worker -> controller: a line of subprocess output.
    ExecOutput {
        id: String,
        stream: StreamKind,
        text: String,
    },
    /// Worker -> controller: the subprocess finished. Negative exit is
    /// the signal that killed it.
    ExecResponse { id: String, exit: i32 },
    /// Controller -> worker: kill the subprocess and its whole tree.
    ExecCancel { id: String },
}

impl Message {
    /// The correlation id of any message.
    pub fn id(&self) -> &str {
        match self {
            Message::BuildRequest { id, .. }
            | Message::BuildCancel { id }
            | Message::BuildProgress { id, .. }
            | Message::BuildOutput { id, .. }
            | Message::BuildFinished { id }
            | Message::BuildFailed { id, .. }
            | Message::ExecRequest { id, .. }
            | Message::ExecOutput { id, .. }
            | Message::ExecResponse { id, .. }
            | Message::ExecCancel { id } => id,
        }
    }
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> DistbuildResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)
        .map_err(|e| DistbuildError::Serialization(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` means the peer closed cleanly;
/// malformed JSON or an unknown type is a protocol error and the caller
/// must drop the connection.
pub async fn read_message<R>(reader: &mut R) -> DistbuildResult<Option<Message>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end())
        .map_err(|e| DistbuildError::Protocol(format!("bad frame: {e}")))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn wire_format_uses_kebab_type_tags() {
        let message = Message::BuildRequest {
            id: "req-1".to_string(),
            repo: "defs".to_string(),
            ref_: "master".to_string(),
            morphology: "systems/base.morph".to_string(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"build-request\""));
        assert!(json.contains("\"ref\":\"master\""));

        let exec = Message::ExecResponse {
            id: "x".to_string(),
            exit: -9,
        };
        let json = serde_json::to_string(&exec).unwrap();
        assert!(json.contains("\"type\":\"exec-response\""));
        assert!(json.contains("\"exit\":-9"));
    }

    #[tokio::test]
    async fn roundtrip_over_a_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let sent = Message::ExecRequest {
            id: "42".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
            stdin_contents: String::new(),
        };
        write_message(&mut client_write, &sent).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let received = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(sent, received);
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _keep) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(server_read);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, DistbuildError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_type_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _keep) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"type\":\"mystery\",\"id\":\"1\"}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(server_read);
        assert!(read_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (server_read, _w) = tokio::io::split(server);
        let mut reader = BufReader::new(server_read);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }
}
