//! The initiator client: the CLI's end of the controller connection.

use crate::error::{DistbuildError, DistbuildResult};
use crate::protocol::{Message, read_message, write_message};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A connection to a controller daemon.
pub struct InitiatorClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl InitiatorClient {
    pub async fn connect(addr: &str) -> DistbuildResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Submit a build request; returns the generated request id.
    pub async fn send_build_request(
        &mut self,
        repo: &str,
        ref_: &str,
        morphology: &str,
    ) -> DistbuildResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let message = Message::BuildRequest {
            id: id.clone(),
            repo: repo.to_string(),
            ref_: ref_.to_string(),
            morphology: morphology.to_string(),
        };
        write_message(&mut self.writer, &message).await?;
        Ok(id)
    }

    /// Ask the controller to abandon a request.
    pub async fn send_cancel(&mut self, id: &str) -> DistbuildResult<()> {
        let message = Message::BuildCancel { id: id.to_string() };
        write_message(&mut self.writer, &message).await
    }

    /// The next message from the controller; `None` when it hangs up.
    pub async fn next(&mut self) -> DistbuildResult<Option<Message>> {
        read_message(&mut self.reader).await
    }

    /// Drive one request to its terminal message, handing every frame to
    /// `on_message`. Returns whether the build finished successfully.
    pub async fn wait_for_build(
        &mut self,
        id: &str,
        mut on_message: impl FnMut(&Message),
    ) -> DistbuildResult<bool> {
        loop {
            let Some(message) = self.next().await? else {
                return Err(DistbuildError::WorkerDisconnected(
                    "controller hung up".to_string(),
                ));
            };
            if message.id() != id {
                continue;
            }
            on_message(&message);
            match message {
                Message::BuildFinished { .. } => return Ok(true),
                Message::BuildFailed { .. } => return Ok(false),
                _ => {}
            }
        }
    }
}
