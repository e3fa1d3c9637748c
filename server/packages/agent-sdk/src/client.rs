use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::SdkError;
use crate::message::SdkMessage;
use crate::options::AgentOptions;

/// Stream of raw agent messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<SdkMessage, SdkError>> + Send>>;

/// What a client hands back after a prompt was submitted.
pub enum QueryResponse {
    /// Messages are pushed on the returned stream.
    Stream(MessageStream),
    /// The prompt was accepted; messages are read through
    /// [`AgentClient::receive_response`].
    Submitted,
    /// Messages are pulled one at a time through
    /// [`AgentClient::receive_message`].
    Pull,
}

impl std::fmt::Debug for QueryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("QueryResponse::Stream"),
            Self::Submitted => f.write_str("QueryResponse::Submitted"),
            Self::Pull => f.write_str("QueryResponse::Pull"),
        }
    }
}

/// One open connection to the agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn query(&self, prompt: &str) -> Result<QueryResponse, SdkError>;

    async fn receive_response(&self) -> Result<MessageStream, SdkError> {
        Err(SdkError::Unsupported("receive_response"))
    }

    /// Returns `Ok(None)` once the response is exhausted.
    async fn receive_message(&self) -> Result<Option<SdkMessage>, SdkError> {
        Err(SdkError::Unsupported("receive_message"))
    }

    async fn interrupt(&self) -> Result<(), SdkError>;

    async fn disconnect(&self) -> Result<(), SdkError>;
}

/// Opens agent connections.
#[async_trait]
pub trait AgentConnector: Send + Sync + 'static {
    async fn connect(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>, SdkError>;
}

enum ReaderSource {
    Stream(MessageStream),
    Pull,
    Done,
}

/// Uniform reader over the three [`QueryResponse`] shapes.
pub struct MessageReader {
    client: Arc<dyn AgentClient>,
    source: ReaderSource,
}

impl MessageReader {
    pub async fn open(
        client: Arc<dyn AgentClient>,
        response: QueryResponse,
    ) -> Result<Self, SdkError> {
        let source = match response {
            QueryResponse::Stream(stream) => ReaderSource::Stream(stream),
            QueryResponse::Submitted => ReaderSource::Stream(client.receive_response().await?),
            QueryResponse::Pull => ReaderSource::Pull,
        };
        Ok(Self { client, source })
    }

    /// Produces the next raw message, or `None` at end of stream.
    pub async fn next_message(&mut self) -> Result<Option<SdkMessage>, SdkError> {
        let next = match &mut self.source {
            ReaderSource::Stream(stream) => stream.next().await.transpose(),
            ReaderSource::Pull => self.client.receive_message().await,
            ReaderSource::Done => return Ok(None),
        };
        if matches!(next, Ok(None)) {
            self.source = ReaderSource::Done;
        }
        next
    }
}
