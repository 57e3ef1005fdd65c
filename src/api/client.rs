use crate::auth::TlsConfig;
use crate::commitlog::{Offset, RecordBatch};
use crate::grpc::log_service_client::LogServiceClient;
use crate::grpc::{ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse};
use crate::replication::{connect, ConnectError};
use crate::server::{metadata_offset, FIRST_OFFSET_METADATA_KEY, OFFSET_METADATA_KEY};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Request, Status, Streaming};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    // Nothing is written there yet. Retry later at the same offset.
    #[error("offset {offset:?} is out of range")]
    OffsetOutOfRange { offset: Option<Offset> },

    // The batch is in the node's log, but not necessarily on every peer. Don't blindly resend
    // it unless duplicates are acceptable.
    #[error("{message}")]
    ReplicationFailed { first_offset: Option<Offset>, message: String },

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("stream was closed by the server")]
    StreamClosed,

    #[error("rpc failed: {0}")]
    Rpc(Status),
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::OutOfRange => ClientError::OffsetOutOfRange {
                offset: metadata_offset(&status, OFFSET_METADATA_KEY),
            },
            Code::Aborted => ClientError::ReplicationFailed {
                first_offset: metadata_offset(&status, FIRST_OFFSET_METADATA_KEY),
                message: status.message().to_string(),
            },
            Code::Unauthenticated => ClientError::Unauthenticated(status.message().to_string()),
            _ => ClientError::Rpc(status),
        }
    }
}

/// LogClient talks to one node over mutual TLS.
pub struct LogClient {
    inner: LogServiceClient<Channel>,
    timeout: Option<Duration>,
}

impl LogClient {
    pub async fn connect(addr: &str, tls: &TlsConfig) -> Result<Self, ClientError> {
        let channel = connect(addr, &tls.client_tls_config(), DEFAULT_CONNECT_TIMEOUT).await?;

        Ok(LogClient {
            inner: LogServiceClient::new(channel),
            timeout: None,
        })
    }

    /// Deadline for each call. The node propagates it to its replication fan-out.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn produce(&mut self, batch: RecordBatch) -> Result<Offset, ClientError> {
        let request = self.request(ProduceRequest {
            record_batch: Some(batch.into()),
            replication_id: String::new(),
        });
        let response = self.inner.produce(request).await?.into_inner();

        Ok(Offset::new(response.first_offset))
    }

    pub async fn consume(&mut self, offset: Offset) -> Result<RecordBatch, ClientError> {
        let request = self.request(ConsumeRequest {
            offset: offset.as_u64(),
        });
        let response = self.inner.consume(request).await?.into_inner();

        Ok(response.record_batch.unwrap_or_default().into())
    }

    pub async fn produce_stream(&mut self) -> Result<ProduceStream, ClientError> {
        let (requests, rx) = mpsc::channel(16);
        let request = self.request(ReceiverStream::new(rx));
        let responses = self.inner.produce_stream(request).await?.into_inner();

        Ok(ProduceStream { requests, responses })
    }

    pub async fn consume_stream(&mut self, offset: Offset) -> Result<ConsumeStream, ClientError> {
        let request = self.request(ConsumeRequest {
            offset: offset.as_u64(),
        });
        let responses = self.inner.consume_stream(request).await?.into_inner();

        Ok(ConsumeStream { responses })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

/// One bidirectional produce stream. The n-th `recv` answers the n-th `send`.
pub struct ProduceStream {
    requests: mpsc::Sender<ProduceRequest>,
    responses: Streaming<ProduceResponse>,
}

impl ProduceStream {
    pub async fn send(&mut self, batch: RecordBatch) -> Result<(), ClientError> {
        self.requests
            .send(ProduceRequest {
                record_batch: Some(batch.into()),
                replication_id: String::new(),
            })
            .await
            .map_err(|_| ClientError::StreamClosed)
    }

    /// Offset of the next acknowledged batch, or `None` once the server ends the stream.
    pub async fn recv(&mut self) -> Result<Option<Offset>, ClientError> {
        let response = self.responses.message().await?;
        Ok(response.map(|r| Offset::new(r.first_offset)))
    }
}

/// Batches from a starting offset onwards, in order.
pub struct ConsumeStream {
    responses: Streaming<ConsumeResponse>,
}

impl ConsumeStream {
    /// The next batch, or `None` once the server ends the stream.
    pub async fn next(&mut self) -> Result<Option<RecordBatch>, ClientError> {
        let response = self.responses.message().await?;
        Ok(response.map(|r| r.record_batch.unwrap_or_default().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationError;
    use crate::server::replication_failed_status;

    #[test]
    fn replication_failure_reports_offset_once() {
        let status = replication_failed_status(Offset::new(0), ReplicationError::DeadlineExceeded);

        let error = ClientError::from(status);
        match &error {
            ClientError::ReplicationFailed { first_offset, .. } => assert_eq!(*first_offset, Some(Offset::new(0))),
            other => panic!("Expected ReplicationFailed, got {:?}", other),
        }

        let text = error.to_string();
        assert_eq!(text.matches("committed at offset").count(), 1, "{}", text);
        assert!(!text.contains("Some("), "{}", text);
    }

    #[test]
    fn out_of_range_status_maps_to_offset_error() {
        let status = Status::out_of_range("offset out of range: 4");

        assert!(matches!(
            ClientError::from(status),
            ClientError::OffsetOutOfRange { offset: None }
        ));
    }
}
