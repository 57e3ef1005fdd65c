use crate::auth::{AuthContext, AuthInterceptor};
use crate::commitlog::Offset;
use crate::grpc::log_service_server::{LogService, LogServiceServer};
use crate::grpc::{ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse};
use crate::replication::Deadline;
use crate::server::gateway::{Gateway, ProduceOutcome};
use crate::server::status::{log_error_status, replication_failed_status};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

/// RpcServer is the type that implements the log's gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    gateway: Arc<Gateway>,
    stream_buffer: usize,
    // Cancelled when the node shuts down. Streaming tasks end their streams on it, otherwise a
    // live tail would keep the server's graceful shutdown waiting forever.
    shutdown: CancellationToken,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, gateway: Gateway, stream_buffer: usize, shutdown: CancellationToken) -> Self {
        RpcServer {
            logger,
            gateway: Arc::new(gateway),
            stream_buffer,
            shutdown,
        }
    }

    /// Serve on `listener` until the shutdown token is cancelled. `server` must already carry the
    /// TLS configuration. `interceptor` runs in front of every call, unary and streaming alike.
    pub(crate) async fn run(self, mut server: Server, listener: TcpListener, interceptor: AuthInterceptor) {
        let logger = self.logger.clone();
        let shutdown = self.shutdown.clone();
        slog::info!(logger, "Listening on '{:?}'", listener.local_addr());

        let result = server
            .add_service(LogServiceServer::with_interceptor(self, interceptor))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    fn convert_produce_outcome(outcome: ProduceOutcome) -> Result<ProduceResponse, Status> {
        match outcome.replication {
            Ok(()) => Ok(ProduceResponse {
                first_offset: outcome.first_offset.as_u64(),
            }),
            Err(e) => Err(replication_failed_status(outcome.first_offset, e)),
        }
    }

    async fn handle_produce(
        gateway: &Gateway,
        rpc_request: ProduceRequest,
        deadline: Option<Deadline>,
    ) -> Result<ProduceResponse, Status> {
        let outcome = gateway.produce(rpc_request, deadline).await.map_err(log_error_status)?;
        Self::convert_produce_outcome(outcome)
    }

    async fn handle_consume(gateway: &Gateway, offset: Offset) -> Result<ConsumeResponse, Status> {
        let batch = gateway.consume(offset).await.map_err(log_error_status)?;
        Ok(ConsumeResponse {
            record_batch: Some(batch.into()),
        })
    }

    fn call_logger<T>(&self, rpc_name: &'static str, request: &Request<T>) -> slog::Logger {
        let auth_context = AuthContext::of(request);
        self.logger.new(slog::o!(
            "Rpc" => rpc_name,
            "Peer" => auth_context.common_name.unwrap_or_default(),
        ))
    }
}

fn shutting_down_status() -> Status {
    Status::unavailable("node shutting down")
}

#[async_trait::async_trait]
impl LogService for RpcServer {
    async fn produce(&self, rpc_request_wrapped: Request<ProduceRequest>) -> Result<Response<ProduceResponse>, Status> {
        let logger = self.call_logger("Produce", &rpc_request_wrapped);
        let deadline = Deadline::from_metadata(rpc_request_wrapped.metadata());
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = Self::handle_produce(&self.gateway, rpc_request, deadline).await;
        slog::debug!(logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn consume(&self, rpc_request_wrapped: Request<ConsumeRequest>) -> Result<Response<ConsumeResponse>, Status> {
        let logger = self.call_logger("Consume", &rpc_request_wrapped);
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = Self::handle_consume(&self.gateway, Offset::new(rpc_request.offset)).await;
        slog::debug!(logger, "ServerWire - {:?}", rpc_result.as_ref().map(|_| ()));

        rpc_result.map(Response::new)
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        rpc_request_wrapped: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        let logger = self.call_logger("ConsumeStream", &rpc_request_wrapped);
        let mut offset = Offset::new(rpc_request_wrapped.into_inner().offset);
        let gateway = self.gateway.clone();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        slog::debug!(logger, "Tailing from offset {}", offset);
        tokio::spawn(async move {
            loop {
                let rpc_result = tokio::select! {
                    _ = tx.closed() => {
                        slog::debug!(logger, "Consumer went away at offset {}", offset);
                        return;
                    }
                    _ = shutdown.cancelled() => {
                        slog::debug!(logger, "Node shutting down, ending tail at offset {}", offset);
                        // Best effort. Don't let a full buffer hold up shutdown.
                        let _ = tx.try_send(Err(shutting_down_status()));
                        return;
                    }
                    rpc_result = Self::handle_consume(&gateway, offset) => rpc_result,
                };

                let is_err = rpc_result.is_err();
                if tx.send(rpc_result).await.is_err() || is_err {
                    slog::debug!(logger, "Stream closed at offset {}", offset);
                    return;
                }
                offset = offset.plus(1);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        rpc_request_wrapped: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        let logger = self.call_logger("ProduceStream", &rpc_request_wrapped);
        let deadline = Deadline::from_metadata(rpc_request_wrapped.metadata());
        let mut inbound = rpc_request_wrapped.into_inner();
        let gateway = self.gateway.clone();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => return,
                    _ = shutdown.cancelled() => {
                        // Best effort. Don't let a full buffer hold up shutdown.
                        let _ = tx.try_send(Err(shutting_down_status()));
                        return;
                    }
                    next = inbound.message() => next,
                };

                let rpc_request = match next {
                    Ok(Some(rpc_request)) => rpc_request,
                    Ok(None) => {
                        slog::debug!(logger, "Producer closed the stream");
                        return;
                    }
                    Err(status) => {
                        slog::debug!(logger, "Inbound stream failed: {:?}", status);
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };

                // Strictly one at a time: response n goes out before request n+1 is read.
                let rpc_result = Self::handle_produce(&gateway, rpc_request, deadline).await;
                let is_err = rpc_result.is_err();
                if tx.send(rpc_result).await.is_err() || is_err {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryLog, ReadMode};
    use crate::membership::MembershipRegistry;
    use crate::replication::{PeerCallError, PeerConnector, ReplicationCoordinator, ReplicationLedger};
    use tokio::time::Duration;
    use tokio_stream::StreamExt;

    struct NoPeers;

    #[async_trait::async_trait]
    impl PeerConnector for NoPeers {
        async fn produce(&self, addr: &str, _: ProduceRequest, _: Option<Duration>) -> Result<(), PeerCallError> {
            panic!("Unexpected replication to {}", addr);
        }
    }

    fn tailing_server(shutdown: CancellationToken) -> RpcServer {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let coordinator = ReplicationCoordinator::new(
            logger.clone(),
            "127.0.0.1:7000".to_string(),
            Arc::new(MembershipRegistry::new()),
            Arc::new(NoPeers),
            shutdown.clone(),
            None,
        );
        let gateway = Gateway::new(
            logger.clone(),
            Arc::new(InMemoryLog::with_read_mode(ReadMode::WaitForData)),
            coordinator,
            ReplicationLedger::new(16),
        );

        RpcServer::new(logger, gateway, 4, shutdown)
    }

    async fn wait_for_strong_count(gateway: &Arc<Gateway>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(gateway) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Streaming task never exited");
    }

    #[tokio::test]
    async fn tail_task_exits_when_consumer_goes_away() {
        let server = tailing_server(CancellationToken::new());
        let gateway = server.gateway.clone();

        let response = server
            .consume_stream(Request::new(ConsumeRequest { offset: 0 }))
            .await
            .unwrap();
        // Ours, the server's, and the tail task's.
        assert_eq!(Arc::strong_count(&gateway), 3);

        drop(response);
        wait_for_strong_count(&gateway, 2).await;
    }

    #[tokio::test]
    async fn tail_ends_with_unavailable_on_shutdown() {
        let shutdown = CancellationToken::new();
        let server = tailing_server(shutdown.clone());
        let gateway = server.gateway.clone();

        let mut stream = server
            .consume_stream(Request::new(ConsumeRequest { offset: 0 }))
            .await
            .unwrap()
            .into_inner();
        shutdown.cancel();

        let ended = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("Tail kept running after shutdown");
        match ended {
            Some(Err(status)) => assert_eq!(status.code(), tonic::Code::Unavailable),
            other => panic!("Expected UNAVAILABLE, got {:?}", other.map(|r| r.map(|_| ()))),
        }
        assert!(stream.next().await.is_none());
        wait_for_strong_count(&gateway, 2).await;
    }
}
