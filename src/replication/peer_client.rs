use crate::grpc::log_service_client::LogServiceClient;
use crate::grpc::ProduceRequest;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid peer address '{addr}': {source}")]
    InvalidUri {
        addr: String,
        source: tonic::transport::Error,
    },
    #[error("failed to connect to '{addr}': {source}")]
    ConnectFailure {
        addr: String,
        source: tonic::transport::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PeerCallError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("peer '{addr}' rejected produce: {status}")]
    Rpc { addr: String, status: Status },
}

/// Opens a mutual TLS channel to the RPC server at `addr` (`host:port`).
pub(crate) async fn connect(
    addr: &str,
    tls: &ClientTlsConfig,
    connect_timeout: Duration,
) -> Result<Channel, ConnectError> {
    let url = format!("https://{}", addr);
    let endpoint = Endpoint::from_shared(url)
        .map_err(|source| ConnectError::InvalidUri {
            addr: addr.to_string(),
            source,
        })?
        .connect_timeout(connect_timeout)
        .tls_config(tls.clone())
        .map_err(|source| ConnectError::ConnectFailure {
            addr: addr.to_string(),
            source,
        })?;

    endpoint
        .connect()
        .await
        .map_err(|source| ConnectError::ConnectFailure {
            addr: addr.to_string(),
            source,
        })
}

/// PeerConnector delivers one replicated produce request to one peer.
#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn produce(&self, addr: &str, request: ProduceRequest, timeout: Option<Duration>) -> Result<(), PeerCallError>;

    /// Drop anything cached for `addr`. Called when a member leaves or changes its address.
    fn forget(&self, _addr: &str) {}

    /// Drop everything cached, for when membership changes may have been missed.
    fn forget_all(&self) {}
}

/// How outbound replication connections are managed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPolicy {
    /// Dial, call, and close for every replication attempt.
    PerCall,
    /// Keep one channel per peer address and reuse it. A failed call evicts the channel.
    Pooled,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        ConnectionPolicy::PerCall
    }
}

pub struct GrpcPeerConnector {
    logger: slog::Logger,
    tls: ClientTlsConfig,
    connect_timeout: Duration,
    policy: ConnectionPolicy,
    pool: Mutex<HashMap<String, Channel>>,
}

impl GrpcPeerConnector {
    pub fn new(logger: slog::Logger, tls: ClientTlsConfig, connect_timeout: Duration, policy: ConnectionPolicy) -> Self {
        GrpcPeerConnector {
            logger,
            tls,
            connect_timeout,
            policy,
            pool: Mutex::new(HashMap::new()),
        }
    }

    async fn channel(&self, addr: &str) -> Result<Channel, ConnectError> {
        if self.policy == ConnectionPolicy::Pooled {
            let pooled = self.lock_pool().get(addr).cloned();
            if let Some(channel) = pooled {
                return Ok(channel);
            }
        }

        slog::debug!(self.logger, "Connecting to peer {}", addr);
        let channel = connect(addr, &self.tls, self.connect_timeout).await?;

        if self.policy == ConnectionPolicy::Pooled {
            // Another task may have raced us here. Either channel works; keep the first one.
            let mut pool = self.lock_pool();
            return Ok(pool.entry(addr.to_string()).or_insert(channel).clone());
        }

        Ok(channel)
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, HashMap<String, Channel>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl PeerConnector for GrpcPeerConnector {
    async fn produce(&self, addr: &str, request: ProduceRequest, timeout: Option<Duration>) -> Result<(), PeerCallError> {
        let channel = self.channel(addr).await?;
        let mut client = LogServiceClient::new(channel);

        let mut rpc_request = tonic::Request::new(request);
        if let Some(timeout) = timeout {
            rpc_request.set_timeout(timeout);
        }

        slog::debug!(self.logger, "ClientWire - produce to {}", addr);
        let rpc_reply = client.produce(rpc_request).await;
        slog::debug!(self.logger, "ClientWire - produce to {}: {:?}", addr, rpc_reply);

        match rpc_reply {
            Ok(_) => Ok(()),
            Err(status) => {
                self.forget(addr);
                Err(PeerCallError::Rpc {
                    addr: addr.to_string(),
                    status,
                })
            }
        }
        // With `PerCall`, `client` and its channel are dropped here, closing the connection.
    }

    fn forget(&self, addr: &str) {
        if self.lock_pool().remove(addr).is_some() {
            slog::debug!(self.logger, "Evicted pooled connection to {}", addr);
        }
    }

    fn forget_all(&self) {
        let mut pool = self.lock_pool();
        slog::debug!(self.logger, "Evicting {} pooled connections", pool.len());
        pool.clear();
    }
}
