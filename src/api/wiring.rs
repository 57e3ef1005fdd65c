use crate::api::options::NodeOptionsValidated;
use crate::auth::{AuthInterceptor, TlsConfig};
use crate::commitlog::Log;
use crate::membership::{
    Membership, MembershipError, MembershipEvent, MembershipProvider, MembershipRegistration, RPC_ADDR_TAG,
};
use crate::replication::{GrpcPeerConnector, PeerConnector, ReplicationCoordinator, ReplicationLedger};
use crate::server::{Gateway, RpcServer};
use crate::NodeOptions;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::transport::Server;

pub struct NodeConfig {
    /// Unique name of this node in the cluster.
    pub node_name: String,
    /// Where the RPC server listens. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Address peers should dial. Defaults to the address the listener actually bound.
    pub advertise_addr: Option<String>,
    pub tls: TlsConfig,
    /// Cluster the node joins and replicates to. `MembershipRegistry` for in-process clusters.
    pub membership: Arc<dyn MembershipProvider>,
    /// Extra tags to register alongside `rpc_addr`.
    pub tags: HashMap<String, String>,
    pub log: Arc<dyn Log>,
    pub info_logger: slog::Logger,
    pub options: NodeOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalNodeOptions(String),
    #[error("Failed to bind RPC listener: {0}")]
    Bind(io::Error),
    #[error("Invalid TLS configuration: {0}")]
    Tls(tonic::transport::Error),
    #[error("Failed to join cluster: {0}")]
    Membership(#[from] MembershipError),
}

/// Node is a running log node: RPC server, cluster registration, and replication.
///
/// Dropping the handle leaves the cluster, stops the server, and cancels in-flight fan-outs.
pub struct Node {
    logger: slog::Logger,
    rpc_addr: String,
    membership: Box<dyn MembershipRegistration>,
    _shutdown: DropGuard,
}

impl Node {
    /// The address this node advertises to the cluster.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn membership(&self) -> &dyn MembershipRegistration {
        self.membership.as_ref()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        slog::info!(self.logger, "Shutting down node {}", self.membership.name());
    }
}

pub async fn try_create_node(config: NodeConfig) -> Result<Node, NodeCreationError> {
    let options = NodeOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalNodeOptions(e.to_string()))?;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(NodeCreationError::Bind)?;
    let rpc_addr = match config.advertise_addr {
        Some(addr) => addr,
        None => listener.local_addr().map_err(NodeCreationError::Bind)?.to_string(),
    };

    let root_logger = config
        .info_logger
        .new(slog::o!("Node" => config.node_name.clone(), "RpcAddr" => rpc_addr.clone()));

    let server = Server::builder()
        .tls_config(config.tls.server_tls_config())
        .map_err(NodeCreationError::Tls)?;

    let shutdown = CancellationToken::new();

    let connector: Arc<dyn PeerConnector> = Arc::new(GrpcPeerConnector::new(
        root_logger.new(slog::o!("Component" => "PeerConnector")),
        config.tls.client_tls_config(),
        options.connect_timeout,
        options.connection_policy,
    ));

    // Subscribe before joining, so no event between the two is missed.
    let cluster: Arc<dyn Membership> = Arc::new(config.membership.clone());
    let membership_events = cluster.events();
    tokio::spawn(handle_membership_events(
        root_logger.new(slog::o!("Component" => "Membership")),
        cluster.clone(),
        membership_events,
        connector.clone(),
        shutdown.clone(),
    ));

    let coordinator = ReplicationCoordinator::new(
        root_logger.new(slog::o!("Component" => "Replication")),
        rpc_addr.clone(),
        cluster,
        connector,
        shutdown.clone(),
        Some(options.replication_timeout),
    );
    let gateway = Gateway::new(
        root_logger.clone(),
        config.log,
        coordinator,
        ReplicationLedger::new(options.ledger_capacity),
    );
    let interceptor = AuthInterceptor::new(root_logger.new(slog::o!("Component" => "Auth")), options.auth_policy);
    let rpc_server = RpcServer::new(root_logger.clone(), gateway, options.stream_buffer, shutdown.clone());
    tokio::spawn(rpc_server.run(server, listener, interceptor));

    let mut tags = config.tags;
    tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.clone());
    let membership = config.membership.join(config.node_name, tags)?;

    Ok(Node {
        logger: root_logger,
        rpc_addr,
        membership,
        _shutdown: shutdown.drop_guard(),
    })
}

/// Membership events are informational: replication always re-reads the member list. They're
/// only used to drop cached connections to members that left or moved.
async fn handle_membership_events(
    logger: slog::Logger,
    membership: Arc<dyn Membership>,
    mut events: tokio::sync::broadcast::Receiver<MembershipEvent>,
    connector: Arc<dyn PeerConnector>,
    shutdown: CancellationToken,
) {
    // Last known address per member name, so an Update can evict the address it replaced.
    let mut known_addrs = member_addrs(membership.as_ref());

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(MembershipEvent::Join(member)) => {
                slog::info!(logger, "Member joined: {} at {:?}", member.name, member.rpc_addr());
                if let Some(addr) = member.rpc_addr() {
                    known_addrs.insert(member.name.clone(), addr.to_string());
                }
            }
            Ok(MembershipEvent::Leave(member)) => {
                slog::info!(logger, "Member left: {} at {:?}", member.name, member.rpc_addr());
                if let Some(addr) = known_addrs.remove(&member.name) {
                    connector.forget(&addr);
                }
            }
            Ok(MembershipEvent::Update(member)) => {
                slog::info!(logger, "Member updated: {} at {:?}", member.name, member.rpc_addr());
                let new_addr = member.rpc_addr().map(str::to_string);
                let old_addr = match &new_addr {
                    Some(addr) => known_addrs.insert(member.name.clone(), addr.clone()),
                    None => known_addrs.remove(&member.name),
                };
                if let Some(old_addr) = old_addr {
                    if Some(&old_addr) != new_addr.as_ref() {
                        connector.forget(&old_addr);
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                // Any of the missed events could have been a Leave. Start over from a snapshot.
                slog::warn!(logger, "Missed {} membership events, dropping all pooled connections", skipped);
                connector.forget_all();
                known_addrs = member_addrs(membership.as_ref());
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn member_addrs(membership: &dyn Membership) -> HashMap<String, String> {
    membership
        .members()
        .into_iter()
        .filter_map(|m| m.rpc_addr().map(|addr| (m.name.clone(), addr.to_string())))
        .collect()
}
