//! Best-effort fan-out of committed produce requests to the rest of the cluster.
mod coordinator;
mod deadline;
mod ledger;
mod peer_client;

pub use coordinator::ReplicationCoordinator;
pub use coordinator::ReplicationError;
pub use deadline::Deadline;
pub use peer_client::ConnectError;
pub use peer_client::ConnectionPolicy;
pub use peer_client::GrpcPeerConnector;
pub use peer_client::PeerCallError;
pub use peer_client::PeerConnector;

pub(crate) use ledger::new_replication_id;
pub(crate) use ledger::ReplicationLedger;
pub(crate) use peer_client::connect;
