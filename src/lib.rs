mod api;
mod auth;
mod commitlog;
mod membership;
mod replication;
mod server;
mod grpc {
    include!("../generated/replog.v1.rs");
}

pub use api::try_create_node;
pub use api::ClientError;
pub use api::ConsumeStream;
pub use api::LogClient;
pub use api::Node;
pub use api::NodeConfig;
pub use api::NodeCreationError;
pub use api::NodeOptions;
pub use api::ProduceStream;
pub use auth::AuthContext;
pub use auth::AuthPolicy;
pub use auth::TlsConfig;
pub use auth::TlsError;
pub use auth::TlsPaths;
pub use commitlog::InMemoryLog;
pub use commitlog::Log;
pub use commitlog::LogError;
pub use commitlog::Offset;
pub use commitlog::ReadMode;
pub use commitlog::Record;
pub use commitlog::RecordBatch;
pub use membership::ClusterMember;
pub use membership::Membership;
pub use membership::MembershipError;
pub use membership::MembershipEvent;
pub use membership::MembershipHandle;
pub use membership::MembershipProvider;
pub use membership::MembershipRegistration;
pub use membership::MembershipRegistry;
pub use membership::RPC_ADDR_TAG;
pub use replication::ConnectError;
pub use replication::ConnectionPolicy;
pub use replication::PeerCallError;
pub use replication::ReplicationError;

// `crate::{root_mod}` holds no code. Just `mod` and `pub use` statements. Modules are never
// `pub`; everything exported goes through an individual `pub use`.
