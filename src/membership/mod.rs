//! Cluster membership as seen by a node: who is alive and where their RPC servers listen.
mod member;
mod registry;

pub use member::ClusterMember;
pub use member::MembershipEvent;
pub use member::RPC_ADDR_TAG;
pub use registry::Membership;
pub use registry::MembershipError;
pub use registry::MembershipHandle;
pub use registry::MembershipProvider;
pub use registry::MembershipRegistration;
pub use registry::MembershipRegistry;
