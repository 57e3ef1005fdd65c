use std::collections::HashMap;

/// Tag under which every member advertises the address of its RPC server.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// ClusterMember is a point-in-time view of one node, as reported by the membership provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterMember {
    pub name: String,
    pub tags: HashMap<String, String>,
}

impl ClusterMember {
    pub fn new(name: impl Into<String>, tags: HashMap<String, String>) -> Self {
        ClusterMember {
            name: name.into(),
            tags,
        }
    }

    pub fn with_rpc_addr(name: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        let mut tags = HashMap::with_capacity(1);
        tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.into());

        Self::new(name, tags)
    }

    /// The RPC address this member advertises, if it advertises one at all.
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipEvent {
    Join(ClusterMember),
    Leave(ClusterMember),
    /// Member's tags changed. Carries the new view of the member.
    Update(ClusterMember),
}
