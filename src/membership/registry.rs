use crate::membership::{ClusterMember, MembershipEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_BUFFER_SIZE: usize = 256;

/// Membership is the read-only view of the cluster that the rest of the node depends on.
pub trait Membership: Send + Sync + 'static {
    /// Snapshot of every live member, including this node. May be stale by the time it's used.
    fn members(&self) -> Vec<ClusterMember>;

    /// Subscribe to join/leave/update events that happen after this call.
    fn events(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// MembershipProvider is a membership source a node can also register itself with. Swap in a
/// gossip-backed implementation to run nodes across processes.
pub trait MembershipProvider: Membership {
    /// Announce `name` with `tags` to the cluster. The member stays in the cluster until the
    /// returned registration is dropped.
    fn join(
        &self,
        name: String,
        tags: HashMap<String, String>,
    ) -> Result<Box<dyn MembershipRegistration>, MembershipError>;
}

/// MembershipRegistration is one node's presence in the cluster. Dropping it leaves.
pub trait MembershipRegistration: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Replace this member's tags and announce the change.
    fn update_tags(&self, tags: HashMap<String, String>);
}

impl Membership for Arc<dyn MembershipProvider> {
    fn members(&self) -> Vec<ClusterMember> {
        (**self).members()
    }

    fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        (**self).events()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("a member named '{0}' is already in the cluster")]
    DuplicateMember(String),
}

/// MembershipRegistry is an in-process membership provider. Every node that joins the same
/// registry sees the others. Cloning shares the same cluster.
///
/// Failure detection and anti-entropy belong to a real gossip layer; here a member is alive
/// for exactly as long as its `MembershipHandle`.
#[derive(Clone)]
pub struct MembershipRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    // Insertion order is kept so `members()` is stable across calls.
    members: Mutex<Vec<ClusterMember>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        MembershipRegistry {
            inner: Arc::new(RegistryInner {
                members: Mutex::new(vec![]),
                events,
            }),
        }
    }

    pub fn join(&self, name: impl Into<String>, tags: HashMap<String, String>) -> Result<MembershipHandle, MembershipError> {
        let member = ClusterMember::new(name, tags);

        {
            let mut members = self.inner.lock_members();
            if members.iter().any(|m| m.name == member.name) {
                return Err(MembershipError::DuplicateMember(member.name));
            }
            members.push(member.clone());
        }
        self.inner.publish(MembershipEvent::Join(member.clone()));

        Ok(MembershipHandle {
            registry: self.clone(),
            name: member.name,
        })
    }
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipProvider for MembershipRegistry {
    fn join(
        &self,
        name: String,
        tags: HashMap<String, String>,
    ) -> Result<Box<dyn MembershipRegistration>, MembershipError> {
        let handle = MembershipRegistry::join(self, name, tags)?;
        Ok(Box::new(handle))
    }
}

impl Membership for MembershipRegistry {
    fn members(&self) -> Vec<ClusterMember> {
        self.inner.lock_members().clone()
    }

    fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }
}

impl RegistryInner {
    fn lock_members(&self) -> std::sync::MutexGuard<'_, Vec<ClusterMember>> {
        // Nothing panics while holding the lock, but don't let a poisoned lock take the node down.
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// MembershipHandle is one node's registration in a `MembershipRegistry`. Dropping it leaves
/// the cluster.
pub struct MembershipHandle {
    registry: MembershipRegistry,
    name: String,
}

impl MembershipRegistration for MembershipHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_tags(&self, tags: HashMap<String, String>) {
        let updated = {
            let mut members = self.registry.inner.lock_members();
            match members.iter_mut().find(|m| m.name == self.name) {
                Some(member) => {
                    member.tags = tags;
                    member.clone()
                }
                None => return,
            }
        };
        self.registry.inner.publish(MembershipEvent::Update(updated));
    }
}

impl Membership for MembershipHandle {
    fn members(&self) -> Vec<ClusterMember> {
        self.registry.members()
    }

    fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.registry.events()
    }
}

impl Drop for MembershipHandle {
    fn drop(&mut self) {
        let removed = {
            let mut members = self.registry.inner.lock_members();
            members
                .iter()
                .position(|m| m.name == self.name)
                .map(|i| members.remove(i))
        };
        if let Some(member) = removed {
            self.registry.inner.publish(MembershipEvent::Leave(member));
        }
    }
}
