use crate::grpc::ProduceRequest;
use crate::membership::Membership;
use crate::replication::{Deadline, PeerCallError, PeerConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replication to peer failed: {0}")]
    Peer(#[from] PeerCallError),
    #[error("replication deadline exceeded")]
    DeadlineExceeded,
    #[error("replication cancelled, node is shutting down")]
    Cancelled,
    #[error("replication task failed: {0}")]
    TaskFailed(String),
}

/// ReplicationCoordinator fans a locally committed produce request out to every other live
/// member of the cluster.
///
/// Reporting is all-or-nothing while delivery is not: if one peer fails, the others may already
/// have appended the batch. Nothing is retried here.
pub struct ReplicationCoordinator {
    logger: slog::Logger,
    // Our own advertised address. A member advertising it is us, and is skipped.
    local_rpc_addr: String,
    membership: Arc<dyn Membership>,
    connector: Arc<dyn PeerConnector>,
    // Parent of every fan-out's cancellation scope. Cancelled when the node shuts down.
    shutdown: CancellationToken,
    default_timeout: Option<Duration>,
}

impl ReplicationCoordinator {
    pub fn new(
        logger: slog::Logger,
        local_rpc_addr: String,
        membership: Arc<dyn Membership>,
        connector: Arc<dyn PeerConnector>,
        shutdown: CancellationToken,
        default_timeout: Option<Duration>,
    ) -> Self {
        ReplicationCoordinator {
            logger,
            local_rpc_addr,
            membership,
            connector,
            shutdown,
            default_timeout,
        }
    }

    /// Send `request` unmodified to every peer, concurrently. Succeeds once every peer has
    /// acknowledged it; otherwise returns the first failure and cancels the calls still in flight.
    pub async fn replicate(&self, request: &ProduceRequest, deadline: Option<Deadline>) -> Result<(), ReplicationError> {
        let peer_addrs = self.peer_addrs();
        if peer_addrs.is_empty() {
            return Ok(());
        }

        let deadline = deadline.or_else(|| self.default_timeout.map(Deadline::after));
        slog::debug!(
            self.logger,
            "Replicating {} to {} peers: {:?}",
            request.replication_id,
            peer_addrs.len(),
            peer_addrs
        );

        // One scope per produce call, so a failure here never cancels unrelated fan-outs.
        let scope = self.shutdown.child_token();
        let _cancel_on_exit = scope.clone().drop_guard();

        let mut tasks = JoinSet::new();
        for addr in peer_addrs {
            let connector = self.connector.clone();
            let request = request.clone();
            let scope = scope.clone();
            tasks.spawn(async move {
                let timeout = deadline.map(|d| d.remaining());
                tokio::select! {
                    _ = scope.cancelled() => Err(ReplicationError::Cancelled),
                    result = connector.produce(&addr, request, timeout) => result.map_err(ReplicationError::from),
                }
            });
        }

        let fan_out = Self::first_error(&mut tasks);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.instant(), fan_out)
                .await
                .unwrap_or(Err(ReplicationError::DeadlineExceeded)),
            None => fan_out.await,
        };

        if let Err(e) = &result {
            slog::warn!(self.logger, "Replication of {} failed: {}", request.replication_id, e);
            scope.cancel();
            tasks.abort_all();
        }

        result
    }

    async fn first_error(tasks: &mut JoinSet<Result<(), ReplicationError>>) -> Result<(), ReplicationError> {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_error) => return Err(ReplicationError::TaskFailed(join_error.to_string())),
            }
        }

        Ok(())
    }

    /// RPC addresses of every current member except ourselves. Re-read on every call.
    fn peer_addrs(&self) -> Vec<String> {
        let mut peer_addrs = vec![];
        for member in self.membership.members() {
            match member.rpc_addr() {
                Some(addr) if addr == self.local_rpc_addr => {
                    // That's us.
                }
                Some(addr) => peer_addrs.push(addr.to_string()),
                None => slog::warn!(self.logger, "Member {} advertises no RPC address", member.name),
            }
        }

        peer_addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{Record, RecordBatch};
    use crate::membership::{ClusterMember, MembershipEvent};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    const LOCAL_ADDR: &str = "127.0.0.1:7000";

    struct StaticMembership {
        members: Vec<ClusterMember>,
        events: broadcast::Sender<MembershipEvent>,
    }

    impl StaticMembership {
        fn new(addrs: &[&str]) -> Arc<Self> {
            let members = addrs
                .iter()
                .enumerate()
                .map(|(i, addr)| ClusterMember::with_rpc_addr(format!("node-{}", i), *addr))
                .collect();

            Arc::new(StaticMembership {
                members,
                events: broadcast::channel(1).0,
            })
        }
    }

    impl Membership for StaticMembership {
        fn members(&self) -> Vec<ClusterMember> {
            self.members.clone()
        }

        fn events(&self) -> broadcast::Receiver<MembershipEvent> {
            self.events.subscribe()
        }
    }

    #[derive(Copy, Clone)]
    enum PeerBehavior {
        Succeed,
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct RecordingConnector {
        behaviors: HashMap<String, PeerBehavior>,
        calls: Mutex<Vec<(String, ProduceRequest, Option<Duration>)>>,
        // Hanging calls that were dropped before finishing.
        cancelled: Arc<AtomicUsize>,
    }

    impl RecordingConnector {
        fn with(behaviors: &[(&str, PeerBehavior)]) -> Arc<Self> {
            Arc::new(RecordingConnector {
                behaviors: behaviors.iter().map(|(a, b)| (a.to_string(), *b)).collect(),
                ..RecordingConnector::default()
            })
        }

        fn called_addrs(&self) -> Vec<String> {
            let mut addrs: Vec<_> = self.calls.lock().unwrap().iter().map(|(a, _, _)| a.clone()).collect();
            addrs.sort();
            addrs
        }
    }

    struct CountOnDrop(Arc<AtomicUsize>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl PeerConnector for RecordingConnector {
        async fn produce(
            &self,
            addr: &str,
            request: ProduceRequest,
            timeout: Option<Duration>,
        ) -> Result<(), PeerCallError> {
            self.calls.lock().unwrap().push((addr.to_string(), request, timeout));

            match self.behaviors.get(addr).copied().unwrap_or(PeerBehavior::Succeed) {
                PeerBehavior::Succeed => Ok(()),
                PeerBehavior::Fail => Err(PeerCallError::Rpc {
                    addr: addr.to_string(),
                    status: tonic::Status::unavailable("peer down"),
                }),
                PeerBehavior::Hang => {
                    let _guard = CountOnDrop(self.cancelled.clone());
                    std::future::pending().await
                }
            }
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn coordinator(membership: Arc<dyn Membership>, connector: Arc<dyn PeerConnector>) -> ReplicationCoordinator {
        ReplicationCoordinator::new(
            logger(),
            LOCAL_ADDR.to_string(),
            membership,
            connector,
            CancellationToken::new(),
            None,
        )
    }

    fn request() -> ProduceRequest {
        ProduceRequest {
            record_batch: Some(RecordBatch {
                records: vec![Record {
                    value: "hello world".into(),
                }],
            }),
            replication_id: "0123456789abcdef".to_string(),
        }
    }

    async fn wait_for_cancelled(connector: &RecordingConnector, expected: usize) {
        for _ in 0..100 {
            if connector.cancelled.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Hanging peer calls were never cancelled");
    }

    #[tokio::test]
    async fn single_node_cluster_replicates_trivially() {
        let connector = RecordingConnector::with(&[]);
        let coordinator = coordinator(StaticMembership::new(&[LOCAL_ADDR]), connector.clone());

        coordinator.replicate(&request(), None).await.unwrap();
        assert!(connector.called_addrs().is_empty());
    }

    #[tokio::test]
    async fn empty_membership_replicates_trivially() {
        let connector = RecordingConnector::with(&[]);
        let coordinator = coordinator(StaticMembership::new(&[]), connector.clone());

        coordinator.replicate(&request(), None).await.unwrap();
        assert!(connector.called_addrs().is_empty());
    }

    #[tokio::test]
    async fn never_replicates_to_own_address() {
        let connector = RecordingConnector::with(&[]);
        let membership = StaticMembership::new(&["127.0.0.1:7001", LOCAL_ADDR, "127.0.0.1:7002"]);
        let coordinator = coordinator(membership, connector.clone());

        coordinator.replicate(&request(), None).await.unwrap();

        assert_eq!(connector.called_addrs(), vec!["127.0.0.1:7001", "127.0.0.1:7002"]);
    }

    #[tokio::test]
    async fn forwards_the_original_request() {
        let connector = RecordingConnector::with(&[]);
        let coordinator = coordinator(StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7001"]), connector.clone());

        coordinator.replicate(&request(), None).await.unwrap();

        let calls = connector.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, request());
    }

    #[tokio::test]
    async fn skips_members_without_rpc_addr() {
        let connector = RecordingConnector::with(&[]);
        let mut members = StaticMembership::new(&[LOCAL_ADDR]).members();
        members.push(ClusterMember::new("no-addr", HashMap::new()));
        let membership = Arc::new(StaticMembership {
            members,
            events: broadcast::channel(1).0,
        });

        coordinator(membership, connector.clone())
            .replicate(&request(), None)
            .await
            .unwrap();
        assert!(connector.called_addrs().is_empty());
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings() {
        let connector = RecordingConnector::with(&[
            ("127.0.0.1:7001", PeerBehavior::Hang),
            ("127.0.0.1:7002", PeerBehavior::Fail),
            ("127.0.0.1:7003", PeerBehavior::Hang),
        ]);
        let membership = StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"]);
        let coordinator = coordinator(membership, connector.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), coordinator.replicate(&request(), None))
            .await
            .expect("Fan-out did not return after first failure");

        match result {
            Err(ReplicationError::Peer(PeerCallError::Rpc { addr, .. })) => assert_eq!(addr, "127.0.0.1:7002"),
            other => panic!("Unexpected result {:?}", other),
        }
        wait_for_cancelled(&connector, 2).await;
    }

    #[tokio::test]
    async fn deadline_bounds_the_fan_out() {
        let connector = RecordingConnector::with(&[("127.0.0.1:7001", PeerBehavior::Hang)]);
        let coordinator = coordinator(StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7001"]), connector.clone());

        let deadline = Deadline::after(Duration::from_millis(50));
        let result = coordinator.replicate(&request(), Some(deadline)).await;

        assert!(matches!(result, Err(ReplicationError::DeadlineExceeded)));
        let calls = connector.calls.lock().unwrap();
        let propagated = calls[0].2.expect("Deadline was not propagated to the peer call");
        assert!(propagated <= Duration::from_millis(50));
        drop(calls);
        wait_for_cancelled(&connector, 1).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_fan_out() {
        let connector = RecordingConnector::with(&[("127.0.0.1:7001", PeerBehavior::Hang)]);
        let shutdown = CancellationToken::new();
        let coordinator = ReplicationCoordinator::new(
            logger(),
            LOCAL_ADDR.to_string(),
            StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7001"]),
            connector.clone(),
            shutdown.clone(),
            None,
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.cancel();
        });
        let result = coordinator.replicate(&request(), None).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(ReplicationError::Cancelled)));
    }

    #[tokio::test]
    async fn failure_in_one_fan_out_leaves_others_alone() {
        let connector = RecordingConnector::with(&[("127.0.0.1:7002", PeerBehavior::Fail)]);
        let coordinator = Arc::new(coordinator(
            StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7001"]),
            connector.clone(),
        ));
        let failing = ReplicationCoordinator::new(
            logger(),
            LOCAL_ADDR.to_string(),
            StaticMembership::new(&[LOCAL_ADDR, "127.0.0.1:7002"]),
            connector.clone(),
            coordinator.shutdown.clone(),
            None,
        );

        assert!(failing.replicate(&request(), None).await.is_err());
        coordinator.replicate(&request(), None).await.unwrap();
    }
}
