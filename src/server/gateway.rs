use crate::commitlog::{Log, LogError, Offset, RecordBatch};
use crate::grpc::ProduceRequest;
use crate::replication::{new_replication_id, Deadline, ReplicationCoordinator, ReplicationError, ReplicationLedger};
use std::sync::Arc;

/// Result of a produce call. The local commit succeeded; replication may not have.
#[derive(Debug)]
pub(crate) struct ProduceOutcome {
    pub(crate) first_offset: Offset,
    pub(crate) replication: Result<(), ReplicationError>,
}

/// Gateway composes the local log and the replication coordinator into the node's produce and
/// consume operations. The RPC layer only translates to and from the wire.
pub(crate) struct Gateway {
    logger: slog::Logger,
    log: Arc<dyn Log>,
    coordinator: ReplicationCoordinator,
    ledger: ReplicationLedger,
}

impl Gateway {
    pub(crate) fn new(
        logger: slog::Logger,
        log: Arc<dyn Log>,
        coordinator: ReplicationCoordinator,
        ledger: ReplicationLedger,
    ) -> Self {
        Gateway {
            logger,
            log,
            coordinator,
            ledger,
        }
    }

    /// Append the batch locally, then replicate the request to every peer.
    ///
    /// Every node handles a replicated request the same way it handles a client's, so a write
    /// floods the cluster. The replication id stops the flood: only the first arrival of an id
    /// appends and fans out, later arrivals get the offset already assigned.
    pub(crate) async fn produce(
        &self,
        mut request: ProduceRequest,
        deadline: Option<Deadline>,
    ) -> Result<ProduceOutcome, LogError> {
        if request.replication_id.is_empty() {
            request.replication_id = new_replication_id();
        }
        let batch = RecordBatch::from(request.record_batch.clone().unwrap_or_default());

        // Held until the fan-out below finishes, so the ledger can't forget the id mid-flood.
        let slot = self.ledger.slot(&request.replication_id);
        let mut appended_here = false;
        let first_offset = *slot
            .get_or_try_init(|| {
                appended_here = true;
                self.log.append_batch(batch)
            })
            .await?;

        if !appended_here {
            slog::debug!(
                self.logger,
                "Already have {} at offset {}, not replicating again",
                request.replication_id,
                first_offset
            );
            return Ok(ProduceOutcome {
                first_offset,
                replication: Ok(()),
            });
        }

        slog::debug!(self.logger, "Appended {} at offset {}", request.replication_id, first_offset);
        let replication = self.coordinator.replicate(&request, deadline).await;

        Ok(ProduceOutcome {
            first_offset,
            replication,
        })
    }

    pub(crate) async fn consume(&self, offset: Offset) -> Result<RecordBatch, LogError> {
        self.log.read_batch(offset).await
    }
}
