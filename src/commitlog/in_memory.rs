use crate::commitlog::{Log, LogError, Offset, RecordBatch};
use tokio::sync::{watch, RwLock};

/// What a read does when the requested offset hasn't been written yet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// Fail right away with `LogError::OffsetOutOfRange`.
    Immediate,
    /// Suspend until a batch is appended at the requested offset.
    WaitForData,
}

impl Default for ReadMode {
    fn default() -> Self {
        ReadMode::Immediate
    }
}

// Durability is not modeled here. Segment files would replace the Vec, the rest of the node
// only sees the `Log` trait.
pub struct InMemoryLog {
    batches: RwLock<Vec<RecordBatch>>,
    read_mode: ReadMode,
    // Publishes the next offset after every append, so waiting readers can wake up.
    next_offset_tx: watch::Sender<u64>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::with_read_mode(ReadMode::Immediate)
    }

    pub fn with_read_mode(read_mode: ReadMode) -> Self {
        let (next_offset_tx, _) = watch::channel(0);

        InMemoryLog {
            batches: RwLock::new(vec![]),
            read_mode,
            next_offset_tx,
        }
    }

    async fn try_read(&self, offset: Offset) -> Option<RecordBatch> {
        let batches = self.batches.read().await;
        batches.get(offset.as_u64() as usize).cloned()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Log for InMemoryLog {
    async fn append_batch(&self, batch: RecordBatch) -> Result<Offset, LogError> {
        let mut batches = self.batches.write().await;
        let offset = Offset::new(batches.len() as u64);
        batches.push(batch);
        // Publish while still holding the write lock so waiters never observe a stale length.
        self.next_offset_tx.send_replace(batches.len() as u64);

        Ok(offset)
    }

    async fn read_batch(&self, offset: Offset) -> Result<RecordBatch, LogError> {
        if let Some(batch) = self.try_read(offset).await {
            return Ok(batch);
        }

        match self.read_mode {
            ReadMode::Immediate => Err(LogError::OffsetOutOfRange { offset }),
            ReadMode::WaitForData => {
                let mut next_offset_rx = self.next_offset_tx.subscribe();
                // Sender lives as long as `self`, so `wait_for` can't fail while we're borrowed.
                let _ = next_offset_rx
                    .wait_for(|next_offset| *next_offset > offset.as_u64())
                    .await;

                self.try_read(offset)
                    .await
                    .ok_or(LogError::OffsetOutOfRange { offset })
            }
        }
    }
}
