use bytes::Bytes;
use std::{fmt, io};

/// Offset is the position of a record batch in the log. The first batch is written at offset 0.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Offset(u64);

impl Offset {
    pub fn new(offset: u64) -> Self {
        Offset(offset)
    }

    pub fn start_offset() -> Self {
        Self::new(0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Offset {
        Offset::new(self.0 + delta)
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single opaque payload. The log never looks inside it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    pub value: Bytes,
}

/// An ordered group of records appended and read as one unit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        RecordBatch { records }
    }

    pub fn from_values<I, B>(values: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        RecordBatch {
            records: values.into_iter().map(|v| Record { value: v.into() }).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("offset {offset} is out of range")]
    OffsetOutOfRange { offset: Offset },
    #[error("log storage failure: {0}")]
    Storage(#[from] io::Error),
}

/// Log is an append only log of record batches.
///
/// Implementations own offset assignment and must be safe to call from many tasks at once.
#[async_trait::async_trait]
pub trait Log: Send + Sync + 'static {
    /// append_batch() appends a batch at the next offset, then returns the offset that was just
    /// used to append the batch.
    async fn append_batch(&self, batch: RecordBatch) -> Result<Offset, LogError>;

    /// Read the batch at `offset`. Fails with `LogError::OffsetOutOfRange` when nothing has been
    /// written there yet, unless the implementation chooses to wait for it.
    async fn read_batch(&self, offset: Offset) -> Result<RecordBatch, LogError>;
}
