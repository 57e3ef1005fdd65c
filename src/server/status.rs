//! Mapping of node errors onto gRPC statuses. Clients tell failures apart by code, and recover
//! the offsets involved from the status metadata.
use crate::commitlog::{LogError, Offset};
use crate::replication::ReplicationError;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Offset that was out of range, on `OUT_OF_RANGE` statuses.
pub(crate) const OFFSET_METADATA_KEY: &str = "offset";
/// Offset the batch was committed at locally, on `ABORTED` (replication failed) statuses.
pub(crate) const FIRST_OFFSET_METADATA_KEY: &str = "first-offset";

pub(crate) fn log_error_status(error: LogError) -> Status {
    match error {
        LogError::OffsetOutOfRange { offset } => with_offset(
            Code::OutOfRange,
            format!("offset out of range: {}", offset),
            OFFSET_METADATA_KEY,
            offset,
        ),
        LogError::Storage(ioe) => Status::internal(format!("local log failure: {}", ioe)),
    }
}

/// The batch is committed locally at `first_offset`, but at least one peer didn't get it.
pub(crate) fn replication_failed_status(first_offset: Offset, error: ReplicationError) -> Status {
    with_offset(
        Code::Aborted,
        format!("committed at offset {}, replication failed: {}", first_offset, error),
        FIRST_OFFSET_METADATA_KEY,
        first_offset,
    )
}

pub(crate) fn metadata_offset(status: &Status, key: &str) -> Option<Offset> {
    status
        .metadata()
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Offset::new)
}

fn with_offset(code: Code, message: String, key: &'static str, offset: Offset) -> Status {
    let mut metadata = MetadataMap::new();
    metadata.insert(key, MetadataValue::from(offset.as_u64()));

    Status::with_metadata(code, message, metadata)
}
