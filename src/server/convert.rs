use crate::commitlog;
use crate::grpc;

// ------- Conversions --------

impl From<grpc::Record> for commitlog::Record {
    fn from(proto_record: grpc::Record) -> Self {
        Self {
            value: proto_record.value,
        }
    }
}

impl From<commitlog::Record> for grpc::Record {
    fn from(record: commitlog::Record) -> Self {
        Self { value: record.value }
    }
}

impl From<grpc::RecordBatch> for commitlog::RecordBatch {
    fn from(proto_batch: grpc::RecordBatch) -> Self {
        Self::new(proto_batch.records.into_iter().map(commitlog::Record::from).collect())
    }
}

impl From<commitlog::RecordBatch> for grpc::RecordBatch {
    fn from(batch: commitlog::RecordBatch) -> Self {
        Self {
            records: batch.records.into_iter().map(grpc::Record::from).collect(),
        }
    }
}
