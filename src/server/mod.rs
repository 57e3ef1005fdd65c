mod convert;
mod gateway;
mod server;
mod status;

pub(crate) use gateway::Gateway;
pub(crate) use server::RpcServer;
pub(crate) use status::metadata_offset;
#[cfg(test)]
pub(crate) use status::replication_failed_status;
pub(crate) use status::FIRST_OFFSET_METADATA_KEY;
pub(crate) use status::OFFSET_METADATA_KEY;
