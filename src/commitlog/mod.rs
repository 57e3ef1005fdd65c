mod in_memory;
mod log;

pub use in_memory::InMemoryLog;
pub use in_memory::ReadMode;
pub use log::Log;
pub use log::LogError;
pub use log::Offset;
pub use log::Record;
pub use log::RecordBatch;
