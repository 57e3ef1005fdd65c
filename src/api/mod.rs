//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod options;
mod wiring;

pub use client::ClientError;
pub use client::ConsumeStream;
pub use client::LogClient;
pub use client::ProduceStream;
pub use options::NodeOptions;
pub use wiring::try_create_node;
pub use wiring::Node;
pub use wiring::NodeConfig;
pub use wiring::NodeCreationError;
