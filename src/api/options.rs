use crate::auth::AuthPolicy;
use crate::replication::ConnectionPolicy;
use tokio::time::Duration;

/// Tunables for a node. Anything left `None` falls back to a default.
#[derive(Clone, Default)]
pub struct NodeOptions {
    /// Upper bound on a fan-out when the caller didn't send a deadline of its own.
    pub replication_timeout: Option<Duration>,
    /// Upper bound on establishing a connection to a peer.
    pub connect_timeout: Option<Duration>,
    pub connection_policy: Option<ConnectionPolicy>,
    pub auth_policy: Option<AuthPolicy>,
    /// How many replication ids each node remembers to stop flood replication from looping.
    pub ledger_capacity: Option<usize>,
    /// Responses buffered per streaming call before the handler waits for the client.
    pub stream_buffer: Option<usize>,
}

pub(super) struct NodeOptionsValidated {
    pub replication_timeout: Duration,
    pub connect_timeout: Duration,
    pub connection_policy: ConnectionPolicy,
    pub auth_policy: AuthPolicy,
    pub ledger_capacity: usize,
    pub stream_buffer: usize,
}

impl NodeOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.connect_timeout >= self.replication_timeout {
            return Err("Connect timeout must be less than the replication timeout");
        }
        if self.ledger_capacity == 0 {
            return Err("Ledger capacity must be greater than 0");
        }
        if self.stream_buffer == 0 {
            return Err("Stream buffer must be greater than 0");
        }

        Ok(())
    }
}

impl TryFrom<NodeOptions> for NodeOptionsValidated {
    type Error = &'static str;

    fn try_from(options: NodeOptions) -> Result<Self, Self::Error> {
        let values = NodeOptionsValidated {
            replication_timeout: options.replication_timeout.unwrap_or(Duration::from_secs(10)),
            connect_timeout: options.connect_timeout.unwrap_or(Duration::from_secs(3)),
            connection_policy: options.connection_policy.unwrap_or_default(),
            auth_policy: options.auth_policy.unwrap_or_default(),
            ledger_capacity: options.ledger_capacity.unwrap_or(10_000),
            stream_buffer: options.stream_buffer.unwrap_or(16),
        };

        values.validate()?;
        Ok(values)
    }
}
