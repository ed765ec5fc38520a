#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("subscription closed")]
    Closed,
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            BrokerError::Connection(e.to_string())
        } else {
            BrokerError::Command(e.to_string())
        }
    }
}
