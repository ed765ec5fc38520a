use grain_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("username is required")]
    MissingUsername,

    #[error("hub {0} is not running")]
    HubClosed(usize),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingUsername => "missing_username",
            Self::HubClosed(_) => "hub_closed",
            Self::Broker(_) => "broker",
            Self::Io(_) => "io",
        }
    }
}
