use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArpWardenError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("predicate failure in rule '{rule_id}': {message}")]
    PredicateFailure { rule_id: String, message: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArpWardenError>;
