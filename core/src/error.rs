use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("not support transfer type [{0}]")]
    UnsupportedTransferType(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("site driver error: {0}")]
    Driver(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("ledger corrupt: {0}")]
    LedgerCorrupt(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl CoreError {
    /// Ledger failures must reach the caller; everything else is reported in
    /// the job summary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Storage(_) | CoreError::LedgerCorrupt(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
