use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("migration {sequence} failed: {message}")]
    Execution { sequence: String, message: String },

    #[error("migration {sequence} has no down body and cannot be rolled back")]
    IrreversibleStep { sequence: String },

    #[error("position changed concurrently: expected {expected}, found {found}")]
    ConcurrentModification { expected: String, found: String },

    #[error("cancelled before migration {next}")]
    Cancelled { next: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-friendly label, used in logs and the CLI summary line.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Discovery(_) => "discovery",
            Error::Storage(_) => "storage",
            Error::Execution { .. } => "execution",
            Error::IrreversibleStep { .. } => "irreversible",
            Error::ConcurrentModification { .. } => "concurrent-modification",
            Error::Cancelled { .. } => "cancelled",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}
