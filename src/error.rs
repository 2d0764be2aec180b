use thiserror::Error;

pub type Result<T> = std::result::Result<T, RustStkError>;

#[derive(Error, Debug)]
pub enum RustStkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XDR error: {0}")]
    Xdr(#[from] crate::xdr::XdrError),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Volume catalog error: {0}")]
    Catalog(String),

    #[error("Tape error: {0}")]
    Tape(#[from] crate::stk::tape::TapeError),

    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RustStkError {
    pub fn rpc<T: Into<String>>(msg: T) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn catalog<T: Into<String>>(msg: T) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn parameter_validation<T: Into<String>>(msg: T) -> Self {
        Self::ParameterValidation(msg.into())
    }
}
