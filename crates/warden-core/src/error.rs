use crate::lbvs::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid parameter (field {field}): {reason}")]
    InvalidParameter { field: u16, reason: String },
    #[error("Access denied for process {pid}")]
    AccessDenied { pid: u32 },
    #[error("Unsupported control code {0}")]
    NotSupported(u32),
    #[error("Config store error: {0}")]
    Store(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn invalid(field: impl Into<u16>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
