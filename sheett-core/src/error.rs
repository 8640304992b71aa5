use thiserror::Error;

/// Errors raised by the core store layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid cell id: {0:?}")]
    InvalidCellId(String),

    #[error("Invalid store id: {0:?}")]
    InvalidStoreId(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}
