use whais_core::errors::{CodecError, ValueError};
use whais_core::types::TypeId;
use whais_core::{FieldIndex, RowId};

#[derive(Debug, thiserror::Error)]
pub enum DbsError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("operation not legal in this state: {0}")]
    GeneralControlError(&'static str),
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("table '{0}' already exists")]
    TableExists(String),
    #[error("table '{0}' still has live references")]
    TableInUse(String),
    #[error("field {0} does not exist")]
    FieldNotFound(FieldIndex),
    #[error("field '{0}' not part of the table")]
    FieldNameNotFound(String),
    #[error("row {row} out of range (allocated {allocated})")]
    RowOutOfRange { row: RowId, allocated: RowId },
    #[error("field {field} holds {stored}, not {requested}")]
    FieldTypeMismatch {
        field: FieldIndex,
        stored: TypeId,
        requested: TypeId,
    },
    #[error("extent {0} is not allocated")]
    UnknownExtent(u64),
    #[error("table reached its {0} row quota")]
    QuotaExceeded(u64),
    #[error("storage corrupted: {0}")]
    StoreCorrupted(&'static str),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbsError>;
