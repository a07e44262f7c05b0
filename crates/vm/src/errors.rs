use whais_core::errors::{CodecError, ValueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InterErrorKind {
    DivideByZero,
    TextIndexNull,
    ArrayIndexNull,
    RowIndexNull,
    FieldTypeMismatch,
    StackCorrupted,
    NestedSyncRequest,
    SyncNotAcquired,
    NativeCallFailed,
    StackTooBig,
    ServerStopped,
    UnitCorrupted,
    DuplicateDefinition,
    ExternalMismatch,
    GlobalNotFound,
    ProcedureNotFound,
    InvalidOp,
    InternalError,
}

/// An interpreter fault. As it unwinds the call frames each one appends
/// its `(procedure, pc)` coordinates, producing a traceback.
#[derive(Debug, Clone)]
pub struct InterError {
    pub kind: InterErrorKind,
    message: String,
    traceback: Vec<(String, u64)>,
}

impl InterError {
    pub fn new(kind: InterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn fault(kind: InterErrorKind) -> Self {
        Self::new(kind, <&'static str>::from(kind))
    }

    pub fn annotate(mut self, procedure: &str, pc: u64) -> Self {
        self.traceback.push((procedure.to_string(), pc));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn traceback(&self) -> &[(String, u64)] {
        &self.traceback
    }
}

impl std::fmt::Display for InterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", <&'static str>::from(self.kind), self.message)?;
        for (procedure, pc) in &self.traceback {
            write!(f, "\n\tin '{procedure}' (PC: {pc:04})")?;
        }
        Ok(())
    }
}

impl std::error::Error for InterError {}

impl From<ValueError> for InterError {
    fn from(e: ValueError) -> Self {
        let kind = match e {
            ValueError::TypeMismatch { .. } => InterErrorKind::FieldTypeMismatch,
            _ => InterErrorKind::InvalidOp,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<CodecError> for InterError {
    fn from(e: CodecError) -> Self {
        Self::new(InterErrorKind::UnitCorrupted, e.to_string())
    }
}

impl From<whais_dbs::DbsError> for InterError {
    fn from(e: whais_dbs::DbsError) -> Self {
        let kind = match e {
            whais_dbs::DbsError::FieldTypeMismatch { .. } => InterErrorKind::FieldTypeMismatch,
            _ => InterErrorKind::InternalError,
        };
        Self::new(kind, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InterError>;
