use crate::frame::Status;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: u32 },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("unknown command 0x{0:04x}")]
    UnknownCommand(u16),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("client closed the connection")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Status word reported to the client when the request itself can
    /// still be answered.
    pub fn status(&self) -> Status {
        match self {
            Self::MalformedPayload(_) | Self::UnknownCommand(_) => Status::InvalidArgs,
            Self::FrameTooLarge { .. } => Status::LargeResponse,
            _ => Status::GeneralError,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
