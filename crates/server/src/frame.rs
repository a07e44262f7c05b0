//! Length-prefixed frames and the transport cipher seam.
//!
//! Every frame is `u32 size | u16 cmd | payload`, size counting the
//! six-byte header. The payload passes through the connection's cipher in
//! both directions; `plain` ships with the core, other ciphers slot in
//! behind the same trait.

use std::io::{Read, Write};

use whais_core::endian::{load_le_u16, load_le_u32, store_le_u16, store_le_u32};

use crate::errors::{ConnectionError, Result};

pub const FRAME_HEADER: usize = 6;

/// Command codes. Responses echo the request command with a leading
/// status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Connect = 0x0001,
    Ping = 0x0002,
    Bye = 0x0003,
    PushStack = 0x0010,
    PopStack = 0x0011,
    UpdateStackTop = 0x0012,
    ReadStackTop = 0x0013,
    UpdateStackTableAddRows = 0x0014,
    Execute = 0x0015,
    ListGlobals = 0x0020,
    ListProcedures = 0x0021,
    DescribeProcedure = 0x0022,
}

impl Command {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0001 => Self::Connect,
            0x0002 => Self::Ping,
            0x0003 => Self::Bye,
            0x0010 => Self::PushStack,
            0x0011 => Self::PopStack,
            0x0012 => Self::UpdateStackTop,
            0x0013 => Self::ReadStackTop,
            0x0014 => Self::UpdateStackTableAddRows,
            0x0015 => Self::Execute,
            0x0020 => Self::ListGlobals,
            0x0021 => Self::ListProcedures,
            0x0022 => Self::DescribeProcedure,
            _ => return None,
        })
    }
}

/// Request status, leading every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    GeneralError = 1,
    InvalidArgs = 2,
    TypeMismatch = 3,
    NotFound = 4,
    StackError = 5,
    ProcedureFault = 6,
    LargeResponse = 7,
}

/// Symmetric transform applied to frame payloads.
pub trait FrameCipher: Send {
    fn id(&self) -> u8;
    fn encode(&self, payload: &mut [u8]);
    fn decode(&self, payload: &mut [u8]);
}

/// The identity cipher.
#[derive(Default)]
pub struct PlainCipher;

pub const CIPHER_PLAIN: u8 = 0;

impl FrameCipher for PlainCipher {
    fn id(&self) -> u8 {
        CIPHER_PLAIN
    }

    fn encode(&self, _: &mut [u8]) {}

    fn decode(&self, _: &mut [u8]) {}
}

pub fn cipher_by_id(id: u8) -> Option<Box<dyn FrameCipher>> {
    match id {
        CIPHER_PLAIN => Some(Box::new(PlainCipher)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: Command, payload: Vec<u8>) -> Self {
        Self {
            cmd: cmd as u16,
            payload,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_raw(self.cmd)
    }
}

pub fn write_frame(
    out: &mut impl Write,
    cipher: &dyn FrameCipher,
    max_frame: u32,
    frame: &Frame,
) -> Result<()> {
    let size = FRAME_HEADER + frame.payload.len();
    if size > max_frame as usize {
        return Err(ConnectionError::FrameTooLarge {
            size,
            limit: max_frame,
        });
    }
    let mut header = [0u8; FRAME_HEADER];
    store_le_u32(size as u32, &mut header[0..]);
    store_le_u16(frame.cmd, &mut header[4..]);
    let mut payload = frame.payload.clone();
    cipher.encode(&mut payload);
    out.write_all(&header)?;
    out.write_all(&payload)?;
    out.flush()?;
    Ok(())
}

pub fn read_frame(
    input: &mut impl Read,
    cipher: &dyn FrameCipher,
    max_frame: u32,
) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER];
    input.read_exact(&mut header)?;
    let size = load_le_u32(&header) as usize;
    let cmd = load_le_u16(&header[4..]);
    if size < FRAME_HEADER || size > max_frame as usize {
        return Err(ConnectionError::FrameTooLarge {
            size,
            limit: max_frame,
        });
    }
    let mut payload = vec![0u8; size - FRAME_HEADER];
    input.read_exact(&mut payload)?;
    cipher.decode(&mut payload);
    Ok(Frame { cmd, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_round_trip() {
        let frame = Frame::new(Command::Execute, b"report\0".to_vec());
        let mut wire = Vec::new();
        write_frame(&mut wire, &PlainCipher, 1024, &frame).unwrap();
        assert_eq!(wire.len(), FRAME_HEADER + 7);
        assert_eq!(load_le_u32(&wire), wire.len() as u32);

        let parsed = read_frame(&mut wire.as_slice(), &PlainCipher, 1024).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.command(), Some(Command::Execute));
    }

    #[test]
    fn oversized_frames_are_refused_on_both_sides() {
        let frame = Frame::new(Command::PushStack, vec![0; 600]);
        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &PlainCipher, 512, &frame),
            Err(ConnectionError::FrameTooLarge { .. })
        ));

        write_frame(&mut wire, &PlainCipher, 4096, &frame).unwrap();
        assert!(matches!(
            read_frame(&mut wire.as_slice(), &PlainCipher, 512),
            Err(ConnectionError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn short_reads_surface_as_io_errors(){
        let frame = Frame::new(Command::Ping, vec![1, 2, 3]);
        let mut wire = Vec::new();
        write_frame(&mut wire, &PlainCipher, 512, &frame).unwrap();
        wire.truncate(wire.len() - 1);
        assert!(matches!(
            read_frame(&mut wire.as_slice(), &PlainCipher, 512),
            Err(ConnectionError::Io(_))
        ));
    }
}
