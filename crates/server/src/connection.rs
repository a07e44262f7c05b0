//! One client connection: handshake, then the command loop.

use std::io::{Read, Write};
use std::sync::Arc;

use whais_core::endian::{Reader, Writer};
use whais_vm::{Session, SessionStack};

use crate::commands::CommandContext;
use crate::errors::{ConnectionError, Result};
use crate::frame::{
    CIPHER_PLAIN, Command, Frame, FrameCipher, PlainCipher, Status, cipher_by_id, read_frame,
    write_frame,
};
use crate::server::ServerState;

pub struct ClientConnection<S: Read + Write> {
    stream: S,
    cipher: Box<dyn FrameCipher>,
    max_frame: u32,
    session: Arc<Session>,
    stack: SessionStack,
}

impl<S: Read + Write> ClientConnection<S> {
    /// Perform the handshake: the client proposes a maximum frame size and
    /// a cipher and names the database it authenticates into.
    pub fn handshake(state: &ServerState, mut stream: S) -> Result<Self> {
        let plain = PlainCipher;
        let hello = read_frame(&mut stream, &plain, state.config().max_frame_size)?;
        if hello.command() != Some(Command::Connect) {
            return Err(ConnectionError::HandshakeRejected(
                "expected a CONNECT frame".into(),
            ));
        }
        let mut r = Reader::new(&hello.payload);
        let malformed = || ConnectionError::MalformedPayload("CONNECT");
        let proposed_frame = r.u32().map_err(|_| malformed())?;
        let cipher_id = r.u8().map_err(|_| malformed())?;
        let database = r.cstr().map_err(|_| malformed())?.to_string();
        let _password = r.cstr().map_err(|_| malformed())?;

        let max_frame = proposed_frame
            .clamp(crate::config::MIN_MAX_FRAME, state.config().max_frame_size);
        let cipher = cipher_by_id(cipher_id).unwrap_or_else(|| Box::new(PlainCipher));
        let agreed_cipher = if cipher.id() == cipher_id {
            cipher_id
        } else {
            CIPHER_PLAIN
        };

        let session = match state.open_session(&database) {
            Ok(session) => session,
            Err(reason) => {
                let mut w = Writer::new();
                w.u32(Status::NotFound as u32);
                w.cstr(&reason);
                let _ = write_frame(
                    &mut stream,
                    &plain,
                    state.config().max_frame_size,
                    &Frame::new(Command::Connect, w.into_bytes()),
                );
                return Err(ConnectionError::HandshakeRejected(reason));
            }
        };

        let mut w = Writer::new();
        w.u32(Status::Ok as u32);
        w.u32(max_frame);
        w.u8(agreed_cipher);
        write_frame(
            &mut stream,
            &plain,
            state.config().max_frame_size,
            &Frame::new(Command::Connect, w.into_bytes()),
        )?;

        log::info!("client authenticated into '{database}'");
        Ok(Self {
            stream,
            cipher,
            max_frame,
            session,
            stack: SessionStack::new(state.config().max_stack_count),
        })
    }

    /// Serve frames until BYE, shutdown or a transport error.
    pub fn serve(&mut self, state: &ServerState) -> Result<()> {
        loop {
            if state.is_stopping() {
                return Ok(());
            }
            let frame = match read_frame(&mut self.stream, &*self.cipher, self.max_frame) {
                Ok(frame) => frame,
                Err(ConnectionError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(ConnectionError::Closed);
                }
                Err(e) => return Err(e),
            };
            let cmd = frame.cmd;
            let response = match self.dispatch(&frame) {
                Ok(None) => return Ok(()),
                Ok(Some(payload)) => payload,
                Err(e) => {
                    log::debug!("request failed: {e}");
                    let mut w = Writer::new();
                    w.u32(e.status() as u32);
                    w.cstr(&e.to_string());
                    w.into_bytes()
                }
            };
            write_frame(
                &mut self.stream,
                &*self.cipher,
                self.max_frame,
                &Frame {
                    cmd,
                    payload: response,
                },
            )?;
        }
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>> {
        let command = frame
            .command()
            .ok_or(ConnectionError::UnknownCommand(frame.cmd))?;
        let mut ctx = CommandContext {
            session: self.session.as_ref(),
            stack: &mut self.stack,
            max_frame: self.max_frame,
        };
        Ok(Some(match command {
            Command::Connect => {
                return Err(ConnectionError::HandshakeRejected(
                    "already connected".into(),
                ));
            }
            Command::Ping => {
                let mut w = Writer::new();
                w.u32(Status::Ok as u32);
                w.into_bytes()
            }
            Command::Bye => return Ok(None),
            Command::PushStack => ctx.push_stack(&frame.payload)?,
            Command::PopStack => ctx.pop_stack(&frame.payload)?,
            Command::UpdateStackTop => ctx.update_stack_top(&frame.payload)?,
            Command::ReadStackTop => ctx.read_stack_top(&frame.payload)?,
            Command::UpdateStackTableAddRows => ctx.add_rows(&frame.payload)?,
            Command::Execute => ctx.execute(&frame.payload)?,
            Command::ListGlobals => ctx.list_globals(),
            Command::ListProcedures => ctx.list_procedures(),
            Command::DescribeProcedure => ctx.describe_procedure(&frame.payload)?,
        }))
    }
}
