//! Wire-level round trips against a live listener.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use whais_core::endian::{Reader, Writer, load_le_u16, load_le_u32};
use whais_core::types::{TypeDescriptor, TypeId, TypeWord};
use whais_core::value::Scalar;
use whais_server::config::DatabaseConfig;
use whais_server::frame::FRAME_HEADER;
use whais_server::{Command, Server, ServerConfig, ServerState, Status};
use whais_vm::session::{NativeLibrary, NativeProcedure};
use whais_vm::{NameSpace, OperandSemantics};

#[derive(Debug)]
struct TestClient {
    stream: TcpStream,
    max_frame: u32,
}

impl TestClient {
    fn send(&mut self, cmd: Command, payload: &[u8]) {
        let mut header = [0u8; FRAME_HEADER];
        header[..4].copy_from_slice(&((FRAME_HEADER + payload.len()) as u32).to_le_bytes());
        header[4..].copy_from_slice(&(cmd as u16).to_le_bytes());
        self.stream.write_all(&header).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    fn recv(&mut self) -> (u16, Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER];
        self.stream.read_exact(&mut header).unwrap();
        let size = load_le_u32(&header) as usize;
        assert!(size >= FRAME_HEADER && size <= self.max_frame as usize);
        let mut payload = vec![0u8; size - FRAME_HEADER];
        self.stream.read_exact(&mut payload).unwrap();
        (load_le_u16(&header[4..]), payload)
    }

    fn roundtrip(&mut self, cmd: Command, payload: &[u8]) -> Vec<u8> {
        self.send(cmd, payload);
        let (echoed, response) = self.recv();
        assert_eq!(echoed, cmd as u16);
        response
    }

    fn expect_ok(&mut self, cmd: Command, payload: &[u8]) -> Vec<u8> {
        let response = self.roundtrip(cmd, payload);
        assert_eq!(load_le_u32(&response), Status::Ok as u32, "{cmd:?} failed");
        response
    }
}

fn shared_namespace() -> Arc<NameSpace> {
    let shared = NameSpace::new();
    shared
        .register_native_library(NativeLibrary {
            name: "testlib".into(),
            procedures: vec![NativeProcedure {
                name: "native_double".into(),
                slots: vec![
                    TypeDescriptor::Simple(TypeWord::scalar(TypeId::Int64)),
                    TypeDescriptor::Simple(TypeWord::scalar(TypeId::Int64)),
                ],
                body: Box::new(|stack, _session| {
                    let top = stack.size() - 1;
                    let value = stack
                        .get_scalar(top, TypeId::Int64)
                        .and_then(|s| Ok(s.to_i64()?))
                        .map_err(|e| e.to_string())?;
                    stack.pop(1).map_err(|e| e.to_string())?;
                    stack
                        .push_scalar(Scalar::Int64(value.map(|v| v * 2)))
                        .map_err(|e| e.to_string())?;
                    Ok(())
                }),
            }],
        })
        .unwrap();
    Arc::new(shared)
}

fn start_server() -> (tempfile::TempDir, Arc<ServerState>, u16) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        working_directory: dir.path().to_path_buf(),
        temp_directory: dir.path().join("tmp"),
        databases: vec![DatabaseConfig {
            name: "testdb".into(),
            directory: dir.path().join("testdb"),
            object_files: vec![],
        }],
        ..ServerConfig::default()
    };
    let state = Arc::new(ServerState::new(config, shared_namespace()).unwrap());
    let server = Server::bind_ephemeral(Arc::clone(&state)).unwrap();
    let port = server.local_port().unwrap();
    std::thread::spawn(move || server.serve().unwrap());
    (dir, state, port)
}

fn connect(port: u16, database: &str) -> Result<TestClient, u32> {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut client = TestClient {
        stream,
        max_frame: 65_536,
    };
    let mut hello = Writer::new();
    hello.u32(4096).u8(0).cstr(database).cstr("");
    client.send(Command::Connect, hello.as_bytes());
    let (cmd, response) = client.recv();
    assert_eq!(cmd, Command::Connect as u16);
    let mut r = Reader::new(&response);
    let status = r.u32().unwrap();
    if status != Status::Ok as u32 {
        return Err(status);
    }
    client.max_frame = r.u32().unwrap();
    assert_eq!(r.u8().unwrap(), 0, "plain cipher agreed");
    Ok(client)
}

fn scalar_descriptor(kind: TypeId) -> Vec<u8> {
    TypeDescriptor::Simple(TypeWord::scalar(kind)).serialize()
}

#[test]
fn push_update_execute_read() {
    let (_dir, state, port) = start_server();
    let mut client = connect(port, "testdb").unwrap();

    client.expect_ok(Command::PushStack, &scalar_descriptor(TypeId::Int64));

    let mut update = Writer::new();
    update.u16(u16::MAX).u32(u32::MAX).u64(0);
    Scalar::Int64(Some(123)).write_stored(&mut update);
    client.expect_ok(Command::UpdateStackTop, update.as_bytes());

    let mut execute = Writer::new();
    execute.cstr("native_double");
    client.expect_ok(Command::Execute, execute.as_bytes());

    let mut read = Writer::new();
    read.u16(u16::MAX).u32(u32::MAX).u64(0).u64(0);
    let response = client.expect_ok(Command::ReadStackTop, read.as_bytes());
    let mut r = Reader::new(&response);
    r.u32().unwrap(); // status
    let (descriptor, used) = TypeDescriptor::parse(&response[4..]).unwrap();
    assert_eq!(
        descriptor,
        TypeDescriptor::Simple(TypeWord::scalar(TypeId::Int64))
    );
    r.seek(4 + used).unwrap();
    assert_eq!(r.u8().unwrap(), 0, "non-null");
    let value = Scalar::read_stored(TypeId::Int64, &mut r).unwrap();
    assert_eq!(value, Scalar::Int64(Some(246)));

    client.send(Command::Bye, &[]);
    state.shutdown();
}

#[test]
fn text_streams_with_resume_hints() {
    let (_dir, state, port) = start_server();
    let mut client = connect(port, "testdb").unwrap();

    client.expect_ok(Command::PushStack, &scalar_descriptor(TypeId::Text));

    // Two chunked writes, resuming at the current end.
    for (offset, chunk) in [(0u64, "hello "), (6, "world")] {
        let mut update = Writer::new();
        update.u16(u16::MAX).u32(u32::MAX).u64(offset);
        update.bytes(chunk.as_bytes());
        client.expect_ok(Command::UpdateStackTop, update.as_bytes());
    }

    // Read resuming from byte 6.
    let mut read = Writer::new();
    read.u16(u16::MAX).u32(u32::MAX).u64(0).u64(6);
    let response = client.expect_ok(Command::ReadStackTop, read.as_bytes());
    let mut r = Reader::new(&response);
    r.u32().unwrap();
    let (_, used) = TypeDescriptor::parse(&response[4..]).unwrap();
    r.seek(4 + used).unwrap();
    assert_eq!(r.u8().unwrap(), 0);
    assert_eq!(r.u64().unwrap(), 11, "total byte length");
    assert_eq!(r.u64().unwrap(), 6, "chunk offset");
    let chunk = r.bytes(r.remaining()).unwrap();
    assert_eq!(chunk, b"world");

    // A mis-sequenced write is rejected.
    let mut bad = Writer::new();
    bad.u16(u16::MAX).u32(u32::MAX).u64(99);
    bad.bytes(b"x");
    let response = client.roundtrip(Command::UpdateStackTop, bad.as_bytes());
    assert_eq!(load_le_u32(&response), Status::InvalidArgs as u32);

    client.send(Command::Bye, &[]);
    state.shutdown();
}

#[test]
fn table_rows_fill_over_the_wire() {
    let (_dir, state, port) = start_server();
    let mut client = connect(port, "testdb").unwrap();

    let table = TypeDescriptor::Table(vec![
        whais_core::types::FieldSpec::new("qty", TypeId::UInt32, false),
        whais_core::types::FieldSpec::new("label", TypeId::Text, false),
    ]);
    client.expect_ok(Command::PushStack, &table.serialize());

    let mut add = Writer::new();
    add.u32(2);
    client.expect_ok(Command::UpdateStackTableAddRows, add.as_bytes());

    let mut cell = Writer::new();
    cell.u16(0).u32(1).u64(0);
    Scalar::UInt32(Some(9)).write_stored(&mut cell);
    client.expect_ok(Command::UpdateStackTop, cell.as_bytes());

    let mut text_cell = Writer::new();
    text_cell.u16(1).u32(1).u64(0);
    text_cell.bytes(b"crates");
    client.expect_ok(Command::UpdateStackTop, text_cell.as_bytes());

    // Read back cell (0, 1).
    let mut read = Writer::new();
    read.u16(0).u32(1).u64(0).u64(0);
    let response = client.expect_ok(Command::ReadStackTop, read.as_bytes());
    let mut r = Reader::new(&response);
    r.u32().unwrap();
    let (descriptor, used) = TypeDescriptor::parse(&response[4..]).unwrap();
    assert_eq!(descriptor, table);
    r.seek(4 + used).unwrap();
    assert_eq!(r.u64().unwrap(), 2, "row count");
    assert_eq!(r.u16().unwrap(), 0, "field echoed");
    assert_eq!(r.u32().unwrap(), 1, "row echoed");
    assert_eq!(r.u8().unwrap(), 0);
    assert_eq!(
        Scalar::read_stored(TypeId::UInt32, &mut r).unwrap(),
        Scalar::UInt32(Some(9))
    );

    client.send(Command::Bye, &[]);
    state.shutdown();
}

#[test]
fn unknown_database_is_refused() {
    let (_dir, state, port) = start_server();
    assert_eq!(connect(port, "nowhere").unwrap_err(), Status::NotFound as u32);
    state.shutdown();
}

#[test]
fn introspection_lists_natives() {
    let (_dir, state, port) = start_server();
    let mut client = connect(port, "testdb").unwrap();

    let response = client.expect_ok(Command::ListProcedures, &[]);
    let mut r = Reader::new(&response);
    r.u32().unwrap();
    let count = r.u32().unwrap();
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(r.cstr().unwrap().to_string());
    }
    assert!(names.contains(&"native_double".to_string()));

    let mut describe = Writer::new();
    describe.cstr("native_double");
    let response = client.expect_ok(Command::DescribeProcedure, describe.as_bytes());
    let mut r = Reader::new(&response);
    r.u32().unwrap();
    assert_eq!(r.u16().unwrap(), 1, "one parameter");
    assert_eq!(r.u16().unwrap(), 2, "two slots");

    client.send(Command::Bye, &[]);
    state.shutdown();
}

// The operand trait is part of this crate's public contract with the VM;
// exercise it once from the outside.
#[test]
fn stack_values_report_wire_types() {
    let stack = {
        let mut stack = whais_vm::SessionStack::default();
        stack.push_scalar(Scalar::UInt16(Some(7))).unwrap();
        stack
    };
    let word = stack.operand(0).unwrap().type_word(&stack).unwrap();
    assert_eq!(word, TypeId::UInt16.code());
}
