//! End-to-end interpreter tests: assembled units running against real
//! storage.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use pretty_assertions::assert_eq;
use whais_core::types::{FieldSpec, TypeDescriptor, TypeId, TypeWord};
use whais_core::value::{Scalar, Value};
use whais_dbs::{DbsHandle, StorageConfig};
use whais_vm::session::NativeProcedure;
use whais_vm::unit::CodeBuilder;
use whais_vm::{
    CompiledUnit, InterErrorKind, NameSpace, NativeLibrary, Opcode, Session, SessionStack,
    UnitBuilder,
};

fn scalar(kind: TypeId) -> TypeDescriptor {
    TypeDescriptor::Simple(TypeWord::scalar(kind))
}

struct Harness {
    _dir: tempfile::TempDir,
    session: Arc<Session>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dbs = Arc::new(
            DbsHandle::open(
                "vmtest",
                &dir.path().join("data"),
                &dir.path().join("tmp"),
                StorageConfig::default(),
            )
            .unwrap(),
        );
        let session = Arc::new(Session::new(
            dbs,
            Arc::new(NameSpace::new()),
            Arc::new(AtomicBool::new(false)),
            256,
        ));
        Self { _dir: dir, session }
    }

    fn load(&self, unit: CompiledUnit) {
        self.session.load_compiled_unit(unit).unwrap();
    }

    fn run(&self, name: &str, args: Vec<Scalar>) -> Result<Scalar, whais_vm::InterError> {
        let mut stack = SessionStack::default();
        for arg in args {
            stack.push_scalar(arg).unwrap();
        }
        self.session.execute_procedure(name, &mut stack)?;
        assert_eq!(stack.size(), 1, "exactly the result remains");
        stack.get_scalar(0, result_kind(&stack))
    }
}

fn result_kind(stack: &SessionStack) -> TypeId {
    use whais_vm::OperandSemantics;
    let word = stack.operand(0).unwrap().type_word(stack).unwrap();
    TypeId::from_code(word & 0x00FF).unwrap_or(TypeId::Undetermined)
}

#[test]
fn constant_return() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        .op(Opcode::LdI32)
        .u32(42)
        .op(Opcode::Ret)
        .finish();
    builder.procedure("answer", &[scalar(TypeId::UInt32)], 0, 0, &code);
    harness.load(builder.build());

    assert_eq!(
        harness.run("answer", vec![]).unwrap(),
        Scalar::UInt32(Some(42))
    );
}

#[test]
fn integer_or_and_boolean_orb_at_expected_offsets() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();

    let int_code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::Or)
        .op(Opcode::Ret)
        .finish();
    // Two LDLO8 of two bytes each put the operator at offset 4.
    assert_eq!(int_code[0], Opcode::LdLo8 as u8);
    assert_eq!(int_code[2], Opcode::LdLo8 as u8);
    assert_eq!(int_code[4], Opcode::Or as u8);
    builder.procedure(
        "int_or",
        &[
            scalar(TypeId::Int64),
            scalar(TypeId::Int8),
            scalar(TypeId::Int16),
        ],
        2,
        0,
        &int_code,
    );

    let bool_code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::OrB)
        .op(Opcode::Ret)
        .finish();
    assert_eq!(bool_code[4], Opcode::OrB as u8);
    builder.procedure(
        "bool_or",
        &[
            scalar(TypeId::Bool),
            scalar(TypeId::Bool),
            scalar(TypeId::Bool),
        ],
        2,
        0,
        &bool_code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run(
                "int_or",
                vec![Scalar::Int8(Some(0x0F)), Scalar::Int16(Some(0xF0))]
            )
            .unwrap(),
        Scalar::Int64(Some(0xFF))
    );
    assert_eq!(
        harness
            .run(
                "bool_or",
                vec![Scalar::Bool(Some(false)), Scalar::Bool(Some(true))]
            )
            .unwrap(),
        Scalar::Bool(Some(true))
    );
}

#[test]
fn self_and_keeps_destination_type() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::SAnd)
        .op(Opcode::Cts)
        .u8(1)
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::Ret)
        .finish();
    assert_eq!(code[4], Opcode::SAnd as u8);
    builder.procedure(
        "masked",
        &[
            scalar(TypeId::UInt16),
            scalar(TypeId::UInt16),
            scalar(TypeId::Int32),
        ],
        2,
        0,
        &code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run(
                "masked",
                vec![Scalar::UInt16(Some(0x00FF)), Scalar::Int32(Some(0xAA))]
            )
            .unwrap(),
        Scalar::UInt16(Some(0xAA))
    );
}

#[test]
fn null_propagates_through_arithmetic() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::Add)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "sum",
        &[
            scalar(TypeId::Int64),
            scalar(TypeId::Int64),
            scalar(TypeId::Int64),
        ],
        2,
        0,
        &code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run("sum", vec![Scalar::Int64(Some(3)), Scalar::Int64(None)])
            .unwrap(),
        Scalar::Int64(None)
    );
    assert_eq!(
        harness
            .run("sum", vec![Scalar::Int64(Some(3)), Scalar::Int64(Some(4))])
            .unwrap(),
        Scalar::Int64(Some(7))
    );
}

#[test]
fn divide_by_zero_reports_a_traceback() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let inner = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdI8)
        .u8(0)
        .op(Opcode::Div)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "divide",
        &[scalar(TypeId::Int64), scalar(TypeId::Int64)],
        1,
        0,
        &inner,
    );
    let outer = CodeBuilder::new()
        .op(Opcode::LdI8)
        .u8(10)
        .op(Opcode::Call)
        .u32(0)
        .op(Opcode::Ret)
        .finish();
    builder.procedure("outer", &[scalar(TypeId::Int64)], 0, 0, &outer);
    harness.load(builder.build());

    let err = harness.run("outer", vec![]).unwrap_err();
    assert_eq!(err.kind, InterErrorKind::DivideByZero);
    let frames: Vec<&str> = err.traceback().iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(frames, vec!["divide", "outer"]);
}

#[test]
fn loops_accumulate() {
    // acc = 0; i = 0; do { i += 1; acc += i; } while (i < 10); return acc
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        // i += 1
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdI8)
        .u8(1)
        .op(Opcode::SAdd)
        .op(Opcode::Cts)
        .u8(1)
        // acc += i
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::SAdd)
        .op(Opcode::Cts)
        .u8(1)
        // while i < 10 jump back to start; the JTC sits at byte 19
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdI8)
        .u8(10)
        .op(Opcode::LtU)
        .op(Opcode::Jtc)
        .i32(-19)
        // return acc
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "triangular",
        &[
            scalar(TypeId::UInt64),
            scalar(TypeId::UInt64),
            scalar(TypeId::UInt64),
        ],
        2,
        0,
        &code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run(
                "triangular",
                vec![Scalar::UInt64(Some(0)), Scalar::UInt64(Some(0))]
            )
            .unwrap(),
        Scalar::UInt64(Some(55))
    );
}

#[test]
fn text_indexing_yields_characters() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let greeting = builder.constant_text("whais");
    let code = CodeBuilder::new()
        .op(Opcode::Ldt)
        .u32(greeting)
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::IndT)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "char_of",
        &[scalar(TypeId::Char), scalar(TypeId::UInt64)],
        1,
        0,
        &code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run("char_of", vec![Scalar::UInt64(Some(2))])
            .unwrap(),
        Scalar::Char(Some('a'))
    );
    let err = harness
        .run("char_of", vec![Scalar::UInt64(None)])
        .unwrap_err();
    assert_eq!(err.kind, InterErrorKind::TextIndexNull);
}

#[test]
fn table_global_cells_update_through_indta() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let logbook = TypeDescriptor::Table(vec![FieldSpec::new("cnt", TypeId::UInt32, false)]);
    builder.global("logbook", &logbook, false);
    let field = builder.constant_text("cnt");
    let code = CodeBuilder::new()
        .op(Opcode::LdGb8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::IndTa)
        .u32(field)
        .op(Opcode::LdI8)
        .u8(5)
        .op(Opcode::StUi32)
        .op(Opcode::Cts)
        .u8(1)
        .op(Opcode::Ldbt)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "mark",
        &[scalar(TypeId::Bool), scalar(TypeId::UInt64)],
        1,
        0,
        &code,
    );
    harness.load(builder.build());

    let table = harness.session.dbs().retrieve_table("logbook").unwrap();
    let row = table.add_row().unwrap();

    assert_eq!(
        harness
            .run("mark", vec![Scalar::UInt64(Some(row))])
            .unwrap(),
        Scalar::Bool(Some(true))
    );
    assert_eq!(
        table.get(row, 0).unwrap(),
        Value::Scalar(Scalar::UInt32(Some(5)))
    );
}

#[test]
fn sync_regions_serialize_all_callers() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    builder.global("counter", &scalar(TypeId::Int64), false);
    let code = CodeBuilder::new()
        .op(Opcode::BSync)
        .u8(0)
        // counter += delta, in place through the global cell
        .op(Opcode::LdGb8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::SAdd)
        .op(Opcode::Cts)
        .u8(1)
        .op(Opcode::ESync)
        .u8(0)
        .op(Opcode::Ldbt)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "bump",
        &[scalar(TypeId::Bool), scalar(TypeId::Int64)],
        1,
        1,
        &code,
    );
    harness.load(builder.build());

    // Seed the counter with zero.
    {
        let id = harness.session.find_global("counter").unwrap();
        let def = harness.session.global_def(id).unwrap();
        let whais_vm::session::GlobalBacking::Cell(cell) = &def.backing else {
            panic!("scalar global expected")
        };
        *cell.write().unwrap() = Value::Scalar(Scalar::Int64(Some(0)));
    }

    const PER_THREAD: i64 = 200;
    std::thread::scope(|scope| {
        for _ in 0..2 {
            let session = Arc::clone(&harness.session);
            scope.spawn(move || {
                for _ in 0..PER_THREAD {
                    let mut stack = SessionStack::default();
                    stack.push_scalar(Scalar::Int64(Some(1))).unwrap();
                    session.execute_procedure("bump", &mut stack).unwrap();
                }
            });
        }
    });

    let mut stack = SessionStack::default();
    stack.push_scalar(Scalar::Int64(Some(0))).unwrap();
    harness.session.execute_procedure("bump", &mut stack).unwrap();
    let id = harness.session.find_global("counter").unwrap();
    let def = harness.session.global_def(id).unwrap();
    let whais_vm::session::GlobalBacking::Cell(cell) = &def.backing else {
        panic!("scalar global expected")
    };
    assert_eq!(
        *cell.read().unwrap(),
        Value::Scalar(Scalar::Int64(Some(2 * PER_THREAD)))
    );
}

#[test]
fn runaway_recursion_hits_the_stack_limit() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        .op(Opcode::LdI8)
        .u8(1)
        .op(Opcode::Call)
        .u32(0)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "forever",
        &[scalar(TypeId::Int64), scalar(TypeId::Int64)],
        1,
        0,
        &code,
    );
    harness.load(builder.build());

    let err = harness
        .run("forever", vec![Scalar::Int64(Some(1))])
        .unwrap_err();
    assert_eq!(err.kind, InterErrorKind::StackTooBig);
}

#[test]
fn external_procedures_bind_to_native_libraries() {
    let harness = Harness::new();
    harness
        .session
        .register_native_library(NativeLibrary {
            name: "math".into(),
            procedures: vec![NativeProcedure {
                name: "native_double".into(),
                slots: vec![scalar(TypeId::Int64), scalar(TypeId::Int64)],
                body: Box::new(|stack, _session| {
                    let top = stack.size() - 1;
                    let v = stack
                        .get_scalar(top, TypeId::Int64)
                        .and_then(|s| Ok(s.to_i64()?))
                        .map_err(|e| e.to_string())?;
                    stack.pop(1).map_err(|e| e.to_string())?;
                    stack
                        .push_scalar(Scalar::Int64(v.map(|v| v * 2)))
                        .map_err(|e| e.to_string())?;
                    Ok(())
                }),
            }],
        })
        .unwrap();

    let mut builder = UnitBuilder::new();
    builder.external_procedure(
        "native_double",
        &[scalar(TypeId::Int64), scalar(TypeId::Int64)],
        1,
    );
    let code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::Call)
        .u32(0)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "doubled",
        &[scalar(TypeId::Int64), scalar(TypeId::Int64)],
        1,
        0,
        &code,
    );
    harness.load(builder.build());

    assert_eq!(
        harness
            .run("doubled", vec![Scalar::Int64(Some(21))])
            .unwrap(),
        Scalar::Int64(Some(42))
    );
}

#[test]
fn execution_is_deterministic() {
    let harness = Harness::new();
    let mut builder = UnitBuilder::new();
    let code = CodeBuilder::new()
        .op(Opcode::LdLo8)
        .u8(0)
        .op(Opcode::LdLo8)
        .u8(1)
        .op(Opcode::MulRr)
        .op(Opcode::Ret)
        .finish();
    builder.procedure(
        "scaled",
        &[
            scalar(TypeId::RichReal),
            scalar(TypeId::RichReal),
            scalar(TypeId::RichReal),
        ],
        2,
        0,
        &code,
    );
    harness.load(builder.build());

    let args = || {
        vec![
            Scalar::RichReal(Some(
                whais_core::value::Real::from_parts(3, 250_000_000_000_000_000).unwrap(),
            )),
            Scalar::RichReal(Some(whais_core::value::Real::from_int(-4))),
        ]
    };
    let first = harness.run("scaled", args()).unwrap();
    let second = harness.run("scaled", args()).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first,
        Scalar::RichReal(Some(whais_core::value::Real::from_parts(-13, 0).unwrap()))
    );
}

#[test]
fn external_global_mismatch_is_rejected() {
    let harness = Harness::new();
    let mut first = UnitBuilder::new();
    first.global("shared_flag", &scalar(TypeId::Bool), false);
    harness.load(first.build());

    let mut second = UnitBuilder::new();
    second.global("shared_flag", &scalar(TypeId::Int64), true);
    let err = harness
        .session
        .load_compiled_unit(second.build())
        .unwrap_err();
    assert_eq!(err.kind, InterErrorKind::ExternalMismatch);

    let mut missing = UnitBuilder::new();
    missing.global("never_defined", &scalar(TypeId::Bool), true);
    let err = harness
        .session
        .load_compiled_unit(missing.build())
        .unwrap_err();
    assert_eq!(err.kind, InterErrorKind::GlobalNotFound);
}
