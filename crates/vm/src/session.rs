//! Sessions and name spaces.
//!
//! A session resolves names against two spaces: the process-wide shared
//! space (system tables and native intrinsics) and its private space (the
//! user database and whatever units it loaded). Ids carry the space in
//! their top bit so compiled code can address either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use ahash::AHashMap;
use whais_core::types::{TypeDescriptor, TypeId, TypeWord};
use whais_core::value::{Scalar, Value};
use whais_dbs::{DbsHandle, Table};

use crate::errors::{InterError, InterErrorKind, Result};
use crate::operand::{GlobalCell, GlobalOperand, Operand, TableOperand};
use crate::processor::ProcedureCall;
use crate::stack::SessionStack;
use crate::unit::CompiledUnit;

const SHARED_SPACE_BIT: u32 = 0x8000_0000;

/// A database-wide critical section; one per `(procedure, sync index)`.
pub struct SyncRegion {
    held: Mutex<bool>,
    signal: Condvar,
}

impl Default for SyncRegion {
    fn default() -> Self {
        Self {
            held: Mutex::new(false),
            signal: Condvar::new(),
        }
    }
}

impl SyncRegion {
    pub fn acquire(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while *held {
            held = self.signal.wait(held).unwrap_or_else(|e| e.into_inner());
        }
        *held = true;
    }

    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = false;
        self.signal.notify_one();
    }
}

pub enum GlobalBacking {
    Table(Arc<Table>),
    Cell(GlobalCell),
}

pub struct GlobalDef {
    pub name: String,
    pub descriptor: TypeDescriptor,
    pub backing: GlobalBacking,
}

/// Host-implemented procedure body. Receives the stack with its arguments
/// on top and must leave exactly the return value in their place.
pub type NativeFn =
    Box<dyn Fn(&mut SessionStack, &Session) -> std::result::Result<(), String> + Send + Sync>;

pub struct NativeProcedure {
    pub name: String,
    /// Return-value descriptor first, then one per parameter.
    pub slots: Vec<TypeDescriptor>,
    pub body: NativeFn,
}

/// The manifest a native library exports.
pub struct NativeLibrary {
    pub name: String,
    pub procedures: Vec<NativeProcedure>,
}

/// Per-unit context shared by the procedures that were loaded from it:
/// constants plus the unit-local to session-wide id maps.
pub struct UnitContext {
    pub unit: CompiledUnit,
    pub global_map: Vec<u32>,
    proc_map: RwLock<Vec<u32>>,
}

impl UnitContext {
    pub fn global_id(&self, unit_index: u32) -> Result<u32> {
        self.global_map
            .get(unit_index as usize)
            .copied()
            .ok_or_else(|| {
                InterError::new(InterErrorKind::UnitCorrupted, "global index out of range")
            })
    }

    pub fn procedure_id(&self, unit_index: u32) -> Result<u32> {
        self.proc_map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit_index as usize)
            .copied()
            .ok_or_else(|| {
                InterError::new(InterErrorKind::UnitCorrupted, "procedure index out of range")
            })
    }
}

pub struct Procedure {
    pub name: String,
    pub args_count: u16,
    pub locals_count: u16,
    pub sync_count: u16,
    pub code: Vec<u8>,
    pub local_defaults: Vec<Operand>,
    pub local_descriptors: Vec<TypeDescriptor>,
    pub unit: Option<Arc<UnitContext>>,
    pub native: Option<NativeFn>,
    pub syncs: Vec<SyncRegion>,
}

/// One name space: globals and procedures addressed by dense ids.
#[derive(Default)]
pub struct NameSpace {
    globals: RwLock<Vec<Arc<GlobalDef>>>,
    global_ids: RwLock<AHashMap<String, u32>>,
    procedures: RwLock<Vec<Arc<Procedure>>>,
    procedure_ids: RwLock<AHashMap<String, u32>>,
}

impl NameSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_global(&self, name: &str) -> Option<u32> {
        self.global_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn find_procedure(&self, name: &str) -> Option<u32> {
        self.procedure_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn global(&self, id: u32) -> Option<Arc<GlobalDef>> {
        self.globals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id as usize)
            .cloned()
    }

    fn procedure(&self, id: u32) -> Option<Arc<Procedure>> {
        self.procedures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id as usize)
            .cloned()
    }

    fn globals_count(&self) -> u32 {
        self.globals.read().unwrap_or_else(|e| e.into_inner()).len() as u32
    }

    fn procedures_count(&self) -> u32 {
        self.procedures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u32
    }

    fn define_global(&self, def: GlobalDef) -> Result<u32> {
        let mut ids = self.global_ids.write().unwrap_or_else(|e| e.into_inner());
        if ids.contains_key(&def.name) {
            return Err(InterError::new(
                InterErrorKind::DuplicateDefinition,
                format!("global '{}' is already defined", def.name),
            ));
        }
        let mut globals = self.globals.write().unwrap_or_else(|e| e.into_inner());
        let id = globals.len() as u32;
        ids.insert(def.name.clone(), id);
        globals.push(Arc::new(def));
        Ok(id)
    }

    fn define_procedure(&self, procedure: Procedure) -> Result<u32> {
        let mut ids = self
            .procedure_ids
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if ids.contains_key(&procedure.name) {
            return Err(InterError::new(
                InterErrorKind::DuplicateDefinition,
                format!("procedure '{}' is already defined", procedure.name),
            ));
        }
        let mut procedures = self.procedures.write().unwrap_or_else(|e| e.into_inner());
        let id = procedures.len() as u32;
        ids.insert(procedure.name.clone(), id);
        procedures.push(Arc::new(procedure));
        Ok(id)
    }

    /// Register a native library's manifest into this space.
    pub fn register_native_library(&self, library: NativeLibrary) -> Result<()> {
        for procedure in library.procedures {
            let slots = procedure.slots;
            let defaults = slots.iter().map(default_operand_for).collect();
            self.define_procedure(Procedure {
                name: procedure.name,
                args_count: slots.len() as u16 - 1,
                locals_count: slots.len() as u16,
                sync_count: 0,
                code: Vec::new(),
                local_defaults: defaults,
                local_descriptors: slots,
                unit: None,
                native: Some(procedure.body),
                syncs: Vec::new(),
            })?;
        }
        log::info!("registered native library '{}'", library.name);
        Ok(())
    }
}

fn default_operand_for(descriptor: &TypeDescriptor) -> Operand {
    match descriptor {
        TypeDescriptor::Table(_) => Operand::Null(crate::operand::NullOperand),
        TypeDescriptor::Simple(word) => {
            let kind = word.base().unwrap_or(TypeId::Undetermined);
            Operand::default_for(word.raw(), kind, word.is_array())
        }
    }
}

fn default_value_for(descriptor: &TypeDescriptor) -> Result<Value> {
    match descriptor {
        TypeDescriptor::Table(_) => Err(InterError::new(
            InterErrorKind::InternalError,
            "table globals are backed by tables",
        )),
        TypeDescriptor::Simple(word) => {
            let kind = word.base().map_err(InterError::from)?;
            Ok(if word.is_array() {
                Value::Array(kind, None)
            } else if kind == TypeId::Text {
                Value::Text(None)
            } else {
                Value::Scalar(Scalar::null_of(kind).ok_or_else(|| {
                    InterError::new(InterErrorKind::UnitCorrupted, "global of invalid type")
                })?)
            })
        }
    }
}

pub struct Session {
    dbs: Arc<DbsHandle>,
    shared: Arc<NameSpace>,
    private: NameSpace,
    max_stack: usize,
    stop_flag: Arc<AtomicBool>,
}

impl Session {
    pub fn new(
        dbs: Arc<DbsHandle>,
        shared: Arc<NameSpace>,
        stop_flag: Arc<AtomicBool>,
        max_stack: usize,
    ) -> Self {
        Self {
            dbs,
            shared,
            private: NameSpace::new(),
            max_stack,
            stop_flag,
        }
    }

    pub fn dbs(&self) -> &Arc<DbsHandle> {
        &self.dbs
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn is_server_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn find_global(&self, name: &str) -> Option<u32> {
        self.private.find_global(name).or_else(|| {
            self.shared
                .find_global(name)
                .map(|id| id | SHARED_SPACE_BIT)
        })
    }

    pub fn find_procedure(&self, name: &str) -> Option<u32> {
        self.private.find_procedure(name).or_else(|| {
            self.shared
                .find_procedure(name)
                .map(|id| id | SHARED_SPACE_BIT)
        })
    }

    pub fn global_def(&self, id: u32) -> Result<Arc<GlobalDef>> {
        let space = if id & SHARED_SPACE_BIT != 0 {
            &*self.shared
        } else {
            &self.private
        };
        space.global(id & !SHARED_SPACE_BIT).ok_or_else(|| {
            InterError::new(InterErrorKind::GlobalNotFound, format!("global id {id}"))
        })
    }

    pub fn procedure(&self, id: u32) -> Result<Arc<Procedure>> {
        let space = if id & SHARED_SPACE_BIT != 0 {
            &*self.shared
        } else {
            &self.private
        };
        space.procedure(id & !SHARED_SPACE_BIT).ok_or_else(|| {
            InterError::new(
                InterErrorKind::ProcedureNotFound,
                format!("procedure id {id}"),
            )
        })
    }

    /// The operand a `LDGB` pushes for this global.
    pub fn global_operand(&self, id: u32) -> Result<Operand> {
        let def = self.global_def(id)?;
        Ok(match &def.backing {
            GlobalBacking::Table(table) => Operand::Table(TableOperand {
                table: Arc::clone(table),
            }),
            GlobalBacking::Cell(cell) => Operand::Global(GlobalOperand {
                cell: Arc::clone(cell),
            }),
        })
    }

    pub fn global_values_count(&self) -> u32 {
        self.private.globals_count() + self.shared.globals_count()
    }

    pub fn procedures_count(&self) -> u32 {
        self.private.procedures_count() + self.shared.procedures_count()
    }

    /// Dense enumeration across both spaces, private first.
    pub fn global_id_at(&self, index: u32) -> Option<u32> {
        let private = self.private.globals_count();
        if index < private {
            Some(index)
        } else if index < private + self.shared.globals_count() {
            Some((index - private) | SHARED_SPACE_BIT)
        } else {
            None
        }
    }

    pub fn procedure_id_at(&self, index: u32) -> Option<u32> {
        let private = self.private.procedures_count();
        if index < private {
            Some(index)
        } else if index < private + self.shared.procedures_count() {
            Some((index - private) | SHARED_SPACE_BIT)
        } else {
            None
        }
    }

    pub fn register_native_library(&self, library: NativeLibrary) -> Result<()> {
        self.private.register_native_library(library)
    }

    /// Load a compiled unit: bind or define its globals, then register its
    /// procedures and resolve every unit-local reference.
    pub fn load_compiled_unit(&self, unit: CompiledUnit) -> Result<()> {
        let mut global_map = Vec::with_capacity(unit.globals.len());
        for entry in &unit.globals {
            let descriptor = unit.type_descriptor_at(entry.type_offset)?;
            if let Some(existing) = self.find_global(&entry.name) {
                let def = self.global_def(existing)?;
                if def.descriptor != descriptor {
                    return Err(InterError::new(
                        InterErrorKind::ExternalMismatch,
                        format!("global '{}' redefined with a different type", entry.name),
                    ));
                }
                global_map.push(existing);
                continue;
            }
            if entry.external {
                return Err(InterError::new(
                    InterErrorKind::GlobalNotFound,
                    format!("external global '{}' is not defined", entry.name),
                ));
            }
            let backing = match &descriptor {
                TypeDescriptor::Table(fields) => {
                    let table = if self.dbs.has_table(&entry.name).map_err(InterError::from)? {
                        self.dbs.retrieve_table(&entry.name)
                    } else {
                        self.dbs.add_table(&entry.name, fields.clone())
                    }
                    .map_err(InterError::from)?;
                    GlobalBacking::Table(table)
                }
                simple => GlobalBacking::Cell(Arc::new(RwLock::new(default_value_for(simple)?))),
            };
            let id = self.private.define_global(GlobalDef {
                name: entry.name.clone(),
                descriptor,
                backing,
            })?;
            global_map.push(id);
        }

        let context = Arc::new(UnitContext {
            unit,
            global_map,
            proc_map: RwLock::new(Vec::new()),
        });

        let mut proc_map = Vec::with_capacity(context.unit.procedures.len());
        for entry in &context.unit.procedures {
            if entry.external {
                let id = self.find_procedure(&entry.name).ok_or_else(|| {
                    InterError::new(
                        InterErrorKind::ProcedureNotFound,
                        format!("external procedure '{}' is not defined", entry.name),
                    )
                })?;
                let existing = self.procedure(id)?;
                if existing.args_count != entry.args_count {
                    return Err(InterError::new(
                        InterErrorKind::ExternalMismatch,
                        format!("procedure '{}' argument count differs", entry.name),
                    ));
                }
                proc_map.push(id);
                continue;
            }

            let mut local_descriptors = Vec::with_capacity(entry.locals_count as usize);
            for &offset in &entry.locals_type_offsets {
                local_descriptors.push(context.unit.type_descriptor_at(offset)?);
            }
            let local_defaults = local_descriptors.iter().map(default_operand_for).collect();
            let id = self.private.define_procedure(Procedure {
                name: entry.name.clone(),
                args_count: entry.args_count,
                locals_count: entry.locals_count,
                sync_count: entry.sync_count,
                code: context.unit.code_of(entry).to_vec(),
                local_defaults,
                local_descriptors,
                unit: Some(Arc::clone(&context)),
                native: None,
                syncs: (0..entry.sync_count).map(|_| SyncRegion::default()).collect(),
            })?;
            proc_map.push(id);
        }
        *context.proc_map.write().unwrap_or_else(|e| e.into_inner()) = proc_map;

        log::debug!(
            "loaded unit: {} globals, {} procedures",
            context.unit.globals.len(),
            context.unit.procedures.len()
        );
        Ok(())
    }

    /// Run a registered procedure against the stack; its arguments must
    /// already be on top.
    pub fn execute_procedure(&self, name: &str, stack: &mut SessionStack) -> Result<()> {
        let id = self.find_procedure(name).ok_or_else(|| {
            InterError::new(
                InterErrorKind::ProcedureNotFound,
                format!("procedure '{name}'"),
            )
        })?;
        let procedure = self.procedure(id)?;
        if stack.size() < procedure.args_count as usize {
            return Err(InterError::new(
                InterErrorKind::StackCorrupted,
                format!(
                    "procedure '{name}' takes {} arguments, stack holds {}",
                    procedure.args_count,
                    stack.size()
                ),
            ));
        }
        self.check_arguments(&procedure, stack)?;
        ProcedureCall::invoke(self, stack, &procedure)
    }

    /// Validate the argument types on the stack against the declared
    /// parameter slots; numeric widening is allowed, nulls always pass.
    fn check_arguments(&self, procedure: &Procedure, stack: &SessionStack) -> Result<()> {
        use crate::operand::OperandSemantics;

        let args = procedure.args_count as usize;
        for param in 0..args {
            let pos = stack.size() - args + param;
            let actual = stack.operand(pos)?.type_word(stack)?;
            if actual == TypeId::Undetermined.code() {
                continue;
            }
            let expected = match procedure.local_descriptors.get(param + 1) {
                Some(TypeDescriptor::Simple(word)) => word.raw(),
                Some(TypeDescriptor::Table(_)) => whais_core::types::TABLE_MASK,
                None => continue,
            };
            if !argument_compatible(expected, actual) {
                return Err(InterError::new(
                    InterErrorKind::FieldTypeMismatch,
                    format!(
                        "argument {} of '{}' expects type 0x{expected:04x}, got 0x{actual:04x}",
                        param + 1,
                        procedure.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn argument_compatible(expected: u16, actual: u16) -> bool {
    if expected == actual {
        return true;
    }
    let (Ok(expected), Ok(actual)) = (TypeWord::from_raw(expected), TypeWord::from_raw(actual))
    else {
        return false;
    };
    if expected.is_table() || actual.is_table() {
        return expected.is_table() && actual.is_table();
    }
    if expected.is_array() != actual.is_array() || expected.is_field() != actual.is_field() {
        return false;
    }
    match (expected.base(), actual.base()) {
        (Ok(want), Ok(have)) => {
            if expected.is_array() {
                return want == have;
            }
            // Widening: any value whose cast into the declared kind can
            // succeed is admissible here; exact overflow surfaces at copy.
            (want.is_integer() && have.is_integer())
                || (want.is_real() && (have.is_real() || have.is_integer()))
                || (want.is_temporal() && have.is_temporal() && have <= want)
                || want == have
        }
        _ => false,
    }
}
