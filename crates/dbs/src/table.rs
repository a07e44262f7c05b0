//! Row-oriented tables with typed columns.
//!
//! Scalar columns occupy fixed-width slots inside each row; TEXT and ARRAY
//! columns hold `(extent, length)` handles into the table's variable-size
//! store and keep the extent reference counts in step with the rows that
//! point at them. Each row starts with a bitmap: one null bit per field
//! plus a removed bit.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use whais_core::endian::{Reader, Writer, load_le_u64, store_le_u64};
use whais_core::types::{FieldSpec, TypeDescriptor, TypeId};
use whais_core::value::{ArrayValue, Scalar, Value};
use whais_core::{FieldIndex, RowId};

use crate::btree::{BTree, FileNodeManager, Key, KeyPart};
use crate::cache::{BlockCache, FileItemsManager};
use crate::errors::{DbsError, Result};
use crate::store::VariableSizeStore;

const TABLE_MAGIC: &[u8; 4] = b"WTB0";
const TABLE_VERSION: u16 = 1;
const VL_HANDLE_WIDTH: usize = 16;

/// Storage tuning knobs, fed from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    pub table_block_size: usize,
    pub table_block_count: usize,
    pub vl_granule: usize,
    pub vl_block_size: usize,
    pub vl_block_count: usize,
    pub index_node_size: usize,
    pub index_block_count: usize,
    /// Row quota per table; `add_row` fails beyond it.
    pub max_rows_per_table: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_block_size: 4098,
            table_block_count: 1024,
            vl_granule: 64,
            vl_block_size: 1024,
            vl_block_count: 4098,
            index_node_size: 1024,
            index_block_count: 512,
            max_rows_per_table: u64::MAX,
        }
    }
}

/// Schema fixed at table creation: field list plus the derived row layout.
#[derive(Debug, Clone)]
pub struct TableSchema {
    fields: Vec<FieldSpec>,
    offsets: Vec<usize>,
    bitmap_bytes: usize,
    row_width: usize,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        if fields.is_empty() {
            return Err(DbsError::InvalidParameters("a table needs at least one field"));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty()
                || !field
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                || field.name.starts_with(|c: char| c.is_ascii_digit())
            {
                return Err(DbsError::InvalidParameters("invalid field name"));
            }
            if field.kind == TypeId::Undetermined {
                return Err(DbsError::InvalidParameters("field of undetermined type"));
            }
            if field.kind == TypeId::Text && field.is_array {
                return Err(DbsError::InvalidParameters("TEXT arrays are not supported"));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(DbsError::InvalidParameters("duplicate field name"));
            }
        }

        let bitmap_bytes = (fields.len() + 1).div_ceil(8);
        let mut offsets = Vec::with_capacity(fields.len());
        let mut at = bitmap_bytes;
        for field in &fields {
            offsets.push(at);
            at += Self::slot_width(field);
        }
        Ok(Self {
            fields,
            offsets,
            bitmap_bytes,
            row_width: at,
        })
    }

    fn slot_width(field: &FieldSpec) -> usize {
        if field.is_array || field.kind == TypeId::Text {
            VL_HANDLE_WIDTH
        } else {
            field.kind.stored_width()
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, index: FieldIndex) -> Result<&FieldSpec> {
        self.fields
            .get(index as usize)
            .ok_or(DbsError::FieldNotFound(index))
    }

    pub fn field_index(&self, name: &str) -> Result<FieldIndex> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as FieldIndex)
            .ok_or_else(|| DbsError::FieldNameNotFound(name.to_string()))
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    fn is_variable(&self, index: FieldIndex) -> bool {
        let field = &self.fields[index as usize];
        field.is_array || field.kind == TypeId::Text
    }
}

/// How a column's values pack into index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackedKind {
    Signed,
    Unsigned,
    Wide,
}

fn packed_kind(kind: TypeId) -> Option<PackedKind> {
    Some(match kind {
        TypeId::Int8 | TypeId::Int16 | TypeId::Int32 | TypeId::Int64 => PackedKind::Signed,
        TypeId::Date | TypeId::DateTime | TypeId::HiresTime => PackedKind::Signed,
        TypeId::Bool | TypeId::Char => PackedKind::Unsigned,
        TypeId::UInt8 | TypeId::UInt16 | TypeId::UInt32 | TypeId::UInt64 => PackedKind::Unsigned,
        TypeId::Real | TypeId::RichReal => PackedKind::Wide,
        TypeId::Text | TypeId::Undetermined => return None,
    })
}

fn pack_signed(value: &Scalar) -> Option<i64> {
    if value.is_null() {
        return None;
    }
    Some(match *value {
        Scalar::Date(Some(d)) => d.to_days(),
        Scalar::DateTime(Some(t)) => t.to_seconds(),
        Scalar::HiresTime(Some(t)) => t.to_micros(),
        _ => value.to_i64().ok().flatten().expect("signed packable"),
    })
}

fn pack_unsigned(value: &Scalar) -> Option<u64> {
    if value.is_null() {
        return None;
    }
    Some(match *value {
        Scalar::Bool(Some(b)) => u64::from(b),
        Scalar::Char(Some(c)) => u64::from(u32::from(c)),
        _ => value.to_u64().ok().flatten().expect("unsigned packable"),
    })
}

fn pack_wide(value: &Scalar) -> Option<i128> {
    match *value {
        Scalar::Real(r) | Scalar::RichReal(r) => r.map(|r| r.scaled_total()),
        _ => None,
    }
}

enum ColumnIndex {
    Signed(BTree<i64, FileNodeManager<i64>>),
    Unsigned(BTree<u64, FileNodeManager<u64>>),
    Wide(BTree<i128, FileNodeManager<i128>>),
}

struct TableInner {
    rows: BlockCache<FileItemsManager>,
    header_file: std::fs::File,
    row_count: u64,
    vl: VariableSizeStore,
    indexes: Vec<Option<ColumnIndex>>,
}

pub struct Table {
    name: String,
    schema: TableSchema,
    dir: PathBuf,
    cfg: StorageConfig,
    persistent: bool,
    inner: RwLock<TableInner>,
}

/// Progress callback for index builds: `(rows done, rows total)`, fired at
/// every whole percent.
pub type IndexProgress<'a> = &'a mut dyn FnMut(u64, u64);

impl Table {
    fn data_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.wt"))
    }

    fn vl_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.wv"))
    }

    fn index_path(dir: &Path, name: &str, field: FieldIndex) -> PathBuf {
        dir.join(format!("{name}.wi{field}"))
    }

    pub(crate) fn create(
        dir: &Path,
        name: &str,
        fields: Vec<FieldSpec>,
        cfg: StorageConfig,
        persistent: bool,
    ) -> Result<Self> {
        let schema = TableSchema::new(fields)?;
        let path = Self::data_path(dir, name);
        if path.exists() {
            return Err(DbsError::TableExists(name.to_string()));
        }
        let table = Self::build(dir, name, schema, cfg, persistent, 0, &path, true)?;
        table.write_header()?;
        Ok(table)
    }

    pub(crate) fn open(dir: &Path, name: &str, cfg: StorageConfig) -> Result<Self> {
        use std::io::Read;

        let path = Self::data_path(dir, name);
        let mut file = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DbsError::TableNotFound(name.to_string())
            } else {
                DbsError::from(e)
            }
        })?;
        // The header and field list always fit well below this.
        let mut bytes = Vec::new();
        file.by_ref().take(64 * 1024).read_to_end(&mut bytes)?;
        drop(file);
        let mut r = Reader::new(&bytes);
        if r.bytes(4)? != TABLE_MAGIC {
            return Err(DbsError::StoreCorrupted("bad table magic"));
        }
        if r.u16()? != TABLE_VERSION {
            return Err(DbsError::StoreCorrupted("unsupported table version"));
        }
        r.u16()?; // reserved
        let row_count = r.u64()?;
        let descriptor = &bytes[r.offset()..];
        let (descriptor, _) = TypeDescriptor::parse(descriptor)?;
        let TypeDescriptor::Table(fields) = descriptor else {
            return Err(DbsError::StoreCorrupted("table header without field list"));
        };
        let schema = TableSchema::new(fields)?;
        Self::build(dir, name, schema, cfg, true, row_count, &path, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        dir: &Path,
        name: &str,
        schema: TableSchema,
        cfg: StorageConfig,
        persistent: bool,
        row_count: u64,
        path: &Path,
        truncate: bool,
    ) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        let header_file = file.try_clone()?;
        let rows = BlockCache::new(
            FileItemsManager::new(file, schema.row_width(), Self::rows_offset(&schema)),
            schema.row_width(),
            cfg.table_block_size,
            cfg.table_block_count,
        )?;
        let vl = VariableSizeStore::open(
            &Self::vl_path(dir, name),
            cfg.vl_granule,
            cfg.vl_block_size,
            cfg.vl_block_count,
        )?;

        let mut indexes = Vec::with_capacity(schema.fields().len());
        for field in 0..schema.fields().len() as FieldIndex {
            let index_path = Self::index_path(dir, name, field);
            if index_path.exists() {
                indexes.push(Some(Self::open_index(
                    &schema, field, &index_path, &cfg,
                )?));
            } else {
                indexes.push(None);
            }
        }

        Ok(Self {
            name: name.to_string(),
            schema,
            dir: dir.to_path_buf(),
            cfg,
            persistent,
            inner: RwLock::new(TableInner {
                rows,
                header_file,
                row_count,
                vl,
                indexes,
            }),
        })
    }

    fn open_index(
        schema: &TableSchema,
        field: FieldIndex,
        path: &Path,
        cfg: &StorageConfig,
    ) -> Result<ColumnIndex> {
        let kind = schema.field(field)?.kind;
        let packed = packed_kind(kind)
            .ok_or(DbsError::InvalidParameters("field type is not indexable"))?;
        Ok(match packed {
            PackedKind::Signed => ColumnIndex::Signed(BTree::new(FileNodeManager::open(
                path,
                cfg.index_node_size,
                cfg.index_block_count,
            )?)?),
            PackedKind::Unsigned => ColumnIndex::Unsigned(BTree::new(FileNodeManager::open(
                path,
                cfg.index_node_size,
                cfg.index_block_count,
            )?)?),
            PackedKind::Wide => ColumnIndex::Wide(BTree::new(FileNodeManager::open(
                path,
                cfg.index_node_size,
                cfg.index_block_count,
            )?)?),
        })
    }

    fn rows_offset(schema: &TableSchema) -> u64 {
        let header = 16 + TypeDescriptor::Table(schema.fields().to_vec()).serialize().len();
        (header as u64).div_ceil(512) * 512
    }

    fn write_header(&self) -> Result<()> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        self.write_header_locked(&inner)
    }

    fn write_header_locked(&self, inner: &TableInner) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        let mut w = Writer::new();
        w.bytes(TABLE_MAGIC);
        w.u16(TABLE_VERSION);
        w.u16(0);
        w.u64(inner.row_count);
        w.bytes(&TypeDescriptor::Table(self.schema.fields().to_vec()).serialize());
        let mut file = &inner.header_file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(w.as_bytes())?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn allocated_rows(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).row_count
    }

    pub fn field_by_name(&self, name: &str) -> Result<FieldIndex> {
        self.schema.field_index(name)
    }

    /// Append a fresh all-null row and return its id.
    pub fn add_row(&self) -> Result<RowId> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.row_count >= self.cfg.max_rows_per_table {
            return Err(DbsError::QuotaExceeded(self.cfg.max_rows_per_table));
        }
        let row = inner.row_count;
        let mut bytes = vec![0u8; self.schema.row_width()];
        for field in 0..self.schema.fields().len() {
            bytes[field / 8] |= 1 << (field % 8);
        }
        inner.rows.retrieve_item(row)?.write(&bytes);
        inner.row_count += 1;

        for field in 0..self.schema.fields().len() as FieldIndex {
            Self::index_insert_null(&mut inner, field, row)?;
        }
        Ok(row)
    }

    fn index_insert_null(inner: &mut TableInner, field: FieldIndex, row: RowId) -> Result<()> {
        match inner.indexes.get_mut(field as usize).and_then(|i| i.as_mut()) {
            Some(ColumnIndex::Signed(tree)) => tree.insert(Key::new(None, row)),
            Some(ColumnIndex::Unsigned(tree)) => tree.insert(Key::new(None, row)),
            Some(ColumnIndex::Wide(tree)) => tree.insert(Key::new(None, row)),
            None => Ok(()),
        }
    }

    pub fn mark_row_removed(&self, row: RowId) -> Result<()> {
        let inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        self.check_row(&inner, row)?;
        let removed_bit = self.schema.fields().len();
        let item = inner.rows.retrieve_item(row)?;
        let mut byte = [0u8];
        item.with_bytes(|b| byte[0] = b[removed_bit / 8]);
        byte[0] |= 1 << (removed_bit % 8);
        item.write_at(removed_bit / 8, &byte);
        Ok(())
    }

    pub fn is_row_removed(&self, row: RowId) -> Result<bool> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        self.check_row(&inner, row)?;
        Self::row_removed_locked(&self.schema, &inner, row)
    }

    fn row_removed_locked(schema: &TableSchema, inner: &TableInner, row: RowId) -> Result<bool> {
        let removed_bit = schema.fields().len();
        let item = inner.rows.retrieve_item(row)?;
        Ok(item.with_bytes(|b| b[removed_bit / 8] & (1 << (removed_bit % 8)) != 0))
    }

    fn check_row(&self, inner: &TableInner, row: RowId) -> Result<()> {
        if row >= inner.row_count {
            return Err(DbsError::RowOutOfRange {
                row,
                allocated: inner.row_count,
            });
        }
        Ok(())
    }

    /// Read a column value; nulls come back as the typed null.
    pub fn get(&self, row: RowId, field: FieldIndex) -> Result<Value> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        self.check_row(&inner, row)?;
        let spec = self.schema.field(field)?;
        let item = inner.rows.retrieve_item(row)?;
        let is_null =
            item.with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);

        if spec.is_array {
            if is_null {
                return Ok(Value::Array(spec.kind, None));
            }
            let (extent, count) = Self::read_handle(&item, self.schema.offsets[field as usize]);
            let width = spec.kind.stored_width() as u64;
            let bytes = inner.vl.read(extent, 0, (count * width) as usize)?;
            return Ok(Value::Array(
                spec.kind,
                Some(ArrayValue::deserialize(spec.kind, &bytes)?),
            ));
        }
        if spec.kind == TypeId::Text {
            if is_null {
                return Ok(Value::Text(None));
            }
            let (extent, len) = Self::read_handle(&item, self.schema.offsets[field as usize]);
            let bytes = inner.vl.read(extent, 0, len as usize)?;
            let text = String::from_utf8(bytes)
                .map_err(|_| DbsError::StoreCorrupted("TEXT payload is not UTF-8"))?;
            return Ok(Value::Text(Some(text)));
        }

        if is_null {
            return Ok(Value::Scalar(
                Scalar::null_of(spec.kind).expect("scalar field"),
            ));
        }
        let offset = self.schema.offsets[field as usize];
        let scalar = item.with_bytes(|b| {
            let mut r = Reader::new(&b[offset..offset + spec.kind.stored_width()]);
            Scalar::read_stored(spec.kind, &mut r)
        })?;
        Ok(Value::Scalar(scalar))
    }

    fn read_handle(item: &crate::cache::CachedItem, offset: usize) -> (u64, u64) {
        item.with_bytes(|b| (load_le_u64(&b[offset..]), load_le_u64(&b[offset + 8..])))
    }

    /// Store a column value, releasing any extent the old value held and
    /// keeping the field's index in step.
    pub fn set(&self, row: RowId, field: FieldIndex, value: &Value) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        self.check_row(&inner, row)?;
        let spec = self.schema.field(field)?.clone();
        let offset = self.schema.offsets[field as usize];

        // Old scalar for the index maintenance below.
        let old_scalar = if !self.schema.is_variable(field) {
            let item = inner.rows.retrieve_item(row)?;
            let was_null =
                item.with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);
            if was_null {
                Scalar::null_of(spec.kind)
            } else {
                Some(item.with_bytes(|b| {
                    let mut r = Reader::new(&b[offset..offset + spec.kind.stored_width()]);
                    Scalar::read_stored(spec.kind, &mut r)
                })?)
            }
        } else {
            None
        };

        match value {
            Value::Scalar(scalar) => {
                if spec.is_array || spec.kind == TypeId::Text {
                    return Err(DbsError::FieldTypeMismatch {
                        field,
                        stored: spec.kind,
                        requested: scalar.kind(),
                    });
                }
                let scalar = scalar.cast(spec.kind).map_err(|_| DbsError::FieldTypeMismatch {
                    field,
                    stored: spec.kind,
                    requested: scalar.kind(),
                })?;
                let item = inner.rows.retrieve_item(row)?;
                if scalar.is_null() {
                    Self::set_null_bit(&item, field, true);
                } else {
                    let mut w = Writer::new();
                    scalar.write_stored(&mut w);
                    item.write_at(offset, w.as_bytes());
                    Self::set_null_bit(&item, field, false);
                }
                drop(item);
                Self::index_replace(&mut inner, field, row, old_scalar.as_ref(), &scalar)?;
            }
            Value::Text(text) => {
                if spec.kind != TypeId::Text || spec.is_array {
                    return Err(DbsError::FieldTypeMismatch {
                        field,
                        stored: spec.kind,
                        requested: TypeId::Text,
                    });
                }
                self.replace_variable(&mut inner, row, field, text.as_ref().map(|t| t.as_bytes()))?;
            }
            Value::Array(elem, array) => {
                if !spec.is_array {
                    return Err(DbsError::FieldTypeMismatch {
                        field,
                        stored: spec.kind,
                        requested: *elem,
                    });
                }
                let payload = match array {
                    None => None,
                    Some(array) => {
                        if array.elem_kind() != spec.kind {
                            let mut cast = ArrayValue::new(spec.kind)?;
                            for item in array.items() {
                                cast.push(*item)?;
                            }
                            Some(cast.serialize())
                        } else {
                            Some(array.serialize())
                        }
                    }
                };
                self.replace_variable(&mut inner, row, field, payload.as_deref())?;
            }
        }
        Ok(())
    }

    fn set_null_bit(item: &crate::cache::CachedItem, field: FieldIndex, null: bool) {
        let byte_at = field as usize / 8;
        let mut byte = [0u8];
        item.with_bytes(|b| byte[0] = b[byte_at]);
        if null {
            byte[0] |= 1 << (field as usize % 8);
        } else {
            byte[0] &= !(1 << (field as usize % 8));
        }
        item.write_at(byte_at, &byte);
    }

    fn replace_variable(
        &self,
        inner: &mut TableInner,
        row: RowId,
        field: FieldIndex,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let offset = self.schema.offsets[field as usize];
        let item = inner.rows.retrieve_item(row)?;
        let was_null =
            item.with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);
        let (old_extent, _) = Self::read_handle(&item, offset);

        match payload {
            None => {
                Self::set_null_bit(&item, field, true);
                let mut zero = [0u8; VL_HANDLE_WIDTH];
                store_le_u64(0, &mut zero[0..]);
                item.write_at(offset, &zero);
            }
            Some(bytes) => {
                let extent = inner.vl.allocate(bytes.len() as u64)?;
                if !bytes.is_empty() {
                    inner.vl.store(extent, 0, bytes)?;
                }
                let spec = &self.schema.fields()[field as usize];
                let length = if spec.is_array {
                    bytes.len() as u64 / spec.kind.stored_width() as u64
                } else {
                    bytes.len() as u64
                };
                let mut handle = [0u8; VL_HANDLE_WIDTH];
                store_le_u64(extent, &mut handle[0..]);
                store_le_u64(length, &mut handle[8..]);
                item.write_at(offset, &handle);
                Self::set_null_bit(&item, field, false);
            }
        }
        drop(item);

        if !was_null && old_extent != 0 {
            inner.vl.dec_ref(old_extent)?;
        }
        Ok(())
    }

    fn index_replace(
        inner: &mut TableInner,
        field: FieldIndex,
        row: RowId,
        old: Option<&Scalar>,
        new: &Scalar,
    ) -> Result<()> {
        match inner.indexes.get_mut(field as usize).and_then(|i| i.as_mut()) {
            Some(ColumnIndex::Signed(tree)) => {
                if let Some(old) = old {
                    tree.remove(Key::new(pack_signed(old), row))?;
                }
                tree.insert(Key::new(pack_signed(new), row))
            }
            Some(ColumnIndex::Unsigned(tree)) => {
                if let Some(old) = old {
                    tree.remove(Key::new(pack_unsigned(old), row))?;
                }
                tree.insert(Key::new(pack_unsigned(new), row))
            }
            Some(ColumnIndex::Wide(tree)) => {
                if let Some(old) = old {
                    tree.remove(Key::new(pack_wide(old), row))?;
                }
                tree.insert(Key::new(pack_wide(new), row))
            }
            None => Ok(()),
        }
    }

    pub fn has_field_index(&self, field: FieldIndex) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .indexes
            .get(field as usize)
            .map(|i| i.is_some())
            .unwrap_or(false)
    }

    /// Build a B+tree over every live row of the field. The optional
    /// callback fires at each whole percent of progress.
    pub fn create_field_index(
        &self,
        field: FieldIndex,
        mut progress: Option<IndexProgress<'_>>,
    ) -> Result<()> {
        let spec = self.schema.field(field)?.clone();
        if spec.is_array || packed_kind(spec.kind).is_none() {
            return Err(DbsError::InvalidParameters("field type is not indexable"));
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.indexes[field as usize].is_some() {
            return Err(DbsError::GeneralControlError("field is already indexed"));
        }

        let path = Self::index_path(&self.dir, &self.name, field);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let mut index = Self::open_index(&self.schema, field, &path, &self.cfg)?;

        let total = inner.row_count;
        let mut last_percent = 0u64;
        for row in 0..total {
            if Self::row_removed_locked(&self.schema, &inner, row)? {
                continue;
            }
            let item = inner.rows.retrieve_item(row)?;
            let is_null =
                item.with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);
            let scalar = if is_null {
                Scalar::null_of(spec.kind).expect("scalar field")
            } else {
                let offset = self.schema.offsets[field as usize];
                item.with_bytes(|b| {
                    let mut r = Reader::new(&b[offset..offset + spec.kind.stored_width()]);
                    Scalar::read_stored(spec.kind, &mut r)
                })?
            };
            drop(item);
            match &mut index {
                ColumnIndex::Signed(tree) => tree.insert(Key::new(pack_signed(&scalar), row))?,
                ColumnIndex::Unsigned(tree) => {
                    tree.insert(Key::new(pack_unsigned(&scalar), row))?
                }
                ColumnIndex::Wide(tree) => tree.insert(Key::new(pack_wide(&scalar), row))?,
            }
            if let Some(callback) = progress.as_mut() {
                let percent = (row + 1) * 100 / total.max(1);
                if percent > last_percent {
                    last_percent = percent;
                    callback(row + 1, total);
                }
            }
        }

        inner.indexes[field as usize] = Some(index);
        Ok(())
    }

    pub fn remove_field_index(&self, field: FieldIndex) -> Result<()> {
        self.schema.field(field)?;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.indexes[field as usize].take().is_none() {
            return Err(DbsError::GeneralControlError("field is not indexed"));
        }
        std::fs::remove_file(Self::index_path(&self.dir, &self.name, field))?;
        Ok(())
    }

    /// Row ids in `[from_row, to_row]` whose value falls in `[lo, hi]` and
    /// whose id falls in `[lo_row, hi_row]`, ascending by id. Removed rows
    /// never match. Null bounds on both ends select the null bucket; a
    /// single null bound is an open end.
    #[allow(clippy::too_many_arguments)]
    pub fn match_rows(
        &self,
        lo: &Scalar,
        hi: &Scalar,
        lo_row: RowId,
        hi_row: RowId,
        from_row: RowId,
        to_row: RowId,
        field: FieldIndex,
    ) -> Result<Vec<RowId>> {
        let spec = self.schema.field(field)?.clone();
        if spec.is_array || packed_kind(spec.kind).is_none() {
            return Err(DbsError::InvalidParameters("field type does not support matching"));
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let last = inner.row_count.saturating_sub(1);
        let row_lo = lo_row.max(from_row);
        let row_hi = hi_row.min(to_row).min(last);
        if inner.row_count == 0 || row_lo > row_hi {
            return Ok(Vec::new());
        }

        let lo = lo.cast(spec.kind)?;
        let hi = hi.cast(spec.kind)?;
        let nulls_only = lo.is_null() && hi.is_null();

        let mut rows = match inner.indexes.get(field as usize).and_then(|i| i.as_ref()) {
            Some(ColumnIndex::Signed(tree)) => {
                Self::index_matches(tree, pack_signed(&lo), pack_signed(&hi), nulls_only)?
            }
            Some(ColumnIndex::Unsigned(tree)) => {
                Self::index_matches(tree, pack_unsigned(&lo), pack_unsigned(&hi), nulls_only)?
            }
            Some(ColumnIndex::Wide(tree)) => {
                Self::index_matches(tree, pack_wide(&lo), pack_wide(&hi), nulls_only)?
            }
            None => {
                let mut rows = Vec::new();
                for row in row_lo..=row_hi {
                    let item = inner.rows.retrieve_item(row)?;
                    let is_null = item
                        .with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);
                    let matched = if nulls_only {
                        is_null
                    } else if is_null {
                        false
                    } else {
                        let offset = self.schema.offsets[field as usize];
                        let scalar = item.with_bytes(|b| {
                            let mut r =
                                Reader::new(&b[offset..offset + spec.kind.stored_width()]);
                            Scalar::read_stored(spec.kind, &mut r)
                        })?;
                        let above = lo.is_null()
                            || scalar.compare(&lo)? != Some(std::cmp::Ordering::Less);
                        let below = hi.is_null()
                            || scalar.compare(&hi)? != Some(std::cmp::Ordering::Greater);
                        above && below
                    };
                    if matched {
                        rows.push(row);
                    }
                }
                rows
            }
        };

        rows.retain(|&row| (row_lo..=row_hi).contains(&row));
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            if !Self::row_removed_locked(&self.schema, &inner, row)? {
                live.push(row);
            }
        }
        live.sort_unstable();
        Ok(live)
    }

    fn index_matches<V: KeyPart, M: crate::btree::NodeManager<V>>(
        tree: &BTree<V, M>,
        lo: Option<V>,
        hi: Option<V>,
        nulls_only: bool,
    ) -> Result<Vec<RowId>> {
        let (lo_key, hi_key) = if nulls_only {
            (Key::new(None, 0), Key::new(None, u64::MAX))
        } else {
            let lo_key = Key::new(Some(lo.unwrap_or(V::MIN_VALUE)), 0);
            let hi_key = Key::new(Some(hi.unwrap_or(V::MAX_VALUE)), u64::MAX);
            (lo_key, hi_key)
        };
        let mut rows = Vec::new();
        tree.for_each_in_range(&lo_key, &hi_key, |key| {
            rows.push(key.row);
            true
        })?;
        Ok(rows)
    }

    /// Flush caches and persist table metadata, payloads and indexes.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.rows.flush()?;
        inner.rows.manager().sync()?;
        inner.vl.sync()?;
        for index in inner.indexes.iter_mut().flatten() {
            match index {
                ColumnIndex::Signed(tree) => tree.sync()?,
                ColumnIndex::Unsigned(tree) => tree.sync()?,
                ColumnIndex::Wide(tree) => tree.sync()?,
            }
        }
        self.write_header_locked(&inner)?;
        Ok(())
    }

    /// Live extent ids referenced by rows, for refcount audits.
    pub fn referenced_extents(&self) -> Result<Vec<u64>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut extents = Vec::new();
        for row in 0..inner.row_count {
            for field in 0..self.schema.fields().len() as FieldIndex {
                if !self.schema.is_variable(field) {
                    continue;
                }
                let item = inner.rows.retrieve_item(row)?;
                let is_null = item
                    .with_bytes(|b| b[field as usize / 8] & (1 << (field as usize % 8)) != 0);
                if !is_null {
                    let (extent, _) =
                        Self::read_handle(&item, self.schema.offsets[field as usize]);
                    extents.push(extent);
                }
            }
        }
        extents.sort_unstable();
        Ok(extents)
    }

    pub fn live_store_extents(&self) -> Vec<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.vl.live_extents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use whais_core::value::DateTime;

    fn small_cfg() -> StorageConfig {
        StorageConfig {
            table_block_size: 256,
            table_block_count: 8,
            vl_granule: 32,
            vl_block_size: 256,
            vl_block_count: 8,
            index_node_size: 256,
            index_block_count: 16,
            ..StorageConfig::default()
        }
    }

    fn sample_table(dir: &Path) -> Table {
        Table::create(
            dir,
            "events",
            vec![
                FieldSpec::new("stamp", TypeId::DateTime, false),
                FieldSpec::new("count", TypeId::UInt32, false),
                FieldSpec::new("note", TypeId::Text, false),
                FieldSpec::new("readings", TypeId::Int16, true),
            ],
            small_cfg(),
            true,
        )
        .unwrap()
    }

    fn stamp(day: u8, hour: u8) -> Scalar {
        Scalar::DateTime(Some(DateTime::new(2020, 3, day, hour, 0, 0).unwrap()))
    }

    #[test]
    fn schema_rejects_bad_shapes() {
        assert!(TableSchema::new(vec![]).is_err());
        assert!(TableSchema::new(vec![FieldSpec::new("t", TypeId::Text, true)]).is_err());
        assert!(
            TableSchema::new(vec![
                FieldSpec::new("a", TypeId::Bool, false),
                FieldSpec::new("a", TypeId::Int8, false),
            ])
            .is_err()
        );
        assert!(TableSchema::new(vec![FieldSpec::new("9lives", TypeId::Bool, false)]).is_err());
    }

    #[test]
    fn new_rows_start_null_and_accept_values() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let row = table.add_row().unwrap();
        assert_eq!(table.allocated_rows(), 1);
        assert!(table.get(row, 0).unwrap().is_null());
        assert!(table.get(row, 2).unwrap().is_null());

        table.set(row, 0, &Value::Scalar(stamp(5, 12))).unwrap();
        table
            .set(row, 1, &Value::Scalar(Scalar::UInt8(Some(7))))
            .unwrap();
        table
            .set(row, 2, &Value::Text(Some("first event".into())))
            .unwrap();
        let mut readings = ArrayValue::new(TypeId::Int16).unwrap();
        for v in [-3i16, 0, 12] {
            readings.push(Scalar::Int16(Some(v))).unwrap();
        }
        table
            .set(row, 3, &Value::Array(TypeId::Int16, Some(readings.clone())))
            .unwrap();

        assert_eq!(table.get(row, 0).unwrap(), Value::Scalar(stamp(5, 12)));
        // UInt8 widened into the declared UInt32 column type.
        assert_eq!(
            table.get(row, 1).unwrap(),
            Value::Scalar(Scalar::UInt32(Some(7)))
        );
        assert_eq!(
            table.get(row, 2).unwrap(),
            Value::Text(Some("first event".into()))
        );
        assert_eq!(
            table.get(row, 3).unwrap(),
            Value::Array(TypeId::Int16, Some(readings))
        );
    }

    #[test]
    fn type_mismatches_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let row = table.add_row().unwrap();
        assert!(matches!(
            table.set(row, 1, &Value::Text(Some("oops".into()))),
            Err(DbsError::FieldTypeMismatch { .. })
        ));
        assert!(matches!(
            table.set(row, 0, &Value::Scalar(Scalar::Bool(Some(true)))),
            Err(DbsError::FieldTypeMismatch { .. })
        ));
    }

    #[test]
    fn replacing_payloads_releases_extents() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let row = table.add_row().unwrap();

        table
            .set(row, 2, &Value::Text(Some("old text".into())))
            .unwrap();
        table
            .set(row, 2, &Value::Text(Some("new text".into())))
            .unwrap();
        assert_eq!(table.referenced_extents().unwrap(), table.live_store_extents());

        // Setting null frees the extent entirely.
        table.set(row, 2, &Value::Text(None)).unwrap();
        assert!(table.live_store_extents().is_empty());
        assert!(table.get(row, 2).unwrap().is_null());
    }

    #[test]
    fn empty_text_is_distinct_from_null() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let row = table.add_row().unwrap();
        table.set(row, 2, &Value::Text(Some(String::new()))).unwrap();
        assert_eq!(table.get(row, 2).unwrap(), Value::Text(Some(String::new())));
        assert_eq!(table.live_store_extents().len(), 1);
    }

    fn populate(table: &Table, rows: u64) {
        for i in 0..rows {
            let row = table.add_row().unwrap();
            if i % 5 == 0 {
                continue; // leave the stamp null
            }
            let day = (i % 27 + 1) as u8;
            let hour = (i % 24) as u8;
            table.set(row, 0, &Value::Scalar(stamp(day, hour))).unwrap();
        }
    }

    #[test]
    fn match_rows_with_and_without_index_agree() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        populate(&table, 400);
        table.mark_row_removed(3).unwrap();

        let lo = stamp(10, 0);
        let hi = stamp(20, 23);
        let null = Scalar::DateTime(None);
        let scanned = table
            .match_rows(&lo, &hi, 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();
        let scanned_nulls = table
            .match_rows(&null, &null, 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();

        let mut calls = 0u64;
        let mut cb = |_done: u64, _total: u64| calls += 1;
        table.create_field_index(0, Some(&mut cb)).unwrap();
        assert!(calls >= 99, "progress fired {calls} times");

        let indexed = table
            .match_rows(&lo, &hi, 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();
        let indexed_nulls = table
            .match_rows(&null, &null, 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();

        assert_eq!(scanned, indexed);
        assert_eq!(scanned_nulls, indexed_nulls);
        assert!(!scanned.is_empty());
        assert!(scanned_nulls.iter().all(|r| r % 5 == 0 && *r != 3));
        assert!(scanned.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn index_tracks_updates() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        populate(&table, 100);
        table.create_field_index(0, None).unwrap();

        // Move row 7 far outside the old range and verify both queries.
        table.set(7, 0, &Value::Scalar(stamp(27, 23))).unwrap();
        let top = table
            .match_rows(&stamp(27, 23), &stamp(27, 23), 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();
        assert!(top.contains(&7));

        table
            .set(7, 0, &Value::Scalar(Scalar::DateTime(None)))
            .unwrap();
        let null = Scalar::DateTime(None);
        let nulls = table
            .match_rows(&null, &null, 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();
        assert!(nulls.contains(&7));
    }

    #[test]
    fn row_window_limits_matches() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        for _ in 0..50 {
            let row = table.add_row().unwrap();
            table
                .set(row, 1, &Value::Scalar(Scalar::UInt32(Some(1))))
                .unwrap();
        }
        let one = Scalar::UInt32(Some(1));
        let rows = table.match_rows(&one, &one, 10, 40, 20, u64::MAX, 1).unwrap();
        assert_eq!(rows.first(), Some(&20));
        assert_eq!(rows.last(), Some(&40));
        assert_eq!(rows.len(), 21);
    }

    #[test]
    fn table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = sample_table(dir.path());
            populate(&table, 40);
            table.create_field_index(0, None).unwrap();
            table.set(0, 2, &Value::Text(Some("kept".into()))).unwrap();
            table.sync().unwrap();
        }
        let table = Table::open(dir.path(), "events", small_cfg()).unwrap();
        assert_eq!(table.allocated_rows(), 40);
        assert!(table.has_field_index(0));
        assert_eq!(table.get(0, 2).unwrap(), Value::Text(Some("kept".into())));
        let rows = table
            .match_rows(&stamp(1, 0), &stamp(27, 23), 0, u64::MAX, 0, u64::MAX, 0)
            .unwrap();
        assert!(!rows.is_empty());
    }

    #[test]
    fn row_quota_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            max_rows_per_table: 3,
            ..small_cfg()
        };
        let table = Table::create(
            dir.path(),
            "bounded",
            vec![FieldSpec::new("v", TypeId::Int32, false)],
            cfg,
            true,
        )
        .unwrap();
        for _ in 0..3 {
            table.add_row().unwrap();
        }
        assert!(matches!(table.add_row(), Err(DbsError::QuotaExceeded(3))));
    }

    #[test]
    fn temporary_tables_clean_up_their_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = Table::create(
                dir.path(),
                "scratch",
                vec![FieldSpec::new("v", TypeId::Int32, false)],
                small_cfg(),
                false,
            )
            .unwrap();
            table.add_row().unwrap();
            table.sync().unwrap();
        }
        assert!(!dir.path().join("scratch.wt").exists());
        assert!(!dir.path().join("scratch.wv").exists());
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.persistent {
            return;
        }
        // Temporary table: best-effort cleanup of its backing files.
        let _ = std::fs::remove_file(Self::data_path(&self.dir, &self.name));
        let _ = std::fs::remove_file(Self::vl_path(&self.dir, &self.name));
        let _ = std::fs::remove_file(
            Self::vl_path(&self.dir, &self.name).with_extension("wv.map"),
        );
        for field in 0..self.schema.fields().len() as FieldIndex {
            let _ = std::fs::remove_file(Self::index_path(&self.dir, &self.name, field));
        }
    }
}
