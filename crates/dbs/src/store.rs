//! Variable-size store backing TEXT and ARRAY payloads.
//!
//! Payloads live in reference-counted extents carved out of a granule
//! file; a block cache sits between the store and the file. The extent
//! table and the free list persist in a companion metadata file written at
//! every `sync`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ahash::AHashMap;
use whais_core::ExtentId;
use whais_core::endian::{Reader, Writer};

use crate::cache::{BlockCache, FileItemsManager};
use crate::errors::{DbsError, Result};

const META_MAGIC: &[u8; 4] = b"WVL0";

#[derive(Debug, Clone, Copy)]
struct Extent {
    start: u64,
    size: u64,
    granules: u64,
    refs: u32,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u64,
    granules: u64,
}

struct StoreState {
    extents: AHashMap<ExtentId, Extent>,
    free: Vec<Span>,
    next_id: ExtentId,
    next_granule: u64,
}

pub struct VariableSizeStore {
    cache: BlockCache<FileItemsManager>,
    granule: usize,
    meta_path: PathBuf,
    state: Mutex<StoreState>,
}

impl VariableSizeStore {
    /// Open or create the store rooted at `data_path` (metadata lives next
    /// to it with a `.map` suffix appended).
    pub fn open(data_path: &Path, granule: usize, block_size: usize, block_count: usize) -> Result<Self> {
        if granule == 0 {
            return Err(DbsError::InvalidParameters("granule size must be non-zero"));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(data_path)?;
        let cache = BlockCache::new(
            FileItemsManager::new(file, granule, 0),
            granule,
            block_size,
            block_count,
        )?;

        let meta_path = data_path.with_extension(
            data_path
                .extension()
                .map(|e| format!("{}.map", e.to_string_lossy()))
                .unwrap_or_else(|| "map".into()),
        );
        let state = match std::fs::read(&meta_path) {
            Ok(bytes) => Self::parse_meta(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState {
                extents: AHashMap::new(),
                free: Vec::new(),
                next_id: 1,
                next_granule: 0,
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            cache,
            granule,
            meta_path,
            state: Mutex::new(state),
        })
    }

    fn parse_meta(bytes: &[u8]) -> Result<StoreState> {
        let mut r = Reader::new(bytes);
        if r.bytes(4)? != META_MAGIC {
            return Err(DbsError::StoreCorrupted("bad metadata magic"));
        }
        let next_id = r.u64()?;
        let next_granule = r.u64()?;
        let extent_count = r.u32()? as usize;
        let mut extents = AHashMap::with_capacity(extent_count);
        for _ in 0..extent_count {
            let id = r.u64()?;
            let extent = Extent {
                start: r.u64()?,
                size: r.u64()?,
                granules: r.u64()?,
                refs: r.u32()?,
            };
            extents.insert(id, extent);
        }
        let free_count = r.u32()? as usize;
        let mut free = Vec::with_capacity(free_count);
        for _ in 0..free_count {
            free.push(Span {
                start: r.u64()?,
                granules: r.u64()?,
            });
        }
        Ok(StoreState {
            extents,
            free,
            next_id,
            next_granule,
        })
    }

    fn granules_for(&self, size: u64) -> u64 {
        size.div_ceil(self.granule as u64).max(1)
    }

    /// Allocate an extent of `size` bytes with an initial reference count
    /// of one.
    pub fn allocate(&self, size: u64) -> Result<ExtentId> {
        let granules = self.granules_for(size);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // First fit over the free list.
        let start = match state
            .free
            .iter()
            .position(|span| span.granules >= granules)
        {
            Some(pos) => {
                let span = state.free[pos];
                if span.granules == granules {
                    state.free.remove(pos);
                } else {
                    state.free[pos] = Span {
                        start: span.start + granules,
                        granules: span.granules - granules,
                    };
                }
                span.start
            }
            None => {
                let start = state.next_granule;
                state.next_granule += granules;
                start
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        state.extents.insert(
            id,
            Extent {
                start,
                size,
                granules,
                refs: 1,
            },
        );
        Ok(id)
    }

    fn extent(&self, id: ExtentId) -> Result<Extent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .extents
            .get(&id)
            .copied()
            .ok_or(DbsError::UnknownExtent(id))
    }

    /// Write `bytes` into the extent starting at byte `offset`; grows the
    /// extent size (within its granule capacity) when writing past the end.
    pub fn store(&self, id: ExtentId, offset: u64, bytes: &[u8]) -> Result<()> {
        let extent = self.extent(id)?;
        let end = offset + bytes.len() as u64;
        if end > extent.granules * self.granule as u64 {
            return Err(DbsError::InvalidParameters("write past extent capacity"));
        }

        let mut written = 0usize;
        while written < bytes.len() {
            let at = offset + written as u64;
            let granule_id = extent.start + at / self.granule as u64;
            let in_granule = (at % self.granule as u64) as usize;
            let chunk = (self.granule - in_granule).min(bytes.len() - written);
            let item = self.cache.retrieve_item(granule_id)?;
            item.write_at(in_granule, &bytes[written..written + chunk]);
            written += chunk;
        }

        if end > extent.size {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(e) = state.extents.get_mut(&id) {
                e.size = end;
            }
        }
        Ok(())
    }

    /// Read `len` bytes starting at byte `offset`.
    pub fn read(&self, id: ExtentId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let extent = self.extent(id)?;
        if offset + len as u64 > extent.size {
            return Err(DbsError::InvalidParameters("read past extent size"));
        }
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let at = offset + done as u64;
            let granule_id = extent.start + at / self.granule as u64;
            let in_granule = (at % self.granule as u64) as usize;
            let chunk = (self.granule - in_granule).min(len - done);
            let item = self.cache.retrieve_item(granule_id)?;
            item.with_bytes(|data| {
                out[done..done + chunk].copy_from_slice(&data[in_granule..in_granule + chunk]);
            });
            done += chunk;
        }
        Ok(out)
    }

    pub fn extent_size(&self, id: ExtentId) -> Result<u64> {
        Ok(self.extent(id)?.size)
    }

    pub fn truncate(&self, id: ExtentId, new_size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let extent = state
            .extents
            .get_mut(&id)
            .ok_or(DbsError::UnknownExtent(id))?;
        if new_size > extent.size {
            return Err(DbsError::InvalidParameters("truncate cannot grow an extent"));
        }
        extent.size = new_size;
        Ok(())
    }

    pub fn inc_ref(&self, id: ExtentId) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let extent = state
            .extents
            .get_mut(&id)
            .ok_or(DbsError::UnknownExtent(id))?;
        extent.refs += 1;
        Ok(())
    }

    /// Drop one reference; the extent is returned to the free list when the
    /// count reaches zero.
    pub fn dec_ref(&self, id: ExtentId) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let extent = state
            .extents
            .get_mut(&id)
            .ok_or(DbsError::UnknownExtent(id))?;
        extent.refs -= 1;
        if extent.refs == 0 {
            let extent = state.extents.remove(&id).expect("present above");
            state.free.push(Span {
                start: extent.start,
                granules: extent.granules,
            });
        }
        Ok(())
    }

    pub fn ref_count(&self, id: ExtentId) -> Result<u32> {
        Ok(self.extent(id)?.refs)
    }

    /// Ids of all live extents; used by consistency audits.
    pub fn live_extents(&self) -> Vec<ExtentId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ExtentId> = state.extents.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flush cached data and persist the extent table and free list.
    pub fn sync(&self) -> Result<()> {
        self.cache.flush()?;
        self.cache.manager().sync()?;

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut w = Writer::new();
        w.bytes(META_MAGIC);
        w.u64(state.next_id);
        w.u64(state.next_granule);
        w.u32(state.extents.len() as u32);
        let mut ids: Vec<ExtentId> = state.extents.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let e = state.extents[&id];
            w.u64(id).u64(e.start).u64(e.size).u64(e.granules).u32(e.refs);
        }
        w.u32(state.free.len() as u32);
        for span in &state.free {
            w.u64(span.start).u64(span.granules);
        }
        std::fs::write(&self.meta_path, w.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open_store(dir: &tempfile::TempDir) -> VariableSizeStore {
        VariableSizeStore::open(&dir.path().join("values.wv"), 64, 1024, 16).unwrap()
    }

    #[test]
    fn payload_round_trip_across_granules() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();

        let id = store.allocate(payload.len() as u64).unwrap();
        store.store(id, 0, &payload).unwrap();
        assert_eq!(store.read(id, 0, payload.len()).unwrap(), payload);
        assert_eq!(store.read(id, 100, 64).unwrap(), payload[100..164]);
    }

    #[test]
    fn refcount_frees_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let id = store.allocate(10).unwrap();
        store.inc_ref(id).unwrap();
        store.dec_ref(id).unwrap();
        assert_eq!(store.ref_count(id).unwrap(), 1);
        store.dec_ref(id).unwrap();
        assert!(matches!(
            store.read(id, 0, 1),
            Err(DbsError::UnknownExtent(_))
        ));
        assert!(store.live_extents().is_empty());
    }

    #[test]
    fn freed_space_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let first = store.allocate(64).unwrap();
        let _second = store.allocate(64).unwrap();
        store.dec_ref(first).unwrap();
        let third = store.allocate(40).unwrap();
        store.store(third, 0, b"reused").unwrap();
        // The third extent slotted into the freed granule, before the
        // high-water mark moved.
        let state = store.state.lock().unwrap();
        assert_eq!(state.extents[&third].start, 0);
        assert_eq!(state.next_granule, 2);
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.wv");
        let id;
        {
            let store = VariableSizeStore::open(&path, 64, 1024, 16).unwrap();
            id = store.allocate(6).unwrap();
            store.store(id, 0, b"durabl").unwrap();
            store.sync().unwrap();
        }
        let store = VariableSizeStore::open(&path, 64, 1024, 16).unwrap();
        assert_eq!(store.read(id, 0, 6).unwrap(), b"durabl");
        assert_eq!(store.ref_count(id).unwrap(), 1);
    }

    #[test]
    fn truncate_shrinks_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let id = store.allocate(32).unwrap();
        store.store(id, 0, &[7u8; 32]).unwrap();
        store.truncate(id, 8).unwrap();
        assert_eq!(store.extent_size(id).unwrap(), 8);
        assert!(store.truncate(id, 16).is_err());
    }
}
