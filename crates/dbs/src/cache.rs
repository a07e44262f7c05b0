//! Fixed-size item cache in front of an items manager.
//!
//! Blocks are pinned by the borrow handles returned from
//! [`BlockCache::retrieve_item`]; eviction only considers unpinned blocks
//! and writes dirty ones back first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;

use crate::errors::{DbsError, Result};

/// Lower-level store of fixed-size items addressed by item id.
///
/// Reads past the end of the managed region yield zeroed bytes; writes
/// extend it.
pub trait ItemsManager: Send + Sync {
    fn retrieve_items(&self, buf: &mut [u8], base_item: u64, count: usize) -> Result<()>;
    fn store_items(&self, buf: &[u8], base_item: u64, count: usize) -> Result<()>;
}

impl<M: ItemsManager + ?Sized> ItemsManager for Box<M> {
    fn retrieve_items(&self, buf: &mut [u8], base_item: u64, count: usize) -> Result<()> {
        (**self).retrieve_items(buf, base_item, count)
    }

    fn store_items(&self, buf: &[u8], base_item: u64, count: usize) -> Result<()> {
        (**self).store_items(buf, base_item, count)
    }
}

struct BlockSlot {
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    pins: AtomicUsize,
}

/// Borrow handle over one item inside a cached block. While alive, the
/// containing block cannot be evicted.
pub struct CachedItem {
    slot: Arc<BlockSlot>,
    offset: usize,
    len: usize,
}

impl CachedItem {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() <= self.len);
        let data = self.slot.data.read().unwrap_or_else(|e| e.into_inner());
        out.copy_from_slice(&data[self.offset..self.offset + out.len()]);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let data = self.slot.data.read().unwrap_or_else(|e| e.into_inner());
        data[self.offset..self.offset + self.len].to_vec()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.slot.data.read().unwrap_or_else(|e| e.into_inner());
        f(&data[self.offset..self.offset + self.len])
    }

    /// Overwrite bytes inside the item, marking the block dirty.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        let mut data = self.slot.data.write().unwrap_or_else(|e| e.into_inner());
        data[self.offset + offset..self.offset + offset + bytes.len()].copy_from_slice(bytes);
        self.slot.dirty.store(true, Ordering::Release);
    }

    pub fn write(&self, bytes: &[u8]) {
        self.write_at(0, bytes);
    }
}

impl Drop for CachedItem {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BlockCache<M: ItemsManager> {
    manager: M,
    item_size: usize,
    block_size: usize,
    max_blocks: usize,
    blocks: Mutex<AHashMap<u64, Arc<BlockSlot>>>,
}

impl<M: ItemsManager> BlockCache<M> {
    pub fn new(manager: M, item_size: usize, block_size: usize, max_blocks: usize) -> Result<Self> {
        if item_size == 0 || block_size == 0 || max_blocks == 0 {
            return Err(DbsError::InvalidParameters(
                "cache item size, block size and block count must be non-zero",
            ));
        }
        let block_size = block_size.max(item_size);
        Ok(Self {
            manager,
            item_size,
            block_size,
            max_blocks,
            blocks: Mutex::new(AHashMap::new()),
        })
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    fn items_per_block(&self) -> usize {
        self.block_size / self.item_size
    }

    /// Borrow the item, loading its block on a miss. Eviction of unpinned
    /// blocks (dirty ones written back) makes room when the cache is full.
    pub fn retrieve_item(&self, item: u64) -> Result<CachedItem> {
        let ipb = self.items_per_block() as u64;
        let base = (item / ipb) * ipb;
        let offset = (item % ipb) as usize * self.item_size;

        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = blocks.get(&base) {
            slot.pins.fetch_add(1, Ordering::AcqRel);
            return Ok(CachedItem {
                slot: Arc::clone(slot),
                offset,
                len: self.item_size,
            });
        }

        if blocks.len() >= self.max_blocks {
            let evictable: Vec<u64> = blocks
                .iter()
                .filter(|(_, slot)| slot.pins.load(Ordering::Acquire) == 0)
                .map(|(&b, _)| b)
                .collect();
            for evicted in evictable {
                let slot = blocks.remove(&evicted).expect("just listed");
                if slot.dirty.load(Ordering::Acquire) {
                    let data = slot.data.read().unwrap_or_else(|e| e.into_inner());
                    self.manager
                        .store_items(&data, evicted, self.items_per_block())?;
                }
            }
            if blocks.len() >= self.max_blocks {
                log::warn!(
                    "block cache over budget: {} blocks pinned, limit {}",
                    blocks.len(),
                    self.max_blocks
                );
            }
        }

        let mut data = vec![0u8; self.block_size];
        self.manager
            .retrieve_items(&mut data, base, self.items_per_block())?;
        let slot = Arc::new(BlockSlot {
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            pins: AtomicUsize::new(1),
        });
        blocks.insert(base, Arc::clone(&slot));
        Ok(CachedItem {
            slot,
            offset,
            len: self.item_size,
        })
    }

    /// Write the containing block back if dirty.
    pub fn flush_item(&self, item: u64) -> Result<()> {
        let ipb = self.items_per_block() as u64;
        let base = (item / ipb) * ipb;
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = blocks.get(&base) {
            self.flush_slot(base, slot)?;
        }
        Ok(())
    }

    /// Re-read the containing block from the items manager. The block must
    /// not hold unwritten changes.
    pub fn refresh_item(&self, item: u64) -> Result<()> {
        let ipb = self.items_per_block() as u64;
        let base = (item / ipb) * ipb;
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = blocks.get(&base) else {
            return Ok(());
        };
        if slot.dirty.load(Ordering::Acquire) {
            return Err(DbsError::GeneralControlError(
                "refresh of a dirty cached block",
            ));
        }
        let mut data = slot.data.write().unwrap_or_else(|e| e.into_inner());
        self.manager
            .retrieve_items(&mut data, base, self.items_per_block())
    }

    pub fn flush(&self) -> Result<()> {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        for (&base, slot) in blocks.iter() {
            self.flush_slot(base, slot)?;
        }
        Ok(())
    }

    fn flush_slot(&self, base: u64, slot: &Arc<BlockSlot>) -> Result<()> {
        if slot.dirty.swap(false, Ordering::AcqRel) {
            let data = slot.data.read().unwrap_or_else(|e| e.into_inner());
            self.manager
                .store_items(&data, base, self.items_per_block())?;
        }
        Ok(())
    }
}

/// File-backed items manager at a fixed byte offset inside a file.
pub struct FileItemsManager {
    file: Mutex<std::fs::File>,
    item_size: usize,
    base_offset: u64,
}

impl FileItemsManager {
    pub fn new(file: std::fs::File, item_size: usize, base_offset: u64) -> Self {
        Self {
            file: Mutex::new(file),
            item_size,
            base_offset,
        }
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.sync_data()?;
        Ok(())
    }
}

impl ItemsManager for FileItemsManager {
    fn retrieve_items(&self, buf: &mut [u8], base_item: u64, count: usize) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        let wanted = count * self.item_size;
        debug_assert!(buf.len() >= wanted);
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let start = self.base_offset + base_item * self.item_size as u64;
        let len = file.metadata()?.len();
        if start >= len {
            buf[..wanted].fill(0);
            return Ok(());
        }
        let available = ((len - start) as usize).min(wanted);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..available])?;
        buf[available..wanted].fill(0);
        Ok(())
    }

    fn store_items(&self, buf: &[u8], base_item: u64, count: usize) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        let wanted = count * self.item_size;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let start = self.base_offset + base_item * self.item_size as u64;
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&buf[..wanted])?;
        Ok(())
    }
}

/// Growable in-memory items manager, used by temporary tables and tests.
#[derive(Default)]
pub struct MemoryItemsManager {
    item_size: usize,
    data: Mutex<Vec<u8>>,
}

impl MemoryItemsManager {
    pub fn new(item_size: usize) -> Self {
        Self {
            item_size,
            data: Mutex::new(Vec::new()),
        }
    }
}

impl ItemsManager for MemoryItemsManager {
    fn retrieve_items(&self, buf: &mut [u8], base_item: u64, count: usize) -> Result<()> {
        let wanted = count * self.item_size;
        let start = base_item as usize * self.item_size;
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let available = data.len().saturating_sub(start).min(wanted);
        buf[..available].copy_from_slice(&data[start..start + available]);
        buf[available..wanted].fill(0);
        Ok(())
    }

    fn store_items(&self, buf: &[u8], base_item: u64, count: usize) -> Result<()> {
        let wanted = count * self.item_size;
        let start = base_item as usize * self.item_size;
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if data.len() < start + wanted {
            data.resize(start + wanted, 0);
        }
        data[start..start + wanted].copy_from_slice(&buf[..wanted]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache_over_memory(items: usize, blocks: usize) -> BlockCache<MemoryItemsManager> {
        BlockCache::new(MemoryItemsManager::new(8), 8, 8 * items, blocks).unwrap()
    }

    #[test]
    fn items_land_at_block_offsets() {
        let cache = cache_over_memory(4, 2);
        for id in 0..8u64 {
            let item = cache.retrieve_item(id).unwrap();
            item.write(&id.to_le_bytes());
        }
        cache.flush().unwrap();
        for id in 0..8u64 {
            let item = cache.retrieve_item(id).unwrap();
            assert_eq!(item.to_vec(), id.to_le_bytes());
        }
    }

    #[test]
    fn eviction_preserves_dirty_data() {
        let cache = cache_over_memory(1, 2);
        for id in 0..16u64 {
            cache.retrieve_item(id).unwrap().write(&id.to_le_bytes());
        }
        // Everything evicted along the way has been written back.
        for id in 0..16u64 {
            assert_eq!(cache.retrieve_item(id).unwrap().to_vec(), id.to_le_bytes());
        }
    }

    #[test]
    fn pinned_blocks_survive_eviction() {
        let cache = cache_over_memory(1, 2);
        let pinned = cache.retrieve_item(0).unwrap();
        pinned.write(&42u64.to_le_bytes());
        for id in 1..10u64 {
            cache.retrieve_item(id).unwrap();
        }
        assert_eq!(pinned.to_vec(), 42u64.to_le_bytes());
        drop(pinned);
        cache.flush().unwrap();
        assert_eq!(cache.retrieve_item(0).unwrap().to_vec(), 42u64.to_le_bytes());
    }

    #[test]
    fn refresh_rejects_dirty_blocks() {
        let cache = cache_over_memory(4, 2);
        cache.retrieve_item(1).unwrap().write(&[1; 8]);
        assert!(matches!(
            cache.refresh_item(1),
            Err(DbsError::GeneralControlError(_))
        ));
        cache.flush_item(1).unwrap();
        cache.refresh_item(1).unwrap();
    }

    #[test]
    fn zero_parameters_rejected() {
        assert!(matches!(
            BlockCache::new(MemoryItemsManager::new(8), 0, 64, 4),
            Err(DbsError::InvalidParameters(_))
        ));
    }

    #[test]
    fn small_blocks_round_up_to_item_size() {
        let cache = BlockCache::new(MemoryItemsManager::new(16), 16, 4, 2).unwrap();
        let item = cache.retrieve_item(3).unwrap();
        assert_eq!(item.len(), 16);
    }
}
