//! Shoal Memsys - fixed-class slab allocator
//!
//! Reusable byte buffers in power-of-two size classes. Transport framing,
//! checksum staging, and stream-level lz4 output all draw from here instead
//! of allocating per object. A freed buffer returns to its class's lock-free
//! free list; buffers larger than the top class are one-off allocations that
//! are simply dropped.

use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Smallest size class
pub const MIN_CLASS_SIZE: usize = 4 * 1024;
/// Largest pooled size class
pub const MAX_CLASS_SIZE: usize = 1024 * 1024;
/// Default buffer size for transport copies
pub const DEFAULT_BUF_SIZE: usize = 32 * 1024;

/// Free buffers retained per class; beyond this, freed memory is released.
/// The bound is advisory: the queue length is approximate under concurrent
/// frees, which only means a few extra retained buffers, never an error.
const MAX_FREE_PER_CLASS: usize = 128;

struct SlabClass {
    size: usize,
    free: SegQueue<Vec<u8>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SlabClass {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: SegQueue::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0u8; self.size]
    }

    fn put(&self, buf: Vec<u8>) {
        debug_assert_eq!(buf.capacity(), self.size);
        if self.free.len() < MAX_FREE_PER_CLASS {
            self.free.push(buf);
        }
    }
}

/// Slab allocator with power-of-two size classes
pub struct MemSys {
    classes: Vec<SlabClass>,
}

impl MemSys {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS_SIZE;
        while size <= MAX_CLASS_SIZE {
            classes.push(SlabClass::new(size));
            size *= 2;
        }
        Arc::new(Self { classes })
    }

    fn class_index(&self, size: usize) -> Option<usize> {
        if size > MAX_CLASS_SIZE {
            return None;
        }
        let mut idx = 0;
        let mut class_size = MIN_CLASS_SIZE;
        while class_size < size {
            class_size *= 2;
            idx += 1;
        }
        Some(idx)
    }

    /// Allocate a buffer of at least `size` bytes, from the smallest
    /// fitting class. Oversize requests get an exact, unpooled buffer.
    #[must_use]
    pub fn alloc(self: &Arc<Self>, size: usize) -> Buf {
        match self.class_index(size) {
            Some(idx) => Buf {
                data: self.classes[idx].get(),
                class: Some(idx),
                owner: Arc::clone(self),
            },
            None => Buf {
                data: vec![0u8; size],
                class: None,
                owner: Arc::clone(self),
            },
        }
    }

    /// Allocate the default transport copy buffer
    #[must_use]
    pub fn alloc_default(self: &Arc<Self>) -> Buf {
        self.alloc(DEFAULT_BUF_SIZE)
    }

    fn release(&self, class: usize, buf: Vec<u8>) {
        self.classes[class].put(buf);
    }

    /// Per-class (size, hits, misses) counters
    #[must_use]
    pub fn stats(&self) -> Vec<ClassStats> {
        self.classes
            .iter()
            .map(|c| ClassStats {
                size: c.size,
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Allocation counters for one size class
#[derive(Clone, Copy, Debug)]
pub struct ClassStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A pooled buffer; returns to its size class on drop
pub struct Buf {
    data: Vec<u8>,
    class: Option<usize>,
    owner: Arc<MemSys>,
}

impl Buf {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            let data = std::mem::take(&mut self.data);
            self.owner.release(class, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        let mem = MemSys::new();
        assert_eq!(mem.alloc(1).len(), MIN_CLASS_SIZE);
        assert_eq!(mem.alloc(MIN_CLASS_SIZE).len(), MIN_CLASS_SIZE);
        assert_eq!(mem.alloc(MIN_CLASS_SIZE + 1).len(), MIN_CLASS_SIZE * 2);
        assert_eq!(mem.alloc(MAX_CLASS_SIZE).len(), MAX_CLASS_SIZE);
    }

    #[test]
    fn test_reuse_hits_free_list() {
        let mem = MemSys::new();
        {
            let mut buf = mem.alloc(8 * 1024);
            buf[0] = 0xA5;
        }
        let _buf = mem.alloc(8 * 1024);
        let stats = mem.stats();
        let class = stats.iter().find(|c| c.size == 8 * 1024).unwrap();
        assert_eq!(class.hits, 1);
        assert_eq!(class.misses, 1);
    }

    #[test]
    fn test_oversize_not_pooled() {
        let mem = MemSys::new();
        {
            let buf = mem.alloc(MAX_CLASS_SIZE * 2);
            assert_eq!(buf.len(), MAX_CLASS_SIZE * 2);
        }
        for class in mem.stats() {
            assert_eq!(class.hits + class.misses, 0);
        }
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let mem = MemSys::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mem = Arc::clone(&mem);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    let mut buf = mem.alloc((i % 64 + 1) * 1024);
                    buf[0] = i as u8;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
