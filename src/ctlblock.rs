//! Shared control-block allocator
//!
//! Each owner carries a pool of page-granular record arrays mapped into
//! both kernel and user address space. Every task gets at most one slot,
//! through which user code can poll "which processor is this task on"
//! without a system call. The record is a best-effort, eventually
//! consistent snapshot and never a synchronization primitive.
//!
//! A page is 4096 bytes of fixed-size records plus a free bitmap held on
//! the kernel side. Allocation prefers pages on a recency list (a page
//! that just regained space after being full goes to the front); pages
//! are only unmapped when the owner itself is torn down.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::task::Task;

/// Size of one backing page
pub const CTL_PAGE_SIZE: usize = 4096;

/// Records per page
pub const BLOCKS_PER_PAGE: usize = CTL_PAGE_SIZE / core::mem::size_of::<CtlBlock>();

/// Default cap on pages per owner; exceeding it is a resource error for
/// the calling task, never fatal to the owner
pub const DEFAULT_MAX_PAGES: usize = 64;

/// Base of the simulated user-side mapping of the pool
///
/// The crate has no real address space; embedders map the backing pages
/// and apply the same per-page offsets.
pub const CTL_USER_BASE: u64 = 0x7f10_0000_0000;

/// "Not running anywhere" sentinel for `curcpu`
pub const CTL_CPU_NONE: i32 = -1;
/// "Task has exited" sentinel for `curcpu`
pub const CTL_CPU_EXITED: i32 = -2;

/// One user-visible status record
///
/// Fixed layout: user code reads these two words racily.
#[repr(C)]
pub struct CtlBlock {
    /// Processor currently running the task, or a sentinel
    pub curcpu: AtomicI32,
    /// Context-switch counter, bumped on every dispatch
    pub pctr: AtomicU32,
}

impl CtlBlock {
    fn new() -> Self {
        Self {
            curcpu: AtomicI32::new(CTL_CPU_NONE),
            pctr: AtomicU32::new(0),
        }
    }
}

/// A task's reservation in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlSlot {
    /// Page index within the owner's pool
    pub page: u32,
    /// Record index within the page
    pub index: u32,
    /// User-side address of the record
    pub uaddr: u64,
}

struct CtlPage {
    blocks: Arc<[CtlBlock]>,
    /// Bit set = record in use
    bitmap: [u64; BLOCKS_PER_PAGE / 64],
    used: u32,
}

impl CtlPage {
    fn new() -> Self {
        Self {
            blocks: (0..BLOCKS_PER_PAGE).map(|_| CtlBlock::new()).collect(),
            bitmap: [0; BLOCKS_PER_PAGE / 64],
            used: 0,
        }
    }

    fn claim_first_free(&mut self) -> Option<usize> {
        for (w, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1u64 << bit;
                self.used += 1;
                return Some(w * 64 + bit);
            }
        }
        None
    }

    fn release(&mut self, index: usize) {
        let word = &mut self.bitmap[index / 64];
        assert!(
            *word & (1u64 << (index % 64)) != 0,
            "control block slot freed twice"
        );
        *word &= !(1u64 << (index % 64));
        self.used -= 1;
    }

    fn is_full(&self) -> bool {
        self.used as usize == BLOCKS_PER_PAGE
    }
}

struct CtlPoolInner {
    pages: Vec<CtlPage>,
    /// Pages with free records, most recently freed-up first
    free_pages: VecDeque<u32>,
}

/// Per-owner control-block pool
pub struct CtlPool {
    inner: Mutex<CtlPoolInner>,
    max_pages: usize,
}

impl CtlPool {
    /// Create an empty pool with the default page cap
    pub fn new() -> Self {
        Self::with_max_pages(DEFAULT_MAX_PAGES)
    }

    /// Create an empty pool with an explicit page cap
    pub fn with_max_pages(max_pages: usize) -> Self {
        Self {
            inner: Mutex::new(CtlPoolInner {
                pages: Vec::new(),
                free_pages: VecDeque::new(),
            }),
            max_pages,
        }
    }

    /// Reserve a record for `task`, or return its existing reservation
    ///
    /// Idempotent per task. Grows the pool by one page when no page has
    /// room; address-space exhaustion surfaces as `OutOfMemory` to the
    /// caller only.
    pub fn alloc(&self, task: &Task) -> Result<CtlSlot> {
        if let Some(slot) = task.ctl_slot() {
            return Ok(slot);
        }

        let mut inner = self.inner.lock();
        let page_idx = match inner.free_pages.front().copied() {
            Some(p) => p,
            None => {
                if inner.pages.len() >= self.max_pages {
                    return Err(Error::OutOfMemory);
                }
                let p = inner.pages.len() as u32;
                inner.pages.push(CtlPage::new());
                inner.free_pages.push_back(p);
                p
            }
        };

        let (index, now_full) = {
            let page = &mut inner.pages[page_idx as usize];
            let index = page
                .claim_first_free()
                .expect("page on free list had no free record");
            // A reclaimed record still shows its previous task's last
            // published state; reset it before the new task is visible
            let block = &page.blocks[index];
            block.curcpu.store(CTL_CPU_NONE, Ordering::Relaxed);
            block.pctr.store(0, Ordering::Relaxed);
            (index, page.is_full())
        };
        if now_full {
            inner.free_pages.retain(|&p| p != page_idx);
        }

        let slot = CtlSlot {
            page: page_idx,
            index: index as u32,
            uaddr: CTL_USER_BASE
                + page_idx as u64 * CTL_PAGE_SIZE as u64
                + index as u64 * core::mem::size_of::<CtlBlock>() as u64,
        };
        task.set_ctl_slot(Some(slot));
        Ok(slot)
    }

    /// Release a task's reservation, if any
    ///
    /// A page that had no free records regains capacity and moves to the
    /// front of the allocation list; the page itself stays mapped until
    /// owner teardown.
    pub fn free(&self, task: &Task) {
        let Some(slot) = task.ctl_slot() else {
            return;
        };
        task.set_ctl_slot(None);

        let mut inner = self.inner.lock();
        let was_full = inner.pages[slot.page as usize].is_full();
        inner.pages[slot.page as usize].release(slot.index as usize);
        if was_full {
            inner.free_pages.push_front(slot.page);
        }
    }

    /// Publish the processor a task is running on (or a sentinel)
    pub fn publish_cpu(&self, slot: CtlSlot, cpu: i32) {
        let block = self.block(slot);
        block.curcpu.store(cpu, Ordering::Relaxed);
        block.pctr.fetch_add(1, Ordering::Relaxed);
    }

    /// Kernel-side handle to a record's page
    ///
    /// The page array is shared so the caller can read or write the
    /// record without holding the pool lock.
    pub fn block(&self, slot: CtlSlot) -> BlockRef {
        let inner = self.inner.lock();
        BlockRef {
            page: inner.pages[slot.page as usize].blocks.clone(),
            index: slot.index as usize,
        }
    }

    /// Kernel-side address of a record (for embedders building real
    /// mappings)
    pub fn kernel_addr(&self, slot: CtlSlot) -> usize {
        let r = self.block(slot);
        &r.page[r.index] as *const CtlBlock as usize
    }

    /// Number of mapped backing pages
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Unmap everything; called only at owner teardown
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.free_pages.clear();
    }
}

impl Default for CtlPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A lock-free handle to one record
pub struct BlockRef {
    page: Arc<[CtlBlock]>,
    index: usize,
}

impl core::ops::Deref for BlockRef {
    type Target = CtlBlock;

    fn deref(&self) -> &CtlBlock {
        &self.page[self.index]
    }
}
