//! Non-moving block heap with per-thread bump allocation and an explicit
//! stop-the-world trace pass.
//!
//! This crate is decoupled from any specific runtime. Consumers provide:
//! - A [`TraceFn`] to enumerate Value edges of heap objects.
//! - A [`RootProvider`] to supply live roots at trace time.
//!
//! Collection itself (sweeping, reclamation policy) is the business of an
//! external collector; this heap only grows, marks on request, and runs
//! registered finalizers when it is torn down.

use std::alloc::Layout;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use object::{Header, Value};

// ── Public API types ──────────────────────────────────────────────────

/// Function that traces all Value edges of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an
/// [`object::Header`]), the function must call `visitor` for every
/// [`Value`] field that may be a heap reference.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub type TraceFn = unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(&mut Value));

/// Function run for an object when the heap is torn down.
///
/// Objects that wrap native state (boxed locks, condition variables, thread
/// records) register one of these so the native side is released exactly
/// once.
///
/// # Safety
///
/// `obj` must point to the object the finalizer was registered for, and the
/// finalizer must run at most once per object.
pub type FinalizeFn = unsafe fn(obj: *mut u8);

/// Consumers implement this to provide trace roots.
///
/// Called at the start of a trace pass to discover live roots from runtime
/// state. The visitor receives `&mut Value` so a future relocating collector
/// could update root pointers in place; this heap never moves objects.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Result of one trace pass.
#[derive(Debug, Clone, Copy)]
pub struct TraceStats {
    /// The epoch objects were marked with.
    pub epoch: u8,
    /// Number of distinct objects reached.
    pub visited_objects: usize,
    /// Number of reference edges followed (including duplicates).
    pub visited_edges: usize,
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the block heap.
#[derive(Debug)]
pub struct HeapSettings {
    /// Size of one allocation block in bytes.
    pub block_size: usize,
    /// Allocations of at least this size get a dedicated block.
    pub large_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            large_size: 8 * 1024,
        }
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

const BLOCK_ALIGN: usize = 16;

struct Block {
    start: NonNull<u8>,
    size: usize,
}

struct Finalizer {
    object: *mut u8,
    finalize: FinalizeFn,
}

pub struct HeapInner {
    settings: HeapSettings,
    trace_fn: TraceFn,
    blocks: Mutex<Vec<Block>>,
    finalizers: Mutex<Vec<Finalizer>>,
    /// Epoch of the most recent trace pass. Mark bytes start at 0, so a
    /// valid epoch is never 0.
    epoch: AtomicU8,
    allocated: AtomicUsize,
}

// SAFETY: all shared state is behind locks or atomics; block pointers are
// only handed out under the blocks lock.
unsafe impl Send for HeapInner {}
// SAFETY: see above.
unsafe impl Sync for HeapInner {}

#[derive(Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings, trace_fn: TraceFn) -> Self {
        Self(Arc::new(HeapInner {
            settings,
            trace_fn,
            blocks: Mutex::new(Vec::new()),
            finalizers: Mutex::new(Vec::new()),
            epoch: AtomicU8::new(0),
            allocated: AtomicUsize::new(0),
        }))
    }

    #[must_use]
    pub fn proxy(&self) -> HeapProxy {
        HeapProxy::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl HeapInner {
    /// Allocate a fresh zeroed block of at least `min_size` bytes and record
    /// it for teardown. Returns the usable window.
    fn request_block(&self, min_size: usize) -> (NonNull<u8>, usize) {
        let size = self.settings.block_size.max(min_size);
        let layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .expect("block layout is valid");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let start = match NonNull::new(raw) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        };
        self.blocks.lock().push(Block { start, size });
        self.allocated.fetch_add(size, Ordering::Relaxed);
        trace!("heap: mapped block of {size} bytes");
        (start, size)
    }

    /// Register a finalizer for `object`, run once when the heap is torn
    /// down.
    pub fn register_finalizer(&self, object: *mut u8, finalize: FinalizeFn) {
        self.finalizers.lock().push(Finalizer { object, finalize });
    }

    #[inline]
    pub fn epoch(&self) -> u8 {
        self.epoch.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Whether `value` references an object marked by the most recent trace
    /// pass.
    pub fn is_marked(&self, value: Value) -> bool {
        if !value.is_ref() {
            return false;
        }
        // SAFETY: reference values point at live heap objects; the heap
        // never frees or moves them while it is alive.
        let header = unsafe { &*value.as_ptr::<Header>() };
        header.mark() == self.epoch()
    }

    /// Run one mark pass over everything reachable from `roots`.
    ///
    /// Must only be called while all mutator threads are stopped: object
    /// graphs (channel buffers included) are read without taking any locks.
    pub fn trace(&self, roots: &mut dyn RootProvider) -> TraceStats {
        let epoch = match self.epoch.load(Ordering::Relaxed).wrapping_add(1) {
            0 => 1,
            e => e,
        };
        self.epoch.store(epoch, Ordering::Relaxed);

        let mut stack: Vec<*const u8> = Vec::new();
        let mut edges = 0usize;

        roots.visit_roots(&mut |value| {
            mark_value(epoch, value, &mut stack, &mut edges)
        });

        let mut visited = 0usize;
        while let Some(obj) = stack.pop() {
            visited += 1;
            // SAFETY: only marked heap objects are pushed on the stack.
            unsafe {
                (self.trace_fn)(obj, &mut |value| {
                    mark_value(epoch, value, &mut stack, &mut edges)
                });
            }
        }

        let stats = TraceStats {
            epoch,
            visited_objects: visited,
            visited_edges: edges,
        };
        debug!(
            "heap: trace epoch {} visited {} objects over {} edges",
            stats.epoch, stats.visited_objects, stats.visited_edges
        );
        stats
    }
}

fn mark_value(
    epoch: u8,
    value: &mut Value,
    stack: &mut Vec<*const u8>,
    edges: &mut usize,
) {
    if !value.is_ref() {
        return;
    }
    *edges += 1;
    // SAFETY: reference values point at live heap objects.
    let header = unsafe { &*value.as_ptr::<Header>() };
    if header.mark() != epoch {
        header.set_mark(epoch);
        stack.push(value.as_ptr::<u8>() as *const u8);
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        for f in self.finalizers.get_mut().drain(..) {
            // SAFETY: each finalizer was registered for a live object in
            // this heap and runs exactly once, before any block is freed.
            unsafe { (f.finalize)(f.object) };
        }
        for block in self.blocks.get_mut().drain(..) {
            let layout = Layout::from_size_align(block.size, BLOCK_ALIGN)
                .expect("block layout is valid");
            // SAFETY: the block was allocated with this exact layout.
            unsafe { std::alloc::dealloc(block.start.as_ptr(), layout) };
        }
    }
}

// ── HeapProxy (thread-local allocator) ────────────────────────────────

/// Thread-local allocator.
///
/// Bump-allocates within a private window carved out of the shared heap;
/// when the window is exhausted a fresh block is requested. Allocation
/// never triggers collection — a collector, if any, drives trace passes
/// from outside.
pub struct HeapProxy {
    pub heap: Heap,
    /// Current allocation cursor.
    bump: *mut u8,
    /// End of the current window.
    end: *mut u8,
}

// SAFETY: the bump window is exclusively owned by this proxy; the shared
// heap behind it synchronizes internally.
unsafe impl Send for HeapProxy {}

impl HeapProxy {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        Self {
            heap,
            bump: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    /// Allocate zeroed memory for one object.
    pub fn allocate(&mut self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.align().is_power_of_two());
        debug_assert!(layout.align() <= BLOCK_ALIGN);

        if layout.size() >= self.heap.settings.large_size {
            // Large objects get a dedicated block and leave the current
            // window untouched.
            let (start, _) = self.heap.request_block(layout.size());
            return start;
        }

        loop {
            let cur = self.bump as usize;
            let end = self.end as usize;
            let aligned = (cur + (layout.align() - 1)) & !(layout.align() - 1);
            if let Some(new_cur) = aligned.checked_add(layout.size()) {
                if new_cur <= end && cur != 0 {
                    self.bump = new_cur as *mut u8;
                    // SAFETY: aligned is within the window.
                    return unsafe {
                        NonNull::new_unchecked(aligned as *mut u8)
                    };
                }
            }

            let (start, size) = self.heap.request_block(layout.size());
            self.bump = start.as_ptr();
            // SAFETY: the block spans `size` bytes from `start`.
            self.end = unsafe { start.as_ptr().add(size) };
        }
    }
}
