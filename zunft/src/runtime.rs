use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use heap::{Heap, HeapProxy, HeapSettings, RootProvider, TraceStats};
use object::{Array, Header, ObjectType, Str, Tuple, Value};

use crate::channel::ChannelObject;
use crate::gvl::Gvl;
use crate::isolate::{self, IsolateObject};

/// Shared runtime state: the heap, the process-wide isolate registry, the
/// isolate-id counter and the cooperative execution lock.
pub struct RuntimeShared {
    heap: Heap,
    /// Every live isolate object, in creation order. The registry is the
    /// root set of a trace pass; isolates are never unregistered.
    registry: Mutex<Vec<Value>>,
    next_isolate_id: AtomicU64,
    gvl: Gvl,
}

#[derive(Clone)]
pub struct Runtime(Arc<RuntimeShared>);

impl Deref for Runtime {
    type Target = RuntimeShared;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Runtime {
    /// Build a runtime with default heap settings, boot the root isolate
    /// and bind the calling thread to it.
    #[must_use]
    pub fn new() -> (Runtime, Mutator) {
        Self::with_settings(HeapSettings::default())
    }

    #[must_use]
    pub fn with_settings(settings: HeapSettings) -> (Runtime, Mutator) {
        let heap = Heap::new(settings, trace_object);
        let rt = Runtime(Arc::new(RuntimeShared {
            heap,
            registry: Mutex::new(Vec::new()),
            next_isolate_id: AtomicU64::new(0),
            gvl: Gvl::new(),
        }));
        let mut mutator = rt.mutator();
        isolate::boot_root(&mut mutator);
        (rt, mutator)
    }

    /// A fresh per-thread allocation context for this runtime.
    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator {
            rt: self.clone(),
            proxy: self.heap.proxy(),
        }
    }
}

impl RuntimeShared {
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gvl(&self) -> &Gvl {
        &self.gvl
    }

    pub(crate) fn next_isolate_id(&self) -> u64 {
        self.next_isolate_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_isolate(&self, isolate: Value) {
        self.registry.lock().push(isolate);
    }

    /// Snapshot of the registry, in creation order.
    pub fn isolates(&self) -> Vec<Value> {
        self.registry.lock().clone()
    }

    /// The initial isolate existing since runtime construction.
    pub fn root_isolate(&self) -> Value {
        self.registry.lock()[0]
    }

    /// Run a mark pass rooted at the registry.
    ///
    /// Assumes an externally coordinated stop-the-world phase: channel
    /// buffers and isolate thread/hook sets are read without their locks.
    pub fn trace(&self) -> TraceStats {
        let mut roots = RegistryRoots {
            registry: &self.registry,
        };
        self.heap.trace(&mut roots)
    }
}

struct RegistryRoots<'a> {
    registry: &'a Mutex<Vec<Value>>,
}

impl RootProvider for RegistryRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for isolate in self.registry.lock().iter_mut() {
            visitor(isolate);
        }
    }
}

/// A per-thread execution context: a runtime handle plus a private heap
/// proxy. Every allocating operation takes one.
pub struct Mutator {
    pub rt: Runtime,
    pub proxy: HeapProxy,
}

/// Trace all Value edges of a heap object.
///
/// Channel objects contribute their live buffer spans (one contiguous range
/// when `tail <= head`, otherwise the two wraparound ranges); isolates
/// contribute their default channel, event hooks and bound-thread roots.
/// The parent back-reference is weak and deliberately skipped: the registry
/// keeps every isolate alive.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`],
/// and every mutator thread must be stopped (locks are bypassed).
pub unsafe fn trace_object(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
    let header = unsafe { &*(obj as *const Header) };
    match header.object_type() {
        ObjectType::Tuple => {
            let tuple = unsafe { &mut *(obj as *mut Tuple) };
            for element in unsafe { tuple.elements_mut() } {
                visitor(element);
            }
        }
        ObjectType::Array => {
            let array = unsafe { &mut *(obj as *mut Array) };
            visitor(&mut array.storage);
        }
        ObjectType::Str => {
            let string = unsafe { &mut *(obj as *mut Str) };
            visitor(&mut string.data);
        }
        ObjectType::ByteArray | ObjectType::Thread => {
            // No reference fields.
        }
        ObjectType::Channel => {
            let chobj = unsafe { &*(obj as *const ChannelObject) };
            let channel = unsafe { chobj.channel() };
            let (front, back) = unsafe { channel.live_ranges() };
            for value in front {
                visitor(value);
            }
            for value in back {
                visitor(value);
            }
        }
        ObjectType::Isolate => {
            let iobj = unsafe { &*(obj as *const IsolateObject) };
            let iso = unsafe { &mut *iobj.isolate };
            visitor(&mut iso.default_channel);
            let hooks = unsafe { &mut *iso.hooks_data_ptr() };
            for hook in hooks.iter_mut() {
                visitor(hook);
            }
            let threads = unsafe { &mut *iso.threads_data_ptr() };
            for record in threads.iter_mut() {
                visitor(&mut record.root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::alloc_array;
    use crate::channel;
    use crate::isolate::IsolateObject;
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::time::{Duration, Instant};

    fn fx(n: i64) -> Value {
        Value::from_i64(n)
    }

    #[test]
    fn boot_registers_and_binds_the_root_isolate() {
        let (rt, _m) = Runtime::new();
        let root = rt.root_isolate();
        assert_eq!(rt.isolates(), vec![root]);
        assert_eq!(isolate::current(), root);
        let core = unsafe { root.as_ref::<IsolateObject>().isolate() };
        assert_eq!(core.id, 0);
        assert_eq!(core.parent(), None);
    }

    #[test]
    fn isolate_ids_are_unique_under_concurrent_spawns() {
        let (_rt, mut m) = Runtime::new();
        // Children spawning concurrently all pull from the same counter.
        let mut children = Vec::new();
        for _ in 0..4 {
            children.push(isolate::spawn_task(&mut m, |cm| {
                let grand = isolate::spawn(cm).expect("spawn");
                isolate::yield_value(cm, grand.value()).expect("yield");
            }));
        }
        let mut ids: Vec<u64> = Vec::new();
        for _ in 0..4 {
            let grand = isolate::receive_current(&m);
            ids.push(unsafe { grand.as_ref::<IsolateObject>().isolate() }.id);
        }
        for child in children {
            ids.push(unsafe { child.as_ref().isolate() }.id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8, "no isolate id may be reused");
    }

    #[test]
    fn trace_reaches_a_wrapped_channel_buffer() {
        let (rt, mut m) = Runtime::new();
        let root = rt.root_isolate();
        let ch = isolate::default_channel(object::Tagged::from_value(root));
        let channel = unsafe { ch.as_ref().channel() };

        // Fill the first grown capacity, consume some, refill past the end
        // so the live region wraps.
        let mut live = Vec::new();
        for n in 0..8 {
            let arr = alloc_array(&mut m.proxy, &[fx(n)]).value();
            channel.push(arr);
            live.push(arr);
        }
        let mut dead = Vec::new();
        for _ in 0..3 {
            dead.push(channel.pop());
            live.remove(0);
        }
        for n in 0..2 {
            let arr = alloc_array(&mut m.proxy, &[fx(100 + n)]).value();
            channel.push(arr);
            live.push(arr);
        }

        let stats = rt.trace();
        assert!(stats.visited_objects > 0);
        for value in &live {
            assert!(
                rt.heap().is_marked(*value),
                "buffered value must be a trace root"
            );
        }
        for value in &dead {
            assert!(
                !rt.heap().is_marked(*value),
                "popped value must no longer be kept alive by the channel"
            );
        }
    }

    #[test]
    fn trace_reaches_hooks_thread_roots_and_default_channels() {
        let (rt, mut m) = Runtime::new();
        let child = isolate::spawn(&mut m).expect("spawn");
        let child_core = unsafe { child.as_ref().isolate() };

        let hook = alloc_array(&mut m.proxy, &[fx(1)]).value();
        let root_core = unsafe {
            rt.root_isolate().as_ref::<IsolateObject>().isolate()
        };
        root_core.add_event_hook(hook);

        let unreferenced = alloc_array(&mut m.proxy, &[fx(2)]).value();

        rt.trace();
        assert!(rt.heap().is_marked(child.value()));
        assert!(rt.heap().is_marked(child_core.default_channel));
        assert!(rt.heap().is_marked(hook));
        for root in child_core.bound_thread_roots() {
            assert!(rt.heap().is_marked(root), "thread root must be traced");
        }
        assert!(!rt.heap().is_marked(unreferenced));
    }

    #[test]
    fn blocked_receive_releases_the_cooperative_lock() {
        let (rt, mut m) = Runtime::new();
        let ch = channel::create(&mut m);

        rt.gvl().acquire();

        let lock_seen_free = Arc::new(AtomicBool::new(false));
        let seen2 = lock_seen_free.clone();
        let rt2 = rt.clone();
        let helper = std::thread::spawn(move || {
            // Blocks until the receiver below lets go of the lock.
            rt2.gvl().acquire();
            seen2.store(true, SeqCst);
            let mut hm = rt2.mutator();
            channel::transfer_copy(&mut hm, ch, fx(7)).expect("copy");
            rt2.gvl().release();
        });

        let value = channel::receive(&m, ch);
        assert_eq!(unsafe { value.to_i64() }, 7);
        assert!(
            lock_seen_free.load(SeqCst),
            "helper must have held the lock while we were blocked"
        );
        assert!(rt.gvl().held_by_current(), "receive reacquires the lock");
        rt.gvl().release();
        helper.join().unwrap();
    }

    #[test]
    fn trace_passes_use_distinct_epochs() {
        let (rt, _m) = Runtime::new();
        let first = rt.trace();
        let second = rt.trace();
        assert_ne!(first.epoch, second.epoch);
        assert_eq!(first.visited_objects, second.visited_objects);
    }

    #[test]
    fn receive_wakes_within_bounded_time_of_a_push() {
        let (_rt, mut m) = Runtime::new();
        let ch = channel::create(&mut m);

        let rt2 = m.rt.clone();
        let pushed_at = Arc::new(Mutex::new(None::<Instant>));
        let pushed2 = pushed_at.clone();
        let helper = std::thread::spawn(move || {
            let mut hm = rt2.mutator();
            std::thread::sleep(Duration::from_millis(50));
            *pushed2.lock() = Some(Instant::now());
            channel::transfer_copy(&mut hm, ch, fx(1)).expect("copy");
        });

        let value = channel::receive(&m, ch);
        let woke_at = Instant::now();
        helper.join().unwrap();
        assert_eq!(unsafe { value.to_i64() }, 1);
        let pushed = (*pushed_at.lock()).expect("push happened");
        assert!(
            woke_at.duration_since(pushed) < Duration::from_millis(500),
            "receive must return promptly after the push"
        );
    }
}
