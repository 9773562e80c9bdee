use std::alloc::Layout;
use std::cell::Cell;
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use object::{Header, ObjectType, Tagged, Value};

use crate::channel::{self, ChannelObject};
use crate::runtime::Mutator;
use crate::threading::{self, NativeThread};
use crate::transfer::TransferError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    #[error("isolate construction does not accept arguments")]
    ArgumentsUnsupported,
}

/// Membership record for one native thread bound to an isolate.
///
/// Membership is non-owning: the thread's lifetime is independent of the
/// isolate, which never joins it.
pub struct BoundThread {
    /// The thread's root value, kept alive through the owning isolate
    /// during a trace pass.
    pub root: Value,
    pub native: Weak<NativeThread>,
}

/// Native state of one isolate.
pub struct Isolate {
    /// Process-wide unique, monotonically increasing, never reused.
    pub id: u64,
    /// Weak back-reference: deliberately not traced. The registry keeps
    /// every isolate alive, so the parent cannot be reclaimed under us.
    parent: Option<Value>,
    /// The exclusively-owned default channel object.
    pub default_channel: Value,
    threads: Mutex<Vec<BoundThread>>,
    hooks: Mutex<Vec<Value>>,
}

// SAFETY: interior state is behind locks; the Value fields are written once
// at construction.
unsafe impl Send for Isolate {}
// SAFETY: see above.
unsafe impl Sync for Isolate {}

impl Isolate {
    pub fn parent(&self) -> Option<Value> {
        self.parent
    }

    pub fn bound_thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Register a trace/event hook value owned by this isolate.
    pub fn add_event_hook(&self, hook: Value) {
        self.hooks.lock().push(hook);
    }

    pub fn event_hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Root values of the bound threads, for embedders and tests.
    pub fn bound_thread_roots(&self) -> Vec<Value> {
        self.threads.lock().iter().map(|t| t.root).collect()
    }

    pub(crate) fn add_bound_thread(&self, record: BoundThread) {
        self.threads.lock().push(record);
    }

    /// Raw access for the trace pass, which runs stop-the-world and must
    /// not take locks.
    pub(crate) fn threads_data_ptr(&self) -> *mut Vec<BoundThread> {
        self.threads.data_ptr()
    }

    /// Raw access for the trace pass; see [`Isolate::threads_data_ptr`].
    pub(crate) fn hooks_data_ptr(&self) -> *mut Vec<Value> {
        self.hooks.data_ptr()
    }
}

/// Heap wrapper handing an [`Isolate`] to managed code.
#[repr(C)]
pub struct IsolateObject {
    pub header: Header,
    pub isolate: *mut Isolate,
}

impl IsolateObject {
    /// # Safety
    ///
    /// `self.isolate` must still be owned by this object (the heap has not
    /// been torn down).
    #[inline(always)]
    pub unsafe fn isolate(&self) -> &Isolate {
        unsafe { &*self.isolate }
    }
}

/// Heap finalizer releasing the native isolate state. Bound threads are not
/// joined here.
pub(crate) unsafe fn finalize_isolate(obj: *mut u8) {
    let iobj = unsafe { &mut *(obj as *mut IsolateObject) };
    // SAFETY: the pointer was produced by Box::into_raw in `spawn_task` and
    // the finalizer runs exactly once.
    drop(unsafe { Box::from_raw(iobj.isolate) });
}

// ── Current-isolate binding ────────────────────────────────────────

thread_local! {
    static CURRENT_ISOLATE: Cell<Option<Value>> = const { Cell::new(None) };
}

/// Bind the calling thread to `isolate`. Done once per bound thread, before
/// it runs any managed work.
pub(crate) fn bind_current(isolate: Value) {
    CURRENT_ISOLATE.with(|current| current.set(Some(isolate)));
}

pub fn try_current() -> Option<Value> {
    CURRENT_ISOLATE.with(|current| current.get())
}

/// The calling thread's owning isolate handle.
pub fn current() -> Value {
    try_current().expect("thread is not bound to an isolate")
}

/// The spawning isolate of the calling thread's isolate; `None` for the
/// root isolate.
pub fn parent() -> Option<Value> {
    // SAFETY: isolate objects stay live for the heap's lifetime.
    unsafe { current().as_ref::<IsolateObject>().isolate() }.parent()
}

// ── Construction ───────────────────────────────────────────────────

/// The argv-shaped construction entry point: only zero-argument
/// construction is supported.
pub fn spawn_with(
    m: &mut Mutator,
    args: &[Value],
) -> Result<Tagged<IsolateObject>, SpawnError> {
    if !args.is_empty() {
        return Err(SpawnError::ArgumentsUnsupported);
    }
    Ok(spawn_task(m, |_| {}))
}

/// Spawn a new isolate whose bound thread runs an initial empty task.
pub fn spawn(m: &mut Mutator) -> Result<Tagged<IsolateObject>, SpawnError> {
    spawn_with(m, &[])
}

/// Spawn a new isolate whose bound thread runs `task` as its initial work.
///
/// The isolate is registered before the thread subsystem is asked for the
/// thread, so `list` observes it immediately.
pub fn spawn_task<F>(m: &mut Mutator, task: F) -> Tagged<IsolateObject>
where
    F: FnOnce(&mut Mutator),
    F: Send + 'static,
{
    let id = m.rt.next_isolate_id();
    let parent = try_current();
    let default_channel = channel::create(m);

    let native = Box::into_raw(Box::new(Isolate {
        id,
        parent,
        default_channel: default_channel.value(),
        threads: Mutex::new(Vec::new()),
        hooks: Mutex::new(Vec::new()),
    }));

    let layout = Layout::new::<IsolateObject>();
    let ptr = m.proxy.allocate(layout).as_ptr() as *mut IsolateObject;
    // SAFETY: freshly allocated, correctly sized.
    unsafe {
        ptr.write(IsolateObject {
            header: Header::new(ObjectType::Isolate),
            isolate: native,
        });
    }
    m.rt.heap().register_finalizer(ptr as *mut u8, finalize_isolate);

    let value = Value::from_ptr(ptr);
    m.rt.register_isolate(value);
    debug!(
        "isolate {id} spawned (parent {:?})",
        parent.map(|p| unsafe { p.as_ref::<IsolateObject>().isolate() }.id)
    );

    let root = threading::alloc_thread_object(
        &mut m.proxy,
        threading::fresh_thread_token(),
    );
    let thread = threading::spawn_bound(&m.rt, value, task);
    // SAFETY: just initialized above.
    unsafe { &*native }.add_bound_thread(BoundThread {
        root: root.value(),
        native: Arc::downgrade(&thread),
    });

    Tagged::from_value(value)
}

/// Create the root isolate during runtime construction: no parent, no bound
/// native thread, the constructing thread is bound to it.
pub(crate) fn boot_root(m: &mut Mutator) -> Value {
    let id = m.rt.next_isolate_id();
    let default_channel = channel::create(m);
    let native = Box::into_raw(Box::new(Isolate {
        id,
        parent: None,
        default_channel: default_channel.value(),
        threads: Mutex::new(Vec::new()),
        hooks: Mutex::new(Vec::new()),
    }));

    let layout = Layout::new::<IsolateObject>();
    let ptr = m.proxy.allocate(layout).as_ptr() as *mut IsolateObject;
    // SAFETY: freshly allocated, correctly sized.
    unsafe {
        ptr.write(IsolateObject {
            header: Header::new(ObjectType::Isolate),
            isolate: native,
        });
    }
    m.rt.heap().register_finalizer(ptr as *mut u8, finalize_isolate);

    let value = Value::from_ptr(ptr);
    m.rt.register_isolate(value);
    bind_current(value);
    debug!("isolate {id} booted as root");
    value
}

// ── Static surface ─────────────────────────────────────────────────

/// Snapshot of every registered isolate handle, in creation order.
pub fn list(m: &Mutator) -> Vec<Value> {
    m.rt.isolates()
}

/// Blocking receive on the current isolate's default channel.
pub fn receive_current(m: &Mutator) -> Value {
    receive_from(m, Tagged::from_value(current()))
}

/// Publish one result to the parent's default channel by deep copy, without
/// holding an explicit reference to it.
pub fn yield_value(m: &mut Mutator, value: Value) -> Result<(), TransferError> {
    let parent = parent().ok_or(TransferError::NoParent)?;
    channel::transfer_copy(m, default_channel(Tagged::from_value(parent)), value)
}

// ── Instance shorthands ────────────────────────────────────────────

pub fn default_channel(isolate: Tagged<IsolateObject>) -> Tagged<ChannelObject> {
    // SAFETY: isolate objects stay live for the heap's lifetime.
    Tagged::from_value(unsafe { isolate.as_ref().isolate() }.default_channel)
}

/// `send` / `<<`: transfer_copy onto the isolate's default channel.
pub fn send(
    m: &mut Mutator,
    isolate: Tagged<IsolateObject>,
    value: Value,
) -> Result<(), TransferError> {
    channel::transfer_copy(m, default_channel(isolate), value)
}

/// `move`: transfer_move onto the isolate's default channel.
pub fn move_into(
    m: &mut Mutator,
    isolate: Tagged<IsolateObject>,
    value: Value,
) -> Result<(), TransferError> {
    channel::transfer_move(m, default_channel(isolate), value)
}

/// `share`: transfer_reference_danger onto the isolate's default channel.
pub fn share(isolate: Tagged<IsolateObject>, value: Value) {
    channel::transfer_reference_danger(default_channel(isolate), value);
}

/// Blocking receive on the isolate's default channel.
pub fn receive_from(m: &Mutator, isolate: Tagged<IsolateObject>) -> Value {
    channel::receive(m, default_channel(isolate))
}
