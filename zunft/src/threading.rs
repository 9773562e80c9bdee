use std::alloc::Layout;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use heap::HeapProxy;
use object::{Header, ObjectType, Tagged, Value};

use crate::isolate;
use crate::runtime::{Mutator, Runtime};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique token identifying one bound thread.
pub fn fresh_thread_token() -> u64 {
    NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// A native OS thread with a joinable completion state.
///
/// The completion pair lets any number of observers wait (with or without a
/// timeout) regardless of who consumes the underlying join handle.
pub struct NativeThread {
    handle: Mutex<Option<JoinHandle<()>>>,
    done: (Mutex<bool>, Condvar),
}

impl NativeThread {
    pub fn spawn<F>(f: F) -> Arc<Self>
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        let nt = Arc::new(Self {
            handle: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
        });

        let nt2 = Arc::clone(&nt);
        let h = thread::spawn(move || {
            f();
            let (ref mx, ref cv) = nt2.done;
            *mx.lock() = true;
            cv.notify_all();
        });
        *nt.handle.lock() = Some(h);
        nt
    }

    pub fn is_done(&self) -> bool {
        *self.done.0.lock()
    }

    /// Wait for completion for at most `dur`. Returns whether the thread
    /// finished.
    pub fn join_timeout(&self, dur: Duration) -> bool {
        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        if *done {
            return true;
        }
        let res = cv.wait_for(&mut done, dur);
        !res.timed_out() && *done
    }

    /// Wait for completion.
    pub fn join(&self) {
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
            let (ref mx, ref cv) = self.done;
            *mx.lock() = true;
            cv.notify_all();
            return;
        }

        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        while !*done {
            cv.wait(&mut done);
        }
    }
}

// ── ThreadObject ───────────────────────────────────────────────────

/// The heap root value of one bound thread.
///
/// Carries no edges of its own; it is kept alive through the owning
/// isolate's bound-thread set during a trace pass.
#[repr(C)]
pub struct ThreadObject {
    pub header: Header,
    pub token: u64,
}

const _: () = assert!(size_of::<ThreadObject>() == 16);

pub fn alloc_thread_object(
    proxy: &mut HeapProxy,
    token: u64,
) -> Tagged<ThreadObject> {
    let layout = Layout::new::<ThreadObject>();
    let ptr = proxy.allocate(layout).as_ptr() as *mut ThreadObject;
    // SAFETY: freshly allocated, correctly sized.
    unsafe {
        ptr.write(ThreadObject {
            header: Header::new(ObjectType::Thread),
            token,
        });
    }
    Tagged::from_value(Value::from_ptr(ptr))
}

// ── Binding ────────────────────────────────────────────────────────

/// Create one native thread bound to `isolate`, running `task` as its
/// initial work while holding the cooperative execution lock.
pub fn spawn_bound<F>(rt: &Runtime, isolate: Value, task: F) -> Arc<NativeThread>
where
    F: FnOnce(&mut Mutator),
    F: Send + 'static,
{
    let rt = rt.clone();
    NativeThread::spawn(move || {
        isolate::bind_current(isolate);
        let mut mutator = rt.mutator();
        rt.gvl().acquire();
        task(&mut mutator);
        rt.gvl().release();
    })
}
