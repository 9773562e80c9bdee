use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// The cooperative execution lock.
///
/// A thread holds this while it executes managed work on behalf of an
/// isolate. Any native call that can block indefinitely must go through
/// [`Gvl::without`], so a blocked thread never stalls the other isolates or
/// a collection cycle.
#[derive(Default)]
pub struct Gvl {
    owner: Mutex<Option<ThreadId>>,
    handoff: Condvar,
}

impl Gvl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            handoff: Condvar::new(),
        }
    }

    /// Block until the lock is free, then take it. Not reentrant.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        debug_assert_ne!(*owner, Some(me), "cooperative lock is not reentrant");
        while owner.is_some() {
            self.handoff.wait(&mut owner);
        }
        *owner = Some(me);
    }

    /// Hand the lock back. The calling thread must hold it.
    pub fn release(&self) {
        let me = thread::current().id();
        {
            let mut owner = self.owner.lock();
            debug_assert_eq!(*owner, Some(me), "releasing a lock we do not hold");
            *owner = None;
        }
        self.handoff.notify_one();
    }

    /// Whether the calling thread currently holds the lock.
    pub fn held_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Run `f` with the lock released, reacquiring it afterwards.
    ///
    /// A caller that does not hold the lock runs `f` directly; this lets the
    /// embedding thread use blocking operations without first joining the
    /// cooperative protocol.
    pub fn without<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.held_by_current() {
            self.release();
            let result = f();
            self.acquire();
            result
        } else {
            f()
        }
    }
}
