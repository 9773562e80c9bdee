use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::process;
use std::sync::{Condvar, Mutex, MutexGuard};

use log::{error, trace};

use object::{Header, ObjectType, Tagged, Value};

use crate::runtime::Mutator;
use crate::transfer::{self, TransferError};

/// Capacity floor once the queue holds anything at all.
const MIN_CAPACITY: usize = 8;

/// Queue state, protected by [`Channel`]'s lock.
struct Queue {
    slots: Vec<Value>,
    size: usize,
    /// Next write index.
    head: usize,
    /// Next read index.
    tail: usize,
}

impl Queue {
    /// Invariants: `0 <= size <= capacity`; whenever capacity > 0,
    /// `head == (tail + size) % capacity`.
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Double the slot vector (floor [`MIN_CAPACITY`]), compacting the live
    /// elements to `0..size` in FIFO order.
    fn grow(&mut self) {
        let old_capacity = self.capacity();
        let new_capacity = (old_capacity * 2).max(MIN_CAPACITY);
        let mut slots = vec![Value::from_i64(0); new_capacity];
        for i in 0..self.size {
            slots[i] = self.slots[(self.tail + i) % old_capacity];
        }
        self.slots = slots;
        self.tail = 0;
        self.head = self.size;
    }
}

/// A synchronized, growable FIFO queue of managed values.
///
/// One lock and one condition variable per channel; the buffer and indices
/// are only touched while the lock is held. The sole blocking operation is
/// [`Channel::pop`] on an empty queue.
pub struct Channel {
    queue: UnsafeCell<Queue>,
    lock: Mutex<()>,
    available: Condvar,
}

// SAFETY: the queue cell is only accessed under `lock`, except by the
// trace pass, which runs while every mutator thread is stopped.
unsafe impl Send for Channel {}
// SAFETY: see above.
unsafe impl Sync for Channel {}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    /// An empty channel with capacity 0; the first push grows the buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: UnsafeCell::new(Queue {
                slots: Vec::new(),
                size: 0,
                head: 0,
                tail: 0,
            }),
            lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => die("channel mutex poisoned"),
        }
    }

    /// Append `value` and wake one waiter. Never blocks on data
    /// availability; a full buffer is grown in place (O(n)).
    pub fn push(&self, value: Value) {
        let _guard = self.lock_queue();
        // SAFETY: the lock is held.
        let queue = unsafe { &mut *self.queue.get() };
        if queue.size == queue.capacity() {
            queue.grow();
        }
        let capacity = queue.capacity();
        queue.slots[queue.head] = value;
        queue.size += 1;
        queue.head = (queue.head + 1) % capacity;
        trace!(
            "channel push: capacity {} size {} head {} tail {}",
            capacity, queue.size, queue.head, queue.tail
        );
        self.available.notify_one();
    }

    /// Remove and return the oldest value, waiting indefinitely while the
    /// queue is empty.
    ///
    /// This is the subsystem's only suspension point. Callers executing
    /// managed work must route it through [`Gvl::without`](crate::Gvl::without)
    /// (see [`receive`]) so the native wait does not stall other isolates.
    pub fn pop(&self) -> Value {
        let mut guard = self.lock_queue();
        loop {
            // SAFETY: the lock is held.
            let queue = unsafe { &mut *self.queue.get() };
            if queue.size == 0 {
                guard = match self.available.wait(guard) {
                    Ok(guard) => guard,
                    Err(_) => die("channel condvar poisoned"),
                };
                continue;
            }
            let value = queue.slots[queue.tail];
            queue.tail = (queue.tail + 1) % queue.capacity();
            queue.size -= 1;
            trace!(
                "channel pop: capacity {} size {} head {} tail {}",
                queue.capacity(),
                queue.size,
                queue.head,
                queue.tail
            );
            return value;
        }
    }

    pub fn len(&self) -> usize {
        let _guard = self.lock_queue();
        // SAFETY: the lock is held.
        unsafe { &*self.queue.get() }.size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live buffered values as one or two contiguous spans: `[tail, head)`
    /// when the queue does not wrap, otherwise `[tail, capacity)` and
    /// `[0, head)`.
    ///
    /// # Safety
    ///
    /// Bypasses the channel lock. Must only be called while every thread
    /// that could touch this channel is stopped (a trace pass inside a
    /// stop-the-world phase).
    pub unsafe fn live_ranges(&self) -> (&mut [Value], &mut [Value]) {
        let queue = unsafe { &mut *self.queue.get() };
        if queue.size == 0 {
            return (&mut [], &mut []);
        }
        let base = queue.slots.as_mut_ptr();
        if queue.tail < queue.head {
            let front = unsafe {
                core::slice::from_raw_parts_mut(
                    base.add(queue.tail),
                    queue.head - queue.tail,
                )
            };
            (front, &mut [])
        } else {
            let front = unsafe {
                core::slice::from_raw_parts_mut(
                    base.add(queue.tail),
                    queue.capacity() - queue.tail,
                )
            };
            let back = unsafe {
                core::slice::from_raw_parts_mut(base, queue.head)
            };
            (front, back)
        }
    }
}

fn die(message: &str) -> ! {
    error!("{message}");
    process::abort()
}

// ── ChannelObject ──────────────────────────────────────────────────

/// Heap wrapper handing a [`Channel`] to managed code.
#[repr(C)]
pub struct ChannelObject {
    pub header: Header,
    pub channel: *mut Channel,
}

impl ChannelObject {
    /// # Safety
    ///
    /// `self.channel` must still be owned by this object (the heap has not
    /// been torn down).
    #[inline(always)]
    pub unsafe fn channel(&self) -> &Channel {
        unsafe { &*self.channel }
    }
}

/// Heap finalizer: dropping the native box destroys the channel's lock and
/// condition variable.
pub(crate) unsafe fn finalize_channel(obj: *mut u8) {
    let chobj = unsafe { &mut *(obj as *mut ChannelObject) };
    // SAFETY: the pointer was produced by Box::into_raw in `create` and the
    // finalizer runs exactly once.
    drop(unsafe { Box::from_raw(chobj.channel) });
}

/// Allocate a channel heap object owning a fresh native channel.
pub fn create(m: &mut Mutator) -> Tagged<ChannelObject> {
    let native = Box::into_raw(Box::new(Channel::new()));
    let layout = Layout::new::<ChannelObject>();
    let ptr = m.proxy.allocate(layout).as_ptr() as *mut ChannelObject;
    // SAFETY: freshly allocated, correctly sized.
    unsafe {
        ptr.write(ChannelObject {
            header: Header::new(ObjectType::Channel),
            channel: native,
        });
    }
    m.rt.heap().register_finalizer(ptr as *mut u8, finalize_channel);
    Tagged::from_value(Value::from_ptr(ptr))
}

// ── Transfer operations ────────────────────────────────────────────

/// Enqueue a deep copy of `value`. The copy is fully computed before the
/// channel lock is touched, so a failed transfer leaves the queue unchanged.
pub fn transfer_copy(
    m: &mut Mutator,
    ch: Tagged<ChannelObject>,
    value: Value,
) -> Result<(), TransferError> {
    let transferred = transfer::copy_value(m, value)?;
    // SAFETY: channel objects stay live for the heap's lifetime.
    unsafe { ch.as_ref().channel() }.push(transferred);
    Ok(())
}

/// Enqueue `value` under the destructive move discipline, hollowing the
/// source. Computed before the channel lock is touched.
pub fn transfer_move(
    m: &mut Mutator,
    ch: Tagged<ChannelObject>,
    value: Value,
) -> Result<(), TransferError> {
    let transferred = transfer::move_value(m, value)?;
    // SAFETY: channel objects stay live for the heap's lifetime.
    unsafe { ch.as_ref().channel() }.push(transferred);
    Ok(())
}

/// Enqueue `value` as-is — no copy, no extra synchronization.
///
/// This deliberately breaks isolation: after the receiver pops, both
/// isolates hold the same object and may mutate it concurrently with no
/// protection beyond whatever the object itself provides.
pub fn transfer_reference_danger(ch: Tagged<ChannelObject>, value: Value) {
    // SAFETY: channel objects stay live for the heap's lifetime.
    unsafe { ch.as_ref().channel() }.push(value);
}

/// Blocking receive, releasing the cooperative execution lock for the
/// duration of the native wait.
pub fn receive(m: &Mutator, ch: Tagged<ChannelObject>) -> Value {
    // SAFETY: channel objects stay live for the heap's lifetime.
    let channel = unsafe { ch.as_ref().channel() };
    m.rt.gvl().without(|| channel.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::SeqCst};
    use std::thread;
    use std::time::{Duration, Instant};

    fn fx(n: i64) -> Value {
        Value::from_i64(n)
    }

    #[test]
    fn fifo_order_for_a_single_consumer() {
        let ch = Channel::new();
        for n in 1..=5 {
            ch.push(fx(n));
        }
        for n in 1..=5 {
            assert_eq!(ch.pop(), fx(n));
        }
        assert!(ch.is_empty());
    }

    #[test]
    fn first_push_grows_from_capacity_zero() {
        let ch = Channel::new();
        assert_eq!(ch.len(), 0);
        ch.push(fx(1));
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.pop(), fx(1));
    }

    #[test]
    fn growth_preserves_contents_and_order() {
        let ch = Channel::new();
        // One more than the first grown capacity forces a second resize.
        let count = (MIN_CAPACITY + 1) as i64;
        for n in 0..count {
            ch.push(fx(n));
        }
        assert_eq!(ch.len(), count as usize);
        for n in 0..count {
            assert_eq!(ch.pop(), fx(n), "element {n} out of order after growth");
        }
    }

    #[test]
    fn growth_of_a_wrapped_queue_compacts_in_order() {
        let ch = Channel::new();
        for n in 0..MIN_CAPACITY as i64 {
            ch.push(fx(n));
        }
        // Wrap: consume three, refill three, then overflow.
        for n in 0..3 {
            assert_eq!(ch.pop(), fx(n));
        }
        for n in 0..3 {
            ch.push(fx(100 + n));
        }
        ch.push(fx(200));
        let mut popped = Vec::new();
        while !ch.is_empty() {
            popped.push(unsafe { ch.pop().to_i64() });
        }
        assert_eq!(popped, vec![3, 4, 5, 6, 7, 100, 101, 102, 200]);
    }

    #[test]
    fn pop_blocks_until_a_push_arrives() {
        let ch = Arc::new(Channel::new());
        let got = Arc::new(AtomicI64::new(0));
        let returned = Arc::new(AtomicBool::new(false));

        let ch2 = ch.clone();
        let got2 = got.clone();
        let returned2 = returned.clone();
        let consumer = thread::spawn(move || {
            let value = ch2.pop();
            got2.store(unsafe { value.to_i64() }, SeqCst);
            returned2.store(true, SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!returned.load(SeqCst), "pop returned without data");

        ch.push(fx(99));

        let start = Instant::now();
        while !returned.load(SeqCst) && start.elapsed() < Duration::from_secs(1)
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(returned.load(SeqCst), "pop did not wake after push");
        assert_eq!(got.load(SeqCst), 99);
        consumer.join().unwrap();
    }

    #[test]
    fn each_push_wakes_one_waiter() {
        let ch = Arc::new(Channel::new());
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let ch2 = ch.clone();
            consumers.push(thread::spawn(move || unsafe { ch2.pop().to_i64() }));
        }
        thread::sleep(Duration::from_millis(20));
        for n in 0..4 {
            ch.push(fx(n));
        }
        let mut received: Vec<i64> = consumers
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect();
        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn live_ranges_cover_a_wrapped_buffer() {
        let ch = Channel::new();
        for n in 0..MIN_CAPACITY as i64 {
            ch.push(fx(n));
        }
        for n in 0..3 {
            assert_eq!(ch.pop(), fx(n));
        }
        for n in 0..2 {
            ch.push(fx(50 + n));
        }

        // tail = 3, head = 2: the live values wrap around the end.
        let (front, back) = unsafe { ch.live_ranges() };
        assert_eq!(front.len(), MIN_CAPACITY - 3);
        assert_eq!(back.len(), 2);
        let live: Vec<i64> = front
            .iter()
            .chain(back.iter())
            .map(|v| unsafe { v.to_i64() })
            .collect();
        assert_eq!(live, vec![3, 4, 5, 6, 7, 50, 51]);
    }

    #[test]
    fn live_ranges_of_empty_queue_are_empty() {
        let ch = Channel::new();
        let (front, back) = unsafe { ch.live_ranges() };
        assert!(front.is_empty());
        assert!(back.is_empty());

        ch.push(fx(1));
        ch.pop();
        let (front, back) = unsafe { ch.live_ranges() };
        assert!(front.is_empty());
        assert!(back.is_empty());
    }

    #[test]
    fn live_ranges_of_full_buffer_cover_capacity() {
        let ch = Channel::new();
        for n in 0..MIN_CAPACITY as i64 {
            ch.push(fx(n));
        }
        let (front, back) = unsafe { ch.live_ranges() };
        assert_eq!(front.len() + back.len(), MIN_CAPACITY);
    }
}
