//! A fair rwlock built on a FIFO queue of locally-spinning waiters, in the
//! tradition of [MCS locks](https://dl.acm.org/doi/10.1145/103727.103729).
//! Arrival is a single atomic exchange on the queue tail; the lock is granted
//! in strict arrival order, with contiguous readers coalescing into one
//! concurrent batch.

use alloc::boxed::Box;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering},
};
use spin::{relax::Spin, RelaxStrategy};

use crate::spinlock::SpinMutex;

const WRITER: u8 = 0;
const READER: u8 = 1;
const ACTIVE_READER: u8 = 2;

/// One node in the wait queue, representing a single acquisition.
///
/// Aligned to a cache line so that neighbouring waiters never spin on the
/// same line.
#[repr(align(64))]
struct Waiter {
    /// `WRITER`, `READER` (queued, not yet granted) or `ACTIVE_READER`.
    /// Written by the owner before the node is published; the successor reads
    /// it to decide whether it may run alongside an already-active reader.
    state: AtomicU8,

    /// Local spin cell: 1 = wait, 0 = granted. Cleared exactly once, either
    /// by the predecessor on release or by a preceding reader's activation
    /// cascade.
    spin: AtomicUsize,

    /// Queue neighbours. `next` is stored by the successor after it swapped
    /// itself into the tail; `prev` is maintained by the unlink protocol.
    next: AtomicPtr<Waiter>,
    prev: AtomicPtr<Waiter>,

    /// Serialises this node's mid-list unlink with its immediate
    /// predecessor's.
    unlink: SpinMutex,
}

const_assert_eq!(core::mem::size_of::<Waiter>(), 64);

impl Waiter {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(READER),
            spin: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            unlink: SpinMutex::new(),
        }
    }
}

/// Waits until a successor has finished linking itself behind `node`.
fn wait_for_next(node: &Waiter) -> *mut Waiter {
    loop {
        let next = node.next.load(Ordering::Acquire);
        if !next.is_null() {
            return next;
        }
        Spin::relax();
    }
}

/// The queue protocol. The tail pointer is the only shared mutable cell not
/// owned by some waiter; everything else lives inside the nodes.
struct WaitQueue {
    tail: AtomicPtr<Waiter>,
}

impl WaitQueue {
    const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Enqueues `node` in writer mode and spins until exclusive ownership is
    /// granted.
    ///
    /// # Safety
    ///
    /// `node` must not currently be enqueued, must stay allocated until the
    /// queue no longer references it (see [`WaiterPool`]), and must be passed
    /// to [`unlock_write`](WaitQueue::unlock_write) by the same thread.
    unsafe fn lock_write(&self, node: &Waiter) {
        node.state.store(WRITER, Ordering::Relaxed);
        node.spin.store(1, Ordering::Relaxed);
        node.next.store(ptr::null_mut(), Ordering::Relaxed);

        // The exchange both publishes the node and hands back the unique
        // predecessor; the field stores above are ordered before publication
        // by the AcqRel swap.
        let this = node as *const Waiter as *mut Waiter;
        let pred = self.tail.swap(this, Ordering::AcqRel);
        if pred.is_null() {
            // Empty queue, the lock is ours.
            return;
        }

        (*pred).next.store(this, Ordering::Release);
        while node.spin.load(Ordering::Acquire) != 0 {
            Spin::relax();
        }
    }

    /// Releases exclusive ownership and hands the lock to the successor, if
    /// any.
    ///
    /// # Safety
    ///
    /// `node` must be the head of the queue, granted by
    /// [`lock_write`](WaitQueue::lock_write) on this thread.
    unsafe fn unlock_write(&self, node: &Waiter) {
        let this = node as *const Waiter as *mut Waiter;
        if node.next.load(Ordering::Acquire).is_null()
            && self
                .tail
                .compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Nobody queued behind us.
            return;
        }

        // A failed CAS means tail != node: some arrival exchanged past us
        // and still has to store node.next as part of its linking step.
        let next = wait_for_next(node);

        // The new head has no predecessor; publish that before the grant so
        // the successor observes it once its spin cell clears.
        (*next).prev.store(ptr::null_mut(), Ordering::Release);
        (*next).spin.store(0, Ordering::Release);
    }

    /// Enqueues `node` in reader mode and spins until shared ownership is
    /// granted.
    ///
    /// # Safety
    ///
    /// As [`lock_write`](WaitQueue::lock_write), with the matching release
    /// being [`unlock_read`](WaitQueue::unlock_read).
    unsafe fn lock_read(&self, node: &Waiter) {
        node.state.store(READER, Ordering::Relaxed);
        node.spin.store(1, Ordering::Relaxed);
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.prev.store(ptr::null_mut(), Ordering::Relaxed);

        let this = node as *const Waiter as *mut Waiter;
        let pred = self.tail.swap(this, Ordering::AcqRel);
        if !pred.is_null() {
            node.prev.store(pred, Ordering::Release);
            (*pred).next.store(this, Ordering::Release);

            // An already-active reader admits us directly. Reading a stale
            // READER here only means we wait for the predecessor's cascade
            // or release instead, never that we run too early.
            if (*pred).state.load(Ordering::Acquire) != ACTIVE_READER {
                while node.spin.load(Ordering::Acquire) != 0 {
                    Spin::relax();
                }
            }
        }

        // Activation cascade: wake the next queued reader, which in turn
        // wakes the one after it, so a whole batch becomes active in bounded
        // steps.
        let next = node.next.load(Ordering::Acquire);
        if !next.is_null() && (*next).state.load(Ordering::Acquire) == READER {
            (*next).spin.store(0, Ordering::Release);
        }

        node.state.store(ACTIVE_READER, Ordering::Release);
    }

    /// Releases shared ownership, unlinking `node` from wherever it sits in
    /// the queue.
    ///
    /// # Safety
    ///
    /// `node` must have been granted by [`lock_read`](WaitQueue::lock_read)
    /// on this thread.
    unsafe fn unlock_read(&self, node: &Waiter) {
        let this = node as *const Waiter as *mut Waiter;

        let mut prev = node.prev.load(Ordering::Acquire);
        if !prev.is_null() {
            (*prev).unlink.lock();

            // The predecessor may have departed between the load and the
            // lock. Each pass consumes one departed predecessor, so the loop
            // is bounded by the number of concurrently releasing readers.
            loop {
                let cur = node.prev.load(Ordering::Acquire);
                if cur == prev {
                    break;
                }
                (*prev).unlink.unlock();
                prev = cur;
                if prev.is_null() {
                    break;
                }
                (*prev).unlink.lock();
            }

            if !prev.is_null() {
                // `prev` is pinned now: its own release needs the lock we
                // hold. Unlink locks are always taken in queue order, so two
                // adjacent departures cannot deadlock.
                node.unlink.lock();

                (*prev).next.store(ptr::null_mut(), Ordering::Release);

                let mut next = node.next.load(Ordering::Acquire);
                if next.is_null()
                    && self
                        .tail
                        .compare_exchange(this, prev, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    // The CAS can only fail because tail != node, which
                    // means some arrival's exchange linearised after our
                    // publication and that arrival must still store
                    // node.next. The wait below is therefore bounded; do not
                    // restructure it into a retry of the CAS.
                    next = wait_for_next(node);
                }

                if !next.is_null() {
                    // Splice ourselves out of the middle.
                    (*next).prev.store(prev, Ordering::Release);
                    (*prev).next.store(next, Ordering::Release);
                }

                node.unlink.unlock();
                (*prev).unlink.unlock();
                return;
            }
        }

        // Head departure: nothing in front of us any more, so the successor
        // (present or still linking) inherits the lock.
        node.unlink.lock();

        let mut next = node.next.load(Ordering::Acquire);
        if next.is_null()
            && self
                .tail
                .compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            next = wait_for_next(node);
        }

        if !next.is_null() {
            (*next).spin.store(0, Ordering::Release);
            (*next).prev.store(ptr::null_mut(), Ordering::Release);
        }

        node.unlink.unlock();
    }
}

/// Freelist of waiter nodes, linked through their `next` fields.
///
/// Nodes are recycled rather than freed so that a releasing reader's
/// successor, which may still test-and-set a departed predecessor's `unlink`
/// mutex after that release returned, always lands on live storage. The
/// whole pool is freed when the lock is dropped; guards borrow the lock, so
/// no waiter can be outstanding at that point.
struct WaiterPool {
    lock: SpinMutex,
    /// Freelist head. Guarded by `lock`.
    head: UnsafeCell<*mut Waiter>,
}

impl WaiterPool {
    const fn new() -> Self {
        Self {
            lock: SpinMutex::new(),
            head: UnsafeCell::new(ptr::null_mut()),
        }
    }

    fn get(&self) -> NonNull<Waiter> {
        self.lock.lock();
        let head = unsafe { *self.head.get() };
        if head.is_null() {
            self.lock.unlock();
            return unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Waiter::new()))) };
        }
        unsafe {
            *self.head.get() = (*head).next.load(Ordering::Relaxed);
            self.lock.unlock();
            NonNull::new_unchecked(head)
        }
    }

    fn put(&self, node: NonNull<Waiter>) {
        self.lock.lock();
        unsafe {
            node.as_ref().next.store(*self.head.get(), Ordering::Relaxed);
            *self.head.get() = node.as_ptr();
        }
        self.lock.unlock();
    }
}

impl Drop for WaiterPool {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

/// A fair [read-write lock](https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock).
///
/// Threads are admitted strictly in arrival order: writers get the lock
/// alone, while a run of readers that queued next to each other shares it.
/// Waiters spin on a word of their own rather than on a shared flag, so a
/// grant touches only the cache line of the thread being woken and arrival
/// cost does not grow with the number of waiters.
///
/// Compared to a count-based rwlock this never starves either side: a writer
/// behind ten readers runs after exactly those ten, and readers behind that
/// writer run after it.
pub struct RwLock<T> {
    queue: WaitQueue,
    pool: WaiterPool,
    data: UnsafeCell<T>,
}

/// Guard that provides read-only access to the underlying data.
pub struct ReadGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    node: NonNull<Waiter>,
    data: &'a T,
}

/// Guard that provides exclusive read-write access to the underlying data.
pub struct WriteGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    node: NonNull<Waiter>,
    data: &'a mut T,
}

impl<T> RwLock<T> {
    /// Creates a new rwlock wrapping the passed data.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            queue: WaitQueue::new(),
            pool: WaiterPool::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock for read, spinning until shared ownership is
    /// granted.
    ///
    /// Readers that arrive while another reader holds the lock (with no
    /// writer queued in between) run concurrently with it. A reader that
    /// arrives behind a queued writer waits for that writer first.
    ///
    /// Re-acquiring on a thread that already holds the lock deadlocks or
    /// worse; this is not detected.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let node = self.pool.get();
        // Safety: the node came fresh from the pool, the pool keeps it
        // allocated for the lifetime of the lock, and the matching unlock
        // runs in the guard's drop on this thread (guards are not Send).
        unsafe { self.queue.lock_read(node.as_ref()) };

        ReadGuard {
            lock: self,
            node,
            data: unsafe { &*self.data.get() },
        }
    }

    /// Acquires the lock for write, spinning until exclusive ownership is
    /// granted.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let node = self.pool.get();
        // Safety: as in `read`.
        unsafe { self.queue.lock_write(node.as_ref()) };

        WriteGuard {
            lock: self,
            node,
            data: unsafe { &mut *self.data.get() },
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.tail.load(Ordering::SeqCst).is_null()
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: the node was granted by lock_read in `RwLock::read` and is
        // released exactly once, here. It goes back to the pool only after
        // the queue is done with it.
        unsafe { self.lock.queue.unlock_read(self.node.as_ref()) };
        self.lock.pool.put(self.node);
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: as for ReadGuard.
        unsafe { self.lock.queue.unlock_write(self.node.as_ref()) };
        self.lock.pool.put(self.node);
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}
