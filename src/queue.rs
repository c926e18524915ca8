// Copyright (c) 2025 HazardQueue Contributors
//
// Lock-free queue implementation
//
// This module implements the Michael-Scott lock-free queue algorithm, a
// non-blocking FIFO queue driven by compare-and-swap operations, with
// hazard pointers guarding every dereference of shared nodes.
// References: "Simple, Fast, and Practical Non-Blocking and Blocking
// Concurrent Queue Algorithms" by Michael and Scott (1996); Michael's
// hazard-pointer reclamation scheme (2004).

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use log::debug;

use crate::hazard::{self, HazardGuard, HP_PRIMARY, HP_SUCCESSOR};
use crate::Backoff;

/// Node allocations currently live anywhere in the process.
static LIVE_NODES: AtomicUsize = AtomicUsize::new(0);

/// Number of queue nodes currently allocated across every queue in the
/// process, including nodes retired but not yet reclaimed.
///
/// A quiesced process holding one empty queue reports exactly 1 (the
/// dummy node). Embedders can use the gauge as a leak detector.
pub fn live_node_count() -> usize {
    LIVE_NODES.load(Ordering::Relaxed)
}

/// Cache-line padded node to avoid false sharing between neighbors
#[repr(C, align(64))]
struct Node<T> {
    /// The payload slot; uninitialized only for the dummy node, and dead
    /// again once a node becomes the dummy
    data: MaybeUninit<T>,
    /// Pointer to the next node; mutated only by CAS
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Self {
            data: MaybeUninit::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Create a dummy node (no payload)
    fn dummy() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn alloc(node: Self) -> *mut Self {
        LIVE_NODES.fetch_add(1, Ordering::Relaxed);
        Box::into_raw(Box::new(node))
    }

    /// Free a node whose payload slot is dead.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Node::alloc`], be unreachable from any queue,
    /// and hold no live payload.
    unsafe fn free(ptr: *mut Self) {
        drop(Box::from_raw(ptr));
        LIVE_NODES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Node-free function handed to the hazard subsystem. Retired nodes are
/// ex-dummies, so it disposes of the allocation and nothing else.
unsafe fn reclaim_node<T>(ptr: *mut ()) {
    Node::<T>::free(ptr as *mut Node<T>);
}

/// Shared queue state behind the handles.
///
/// Head and tail live on separate cache lines so enqueueing and dequeueing
/// threads do not fight over one line.
#[repr(C)]
struct RawQueue<T> {
    /// Head pointer (for dequeue); always the dummy node
    head: AtomicPtr<Node<T>>,
    /// Padding to separate head and tail into different cache lines
    _pad1: [u8; 56],
    /// Tail pointer (for enqueue)
    tail: AtomicPtr<Node<T>>,
    /// Padding to prevent false sharing with the counters
    _pad2: [u8; 56],
    /// Outstanding handles
    refs: AtomicUsize,
    /// Size estimate (may be slightly inaccurate due to concurrency)
    size: AtomicUsize,
    /// Total successful enqueues
    enqueue_count: AtomicU64,
    /// Total successful dequeues
    dequeue_count: AtomicU64,
}

/// Michael-Scott lock-free queue
///
/// An unbounded multi-producer multi-consumer FIFO. Every handle refers to
/// the same underlying queue: cloning retains it, dropping releases it, and
/// the last drop frees the remaining chain. All operations are lock-free;
/// `dequeue` on an empty queue returns `None` immediately.
///
/// Internally the queue keeps a permanent dummy node at the head, so the
/// empty state is "head and tail coincide and have no successor". Dequeued
/// nodes leave through the hazard-pointer subsystem and are freed only when
/// no thread can still dereference them.
pub struct LockFreeQueue<T: 'static> {
    inner: NonNull<RawQueue<T>>,
    _marker: PhantomData<RawQueue<T>>,
}

// Safety: the queue hands payloads across threads and every shared field
// is atomic or CAS-owned.
unsafe impl<T: Send + 'static> Send for LockFreeQueue<T> {}
unsafe impl<T: Send + 'static> Sync for LockFreeQueue<T> {}

impl<T: 'static> LockFreeQueue<T> {
    /// Create a new empty queue with a single handle.
    pub fn new() -> Self {
        let dummy = Node::alloc(Node::dummy());
        let raw = Box::new(RawQueue {
            head: AtomicPtr::new(dummy),
            _pad1: [0; 56],
            tail: AtomicPtr::new(dummy),
            _pad2: [0; 56],
            refs: AtomicUsize::new(1),
            size: AtomicUsize::new(0),
            enqueue_count: AtomicU64::new(0),
            dequeue_count: AtomicU64::new(0),
        });

        Self {
            // Safety: Box::into_raw never returns null.
            inner: unsafe { NonNull::new_unchecked(Box::into_raw(raw)) },
            _marker: PhantomData,
        }
    }

    fn raw(&self) -> &RawQueue<T> {
        unsafe { self.inner.as_ref() }
    }

    /// Append a value at the tail.
    ///
    /// Lock-free; the operation helps any half-finished enqueue it
    /// observes before linking its own node.
    pub fn enqueue(&self, value: T) {
        let queue = self.raw();
        let node = Node::alloc(Node::new(value));
        let guard = HazardGuard::acquire();
        let mut backoff = Backoff::new();

        loop {
            // Observe the tail and publish it before trusting it.
            let tail = queue.tail.load(Ordering::Acquire);
            guard.set(HP_PRIMARY, tail as *mut ());
            if queue.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // Safety: `tail` is published in the primary slot and was still
            // the tail afterwards, so it cannot have been reclaimed.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if queue.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            if !next.is_null() {
                // A finished link whose tail swing is still pending; help
                // it along before retrying.
                let _ = queue
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
                backoff.spin();
                continue;
            }

            // Safety: as above, `tail` is protected.
            let linked = unsafe {
                (*tail)
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Relaxed)
            };
            match linked {
                Ok(_) => {
                    // Best-effort swing; failure means another thread
                    // already moved the tail past us.
                    let _ = queue
                        .tail
                        .compare_exchange(tail, node, Ordering::AcqRel, Ordering::Relaxed);
                    queue.size.fetch_add(1, Ordering::Relaxed);
                    queue.enqueue_count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Remove and return the value at the head, or `None` when the queue
    /// is empty.
    pub fn dequeue(&self) -> Option<T> {
        let queue = self.raw();
        let guard = HazardGuard::acquire();
        let mut backoff = Backoff::new();

        loop {
            let head = queue.head.load(Ordering::Acquire);
            guard.set(HP_PRIMARY, head as *mut ());
            if queue.head.load(Ordering::Acquire) != head {
                continue;
            }

            let tail = queue.tail.load(Ordering::Acquire);
            // Safety: `head` is published in the primary slot and
            // revalidated below before anything depends on `next`.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            guard.set(HP_SUCCESSOR, next as *mut ());
            if queue.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                // head == tail with no successor: empty.
                return None;
            }

            if head == tail {
                // A linked node the tail swing never reached; repair the
                // tail before consuming past it.
                let _ = queue
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
                backoff.spin();
                continue;
            }

            // The payload must be copied out while the successor slot still
            // covers `next`; once the head swings, another thread may
            // dequeue past `next`, retire it, and free it.
            //
            // Safety: `next` was reached through the validated head and is
            // published in the successor slot; its payload was initialized
            // by the enqueue that linked it. Several threads may take this
            // bitwise copy, but only the winner of the CAS below
            // materializes it.
            let data = unsafe { ptr::read(&(*next).data) };

            let swung = queue
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed);
            match swung {
                Ok(_) => {
                    queue.size.fetch_sub(1, Ordering::Relaxed);
                    queue.dequeue_count.fetch_add(1, Ordering::Relaxed);

                    // `next` is the new dummy and its payload slot is dead
                    // from here on. The old dummy leaves through the hazard
                    // subsystem once our own slots no longer name it.
                    guard.clear_all();
                    unsafe { hazard::retire_with(head as *mut (), reclaim_node::<T>) };

                    // Safety: exactly one thread wins the head swing.
                    return Some(unsafe { data.assume_init() });
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Check whether the queue is empty.
    ///
    /// The answer is immediately stale under concurrency; it is exact once
    /// the queue has quiesced.
    pub fn is_empty(&self) -> bool {
        let queue = self.raw();
        let guard = HazardGuard::acquire();

        loop {
            let head = queue.head.load(Ordering::Acquire);
            guard.set(HP_PRIMARY, head as *mut ());
            if queue.head.load(Ordering::Acquire) != head {
                continue;
            }
            // Safety: `head` is protected and revalidated.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            return next.is_null();
        }
    }

    /// Get an approximate size of the queue
    ///
    /// Note: Due to concurrent operations, this may not be exact.
    pub fn len(&self) -> usize {
        self.raw().size.load(Ordering::Relaxed)
    }

    /// Get statistics about queue operations
    pub fn stats(&self) -> QueueStats {
        let queue = self.raw();
        QueueStats {
            enqueue_count: queue.enqueue_count.load(Ordering::Relaxed),
            dequeue_count: queue.dequeue_count.load(Ordering::Relaxed),
            current_size: queue.size.load(Ordering::Relaxed),
        }
    }

    /// Free the residual chain and the shared state.
    ///
    /// # Safety
    ///
    /// Must only run once the last handle is gone: no thread can observe
    /// the queue, so plain loads and direct frees are sound and no hazards
    /// are needed.
    unsafe fn destroy(&mut self) {
        let raw = self.inner.as_ptr();
        let mut node = (*raw).head.load(Ordering::Relaxed);
        let mut residual = 0usize;

        // The first node is the dummy and holds no payload; every node
        // after it still owns an undelivered value, dropped here so the
        // final release leaks neither nodes nor payloads.
        let mut is_dummy = true;
        while !node.is_null() {
            let next = (*node).next.load(Ordering::Relaxed);
            if !is_dummy {
                ptr::drop_in_place((*node).data.as_mut_ptr());
                residual += 1;
            }
            Node::free(node);
            is_dummy = false;
            node = next;
        }

        if residual > 0 {
            debug!("destroyed queue with {residual} undelivered items");
        }

        drop(Box::from_raw(raw));
    }
}

impl<T: 'static> Clone for LockFreeQueue<T> {
    /// Retain the queue: the clone operates on the same underlying
    /// structure.
    fn clone(&self) -> Self {
        self.raw().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        if self.raw().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Pairs with the releasing decrements of the other handles so the
        // destroying thread observes every prior mutation of the chain.
        fence(Ordering::Acquire);

        unsafe { self.destroy() };
    }
}

impl<T: 'static> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for queue operations
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub enqueue_count: u64,
    pub dequeue_count: u64,
    pub current_size: usize,
}
