// Copyright (c) 2025 HazardQueue Contributors
//
// Hazard Pointers - Safe Memory Reclamation for Lock-Free Data Structures
//
// Each thread owns a record with a small array of publication slots. Writing
// a pointer into a slot declares "I may dereference this"; a thread that has
// unlinked a node retires it instead of freeing it, and a reclamation scan
// frees a retired pointer only once no slot anywhere in the process still
// publishes it. Records of exited threads are adopted by survivors, so no
// retired pointer is stranded.
//
// References:
// - Maged M. Michael. "Hazard pointers: Safe memory reclamation for lock-free
//   objects." IEEE Transactions on Parallel and Distributed Systems, 2004.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use log::{debug, trace};

use crate::error::{Error, Result};

/// Number of hazard pointer slots per thread.
///
/// Two slots cover the queue: the primary slot guards the observed head or
/// tail, the successor slot guards the node about to be consumed. Other
/// structures built on this registry can raise the constant; every code path
/// indexes slots uniformly.
pub const MAX_HAZARDS_PER_THREAD: usize = 2;

/// Slot guarding the anchor a thread observed (tail during enqueue, head
/// during dequeue).
pub(crate) const HP_PRIMARY: usize = 0;

/// Slot guarding the successor node during dequeue.
pub(crate) const HP_SUCCESSOR: usize = 1;

/// Retired pointers tolerated beyond the provisioned slot count before a
/// reclamation scan runs.
///
/// The scan threshold is `provisioned slots + RECLAIM_SLACK`, which bounds
/// retired-but-unfreed memory per thread: at most one retired pointer can
/// survive a scan for each slot in the process, so every scan frees at
/// least the slack's worth of entries amortized.
pub const RECLAIM_SLACK: usize = 8;

/// A retired pointer paired with its reclamation function.
struct RetiredPtr {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

/// Hazard record for one thread
#[repr(C, align(64))]
struct HazardRecord {
    /// Publication slots; written only by the owning thread, read by every
    /// scanning thread
    hazards: [AtomicPtr<()>; MAX_HAZARDS_PER_THREAD],

    /// Next record in the registry; immutable once published
    next: AtomicPtr<HazardRecord>,

    /// Ownership flag; a successful false-to-true CAS adopts the record
    active: AtomicBool,

    /// Retired pointers not yet proven unreachable
    retired: UnsafeCell<Vec<RetiredPtr>>,
}

// Safety: `retired` is only touched by the thread currently holding the
// `active` flag; every other field is atomic.
unsafe impl Send for HazardRecord {}
unsafe impl Sync for HazardRecord {}

impl HazardRecord {
    fn new() -> Self {
        const NULL_PTR: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
        Self {
            hazards: [NULL_PTR; MAX_HAZARDS_PER_THREAD],
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(false),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Publish a pointer in the given slot.
    ///
    /// The fence keeps the validating re-read that follows a publication
    /// from being ordered before the slot store; without it a scanner could
    /// miss the slot while the owner trusts a stale validation.
    fn set_hazard(&self, index: usize, ptr: *mut ()) {
        self.hazards[index].store(ptr, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    fn clear_hazard(&self, index: usize) {
        self.hazards[index].store(ptr::null_mut(), Ordering::Release);
    }

    /// Clear every slot, then hand the record back for reuse.
    fn release(&self) {
        for hazard in &self.hazards {
            hazard.store(ptr::null_mut(), Ordering::Release);
        }
        self.active.store(false, Ordering::Release);
    }
}

/// Global registry of hazard records
struct HazardRegistry {
    /// Head of the record list; records are pushed, never unlinked
    head: AtomicPtr<HazardRecord>,

    /// Total hazard slots ever provisioned (the reclamation threshold base)
    slots: AtomicUsize,

    /// Total records ever allocated
    records: AtomicUsize,
}

static REGISTRY: HazardRegistry = HazardRegistry {
    head: AtomicPtr::new(ptr::null_mut()),
    slots: AtomicUsize::new(0),
    records: AtomicUsize::new(0),
};

impl HazardRegistry {
    /// Acquire a record for the current thread, reusing a deactivated one
    /// when possible.
    fn acquire(&self) -> NonNull<HazardRecord> {
        let mut current = self.head.load(Ordering::Acquire);

        while !current.is_null() {
            let record = unsafe { &*current };
            if record
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                trace!("reusing inactive hazard record");
                return unsafe { NonNull::new_unchecked(current) };
            }
            current = record.next.load(Ordering::Acquire);
        }

        self.allocate()
    }

    /// Allocate a fresh record and push it onto the registry head.
    fn allocate(&self) -> NonNull<HazardRecord> {
        let record = Box::into_raw(Box::new(HazardRecord::new()));
        let record_ref = unsafe { &*record };

        record_ref.active.store(true, Ordering::Release);
        self.slots
            .fetch_add(MAX_HAZARDS_PER_THREAD, Ordering::Relaxed);
        let total = self.records.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("allocated hazard record, registry now holds {total}");

        loop {
            let old_head = self.head.load(Ordering::Acquire);
            record_ref.next.store(old_head, Ordering::Release);

            if self
                .head
                .compare_exchange(old_head, record, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return unsafe { NonNull::new_unchecked(record) };
            }
        }
    }

    /// Retired entries tolerated before a scan must run.
    fn scan_threshold(&self) -> usize {
        self.slots.load(Ordering::Relaxed) + RECLAIM_SLACK
    }

    /// Collect every currently published pointer across the registry,
    /// sorted and deduplicated for binary search.
    ///
    /// Deactivated records are walked too; their slots are cleared on
    /// release, and a record changing hands mid-walk is then indistinguishable
    /// from an active one.
    fn collect_protected(&self) -> Vec<*mut ()> {
        let mut protected = Vec::new();
        let mut current = self.head.load(Ordering::Acquire);

        while !current.is_null() {
            let record = unsafe { &*current };
            for hazard in &record.hazards {
                let ptr = hazard.load(Ordering::Acquire);
                if !ptr.is_null() {
                    protected.push(ptr);
                }
            }
            current = record.next.load(Ordering::Acquire);
        }

        protected.sort_unstable();
        protected.dedup();
        protected
    }
}

thread_local! {
    static THREAD_RECORD: ThreadRecord = const { ThreadRecord::new() };
}

/// Thread-local cache of the calling thread's registry record.
struct ThreadRecord {
    record: Cell<Option<NonNull<HazardRecord>>>,
}

impl ThreadRecord {
    const fn new() -> Self {
        Self {
            record: Cell::new(None),
        }
    }

    fn get(&self) -> NonNull<HazardRecord> {
        if let Some(record) = self.record.get() {
            record
        } else {
            let record = REGISTRY.acquire();
            self.record.set(Some(record));
            record
        }
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        if let Some(record) = self.record.get() {
            let record = unsafe { record.as_ref() };
            // Last chance to free what this thread retired. Entries still
            // covered by another thread's slot stay in the deactivated
            // record until a help-scan adopts them.
            scan(record);
            record.release();
        }
    }
}

/// Run a reclamation scan over the caller's retired list.
///
/// Stage 1 snapshots every published slot in the registry; stage 2 drains
/// the retired list, freeing each entry whose pointer is absent from the
/// snapshot and re-appending the rest for the next round.
fn scan(record: &HazardRecord) {
    let protected = REGISTRY.collect_protected();

    // Safety: the caller holds `active` on this record, so nothing else
    // touches the retired list.
    let drained = {
        let retired = unsafe { &mut *record.retired.get() };
        mem::take(retired)
    };
    let before = drained.len();

    for entry in drained {
        if protected.binary_search(&entry.ptr).is_ok() {
            let retired = unsafe { &mut *record.retired.get() };
            retired.push(entry);
        } else {
            unsafe { (entry.free_fn)(entry.ptr) };
        }
    }

    let kept = unsafe { (*record.retired.get()).len() };
    if before > 0 {
        trace!("hazard scan freed {} of {before} retired pointers", before - kept);
    }
}

/// Adopt the retired lists of records orphaned by exited threads.
///
/// Winning the `active` CAS on an inactive record grants exclusive use of
/// its retired list; the caller's own record never qualifies because its
/// flag is already set.
fn help_scan(record: &HazardRecord) {
    let mut current = REGISTRY.head.load(Ordering::Acquire);

    while !current.is_null() {
        let other = unsafe { &*current };
        current = other.next.load(Ordering::Acquire);

        if other
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }

        loop {
            let entry = {
                let orphaned = unsafe { &mut *other.retired.get() };
                match orphaned.pop() {
                    Some(entry) => entry,
                    None => break,
                }
            };

            let len = {
                let retired = unsafe { &mut *record.retired.get() };
                retired.push(entry);
                retired.len()
            };
            if len >= REGISTRY.scan_threshold() {
                scan(record);
            }
        }

        other.active.store(false, Ordering::Release);
    }
}

/// Hazard slot handle for the calling thread.
///
/// All guards on one thread share that thread's slot set: a guard models a
/// single logical operation over the protected structure, and dropping it
/// clears every slot. The guard is not `Send`: slots are single-writer,
/// owned by their thread.
pub struct HazardGuard {
    record: NonNull<HazardRecord>,
    _not_send: PhantomData<*mut ()>,
}

impl HazardGuard {
    /// Bind to the calling thread's record, creating and registering one on
    /// first use.
    pub fn acquire() -> Self {
        let record = THREAD_RECORD.with(|tls| tls.get());
        Self {
            record,
            _not_send: PhantomData,
        }
    }

    fn record(&self) -> &HazardRecord {
        unsafe { self.record.as_ref() }
    }

    /// Publish `ptr` in slot `index`, declaring that the thread may
    /// dereference it until the slot is cleared or overwritten.
    ///
    /// The caller must still validate that the pointer remains reachable
    /// from the shared structure after publication; a pointer retired
    /// before the slot store is not protected.
    pub fn protect<T>(&self, index: usize, ptr: *mut T) -> Result<*mut T> {
        if index >= MAX_HAZARDS_PER_THREAD {
            return Err(Error::SlotOutOfRange(index));
        }
        self.record().set_hazard(index, ptr as *mut ());
        Ok(ptr)
    }

    /// Unchecked slot store for callers with compile-time slot indices.
    pub(crate) fn set(&self, index: usize, ptr: *mut ()) {
        debug_assert!(index < MAX_HAZARDS_PER_THREAD);
        self.record().set_hazard(index, ptr);
    }

    /// Clear one slot.
    pub fn clear(&self, index: usize) {
        if index < MAX_HAZARDS_PER_THREAD {
            self.record().clear_hazard(index);
        }
    }

    /// Clear every slot owned by this thread.
    pub fn clear_all(&self) {
        for index in 0..MAX_HAZARDS_PER_THREAD {
            self.record().clear_hazard(index);
        }
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.clear_all();
    }
}

/// Retire a pointer allocated through `Box`, freeing it once no slot
/// publishes it.
///
/// # Safety
///
/// `ptr` must have come from `Box::into_raw`, must be unlinked from every
/// shared structure, and must not be retired twice.
pub unsafe fn retire<T>(ptr: *mut T) {
    unsafe fn free_boxed<T>(ptr: *mut ()) {
        drop(Box::from_raw(ptr as *mut T));
    }
    retire_with(ptr as *mut (), free_boxed::<T>);
}

/// Retire a pointer with a caller-supplied reclamation function.
///
/// The function is invoked exactly once, from whichever thread's scan
/// proves the pointer unreachable, and must do nothing but dispose of the
/// allocation.
///
/// # Safety
///
/// As [`retire`], with `free_fn` matching the allocation.
pub unsafe fn retire_with(ptr: *mut (), free_fn: unsafe fn(*mut ())) {
    THREAD_RECORD.with(|tls| {
        let record = tls.get();
        let record = unsafe { record.as_ref() };

        let len = {
            let retired = unsafe { &mut *record.retired.get() };
            retired.push(RetiredPtr { ptr, free_fn });
            retired.len()
        };

        if len >= REGISTRY.scan_threshold() {
            scan(record);
            help_scan(record);
        }
    });
}

/// Force a full reclamation pass on the calling thread: adopt whatever
/// exited threads left behind, then scan.
///
/// Useful as a quiescence step after worker threads have joined; the fast
/// path never needs it.
pub fn reclaim_all() {
    THREAD_RECORD.with(|tls| {
        let record = tls.get();
        let record = unsafe { record.as_ref() };
        help_scan(record);
        scan(record);
    });
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Copy)]
pub struct HazardStats {
    /// Records ever allocated (never shrinks; inactive ones are reused)
    pub total_records: usize,
    /// Records currently owned by a live thread or helper
    pub active_records: usize,
    /// Hazard slots provisioned across all records
    pub provisioned_slots: usize,
    /// Retired pointers awaiting reclamation on the calling thread
    pub retired_count: usize,
}

impl HazardStats {
    pub fn collect() -> Self {
        let mut active_records = 0;
        let mut current = REGISTRY.head.load(Ordering::Acquire);

        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) {
                active_records += 1;
            }
            current = record.next.load(Ordering::Acquire);
        }

        let retired_count = THREAD_RECORD.with(|tls| {
            let record = tls.get();
            // Safety: the calling thread owns its own record.
            unsafe { (*record.as_ref().retired.get()).len() }
        });

        Self {
            total_records: REGISTRY.records.load(Ordering::Relaxed),
            active_records,
            provisioned_slots: REGISTRY.slots.load(Ordering::Relaxed),
            retired_count,
        }
    }
}
