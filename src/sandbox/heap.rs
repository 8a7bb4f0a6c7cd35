//! Per-thread heap metering.
//!
//! Every isolated environment owns a dedicated thread, so the bytes that
//! thread currently holds are the environment's heap. `MeteredAllocator`
//! wraps the system allocator and keeps a thread-local running total for
//! threads that opted in with [`enable_metering`].
//!
//! A thread may also arm a hard ceiling with [`arm_ceiling`]. Any allocation
//! that takes the thread past it latches a breach flag, which stays set until
//! the next arm. The flag is the only check that sees allocations made while
//! the VM runs user callbacks from inside native builtins.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

thread_local! {
    static METERED: Cell<bool> = const { Cell::new(false) };
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
    static HARD_CEILING: Cell<isize> = const { Cell::new(isize::MAX) };
    static BREACHED: Cell<bool> = const { Cell::new(false) };
}

/// Global allocator that tracks live bytes per metered thread.
pub struct MeteredAllocator;

#[inline]
fn record(delta: isize) {
    // try_with: the allocator can run while thread locals are being torn down
    let _ = METERED.try_with(|metered| {
        if metered.get() {
            let _ = LIVE_BYTES.try_with(|live| {
                let now = live.get().wrapping_add(delta);
                live.set(now);
                if delta > 0 && now > HARD_CEILING.try_with(Cell::get).unwrap_or(isize::MAX) {
                    let _ = BREACHED.try_with(|breached| breached.set(true));
                }
            });
        }
    });
}

unsafe impl GlobalAlloc for MeteredAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

/// Start metering the current thread from a zero baseline.
pub fn enable_metering() {
    LIVE_BYTES.with(|live| live.set(0));
    METERED.with(|metered| metered.set(true));
}

/// Whether allocations on this thread are being counted.
///
/// False when the crate was built without the `metered-heap` allocator.
pub fn is_metering() -> bool {
    cfg!(feature = "metered-heap") && METERED.with(|metered| metered.get())
}

/// Bytes currently held by the calling thread since metering started.
///
/// Memory allocated before metering began and freed afterwards can drive the
/// raw counter negative; that is reported as zero.
pub fn live_bytes() -> usize {
    LIVE_BYTES.with(|live| live.get().max(0) as usize)
}

/// Latch a breach whenever this thread's live bytes pass `bytes`. Clears any
/// earlier breach.
pub fn arm_ceiling(bytes: usize) {
    HARD_CEILING.with(|ceiling| ceiling.set(bytes.min(isize::MAX as usize) as isize));
    BREACHED.with(|breached| breached.set(false));
}

/// Whether the armed ceiling has been passed since it was armed.
pub fn ceiling_breached() -> bool {
    BREACHED.with(|breached| breached.get())
}

pub fn mb_to_bytes(mb: u32) -> usize {
    mb as usize * 1024 * 1024
}
