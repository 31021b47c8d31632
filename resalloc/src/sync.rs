//! Frame fences: the GPU-completion counter that gates memory reuse.
//!
//! Every time the CPU finishes recording a frame it *signals* the fence with the current value
//! and moves on to the next one. The GPU bumps the *completed* value when it has finished
//! executing the work submitted with that value. A piece of memory that was released while the
//! current value was `N` can be reused as soon as `N` is complete.
//!
//! Allocators never wait on a fence. They only ask whether a value is complete, and leave
//! anything that isn't for the next cleanup pass.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing GPU-completion counter.
///
/// # Contract
///
/// Both [`current_fence`] and the completed value must never decrease, and a value must never
/// be reported complete before the GPU has finished all the work submitted with it. Allocators
/// rely on this to decide when memory can be reused.
///
/// [`current_fence`]: FrameFence::current_fence
pub trait FrameFence: Send + Sync {
    /// Returns the value that work recorded right now will be signaled with.
    fn current_fence(&self) -> u64;

    /// Returns whether the GPU has completed the given value.
    fn is_fence_complete(&self, value: u64) -> bool;

    /// Queries the GPU for the last completed value, caches it and returns it.
    fn update_last_completed_fence(&self) -> u64;
}

/// A fence whose values are advanced by hand.
///
/// This is useful when the GPU timeline is driven by code outside of the crate (for example a
/// queue wrapper that signals once per frame and polls a native fence), and in tests.
#[derive(Debug)]
pub struct ManualFence {
    current: AtomicU64,
    completed: AtomicU64,
}

impl ManualFence {
    /// Creates a new `ManualFence` whose current value is `initial_value`. No value at or above
    /// `initial_value` is complete.
    pub fn new(initial_value: u64) -> Self {
        ManualFence {
            current: AtomicU64::new(initial_value),
            completed: AtomicU64::new(initial_value.saturating_sub(1)),
        }
    }

    /// Increments the current value and returns the previous one, which is the value the work
    /// recorded so far should be signaled with.
    #[inline]
    pub fn increment_current_fence(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel)
    }

    /// Marks every value up to and including `value` as complete.
    ///
    /// # Panics
    ///
    /// - Panics if `value` is not smaller than the current value.
    pub fn signal_completed(&self, value: u64) {
        assert!(value < self.current.load(Ordering::Acquire));

        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Marks everything signaled so far as complete.
    pub fn complete_all(&self) {
        let current = self.current.load(Ordering::Acquire);
        self.completed
            .fetch_max(current.saturating_sub(1), Ordering::AcqRel);
    }

    /// Returns the last completed value without querying anything.
    #[inline]
    pub fn last_completed_fence(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

impl Default for ManualFence {
    #[inline]
    fn default() -> Self {
        ManualFence::new(1)
    }
}

impl FrameFence for ManualFence {
    #[inline]
    fn current_fence(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    fn is_fence_complete(&self, value: u64) -> bool {
        value <= self.completed.load(Ordering::Acquire)
    }

    #[inline]
    fn update_last_completed_fence(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}
