//! Buffers suballocated from shared pools.
//!
//! The [`BufferAllocator`] is the entry point for long-lived buffers in any heap. It keeps one
//! [`PoolAllocator`] per combination of heap type, resource flags, access and state mode, so that
//! every pool only ever holds buffers that can share its arenas.
//!
//! [`BufferAllocator`]: allocator::BufferAllocator
//! [`PoolAllocator`]: crate::memory::pool_allocator::PoolAllocator

pub mod allocator;
