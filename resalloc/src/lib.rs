//! Fence-aware suballocation of GPU resources for a real-time renderer.
//!
//! Rendering and submission threads ask for many short-lived buffers of all sizes every frame.
//! Creating a native resource for each of them is far too slow, so this crate carves them out of
//! a few large *arenas* instead, and hands back a [`ResourceLocation`] describing where the
//! allocation lives: the backing resource, the offset inside it, its GPU virtual address and,
//! for CPU-visible heaps, a mapped pointer.
//!
//! The twist compared to a host allocator is that the GPU keeps reading memory for a few frames
//! after the CPU is done with it. Every allocator in this crate therefore *defers* reclamation:
//! freeing a location records the current value of the [`FrameFence`], and the memory is only
//! handed out again once the fence proves that the GPU has moved past it.
//!
//! # Overview
//!
//! - The [`Device`] trait is how the crate creates heaps, committed and placed resources. It is
//!   implemented by the graphics backend.
//! - The [`FrameFence`] trait is the GPU-completion counter consumed by all allocators.
//!   [`ManualFence`] is a CPU-driven implementation.
//! - An [`Adapter`] bundles both and is shared by every allocator.
//! - [`PoolAllocator`] sub-allocates from growable pools of best-fit free lists.
//! - [`MultiBuddyAllocator`] sub-allocates power-of-two blocks, for small allocations that are
//!   retired together.
//! - [`FastAllocator`] and [`FastConstantAllocator`] bump-allocate inside recycled pages.
//! - [`UploadHeapAllocator`] and [`BufferAllocator`] pick the right strategy per request.
//!
//! Every allocator exposes a `cleanup_allocations`-style method that must be called once per
//! frame by a single driver. That is where deferred frees are drained and idle arenas are
//! trimmed.
//!
//! [`ResourceLocation`]: memory::ResourceLocation
//! [`Device`]: device::Device
//! [`Adapter`]: device::Adapter
//! [`FrameFence`]: sync::FrameFence
//! [`ManualFence`]: sync::ManualFence
//! [`PoolAllocator`]: memory::pool_allocator::PoolAllocator
//! [`MultiBuddyAllocator`]: memory::buddy::MultiBuddyAllocator
//! [`FastAllocator`]: memory::fast::FastAllocator
//! [`FastConstantAllocator`]: memory::fast::FastConstantAllocator
//! [`UploadHeapAllocator`]: memory::upload::UploadHeapAllocator
//! [`BufferAllocator`]: buffer::allocator::BufferAllocator

use std::{error::Error, fmt};

#[macro_use]
mod macros;
pub mod buffer;
pub mod device;
pub mod memory;
pub mod sync;

/// Represents memory size and offset values on a GPU device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// A GPU virtual address.
pub type DeviceAddress = u64;

/// Error returned when the device fails to create or map a native object.
///
/// This is the only error kind of the crate. Running out of space inside an arena is not an
/// error: allocators absorb it by trying another arena, creating a new one or falling back to a
/// standalone resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// There is no memory available on the host.
    OutOfHostMemory,
    /// There is no memory available on the device.
    OutOfDeviceMemory,
    /// The device has been removed or reset.
    DeviceRemoved,
    /// Mapping a resource into host memory has failed.
    MapFailed,
    /// The creation parameters were rejected by the device.
    InvalidArgument,
    /// A native error code that has no dedicated variant.
    Unnamed(i32),
}

impl Error for DeviceError {}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfHostMemory => write!(f, "a host memory allocation has failed"),
            DeviceError::OutOfDeviceMemory => write!(f, "a device memory allocation has failed"),
            DeviceError::DeviceRemoved => write!(f, "the device has been removed"),
            DeviceError::MapFailed => write!(f, "mapping of a resource has failed"),
            DeviceError::InvalidArgument => {
                write!(f, "the device rejected the creation parameters")
            }
            DeviceError::Unnamed(code) => write!(f, "unnamed error, native code {:#x}", code),
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());
