//! GPU memory suballocation.
//!
//! # Arenas and suballocation
//!
//! Creating a native resource is slow, and devices put a limit on how many of them may exist.
//! Every allocator in this module therefore creates a few big *arenas* (either a heap or one
//! committed buffer) and hands out pieces of them. An allocation is described by a
//! [`ResourceLocation`], which remembers which allocator owns it so that it can be given back
//! when the location is dropped.
//!
//! # Strategies
//!
//! There are two ways to turn a piece of an arena into something the GPU can use:
//!
//! - With [*manual suballocation*], the arena is a single committed buffer and every allocation
//!   is a byte range inside of it. All the allocations share the state of the buffer, which is
//!   why this is only used for resources that are never transitioned individually.
//! - With [*placed resources*], the arena is a heap and every allocation gets its own placed
//!   resource, with its own state. Placement has a granularity of 64KiB.
//!
//! # Deferred reclamation
//!
//! A location that is dropped on the CPU might still be read by command lists in flight.
//! Therefore no allocator frees memory right away: the freed range is tagged with the current
//! frame fence value, and put back into circulation only once the fence proves that the GPU has
//! caught up. This happens in the `cleanup_allocations` method each allocator has, which should
//! be called once per frame.
//!
//! # Allocators
//!
//! - [`PoolAllocator`] keeps growable pools of best-fit free lists. It is the general purpose
//!   allocator for buffers.
//! - [`MultiBuddyAllocator`] splits power-of-two arenas into power-of-two blocks. Internal
//!   fragmentation can be high, but external fragmentation stays bounded, which is ideal for
//!   many small allocations that die together.
//! - [`FastAllocator`] bump-allocates inside fixed-size pages recycled through a
//!   [`FastAllocatorPagePool`], and [`FastConstantAllocator`] does the same for constant buffer
//!   data on top of the [`UploadHeapAllocator`].
//!
//! [*manual suballocation*]: AllocationStrategy::ManualSubAllocation
//! [*placed resources*]: AllocationStrategy::PlacedResource
//! [`PoolAllocator`]: pool_allocator::PoolAllocator
//! [`MultiBuddyAllocator`]: buddy::MultiBuddyAllocator
//! [`FastAllocator`]: fast::FastAllocator
//! [`FastAllocatorPagePool`]: fast::FastAllocatorPagePool
//! [`FastConstantAllocator`]: fast::FastConstantAllocator
//! [`UploadHeapAllocator`]: upload::UploadHeapAllocator

pub use self::location::{
    AllocatorData, AllocatorRef, BuddyAllocation, LocationType, ResourceLocation, SubDeallocator,
};
use crate::{
    device::{HeapFlags, HeapType, ResourceFlags, ResourceStates},
    DeviceSize,
};

pub mod buddy;
pub mod fast;
mod location;
pub mod pool;
pub mod pool_allocator;
pub mod upload;

const K: DeviceSize = 1024;
const M: DeviceSize = 1024 * K;

/// The size of the pages [`FastConstantAllocator`] bump-allocates from.
///
/// [`FastConstantAllocator`]: fast::FastConstantAllocator
pub const FAST_CONSTANT_ALLOCATOR_PAGE_SIZE: DeviceSize = 64 * K;

/// Upload allocations up to this size go to the buddy pools of the [`UploadHeapAllocator`].
///
/// [`UploadHeapAllocator`]: upload::UploadHeapAllocator
pub const UPLOAD_HEAP_SMALL_BLOCK_MAX_ALLOCATION_SIZE: DeviceSize = 64 * K;

/// The size of each buddy pool of the [`UploadHeapAllocator`].
///
/// [`UploadHeapAllocator`]: upload::UploadHeapAllocator
pub const UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE: DeviceSize = 4 * M;

/// The default size of the free-list pools the [`UploadHeapAllocator`] uses for big
/// allocations.
///
/// [`UploadHeapAllocator`]: upload::UploadHeapAllocator
pub const UPLOAD_HEAP_BIG_BLOCK_HEAP_SIZE: DeviceSize = 8 * M;

/// Upload allocations above this size become standalone resources.
pub const UPLOAD_HEAP_BIG_BLOCK_MAX_ALLOCATION_SIZE: DeviceSize = 64 * M;

/// The minimum number of pages a [`FastAllocatorPagePool`] keeps around.
///
/// [`FastAllocatorPagePool`]: fast::FastAllocatorPagePool
pub const FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN: usize = 5;

/// The default size of buffer pools.
pub const POOL_ALLOCATOR_BUFFER_POOL_SIZE: DeviceSize = 32 * M;

/// Buffers above this size are not pooled.
pub const POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE: DeviceSize = 16 * M;

/// The default size of readback buffer pools.
pub const READBACK_BUFFER_POOL_DEFAULT_POOL_SIZE: DeviceSize = 4 * M;

/// Readback buffers above this size are not pooled.
pub const READBACK_BUFFER_POOL_MAX_ALLOCATION_SIZE: DeviceSize = 64 * K;

/// The placement granularity of buffers, and therefore the alignment of placed-resource pools.
pub const BUFFER_ALIGNMENT: DeviceSize = 64 * K;

/// The alignment of manually suballocated pools.
pub const MANUAL_SUBALLOCATION_ALIGNMENT: DeviceSize = 256;

/// The placement alignment of constant buffer data.
pub const CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT: DeviceSize = 256;

/// How resources are carved out of an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// The arena is a heap, and every allocation is a placed resource with its own state.
    PlacedResource,
    /// The arena is a single committed buffer, and allocations are byte ranges of it.
    ManualSubAllocation,
}

impl AllocationStrategy {
    /// Returns the strategy needed for a resource with the given flags and state mode.
    ///
    /// Resources whose state changes independently from others need their own native resource,
    /// so they are placed. Everything else can share a buffer.
    pub fn for_resource(flags: ResourceFlags, state_mode: ResourceStateMode) -> Self {
        let state_mode = match state_mode {
            ResourceStateMode::Default => {
                if flags.intersects(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
                    ResourceStateMode::Multi
                } else {
                    ResourceStateMode::Single
                }
            }
            mode => mode,
        };

        if state_mode == ResourceStateMode::Multi {
            AllocationStrategy::PlacedResource
        } else {
            AllocationStrategy::ManualSubAllocation
        }
    }
}

/// Whether a resource needs per-resource state tracking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceStateMode {
    /// Derive the mode from the resource flags.
    #[default]
    Default,
    /// The resource stays in a single state for its whole lifetime.
    Single,
    /// The resource transitions between states.
    Multi,
}

resource_bitflags! {
    /// How a buffer is going to be accessed.
    BufferAccess = u32;

    /// The CPU reads the buffer.
    CPU_READ = 0x1,

    /// The CPU writes the buffer.
    CPU_WRITE = 0x2,

    /// The GPU reads the buffer.
    GPU_READ = 0x4,

    /// The GPU writes the buffer.
    GPU_WRITE = 0x8,

    /// The GPU reads and writes the buffer through unordered access.
    GPU_UNORDERED = 0x10,

    /// The buffer holds indirect draw or dispatch arguments.
    DRAW_INDIRECT = 0x20,

    /// The buffer stores a ray-tracing acceleration structure.
    ACCELERATION_STRUCTURE = 0x40,
}

/// The parameters shared by every arena of an allocator.
///
/// Two allocation requests can be served by the same allocator only if their configurations
/// compare equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AllocatorConfig {
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    pub resource_flags: ResourceFlags,
    pub initial_resource_state: ResourceStates,
}

impl AllocatorConfig {
    /// Returns the configuration of the allocator that serves buffers with the given heap type,
    /// flags and access.
    pub fn for_resource(
        heap_type: HeapType,
        resource_flags: ResourceFlags,
        access: BufferAccess,
    ) -> Self {
        let initial_resource_state = if access.intersects(BufferAccess::ACCELERATION_STRUCTURE) {
            debug_assert!(access == BufferAccess::ACCELERATION_STRUCTURE);

            ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE
        } else if heap_type == HeapType::Readback {
            ResourceStates::COPY_DEST
        } else {
            if access.intersects(BufferAccess::GPU_UNORDERED) {
                debug_assert!(resource_flags.intersects(ResourceFlags::ALLOW_UNORDERED_ACCESS));
            }

            ResourceStates::COMMON
        };

        if access.intersects(BufferAccess::DRAW_INDIRECT) {
            debug_assert!(resource_flags.intersects(ResourceFlags::ALLOW_UNORDERED_ACCESS));
        }

        AllocatorConfig {
            heap_type,
            heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
            resource_flags,
            initial_resource_state,
        }
    }
}

/// Rounds `val` up to a multiple of `alignment`, which doesn't need to be a power of two.
#[inline(always)]
pub(crate) fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        val
    } else {
        val.div_ceil(alignment) * alignment
    }
}

/// Rounds `val` down to a multiple of `alignment`, which doesn't need to be a power of two.
#[inline(always)]
pub(crate) fn align_down(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        val
    } else {
        val - val % alignment
    }
}

#[inline(always)]
pub(crate) fn is_aligned(val: DeviceSize, alignment: DeviceSize) -> bool {
    alignment <= 1 || val % alignment == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(100, 64), 128);
        assert_eq!(align_up(128, 64), 128);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up(10, 12), 12);
        assert_eq!(align_down(200, 64), 192);
        assert_eq!(align_down(25, 12), 24);
        assert!(is_aligned(256, 256));
        assert!(!is_aligned(300, 256));
        assert!(is_aligned(3, 1));
    }

    #[test]
    fn strategy_for_resource() {
        assert_eq!(
            AllocationStrategy::for_resource(
                ResourceFlags::ALLOW_UNORDERED_ACCESS,
                ResourceStateMode::Default,
            ),
            AllocationStrategy::PlacedResource,
        );
        assert_eq!(
            AllocationStrategy::for_resource(ResourceFlags::empty(), ResourceStateMode::Default),
            AllocationStrategy::ManualSubAllocation,
        );
        assert_eq!(
            AllocationStrategy::for_resource(
                ResourceFlags::ALLOW_UNORDERED_ACCESS,
                ResourceStateMode::Single,
            ),
            AllocationStrategy::ManualSubAllocation,
        );
        assert_eq!(
            AllocationStrategy::for_resource(ResourceFlags::empty(), ResourceStateMode::Multi),
            AllocationStrategy::PlacedResource,
        );
    }

    #[test]
    fn config_for_resource() {
        let readback =
            AllocatorConfig::for_resource(HeapType::Readback, ResourceFlags::empty(), BufferAccess::empty());
        assert_eq!(readback.initial_resource_state, ResourceStates::COPY_DEST);
        assert_eq!(readback.heap_flags, HeapFlags::ALLOW_ONLY_BUFFERS);

        let accel = AllocatorConfig::for_resource(
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            BufferAccess::ACCELERATION_STRUCTURE,
        );
        assert_eq!(
            accel.initial_resource_state,
            ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE,
        );

        let plain = AllocatorConfig::for_resource(
            HeapType::Default,
            ResourceFlags::empty(),
            BufferAccess::GPU_READ,
        );
        assert_eq!(plain.initial_resource_state, ResourceStates::COMMON);
        assert_ne!(plain, readback);
    }
}
