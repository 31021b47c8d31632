//! Pools of buffers keyed by how they are going to be used.

use crate::{
    device::{
        Adapter, AdapterOwned, HeapFlags, HeapType, Resource, ResourceCreateInfo, ResourceDesc,
        ResourceFlags, ResourceStates,
    },
    memory::{
        pool::FreeListOrder,
        pool_allocator::{PoolAllocator, PoolAllocatorCreateInfo},
        AllocationStrategy, AllocatorConfig, BufferAccess, ResourceLocation, ResourceStateMode,
        BUFFER_ALIGNMENT, MANUAL_SUBALLOCATION_ALIGNMENT, POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE,
        POOL_ALLOCATOR_BUFFER_POOL_SIZE, READBACK_BUFFER_POOL_DEFAULT_POOL_SIZE,
        READBACK_BUFFER_POOL_MAX_ALLOCATION_SIZE,
    },
    DeviceError, DeviceSize, NonExhaustive,
};
use parking_lot::RwLock;
use std::sync::Arc;

/// Parameters to create a new [`BufferAllocator`].
///
/// The sizes only apply to pools created after the allocator is, which is all of them.
#[derive(Clone, Debug)]
pub struct BufferAllocatorCreateInfo {
    /// The default pool size for the default and upload heaps.
    ///
    /// The default value is [`POOL_ALLOCATOR_BUFFER_POOL_SIZE`].
    pub buffer_pool_size: DeviceSize,

    /// The largest pooled buffer in the default and upload heaps.
    ///
    /// The default value is [`POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE`].
    pub buffer_max_allocation_size: DeviceSize,

    /// The default pool size for the readback heap.
    ///
    /// The default value is [`READBACK_BUFFER_POOL_DEFAULT_POOL_SIZE`].
    pub readback_pool_size: DeviceSize,

    /// The largest pooled buffer in the readback heap.
    ///
    /// The default value is [`READBACK_BUFFER_POOL_MAX_ALLOCATION_SIZE`].
    pub readback_max_allocation_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for BufferAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferAllocatorCreateInfo {
            buffer_pool_size: POOL_ALLOCATOR_BUFFER_POOL_SIZE,
            buffer_max_allocation_size: POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE,
            readback_pool_size: READBACK_BUFFER_POOL_DEFAULT_POOL_SIZE,
            readback_max_allocation_size: READBACK_BUFFER_POOL_MAX_ALLOCATION_SIZE,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Allocates buffers from a growing set of [`PoolAllocator`]s.
///
/// A pool allocator is created the first time a combination of heap type, resource flags, access
/// and state mode is requested, and lives as long as the `BufferAllocator`. Its pools are still
/// trimmed when idle.
///
/// Pools in the default heap are defragmentation-ordered, and pools whose buffers need their own
/// state are made of placed resources and aligned to [`BUFFER_ALIGNMENT`].
///
/// Indirect argument buffers are never pooled.
///
/// [`BUFFER_ALIGNMENT`]: crate::memory::BUFFER_ALIGNMENT
#[derive(Debug)]
pub struct BufferAllocator {
    adapter: Arc<Adapter>,
    buffer_pool_size: DeviceSize,
    buffer_max_allocation_size: DeviceSize,
    readback_pool_size: DeviceSize,
    readback_max_allocation_size: DeviceSize,
    pools: RwLock<Vec<Arc<PoolAllocator>>>,
}

impl BufferAllocator {
    /// Creates a new `BufferAllocator` without any pool.
    pub fn new(adapter: Arc<Adapter>, create_info: BufferAllocatorCreateInfo) -> Self {
        let BufferAllocatorCreateInfo {
            buffer_pool_size,
            buffer_max_allocation_size,
            readback_pool_size,
            readback_max_allocation_size,
            _ne: _,
        } = create_info;

        BufferAllocator {
            adapter,
            buffer_pool_size,
            buffer_max_allocation_size,
            readback_pool_size,
            readback_max_allocation_size,
            pools: RwLock::new(Vec::new()),
        }
    }

    /// Allocates a buffer described by `desc` and wires `location` to it. `location` is cleared
    /// first.
    ///
    /// `create_state` is the state the buffer is created in when it gets a resource of its own;
    /// [`default_initial_resource_state`] returns the usual one.
    pub fn alloc_default_resource(
        &self,
        heap_type: HeapType,
        desc: &ResourceDesc,
        access: BufferAccess,
        state_mode: ResourceStateMode,
        create_state: ResourceStates,
        alignment: DeviceSize,
        debug_name: &str,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError> {
        let pooled_desc = ResourceDesc {
            flags: desc.flags - ResourceFlags::DENY_SHADER_RESOURCE,
            ..*desc
        };

        if access.intersects(BufferAccess::DRAW_INDIRECT) {
            location.clear();

            let resource = Resource::new_committed(
                self.adapter.device(),
                &ResourceCreateInfo {
                    desc: ResourceDesc {
                        alignment: 0,
                        ..*desc
                    },
                    heap_type,
                    heap_flags: HeapFlags::empty(),
                    initial_state: create_state,
                    debug_name,
                },
            )?;
            location.as_stand_alone(resource, desc.width);

            return Ok(());
        }

        let pool = self.pool_for(heap_type, pooled_desc.flags, access, state_mode);

        pool.alloc_default_resource(
            heap_type,
            &pooled_desc,
            access,
            state_mode,
            create_state,
            alignment,
            debug_name,
            location,
        )
    }

    fn pool_for(
        &self,
        heap_type: HeapType,
        resource_flags: ResourceFlags,
        access: BufferAccess,
        state_mode: ResourceStateMode,
    ) -> Arc<PoolAllocator> {
        let supports = |pool: &&Arc<PoolAllocator>| {
            pool.supports_allocation(heap_type, resource_flags, access, state_mode)
        };

        if let Some(pool) = self.pools.read().iter().find(supports) {
            return pool.clone();
        }

        let mut pools = self.pools.write();

        // Another thread might have created it in between.
        if let Some(pool) = pools.iter().find(supports) {
            return pool.clone();
        }

        let config = AllocatorConfig::for_resource(heap_type, resource_flags, access);
        let strategy = AllocationStrategy::for_resource(resource_flags, state_mode);
        let (default_pool_size, max_allocation_size) = if heap_type == HeapType::Readback {
            (self.readback_pool_size, self.readback_max_allocation_size)
        } else {
            (self.buffer_pool_size, self.buffer_max_allocation_size)
        };
        let pool_alignment = match strategy {
            AllocationStrategy::PlacedResource => BUFFER_ALIGNMENT,
            AllocationStrategy::ManualSubAllocation => MANUAL_SUBALLOCATION_ALIGNMENT,
        };

        let pool = PoolAllocator::new(
            self.adapter.clone(),
            PoolAllocatorCreateInfo {
                config,
                strategy,
                free_list_order: FreeListOrder::SortByOffset,
                default_pool_size,
                pool_alignment,
                max_allocation_size,
                defrag_enabled: config.heap_type == HeapType::Default,
                debug_name: format!("{:?}/Pool/{}", heap_type, pools.len()),
                ..Default::default()
            },
        );
        log::debug!(
            "created buffer pool {} for {:?} memory with {:?}",
            pools.len(),
            heap_type,
            strategy,
        );
        pools.push(pool.clone());

        pool
    }

    /// Runs the per-frame cleanup of every pool.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        for pool in self.pools.read().iter() {
            pool.cleanup_allocations(frame_lag);
        }
    }

    /// Returns the pool allocators created so far.
    pub fn pools(&self) -> Vec<Arc<PoolAllocator>> {
        self.pools.read().clone()
    }
}

impl AdapterOwned for BufferAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// Returns the state a buffer with the given heap type, access and state mode is usually created
/// in.
pub fn default_initial_resource_state(
    heap_type: HeapType,
    access: BufferAccess,
    state_mode: ResourceStateMode,
) -> ResourceStates {
    match heap_type {
        HeapType::Readback => ResourceStates::COPY_DEST,
        HeapType::Upload => ResourceStates::GENERIC_READ,
        HeapType::Default
            if access == BufferAccess::GPU_UNORDERED && state_mode == ResourceStateMode::Single =>
        {
            ResourceStates::UNORDERED_ACCESS
        }
        HeapType::Default if access.intersects(BufferAccess::ACCELERATION_STRUCTURE) => {
            ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE
        }
        HeapType::Default => ResourceStates::GENERIC_READ,
    }
}
