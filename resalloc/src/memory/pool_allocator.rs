//! Growable pools of best-fit free lists sharing one configuration.

use super::{
    align_down, align_up,
    location::AllocatorData,
    pool::{aligned_block_size, FreeListOrder, MemoryPool, PoolAllocation, PoolResourceTypes},
    AllocationStrategy, AllocatorConfig, AllocatorRef, BufferAccess, LocationType,
    ResourceLocation, ResourceStateMode, MANUAL_SUBALLOCATION_ALIGNMENT,
    POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE, POOL_ALLOCATOR_BUFFER_POOL_SIZE,
};
use crate::{
    device::{
        Adapter, AdapterOwned, HeapFlags, HeapType, Resource, ResourceCreateInfo, ResourceDesc,
        ResourceDimension, ResourceFlags, ResourceStates,
    },
    DeviceError, DeviceSize, NonExhaustive,
};
use parking_lot::Mutex;
use std::{cmp::Ordering, collections::VecDeque, mem, sync::Arc};

/// Parameters to create a new [`PoolAllocator`].
#[derive(Clone, Debug)]
pub struct PoolAllocatorCreateInfo {
    /// The configuration shared by every pool.
    ///
    /// The default value is the default [`AllocatorConfig`].
    pub config: AllocatorConfig,

    /// Whether pools are heaps of placed resources or manually suballocated buffers.
    ///
    /// The default value is [`AllocationStrategy::ManualSubAllocation`].
    pub strategy: AllocationStrategy,

    /// The ordering of the free-list of each pool.
    ///
    /// The default value is [`FreeListOrder::SortBySize`].
    pub free_list_order: FreeListOrder,

    /// The size of new pools, unless a single allocation needs more.
    ///
    /// The default value is [`POOL_ALLOCATOR_BUFFER_POOL_SIZE`].
    ///
    /// [`POOL_ALLOCATOR_BUFFER_POOL_SIZE`]: super::POOL_ALLOCATOR_BUFFER_POOL_SIZE
    pub default_pool_size: DeviceSize,

    /// The alignment of every pool and every block. Must be a power of two, and must be the
    /// placement granularity when `strategy` is [`AllocationStrategy::PlacedResource`].
    ///
    /// The default value is [`MANUAL_SUBALLOCATION_ALIGNMENT`].
    ///
    /// [`MANUAL_SUBALLOCATION_ALIGNMENT`]: super::MANUAL_SUBALLOCATION_ALIGNMENT
    pub pool_alignment: DeviceSize,

    /// Allocations above this size get a standalone committed resource.
    ///
    /// The default value is [`POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE`].
    ///
    /// [`POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE`]: super::POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE
    pub max_allocation_size: DeviceSize,

    /// Whether the fullest pools are tried first, so that the emptiest ones drain and get
    /// trimmed. Otherwise the smallest pools are tried first.
    ///
    /// The default value is `false`.
    pub defrag_enabled: bool,

    /// The name given to the native objects.
    ///
    /// The default value is `"PoolAllocator"`.
    pub debug_name: String,

    pub _ne: NonExhaustive,
}

impl Default for PoolAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        PoolAllocatorCreateInfo {
            config: AllocatorConfig::default(),
            strategy: AllocationStrategy::ManualSubAllocation,
            free_list_order: FreeListOrder::SortBySize,
            default_pool_size: POOL_ALLOCATOR_BUFFER_POOL_SIZE,
            pool_alignment: MANUAL_SUBALLOCATION_ALIGNMENT,
            max_allocation_size: POOL_ALLOCATOR_BUFFER_MAX_ALLOCATION_SIZE,
            defrag_enabled: false,
            debug_name: "PoolAllocator".to_owned(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// A growable list of [`MemoryPool`]s sharing one configuration.
///
/// Requests are served by the first pool in the allocation order that has room, and a new pool
/// is created when none does. A trimmed pool leaves a hole in the list, which is reused before the
/// list grows.
///
/// Nothing is freed synchronously. Dropping a location queues a deallocation tagged with the
/// current frame fence value, and [`cleanup_allocations`] applies the queued operations whose
/// fence has completed, trims idle pools and recomputes the allocation order. The queue is drained
/// strictly in order, so an incomplete operation holds back every operation queued after it.
///
/// [`cleanup_allocations`]: Self::cleanup_allocations
#[derive(Debug)]
pub struct PoolAllocator {
    adapter: Arc<Adapter>,
    config: AllocatorConfig,
    strategy: AllocationStrategy,
    free_list_order: FreeListOrder,
    default_pool_size: DeviceSize,
    pool_alignment: DeviceSize,
    max_allocation_size: DeviceSize,
    defrag_enabled: bool,
    debug_name: String,
    state: Mutex<PoolAllocatorState>,
}

#[derive(Debug)]
struct PoolAllocatorState {
    pools: Vec<Option<MemoryPool>>,
    allocation_order: Vec<usize>,
    operations: VecDeque<FrameFencedOperation>,
}

/// An operation on a block that has to wait for a frame fence.
#[derive(Debug)]
struct FrameFencedOperation {
    kind: OperationKind,
    pool_index: usize,
    allocation: PoolAllocation,
    fence: u64,
    // Placed resources are kept alive until the GPU is done with them.
    placed_resource: Option<Arc<Resource>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OperationKind {
    Deallocate,
    Unlock,
    Nop,
}

impl PoolAllocator {
    /// Creates a new `PoolAllocator`. No pool is created until the first allocation.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.pool_alignment` is not a power of two.
    /// - Panics if `create_info.default_pool_size` is zero or not a multiple of
    ///   `create_info.pool_alignment`.
    /// - Panics if `create_info.max_allocation_size` is zero.
    pub fn new(adapter: Arc<Adapter>, create_info: PoolAllocatorCreateInfo) -> Arc<Self> {
        let PoolAllocatorCreateInfo {
            config,
            strategy,
            free_list_order,
            default_pool_size,
            pool_alignment,
            max_allocation_size,
            defrag_enabled,
            debug_name,
            _ne: _,
        } = create_info;

        assert!(pool_alignment.is_power_of_two());
        assert!(default_pool_size != 0);
        assert!(default_pool_size % pool_alignment == 0);
        assert!(max_allocation_size != 0);

        Arc::new(PoolAllocator {
            adapter,
            config,
            strategy,
            free_list_order,
            default_pool_size,
            pool_alignment,
            max_allocation_size,
            defrag_enabled,
            debug_name,
            state: Mutex::new(PoolAllocatorState {
                pools: Vec::new(),
                allocation_order: Vec::new(),
                operations: VecDeque::new(),
            }),
        })
    }

    /// Returns whether this allocator serves buffers with the given parameters.
    pub fn supports_allocation(
        &self,
        heap_type: HeapType,
        resource_flags: ResourceFlags,
        access: BufferAccess,
        state_mode: ResourceStateMode,
    ) -> bool {
        let config = AllocatorConfig::for_resource(heap_type, resource_flags, access);
        let strategy = AllocationStrategy::for_resource(resource_flags, state_mode);

        self.config == config && self.strategy == strategy
    }

    /// Allocates a buffer described by `desc`, after checking in debug builds that
    /// `create_state` is a valid initial state for the heap type and access.
    pub fn alloc_default_resource(
        self: &Arc<Self>,
        heap_type: HeapType,
        desc: &ResourceDesc,
        access: BufferAccess,
        state_mode: ResourceStateMode,
        create_state: ResourceStates,
        alignment: DeviceSize,
        debug_name: &str,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError> {
        if cfg!(debug_assertions) {
            match heap_type {
                HeapType::Upload => debug_assert!(create_state == ResourceStates::GENERIC_READ),
                HeapType::Readback => debug_assert!(create_state == ResourceStates::COPY_DEST),
                HeapType::Default => {
                    if access.intersects(BufferAccess::ACCELERATION_STRUCTURE) {
                        debug_assert!(
                            create_state == ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE
                        );
                    }
                }
            }
        }

        self.allocate_resource(
            heap_type,
            desc,
            desc.width,
            alignment,
            state_mode,
            create_state,
            debug_name,
            location,
        )
    }

    /// Allocates `size` bytes aligned to `alignment` and wires `location` to them.
    ///
    /// `location` is cleared first. A size of zero leaves it empty. Requests above the maximum
    /// allocation size get a standalone committed resource. With the placed-resource strategy,
    /// every allocation gets its own placed resource, aligned to the pool alignment.
    ///
    /// An error is only returned when the device fails to create a pool or a resource.
    pub fn allocate_resource(
        self: &Arc<Self>,
        heap_type: HeapType,
        desc: &ResourceDesc,
        size: DeviceSize,
        alignment: DeviceSize,
        state_mode: ResourceStateMode,
        create_state: ResourceStates,
        debug_name: &str,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError> {
        location.clear();

        if size == 0 {
            return Ok(());
        }

        debug_assert!(heap_type == self.config.heap_type);
        debug_assert!(self.strategy == AllocationStrategy::for_resource(desc.flags, state_mode));

        if size > self.max_allocation_size {
            log::warn!(
                "`{}` can't pool {} bytes, falling back to a standalone resource",
                self.debug_name,
                size,
            );

            return self.allocate_stand_alone(
                heap_type,
                desc,
                size,
                create_state,
                debug_name,
                location,
            );
        }

        let alignment = match self.strategy {
            AllocationStrategy::PlacedResource => self.pool_alignment,
            AllocationStrategy::ManualSubAllocation => alignment.max(1),
        };
        let resource_type = resource_type(desc);

        let mut state = self.state.lock();

        let allocation = match state.try_allocate(size, alignment, resource_type) {
            Some(allocation) => allocation,
            None => {
                let pool = self.create_pool(&mut state, size, alignment)?;

                // The new pool is sized for the padded request.
                let Some(allocation) = pool.try_allocate(size, alignment, resource_type) else {
                    unreachable!("a new pool always fits the request it was created for");
                };

                allocation
            }
        };

        let pool = state.pool_mut(allocation.pool_index);

        match self.strategy {
            AllocationStrategy::ManualSubAllocation => {
                let Some(resource) = pool.backing_resource().cloned() else {
                    unreachable!("manually suballocated pools are backed by a buffer");
                };
                let offset = allocation.offset();

                location.gpu_virtual_address = resource.gpu_virtual_address() + offset;
                // SAFETY: The allocation is inside the buffer, and therefore inside its mapping.
                location.mapped_base_address = resource
                    .mapped_ptr()
                    .map(|ptr| unsafe { ptr.add(offset as usize) });
                location.offset_from_base_of_resource = offset;
                location.resource = Some(resource);
            }
            AllocationStrategy::PlacedResource => {
                let Some(heap) = pool.backing_heap().cloned() else {
                    unreachable!("placed-resource pools are backed by a heap");
                };
                let placed_desc = ResourceDesc {
                    width: size,
                    alignment: self.pool_alignment,
                    ..*desc
                };
                let result = Resource::new_placed(
                    &heap,
                    align_down(allocation.offset(), self.pool_alignment),
                    &ResourceCreateInfo {
                        desc: placed_desc,
                        heap_type,
                        heap_flags: HeapFlags::empty(),
                        initial_state: create_state,
                        debug_name,
                    },
                );

                let resource = match result {
                    Ok(resource) => resource,
                    Err(err) => {
                        // The GPU never saw the block, so it can be freed right away.
                        pool.deallocate(allocation.block);

                        return Err(err);
                    }
                };

                location.gpu_virtual_address = resource.gpu_virtual_address();
                location.mapped_base_address = resource.mapped_ptr();
                location.offset_from_base_of_resource = 0;
                location.resource = Some(resource);
            }
        }

        location.ty = LocationType::SubAllocation;
        location.allocator = Some(AllocatorRef::Pool(self.clone()));
        location.allocator_data = AllocatorData::Pool(allocation);
        location.size = size;

        Ok(())
    }

    fn allocate_stand_alone(
        &self,
        heap_type: HeapType,
        desc: &ResourceDesc,
        size: DeviceSize,
        create_state: ResourceStates,
        debug_name: &str,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError> {
        let resource = Resource::new_committed(
            self.adapter.device(),
            &ResourceCreateInfo {
                desc: ResourceDesc {
                    width: size,
                    alignment: 0,
                    ..*desc
                },
                heap_type,
                heap_flags: HeapFlags::empty(),
                initial_state: create_state,
                debug_name,
            },
        )?;

        location.as_stand_alone(resource, size);

        Ok(())
    }

    fn create_pool<'a>(
        &self,
        state: &'a mut PoolAllocatorState,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<&'a mut MemoryPool, DeviceError> {
        let required = aligned_block_size(size, self.pool_alignment, alignment);
        let pool_size = if required <= self.default_pool_size {
            self.default_pool_size
        } else {
            let pool_size = required
                .next_power_of_two()
                .min(self.max_allocation_size)
                .max(required);

            align_up(pool_size, self.pool_alignment)
        };

        let index = state
            .pools
            .iter()
            .position(Option::is_none)
            .unwrap_or(state.pools.len());

        let pool = MemoryPool::new(
            &self.adapter,
            &self.config,
            self.strategy,
            index,
            pool_size,
            self.pool_alignment,
            pool_resource_types(self.strategy, self.config.heap_flags),
            self.free_list_order,
            &format!("{} pool {}", self.debug_name, index),
        )?;

        log::trace!(
            "`{}` grew by a pool of {} bytes at index {}",
            self.debug_name,
            pool_size,
            index,
        );

        if index == state.pools.len() {
            state.pools.push(None);
            state.allocation_order.push(index);
        }

        Ok(state.pools[index].insert(pool))
    }

    /// Queues the deallocation of a location owned by this allocator, to be applied once the
    /// current frame fence value has completed.
    pub(crate) fn deallocate(&self, location: &mut ResourceLocation) {
        let AllocatorData::Pool(allocation) = mem::take(&mut location.allocator_data) else {
            debug_assert!(false, "deallocating a location that isn't pooled");
            return;
        };
        let placed_resource = match self.strategy {
            AllocationStrategy::PlacedResource => location.resource.take(),
            AllocationStrategy::ManualSubAllocation => None,
        };

        let mut state = self.state.lock();

        // The fence is read under the lock to keep the queue ordered.
        let fence = self.adapter.frame_fence().current_fence();

        // A pending unlock would otherwise unlock the block before it is freed.
        for op in &mut state.operations {
            if op.kind == OperationKind::Unlock
                && op.pool_index == allocation.pool_index
                && op.allocation.block == allocation.block
            {
                op.kind = OperationKind::Nop;
            }
        }

        let pool = state.pool_mut(allocation.pool_index);
        pool.lock(allocation.block);
        pool.update_last_used_fence(fence);

        state.operations.push_back(FrameFencedOperation {
            kind: OperationKind::Deallocate,
            pool_index: allocation.pool_index,
            allocation,
            fence,
            placed_resource,
        });
    }

    /// Applies the queued operations whose fence has completed, trims the empty pools that
    /// haven't been used for `frame_lag` fence values and recomputes the allocation order.
    ///
    /// This should be called once per frame.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        let frame_fence = self.adapter.frame_fence();
        let completed_fence = frame_fence.update_last_completed_fence();

        let mut state = self.state.lock();
        let state = &mut *state;

        while let Some(op) = state.operations.front() {
            if !frame_fence.is_fence_complete(op.fence) {
                break;
            }

            let Some(op) = state.operations.pop_front() else {
                break;
            };

            match op.kind {
                OperationKind::Deallocate => {
                    state.pool_mut(op.pool_index).deallocate(op.allocation.block);
                    drop(op.placed_resource);
                }
                OperationKind::Unlock => {
                    let pool = state.pool_mut(op.pool_index);

                    // Ownership transfers unlock blocks too.
                    if pool.is_locked(op.allocation.block) {
                        pool.unlock(op.allocation.block);
                    }
                }
                OperationKind::Nop => {}
            }
        }

        for slot in &mut state.pools {
            if let Some(pool) = slot {
                if pool.is_empty()
                    && pool.last_used_fence().saturating_add(frame_lag) <= completed_fence
                {
                    log::debug!(
                        "`{}` trimmed pool {} of {} bytes",
                        self.debug_name,
                        pool.pool_index(),
                        pool.pool_size(),
                    );
                    *slot = None;
                }
            }
        }

        state.allocation_order = compute_allocation_order(&state.pools, self.defrag_enabled);
    }

    /// Moves the allocation from `source` to `destination`, which is cleared first.
    ///
    /// Unlike moving a location, this happens under the allocator lock, and the block is unlocked
    /// since it changed hands.
    pub fn transfer_ownership(
        &self,
        destination: &mut ResourceLocation,
        source: &mut ResourceLocation,
    ) {
        destination.clear();

        let mut state = self.state.lock();

        mem::swap(destination, source);

        if let AllocatorData::Pool(allocation) = &destination.allocator_data {
            let pool = state.pool_mut(allocation.pool_index);

            if pool.is_locked(allocation.block) {
                pool.unlock(allocation.block);
            }
        }
    }

    /// Clears the lock bit of the block of `location` right away.
    ///
    /// # Panics
    ///
    /// - Panics if the block is not locked.
    pub fn unlock(&self, location: &ResourceLocation) {
        if let AllocatorData::Pool(allocation) = &location.allocator_data {
            self.state
                .lock()
                .pool_mut(allocation.pool_index)
                .unlock(allocation.block);
        }
    }

    /// Queues the unlocking of the block of `location` until the current frame fence value has
    /// completed. If the location is deallocated first, the unlock is dropped.
    pub fn unlock_after_fence(&self, location: &ResourceLocation) {
        if let AllocatorData::Pool(allocation) = &location.allocator_data {
            let mut state = self.state.lock();
            let fence = self.adapter.frame_fence().current_fence();

            state.operations.push_back(FrameFencedOperation {
                kind: OperationKind::Unlock,
                pool_index: allocation.pool_index,
                allocation: *allocation,
                fence,
                placed_resource: None,
            });
        }
    }

    #[inline]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[inline]
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    #[inline]
    pub fn pool_alignment(&self) -> DeviceSize {
        self.pool_alignment
    }

    #[inline]
    pub fn max_allocation_size(&self) -> DeviceSize {
        self.max_allocation_size
    }

    /// Returns the size of the pool in each slot, `None` for holes left by trimmed pools.
    pub fn pool_sizes(&self) -> Vec<Option<DeviceSize>> {
        self.state
            .lock()
            .pools
            .iter()
            .map(|pool| pool.as_ref().map(MemoryPool::pool_size))
            .collect()
    }

    /// Returns the number of live pools.
    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.iter().flatten().count()
    }

    /// Returns the sum of the used sizes of all pools, including blocks waiting for a fence.
    pub fn used_size(&self) -> DeviceSize {
        self.state
            .lock()
            .pools
            .iter()
            .flatten()
            .map(MemoryPool::used_size)
            .sum()
    }

    /// Returns the order in which pools are tried, as of the last cleanup.
    pub fn allocation_order(&self) -> Vec<usize> {
        self.state.lock().allocation_order.clone()
    }

    /// Returns the number of queued operations that wait for a fence.
    pub fn pending_operation_count(&self) -> usize {
        self.state.lock().operations.len()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for pool in self.state.lock().pools.iter().flatten() {
            pool.assert_invariants();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, location: &ResourceLocation) -> bool {
        match &location.allocator_data {
            AllocatorData::Pool(allocation) => self
                .state
                .lock()
                .pool_mut(allocation.pool_index)
                .is_locked(allocation.block),
            _ => false,
        }
    }
}

impl PoolAllocatorState {
    fn try_allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        resource_type: PoolResourceTypes,
    ) -> Option<PoolAllocation> {
        for &index in &self.allocation_order {
            let Some(pool) = &mut self.pools[index] else {
                continue;
            };

            if pool.is_full() || !pool.is_resource_type_supported(resource_type) {
                continue;
            }

            if let Some(allocation) = pool.try_allocate(size, alignment, resource_type) {
                return Some(allocation);
            }
        }

        None
    }

    fn pool_mut(&mut self, index: usize) -> &mut MemoryPool {
        match &mut self.pools[index] {
            Some(pool) => pool,
            None => unreachable!("pool {} was trimmed while in use", index),
        }
    }
}

impl AdapterOwned for PoolAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// Returns the order in which the pools should be tried.
///
/// With `defrag_enabled`, the pools with the most used space come first, so that allocations
/// concentrate there and the others get a chance to become empty and be trimmed. Otherwise the
/// smallest pools come first. Holes always come last, and ties are broken by slot index.
pub fn compute_allocation_order(pools: &[Option<MemoryPool>], defrag_enabled: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..pools.len()).collect();

    order.sort_by(|&a, &b| {
        let ordering = match (&pools[a], &pools[b]) {
            (Some(pool_a), Some(pool_b)) => {
                if defrag_enabled {
                    pool_b.used_size().cmp(&pool_a.used_size())
                } else {
                    pool_a.pool_size().cmp(&pool_b.pool_size())
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };

        ordering.then(a.cmp(&b))
    });

    order
}

fn resource_type(desc: &ResourceDesc) -> PoolResourceTypes {
    if desc.dimension == ResourceDimension::Buffer {
        PoolResourceTypes::BUFFERS
    } else if desc
        .flags
        .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
    {
        PoolResourceTypes::RT_DS_TEXTURES
    } else {
        PoolResourceTypes::TEXTURES
    }
}

fn pool_resource_types(strategy: AllocationStrategy, heap_flags: HeapFlags) -> PoolResourceTypes {
    if strategy == AllocationStrategy::ManualSubAllocation {
        return PoolResourceTypes::BUFFERS;
    }

    let mut types = PoolResourceTypes::all();

    if heap_flags.intersects(HeapFlags::DENY_BUFFERS) {
        types -= PoolResourceTypes::BUFFERS;
    }
    if heap_flags.intersects(HeapFlags::DENY_RT_DS_TEXTURES) {
        types -= PoolResourceTypes::RT_DS_TEXTURES;
    }
    if heap_flags.intersects(HeapFlags::DENY_NON_RT_DS_TEXTURES) {
        types -= PoolResourceTypes::TEXTURES;
    }

    types
}
