//! A single arena subdivided with a best-fit free list.

use self::host::{SlabAllocator, SlotId};
use super::{align_up, is_aligned, AllocationStrategy, AllocatorConfig};
use crate::{
    device::{
        Adapter, Heap, HeapCreateInfo, HeapFlags, Resource, ResourceCreateInfo, ResourceDesc,
    },
    DeviceError, DeviceSize,
};
use std::sync::Arc;

resource_bitflags! {
    /// The kinds of resources a [`MemoryPool`] can hold.
    PoolResourceTypes = u32;

    BUFFERS = 0x1,

    TEXTURES = 0x2,

    RT_DS_TEXTURES = 0x4,
}

/// How the free blocks of a [`MemoryPool`] are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FreeListOrder {
    /// Free blocks are sorted by size, and allocation takes the smallest block that fits. Ties
    /// go to the block with the lowest offset.
    #[default]
    SortBySize,
    /// Free blocks are sorted by offset, and allocation takes the first block that fits. This
    /// keeps allocations packed towards the start of the arena.
    SortByOffset,
}

/// The native object a [`MemoryPool`] subdivides.
#[derive(Clone, Debug)]
pub enum BackingArena {
    /// A heap that placed resources are created in.
    Heap(Arc<Heap>),
    /// A committed buffer that is manually suballocated.
    Resource(Arc<Resource>),
}

/// An arena subdivided into blocks.
///
/// The blocks form a circular doubly linked list in address order, anchored at a *head*
/// sentinel. Free blocks are additionally indexed in `free_blocks`, which is sorted according to
/// the [`FreeListOrder`]. Two adjacent blocks are never both free: they are coalesced as soon as
/// the second one is freed.
///
/// A `MemoryPool` doesn't know about fences. The [`PoolAllocator`] owning it defers every
/// deallocation until the GPU is done with the block, and only then calls [`deallocate`].
///
/// [`PoolAllocator`]: super::pool_allocator::PoolAllocator
/// [`deallocate`]: Self::deallocate
#[derive(Debug)]
pub struct MemoryPool {
    pool_index: usize,
    pool_size: DeviceSize,
    pool_alignment: DeviceSize,
    supported_resource_types: PoolResourceTypes,
    free_list_order: FreeListOrder,
    backing: BackingArena,
    // Sum of the sizes of all free blocks.
    free_size: DeviceSize,
    last_used_fence: u64,
    nodes: SlabAllocator<Block>,
    head: SlotId,
    free_blocks: Vec<SlotId>,
}

#[derive(Clone, Copy, Debug)]
struct Block {
    prev: SlotId,
    next: SlotId,
    offset: DeviceSize,
    size: DeviceSize,
    alignment: DeviceSize,
    ty: BlockType,
    locked: bool,
}

/// The state of a block of a [`MemoryPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Head,
    Free,
    Allocated,
}

/// A snapshot of one block of a [`MemoryPool`], as returned by [`MemoryPool::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub ty: BlockType,
    pub locked: bool,
}

/// An allocated block of a [`MemoryPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolAllocation {
    pub(crate) pool_index: usize,
    pub(crate) block: SlotId,
    offset: DeviceSize,
    block_offset: DeviceSize,
    block_size: DeviceSize,
}

impl PoolAllocation {
    /// Returns the index of the pool in its allocator.
    #[inline]
    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    /// Returns the offset of the allocation from the start of the arena, honoring the requested
    /// alignment.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the offset of the block, which can be lower than [`offset`] when padding was
    /// needed.
    ///
    /// [`offset`]: Self::offset
    #[inline]
    pub fn block_offset(&self) -> DeviceSize {
        self.block_offset
    }

    /// Returns the size of the block, including padding.
    #[inline]
    pub fn block_size(&self) -> DeviceSize {
        self.block_size
    }
}

impl MemoryPool {
    /// Creates the backing arena and a pool with a single free block spanning it.
    ///
    /// A heap is created for [`AllocationStrategy::PlacedResource`], a committed buffer (mapped
    /// if the heap type is CPU-accessible) for [`AllocationStrategy::ManualSubAllocation`].
    ///
    /// # Panics
    ///
    /// - Panics if `pool_size` is not a multiple of `pool_alignment`.
    pub fn new(
        adapter: &Arc<Adapter>,
        config: &AllocatorConfig,
        strategy: AllocationStrategy,
        pool_index: usize,
        pool_size: DeviceSize,
        pool_alignment: DeviceSize,
        supported_resource_types: PoolResourceTypes,
        free_list_order: FreeListOrder,
        debug_name: &str,
    ) -> Result<Self, DeviceError> {
        assert!(pool_size > 0);
        assert!(is_aligned(pool_size, pool_alignment));

        let backing = match strategy {
            AllocationStrategy::PlacedResource => BackingArena::Heap(Heap::new(
                adapter.device(),
                &HeapCreateInfo {
                    size: pool_size,
                    alignment: pool_alignment,
                    heap_type: config.heap_type,
                    flags: config.heap_flags,
                    debug_name,
                },
            )?),
            AllocationStrategy::ManualSubAllocation => {
                BackingArena::Resource(Resource::new_committed(
                    adapter.device(),
                    &ResourceCreateInfo {
                        desc: ResourceDesc::buffer(pool_size, config.resource_flags),
                        heap_type: config.heap_type,
                        heap_flags: HeapFlags::empty(),
                        initial_state: config.initial_resource_state,
                        debug_name,
                    },
                )?)
            }
        };

        log::debug!(
            "created memory pool `{}` ({:?}, {} bytes)",
            debug_name,
            strategy,
            pool_size,
        );

        let mut nodes = SlabAllocator::new(32);
        let head = nodes.allocate_with(|id| Block {
            prev: id,
            next: id,
            offset: 0,
            size: 0,
            alignment: 0,
            ty: BlockType::Head,
            locked: false,
        });
        let root = nodes.allocate(Block {
            prev: head,
            next: head,
            offset: 0,
            size: pool_size,
            alignment: pool_alignment,
            ty: BlockType::Free,
            locked: false,
        });
        let head_block = nodes.get_mut(head);
        head_block.prev = root;
        head_block.next = root;

        Ok(MemoryPool {
            pool_index,
            pool_size,
            pool_alignment,
            supported_resource_types,
            free_list_order,
            backing,
            free_size: pool_size,
            last_used_fence: 0,
            nodes,
            head,
            free_blocks: vec![root],
        })
    }

    /// Tries to allocate a block for `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` if no free block is large enough. This never grows the pool.
    pub fn try_allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        resource_type: PoolResourceTypes,
    ) -> Option<PoolAllocation> {
        debug_assert!(self.is_resource_type_supported(resource_type));

        let alignment = alignment.max(1);
        let aligned_size = aligned_block_size(size, self.pool_alignment, alignment);
        let index = self.find_free_block(aligned_size)?;

        // The block is going to shrink, so it has to be removed from the sorted free-list before
        // being reinserted.
        let free_id = self.free_blocks.remove(index);
        let free = *self.nodes.get(free_id);

        debug_assert!(free.ty == BlockType::Free);
        debug_assert!(free.size >= aligned_size);

        let offset = aligned_offset(free.offset, self.pool_alignment, alignment);
        let block_id = self.nodes.allocate(Block {
            prev: free.prev,
            next: free_id,
            offset: free.offset,
            size: aligned_size,
            alignment,
            ty: BlockType::Allocated,
            locked: true,
        });
        self.nodes.get_mut(free.prev).next = block_id;

        let remainder = self.nodes.get_mut(free_id);
        remainder.prev = block_id;
        remainder.offset += aligned_size;
        remainder.size -= aligned_size;
        let remainder_size = remainder.size;

        self.free_size -= aligned_size;

        if remainder_size == 0 {
            self.unlink(free_id);
            self.nodes.free(free_id);
        } else {
            self.insert_free_block(free_id);
        }

        debug_assert!(offset + size <= free.offset + aligned_size);

        Some(PoolAllocation {
            pool_index: self.pool_index,
            block: block_id,
            offset,
            block_offset: free.offset,
            block_size: aligned_size,
        })
    }

    /// Frees a block and coalesces it with its free neighbors.
    ///
    /// The block must be locked, meaning that its owner has released it and the GPU fence it was
    /// released at has completed.
    ///
    /// # Panics
    ///
    /// - Panics if the block is not allocated or not locked.
    pub(crate) fn deallocate(&mut self, block_id: SlotId) {
        let pool_alignment = self.pool_alignment;
        let block = self.nodes.get_mut(block_id);

        assert!(block.ty == BlockType::Allocated);
        assert!(block.locked);

        block.ty = BlockType::Free;
        block.locked = false;
        block.alignment = pool_alignment;
        debug_assert!(is_aligned(block.offset, pool_alignment));
        debug_assert!(is_aligned(block.size, pool_alignment));

        self.free_size += block.size;
        debug_assert!(self.free_size <= self.pool_size);

        self.add_to_free_blocks(block_id);
    }

    fn add_to_free_blocks(&mut self, block_id: SlotId) {
        let mut block_id = block_id;

        let prev_id = self.nodes.get(block_id).prev;
        if self.is_coalescable(prev_id) {
            self.remove_free_block(prev_id);
            self.merge(prev_id, block_id);
            block_id = prev_id;
        }

        let next_id = self.nodes.get(block_id).next;
        if self.is_coalescable(next_id) {
            self.remove_free_block(next_id);
            self.merge(block_id, next_id);
        }

        self.insert_free_block(block_id);
    }

    fn is_coalescable(&self, block_id: SlotId) -> bool {
        let block = self.nodes.get(block_id);

        block.ty == BlockType::Free && !block.locked
    }

    // Absorbs `other_id` into `block_id`, which must directly precede it.
    fn merge(&mut self, block_id: SlotId, other_id: SlotId) {
        let other = *self.nodes.get(other_id);
        let block = self.nodes.get_mut(block_id);

        debug_assert!(block.ty == BlockType::Free && other.ty == BlockType::Free);
        debug_assert!(block.offset + block.size == other.offset);

        block.size += other.size;
        self.unlink(other_id);
        self.nodes.free(other_id);
    }

    fn unlink(&mut self, block_id: SlotId) {
        let Block { prev, next, .. } = *self.nodes.get(block_id);
        self.nodes.get_mut(prev).next = next;
        self.nodes.get_mut(next).prev = prev;
    }

    fn free_block_key(&self, block_id: SlotId) -> (DeviceSize, DeviceSize) {
        let block = self.nodes.get(block_id);

        match self.free_list_order {
            FreeListOrder::SortBySize => (block.size, block.offset),
            FreeListOrder::SortByOffset => (block.offset, 0),
        }
    }

    fn find_free_block(&self, aligned_size: DeviceSize) -> Option<usize> {
        // Early out if the total free size doesn't fit.
        if self.free_size < aligned_size {
            return None;
        }

        let index = match self.free_list_order {
            FreeListOrder::SortBySize => self
                .free_blocks
                .partition_point(|&id| self.nodes.get(id).size < aligned_size),
            FreeListOrder::SortByOffset => self
                .free_blocks
                .iter()
                .position(|&id| self.nodes.get(id).size >= aligned_size)?,
        };

        (index < self.free_blocks.len()).then_some(index)
    }

    fn insert_free_block(&mut self, block_id: SlotId) {
        let key = self.free_block_key(block_id);

        match self
            .free_blocks
            .binary_search_by_key(&key, |&id| self.free_block_key(id))
        {
            Ok(_) => unreachable!("double insertion into the free-list"),
            Err(index) => self.free_blocks.insert(index, block_id),
        }
    }

    fn remove_free_block(&mut self, block_id: SlotId) {
        let key = self.free_block_key(block_id);

        match self
            .free_blocks
            .binary_search_by_key(&key, |&id| self.free_block_key(id))
        {
            Ok(index) => {
                debug_assert!(self.free_blocks[index] == block_id);
                self.free_blocks.remove(index);
            }
            Err(_) => unreachable!("free block missing from the free-list"),
        }
    }

    /// Clears the lock bit of an allocated block.
    ///
    /// # Panics
    ///
    /// - Panics if the block is not locked.
    pub(crate) fn unlock(&mut self, block_id: SlotId) {
        let block = self.nodes.get_mut(block_id);

        assert!(block.ty == BlockType::Allocated);
        assert!(block.locked, "unlocking a block that isn't locked");

        block.locked = false;
    }

    /// Sets the lock bit of an allocated block.
    pub(crate) fn lock(&mut self, block_id: SlotId) {
        let block = self.nodes.get_mut(block_id);

        debug_assert!(block.ty == BlockType::Allocated);

        block.locked = true;
    }

    pub(crate) fn is_locked(&self, block_id: SlotId) -> bool {
        self.nodes.get(block_id).locked
    }

    /// Checks that the block list and the free-list agree with the counters.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let blocks: Vec<_> = self.blocks().collect();

        let free: DeviceSize = blocks
            .iter()
            .filter(|b| b.ty == BlockType::Free)
            .map(|b| b.size)
            .sum();
        let allocated: DeviceSize = blocks
            .iter()
            .filter(|b| b.ty == BlockType::Allocated)
            .map(|b| b.size)
            .sum();
        assert_eq!(free, self.free_size());
        assert_eq!(free + allocated, self.pool_size());

        let mut expected_offset = 0;
        for block in &blocks {
            assert_eq!(block.offset, expected_offset);
            expected_offset += block.size;
        }
        assert_eq!(expected_offset, self.pool_size());

        for pair in blocks.windows(2) {
            assert!(!(pair[0].ty == BlockType::Free && pair[1].ty == BlockType::Free));
        }

        let free_blocks = blocks.iter().filter(|b| b.ty == BlockType::Free).count();
        assert_eq!(free_blocks, self.free_block_count());
    }

    /// Returns the blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut current = self.nodes.get(self.head).next;

        std::iter::from_fn(move || {
            if current == self.head {
                return None;
            }

            let block = self.nodes.get(current);
            current = block.next;

            Some(BlockInfo {
                offset: block.offset,
                size: block.size,
                ty: block.ty,
                locked: block.locked,
            })
        })
    }

    #[inline]
    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    #[inline]
    pub fn pool_size(&self) -> DeviceSize {
        self.pool_size
    }

    #[inline]
    pub fn pool_alignment(&self) -> DeviceSize {
        self.pool_alignment
    }

    /// Returns the total size of the free blocks.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    #[inline]
    pub fn used_size(&self) -> DeviceSize {
        self.pool_size - self.free_size
    }

    /// Returns the number of entries in the free-list.
    #[inline]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_size == self.pool_size
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_size == 0
    }

    #[inline]
    pub fn is_resource_type_supported(&self, resource_type: PoolResourceTypes) -> bool {
        self.supported_resource_types.contains(resource_type)
    }

    #[inline]
    pub fn free_list_order(&self) -> FreeListOrder {
        self.free_list_order
    }

    /// Returns the fence value of the last deallocation from this pool.
    #[inline]
    pub fn last_used_fence(&self) -> u64 {
        self.last_used_fence
    }

    #[inline]
    pub(crate) fn update_last_used_fence(&mut self, fence: u64) {
        self.last_used_fence = self.last_used_fence.max(fence);
    }

    #[inline]
    pub fn backing(&self) -> &BackingArena {
        &self.backing
    }

    /// Returns the backing heap of a placed-resource pool.
    #[inline]
    pub fn backing_heap(&self) -> Option<&Arc<Heap>> {
        match &self.backing {
            BackingArena::Heap(heap) => Some(heap),
            BackingArena::Resource(_) => None,
        }
    }

    /// Returns the backing buffer of a manually suballocated pool.
    #[inline]
    pub fn backing_resource(&self) -> Option<&Arc<Resource>> {
        match &self.backing {
            BackingArena::Heap(_) => None,
            BackingArena::Resource(resource) => Some(resource),
        }
    }
}

/// Returns the size of the block needed for `size` bytes aligned to `alignment` in a pool aligned
/// to `pool_alignment`. Blocks are always a multiple of the pool alignment, and reserve room for
/// padding when the pool alignment doesn't guarantee the requested one.
pub(crate) fn aligned_block_size(
    size: DeviceSize,
    pool_alignment: DeviceSize,
    alignment: DeviceSize,
) -> DeviceSize {
    let size = if pool_alignment % alignment != 0 {
        size + alignment
    } else {
        size
    };

    align_up(size, pool_alignment)
}

fn aligned_offset(
    offset: DeviceSize,
    pool_alignment: DeviceSize,
    alignment: DeviceSize,
) -> DeviceSize {
    if pool_alignment % alignment != 0 {
        align_up(offset, alignment)
    } else {
        offset
    }
}

mod host {
    use std::num::NonZeroUsize;

    /// Allocates objects from a pool on the host, handing out IDs instead of pointers.
    ///
    /// IDs stay valid when the slab grows, which is what the block list needs: blocks refer to
    /// each other by ID, and freed slots are reused by later blocks.
    #[derive(Debug)]
    pub(crate) struct SlabAllocator<T> {
        pool: Vec<T>,
        // Unsorted list of free slots.
        free_list: Vec<SlotId>,
    }

    impl<T> SlabAllocator<T> {
        pub fn new(capacity: usize) -> Self {
            debug_assert!(capacity > 0);

            SlabAllocator {
                pool: Vec::with_capacity(capacity),
                free_list: Vec::new(),
            }
        }

        /// Allocates a slot and initializes it with the provided value. Returns the ID of the
        /// slot.
        pub fn allocate(&mut self, val: T) -> SlotId {
            self.allocate_with(|_| val)
        }

        /// Allocates a slot and initializes it with a value that may refer to the slot's own ID.
        pub fn allocate_with(&mut self, f: impl FnOnce(SlotId) -> T) -> SlotId {
            if let Some(id) = self.free_list.pop() {
                self.pool[id.index()] = f(id);

                id
            } else {
                // The ID is the new length of the pool, which is non-zero.
                let id = SlotId(NonZeroUsize::MIN.saturating_add(self.pool.len()));
                self.pool.push(f(id));

                id
            }
        }

        /// Returns the slot with the given ID to the allocator to be reused.
        ///
        /// The ID must not be used to access the slot afterward.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));

            self.free_list.push(id);
        }

        pub fn get(&self, id: SlotId) -> &T {
            debug_assert!(!self.free_list.contains(&id));

            &self.pool[id.index()]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_list.contains(&id));

            &mut self.pool[id.index()]
        }
    }

    /// ID of a slot of a [`SlabAllocator`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct SlotId(NonZeroUsize);

    impl SlotId {
        #[inline]
        fn index(self) -> usize {
            self.0.get() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeapType;

    fn new_pool(
        adapter: &Arc<Adapter>,
        pool_size: DeviceSize,
        pool_alignment: DeviceSize,
        order: FreeListOrder,
    ) -> MemoryPool {
        MemoryPool::new(
            adapter,
            &AllocatorConfig::default(),
            AllocationStrategy::ManualSubAllocation,
            0,
            pool_size,
            pool_alignment,
            PoolResourceTypes::BUFFERS,
            order,
            "test pool",
        )
        .unwrap()
    }

    fn allocate(pool: &mut MemoryPool, size: DeviceSize, alignment: DeviceSize) -> PoolAllocation {
        pool.try_allocate(size, alignment, PoolResourceTypes::BUFFERS)
            .unwrap()
    }

    // What the owning `PoolAllocator` does once the fence has completed.
    fn release(pool: &mut MemoryPool, allocation: PoolAllocation) {
        assert!(pool.is_locked(allocation.block));
        pool.deallocate(allocation.block);
    }

    #[test]
    fn new_pool_is_one_free_block() {
        let (device, _fence, adapter) = mock_adapter!();
        let pool = new_pool(&adapter, 1024, 64, FreeListOrder::SortBySize);

        assert_eq!(device.live_resources(), 1);
        assert!(pool.is_empty());
        assert!(pool.backing_resource().is_some());
        assert_eq!(
            pool.blocks().collect::<Vec<_>>(),
            [BlockInfo {
                offset: 0,
                size: 1024,
                ty: BlockType::Free,
                locked: false,
            }],
        );
    }

    #[test]
    fn placed_pool_creates_heap() {
        let (device, _fence, adapter) = mock_adapter!();
        let pool = MemoryPool::new(
            &adapter,
            &AllocatorConfig {
                heap_type: HeapType::Default,
                heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
                ..Default::default()
            },
            AllocationStrategy::PlacedResource,
            3,
            1 << 20,
            64 * 1024,
            PoolResourceTypes::BUFFERS,
            FreeListOrder::SortByOffset,
            "placed pool",
        )
        .unwrap();

        assert_eq!(pool.pool_index(), 3);
        assert!(pool.backing_heap().is_some());
        assert_eq!(device.live_heaps(), 1);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn arena_creation_failure() {
        let (device, _fence, adapter) = mock_adapter!();
        device.fail_next_creation(DeviceError::OutOfDeviceMemory);

        let result = MemoryPool::new(
            &adapter,
            &AllocatorConfig::default(),
            AllocationStrategy::ManualSubAllocation,
            0,
            1024,
            64,
            PoolResourceTypes::BUFFERS,
            FreeListOrder::SortBySize,
            "doomed pool",
        );

        assert_eq!(result.unwrap_err(), DeviceError::OutOfDeviceMemory);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn best_fit() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 1024, 64, FreeListOrder::SortBySize);

        let a = allocate(&mut pool, 64, 64);
        let _s1 = allocate(&mut pool, 64, 64);
        let b = allocate(&mut pool, 128, 64);
        let _s2 = allocate(&mut pool, 64, 64);
        let c = allocate(&mut pool, 256, 64);
        let _s3 = allocate(&mut pool, 448, 64);
        assert!(pool.is_full());
        assert_eq!(pool.free_block_count(), 0);

        release(&mut pool, a);
        release(&mut pool, b);
        release(&mut pool, c);
        pool.assert_invariants();
        assert_eq!(pool.free_block_count(), 3);

        let alloc = allocate(&mut pool, 100, 64);
        assert_eq!(alloc.offset(), 128);
        assert_eq!(alloc.block_size(), 128);
        pool.assert_invariants();
    }

    #[test]
    fn best_fit_ties_take_lowest_offset() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 512, 64, FreeListOrder::SortBySize);

        let a = allocate(&mut pool, 128, 64);
        let _s1 = allocate(&mut pool, 64, 64);
        let b = allocate(&mut pool, 128, 64);
        let _s2 = allocate(&mut pool, 192, 64);

        release(&mut pool, b);
        release(&mut pool, a);

        assert_eq!(allocate(&mut pool, 128, 64).offset(), 0);
        assert_eq!(allocate(&mut pool, 128, 64).offset(), 192);
        assert!(pool.is_full());
    }

    #[test]
    fn first_fit_by_offset() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 1024, 64, FreeListOrder::SortByOffset);

        let a = allocate(&mut pool, 512, 64);
        let _s = allocate(&mut pool, 64, 64);
        let b = allocate(&mut pool, 128, 64);
        let _t = allocate(&mut pool, 320, 64);

        release(&mut pool, b);
        release(&mut pool, a);

        // Best-fit would pick the block at 576.
        assert_eq!(allocate(&mut pool, 100, 64).offset(), 0);
        pool.assert_invariants();
    }

    #[test]
    fn coalescing() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 1024, 256, FreeListOrder::SortBySize);

        let allocs: Vec<_> = (0..4).map(|_| allocate(&mut pool, 256, 256)).collect();
        assert!(pool.try_allocate(1, 1, PoolResourceTypes::BUFFERS).is_none());

        release(&mut pool, allocs[0]);
        release(&mut pool, allocs[2]);
        assert_eq!(pool.free_block_count(), 2);
        pool.assert_invariants();

        // Merges with both neighbors.
        release(&mut pool, allocs[1]);
        assert_eq!(pool.free_block_count(), 1);
        assert_eq!(pool.free_size(), 768);
        pool.assert_invariants();

        release(&mut pool, allocs[3]);
        assert!(pool.is_empty());
        assert_eq!(
            pool.blocks().collect::<Vec<_>>(),
            [BlockInfo {
                offset: 0,
                size: 1024,
                ty: BlockType::Free,
                locked: false,
            }],
        );
    }

    #[test]
    fn padding_for_stricter_alignment() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 2048, 256, FreeListOrder::SortBySize);

        let _first = allocate(&mut pool, 256, 256);
        let padded = allocate(&mut pool, 100, 512);

        assert_eq!(padded.block_offset(), 256);
        assert_eq!(padded.block_size(), 768);
        assert_eq!(padded.offset(), 512);
        assert!(padded.offset() + 100 <= padded.block_offset() + padded.block_size());
        pool.assert_invariants();

        release(&mut pool, padded);
        pool.assert_invariants();
        assert_eq!(pool.free_size(), 2048 - 256);
    }

    #[test]
    fn exact_fit_releases_remainder() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 1024, 64, FreeListOrder::SortBySize);

        let alloc = allocate(&mut pool, 1000, 0);
        assert_eq!(alloc.block_size(), 1024);
        assert!(pool.is_full());
        assert_eq!(pool.free_block_count(), 0);
        assert_eq!(pool.blocks().count(), 1);

        release(&mut pool, alloc);
        assert!(pool.is_empty());
    }

    #[test]
    fn conservation_under_churn() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 64 * 1024, 256, FreeListOrder::SortBySize);
        let mut live = Vec::new();

        // A deterministic pseudo-random sequence of sizes and frees.
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            if seed % 3 == 0 && !live.is_empty() {
                let index = seed as usize % live.len();
                release(&mut pool, live.swap_remove(index));
            } else {
                let size = DeviceSize::from(seed % 4096 + 1);
                if let Some(alloc) = pool.try_allocate(size, 256, PoolResourceTypes::BUFFERS) {
                    live.push(alloc);
                }
            }

            pool.assert_invariants();
        }

        for alloc in live {
            release(&mut pool, alloc);
        }
        assert!(pool.is_empty());
        assert_eq!(pool.free_block_count(), 1);
    }

    #[test]
    fn deallocate_unlocked_block() {
        let (_device, _fence, adapter) = mock_adapter!();
        let mut pool = new_pool(&adapter, 1024, 64, FreeListOrder::SortBySize);

        let alloc = allocate(&mut pool, 64, 64);
        pool.unlock(alloc.block);

        assert_should_panic!({
            pool.deallocate(alloc.block);
        });
    }
}
