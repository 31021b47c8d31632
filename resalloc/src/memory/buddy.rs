//! Power-of-two suballocation for small allocations with short lifetimes.

use super::{
    align_up, AllocatorConfig, AllocatorData, AllocatorRef, BuddyAllocation, LocationType,
    ResourceLocation, SubDeallocator, UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE,
};
use crate::{
    device::{
        Adapter, AdapterOwned, HeapFlags, HeapType, Resource, ResourceCreateInfo, ResourceDesc,
        ResourceStates,
    },
    DeviceError, DeviceSize, NonExhaustive,
};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::{mem, sync::Arc};

/// Parameters to create a new [`BuddyAllocator`].
#[derive(Clone, Debug)]
pub struct BuddyAllocatorCreateInfo {
    /// The configuration of the backing buffer.
    ///
    /// The default value is an upload heap in the generic read state.
    pub config: AllocatorConfig,

    /// The size of the smallest block. Must be a power of two.
    ///
    /// The default value is `256`.
    pub min_block_size: DeviceSize,

    /// The size of the backing buffer, which is the largest block. Must be a power of two and at
    /// least `min_block_size`.
    ///
    /// The default value is [`UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE`].
    ///
    /// [`UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE`]: super::UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE
    pub max_block_size: DeviceSize,

    /// The name given to the backing buffer.
    ///
    /// The default value is `"BuddyAllocator"`.
    pub debug_name: String,

    pub _ne: NonExhaustive,
}

impl Default for BuddyAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        BuddyAllocatorCreateInfo {
            config: upload_config(),
            min_block_size: 256,
            max_block_size: UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE,
            debug_name: "BuddyAllocator".to_owned(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// An allocator whose blocks form a binary tree of power-of-two sizes inside one buffer.
///
/// # Algorithm
///
/// Each block size has an *order*: blocks of order 0 are `min_block_size` bytes, and each order
/// doubles the size, up to the order of the whole buffer. Every order has its own free-list of
/// block offsets, kept sorted so that the lowest offset is always picked. When the requested
/// order has no free block, a block of the next order that has one is split in halves called
/// *buddies*, recursively. Freeing does the opposite: as long as the buddy of the freed block is
/// free too, the two are merged into a block of the next order.
///
/// Blocks are not freed when a location is dropped, but retired with the current frame fence
/// value. [`cleanup_allocations`] frees the retired blocks whose fence has completed.
///
/// The backing buffer is only created when the first block is allocated.
///
/// [`cleanup_allocations`]: Self::cleanup_allocations
#[derive(Debug)]
pub struct BuddyAllocator {
    adapter: Arc<Adapter>,
    config: AllocatorConfig,
    min_block_size: DeviceSize,
    max_block_size: DeviceSize,
    max_order: u32,
    debug_name: String,
    state: Mutex<BuddyAllocatorState>,
}

#[derive(Debug)]
struct BuddyAllocatorState {
    backing: Option<Arc<Resource>>,
    // Offsets in `min_block_size` units, sorted.
    free_lists: SmallVec<[Vec<u32>; 16]>,
    retired_blocks: Vec<RetiredBlock>,
    // Includes retired blocks.
    allocated_size: DeviceSize,
    last_used_fence: u64,
}

/// A block waiting for its fence before being freed.
#[derive(Clone, Copy, Debug)]
struct RetiredBlock {
    fence: u64,
    offset: u32,
    order: u32,
}

impl BuddyAllocator {
    /// Creates a new `BuddyAllocator`. The backing buffer is created on the first allocation.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.min_block_size` or `create_info.max_block_size` is not a power
    ///   of two.
    /// - Panics if `create_info.max_block_size` is smaller than `create_info.min_block_size`.
    pub fn new(adapter: Arc<Adapter>, create_info: BuddyAllocatorCreateInfo) -> Arc<Self> {
        let BuddyAllocatorCreateInfo {
            config,
            min_block_size,
            max_block_size,
            debug_name,
            _ne: _,
        } = create_info;

        assert!(min_block_size.is_power_of_two());
        assert!(max_block_size.is_power_of_two());
        assert!(max_block_size >= min_block_size);

        let max_order = (max_block_size / min_block_size).trailing_zeros();

        // Block offsets are stored as 32-bit unit counts.
        assert!(max_order < u32::BITS);

        let mut free_lists: SmallVec<[Vec<u32>; 16]> =
            (0..=max_order).map(|_| Vec::new()).collect();
        // The root block has the lowest offset and highest order, so it's the whole buffer.
        free_lists[max_order as usize].push(0);

        Arc::new(BuddyAllocator {
            adapter,
            config,
            min_block_size,
            max_block_size,
            max_order,
            debug_name,
            state: Mutex::new(BuddyAllocatorState {
                backing: None,
                free_lists,
                retired_blocks: Vec::new(),
                allocated_size: 0,
                last_used_fence: 0,
            }),
        })
    }

    /// Returns the order of the smallest block that holds `size` bytes.
    fn order_from_size(&self, size: DeviceSize) -> u32 {
        let units = size.div_ceil(self.min_block_size).max(1);

        units.next_power_of_two().trailing_zeros()
    }

    #[inline]
    fn block_size(&self, order: u32) -> DeviceSize {
        self.min_block_size << order
    }

    /// Returns whether a block for `size` bytes aligned to `alignment` could be allocated right
    /// now.
    pub fn can_allocate(&self, size: DeviceSize, alignment: DeviceSize) -> bool {
        let state = self.state.lock();

        if state.allocated_size == self.max_block_size {
            return false;
        }

        let size = padded_size(self.min_block_size, size, alignment);

        for order in (0..=self.max_order).rev() {
            if self.block_size(order) < size {
                break;
            }

            if !state.free_lists[order as usize].is_empty() {
                return true;
            }
        }

        false
    }

    /// Tries to allocate `size` bytes aligned to `alignment` and wire `location` to them.
    ///
    /// Returns `Ok(false)` when no block is large enough, leaving `location` untouched. An error
    /// is only returned if the backing buffer had to be created and its creation failed.
    pub fn try_allocate(
        self: &Arc<Self>,
        size: DeviceSize,
        alignment: DeviceSize,
        location: &mut ResourceLocation,
    ) -> Result<bool, DeviceError> {
        let padded_size = padded_size(self.min_block_size, size, alignment);

        if padded_size > self.max_block_size {
            return Ok(false);
        }

        let order = self.order_from_size(padded_size);
        let mut state = self.state.lock();

        if !state.has_free_block(order) {
            return Ok(false);
        }

        let backing = match state.backing.clone() {
            Some(backing) => backing,
            None => {
                let backing = Resource::new_committed(
                    self.adapter.device(),
                    &ResourceCreateInfo {
                        desc: ResourceDesc::buffer(
                            self.max_block_size,
                            self.config.resource_flags,
                        ),
                        heap_type: self.config.heap_type,
                        heap_flags: HeapFlags::empty(),
                        initial_state: self.config.initial_resource_state,
                        debug_name: &self.debug_name,
                    },
                )?;
                log::debug!(
                    "created the backing buffer of `{}` ({} bytes)",
                    self.debug_name,
                    self.max_block_size,
                );
                state.backing = Some(backing.clone());

                backing
            }
        };

        let Some(block_offset) = state.allocate_block(order) else {
            return Ok(false);
        };
        state.allocated_size += self.block_size(order);

        let block_offset_bytes = DeviceSize::from(block_offset) * self.min_block_size;
        let offset = if padded_size != size {
            align_up(block_offset_bytes, alignment)
        } else {
            block_offset_bytes
        };

        location.ty = LocationType::SubAllocation;
        location.allocator = Some(AllocatorRef::SubAllocator(self.clone()));
        location.allocator_data = AllocatorData::Buddy(BuddyAllocation {
            offset: block_offset,
            order,
        });
        location.gpu_virtual_address = backing.gpu_virtual_address() + offset;
        // SAFETY: The block is inside the buffer, and therefore inside its mapping.
        location.mapped_base_address = backing
            .mapped_ptr()
            .map(|ptr| unsafe { ptr.add(offset as usize) });
        location.offset_from_base_of_resource = offset;
        location.size = size;
        location.resource = Some(backing);

        Ok(true)
    }

    /// Frees the retired blocks whose fence has completed.
    pub fn cleanup_allocations(&self) {
        let frame_fence = self.adapter.frame_fence();
        frame_fence.update_last_completed_fence();

        let mut state = self.state.lock();
        let (complete, pending): (Vec<_>, Vec<_>) = mem::take(&mut state.retired_blocks)
            .into_iter()
            .partition(|block| frame_fence.is_fence_complete(block.fence));
        state.retired_blocks = pending;

        for block in complete {
            state.free_block(block.offset, block.order, self.max_order);
            state.allocated_size -= self.block_size(block.order);
        }
    }

    /// Returns whether no block is allocated or waiting for its fence.
    pub fn is_empty(&self) -> bool {
        self.state.lock().allocated_size == 0
    }

    /// Returns the fence value of the last deallocation.
    pub fn last_used_fence(&self) -> u64 {
        self.state.lock().last_used_fence
    }

    /// Returns the total size of the free blocks.
    pub fn free_size(&self) -> DeviceSize {
        self.max_block_size - self.state.lock().allocated_size
    }

    #[inline]
    pub fn min_block_size(&self) -> DeviceSize {
        self.min_block_size
    }

    #[inline]
    pub fn max_block_size(&self) -> DeviceSize {
        self.max_block_size
    }

    /// Returns the backing buffer, if it was created already.
    pub fn backing(&self) -> Option<Arc<Resource>> {
        self.state.lock().backing.clone()
    }

    #[cfg(test)]
    fn free_lists(&self) -> Vec<Vec<u32>> {
        self.state.lock().free_lists.to_vec()
    }
}

impl BuddyAllocatorState {
    fn has_free_block(&self, order: u32) -> bool {
        self.free_lists[order as usize..]
            .iter()
            .any(|free_list| !free_list.is_empty())
    }

    fn allocate_block(&mut self, order: u32) -> Option<u32> {
        // Start searching at the requested order going up.
        let (found_order, offset) = self.free_lists[order as usize..]
            .iter()
            .enumerate()
            .find_map(|(index, free_list)| {
                let &offset = free_list.first()?;

                Some((order + index as u32, offset))
            })?;
        self.free_lists[found_order as usize].remove(0);

        // Go in the opposite direction, splitting blocks from higher orders. The left half is
        // split again in the next turn, the right half is freed.
        for order in (order..found_order).rev() {
            let right_half = offset + (1 << order);
            let free_list = &mut self.free_lists[order as usize];
            let (Ok(index) | Err(index)) = free_list.binary_search(&right_half);
            free_list.insert(index, right_half);
        }

        Some(offset)
    }

    fn free_block(&mut self, offset: u32, order: u32, max_order: u32) {
        let mut offset = offset;
        let mut order = order;

        debug_assert!(!self.free_lists[order as usize].contains(&offset));

        // Coalesce with the buddy while it's free.
        while order < max_order {
            let buddy = offset ^ (1 << order);
            let free_list = &mut self.free_lists[order as usize];

            match free_list.binary_search(&buddy) {
                Ok(index) => {
                    free_list.remove(index);
                    offset = offset.min(buddy);
                    order += 1;
                }
                Err(_) => break,
            }
        }

        let free_list = &mut self.free_lists[order as usize];
        let (Ok(index) | Err(index)) = free_list.binary_search(&offset);
        free_list.insert(index, offset);
    }
}

impl SubDeallocator for BuddyAllocator {
    fn deallocate(&self, location: &mut ResourceLocation) {
        let AllocatorData::Buddy(block) = mem::take(&mut location.allocator_data) else {
            debug_assert!(false, "deallocating a location that isn't a buddy block");
            return;
        };

        let mut state = self.state.lock();
        let fence = self.adapter.frame_fence().current_fence();

        state.retired_blocks.push(RetiredBlock {
            fence,
            offset: block.offset,
            order: block.order,
        });
        state.last_used_fence = state.last_used_fence.max(fence);
    }
}

impl AdapterOwned for BuddyAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// Parameters to create a new [`MultiBuddyAllocator`].
#[derive(Clone, Debug)]
pub struct MultiBuddyAllocatorCreateInfo {
    /// The configuration of the backing buffers.
    ///
    /// The default value is an upload heap in the generic read state.
    pub config: AllocatorConfig,

    /// The size of the smallest block. Must be a power of two.
    ///
    /// The default value is `256`.
    pub min_block_size: DeviceSize,

    /// The size of new buddy allocators, unless a single allocation needs more. Must be a power
    /// of two.
    ///
    /// The default value is [`UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE`].
    ///
    /// [`UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE`]: super::UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE
    pub default_pool_size: DeviceSize,

    /// The name given to the backing buffers.
    ///
    /// The default value is `"MultiBuddyAllocator"`.
    pub debug_name: String,

    pub _ne: NonExhaustive,
}

impl Default for MultiBuddyAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        MultiBuddyAllocatorCreateInfo {
            config: upload_config(),
            min_block_size: 256,
            default_pool_size: UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE,
            debug_name: "MultiBuddyAllocator".to_owned(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// A growable list of [`BuddyAllocator`]s.
#[derive(Debug)]
pub struct MultiBuddyAllocator {
    adapter: Arc<Adapter>,
    config: AllocatorConfig,
    min_block_size: DeviceSize,
    default_pool_size: DeviceSize,
    debug_name: String,
    allocators: RwLock<Vec<Arc<BuddyAllocator>>>,
}

impl MultiBuddyAllocator {
    /// Creates a new `MultiBuddyAllocator` without any buddy allocator.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.min_block_size` or `create_info.default_pool_size` is not a
    ///   power of two.
    pub fn new(adapter: Arc<Adapter>, create_info: MultiBuddyAllocatorCreateInfo) -> Arc<Self> {
        let MultiBuddyAllocatorCreateInfo {
            config,
            min_block_size,
            default_pool_size,
            debug_name,
            _ne: _,
        } = create_info;

        assert!(min_block_size.is_power_of_two());
        assert!(default_pool_size.is_power_of_two());
        assert!(default_pool_size >= min_block_size);

        Arc::new(MultiBuddyAllocator {
            adapter,
            config,
            min_block_size,
            default_pool_size,
            debug_name,
            allocators: RwLock::new(Vec::new()),
        })
    }

    /// Allocates `size` bytes aligned to `alignment` from the first buddy allocator that has
    /// room, creating a new one if none does. `location` is cleared first.
    pub fn try_allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError> {
        location.clear();

        let scanned = {
            let allocators = self.allocators.read();

            for allocator in allocators.iter() {
                if allocator.try_allocate(size, alignment, location)? {
                    return Ok(());
                }
            }

            allocators.len()
        };

        let mut allocators = self.allocators.write();

        // Another thread might have added an allocator in between.
        for allocator in &allocators[scanned.min(allocators.len())..] {
            if allocator.try_allocate(size, alignment, location)? {
                return Ok(());
            }
        }

        let pool_size = padded_size(self.min_block_size, size, alignment)
            .next_power_of_two()
            .max(self.default_pool_size);
        let allocator = BuddyAllocator::new(
            self.adapter.clone(),
            BuddyAllocatorCreateInfo {
                config: self.config,
                min_block_size: self.min_block_size,
                max_block_size: pool_size,
                debug_name: format!("{} {}", self.debug_name, allocators.len()),
                ..Default::default()
            },
        );
        log::trace!(
            "`{}` grew by a buddy allocator of {} bytes",
            self.debug_name,
            pool_size,
        );

        let allocated = allocator.try_allocate(size, alignment, location)?;
        debug_assert!(allocated);
        allocators.push(allocator);

        Ok(())
    }

    /// Frees the retired blocks of every buddy allocator, and drops the empty ones that haven't
    /// been used for `frame_lag` fence values.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        let completed_fence = self.adapter.frame_fence().update_last_completed_fence();
        let mut allocators = self.allocators.write();

        for allocator in allocators.iter() {
            allocator.cleanup_allocations();
        }

        allocators.retain(|allocator| {
            let trim = allocator.is_empty()
                && allocator.last_used_fence().saturating_add(frame_lag) <= completed_fence;

            if trim {
                log::debug!(
                    "`{}` trimmed a buddy allocator of {} bytes",
                    self.debug_name,
                    allocator.max_block_size(),
                );
            }

            !trim
        });
    }

    /// Returns the number of buddy allocators.
    pub fn allocator_count(&self) -> usize {
        self.allocators.read().len()
    }

    /// Returns the sizes of the buddy allocators.
    pub fn pool_sizes(&self) -> Vec<DeviceSize> {
        self.allocators
            .read()
            .iter()
            .map(|allocator| allocator.max_block_size())
            .collect()
    }
}

impl AdapterOwned for MultiBuddyAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// Returns `size` padded so that the block can hold it at `alignment` when blocks aren't aligned
/// to it already.
fn padded_size(min_block_size: DeviceSize, size: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment != 0 && min_block_size % alignment != 0 {
        size + alignment
    } else {
        size
    }
}

fn upload_config() -> AllocatorConfig {
    AllocatorConfig {
        heap_type: HeapType::Upload,
        initial_resource_state: ResourceStates::GENERIC_READ,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::ArrayQueue;
    use std::thread;

    const K: DeviceSize = 1024;

    fn buddy_allocator(adapter: &Arc<Adapter>, max_block_size: DeviceSize) -> Arc<BuddyAllocator> {
        BuddyAllocator::new(
            adapter.clone(),
            BuddyAllocatorCreateInfo {
                max_block_size,
                ..Default::default()
            },
        )
    }

    fn allocate(
        allocator: &Arc<BuddyAllocator>,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<ResourceLocation> {
        let mut location = ResourceLocation::new();

        allocator
            .try_allocate(size, alignment, &mut location)
            .unwrap()
            .then_some(location)
    }

    #[test]
    fn round_trip() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 4 * K);

        let locations: Vec<_> = [256, 512, 256, 1024, 2048]
            .into_iter()
            .map(|size| allocate(&allocator, size, 0).unwrap())
            .collect();

        let offsets: Vec<_> = locations
            .iter()
            .map(ResourceLocation::offset_from_base_of_resource)
            .collect();
        assert_eq!(offsets, [0, 512, 256, 1024, 2048]);
        assert_eq!(allocator.free_size(), 0);
        assert!(!allocator.can_allocate(1, 0));
        assert!(allocate(&allocator, 1, 0).is_none());

        drop(locations);
        assert!(!allocator.is_empty());

        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations();

        assert!(allocator.is_empty());
        let coalesced: Vec<Vec<u32>> = vec![vec![], vec![], vec![], vec![], vec![0]];
        assert_eq!(allocator.free_lists(), coalesced);
    }

    #[test]
    fn coalesces_in_any_free_order() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 4 * K);
        let coalesced: Vec<Vec<u32>> = vec![vec![], vec![], vec![], vec![], vec![0]];

        for order in [[4, 3, 2, 1, 0], [2, 0, 4, 1, 3], [1, 3, 0, 4, 2]] {
            let mut locations: Vec<_> = [256, 512, 256, 1024, 2048]
                .into_iter()
                .map(|size| allocate(&allocator, size, 0))
                .collect();
            assert!(locations.iter().all(Option::is_some));
            assert_eq!(allocator.free_size(), 0);

            for index in order {
                drop(locations[index].take());

                fence.increment_current_fence();
                fence.complete_all();
                allocator.cleanup_allocations();
            }

            assert!(allocator.is_empty());
            assert_eq!(allocator.free_lists(), coalesced, "free order {order:?}");
        }
    }

    #[test]
    fn location_wiring() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 64 * K);
        assert_eq!(device.resources_created(), 0);

        let location = allocate(&allocator, 300, 0).unwrap();
        let backing = allocator.backing().unwrap();

        assert_eq!(device.resources_created(), 1);
        assert_eq!(location.location_type(), LocationType::SubAllocation);
        assert_eq!(location.size(), 300);
        assert_eq!(location.gpu_virtual_address(), backing.gpu_virtual_address());
        assert!(matches!(
            location.allocator_data(),
            AllocatorData::Buddy(BuddyAllocation {
                offset: 0,
                order: 1,
            }),
        ));

        let other = allocate(&allocator, 100, 0).unwrap();
        assert_eq!(other.offset_from_base_of_resource(), 512);
        assert_eq!(
            other.mapped_base_address().unwrap().as_ptr() as usize,
            backing.mapped_ptr().unwrap().as_ptr() as usize + 512,
        );
        assert_eq!(device.resources_created(), 1);
    }

    #[test]
    fn padding_for_stricter_alignment() {
        let (_device, _fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 64 * K);

        let _first = allocate(&allocator, 256, 0).unwrap();
        let padded = allocate(&allocator, 100, 512).unwrap();

        // 100 + 512 bytes need a block of order 2.
        assert!(matches!(
            padded.allocator_data(),
            AllocatorData::Buddy(BuddyAllocation { order: 2, .. }),
        ));
        assert_eq!(padded.offset_from_base_of_resource() % 512, 0);
        assert_eq!(padded.size(), 100);
    }

    #[test]
    fn deferred_free() {
        let (_device, fence, adapter) = mock_adapter!(10);
        let allocator = buddy_allocator(&adapter, 4 * K);

        let location = allocate(&allocator, K, 0).unwrap();
        assert_eq!(location.offset_from_base_of_resource(), 0);
        drop(location);
        assert_eq!(allocator.last_used_fence(), 10);

        allocator.cleanup_allocations();
        let other = allocate(&allocator, K, 0).unwrap();
        assert_eq!(other.offset_from_base_of_resource(), K);

        fence.increment_current_fence();
        fence.signal_completed(10);
        allocator.cleanup_allocations();

        let reused = allocate(&allocator, K, 0).unwrap();
        assert_eq!(reused.offset_from_base_of_resource(), 0);
    }

    #[test]
    fn can_allocate() {
        let (_device, _fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 4 * K);

        assert!(allocator.can_allocate(4 * K, 0));
        assert!(!allocator.can_allocate(4 * K + 1, 0));

        let _half = allocate(&allocator, 2 * K, 0).unwrap();
        assert!(allocator.can_allocate(2 * K, 0));
        assert!(!allocator.can_allocate(2 * K + 1, 0));

        let _quarter = allocate(&allocator, K, 0).unwrap();
        assert!(!allocator.can_allocate(2 * K, 0));
        assert!(allocator.can_allocate(K, 0));
        assert!(!allocator.can_allocate(K - 200, 512));
    }

    #[test]
    fn too_large() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 4 * K);

        assert!(allocate(&allocator, 4 * K + 1, 0).is_none());
        assert_eq!(device.resources_created(), 0);
    }

    #[test]
    fn backing_creation_failure() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = buddy_allocator(&adapter, 4 * K);
        device.fail_next_creation(DeviceError::OutOfDeviceMemory);

        let mut location = ResourceLocation::new();
        assert_eq!(
            allocator.try_allocate(K, 0, &mut location),
            Err(DeviceError::OutOfDeviceMemory),
        );
        assert!(!location.is_valid());
        assert!(allocator.is_empty());

        assert!(allocate(&allocator, K, 0).is_some());
    }

    #[test]
    fn multi_grows() {
        let (_device, _fence, adapter) = mock_adapter!();
        let allocator = MultiBuddyAllocator::new(
            adapter.clone(),
            MultiBuddyAllocatorCreateInfo {
                default_pool_size: 4 * K,
                ..Default::default()
            },
        );
        let mut a = ResourceLocation::new();
        let mut b = ResourceLocation::new();
        let mut c = ResourceLocation::new();

        allocator.try_allocate(4 * K, 0, &mut a).unwrap();
        allocator.try_allocate(2 * K, 0, &mut b).unwrap();
        assert_eq!(allocator.pool_sizes(), [4 * K, 4 * K]);

        allocator.try_allocate(10 * K, 0, &mut c).unwrap();
        assert_eq!(allocator.pool_sizes(), [4 * K, 4 * K, 16 * K]);
        assert_eq!(c.size(), 10 * K);
        assert!(!Arc::ptr_eq(a.resource().unwrap(), b.resource().unwrap()));
    }

    #[test]
    fn multi_trims_after_lag() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = MultiBuddyAllocator::new(
            adapter.clone(),
            MultiBuddyAllocatorCreateInfo {
                default_pool_size: 4 * K,
                ..Default::default()
            },
        );
        let mut location = ResourceLocation::new();

        allocator.try_allocate(K, 0, &mut location).unwrap();
        location.clear();

        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations(1);
        assert_eq!(allocator.allocator_count(), 1);

        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations(1);
        assert_eq!(allocator.allocator_count(), 0);
    }

    #[test]
    fn concurrent_allocations() {
        const THREADS: usize = 4;
        const ALLOCATIONS: usize = 64;

        let (device, fence, adapter) = mock_adapter!();
        let allocator = MultiBuddyAllocator::new(
            adapter.clone(),
            MultiBuddyAllocatorCreateInfo {
                default_pool_size: 16 * K,
                ..Default::default()
            },
        );
        let queue = ArrayQueue::new(THREADS * ALLOCATIONS);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let (allocator, queue) = (&allocator, &queue);

                scope.spawn(move || {
                    for i in 0..ALLOCATIONS {
                        let mut location = ResourceLocation::new();
                        allocator
                            .try_allocate((i as DeviceSize % 4 + 1) * 256, 0, &mut location)
                            .unwrap();
                        queue.push(location).unwrap();
                    }
                });
            }
        });

        let mut ranges: Vec<_> = Vec::new();
        while let Some(location) = queue.pop() {
            let resource = location.resource().unwrap().handle();
            let start = location.offset_from_base_of_resource();
            ranges.push((resource, start, start + location.size()));
        }

        // No two live blocks overlap.
        ranges.sort_unstable_by_key(|&(resource, start, _)| (resource.as_raw(), start));
        for pair in ranges.windows(2) {
            if pair[0].0 == pair[1].0 {
                assert!(pair[0].2 <= pair[1].1);
            }
        }

        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations(0);
        assert_eq!(allocator.allocator_count(), 0);
        assert_eq!(device.live_resources(), 0);
    }
}
