//! Upload heap memory for data written by the CPU and read by the GPU.

use super::{
    buddy::{MultiBuddyAllocator, MultiBuddyAllocatorCreateInfo},
    fast::FastAllocatorPagePool,
    pool::FreeListOrder,
    pool_allocator::{PoolAllocator, PoolAllocatorCreateInfo},
    AllocationStrategy, AllocatorConfig, AllocatorData, AllocatorRef, LocationType,
    ResourceLocation, ResourceStateMode, SubDeallocator, FAST_CONSTANT_ALLOCATOR_PAGE_SIZE,
    MANUAL_SUBALLOCATION_ALIGNMENT, UPLOAD_HEAP_BIG_BLOCK_HEAP_SIZE,
    UPLOAD_HEAP_BIG_BLOCK_MAX_ALLOCATION_SIZE, UPLOAD_HEAP_SMALL_BLOCK_MAX_ALLOCATION_SIZE,
    UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE,
};
use crate::{
    device::{
        Adapter, AdapterOwned, HeapFlags, HeapType, ResourceDesc, ResourceFlags, ResourceStates,
    },
    DeviceError, DeviceSize, NonExhaustive,
};
use parking_lot::Mutex;
use std::{mem, ptr::NonNull, sync::Arc};

/// Parameters to create a new [`UploadHeapAllocator`].
#[derive(Clone, Debug)]
pub struct UploadHeapAllocatorCreateInfo {
    /// The size of the buddy allocators used for small allocations.
    ///
    /// The default value is [`UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE`].
    pub small_block_pool_size: DeviceSize,

    /// The largest allocation served by the buddy allocators.
    ///
    /// The default value is [`UPLOAD_HEAP_SMALL_BLOCK_MAX_ALLOCATION_SIZE`].
    pub small_block_max_allocation_size: DeviceSize,

    /// The smallest block of the buddy allocators.
    ///
    /// The default value is `256`.
    pub small_block_min_block_size: DeviceSize,

    /// The default size of the pools used for big allocations.
    ///
    /// The default value is [`UPLOAD_HEAP_BIG_BLOCK_HEAP_SIZE`].
    pub big_block_pool_size: DeviceSize,

    /// The largest allocation served by the pools. Anything bigger gets a standalone buffer.
    ///
    /// The default value is [`UPLOAD_HEAP_BIG_BLOCK_MAX_ALLOCATION_SIZE`].
    pub big_block_max_allocation_size: DeviceSize,

    /// The size of the pages handed to [`FastConstantAllocator`]s.
    ///
    /// The default value is [`FAST_CONSTANT_ALLOCATOR_PAGE_SIZE`].
    ///
    /// [`FastConstantAllocator`]: super::fast::FastConstantAllocator
    pub constant_page_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for UploadHeapAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        UploadHeapAllocatorCreateInfo {
            small_block_pool_size: UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE,
            small_block_max_allocation_size: UPLOAD_HEAP_SMALL_BLOCK_MAX_ALLOCATION_SIZE,
            small_block_min_block_size: 256,
            big_block_pool_size: UPLOAD_HEAP_BIG_BLOCK_HEAP_SIZE,
            big_block_max_allocation_size: UPLOAD_HEAP_BIG_BLOCK_MAX_ALLOCATION_SIZE,
            constant_page_size: FAST_CONSTANT_ALLOCATOR_PAGE_SIZE,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Hands out upload heap memory, picking the allocator by size.
///
/// - Allocations up to `small_block_max_allocation_size` come from a [`MultiBuddyAllocator`].
/// - Bigger allocations come from a [`PoolAllocator`] sorted by offset. Their blocks are unlocked
///   right away, since upload memory is only read by the GPU once it has been fully written.
/// - Allocations above `big_block_max_allocation_size` get a standalone buffer.
/// - Constant buffer pages for [`FastConstantAllocator`]s come from a page pool.
///
/// [`FastConstantAllocator`]: super::fast::FastConstantAllocator
#[derive(Debug)]
pub struct UploadHeapAllocator {
    adapter: Arc<Adapter>,
    small_block_max_allocation_size: DeviceSize,
    small_block_allocator: Arc<MultiBuddyAllocator>,
    big_block_allocator: Arc<PoolAllocator>,
    constant_page_allocator: Arc<ConstantPageAllocator>,
}

impl UploadHeapAllocator {
    /// Creates a new `UploadHeapAllocator`. No memory is allocated until the first request.
    pub fn new(adapter: Arc<Adapter>, create_info: UploadHeapAllocatorCreateInfo) -> Arc<Self> {
        let UploadHeapAllocatorCreateInfo {
            small_block_pool_size,
            small_block_max_allocation_size,
            small_block_min_block_size,
            big_block_pool_size,
            big_block_max_allocation_size,
            constant_page_size,
            _ne: _,
        } = create_info;

        let config = AllocatorConfig {
            heap_type: HeapType::Upload,
            heap_flags: HeapFlags::empty(),
            resource_flags: ResourceFlags::empty(),
            initial_resource_state: ResourceStates::GENERIC_READ,
        };

        let small_block_allocator = MultiBuddyAllocator::new(
            adapter.clone(),
            MultiBuddyAllocatorCreateInfo {
                config,
                min_block_size: small_block_min_block_size,
                default_pool_size: small_block_pool_size,
                debug_name: "UploadHeapAllocator SmallBlock".to_owned(),
                ..Default::default()
            },
        );
        let big_block_allocator = PoolAllocator::new(
            adapter.clone(),
            PoolAllocatorCreateInfo {
                config,
                strategy: AllocationStrategy::ManualSubAllocation,
                free_list_order: FreeListOrder::SortByOffset,
                default_pool_size: big_block_pool_size,
                pool_alignment: MANUAL_SUBALLOCATION_ALIGNMENT,
                max_allocation_size: big_block_max_allocation_size,
                defrag_enabled: false,
                debug_name: "UploadHeapAllocator BigBlock".to_owned(),
                ..Default::default()
            },
        );
        let constant_page_allocator = Arc::new(ConstantPageAllocator {
            pages: Mutex::new(FastAllocatorPagePool::new(
                adapter.clone(),
                HeapType::Upload,
                constant_page_size,
            )),
        });

        Arc::new(UploadHeapAllocator {
            adapter,
            small_block_max_allocation_size,
            small_block_allocator,
            big_block_allocator,
            constant_page_allocator,
        })
    }

    /// Allocates `size` bytes of upload memory aligned to `alignment` and wires `location` to
    /// them. `location` is cleared first.
    ///
    /// Returns the mapped address of the allocation.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    pub fn alloc_upload_resource(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        location: &mut ResourceLocation,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        assert!(size > 0);

        location.clear();

        if size <= self.small_block_max_allocation_size {
            self.small_block_allocator
                .try_allocate(size, alignment, location)?;
        } else {
            self.big_block_allocator.allocate_resource(
                HeapType::Upload,
                &ResourceDesc::buffer(size, ResourceFlags::empty()),
                size,
                alignment,
                ResourceStateMode::Single,
                ResourceStates::GENERIC_READ,
                "UploadHeapAllocator BigBlock",
                location,
            )?;
            location.unlock_pool_data();
        }

        Ok(location.mapped_base_address())
    }

    /// Wires `location` to a whole constant buffer page. `location` is cleared first, which
    /// gives its previous page back.
    ///
    /// Returns the mapped address of the page.
    pub fn alloc_fast_constant_allocation_page(
        &self,
        location: &mut ResourceLocation,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        location.clear();
        self.constant_page_allocator.allocate_page(location)?;

        Ok(location.mapped_base_address())
    }

    /// Runs the per-frame cleanup of the three allocators.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        self.small_block_allocator.cleanup_allocations(frame_lag);
        self.big_block_allocator.cleanup_allocations(frame_lag);
        self.constant_page_allocator
            .pages
            .lock()
            .cleanup_pages(frame_lag);
    }

    /// Returns the size of the constant buffer pages.
    #[inline]
    pub fn constant_page_size(&self) -> DeviceSize {
        self.constant_page_allocator.pages.lock().page_size()
    }

    #[inline]
    pub fn small_block_allocator(&self) -> &Arc<MultiBuddyAllocator> {
        &self.small_block_allocator
    }

    #[inline]
    pub fn big_block_allocator(&self) -> &Arc<PoolAllocator> {
        &self.big_block_allocator
    }

    /// Returns the number of constant buffer pages waiting to be reused.
    pub fn pooled_constant_page_count(&self) -> usize {
        self.constant_page_allocator.pages.lock().page_count()
    }
}

impl AdapterOwned for UploadHeapAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// Lends whole pages out of a page pool as suballocations, and takes them back when the
/// location is cleared.
#[derive(Debug)]
struct ConstantPageAllocator {
    pages: Mutex<FastAllocatorPagePool>,
}

impl ConstantPageAllocator {
    fn allocate_page(self: &Arc<Self>, location: &mut ResourceLocation) -> Result<(), DeviceError> {
        let pages = &mut *self.pages.lock();
        let page = pages.request_page()?;
        let buffer = page.buffer().clone();

        location.ty = LocationType::SubAllocation;
        location.allocator = Some(AllocatorRef::SubAllocator(self.clone()));
        location.allocator_data = AllocatorData::Page(page);
        location.gpu_virtual_address = buffer.gpu_virtual_address();
        location.mapped_base_address = buffer.mapped_ptr();
        location.offset_from_base_of_resource = 0;
        location.size = pages.page_size();
        location.resource = Some(buffer);

        Ok(())
    }
}

impl SubDeallocator for ConstantPageAllocator {
    fn deallocate(&self, location: &mut ResourceLocation) {
        match mem::take(&mut location.allocator_data) {
            AllocatorData::Page(page) => {
                // The page must not count the location as a reference once it is pooled.
                location.resource = None;
                self.pages.lock().return_page(page);
            }
            _ => debug_assert!(false, "deallocating a location that isn't a constant page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fast::FastConstantAllocator;

    const K: DeviceSize = 1024;
    const M: DeviceSize = 1024 * K;

    #[test]
    fn small_allocations_use_buddies() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = UploadHeapAllocator::new(adapter, Default::default());

        let mut location = ResourceLocation::new();
        let ptr = allocator
            .alloc_upload_resource(K, 256, &mut location)
            .unwrap();

        assert!(ptr.is_some());
        assert_eq!(location.location_type(), LocationType::SubAllocation);
        assert!(matches!(location.allocator_data(), AllocatorData::Buddy(_)));
        assert_eq!(location.size(), K);
        assert_eq!(
            allocator.small_block_allocator().pool_sizes(),
            [UPLOAD_HEAP_SMALL_BLOCK_POOL_SIZE],
        );
        assert_eq!(device.resources_created(), 1);
    }

    #[test]
    fn big_allocations_are_unlocked_right_away() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = UploadHeapAllocator::new(adapter, Default::default());

        let mut location = ResourceLocation::new();
        allocator
            .alloc_upload_resource(100 * K, 256, &mut location)
            .unwrap()
            .unwrap();
        assert!(matches!(location.allocator_data(), AllocatorData::Pool(_)));
        assert!(!allocator.big_block_allocator().is_locked(&location));
        assert_eq!(
            allocator.big_block_allocator().pool_sizes(),
            [Some(UPLOAD_HEAP_BIG_BLOCK_HEAP_SIZE)],
        );

        let offset = location.offset_from_base_of_resource();
        location.clear();
        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations(10);

        // Freed once the fence completes, and coalesced with the rest of the pool.
        let mut location = ResourceLocation::new();
        allocator
            .alloc_upload_resource(200 * K, 256, &mut location)
            .unwrap();
        assert_eq!(location.offset_from_base_of_resource(), offset);
        assert_eq!(allocator.big_block_allocator().pool_count(), 1);
    }

    #[test]
    fn huge_allocations_stand_alone() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = UploadHeapAllocator::new(
            adapter,
            UploadHeapAllocatorCreateInfo {
                big_block_max_allocation_size: M,
                ..Default::default()
            },
        );

        let mut location = ResourceLocation::new();
        allocator
            .alloc_upload_resource(2 * M, 0, &mut location)
            .unwrap();
        assert_eq!(location.location_type(), LocationType::StandAlone);
        assert_eq!(allocator.big_block_allocator().pool_count(), 0);

        drop(location);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn constant_allocations() {
        let (device, _fence, adapter) = mock_adapter!();
        let upload = UploadHeapAllocator::new(adapter, Default::default());
        let mut allocator = FastConstantAllocator::new(upload.clone());

        let mut first = ResourceLocation::new();
        allocator.allocate(100, &mut first).unwrap().unwrap();
        assert_eq!(first.location_type(), LocationType::FastAllocation);
        assert_eq!(first.offset_from_base_of_resource(), 0);
        assert_eq!(first.size(), 256);

        let mut second = ResourceLocation::new();
        allocator.allocate(300, &mut second).unwrap();
        assert_eq!(second.offset_from_base_of_resource(), 256);
        assert_eq!(second.size(), 512);
        assert_eq!(
            second.gpu_virtual_address(),
            first.gpu_virtual_address() + 256,
        );
        assert!(Arc::ptr_eq(
            first.resource().unwrap(),
            second.resource().unwrap(),
        ));
        assert_eq!(allocator.offset(), 768);
        assert_eq!(device.resources_created(), 1);
    }

    #[test]
    fn constant_allocator_moves_to_next_page() {
        let (device, _fence, adapter) = mock_adapter!();
        let upload = UploadHeapAllocator::new(adapter, Default::default());
        let mut allocator = FastConstantAllocator::new(upload.clone());

        let locations: Vec<_> = (0..FAST_CONSTANT_ALLOCATOR_PAGE_SIZE / 256)
            .map(|_| {
                let mut location = ResourceLocation::new();
                allocator.allocate(256, &mut location).unwrap();
                location
            })
            .collect();
        assert_eq!(device.resources_created(), 1);
        assert_eq!(upload.pooled_constant_page_count(), 0);

        let mut location = ResourceLocation::new();
        allocator.allocate(16, &mut location).unwrap();
        assert_eq!(location.offset_from_base_of_resource(), 0);
        assert!(!Arc::ptr_eq(
            location.resource().unwrap(),
            locations[0].resource().unwrap(),
        ));
        assert_eq!(device.resources_created(), 2);
        assert_eq!(upload.pooled_constant_page_count(), 1);
    }

    #[test]
    fn constant_pages_are_recycled() {
        let (device, fence, adapter) = mock_adapter!();
        let upload = UploadHeapAllocator::new(adapter, Default::default());

        let mut allocator = FastConstantAllocator::new(upload.clone());
        let mut location = ResourceLocation::new();
        allocator.allocate(64, &mut location).unwrap();
        drop(allocator);
        assert_eq!(upload.pooled_constant_page_count(), 1);

        fence.increment_current_fence();
        fence.complete_all();

        // The page is still referenced by the location.
        let mut allocator = FastConstantAllocator::new(upload.clone());
        let mut other = ResourceLocation::new();
        allocator.allocate(64, &mut other).unwrap();
        assert_eq!(device.resources_created(), 2);
        drop(allocator);

        drop(location);
        fence.increment_current_fence();
        fence.complete_all();

        let mut allocator = FastConstantAllocator::new(upload.clone());
        allocator.allocate(64, &mut other).unwrap();
        assert_eq!(device.resources_created(), 2);
    }

    #[test]
    fn allocate_constants() {
        let (_device, _fence, adapter) = mock_adapter!();
        let upload = UploadHeapAllocator::new(adapter, Default::default());
        let mut allocator = FastConstantAllocator::new(upload);

        let data: [f32; 8] = [1.0, 2.0, 3.0, 4.0, 0.5, 0.5, 0.5, 0.5];
        let mut location = ResourceLocation::new();
        allocator.allocate_constants(&data, &mut location).unwrap();

        assert_eq!(location.size(), 256);
        let bytes = unsafe { location.mapped_slice() }.unwrap();
        assert_eq!(&bytes[..32], bytemuck::bytes_of(&data));
    }

    #[test]
    fn cleanup_trims_idle_allocators() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = UploadHeapAllocator::new(adapter, Default::default());

        let mut small = ResourceLocation::new();
        let mut big = ResourceLocation::new();
        allocator.alloc_upload_resource(K, 0, &mut small).unwrap();
        allocator
            .alloc_upload_resource(M, 0, &mut big)
            .unwrap();
        drop((small, big));

        fence.increment_current_fence();
        fence.complete_all();
        allocator.cleanup_allocations(0);

        assert_eq!(allocator.small_block_allocator().allocator_count(), 0);
        assert_eq!(allocator.big_block_allocator().pool_count(), 0);
    }
}
