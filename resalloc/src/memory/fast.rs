//! Bump allocation inside recycled pages.
//!
//! A page is a committed buffer of fixed size. Allocating from a page only bumps an offset, and
//! nothing is ever freed individually: locations handed out by the allocators in this module
//! keep a reference to the buffer of their page, and the page is recycled once the frame fence
//! it was last used with has completed and no location refers to it anymore.

use super::{
    align_up, upload::UploadHeapAllocator, ResourceLocation, BUFFER_ALIGNMENT,
    CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT, FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN,
};
use crate::{
    device::{
        Adapter, AdapterOwned, HeapFlags, HeapType, Resource, ResourceCreateInfo, ResourceDesc,
        ResourceFlags, ResourceStates,
    },
    DeviceError, DeviceSize,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, ptr::NonNull, sync::Arc};

/// A page of a [`FastAllocatorPagePool`].
#[derive(Clone, Debug)]
pub struct FastAllocatorPage {
    buffer: Arc<Resource>,
    next_fast_alloc_offset: DeviceSize,
    frame_fence: u64,
}

impl FastAllocatorPage {
    /// Returns the buffer of the page.
    #[inline]
    pub fn buffer(&self) -> &Arc<Resource> {
        &self.buffer
    }

    /// Returns the offset the next allocation will be bumped from.
    #[inline]
    pub fn next_fast_alloc_offset(&self) -> DeviceSize {
        self.next_fast_alloc_offset
    }

    /// Returns the last frame fence value the page was used with.
    #[inline]
    pub fn frame_fence(&self) -> u64 {
        self.frame_fence
    }

    #[inline]
    fn update_fence(&mut self, fence: u64) {
        self.frame_fence = self.frame_fence.max(fence);
    }

    /// Returns whether a location still refers to the buffer of the page.
    #[inline]
    fn is_referenced(&self) -> bool {
        Arc::strong_count(&self.buffer) > 1
    }
}

/// A pool of pages of the same size and heap type.
#[derive(Debug)]
pub struct FastAllocatorPagePool {
    adapter: Arc<Adapter>,
    heap_type: HeapType,
    page_size: DeviceSize,
    pool: VecDeque<FastAllocatorPage>,
}

impl FastAllocatorPagePool {
    /// Creates an empty pool. Pages are created on demand.
    pub fn new(adapter: Arc<Adapter>, heap_type: HeapType, page_size: DeviceSize) -> Self {
        assert!(page_size != 0);

        FastAllocatorPagePool {
            adapter,
            heap_type,
            page_size,
            pool: VecDeque::new(),
        }
    }

    /// Takes a page out of the pool, or creates one if no pooled page can be reused yet.
    ///
    /// The returned page is empty.
    pub fn request_page(&mut self) -> Result<FastAllocatorPage, DeviceError> {
        let completed_fence = self.adapter.frame_fence().update_last_completed_fence();

        let reusable = self
            .pool
            .iter()
            .position(|page| !page.is_referenced() && page.frame_fence <= completed_fence);

        if let Some(page) = reusable.and_then(|index| self.pool.remove(index)) {
            log::trace!(
                "recycled a {:?} page of {} bytes last used at fence {}",
                self.heap_type,
                self.page_size,
                page.frame_fence,
            );

            return Ok(FastAllocatorPage {
                next_fast_alloc_offset: 0,
                ..page
            });
        }

        let buffer = Resource::new_committed(
            self.adapter.device(),
            &ResourceCreateInfo {
                desc: ResourceDesc::buffer(self.page_size, ResourceFlags::empty()),
                heap_type: self.heap_type,
                heap_flags: HeapFlags::empty(),
                initial_state: page_initial_state(self.heap_type),
                debug_name: "FastAllocatorPage",
            },
        )?;

        Ok(FastAllocatorPage {
            buffer,
            next_fast_alloc_offset: 0,
            frame_fence: 0,
        })
    }

    /// Puts a page back into the pool, tagged with the current frame fence.
    pub fn return_page(&mut self, mut page: FastAllocatorPage) {
        page.update_fence(self.adapter.frame_fence().current_fence());
        self.pool.push_back(page);
    }

    /// Frees at most one pooled page that is no longer referenced and hasn't been used for
    /// `frame_lag` fence values. Nothing is freed while the pool holds
    /// [`FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN`] pages or less.
    ///
    /// [`FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN`]: super::FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN
    pub fn cleanup_pages(&mut self, frame_lag: u64) {
        if self.pool.len() <= FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN {
            return;
        }

        let completed_fence = self.adapter.frame_fence().update_last_completed_fence();

        let stale = self.pool.iter().position(|page| {
            !page.is_referenced() && page.frame_fence.saturating_add(frame_lag) <= completed_fence
        });

        if let Some(page) = stale.and_then(|index| self.pool.remove(index)) {
            log::debug!(
                "freed a {:?} page of {} bytes, {} left in the pool",
                self.heap_type,
                self.page_size,
                self.pool.len(),
            );
            drop(page);
        }
    }

    /// Drops every pooled page. Buffers still referenced by locations stay alive until those
    /// locations are dropped.
    pub fn destroy(&mut self) {
        self.pool.clear();
    }

    /// Returns the number of pages waiting in the pool.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn page_size(&self) -> DeviceSize {
        self.page_size
    }

    #[inline]
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }
}

impl AdapterOwned for FastAllocatorPagePool {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// A thread-safe bump allocator that hands out [`FastAllocation`] locations.
///
/// Requests that don't fit in a page get a standalone buffer of their own.
///
/// [`FastAllocation`]: super::LocationType::FastAllocation
#[derive(Debug)]
pub struct FastAllocator {
    adapter: Arc<Adapter>,
    heap_type: HeapType,
    page_size: DeviceSize,
    state: Mutex<FastAllocatorState>,
}

#[derive(Debug)]
struct FastAllocatorState {
    page_pool: FastAllocatorPagePool,
    current_page: Option<FastAllocatorPage>,
}

impl FastAllocator {
    /// Creates a new `FastAllocator` whose pages are `page_size` bytes in `heap_type` memory.
    pub fn new(adapter: Arc<Adapter>, heap_type: HeapType, page_size: DeviceSize) -> Self {
        FastAllocator {
            state: Mutex::new(FastAllocatorState {
                page_pool: FastAllocatorPagePool::new(adapter.clone(), heap_type, page_size),
                current_page: None,
            }),
            adapter,
            heap_type,
            page_size,
        }
    }

    /// Allocates `size` bytes aligned to `alignment` and wires `location` to them. `location` is
    /// cleared first.
    ///
    /// Returns the mapped address of the allocation if the heap is CPU-accessible.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        location: &mut ResourceLocation,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        location.clear();

        if size > self.page_size {
            // Committed buffers are already placed at this alignment.
            let alignment = if alignment != 0 && BUFFER_ALIGNMENT % alignment == 0 {
                0
            } else {
                alignment
            };

            let resource = Resource::new_committed(
                self.adapter.device(),
                &ResourceCreateInfo {
                    desc: ResourceDesc::buffer(size + alignment, ResourceFlags::empty()),
                    heap_type: self.heap_type,
                    heap_flags: HeapFlags::empty(),
                    initial_state: page_initial_state(self.heap_type),
                    debug_name: "FastAllocator StandAlone",
                },
            )?;
            location.as_stand_alone(resource, size + alignment);

            return Ok(location.mapped_base_address());
        }

        let mut state = self.state.lock();
        let state = &mut *state;

        let page = match &mut state.current_page {
            Some(page)
                if align_up(page.next_fast_alloc_offset, alignment) + size <= self.page_size =>
            {
                page
            }
            current_page => {
                if let Some(page) = current_page.take() {
                    state.page_pool.return_page(page);
                }

                current_page.insert(state.page_pool.request_page()?)
            }
        };

        let offset = align_up(page.next_fast_alloc_offset, alignment);
        location.as_fast_allocation(
            page.buffer.clone(),
            size,
            page.buffer.gpu_virtual_address(),
            page.buffer.mapped_ptr(),
            0,
            offset,
        );
        page.next_fast_alloc_offset = offset + size;
        page.update_fence(self.adapter.frame_fence().current_fence());

        Ok(location.mapped_base_address())
    }

    /// Forwards to [`FastAllocatorPagePool::cleanup_pages`].
    pub fn cleanup_pages(&self, frame_lag: u64) {
        self.state.lock().page_pool.cleanup_pages(frame_lag);
    }

    /// Returns the current page to the pool and drops every pooled page.
    pub fn destroy(&self) {
        let mut state = self.state.lock();

        if let Some(page) = state.current_page.take() {
            state.page_pool.return_page(page);
        }

        state.page_pool.destroy();
    }

    /// Returns the number of pages waiting in the pool, not counting the current page.
    pub fn pooled_page_count(&self) -> usize {
        self.state.lock().page_pool.page_count()
    }
}

impl AdapterOwned for FastAllocator {
    #[inline]
    fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

/// A single-threaded bump allocator for constant buffer data.
///
/// Every allocation is aligned to [`CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT`]. Pages come from
/// the [`UploadHeapAllocator`], which takes them back when this allocator moves on to the next
/// page or is dropped.
///
/// [`CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT`]: super::CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT
#[derive(Debug)]
pub struct FastConstantAllocator {
    upload_heap_allocator: Arc<UploadHeapAllocator>,
    underlying_location: ResourceLocation,
    offset: DeviceSize,
    page_size: DeviceSize,
}

impl FastConstantAllocator {
    /// Creates a new `FastConstantAllocator`. The first page is requested by the first
    /// allocation.
    pub fn new(upload_heap_allocator: Arc<UploadHeapAllocator>) -> Self {
        let page_size = upload_heap_allocator.constant_page_size();

        FastConstantAllocator {
            upload_heap_allocator,
            underlying_location: ResourceLocation::new(),
            offset: page_size,
            page_size,
        }
    }

    /// Allocates `bytes` bytes of constant data and wires `location` to them.
    ///
    /// Returns the mapped address of the allocation.
    ///
    /// # Panics
    ///
    /// - Panics if `bytes` is greater than the page size.
    pub fn allocate(
        &mut self,
        bytes: DeviceSize,
        location: &mut ResourceLocation,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        assert!(bytes <= self.page_size);

        let aligned_size = align_up(bytes, CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT);

        if self.offset + aligned_size > self.page_size {
            self.upload_heap_allocator
                .alloc_fast_constant_allocation_page(&mut self.underlying_location)?;
            self.offset = 0;
        }

        let Some(resource) = self.underlying_location.resource().cloned() else {
            unreachable!("the page location was populated above");
        };

        location.as_fast_allocation(
            resource,
            aligned_size,
            self.underlying_location.gpu_virtual_address(),
            self.underlying_location.mapped_base_address(),
            self.underlying_location.offset_from_base_of_resource(),
            self.offset,
        );
        self.offset += aligned_size;

        Ok(location.mapped_base_address())
    }

    /// Allocates room for `data`, copies it in and wires `location` to it.
    pub fn allocate_constants<T>(
        &mut self,
        data: &T,
        location: &mut ResourceLocation,
    ) -> Result<(), DeviceError>
    where
        T: bytemuck::Pod,
    {
        let bytes = bytemuck::bytes_of(data);
        self.allocate(bytes.len() as DeviceSize, location)?;

        // SAFETY: The allocation was just carved out of the page, so nothing else refers to it
        // and the GPU can't have seen it yet.
        if let Some(dst) = unsafe { location.mapped_slice_mut() } {
            dst[..bytes.len()].copy_from_slice(bytes);
        }

        Ok(())
    }

    /// Returns the offset of the next allocation inside the current page.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }
}

fn page_initial_state(heap_type: HeapType) -> ResourceStates {
    match heap_type {
        HeapType::Readback => ResourceStates::COPY_DEST,
        HeapType::Default | HeapType::Upload => ResourceStates::GENERIC_READ,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocationType;

    const K: DeviceSize = 1024;

    #[test]
    fn page_reuse_waits_for_fence() {
        let (device, fence, adapter) = mock_adapter!();
        let mut pool = FastAllocatorPagePool::new(adapter, HeapType::Upload, 4 * K);

        let page = pool.request_page().unwrap();
        assert_eq!(device.resources_created(), 1);
        pool.return_page(page);
        assert_eq!(pool.page_count(), 1);

        // Fence 1 is not complete yet.
        let page = pool.request_page().unwrap();
        assert_eq!(device.resources_created(), 2);
        assert_eq!(pool.page_count(), 1);
        pool.return_page(page);

        fence.increment_current_fence();
        fence.complete_all();

        let page = pool.request_page().unwrap();
        assert_eq!(device.resources_created(), 2);
        assert_eq!(page.next_fast_alloc_offset(), 0);
        assert_eq!(page.frame_fence(), 1);
    }

    #[test]
    fn referenced_page_is_not_reused() {
        let (device, fence, adapter) = mock_adapter!();
        let mut pool = FastAllocatorPagePool::new(adapter, HeapType::Upload, 4 * K);

        let page = pool.request_page().unwrap();
        let mut location = ResourceLocation::new();
        location.as_fast_allocation(page.buffer().clone(), 64, 0, None, 0, 0);
        pool.return_page(page);

        fence.increment_current_fence();
        fence.complete_all();

        let page = pool.request_page().unwrap();
        assert_eq!(device.resources_created(), 2);
        pool.return_page(page);

        location.clear();
        fence.increment_current_fence();
        fence.complete_all();

        pool.request_page().unwrap();
        assert_eq!(device.resources_created(), 2);
    }

    #[test]
    fn cleanup_retains_minimum() {
        let (device, fence, adapter) = mock_adapter!();
        let mut pool = FastAllocatorPagePool::new(adapter, HeapType::Upload, 4 * K);

        let pages: Vec<_> = (0..FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN + 2)
            .map(|_| pool.request_page().unwrap())
            .collect();

        for page in pages {
            pool.return_page(page);
        }

        fence.increment_current_fence();
        fence.complete_all();

        pool.cleanup_pages(0);
        assert_eq!(pool.page_count(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN + 1);
        pool.cleanup_pages(0);
        assert_eq!(pool.page_count(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN);
        pool.cleanup_pages(0);
        assert_eq!(pool.page_count(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN);
        assert_eq!(device.live_resources(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN);

        pool.destroy();
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn cleanup_respects_frame_lag() {
        let (_device, fence, adapter) = mock_adapter!();
        let mut pool = FastAllocatorPagePool::new(adapter, HeapType::Upload, 4 * K);

        let pages: Vec<_> = (0..FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN + 1)
            .map(|_| pool.request_page().unwrap())
            .collect();

        for page in pages {
            pool.return_page(page);
        }

        fence.increment_current_fence();
        fence.complete_all();

        // The pages were used at fence 1, and only fence 1 is complete.
        pool.cleanup_pages(3);
        assert_eq!(pool.page_count(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN + 1);

        for _ in 0..3 {
            fence.increment_current_fence();
        }
        fence.complete_all();

        pool.cleanup_pages(3);
        assert_eq!(pool.page_count(), FAST_ALLOCATOR_MIN_PAGES_TO_RETAIN);
    }

    #[test]
    fn bump_allocation() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = FastAllocator::new(adapter, HeapType::Upload, 4 * K);

        let mut first = ResourceLocation::new();
        let ptr = allocator.allocate(100, 16, &mut first).unwrap().unwrap();
        assert_eq!(first.location_type(), LocationType::FastAllocation);
        assert_eq!(first.offset_from_base_of_resource(), 0);
        assert_eq!(first.size(), 100);

        let mut second = ResourceLocation::new();
        let second_ptr = allocator.allocate(100, 256, &mut second).unwrap().unwrap();
        assert_eq!(second.offset_from_base_of_resource(), 256);
        assert_eq!(second_ptr.as_ptr() as usize, ptr.as_ptr() as usize + 256);
        assert!(Arc::ptr_eq(
            first.resource().unwrap(),
            second.resource().unwrap(),
        ));
        assert_eq!(
            second.gpu_virtual_address(),
            first.gpu_virtual_address() + 256,
        );
        assert_eq!(device.resources_created(), 1);

        // Doesn't fit in what's left of the page.
        let mut third = ResourceLocation::new();
        allocator.allocate(4 * K - 100, 0, &mut third).unwrap();
        assert_eq!(third.offset_from_base_of_resource(), 0);
        assert!(!Arc::ptr_eq(
            first.resource().unwrap(),
            third.resource().unwrap(),
        ));
        assert_eq!(device.resources_created(), 2);
        assert_eq!(allocator.pooled_page_count(), 1);
    }

    #[test]
    fn oversized_allocations_stand_alone() {
        let (device, _fence, adapter) = mock_adapter!();
        let allocator = FastAllocator::new(adapter, HeapType::Upload, 4 * K);

        let mut location = ResourceLocation::new();
        allocator.allocate(8 * K, 256, &mut location).unwrap();
        assert_eq!(location.location_type(), LocationType::StandAlone);
        assert_eq!(location.size(), 8 * K);

        allocator.allocate(8 * K, 3, &mut location).unwrap();
        assert_eq!(location.size(), 8 * K + 3);
        assert_eq!(location.resource().unwrap().size(), 8 * K + 3);

        drop(location);
        assert_eq!(device.live_resources(), 0);
        assert_eq!(allocator.pooled_page_count(), 0);
    }

    #[test]
    fn destroy_returns_current_page() {
        let (device, fence, adapter) = mock_adapter!();
        let allocator = FastAllocator::new(adapter, HeapType::Upload, 4 * K);

        let mut location = ResourceLocation::new();
        allocator.allocate(64, 0, &mut location).unwrap();
        fence.increment_current_fence();

        allocator.destroy();
        assert_eq!(allocator.pooled_page_count(), 0);
        assert_eq!(device.live_resources(), 1);

        drop(location);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn page_fence_follows_allocations() {
        let (_device, fence, adapter) = mock_adapter!();
        let allocator = FastAllocator::new(adapter, HeapType::Upload, 4 * K);

        let mut location = ResourceLocation::new();
        allocator.allocate(64, 0, &mut location).unwrap();
        fence.increment_current_fence();
        fence.increment_current_fence();
        allocator.allocate(64, 0, &mut location).unwrap();
        location.clear();

        let state = allocator.state.lock();
        assert_eq!(state.current_page.as_ref().unwrap().frame_fence(), 3);
    }
}
