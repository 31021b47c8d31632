use super::{fast::FastAllocatorPage, pool::PoolAllocation, pool_allocator::PoolAllocator};
use crate::{device::Resource, DeviceAddress, DeviceSize};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    mem,
    ptr::NonNull,
    slice,
    sync::Arc,
};

/// How a [`ResourceLocation`] was populated, which decides what happens when it is cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LocationType {
    /// The location is empty.
    #[default]
    Undefined,
    /// The location is a piece of an arena, and is given back to its allocator when cleared.
    SubAllocation,
    /// The location is a piece of a page of a bump allocator. Nothing is given back: the page is
    /// recycled once no location refers to its buffer anymore.
    FastAllocation,
    /// The location owns its resource outright.
    StandAlone,
}

/// An allocator that can take back a [`LocationType::SubAllocation`] it handed out.
///
/// Implementations must not reclaim the memory right away, but only once the GPU is done with
/// it, typically by recording the current frame fence.
pub trait SubDeallocator: Send + Sync {
    /// Takes back the allocation described by `location`.
    ///
    /// Called exactly once per allocation, while the location is still populated.
    fn deallocate(&self, location: &mut ResourceLocation);
}

/// The allocator that owns a [`ResourceLocation`].
#[derive(Clone)]
pub enum AllocatorRef {
    SubAllocator(Arc<dyn SubDeallocator>),
    Pool(Arc<PoolAllocator>),
}

impl Debug for AllocatorRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            AllocatorRef::SubAllocator(_) => f.write_str("SubAllocator"),
            AllocatorRef::Pool(allocator) => f.debug_tuple("Pool").field(allocator).finish(),
        }
    }
}

/// Bookkeeping that the owning allocator stores inside a [`ResourceLocation`].
#[derive(Clone, Debug, Default)]
pub enum AllocatorData {
    #[default]
    None,
    Buddy(BuddyAllocation),
    Pool(PoolAllocation),
    Page(FastAllocatorPage),
}

/// A block of a [`BuddyAllocator`].
///
/// [`BuddyAllocator`]: super::buddy::BuddyAllocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuddyAllocation {
    /// The offset of the block, in minimum-block units.
    pub offset: u32,
    pub order: u32,
}

/// Where an allocation lives.
///
/// A location starts out empty, is populated by exactly one allocator, and gives the allocation
/// back to that allocator when it is cleared or dropped. It can't be copied, but ownership can be
/// moved to another location with [`transfer_ownership`].
///
/// [`transfer_ownership`]: Self::transfer_ownership
pub struct ResourceLocation {
    pub(crate) ty: LocationType,
    pub(crate) resource: Option<Arc<Resource>>,
    pub(crate) allocator: Option<AllocatorRef>,
    pub(crate) allocator_data: AllocatorData,
    pub(crate) mapped_base_address: Option<NonNull<u8>>,
    pub(crate) gpu_virtual_address: DeviceAddress,
    pub(crate) offset_from_base_of_resource: DeviceSize,
    pub(crate) size: DeviceSize,
}

// SAFETY: The mapped address is only dereferenced through the unsafe slice accessors, which put
// the burden of synchronization on the caller.
unsafe impl Send for ResourceLocation {}
unsafe impl Sync for ResourceLocation {}

impl ResourceLocation {
    /// Creates an empty location.
    #[inline]
    pub const fn new() -> Self {
        ResourceLocation {
            ty: LocationType::Undefined,
            resource: None,
            allocator: None,
            allocator_data: AllocatorData::None,
            mapped_base_address: None,
            gpu_virtual_address: 0,
            offset_from_base_of_resource: 0,
            size: 0,
        }
    }

    /// Gives the allocation back to its owner and empties the location.
    ///
    /// Clearing an empty location does nothing.
    pub fn clear(&mut self) {
        self.release_resource();
        self.clear_members();
    }

    fn release_resource(&mut self) {
        if self.ty == LocationType::SubAllocation {
            match self.allocator.take() {
                Some(AllocatorRef::SubAllocator(allocator)) => allocator.deallocate(self),
                Some(AllocatorRef::Pool(allocator)) => allocator.deallocate(self),
                None => debug_assert!(false, "suballocation without an owner"),
            }
        }

        self.resource = None;
    }

    fn clear_members(&mut self) {
        self.ty = LocationType::Undefined;
        self.allocator = None;
        self.allocator_data = AllocatorData::None;
        self.mapped_base_address = None;
        self.gpu_virtual_address = 0;
        self.offset_from_base_of_resource = 0;
        self.size = 0;
    }

    /// Moves the allocation from `source` to `destination`, clearing `destination` first.
    /// Afterward `source` is empty and clearing it does nothing.
    pub fn transfer_ownership(destination: &mut ResourceLocation, source: &mut ResourceLocation) {
        if let Some(AllocatorRef::Pool(allocator)) = &source.allocator {
            let allocator = allocator.clone();
            allocator.transfer_ownership(destination, source);
        } else {
            destination.clear();
            mem::swap(destination, source);
        }
    }

    /// Makes the location own `resource` outright.
    pub fn as_stand_alone(&mut self, resource: Arc<Resource>, size: DeviceSize) {
        self.clear();

        self.ty = LocationType::StandAlone;
        self.gpu_virtual_address = resource.gpu_virtual_address();
        self.mapped_base_address = resource.mapped_ptr();
        self.size = size;
        self.resource = Some(resource);
    }

    /// Makes the location a piece of a bump-allocated page.
    ///
    /// `gpu_base` and `mapped_base` are the addresses of the page, which starts
    /// `resource_offset_base` bytes into `resource`. The location addresses are derived from them
    /// and `offset`, which is relative to the page.
    pub fn as_fast_allocation(
        &mut self,
        resource: Arc<Resource>,
        size: DeviceSize,
        gpu_base: DeviceAddress,
        mapped_base: Option<NonNull<u8>>,
        resource_offset_base: DeviceSize,
        offset: DeviceSize,
    ) {
        self.clear();

        self.ty = LocationType::FastAllocation;
        self.resource = Some(resource);
        self.size = size;
        self.offset_from_base_of_resource = resource_offset_base + offset;
        self.gpu_virtual_address = gpu_base + offset;
        // SAFETY: The offset is inside the page, so the result is inside the same mapping.
        self.mapped_base_address =
            mapped_base.map(|base| unsafe { base.add(offset as usize) });
    }

    /// Makes the block of a pooled location available to coalescing right away.
    ///
    /// Does nothing for locations not owned by a [`PoolAllocator`].
    pub fn unlock_pool_data(&mut self) {
        if let Some(AllocatorRef::Pool(allocator)) = &self.allocator {
            allocator.clone().unlock(self);
        }
    }

    /// Returns whether the location holds an allocation.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.ty != LocationType::Undefined
    }

    #[inline]
    pub fn location_type(&self) -> LocationType {
        self.ty
    }

    /// Returns the resource the allocation lives in.
    #[inline]
    pub fn resource(&self) -> Option<&Arc<Resource>> {
        self.resource.as_ref()
    }

    #[inline]
    pub fn allocator(&self) -> Option<&AllocatorRef> {
        self.allocator.as_ref()
    }

    #[inline]
    pub fn allocator_data(&self) -> &AllocatorData {
        &self.allocator_data
    }

    /// Returns the CPU address of the first byte of the allocation, if its heap is
    /// CPU-accessible.
    #[inline]
    pub fn mapped_base_address(&self) -> Option<NonNull<u8>> {
        self.mapped_base_address
    }

    #[inline]
    pub fn gpu_virtual_address(&self) -> DeviceAddress {
        self.gpu_virtual_address
    }

    /// Returns the offset of the allocation inside [`resource`].
    ///
    /// [`resource`]: Self::resource
    #[inline]
    pub fn offset_from_base_of_resource(&self) -> DeviceSize {
        self.offset_from_base_of_resource
    }

    /// Returns the requested size of the allocation.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the mapped memory of the allocation.
    ///
    /// # Safety
    ///
    /// - The GPU must not be writing to the allocation.
    pub unsafe fn mapped_slice(&self) -> Option<&[u8]> {
        self.mapped_base_address
            .map(|ptr| unsafe { slice::from_raw_parts(ptr.as_ptr(), self.size as usize) })
    }

    /// Returns the mapped memory of the allocation.
    ///
    /// # Safety
    ///
    /// - The GPU must not be accessing the allocation.
    /// - No other reference to the same memory may exist, including through other locations
    ///   sharing the resource.
    pub unsafe fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.mapped_base_address
            .map(|ptr| unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }
}

impl Default for ResourceLocation {
    #[inline]
    fn default() -> Self {
        ResourceLocation::new()
    }
}

impl Drop for ResourceLocation {
    fn drop(&mut self) {
        self.release_resource();
    }
}

impl Debug for ResourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ResourceLocation")
            .field("ty", &self.ty)
            .field("resource", &self.resource)
            .field("allocator", &self.allocator)
            .field("allocator_data", &self.allocator_data)
            .field("gpu_virtual_address", &self.gpu_virtual_address)
            .field(
                "offset_from_base_of_resource",
                &self.offset_from_base_of_resource,
            )
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
