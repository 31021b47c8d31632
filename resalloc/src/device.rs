//! The native device seen from the allocators, and the objects it creates.
//!
//! The crate never talks to a graphics API directly. Instead, the backend implements the
//! [`Device`] trait, which knows how to create the three kinds of native objects the allocators
//! need:
//!
//! - a *heap*: a raw range of GPU memory in which resources can be placed,
//! - a *committed resource*: a buffer with its own implicit heap,
//! - a *placed resource*: a buffer created at an offset inside a heap.
//!
//! The crate wraps the native handles into [`Heap`] and [`Resource`], which destroy them when
//! dropped. Resources in CPU-accessible heaps are mapped once on creation and stay mapped for
//! their whole lifetime.
//!
//! An [`Adapter`] bundles the device with the [`FrameFence`] that all allocators use to defer
//! reclamation.

use crate::{sync::FrameFence, DeviceAddress, DeviceError, DeviceSize};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    ptr::NonNull,
    sync::Arc,
};

/// An opaque handle to a native object, as returned by the [`Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NativeHandle(u64);

impl NativeHandle {
    /// Wraps a raw handle value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        NativeHandle(raw)
    }

    /// Returns the raw handle value.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// The kind of memory a heap or committed resource lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local memory, not accessible from the CPU.
    #[default]
    Default,
    /// CPU-writable memory read by the GPU.
    Upload,
    /// GPU-writable memory read back by the CPU.
    Readback,
}

impl HeapType {
    /// Returns whether resources in this heap are mapped for CPU access.
    #[inline]
    pub const fn is_cpu_accessible(self) -> bool {
        matches!(self, HeapType::Upload | HeapType::Readback)
    }

    /// Returns whether the heap is only accessible by the GPU.
    #[inline]
    pub const fn is_gpu_only(self) -> bool {
        matches!(self, HeapType::Default)
    }
}

resource_bitflags! {
    /// Flags that restrict what can be placed in a heap.
    HeapFlags impl {
        /// The heap can only contain buffers.
        pub const ALLOW_ONLY_BUFFERS: Self =
            Self(Self::DENY_RT_DS_TEXTURES.0 | Self::DENY_NON_RT_DS_TEXTURES.0);
    } = u32;

    /// Buffers can't be placed in the heap.
    DENY_BUFFERS = 0x4,

    /// Render-target and depth-stencil textures can't be placed in the heap.
    DENY_RT_DS_TEXTURES = 0x40,

    /// Other textures can't be placed in the heap.
    DENY_NON_RT_DS_TEXTURES = 0x80,

    /// The heap's memory doesn't need to be zeroed on creation.
    CREATE_NOT_ZEROED = 0x1000,
}

resource_bitflags! {
    /// Flags describing how a resource may be used.
    ResourceFlags = u32;

    /// The resource can be bound as a render target.
    ALLOW_RENDER_TARGET = 0x1,

    /// The resource can be bound as a depth-stencil target.
    ALLOW_DEPTH_STENCIL = 0x2,

    /// The resource can be written through unordered access views.
    ALLOW_UNORDERED_ACCESS = 0x4,

    /// The resource can't be read through shader resource views.
    DENY_SHADER_RESOURCE = 0x8,

    /// The resource can be shared across adapters.
    ALLOW_CROSS_ADAPTER = 0x10,

    /// The resource can be accessed by multiple queues at once.
    ALLOW_SIMULTANEOUS_ACCESS = 0x20,

    /// The resource stores a ray-tracing acceleration structure.
    RAYTRACING_ACCELERATION_STRUCTURE = 0x100,
}

resource_bitflags! {
    /// The states a resource can be in from the point of view of the GPU.
    ResourceStates impl {
        /// The state resources are in when no other state applies.
        pub const COMMON: Self = Self(0);

        /// The state upload-heap resources must always be in.
        pub const GENERIC_READ: Self = Self(
            Self::VERTEX_AND_CONSTANT_BUFFER.0
                | Self::INDEX_BUFFER.0
                | Self::NON_PIXEL_SHADER_RESOURCE.0
                | Self::PIXEL_SHADER_RESOURCE.0
                | Self::INDIRECT_ARGUMENT.0
                | Self::COPY_SOURCE.0,
        );
    } = u32;

    /// Read as a vertex or constant buffer.
    VERTEX_AND_CONSTANT_BUFFER = 0x1,

    /// Read as an index buffer.
    INDEX_BUFFER = 0x2,

    /// Read and written through unordered access.
    UNORDERED_ACCESS = 0x8,

    /// Read by non-pixel shader stages.
    NON_PIXEL_SHADER_RESOURCE = 0x40,

    /// Read by the pixel shader stage.
    PIXEL_SHADER_RESOURCE = 0x80,

    /// Read as indirect draw or dispatch arguments.
    INDIRECT_ARGUMENT = 0x200,

    /// Written by copy operations.
    COPY_DEST = 0x400,

    /// Read by copy operations.
    COPY_SOURCE = 0x800,

    /// Used as a ray-tracing acceleration structure.
    RAYTRACING_ACCELERATION_STRUCTURE = 0x40_0000,
}

/// The dimensionality of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    #[default]
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// Describes a resource to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,

    /// The size in bytes for buffers, the width in texels for textures.
    pub width: DeviceSize,

    /// The required alignment, or 0 to let the device choose.
    pub alignment: DeviceSize,

    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// Returns the description of a buffer of the given size.
    #[inline]
    pub const fn buffer(width: DeviceSize, flags: ResourceFlags) -> Self {
        ResourceDesc {
            dimension: ResourceDimension::Buffer,
            width,
            alignment: 0,
            flags,
        }
    }
}

/// Parameters to create a [`Heap`].
#[derive(Clone, Debug)]
pub struct HeapCreateInfo<'a> {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub heap_type: HeapType,
    pub flags: HeapFlags,
    pub debug_name: &'a str,
}

/// Parameters to create a committed or placed [`Resource`].
#[derive(Clone, Debug)]
pub struct ResourceCreateInfo<'a> {
    pub desc: ResourceDesc,
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    pub initial_state: ResourceStates,
    pub debug_name: &'a str,
}

/// A freshly created native resource.
#[derive(Clone, Copy, Debug)]
pub struct RawResource {
    pub handle: NativeHandle,
    pub gpu_virtual_address: DeviceAddress,
}

/// The native device, implemented by the graphics backend.
///
/// # Safety
///
/// - Handles returned by the creation functions must stay valid until they are passed to the
///   matching destroy function.
/// - A pointer returned by [`map_resource`] must be valid for reads and writes of the whole
///   resource, and stay valid until the resource is destroyed.
/// - The GPU virtual address of a placed resource must be the address of its heap plus the
///   offset it was placed at.
///
/// [`map_resource`]: Device::map_resource
pub unsafe trait Device: Send + Sync {
    /// Creates a heap that resources can be placed in.
    fn create_heap(&self, create_info: &HeapCreateInfo<'_>) -> Result<NativeHandle, DeviceError>;

    /// Creates a resource with its own implicit heap.
    fn create_committed_resource(
        &self,
        create_info: &ResourceCreateInfo<'_>,
    ) -> Result<RawResource, DeviceError>;

    /// Creates a resource at `offset` inside `heap`.
    fn create_placed_resource(
        &self,
        heap: NativeHandle,
        offset: DeviceSize,
        create_info: &ResourceCreateInfo<'_>,
    ) -> Result<RawResource, DeviceError>;

    /// Maps a resource in a CPU-accessible heap, returning the address of its first byte.
    ///
    /// # Safety
    ///
    /// - `resource` must be a live resource in a CPU-accessible heap.
    unsafe fn map_resource(&self, resource: NativeHandle) -> Result<NonNull<u8>, DeviceError>;

    /// # Safety
    ///
    /// - `resource` must be a live resource that is no longer in use by the GPU.
    unsafe fn destroy_resource(&self, resource: NativeHandle);

    /// # Safety
    ///
    /// - `heap` must be a live heap with no live resources placed in it.
    unsafe fn destroy_heap(&self, heap: NativeHandle);
}

/// Bundles the native device with the frame fence every allocator is gated by.
pub struct Adapter {
    device: Arc<dyn Device>,
    frame_fence: Arc<dyn FrameFence>,
}

impl Adapter {
    pub fn new(device: Arc<dyn Device>, frame_fence: Arc<dyn FrameFence>) -> Arc<Self> {
        Arc::new(Adapter {
            device,
            frame_fence,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    #[inline]
    pub fn frame_fence(&self) -> &dyn FrameFence {
        &*self.frame_fence
    }
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Adapter")
            .field("current_fence", &self.frame_fence.current_fence())
            .finish_non_exhaustive()
    }
}

/// Implemented on objects that belong to an adapter.
pub trait AdapterOwned {
    /// Returns the adapter that owns `self`.
    fn adapter(&self) -> &Arc<Adapter>;
}

/// A native heap. Destroyed when dropped.
pub struct Heap {
    device: Arc<dyn Device>,
    handle: NativeHandle,
    size: DeviceSize,
    heap_type: HeapType,
}

impl Heap {
    /// Creates a new heap.
    pub fn new(
        device: &Arc<dyn Device>,
        create_info: &HeapCreateInfo<'_>,
    ) -> Result<Arc<Self>, DeviceError> {
        let handle = device.create_heap(create_info).inspect_err(|err| {
            log::error!(
                "failed to create heap `{}` of {} bytes: {}",
                create_info.debug_name,
                create_info.size,
                err,
            );
        })?;

        Ok(Arc::new(Heap {
            device: device.clone(),
            handle,
            size: create_info.size,
            heap_type: create_info.heap_type,
        }))
    }

    #[inline]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: Placed resources keep their heap alive, so none can be left.
        unsafe { self.device.destroy_heap(self.handle) };
    }
}

impl Debug for Heap {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Heap")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("heap_type", &self.heap_type)
            .finish_non_exhaustive()
    }
}

/// A native resource. Destroyed when dropped.
///
/// Resources in CPU-accessible heaps are persistently mapped.
pub struct Resource {
    device: Arc<dyn Device>,
    handle: NativeHandle,
    desc: ResourceDesc,
    heap_type: HeapType,
    gpu_virtual_address: DeviceAddress,
    mapped_ptr: Option<NonNull<u8>>,
    // The heap and offset for placed resources.
    placement: Option<(Arc<Heap>, DeviceSize)>,
}

// SAFETY: The mapped pointer is only a base address. Accessing the memory behind it is unsafe and
// synchronizing with the GPU is the caller's job.
unsafe impl Send for Resource {}
unsafe impl Sync for Resource {}

impl Resource {
    /// Creates a resource with its own implicit heap, mapping it if the heap type is
    /// CPU-accessible.
    pub fn new_committed(
        device: &Arc<dyn Device>,
        create_info: &ResourceCreateInfo<'_>,
    ) -> Result<Arc<Self>, DeviceError> {
        let raw = device
            .create_committed_resource(create_info)
            .inspect_err(|err| {
                log::error!(
                    "failed to create committed resource `{}` of {} bytes: {}",
                    create_info.debug_name,
                    create_info.desc.width,
                    err,
                );
            })?;

        Resource::from_raw(device, raw, create_info, None)
    }

    /// Creates a resource at `offset` inside `heap`, mapping it if the heap type is
    /// CPU-accessible.
    pub fn new_placed(
        heap: &Arc<Heap>,
        offset: DeviceSize,
        create_info: &ResourceCreateInfo<'_>,
    ) -> Result<Arc<Self>, DeviceError> {
        debug_assert!(offset + create_info.desc.width <= heap.size());

        let device = &heap.device;
        let raw = device
            .create_placed_resource(heap.handle, offset, create_info)
            .inspect_err(|err| {
                log::error!(
                    "failed to place resource `{}` at offset {} of heap {:?}: {}",
                    create_info.debug_name,
                    offset,
                    heap.handle,
                    err,
                );
            })?;

        Resource::from_raw(device, raw, create_info, Some((heap.clone(), offset)))
    }

    fn from_raw(
        device: &Arc<dyn Device>,
        raw: RawResource,
        create_info: &ResourceCreateInfo<'_>,
        placement: Option<(Arc<Heap>, DeviceSize)>,
    ) -> Result<Arc<Self>, DeviceError> {
        let mut resource = Resource {
            device: device.clone(),
            handle: raw.handle,
            desc: create_info.desc,
            heap_type: create_info.heap_type,
            gpu_virtual_address: raw.gpu_virtual_address,
            mapped_ptr: None,
            placement,
        };

        if resource.heap_type.is_cpu_accessible() {
            // SAFETY: The resource was just created in a CPU-accessible heap. If mapping fails,
            // dropping `resource` destroys it.
            let ptr = unsafe { device.map_resource(resource.handle) }?;
            resource.mapped_ptr = Some(ptr);
        }

        Ok(Arc::new(resource))
    }

    #[inline]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    /// Returns the size of the resource in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.desc.width
    }

    #[inline]
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    #[inline]
    pub fn gpu_virtual_address(&self) -> DeviceAddress {
        self.gpu_virtual_address
    }

    /// Returns the address the resource is mapped at, if it lives in a CPU-accessible heap.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// Returns whether the resource was placed inside a heap.
    #[inline]
    pub fn is_placed(&self) -> bool {
        self.placement.is_some()
    }

    /// Returns the heap and offset of a placed resource.
    #[inline]
    pub fn placement(&self) -> Option<(&Arc<Heap>, DeviceSize)> {
        self.placement.as_ref().map(|(heap, offset)| (heap, *offset))
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        // SAFETY: Allocators only drop resources once the GPU is done with them.
        unsafe { self.device.destroy_resource(self.handle) };
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Resource")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .field("heap_type", &self.heap_type)
            .field("gpu_virtual_address", &self.gpu_virtual_address)
            .field("mapped", &self.mapped_ptr.is_some())
            .field("placed", &self.is_placed())
            .finish_non_exhaustive()
    }
}
