//! The device context: instance, device, queues, allocator and command pool.
//!
//! [`DeviceContext`] is created once per application and passed by reference to
//! everything that needs GPU objects. It owns no resources itself; it is a
//! factory whose products must all be dropped before [`DeviceContext::destroy`].
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = DeviceContext::initialize(ContextParameters::new(), None)?;
//! let image = ctx.create_image_cube(&TextureDescriptor::new_2d(
//!     512, 512, TextureFormat::Rgba16Float, TextureUsage::TEXTURE_BINDING,
//! ))?;
//! drop(image);
//! ctx.destroy()?;
//! ```

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::vulkan::allocator::{self, SharedAllocator};
use crate::backend::vulkan::command::{self, OneShotCommands};
use crate::backend::vulkan::conversion::{
    aspect_mask, convert_address_mode, convert_buffer_usage, convert_compare_function,
    convert_filter_mode, convert_mipmap_filter_mode, convert_texture_format,
    convert_texture_usage, convert_tiling,
};
use crate::backend::vulkan::device::{self, DeviceCapabilities, ResolvedQueues, SurfaceTarget};
use crate::backend::vulkan::instance;
use crate::backend::vulkan::layout::{self, QueueTransfer, SubresourceRange, TextureLayout};
use crate::config::ContextParameters;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::texture_info;
use crate::resources::{Buffer, Image, ImageView, ResourceTracker, Sampler};
use crate::sync::{Fence, FrameSlot, FrameSync, Semaphore, FENCE_TIMEOUT};
use crate::types::{
    BufferDescriptor, BufferUsage, ImageTiling, MemoryUsage, SamplerDescriptor,
    TextureDescriptor, TextureFormat,
};

/// Number of layers of a cube image.
pub const CUBE_FACE_COUNT: u32 = 6;

/// Lifecycle of a [`DeviceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    /// Device and queue selection in progress.
    Initializing,
    /// Resource creation is allowed.
    Ready,
    /// Waiting for the GPU and releasing objects.
    Destroying,
    Destroyed,
}

impl ContextState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Initializing, Destroyed)
                | (Ready, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

/// Native handles of the window the context presents to.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Owns the Vulkan instance, device, queues, memory allocator and command pool.
pub struct DeviceContext {
    state: ContextState,
    params: ContextParameters,

    /// Vulkan entry point; must outlive the instance.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: Option<ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,

    physical_device: vk::PhysicalDevice,
    capabilities: DeviceCapabilities,
    device: ash::Device,
    queue_families: ResolvedQueues,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    /// Serializes submissions; the API forbids concurrent use of one queue.
    queue_lock: Mutex<()>,

    allocator: SharedAllocator,
    /// Pool for per-frame command buffers on the graphics family. Pools are
    /// externally synchronized; one-shots use their own.
    command_pool: Mutex<vk::CommandPool>,
    tracker: ResourceTracker,
}

/// Objects created so far during initialization, destroyed in reverse on failure.
#[derive(Default)]
struct PartialInit {
    instance: Option<ash::Instance>,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: Option<ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,
    device: Option<ash::Device>,
    command_pool: Option<vk::CommandPool>,
}

impl Drop for PartialInit {
    fn drop(&mut self) {
        unsafe {
            if let Some(device) = self.device.take() {
                if let Some(pool) = self.command_pool.take() {
                    device.destroy_command_pool(pool, None);
                }
                device.destroy_device(None);
            }
            if let (Some(loader), Some(surface)) = (&self.surface_loader, self.surface.take()) {
                loader.destroy_surface(surface, None);
            }
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger.take())
            {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

impl DeviceContext {
    /// Create the context.
    ///
    /// Fails with [`GraphicsError::ValidationUnavailable`] when validation was
    /// requested but is missing, [`GraphicsError::DeviceSelection`] when no GPU
    /// qualifies and [`GraphicsError::IncompleteQueueFamilies`] when the chosen
    /// GPU lacks graphics or present queues. Without `window` the context is
    /// headless and presentation falls back to the graphics family.
    pub fn initialize(
        params: ContextParameters,
        window: Option<WindowHandles>,
    ) -> GraphicsResult<Self> {
        let mut state = ContextState::Uninitialized;
        advance(&mut state, ContextState::Initializing)?;

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan loader: {e}"))
        })?;

        let mut partial = PartialInit::default();

        // Instance and validation messenger
        let bundle = instance::create_instance(&entry, &params, window.map(|w| w.display))?;
        let instance = partial.instance.insert(bundle.instance).clone();
        partial.debug_utils = bundle.debug_utils;
        partial.debug_messenger = bundle.debug_messenger;

        // Window surface
        if let Some(handles) = window {
            let loader = ash::khr::surface::Instance::new(&entry, &instance);
            partial.surface_loader = Some(loader);
            let surface = unsafe {
                ash_window::create_surface(&entry, &instance, handles.display, handles.window, None)
            }
            .map_err(|e| {
                GraphicsError::InitializationFailed(format!("Failed to create surface: {:?}", e))
            })?;
            partial.surface = Some(surface);
        }

        // Physical device and queue families
        let extensions = params.device_extensions(window.is_some());
        let surface_target = match (&partial.surface_loader, partial.surface) {
            (Some(loader), Some(surface)) => Some(SurfaceTarget { loader, surface }),
            _ => None,
        };
        let selected = device::select_physical_device(
            &instance,
            surface_target,
            &extensions,
            params.require_discrete_gpu,
        )?;
        let queue_families = selected.queues.require_complete()?;
        let capabilities = device::query_capabilities(&instance, selected.physical_device);

        // Logical device and queues
        let device = partial
            .device
            .insert(device::create_logical_device(
                &instance,
                selected.physical_device,
                &queue_families,
                &extensions,
                capabilities.multiview,
            )?)
            .clone();
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };

        let command_pool = *partial
            .command_pool
            .insert(command::create_command_pool(&device, queue_families.graphics)?);

        let allocator =
            allocator::create_allocator(&instance, selected.physical_device, device.clone())?;

        advance(&mut state, ContextState::Ready)?;
        log::info!(
            "Device context ready on {:?} (validation: {}, multiview: {}, queues: {:?})",
            selected.name,
            params.enable_validation,
            capabilities.multiview,
            queue_families
        );

        // Everything is owned by the context from here on.
        let mut partial = std::mem::ManuallyDrop::new(partial);
        Ok(Self {
            state,
            params,
            entry,
            instance,
            debug_utils: partial.debug_utils.take(),
            debug_messenger: partial.debug_messenger.take(),
            surface_loader: partial.surface_loader.take(),
            surface: partial.surface.take(),
            physical_device: selected.physical_device,
            capabilities,
            device,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            queue_lock: Mutex::new(()),
            allocator: Arc::new(Mutex::new(Some(allocator))),
            command_pool: Mutex::new(command_pool),
            tracker: ResourceTracker::new(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Parameters the context was created with.
    pub fn parameters(&self) -> &ContextParameters {
        &self.params
    }

    /// Logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Limits and optional features of the selected device.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Resolved queue family indices.
    pub fn queue_families(&self) -> ResolvedQueues {
        self.queue_families
    }

    /// Graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Present queue (the graphics queue when headless).
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Window surface, if the context was created with one.
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    /// Number of handles created through this context that are still alive.
    pub fn live_resources(&self) -> usize {
        self.tracker.live()
    }

    /// Tracker for objects created outside the context (factory, pools).
    pub(crate) fn tracker(&self) -> GraphicsResult<&ResourceTracker> {
        self.ensure_ready()?;
        Ok(&self.tracker)
    }

    fn ensure_ready(&self) -> GraphicsResult<()> {
        if self.state == ContextState::Ready {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState(format!(
                "context is {:?}, resource creation requires Ready",
                self.state
            )))
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Create a buffer backed by allocator memory.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> GraphicsResult<Buffer> {
        self.ensure_ready()?;
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator::allocate(
            &self.allocator,
            descriptor.label.as_deref().unwrap_or("buffer"),
            requirements,
            descriptor.memory,
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            allocator::free(&self.allocator, allocation);
            return Err(e.into());
        }

        log::debug!(
            "Created buffer {:?} ({} bytes, {:?}, {:?})",
            descriptor.label,
            descriptor.size,
            descriptor.usage,
            descriptor.memory
        );

        Ok(Buffer::new(
            self.device.clone(),
            Arc::clone(&self.allocator),
            buffer,
            allocation,
            descriptor.size,
            descriptor.usage,
            descriptor.memory,
            self.tracker.token(),
        ))
    }

    /// Create a device-local buffer and fill it with `data` through a staging copy.
    ///
    /// The copy runs on the transfer queue; when that queue has its own family
    /// the buffer is then handed over to the graphics family.
    pub fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> GraphicsResult<Buffer> {
        let mut descriptor = descriptor.clone();
        descriptor.size = data.len() as u64;
        descriptor.usage |= BufferUsage::COPY_DST;
        let buffer = self.create_buffer(&descriptor)?;

        let Some(handoff) = self.transfer_handoff() else {
            self.upload_buffer(&buffer, 0, data)?;
            return Ok(buffer);
        };
        let staging = self.create_staging_buffer(data)?;
        self.run_transfer(
            handoff,
            |device, cmd| {
                let region = vk::BufferCopy::default().size(data.len() as u64);
                unsafe { device.cmd_copy_buffer(cmd, staging.handle(), buffer.handle(), &[region]) };
            },
            |device, cmd| {
                let barrier = handoff.buffer_release(buffer.handle());
                QueueTransfer::record_release(device, cmd, &[barrier], &[]);
            },
            |device, cmd| {
                let barrier = handoff.buffer_acquire(buffer.handle());
                QueueTransfer::record_acquire(device, cmd, &[barrier], &[]);
            },
        )?;
        Ok(buffer)
    }

    /// Copy `data` into `dst` at `offset` and wait for the copy to finish.
    pub fn upload_buffer(&self, dst: &Buffer, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        if offset + data.len() as u64 > dst.size() {
            return Err(GraphicsError::InvalidParameter(format!(
                "upload of {} bytes at {} exceeds buffer size {}",
                data.len(),
                offset,
                dst.size()
            )));
        }
        let staging = self.create_staging_buffer(data)?;
        self.execute_one_shot(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: data.len() as u64,
            };
            unsafe { device.cmd_copy_buffer(cmd, staging.handle(), dst.handle(), &[region]) };
            Ok(())
        })
    }

    fn create_staging_buffer(&self, data: &[u8]) -> GraphicsResult<Buffer> {
        let mut staging = self.create_buffer(
            &BufferDescriptor::new(data.len() as u64, BufferUsage::COPY_SRC, MemoryUsage::CpuToGpu)
                .with_label("staging"),
        )?;
        staging.write(0, data)?;
        Ok(staging)
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Create an image with `descriptor.layer_count` layers.
    pub fn create_image(&self, descriptor: &TextureDescriptor) -> GraphicsResult<Image> {
        self.create_image_with_flags(descriptor, vk::ImageCreateFlags::empty())
    }

    /// Create a cube-compatible image with six square layers.
    ///
    /// The layer count of `descriptor` is ignored.
    pub fn create_image_cube(&self, descriptor: &TextureDescriptor) -> GraphicsResult<Image> {
        if descriptor.size.width != descriptor.size.height {
            return Err(GraphicsError::InvalidParameter(format!(
                "cube faces must be square, got {}x{}",
                descriptor.size.width, descriptor.size.height
            )));
        }
        let descriptor = descriptor.clone().with_layers(CUBE_FACE_COUNT);
        self.create_image_with_flags(&descriptor, vk::ImageCreateFlags::CUBE_COMPATIBLE)
    }

    fn create_image_with_flags(
        &self,
        descriptor: &TextureDescriptor,
        flags: vk::ImageCreateFlags,
    ) -> GraphicsResult<Image> {
        self.ensure_ready()?;
        if descriptor.size.is_empty() || descriptor.layer_count == 0 || descriptor.mip_level_count == 0
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "image {:?} has an empty extent, layer or mip count",
                descriptor.label
            )));
        }

        let format = convert_texture_format(descriptor.format);
        let usage = convert_texture_usage(descriptor.usage, descriptor.format);
        let tiling = convert_tiling(descriptor.tiling);
        self.check_image_format(descriptor, format, tiling, usage, flags)?;

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: 1,
            })
            .mip_levels(descriptor.mip_level_count)
            .array_layers(descriptor.layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match allocator::allocate(
            &self.allocator,
            descriptor.label.as_deref().unwrap_or("image"),
            requirements,
            descriptor.memory,
            descriptor.tiling == ImageTiling::Linear,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            allocator::free(&self.allocator, allocation);
            return Err(e.into());
        }

        log::debug!(
            "Created image {:?} ({}x{}, {} layers, {} mips, {:?})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.layer_count,
            descriptor.mip_level_count,
            descriptor.format
        );

        Ok(Image::new(
            self.device.clone(),
            Arc::clone(&self.allocator),
            image,
            allocation,
            texture_info(descriptor, flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE)),
            self.tracker.token(),
        ))
    }

    fn check_image_format(
        &self,
        descriptor: &TextureDescriptor,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        flags: vk::ImageCreateFlags,
    ) -> GraphicsResult<()> {
        let properties = unsafe {
            self.instance.get_physical_device_image_format_properties(
                self.physical_device,
                format,
                vk::ImageType::TYPE_2D,
                tiling,
                usage,
                flags,
            )
        }
        .map_err(|e| match e {
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => GraphicsError::UnsupportedFormat(format!(
                "{:?} with {:?} tiling and usage {:?}",
                descriptor.format, descriptor.tiling, descriptor.usage
            )),
            other => other.into(),
        })?;

        let extent = properties.max_extent;
        if descriptor.size.width > extent.width
            || descriptor.size.height > extent.height
            || descriptor.layer_count > properties.max_array_layers
            || descriptor.mip_level_count > properties.max_mip_levels
        {
            return Err(GraphicsError::UnsupportedFormat(format!(
                "{:?} limited to {}x{}, {} layers, {} mips",
                descriptor.format,
                extent.width,
                extent.height,
                properties.max_array_layers,
                properties.max_mip_levels
            )));
        }
        Ok(())
    }

    /// Create a view over `range` of `image`.
    pub fn create_image_view(
        &self,
        image: &Image,
        view_type: vk::ImageViewType,
        range: SubresourceRange,
    ) -> GraphicsResult<ImageView> {
        self.ensure_ready()?;
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.handle())
            .view_type(view_type)
            .format(convert_texture_format(image.format()))
            .components(vk::ComponentMapping::default())
            .subresource_range(range.to_vk());

        let view = unsafe { self.device.create_image_view(&view_info, None) }?;
        Ok(ImageView::new(
            self.device.clone(),
            view,
            view_type,
            image,
            range.layer_count,
            self.tracker.token(),
        ))
    }

    /// View over every mip and layer, typed after the image (cube, array or 2D).
    pub fn create_default_view(&self, image: &Image) -> GraphicsResult<ImageView> {
        let view_type = if image.is_cube() {
            vk::ImageViewType::CUBE
        } else if image.layer_count() > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let range = SubresourceRange::whole(
            aspect_mask(image.format()),
            image.mip_levels(),
            image.layer_count(),
        );
        self.create_image_view(image, view_type, range)
    }

    /// Create a sampler. Anisotropy is clamped to the device limit.
    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<Sampler> {
        self.ensure_ready()?;
        let anisotropy = u32::from(descriptor.anisotropy_clamp)
            .min(self.capabilities.max_sampler_anisotropy)
            .max(1);

        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter_mode(descriptor.mag_filter))
            .min_filter(convert_filter_mode(descriptor.min_filter))
            .mipmap_mode(convert_mipmap_filter_mode(descriptor.mipmap_filter))
            .address_mode_u(convert_address_mode(descriptor.address_mode_u))
            .address_mode_v(convert_address_mode(descriptor.address_mode_v))
            .address_mode_w(convert_address_mode(descriptor.address_mode_w))
            .anisotropy_enable(anisotropy > 1)
            .max_anisotropy(anisotropy as f32)
            .min_lod(0.0)
            .max_lod(descriptor.lod_max_clamp)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        if let Some(compare) = descriptor.compare {
            info = info
                .compare_enable(true)
                .compare_op(convert_compare_function(compare));
        }

        let sampler = unsafe { self.device.create_sampler(&info, None) }?;
        Ok(Sampler::new(self.device.clone(), sampler, self.tracker.token()))
    }

    /// Fill mip 0 of every layer of `image` from tightly packed `data` and leave
    /// the image in shader-read-only layout.
    pub fn upload_image(&self, image: &Image, data: &[u8]) -> GraphicsResult<()> {
        let extent = image.extent();
        let expected = extent.width as usize
            * extent.height as usize
            * image.format().block_size() as usize
            * image.layer_count() as usize;
        if data.len() != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "image upload expects {expected} bytes, got {}",
                data.len()
            )));
        }

        let staging = self.create_staging_buffer(data)?;
        let aspect = aspect_mask(image.format());
        let range = SubresourceRange::whole(aspect, image.mip_levels(), image.layer_count());
        let old = image.current_layout();
        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: image.layer_count(),
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        let copy = |device: &ash::Device, cmd: vk::CommandBuffer| {
            layout::record_transition(device, cmd, image.handle(), range, old, TextureLayout::TransferDst);
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        };

        // Only images with no contents yet skip the graphics-to-transfer hand-off.
        match self.transfer_handoff() {
            Some(handoff) if old == TextureLayout::Undefined => {
                let (from, to) = (TextureLayout::TransferDst, TextureLayout::ShaderReadOnly);
                self.run_transfer(
                    handoff,
                    copy,
                    |device, cmd| {
                        let barrier = handoff.image_release(image.handle(), range, from, to);
                        QueueTransfer::record_release(device, cmd, &[], &[barrier]);
                    },
                    |device, cmd| {
                        let barrier = handoff.image_acquire(image.handle(), range, from, to);
                        QueueTransfer::record_acquire(device, cmd, &[], &[barrier]);
                    },
                )?;
            }
            _ => self.execute_one_shot(|device, cmd| {
                copy(device, cmd);
                layout::record_transition(
                    device,
                    cmd,
                    image.handle(),
                    range,
                    TextureLayout::TransferDst,
                    TextureLayout::ShaderReadOnly,
                );
                Ok(())
            })?,
        }

        image.set_layout(TextureLayout::ShaderReadOnly);
        Ok(())
    }

    /// Read back mip 0 of one layer of `image`.
    ///
    /// The image keeps its layout, except that an image with no contents yet
    /// is left in transfer-source layout.
    pub fn read_image_layer(&self, image: &Image, layer: u32) -> GraphicsResult<Vec<u8>> {
        if layer >= image.layer_count() {
            return Err(GraphicsError::InvalidParameter(format!(
                "layer {layer} out of range ({} layers)",
                image.layer_count()
            )));
        }
        let extent = image.extent();
        let size =
            extent.width as u64 * extent.height as u64 * image.format().block_size() as u64;
        let readback = self.create_buffer(
            &BufferDescriptor::new(size, BufferUsage::COPY_DST, MemoryUsage::GpuToCpu)
                .with_label("readback"),
        )?;

        let aspect = aspect_mask(image.format());
        let range = SubresourceRange {
            aspect,
            base_mip: 0,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        };
        let current = image.current_layout();
        // Undefined cannot be returned to, so a fresh image moves to
        // transfer-source layout as a whole and stays there.
        let (range, restore) = match current {
            TextureLayout::Undefined => (
                SubresourceRange::whole(aspect, image.mip_levels(), image.layer_count()),
                TextureLayout::TransferSrc,
            ),
            other => (range, other),
        };

        self.execute_one_shot(|device, cmd| {
            layout::record_transition(device, cmd, image.handle(), range, current, TextureLayout::TransferSrc);
            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    readback.handle(),
                    &[region],
                )
            };
            layout::record_transition(
                device,
                cmd,
                image.handle(),
                range,
                TextureLayout::TransferSrc,
                restore,
            );
            Ok(())
        })?;
        image.set_layout(restore);

        let mut out = vec![0u8; size as usize];
        readback.read(0, &mut out)?;
        Ok(out)
    }

    /// Transition every subresource of `image` to `new_layout` and wait.
    pub fn transition_image_layout(
        &self,
        image: &Image,
        new_layout: TextureLayout,
    ) -> GraphicsResult<()> {
        let range = SubresourceRange::whole(
            aspect_mask(image.format()),
            image.mip_levels(),
            image.layer_count(),
        );
        let old = image.current_layout();
        self.execute_one_shot(|device, cmd| {
            layout::record_transition(device, cmd, image.handle(), range, old, new_layout);
            Ok(())
        })?;
        image.set_layout(new_layout);
        Ok(())
    }

    /// First of `candidates` usable with `tiling` and `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[TextureFormat],
        tiling: ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> GraphicsResult<TextureFormat> {
        let vk_candidates: Vec<vk::Format> =
            candidates.iter().map(|&f| convert_texture_format(f)).collect();
        let found = device::find_supported_format(
            &self.instance,
            self.physical_device,
            &vk_candidates,
            convert_tiling(tiling),
            features,
        );
        found
            .and_then(|vk_format| {
                candidates
                    .iter()
                    .copied()
                    .find(|&f| convert_texture_format(f) == vk_format)
            })
            .ok_or_else(|| {
                GraphicsError::UnsupportedFormat(format!(
                    "none of {candidates:?} supports {features:?}"
                ))
            })
    }

    /// Best depth attachment format the device supports.
    pub fn find_depth_format(&self) -> GraphicsResult<TextureFormat> {
        self.find_supported_format(
            &[
                TextureFormat::Depth32Float,
                TextureFormat::Depth32FloatStencil8,
                TextureFormat::Depth24UnormStencil8,
            ],
            ImageTiling::Optimal,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    // ------------------------------------------------------------------
    // Synchronization and submission
    // ------------------------------------------------------------------

    /// Create a fence, optionally already signaled.
    pub fn create_fence(&self, signaled: bool) -> GraphicsResult<Fence> {
        self.ensure_ready()?;
        Fence::new(&self.device, signaled, self.tracker.token())
    }

    /// Create a binary semaphore.
    pub fn create_semaphore(&self) -> GraphicsResult<Semaphore> {
        self.ensure_ready()?;
        Semaphore::new(&self.device, self.tracker.token())
    }

    /// Create the frame-in-flight ring sized by the context parameters.
    pub fn create_frame_sync(&self) -> GraphicsResult<FrameSync> {
        let slots = (0..self.params.frames_in_flight)
            .map(|_| {
                Ok(FrameSlot {
                    image_available: self.create_semaphore()?,
                    render_finished: self.create_semaphore()?,
                    in_flight: self.create_fence(true)?,
                })
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        FrameSync::new(slots)
    }

    /// Allocate primary command buffers from the context pool.
    pub fn allocate_command_buffers(&self, count: u32) -> GraphicsResult<Vec<vk::CommandBuffer>> {
        self.ensure_ready()?;
        let pool = self.command_pool.lock();
        command::allocate_command_buffers(&self.device, *pool, count)
    }

    /// Return command buffers allocated with [`allocate_command_buffers`](Self::allocate_command_buffers).
    pub fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, buffers) };
    }

    /// Submit to the graphics queue. Submissions from all threads are serialized.
    pub fn submit(&self, submits: &[vk::SubmitInfo<'_>], fence: Option<&Fence>) -> GraphicsResult<()> {
        self.ensure_ready()?;
        let _queue = self.queue_lock.lock();
        let handle = fence.map_or(vk::Fence::null(), Fence::handle);
        unsafe { self.device.queue_submit(self.graphics_queue, submits, handle) }?;
        if let Some(fence) = fence {
            fence.mark_submitted();
        }
        Ok(())
    }

    /// Record commands with `record`, submit them to the graphics queue and
    /// block until they complete.
    ///
    /// The command buffer is released on every path, including when `record`
    /// fails. No context lock is held while `record` runs, so it may create
    /// and upload resources itself. Anything written by the commands is
    /// visible once this returns.
    pub fn execute_one_shot<F>(&self, record: F) -> GraphicsResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> GraphicsResult<()>,
    {
        self.run_one_shot(self.queue_families.graphics, self.graphics_queue, record)
    }

    fn run_one_shot<F>(&self, family: u32, queue: vk::Queue, record: F) -> GraphicsResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> GraphicsResult<()>,
    {
        self.ensure_ready()?;
        let commands = OneShotCommands::begin(&self.device, family)?;
        record(&self.device, commands.buffer())?;

        let _queue = self.queue_lock.lock();
        commands.submit_and_wait(queue, FENCE_TIMEOUT)
    }

    /// Hand-off needed after a copy on the transfer queue, if it has its own family.
    fn transfer_handoff(&self) -> Option<QueueTransfer> {
        QueueTransfer::between(self.queue_families.transfer, self.queue_families.graphics)
    }

    /// Copy on the transfer queue, then hand the result over to the graphics
    /// family. `release` and `acquire` record the two halves of the barrier.
    fn run_transfer<F, R, A>(
        &self,
        handoff: QueueTransfer,
        copy: F,
        release: R,
        acquire: A,
    ) -> GraphicsResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
        R: FnOnce(&ash::Device, vk::CommandBuffer),
        A: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        log::debug!(
            "Staging copy on transfer family {} for graphics family {}",
            handoff.src_family,
            handoff.dst_family
        );
        self.run_one_shot(handoff.src_family, self.transfer_queue, |device, cmd| {
            copy(device, cmd);
            release(device, cmd);
            Ok(())
        })?;
        // The fence wait above orders the release before this acquire.
        self.run_one_shot(handoff.dst_family, self.graphics_queue, |device, cmd| {
            acquire(device, cmd);
            Ok(())
        })
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> GraphicsResult<()> {
        let _queue = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Wait for the GPU and release the device and everything the context owns.
    ///
    /// Fails with [`GraphicsError::ResourcesOutstanding`] while handles created
    /// through the context are alive; the context then stays usable.
    pub fn destroy(&mut self) -> GraphicsResult<()> {
        match self.state {
            ContextState::Destroyed => return Ok(()),
            ContextState::Ready => {}
            other => {
                return Err(GraphicsError::InvalidState(format!(
                    "cannot destroy a context in state {other:?}"
                )))
            }
        }

        let live = self.tracker.live();
        if live > 0 {
            log::error!("Refusing to destroy device context: {live} resources still alive");
            return Err(GraphicsError::ResourcesOutstanding(live));
        }

        advance(&mut self.state, ContextState::Destroying)?;
        if let Err(e) = self.wait_idle() {
            log::warn!("device_wait_idle failed during teardown: {e}");
        }

        unsafe { self.release_objects() };
        advance(&mut self.state, ContextState::Destroyed)?;
        log::info!("Device context destroyed");
        Ok(())
    }

    /// Release owned objects in reverse creation order.
    ///
    /// # Safety
    ///
    /// The device must be idle and no resource created through the context may
    /// still exist.
    unsafe fn release_objects(&mut self) {
        // Allocator before device
        drop(self.allocator.lock().take());

        unsafe {
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
            self.device.destroy_device(None);

            if let (Some(loader), Some(surface)) = (&self.surface_loader, self.surface.take()) {
                loader.destroy_surface(surface, None);
            }
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger.take())
            {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if self.state != ContextState::Ready {
            return;
        }
        if let Err(e) = self.destroy() {
            // Touching the device now would invalidate live handles.
            log::warn!("DeviceContext dropped without teardown ({e}); leaking device objects");
        }
    }
}

fn advance(state: &mut ContextState, next: ContextState) -> GraphicsResult<()> {
    if !state.can_transition_to(next) {
        return Err(GraphicsError::InvalidState(format!(
            "invalid context transition {:?} -> {:?}",
            state, next
        )));
    }
    log::debug!("Device context {:?} -> {:?}", state, next);
    *state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ContextState::Uninitialized, ContextState::Initializing)]
    #[case(ContextState::Initializing, ContextState::Ready)]
    #[case(ContextState::Initializing, ContextState::Destroyed)]
    #[case(ContextState::Ready, ContextState::Destroying)]
    #[case(ContextState::Destroying, ContextState::Destroyed)]
    fn test_valid_transitions(#[case] from: ContextState, #[case] to: ContextState) {
        let mut state = from;
        advance(&mut state, to).unwrap();
        assert_eq!(state, to);
    }

    #[rstest]
    #[case(ContextState::Uninitialized, ContextState::Ready)]
    #[case(ContextState::Ready, ContextState::Destroyed)]
    #[case(ContextState::Destroyed, ContextState::Ready)]
    #[case(ContextState::Destroying, ContextState::Ready)]
    fn test_invalid_transitions(#[case] from: ContextState, #[case] to: ContextState) {
        let mut state = from;
        assert!(matches!(
            advance(&mut state, to),
            Err(GraphicsError::InvalidState(_))
        ));
        assert_eq!(state, from);
    }
}
