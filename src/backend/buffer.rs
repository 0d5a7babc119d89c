// GPU memory: host-visible buffers and the depth attachment
//
// Memory comes from gpu-allocator; each wrapper frees its allocation and
// destroys its handle on drop.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation> {
    device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for '{}'", name))
}

fn free(device: &VulkanDevice, allocation: Option<Allocation>) {
    if let Some(allocation) = allocation {
        if let Err(e) = device.allocator().free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }
}

/// Host-visible buffer, written once at creation
pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer and fill it with data
    pub fn with_data<T: bytemuck::Pod>(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        anyhow::ensure!(!bytes.is_empty(), "Buffer '{}' would be empty", name);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(bytes.len() as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let mut this = Self {
            buffer,
            allocation: None,
            device: Arc::clone(device),
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let mut allocation = allocate(device, name, requirements, MemoryLocation::CpuToGpu, true)?;

        let mapped = allocation
            .mapped_slice_mut()
            .with_context(|| format!("Memory for '{}' is not host visible", name))?;
        mapped[..bytes.len()].copy_from_slice(bytes);

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        this.allocation = Some(allocation);
        bound.context("Failed to bind buffer memory")?;

        Ok(this)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        free(&self.device, self.allocation.take());
    }
}

/// Depth buffer image, memory and view
pub struct DepthImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl DepthImage {
    pub fn new(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create depth image")?;

        let mut this = Self {
            image,
            view: vk::ImageView::null(),
            allocation: None,
            device: Arc::clone(device),
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = allocate(device, "depth", requirements, MemoryLocation::GpuOnly, false)?;
        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        this.allocation = Some(allocation);
        bound.context("Failed to bind depth image memory")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        this.view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create depth image view")?;

        Ok(this)
    }
}

impl Drop for DepthImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        free(&self.device, self.allocation.take());
    }
}
