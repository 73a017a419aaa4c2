//! Raw resource allocation
//!
//! [`ResourceHandle`] owns one buffer or image together with the device memory
//! bound to it. Memory is allocated per resource through
//! [`find_memory_type`]; there is no sub-allocation or pooling.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};

/// The API object a [`ResourceHandle`] owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A buffer object
    Buffer(vk::Buffer),
    /// A 2D image object
    Image(vk::Image),
}

/// Buffer or image plus its dedicated memory allocation
pub struct ResourceHandle {
    context: DeviceContext,
    kind: ResourceKind,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl ResourceHandle {
    /// Create a buffer of `size` bytes backed by memory with `properties`
    pub fn create_buffer(
        context: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let device = context.device();
        let (sharing_mode, families) = context.sharing();
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VulkanError::Api)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate(context, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let handle = Self {
            context: context.clone(),
            kind: ResourceKind::Buffer(buffer),
            memory,
            size,
        };
        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }
        Ok(handle)
    }

    /// Create a single-mip 2D image with optimal tiling in UNDEFINED layout
    pub fn create_image(
        context: &DeviceContext,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let device = context.device();
        let (sharing_mode, families) = context.sharing();
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);

        let image = unsafe { device.create_image(&image_info, None).map_err(VulkanError::Api)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match allocate(context, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let handle = Self {
            context: context.clone(),
            kind: ResourceKind::Image(image),
            memory,
            size: requirements.size,
        };
        unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }
        Ok(handle)
    }

    /// Copy `data` into host-visible memory at `offset`
    pub fn write_mapped(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .context
                .device()
                .map_memory(self.memory, offset, data.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.context.device().unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy `len` bytes out of host-visible memory at `offset`
    pub fn read_mapped(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        if len == 0 {
            return Ok(out);
        }
        unsafe {
            let ptr = self
                .context
                .device()
                .map_memory(self.memory, offset, len as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), len);
            self.context.device().unmap_memory(self.memory);
        }
        Ok(out)
    }

    /// Owned object
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Buffer handle; panics if this owns an image
    pub fn buffer(&self) -> vk::Buffer {
        match self.kind {
            ResourceKind::Buffer(buffer) => buffer,
            ResourceKind::Image(_) => panic!("resource is an image, not a buffer"),
        }
    }

    /// Image handle; panics if this owns a buffer
    pub fn image(&self) -> vk::Image {
        match self.kind {
            ResourceKind::Image(image) => image,
            ResourceKind::Buffer(_) => panic!("resource is a buffer, not an image"),
        }
    }

    /// Bound memory
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Requested size for buffers, allocation size for images
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        unsafe {
            let device = self.context.device();
            match self.kind {
                ResourceKind::Buffer(buffer) => device.destroy_buffer(buffer, None),
                ResourceKind::Image(image) => device.destroy_image(image, None),
            }
            device.free_memory(self.memory, None);
        }
    }
}

fn allocate(
    context: &DeviceContext,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(context.memory_properties(), requirements.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe {
        context
            .device()
            .allocate_memory(&alloc_info, None)
            .map_err(VulkanError::Api)
    }
}

/// First memory type allowed by `type_filter` that has every flag in `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(VulkanError::NoSuitableMemoryType { required: properties })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn test_no_matching_memory_type() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(
            result,
            Err(VulkanError::NoSuitableMemoryType { required }) if required == vk::MemoryPropertyFlags::HOST_VISIBLE
        ));
    }

    #[test]
    fn test_host_visible_round_trip() {
        let Some(context) = testing::headless() else { return };
        let handle = ResourceHandle::create_buffer(
            &context,
            32,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();

        handle.write_mapped(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(handle.read_mapped(8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(handle.size(), 32);
        assert!(matches!(handle.kind(), ResourceKind::Buffer(_)));
    }
}
