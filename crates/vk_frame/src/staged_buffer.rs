//! Device-local buffer fed through a host-visible staging buffer
//!
//! Writes land in the staging buffer on the host and reach the device buffer
//! through a recorded copy of the whole buffer. The staging side always
//! mirrors the last upload or download.

use ash::vk;
use bytemuck::Pod;

use crate::command::CommandBuffer;
use crate::context::DeviceContext;
use crate::error::VulkanResult;
use crate::resource::ResourceHandle;

/// Usage of the device-local side
pub const DEVICE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// Usage of the staging side
pub const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// Panics unless `size` bytes split into whole elements of `stride` bytes
pub fn assert_element_layout(size: vk::DeviceSize, stride: vk::DeviceSize) {
    assert!(size > 0, "staged buffer size must be non-zero");
    assert!(stride > 0, "staged buffer stride must be non-zero");
    assert_eq!(
        size % stride,
        0,
        "staged buffer size {} is not a multiple of stride {}",
        size,
        stride
    );
}

/// Panics unless `[offset, offset + len)` lies inside a buffer of `size` bytes
pub fn assert_in_range(offset: vk::DeviceSize, len: vk::DeviceSize, size: vk::DeviceSize) {
    let end = offset.checked_add(len);
    assert!(
        matches!(end, Some(end) if end <= size),
        "range {}+{} out of bounds for buffer of {} bytes",
        offset,
        len,
        size
    );
}

/// Byte offset and length of `count` elements starting at element `first`.
///
/// # Panics
///
/// Panics if the byte range overflows or lies outside a buffer of `size`
/// bytes.
pub fn element_range(
    first: u64,
    count: u64,
    stride: vk::DeviceSize,
    size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    match (first.checked_mul(stride), count.checked_mul(stride)) {
        (Some(offset), Some(len)) => {
            assert_in_range(offset, len, size);
            (offset, len)
        }
        _ => panic!(
            "elements {}+{} of {} bytes out of bounds for buffer of {} bytes",
            first, count, stride, size
        ),
    }
}

/// Device-local buffer paired with a same-sized staging buffer
pub struct StagedBuffer {
    context: DeviceContext,
    device: ResourceHandle,
    staging: ResourceHandle,
    size: vk::DeviceSize,
    stride: vk::DeviceSize,
}

impl StagedBuffer {
    /// Allocate both sides, `size` bytes of `stride`-byte elements
    ///
    /// # Panics
    ///
    /// Panics if `stride` is zero or does not divide `size`.
    pub fn new(context: &DeviceContext, size: vk::DeviceSize, stride: vk::DeviceSize) -> VulkanResult<Self> {
        assert_element_layout(size, stride);

        let device = ResourceHandle::create_buffer(
            context,
            size,
            DEVICE_USAGE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let staging = ResourceHandle::create_buffer(
            context,
            size,
            STAGING_USAGE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        log::trace!("Staged buffer of {} bytes ({} elements)", size, size / stride);

        Ok(Self {
            context: context.clone(),
            device,
            staging,
            size,
            stride,
        })
    }

    /// Stage `data` at `offset` and record a copy of the whole staging buffer
    /// into the device buffer.
    ///
    /// The host copy happens now; the device sees it once `cmd` executes.
    /// An empty `data` records nothing.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the buffer or `cmd` is not recording.
    pub fn write(&mut self, cmd: &mut CommandBuffer, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        assert_in_range(offset, data.len() as vk::DeviceSize, self.size);
        cmd.assert_recording();
        if data.is_empty() {
            return Ok(());
        }

        self.staging.write_mapped(offset, data)?;
        self.record_copy(cmd, self.staging.buffer(), self.device.buffer());
        Ok(())
    }

    /// Write `elements` starting at element index `first`
    ///
    /// # Panics
    ///
    /// Panics if `T` is not exactly one stride wide or the range is out of
    /// bounds.
    pub fn write_elements<T: Pod>(&mut self, cmd: &mut CommandBuffer, first: u64, elements: &[T]) -> VulkanResult<()> {
        assert_eq!(
            std::mem::size_of::<T>() as vk::DeviceSize,
            self.stride,
            "element type size does not match stride"
        );
        let (offset, _) = element_range(first, elements.len() as u64, self.stride, self.size);
        self.write(cmd, bytemuck::cast_slice(elements), offset)
    }

    /// Record a device-side copy of all of `source` into this buffer
    ///
    /// # Panics
    ///
    /// Panics if the sizes differ.
    pub fn copy_from(&mut self, cmd: &mut CommandBuffer, source: &StagedBuffer) {
        assert_eq!(
            source.size, self.size,
            "buffer copy size mismatch: {} into {}",
            source.size, self.size
        );
        cmd.assert_recording();
        self.record_copy(cmd, source.device.buffer(), self.device.buffer());
    }

    /// Record a copy of the device buffer back into staging, made visible to
    /// host reads. Call [`read`](Self::read) once `cmd` has completed.
    pub fn download(&mut self, cmd: &mut CommandBuffer) {
        cmd.assert_recording();
        self.record_copy(cmd, self.device.buffer(), self.staging.buffer());
        cmd.memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::HOST,
            vk::AccessFlags::HOST_READ,
        );
    }

    /// Bytes currently held by the staging buffer
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<Vec<u8>> {
        assert_in_range(offset, len as vk::DeviceSize, self.size);
        self.staging.read_mapped(offset, len)
    }

    /// Elements currently held by the staging buffer
    pub fn read_elements<T: Pod>(&self, first: u64, count: usize) -> VulkanResult<Vec<T>> {
        let element_size = std::mem::size_of::<T>();
        assert_eq!(
            element_size as vk::DeviceSize, self.stride,
            "element type size does not match stride"
        );
        let (offset, len) = element_range(first, count as u64, self.stride, self.size);
        let bytes = self.read(offset, len as usize)?;
        Ok(bytes.chunks_exact(element_size).map(bytemuck::pod_read_unaligned).collect())
    }

    fn record_copy(&self, cmd: &CommandBuffer, src: vk::Buffer, dst: vk::Buffer) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size,
        };
        unsafe {
            self.context
                .device()
                .cmd_copy_buffer(cmd.handle(), src, dst, &[region]);
        }
    }

    /// Total size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Element size in bytes
    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    /// Number of whole elements
    pub fn element_count(&self) -> u64 {
        self.size / self.stride
    }

    /// Device-local buffer handle, for binding to shaders
    pub fn device_handle(&self) -> vk::Buffer {
        self.device.buffer()
    }

    /// Staging buffer handle
    pub fn staging_handle(&self) -> vk::Buffer {
        self.staging.buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueCoordinator, QueueRole};
    use crate::testing;

    #[test]
    fn test_range_checks() {
        assert_in_range(0, 64, 64);
        assert_in_range(60, 4, 64);
        assert_in_range(64, 0, 64);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_range_past_end_panics() {
        assert_in_range(61, 4, 64);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_range_overflow_panics() {
        assert_in_range(u64::MAX, 2, 64);
    }

    #[test]
    fn test_element_range_in_bytes() {
        assert_eq!(element_range(0, 4, 64, 1024), (0, 256));
        assert_eq!(element_range(15, 1, 64, 1024), (960, 64));
        assert_eq!(element_range(16, 0, 64, 1024), (1024, 0));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_element_offset_overflow_panics() {
        // 2^58 * 64 wraps to 0 in unchecked arithmetic
        element_range(1 << 58, 1, 64, 1024);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_element_count_overflow_panics() {
        element_range(0, u64::MAX, 64, 1024);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_element_past_end_panics() {
        element_range(16, 1, 64, 1024);
    }

    #[test]
    #[should_panic(expected = "not a multiple of stride")]
    fn test_partial_element_panics() {
        assert_element_layout(100, 64);
    }

    #[test]
    #[should_panic(expected = "stride must be non-zero")]
    fn test_zero_stride_panics() {
        assert_element_layout(64, 0);
    }

    #[test]
    fn test_write_then_download_ranges() {
        let Some(context) = testing::headless() else { return };
        let coordinator = QueueCoordinator::new(&context).unwrap();
        let mut buffer = StagedBuffer::new(&context, 256, 16).unwrap();
        assert_eq!(buffer.element_count(), 16);

        let zeros = vec![0u8; 256];
        coordinator
            .one_shot(QueueRole::Transfer, |cmd| buffer.write(cmd, &zeros, 0))
            .unwrap()
            .unwrap();

        for (offset, len) in [(0u64, 256usize), (0, 1), (17, 31), (200, 56), (255, 1)] {
            let data: Vec<u8> = (0..len).map(|i| ((i as u8) ^ (offset as u8)) | 1).collect();
            coordinator
                .one_shot(QueueRole::Transfer, |cmd| buffer.write(cmd, &data, offset))
                .unwrap()
                .unwrap();

            // Round trip through the device buffer, clobbering staging first
            coordinator
                .one_shot(QueueRole::Transfer, |cmd| {
                    buffer.staging.write_mapped(0, &zeros).unwrap();
                    buffer.download(cmd);
                })
                .unwrap();
            assert_eq!(buffer.read(offset, len).unwrap(), data, "offset {} len {}", offset, len);
        }
    }

    #[test]
    fn test_elements_and_device_copy() {
        let Some(context) = testing::headless() else { return };
        let coordinator = QueueCoordinator::new(&context).unwrap();
        let mut source = StagedBuffer::new(&context, 64, 16).unwrap();
        let mut target = StagedBuffer::new(&context, 64, 16).unwrap();
        let elements: [[u32; 4]; 2] = [[1, 2, 3, 4], [5, 6, 7, 8]];

        coordinator
            .one_shot(QueueRole::Graphics, |cmd| {
                source.write(cmd, &[0u8; 64], 0).unwrap();
                source.write_elements(cmd, 2, &elements).unwrap();
                cmd.memory_barrier(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_READ,
                );
                target.copy_from(cmd, &source);
                cmd.memory_barrier(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_READ,
                );
                target.download(cmd);
            })
            .unwrap();

        let read: Vec<[u32; 4]> = target.read_elements(0, 4).unwrap();
        assert_eq!(read, vec![[0; 4], [0; 4], [1, 2, 3, 4], [5, 6, 7, 8]]);
    }

    #[test]
    fn test_empty_write_records_nothing() {
        let Some(context) = testing::headless() else { return };
        let coordinator = QueueCoordinator::new(&context).unwrap();
        let mut buffer = StagedBuffer::new(&context, 16, 4).unwrap();
        coordinator
            .one_shot(QueueRole::Transfer, |cmd| buffer.write(cmd, &[], 16))
            .unwrap()
            .unwrap();
    }
}
