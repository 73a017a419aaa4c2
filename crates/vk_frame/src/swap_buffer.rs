//! Frame-pipelined double buffering
//!
//! One producer writes the write side while one consumer reads the read side;
//! [`SwapBuffer::swap`] exchanges them once per frame. Swapping only flips a
//! parity bit. Ordering between the consumer's last read and the producer's
//! next write comes from submission order and semaphores, not from here.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::VulkanResult;
use crate::staged_buffer::StagedBuffer;

/// Number of buffers in a swap pair
pub const BUFFER_COUNT: usize = 2;

/// Two buffers alternating between producer and consumer
pub struct SwapBuffer<B = StagedBuffer> {
    buffers: [B; BUFFER_COUNT],
    parity: usize,
}

impl<B> SwapBuffer<B> {
    /// Wrap a pair; buffer 0 starts as the read side
    pub fn new(buffers: [B; BUFFER_COUNT]) -> Self {
        Self { buffers, parity: 0 }
    }

    /// Buffer the producer finished last, safe for the consumer this frame
    pub fn read_buffer(&self) -> &B {
        &self.buffers[self.read_index()]
    }

    /// Buffer the producer may overwrite this frame
    pub fn write_buffer(&self) -> &B {
        &self.buffers[self.write_index()]
    }

    /// Mutable write side
    pub fn write_buffer_mut(&mut self) -> &mut B {
        let index = self.write_index();
        &mut self.buffers[index]
    }

    /// Read side and mutable write side at once
    pub fn split_mut(&mut self) -> (&B, &mut B) {
        let [first, second] = &mut self.buffers;
        if self.parity == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        }
    }

    /// Exchange read and write sides
    pub fn swap(&mut self) {
        self.parity = (self.parity + 1) % BUFFER_COUNT;
    }

    /// Current parity, 0 or 1
    pub fn parity(&self) -> usize {
        self.parity
    }

    /// Index of the read side
    pub fn read_index(&self) -> usize {
        self.parity
    }

    /// Index of the write side
    pub fn write_index(&self) -> usize {
        (self.parity + 1) % BUFFER_COUNT
    }

    /// Both buffers in index order
    pub fn buffers(&self) -> &[B; BUFFER_COUNT] {
        &self.buffers
    }
}

impl SwapBuffer<StagedBuffer> {
    /// Pair of staged buffers of `size` bytes in `stride`-byte elements
    pub fn staged(context: &DeviceContext, size: vk::DeviceSize, stride: vk::DeviceSize) -> VulkanResult<Self> {
        Ok(Self::new([
            StagedBuffer::new(context, size, stride)?,
            StagedBuffer::new(context, size, stride)?,
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueCoordinator, QueueRole};
    use crate::staged_buffer::element_range;
    use crate::testing;

    #[test]
    fn test_sides_alternate() {
        let mut pair = SwapBuffer::new(["a", "b"]);
        assert_eq!(pair.parity(), 0);
        assert_eq!(*pair.read_buffer(), "a");
        assert_eq!(*pair.write_buffer(), "b");

        pair.swap();
        assert_eq!(pair.parity(), 1);
        assert_eq!(*pair.read_buffer(), "b");
        assert_eq!(*pair.write_buffer(), "a");

        pair.swap();
        assert_eq!(*pair.read_buffer(), "a");
    }

    #[test]
    fn test_read_and_write_never_alias() {
        let mut pair = SwapBuffer::new([0u32, 1u32]);
        for _ in 0..5 {
            assert_ne!(pair.read_index(), pair.write_index());
            pair.swap();
        }
    }

    #[test]
    fn test_write_becomes_read_after_swap() {
        let mut pair = SwapBuffer::new([Vec::new(), Vec::new()]);
        for frame in 0..4 {
            pair.write_buffer_mut().push(frame);
            pair.swap();
            assert_eq!(pair.read_buffer().last(), Some(&frame));
        }
        assert_eq!(pair.buffers()[0], vec![1, 3]);
        assert_eq!(pair.buffers()[1], vec![0, 2]);
    }

    #[test]
    fn test_split_mut_follows_parity() {
        let mut pair = SwapBuffer::new([10, 20]);
        {
            let (read, write) = pair.split_mut();
            assert_eq!(*read, 10);
            *write += 1;
        }
        pair.swap();
        let (read, write) = pair.split_mut();
        assert_eq!(*read, 21);
        assert_eq!(*write, 10);
    }

    #[test]
    fn test_host_pair_end_to_end() {
        const SIZE: u64 = 1024;
        const STRIDE: u64 = 64;
        let mut pair = SwapBuffer::new([vec![0xAAu8; SIZE as usize], vec![0xAAu8; SIZE as usize]]);

        for frame in 0..4u8 {
            let before = pair.read_buffer().clone();
            for element in 0..SIZE / STRIDE {
                let (offset, len) = element_range(element, 1, STRIDE, SIZE);
                let range = offset as usize..(offset + len) as usize;
                pair.write_buffer_mut()[range].fill(frame.wrapping_mul(16) | element as u8);
            }
            // Producing into the write side leaves the read side untouched
            assert_eq!(*pair.read_buffer(), before);
            pair.swap();

            let read = pair.read_buffer();
            for (element, chunk) in read.chunks_exact(STRIDE as usize).enumerate() {
                assert!(chunk.iter().all(|&b| b == frame.wrapping_mul(16) | element as u8));
            }
            assert_eq!(*pair.write_buffer(), before);
        }
    }

    #[test]
    fn test_staged_pair_end_to_end() {
        let Some(context) = testing::headless() else { return };
        let coordinator = QueueCoordinator::new(&context).unwrap();
        let mut pair = SwapBuffer::staged(&context, 1024, 64).unwrap();
        assert_eq!(pair.read_buffer().element_count(), 16);

        // Give both sides a known baseline
        let baseline = vec![0xAAu8; 1024];
        for _ in 0..BUFFER_COUNT {
            coordinator
                .one_shot(QueueRole::Transfer, |cmd| pair.write_buffer_mut().write(cmd, &baseline, 0))
                .unwrap()
                .unwrap();
            pair.swap();
        }

        let elements: Vec<[u8; 64]> = (0..16u8).map(|i| [i.wrapping_mul(7); 64]).collect();
        coordinator
            .one_shot(QueueRole::Transfer, |cmd| pair.write_buffer_mut().write_elements(cmd, 0, &elements))
            .unwrap()
            .unwrap();
        pair.swap();

        let expected: Vec<u8> = elements.iter().flatten().copied().collect();
        coordinator
            .one_shot(QueueRole::Transfer, |cmd| {
                let [first, second] = &mut pair.buffers;
                first.download(cmd);
                second.download(cmd);
            })
            .unwrap();

        assert_eq!(pair.read_buffer().read(0, 1024).unwrap(), expected);
        assert_eq!(pair.write_buffer().read(0, 1024).unwrap(), baseline);
    }
}
