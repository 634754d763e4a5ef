//! Barrier 的攒批
//!
//! 把一帧内零散的 transition 请求积累起来，在 draw/dispatch 之前统一 flush，
//! 保证 barrier 的数量正比于涉及到的资源数量，而不是 transition 调用的次数。

use ash::vk;
use itertools::Itertools;

use corvis_rhi::core::command_buffer::RhiCommandBuffer;
use corvis_rhi::core::resource_state::{RhiBufferState, RhiImageState};

/// 尚未提交的 image transition
#[derive(Clone, Copy, Debug)]
struct PendingImageTransition {
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    before: RhiImageState,
    after: RhiImageState,
}

/// 尚未提交的 buffer transition
#[derive(Clone, Copy, Debug)]
struct PendingBufferTransition {
    buffer: vk::Buffer,
    before: RhiBufferState,
    after: RhiBufferState,
}

/// 资源状态转换的攒批器
///
/// 同一个资源的多次 transition 会在这里合并：
/// - A -> B 再 B -> C 合并为 A -> C
/// - 合并后 before == after 的条目直接移除（自我抵消）
/// - before == after 的请求本身就是 no-op
///
/// 调用者需要保证传入的 before 状态和资源的真实状态一致，
/// 传错 before 会产生错误的 GPU 行为，这一层不做检查
#[derive(Default)]
pub struct BarrierBatcher {
    pending_images: Vec<PendingImageTransition>,
    pending_buffers: Vec<PendingBufferTransition>,
}

// new & init
impl BarrierBatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

// 记录 transition
impl BarrierBatcher {
    /// 记录一次 image transition，并和已有的 pending 条目合并
    pub fn transition_image(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        before: RhiImageState,
        after: RhiImageState,
    ) {
        // no-op transition
        if before == after {
            return;
        }

        if let Some(idx) = self.pending_images.iter().position(|t| t.image == image) {
            let pending = &mut self.pending_images[idx];
            debug_assert_eq!(
                pending.after, before,
                "image transition chain is broken: pending.after != new before"
            );

            if pending.before == after {
                // A -> B -> A，自我抵消，整条移除
                self.pending_images.swap_remove(idx);
            } else {
                // A -> B -> C 合并为 A -> C
                pending.after = after;
            }
            return;
        }

        self.pending_images.push(PendingImageTransition {
            image,
            aspect,
            before,
            after,
        });
    }

    /// 记录一次 buffer transition，并和已有的 pending 条目合并
    pub fn transition_buffer(&mut self, buffer: vk::Buffer, before: RhiBufferState, after: RhiBufferState) {
        if before == after {
            return;
        }

        if let Some(idx) = self.pending_buffers.iter().position(|t| t.buffer == buffer) {
            let pending = &mut self.pending_buffers[idx];
            debug_assert_eq!(
                pending.after, before,
                "buffer transition chain is broken: pending.after != new before"
            );

            if pending.before == after {
                self.pending_buffers.swap_remove(idx);
            } else {
                pending.after = after;
            }
            return;
        }

        self.pending_buffers.push(PendingBufferTransition { buffer, before, after });
    }
}

// flush
impl BarrierBatcher {
    /// 将积累的 transition 作为一次 pipeline barrier 提交，并清空 pending 列表
    pub fn flush(&mut self, cmd: &RhiCommandBuffer) {
        if self.is_empty() {
            return;
        }
        let _span = tracy_client::span!("BarrierBatcher::flush");

        let image_barriers = self
            .pending_images
            .iter()
            .map(|t| t.before.barrier_to(t.after, t.image, t.aspect))
            .collect_vec();
        let buffer_barriers = self.pending_buffers.iter().map(|t| t.before.barrier_to(t.after, t.buffer)).collect_vec();

        cmd.pipeline_barrier(vk::DependencyFlags::empty(), &image_barriers, &buffer_barriers);

        self.pending_images.clear();
        self.pending_buffers.clear();
    }

    /// 丢弃积累的 transition，用于录制中断的场景
    pub fn clear(&mut self) {
        self.pending_images.clear();
        self.pending_buffers.clear();
    }
}

// getters
impl BarrierBatcher {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending_images.is_empty() && self.pending_buffers.is_empty()
    }

    #[inline]
    pub fn pending_image_count(&self) -> usize {
        self.pending_images.len()
    }

    #[inline]
    pub fn pending_buffer_count(&self) -> usize {
        self.pending_buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image(idx: u64) -> vk::Image {
        vk::Image::from_raw(idx)
    }

    fn buffer(idx: u64) -> vk::Buffer {
        vk::Buffer::from_raw(idx)
    }

    #[test]
    fn test_noop_transition_is_ignored() {
        let mut batcher = BarrierBatcher::new();
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::SHADER_READ_FRAGMENT,
            RhiImageState::SHADER_READ_FRAGMENT,
        );
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_distinct_resources_get_distinct_barriers() {
        let mut batcher = BarrierBatcher::new();
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::UNDEFINED,
            RhiImageState::TRANSFER_DST,
        );
        batcher.transition_image(
            image(2),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::UNDEFINED,
            RhiImageState::COLOR_ATTACHMENT_WRITE,
        );
        batcher.transition_buffer(buffer(3), RhiBufferState::UNDEFINED, RhiBufferState::TRANSFER_DST);

        assert_eq!(batcher.pending_image_count(), 2);
        assert_eq!(batcher.pending_buffer_count(), 1);
    }

    #[test]
    fn test_chain_is_coalesced() {
        // A -> B -> C 只产生一条 A -> C
        let mut batcher = BarrierBatcher::new();
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::UNDEFINED,
            RhiImageState::TRANSFER_DST,
        );
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::TRANSFER_DST,
            RhiImageState::SHADER_READ_FRAGMENT,
        );

        assert_eq!(batcher.pending_image_count(), 1);
        let pending = batcher.pending_images[0];
        assert_eq!(pending.before, RhiImageState::UNDEFINED);
        assert_eq!(pending.after, RhiImageState::SHADER_READ_FRAGMENT);
    }

    #[test]
    fn test_self_cancelling_chain_is_removed() {
        // A -> B -> A 整条移除
        let mut batcher = BarrierBatcher::new();
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::SHADER_READ_FRAGMENT,
            RhiImageState::TRANSFER_DST,
        );
        batcher.transition_image(
            image(1),
            vk::ImageAspectFlags::COLOR,
            RhiImageState::TRANSFER_DST,
            RhiImageState::SHADER_READ_FRAGMENT,
        );

        assert!(batcher.is_empty());
    }

    #[test]
    fn test_buffer_chain_is_coalesced() {
        let mut batcher = BarrierBatcher::new();
        batcher.transition_buffer(buffer(7), RhiBufferState::TRANSFER_DST, RhiBufferState::VERTEX_BUFFER);
        batcher.transition_buffer(buffer(7), RhiBufferState::VERTEX_BUFFER, RhiBufferState::STORAGE_READ_WRITE_COMPUTE);

        assert_eq!(batcher.pending_buffer_count(), 1);
        let pending = batcher.pending_buffers[0];
        assert_eq!(pending.before, RhiBufferState::TRANSFER_DST);
        assert_eq!(pending.after, RhiBufferState::STORAGE_READ_WRITE_COMPUTE);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut batcher = BarrierBatcher::new();
        batcher.transition_buffer(buffer(1), RhiBufferState::UNDEFINED, RhiBufferState::TRANSFER_DST);
        batcher.clear();
        assert!(batcher.is_empty());
    }
}
