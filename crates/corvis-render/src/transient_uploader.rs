//! 每个 CommandBatch 的线性上传分配器
//!
//! 在一块 host 可见的 buffer 上做 bump allocation，用于 CPU -> GPU 的数据暂存。
//! 空间不足时换一块更大的 buffer 并把旧的挂到 garbage 列表上，
//! 旧 buffer 上已经分配出去的区域会保持有效，直到这个 batch 的 fence 到达
//! （由 begin 的 fence-wait-before-reuse 保证）。

use ash::vk;

use corvis_rhi::core::buffer::RhiBuffer;
use corvis_rhi::rhi::Rhi;

/// 扩容时在 "当前大小 + 请求大小" 之外额外预留的空间
const GROW_SLACK: vk::DeviceSize = 1 << 20;

/// garbage 列表的上限，超过之后在 reset 时整体清掉，限制稳态内存
const GARBAGE_CAP: usize = 4;

/// 初始的 buffer 大小
const INITIAL_SIZE: vk::DeviceSize = 4 << 20;

/// 一次线性分配的结果
pub struct StagingAllocation {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub mapped_ptr: *mut u8,
}

/// 纯偏移运算的游标，分配策略和 vk 资源解耦
struct LinearCursor {
    capacity: vk::DeviceSize,
    offset: vk::DeviceSize,
}

impl LinearCursor {
    fn new(capacity: vk::DeviceSize) -> Self {
        Self { capacity, offset: 0 }
    }

    /// 空间足够时返回分配的起始 offset 并前进游标，不够时返回 None
    fn try_alloc(&mut self, size: vk::DeviceSize, align: vk::DeviceSize) -> Option<vk::DeviceSize> {
        let aligned_offset = align_up(self.offset, align);
        if aligned_offset + size > self.capacity {
            return None;
        }
        self.offset = aligned_offset + size;
        Some(aligned_offset)
    }

    fn reset(&mut self) {
        self.offset = 0;
    }
}

/// round x up to a multiple of align
///
/// * align must be a power of 2
#[inline]
fn align_up(x: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(align.is_power_of_two());
    (x + (align - 1)) & !(align - 1)
}

/// 扩容策略：当前大小 + 请求大小 + 固定的 slack
#[inline]
fn grown_capacity(current: vk::DeviceSize, requested: vk::DeviceSize) -> vk::DeviceSize {
    current + requested + GROW_SLACK
}

pub struct TransientUploader {
    buffer: RhiBuffer,
    cursor: LinearCursor,

    /// 扩容淘汰下来的 buffer，在 batch 完成之前保活
    garbage: Vec<RhiBuffer>,

    debug_name: String,
}

// new & init
impl TransientUploader {
    /// 创建失败时返回 None 并记录日志
    pub fn new(rhi: &Rhi, debug_name: &str) -> Option<Self> {
        let buffer = RhiBuffer::new_stage_buffer(rhi, INITIAL_SIZE, format!("{}-uploader", debug_name))?;
        Some(Self {
            buffer,
            cursor: LinearCursor::new(INITIAL_SIZE),
            garbage: Vec::new(),
            debug_name: debug_name.to_string(),
        })
    }
}

// tools
impl TransientUploader {
    /// 线性分配一段 staging 内存
    ///
    /// 空间不足时透明扩容；分配失败（设备内存耗尽）返回 None 并记录日志
    pub fn linear_allocate(
        &mut self,
        rhi: &Rhi,
        size: vk::DeviceSize,
        align: vk::DeviceSize,
    ) -> Option<StagingAllocation> {
        if let Some(offset) = self.cursor.try_alloc(size, align) {
            return Some(self.allocation_at(offset));
        }

        // 扩容：旧 buffer 挂到 garbage 上保活，新 buffer 从头开始分配
        let new_capacity = grown_capacity(self.buffer.size(), size);
        log::info!(
            "{}-uploader grows: {}B -> {}B (requested {}B)",
            self.debug_name,
            self.buffer.size(),
            new_capacity,
            size
        );
        let new_buffer = RhiBuffer::new_stage_buffer(rhi, new_capacity, format!("{}-uploader", self.debug_name))?;
        let old_buffer = std::mem::replace(&mut self.buffer, new_buffer);
        self.garbage.push(old_buffer);

        self.cursor = LinearCursor::new(new_capacity);
        let offset = self.cursor.try_alloc(size, align).expect("fresh uploader buffer must fit the request");
        Some(self.allocation_at(offset))
    }

    /// 分配并写入数据，返回写入位置。flush 由这里负责
    pub fn upload_bytes(
        &mut self,
        rhi: &Rhi,
        data: &[u8],
        align: vk::DeviceSize,
    ) -> Option<StagingAllocation> {
        let allocation = self.linear_allocate(rhi, data.len() as vk::DeviceSize, align)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), allocation.mapped_ptr, data.len());
        }
        self.buffer.flush(allocation.offset, data.len() as vk::DeviceSize);
        Some(allocation)
    }

    /// batch 复用时调用：清空分配游标，并修剪 garbage 列表
    ///
    /// 此时 batch 的 fence 已经到达，garbage 上的 buffer 不再被 GPU 引用
    pub fn reset(&mut self) {
        self.cursor.reset();
        if self.garbage.len() > GARBAGE_CAP {
            log::info!("{}-uploader prunes {} retired buffers", self.debug_name, self.garbage.len());
            self.garbage.clear();
        }
    }

    fn allocation_at(&self, offset: vk::DeviceSize) -> StagingAllocation {
        StagingAllocation {
            buffer: self.buffer.handle(),
            offset,
            mapped_ptr: unsafe { self.buffer.mapped_ptr().add(offset as usize) },
        }
    }
}

// getters
impl TransientUploader {
    #[inline]
    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    #[inline]
    pub fn retired_count(&self) -> usize {
        self.garbage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_cursor_bump_allocation() {
        let mut cursor = LinearCursor::new(1024);
        assert_eq!(cursor.try_alloc(100, 1), Some(0));
        // 下一次分配对齐到 256
        assert_eq!(cursor.try_alloc(100, 256), Some(256));
        assert_eq!(cursor.try_alloc(100, 1), Some(356));
    }

    #[test]
    fn test_cursor_overflow() {
        let mut cursor = LinearCursor::new(1024);
        assert_eq!(cursor.try_alloc(1024, 1), Some(0));
        assert_eq!(cursor.try_alloc(1, 1), None);

        cursor.reset();
        assert_eq!(cursor.try_alloc(1, 1), Some(0));
    }

    #[test]
    fn test_exact_fit_is_not_overflow() {
        let mut cursor = LinearCursor::new(256);
        assert_eq!(cursor.try_alloc(256, 1), Some(0));
    }

    #[test]
    fn test_grown_capacity_covers_request() {
        let current = 4 << 20;
        let requested = 32 << 20;
        let grown = grown_capacity(current, requested);
        assert!(grown >= current + requested);
        assert_eq!(grown, current + requested + GROW_SLACK);
    }
}
