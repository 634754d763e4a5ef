//! 每个 in-flight 帧的资源包
//!
//! {command pool, 上传分配器, 当前帧的 descriptor pool, 保活列表, fence 值}。
//! context 初始化时创建一次，两次使用之间 reset，跟随 context 销毁。

use std::rc::Rc;

use ash::vk;

use corvis_rhi::core::buffer::RhiBuffer;
use corvis_rhi::core::command_buffer::RhiCommandBuffer;
use corvis_rhi::core::command_pool::RhiCommandPool;
use corvis_rhi::core::descriptor_pool::{RhiDescriptorPool, RhiDescriptorPoolCreateInfo};
use corvis_rhi::core::image::{RhiImage2D, RhiImage2DView};
use corvis_rhi::core::query_pool::RhiQueryPool;
use corvis_rhi::rhi::Rhi;

use crate::transient_uploader::TransientUploader;

/// 单个 descriptor pool 的容量，耗尽时透明地追加新的 pool
const POOL_MAX_SETS: u32 = 64;

/// batch 不拥有这些资源，只是在 GPU 用完之前维持引用计数
#[derive(Default)]
pub struct RetainedResources {
    buffers: Vec<Rc<RhiBuffer>>,
    images: Vec<Rc<RhiImage2D>>,
    image_views: Vec<Rc<RhiImage2DView>>,
}

impl RetainedResources {
    fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
        self.image_views.clear();
    }

    fn len(&self) -> usize {
        self.buffers.len() + self.images.len() + self.image_views.len()
    }
}

pub struct CommandBatch {
    command_pool: Rc<RhiCommandPool>,
    /// 已经分配出去的 command buffer，reset 时集中 free
    allocated_command_buffers: Vec<RhiCommandBuffer>,

    uploader: TransientUploader,

    /// 当前帧 GPU 可见的 descriptor 来源；Vulkan 将 resource/sampler
    /// 两种 heap 合并在同一个 pool 内。耗尽时透明扩容
    descriptor_pools: Vec<RhiDescriptorPool>,

    retained: RetainedResources,

    /// 上一次使用时 signal 的 fence 值，0 表示从未被提交过
    pub(crate) last_fence_value: u64,

    /// GPU 时间戳：0 = batch 开始，1 = batch 结束
    pub(crate) timestamp_pool: RhiQueryPool,

    debug_name: String,
}

// new & init
impl CommandBatch {
    /// 创建失败时返回 None 并记录日志
    pub fn new(rhi: &Rhi, debug_name: &str) -> Option<Self> {
        let command_pool = Rc::new(RhiCommandPool::new(
            rhi.device.clone(),
            rhi.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
            &format!("{}-command-pool", debug_name),
        ));
        let uploader = TransientUploader::new(rhi, debug_name)?;
        let descriptor_pool = Self::create_descriptor_pool(rhi, debug_name, 0)?;
        let timestamp_pool = RhiQueryPool::new(rhi, vk::QueryType::TIMESTAMP, 2, &format!("{}-timestamp", debug_name));

        Some(Self {
            command_pool,
            allocated_command_buffers: Vec::new(),
            uploader,
            descriptor_pools: vec![descriptor_pool],
            retained: RetainedResources::default(),
            last_fence_value: 0,
            timestamp_pool,
            debug_name: debug_name.to_string(),
        })
    }

    fn create_descriptor_pool(rhi: &Rhi, debug_name: &str, pool_idx: usize) -> Option<RhiDescriptorPool> {
        let pool_sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 512,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 128,
            },
        ];
        RhiDescriptorPool::new(
            rhi,
            Rc::new(RhiDescriptorPoolCreateInfo::new(vk::DescriptorPoolCreateFlags::empty(), POOL_MAX_SETS, pool_sizes)),
            &format!("{}-descriptor-pool-{}", debug_name, pool_idx),
        )
    }
}

// tools
impl CommandBatch {
    /// 分配 command buffer，在当前 batch 的生命周期内使用
    pub fn alloc_command_buffer(&mut self, rhi: &Rhi, debug_name: &str) -> RhiCommandBuffer {
        let cmd = RhiCommandBuffer::new(rhi.device.clone(), self.command_pool.clone(), debug_name);
        self.allocated_command_buffers.push(cmd.clone());
        cmd
    }

    /// 从当前帧的 pool 中分配 descriptor set
    ///
    /// pool 耗尽时自动追加新的 pool（透明扩容），彻底失败时返回 None
    pub fn alloc_descriptor_set(
        &mut self,
        rhi: &Rhi,
        layout: vk::DescriptorSetLayout,
        debug_name: &str,
    ) -> Option<vk::DescriptorSet> {
        if let Some(set) = self.descriptor_pools.last().unwrap().alloc_set(layout, debug_name) {
            return Some(set);
        }

        log::info!("{}-descriptor-pool exhausted, allocating a fresh pool", self.debug_name);
        let fresh_pool = Self::create_descriptor_pool(rhi, &self.debug_name, self.descriptor_pools.len())?;
        self.descriptor_pools.push(fresh_pool);
        self.descriptor_pools.last().unwrap().alloc_set(layout, debug_name)
    }

    #[inline]
    pub fn uploader_mut(&mut self) -> &mut TransientUploader {
        &mut self.uploader
    }

    /// batch 的 fence 到达之后调用，回收全部 per-batch 资源
    pub fn reset(&mut self) {
        let _span = tracy_client::span!("CommandBatch::reset");

        // 释放当前 batch 的 command buffer 的资源
        let gc_cmds = std::mem::take(&mut self.allocated_command_buffers);
        gc_cmds.into_iter().for_each(|cmd| cmd.free());
        // 这个调用并不会释放资源，而是将 pool 内的 command buffer 设置到初始状态
        self.command_pool.reset_all_buffers();

        self.uploader.reset();

        // 扩容出来的额外 pool 在这里收回，稳态只保留第一个
        self.descriptor_pools.truncate(1);
        self.descriptor_pools[0].reset();

        if self.retained.len() > 0 {
            log::debug!("{} releases {} retained resources", self.debug_name, self.retained.len());
        }
        self.retained.clear();
    }
}

// 保活列表
impl CommandBatch {
    /// batch 引用到的 buffer 在 fence 到达之前不会被销毁
    #[inline]
    pub fn retain_buffer(&mut self, buffer: Rc<RhiBuffer>) {
        self.retained.buffers.push(buffer);
    }

    #[inline]
    pub fn retain_image(&mut self, image: Rc<RhiImage2D>) {
        self.retained.images.push(image);
    }

    #[inline]
    pub fn retain_image_view(&mut self, image_view: Rc<RhiImage2DView>) {
        self.retained.image_views.push(image_view);
    }

    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

// getters
impl CommandBatch {
    #[inline]
    pub fn last_fence_value(&self) -> u64 {
        self.last_fence_value
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
