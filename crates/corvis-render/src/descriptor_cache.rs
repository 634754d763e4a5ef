//! Descriptor 的影子表与延迟提交
//!
//! CPU 侧维护 "哪个 view 绑定在哪个 stage 的哪个槽位" 的影子表，
//! 以 stage 为粒度打脏标记；draw/dispatch 之前才把脏的 stage
//! 整表写入当前 CommandBatch 的 descriptor pool 并绑定。
//!
//! 未绑定的槽位使用预创建的 null view 填充，硬件校验不会看到空槽。

use std::rc::Rc;

use ash::vk;

use corvis_rhi::core::buffer::RhiBuffer;
use corvis_rhi::core::command_buffer::RhiCommandBuffer;
use corvis_rhi::core::image::{RhiImage2D, RhiImage2DView, RhiImageViewCreateInfo};
use corvis_rhi::core::sampler::{RhiSampler, RhiSamplerCreateInfo};
use corvis_rhi::rhi::Rhi;

use crate::binding_layout::{
    BINDING_SAMPLED_IMAGE, BINDING_SAMPLER, BINDING_STORAGE_IMAGE, BINDING_UNIFORM_BUFFER, BindingLayout,
    BindingLayoutSignature, MAX_SAMPLED_IMAGE_SLOTS, MAX_SAMPLER_SLOTS, MAX_STORAGE_IMAGE_SLOTS,
    MAX_UNIFORM_BUFFER_SLOTS, ShaderVisibility,
};
use crate::command_batch::CommandBatch;

/// uniform buffer 槽位
#[derive(Clone, Copy, PartialEq, Debug)]
struct BufferSlot {
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
}

/// sampled/storage image 槽位
#[derive(Clone, Copy, PartialEq, Debug)]
struct ImageSlot {
    view: vk::ImageView,
    layout: vk::ImageLayout,
}

/// sampler 槽位
#[derive(Clone, Copy, PartialEq, Debug)]
struct SamplerSlot {
    sampler: vk::Sampler,
}

/// 未绑定槽位使用的 null view 句柄
#[derive(Clone, Copy)]
pub struct NullViews {
    pub uniform_buffer: vk::Buffer,
    pub uniform_buffer_range: vk::DeviceSize,
    pub sampled_image: vk::ImageView,
    pub storage_image: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl NullViews {
    #[inline]
    fn buffer_slot(&self) -> BufferSlot {
        BufferSlot {
            buffer: self.uniform_buffer,
            offset: 0,
            range: self.uniform_buffer_range,
        }
    }

    #[inline]
    fn sampled_slot(&self) -> ImageSlot {
        ImageSlot {
            view: self.sampled_image,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[inline]
    fn storage_slot(&self) -> ImageSlot {
        ImageSlot {
            view: self.storage_image,
            layout: vk::ImageLayout::GENERAL,
        }
    }

    #[inline]
    fn sampler_slot(&self) -> SamplerSlot {
        SamplerSlot {
            sampler: self.sampler,
        }
    }
}

/// null view 背后的真实资源，生命周期和 cache 一致
struct NullResources {
    _buffer: RhiBuffer,
    _image: Rc<RhiImage2D>,
    _sampled_view: RhiImage2DView,
    _storage_view: RhiImage2DView,
    _sampler: RhiSampler,
}

/// 单个 stage 的全部影子表
struct StageTables {
    uniform_buffers: Vec<BufferSlot>,
    sampled_images: Vec<ImageSlot>,
    storage_images: Vec<ImageSlot>,
    samplers: Vec<SamplerSlot>,
}

impl StageTables {
    fn new(nulls: &NullViews) -> Self {
        Self {
            uniform_buffers: vec![nulls.buffer_slot(); MAX_UNIFORM_BUFFER_SLOTS],
            sampled_images: vec![nulls.sampled_slot(); MAX_SAMPLED_IMAGE_SLOTS],
            storage_images: vec![nulls.storage_slot(); MAX_STORAGE_IMAGE_SLOTS],
            samplers: vec![nulls.sampler_slot(); MAX_SAMPLER_SLOTS],
        }
    }

    fn reset(&mut self, nulls: &NullViews) {
        self.uniform_buffers.fill(nulls.buffer_slot());
        self.sampled_images.fill(nulls.sampled_slot());
        self.storage_images.fill(nulls.storage_slot());
        self.samplers.fill(nulls.sampler_slot());
    }
}

/// descriptor 的影子表缓存
pub struct DescriptorCache {
    stages: Vec<StageTables>,
    dirty: [bool; ShaderVisibility::COUNT],

    nulls: NullViews,
    _null_resources: Option<NullResources>,
}

// new & init
impl DescriptorCache {
    /// 创建 cache 以及 null view 背后的占位资源
    ///
    /// 创建失败时返回 None 并记录日志
    pub fn new(rhi: &Rhi) -> Option<Self> {
        let null_buffer = RhiBuffer::new_device_buffer(
            rhi,
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "descriptor-cache-null-ubo",
        )?;
        let null_image = Rc::new(RhiImage2D::new_device_image(
            rhi,
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE,
            "descriptor-cache-null-image",
        )?);
        let sampled_view = RhiImage2DView::new(
            rhi,
            null_image.handle(),
            RhiImageViewCreateInfo::new_image_view_2d_info(vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR),
            "descriptor-cache-null-srv",
        )?;
        let storage_view = RhiImage2DView::new(
            rhi,
            null_image.handle(),
            RhiImageViewCreateInfo::new_image_view_2d_info(vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR),
            "descriptor-cache-null-uav",
        )?;
        let sampler = RhiSampler::new(rhi, Rc::new(RhiSamplerCreateInfo::new()), "descriptor-cache-null-sampler")?;

        let nulls = NullViews {
            uniform_buffer: null_buffer.handle(),
            uniform_buffer_range: null_buffer.size(),
            sampled_image: sampled_view.handle(),
            storage_image: storage_view.handle(),
            sampler: sampler.handle(),
        };

        let mut cache = Self::with_null_views(nulls);
        cache._null_resources = Some(NullResources {
            _buffer: null_buffer,
            _image: null_image,
            _sampled_view: sampled_view,
            _storage_view: storage_view,
            _sampler: sampler,
        });
        Some(cache)
    }

    /// 基于外部给定的 null view 句柄构建影子表
    pub(crate) fn with_null_views(nulls: NullViews) -> Self {
        let stages = (0..ShaderVisibility::COUNT).map(|_| StageTables::new(&nulls)).collect();
        Self {
            stages,
            dirty: [true; ShaderVisibility::COUNT],
            nulls,
            _null_resources: None,
        }
    }

    /// 所有槽位回到 null view，所有 stage 变脏。每个 batch 开始时调用
    pub fn reset(&mut self) {
        for tables in &mut self.stages {
            tables.reset(&self.nulls);
        }
        self.dirty = [true; ShaderVisibility::COUNT];
    }

    /// 脏标记只在一次 begin/end 的录制窗口内有意义，帧结束时清零
    pub(crate) fn finish_frame(&mut self) {
        self.dirty = [false; ShaderVisibility::COUNT];
    }
}

// 绑定更新
impl DescriptorCache {
    /// 绑定 uniform buffer view 到指定槽位，view 没有变化时不打脏标记
    pub fn set_uniform_buffer(
        &mut self,
        stage: ShaderVisibility,
        slot: usize,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        assert!(slot < MAX_UNIFORM_BUFFER_SLOTS, "uniform buffer slot {} out of range", slot);
        let new_slot = BufferSlot { buffer, offset, range };
        let tables = &mut self.stages[stage.index()];
        if tables.uniform_buffers[slot] != new_slot {
            tables.uniform_buffers[slot] = new_slot;
            self.dirty[stage.index()] = true;
        }
    }

    /// 绑定 sampled image view (SRV) 到指定槽位
    pub fn set_sampled_image(&mut self, stage: ShaderVisibility, slot: usize, view: vk::ImageView) {
        assert!(slot < MAX_SAMPLED_IMAGE_SLOTS, "sampled image slot {} out of range", slot);
        let new_slot = ImageSlot {
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let tables = &mut self.stages[stage.index()];
        if tables.sampled_images[slot] != new_slot {
            tables.sampled_images[slot] = new_slot;
            self.dirty[stage.index()] = true;
        }
    }

    /// 绑定 storage image view (UAV) 到指定槽位
    pub fn set_storage_image(&mut self, stage: ShaderVisibility, slot: usize, view: vk::ImageView) {
        assert!(slot < MAX_STORAGE_IMAGE_SLOTS, "storage image slot {} out of range", slot);
        let new_slot = ImageSlot {
            view,
            layout: vk::ImageLayout::GENERAL,
        };
        let tables = &mut self.stages[stage.index()];
        if tables.storage_images[slot] != new_slot {
            tables.storage_images[slot] = new_slot;
            self.dirty[stage.index()] = true;
        }
    }

    /// 绑定 sampler 到指定槽位
    pub fn set_sampler(&mut self, stage: ShaderVisibility, slot: usize, sampler: vk::Sampler) {
        assert!(slot < MAX_SAMPLER_SLOTS, "sampler slot {} out of range", slot);
        let new_slot = SamplerSlot { sampler };
        let tables = &mut self.stages[stage.index()];
        if tables.samplers[slot] != new_slot {
            tables.samplers[slot] = new_slot;
            self.dirty[stage.index()] = true;
        }
    }
}

// 提交
impl DescriptorCache {
    /// draw 之前提交 graphics 可见的 stage
    pub fn commit_graphics(
        &mut self,
        rhi: &Rhi,
        cmd: &RhiCommandBuffer,
        batch: &mut CommandBatch,
        layout: &BindingLayout,
    ) {
        self.commit_stages(rhi, cmd, batch, layout, &ShaderVisibility::GRAPHICS, vk::PipelineBindPoint::GRAPHICS);
    }

    /// dispatch 之前提交 compute stage
    pub fn commit_compute(
        &mut self,
        rhi: &Rhi,
        cmd: &RhiCommandBuffer,
        batch: &mut CommandBatch,
        layout: &BindingLayout,
    ) {
        self.commit_stages(rhi, cmd, batch, layout, &[ShaderVisibility::Compute], vk::PipelineBindPoint::COMPUTE);
    }

    /// trace rays 之前提交 ray tracing stage（全局布局）
    pub fn commit_ray_tracing(
        &mut self,
        rhi: &Rhi,
        cmd: &RhiCommandBuffer,
        batch: &mut CommandBatch,
        layout: &BindingLayout,
    ) {
        self.commit_stages(
            rhi,
            cmd,
            batch,
            layout,
            &[ShaderVisibility::RayTracing],
            vk::PipelineBindPoint::RAY_TRACING_KHR,
        );
    }

    fn commit_stages(
        &mut self,
        rhi: &Rhi,
        cmd: &RhiCommandBuffer,
        batch: &mut CommandBatch,
        layout: &BindingLayout,
        stages: &[ShaderVisibility],
        bind_point: vk::PipelineBindPoint,
    ) {
        let _span = tracy_client::span!("DescriptorCache::commit");

        for stage in self.take_dirty_stages(stages, layout.shapes()) {
            let Some(set_index) = layout.set_index(stage) else {
                continue;
            };
            let Some(set_layout) = layout.set_layout(stage) else {
                continue;
            };

            let Some(set) = batch.alloc_descriptor_set(rhi, set_layout, &format!("table-{}", stage)) else {
                log::error!("descriptor commit skipped for stage {}: pool exhausted", stage);
                continue;
            };

            self.write_stage_table(rhi, stage, set, layout);
            cmd.bind_descriptor_sets(bind_point, layout.pipeline_layout(), set_index, &[set], &[]);
        }
    }

    /// 返回本次 commit 需要整表拷贝的 stage，并清除它们的脏标记
    ///
    /// 布局里没有 table 的 stage 即使脏了也不提交
    fn take_dirty_stages(
        &mut self,
        stages: &[ShaderVisibility],
        shapes: &BindingLayoutSignature,
    ) -> Vec<ShaderVisibility> {
        stages
            .iter()
            .copied()
            .filter(|stage| {
                if !self.dirty[stage.index()] || shapes[stage.index()].is_empty() {
                    return false;
                }
                self.dirty[stage.index()] = false;
                true
            })
            .collect()
    }

    /// 将一个 stage 的影子表整体写入 descriptor set
    ///
    /// 每张表一个 WriteDescriptorSet，一次 vkUpdateDescriptorSets 调用
    fn write_stage_table(&self, rhi: &Rhi, stage: ShaderVisibility, set: vk::DescriptorSet, layout: &BindingLayout) {
        let shape = layout.shape_of(stage);
        let tables = &self.stages[stage.index()];

        let buffer_infos = tables.uniform_buffers[..shape.uniform_buffer_count as usize]
            .iter()
            .map(|slot| {
                vk::DescriptorBufferInfo::default().buffer(slot.buffer).offset(slot.offset).range(slot.range)
            })
            .collect::<Vec<_>>();
        let sampled_infos = tables.sampled_images[..shape.sampled_image_count as usize]
            .iter()
            .map(|slot| vk::DescriptorImageInfo::default().image_view(slot.view).image_layout(slot.layout))
            .collect::<Vec<_>>();
        let storage_infos = tables.storage_images[..shape.storage_image_count as usize]
            .iter()
            .map(|slot| vk::DescriptorImageInfo::default().image_view(slot.view).image_layout(slot.layout))
            .collect::<Vec<_>>();
        let sampler_infos = tables.samplers[..shape.sampler_count as usize]
            .iter()
            .map(|slot| vk::DescriptorImageInfo::default().sampler(slot.sampler))
            .collect::<Vec<_>>();

        let mut writes = Vec::with_capacity(4);
        if !buffer_infos.is_empty() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_UNIFORM_BUFFER)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_infos),
            );
        }
        if !sampled_infos.is_empty() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_SAMPLED_IMAGE)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&sampled_infos),
            );
        }
        if !storage_infos.is_empty() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_STORAGE_IMAGE)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&storage_infos),
            );
        }
        if !sampler_infos.is_empty() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_SAMPLER)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&sampler_infos),
            );
        }

        unsafe {
            rhi.device.update_descriptor_sets(&writes, &[]);
        }
    }
}

// getters
impl DescriptorCache {
    #[inline]
    pub fn is_stage_dirty(&self, stage: ShaderVisibility) -> bool {
        self.dirty[stage.index()]
    }

    #[inline]
    pub fn any_stage_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    use crate::binding_layout::BindingTableShape;

    fn test_nulls() -> NullViews {
        NullViews {
            uniform_buffer: vk::Buffer::from_raw(100),
            uniform_buffer_range: 256,
            sampled_image: vk::ImageView::from_raw(101),
            storage_image: vk::ImageView::from_raw(102),
            sampler: vk::Sampler::from_raw(103),
        }
    }

    fn graphics_signature() -> BindingLayoutSignature {
        let mut sig = BindingLayoutSignature::default();
        sig[ShaderVisibility::Vertex.index()] = BindingTableShape {
            uniform_buffer_count: 2,
            ..Default::default()
        };
        sig[ShaderVisibility::Fragment.index()] = BindingTableShape {
            uniform_buffer_count: 1,
            sampled_image_count: 4,
            sampler_count: 1,
            ..Default::default()
        };
        sig
    }

    #[test]
    fn test_fresh_cache_is_all_dirty() {
        let cache = DescriptorCache::with_null_views(test_nulls());
        for stage in ShaderVisibility::ALL {
            assert!(cache.is_stage_dirty(stage));
        }
    }

    #[test]
    fn test_commit_clears_only_requested_dirty_stages() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        let sig = graphics_signature();

        let committed = cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);
        assert_eq!(committed, vec![ShaderVisibility::Vertex, ShaderVisibility::Fragment]);

        // graphics stage 已经干净，compute/rt 仍然是脏的
        assert!(!cache.is_stage_dirty(ShaderVisibility::Vertex));
        assert!(!cache.is_stage_dirty(ShaderVisibility::Fragment));
        assert!(cache.is_stage_dirty(ShaderVisibility::Compute));
        assert!(cache.is_stage_dirty(ShaderVisibility::RayTracing));
    }

    #[test]
    fn test_clean_stage_produces_no_copy() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        let sig = graphics_signature();

        cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);
        // 第二次 commit 没有任何变化，不应该有 stage 需要拷贝
        let committed = cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);
        assert!(committed.is_empty());
    }

    #[test]
    fn test_rebinding_same_view_keeps_stage_clean() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        let sig = graphics_signature();
        let view = vk::ImageView::from_raw(7);

        cache.set_sampled_image(ShaderVisibility::Fragment, 0, view);
        cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);

        // 重复绑定同一个 view 不打脏标记
        cache.set_sampled_image(ShaderVisibility::Fragment, 0, view);
        assert!(!cache.is_stage_dirty(ShaderVisibility::Fragment));

        // 换一个 view 就会变脏
        cache.set_sampled_image(ShaderVisibility::Fragment, 0, vk::ImageView::from_raw(8));
        assert!(cache.is_stage_dirty(ShaderVisibility::Fragment));
    }

    #[test]
    fn test_layout_without_table_skips_dirty_stage() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        // vertex stage 在布局中没有 table
        let mut sig = BindingLayoutSignature::default();
        sig[ShaderVisibility::Fragment.index()] = BindingTableShape {
            sampled_image_count: 1,
            ..Default::default()
        };

        let committed = cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);
        assert_eq!(committed, vec![ShaderVisibility::Fragment]);
        // 没有 table 的 stage 保持脏标记，换一个有 table 的布局时仍然会提交
        assert!(cache.is_stage_dirty(ShaderVisibility::Vertex));
    }

    #[test]
    fn test_finish_frame_leaves_no_dirty_stage() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        cache.set_sampled_image(ShaderVisibility::Fragment, 0, vk::ImageView::from_raw(7));

        cache.finish_frame();
        assert!(!cache.any_stage_dirty());
    }

    #[test]
    fn test_reset_marks_all_dirty_and_rebinds_null() {
        let mut cache = DescriptorCache::with_null_views(test_nulls());
        let sig = graphics_signature();

        cache.set_sampled_image(ShaderVisibility::Fragment, 0, vk::ImageView::from_raw(7));
        cache.take_dirty_stages(&ShaderVisibility::GRAPHICS, &sig);

        cache.reset();
        for stage in ShaderVisibility::ALL {
            assert!(cache.is_stage_dirty(stage));
        }
        // reset 之后槽位回到 null view
        let nulls = test_nulls();
        assert_eq!(
            cache.stages[ShaderVisibility::Fragment.index()].sampled_images[0],
            ImageSlot {
                view: nulls.sampled_image,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            }
        );
    }
}
