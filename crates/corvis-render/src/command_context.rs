//! 命令录制的 context
//!
//! 持有 FIF_COUNT 个 CommandBatch（按帧轮转）、一条 timeline semaphore
//! （单调递增的 fence 值）、descriptor cache 和 barrier batcher。
//! 状态机：Idle -> Recording (begin) -> Submitted (end) -> Idle。
//!
//! 录制是单线程的：同一个 context 不允许并发录制；
//! 执行在 GPU timeline 上异步进行，CPU 只在 begin 的背压等待和
//! flush/销毁路径上阻塞。

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;

use corvis_rhi::core::buffer::RhiBuffer;
use corvis_rhi::core::command_buffer::RhiCommandBuffer;
use corvis_rhi::core::command_queue::RhiSubmitInfo;
use corvis_rhi::core::image::RhiImage2D;
use corvis_rhi::core::resource_state::{RhiBufferState, RhiImageState};
use corvis_rhi::core::synchronize::RhiSemaphore;
use corvis_rhi::rhi::Rhi;

use crate::barrier_batcher::BarrierBatcher;
use crate::binding_layout::BindingLayout;
use crate::command_batch::CommandBatch;
use crate::descriptor_cache::DescriptorCache;
use crate::frame_counter::FrameCounter;
use crate::ray_tracing::ShaderBindingTable;

/// begin 的背压等待上限
const FENCE_WAIT_TIMEOUT_NS: u64 = 30 * 1000 * 1000 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextState {
    Idle,
    Recording,
}

/// fence 值的环形记账，不接触任何设备对象
///
/// 每个 batch 槽位记住上一次使用时 signal 的值；
/// 重用槽位之前必须等 timeline 到达那个值，这就把 in-flight
/// 的帧数限制在了环的深度上
struct FenceRing {
    /// 下一个要 signal 的 fence 值，从 1 开始（timeline 初始值是 0）
    next_value: u64,
    /// 每个槽位上一次 signal 的值，0 表示从未使用
    pending: Vec<u64>,
}

impl FenceRing {
    fn new(depth: usize) -> Self {
        Self {
            next_value: 1,
            pending: vec![0; depth],
        }
    }

    /// 重用槽位之前需要等待的 fence 值，0 表示无需等待
    #[inline]
    fn wait_value(&self, slot: usize) -> u64 {
        self.pending[slot]
    }

    /// 为槽位产生新的 fence 值
    #[inline]
    fn signal_value(&mut self, slot: usize) -> u64 {
        let value = self.next_value;
        self.pending[slot] = value;
        self.next_value += 1;
        value
    }

    /// 为同步 flush 产生 fence 值，不占用任何槽位
    #[inline]
    fn flush_value(&mut self) -> u64 {
        let value = self.next_value;
        self.next_value += 1;
        value
    }

    /// flush 等待完成之后，所有槽位都不再需要等待
    #[inline]
    fn clear(&mut self) {
        self.pending.fill(0);
    }
}

/// 顶点流/索引流的直接绑定状态，同样走脏标记，draw 时直接提交
#[derive(Default)]
struct GeometryBindings {
    vertex_buffers: Vec<(vk::Buffer, vk::DeviceSize)>,
    vertex_dirty: bool,

    index_buffer: Option<(vk::Buffer, vk::DeviceSize, vk::IndexType)>,
    index_dirty: bool,
}

impl GeometryBindings {
    fn reset(&mut self) {
        self.vertex_buffers.clear();
        self.vertex_dirty = false;
        self.index_buffer = None;
        self.index_dirty = false;
    }
}

/// render target 的绑定状态；硬件直接消费 view 句柄，不经过 descriptor 表
#[derive(Default)]
struct RenderTargetBindings {
    colors: Vec<vk::ImageView>,
    depth: Option<vk::ImageView>,
    extent: vk::Extent2D,
    dirty: bool,
    /// 当前是否处于 dynamic rendering 区间内
    active: bool,
}

impl RenderTargetBindings {
    fn reset(&mut self) {
        self.colors.clear();
        self.depth = None;
        self.extent = vk::Extent2D::default();
        self.dirty = false;
        self.active = false;
    }
}

pub struct CommandContext {
    batches: Vec<CommandBatch>,
    frame_counter: FrameCounter,
    fence_ring: FenceRing,

    /// 帧完成的 timeline semaphore，value 就是 FenceValue
    frame_timeline: RhiSemaphore,

    /// 当前正在录制的 command buffer，仅在 Recording 状态存在
    cmd: Option<RhiCommandBuffer>,

    descriptor_cache: DescriptorCache,
    barrier_batcher: BarrierBatcher,
    geometry: GeometryBindings,
    render_targets: RenderTargetBindings,

    state: ContextState,

    /// 上一次成功 resolve 的帧 GPU 耗时
    last_gpu_time_ns: Option<f64>,
}

// new & destroy
impl CommandContext {
    /// 创建失败时返回 None 并记录日志
    pub fn new(rhi: &Rhi) -> Option<Self> {
        let batches = FrameCounter::frame_labels()
            .iter()
            .map(|label| CommandBatch::new(rhi, &format!("batch-{}", label)))
            .collect::<Option<Vec<_>>>()?;

        let frame_timeline = RhiSemaphore::new_timeline(rhi, 0, "frame-timeline");
        let descriptor_cache = DescriptorCache::new(rhi)?;

        Some(Self {
            batches,
            frame_counter: FrameCounter::new(),
            fence_ring: FenceRing::new(FrameCounter::fif_count()),
            frame_timeline,
            cmd: None,
            descriptor_cache,
            barrier_batcher: BarrierBatcher::new(),
            geometry: GeometryBindings::default(),
            render_targets: RenderTargetBindings::default(),
            state: ContextState::Idle,
            last_gpu_time_ns: None,
        })
    }

    /// 需要在 GPU 空闲后调用
    pub fn destroy(mut self, rhi: &Rhi) {
        self.flush(rhi);
        self.frame_timeline.destroy();
    }
}

// begin / end / flush
impl CommandContext {
    /// 选择下一个 batch 并开始录制
    ///
    /// batch 上一次使用的 fence 值还没到达时在这里阻塞，
    /// 这把 in-flight 的帧数限制在 ring 深度内并提供背压
    pub fn begin_frame(&mut self, rhi: &Rhi) {
        assert_eq!(self.state, ContextState::Idle, "begin_frame called while recording");

        let slot = *self.frame_counter.frame_label();

        // 背压等待
        {
            let _span = tracy_client::span!("CommandContext::wait_fence");
            let wait_value = self.fence_ring.wait_value(slot);
            if wait_value > 0 {
                self.frame_timeline.wait_timeline(wait_value, FENCE_WAIT_TIMEOUT_NS);
            }
        }

        // batch 的 fence 已经到达，上一次写入的时间戳可以读取了
        self.resolve_timestamps(rhi, slot);

        self.batches[slot].reset();

        let frame_name = self.frame_counter.frame_name();
        let cmd = self.batches[slot].alloc_command_buffer(rhi, &format!("{}main", frame_name));
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, &frame_name);

        self.batches[slot].timestamp_pool.reset(0, 2);
        cmd.cmd_write_timestamp(vk::PipelineStageFlags::TOP_OF_PIPE, &self.batches[slot].timestamp_pool, 0);

        self.cmd = Some(cmd);

        // 所有绑定状态回到 all-dirty
        self.descriptor_cache.reset();
        self.geometry.reset();
        self.render_targets.reset();

        self.state = ContextState::Recording;
    }

    /// 结束录制并提交，signal 新的 fence 值，回到 Idle
    pub fn end_frame(&mut self, rhi: &Rhi) {
        assert_eq!(self.state, ContextState::Recording, "end_frame called without begin_frame");
        let _span = tracy_client::span!("CommandContext::end_frame");

        self.end_rendering_if_active();
        let cmd = self.cmd.take().unwrap();
        self.barrier_batcher.flush(&cmd);

        let slot = *self.frame_counter.frame_label();
        cmd.cmd_write_timestamp(vk::PipelineStageFlags::BOTTOM_OF_PIPE, &self.batches[slot].timestamp_pool, 1);
        cmd.end();

        let fence_value = self.fence_ring.signal_value(slot);
        self.batches[slot].last_fence_value = fence_value;

        let submit_info = RhiSubmitInfo::new(&[cmd]).signal(
            &self.frame_timeline,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            Some(fence_value),
        );
        rhi.graphics_queue.submit(vec![submit_info], None);

        self.descriptor_cache.finish_frame();
        self.state = ContextState::Idle;
        self.frame_counter.next_frame();
    }

    /// 同步栅栏：立刻 signal 并等待 fence，然后重置所有 batch
    ///
    /// 用于 resize/销毁一类的路径，不要在逐帧逻辑里调用
    pub fn flush(&mut self, rhi: &Rhi) {
        assert_eq!(self.state, ContextState::Idle, "flush called while recording");

        let flush_value = self.fence_ring.flush_value();
        let submit_info = RhiSubmitInfo::new(&[]).signal(
            &self.frame_timeline,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            Some(flush_value),
        );
        rhi.graphics_queue.submit(vec![submit_info], None);
        self.frame_timeline.wait_timeline(flush_value, FENCE_WAIT_TIMEOUT_NS);

        for batch in &mut self.batches {
            batch.reset();
        }
        self.fence_ring.clear();
        self.clear_state();
    }

    /// 丢弃全部 CPU 侧的绑定与 barrier 状态
    pub fn clear_state(&mut self) {
        self.descriptor_cache.reset();
        self.barrier_batcher.clear();
        self.geometry.reset();
        self.render_targets.reset();
    }

    fn resolve_timestamps(&mut self, rhi: &Rhi, slot: usize) {
        if self.batches[slot].last_fence_value == 0 {
            return;
        }
        if let Some(stamps) = self.batches[slot].timestamp_pool.try_get_query_result::<u64>(0, 2) {
            let period = rhi.physical_device.basic_props.limits.timestamp_period as f64;
            self.last_gpu_time_ns = Some((stamps[1].saturating_sub(stamps[0])) as f64 * period);
        }
    }
}

// 状态转换
impl CommandContext {
    /// 记录一次 image 状态转换，调用者负责保证 before 与真实状态一致
    #[inline]
    pub fn transition_image(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        before: RhiImageState,
        after: RhiImageState,
    ) {
        self.barrier_batcher.transition_image(image, aspect, before, after);
    }

    /// 记录一次 buffer 状态转换，调用者负责保证 before 与真实状态一致
    #[inline]
    pub fn transition_buffer(&mut self, buffer: vk::Buffer, before: RhiBufferState, after: RhiBufferState) {
        self.barrier_batcher.transition_buffer(buffer, before, after);
    }
}

// 绑定
impl CommandContext {
    #[inline]
    pub fn descriptor_cache_mut(&mut self) -> &mut DescriptorCache {
        &mut self.descriptor_cache
    }

    pub fn set_vertex_buffers(&mut self, buffers: &[(vk::Buffer, vk::DeviceSize)]) {
        if self.geometry.vertex_buffers != buffers {
            self.geometry.vertex_buffers = buffers.to_vec();
            self.geometry.vertex_dirty = true;
        }
    }

    pub fn set_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        let binding = Some((buffer, offset, index_type));
        if self.geometry.index_buffer != binding {
            self.geometry.index_buffer = binding;
            self.geometry.index_dirty = true;
        }
    }

    /// 绑定 render target；真正的 begin rendering 推迟到 draw
    pub fn set_render_targets(&mut self, colors: &[vk::ImageView], depth: Option<vk::ImageView>, extent: vk::Extent2D) {
        if self.render_targets.colors != colors
            || self.render_targets.depth != depth
            || self.render_targets.extent != extent
        {
            self.render_targets.colors = colors.to_vec();
            self.render_targets.depth = depth;
            self.render_targets.extent = extent;
            self.render_targets.dirty = true;
        }
    }

    #[inline]
    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.active_cmd().cmd_bind_pipeline(bind_point, pipeline);
    }

    #[inline]
    pub fn push_constants(&self, layout: &BindingLayout, stages: vk::ShaderStageFlags, data: &[u8]) {
        self.active_cmd().cmd_push_constants(layout.pipeline_layout(), stages, 0, data);
    }
}

// draw / dispatch / trace
impl CommandContext {
    /// 顶点数或实例数为 0 时是防御性的 no-op
    pub fn draw(&mut self, rhi: &Rhi, layout: &BindingLayout, vertex_count: u32, first_vertex: u32) {
        if vertex_count == 0 {
            return;
        }
        self.pre_draw(rhi, layout);
        self.active_cmd().cmd_draw(vertex_count, 1, first_vertex, 0);
    }

    /// 索引数为 0 时是防御性的 no-op
    pub fn draw_indexed(&mut self, rhi: &Rhi, layout: &BindingLayout, index_count: u32, first_index: u32) {
        if index_count == 0 {
            return;
        }
        self.pre_draw(rhi, layout);
        self.active_cmd().draw_indexed(index_count, first_index, 1, 0, 0);
    }

    /// 任意一个维度为 0 时是防御性的 no-op
    pub fn dispatch(&mut self, rhi: &Rhi, layout: &BindingLayout, group_counts: [u32; 3]) {
        if group_counts.iter().any(|cnt| *cnt == 0) {
            return;
        }
        self.assert_recording();

        self.end_rendering_if_active();
        let cmd = self.cmd.as_ref().unwrap();
        self.barrier_batcher.flush(cmd);

        let slot = *self.frame_counter.frame_label();
        let cmd = self.cmd.clone().unwrap();
        self.descriptor_cache.commit_compute(rhi, &cmd, &mut self.batches[slot], layout);

        cmd.cmd_dispatch(group_counts[0], group_counts[1], group_counts[2]);
    }

    /// 任意一个维度为 0 时是防御性的 no-op
    pub fn trace_rays(&mut self, rhi: &Rhi, layout: &BindingLayout, sbt: &ShaderBindingTable, thread_size: [u32; 3]) {
        if thread_size.iter().any(|cnt| *cnt == 0) {
            return;
        }
        self.assert_recording();

        self.end_rendering_if_active();
        let cmd = self.cmd.clone().unwrap();
        self.barrier_batcher.flush(&cmd);

        let slot = *self.frame_counter.frame_label();
        self.descriptor_cache.commit_ray_tracing(rhi, &cmd, &mut self.batches[slot], layout);

        cmd.trace_rays(
            &sbt.raygen_region(),
            &sbt.miss_region(),
            &sbt.hit_region(),
            &sbt.callable_region(),
            thread_size,
        );
    }

    /// 把 image 清为指定颜色
    ///
    /// 调用者保证 image 已经（或已经通过 batcher 请求）处于 TRANSFER_DST
    pub fn clear_color_image(&mut self, image: vk::Image, color: [f32; 4]) {
        self.assert_recording();

        self.end_rendering_if_active();
        let cmd = self.cmd.as_ref().unwrap();
        self.barrier_batcher.flush(cmd);

        cmd.cmd_clear_color_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearColorValue { float32: color },
            &[vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            }],
        );
    }

    /// draw 之前的统一序列：flush barrier -> 提交脏 descriptor ->
    /// 提交脏的 vertex/index/render target 绑定
    fn pre_draw(&mut self, rhi: &Rhi, layout: &BindingLayout) {
        self.assert_recording();

        // barrier 不能出现在 rendering 区间内；render target 变化也需要重新 begin
        if !self.barrier_batcher.is_empty() || self.render_targets.dirty {
            self.end_rendering_if_active();
        }
        let cmd = self.cmd.clone().unwrap();
        self.barrier_batcher.flush(&cmd);

        let slot = *self.frame_counter.frame_label();
        self.descriptor_cache.commit_graphics(rhi, &cmd, &mut self.batches[slot], layout);

        self.begin_rendering_if_needed(&cmd);

        if self.geometry.vertex_dirty && !self.geometry.vertex_buffers.is_empty() {
            let buffers = self.geometry.vertex_buffers.iter().map(|(b, _)| *b).collect_vec();
            let offsets = self.geometry.vertex_buffers.iter().map(|(_, o)| *o).collect_vec();
            cmd.cmd_bind_vertex_buffers(0, &buffers, &offsets);
            self.geometry.vertex_dirty = false;
        }
        if self.geometry.index_dirty {
            if let Some((buffer, offset, index_type)) = self.geometry.index_buffer {
                cmd.cmd_bind_index_buffer(buffer, offset, index_type);
            }
            self.geometry.index_dirty = false;
        }
    }

    fn begin_rendering_if_needed(&mut self, cmd: &RhiCommandBuffer) {
        if self.render_targets.active && !self.render_targets.dirty {
            return;
        }
        debug_assert!(!self.render_targets.colors.is_empty() || self.render_targets.depth.is_some());

        let color_attachments = self
            .render_targets
            .colors
            .iter()
            .map(|view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(*view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
            })
            .collect_vec();
        let depth_attachment = self.render_targets.depth.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.render_targets.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        cmd.cmd_begin_rendering(&rendering_info);
        self.render_targets.active = true;
        self.render_targets.dirty = false;
    }

    fn end_rendering_if_active(&mut self) {
        if self.render_targets.active {
            self.cmd.as_ref().unwrap().end_rendering();
            self.render_targets.active = false;
        }
    }
}

// 数据上传
impl CommandContext {
    /// 把 data 写入 dst buffer：batch 一个到 copy-dest 的 transition，
    /// 从 uploader 线性分配 staging 区域，再录制 copy。
    /// dst 会挂到当前 batch 的保活列表上
    pub fn update_buffer(&mut self, rhi: &Rhi, dst: &Rc<RhiBuffer>, before: RhiBufferState, data: &[u8]) {
        self.assert_recording();
        debug_assert!(data.len() as vk::DeviceSize <= dst.size());

        self.transition_buffer(dst.handle(), before, RhiBufferState::TRANSFER_DST);

        self.end_rendering_if_active();
        let cmd = self.cmd.clone().unwrap();
        self.barrier_batcher.flush(&cmd);

        let slot = *self.frame_counter.frame_label();
        let Some(allocation) = self.batches[slot].uploader_mut().upload_bytes(rhi, data, 4) else {
            log::error!("update_buffer skipped: staging allocation failed");
            return;
        };

        cmd.cmd_copy_buffer_raw(
            allocation.buffer,
            dst.handle(),
            &[vk::BufferCopy {
                src_offset: allocation.offset,
                dst_offset: 0,
                size: data.len() as vk::DeviceSize,
            }],
        );

        self.batches[slot].retain_buffer(dst.clone());
    }

    /// 把整张 2D 纹理的数据写入 dst：staging 区域按照 row pitch 对齐逐行排布
    pub fn update_texture_2d(&mut self, rhi: &Rhi, dst: &Rc<RhiImage2D>, before: RhiImageState, data: &[u8]) {
        self.assert_recording();

        let width = dst.width();
        let height = dst.height();
        let texel_size = RhiImage2D::format_byte_count(dst.format()) as vk::DeviceSize;
        let src_row_pitch = width as vk::DeviceSize * texel_size;
        assert_eq!(data.len() as vk::DeviceSize, src_row_pitch * height as vk::DeviceSize);

        let dst_row_pitch = align_row_pitch(src_row_pitch, rhi.device.optimal_row_pitch_align());
        // buffer_row_length 以 texel 为单位，row pitch 必须能被 texel 大小整除
        debug_assert_eq!(dst_row_pitch % texel_size, 0);
        let staged = pack_rows(data, src_row_pitch as usize, dst_row_pitch as usize);

        self.transition_image(dst.handle(), vk::ImageAspectFlags::COLOR, before, RhiImageState::TRANSFER_DST);

        self.end_rendering_if_active();
        let cmd = self.cmd.clone().unwrap();
        self.barrier_batcher.flush(&cmd);

        let slot = *self.frame_counter.frame_label();
        let Some(allocation) =
            self.batches[slot].uploader_mut().upload_bytes(rhi, &staged, rhi.device.optimal_row_pitch_align())
        else {
            log::error!("update_texture_2d skipped: staging allocation failed");
            return;
        };

        let buffer_image_copy = vk::BufferImageCopy2::default()
            .buffer_offset(allocation.offset)
            // buffer_row_length 的单位是 texel
            .buffer_row_length((dst_row_pitch / texel_size) as u32)
            .buffer_image_height(0)
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            });
        cmd.cmd_copy_buffer_to_image(
            &vk::CopyBufferToImageInfo2::default()
                .src_buffer(allocation.buffer)
                .dst_image(dst.handle())
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .regions(std::slice::from_ref(&buffer_image_copy)),
        );

        self.batches[slot].retain_image(dst.clone());
    }

    /// [`Self::update_buffer`] 的泛型版本，接受 POD 切片
    #[inline]
    pub fn update_buffer_typed<T: bytemuck::NoUninit>(
        &mut self,
        rhi: &Rhi,
        dst: &Rc<RhiBuffer>,
        before: RhiBufferState,
        data: &[T],
    ) {
        self.update_buffer(rhi, dst, before, bytemuck::cast_slice(data));
    }

    /// 同步读回 buffer 的内容，用于验证和调试路径
    ///
    /// 内部会等待 GPU，不要在逐帧逻辑里调用
    pub fn read_buffer_sync(&mut self, rhi: &Rhi, src: &RhiBuffer, size: usize) -> Option<Vec<u8>> {
        assert_eq!(self.state, ContextState::Idle, "read_buffer_sync called while recording");

        let readback = RhiBuffer::new_readback_buffer(rhi, size as vk::DeviceSize, "read-back")?;
        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_graphics_command_pool.clone(),
            &rhi.graphics_queue,
            |cmd| {
                cmd.cmd_copy_buffer_raw(
                    src.handle(),
                    readback.handle(),
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: size as vk::DeviceSize,
                    }],
                );
            },
            "read-back",
        );
        Some(readback.read_back(size))
    }
}

// getters
impl CommandContext {
    #[inline]
    pub fn frame_label(&self) -> crate::frame_counter::FrameLabel {
        self.frame_counter.frame_label()
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.frame_id()
    }

    /// 上一次 resolve 出来的整帧 GPU 耗时
    #[inline]
    pub fn last_gpu_time_ns(&self) -> Option<f64> {
        self.last_gpu_time_ns
    }

    #[inline]
    pub fn barrier_batcher(&self) -> &BarrierBatcher {
        &self.barrier_batcher
    }

    #[inline]
    pub fn descriptor_cache(&self) -> &DescriptorCache {
        &self.descriptor_cache
    }

    /// 当前正在录制的 command buffer，用于这一层没有覆盖到的命令
    #[inline]
    pub fn active_cmd(&self) -> &RhiCommandBuffer {
        self.assert_recording();
        self.cmd.as_ref().unwrap()
    }

    #[inline]
    fn assert_recording(&self) {
        assert_eq!(self.state, ContextState::Recording, "command recorded outside begin/end");
    }
}

/// buffer -> image copy 的 row pitch 对齐
#[inline]
fn align_row_pitch(row_pitch: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(align.is_power_of_two());
    (row_pitch + align - 1) & !(align - 1)
}

/// 把紧密排布的像素行重新排布到 row pitch 对齐的 staging 布局
fn pack_rows(data: &[u8], src_row_pitch: usize, dst_row_pitch: usize) -> Vec<u8> {
    if src_row_pitch == dst_row_pitch {
        return data.to_vec();
    }

    let rows = data.len() / src_row_pitch;
    let mut staged = vec![0u8; rows * dst_row_pitch];
    for row in 0..rows {
        let src = &data[row * src_row_pitch..row * src_row_pitch + src_row_pitch];
        staged[row * dst_row_pitch..row * dst_row_pitch + src_row_pitch].copy_from_slice(src);
    }
    staged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_ring_first_round_needs_no_wait() {
        let ring = FenceRing::new(3);
        assert_eq!(ring.wait_value(0), 0);
        assert_eq!(ring.wait_value(1), 0);
        assert_eq!(ring.wait_value(2), 0);
    }

    #[test]
    fn test_fence_ring_backpressure_depth_3() {
        // ring 深度 3，跑 5 个 begin/end 周期：
        // 第 4 次 begin 必须等第 1 次 end 的值，而不是第 2/3 次的
        let mut ring = FenceRing::new(3);

        let mut signalled = Vec::new();
        for cycle in 0..5 {
            let slot = cycle % 3;
            let wait = ring.wait_value(slot);
            match cycle {
                0..=2 => assert_eq!(wait, 0, "first round must not wait"),
                3 => assert_eq!(wait, signalled[0], "4th begin waits on the 1st end"),
                4 => assert_eq!(wait, signalled[1], "5th begin waits on the 2nd end"),
                _ => unreachable!(),
            }
            signalled.push(ring.signal_value(slot));
        }

        // fence 值单调递增
        assert_eq!(signalled, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fence_ring_flush_value_skips_slots() {
        let mut ring = FenceRing::new(3);
        ring.signal_value(0);
        let flush = ring.flush_value();
        assert_eq!(flush, 2);
        // flush 不占用槽位
        assert_eq!(ring.wait_value(1), 0);

        ring.clear();
        assert_eq!(ring.wait_value(0), 0);
    }

    #[test]
    fn test_align_row_pitch() {
        assert_eq!(align_row_pitch(100, 256), 256);
        assert_eq!(align_row_pitch(256, 256), 256);
        assert_eq!(align_row_pitch(257, 256), 512);
        assert_eq!(align_row_pitch(4, 4), 4);
    }

    #[test]
    fn test_pack_rows_respects_row_pitch() {
        // 2x2 的 RGBA 图，每行 8 字节，对齐到 16 字节
        let data: Vec<u8> = (0u8..16).collect();
        let staged = pack_rows(&data, 8, 16);

        assert_eq!(staged.len(), 32);
        assert_eq!(&staged[0..8], &data[0..8]);
        assert_eq!(&staged[8..16], &[0u8; 8]);
        assert_eq!(&staged[16..24], &data[8..16]);
    }

    #[test]
    fn test_pack_rows_tight_layout_is_passthrough() {
        let data: Vec<u8> = (0u8..16).collect();
        let staged = pack_rows(&data, 8, 8);
        assert_eq!(staged, data);
    }
}
