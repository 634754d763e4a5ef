//! Ray Tracing 所需的加速结构

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;

use crate::{
    core::{buffer::RhiBuffer, command_buffer::RhiCommandBuffer, device::RhiDevice, query_pool::RhiQueryPool},
    rhi::Rhi,
};

pub struct RhiBlasInputInfo<'a> {
    pub geometry: vk::AccelerationStructureGeometryKHR<'a>,
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

/// 底层/顶层加速结构
///
/// result buffer 和 scratch buffer 只在首次 build 时分配，
/// 后续的 update 在原地重建，不会重新分配
pub struct RhiAcceleration {
    acceleration_structure: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,

    _buffer: RhiBuffer,
    /// update 需要复用，因此一直持有
    scratch_buffer: RhiBuffer,

    debug_name: String,

    device: Rc<RhiDevice>,
}

// 构建 BLAS
impl RhiAcceleration {
    /// 同步构建 blas
    ///
    /// 需要指定每个 geometry 的信息，以及每个 geometry 拥有的 max primitives 数量。
    /// 会自动添加 trace 的 flag；允许后续 update 时额外添加 ALLOW_UPDATE
    ///
    /// # 构建过程
    /// 1. 查询构建 blas 所需的尺寸
    /// 2. 分配 result buffer 和 scratch buffer
    /// 3. 构建 blas
    ///
    /// 创建失败时返回 None 并记录日志
    pub fn build_blas_sync(
        rhi: &Rhi,
        blas_inputs: &[RhiBlasInputInfo],
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        debug_name: impl AsRef<str>,
    ) -> Option<Self> {
        let geometries = blas_inputs.iter().map(|blas_input| blas_input.geometry).collect_vec();
        let range_infos = blas_inputs.iter().map(|blas_input| blas_input.range).collect_vec();
        let max_primitives = blas_inputs.iter().map(|blas_input| blas_input.range.primitive_count).collect_vec();

        let build_flags = build_flags | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;

        // 使用部分完整的 AccelerationStructureBuildGeometryInfo 来查询所需的资源大小
        let mut build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags)
            .geometries(&geometries)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);

        // blas 所需的尺寸信息
        let size_info = unsafe {
            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            rhi.device.vk_acceleration_struct_pf.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_geometry_info,
                &max_primitives, // 每一个 geometry 里面的最大 primitive 数量
                &mut size_info,
            );
            size_info
        };

        let acceleration = Self::new(
            rhi,
            size_info.acceleration_structure_size,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            build_flags,
            size_info.build_scratch_size,
            debug_name.as_ref(),
        )?;

        // 填充 build geometry info 的剩余部分以 build blas
        build_geometry_info.dst_acceleration_structure = acceleration.acceleration_structure;
        build_geometry_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: acceleration.scratch_buffer.device_address(),
        };

        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_compute_command_pool.clone(),
            &rhi.compute_queue,
            |cmd| {
                cmd.build_acceleration_structure(&build_geometry_info, &range_infos);
            },
            "build-blas",
        );

        Some(acceleration)
    }

    /// 同步构建 blas，build 完成后 compact 到更紧凑的加速结构中
    ///
    /// 适合静态的几何体；compact 之后的加速结构不支持 update
    ///
    /// # 构建过程
    /// 1. 查询构建 blas 所需的尺寸
    /// 2. 构建 blas
    /// 3. 查询 blas 的 compact size
    /// 4. 将 blas copy 到 compact 的 blas
    pub fn build_blas_compacted_sync(
        rhi: &Rhi,
        blas_inputs: &[RhiBlasInputInfo],
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        debug_name: impl AsRef<str>,
    ) -> Option<Self> {
        let geometries = blas_inputs.iter().map(|blas_input| blas_input.geometry).collect_vec();
        let range_infos = blas_inputs.iter().map(|blas_input| blas_input.range).collect_vec();
        let max_primitives = blas_inputs.iter().map(|blas_input| blas_input.range.primitive_count).collect_vec();

        let build_flags = build_flags
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
            | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;

        let mut build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags)
            .geometries(&geometries)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);

        let size_info = unsafe {
            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            rhi.device.vk_acceleration_struct_pf.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_geometry_info,
                &max_primitives,
                &mut size_info,
            );
            size_info
        };

        let uncompact_acceleration = Self::new(
            rhi,
            size_info.acceleration_structure_size,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            build_flags,
            size_info.build_scratch_size,
            &format!("{}-uncompact", debug_name.as_ref()),
        )?;

        build_geometry_info.dst_acceleration_structure = uncompact_acceleration.acceleration_structure;
        build_geometry_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: uncompact_acceleration.scratch_buffer.device_address(),
        };

        // 创建一个 QueryPool，用于查询 compact size
        let mut query_pool = RhiQueryPool::new(rhi, vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR, 1, "");
        query_pool.reset(0, 1);

        // 等待初步 build 完成
        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_compute_command_pool.clone(),
            &rhi.compute_queue,
            |cmd| {
                cmd.build_acceleration_structure(&build_geometry_info, &range_infos);
                // 查询 compact size 属于 read 操作，需要同步
                cmd.memory_barrier(std::slice::from_ref(&vk::MemoryBarrier2 {
                    src_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    src_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                    dst_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                    ..Default::default()
                }));
                cmd.write_acceleration_structure_properties(
                    &mut query_pool,
                    0,
                    std::slice::from_ref(&build_geometry_info.dst_acceleration_structure),
                );
            },
            "build-blas",
        );

        // 提供更紧凑的 acceleration
        let compact_size: Vec<vk::DeviceSize> = query_pool.get_query_result(0, 1);
        let compact_acceleration = Self::new(
            rhi,
            compact_size[0],
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            build_flags,
            // compact 之后不会再 build，不需要完整的 scratch
            0,
            &format!("{}-compact", debug_name.as_ref()),
        )?;

        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_compute_command_pool.clone(),
            &rhi.compute_queue,
            |cmd| {
                cmd.cmd_copy_acceleration_structure(
                    &vk::CopyAccelerationStructureInfoKHR::default()
                        .src(uncompact_acceleration.acceleration_structure)
                        .dst(compact_acceleration.acceleration_structure)
                        .mode(vk::CopyAccelerationStructureModeKHR::COMPACT),
                );
            },
            "compact-blas",
        );

        // 回收临时资源
        {
            uncompact_acceleration.destroy();
            query_pool.destroy();
        }

        Some(compact_acceleration)
    }

    /// 在原地重建 blas，复用 result buffer 和 scratch buffer
    ///
    /// 调用者需要保证 geometry 的数量和尺寸与首次 build 一致
    pub fn update_blas_sync(&self, rhi: &Rhi, blas_inputs: &[RhiBlasInputInfo]) {
        debug_assert_eq!(self.ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let geometries = blas_inputs.iter().map(|blas_input| blas_input.geometry).collect_vec();
        let range_infos = blas_inputs.iter().map(|blas_input| blas_input.range).collect_vec();

        let mut build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.build_flags)
            .geometries(&geometries)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);
        build_geometry_info.dst_acceleration_structure = self.acceleration_structure;
        build_geometry_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: self.scratch_buffer.device_address(),
        };

        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_compute_command_pool.clone(),
            &rhi.compute_queue,
            |cmd| {
                cmd.build_acceleration_structure(&build_geometry_info, &range_infos);
            },
            "update-blas",
        );
    }
}

// 构建 TLAS
impl RhiAcceleration {
    /// 同步构建 tlas
    ///
    /// # 构建过程
    /// 1. 上传 instance 数据
    /// 2. 查询构建 tlas 所需的尺寸
    /// 3. 构建 tlas
    ///
    /// 创建失败时返回 None 并记录日志
    pub fn build_tlas_sync(
        rhi: &Rhi,
        instances: &[vk::AccelerationStructureInstanceKHR],
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        debug_name: impl AsRef<str>,
    ) -> Option<Self> {
        let mut acceleration_instance_buffer = RhiBuffer::new_acceleration_instance_buffer(
            rhi,
            size_of_val(instances) as vk::DeviceSize,
            format!("{}-acceleration-instance-buffer", debug_name.as_ref()),
        )?;
        acceleration_instance_buffer.transfer_data_sync(rhi, instances);

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    // true: data 是 &[&vk::AccelerationStructureInstanceKHR]
                    // false: data 是 &[vk::AccelerationStructureInstanceKHR]
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: acceleration_instance_buffer.device_address(),
                    }),
            });
        let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instances.len() as u32);

        let build_flags = build_flags | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;

        let mut build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(build_flags)
            .geometries(std::slice::from_ref(&geometry));

        // 获得 AccelerationStructure 所需的尺寸
        let size_info = unsafe {
            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            rhi.device.vk_acceleration_struct_pf.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_geometry_info,
                &[instances.len() as u32],
                &mut size_info,
            );

            size_info
        };

        let acceleration = Self::new(
            rhi,
            size_info.acceleration_structure_size,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            build_flags,
            size_info.build_scratch_size,
            debug_name.as_ref(),
        )?;

        // 补全剩下的 build info
        build_geometry_info.dst_acceleration_structure = acceleration.acceleration_structure;
        build_geometry_info.scratch_data.device_address = acceleration.scratch_buffer.device_address();

        // 正式构建 TLAS
        RhiCommandBuffer::one_time_exec(
            rhi,
            rhi.temp_compute_command_pool.clone(),
            &rhi.compute_queue,
            |cmd| {
                cmd.build_acceleration_structure(&build_geometry_info, std::slice::from_ref(&range_info));
            },
            "build-tlas",
        );

        Some(acceleration)
    }
}

// 创建与销毁
impl RhiAcceleration {
    /// 创建 AccelerationStructure 以及 result/scratch buffer
    fn new(
        rhi: &Rhi,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        scratch_size: vk::DeviceSize,
        debug_name: &str,
    ) -> Option<Self> {
        let buffer = RhiBuffer::new_acceleration_buffer(rhi, size as usize, debug_name)?;
        // scratch 的最小尺寸不会是 0，这里用 1 占位避免无效 buffer
        let scratch_buffer = RhiBuffer::new_acceleration_scratch_buffer(
            rhi,
            scratch_size.max(1),
            format!("{}-scratch-buffer", debug_name),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default() //
            .ty(ty)
            .size(size)
            .buffer(buffer.handle());

        let acceleration_structure = unsafe {
            match rhi.device.vk_acceleration_struct_pf.create_acceleration_structure(&create_info, None) {
                Ok(handle) => handle,
                Err(err) => {
                    log::error!("failed to create acceleration structure {}: {}", debug_name, err);
                    return None;
                }
            }
        };
        rhi.device.debug_utils().set_object_debug_name(acceleration_structure, debug_name);

        Some(Self {
            device: rhi.device.clone(),
            acceleration_structure,
            ty,
            build_flags,
            _buffer: buffer,
            scratch_buffer,
            debug_name: debug_name.to_string(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[inline]
    pub fn get_device_address(&self) -> vk::DeviceAddress {
        unsafe {
            self.device.vk_acceleration_struct_pf.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(self.acceleration_structure),
            )
        }
    }

    #[inline]
    pub fn destroy(self) {
        drop(self)
    }
}
impl Drop for RhiAcceleration {
    fn drop(&mut self) {
        unsafe {
            self.device.vk_acceleration_struct_pf.destroy_acceleration_structure(self.acceleration_structure, None);
        }
    }
}
