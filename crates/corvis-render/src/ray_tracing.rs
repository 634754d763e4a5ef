//! 加速结构的构建描述与 shader binding table 的组装
//!
//! SBT 是定长 record 的数组：每个 record = shader group 的 handle +
//! 最多 4 个来自该 export 局部绑定布局的 root pointer（buffer 地址）。
//! record 按 raygen | miss | hit 三个 region 连续排布，
//! 以 (address, size, stride) 的形式交给 trace rays。

use ash::vk;

use corvis_rhi::core::acceleration::{RhiAcceleration, RhiBlasInputInfo};
use corvis_rhi::core::buffer::RhiSBTBuffer;
use corvis_rhi::rhi::Rhi;

/// 每个 record 里局部 root pointer 的数量上限
pub const MAX_LOCAL_ROOT_POINTERS: usize = 4;

/// round x up to a multiple of align
///
/// * align must be a power of 2
#[inline]
fn align_up(x: u32, align: u32) -> u32 {
    (x + (align - 1)) & !(align - 1)
}

/// 三角形几何的构建描述，数据已经在 GPU buffer 中
pub struct BlasGeometry {
    pub vertex_buffer_addr: vk::DeviceAddress,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,

    pub index_buffer_addr: vk::DeviceAddress,
    pub index_count: u32,
}

impl BlasGeometry {
    fn to_input(&self) -> RhiBlasInputInfo<'static> {
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(self.vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.vertex_buffer_addr,
                    })
                    .vertex_stride(self.vertex_stride)
                    .max_vertex(self.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.index_buffer_addr,
                    }),
            });
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.index_count / 3);
        RhiBlasInputInfo { geometry, range }
    }
}

/// TLAS 的 instance 描述：transform + BLAS 引用 + mask/flags
pub struct TlasInstance {
    pub transform: glam::Mat4,
    pub blas_address: vk::DeviceAddress,
    pub instance_id: u32,
    pub mask: u8,
    pub hit_group_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl TlasInstance {
    fn to_vk(&self) -> vk::AccelerationStructureInstanceKHR {
        // vk 的 transform 是 3x4 的 row-major 矩阵
        let m = self.transform.transpose();
        let rows = [m.x_axis, m.y_axis, m.z_axis];
        let mut matrix = [0.0f32; 12];
        for (row_idx, row) in rows.iter().enumerate() {
            matrix[row_idx * 4..row_idx * 4 + 4].copy_from_slice(&row.to_array());
        }

        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.instance_id, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.hit_group_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// 加速结构构建的入口
pub struct RayTracingBuilder;

impl RayTracingBuilder {
    /// 构建 bottom-level 加速结构；result/scratch buffer 只分配一次，
    /// 后续通过 [`RhiAcceleration::update_blas_sync`] 原地重建
    pub fn build_blas(
        rhi: &Rhi,
        geometries: &[BlasGeometry],
        debug_name: impl AsRef<str>,
    ) -> Option<RhiAcceleration> {
        let inputs = geometries.iter().map(|g| g.to_input()).collect::<Vec<_>>();
        RhiAcceleration::build_blas_sync(
            rhi,
            &inputs,
            vk::BuildAccelerationStructureFlagsKHR::empty(),
            debug_name,
        )
    }

    /// 静态几何体的 compact 构建
    pub fn build_blas_compacted(
        rhi: &Rhi,
        geometries: &[BlasGeometry],
        debug_name: impl AsRef<str>,
    ) -> Option<RhiAcceleration> {
        let inputs = geometries.iter().map(|g| g.to_input()).collect::<Vec<_>>();
        RhiAcceleration::build_blas_compacted_sync(
            rhi,
            &inputs,
            vk::BuildAccelerationStructureFlagsKHR::empty(),
            debug_name,
        )
    }

    /// 原地重建 blas，几何数量和尺寸需要与首次 build 一致
    pub fn update_blas(rhi: &Rhi, blas: &RhiAcceleration, geometries: &[BlasGeometry]) {
        let inputs = geometries.iter().map(|g| g.to_input()).collect::<Vec<_>>();
        blas.update_blas_sync(rhi, &inputs);
    }

    /// 构建 top-level 加速结构：上传 instance 数组之后 build
    pub fn build_tlas(
        rhi: &Rhi,
        instances: &[TlasInstance],
        debug_name: impl AsRef<str>,
    ) -> Option<RhiAcceleration> {
        let vk_instances = instances.iter().map(|i| i.to_vk()).collect::<Vec<_>>();
        RhiAcceleration::build_tlas_sync(
            rhi,
            &vk_instances,
            vk::BuildAccelerationStructureFlagsKHR::empty(),
            debug_name,
        )
    }
}

/// 一个 ray tracing export（raygen / miss / hit group）的 SBT 描述
///
/// local_tables 是该 export 局部绑定布局解析出来的 buffer 地址，
/// 会被打包到 record 的 handle 之后；用不到的位置保持 0
pub struct SbtExport {
    pub name: String,
    pub local_tables: [vk::DeviceAddress; MAX_LOCAL_ROOT_POINTERS],
}

impl SbtExport {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            local_tables: [0; MAX_LOCAL_ROOT_POINTERS],
        }
    }

    pub fn with_local_tables(mut self, tables: &[vk::DeviceAddress]) -> Self {
        assert!(tables.len() <= MAX_LOCAL_ROOT_POINTERS, "an export carries at most 4 local root pointers");
        self.local_tables[..tables.len()].copy_from_slice(tables);
        self
    }
}

/// SBT 的尺寸布局，全部在 CPU 侧算出
///
/// - record stride = align(handle size + 4 个 root pointer, handle alignment)
/// - 每个 region 的起始位置对齐到 shader_group_base_alignment
/// - raygen region 只有一个 record，vk 要求其 stride == size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub record_stride: u32,

    pub raygen_region_size: u32,
    pub miss_region_size: u32,
    pub hit_region_size: u32,

    pub miss_count: u32,
    pub hit_count: u32,
}

impl SbtLayout {
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32, miss_count: u32, hit_count: u32) -> Self {
        let pointer_bytes = (MAX_LOCAL_ROOT_POINTERS * size_of::<vk::DeviceAddress>()) as u32;
        let record_stride = align_up(handle_size + pointer_bytes, handle_alignment);

        // 每一个 region 需要使用 base align 进行对齐
        let raygen_region_size = align_up(record_stride, base_alignment);
        let miss_region_size = align_up(miss_count * record_stride, base_alignment);
        let hit_region_size = align_up(hit_count * record_stride, base_alignment);

        Self {
            handle_size,
            record_stride,
            raygen_region_size,
            miss_region_size,
            hit_region_size,
            miss_count,
            hit_count,
        }
    }

    #[inline]
    pub fn total_size(&self) -> u32 {
        self.raygen_region_size + self.miss_region_size + self.hit_region_size
    }

    #[inline]
    pub fn raygen_offset(&self) -> u32 {
        0
    }

    #[inline]
    pub fn miss_offset(&self) -> u32 {
        self.raygen_region_size
    }

    #[inline]
    pub fn hit_offset(&self) -> u32 {
        self.raygen_region_size + self.miss_region_size
    }
}

/// 把 shader group handle 和局部 root pointer 打包成 SBT 的内容
///
/// handle_data 是 pipeline 返回的连续 handle 数组，
/// group 的顺序约定为：raygen，misses...，hits...
fn pack_sbt(layout: &SbtLayout, handle_data: &[u8], raygen: &SbtExport, misses: &[SbtExport], hits: &[SbtExport]) -> Vec<u8> {
    debug_assert_eq!(misses.len() as u32, layout.miss_count);
    debug_assert_eq!(hits.len() as u32, layout.hit_count);

    let handle_size = layout.handle_size as usize;
    let group_count = 1 + misses.len() + hits.len();
    debug_assert_eq!(handle_data.len(), group_count * handle_size);

    let mut data = vec![0u8; layout.total_size() as usize];

    let mut write_record = |dst_offset: usize, group_idx: usize, export: &SbtExport| {
        let handle = &handle_data[group_idx * handle_size..(group_idx + 1) * handle_size];
        data[dst_offset..dst_offset + handle_size].copy_from_slice(handle);

        let pointer_base = dst_offset + handle_size;
        for (ptr_idx, addr) in export.local_tables.iter().enumerate() {
            let ptr_offset = pointer_base + ptr_idx * size_of::<vk::DeviceAddress>();
            data[ptr_offset..ptr_offset + size_of::<vk::DeviceAddress>()].copy_from_slice(&addr.to_le_bytes());
        }
    };

    write_record(layout.raygen_offset() as usize, 0, raygen);
    for (idx, miss) in misses.iter().enumerate() {
        write_record(layout.miss_offset() as usize + idx * layout.record_stride as usize, 1 + idx, miss);
    }
    for (idx, hit) in hits.iter().enumerate() {
        write_record(
            layout.hit_offset() as usize + idx * layout.record_stride as usize,
            1 + misses.len() + idx,
            hit,
        );
    }

    data
}

/// 组装完成并上传到 GPU 的 shader binding table
pub struct ShaderBindingTable {
    _layout: SbtLayout,
    _buffer: RhiSBTBuffer,

    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// 从编译好的 ray tracing pipeline 中查询 shader group handle 并组装 SBT
    ///
    /// pipeline 创建时 group 的顺序必须是：raygen，misses...，hits...
    /// 创建失败时返回 None 并记录日志
    pub fn new(
        rhi: &Rhi,
        pipeline: vk::Pipeline,
        raygen: &SbtExport,
        misses: &[SbtExport],
        hits: &[SbtExport],
        debug_name: &str,
    ) -> Option<Self> {
        let rt_props = rhi.rt_pipeline_props();
        let layout = SbtLayout::new(
            rt_props.shader_group_handle_size,
            rt_props.shader_group_handle_alignment,
            rt_props.shader_group_base_alignment,
            misses.len() as u32,
            hits.len() as u32,
        );
        let base_alignment = rt_props.shader_group_base_alignment;

        // 从 pipeline 中获取所有 group 的 handle
        let group_count = (1 + misses.len() + hits.len()) as u32;
        let handle_data = unsafe {
            match rhi.device.vk_rt_pipeline_pf.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (group_count * layout.handle_size) as usize,
            ) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("failed to query shader group handles for {}: {}", debug_name, err);
                    return None;
                }
            }
        };

        let data = pack_sbt(&layout, &handle_data, raygen, misses, hits);

        let mut buffer =
            RhiSBTBuffer::new(rhi, layout.total_size() as vk::DeviceSize, base_alignment as vk::DeviceSize, debug_name)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), buffer.mapped_ptr(), data.len());
        }
        let total_size = data.len() as vk::DeviceSize;
        buffer.flush(0, total_size);

        // 每个 shader group 在 SBT 中的地址区间
        let sbt_address = buffer.device_address();
        let raygen_region = vk::StridedDeviceAddressRegionKHR::default()
            // raygen 的 stride 需要和 size 一样
            .stride(layout.raygen_region_size as vk::DeviceSize)
            .size(layout.raygen_region_size as vk::DeviceSize)
            .device_address(sbt_address);
        let miss_region = vk::StridedDeviceAddressRegionKHR::default()
            .stride(layout.record_stride as vk::DeviceSize)
            .size(layout.miss_region_size as vk::DeviceSize)
            .device_address(sbt_address + layout.miss_offset() as vk::DeviceSize);
        let hit_region = vk::StridedDeviceAddressRegionKHR::default()
            .stride(layout.record_stride as vk::DeviceSize)
            .size(layout.hit_region_size as vk::DeviceSize)
            .device_address(sbt_address + layout.hit_offset() as vk::DeviceSize);

        Some(Self {
            _layout: layout,
            _buffer: buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    #[inline]
    pub fn raygen_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.raygen_region
    }

    #[inline]
    pub fn miss_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.miss_region
    }

    #[inline]
    pub fn hit_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.hit_region
    }

    /// callable shader 暂不使用，空 region
    #[inline]
    pub fn callable_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.callable_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NVIDIA 一类硬件的典型取值
    const HANDLE_SIZE: u32 = 32;
    const HANDLE_ALIGN: u32 = 32;
    const BASE_ALIGN: u32 = 64;

    fn fake_handles(group_count: usize) -> Vec<u8> {
        // 每个 group 的 handle 用唯一的字节填充，便于断言
        (0..group_count).flat_map(|idx| vec![idx as u8 + 1; HANDLE_SIZE as usize]).collect()
    }

    #[test]
    fn test_layout_record_stride_holds_handle_and_pointers() {
        let layout = SbtLayout::new(HANDLE_SIZE, HANDLE_ALIGN, BASE_ALIGN, 1, 1);
        // 32B handle + 4 x 8B pointer = 64，正好对齐
        assert_eq!(layout.record_stride, 64);
        assert!(layout.record_stride >= layout.handle_size + 32);
        assert_eq!(layout.record_stride % HANDLE_ALIGN, 0);
    }

    #[test]
    fn test_layout_regions_are_base_aligned() {
        let layout = SbtLayout::new(HANDLE_SIZE, HANDLE_ALIGN, BASE_ALIGN, 3, 5);
        assert_eq!(layout.raygen_region_size % BASE_ALIGN, 0);
        assert_eq!(layout.miss_region_size % BASE_ALIGN, 0);
        assert_eq!(layout.hit_region_size % BASE_ALIGN, 0);

        assert!(layout.miss_region_size >= 3 * layout.record_stride);
        assert!(layout.hit_region_size >= 5 * layout.record_stride);
        assert_eq!(layout.total_size(), layout.hit_offset() + layout.hit_region_size);
    }

    #[test]
    fn test_n_hit_groups_produce_n_records() {
        let hit_count = 4;
        let layout = SbtLayout::new(HANDLE_SIZE, HANDLE_ALIGN, BASE_ALIGN, 1, hit_count);
        let handles = fake_handles(1 + 1 + hit_count as usize);

        let raygen = SbtExport::new("raygen");
        let misses = vec![SbtExport::new("miss")];
        let hits = (0..hit_count).map(|idx| SbtExport::new(format!("hit-{}", idx))).collect::<Vec<_>>();

        let data = pack_sbt(&layout, &handles, &raygen, &misses, &hits);
        assert_eq!(data.len() as u32, layout.total_size());

        // 每个 hit group 的 record 在固定 stride 的位置上，带着自己的 handle
        for idx in 0..hit_count as usize {
            let record_offset = layout.hit_offset() as usize + idx * layout.record_stride as usize;
            let expected_byte = (2 + idx) as u8 + 1; // raygen=1, miss=2, hits 从 3 开始
            let handle = &data[record_offset..record_offset + HANDLE_SIZE as usize];
            assert!(handle.iter().all(|b| *b == expected_byte), "hit group {} carries the wrong identifier", idx);
        }
    }

    #[test]
    fn test_local_root_pointers_follow_the_handle() {
        let layout = SbtLayout::new(HANDLE_SIZE, HANDLE_ALIGN, BASE_ALIGN, 0, 1);
        let handles = fake_handles(2);

        let raygen = SbtExport::new("raygen");
        let hits = vec![SbtExport::new("hit").with_local_tables(&[0xAABB_CCDD_1122_3344, 0x5566_7788_99AA_BBCC])];

        let data = pack_sbt(&layout, &handles, &raygen, &[], &hits);

        let pointer_base = layout.hit_offset() as usize + HANDLE_SIZE as usize;
        let ptr0 = u64::from_le_bytes(data[pointer_base..pointer_base + 8].try_into().unwrap());
        let ptr1 = u64::from_le_bytes(data[pointer_base + 8..pointer_base + 16].try_into().unwrap());
        let ptr2 = u64::from_le_bytes(data[pointer_base + 16..pointer_base + 24].try_into().unwrap());
        assert_eq!(ptr0, 0xAABB_CCDD_1122_3344);
        assert_eq!(ptr1, 0x5566_7788_99AA_BBCC);
        // 没有用到的 root pointer 保持 0
        assert_eq!(ptr2, 0);
    }

    #[test]
    fn test_raygen_record_is_first() {
        let layout = SbtLayout::new(HANDLE_SIZE, HANDLE_ALIGN, BASE_ALIGN, 1, 1);
        let handles = fake_handles(3);
        let data = pack_sbt(&layout, &handles, &SbtExport::new("raygen"), &[SbtExport::new("miss")], &[
            SbtExport::new("hit"),
        ]);

        assert!(data[..HANDLE_SIZE as usize].iter().all(|b| *b == 1));
        let miss_offset = layout.miss_offset() as usize;
        assert!(data[miss_offset..miss_offset + HANDLE_SIZE as usize].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_tlas_instance_packs_row_major_transform() {
        let instance = TlasInstance {
            transform: glam::Mat4::from_translation(glam::vec3(1.0, 2.0, 3.0)),
            blas_address: 0xDEAD_BEEF,
            instance_id: 7,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        };
        let vk_instance = instance.to_vk();

        // 平移分量在每一行的第 4 列
        assert_eq!(vk_instance.transform.matrix[3], 1.0);
        assert_eq!(vk_instance.transform.matrix[7], 2.0);
        assert_eq!(vk_instance.transform.matrix[11], 3.0);
        // acceleration_structure_reference 是 union，读取需要 unsafe
        assert_eq!(unsafe { vk_instance.acceleration_structure_reference.device_handle }, 0xDEAD_BEEF);
    }
}
