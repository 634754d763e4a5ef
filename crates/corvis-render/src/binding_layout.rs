//! 绑定布局（"root signature"）
//!
//! 一个 pipeline 期望的绑定形状：stage x 槽位类型 x 表大小。
//! 每个 shader 可见性 stage 对应一个 descriptor set，
//! set 内固定 4 个 binding，每个 binding 是一张定长的资源表。

use std::collections::HashMap;
use std::fmt::Display;
use std::rc::Rc;

use ash::vk;

use corvis_rhi::core::device::RhiDevice;
use corvis_rhi::rhi::Rhi;

/// shader 可见性 stage，descriptor 的脏标记以它为粒度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderVisibility {
    Vertex,
    Fragment,
    Compute,
    RayTracing,
}

impl ShaderVisibility {
    pub const COUNT: usize = 4;
    pub const ALL: [ShaderVisibility; Self::COUNT] =
        [Self::Vertex, Self::Fragment, Self::Compute, Self::RayTracing];

    /// graphics 管线可见的 stages
    pub const GRAPHICS: [ShaderVisibility; 2] = [Self::Vertex, Self::Fragment];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::Fragment => 1,
            Self::Compute => 2,
            Self::RayTracing => 3,
        }
    }

    #[inline]
    pub fn vk_stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayTracing => {
                vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::MISS_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            }
        }
    }
}
impl Display for ShaderVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vertex => write!(f, "vertex"),
            Self::Fragment => write!(f, "fragment"),
            Self::Compute => write!(f, "compute"),
            Self::RayTracing => write!(f, "ray-tracing"),
        }
    }
}

/// 单个 stage 的绑定表形状：每种 view 的槽位数量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingTableShape {
    pub uniform_buffer_count: u32,
    pub sampled_image_count: u32,
    pub storage_image_count: u32,
    pub sampler_count: u32,
}

impl BindingTableShape {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.uniform_buffer_count == 0
            && self.sampled_image_count == 0
            && self.storage_image_count == 0
            && self.sampler_count == 0
    }

    /// 按寄存器取并集：每种槽位取两者的最大数量
    ///
    /// ray tracing 的全局布局就是所有参与 shader 的资源数量的并集
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self {
            uniform_buffer_count: self.uniform_buffer_count.max(other.uniform_buffer_count),
            sampled_image_count: self.sampled_image_count.max(other.sampled_image_count),
            storage_image_count: self.storage_image_count.max(other.storage_image_count),
            sampler_count: self.sampler_count.max(other.sampler_count),
        }
    }
}

/// 整个布局的形状，同时是 cache 的去重 key
pub type BindingLayoutSignature = [BindingTableShape; ShaderVisibility::COUNT];

/// 按寄存器求一组 signature 的并集
pub fn union_signatures(signatures: &[BindingLayoutSignature]) -> BindingLayoutSignature {
    let mut result = BindingLayoutSignature::default();
    for sig in signatures {
        for (stage_idx, shape) in sig.iter().enumerate() {
            result[stage_idx] = result[stage_idx].union(*shape);
        }
    }
    result
}

/// set 内固定的 binding 编号
pub const BINDING_UNIFORM_BUFFER: u32 = 0;
pub const BINDING_SAMPLED_IMAGE: u32 = 1;
pub const BINDING_STORAGE_IMAGE: u32 = 2;
pub const BINDING_SAMPLER: u32 = 3;

/// 每个 stage 各种 view 表的最大槽位数，超过属于调用方的契约违例
pub const MAX_UNIFORM_BUFFER_SLOTS: usize = 16;
pub const MAX_SAMPLED_IMAGE_SLOTS: usize = 32;
pub const MAX_STORAGE_IMAGE_SLOTS: usize = 16;
pub const MAX_SAMPLER_SLOTS: usize = 8;

/// 绑定布局：pipeline layout + 每个 stage 的 descriptor set layout
///
/// 只有形状非空的 stage 才有 set，set index 按 stage 顺序紧凑分配
pub struct BindingLayout {
    pipeline_layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    shapes: BindingLayoutSignature,
    /// 每个 stage 对应的 set index；没有 table 的 stage 为 None
    set_indices: [Option<u32>; ShaderVisibility::COUNT],

    device: Rc<RhiDevice>,
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            for layout in &self.set_layouts {
                self.device.destroy_descriptor_set_layout(*layout, None);
            }
        }
    }
}

// new & init
impl BindingLayout {
    /// 创建失败时返回 None 并记录日志
    ///
    /// # param
    /// * push_constant_size - 0 表示没有 push constant
    pub fn new(rhi: &Rhi, shapes: BindingLayoutSignature, push_constant_size: u32, debug_name: &str) -> Option<Self> {
        let mut set_layouts = Vec::new();
        let mut set_indices = [None; ShaderVisibility::COUNT];

        for stage in ShaderVisibility::ALL {
            let shape = &shapes[stage.index()];
            if shape.is_empty() {
                continue;
            }
            assert!(shape.uniform_buffer_count as usize <= MAX_UNIFORM_BUFFER_SLOTS);
            assert!(shape.sampled_image_count as usize <= MAX_SAMPLED_IMAGE_SLOTS);
            assert!(shape.storage_image_count as usize <= MAX_STORAGE_IMAGE_SLOTS);
            assert!(shape.sampler_count as usize <= MAX_SAMPLER_SLOTS);

            let stage_flags = stage.vk_stage_flags();
            let mut bindings = Vec::new();
            let mut push_binding = |binding: u32, ty: vk::DescriptorType, count: u32| {
                if count > 0 {
                    bindings.push(
                        vk::DescriptorSetLayoutBinding::default()
                            .binding(binding)
                            .descriptor_type(ty)
                            .descriptor_count(count)
                            .stage_flags(stage_flags),
                    );
                }
            };
            push_binding(BINDING_UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER, shape.uniform_buffer_count);
            push_binding(BINDING_SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE, shape.sampled_image_count);
            push_binding(BINDING_STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE, shape.storage_image_count);
            push_binding(BINDING_SAMPLER, vk::DescriptorType::SAMPLER, shape.sampler_count);

            let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            let layout = unsafe {
                match rhi.device.create_descriptor_set_layout(&create_info, None) {
                    Ok(layout) => layout,
                    Err(err) => {
                        log::error!("failed to create set layout {}-{}: {}", debug_name, stage, err);
                        set_layouts.iter().for_each(|l| rhi.device.destroy_descriptor_set_layout(*l, None));
                        return None;
                    }
                }
            };
            rhi.device.debug_utils().set_object_debug_name(layout, format!("{}-{}", debug_name, stage));

            set_indices[stage.index()] = Some(set_layouts.len() as u32);
            set_layouts.push(layout);
        }

        // 汇总所有 stage 的可见性，push constant 对所有参与的 stage 可见
        let push_constant_stages = ShaderVisibility::ALL
            .iter()
            .filter(|s| !shapes[s.index()].is_empty())
            .map(|s| s.vk_stage_flags())
            .fold(vk::ShaderStageFlags::empty(), |acc, s| acc | s);
        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(push_constant_stages)
            .offset(0)
            .size(push_constant_size);

        let mut pipeline_layout_ci = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_constant_size > 0 {
            pipeline_layout_ci = pipeline_layout_ci.push_constant_ranges(std::slice::from_ref(&push_constant_range));
        }

        let pipeline_layout = unsafe {
            match rhi.device.create_pipeline_layout(&pipeline_layout_ci, None) {
                Ok(layout) => layout,
                Err(err) => {
                    log::error!("failed to create pipeline layout {}: {}", debug_name, err);
                    set_layouts.iter().for_each(|l| rhi.device.destroy_descriptor_set_layout(*l, None));
                    return None;
                }
            }
        };
        rhi.device.debug_utils().set_object_debug_name(pipeline_layout, debug_name);

        Some(Self {
            pipeline_layout,
            set_layouts,
            shapes,
            set_indices,
            device: rhi.device.clone(),
        })
    }
}

// getters
impl BindingLayout {
    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub fn shapes(&self) -> &BindingLayoutSignature {
        &self.shapes
    }

    #[inline]
    pub fn shape_of(&self, stage: ShaderVisibility) -> &BindingTableShape {
        &self.shapes[stage.index()]
    }

    /// stage 没有 table 时返回 None
    #[inline]
    pub fn set_index(&self, stage: ShaderVisibility) -> Option<u32> {
        self.set_indices[stage.index()]
    }

    #[inline]
    pub fn set_layout(&self, stage: ShaderVisibility) -> Option<vk::DescriptorSetLayout> {
        self.set_indices[stage.index()].map(|idx| self.set_layouts[idx as usize])
    }
}

/// 布局对象的去重缓存
///
/// 两个 shader 需要的绑定形状相同时，共享同一个 BindingLayout 对象
#[derive(Default)]
pub struct BindingLayoutCache {
    layouts: HashMap<(BindingLayoutSignature, u32), Rc<BindingLayout>>,
}

impl BindingLayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按（形状，push constant 大小）查询或创建布局
    pub fn get_or_create(
        &mut self,
        rhi: &Rhi,
        shapes: BindingLayoutSignature,
        push_constant_size: u32,
    ) -> Option<Rc<BindingLayout>> {
        if let Some(layout) = self.layouts.get(&(shapes, push_constant_size)) {
            return Some(layout.clone());
        }

        let name = format!("binding-layout-{}", self.layouts.len());
        let layout = Rc::new(BindingLayout::new(rhi, shapes, push_constant_size, &name)?);
        self.layouts.insert((shapes, push_constant_size), layout.clone());
        Some(layout)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// 清空缓存，释放所有布局对象
    pub fn clear(&mut self) {
        let count = self.layouts.len();
        self.layouts.clear();
        log::info!("BindingLayoutCache cleared, {} layouts released", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(ubo: u32, srv: u32, uav: u32, sampler: u32) -> BindingTableShape {
        BindingTableShape {
            uniform_buffer_count: ubo,
            sampled_image_count: srv,
            storage_image_count: uav,
            sampler_count: sampler,
        }
    }

    #[test]
    fn test_shape_union_takes_max_per_register() {
        let a = shape(1, 4, 0, 1);
        let b = shape(2, 1, 3, 0);
        let u = a.union(b);
        assert_eq!(u, shape(2, 4, 3, 1));
    }

    #[test]
    fn test_union_signatures_covers_all_shaders() {
        let raygen: BindingLayoutSignature =
            [shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(1, 0, 1, 0)];
        let miss: BindingLayoutSignature =
            [shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(1, 2, 0, 1)];
        let hit: BindingLayoutSignature =
            [shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(0, 0, 0, 0), shape(2, 1, 0, 0)];

        let global = union_signatures(&[raygen, miss, hit]);
        assert_eq!(global[ShaderVisibility::RayTracing.index()], shape(2, 2, 1, 1));
        assert!(global[ShaderVisibility::Vertex.index()].is_empty());
    }

    #[test]
    fn test_identical_shapes_share_cache_key() {
        use std::collections::HashMap;

        // cache 的 key 是 (signature, push constant size)，相同形状的 shader 应该命中同一条
        let sig_a: BindingLayoutSignature = [shape(1, 2, 0, 1), shape(0, 4, 0, 1), shape(0, 0, 0, 0), shape(0, 0, 0, 0)];
        let sig_b = sig_a;

        let mut map: HashMap<(BindingLayoutSignature, u32), u32> = HashMap::new();
        map.insert((sig_a, 16), 1);
        assert!(map.contains_key(&(sig_b, 16)));
        assert!(!map.contains_key(&(sig_b, 32)));
    }
}
