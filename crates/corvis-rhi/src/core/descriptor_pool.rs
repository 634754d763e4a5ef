use std::rc::Rc;

use ash::vk;

use crate::core::debug_utils::RhiDebugType;
use crate::core::device::RhiDevice;
use crate::rhi::Rhi;

/// 描述符池创建信息
///
/// 用于配置描述符池的创建参数：标志位、最大描述符集数量、每种类型描述符的最大数量
pub struct RhiDescriptorPoolCreateInfo {
    inner: vk::DescriptorPoolCreateInfo<'static>,
    _pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl RhiDescriptorPoolCreateInfo {
    #[inline]
    pub fn new(flags: vk::DescriptorPoolCreateFlags, max_sets: u32, pool_sizes: Vec<vk::DescriptorPoolSize>) -> Self {
        let inner = vk::DescriptorPoolCreateInfo {
            flags,
            max_sets,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        Self {
            inner,
            _pool_sizes: pool_sizes,
        }
    }
}

/// 描述符池
///
/// 每个 CommandBatch 持有一个，作为当前帧 GPU 可见的 descriptor 分配来源。
/// reset 之后，之前分配出去的 descriptor set 全部失效
pub struct RhiDescriptorPool {
    handle: vk::DescriptorPool,
    _info: Rc<RhiDescriptorPoolCreateInfo>,

    device: Rc<RhiDevice>,
    name: String,
}
impl RhiDebugType for RhiDescriptorPool {
    fn debug_type_name() -> &'static str {
        "RhiDescriptorPool"
    }

    fn vk_handle(&self) -> impl vk::Handle + Copy {
        self.handle
    }
}
impl Drop for RhiDescriptorPool {
    fn drop(&mut self) {
        log::info!("Destroying RhiDescriptorPool: {}", self.name);
        unsafe { self.device.destroy_descriptor_pool(self.handle, None) };
    }
}
impl RhiDescriptorPool {
    /// 创建失败时返回 None 并记录日志，由调用者决定是否继续
    #[inline]
    pub fn new(rhi: &Rhi, ci: Rc<RhiDescriptorPoolCreateInfo>, name: &str) -> Option<Self> {
        let pool = unsafe {
            match rhi.device.create_descriptor_pool(&ci.inner, None) {
                Ok(pool) => pool,
                Err(err) => {
                    log::error!("failed to create descriptor pool {}: {}", name, err);
                    return None;
                }
            }
        };
        let pool = Self {
            handle: pool,
            _info: ci,
            device: rhi.device.clone(),
            name: name.to_string(),
        };
        rhi.device.debug_utils().set_debug_name(&pool, name);
        Some(pool)
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    /// 从 pool 中分配一个 descriptor set
    ///
    /// pool 耗尽时返回 None，由调用者进行透明扩容
    pub fn alloc_set(&self, layout: vk::DescriptorSetLayout, debug_name: &str) -> Option<vk::DescriptorSet> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(std::slice::from_ref(&layout));
        let set = unsafe {
            match self.device.allocate_descriptor_sets(&alloc_info) {
                Ok(sets) => sets[0],
                Err(err) => {
                    log::error!("failed to allocate descriptor set {}: {}", debug_name, err);
                    return None;
                }
            }
        };
        self.device.debug_utils().set_object_debug_name(set, debug_name);
        Some(set)
    }

    /// 回收整个 pool，之前分配的所有 descriptor set 失效
    #[inline]
    pub fn reset(&self) {
        unsafe {
            self.device.reset_descriptor_pool(self.handle, vk::DescriptorPoolResetFlags::empty()).unwrap();
        }
    }
}
