use std::ffi::CStr;
use std::rc::Rc;

use ash::vk;

use crate::core::allocator::RhiAllocator;
use crate::core::command_pool::RhiCommandPool;
use crate::core::command_queue::{RhiQueue, RhiQueueFamily};
use crate::core::debug_utils::RhiDebugUtils;
use crate::core::device::RhiDevice;
use crate::core::instance::RhiInstance;
use crate::core::physical_device::RhiPhysicalDevice;

/// 进程级的 GPU device 封装
///
/// 生命周期和引擎的 init/shutdown 绑定，显式创建、显式销毁，
/// 作为参数传递给所有需要 device 的对象
pub struct Rhi {
    /// vk 基础函数的接口
    ///
    /// 在 drop 之后，会卸载 dll，因此需要确保该字段最后 drop
    pub(crate) vk_pf: ash::Entry,

    pub instance: RhiInstance,
    pub physical_device: Rc<RhiPhysicalDevice>,
    pub device: Rc<RhiDevice>,
    pub allocator: Rc<RhiAllocator>,

    pub graphics_queue: RhiQueue,
    pub compute_queue: RhiQueue,
    pub transfer_queue: RhiQueue,

    /// 临时的 graphics command pool，主要用于一次性的命令
    pub temp_graphics_command_pool: Rc<RhiCommandPool>,
    /// 临时的 compute command pool，主要用于加速结构构建一类的一次性命令
    pub temp_compute_command_pool: Rc<RhiCommandPool>,
}

/// 创建与销毁
impl Rhi {
    const ENGINE_NAME: &'static str = "Corvis";

    /// 创建整个 vulkan 环境
    ///
    /// 任意一步失败时返回 None 并记录日志，由调用者决定是否终止
    pub fn new(app_name: String, instance_extra_exts: Vec<&'static CStr>) -> Option<Self> {
        let vk_pf = unsafe {
            match ash::Entry::load() {
                Ok(entry) => entry,
                Err(err) => {
                    log::error!("failed to load vulkan entry: {}", err);
                    return None;
                }
            }
        };

        let instance = RhiInstance::new(&vk_pf, app_name, Self::ENGINE_NAME.to_string(), instance_extra_exts)?;
        let physical_device = Rc::new(RhiPhysicalDevice::new_discrete_physical_device(instance.ash_instance())?);

        // graphics, compute, transfer 各创建一个 queue
        let queue_priorities = [1.0];
        let queue_create_infos = [
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(physical_device.graphics_queue_family.queue_family_index)
                .queue_priorities(&queue_priorities),
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(physical_device.compute_queue_family.queue_family_index)
                .queue_priorities(&queue_priorities),
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(physical_device.transfer_queue_family.queue_family_index)
                .queue_priorities(&queue_priorities),
        ];

        let device = Rc::new(RhiDevice::new(&vk_pf, &instance, physical_device.clone(), &queue_create_infos)?);

        let get_queue = |queue_family: &RhiQueueFamily| RhiQueue {
            handle: unsafe { device.get_device_queue(queue_family.queue_family_index, 0) },
            queue_family: queue_family.clone(),
            device: device.clone(),
        };
        let graphics_queue = get_queue(&physical_device.graphics_queue_family);
        let compute_queue = get_queue(&physical_device.compute_queue_family);
        let transfer_queue = get_queue(&physical_device.transfer_queue_family);

        // 在 device 以及 debug_utils 之前创建的 vk::Handle
        {
            let debug_utils = device.debug_utils();
            debug_utils.set_object_debug_name(instance.vk_instance(), "RhiInstance");
            debug_utils.set_object_debug_name(physical_device.handle, "RhiPhysicalDevice");
            debug_utils.set_object_debug_name(device.handle.handle(), "RhiDevice");
            debug_utils.set_debug_name(&graphics_queue, "graphics");
            debug_utils.set_debug_name(&compute_queue, "compute");
            debug_utils.set_debug_name(&transfer_queue, "transfer");
        }

        let allocator = Rc::new(RhiAllocator::new(&instance, physical_device.clone(), device.clone())?);

        let temp_graphics_command_pool = Rc::new(RhiCommandPool::new(
            device.clone(),
            physical_device.graphics_queue_family.clone(),
            vk::CommandPoolCreateFlags::empty(),
            "rhi-temp-graphics",
        ));
        let temp_compute_command_pool = Rc::new(RhiCommandPool::new(
            device.clone(),
            physical_device.compute_queue_family.clone(),
            vk::CommandPoolCreateFlags::empty(),
            "rhi-temp-compute",
        ));

        log::info!("graphics queue's queue family:\n{:#?}", graphics_queue.queue_family());
        log::info!("compute queue's queue family:\n{:#?}", compute_queue.queue_family());
        log::info!("transfer queue's queue family:\n{:#?}", transfer_queue.queue_family());

        Some(Self {
            vk_pf,
            instance,
            physical_device,
            device,
            allocator,
            graphics_queue,
            compute_queue,
            transfer_queue,
            temp_graphics_command_pool,
            temp_compute_command_pool,
        })
    }

    /// 销毁前需要调用者保证 GPU 上没有仍在执行的工作
    pub fn destroy(self) {
        self.graphics_queue.wait_idle();

        drop(self.temp_graphics_command_pool);
        drop(self.temp_compute_command_pool);
        drop(self.allocator);

        // queue 持有 device 的引用，需要先行释放
        drop(self.graphics_queue);
        drop(self.compute_queue);
        drop(self.transfer_queue);

        // device / instance 不是 RAII 的，需要手动销毁
        match Rc::try_unwrap(self.device) {
            Ok(device) => unsafe {
                drop(device.debug_utils);
                device.handle.destroy_device(None);
            },
            Err(_) => log::error!("Rhi::destroy: device is still referenced, leaking vk device"),
        }
        self.instance.destroy();
    }
}

/// getter
impl Rhi {
    #[inline]
    pub fn device(&self) -> &RhiDevice {
        &self.device
    }

    #[inline]
    pub fn debug_utils(&self) -> &RhiDebugUtils {
        self.device.debug_utils()
    }

    #[inline]
    pub fn physical_device(&self) -> &RhiPhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn graphics_queue_family(&self) -> RhiQueueFamily {
        self.physical_device.graphics_queue_family.clone()
    }

    #[inline]
    pub fn compute_queue_family(&self) -> RhiQueueFamily {
        self.physical_device.compute_queue_family.clone()
    }

    #[inline]
    pub fn transfer_queue_family(&self) -> RhiQueueFamily {
        self.physical_device.transfer_queue_family.clone()
    }

    /// 当 uniform buffer 的 descriptor 在更新时，其 offset 必须是这个值的整数倍
    ///
    /// 注：这个值一定是 power of 2
    #[inline]
    pub fn min_ubo_offset_align(&self) -> vk::DeviceSize {
        self.device.min_ubo_offset_align()
    }

    #[inline]
    pub fn rt_pipeline_props(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_> {
        self.device.rt_pipeline_props()
    }
}

/// tools
impl Rhi {
    /// 根据给定的格式，返回支持的格式
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Vec<vk::Format> {
        candidates
            .iter()
            .filter(|f| {
                let props = unsafe {
                    self.instance
                        .ash_instance()
                        .get_physical_device_format_properties(self.physical_device.handle, **f)
                };
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => panic!("not supported tiling."),
                }
            })
            .copied()
            .collect()
    }
}
