use std::ffi::CStr;
use std::ptr::null_mut;

use ash::vk;
use itertools::Itertools;

use crate::core::command_queue::RhiQueueFamily;

/// 表示一张物理显卡
pub struct RhiPhysicalDevice {
    pub handle: vk::PhysicalDevice,

    /// 当前 gpu 支持的 features
    pub features: vk::PhysicalDeviceFeatures,

    /// 当前 gpu 的基础属性
    pub basic_props: vk::PhysicalDeviceProperties,

    /// 当前 gpu 的 ray tracing 属性
    pub rt_pipeline_props: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,

    /// 当前 gpu 的加速结构属性
    pub acc_props: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,

    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,

    pub graphics_queue_family: RhiQueueFamily,
    pub compute_queue_family: RhiQueueFamily,
    pub transfer_queue_family: RhiQueueFamily,
}

impl RhiPhysicalDevice {
    /// 创建一个新的物理显卡实例
    ///
    /// 优先选择独立显卡，如果没有则选择第一个可用的显卡
    pub fn new_discrete_physical_device(instance: &ash::Instance) -> Option<Self> {
        let pdevices = unsafe {
            match instance.enumerate_physical_devices() {
                Ok(pdevices) => pdevices,
                Err(err) => {
                    log::error!("failed to enumerate physical devices: {}", err);
                    return None;
                }
            }
        };

        pdevices
            .iter()
            .map(|pdevice| RhiPhysicalDevice::new(*pdevice, instance))
            // 优先使用独立显卡
            .find_or_first(RhiPhysicalDevice::is_discrete_gpu)
    }

    pub fn new(pdevice: vk::PhysicalDevice, instance: &ash::Instance) -> Self {
        unsafe {
            let rt_pipeline_props;
            let basic_props;
            let acc_props;
            {
                let mut pdevice_raytracing_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
                let mut pdevice_acc_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
                let mut pdevice_props2 = vk::PhysicalDeviceProperties2::default()
                    .push_next(&mut pdevice_raytracing_props)
                    .push_next(&mut pdevice_acc_props);
                instance.get_physical_device_properties2(pdevice, &mut pdevice_props2);

                basic_props = pdevice_props2.properties;
                let physical_device_name = CStr::from_ptr(basic_props.device_name.as_ptr());
                log::info!("found gpu: {:?}", physical_device_name);

                pdevice_raytracing_props.p_next = null_mut();
                rt_pipeline_props = pdevice_raytracing_props;

                pdevice_acc_props.p_next = null_mut();
                acc_props = pdevice_acc_props;
            }

            let queue_family_properties = instance.get_physical_device_queue_family_properties(pdevice);
            let find_queue_family = |name: &str, flags: vk::QueueFlags| {
                let (index, props) = queue_family_properties
                    .iter()
                    .enumerate()
                    .find(|(_, prop)| prop.queue_flags.contains(flags))
                    .expect("no suitable queue family found");
                RhiQueueFamily {
                    name: name.to_string(),
                    queue_family_index: index as u32,
                    queue_flags: props.queue_flags,
                    queue_count: props.queue_count,
                }
            };

            // graphics queue 一定同时支持 compute 和 transfer
            let graphics_queue_family = find_queue_family("graphics", vk::QueueFlags::GRAPHICS);
            let compute_queue_family = find_queue_family("compute", vk::QueueFlags::COMPUTE);
            let transfer_queue_family = find_queue_family("transfer", vk::QueueFlags::TRANSFER);

            Self {
                memory_properties: instance.get_physical_device_memory_properties(pdevice),
                features: instance.get_physical_device_features(pdevice),
                handle: pdevice,
                basic_props,
                rt_pipeline_props,
                acc_props,
                queue_family_properties,
                graphics_queue_family,
                compute_queue_family,
                transfer_queue_family,
            }
        }
    }

    /// 当前 gpu 是否是独立显卡
    #[inline]
    pub fn is_discrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    #[inline]
    pub fn gpu_name(&self) -> String {
        unsafe { CStr::from_ptr(self.basic_props.device_name.as_ptr()).to_string_lossy().into_owned() }
    }

    /// 找到满足条件的 queue family 的 index
    pub fn find_queue_family_index(&self, queue_flags: vk::QueueFlags) -> Option<u32> {
        self.queue_family_properties
            .iter()
            .enumerate()
            .find(|(_, prop)| prop.queue_flags.contains(queue_flags))
            .map(|(index, _)| index as u32)
    }
}
