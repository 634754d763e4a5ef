use std::{ffi::CStr, ops::Deref, rc::Rc};

use ash::vk;
use itertools::Itertools;

use crate::core::command_queue::RhiQueueFamily;
use crate::core::debug_utils::RhiDebugUtils;
use crate::core::{instance::RhiInstance, physical_device::RhiPhysicalDevice};

pub struct RhiDevice {
    pub handle: ash::Device,

    pub pdevice: Rc<RhiPhysicalDevice>,

    pub vk_dynamic_render_pf: Rc<ash::khr::dynamic_rendering::Device>,
    pub vk_acceleration_struct_pf: Rc<ash::khr::acceleration_structure::Device>,
    pub vk_rt_pipeline_pf: Rc<ash::khr::ray_tracing_pipeline::Device>,
    pub vk_swapchain_pf: Rc<ash::khr::swapchain::Device>,

    pub debug_utils: Rc<RhiDebugUtils>,
}

impl Deref for RhiDevice {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl RhiDevice {
    pub fn new(
        vk_pf: &ash::Entry,
        instance: &RhiInstance,
        pdevice: Rc<RhiPhysicalDevice>,
        queue_create_info: &[vk::DeviceQueueCreateInfo],
    ) -> Option<Self> {
        // device 所需的所有 extension
        let device_exts = Self::basic_device_exts().iter().map(|e| e.as_ptr()).collect_vec();
        let mut exts_str = String::new();
        for ext in &device_exts {
            exts_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) }));
        }
        log::info!("device exts: {}", exts_str);

        // device 所需的所有 features
        let mut all_features = vk::PhysicalDeviceFeatures2::default().features(Self::physical_device_basic_features());
        let mut physical_device_ext_features = Self::physical_device_extra_features();
        unsafe {
            physical_device_ext_features.iter_mut().for_each(|f| {
                let ptr = <*mut dyn vk::ExtendsPhysicalDeviceFeatures2>::cast::<vk::BaseOutStructure>(f.as_mut());
                (*ptr).p_next = all_features.p_next as _;
                all_features.p_next = ptr as _;
            });
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(queue_create_info)
            .enabled_extension_names(&device_exts)
            .push_next(&mut all_features);

        let device = unsafe {
            match instance.handle.create_device(pdevice.handle, &device_create_info, None) {
                Ok(device) => device,
                Err(err) => {
                    log::error!("failed to create vk device: {}", err);
                    return None;
                }
            }
        };

        let debug_utils = Rc::new(RhiDebugUtils::new(vk_pf, &instance.handle, &device));

        let vk_dynamic_render_pf = Rc::new(ash::khr::dynamic_rendering::Device::new(&instance.handle, &device));
        let vk_acceleration_struct_pf =
            Rc::new(ash::khr::acceleration_structure::Device::new(&instance.handle, &device));
        let vk_rt_pipeline_pf = Rc::new(ash::khr::ray_tracing_pipeline::Device::new(&instance.handle, &device));
        let vk_swapchain_pf = Rc::new(ash::khr::swapchain::Device::new(&instance.handle, &device));

        Some(Self {
            handle: device,
            pdevice: pdevice.clone(),

            vk_dynamic_render_pf,
            vk_acceleration_struct_pf,
            vk_rt_pipeline_pf,
            vk_swapchain_pf,

            debug_utils,
        })
    }

    /// 必要的 physical device core features
    fn physical_device_basic_features() -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .fragment_stores_and_atomics(true)
            .independent_blend(true)
            .shader_int64(true) // 用于 buffer device address
    }

    /// 必要的 physical device extension features
    fn physical_device_extra_features() -> Vec<Box<dyn vk::ExtendsPhysicalDeviceFeatures2>> {
        vec![
            Box::new(vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true)),
            Box::new(vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true)),
            Box::new(vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true)),
            Box::new(vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true)),
            Box::new(vk::PhysicalDeviceHostQueryResetFeatures::default().host_query_reset(true)),
            Box::new(vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true)),
            // FenceValue 使用 timeline semaphore 实现
            Box::new(vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true)),
        ]
    }

    /// 必要的 device extensions
    fn basic_device_exts() -> Vec<&'static CStr> {
        let mut exts = vec![];

        // swapchain
        exts.push(ash::khr::swapchain::NAME);

        // dynamic rendering
        exts.append(&mut vec![
            ash::khr::depth_stencil_resolve::NAME,
            ash::khr::create_renderpass2::NAME,
            ash::khr::dynamic_rendering::NAME,
        ]);

        // RayTracing 相关的
        exts.append(&mut vec![
            ash::khr::acceleration_structure::NAME, // 主要的 ext
            ash::ext::descriptor_indexing::NAME,
            ash::khr::buffer_device_address::NAME,
            ash::khr::ray_tracing_pipeline::NAME, // 主要的 ext
            ash::khr::deferred_host_operations::NAME,
            ash::khr::spirv_1_4::NAME,
            ash::khr::shader_float_controls::NAME,
        ]);

        exts
    }
}

impl RhiDevice {
    #[inline]
    pub fn debug_utils(&self) -> &RhiDebugUtils {
        &self.debug_utils
    }

    /// 当 uniform buffer 的 descriptor 在更新时，其 offset 必须是这个值的整数倍
    ///
    /// 注：这个值一定是 power of 2
    #[inline]
    pub fn min_ubo_offset_align(&self) -> vk::DeviceSize {
        self.pdevice.basic_props.limits.min_uniform_buffer_offset_alignment
    }

    /// buffer -> image 的 copy 中，buffer 的 row pitch 需要对齐到这个值
    #[inline]
    pub fn optimal_row_pitch_align(&self) -> vk::DeviceSize {
        self.pdevice.basic_props.limits.optimal_buffer_copy_row_pitch_alignment
    }

    #[inline]
    pub fn rt_pipeline_props(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_> {
        &self.pdevice.rt_pipeline_props
    }

    #[inline]
    pub fn graphics_queue_family(&self) -> RhiQueueFamily {
        self.pdevice.graphics_queue_family.clone()
    }

    #[inline]
    pub fn compute_queue_family(&self) -> RhiQueueFamily {
        self.pdevice.compute_queue_family.clone()
    }

    #[inline]
    pub fn transfer_queue_family(&self) -> RhiQueueFamily {
        self.pdevice.transfer_queue_family.clone()
    }

    /// device lost 意味着整个 context 失效，无法恢复
    ///
    /// 输出一份诊断信息之后直接终止，不作为错误值向上传播
    pub fn on_device_lost(&self, origin: &str) -> ! {
        log::error!("=========== DEVICE LOST ===========");
        log::error!("origin: {}", origin);
        log::error!("gpu: {}", self.pdevice.gpu_name());
        log::error!("driver version: {}", self.pdevice.basic_props.driver_version);
        log::error!("api version: {}", self.pdevice.basic_props.api_version);
        panic!("vk device lost, origin: {}", origin);
    }

    /// 检查 queue submit / fence wait 一类调用的结果，区分 device lost 和其他错误
    #[inline]
    pub fn check_submit_result(&self, result: Result<(), vk::Result>, origin: &str) {
        match result {
            Ok(_) => {}
            Err(vk::Result::ERROR_DEVICE_LOST) => self.on_device_lost(origin),
            Err(err) => panic!("{} failed: {}", origin, err),
        }
    }
}
