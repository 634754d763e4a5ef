use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::core::debug_utils::RhiDebugType;
use crate::rhi::Rhi;

/// 窗口由外部的窗口层负责，这里只需要 raw handle 来创建 surface
pub struct RhiSurface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) pf: ash::khr::surface::Instance,
}

impl RhiSurface {
    /// 创建失败时返回 None 并记录日志
    pub fn new(rhi: &Rhi, display_handle: RawDisplayHandle, window_handle: RawWindowHandle) -> Option<Self> {
        let surface_pf = ash::khr::surface::Instance::new(&rhi.vk_pf, rhi.instance.ash_instance());

        let surface = unsafe {
            match ash_window::create_surface(
                &rhi.vk_pf,
                rhi.instance.ash_instance(),
                display_handle,
                window_handle,
                None,
            ) {
                Ok(surface) => surface,
                Err(err) => {
                    log::error!("failed to create surface: {}", err);
                    return None;
                }
            }
        };

        let surface = RhiSurface {
            handle: surface,
            pf: surface_pf,
        };
        rhi.device.debug_utils().set_debug_name(&surface, "main");

        Some(surface)
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// surface 的 capabilities 会随窗口尺寸变化，每次需要重新查询
    pub fn capabilities(&self, pdevice: vk::PhysicalDevice) -> vk::SurfaceCapabilitiesKHR {
        unsafe { self.pf.get_physical_device_surface_capabilities(pdevice, self.handle).unwrap() }
    }

    pub fn formats(&self, pdevice: vk::PhysicalDevice) -> Vec<vk::SurfaceFormatKHR> {
        unsafe { self.pf.get_physical_device_surface_formats(pdevice, self.handle).unwrap() }
    }
}

impl Drop for RhiSurface {
    fn drop(&mut self) {
        unsafe { self.pf.destroy_surface(self.handle, None) }
    }
}

impl RhiDebugType for RhiSurface {
    fn debug_type_name() -> &'static str {
        "RhiSurface"
    }
    fn vk_handle(&self) -> impl vk::Handle + Copy {
        self.handle
    }
}
