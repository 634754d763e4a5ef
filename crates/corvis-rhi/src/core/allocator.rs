use std::{ops::Deref, rc::Rc};

use ash::vk;

use crate::core::{device::RhiDevice, instance::RhiInstance, physical_device::RhiPhysicalDevice};

pub struct RhiAllocator {
    inner: vk_mem::Allocator,

    _pdevice: Rc<RhiPhysicalDevice>,
    _device: Rc<RhiDevice>,
}

impl Deref for RhiAllocator {
    type Target = vk_mem::Allocator;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for RhiAllocator {
    fn drop(&mut self) {
        log::info!("Destroying RhiAllocator");
        // vk_mem 是 RAII 的
    }
}

impl RhiAllocator {
    /// 由于 vma 的生命周期设定：需要引用 Instance 以及 Device，并确保在其生命周期之内这两个的引用是有效的.
    /// 因此需要在 Rhi 的其他部分都初始化完成后再初始化 vma
    pub fn new(instance: &RhiInstance, pdevice: Rc<RhiPhysicalDevice>, device: Rc<RhiDevice>) -> Option<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance.ash_instance(), &device.handle, pdevice.handle);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;

        let vma = unsafe {
            match vk_mem::Allocator::new(vma_ci) {
                Ok(vma) => vma,
                Err(err) => {
                    log::error!("failed to create vma allocator: {}", err);
                    return None;
                }
            }
        };

        Some(Self {
            inner: vma,
            _pdevice: pdevice,
            _device: device,
        })
    }
}
