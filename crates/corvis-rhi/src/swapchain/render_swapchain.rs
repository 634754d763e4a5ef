use ash::vk;
use itertools::Itertools;

use crate::core::command_queue::RhiQueue;
use crate::core::image::{RhiImage2DView, RhiImageViewCreateInfo};
use crate::core::synchronize::{RhiFence, RhiSemaphore};
use crate::rhi::Rhi;
use crate::swapchain::surface::RhiSurface;

pub struct RhiSwapchainImageInfo {
    pub image_extent: vk::Extent2D,
    pub image_cnt: usize,
    pub image_format: vk::Format,
}

/// swapchain 的简单封装：持有 image 和 view，负责 acquire/present/resize
pub struct RhiRenderSwapchain {
    surface: RhiSurface,
    swapchain_handle: vk::SwapchainKHR,

    /// 这里的 image 并非手动创建的，因此无法使用 RhiImage2D 类型
    images: Vec<vk::Image>,
    image_views: Vec<RhiImage2DView>,
    swapchain_image_index: usize,

    color_format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

/// 构建过程
impl RhiRenderSwapchain {
    /// 创建失败时返回 None 并记录日志
    pub fn new(
        rhi: &Rhi,
        surface: RhiSurface,
        present_mode: vk::PresentModeKHR,
        surface_format: vk::SurfaceFormatKHR,
    ) -> Option<Self> {
        let extent = surface.capabilities(rhi.physical_device.handle).current_extent;

        let swapchain_handle = Self::create_swapchain(
            rhi,
            &surface,
            surface_format.format,
            surface_format.color_space,
            extent,
            present_mode,
        )?;

        let (images, image_views) = Self::acquire_images(rhi, swapchain_handle, surface_format.format)?;

        Some(Self {
            surface,
            swapchain_handle,
            images,
            image_views,
            swapchain_image_index: 0,
            extent,
            color_format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
        })
    }

    fn create_swapchain(
        rhi: &Rhi,
        surface: &RhiSurface,
        format: vk::Format,
        color_space: vk::ColorSpaceKHR,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> Option<vk::SwapchainKHR> {
        let capabilities = surface.capabilities(rhi.physical_device.handle);

        // 确定 image count
        // max_image_count == 0，表示不限制 image 数量
        let image_count = if capabilities.max_image_count == 0 {
            capabilities.min_image_count + 1
        } else {
            u32::min(capabilities.max_image_count, capabilities.min_image_count + 1)
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(format)
            .image_color_space(color_space)
            .image_extent(extent)
            .image_array_layers(1)
            // TRANSFER_DST 用于 Nsight 分析
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::STORAGE,
            )
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true);

        unsafe {
            let swapchain_handle = match rhi.device.vk_swapchain_pf.create_swapchain(&create_info, None) {
                Ok(handle) => handle,
                Err(err) => {
                    log::error!("failed to create swapchain: {}", err);
                    return None;
                }
            };
            rhi.device.debug_utils().set_object_debug_name(swapchain_handle, "main");

            Some(swapchain_handle)
        }
    }

    fn acquire_images(
        rhi: &Rhi,
        swapchain_handle: vk::SwapchainKHR,
        format: vk::Format,
    ) -> Option<(Vec<vk::Image>, Vec<RhiImage2DView>)> {
        let images = unsafe { rhi.device.vk_swapchain_pf.get_swapchain_images(swapchain_handle).unwrap() };
        for (img_idx, img) in images.iter().enumerate() {
            rhi.device.debug_utils().set_object_debug_name(*img, format!("swapchain-image-{img_idx}"));
        }
        let image_views = images
            .iter()
            .enumerate()
            .map(|(idx, img)| {
                RhiImage2DView::new(
                    rhi,
                    *img,
                    RhiImageViewCreateInfo::new_image_view_2d_info(format, vk::ImageAspectFlags::COLOR),
                    format!("swapchain-{}", idx),
                )
            })
            .collect::<Option<Vec<_>>>()?;

        Some((images, image_views))
    }
}

/// getters
impl RhiRenderSwapchain {
    #[inline]
    pub fn present_images(&self) -> Vec<vk::Image> {
        self.images.clone()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn current_image(&self) -> vk::Image {
        self.images[self.swapchain_image_index]
    }

    #[inline]
    pub fn current_image_index(&self) -> usize {
        self.swapchain_image_index
    }

    #[inline]
    pub fn current_image_view(&self) -> &RhiImage2DView {
        &self.image_views[self.swapchain_image_index]
    }

    #[inline]
    pub fn image_infos(&self) -> RhiSwapchainImageInfo {
        RhiSwapchainImageInfo {
            image_extent: self.extent,
            image_cnt: self.images.len(),
            image_format: self.color_format,
        }
    }
}

/// tools
impl RhiRenderSwapchain {
    /// timeout: nano seconds
    #[inline]
    pub fn acquire_next_image(&mut self, rhi: &Rhi, semaphore: Option<&RhiSemaphore>, fence: Option<&RhiFence>, timeout: u64) {
        let (image_index, is_suboptimal) = unsafe {
            rhi.device
                .vk_swapchain_pf
                .acquire_next_image(
                    self.swapchain_handle,
                    timeout,
                    semaphore.map_or(vk::Semaphore::null(), |s| s.handle()),
                    fence.map_or(vk::Fence::null(), |f| f.handle()),
                )
                .unwrap()
        };

        if is_suboptimal {
            log::warn!("swapchain image {} is suboptimal, resize pending", image_index);
        }

        self.swapchain_image_index = image_index as usize;
    }

    /// 返回 false 表示 swapchain 已经过期，需要 resize
    pub fn present_image(&self, rhi: &Rhi, queue: &RhiQueue, wait_semaphores: &[RhiSemaphore]) -> bool {
        let wait_semaphores = wait_semaphores.iter().map(|s| s.handle()).collect_vec();
        let image_indices = [self.swapchain_image_index as u32];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&self.swapchain_handle));

        let result = unsafe { rhi.device.vk_swapchain_pf.queue_present(queue.handle(), &present_info) };
        match result {
            Ok(_) => true,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("swapchain out of date on present, resize pending");
                false
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => rhi.device.on_device_lost("queue_present"),
            Err(err) => panic!("queue_present failed: {}", err),
        }
    }

    /// 重建 swapchain
    ///
    /// 尺寸没有变化时是 no-op，直接返回成功；
    /// 否则等待 device idle，销毁旧的 image view 和 swapchain，
    /// 重新创建并重新获取全部 back buffer
    pub fn resize(&mut self, rhi: &Rhi, extent: vk::Extent2D) -> bool {
        if !need_resize(self.extent, extent) {
            return true;
        }

        // 同步等待，确保旧的 back buffer 不再被 GPU 使用
        unsafe {
            rhi.device.device_wait_idle().unwrap();
        }

        self.image_views.clear();
        unsafe {
            rhi.device.vk_swapchain_pf.destroy_swapchain(self.swapchain_handle, None);
        }

        let Some(swapchain_handle) =
            Self::create_swapchain(rhi, &self.surface, self.color_format, self.color_space, extent, self.present_mode)
        else {
            return false;
        };
        let Some((images, image_views)) = Self::acquire_images(rhi, swapchain_handle, self.color_format) else {
            return false;
        };

        self.swapchain_handle = swapchain_handle;
        self.images = images;
        self.image_views = image_views;
        self.swapchain_image_index = 0;
        self.extent = extent;
        true
    }

    /// 需要在 device 销毁之前调用
    pub fn destroy(mut self, rhi: &Rhi) {
        self.image_views.clear();
        unsafe {
            rhi.device.vk_swapchain_pf.destroy_swapchain(self.swapchain_handle, None);
        }
        self.swapchain_handle = vk::SwapchainKHR::null();
    }
}

/// 尺寸不变时不需要重建 swapchain
#[inline]
fn need_resize(current: vk::Extent2D, requested: vk::Extent2D) -> bool {
    current.width != requested.width || current.height != requested.height
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_same_extent_is_noop() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert!(!need_resize(extent, extent));
    }

    #[test]
    fn test_resize_different_extent() {
        let current = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let requested = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert!(need_resize(current, requested));
        assert!(need_resize(
            current,
            vk::Extent2D {
                width: 1280,
                height: 1080
            }
        ));
    }
}
