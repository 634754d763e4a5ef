use std::rc::Rc;

use ash::vk;
use vk_mem::Alloc;

use crate::core::allocator::RhiAllocator;
use crate::core::debug_utils::RhiDebugType;
use crate::core::device::RhiDevice;
use crate::rhi::Rhi;

/// 图像的逻辑类别，和后端的绑定方式正交
///
/// 通过唯一的转换函数得到 vk 的 view type，不使用继承链
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RhiImageKind {
    Texture2D,
    Texture2DArray,
    TextureCube,
    TextureCubeArray,
    Texture3D,
}

impl RhiImageKind {
    /// 单一的 cast 函数：logical kind -> vk view type
    #[inline]
    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            RhiImageKind::Texture2D => vk::ImageViewType::TYPE_2D,
            RhiImageKind::Texture2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            RhiImageKind::TextureCube => vk::ImageViewType::CUBE,
            RhiImageKind::TextureCubeArray => vk::ImageViewType::CUBE_ARRAY,
            RhiImageKind::Texture3D => vk::ImageViewType::TYPE_3D,
        }
    }

    #[inline]
    pub fn image_type(self) -> vk::ImageType {
        match self {
            RhiImageKind::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }
}

pub struct RhiImageCreateInfo {
    inner: vk::ImageCreateInfo<'static>,

    queue_family_indices: Vec<u32>,
}

impl RhiImageCreateInfo {
    #[inline]
    pub fn new_image_2d_info(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            inner: vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                format,
                extent: extent.into(),
                mip_levels: 1,
                array_layers: 1,
                samples: vk::SampleCountFlags::TYPE_1,
                tiling: vk::ImageTiling::OPTIMAL,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                // spec 上面说，这里只能是 UNDEFINED 或者 PREINITIALIZED
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            },
            queue_family_indices: Vec::new(),
        }
    }

    #[inline]
    pub fn create_info(&self) -> &vk::ImageCreateInfo<'_> {
        &self.inner
    }

    /// getter
    #[inline]
    pub fn extent(&self) -> &vk::Extent3D {
        &self.inner.extent
    }

    /// getter
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    /// builder
    #[inline]
    pub fn queue_family_indices(mut self, queue_family_indices: &[u32]) -> Self {
        self.inner.sharing_mode = vk::SharingMode::CONCURRENT;
        self.queue_family_indices = queue_family_indices.into();

        self.inner.queue_family_index_count = self.queue_family_indices.len() as u32;
        self.inner.p_queue_family_indices = self.queue_family_indices.as_ptr();
        self
    }
}

pub struct RhiImageViewCreateInfo {
    inner: vk::ImageViewCreateInfo<'static>,
}

impl RhiImageViewCreateInfo {
    #[inline]
    pub fn new_image_view_2d_info(format: vk::Format, aspect: vk::ImageAspectFlags) -> Self {
        Self::new_image_view_info(RhiImageKind::Texture2D, format, aspect)
    }

    #[inline]
    pub fn new_image_view_info(kind: RhiImageKind, format: vk::Format, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            inner: vk::ImageViewCreateInfo {
                format,
                view_type: kind.view_type(),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    level_count: 1,
                    layer_count: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    #[inline]
    pub fn inner(&self) -> &vk::ImageViewCreateInfo<'_> {
        &self.inner
    }
}

pub struct RhiImage2D {
    handle: vk::Image,

    allocation: vk_mem::Allocation,

    _name: String,
    image_info: Rc<RhiImageCreateInfo>,

    allocator: Rc<RhiAllocator>,
}
impl RhiDebugType for RhiImage2D {
    fn debug_type_name() -> &'static str {
        "RhiImage2D"
    }

    fn vk_handle(&self) -> impl vk::Handle + Copy {
        self.handle
    }
}
impl Drop for RhiImage2D {
    fn drop(&mut self) {
        unsafe { self.allocator.destroy_image(self.handle, &mut self.allocation) }
    }
}
// getter
impl RhiImage2D {
    #[inline]
    pub fn width(&self) -> u32 {
        self.image_info.extent().width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image_info.extent().height
    }

    #[inline]
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width(),
            height: self.height(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.image_info.format()
    }
}
impl RhiImage2D {
    /// 创建失败时返回 None 并记录日志，由调用者决定是否继续
    pub fn new(
        rhi: &Rhi,
        image_info: Rc<RhiImageCreateInfo>,
        alloc_info: &vk_mem::AllocationCreateInfo,
        debug_name: &str,
    ) -> Option<Self> {
        let (image, alloc) = unsafe {
            match rhi.allocator.create_image(image_info.create_info(), alloc_info) {
                Ok(pair) => pair,
                Err(err) => {
                    log::error!("failed to create image {}: {}", debug_name, err);
                    return None;
                }
            }
        };
        let image = Self {
            _name: debug_name.to_string(),

            handle: image,
            allocation: alloc,

            image_info,
            allocator: rhi.allocator.clone(),
        };
        rhi.device.debug_utils().set_debug_name(&image, debug_name);
        Some(image)
    }

    #[inline]
    pub fn new_device_image(
        rhi: &Rhi,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        debug_name: &str,
    ) -> Option<Self> {
        Self::new(
            rhi,
            Rc::new(RhiImageCreateInfo::new_image_2d_info(extent, format, usage)),
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            debug_name,
        )
    }

    /// 计算某种 format 的一个像素需要的存储空间
    pub fn format_byte_count(format: vk::Format) -> usize {
        // 根据 vulkan specification 得到的 format 顺序
        const BYTE_3_FORMAT: [(vk::Format, vk::Format); 1] = [(vk::Format::R8G8B8_UNORM, vk::Format::B8G8R8_SRGB)];
        const BYTE_4_FORMAT: [(vk::Format, vk::Format); 1] = [(vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_SRGB)];
        const BYTE_6_FORMAT: [(vk::Format, vk::Format); 1] =
            [(vk::Format::R16G16B16_UNORM, vk::Format::R16G16B16_SFLOAT)];
        const BYTE_8_FORMAT: [(vk::Format, vk::Format); 1] =
            [(vk::Format::R16G16B16A16_UNORM, vk::Format::R16G16B16A16_SFLOAT)];

        let is_in_format_region = |format: vk::Format, regions: &[(vk::Format, vk::Format)]| {
            let n = format.as_raw();
            regions.iter().any(|(begin, end)| begin.as_raw() <= n && n <= end.as_raw())
        };

        match format {
            f if is_in_format_region(f, &BYTE_3_FORMAT) => 3,
            f if is_in_format_region(f, &BYTE_4_FORMAT) => 4,
            f if is_in_format_region(f, &BYTE_6_FORMAT) => 6,
            f if is_in_format_region(f, &BYTE_8_FORMAT) => 8,
            _ => panic!("unsupported format."),
        }
    }
}

pub struct RhiImage2DView {
    handle: vk::ImageView,

    _info: Rc<RhiImageViewCreateInfo>,
    _name: String,

    device: Rc<RhiDevice>,
}
impl Drop for RhiImage2DView {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.handle, None);
        }
    }
}
impl RhiDebugType for RhiImage2DView {
    fn debug_type_name() -> &'static str {
        "RhiImage2DView"
    }

    fn vk_handle(&self) -> impl vk::Handle + Copy {
        self.handle
    }
}
impl RhiImage2DView {
    /// 创建失败时返回 None 并记录日志，由调用者决定是否继续
    pub fn new(rhi: &Rhi, image: vk::Image, mut info: RhiImageViewCreateInfo, name: impl AsRef<str>) -> Option<Self> {
        info.inner.image = image;
        let handle = unsafe {
            match rhi.device.create_image_view(&info.inner, None) {
                Ok(handle) => handle,
                Err(err) => {
                    log::error!("failed to create image view {}: {}", name.as_ref(), err);
                    return None;
                }
            }
        };
        let image_view = Self {
            handle,
            _info: Rc::new(info),
            _name: name.as_ref().to_string(),
            device: rhi.device.clone(),
        };
        rhi.device.debug_utils().set_debug_name(&image_view, &name);
        Some(image_view)
    }

    /// getter
    #[inline]
    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }
}

pub enum RhiImageContainer {
    Own(Box<RhiImage2D>),
    Shared(Rc<RhiImage2D>),
    Raw(vk::Image),
}
impl RhiImageContainer {
    #[inline]
    pub fn vk_image(&self) -> vk::Image {
        match self {
            RhiImageContainer::Own(image) => image.handle(),
            RhiImageContainer::Shared(image) => image.handle(),
            RhiImageContainer::Raw(image) => *image,
        }
    }
}

pub enum RhiImage2DViewContainer {
    Own(Box<RhiImage2DView>),
    Shared(Rc<RhiImage2DView>),
    Raw(vk::ImageView),
}
impl RhiImage2DViewContainer {
    #[inline]
    pub fn vk_image_view(&self) -> vk::ImageView {
        match self {
            RhiImage2DViewContainer::Own(view) => view.handle(),
            RhiImage2DViewContainer::Shared(view) => view.handle(),
            RhiImage2DViewContainer::Raw(view) => *view,
        }
    }
}
