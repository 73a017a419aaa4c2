//! Image resources with tracked layouts
//!
//! An [`ImageResource`] always knows the layout its last recorded command left
//! it in. [`LayoutTracker`] holds that bookkeeping without touching the API so
//! the transition table can be exercised on its own.

use ash::vk;

use crate::command::CommandBuffer;
use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};
use crate::resource::ResourceHandle;

/// Layout a clear command requires
pub const CLEAR_LAYOUT: vk::ImageLayout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;

/// Pipeline stage and access mask on one side of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessScope {
    /// Pipeline stages
    pub stage: vk::PipelineStageFlags,
    /// Memory access types
    pub access: vk::AccessFlags,
}

impl AccessScope {
    const fn new(stage: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stage, access }
    }
}

/// Work that must finish before an image leaves `layout`, or `None` when the
/// layout is not one this module tracks
pub fn source_scope(layout: vk::ImageLayout) -> Option<AccessScope> {
    let scope = match layout {
        vk::ImageLayout::UNDEFINED => AccessScope::new(vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => AccessScope::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            AccessScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            AccessScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        // Acquire is ordered by the semaphore wait, whatever stage it names
        vk::ImageLayout::PRESENT_SRC_KHR => {
            AccessScope::new(vk::PipelineStageFlags::ALL_COMMANDS, vk::AccessFlags::empty())
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => AccessScope::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::GENERAL => AccessScope::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
        _ => return None,
    };
    Some(scope)
}

/// Work that waits for an image to enter `layout`, or `None` when the image
/// cannot be transitioned into it
pub fn destination_scope(layout: vk::ImageLayout) -> Option<AccessScope> {
    let scope = match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => AccessScope::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            AccessScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            AccessScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::PRESENT_SRC_KHR => {
            AccessScope::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => AccessScope::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::GENERAL => AccessScope::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
        _ => return None,
    };
    Some(scope)
}

/// One planned layout change with both barrier scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Scope that must complete first
    pub src: AccessScope,
    /// Scope that waits
    pub dst: AccessScope,
}

/// Current layout of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTracker {
    current: vk::ImageLayout,
}

impl LayoutTracker {
    /// Start tracking from `initial`
    pub const fn new(initial: vk::ImageLayout) -> Self {
        Self { current: initial }
    }

    /// Layout the last planned transition left the image in
    pub const fn current(&self) -> vk::ImageLayout {
        self.current
    }

    /// Plan a change to `new_layout` and record it as current.
    ///
    /// Returns `None` when the image is already in `new_layout`.
    ///
    /// # Panics
    ///
    /// Panics if `new_layout` is UNDEFINED or either layout is not tracked.
    pub fn plan(&mut self, new_layout: vk::ImageLayout) -> Option<LayoutTransition> {
        if new_layout == self.current {
            return None;
        }
        let dst = destination_scope(new_layout)
            .unwrap_or_else(|| panic!("cannot transition an image into layout {:?}", new_layout));
        let src = source_scope(self.current)
            .unwrap_or_else(|| panic!("cannot transition an image out of layout {:?}", self.current));

        let transition = LayoutTransition {
            old_layout: self.current,
            new_layout,
            src,
            dst,
        };
        self.current = new_layout;
        Some(transition)
    }
}

/// Panics unless `source` can be copied into `destination`
pub fn assert_copy_compatible(
    source: vk::Image,
    source_extent: vk::Extent2D,
    destination: vk::Image,
    destination_extent: vk::Extent2D,
) {
    assert_ne!(source, destination, "cannot copy an image onto itself");
    assert_eq!(
        source_extent, destination_extent,
        "image copy size mismatch: {:?} into {:?}",
        source_extent, destination_extent
    );
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

enum ImageBacking {
    Owned(ResourceHandle),
    External(vk::Image),
}

/// 2D color image with a view and a tracked layout
pub struct ImageResource {
    context: DeviceContext,
    backing: ImageBacking,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    tracker: LayoutTracker,
}

impl ImageResource {
    /// Usage flags of images created by [`ImageResource::new`]
    pub const USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
            | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
            | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
    );

    /// Create a device-local render target in UNDEFINED layout
    pub fn new(context: &DeviceContext, extent: vk::Extent2D, format: vk::Format) -> VulkanResult<Self> {
        let handle = ResourceHandle::create_image(
            context,
            extent,
            format,
            Self::USAGE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let view = create_view(context, handle.image(), format)?;

        Ok(Self {
            context: context.clone(),
            backing: ImageBacking::Owned(handle),
            view,
            format,
            extent,
            tracker: LayoutTracker::new(vk::ImageLayout::UNDEFINED),
        })
    }

    /// Wrap an image owned elsewhere (e.g. a swapchain image).
    ///
    /// The image is assumed to be in UNDEFINED layout and is not destroyed on
    /// drop; only the view created here is.
    pub fn from_external(
        context: &DeviceContext,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let view = create_view(context, image, format)?;
        Ok(Self {
            context: context.clone(),
            backing: ImageBacking::External(image),
            view,
            format,
            extent,
            tracker: LayoutTracker::new(vk::ImageLayout::UNDEFINED),
        })
    }

    /// Record a barrier moving the image to `new_layout`; records nothing when
    /// it is already there
    pub fn transition(&mut self, cmd: &mut CommandBuffer, new_layout: vk::ImageLayout) {
        cmd.assert_recording();
        let Some(transition) = self.tracker.plan(new_layout) else {
            return;
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image())
            .subresource_range(color_range())
            .src_access_mask(transition.src.access)
            .dst_access_mask(transition.dst.access)
            .build();

        unsafe {
            self.context.device().cmd_pipeline_barrier(
                cmd.handle(),
                transition.src.stage,
                transition.dst.stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Fill the whole image with `color`, leaving it in [`CLEAR_LAYOUT`]
    pub fn clear(&mut self, cmd: &mut CommandBuffer, color: [f32; 4]) {
        self.transition(cmd, CLEAR_LAYOUT);

        let clear_value = vk::ClearColorValue { float32: color };
        unsafe {
            self.context.device().cmd_clear_color_image(
                cmd.handle(),
                self.image(),
                CLEAR_LAYOUT,
                &clear_value,
                &[color_range()],
            );
        }
    }

    /// Copy all of `source` into this image.
    ///
    /// `source` ends in TRANSFER_SRC_OPTIMAL and this image in
    /// TRANSFER_DST_OPTIMAL.
    ///
    /// # Panics
    ///
    /// Panics if both wrap the same image or their extents differ.
    pub fn copy_from(&mut self, cmd: &mut CommandBuffer, source: &mut ImageResource) {
        assert_copy_compatible(source.image(), source.extent, self.image(), self.extent);

        source.transition(cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        self.transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: layers,
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        };

        unsafe {
            self.context.device().cmd_copy_image(
                cmd.handle(),
                source.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    /// Layout left by the last recorded command
    pub fn layout(&self) -> vk::ImageLayout {
        self.tracker.current()
    }

    /// Image dimensions
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Pixel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image handle
    pub fn image(&self) -> vk::Image {
        match &self.backing {
            ImageBacking::Owned(handle) => handle.image(),
            ImageBacking::External(image) => *image,
        }
    }

    /// Color view of the whole image
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Whether the image is owned elsewhere
    pub fn is_external(&self) -> bool {
        matches!(self.backing, ImageBacking::External(_))
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        unsafe {
            self.context.device().destroy_image_view(self.view, None);
        }
    }
}

fn create_view(context: &DeviceContext, image: vk::Image, format: vk::Format) -> VulkanResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(color_range());

    unsafe {
        context
            .device()
            .create_image_view(&view_info, None)
            .map_err(VulkanError::Api)
    }
}
