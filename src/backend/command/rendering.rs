//! Dynamic rendering descriptions.
//!
//! [`RenderingDesc`] is the declarative input of
//! [`CommandList::begin_rendering`](super::CommandList::begin_rendering).
//! Turning it into the native `vk::RenderingInfo` happens here, in one place,
//! so changes to the native struct shape stay local.
//!
//! ```ignore
//! let desc = RenderingDesc {
//!     color_attachments: vec![AttachmentDesc::new(&target).clear_color([0.0, 0.0, 0.0, 1.0])],
//!     depth_attachment: Some(AttachmentDesc::new(&depth).clear_depth_stencil(1.0, 0)),
//!     ..Default::default()
//! };
//! cmd.begin_rendering(&desc);
//! ```

use ash::vk;

use crate::backend::image::ImageHandle;
use crate::backend::raw::RawDevice;

/// Multisample resolve destination of an attachment
#[derive(Clone)]
pub struct ResolveTarget {
    pub image: ImageHandle,
    pub mode: vk::ResolveModeFlags,
}

/// One colour, depth or stencil target of a rendering scope
#[derive(Clone)]
pub struct AttachmentDesc {
    pub image: ImageHandle,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
    pub resolve: Option<ResolveTarget>,
}

impl AttachmentDesc {
    /// Load and store the existing contents
    pub fn new(image: &ImageHandle) -> Self {
        Self {
            image: image.clone(),
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue::default(),
            resolve: None,
        }
    }

    pub fn clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.load_op = vk::AttachmentLoadOp::CLEAR;
        self.clear_value = vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        };
        self
    }

    pub fn clear_depth_stencil(mut self, depth: f32, stencil: u32) -> Self {
        self.load_op = vk::AttachmentLoadOp::CLEAR;
        self.clear_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        };
        self
    }

    pub fn load_op(mut self, load_op: vk::AttachmentLoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn store_op(mut self, store_op: vk::AttachmentStoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn resolve_into(mut self, image: &ImageHandle, mode: vk::ResolveModeFlags) -> Self {
        self.resolve = Some(ResolveTarget {
            image: image.clone(),
            mode,
        });
        self
    }
}

/// Declarative description of a rendering scope
#[derive(Clone, Default)]
pub struct RenderingDesc {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
    pub stencil_attachment: Option<AttachmentDesc>,
    /// Derived from the attachments when `None`
    pub render_area: Option<vk::Rect2D>,
}

/// Role of an attachment, decides which layouts it may be rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachmentKind {
    Color,
    Depth,
    Stencil,
}

impl AttachmentKind {
    /// Layout an attachment is moved to when its tracked layout is unusable
    pub fn optimal_layout(self) -> vk::ImageLayout {
        match self {
            AttachmentKind::Color => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            AttachmentKind::Depth | AttachmentKind::Stencil => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
        }
    }

    pub fn accepts(self, layout: vk::ImageLayout) -> bool {
        use ash::vk::ImageLayout as L;
        match self {
            AttachmentKind::Color => matches!(
                layout,
                L::COLOR_ATTACHMENT_OPTIMAL | L::ATTACHMENT_OPTIMAL | L::GENERAL
            ),
            AttachmentKind::Depth => matches!(
                layout,
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    | L::DEPTH_ATTACHMENT_OPTIMAL
                    | L::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
                    | L::ATTACHMENT_OPTIMAL
                    | L::GENERAL
            ),
            AttachmentKind::Stencil => matches!(
                layout,
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    | L::STENCIL_ATTACHMENT_OPTIMAL
                    | L::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
                    | L::ATTACHMENT_OPTIMAL
                    | L::GENERAL
            ),
        }
    }
}

/// Render area used when none is given explicitly.
///
/// Priority: explicit area, first colour attachment, depth, stencil. With no
/// attachments at all the area is empty, which is valid and renders nothing.
pub fn resolve_render_area(desc: &RenderingDesc) -> vk::Rect2D {
    if let Some(area) = desc.render_area {
        return area;
    }

    let extent = desc
        .color_attachments
        .first()
        .or(desc.depth_attachment.as_ref())
        .or(desc.stencil_attachment.as_ref())
        .map(|attachment| attachment.image.extent())
        .unwrap_or_default();

    vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    }
}

/// Attachment as it will be handed to the driver, resolved against the
/// image's tracked layout.
#[derive(Clone, Copy)]
pub(crate) struct AttachmentRecord {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
    pub resolve_mode: vk::ResolveModeFlags,
    pub resolve_view: vk::ImageView,
    pub resolve_layout: vk::ImageLayout,
}

impl AttachmentRecord {
    /// Snapshot of `desc` against the current tracked layouts. Taken after
    /// every attachment transition of the scope has been recorded.
    pub fn from_desc(desc: &AttachmentDesc) -> Self {
        let (resolve_mode, resolve_view, resolve_layout) = match &desc.resolve {
            Some(target) => (target.mode, target.image.vk_view(), target.image.layout()),
            None => (
                vk::ResolveModeFlags::NONE,
                vk::ImageView::null(),
                vk::ImageLayout::UNDEFINED,
            ),
        };

        Self {
            view: desc.image.vk_view(),
            layout: desc.image.layout(),
            load_op: desc.load_op,
            store_op: desc.store_op,
            clear_value: desc.clear_value,
            resolve_mode,
            resolve_view,
            resolve_layout,
        }
    }

    pub fn to_vk(&self) -> vk::RenderingAttachmentInfo {
        vk::RenderingAttachmentInfo::builder()
            .image_view(self.view)
            .image_layout(self.layout)
            .resolve_mode(self.resolve_mode)
            .resolve_image_view(self.resolve_view)
            .resolve_image_layout(self.resolve_layout)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .clear_value(self.clear_value)
            .build()
    }
}

/// Issue the native begin-rendering call.
///
/// The native attachment array and optional depth/stencil structs are locals
/// of this function, so every pointer in `vk::RenderingInfo` outlives the call.
pub(crate) fn cmd_begin_rendering(
    raw_device: &dyn RawDevice,
    cmd: vk::CommandBuffer,
    render_area: vk::Rect2D,
    colors: &[AttachmentRecord],
    depth: Option<&AttachmentRecord>,
    stencil: Option<&AttachmentRecord>,
) {
    let color_infos: Vec<vk::RenderingAttachmentInfo> =
        colors.iter().map(AttachmentRecord::to_vk).collect();
    let depth_info = depth.map(AttachmentRecord::to_vk);
    let stencil_info = stencil.map(AttachmentRecord::to_vk);

    let mut info = vk::RenderingInfo::builder()
        .render_area(render_area)
        .layer_count(1)
        .color_attachments(&color_infos);

    if let Some(depth_info) = depth_info.as_ref() {
        info = info.depth_attachment(depth_info);
    }
    if let Some(stencil_info) = stencil_info.as_ref() {
        info = info.stencil_attachment(stencil_info);
    }

    raw_device.cmd_begin_rendering(cmd, &info);
}
