// r_refinst.rs — per-view render state and its save/restore stack

use bitflags::bitflags;
use fusion_common::q_shared::{CPlane, Mat3, Vec3, AXIS_IDENTITY, VEC3_ORIGIN};

use crate::r_backend::FboId;
use crate::r_math::{Mat4, MAT4_IDENTITY};
use crate::r_portals::PortalSurface;
use crate::r_public::RefDef;

pub const Z_NEAR: f32 = 4.0;
pub const Z_BIAS: f32 = 64.0;

/// Hard ceiling on nested views.
pub const REFINST_STACK_SIZE: usize = 64;

bitflags! {
    /// Render flags of a view.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RenderFlags: u32 {
        const MIRRORVIEW     = 1 << 0;
        const PORTALVIEW     = 1 << 1;
        const ENVVIEW        = 1 << 2;
        const SHADOWMAPVIEW  = 1 << 3;
        const FLIPFRONTFACE  = 1 << 4;
        const DRAWFLAT       = 1 << 5;
        const CLIPPLANE      = 1 << 6;
        const NOVIS          = 1 << 7;
        const LIGHTMAP       = 1 << 8;
        const SOFT_PARTICLES = 1 << 9;
        const PORTAL_CAPTURE = 1 << 10;
        const LIGHTVIEW      = 1 << 12;
        const NOENTS         = 1 << 13;
        const SKYSHADOWVIEW  = 1 << 14;

        const NONVIEWERREF = Self::PORTALVIEW.bits()
            | Self::MIRRORVIEW.bits()
            | Self::ENVVIEW.bits()
            | Self::SHADOWMAPVIEW.bits()
            | Self::LIGHTVIEW.bits()
            | Self::SKYSHADOWVIEW.bits();
    }
}

/// Complete state of one view.
#[derive(Clone, Debug, PartialEq)]
pub struct RefInst {
    pub refdef: RefDef,
    pub view_origin: Vec3,
    pub view_axis: Mat3,
    pub projection_matrix: Mat4,
    pub camera_matrix: Mat4,
    pub camera_projection_matrix: Mat4,

    pub frustum: [CPlane; 6],
    pub clip_plane: CPlane,
    pub clip_flags: u32,

    pub scissor: [i32; 4],
    pub viewport: [i32; 4],
    pub render_flags: RenderFlags,
    pub near_clip: f32,
    pub far_clip: f32,
    pub polygon_factor: f32,
    pub polygon_units: f32,

    /// Draw list this view fills.
    pub meshlist: usize,
    /// Draw list of depth-only portal masks, top-level views only.
    pub portalmasklist: Option<usize>,
    pub render_target: FboId,
    /// Framebuffer holding a copy of the depth buffer for soft particles.
    pub screen_tex_copy: Option<FboId>,

    pub pvs_origin: Vec3,
    pub lod_origin: Vec3,
    pub view_cluster: i32,

    pub portal_surfaces: Vec<PortalSurface>,
    pub num_depth_portal_surfaces: usize,
    pub skyportal_surface: Option<usize>,

    /// Scene entity numbers that passed culling.
    pub entities: Vec<usize>,
    pub vis_mins: Vec3,
    pub vis_maxs: Vec3,
    pub sky_added: bool,
}

impl Default for RefInst {
    fn default() -> Self {
        Self {
            refdef: RefDef::default(),
            view_origin: VEC3_ORIGIN,
            view_axis: AXIS_IDENTITY,
            projection_matrix: MAT4_IDENTITY,
            camera_matrix: MAT4_IDENTITY,
            camera_projection_matrix: MAT4_IDENTITY,
            frustum: [CPlane::default(); 6],
            clip_plane: CPlane::default(),
            clip_flags: 15,
            scissor: [0; 4],
            viewport: [0; 4],
            render_flags: RenderFlags::empty(),
            near_clip: Z_NEAR,
            far_clip: Z_NEAR + Z_BIAS,
            polygon_factor: 0.0,
            polygon_units: 0.0,
            meshlist: 0,
            portalmasklist: None,
            render_target: 0,
            screen_tex_copy: None,
            pvs_origin: VEC3_ORIGIN,
            lod_origin: VEC3_ORIGIN,
            view_cluster: -1,
            portal_surfaces: Vec::new(),
            num_depth_portal_surfaces: 0,
            skyportal_surface: None,
            entities: Vec::new(),
            vis_mins: VEC3_ORIGIN,
            vis_maxs: VEC3_ORIGIN,
            sky_added: false,
        }
    }
}

/// Saved parent views. `push` fails once `max_depth` views are nested.
#[derive(Debug)]
pub struct RefInstStack {
    saved: Vec<RefInst>,
    max_depth: usize,
}

impl RefInstStack {
    pub fn new(max_depth: usize) -> Self {
        let max_depth = max_depth.min(REFINST_STACK_SIZE);
        Self {
            saved: Vec::with_capacity(max_depth),
            max_depth,
        }
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth.min(REFINST_STACK_SIZE);
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Number of views currently saved, which is the nesting depth of the
    /// active view.
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    pub fn is_full(&self) -> bool {
        self.saved.len() >= self.max_depth
    }

    pub fn push(&mut self, rn: &RefInst) -> bool {
        if self.is_full() {
            return false;
        }
        self.saved.push(rn.clone());
        true
    }

    pub fn pop(&mut self) -> Option<RefInst> {
        self.saved.pop()
    }

    /// The most recently saved view.
    pub fn top(&self) -> Option<&RefInst> {
        self.saved.last()
    }

    pub fn clear(&mut self) {
        self.saved.clear();
    }
}
