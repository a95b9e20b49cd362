// r_main.rs — renderer context and the per-view pipeline
//
// A view collects world surfaces, polys and entities into its draw list,
// sorts it, renders any portal views it found and finally draws the list.

use std::sync::Arc;

use fusion_common::q_shared::{
    box_on_plane_side, distance, dot_product, vector_add, vector_scale, vector_subtract, CPlane,
    Vec3, AXIS_FORWARD, VEC3_ORIGIN,
};

use crate::error::Result;
use crate::r_backend::{ClearBits, FboId, GpuBackend, RBackend, RenderTarget, StateBits, TextureFlags};
use crate::r_config::RenderConfig;
use crate::r_dynamic::CompactVertex;
use crate::r_math::{
    cull_box, cull_sphere, matrix4_multiply, matrix4_ortho_projection,
    matrix4_perspective_projection, matrix4_quake_modelview, setup_frustum, Mat4,
};
use crate::r_mesh::{DrawList, WORLDSURF_DIST};
use crate::r_model::{ModelKind, ModelMesh, SurfFlags, WorldModel};
use crate::r_portals::PortalTexturePool;
use crate::r_public::{Entity, EntityType, Poly, RdFlags, RefDef, RenderFx, NUM_CUSTOMCOLORS};
use crate::r_refinst::{RefInst, RefInstStack, RenderFlags, Z_BIAS, Z_NEAR};
use crate::r_scene::{Scene, SKY_ENT, WORLD_ENT};
use crate::r_shader::{Shader, ShaderFlags, ShaderRegistry};
use crate::r_sort::pack_opaque_order;
use crate::r_surface::DrawSurface;

pub const WORLD_LIST: usize = 0;
pub const PORTALMASK_LIST: usize = 1;
/// Portal views at depth N use list FIRST_PORTAL_LIST + N - 1.
pub const FIRST_PORTAL_LIST: usize = 2;

const POLYOFFSET_FACTOR: f32 = -1.0;
const POLYOFFSET_UNITS: f32 = -2.0;

/// Far clip of views that have no world to measure.
const NOWORLD_FAR_CLIP: f32 = 1024.0;

/// Per-scene counters, reset by every `render_scene`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub c_views: usize,
    pub max_view_depth: usize,
    pub c_world_draw_surfs: usize,
    pub c_ents_total: usize,
}

/// Everything the renderer keeps between frames.
pub struct RenderContext {
    pub config: RenderConfig,
    pub rb: RBackend,
    pub shaders: ShaderRegistry,
    pub world: Option<Arc<WorldModel>>,
    pub scene: Scene,
    /// The view being rendered.
    pub rn: RefInst,
    pub ri_stack: RefInstStack,
    pub(crate) lists: Vec<DrawList>,
    pub(crate) portal_textures: PortalTexturePool,
    /// Views rendered so far.
    pub frame_count: u32,
    registration_sequence: u32,
    world_model_sequence: i32,
    registration_open: bool,
    /// Size of the 2D projection while 2D mode is on.
    pub(crate) two_d: Option<(i32, i32)>,
    pub(crate) frame_buffer_width: i32,
    pub(crate) frame_buffer_height: i32,
    /// Where the finished frame goes, 0 for the window.
    pub render_target: FboId,
    pub(crate) null_vbo: Option<u32>,
    pub(crate) custom_colors: [[u8; 4]; NUM_CUSTOMCOLORS],
    pub(crate) transform_stack: Vec<(bool, Mat4)>,
    screen_tex: Option<RenderTarget>,
    screen_tex_copy: Option<RenderTarget>,
    pub stats: RenderStats,
}

impl RenderContext {
    pub fn new(gpu: Box<dyn GpuBackend>, config: RenderConfig) -> Result<Self> {
        Self::with_backend(RBackend::new(gpu), config)
    }

    pub fn with_backend(rb: RBackend, config: RenderConfig) -> Result<Self> {
        let shaders = ShaderRegistry::new()?;
        let ri_stack = RefInstStack::new(config.portal_max_depth);
        let (frame_buffer_width, frame_buffer_height) = rb.framebuffer_size(0);
        Ok(Self {
            config,
            rb,
            shaders,
            world: None,
            scene: Scene::new(),
            rn: RefInst::default(),
            ri_stack,
            lists: vec![DrawList::new(), DrawList::new()],
            portal_textures: PortalTexturePool::new(),
            frame_count: 0,
            registration_sequence: 1,
            world_model_sequence: 1,
            registration_open: false,
            two_d: None,
            frame_buffer_width,
            frame_buffer_height,
            render_target: 0,
            null_vbo: None,
            custom_colors: [[255; 4]; NUM_CUSTOMCOLORS],
            transform_stack: Vec::new(),
            screen_tex: None,
            screen_tex_copy: None,
            stats: RenderStats::default(),
        })
    }

    /// Brings up the backend and the renderer's own GPU resources.
    pub fn init(&mut self) {
        self.rb.init();
        self.init_null_model();
        self.init_screen_textures();
        log::debug!(
            "renderer initialized, {}x{}",
            self.frame_buffer_width,
            self.frame_buffer_height
        );
    }

    pub fn shutdown(&mut self) {
        self.rb.flush_dynamic_meshes();
        self.portal_textures.clear();
        self.screen_tex = None;
        self.screen_tex_copy = None;
        self.null_vbo = None;
        self.rb.shutdown();
    }

    /// Re-creates the framebuffer-sized targets after a window resize.
    pub fn resize_framebuffers(&mut self) {
        self.rb.gpu_mut().resize_framebuffers();
        self.portal_textures.clear();
        self.init_screen_textures();
    }

    /// Axis lines drawn for entities without a usable model.
    fn init_null_model(&mut self) {
        let axis = |dir: Vec3, color: [u8; 4]| {
            [
                CompactVertex { xyz: [0.0, 0.0, 0.0, 1.0], color, st: [0.0; 2] },
                CompactVertex {
                    xyz: [dir[0] * 15.0, dir[1] * 15.0, dir[2] * 15.0, 1.0],
                    color,
                    st: [0.0; 2],
                },
            ]
        };
        let mut verts = Vec::with_capacity(6);
        verts.extend_from_slice(&axis([1.0, 0.0, 0.0], [255, 0, 0, 127]));
        verts.extend_from_slice(&axis([0.0, 1.0, 0.0], [0, 255, 0, 127]));
        verts.extend_from_slice(&axis([0.0, 0.0, 1.0], [0, 0, 255, 127]));
        let elems: [u16; 6] = [0, 1, 2, 3, 4, 5];

        self.null_vbo = self.rb.create_static_vbo(bytemuck::cast_slice(&verts), &elems);
        if self.null_vbo.is_none() {
            log::warn!("init_null_model: failed to create the null model VBO");
        }
    }

    fn init_screen_textures(&mut self) {
        let (w, h) = self.rb.framebuffer_size(self.render_target);
        self.frame_buffer_width = w;
        self.frame_buffer_height = h;

        let flags = TextureFlags::FRAMEBUFFER | TextureFlags::DEPTHRB;
        let mut create = |rb: &mut RBackend, what: &str| {
            let target = rb.create_render_target(w, h, flags);
            if target.is_none() {
                let err = crate::RenderError::RenderTarget {
                    width: w,
                    height: h,
                    reason: what.to_string(),
                };
                log::warn!("{}", err);
            }
            target
        };
        self.screen_tex = create(&mut self.rb, "screen texture");
        self.screen_tex_copy = create(&mut self.rb, "screen depth copy");
    }

    // ============================================================
    // Registration
    // ============================================================

    pub fn registration_sequence(&self) -> u32 {
        self.registration_sequence
    }

    pub fn world_model_sequence(&self) -> i32 {
        self.world_model_sequence
    }

    /// Opens a registration cycle. The backend half runs from the pipe.
    pub fn begin_registration(&mut self) {
        self.rb.flush_dynamic_meshes();
        self.registration_sequence = self.registration_sequence.wrapping_add(1);
        self.registration_open = true;
    }

    /// Returns false if no registration was open.
    pub fn end_registration(&mut self) -> bool {
        std::mem::replace(&mut self.registration_open, false)
    }

    pub fn register_world(&mut self, world: Arc<WorldModel>) {
        log::debug!(
            "register_world: {} ({} surfaces, {} leafs)",
            world.name,
            world.surfaces.len(),
            world.leafs.len()
        );
        self.world = Some(world);
        self.world_model_sequence = self.world_model_sequence.wrapping_add(1);
    }

    // ============================================================
    // Scene submission
    // ============================================================

    pub fn clear_scene(&mut self) {
        self.ri_stack.clear();
        self.scene.clear();
    }

    pub fn add_entity_to_scene(&mut self, ent: &Entity) {
        self.scene.add_entity(ent);
    }

    pub fn add_poly_to_scene(&mut self, poly: &Poly) {
        self.scene.add_poly(poly);
    }

    pub fn add_light_to_scene(&mut self, origin: Vec3, intensity: f32, r: f32, g: f32, b: f32) {
        self.scene.add_light(origin, intensity, r, g, b);
    }

    pub fn add_light_style_to_scene(&mut self, style: i32, r: f32, g: f32, b: f32) {
        self.scene.add_light_style(style, r, g, b);
    }

    // ============================================================
    // View state
    // ============================================================

    /// Draw list for portal views at the given nesting depth.
    pub(crate) fn portal_list(&mut self, depth: usize) -> usize {
        let id = FIRST_PORTAL_LIST + depth.saturating_sub(1);
        while self.lists.len() <= id {
            self.lists.push(DrawList::new());
        }
        id
    }

    pub(crate) fn add_surf_to_list(
        &mut self,
        list: usize,
        entity_num: usize,
        shader: &Shader,
        light_style: i32,
        dist: f32,
        order: u32,
        portal: Option<usize>,
        surf: DrawSurface,
    ) -> Option<usize> {
        let entity = self.scene.entities.get(entity_num)?;
        self.lists
            .get_mut(list)?
            .add_surf(entity_num, entity, shader, light_style, dist, order, portal, surf)
    }

    pub(crate) fn default_far_clip(&self) -> f32 {
        let far = if self.rn.refdef.rdflags.contains(RdFlags::NOWORLDMODEL) {
            NOWORLD_FAR_CLIP
        } else {
            0.0
        };
        far.max(Z_NEAR) + Z_BIAS
    }

    /// Saves the current view. Fails once the depth cap is reached.
    pub(crate) fn push_ref_inst(&mut self) -> bool {
        if !self.ri_stack.push(&self.rn) {
            return false;
        }
        self.end_gl();
        true
    }

    pub(crate) fn pop_ref_inst(&mut self) {
        let Some(rn) = self.ri_stack.pop() else {
            return;
        };
        self.rb.flush_dynamic_meshes();
        self.rn = rn;
        self.bind_ref_inst_fbo();
        self.setup_gl();
    }

    pub(crate) fn bind_framebuffer(&mut self, fbo: FboId) {
        self.rb.bind_framebuffer(fbo);
        let (w, h) = self.rb.framebuffer_size(fbo);
        self.frame_buffer_width = w;
        self.frame_buffer_height = h;
    }

    fn bind_ref_inst_fbo(&mut self) {
        self.bind_framebuffer(self.rn.render_target);
    }

    /// Projection and camera matrices from the view's refdef. In ortho views
    /// the refdef fovs are the half extents of the view volume.
    pub(crate) fn setup_view_matrices(&mut self) {
        let rn = &mut self.rn;
        rn.view_origin = rn.refdef.vieworg;
        rn.view_axis = rn.refdef.viewaxis;
        rn.camera_matrix = matrix4_quake_modelview(&rn.view_origin, &rn.view_axis);

        rn.projection_matrix = if rn.refdef.rdflags.contains(RdFlags::USEORTHO) {
            let (x, y) = (rn.refdef.fov_x, rn.refdef.fov_y);
            matrix4_ortho_projection(-x, x, -y, y, -rn.far_clip, rn.far_clip)
        } else {
            matrix4_perspective_projection(rn.refdef.fov_x, rn.refdef.fov_y, rn.near_clip, rn.far_clip)
        };
        if rn.refdef.rdflags.contains(RdFlags::FLIPPED) {
            rn.projection_matrix[0] = -rn.projection_matrix[0];
            rn.render_flags |= RenderFlags::FLIPFRONTFACE;
        }

        rn.camera_projection_matrix = matrix4_multiply(&rn.projection_matrix, &rn.camera_matrix);
    }

    pub(crate) fn setup_view_frustum(&mut self) {
        let rn = &mut self.rn;
        rn.frustum = setup_frustum(
            &rn.view_origin,
            &rn.view_axis,
            rn.refdef.fov_x,
            rn.refdef.fov_y,
            rn.near_clip,
            rn.far_clip,
        );
        if rn.render_flags.contains(RenderFlags::CLIPPLANE) {
            rn.frustum[4] = rn.clip_plane;
        }
    }

    pub(crate) fn setup_pvs(&mut self) {
        self.rn.view_cluster = match &self.world {
            Some(world) if !self.rn.refdef.rdflags.contains(RdFlags::NOWORLDMODEL) => {
                world.point_cluster(&self.rn.pvs_origin)
            }
            _ => -1,
        };
    }

    /// Loads the view state into the backend.
    pub(crate) fn setup_gl(&mut self) {
        let [sx, sy, sw, sh] = self.rn.scissor;
        let [vx, vy, vw, vh] = self.rn.viewport;
        self.rb.scissor(sx, sy, sw, sh);
        self.rb.viewport(vx, vy, vw, vh);
        self.rb.set_zclip(self.rn.near_clip, self.rn.far_clip);
        self.rb.set_camera(&self.rn.view_origin, &self.rn.view_axis);
        self.rb.set_render_flags(self.rn.render_flags);
        self.rb.load_projection_matrix(&self.rn.projection_matrix);
        self.rb.load_camera_matrix(&self.rn.camera_matrix);
        self.transform_for_world();
        self.rb.polygon_offset(self.rn.polygon_factor, self.rn.polygon_units);

        let flipped = self.rn.render_flags.contains(RenderFlags::FLIPFRONTFACE);
        if flipped != self.rb.front_face_flipped() {
            self.rb.flip_front_face();
        }
        self.rb.set_state_mask(StateBits::all(), StateBits::empty());
    }

    pub(crate) fn end_gl(&mut self) {
        self.rb.flush_dynamic_meshes();
    }

    fn clear_view(&mut self) {
        let nested = self
            .rn
            .render_flags
            .intersects(RenderFlags::PORTALVIEW | RenderFlags::MIRRORVIEW);
        if nested && !self.rn.render_flags.contains(RenderFlags::PORTAL_CAPTURE) {
            // drawn into the parent's framebuffer through its depth mask
            return;
        }

        let mut bits = ClearBits::DEPTH;
        if self.rn.num_depth_portal_surfaces == 0
            && self.config.fast_sky
            && !self.rn.refdef.rdflags.contains(RdFlags::NOWORLDMODEL)
        {
            bits |= ClearBits::COLOR;
        }
        let (_, depth_max) = self.rb.depth_range();
        self.rb.clear(bits, [0.0, 0.0, 0.0, 1.0], depth_max);
    }

    // ============================================================
    // Views
    // ============================================================

    /// Builds, sorts and draws the current view.
    pub(crate) fn render_view(&mut self) {
        self.frame_count = self.frame_count.wrapping_add(1);
        self.stats.c_views += 1;
        self.stats.max_view_depth = self.stats.max_view_depth.max(self.ri_stack.depth());

        self.rn.view_origin = self.rn.refdef.vieworg;
        self.rn.view_axis = self.rn.refdef.viewaxis;
        self.rn.vis_mins = self.rn.view_origin;
        self.rn.vis_maxs = self.rn.view_origin;
        if self.config.draw_flat {
            self.rn.render_flags |= RenderFlags::DRAWFLAT;
        }
        if self.config.novis {
            self.rn.render_flags |= RenderFlags::NOVIS;
        }

        self.rn.portal_surfaces.clear();
        self.rn.num_depth_portal_surfaces = 0;
        self.rn.skyportal_surface = None;
        self.rn.sky_added = false;
        self.rn.entities.clear();

        let world = self.world.clone();
        let meshlist = self.rn.meshlist;
        self.lists[meshlist].clear(world.as_deref());
        if let Some(mask) = self.rn.portalmasklist {
            self.lists[mask].clear(world.as_deref());
        }

        if world.is_none() && !self.rn.refdef.rdflags.contains(RdFlags::NOWORLDMODEL) {
            return;
        }

        self.draw_world_node();
        self.draw_polys();
        self.cull_entities();
        self.draw_entities();

        let parallel_min = self.config.sort_parallel_min;
        self.lists[meshlist].sort(parallel_min);

        self.bind_ref_inst_fbo();
        self.setup_gl();
        self.clear_view();

        self.draw_portals();

        let nested = self
            .rn
            .render_flags
            .intersects(RenderFlags::MIRRORVIEW | RenderFlags::PORTALVIEW);
        if self.config.portal_only && !nested {
            let (_, depth_max) = self.rb.depth_range();
            self.rb.clear(ClearBits::DEPTH, [0.0; 4], depth_max);
            self.draw_portal_surfaces(meshlist);
            self.draw_sky_surfaces(meshlist);
            self.end_gl();
            return;
        }

        self.draw_surfaces(meshlist);
        if self.config.show_tris {
            self.draw_outlined_surfaces(meshlist);
        }

        self.transform_for_world();
        self.end_gl();
    }

    /// Renders a scene from the accumulated entities, polys and lights.
    pub fn render_scene(&mut self, fd: &RefDef) {
        self.end_2d();
        self.stats = RenderStats::default();
        self.ri_stack.set_max_depth(self.config.portal_max_depth);

        let world_view = !fd.rdflags.contains(RdFlags::NOWORLDMODEL);
        if world_view {
            self.scene.refdef = fd.clone();
            if self.scene.world_model_sequence != self.world_model_sequence {
                self.scene.world_model_sequence = self.world_model_sequence;
                self.scene.frame_count = self.scene.frame_count.wrapping_add(1);
            }
        }

        self.rn = RefInst {
            refdef: fd.clone(),
            meshlist: WORLD_LIST,
            portalmasklist: Some(PORTALMASK_LIST),
            render_target: self.render_target,
            polygon_factor: POLYOFFSET_FACTOR,
            polygon_units: POLYOFFSET_UNITS,
            clip_flags: 15,
            near_clip: Z_NEAR,
            ..Default::default()
        };
        self.rn.far_clip = self.default_far_clip();

        if world_view && self.config.soft_particles {
            if let (Some(tex), Some(copy)) = (self.screen_tex, self.screen_tex_copy) {
                self.rn.render_target = tex.fbo;
                self.rn.screen_tex_copy = Some(copy.fbo);
                self.rn.render_flags |= RenderFlags::SOFT_PARTICLES;
            }
        }

        // the backend origin is the bottom left corner
        let (_, fb_height) = self.rb.framebuffer_size(self.render_target);
        let flip_y = |y: i32, h: i32| fb_height - h - y;
        self.rn.scissor = if fd.scissor[2] > 0 && fd.scissor[3] > 0 {
            let [x, y, w, h] = fd.scissor;
            [x, flip_y(y, h), w, h]
        } else {
            [fd.x, flip_y(fd.y, fd.height), fd.width, fd.height]
        };
        self.rn.viewport = [fd.x, flip_y(fd.y, fd.height), fd.width, fd.height];

        self.rn.pvs_origin = fd.vieworg;
        self.rn.lod_origin = fd.vieworg;

        self.bind_framebuffer(0);

        self.setup_view_matrices();
        self.setup_view_frustum();
        self.setup_pvs();
        self.render_view();

        if self.rn.render_target != self.render_target {
            self.rb.blit_framebuffer(self.rn.render_target, self.render_target, ClearBits::COLOR);
        }
        self.bind_framebuffer(self.render_target);
        self.begin_2d();
    }

    // ============================================================
    // World
    // ============================================================

    /// Marks visible leafs and surfaces of the world, then queues the draw
    /// surfaces that have at least one visible surface.
    fn draw_world_node(&mut self) {
        let Some(world) = self.world.clone() else {
            return;
        };
        if !self.config.draw_world || self.rn.refdef.rdflags.contains(RdFlags::NOWORLDMODEL) {
            return;
        }

        let clip_flags = if self.config.nocull { 0 } else { self.rn.clip_flags };
        let novis = self.rn.render_flags.contains(RenderFlags::NOVIS) || self.rn.view_cluster < 0;
        let frustum = self.rn.frustum;
        let view_cluster = self.rn.view_cluster;
        let list_id = self.rn.meshlist;

        let mut surf_vis = vec![SurfVis::Hidden; world.surfaces.len()];
        let (mut vis_mins, mut vis_maxs) = (self.rn.vis_mins, self.rn.vis_maxs);
        {
            let list = &mut self.lists[list_id];
            for (i, leaf) in world.leafs.iter().enumerate() {
                if leaf.cluster < 0 || leaf.surfaces.is_empty() {
                    continue;
                }
                if !novis && !world.cluster_visible(view_cluster, leaf.cluster) {
                    continue;
                }
                let Some(partial) = cull_leaf(&frustum, &leaf.mins, &leaf.maxs, clip_flags) else {
                    continue;
                };

                list.world_leaf_vis[i] = true;
                for j in 0..3 {
                    vis_mins[j] = vis_mins[j].min(leaf.mins[j]);
                    vis_maxs[j] = vis_maxs[j].max(leaf.maxs[j]);
                }
                for &s in &leaf.surfaces {
                    let Some(vis) = surf_vis.get_mut(s) else {
                        continue;
                    };
                    if partial {
                        *vis = SurfVis::Partial;
                    } else if *vis == SurfVis::Hidden {
                        *vis = SurfVis::Full;
                    }
                }
            }

            for (s, surf) in world.surfaces.iter().enumerate() {
                let visible = match surf_vis[s] {
                    SurfVis::Hidden => false,
                    SurfVis::Full => true,
                    SurfVis::Partial => !cull_box(&frustum, &surf.mins, &surf.maxs, clip_flags),
                };
                if !visible || surf.flags.contains(SurfFlags::NODRAW) {
                    continue;
                }
                list.world_surf_vis[s] = true;
                if let Some(ds) = list.world_draw_surf_vis.get_mut(surf.draw_surf) {
                    *ds = true;
                }
            }
        }
        self.rn.vis_mins = vis_mins;
        self.rn.vis_maxs = vis_maxs;

        // the real far clip is known once the visible leafs are
        self.rn.far_clip = self.vis_far_clip().max(Z_NEAR) + Z_BIAS;
        self.setup_view_matrices();

        for ds in 0..world.draw_surfaces.len() {
            if self.lists[list_id].world_draw_surf_vis[ds] {
                self.add_world_draw_surface(WORLD_ENT, &world, ds, &VEC3_ORIGIN);
            }
        }
    }

    fn vis_far_clip(&self) -> f32 {
        let (mins, maxs) = (self.rn.vis_mins, self.rn.vis_maxs);
        let mut far: f32 = 0.0;
        for i in 0..8 {
            let corner = [
                if i & 1 != 0 { mins[0] } else { maxs[0] },
                if i & 2 != 0 { mins[1] } else { maxs[1] },
                if i & 4 != 0 { mins[2] } else { maxs[2] },
            ];
            far = far.max(distance(&corner, &self.rn.view_origin));
        }
        far
    }

    /// Queues a world draw surface for the given entity. Returns true if
    /// the surface is in the list, including when it already was.
    pub(crate) fn add_world_draw_surface(
        &mut self,
        entity: usize,
        world: &WorldModel,
        ds: usize,
        origin: &Vec3,
    ) -> bool {
        let Some(draw_surf) = world.draw_surfaces.get(ds) else {
            return false;
        };
        if draw_surf.vbo.is_none() {
            return false;
        }
        let list_id = self.rn.meshlist;
        if self.lists[list_id].draw_surf_added.get(ds).copied().unwrap_or(true) {
            return true;
        }

        let shader = draw_surf.shader.clone();
        let light_style = draw_surf.light_style;

        if shader.is_sky() {
            if self.config.fast_sky {
                return false;
            }
            self.lists[list_id].draw_surf_added[ds] = true;

            let portal = if self.rn.refdef.rdflags.contains(RdFlags::SKYPORTALINVIEW) {
                self.add_skyportal_surface(entity, &shader, ds)
            } else {
                None
            };

            if world.write_sky_depth {
                let depth_only = self.shaders.depth_only_shader.clone();
                if portal.is_none() {
                    if let Some(mask) = self.rn.portalmasklist {
                        self.add_surf_to_list(mask, entity, &depth_only, -1, 0.0, 0, None, DrawSurface::Bsp(ds));
                    }
                }
                self.add_surf_to_list(list_id, entity, &depth_only, light_style, 0.0, 0, portal, DrawSurface::Bsp(ds));
            }

            self.add_sky_surface(&shader, portal);
            self.stats.c_world_draw_surfs += 1;
            return true;
        }

        let portal = if shader.flags.contains(ShaderFlags::PORTAL) {
            self.add_portal_surface(entity, &shader)
        } else {
            None
        };

        let num_lightmaps = u32::from(shader.flags.contains(ShaderFlags::LIGHTMAP));
        let order = pack_opaque_order(&shader, num_lightmaps);
        self.lists[list_id].draw_surf_added[ds] = true;
        let added = self.add_surf_to_list(
            list_id,
            entity,
            &shader,
            light_style,
            WORLDSURF_DIST,
            order,
            portal,
            DrawSurface::Bsp(ds),
        );
        if added.is_none() {
            return false;
        }

        if let Some(p) = portal {
            if self.rn.portal_surfaces[p].is_depth_portal() {
                if let Some(mask) = self.rn.portalmasklist {
                    let depth_only = self.shaders.depth_only_shader.clone();
                    self.add_surf_to_list(mask, entity, &depth_only, -1, 0.0, 0, None, DrawSurface::Bsp(ds));
                }
            }
            self.update_portal_from_draw_surface(p, world, ds, origin);
        }

        self.stats.c_world_draw_surfs += 1;
        true
    }

    /// Queues the sky dome once per view.
    fn add_sky_surface(&mut self, shader: &Arc<Shader>, portal: Option<usize>) {
        if self.rn.sky_added {
            return;
        }
        let sky = self
            .world
            .as_ref()
            .and_then(|w| w.sky_shader.clone())
            .unwrap_or_else(|| shader.clone());
        let list = self.rn.meshlist;
        if self
            .add_surf_to_list(list, SKY_ENT, &sky, -1, 0.0, 0, portal, DrawSurface::Sky)
            .is_some()
        {
            self.rn.sky_added = true;
        }
    }

    // ============================================================
    // Entities and polys
    // ============================================================

    fn draw_polys(&mut self) {
        if self.rn.render_flags.contains(RenderFlags::ENVVIEW) {
            return;
        }
        let nonviewer = self.rn.render_flags.intersects(RenderFlags::NONVIEWERREF);
        let mirror = self.rn.render_flags.contains(RenderFlags::MIRRORVIEW);
        let list = self.rn.meshlist;

        for i in 0..self.scene.polys.len() {
            let poly = &self.scene.polys[i];
            if poly.renderfx.contains(RenderFx::WEAPONMODEL) && nonviewer {
                continue;
            }
            if poly.renderfx.contains(RenderFx::VIEWERMODEL) && !mirror {
                continue;
            }
            let Some(shader) = poly.shader.clone() else {
                continue;
            };
            let entity = Scene::poly_entity(poly.renderfx);
            self.add_surf_to_list(list, entity, &shader, -1, 0.0, i as u32, None, DrawSurface::Poly(i));
        }
    }

    /// Collects the client entities that survive culling into the view.
    fn cull_entities(&mut self) {
        let first = self.scene.entities.len() - self.scene.num_client_entities();
        let nonviewer = self.rn.render_flags.intersects(RenderFlags::NONVIEWERREF);
        let mirror = self.rn.render_flags.contains(RenderFlags::MIRRORVIEW);

        let mut visible = Vec::with_capacity(self.scene.num_client_entities());
        for num in first..self.scene.entities.len() {
            let e = &self.scene.entities[num];
            if e.renderfx.contains(RenderFx::WEAPONMODEL) && nonviewer {
                continue;
            }
            if e.renderfx.contains(RenderFx::VIEWERMODEL) && !mirror {
                continue;
            }
            let always = e.renderfx.intersects(RenderFx::WEAPONMODEL | RenderFx::NODEPTHTEST);
            if !always && e.rtype == EntityType::Model && self.cull_model_entity(e) {
                continue;
            }
            visible.push(num);
        }
        self.rn.entities = visible;
    }

    fn cull_model_entity(&self, e: &Entity) -> bool {
        if self.config.nocull {
            return false;
        }
        let Some(model) = &e.model else {
            return false;
        };
        if matches!(model.kind, ModelKind::Bad) {
            return false;
        }

        if e.is_rotated() {
            cull_sphere(&self.rn.frustum, &e.origin, model.radius * e.scale, self.rn.clip_flags)
        } else {
            let mins = vector_add(&e.origin, &vector_scale(&model.mins, e.scale));
            let maxs = vector_add(&e.origin, &vector_scale(&model.maxs, e.scale));
            cull_box(&self.rn.frustum, &mins, &maxs, self.rn.clip_flags)
        }
    }

    fn draw_entities(&mut self) {
        if !self.config.draw_entities || self.rn.render_flags.contains(RenderFlags::ENVVIEW) {
            return;
        }

        for i in 0..self.rn.entities.len() {
            let num = self.rn.entities[i];
            let e = &self.scene.entities[num];
            match e.rtype {
                EntityType::Model => match e.model.clone() {
                    None => self.add_null_surface(num),
                    Some(model) => match &model.kind {
                        ModelKind::Alias(meshes) => self.add_model_meshes(num, &model, meshes, false),
                        ModelKind::Skeletal(meshes) => self.add_model_meshes(num, &model, meshes, true),
                        ModelKind::Brush(_) => self.add_brush_model(num),
                        ModelKind::Bad => self.add_null_surface(num),
                    },
                },
                EntityType::Sprite => self.add_sprite(num),
                _ => {}
            }
            self.stats.c_ents_total += 1;
        }
    }

    fn add_model_meshes(
        &mut self,
        num: usize,
        model: &Arc<crate::r_model::Model>,
        meshes: &[ModelMesh],
        skeletal: bool,
    ) {
        let e = &self.scene.entities[num];
        let custom_shader = e.custom_shader.clone();
        let dist = dot_product(
            &vector_subtract(&e.origin, &self.rn.view_origin),
            &self.rn.view_axis[AXIS_FORWARD],
        );
        let list = self.rn.meshlist;

        for (i, mesh) in meshes.iter().enumerate() {
            let shader = custom_shader.clone().unwrap_or_else(|| mesh.shader.clone());
            let surf = if skeletal {
                DrawSurface::Skeletal { model: model.clone(), mesh: i }
            } else {
                DrawSurface::Alias { model: model.clone(), mesh: i }
            };
            self.add_surf_to_list(list, num, &shader, -1, dist, 0, None, surf);
        }
    }

    fn add_brush_model(&mut self, num: usize) {
        let Some(world) = self.world.clone() else {
            return;
        };
        let e = &self.scene.entities[num];
        let Some(model) = e.model.clone() else {
            return;
        };
        let ModelKind::Brush(bmodel) = &model.kind else {
            return;
        };
        let origin = e.origin;
        let (mins, maxs) = if e.is_rotated() {
            let r = model.radius * e.scale;
            (
                vector_subtract(&origin, &[r, r, r]),
                vector_add(&origin, &[r, r, r]),
            )
        } else {
            (
                vector_add(&origin, &vector_scale(&model.mins, e.scale)),
                vector_add(&origin, &vector_scale(&model.maxs, e.scale)),
            )
        };

        let list_id = self.rn.meshlist;
        let mut num_visible = 0;
        {
            let list = &mut self.lists[list_id];
            for &s in &bmodel.surfaces {
                let Some(surf) = world.surfaces.get(s) else {
                    continue;
                };
                if surf.flags.contains(SurfFlags::NODRAW) {
                    continue;
                }
                list.world_surf_vis[s] = true;
                if let Some(ds) = list.world_draw_surf_vis.get_mut(surf.draw_surf) {
                    *ds = true;
                }
                num_visible += 1;
            }
        }
        if num_visible == 0 {
            return;
        }

        for &ds in &bmodel.draw_surfaces {
            if self.lists[list_id].world_draw_surf_vis.get(ds).copied().unwrap_or(false) {
                self.add_world_draw_surface(num, &world, ds, &origin);
            }
        }

        for j in 0..3 {
            self.rn.vis_mins[j] = self.rn.vis_mins[j].min(mins[j]);
            self.rn.vis_maxs[j] = self.rn.vis_maxs[j].max(maxs[j]);
        }
    }

    fn add_sprite(&mut self, num: usize) {
        let e = &self.scene.entities[num];
        let dist = dot_product(
            &vector_subtract(&e.origin, &self.rn.view_origin),
            &self.rn.view_axis[AXIS_FORWARD],
        );
        if dist <= 0.0 {
            return;
        }
        let Some(shader) = e.custom_shader.clone() else {
            return;
        };
        let list = self.rn.meshlist;
        self.add_surf_to_list(list, num, &shader, -1, dist, 0, None, DrawSurface::Sprite);
    }

    fn add_null_surface(&mut self, num: usize) {
        let shader = self.shaders.white_shader.clone();
        let list = self.rn.meshlist;
        self.add_surf_to_list(list, num, &shader, -1, 0.0, 0, None, DrawSurface::NullModel);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SurfVis {
    Hidden,
    /// In a leaf that straddles the frustum, needs its own cull.
    Partial,
    Full,
}

/// None when the box is outside an enabled plane, otherwise whether it
/// straddles one.
fn cull_leaf(frustum: &[CPlane; 6], mins: &Vec3, maxs: &Vec3, clip_flags: u32) -> Option<bool> {
    let mut partial = false;
    for (i, plane) in frustum.iter().enumerate() {
        if clip_flags & (1 << i) == 0 {
            continue;
        }
        match box_on_plane_side(mins, maxs, plane) {
            2 => return None,
            3 => partial = true,
            _ => {}
        }
    }
    Some(partial)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use crate::r_backend::testing::{GpuCall, TraceBackend};
    use crate::r_model::{Leaf, Mesh, Model, WorldDrawSurface, WorldSurface};
    use crate::r_public::{MAX_ENTITIES, RenderFx};
    use crate::r_shader::{ShaderDesc, ShaderSort};
    use crate::r_surface::SurfaceType;

    /// A quad with two triangles.
    pub fn quad_mesh(verts: [Vec3; 4]) -> Mesh {
        Mesh {
            xyz: verts.iter().map(|v| [v[0], v[1], v[2], 1.0]).collect(),
            elems: vec![0, 1, 2, 0, 2, 3],
            ..Default::default()
        }
    }

    /// A wall in two pieces at x=128 facing the origin, sharing one draw
    /// surface, and a floor under the view in a second draw surface.
    pub fn box_room(ctx: &mut RenderContext) -> WorldModel {
        let opaque = |flags: ShaderFlags| ShaderDesc {
            flags: ShaderFlags::DEPTHWRITE | flags,
            sort: ShaderSort::Opaque,
            ..Default::default()
        };
        let wall = ctx.shaders.register("textures/wall", opaque(ShaderFlags::empty()));
        let floor = ctx.shaders.register("textures/floor", opaque(ShaderFlags::CULL_FRONT));

        let lower = quad_mesh([
            [128.0, -64.0, -64.0],
            [128.0, 64.0, -64.0],
            [128.0, 64.0, 64.0],
            [128.0, -64.0, 64.0],
        ]);
        let upper = quad_mesh([
            [128.0, -64.0, 64.0],
            [128.0, 64.0, 64.0],
            [128.0, 64.0, 128.0],
            [128.0, -64.0, 128.0],
        ]);
        let ground = quad_mesh([
            [0.0, -64.0, -64.0],
            [0.0, 64.0, -64.0],
            [128.0, 64.0, -64.0],
            [128.0, -64.0, -64.0],
        ]);

        let surfaces = vec![
            WorldSurface {
                mesh: lower,
                mins: [128.0, -64.0, -64.0],
                maxs: [128.0, 64.0, 64.0],
                draw_surf: 0,
                first_draw_surf_vert: 0,
                first_draw_surf_elem: 0,
                ..Default::default()
            },
            WorldSurface {
                mesh: upper,
                mins: [128.0, -64.0, 64.0],
                maxs: [128.0, 64.0, 128.0],
                draw_surf: 0,
                first_draw_surf_vert: 4,
                first_draw_surf_elem: 6,
                ..Default::default()
            },
            WorldSurface {
                mesh: ground,
                mins: [0.0, -64.0, -64.0],
                maxs: [128.0, 64.0, -64.0],
                draw_surf: 1,
                ..Default::default()
            },
        ];
        let draw_surfaces = vec![
            WorldDrawSurface {
                shader: wall,
                vbo: Some(1),
                first_vbo_vert: 0,
                first_vbo_elem: 0,
                surfaces: vec![0, 1],
                light_style: -1,
            },
            WorldDrawSurface {
                shader: floor,
                vbo: Some(1),
                first_vbo_vert: 8,
                first_vbo_elem: 12,
                surfaces: vec![2],
                light_style: -1,
            },
        ];

        WorldModel {
            name: "maps/box.bsp".into(),
            surfaces,
            draw_surfaces,
            leafs: vec![Leaf {
                mins: [-1024.0; 3],
                maxs: [1024.0; 3],
                cluster: 0,
                surfaces: vec![0, 1, 2],
            }],
            mins: [-1024.0; 3],
            maxs: [1024.0; 3],
            ..Default::default()
        }
    }

    fn refdef() -> RefDef {
        RefDef { width: 800, height: 600, ..Default::default() }
    }

    fn room_context(config: RenderConfig) -> (RenderContext, crate::r_backend::testing::Trace) {
        let (rb, trace) = TraceBackend::rbackend();
        let mut ctx = RenderContext::with_backend(rb, config).unwrap();
        let world = box_room(&mut ctx);
        ctx.register_world(Arc::new(world));
        (ctx, trace)
    }

    fn draws(trace: &crate::r_backend::testing::Trace) -> Vec<GpuCall> {
        trace
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GpuCall::Draw { .. }))
            .collect()
    }

    #[test]
    fn test_render_scene_merges_contiguous_world_surfaces() {
        let (mut ctx, trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.render_scene(&refdef());

        assert_eq!(
            draws(&trace),
            vec![
                GpuCall::Draw { first_vert: 0, num_verts: 8, first_elem: 0, num_elems: 12 },
                GpuCall::Draw { first_vert: 8, num_verts: 4, first_elem: 12, num_elems: 6 },
            ]
        );
        assert_eq!(ctx.stats.c_views, 1);
        assert_eq!(ctx.stats.c_world_draw_surfs, 2);
    }

    #[test]
    fn test_resort_gives_identical_batches() {
        let (mut ctx, trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        let first = draws(&trace);

        trace.clear();
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        assert_eq!(draws(&trace), first);
    }

    #[test]
    fn test_entity_cap_renders_max_entities() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        let sprite = Entity {
            rtype: EntityType::Sprite,
            origin: [64.0, 0.0, 0.0],
            radius: 8.0,
            custom_shader: Some(ctx.shaders.white_shader.clone()),
            ..Default::default()
        };
        ctx.clear_scene();
        for _ in 0..MAX_ENTITIES + 5 {
            ctx.add_entity_to_scene(&sprite);
        }
        ctx.render_scene(&refdef());

        assert_eq!(ctx.rn.entities.len(), MAX_ENTITIES);
        let sprites = ctx.lists[WORLD_LIST]
            .surfs
            .iter()
            .filter(|s| s.surf.surface_type() == SurfaceType::Sprite)
            .count();
        assert_eq!(sprites, MAX_ENTITIES);
    }

    #[test]
    fn test_no_world_draws_nothing() {
        let (rb, trace) = TraceBackend::rbackend();
        let mut ctx = RenderContext::with_backend(rb, RenderConfig::default()).unwrap();
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        assert_eq!(trace.draw_count(), 0);
        assert_eq!(ctx.stats.c_views, 1);
    }

    #[test]
    fn test_drawworld_off_skips_world() {
        let config = RenderConfig { draw_world: false, ..Default::default() };
        let (mut ctx, trace) = room_context(config);
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        assert_eq!(trace.draw_count(), 0);
        assert!(ctx.lists[WORLD_LIST].is_empty());
    }

    #[test]
    fn test_far_clip_follows_visible_leafs() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        let corner = (3.0f32 * 1024.0 * 1024.0).sqrt();
        assert_relative_eq!(ctx.rn.far_clip, corner + Z_BIAS, epsilon = 1e-2);
    }

    #[test]
    fn test_surfaces_behind_view_are_culled() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        let fd = RefDef {
            viewaxis: [[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]],
            ..refdef()
        };
        ctx.render_scene(&fd);
        assert!(!ctx.lists[WORLD_LIST].world_surf_vis[0]);
        assert!(!ctx.lists[WORLD_LIST].world_draw_surf_vis[0]);

        let config = RenderConfig { nocull: true, ..Default::default() };
        ctx.config = config;
        ctx.clear_scene();
        ctx.render_scene(&fd);
        assert!(ctx.lists[WORLD_LIST].world_surf_vis[0]);
    }

    #[test]
    fn test_soft_particles_resolve_to_window() {
        let (mut ctx, trace) = room_context(RenderConfig::default());
        ctx.init();
        let screen = ctx.screen_tex.unwrap();
        ctx.clear_scene();
        ctx.render_scene(&refdef());

        assert!(trace.calls().contains(&GpuCall::Blit {
            src: screen.fbo,
            dst: 0,
            bits: ClearBits::COLOR
        }));
        assert_eq!(ctx.rb.bound_framebuffer(), 0);
        assert!(ctx.two_d.is_some());
    }

    #[test]
    fn test_viewer_model_only_in_mirrors() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.add_entity_to_scene(&Entity {
            renderfx: RenderFx::VIEWERMODEL,
            ..Default::default()
        });
        ctx.add_entity_to_scene(&Entity {
            renderfx: RenderFx::WEAPONMODEL,
            ..Default::default()
        });
        let viewer = crate::r_scene::NUM_LOCAL_ENTITIES;

        ctx.cull_entities();
        assert_eq!(ctx.rn.entities, vec![viewer + 1]);

        ctx.rn.render_flags = RenderFlags::MIRRORVIEW;
        ctx.cull_entities();
        assert_eq!(ctx.rn.entities, vec![viewer]);
    }

    #[test]
    fn test_bad_model_gets_null_surface() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.add_entity_to_scene(&Entity {
            model: Some(Arc::new(Model::default())),
            origin: [64.0, 0.0, 0.0],
            ..Default::default()
        });
        ctx.render_scene(&refdef());
        let nulls = ctx.lists[WORLD_LIST]
            .surfs
            .iter()
            .filter(|s| s.surf == DrawSurface::NullModel)
            .count();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_world_model_change_bumps_scene_frame() {
        let (mut ctx, _trace) = room_context(RenderConfig::default());
        ctx.clear_scene();
        ctx.render_scene(&refdef());
        let frame = ctx.scene.frame_count;

        ctx.render_scene(&refdef());
        assert_eq!(ctx.scene.frame_count, frame);

        let world = box_room(&mut ctx);
        ctx.register_world(Arc::new(world));
        ctx.render_scene(&refdef());
        assert_eq!(ctx.scene.frame_count, frame + 1);
    }
}
