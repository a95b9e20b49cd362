// r_portals.rs — portal, mirror and sky portal views
//
// Portal surfaces are gathered while the world draw list is built. Once the
// list is sorted, every surviving portal pushes the current view, renders a
// child view through it and pops back. The nesting is bounded by the
// RefInst stack depth.

use std::sync::Arc;

use fusion_common::q_shared::{
    add_point_to_bounds, clear_bounds, distance, dot_product, matrix3_multiply, matrix3_normalize,
    matrix3_transform_vector, matrix3_transpose, normal_vector_to_axis, plane_diff,
    plane_from_points, vector_add, vector_compare, vector_ma, vector_negate, vector_reflect,
    vector_scale, vector_subtract, CPlane, Mat3, Vec3, AXIS_FORWARD, AXIS_RIGHT, AXIS_UP,
    VEC3_ORIGIN,
};

use crate::error::RenderError;
use crate::r_backend::{ClearBits, RBackend, RenderTarget, StateBits, TextureFlags};
use crate::r_model::{Mesh, WorldModel};
use crate::r_public::{EntityType, RdFlags, RenderFx};
use crate::r_refinst::{RenderFlags, Z_NEAR};
use crate::r_shader::{Shader, ShaderFlags};
use crate::r_surface::DrawSurface;
use crate::RenderContext;

pub const MAX_PORTAL_SURFACES: usize = 32;
pub const MAX_PORTAL_TEXTURES: usize = 64;

const BACKFACE_EPSILON: f32 = 4.0;

/// How far a portal entity may sit from the surface plane and still own it.
const PORTAL_ENTITY_RANGE: f32 = 64.0;

/// A portal, mirror or sky portal seen in the current view.
#[derive(Clone, Debug, PartialEq)]
pub struct PortalSurface {
    pub entity: usize,
    pub shader: Arc<Shader>,
    pub plane: CPlane,
    /// Plane in world space before the entity rotation, used to match
    /// portal entities.
    pub untransformed_plane: CPlane,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub centre: Vec3,
    /// Reflection and refraction captures.
    pub textures: [Option<RenderTarget>; 2],
    pub sky_portal: bool,
}

impl PortalSurface {
    fn new(entity: usize, shader: Arc<Shader>) -> Self {
        let mut mins = VEC3_ORIGIN;
        let mut maxs = VEC3_ORIGIN;
        clear_bounds(&mut mins, &mut maxs);
        Self {
            entity,
            shader,
            plane: CPlane::default(),
            untransformed_plane: CPlane::default(),
            mins,
            maxs,
            centre: VEC3_ORIGIN,
            textures: [None; 2],
            sky_portal: false,
        }
    }

    /// Portals that only need the depth mask, not an off-screen capture.
    pub fn is_depth_portal(&self) -> bool {
        !self
            .shader
            .flags
            .intersects(ShaderFlags::PORTAL_CAPTURE | ShaderFlags::PORTAL_CAPTURE2)
    }
}

// ============================================================
// Capture texture pool
// ============================================================

#[derive(Clone, Copy, Debug)]
struct PortalTexture {
    target: RenderTarget,
    frame: u32,
}

/// Off-screen targets for portal captures. A slot is handed out at most
/// once per scene frame.
#[derive(Debug)]
pub struct PortalTexturePool {
    slots: Vec<Option<PortalTexture>>,
}

impl Default for PortalTexturePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalTexturePool {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_PORTAL_TEXTURES],
        }
    }

    pub fn get(
        &mut self,
        rb: &mut RBackend,
        width: i32,
        height: i32,
        flags: TextureFlags,
        frame: u32,
    ) -> Option<RenderTarget> {
        let flags = flags | TextureFlags::FRAMEBUFFER | TextureFlags::DEPTHRB;
        let matches = |t: &PortalTexture| {
            t.target.width == width && t.target.height == height && t.target.flags == flags
        };

        let mut best = None;
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                None => {
                    best = Some(i);
                    break;
                }
                Some(t) if t.frame == frame => continue,
                Some(t) if matches(t) => {
                    best = Some(i);
                    break;
                }
                Some(_) => {
                    if best.is_none() {
                        best = Some(i);
                    }
                }
            }
        }
        let i = best?;

        match self.slots[i] {
            Some(ref mut t) if matches(t) => {
                t.frame = frame;
                Some(t.target)
            }
            _ => match rb.create_render_target(width, height, flags) {
                Some(target) => {
                    self.slots[i] = Some(PortalTexture { target, frame });
                    Some(target)
                }
                None => {
                    let err = RenderError::RenderTarget {
                        width,
                        height,
                        reason: format!("portal texture slot {}", i),
                    };
                    log::warn!("{}", err);
                    None
                }
            },
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

// ============================================================
// Collection
// ============================================================

impl RenderContext {
    pub(crate) fn add_portal_surface(&mut self, entity: usize, shader: &Arc<Shader>) -> Option<usize> {
        let ps = PortalSurface::new(entity, shader.clone());
        let depth_portal = ps.is_depth_portal();
        if self.config.fast_sky && depth_portal {
            return None;
        }
        if self.rn.portal_surfaces.len() >= MAX_PORTAL_SURFACES {
            log::debug!("add_portal_surface: MAX_PORTAL_SURFACES hit");
            return None;
        }

        self.rn.portal_surfaces.push(ps);
        if depth_portal {
            self.rn.num_depth_portal_surfaces += 1;
        }
        Some(self.rn.portal_surfaces.len() - 1)
    }

    /// Fits the portal plane to one of its visible surfaces and grows its
    /// bounds. Surfaces facing away or beyond the shader's portal distance
    /// are ignored.
    pub(crate) fn update_portal_surface(
        &mut self,
        portal: usize,
        mesh: &Mesh,
        mins: &Vec3,
        maxs: &Vec3,
        shader: &Shader,
    ) {
        if mesh.elems.len() < 3 || portal >= self.rn.portal_surfaces.len() {
            return;
        }
        let vert = |i: usize| -> Option<Vec3> {
            let p = mesh.xyz.get(*mesh.elems.get(i)? as usize)?;
            Some([p[0], p[1], p[2]])
        };
        let (Some(v0), Some(v1), Some(v2)) = (vert(0), vert(1), vert(2)) else {
            return;
        };
        let mut v = [v0, v1, v2];

        let ent = &self.scene.entities[self.rn.portal_surfaces[portal].entity];
        let (origin, axis, scale, rotated) = (ent.origin, ent.axis, ent.scale, ent.is_rotated());

        let p = plane_from_points(&v);
        let untransformed = CPlane::new(p.normal, p.dist + dot_product(&origin, &p.normal) + 1.0);

        let plane = if shader.flags.contains(ShaderFlags::AUTOSPRITE) {
            let Some(v3) = vert(3) else {
                return;
            };
            let sum = vector_add(&vector_add(&v[0], &v[1]), &vector_add(&v[2], &v3));
            let centre = vector_ma(&origin, 0.25, &sum);
            let normal = vector_negate(&self.rn.view_axis[AXIS_FORWARD]);
            CPlane::new(normal, dot_product(&normal, &centre))
        } else if rotated {
            let rotation = matrix3_transpose(&axis);
            for p in v.iter_mut() {
                let t = matrix3_transform_vector(&rotation, p);
                *p = vector_ma(&origin, scale, &t);
            }
            plane_from_points(&v)
        } else {
            untransformed
        };

        let dist = plane_diff(&self.rn.view_origin, &plane);
        if dist <= BACKFACE_EPSILON && !shader.flags.contains(ShaderFlags::PORTAL_CAPTURE2) {
            return;
        }
        if shader.portal_distance > 0.0 && dist > shader.portal_distance {
            return;
        }

        let ps = &mut self.rn.portal_surfaces[portal];
        ps.plane = plane;
        ps.untransformed_plane = untransformed;
        add_point_to_bounds(mins, &mut ps.mins, &mut ps.maxs);
        add_point_to_bounds(maxs, &mut ps.mins, &mut ps.maxs);
        ps.centre = vector_scale(&vector_add(&ps.mins, &ps.maxs), 0.5);
    }

    /// Registers the sky portal of this view and masks the sky surface
    /// into the depth mask list.
    pub(crate) fn add_skyportal_surface(
        &mut self,
        entity: usize,
        shader: &Arc<Shader>,
        draw_surf: usize,
    ) -> Option<usize> {
        let index = match self.rn.skyportal_surface {
            Some(i) => i,
            None => {
                if self.rn.portal_surfaces.len() >= MAX_PORTAL_SURFACES {
                    return None;
                }
                self.rn.portal_surfaces.push(PortalSurface::new(entity, shader.clone()));
                let i = self.rn.portal_surfaces.len() - 1;
                self.rn.skyportal_surface = Some(i);
                self.rn.num_depth_portal_surfaces += 1;
                i
            }
        };

        if let Some(mask) = self.rn.portalmasklist {
            let depth_only = self.shaders.depth_only_shader.clone();
            self.add_surf_to_list(mask, entity, &depth_only, -1, 0.0, 0, None, DrawSurface::Bsp(draw_surf));
        }

        let ps = &mut self.rn.portal_surfaces[index];
        ps.entity = entity;
        ps.shader = shader.clone();
        ps.sky_portal = true;
        Some(index)
    }

    // ============================================================
    // Rendering
    // ============================================================

    /// Renders the child views of every portal collected in this view.
    pub(crate) fn draw_portals(&mut self) {
        if self.rn.render_flags.contains(RenderFlags::LIGHTVIEW) {
            return;
        }
        if self.rn.view_cluster < 0 || self.ri_stack.is_full() {
            return;
        }

        self.draw_portals_depth_mask();

        match self.rn.skyportal_surface {
            Some(_) => self.draw_skyportal(),
            None => self.draw_depth_sky_surface(),
        }

        for i in 0..self.rn.portal_surfaces.len() {
            if self.rn.portal_surfaces[i].sky_portal {
                continue;
            }
            let mut ps = self.rn.portal_surfaces[i].clone();
            self.draw_portal_surface(&mut ps);
            self.rn.portal_surfaces[i] = ps;
        }
    }

    /// Writes far depth where depth portals are and near depth everywhere
    /// else, so portal views only fill portal pixels.
    fn draw_portals_depth_mask(&mut self) {
        let Some(mask) = self.rn.portalmasklist else {
            return;
        };
        if self.lists[mask].is_empty() {
            return;
        }

        let (depth_min, depth_max) = self.rb.depth_range();
        self.rb.clear(ClearBits::DEPTH | ClearBits::COLOR, [0.0; 4], depth_min);
        self.rb.set_state_mask(
            StateBits::all(),
            StateBits::DEPTHWRITE | StateBits::DEPTHFUNC_GT | StateBits::NO_COLORWRITE,
        );
        self.rb.set_depth_range(depth_max, depth_max);

        self.draw_surfaces(mask);

        self.rb.set_depth_range(depth_min, depth_max);
        self.rb.set_state_mask(StateBits::all(), StateBits::empty());
    }

    fn draw_portal_surface(&mut self, ps: &mut PortalSurface) {
        let shader = ps.shader.clone();
        let capture2 = shader.flags.contains(ShaderFlags::PORTAL_CAPTURE2);

        let mut do_reflection = true;
        let mut do_refraction = true;
        let mut capture_id = None;
        if shader.flags.contains(ShaderFlags::PORTAL_CAPTURE) {
            capture_id = Some(0);
            match shader.distortion_alpha {
                Some(a) if a == 1.0 => do_refraction = false,
                Some(a) if a == 0.0 => do_reflection = false,
                _ => {}
            }
        }

        let mut refraction = false;
        let dist = plane_diff(&self.rn.view_origin, &ps.plane);
        if dist <= BACKFACE_EPSILON || !do_reflection {
            if !capture2 || !do_refraction {
                return;
            }
            // the refraction image is captured even from behind
            refraction = true;
            capture_id = Some(1);
            if dist < 0.0 {
                ps.plane = CPlane::new(vector_negate(&ps.plane.normal), -ps.plane.dist);
            }
        }

        let mut best = None;
        let mut best_d = f32::MAX;
        for &num in &self.rn.entities {
            let e = &self.scene.entities[num];
            if e.rtype != EntityType::PortalSurface {
                continue;
            }
            let d = plane_diff(&e.origin, &ps.untransformed_plane);
            if !(-PORTAL_ENTITY_RANGE..=PORTAL_ENTITY_RANGE).contains(&d) {
                continue;
            }
            let d = distance(&e.origin, &ps.centre);
            if d < best_d {
                best = Some(num);
                best_d = d;
            }
        }

        let mut portal_ent = None;
        match best {
            None => {
                if capture_id.is_none() {
                    // keep the backend state identical to a rendered portal
                    if self.push_ref_inst() {
                        self.pop_ref_inst();
                    }
                    return;
                }
            }
            Some(num) => {
                let e = &mut self.scene.entities[num];
                e.rtype = EntityType::Consumed;
                if !vector_compare(&e.origin, &e.origin2) {
                    portal_ent = Some(e.clone());
                }
            }
        }

        let prev_flags = self.rn.render_flags;
        if !self.push_ref_inst() {
            return;
        }
        let viewer_origin = self.rn.view_origin;
        let mut textures = [None; 2];
        let mut plane = ps.plane;

        loop {
            let origin: Vec3;
            let axis: Mat3;

            if refraction {
                plane = CPlane::new(vector_negate(&plane.normal), -plane.dist);
                origin = self.rn.view_origin;
                axis = self.rn.refdef.viewaxis;
                self.rn.pvs_origin = viewer_origin;
                self.rn.render_flags |= RenderFlags::PORTALVIEW;
            } else if let Some(ent) = &portal_ent {
                // world-to-portal, then portal destination-to-world
                let a = normal_vector_to_axis(&vector_negate(&plane.normal));
                let b = normal_vector_to_axis(&ent.portal_dir);
                let c = matrix3_transpose(&b);
                let rot = matrix3_multiply(&c, &a);

                let local = vector_subtract(&self.rn.view_origin, &ent.origin);
                origin = vector_add(&matrix3_transform_vector(&rot, &local), &ent.origin2);

                let b = matrix3_transpose(&a);
                let rot = matrix3_multiply(&self.rn.view_axis, &b);
                let b = matrix3_multiply(&ent.axis, &rot);
                let a = matrix3_transpose(&c);
                axis = matrix3_multiply(&b, &a);

                let normal = axis[AXIS_FORWARD];
                plane = CPlane::new(normal, dot_product(&ent.origin2, &normal));

                // vis comes from the destination; the eye may be inside a wall
                self.rn.pvs_origin = ent.origin2;
                self.rn.lod_origin = ent.origin2;
                self.rn.render_flags |= RenderFlags::PORTALVIEW;
                if ent.renderfx.contains(RenderFx::NOPORTALENTS) {
                    self.rn.render_flags |= RenderFlags::ENVVIEW;
                }
            } else {
                origin = vector_reflect(&self.rn.view_origin, &plane.normal, plane.dist);
                let mut reflected = [[0.0; 3]; 3];
                for i in [AXIS_FORWARD, AXIS_RIGHT, AXIS_UP] {
                    reflected[i] = vector_reflect(&self.rn.view_axis[i], &plane.normal, 0.0);
                }
                matrix3_normalize(&mut reflected);
                axis = reflected;
                self.rn.pvs_origin = viewer_origin;
                self.rn.render_flags = (prev_flags ^ RenderFlags::FLIPFRONTFACE) | RenderFlags::MIRRORVIEW;
            }

            self.rn.refdef.rdflags.remove(RdFlags::UNDERWATER | RdFlags::CROSSINGWATER);

            let depth = self.ri_stack.depth();
            self.rn.meshlist = self.portal_list(depth);
            self.rn.portalmasklist = None;

            self.rn.render_flags |= RenderFlags::CLIPPLANE;
            self.rn.render_flags.remove(RenderFlags::SOFT_PARTICLES);
            self.rn.clip_plane = plane;
            self.rn.near_clip = Z_NEAR;
            self.rn.far_clip = self.default_far_clip();
            self.rn.clip_flags |= 16;
            self.rn.frustum[4] = plane;

            let mut captured = true;
            if let Some(id) = capture_id {
                let flags = if shader.flags.contains(ShaderFlags::NO_TEX_FILTERING) {
                    TextureFlags::NOFILTERING
                } else {
                    TextureFlags::empty()
                };
                let (w, h) = (self.scene.refdef.width, self.scene.refdef.height);
                let frame = self.scene.frame_count;
                match self.portal_textures.get(&mut self.rb, w, h, flags, frame) {
                    Some(target) => {
                        textures[id] = Some(target);
                        self.rn.refdef.x = 0;
                        self.rn.refdef.y = 0;
                        self.rn.refdef.width = target.width;
                        self.rn.refdef.height = target.height;
                        self.rn.render_target = target.fbo;
                        self.rn.render_flags |= RenderFlags::PORTAL_CAPTURE;
                        self.rn.viewport = [0, 0, target.width, target.height];
                        self.rn.scissor = [0, 0, target.width, target.height];
                    }
                    None => captured = false,
                }
            } else {
                self.rn.render_flags.remove(RenderFlags::PORTAL_CAPTURE);
            }
            if !captured {
                break;
            }

            self.rn.refdef.vieworg = origin;
            self.rn.refdef.viewaxis = axis;
            self.setup_view_matrices();
            self.setup_view_frustum();
            self.setup_pvs();
            self.render_view();

            if do_refraction && !refraction && capture2 {
                // second pass starts over from the saved parent view
                if let Some(parent) = self.ri_stack.top() {
                    self.rn = parent.clone();
                }
                self.rn.render_flags = prev_flags;
                refraction = true;
                capture_id = Some(1);
                plane = ps.plane;
                continue;
            }
            break;
        }

        ps.textures = textures;
        self.pop_ref_inst();
    }

    fn draw_skyportal(&mut self) {
        let Some(world) = self.world.clone() else {
            return;
        };
        if !self.push_ref_inst() {
            return;
        }
        let sp = self.rn.refdef.skyportal;

        self.rn.render_flags |= RenderFlags::PORTALVIEW;
        self.rn.pvs_origin = sp.vieworg;
        self.rn.near_clip = Z_NEAR;
        self.rn.far_clip = self.default_far_clip();
        self.rn.clip_flags = 15;
        let depth = self.ri_stack.depth();
        self.rn.meshlist = self.portal_list(depth);
        self.rn.portalmasklist = None;
        if sp.noents {
            self.rn.render_flags |= RenderFlags::ENVVIEW;
        }

        self.rn.refdef.vieworg = if sp.scale != 0.0 {
            let centre = vector_scale(&vector_add(&world.mins, &world.maxs), 0.5);
            let diff = vector_subtract(&centre, &self.rn.view_origin);
            vector_ma(&sp.vieworg, -sp.scale, &diff)
        } else {
            sp.vieworg
        };

        self.rn.refdef.rdflags.remove(
            RdFlags::UNDERWATER | RdFlags::CROSSINGWATER | RdFlags::SKYPORTALINVIEW,
        );
        if sp.fov != 0.0 {
            self.rn.refdef.fov_x = sp.fov;
            self.rn.refdef.fov_y = sp.fov;
        }

        self.setup_view_matrices();
        self.setup_view_frustum();
        self.setup_pvs();
        self.render_view();

        self.pop_ref_inst();
    }

    /// Draws the sky dome into the depth buffer only.
    fn draw_depth_sky_surface(&mut self) {
        if !self.rn.sky_added {
            return;
        }
        let Some(world) = self.world.as_ref() else {
            return;
        };
        if !world.write_sky_depth {
            return;
        }
        let list = self.rn.meshlist;
        self.rb.set_state_mask(StateBits::all(), StateBits::NO_COLORWRITE);
        self.draw_sky_surfaces(list);
        self.rb.set_state_mask(StateBits::all(), StateBits::empty());
    }

    /// Finds the world surfaces of a draw surface that passed culling and
    /// fits the portal to each.
    pub(crate) fn update_portal_from_draw_surface(
        &mut self,
        portal: usize,
        world: &WorldModel,
        ds: usize,
        origin: &Vec3,
    ) {
        let list = self.rn.meshlist;
        let shader = world.draw_surfaces[ds].shader.clone();
        for &s in &world.draw_surfaces[ds].surfaces {
            if !self.lists[list].world_surf_vis.get(s).copied().unwrap_or(false) {
                continue;
            }
            let surf = &world.surfaces[s];
            let mins = vector_add(&surf.mins, origin);
            let maxs = vector_add(&surf.maxs, origin);
            self.update_portal_surface(portal, &surf.mesh, &mins, &maxs, &shader);
        }
    }
}
