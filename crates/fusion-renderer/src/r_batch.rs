// r_batch.rs — sorted draw list execution
//
// One linear pass over a sorted list. Backend state is only touched when the
// shader, entity, portal, light style or entity fx change; BSP surfaces merge
// contiguous element ranges and sprites/polys go to the dynamic streams.

use std::sync::Arc;

use fusion_common::q_shared::{
    cross_product, rotate_point_around_vector, vector_ma, vector_negate, vector_scale, Vec4,
    AXIS_FORWARD, AXIS_IDENTITY, AXIS_RIGHT, AXIS_UP,
};

use crate::r_backend::{ClearBits, PassMode, Primitive, VboId};
use crate::r_dynamic::DynamicMesh;
use crate::r_math::{
    matrix4_object_matrix, matrix4_perspective_projection_to_infinity, DEPTH_EPSILON,
    MAT4_IDENTITY,
};
use crate::r_mesh::DrawList;
use crate::r_model::{ModelKind, WorldSurface};
use crate::r_public::RenderFx;
use crate::r_refinst::RenderFlags;
use crate::r_scene::WORLD_ENT;
use crate::r_shader::{Shader, ShaderFlags, ShaderSort};
use crate::r_surface::{DrawSurface, FlushKind, SurfaceType};
use crate::RenderContext;

/// Share of the depth range weapon models are squeezed into.
const WEAPON_DEPTH_FRACTION: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SurfFilter {
    Any,
    Only(SurfaceType),
    Except(SurfaceType),
}

impl SurfFilter {
    fn accepts(self, surf: SurfaceType) -> bool {
        match self {
            SurfFilter::Any => true,
            SurfFilter::Only(t) => surf == t,
            SurfFilter::Except(t) => surf != t,
        }
    }
}

/// Pending contiguous range of one static VBO.
#[derive(Default)]
struct BspBatch {
    count: usize,
    vbo: u32,
    shader: Option<Arc<Shader>>,
    portal: Option<usize>,
    entity: usize,
    light_style: i32,
    first_vert: u32,
    num_verts: u32,
    first_elem: u32,
    num_elems: u32,
}

/// What the backend currently has bound during a pass.
struct PassState {
    shader: Option<u16>,
    entity: Option<usize>,
    portal: Option<usize>,
    light_style: i32,
    renderfx: Option<RenderFx>,
    batched: bool,
    kind: Option<FlushKind>,
    depth_hack: bool,
    cull_hack: bool,
    infinite: bool,
    depth_copied: bool,
}

impl RenderContext {
    // ============================================================
    // Entry points
    // ============================================================

    pub(crate) fn draw_surfaces(&mut self, list: usize) {
        let outlines = self.rb.enable_triangle_outlines(false);
        self.draw_surfaces_mode(list, SurfFilter::Any, ShaderSort::None, ShaderSort::MAX);
        self.rb.enable_triangle_outlines(outlines);
    }

    /// Wireframe pass over everything but the sky.
    pub(crate) fn draw_outlined_surfaces(&mut self, list: usize) {
        if self.rn.render_flags.contains(RenderFlags::SHADOWMAPVIEW) {
            return;
        }
        let outlines = self.rb.enable_triangle_outlines(true);
        self.draw_surfaces_mode(
            list,
            SurfFilter::Except(SurfaceType::Sky),
            ShaderSort::None,
            ShaderSort::MAX,
        );
        self.rb.enable_triangle_outlines(outlines);
    }

    pub(crate) fn draw_portal_surfaces(&mut self, list: usize) {
        self.draw_surfaces_mode(list, SurfFilter::Any, ShaderSort::Portal, ShaderSort::Portal);
    }

    pub(crate) fn draw_sky_surfaces(&mut self, list: usize) {
        self.draw_surfaces_mode(
            list,
            SurfFilter::Only(SurfaceType::Sky),
            ShaderSort::Sky,
            ShaderSort::Sky,
        );
    }

    /// Calls `f` for every visible world surface referenced by the list.
    pub fn walk_draw_list<F: FnMut(usize, &WorldSurface)>(&self, list: usize, mut f: F) {
        let (Some(world), Some(dl)) = (self.world.as_ref(), self.lists.get(list)) else {
            return;
        };
        for sds in &dl.surfs {
            let DrawSurface::Bsp(ds) = sds.surf else {
                continue;
            };
            let Some(draw_surf) = world.draw_surfaces.get(ds) else {
                continue;
            };
            for &s in &draw_surf.surfaces {
                if dl.world_surf_vis.get(s).copied().unwrap_or(false) {
                    f(s, &world.surfaces[s]);
                }
            }
        }
    }

    // ============================================================
    // Transforms
    // ============================================================

    pub(crate) fn transform_for_world(&mut self) {
        self.rb.load_object_matrix(&MAT4_IDENTITY);
    }

    pub(crate) fn transform_for_entity(&mut self, entity_num: usize) {
        if entity_num == WORLD_ENT {
            self.transform_for_world();
            return;
        }
        let Some(e) = self.scene.entities.get(entity_num) else {
            return;
        };
        let m = matrix4_object_matrix(&e.origin, &e.axis, e.scale);
        self.rb.load_object_matrix(&m);
    }

    /// Translation only, for surfaces that build their own orientation.
    fn translate_for_entity(&mut self, entity_num: usize) {
        let Some(e) = self.scene.entities.get(entity_num) else {
            return;
        };
        let m = matrix4_object_matrix(&e.origin, &AXIS_IDENTITY, 1.0);
        self.rb.load_object_matrix(&m);
    }

    // ============================================================
    // The pass
    // ============================================================

    fn draw_surfaces_mode(
        &mut self,
        list: usize,
        filter: SurfFilter,
        min_sort: ShaderSort,
        max_sort: ShaderSort,
    ) {
        if self.lists.get(list).map_or(true, DrawList::is_empty) {
            return;
        }

        // BSP visibility always comes from the view's own list
        let meshlist = self.rn.meshlist;
        let dl = std::mem::take(&mut self.lists[list]);
        let vis_list = (list != meshlist && meshlist < self.lists.len())
            .then(|| std::mem::take(&mut self.lists[meshlist]));

        self.draw_sorted_surfaces(&dl, vis_list.as_ref().unwrap_or(&dl), filter, min_sort, max_sort);

        self.lists[list] = dl;
        if let Some(vis) = vis_list {
            self.lists[meshlist] = vis;
        }
    }

    fn draw_sorted_surfaces(
        &mut self,
        dl: &DrawList,
        vis: &DrawList,
        filter: SurfFilter,
        min_sort: ShaderSort,
        max_sort: ShaderSort,
    ) {
        let start_fbo = self.rb.bound_framebuffer();
        let (depth_min, depth_max) = self.rb.depth_range();
        let depth_mode = self.rb.mode() == PassMode::Depth;

        let mut batch = BspBatch::default();
        let mut st = PassState {
            shader: None,
            entity: None,
            portal: None,
            light_style: -1,
            renderfx: None,
            batched: false,
            kind: None,
            depth_hack: false,
            cull_hack: false,
            infinite: false,
            depth_copied: false,
        };

        for sds in &dl.surfs {
            let sort = sds.dist.sort_class();
            if sort > max_sort {
                break;
            }
            if sort < min_sort || !filter.accepts(sds.surf.surface_type()) {
                continue;
            }
            let Some(shader) = self.shaders.get(sds.sort.shader()).cloned() else {
                continue;
            };
            if depth_mode && !shader.writes_depth() {
                continue;
            }

            let entity_num = sds.sort.entity();
            let Some(renderfx) = self.scene.entities.get(entity_num).map(|e| e.renderfx) else {
                continue;
            };
            let portal = sds.sort.portal();
            let light_style = sds.sort.light_style();
            let kind = sds.surf.flush_kind();
            let batched = kind.is_some();

            let reset = !batched
                || !st.batched
                || st.shader != Some(shader.id)
                || st.portal != portal
                || st.light_style != light_style
                || st.renderfx != Some(renderfx)
                || (st.entity != Some(entity_num) && !shader.flags.contains(ShaderFlags::ENTITY_MERGABLE));

            if reset {
                self.flush_bsp_batch(&mut batch);

                let weapon = renderfx.contains(RenderFx::WEAPONMODEL);
                let cull_hack = renderfx.contains(RenderFx::CULLHACK);
                let infinite = renderfx.contains(RenderFx::NODEPTHTEST) || shader.is_sky();
                let depth_copy = !st.depth_copied
                    && !shader.writes_depth()
                    && shader.reads_depth()
                    && self.rn.render_flags.contains(RenderFlags::SOFT_PARTICLES)
                    && !self.rn.render_flags.contains(RenderFlags::CLIPPLANE);

                if kind != st.kind
                    || !batched
                    || weapon != st.depth_hack
                    || cull_hack != st.cull_hack
                    || infinite != st.infinite
                    || depth_copy
                {
                    self.rb.flush_dynamic_meshes();
                }

                if weapon != st.depth_hack {
                    if weapon {
                        let max = depth_min + WEAPON_DEPTH_FRACTION * (depth_max - depth_min);
                        self.rb.set_depth_range(depth_min, max);
                    } else {
                        self.rb.set_depth_range(depth_min, depth_max);
                    }
                    st.depth_hack = weapon;
                }

                if cull_hack != st.cull_hack {
                    self.rb.flip_front_face();
                    st.cull_hack = cull_hack;
                }

                if infinite != st.infinite {
                    if infinite {
                        let mut m = self.rn.projection_matrix;
                        matrix4_perspective_projection_to_infinity(self.rn.near_clip, &mut m, DEPTH_EPSILON);
                        self.rb.load_projection_matrix(&m);
                    } else {
                        self.rb.load_projection_matrix(&self.rn.projection_matrix);
                    }
                    st.infinite = infinite;
                }

                if depth_copy {
                    if let Some(copy) = self.rn.screen_tex_copy {
                        self.rb.blit_framebuffer(self.rn.render_target, copy, ClearBits::DEPTH);
                    }
                }
                if shader.reads_depth() && !shader.writes_depth() {
                    st.depth_copied = true;
                }

                match kind {
                    Some(FlushKind::Dynamic) => self.transform_for_world(),
                    Some(FlushKind::Bsp) => self.transform_for_entity(entity_num),
                    None if shader.flags.contains(ShaderFlags::AUTOSPRITE) => {
                        self.translate_for_entity(entity_num)
                    }
                    None => self.transform_for_entity(entity_num),
                }

                st.shader = Some(shader.id);
                st.entity = Some(entity_num);
                st.portal = portal;
                st.light_style = light_style;
                st.renderfx = Some(renderfx);
                st.batched = batched;
                st.kind = kind;

                if !batched {
                    self.rb.bind_shader(self.scene.entities.get(entity_num), &shader);
                    self.rb
                        .set_portal_surface(portal.and_then(|p| self.rn.portal_surfaces.get(p)));
                    self.rb.set_light_style(light_style);
                    self.draw_surface(&sds.surf);
                    continue;
                }
            }

            match &sds.surf {
                DrawSurface::Bsp(ds) => {
                    self.batch_bsp_surface(&mut batch, vis, *ds, &shader, entity_num, portal, light_style)
                }
                DrawSurface::Sprite => self.batch_sprite_surface(entity_num, &shader),
                DrawSurface::Poly(p) => self.batch_poly_surface(*p, entity_num, &shader),
                _ => {}
            }
        }

        self.flush_bsp_batch(&mut batch);
        self.rb.flush_dynamic_meshes();

        if st.depth_hack {
            self.rb.set_depth_range(depth_min, depth_max);
        }
        if st.cull_hack {
            self.rb.flip_front_face();
        }
        if st.infinite {
            self.rb.load_projection_matrix(&self.rn.projection_matrix);
        }
        self.rb.bind_framebuffer(start_fbo);
    }

    // ============================================================
    // Immediate surfaces
    // ============================================================

    fn draw_surface(&mut self, surf: &DrawSurface) {
        match surf {
            DrawSurface::Sky => {
                let Some(dome) = self.world.as_ref().and_then(|w| w.sky_dome) else {
                    return;
                };
                self.rb.bind_vbo(VboId::Mesh(dome.vbo), Primitive::Triangles);
                self.rb.draw_elements(0, dome.num_verts, 0, dome.num_elems);
            }
            DrawSurface::Alias { model, mesh } | DrawSurface::Skeletal { model, mesh } => {
                let meshes = match &model.kind {
                    ModelKind::Alias(m) | ModelKind::Skeletal(m) => m,
                    _ => return,
                };
                let Some(m) = meshes.get(*mesh) else {
                    return;
                };
                if m.num_verts == 0 || m.num_elems == 0 {
                    return;
                }
                self.rb.bind_vbo(VboId::Mesh(m.vbo), Primitive::Triangles);
                self.rb.draw_elements(0, m.num_verts, 0, m.num_elems);
            }
            DrawSurface::NullModel => {
                let Some(vbo) = self.null_vbo else {
                    return;
                };
                self.rb.bind_vbo(VboId::Mesh(vbo), Primitive::Lines);
                self.rb.draw_elements(0, 6, 0, 6);
            }
            _ => {}
        }
    }

    // ============================================================
    // Batched surfaces
    // ============================================================

    fn flush_bsp_batch(&mut self, batch: &mut BspBatch) {
        if batch.count == 0 {
            return;
        }
        let b = std::mem::take(batch);
        let Some(shader) = b.shader else {
            return;
        };
        // sky geometry is drawn as the dome
        if shader.is_sky() {
            return;
        }

        self.rb.bind_shader(self.scene.entities.get(b.entity), &shader);
        self.rb
            .set_portal_surface(b.portal.and_then(|p| self.rn.portal_surfaces.get(p)));
        self.rb.set_light_style(b.light_style);
        self.rb.bind_vbo(VboId::Mesh(b.vbo), Primitive::Triangles);
        self.rb.draw_elements(b.first_vert, b.num_verts, b.first_elem, b.num_elems);
    }

    /// Adds the visible surfaces of a world draw surface to the pending
    /// batch, flushing whenever a range is not contiguous with it.
    fn batch_bsp_surface(
        &mut self,
        batch: &mut BspBatch,
        vis: &DrawList,
        ds: usize,
        shader: &Arc<Shader>,
        entity: usize,
        portal: Option<usize>,
        light_style: i32,
    ) {
        let Some(world) = self.world.clone() else {
            return;
        };
        let Some(draw_surf) = world.draw_surfaces.get(ds) else {
            return;
        };
        let Some(vbo) = draw_surf.vbo else {
            return;
        };

        for &s in &draw_surf.surfaces {
            if !vis.world_surf_vis.get(s).copied().unwrap_or(false) {
                continue;
            }
            let surf = &world.surfaces[s];
            let num_verts = surf.mesh.num_verts() as u32;
            let num_elems = surf.mesh.num_elems() as u32;
            if num_verts == 0 || num_elems == 0 {
                continue;
            }
            let first_vert = draw_surf.first_vbo_vert + surf.first_draw_surf_vert;
            let first_elem = draw_surf.first_vbo_elem + surf.first_draw_surf_elem;

            let mergable = batch.count > 0
                && batch.vbo == vbo
                && batch.shader.as_ref().map(|s| s.id) == Some(shader.id)
                && batch.entity == entity
                && batch.portal == portal
                && batch.light_style == light_style
                && batch.first_vert + batch.num_verts == first_vert
                && batch.first_elem + batch.num_elems == first_elem;

            if mergable {
                batch.count += 1;
                batch.num_verts += num_verts;
                batch.num_elems += num_elems;
                continue;
            }

            self.flush_bsp_batch(batch);
            *batch = BspBatch {
                count: 1,
                vbo,
                shader: Some(shader.clone()),
                portal,
                entity,
                light_style,
                first_vert,
                num_verts,
                first_elem,
                num_elems,
            };
        }
    }

    /// Camera-facing quad around the entity origin.
    fn batch_sprite_surface(&mut self, entity_num: usize, shader: &Arc<Shader>) {
        let Some(e) = self.scene.entities.get(entity_num) else {
            return;
        };
        let radius = e.radius * e.scale;
        let forward = self.rn.view_axis[AXIS_FORWARD];

        let (mut left, up) = if e.rotation != 0.0 {
            let left = rotate_point_around_vector(&forward, &self.rn.view_axis[AXIS_RIGHT], e.rotation);
            let up = cross_product(&forward, &left);
            (left, up)
        } else {
            (self.rn.view_axis[AXIS_RIGHT], self.rn.view_axis[AXIS_UP])
        };
        if self.rn.render_flags.contains(RenderFlags::MIRRORVIEW) {
            left = vector_negate(&left);
        }

        let corner = |l: f32, u: f32| -> Vec4 {
            let p = vector_ma(&vector_ma(&e.origin, l * radius, &left), u * radius, &up);
            [p[0], p[1], p[2], 1.0]
        };
        let xyz = [corner(-1.0, -1.0), corner(-1.0, 1.0), corner(1.0, 1.0), corner(1.0, -1.0)];
        let n = vector_scale(&forward, -1.0);
        let normals = [[n[0], n[1], n[2], 0.0]; 4];
        let st = [[0.0, 1.0], [0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        let colors = [e.color; 4];
        let elems = [0, 1, 2, 0, 2, 3];

        let mesh = DynamicMesh {
            xyz: &xyz,
            normals: Some(&normals),
            st: Some(&st),
            colors: Some(&colors),
            elems: &elems,
        };
        self.rb
            .add_dynamic_mesh(Some((entity_num, e)), shader, &mesh, Primitive::Triangles);
    }

    fn batch_poly_surface(&mut self, poly: usize, entity_num: usize, shader: &Arc<Shader>) {
        let (Some(p), Some(e)) = (self.scene.polys.get(poly), self.scene.entities.get(entity_num)) else {
            return;
        };
        let n = p.verts.len();
        if n < 3 {
            return;
        }

        let xyz: Vec<Vec4> = p.verts.iter().map(|v| [v[0], v[1], v[2], 1.0]).collect();
        let normals: Option<Vec<Vec4>> = (p.normals.len() == n)
            .then(|| p.normals.iter().map(|v| [v[0], v[1], v[2], 0.0]).collect());

        let mesh = DynamicMesh {
            xyz: &xyz,
            normals: normals.as_deref(),
            st: (p.stcoords.len() == n).then_some(&p.stcoords[..]),
            colors: (p.colors.len() == n).then_some(&p.colors[..]),
            elems: &p.elems,
        };
        self.rb
            .add_dynamic_mesh(Some((entity_num, e)), shader, &mesh, Primitive::Triangles);
    }
}
