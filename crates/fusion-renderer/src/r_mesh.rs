// r_mesh.rs — draw lists and element helpers

use crate::r_model::WorldModel;
use crate::r_public::Entity;
use crate::r_shader::Shader;
use crate::r_sort::{sort_draw_surfs, DistKey, SortKey, SortedDrawSurf};
use crate::r_surface::DrawSurface;

pub const MIN_RENDER_MESHES: usize = 2048;

/// Distance used for every world surface; world surfaces sort by order only.
pub const WORLDSURF_DIST: f32 = 1024.0;

/// A per-view list of surfaces to draw plus the world visibility state that
/// was used to build it.
#[derive(Debug, Default)]
pub struct DrawList {
    pub surfs: Vec<SortedDrawSurf>,
    pub world_surf_vis: Vec<bool>,
    pub world_leaf_vis: Vec<bool>,
    pub world_draw_surf_vis: Vec<bool>,
    /// Draw surfaces already queued in this list.
    pub draw_surf_added: Vec<bool>,
    min_meshes: usize,
    next_seq: u32,
}

impl DrawList {
    pub fn new() -> Self {
        Self {
            min_meshes: MIN_RENDER_MESHES,
            ..Default::default()
        }
    }

    /// Empties the list and resizes the visibility arrays for the world.
    pub fn clear(&mut self, world: Option<&WorldModel>) {
        self.surfs.clear();
        self.next_seq = 0;

        let (num_surfs, num_leafs, num_draw_surfs) = world.map_or((0, 0, 0), |w| {
            (w.surfaces.len(), w.leafs.len(), w.draw_surfaces.len())
        });
        self.min_meshes = MIN_RENDER_MESHES + num_draw_surfs;

        for (vis, len) in [
            (&mut self.world_surf_vis, num_surfs),
            (&mut self.world_leaf_vis, num_leafs),
            (&mut self.world_draw_surf_vis, num_draw_surfs),
            (&mut self.draw_surf_added, num_draw_surfs),
        ] {
            vis.clear();
            vis.resize(len, false);
        }
    }

    pub fn len(&self) -> usize {
        self.surfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfs.is_empty()
    }

    /// Queues a surface. Returns its index, or None when the distance key
    /// says it must not be drawn.
    pub fn add_surf(
        &mut self,
        entity_num: usize,
        entity: &Entity,
        shader: &Shader,
        light_style: i32,
        dist: f32,
        order: u32,
        portal: Option<usize>,
        surf: DrawSurface,
    ) -> Option<usize> {
        let dist_key = DistKey::for_surface(entity.renderfx, shader, dist, order)?;

        if self.surfs.len() == self.surfs.capacity() {
            let target = self.min_meshes.max(self.surfs.capacity() * 2);
            self.surfs.reserve_exact(target - self.surfs.len());
        }

        let index = self.surfs.len();
        self.surfs.push(SortedDrawSurf {
            sort: SortKey::new(shader.id, light_style, entity_num, portal),
            dist: dist_key,
            surf,
            seq: self.next_seq,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(index)
    }

    pub fn sort(&mut self, parallel_min: usize) {
        sort_draw_surfs(&mut self.surfs, parallel_min);
    }
}

// ============================================================
// Element helpers
// ============================================================

pub fn copy_offset_elements(input: &[u16], offset: u16, out: &mut Vec<u16>) {
    out.extend(input.iter().map(|&e| offset + e));
}

/// Copies whole triangles only; a trailing partial triangle is dropped.
pub fn copy_offset_triangles(input: &[u16], offset: u16, out: &mut Vec<u16>) {
    let whole = input.len() - input.len() % 3;
    out.extend(input[..whole].iter().map(|&e| offset + e));
}

pub fn build_trifan_elements(offset: u16, num_verts: usize, out: &mut Vec<u16>) {
    for i in 2..num_verts as u16 {
        out.extend_from_slice(&[offset, offset + i - 1, offset + i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r_public::RenderFx;
    use crate::r_shader::{ShaderDesc, ShaderFlags, ShaderRegistry, ShaderSort};

    #[test]
    fn test_element_helpers() {
        let mut out = Vec::new();
        copy_offset_elements(&[0, 1, 1, 2], 10, &mut out);
        assert_eq!(out, vec![10, 11, 11, 12]);

        out.clear();
        copy_offset_triangles(&[0, 1, 2, 2, 1], 4, &mut out);
        assert_eq!(out, vec![4, 5, 6]);

        out.clear();
        build_trifan_elements(8, 5, &mut out);
        assert_eq!(out, vec![8, 9, 10, 8, 10, 11, 8, 11, 12]);
    }

    #[test]
    fn test_add_surf_grows_to_minimum() {
        let reg = ShaderRegistry::new().unwrap();
        let world = WorldModel::default();
        let mut list = DrawList::new();
        list.clear(Some(&world));
        let e = Entity::default();
        let idx = list.add_surf(0, &e, &reg.default_shader, -1, 0.0, 0, None, DrawSurface::Sprite);
        assert_eq!(idx, Some(0));
        assert!(list.surfs.capacity() >= MIN_RENDER_MESHES);

        for i in 1..MIN_RENDER_MESHES + 1 {
            list.add_surf(0, &e, &reg.default_shader, -1, 0.0, i as u32, None, DrawSurface::Sprite);
        }
        assert!(list.surfs.capacity() >= MIN_RENDER_MESHES * 2);
        assert_eq!(list.len(), MIN_RENDER_MESHES + 1);
    }

    #[test]
    fn test_add_surf_drops_masked_weapon() {
        let mut reg = ShaderRegistry::new().unwrap();
        let blend = reg.register("blend", ShaderDesc {
            sort: ShaderSort::Additive,
            flags: ShaderFlags::empty(),
            ..Default::default()
        });
        let mut list = DrawList::new();
        let e = Entity {
            renderfx: RenderFx::WEAPONMODEL | RenderFx::NOCOLORWRITE,
            ..Default::default()
        };
        assert_eq!(list.add_surf(1, &e, &blend, -1, 0.0, 0, None, DrawSurface::Sprite), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_clear_resets_visibility() {
        let world = WorldModel {
            leafs: vec![Default::default(); 3],
            ..Default::default()
        };
        let mut list = DrawList::new();
        list.clear(Some(&world));
        list.world_leaf_vis[1] = true;
        list.clear(Some(&world));
        assert_eq!(list.world_leaf_vis, vec![false; 3]);
        list.clear(None);
        assert!(list.world_leaf_vis.is_empty());
    }
}
