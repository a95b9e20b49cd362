// r_model.rs — in-memory model and world layouts the renderer draws from
// Loading is done by the asset layer; these are the resolved structures.

use std::sync::Arc;

use bitflags::bitflags;
use fusion_common::q_shared::{Vec3, Vec4};

use crate::r_shader::Shader;

/// Raw geometry of a single surface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub xyz: Vec<Vec4>,
    pub normals: Vec<Vec4>,
    pub st: Vec<[f32; 2]>,
    pub colors: Vec<[u8; 4]>,
    pub elems: Vec<u16>,
}

impl Mesh {
    pub fn num_verts(&self) -> usize {
        self.xyz.len()
    }

    pub fn num_elems(&self) -> usize {
        self.elems.len()
    }
}

/// One static mesh of an alias or skeletal model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMesh {
    pub shader: Arc<Shader>,
    pub vbo: u32,
    pub num_verts: u32,
    pub num_elems: u32,
}

/// A brush submodel: a range of world surfaces drawn with an entity transform.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BrushModel {
    pub surfaces: Vec<usize>,
    pub draw_surfaces: Vec<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum ModelKind {
    #[default]
    Bad,
    Alias(Vec<ModelMesh>),
    Skeletal(Vec<ModelMesh>),
    Brush(BrushModel),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    pub name: String,
    pub kind: ModelKind,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub radius: f32,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SurfFlags: u32 {
        const NODRAW = 0x1;
        const SKY    = 0x2;
    }
}

/// A BSP surface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorldSurface {
    pub mesh: Mesh,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub flags: SurfFlags,
    /// Index of the draw surface this surface is merged into.
    pub draw_surf: usize,
    /// Vertex offset inside the draw surface's VBO range.
    pub first_draw_surf_vert: u32,
    /// Element offset inside the draw surface's VBO range.
    pub first_draw_surf_elem: u32,
}

/// A run of world surfaces sharing shader, VBO and light style.
#[derive(Clone, Debug, PartialEq)]
pub struct WorldDrawSurface {
    pub shader: Arc<Shader>,
    /// None for surfaces that never got geometry uploaded.
    pub vbo: Option<u32>,
    pub first_vbo_vert: u32,
    pub first_vbo_elem: u32,
    pub surfaces: Vec<usize>,
    pub light_style: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Leaf {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub cluster: i32,
    pub surfaces: Vec<usize>,
}

/// Pre-built sky dome geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SkyDome {
    pub vbo: u32,
    pub num_verts: u32,
    pub num_elems: u32,
}

/// The loaded BSP world.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorldModel {
    pub name: String,
    pub surfaces: Vec<WorldSurface>,
    pub draw_surfaces: Vec<WorldDrawSurface>,
    pub leafs: Vec<Leaf>,
    /// Cluster visibility rows; empty means everything is visible.
    pub cluster_vis: Vec<Vec<bool>>,
    pub sky_dome: Option<SkyDome>,
    pub sky_shader: Option<Arc<Shader>>,
    /// Sky surfaces also go to the depth buffer.
    pub write_sky_depth: bool,
    pub mins: Vec3,
    pub maxs: Vec3,
}

impl WorldModel {
    /// Leaf containing the point, first match wins.
    pub fn point_in_leaf(&self, p: &Vec3) -> Option<usize> {
        self.leafs.iter().position(|leaf| {
            (0..3).all(|i| p[i] >= leaf.mins[i] && p[i] <= leaf.maxs[i])
        })
    }

    /// Cluster of the point, -1 when outside the world.
    pub fn point_cluster(&self, p: &Vec3) -> i32 {
        self.point_in_leaf(p).map_or(-1, |l| self.leafs[l].cluster)
    }

    pub fn cluster_visible(&self, from: i32, to: i32) -> bool {
        if self.cluster_vis.is_empty() || from < 0 {
            return true;
        }
        if to < 0 {
            return false;
        }
        self.cluster_vis
            .get(from as usize)
            .and_then(|row| row.get(to as usize))
            .copied()
            .unwrap_or(false)
    }
}
