// r_public.rs — types the client hands to the renderer each frame

use std::sync::Arc;

use bitflags::bitflags;
use fusion_common::q_shared::{Mat3, Vec3, Vec4, AXIS_IDENTITY, VEC3_ORIGIN};

use crate::r_model::Model;
use crate::r_shader::Shader;

// ============================================================
// Limits
// ============================================================

pub const MAX_ENTITIES: usize = 1024;
pub const MAX_POLYS: usize = 2048;
pub const MAX_POLY_VERTS: usize = 3000;
pub const MAX_DLIGHTS: usize = 32;
pub const MAX_LIGHTSTYLES: usize = 256;

pub const NUM_CUSTOMCOLORS: usize = 16;

bitflags! {
    /// Per-entity render effects.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RenderFx: u32 {
        const MINLIGHT      = 0x1;
        const FULLBRIGHT    = 0x2;
        const FRAMELERP     = 0x4;
        const NOSHADOW      = 0x8;
        const VIEWERMODEL   = 0x10;
        const WEAPONMODEL   = 0x20;
        const CULLHACK      = 0x40;
        const FORCENOLOD    = 0x80;
        const NOPORTALENTS  = 0x100;
        const ALPHAHACK     = 0x200;
        const GREYSCALE     = 0x400;
        const NODEPTHTEST   = 0x800;
        const NOCOLORWRITE  = 0x1000;
    }
}

bitflags! {
    /// Refdef flags set by the client.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RdFlags: u32 {
        const UNDERWATER      = 0x1;
        const NOWORLDMODEL    = 0x2;
        const OLDAREABITS     = 0x4;
        const PORTALINVIEW    = 0x8;
        const SKYPORTALINVIEW = 0x10;
        const FLIPPED         = 0x20;
        const WORLDOUTLINES   = 0x40;
        const CROSSINGWATER   = 0x80;
        const USEORTHO        = 0x100;
        const BLURRED         = 0x200;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntityType {
    #[default]
    Model,
    Sprite,
    PortalSurface,
    /// A portal entity already matched to a surface this view.
    Consumed,
}

/// A scene entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub rtype: EntityType,
    pub model: Option<Arc<Model>>,
    pub custom_shader: Option<Arc<Shader>>,
    pub origin: Vec3,
    /// Portal destination for teleporting portals, equal to `origin` for mirrors.
    pub origin2: Vec3,
    pub axis: Mat3,
    pub scale: f32,
    pub radius: f32,
    /// Sprite rotation in degrees.
    pub rotation: f32,
    pub renderfx: RenderFx,
    pub color: [u8; 4],
    pub frame: i32,
    pub old_frame: i32,
    pub backlerp: f32,
    /// Facing direction at the portal destination.
    pub portal_dir: Vec3,
}

impl Default for Entity {
    fn default() -> Self {
        Self {
            rtype: EntityType::Model,
            model: None,
            custom_shader: None,
            origin: VEC3_ORIGIN,
            origin2: VEC3_ORIGIN,
            axis: AXIS_IDENTITY,
            scale: 1.0,
            radius: 0.0,
            rotation: 0.0,
            renderfx: RenderFx::empty(),
            color: [255; 4],
            frame: 0,
            old_frame: 0,
            backlerp: 0.0,
            portal_dir: [1.0, 0.0, 0.0],
        }
    }
}

impl Entity {
    /// True when the axis differs from identity.
    pub fn is_rotated(&self) -> bool {
        !fusion_common::q_shared::matrix3_compare(&self.axis, &AXIS_IDENTITY)
    }
}

/// A client-submitted polygon (decals, particles, 2D polys).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Poly {
    pub verts: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub stcoords: Vec<[f32; 2]>,
    pub colors: Vec<[u8; 4]>,
    /// Triangle list; empty means a fan over `verts`.
    pub elems: Vec<u16>,
    pub shader: Option<Arc<Shader>>,
    pub renderfx: RenderFx,
}

impl Poly {
    pub fn num_verts(&self) -> usize {
        self.verts.len()
    }
}

/// Sky portal camera parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SkyPortal {
    pub vieworg: Vec3,
    pub scale: f32,
    pub fov: f32,
    pub noents: bool,
}

/// What the client wants rendered for one scene.
#[derive(Clone, Debug, PartialEq)]
pub struct RefDef {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub vieworg: Vec3,
    pub viewaxis: Mat3,
    pub blend: Vec4,
    pub time: u32,
    pub rdflags: RdFlags,
    pub minlight: f32,
    pub scissor: [i32; 4],
    pub skyportal: SkyPortal,
}

impl Default for RefDef {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            fov_x: 90.0,
            fov_y: 90.0,
            vieworg: VEC3_ORIGIN,
            viewaxis: AXIS_IDENTITY,
            blend: [0.0; 4],
            time: 0,
            rdflags: RdFlags::empty(),
            minlight: 0.0,
            scissor: [0; 4],
            skyportal: SkyPortal::default(),
        }
    }
}

/// A dynamic light.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DLight {
    pub origin: Vec3,
    pub intensity: f32,
    pub color: Vec3,
}

/// A light style value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LightStyle {
    pub rgb: Vec3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_defaults() {
        let e = Entity::default();
        assert_eq!(e.scale, 1.0);
        assert_eq!(e.color, [255; 4]);
        assert!(!e.is_rotated());
        let mut r = e.clone();
        r.axis = [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        assert!(r.is_rotated());
    }

    #[test]
    fn test_renderfx_bits_are_distinct() {
        let all = RenderFx::all();
        assert_eq!(all.bits().count_ones(), 13);
        assert!(RenderFx::WEAPONMODEL.contains(RenderFx::WEAPONMODEL));
        assert!(!RenderFx::WEAPONMODEL.intersects(RenderFx::VIEWERMODEL));
    }
}
