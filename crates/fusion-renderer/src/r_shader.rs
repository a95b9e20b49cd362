// r_shader.rs — shader descriptions and the shader registry
// Shader parsing lives elsewhere; the renderer only sees the resolved fields.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{RenderError, Result};

pub const MAX_SHADERS: usize = 4096;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderFlags: u32 {
        const DEPTHWRITE        = 1 << 0;
        const SKY               = 1 << 1;
        const CULL_FRONT        = 1 << 2;
        const CULL_BACK         = 1 << 3;
        const POLYGONOFFSET     = 1 << 4;
        const ENTITY_MERGABLE   = 1 << 5;
        const AUTOSPRITE        = 1 << 6;
        const LIGHTMAP          = 1 << 7;
        const PORTAL            = 1 << 8;
        const PORTAL_CAPTURE    = 1 << 9;
        const PORTAL_CAPTURE2   = 1 << 10;
        const NO_TEX_FILTERING  = 1 << 11;
        const NODRAWFLAT        = 1 << 13;
        const SOFT_PARTICLE     = 1 << 14;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VertexAttribs: u32 {
        const POSITION   = 1 << 0;
        const NORMAL     = 1 << 1;
        const SVECTOR    = 1 << 2;
        const COLOR0     = 1 << 3;
        const TEXCOORDS  = 1 << 4;
        const LMCOORDS   = 1 << 5;
        const BONES      = 1 << 6;

        const COMPACT = Self::POSITION.bits() | Self::COLOR0.bits() | Self::TEXCOORDS.bits();
    }
}

/// Shader sort classes, back to front.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ShaderSort {
    #[default]
    None = 0,
    Portal,
    Opaque,
    Sky,
    Decal,
    AlphaTest,
    Banner,
    Underwater,
    Additive,
    Nearest,
    Weapon,
    Weapon2,
}

impl ShaderSort {
    pub const MAX: ShaderSort = ShaderSort::Weapon2;
}

/// A resolved shader.
#[derive(Clone, Debug, PartialEq)]
pub struct Shader {
    pub id: u16,
    pub name: String,
    pub flags: ShaderFlags,
    pub sort: ShaderSort,
    pub vattribs: VertexAttribs,
    /// Portal surfaces further than this are not rendered. Zero disables the check.
    pub portal_distance: f32,
    /// Constant alpha of the distortion pass, if it has one.
    pub distortion_alpha: Option<f32>,
}

impl Shader {
    pub fn writes_depth(&self) -> bool {
        self.flags.contains(ShaderFlags::DEPTHWRITE)
    }

    pub fn reads_depth(&self) -> bool {
        self.flags.contains(ShaderFlags::SOFT_PARTICLE)
    }

    pub fn is_sky(&self) -> bool {
        self.flags.contains(ShaderFlags::SKY)
    }
}

/// Everything but the id, as handed over by the shader parser.
#[derive(Clone, Debug, Default)]
pub struct ShaderDesc {
    pub flags: ShaderFlags,
    pub sort: ShaderSort,
    pub vattribs: VertexAttribs,
    pub portal_distance: f32,
    pub distortion_alpha: Option<f32>,
}

/// Registry of all shaders, indexed by id.
#[derive(Debug)]
pub struct ShaderRegistry {
    shaders: Vec<Arc<Shader>>,
    by_name: HashMap<String, u16>,
    pub default_shader: Arc<Shader>,
    pub white_shader: Arc<Shader>,
    pub depth_only_shader: Arc<Shader>,
}

impl ShaderRegistry {
    /// Creates the registry with its built-in shaders.
    pub fn new() -> Result<Self> {
        let mut shaders = Vec::with_capacity(64);
        let mut by_name = HashMap::new();
        let mut builtin = |name: &str, desc: ShaderDesc| -> Result<Arc<Shader>> {
            let id = u16::try_from(shaders.len())
                .map_err(|_| RenderError::Shader(name.to_string()))?;
            let shader = Arc::new(Shader {
                id,
                name: name.to_string(),
                flags: desc.flags,
                sort: desc.sort,
                vattribs: desc.vattribs,
                portal_distance: desc.portal_distance,
                distortion_alpha: desc.distortion_alpha,
            });
            shaders.push(shader.clone());
            by_name.insert(name.to_string(), id);
            Ok(shader)
        };

        let default_shader = builtin("$default", ShaderDesc {
            flags: ShaderFlags::DEPTHWRITE | ShaderFlags::CULL_FRONT,
            sort: ShaderSort::Opaque,
            vattribs: VertexAttribs::all(),
            ..Default::default()
        })?;
        let white_shader = builtin("$whiteimage", ShaderDesc {
            sort: ShaderSort::Additive,
            vattribs: VertexAttribs::COMPACT,
            ..Default::default()
        })?;
        let depth_only_shader = builtin("$depthonly", ShaderDesc {
            flags: ShaderFlags::DEPTHWRITE | ShaderFlags::CULL_FRONT,
            sort: ShaderSort::Opaque,
            vattribs: VertexAttribs::POSITION,
            ..Default::default()
        })?;

        Ok(Self {
            shaders,
            by_name,
            default_shader,
            white_shader,
            depth_only_shader,
        })
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&Arc<Shader>> {
        self.shaders.get(id as usize)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Shader>> {
        self.by_name.get(name).and_then(|&id| self.get(id))
    }

    /// Registers a shader, or returns the existing one with that name.
    /// Falls back to the default shader once the table is full.
    pub fn register(&mut self, name: &str, desc: ShaderDesc) -> Arc<Shader> {
        if let Some(existing) = self.find(name) {
            return existing.clone();
        }
        if self.shaders.len() >= MAX_SHADERS {
            log::warn!("register_shader: {} - MAX_SHADERS hit, using default", name);
            return self.default_shader.clone();
        }

        let shader = Arc::new(Shader {
            id: self.shaders.len() as u16,
            name: name.to_string(),
            flags: desc.flags,
            sort: desc.sort,
            vattribs: desc.vattribs,
            portal_distance: desc.portal_distance,
            distortion_alpha: desc.distortion_alpha,
        });
        self.by_name.insert(name.to_string(), shader.id);
        self.shaders.push(shader.clone());
        shader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_shaders() {
        let reg = ShaderRegistry::new().unwrap();
        assert_eq!(reg.len(), 3);
        assert!(reg.depth_only_shader.writes_depth());
        assert!(!reg.white_shader.writes_depth());
        assert_eq!(reg.find("$whiteimage").map(|s| s.id), Some(reg.white_shader.id));
    }

    #[test]
    fn test_register_dedups_by_name() {
        let mut reg = ShaderRegistry::new().unwrap();
        let a = reg.register("textures/base/floor", ShaderDesc {
            sort: ShaderSort::Opaque,
            ..Default::default()
        });
        let b = reg.register("textures/base/floor", ShaderDesc::default());
        assert_eq!(a.id, b.id);
        assert_eq!(b.sort, ShaderSort::Opaque);
        assert_eq!(reg.get(a.id).map(|s| s.name.as_str()), Some("textures/base/floor"));
    }

    #[test]
    fn test_register_full_falls_back_to_default() {
        let mut reg = ShaderRegistry::new().unwrap();
        for i in reg.len()..MAX_SHADERS {
            reg.register(&format!("s{}", i), ShaderDesc::default());
        }
        let s = reg.register("one_too_many", ShaderDesc::default());
        assert_eq!(s.id, reg.default_shader.id);
    }

    #[test]
    fn test_sort_order() {
        assert!(ShaderSort::Portal < ShaderSort::Opaque);
        assert!(ShaderSort::Additive < ShaderSort::Weapon);
        assert_eq!(ShaderSort::MAX, ShaderSort::Weapon2);
        assert_eq!(ShaderSort::Weapon2 as u8, 11);
    }
}
