// r_sort.rs — draw surface sort and distance keys
//
// The distance key orders by shader sort class, then by a view-distance
// bucket, then by submission order. The sort key groups by shader, light
// style, entity and portal so equal runs share GPU state. Both derive Ord
// over their fields in significance order.

use rayon::prelude::*;

use crate::r_public::RenderFx;
use crate::r_shader::{Shader, ShaderSort};
use crate::r_surface::DrawSurface;

const DIST_BUCKET_ORIGIN: i32 = 0x400;
const DIST_BUCKET_MAX: i32 = 0x7FF;
const ORDER_MASK: u32 = 0x7FFF;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DistKey {
    sort: ShaderSort,
    bucket: u16,
    order: u16,
}

impl DistKey {
    pub fn new(sort: ShaderSort, dist: f32, order: u32) -> Self {
        let bucket = (DIST_BUCKET_ORIGIN - dist as i32).clamp(0, DIST_BUCKET_MAX);
        Self {
            sort,
            bucket: bucket as u16,
            order: (order & ORDER_MASK) as u16,
        }
    }

    /// Distance key for a surface, applying the weapon and alpha-hack class
    /// overrides. None means the surface must not be drawn.
    pub fn for_surface(renderfx: RenderFx, shader: &Shader, dist: f32, order: u32) -> Option<Self> {
        let sort = if renderfx.contains(RenderFx::WEAPONMODEL) {
            if renderfx.contains(RenderFx::NOCOLORWRITE) {
                if !shader.writes_depth() {
                    return None;
                }
                ShaderSort::Weapon
            } else if renderfx.contains(RenderFx::ALPHAHACK) {
                if shader.writes_depth() {
                    ShaderSort::Weapon2
                } else {
                    ShaderSort::Additive
                }
            } else {
                shader.sort
            }
        } else if renderfx.contains(RenderFx::ALPHAHACK) {
            ShaderSort::Additive
        } else {
            shader.sort
        };

        let key = Self::new(sort, dist, order);
        if key.is_zero() {
            return None;
        }
        Some(key)
    }

    pub fn is_zero(&self) -> bool {
        self.sort == ShaderSort::None && self.bucket == 0 && self.order == 0
    }

    pub fn sort_class(&self) -> ShaderSort {
        self.sort
    }

    pub fn bucket(&self) -> u16 {
        self.bucket
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    shader: u16,
    light_style: u8,
    entity: u16,
    portal: u8,
}

impl SortKey {
    pub fn new(shader: u16, light_style: i32, entity: usize, portal: Option<usize>) -> Self {
        Self {
            shader: shader & 0xFFF,
            light_style: (light_style + 1) as u8,
            entity: (entity & 0xFFF) as u16,
            portal: portal.map_or(0, |p| (p + 1) as u8),
        }
    }

    pub fn shader(&self) -> u16 {
        self.shader
    }

    pub fn light_style(&self) -> i32 {
        self.light_style as i32 - 1
    }

    pub fn entity(&self) -> usize {
        self.entity as usize
    }

    pub fn portal(&self) -> Option<usize> {
        (self.portal as usize).checked_sub(1)
    }
}

/// A draw list entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SortedDrawSurf {
    pub sort: SortKey,
    pub dist: DistKey,
    pub surf: DrawSurface,
    /// Submission index, breaks ties between equal keys.
    pub seq: u32,
}

impl SortedDrawSurf {
    pub fn order_key(&self) -> (DistKey, SortKey, u32) {
        (self.dist, self.sort, self.seq)
    }
}

/// Sorts surfaces by (dist key, sort key, submission index). Lists at or
/// above `parallel_min` entries are sorted on the rayon pool.
pub fn sort_draw_surfs(surfs: &mut [SortedDrawSurf], parallel_min: usize) {
    if surfs.len() >= parallel_min.max(2) {
        surfs.par_sort_unstable_by_key(SortedDrawSurf::order_key);
    } else {
        surfs.sort_unstable_by_key(SortedDrawSurf::order_key);
    }
}

/// Lightmaps a surface may blend.
pub const MAX_LIGHTMAPS: u32 = 4;

/// Submission order for opaque world surfaces: groups by shader, then by
/// lightmap count.
pub fn pack_opaque_order(shader: &Shader, num_lightmaps: u32) -> u32 {
    let mut order = u32::from(shader.id) & 0x3F;
    if num_lightmaps > 0 {
        order |= (MAX_LIGHTMAPS - num_lightmaps.min(MAX_LIGHTMAPS)) << 10;
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r_shader::{ShaderDesc, ShaderFlags, ShaderRegistry};

    fn shader(reg: &mut ShaderRegistry, name: &str, sort: ShaderSort, flags: ShaderFlags) -> std::sync::Arc<Shader> {
        reg.register(name, ShaderDesc { sort, flags, ..Default::default() })
    }

    #[test]
    fn test_sort_class_dominates_distance() {
        let near_additive = DistKey::new(ShaderSort::Additive, 1.0, 0);
        let far_opaque = DistKey::new(ShaderSort::Opaque, 1000.0, 0);
        let far_additive = DistKey::new(ShaderSort::Additive, 900.0, 5);
        assert!(far_opaque < near_additive);
        assert!(far_opaque < far_additive);
        // within a class, further surfaces draw first
        assert!(far_additive < near_additive);
    }

    #[test]
    fn test_bucket_clamps() {
        assert_eq!(DistKey::new(ShaderSort::Opaque, 5000.0, 0).bucket(), 0);
        assert_eq!(DistKey::new(ShaderSort::Opaque, 0.0, 0).bucket(), 0x400);
        assert_eq!(DistKey::new(ShaderSort::Opaque, -100_000.0, 0).bucket(), 0x7FF);
    }

    #[test]
    fn test_weapon_overrides() {
        let mut reg = ShaderRegistry::new().unwrap();
        let depth = shader(&mut reg, "d", ShaderSort::Opaque, ShaderFlags::DEPTHWRITE);
        let blend = shader(&mut reg, "b", ShaderSort::Additive, ShaderFlags::empty());

        let weapon_mask = RenderFx::WEAPONMODEL | RenderFx::NOCOLORWRITE;
        assert_eq!(DistKey::for_surface(weapon_mask, &blend, 0.0, 0), None);
        assert_eq!(
            DistKey::for_surface(weapon_mask, &depth, 0.0, 0).map(|k| k.sort_class()),
            Some(ShaderSort::Weapon)
        );

        let weapon_alpha = RenderFx::WEAPONMODEL | RenderFx::ALPHAHACK;
        assert_eq!(
            DistKey::for_surface(weapon_alpha, &depth, 0.0, 0).map(|k| k.sort_class()),
            Some(ShaderSort::Weapon2)
        );
        assert_eq!(
            DistKey::for_surface(weapon_alpha, &blend, 0.0, 0).map(|k| k.sort_class()),
            Some(ShaderSort::Additive)
        );
        assert_eq!(
            DistKey::for_surface(RenderFx::ALPHAHACK, &depth, 0.0, 0).map(|k| k.sort_class()),
            Some(ShaderSort::Additive)
        );
        assert_eq!(
            DistKey::for_surface(RenderFx::empty(), &depth, 0.0, 0).map(|k| k.sort_class()),
            Some(ShaderSort::Opaque)
        );
    }

    #[test]
    fn test_zero_key_is_dropped() {
        let mut reg = ShaderRegistry::new().unwrap();
        let none = shader(&mut reg, "n", ShaderSort::None, ShaderFlags::empty());
        assert_eq!(DistKey::for_surface(RenderFx::empty(), &none, 2048.0, 0), None);
        assert!(DistKey::for_surface(RenderFx::empty(), &none, 2048.0, 1).is_some());
    }

    #[test]
    fn test_opaque_order_groups_by_lightmaps() {
        let mut reg = ShaderRegistry::new().unwrap();
        let lm = shader(&mut reg, "lm", ShaderSort::Opaque, ShaderFlags::LIGHTMAP);
        let plain = pack_opaque_order(&lm, 0);
        assert_eq!(plain, u32::from(lm.id) & 0x3F);
        assert_eq!(pack_opaque_order(&lm, 1), plain | (3 << 10));
        assert!(pack_opaque_order(&lm, 4) < pack_opaque_order(&lm, 1));
    }

    #[test]
    fn test_sort_key_fields_roundtrip() {
        let k = SortKey::new(17, -1, 300, Some(4));
        assert_eq!(k.shader(), 17);
        assert_eq!(k.light_style(), -1);
        assert_eq!(k.entity(), 300);
        assert_eq!(k.portal(), Some(4));
        assert_eq!(SortKey::new(1, 2, 0, None).portal(), None);
        assert!(SortKey::new(1, 200, 900, None) < SortKey::new(2, -1, 0, None));
    }

    #[test]
    fn test_sort_is_idempotent_and_stable_by_seq() {
        let mut surfs: Vec<SortedDrawSurf> = (0..500u32)
            .map(|i| SortedDrawSurf {
                sort: SortKey::new((i % 7) as u16, -1, (i % 3) as usize, None),
                dist: DistKey::new(if i % 2 == 0 { ShaderSort::Opaque } else { ShaderSort::Additive }, (i % 11) as f32, 0),
                surf: DrawSurface::Poly(i as usize),
                seq: i,
            })
            .collect();
        sort_draw_surfs(&mut surfs, 4096);
        let once = surfs.clone();
        sort_draw_surfs(&mut surfs, 1);
        assert_eq!(surfs, once);
        for pair in surfs.windows(2) {
            assert!(pair[0].order_key() < pair[1].order_key());
        }
    }
}
