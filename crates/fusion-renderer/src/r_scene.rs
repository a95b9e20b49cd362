// r_scene.rs — per-frame scene accumulation
// Entities, polys, dynamic lights and light styles submitted by the client
// between ClearScene and RenderScene.

use fusion_common::common::{com_error, ERR_DROP};
use fusion_common::q_shared::Vec3;

use crate::r_model::ModelKind;
use crate::r_public::{
    DLight, Entity, EntityType, LightStyle, Poly, RefDef, RenderFx, MAX_DLIGHTS, MAX_ENTITIES,
    MAX_LIGHTSTYLES, MAX_POLYS, MAX_POLY_VERTS,
};

// Local entities, re-created by every clear.
pub const WORLD_ENT: usize = 0;
pub const POLY_ENT: usize = 1;
pub const POLY_WEAP_ENT: usize = 2;
pub const POLY_VIEWER_ENT: usize = 3;
pub const SKY_ENT: usize = 4;
pub const NUM_LOCAL_ENTITIES: usize = 5;

pub const MAX_REF_ENTITIES: usize = MAX_ENTITIES + 48;

#[derive(Debug)]
pub struct Scene {
    pub entities: Vec<Entity>,
    /// Indices of brush model entities.
    pub bmodel_entities: Vec<usize>,
    pub polys: Vec<Poly>,
    pub dlights: Vec<DLight>,
    pub light_styles: Vec<LightStyle>,
    pub frame_count: u32,
    /// Last refdef rendered with a world model.
    pub refdef: RefDef,
    pub world_model_sequence: i32,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        let mut scene = Self {
            entities: Vec::with_capacity(MAX_REF_ENTITIES),
            bmodel_entities: Vec::new(),
            polys: Vec::with_capacity(MAX_POLYS),
            dlights: Vec::with_capacity(MAX_DLIGHTS),
            light_styles: vec![LightStyle::default(); MAX_LIGHTSTYLES],
            frame_count: 0,
            refdef: RefDef::default(),
            world_model_sequence: 0,
        };
        scene.clear();
        scene
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.entities.push(Entity::default());
        self.entities.push(Entity::default());
        self.entities.push(Entity {
            renderfx: RenderFx::WEAPONMODEL,
            ..Default::default()
        });
        self.entities.push(Entity {
            renderfx: RenderFx::VIEWERMODEL,
            ..Default::default()
        });
        let sky = self.entities[WORLD_ENT].clone();
        self.entities.push(sky);

        self.bmodel_entities.clear();
        self.polys.clear();
        self.dlights.clear();
        self.frame_count = self.frame_count.wrapping_add(1);
    }

    /// Number of client-submitted entities.
    pub fn num_client_entities(&self) -> usize {
        self.entities.len() - NUM_LOCAL_ENTITIES
    }

    pub fn add_entity(&mut self, ent: &Entity) {
        if self.num_client_entities() >= MAX_ENTITIES {
            return;
        }

        let num = self.entities.len();
        let mut de = ent.clone();

        match de.rtype {
            EntityType::Model => {
                let brush = de
                    .model
                    .as_ref()
                    .is_some_and(|m| matches!(m.kind, ModelKind::Brush(_)));
                if brush {
                    de.renderfx |= RenderFx::FORCENOLOD;
                    self.bmodel_entities.push(num);
                }
            }
            EntityType::Sprite => {
                de.model = None;
                de.renderfx |= RenderFx::FORCENOLOD;
                if de.custom_shader.is_none() || de.radius <= 0.0 || de.scale <= 0.0 {
                    return;
                }
            }
            _ => {}
        }

        if de.renderfx.contains(RenderFx::ALPHAHACK) && de.color[3] == 255 {
            de.renderfx.remove(RenderFx::ALPHAHACK);
        }
        if de.renderfx.contains(RenderFx::WEAPONMODEL) {
            de.renderfx |= RenderFx::NOSHADOW;
        }

        self.entities.push(de);
    }

    pub fn add_poly(&mut self, poly: &Poly) {
        if self.polys.len() >= MAX_POLYS || poly.verts.is_empty() || poly.shader.is_none() {
            return;
        }

        let mut dp = poly.clone();
        if dp.verts.len() > MAX_POLY_VERTS {
            dp.verts.truncate(MAX_POLY_VERTS);
            dp.normals.truncate(MAX_POLY_VERTS);
            dp.stcoords.truncate(MAX_POLY_VERTS);
            dp.colors.truncate(MAX_POLY_VERTS);
        }
        self.polys.push(dp);
    }

    pub fn add_light(&mut self, origin: Vec3, intensity: f32, r: f32, g: f32, b: f32) {
        if self.dlights.len() >= MAX_DLIGHTS || intensity <= 0.0 {
            return;
        }
        self.dlights.push(DLight {
            origin,
            intensity,
            color: [r, g, b],
        });
    }

    pub fn add_light_style(&mut self, style: i32, r: f32, g: f32, b: f32) {
        if style < 0 || style as usize >= MAX_LIGHTSTYLES {
            com_error(ERR_DROP, &format!("add_light_style: bad light style {}", style));
            return;
        }
        self.light_styles[style as usize].rgb = [r.max(0.0), g.max(0.0), b.max(0.0)];
    }

    /// Entity used for a poly with the given render effects.
    pub fn poly_entity(renderfx: RenderFx) -> usize {
        if renderfx.contains(RenderFx::WEAPONMODEL) {
            POLY_WEAP_ENT
        } else if renderfx.contains(RenderFx::VIEWERMODEL) {
            POLY_VIEWER_ENT
        } else {
            POLY_ENT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::r_model::{BrushModel, Model};
    use crate::r_shader::ShaderRegistry;

    #[test]
    fn test_clear_creates_local_entities() {
        let mut scene = Scene::new();
        let frame = scene.frame_count;
        scene.add_entity(&Entity::default());
        scene.clear();
        assert_eq!(scene.entities.len(), NUM_LOCAL_ENTITIES);
        assert_eq!(scene.num_client_entities(), 0);
        assert_eq!(scene.frame_count, frame + 1);
        assert!(scene.entities[POLY_WEAP_ENT].renderfx.contains(RenderFx::WEAPONMODEL));
        assert!(scene.entities[POLY_VIEWER_ENT].renderfx.contains(RenderFx::VIEWERMODEL));
        assert_eq!(scene.entities[SKY_ENT], scene.entities[WORLD_ENT]);
    }

    #[test]
    fn test_entity_cap() {
        let mut scene = Scene::new();
        for _ in 0..MAX_ENTITIES + 5 {
            scene.add_entity(&Entity::default());
        }
        assert_eq!(scene.num_client_entities(), MAX_ENTITIES);
    }

    #[test]
    fn test_brush_entities_are_indexed() {
        let mut scene = Scene::new();
        let bmodel = Arc::new(Model {
            kind: ModelKind::Brush(BrushModel::default()),
            ..Default::default()
        });
        scene.add_entity(&Entity::default());
        scene.add_entity(&Entity {
            model: Some(bmodel),
            ..Default::default()
        });
        assert_eq!(scene.bmodel_entities, vec![NUM_LOCAL_ENTITIES + 1]);
        assert!(scene.entities[NUM_LOCAL_ENTITIES + 1].renderfx.contains(RenderFx::FORCENOLOD));
    }

    #[test]
    fn test_sprite_requirements() {
        let reg = ShaderRegistry::new().unwrap();
        let mut scene = Scene::new();
        let sprite = Entity {
            rtype: EntityType::Sprite,
            custom_shader: Some(reg.white_shader.clone()),
            radius: 8.0,
            model: Some(Arc::new(Model::default())),
            ..Default::default()
        };
        scene.add_entity(&Entity { radius: 0.0, ..sprite.clone() });
        scene.add_entity(&Entity { custom_shader: None, ..sprite.clone() });
        scene.add_entity(&Entity { scale: 0.0, ..sprite.clone() });
        assert_eq!(scene.num_client_entities(), 0);

        scene.add_entity(&sprite);
        assert_eq!(scene.num_client_entities(), 1);
        assert!(scene.entities[NUM_LOCAL_ENTITIES].model.is_none());
    }

    #[test]
    fn test_alphahack_and_weapon_flags() {
        let mut scene = Scene::new();
        scene.add_entity(&Entity {
            renderfx: RenderFx::ALPHAHACK | RenderFx::WEAPONMODEL,
            ..Default::default()
        });
        scene.add_entity(&Entity {
            renderfx: RenderFx::ALPHAHACK,
            color: [255, 255, 255, 128],
            ..Default::default()
        });
        let opaque = scene.entities[NUM_LOCAL_ENTITIES].renderfx;
        assert!(!opaque.contains(RenderFx::ALPHAHACK));
        assert!(opaque.contains(RenderFx::NOSHADOW));
        assert!(scene.entities[NUM_LOCAL_ENTITIES + 1].renderfx.contains(RenderFx::ALPHAHACK));
    }

    #[test]
    fn test_poly_validation_and_clamp() {
        let reg = ShaderRegistry::new().unwrap();
        let mut scene = Scene::new();
        scene.add_poly(&Poly { verts: vec![[0.0; 3]; 3], ..Default::default() });
        scene.add_poly(&Poly { shader: Some(reg.white_shader.clone()), ..Default::default() });
        assert!(scene.polys.is_empty());

        scene.add_poly(&Poly {
            verts: vec![[0.0; 3]; MAX_POLY_VERTS + 10],
            shader: Some(reg.white_shader.clone()),
            ..Default::default()
        });
        assert_eq!(scene.polys[0].num_verts(), MAX_POLY_VERTS);
    }

    #[test]
    fn test_light_styles_and_dlights() {
        let mut scene = Scene::new();
        scene.add_light_style(3, 0.5, -1.0, 2.0);
        assert_eq!(scene.light_styles[3].rgb, [0.5, 0.0, 2.0]);
        scene.add_light_style(MAX_LIGHTSTYLES as i32, 1.0, 1.0, 1.0);
        scene.add_light_style(-1, 1.0, 1.0, 1.0);

        for i in 0..MAX_DLIGHTS + 3 {
            scene.add_light([i as f32, 0.0, 0.0], 200.0, 1.0, 1.0, 1.0);
        }
        assert_eq!(scene.dlights.len(), MAX_DLIGHTS);
        scene.clear();
        assert!(scene.dlights.is_empty());
    }

    #[test]
    fn test_poly_entity_selection() {
        assert_eq!(Scene::poly_entity(RenderFx::empty()), POLY_ENT);
        assert_eq!(Scene::poly_entity(RenderFx::WEAPONMODEL), POLY_WEAP_ENT);
        assert_eq!(Scene::poly_entity(RenderFx::VIEWERMODEL), POLY_VIEWER_ENT);
    }
}
