// r_config.rs — renderer cvars

use fusion_common::cvar::CvarContext;
use fusion_common::q_shared::{CVAR_ARCHIVE, CVAR_LATCH, CVAR_ZERO};

use crate::r_refinst::REFINST_STACK_SIZE;

const CVARS: &[(&str, &str, i32)] = &[
    ("r_multithreading", "0", CVAR_ARCHIVE | CVAR_LATCH),
    ("r_maxfps", "250", CVAR_ARCHIVE),
    ("r_drawentities", "1", CVAR_ZERO),
    ("r_drawworld", "1", CVAR_ZERO),
    ("r_novis", "0", CVAR_ZERO),
    ("r_nocull", "0", CVAR_ZERO),
    ("r_fastsky", "0", CVAR_ARCHIVE),
    ("r_drawflat", "0", CVAR_ARCHIVE),
    ("r_portalonly", "0", CVAR_ZERO),
    ("r_portal_maxdepth", "2", CVAR_ARCHIVE),
    ("r_soft_particles", "1", CVAR_ARCHIVE),
    ("r_showtris", "0", CVAR_ZERO),
    ("r_sort_parallel_min", "4096", CVAR_ARCHIVE),
    ("r_polyblend", "1", CVAR_ARCHIVE),
    ("r_gamma", "1.0", CVAR_ARCHIVE),
    ("r_texturefilter", "4", CVAR_ARCHIVE),
    ("r_wallcolor", "255 255 255", CVAR_ARCHIVE),
    ("r_floorcolor", "255 153 0", CVAR_ARCHIVE),
];

/// Snapshot of the renderer cvars.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderConfig {
    pub multithreading: bool,
    /// Zero means uncapped.
    pub max_fps: i32,
    pub draw_entities: bool,
    pub draw_world: bool,
    pub novis: bool,
    pub nocull: bool,
    pub fast_sky: bool,
    pub draw_flat: bool,
    pub portal_only: bool,
    pub portal_max_depth: usize,
    pub soft_particles: bool,
    pub show_tris: bool,
    pub sort_parallel_min: usize,
    pub poly_blend: bool,
    pub gamma: f32,
    pub texture_filter: i32,
    pub wall_color: [u8; 3],
    pub floor_color: [u8; 3],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            multithreading: false,
            max_fps: 250,
            draw_entities: true,
            draw_world: true,
            novis: false,
            nocull: false,
            fast_sky: false,
            draw_flat: false,
            portal_only: false,
            portal_max_depth: 2,
            soft_particles: true,
            show_tris: false,
            sort_parallel_min: 4096,
            poly_blend: true,
            gamma: 1.0,
            texture_filter: 4,
            wall_color: [255, 255, 255],
            floor_color: [255, 153, 0],
        }
    }
}

impl RenderConfig {
    /// Creates every renderer cvar that does not exist yet.
    pub fn register(cvars: &mut CvarContext) {
        for &(name, value, flags) in CVARS {
            cvars.get(name, value, flags);
        }
    }

    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let flag = |name: &str| cvars.variable_integer(name) != 0;
        Self {
            multithreading: flag("r_multithreading"),
            max_fps: cvars.variable_integer("r_maxfps").max(0),
            draw_entities: flag("r_drawentities"),
            draw_world: flag("r_drawworld"),
            novis: flag("r_novis"),
            nocull: flag("r_nocull"),
            fast_sky: flag("r_fastsky"),
            draw_flat: flag("r_drawflat"),
            portal_only: flag("r_portalonly"),
            portal_max_depth: (cvars.variable_integer("r_portal_maxdepth").max(0) as usize)
                .min(REFINST_STACK_SIZE),
            soft_particles: flag("r_soft_particles"),
            show_tris: flag("r_showtris"),
            sort_parallel_min: cvars.variable_integer("r_sort_parallel_min").max(0) as usize,
            poly_blend: flag("r_polyblend"),
            gamma: cvars.variable_value("r_gamma"),
            texture_filter: cvars.variable_integer("r_texturefilter"),
            wall_color: parse_color(cvars.variable_string("r_wallcolor"), [255, 255, 255]),
            floor_color: parse_color(cvars.variable_string("r_floorcolor"), [255, 153, 0]),
        }
    }

    pub fn uncapped(&self) -> bool {
        self.max_fps == 0
    }
}

/// Parses "r g b". Components clamp to 0..255; malformed strings give `fallback`.
pub fn parse_color(s: &str, fallback: [u8; 3]) -> [u8; 3] {
    let parts: Vec<i32> = s
        .split_whitespace()
        .filter_map(|p| p.parse::<f32>().ok())
        .map(|v| v as i32)
        .collect();
    if parts.len() != 3 {
        return fallback;
    }
    [
        parts[0].clamp(0, 255) as u8,
        parts[1].clamp(0, 255) as u8,
        parts[2].clamp(0, 255) as u8,
    ]
}
