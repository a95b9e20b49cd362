#![allow(clippy::too_many_arguments, clippy::float_cmp, clippy::needless_range_loop,
         clippy::collapsible_if, clippy::comparison_chain, clippy::type_complexity)]
// Scene rendering core: draw lists, batching, dynamic streams, portals
// and the frontend/backend command queue.

pub mod error;
pub mod r_public;
pub mod r_shader;
pub mod r_model;
pub mod r_math;

// GPU seam and state cache
pub mod r_backend;
pub mod r_dynamic;

// Draw list construction and execution
pub mod r_surface;
pub mod r_sort;
pub mod r_mesh;
pub mod r_batch;

// Scene, views and portals
pub mod r_scene;
pub mod r_refinst;
pub mod r_portals;
pub mod r_main;
pub mod r_draw2d;

// Configuration and frontend/backend split
pub mod r_config;
pub mod r_cmdque;
pub mod r_frontend;

pub use error::{RenderError, Result};
pub use r_frontend::Frontend;
pub use r_main::RenderContext;
