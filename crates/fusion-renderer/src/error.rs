//! Renderer error type.
//!
//! Only initialization paths return errors. Per-frame paths drop work
//! silently or log and fall back.

use thiserror::Error;

/// Errors raised while bringing up the renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The backend adapter thread could not be spawned.
    #[error("failed to spawn the render adapter thread: {0}")]
    AdapterThread(#[from] std::io::Error),

    /// An off-screen render target could not be created.
    #[error("render target {width}x{height} unavailable: {reason}")]
    RenderTarget {
        width: i32,
        height: i32,
        reason: String,
    },

    /// A built-in shader failed to register.
    #[error("shader registration failed: {0}")]
    Shader(String),

    /// A call that needs an initialized backend arrived too early.
    #[error("renderer not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, RenderError>;
