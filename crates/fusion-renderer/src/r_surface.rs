// r_surface.rs — drawable surface kinds

use std::sync::Arc;

use crate::r_model::Model;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceType {
    Bsp,
    Sky,
    Alias,
    Skeletal,
    Sprite,
    Poly,
    NullModel,
}

/// Which batch a surface accumulates into before it hits the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushKind {
    /// Contiguous BSP element ranges.
    Bsp,
    /// The dynamic mesh streams.
    Dynamic,
}

/// A reference to something drawable. Geometry is never owned here.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawSurface {
    /// World draw surface index.
    Bsp(usize),
    /// The sky dome of the current view.
    Sky,
    Alias { model: Arc<Model>, mesh: usize },
    Skeletal { model: Arc<Model>, mesh: usize },
    /// The sprite entity referenced by the sort key.
    Sprite,
    /// Scene poly index.
    Poly(usize),
    /// Axis lines drawn for entities without a usable model.
    NullModel,
}

impl DrawSurface {
    pub fn surface_type(&self) -> SurfaceType {
        match self {
            DrawSurface::Bsp(_) => SurfaceType::Bsp,
            DrawSurface::Sky => SurfaceType::Sky,
            DrawSurface::Alias { .. } => SurfaceType::Alias,
            DrawSurface::Skeletal { .. } => SurfaceType::Skeletal,
            DrawSurface::Sprite => SurfaceType::Sprite,
            DrawSurface::Poly(_) => SurfaceType::Poly,
            DrawSurface::NullModel => SurfaceType::NullModel,
        }
    }

    /// Batch kind for batched surfaces, None for surfaces drawn immediately.
    pub fn flush_kind(&self) -> Option<FlushKind> {
        match self {
            DrawSurface::Bsp(_) => Some(FlushKind::Bsp),
            DrawSurface::Sprite | DrawSurface::Poly(_) => Some(FlushKind::Dynamic),
            _ => None,
        }
    }

    pub fn is_batched(&self) -> bool {
        self.flush_kind().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batched_kinds() {
        assert_eq!(DrawSurface::Bsp(3).flush_kind(), Some(FlushKind::Bsp));
        assert_eq!(DrawSurface::Sprite.flush_kind(), Some(FlushKind::Dynamic));
        assert_eq!(DrawSurface::Poly(0).flush_kind(), Some(FlushKind::Dynamic));
        assert!(!DrawSurface::Sky.is_batched());
        assert!(!DrawSurface::NullModel.is_batched());
        let alias = DrawSurface::Alias { model: Arc::new(Model::default()), mesh: 0 };
        assert!(!alias.is_batched());
        assert_eq!(alias.surface_type(), SurfaceType::Alias);
    }
}
