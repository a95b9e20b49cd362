//! 2D drawing and frame bracketing.
//!
//! Pics and stretch polys are streamed through the dynamic meshes like any
//! other transient geometry; 2D mode only swaps in a pixel-space ortho
//! projection and disables the depth test.

use std::sync::Arc;

use fusion_common::q_shared::{anglemod, Vec4};

use crate::r_backend::{ClearBits, Primitive, StateBits};
use crate::r_dynamic::DynamicMesh;
use crate::r_math::{matrix4_ortho_projection, Mat4, MAT4_IDENTITY};
use crate::r_public::Poly;
use crate::r_refinst::RenderFlags;
use crate::r_shader::Shader;
use crate::RenderContext;

const MAX_TRANSFORM_STACK: usize = 32;

fn float_to_byte(c: f32) -> u8 {
    (c * 255.0).clamp(0.0, 255.0) as u8
}

impl RenderContext {
    // ============================================================
    // Frames
    // ============================================================

    pub fn begin_frame(&mut self, force_clear: bool) {
        self.rb.begin_frame();
        if force_clear {
            self.rb.clear(ClearBits::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0);
        }
        self.begin_2d();
    }

    pub fn end_frame(&mut self) {
        self.rb.flush_dynamic_meshes();
        self.poly_blend();
        self.end_2d();
        self.rb.end_frame();
    }

    /// Full-screen tint from the last world refdef.
    fn poly_blend(&mut self) {
        if !self.config.poly_blend {
            return;
        }
        let blend = self.scene.refdef.blend;
        if blend[3] < 0.01 {
            return;
        }

        self.begin_2d();
        let white = self.shaders.white_shader.clone();
        let (w, h) = (self.frame_buffer_width, self.frame_buffer_height);
        self.draw_stretch_pic(0, 0, w, h, 0.0, 0.0, 1.0, 1.0, blend, &white);
        self.rb.flush_dynamic_meshes();
    }

    pub fn blur_screen(&mut self) {
        self.rb.flush_dynamic_meshes();
        self.rb.blur_screen();
    }

    // ============================================================
    // 2D mode
    // ============================================================

    /// Switches to pixel coordinates over the bound framebuffer. A no-op if
    /// already in 2D at the same size.
    pub(crate) fn begin_2d(&mut self) {
        let size = (self.frame_buffer_width, self.frame_buffer_height);
        if self.two_d == Some(size) {
            return;
        }
        self.two_d = Some(size);
        self.setup_gl_2d(size.0, size.1);
    }

    pub(crate) fn end_2d(&mut self) {
        if self.two_d.is_none() {
            return;
        }
        self.two_d = None;
        // pending 2D geometry still needs the 2D state
        self.rb.flush_dynamic_meshes();
        self.rb.set_state_mask(StateBits::all(), StateBits::empty());
    }

    fn setup_gl_2d(&mut self, width: i32, height: i32) {
        let proj = matrix4_ortho_projection(0.0, width as f32, height as f32, 0.0, -99999.0, 99999.0);

        self.rb.scissor(0, 0, width, height);
        self.rb.viewport(0, 0, width, height);
        self.rb.load_projection_matrix(&proj);
        self.rb.load_camera_matrix(&MAT4_IDENTITY);
        self.rb.load_object_matrix(&MAT4_IDENTITY);
        self.rb.set_state_mask(StateBits::all(), StateBits::NO_DEPTH_TEST);
        self.rb.set_render_flags(RenderFlags::empty());
    }

    // ============================================================
    // Pics and polys
    // ============================================================

    pub fn draw_stretch_pic(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        s1: f32,
        t1: f32,
        s2: f32,
        t2: f32,
        color: Vec4,
        shader: &Arc<Shader>,
    ) {
        self.draw_rotated_stretch_pic(x, y, w, h, s1, t1, s2, t2, 0.0, color, shader);
    }

    /// Textured quad with its texture coordinates rotated by `angle`
    /// degrees around the centre of the pic.
    pub fn draw_rotated_stretch_pic(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        s1: f32,
        t1: f32,
        s2: f32,
        t2: f32,
        angle: f32,
        color: Vec4,
        shader: &Arc<Shader>,
    ) {
        let (x0, y0) = (x as f32, y as f32);
        let (x1, y1) = ((x + w) as f32, (y + h) as f32);
        let xyz = [
            [x0, y0, 0.0, 1.0],
            [x1, y0, 0.0, 1.0],
            [x1, y1, 0.0, 1.0],
            [x0, y1, 0.0, 1.0],
        ];
        let mut st = [[s1, t1], [s2, t1], [s2, t2], [s1, t2]];

        let angle = anglemod(angle);
        if angle != 0.0 {
            let (sint, cost) = angle.to_radians().sin_cos();
            for c in st.iter_mut() {
                let (s, t) = (c[0] - 0.5, c[1] - 0.5);
                *c = [cost * s - sint * t + 0.5, cost * t + sint * s + 0.5];
            }
        }

        let rgba = [
            float_to_byte(color[0]),
            float_to_byte(color[1]),
            float_to_byte(color[2]),
            float_to_byte(color[3]),
        ];
        let colors = [rgba; 4];
        let elems = [0, 1, 2, 0, 2, 3];

        let mesh = DynamicMesh {
            xyz: &xyz,
            normals: None,
            st: Some(&st),
            colors: Some(&colors),
            elems: &elems,
        };
        self.rb.add_dynamic_mesh(None, shader, &mesh, Primitive::Triangles);
    }

    /// Screen-space poly, offset by (`x_offset`, `y_offset`).
    pub fn draw_stretch_poly(&mut self, poly: &Poly, x_offset: f32, y_offset: f32) {
        let Some(shader) = &poly.shader else {
            return;
        };
        let n = poly.verts.len();
        if n < 3 {
            return;
        }

        let xyz: Vec<Vec4> = poly
            .verts
            .iter()
            .map(|v| [v[0] + x_offset, v[1] + y_offset, v[2], 1.0])
            .collect();
        let mesh = DynamicMesh {
            xyz: &xyz,
            normals: None,
            st: (poly.stcoords.len() == n).then_some(&poly.stcoords[..]),
            colors: (poly.colors.len() == n).then_some(&poly.colors[..]),
            elems: &poly.elems,
        };
        self.rb.add_dynamic_mesh(None, shader, &mesh, Primitive::Triangles);
    }

    // ============================================================
    // Scissor and transforms
    // ============================================================

    pub fn set_scissor(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.rb.scissor(x, y, w, h);
    }

    pub fn reset_scissor(&mut self) {
        let (w, h) = (self.frame_buffer_width, self.frame_buffer_height);
        self.rb.scissor(0, 0, w, h);
    }

    /// Replaces the projection or object matrix until the matching pop.
    pub fn push_transform_matrix(&mut self, projection: bool, m: &Mat4) {
        if self.transform_stack.len() >= MAX_TRANSFORM_STACK {
            log::debug!("push_transform_matrix: stack overflow");
            return;
        }
        self.rb.flush_dynamic_meshes();

        if projection {
            self.transform_stack.push((true, *self.rb.projection_matrix()));
            self.rb.load_projection_matrix(m);
        } else {
            self.transform_stack.push((false, *self.rb.object_matrix()));
            self.rb.load_object_matrix(m);
        }
    }

    pub fn pop_transform_matrix(&mut self, projection: bool) {
        let Some(pos) = self.transform_stack.iter().rposition(|&(p, _)| p == projection) else {
            return;
        };
        self.rb.flush_dynamic_meshes();

        let (_, m) = self.transform_stack.remove(pos);
        if projection {
            self.rb.load_projection_matrix(&m);
        } else {
            self.rb.load_object_matrix(&m);
        }
    }
}
