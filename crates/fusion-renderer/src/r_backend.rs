//! GPU seam and backend state cache.
//!
//! `GpuBackend` is the narrow interface to the GL/GPU state-setting layer.
//! Nothing in this crate talks to a graphics API directly; every state change,
//! upload and draw goes through this trait so tests can substitute a recorder.
//!
//! `RBackend` sits in front of it and caches the state the frontend needs to
//! read back (depth range, scissor, bound render target, matrices, flags),
//! and owns the dynamic mesh streams.

use bitflags::bitflags;
use fusion_common::q_shared::{Mat3, Vec3, Vec4};

use crate::r_dynamic::{DynamicStreams, StreamKind};
use crate::r_math::{Mat4, MAT4_IDENTITY};
use crate::r_portals::PortalSurface;
use crate::r_public::Entity;
use crate::r_refinst::RenderFlags;
use crate::r_shader::Shader;

/// Framebuffer object id, 0 is the window framebuffer.
pub type FboId = i32;

/// Vertex buffer a draw sources from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VboId {
    Stream(StreamKind),
    Mesh(u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Primitive {
    #[default]
    Triangles,
    Lines,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PassMode {
    #[default]
    Normal,
    /// Depth-only pass: color writes off, only depth-writing shaders drawn.
    Depth,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ClearBits: u32 {
        const COLOR   = 0x1;
        const DEPTH   = 0x2;
        const STENCIL = 0x4;
    }
}

bitflags! {
    /// State bits OR'd into every shader's GL state.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StateBits: u32 {
        const DEPTHWRITE    = 0x1;
        const DEPTHFUNC_GT  = 0x2;
        const NO_DEPTH_TEST = 0x4;
        const NO_COLORWRITE = 0x8;
        const OFFSET_FILL   = 0x10;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TextureFlags: u32 {
        const NOFILTERING = 0x1;
        const FRAMEBUFFER = 0x2;
        const DEPTHRB     = 0x4;
    }
}

/// An off-screen color target with its own framebuffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub fbo: FboId,
    pub texture: u32,
    pub width: i32,
    pub height: i32,
    pub flags: TextureFlags,
}

/// The black-box GPU backend.
pub trait GpuBackend: Send {
    fn init(&mut self) {}

    fn shutdown(&mut self) {}

    fn begin_frame(&mut self) {}

    fn end_frame(&mut self) {}

    // ========== Render targets ==========

    fn bind_framebuffer(&mut self, fbo: FboId);

    fn framebuffer_size(&self, fbo: FboId) -> (i32, i32);

    fn has_depth_renderbuffer(&self, _fbo: FboId) -> bool {
        true
    }

    /// Creates an off-screen target. Returns None when the GPU refuses.
    fn create_render_target(&mut self, width: i32, height: i32, flags: TextureFlags) -> Option<RenderTarget>;

    /// Copies the selected buffers of `src` into `dst`.
    fn blit_framebuffer(&mut self, src: FboId, dst: FboId, bits: ClearBits);

    /// Uploads static geometry, returning the buffer id.
    fn create_static_vbo(&mut self, vertex_data: &[u8], elems: &[u16]) -> Option<u32>;

    // ========== Fixed state ==========

    fn viewport(&mut self, rect: [i32; 4]);

    fn scissor(&mut self, rect: [i32; 4]);

    fn clear(&mut self, bits: ClearBits, color: Vec4, depth: f32);

    fn depth_range(&mut self, min: f32, max: f32);

    fn set_state_mask(&mut self, and: StateBits, or: StateBits);

    fn set_front_face(&mut self, flipped: bool);

    fn set_zclip(&mut self, _near: f32, _far: f32) {}

    fn set_camera(&mut self, _origin: &Vec3, _axis: &Mat3) {}

    fn polygon_offset(&mut self, _factor: f32, _units: f32) {}

    fn set_mode(&mut self, _mode: PassMode) {}

    fn set_triangle_outlines(&mut self, _enabled: bool) {}

    fn load_projection_matrix(&mut self, m: &Mat4);

    fn load_camera_matrix(&mut self, m: &Mat4);

    fn load_object_matrix(&mut self, m: &Mat4);

    fn set_render_flags(&mut self, flags: RenderFlags);

    // ========== Drawing ==========

    fn bind_shader(&mut self, entity: Option<&Entity>, shader: &Shader);

    fn set_portal_surface(&mut self, portal: Option<&PortalSurface>);

    fn set_light_style(&mut self, _style: i32) {}

    fn bind_vbo(&mut self, vbo: VboId, primitive: Primitive);

    fn upload_stream_elems(&mut self, stream: StreamKind, first_elem: usize, elems: &[u16]);

    fn upload_stream_verts(&mut self, stream: StreamKind, first_vert: usize, data: &[u8]);

    fn draw_elements(&mut self, first_vert: u32, num_verts: u32, first_elem: u32, num_elems: u32);

    fn blur_screen(&mut self) {}

    // ========== Reliable pipe hooks ==========

    fn set_gamma(&mut self, _gamma: f32) {}

    fn set_texture_filter(&mut self, _filter: i32) {}

    fn set_custom_color(&mut self, _num: usize, _rgba: [u8; 4]) {}

    fn set_wall_floor_colors(&mut self, _wall: [u8; 3], _floor: [u8; 3]) {}

    fn screenshot(&mut self, _path: &str, _silent: bool) {}

    fn env_shot(&mut self, _path: &str, _size: i32) {}

    fn resize_framebuffers(&mut self) {}

    fn begin_registration(&mut self) {}

    fn end_registration(&mut self) {}
}

/// Cached backend state in front of the GPU.
pub struct RBackend {
    gpu: Box<dyn GpuBackend>,
    framebuffer: FboId,
    depth_min: f32,
    depth_max: f32,
    scissor: [i32; 4],
    viewport: [i32; 4],
    front_face_flipped: bool,
    triangle_outlines: bool,
    render_flags: RenderFlags,
    mode: PassMode,
    projection: Mat4,
    camera: Mat4,
    object: Mat4,
    pub(crate) streams: DynamicStreams,
}

impl RBackend {
    pub fn new(gpu: Box<dyn GpuBackend>) -> Self {
        Self {
            gpu,
            framebuffer: 0,
            depth_min: 0.0,
            depth_max: 1.0,
            scissor: [0; 4],
            viewport: [0; 4],
            front_face_flipped: false,
            triangle_outlines: false,
            render_flags: RenderFlags::empty(),
            mode: PassMode::Normal,
            projection: MAT4_IDENTITY,
            camera: MAT4_IDENTITY,
            object: MAT4_IDENTITY,
            streams: DynamicStreams::new(),
        }
    }

    pub fn gpu_mut(&mut self) -> &mut dyn GpuBackend {
        self.gpu.as_mut()
    }

    pub fn init(&mut self) {
        self.gpu.init();
    }

    pub fn shutdown(&mut self) {
        self.gpu.shutdown();
    }

    pub fn begin_frame(&mut self) {
        self.streams.reset_cursors();
        self.gpu.begin_frame();
    }

    pub fn end_frame(&mut self) {
        self.gpu.end_frame();
    }

    // ========== Render targets ==========

    pub fn bind_framebuffer(&mut self, fbo: FboId) {
        if fbo != self.framebuffer {
            self.framebuffer = fbo;
            self.gpu.bind_framebuffer(fbo);
        }
    }

    pub fn bound_framebuffer(&self) -> FboId {
        self.framebuffer
    }

    pub fn framebuffer_size(&self, fbo: FboId) -> (i32, i32) {
        self.gpu.framebuffer_size(fbo)
    }

    pub fn has_depth_renderbuffer(&self, fbo: FboId) -> bool {
        self.gpu.has_depth_renderbuffer(fbo)
    }

    pub fn create_render_target(&mut self, width: i32, height: i32, flags: TextureFlags) -> Option<RenderTarget> {
        self.gpu.create_render_target(width, height, flags)
    }

    pub fn blit_framebuffer(&mut self, src: FboId, dst: FboId, bits: ClearBits) {
        self.gpu.blit_framebuffer(src, dst, bits);
    }

    pub fn create_static_vbo(&mut self, vertex_data: &[u8], elems: &[u16]) -> Option<u32> {
        self.gpu.create_static_vbo(vertex_data, elems)
    }

    // ========== Fixed state ==========

    pub fn viewport(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.viewport = [x, y, w, h];
        self.gpu.viewport(self.viewport);
    }

    pub fn scissor(&mut self, x: i32, y: i32, w: i32, h: i32) {
        let rect = [x, y, w, h];
        if rect != self.scissor {
            self.scissor = rect;
            self.gpu.scissor(rect);
        }
    }

    pub fn get_scissor(&self) -> [i32; 4] {
        self.scissor
    }

    pub fn clear(&mut self, bits: ClearBits, color: Vec4, depth: f32) {
        self.gpu.clear(bits, color, depth);
    }

    pub fn depth_range(&self) -> (f32, f32) {
        (self.depth_min, self.depth_max)
    }

    pub fn set_depth_range(&mut self, min: f32, max: f32) {
        self.depth_min = min.clamp(0.0, 1.0);
        self.depth_max = max.clamp(0.0, 1.0);
        self.gpu.depth_range(self.depth_min, self.depth_max);
    }

    pub fn set_state_mask(&mut self, and: StateBits, or: StateBits) {
        self.gpu.set_state_mask(and, or);
    }

    pub fn flip_front_face(&mut self) {
        self.front_face_flipped = !self.front_face_flipped;
        self.gpu.set_front_face(self.front_face_flipped);
    }

    pub fn front_face_flipped(&self) -> bool {
        self.front_face_flipped
    }

    /// Switches triangle outlines, returning the previous setting.
    pub fn enable_triangle_outlines(&mut self, enable: bool) -> bool {
        let prev = self.triangle_outlines;
        if enable != prev {
            self.flush_dynamic_meshes();
            self.triangle_outlines = enable;
            self.gpu.set_triangle_outlines(enable);
        }
        prev
    }

    pub fn triangle_outlines(&self) -> bool {
        self.triangle_outlines
    }

    pub fn set_mode(&mut self, mode: PassMode) {
        self.mode = mode;
        self.gpu.set_mode(mode);
    }

    pub fn mode(&self) -> PassMode {
        self.mode
    }

    pub fn set_zclip(&mut self, near: f32, far: f32) {
        self.gpu.set_zclip(near, far);
    }

    pub fn set_camera(&mut self, origin: &Vec3, axis: &Mat3) {
        self.gpu.set_camera(origin, axis);
    }

    pub fn polygon_offset(&mut self, factor: f32, units: f32) {
        self.gpu.polygon_offset(factor, units);
    }

    pub fn load_projection_matrix(&mut self, m: &Mat4) {
        self.projection = *m;
        self.gpu.load_projection_matrix(m);
    }

    pub fn projection_matrix(&self) -> &Mat4 {
        &self.projection
    }

    pub fn load_camera_matrix(&mut self, m: &Mat4) {
        self.camera = *m;
        self.gpu.load_camera_matrix(m);
    }

    pub fn camera_matrix(&self) -> &Mat4 {
        &self.camera
    }

    pub fn load_object_matrix(&mut self, m: &Mat4) {
        self.object = *m;
        self.gpu.load_object_matrix(m);
    }

    pub fn object_matrix(&self) -> &Mat4 {
        &self.object
    }

    pub fn set_render_flags(&mut self, flags: RenderFlags) {
        self.render_flags = flags;
        self.gpu.set_render_flags(flags);
    }

    pub fn render_flags(&self) -> RenderFlags {
        self.render_flags
    }

    // ========== Drawing ==========

    pub fn bind_shader(&mut self, entity: Option<&Entity>, shader: &Shader) {
        self.gpu.bind_shader(entity, shader);
    }

    pub fn set_portal_surface(&mut self, portal: Option<&PortalSurface>) {
        self.gpu.set_portal_surface(portal);
    }

    pub fn set_light_style(&mut self, style: i32) {
        self.gpu.set_light_style(style);
    }

    pub fn bind_vbo(&mut self, vbo: VboId, primitive: Primitive) {
        self.gpu.bind_vbo(vbo, primitive);
    }

    pub fn draw_elements(&mut self, first_vert: u32, num_verts: u32, first_elem: u32, num_elems: u32) {
        self.gpu.draw_elements(first_vert, num_verts, first_elem, num_elems);
    }

    pub fn blur_screen(&mut self) {
        self.gpu.blur_screen();
    }
}

// ============================================================
// Call recorder for tests
// ============================================================

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// One recorded backend call.
    #[derive(Clone, Debug, PartialEq)]
    pub enum GpuCall {
        Init,
        Shutdown,
        BeginFrame,
        EndFrame,
        BindFramebuffer(FboId),
        CreateRenderTarget { width: i32, height: i32 },
        Blit { src: FboId, dst: FboId, bits: ClearBits },
        Viewport([i32; 4]),
        Scissor([i32; 4]),
        Clear { bits: ClearBits, depth: f32 },
        DepthRange(f32, f32),
        StateMask(StateBits),
        FrontFace(bool),
        Mode(PassMode),
        Outlines(bool),
        Projection(Mat4),
        Camera(Mat4),
        Object(Mat4),
        RenderFlags(RenderFlags),
        BindShader { shader: u16, entity: bool },
        PortalSurface(bool),
        BindVbo(VboId, Primitive),
        UploadElems { stream: StreamKind, first: usize, elems: Vec<u16> },
        UploadVerts { stream: StreamKind, first: usize, data: Vec<u8> },
        Draw { first_vert: u32, num_verts: u32, first_elem: u32, num_elems: u32 },
        BlurScreen,
        Gamma(f32),
        TextureFilter(i32),
        CustomColor(usize, [u8; 4]),
        WallFloorColors([u8; 3], [u8; 3]),
        ScreenShot(String),
        EnvShot(String, i32),
        ResizeFramebuffers,
        BeginRegistration,
        EndRegistration,
    }

    /// Shared view of the recorded calls.
    #[derive(Clone, Default)]
    pub struct Trace(Arc<Mutex<Vec<GpuCall>>>);

    impl Trace {
        pub fn calls(&self) -> Vec<GpuCall> {
            self.0.lock().clone()
        }

        pub fn clear(&self) {
            self.0.lock().clear();
        }

        pub fn count(&self, pred: impl Fn(&GpuCall) -> bool) -> usize {
            self.0.lock().iter().filter(|c| pred(c)).count()
        }

        pub fn draw_count(&self) -> usize {
            self.count(|c| matches!(c, GpuCall::Draw { .. }))
        }

        fn push(&self, call: GpuCall) {
            self.0.lock().push(call);
        }
    }

    /// A GPU backend that records every call.
    pub struct TraceBackend {
        trace: Trace,
        pub width: i32,
        pub height: i32,
        pub fail_render_targets: bool,
        next_fbo: FboId,
        next_vbo: u32,
    }

    impl TraceBackend {
        pub fn new() -> (Self, Trace) {
            let trace = Trace::default();
            let backend = Self {
                trace: trace.clone(),
                width: 800,
                height: 600,
                fail_render_targets: false,
                next_fbo: 1,
                next_vbo: 1000,
            };
            (backend, trace)
        }

        /// An `RBackend` over a fresh recorder.
        pub fn rbackend() -> (RBackend, Trace) {
            let (gpu, trace) = Self::new();
            (RBackend::new(Box::new(gpu)), trace)
        }
    }

    impl GpuBackend for TraceBackend {
        fn init(&mut self) {
            self.trace.push(GpuCall::Init);
        }
        fn shutdown(&mut self) {
            self.trace.push(GpuCall::Shutdown);
        }
        fn begin_frame(&mut self) {
            self.trace.push(GpuCall::BeginFrame);
        }
        fn end_frame(&mut self) {
            self.trace.push(GpuCall::EndFrame);
        }
        fn bind_framebuffer(&mut self, fbo: FboId) {
            self.trace.push(GpuCall::BindFramebuffer(fbo));
        }
        fn framebuffer_size(&self, _fbo: FboId) -> (i32, i32) {
            (self.width, self.height)
        }
        fn create_render_target(&mut self, width: i32, height: i32, flags: TextureFlags) -> Option<RenderTarget> {
            self.trace.push(GpuCall::CreateRenderTarget { width, height });
            if self.fail_render_targets {
                return None;
            }
            let fbo = self.next_fbo;
            self.next_fbo += 1;
            Some(RenderTarget { fbo, texture: fbo as u32, width, height, flags })
        }
        fn blit_framebuffer(&mut self, src: FboId, dst: FboId, bits: ClearBits) {
            self.trace.push(GpuCall::Blit { src, dst, bits });
        }
        fn create_static_vbo(&mut self, _vertex_data: &[u8], _elems: &[u16]) -> Option<u32> {
            let id = self.next_vbo;
            self.next_vbo += 1;
            Some(id)
        }
        fn viewport(&mut self, rect: [i32; 4]) {
            self.trace.push(GpuCall::Viewport(rect));
        }
        fn scissor(&mut self, rect: [i32; 4]) {
            self.trace.push(GpuCall::Scissor(rect));
        }
        fn clear(&mut self, bits: ClearBits, _color: Vec4, depth: f32) {
            self.trace.push(GpuCall::Clear { bits, depth });
        }
        fn depth_range(&mut self, min: f32, max: f32) {
            self.trace.push(GpuCall::DepthRange(min, max));
        }
        fn set_state_mask(&mut self, _and: StateBits, or: StateBits) {
            self.trace.push(GpuCall::StateMask(or));
        }
        fn set_front_face(&mut self, flipped: bool) {
            self.trace.push(GpuCall::FrontFace(flipped));
        }
        fn set_mode(&mut self, mode: PassMode) {
            self.trace.push(GpuCall::Mode(mode));
        }
        fn set_triangle_outlines(&mut self, enabled: bool) {
            self.trace.push(GpuCall::Outlines(enabled));
        }
        fn load_projection_matrix(&mut self, m: &Mat4) {
            self.trace.push(GpuCall::Projection(*m));
        }
        fn load_camera_matrix(&mut self, m: &Mat4) {
            self.trace.push(GpuCall::Camera(*m));
        }
        fn load_object_matrix(&mut self, m: &Mat4) {
            self.trace.push(GpuCall::Object(*m));
        }
        fn set_render_flags(&mut self, flags: RenderFlags) {
            self.trace.push(GpuCall::RenderFlags(flags));
        }
        fn bind_shader(&mut self, entity: Option<&Entity>, shader: &Shader) {
            self.trace.push(GpuCall::BindShader { shader: shader.id, entity: entity.is_some() });
        }
        fn set_portal_surface(&mut self, portal: Option<&PortalSurface>) {
            self.trace.push(GpuCall::PortalSurface(portal.is_some()));
        }
        fn bind_vbo(&mut self, vbo: VboId, primitive: Primitive) {
            self.trace.push(GpuCall::BindVbo(vbo, primitive));
        }
        fn upload_stream_elems(&mut self, stream: StreamKind, first_elem: usize, elems: &[u16]) {
            self.trace.push(GpuCall::UploadElems { stream, first: first_elem, elems: elems.to_vec() });
        }
        fn upload_stream_verts(&mut self, stream: StreamKind, first_vert: usize, data: &[u8]) {
            self.trace.push(GpuCall::UploadVerts { stream, first: first_vert, data: data.to_vec() });
        }
        fn draw_elements(&mut self, first_vert: u32, num_verts: u32, first_elem: u32, num_elems: u32) {
            self.trace.push(GpuCall::Draw { first_vert, num_verts, first_elem, num_elems });
        }
        fn blur_screen(&mut self) {
            self.trace.push(GpuCall::BlurScreen);
        }
        fn set_gamma(&mut self, gamma: f32) {
            self.trace.push(GpuCall::Gamma(gamma));
        }
        fn set_texture_filter(&mut self, filter: i32) {
            self.trace.push(GpuCall::TextureFilter(filter));
        }
        fn set_custom_color(&mut self, num: usize, rgba: [u8; 4]) {
            self.trace.push(GpuCall::CustomColor(num, rgba));
        }
        fn set_wall_floor_colors(&mut self, wall: [u8; 3], floor: [u8; 3]) {
            self.trace.push(GpuCall::WallFloorColors(wall, floor));
        }
        fn screenshot(&mut self, path: &str, _silent: bool) {
            self.trace.push(GpuCall::ScreenShot(path.to_string()));
        }
        fn env_shot(&mut self, path: &str, size: i32) {
            self.trace.push(GpuCall::EnvShot(path.to_string(), size));
        }
        fn resize_framebuffers(&mut self) {
            self.trace.push(GpuCall::ResizeFramebuffers);
        }
        fn begin_registration(&mut self) {
            self.trace.push(GpuCall::BeginRegistration);
        }
        fn end_registration(&mut self) {
            self.trace.push(GpuCall::EndRegistration);
        }
    }
}
