// r_cmdque.rs — frontend/backend command vocabulary
// Frame verbs are recorded into a CmdBuffer and replayed once per frame.
// Pipe verbs travel over a reliable channel and are never dropped.

use std::mem::size_of;
use std::sync::Arc;

use fusion_common::q_shared::{Vec3, Vec4};

use crate::r_math::Mat4;
use crate::r_public::{Entity, Poly, RefDef, NUM_CUSTOMCOLORS};
use crate::r_shader::Shader;
use crate::RenderContext;

pub const REF_CMD_BUF_SIZE: usize = 0x400000;

// ============================================================
// Verbs
// ============================================================

/// Per-frame verbs.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameCmd {
    BeginFrame {
        force_clear: bool,
    },
    EndFrame,
    DrawRotatedStretchPic {
        rect: [i32; 4],
        st: [f32; 4],
        angle: f32,
        color: Vec4,
        shader: Arc<Shader>,
    },
    DrawStretchPoly {
        poly: Box<Poly>,
        x_offset: f32,
        y_offset: f32,
    },
    ClearScene,
    AddEntityToScene(Box<Entity>),
    AddLightToScene {
        origin: Vec3,
        intensity: f32,
        color: Vec3,
    },
    AddPolyToScene(Box<Poly>),
    AddLightStyleToScene {
        style: i32,
        color: Vec3,
    },
    /// Carries the sequences current at record time.
    RenderScene {
        refdef: Box<RefDef>,
        registration_sequence: u32,
        world_model_sequence: i32,
    },
    BlurScreen,
    SetScissor([i32; 4]),
    ResetScissor,
    PushTransformMatrix {
        projection: bool,
        m: Mat4,
    },
    PopTransformMatrix {
        projection: bool,
    },
}

fn poly_bytes(poly: &Poly) -> usize {
    size_of::<Poly>()
        + poly.verts.len() * size_of::<Vec3>()
        + poly.normals.len() * size_of::<Vec3>()
        + poly.stcoords.len() * size_of::<[f32; 2]>()
        + poly.colors.len() * size_of::<[u8; 4]>()
        + poly.elems.len() * size_of::<u16>()
}

impl FrameCmd {
    /// Approximate recorded size, charged against the buffer budget.
    pub fn size(&self) -> usize {
        size_of::<Self>()
            + match self {
                FrameCmd::DrawStretchPoly { poly, .. } | FrameCmd::AddPolyToScene(poly) => {
                    poly_bytes(poly)
                }
                FrameCmd::AddEntityToScene(_) => size_of::<Entity>(),
                FrameCmd::RenderScene { .. } => size_of::<RefDef>(),
                _ => 0,
            }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameCmd::BeginFrame { .. } => "BeginFrame",
            FrameCmd::EndFrame => "EndFrame",
            FrameCmd::DrawRotatedStretchPic { .. } => "DrawRotatedStretchPic",
            FrameCmd::DrawStretchPoly { .. } => "DrawStretchPoly",
            FrameCmd::ClearScene => "ClearScene",
            FrameCmd::AddEntityToScene(_) => "AddEntityToScene",
            FrameCmd::AddLightToScene { .. } => "AddLightToScene",
            FrameCmd::AddPolyToScene(_) => "AddPolyToScene",
            FrameCmd::AddLightStyleToScene { .. } => "AddLightStyleToScene",
            FrameCmd::RenderScene { .. } => "RenderScene",
            FrameCmd::BlurScreen => "BlurScreen",
            FrameCmd::SetScissor(_) => "SetScissor",
            FrameCmd::ResetScissor => "ResetScissor",
            FrameCmd::PushTransformMatrix { .. } => "PushTransformMatrix",
            FrameCmd::PopTransformMatrix { .. } => "PopTransformMatrix",
        }
    }
}

/// Reliable verbs, executed in order on the backend side.
#[derive(Clone, Debug, PartialEq)]
pub enum PipeCmd {
    Init,
    Shutdown,
    ResizeFramebuffers,
    ScreenShot { path: String, silent: bool },
    EnvShot { path: String, size: i32 },
    BeginRegistration,
    EndRegistration,
    SetCustomColor { num: usize, rgba: [u8; 4] },
    SetWallFloorColors { wall: [u8; 3], floor: [u8; 3] },
    SetTextureFilter(i32),
    SetGamma(f32),
    /// Acknowledged by the adapter once everything before it has run.
    Fence(u64),
}

// ============================================================
// Handler
// ============================================================

/// The receiving end of the command vocabulary.
pub trait CmdHandler {
    fn registration_sequence(&self) -> u32;

    fn world_model_sequence(&self) -> i32;

    fn execute(&mut self, cmd: &FrameCmd);

    fn execute_pipe(&mut self, cmd: &PipeCmd);
}

/// Runs one frame verb. A RenderScene recorded against an older
/// registration or world model is dropped; returns false in that case.
pub fn run_frame_cmd<H: CmdHandler + ?Sized>(handler: &mut H, cmd: &FrameCmd) -> bool {
    if let FrameCmd::RenderScene {
        registration_sequence,
        world_model_sequence,
        ..
    } = cmd
    {
        if *registration_sequence != handler.registration_sequence()
            || *world_model_sequence != handler.world_model_sequence()
        {
            log::debug!(
                "skipping stale RenderScene (registration {} vs {})",
                registration_sequence,
                handler.registration_sequence()
            );
            return false;
        }
    }
    handler.execute(cmd);
    true
}

/// Runs one pipe verb. Returns false once the handler has shut down.
pub fn run_pipe_cmd<H: CmdHandler + ?Sized>(handler: &mut H, cmd: &PipeCmd) -> bool {
    match cmd {
        PipeCmd::Fence(_) => true,
        PipeCmd::Shutdown => {
            handler.execute_pipe(cmd);
            false
        }
        _ => {
            handler.execute_pipe(cmd);
            true
        }
    }
}

// ============================================================
// Command buffer
// ============================================================

/// A frame's worth of recorded verbs.
#[derive(Debug, Default)]
pub struct CmdBuffer {
    cmds: Vec<FrameCmd>,
    used: usize,
    budget: usize,
    /// Number of the frame last recorded into this buffer.
    pub frame_id: u64,
}

impl CmdBuffer {
    pub fn new() -> Self {
        Self::with_budget(REF_CMD_BUF_SIZE)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            cmds: Vec::new(),
            used: 0,
            budget,
            frame_id: 0,
        }
    }

    /// Charges `size` bytes. False if the budget is exhausted.
    pub fn charge(&mut self, size: usize) -> bool {
        if self.used + size > self.budget {
            return false;
        }
        self.used += size;
        true
    }

    /// Appends a verb. A verb that does not fit is silently dropped.
    pub fn record(&mut self, cmd: FrameCmd) -> bool {
        if !self.charge(cmd.size()) {
            log::debug!("command buffer full, dropping {}", cmd.name());
            return false;
        }
        self.cmds.push(cmd);
        true
    }

    /// Replays every verb in recording order, returning how many ran.
    pub fn run<H: CmdHandler + ?Sized>(&self, handler: &mut H) -> usize {
        self.cmds
            .iter()
            .filter(|cmd| run_frame_cmd(handler, cmd))
            .count()
    }

    pub fn clear(&mut self) {
        self.cmds.clear();
        self.used = 0;
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

// ============================================================
// Renderer as handler
// ============================================================

impl CmdHandler for RenderContext {
    fn registration_sequence(&self) -> u32 {
        RenderContext::registration_sequence(self)
    }

    fn world_model_sequence(&self) -> i32 {
        RenderContext::world_model_sequence(self)
    }

    fn execute(&mut self, cmd: &FrameCmd) {
        match cmd {
            FrameCmd::BeginFrame { force_clear } => self.begin_frame(*force_clear),
            FrameCmd::EndFrame => self.end_frame(),
            FrameCmd::DrawRotatedStretchPic {
                rect: [x, y, w, h],
                st: [s1, t1, s2, t2],
                angle,
                color,
                shader,
            } => self.draw_rotated_stretch_pic(*x, *y, *w, *h, *s1, *t1, *s2, *t2, *angle, *color, shader),
            FrameCmd::DrawStretchPoly { poly, x_offset, y_offset } => {
                self.draw_stretch_poly(poly, *x_offset, *y_offset)
            }
            FrameCmd::ClearScene => self.clear_scene(),
            FrameCmd::AddEntityToScene(ent) => self.add_entity_to_scene(ent),
            FrameCmd::AddLightToScene { origin, intensity, color } => {
                self.add_light_to_scene(*origin, *intensity, color[0], color[1], color[2])
            }
            FrameCmd::AddPolyToScene(poly) => self.add_poly_to_scene(poly),
            FrameCmd::AddLightStyleToScene { style, color } => {
                self.add_light_style_to_scene(*style, color[0], color[1], color[2])
            }
            FrameCmd::RenderScene { refdef, .. } => self.render_scene(refdef),
            FrameCmd::BlurScreen => self.blur_screen(),
            FrameCmd::SetScissor([x, y, w, h]) => self.set_scissor(*x, *y, *w, *h),
            FrameCmd::ResetScissor => self.reset_scissor(),
            FrameCmd::PushTransformMatrix { projection, m } => self.push_transform_matrix(*projection, m),
            FrameCmd::PopTransformMatrix { projection } => self.pop_transform_matrix(*projection),
        }
    }

    fn execute_pipe(&mut self, cmd: &PipeCmd) {
        match cmd {
            PipeCmd::Init => self.init(),
            PipeCmd::Shutdown => self.shutdown(),
            PipeCmd::ResizeFramebuffers => self.resize_framebuffers(),
            PipeCmd::ScreenShot { path, silent } => {
                self.rb.flush_dynamic_meshes();
                self.rb.gpu_mut().screenshot(path, *silent);
            }
            PipeCmd::EnvShot { path, size } => {
                self.rb.flush_dynamic_meshes();
                self.rb.gpu_mut().env_shot(path, *size);
            }
            PipeCmd::BeginRegistration => self.rb.gpu_mut().begin_registration(),
            PipeCmd::EndRegistration => self.rb.gpu_mut().end_registration(),
            PipeCmd::SetCustomColor { num, rgba } => {
                if *num >= NUM_CUSTOMCOLORS {
                    return;
                }
                self.custom_colors[*num] = *rgba;
                self.rb.gpu_mut().set_custom_color(*num, *rgba);
            }
            PipeCmd::SetWallFloorColors { wall, floor } => {
                self.config.wall_color = *wall;
                self.config.floor_color = *floor;
                self.rb.gpu_mut().set_wall_floor_colors(*wall, *floor);
            }
            PipeCmd::SetTextureFilter(filter) => {
                self.config.texture_filter = *filter;
                self.rb.gpu_mut().set_texture_filter(*filter);
            }
            PipeCmd::SetGamma(gamma) => {
                self.config.gamma = *gamma;
                self.rb.gpu_mut().set_gamma(*gamma);
            }
            PipeCmd::Fence(_) => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::r_backend::testing::{GpuCall, TraceBackend};
    use crate::r_config::RenderConfig;

    /// Records everything it is asked to run.
    #[derive(Default)]
    pub struct Recorder {
        pub frames: Vec<FrameCmd>,
        pub pipe: Vec<PipeCmd>,
        pub registration_sequence: u32,
        pub world_model_sequence: i32,
    }

    impl CmdHandler for Recorder {
        fn registration_sequence(&self) -> u32 {
            self.registration_sequence
        }
        fn world_model_sequence(&self) -> i32 {
            self.world_model_sequence
        }
        fn execute(&mut self, cmd: &FrameCmd) {
            self.frames.push(cmd.clone());
        }
        fn execute_pipe(&mut self, cmd: &PipeCmd) {
            self.pipe.push(cmd.clone());
        }
    }

    fn render_scene_cmd(registration_sequence: u32, world_model_sequence: i32) -> FrameCmd {
        FrameCmd::RenderScene {
            refdef: Box::default(),
            registration_sequence,
            world_model_sequence,
        }
    }

    #[test]
    fn test_replay_runs_each_verb_once() {
        let mut buf = CmdBuffer::new();
        let first = vec![
            FrameCmd::BeginFrame { force_clear: false },
            FrameCmd::ClearScene,
            FrameCmd::SetScissor([1, 2, 3, 4]),
            FrameCmd::EndFrame,
        ];
        for cmd in &first {
            assert!(buf.record(cmd.clone()));
        }

        let mut rec = Recorder::default();
        assert_eq!(buf.run(&mut rec), 4);
        assert_eq!(rec.frames, first);

        // reuse after clear carries nothing over
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.used(), 0);
        buf.record(FrameCmd::BlurScreen);
        let mut rec = Recorder::default();
        buf.run(&mut rec);
        assert_eq!(rec.frames, vec![FrameCmd::BlurScreen]);
    }

    #[test]
    fn test_stale_render_scene_is_skipped() {
        let mut buf = CmdBuffer::new();
        buf.record(render_scene_cmd(1, 1));
        buf.record(render_scene_cmd(2, 1));
        buf.record(render_scene_cmd(2, 3));

        let mut rec = Recorder {
            registration_sequence: 2,
            world_model_sequence: 3,
            ..Default::default()
        };
        assert_eq!(buf.run(&mut rec), 1);
        assert_eq!(rec.frames, vec![render_scene_cmd(2, 3)]);
    }

    #[test]
    fn test_budget_drops_what_does_not_fit() {
        let size = FrameCmd::ClearScene.size();
        let mut buf = CmdBuffer::with_budget(size * 2 + size / 2);
        assert!(buf.record(FrameCmd::ClearScene));
        assert!(buf.record(FrameCmd::ClearScene));
        assert!(!buf.record(FrameCmd::ClearScene));
        assert_eq!(buf.len(), 2);

        let poly = Poly {
            verts: vec![[0.0; 3]; 64],
            ..Default::default()
        };
        let cmd = FrameCmd::AddPolyToScene(Box::new(poly));
        assert!(cmd.size() > size + 64 * 12);
    }

    #[test]
    fn test_pipe_stops_at_shutdown() {
        let mut rec = Recorder::default();
        assert!(run_pipe_cmd(&mut rec, &PipeCmd::SetGamma(1.2)));
        assert!(run_pipe_cmd(&mut rec, &PipeCmd::Fence(7)));
        assert!(!run_pipe_cmd(&mut rec, &PipeCmd::Shutdown));
        assert_eq!(rec.pipe, vec![PipeCmd::SetGamma(1.2), PipeCmd::Shutdown]);
    }

    #[test]
    fn test_context_handles_pipe_verbs() {
        let (rb, trace) = TraceBackend::rbackend();
        let mut ctx = RenderContext::with_backend(rb, RenderConfig::default()).unwrap();

        run_pipe_cmd(&mut ctx, &PipeCmd::SetCustomColor { num: 3, rgba: [1, 2, 3, 4] });
        run_pipe_cmd(&mut ctx, &PipeCmd::SetCustomColor { num: NUM_CUSTOMCOLORS, rgba: [9; 4] });
        run_pipe_cmd(&mut ctx, &PipeCmd::SetGamma(1.5));
        run_pipe_cmd(&mut ctx, &PipeCmd::BeginRegistration);

        assert_eq!(ctx.custom_colors[3], [1, 2, 3, 4]);
        assert_eq!(ctx.config.gamma, 1.5);
        assert_eq!(
            trace.calls(),
            vec![
                GpuCall::CustomColor(3, [1, 2, 3, 4]),
                GpuCall::Gamma(1.5),
                GpuCall::BeginRegistration,
            ]
        );
    }

    #[test]
    fn test_context_skips_scene_from_old_registration() {
        let (rb, trace) = TraceBackend::rbackend();
        let mut ctx = RenderContext::with_backend(rb, RenderConfig::default()).unwrap();
        let reg = CmdHandler::registration_sequence(&ctx);
        let world = CmdHandler::world_model_sequence(&ctx);

        let mut buf = CmdBuffer::new();
        buf.record(render_scene_cmd(reg, world));
        ctx.begin_registration();
        ctx.end_registration();
        assert_eq!(buf.run(&mut ctx), 0);
        assert!(trace.calls().is_empty());
    }
}
