// r_frontend.rs — client-facing renderer API
// Records frame verbs and either executes them inline (one buffer) or hands
// them to a dedicated adapter thread (three buffers circulating over
// bounded channels).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use fusion_common::q_shared::{Vec3, Vec4};
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::r_cmdque::{run_frame_cmd, run_pipe_cmd, CmdBuffer, FrameCmd, PipeCmd};
use crate::r_math::Mat4;
use crate::r_model::WorldModel;
use crate::r_public::{Entity, Poly, RefDef, NUM_CUSTOMCOLORS};
use crate::r_shader::Shader;
use crate::RenderContext;

pub const NUM_CMD_BUFFERS: usize = 3;

/// Pipe receive timeout when the frame rate is capped (milliseconds).
const PIPE_POLL_TIMEOUT_MS: u64 = 1;

/// Fence waits re-check the adapter thread this often (milliseconds).
const FENCE_CHECK_MS: u64 = 100;

/// Frame bookkeeping shared with the adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub submitted: u64,
    pub executed: u64,
    /// Frames recycled without executing because a newer one was queued.
    pub skipped: u64,
    pub last_executed: u64,
}

struct Shared {
    ctx: Mutex<RenderContext>,
    fence_done: Mutex<u64>,
    fence_cv: Condvar,
    frames: Mutex<FrameStats>,
    shutdown: AtomicBool,
    no_wait: AtomicBool,
}

struct Adapter {
    submit_tx: Sender<CmdBuffer>,
    free_rx: Receiver<CmdBuffer>,
    pipe_tx: Sender<PipeCmd>,
    thread: Option<JoinHandle<()>>,
}

// ============================================================
// Adapter thread
// ============================================================

struct AdapterLoop {
    shared: Arc<Shared>,
    pipe_rx: Receiver<PipeCmd>,
    submit_rx: Receiver<CmdBuffer>,
    free_tx: Sender<CmdBuffer>,
    /// Cleared by the Shutdown verb; only fences are honoured afterwards.
    running: bool,
}

impl AdapterLoop {
    fn run(mut self) {
        log::debug!("render adapter started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let first = if self.shared.no_wait.load(Ordering::Relaxed) {
                self.pipe_rx.try_recv().ok()
            } else {
                match self.pipe_rx.recv_timeout(Duration::from_millis(PIPE_POLL_TIMEOUT_MS)) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            let mut next = first;
            while let Some(cmd) = next {
                self.run_pipe(cmd);
                next = self.pipe_rx.try_recv().ok();
            }

            self.run_frames();
        }
        log::debug!("render adapter stopped");
    }

    fn run_pipe(&mut self, cmd: PipeCmd) {
        if let PipeCmd::Fence(seq) = cmd {
            // everything submitted before the fence runs first
            self.run_frames();
            let mut done = self.shared.fence_done.lock();
            *done = seq;
            self.shared.fence_cv.notify_all();
            return;
        }
        if self.running {
            let mut ctx = self.shared.ctx.lock();
            self.running = run_pipe_cmd(&mut *ctx, &cmd);
        }
    }

    /// Executes the newest queued frame and recycles every buffer.
    fn run_frames(&mut self) {
        let mut newest: Option<CmdBuffer> = None;
        let mut skipped = 0;
        while let Ok(buf) = self.submit_rx.try_recv() {
            if let Some(stale) = newest.replace(buf) {
                skipped += 1;
                self.recycle(stale);
            }
        }

        let Some(buf) = newest else {
            return;
        };
        let executed = self.running;
        if executed {
            let mut ctx = self.shared.ctx.lock();
            buf.run(&mut *ctx);
        } else {
            skipped += 1;
        }

        {
            let mut frames = self.shared.frames.lock();
            frames.skipped += skipped;
            if executed {
                frames.executed += 1;
                frames.last_executed = buf.frame_id;
            }
        }
        self.recycle(buf);
    }

    fn recycle(&self, mut buf: CmdBuffer) {
        buf.clear();
        // the frontend may already be gone
        let _ = self.free_tx.send(buf);
    }
}

impl Adapter {
    fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let (submit_tx, submit_rx) = bounded(NUM_CMD_BUFFERS);
        let (free_tx, free_rx) = bounded(NUM_CMD_BUFFERS);
        let (pipe_tx, pipe_rx) = unbounded();
        for _ in 0..NUM_CMD_BUFFERS {
            let _ = free_tx.try_send(CmdBuffer::new());
        }

        let adapter = AdapterLoop {
            shared,
            pipe_rx,
            submit_rx,
            free_tx,
            running: true,
        };
        let thread = thread::Builder::new()
            .name("render-adapter".into())
            .spawn(move || adapter.run())?;

        Ok(Self {
            submit_tx,
            free_rx,
            pipe_tx,
            thread: Some(thread),
        })
    }

    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// ============================================================
// Frontend
// ============================================================

/// The renderer as seen by the client.
pub struct Frontend {
    shared: Arc<Shared>,
    /// None in single-threaded mode.
    adapter: Option<Adapter>,
    /// Single-threaded mode only charges the budget.
    sync_buffer: CmdBuffer,
    current: Option<CmdBuffer>,
    frame_num: u64,
    fence_seq: u64,
    scissor: [i32; 4],
    frame_buffer_size: (i32, i32),
    custom_colors: [[u8; 4]; NUM_CUSTOMCOLORS],
    registration_sequence: u32,
    world_model_sequence: i32,
    shut_down: bool,
}

impl Frontend {
    /// Takes ownership of the renderer and initializes it. Runs threaded
    /// when `r_multithreading` is set.
    pub fn new(ctx: RenderContext) -> Result<Self> {
        let threaded = ctx.config.multithreading;
        let registration_sequence = ctx.registration_sequence();
        let world_model_sequence = ctx.world_model_sequence();
        let custom_colors = ctx.custom_colors;

        let shared = Arc::new(Shared {
            ctx: Mutex::new(ctx),
            fence_done: Mutex::new(0),
            fence_cv: Condvar::new(),
            frames: Mutex::new(FrameStats::default()),
            shutdown: AtomicBool::new(false),
            no_wait: AtomicBool::new(false),
        });
        let adapter = if threaded {
            Some(Adapter::spawn(shared.clone())?)
        } else {
            None
        };
        log::info!(
            "renderer frontend: {}",
            if threaded { "threaded" } else { "single-threaded" }
        );

        let mut frontend = Self {
            shared,
            adapter,
            sync_buffer: CmdBuffer::new(),
            current: None,
            frame_num: 0,
            fence_seq: 0,
            scissor: [0; 4],
            frame_buffer_size: (0, 0),
            custom_colors,
            registration_sequence,
            world_model_sequence,
            shut_down: false,
        };
        frontend.send_pipe(PipeCmd::Init);
        frontend.wait();
        frontend.sync_frame_buffer_size();
        Ok(frontend)
    }

    pub fn is_threaded(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn frame_stats(&self) -> FrameStats {
        *self.shared.frames.lock()
    }

    pub fn registration_sequence(&self) -> u32 {
        self.registration_sequence
    }

    pub fn world_model_sequence(&self) -> i32 {
        self.world_model_sequence
    }

    /// Runs `f` against the renderer once the backend is idle.
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut RenderContext) -> R) -> R {
        self.wait();
        let mut ctx = self.shared.ctx.lock();
        f(&mut ctx)
    }

    fn sync_frame_buffer_size(&mut self) {
        let ctx = self.shared.ctx.lock();
        self.frame_buffer_size = (ctx.frame_buffer_width, ctx.frame_buffer_height);
        self.scissor = [0, 0, ctx.frame_buffer_width, ctx.frame_buffer_height];
    }

    // ============================================================
    // Transport
    // ============================================================

    fn send_pipe(&mut self, cmd: PipeCmd) {
        if self.shut_down {
            return;
        }
        match &self.adapter {
            Some(adapter) => {
                if adapter.pipe_tx.send(cmd).is_err() {
                    log::warn!("render adapter pipe closed");
                }
            }
            None => {
                let mut ctx = self.shared.ctx.lock();
                run_pipe_cmd(&mut *ctx, &cmd);
            }
        }
    }

    /// Blocks until the adapter has run everything sent so far.
    pub fn wait(&mut self) {
        if self.shut_down || self.adapter.is_none() {
            return;
        }
        self.fence_seq += 1;
        let seq = self.fence_seq;
        self.send_pipe(PipeCmd::Fence(seq));

        let mut done = self.shared.fence_done.lock();
        while *done < seq {
            let timed_out = self
                .shared
                .fence_cv
                .wait_for(&mut done, Duration::from_millis(FENCE_CHECK_MS))
                .timed_out();
            if timed_out && !self.adapter.as_ref().is_some_and(Adapter::is_alive) {
                log::warn!("render adapter gone while waiting for fence {}", seq);
                break;
            }
        }
    }

    fn acquire_buffer(&mut self) -> Option<&mut CmdBuffer> {
        if self.current.is_none() {
            let adapter = self.adapter.as_ref()?;
            let mut buf = adapter.free_rx.recv().ok()?;
            buf.clear();
            buf.frame_id = self.frame_num;
            self.current = Some(buf);
        }
        self.current.as_mut()
    }

    fn submit(&mut self, cmd: FrameCmd) {
        if self.shut_down {
            return;
        }
        if self.adapter.is_some() {
            if let Some(buf) = self.acquire_buffer() {
                buf.record(cmd);
            }
            return;
        }

        if !self.sync_buffer.charge(cmd.size()) {
            log::debug!("frame budget exhausted, dropping {}", cmd.name());
            return;
        }
        let mut ctx = self.shared.ctx.lock();
        run_frame_cmd(&mut *ctx, &cmd);
    }

    // ============================================================
    // Frames
    // ============================================================

    /// `uncapped` stops the adapter from blocking on the pipe.
    pub fn begin_frame(&mut self, force_clear: bool, uncapped: bool) {
        self.shared.no_wait.store(uncapped, Ordering::Relaxed);
        self.frame_num += 1;
        self.sync_buffer.clear();
        self.submit(FrameCmd::BeginFrame { force_clear });
        if let Some(buf) = self.current.as_mut() {
            buf.frame_id = self.frame_num;
        }
    }

    pub fn end_frame(&mut self) {
        if self.shut_down {
            return;
        }
        self.submit(FrameCmd::EndFrame);

        let Some(adapter) = &self.adapter else {
            let mut frames = self.shared.frames.lock();
            frames.submitted += 1;
            frames.executed += 1;
            frames.last_executed = self.frame_num;
            return;
        };
        if let Some(buf) = self.current.take() {
            self.shared.frames.lock().submitted += 1;
            if adapter.submit_tx.send(buf).is_err() {
                log::warn!("render adapter gone, frame {} lost", self.frame_num);
            }
        }
    }

    // ============================================================
    // Scene
    // ============================================================

    pub fn clear_scene(&mut self) {
        self.submit(FrameCmd::ClearScene);
    }

    pub fn add_entity_to_scene(&mut self, ent: &Entity) {
        self.submit(FrameCmd::AddEntityToScene(Box::new(ent.clone())));
    }

    pub fn add_light_to_scene(&mut self, origin: Vec3, intensity: f32, r: f32, g: f32, b: f32) {
        self.submit(FrameCmd::AddLightToScene {
            origin,
            intensity,
            color: [r, g, b],
        });
    }

    pub fn add_poly_to_scene(&mut self, poly: &Poly) {
        self.submit(FrameCmd::AddPolyToScene(Box::new(poly.clone())));
    }

    pub fn add_light_style_to_scene(&mut self, style: i32, r: f32, g: f32, b: f32) {
        self.submit(FrameCmd::AddLightStyleToScene {
            style,
            color: [r, g, b],
        });
    }

    pub fn render_scene(&mut self, fd: &RefDef) {
        self.submit(FrameCmd::RenderScene {
            refdef: Box::new(fd.clone()),
            registration_sequence: self.registration_sequence,
            world_model_sequence: self.world_model_sequence,
        });
    }

    // ============================================================
    // 2D
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
        self.submit(FrameCmd::DrawRotatedStretchPic {
            rect: [x, y, w, h],
            st: [s1, t1, s2, t2],
            angle,
            color,
            shader: shader.clone(),
        });
    }

    pub fn draw_stretch_poly(&mut self, poly: &Poly, x_offset: f32, y_offset: f32) {
        self.submit(FrameCmd::DrawStretchPoly {
            poly: Box::new(poly.clone()),
            x_offset,
            y_offset,
        });
    }

    pub fn blur_screen(&mut self) {
        self.submit(FrameCmd::BlurScreen);
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.scissor = [x, y, w, h];
        self.submit(FrameCmd::SetScissor(self.scissor));
    }

    pub fn get_scissor(&self) -> [i32; 4] {
        self.scissor
    }

    pub fn reset_scissor(&mut self) {
        let (w, h) = self.frame_buffer_size;
        self.scissor = [0, 0, w, h];
        self.submit(FrameCmd::ResetScissor);
    }

    pub fn push_transform_matrix(&mut self, projection: bool, m: &Mat4) {
        self.submit(FrameCmd::PushTransformMatrix { projection, m: *m });
    }

    pub fn pop_transform_matrix(&mut self, projection: bool) {
        self.submit(FrameCmd::PopTransformMatrix { projection });
    }

    // ============================================================
    // Registration
    // ============================================================

    pub fn begin_registration(&mut self) {
        self.wait();
        {
            let mut ctx = self.shared.ctx.lock();
            ctx.begin_registration();
            self.registration_sequence = ctx.registration_sequence();
        }
        self.send_pipe(PipeCmd::BeginRegistration);
        self.wait();
    }

    pub fn register_world(&mut self, world: Arc<WorldModel>) {
        self.wait();
        let mut ctx = self.shared.ctx.lock();
        ctx.register_world(world);
        self.world_model_sequence = ctx.world_model_sequence();
    }

    pub fn end_registration(&mut self) {
        self.wait();
        let open = self.shared.ctx.lock().end_registration();
        if open {
            self.send_pipe(PipeCmd::EndRegistration);
            self.wait();
        }
    }

    // ============================================================
    // Pipe verbs
    // ============================================================

    /// Sent only when the color actually changes.
    pub fn set_custom_color(&mut self, num: usize, r: u8, g: u8, b: u8) {
        if num >= NUM_CUSTOMCOLORS {
            return;
        }
        let rgba = [r, g, b, 255];
        if self.custom_colors[num] == rgba {
            return;
        }
        self.custom_colors[num] = rgba;
        self.send_pipe(PipeCmd::SetCustomColor { num, rgba });
    }

    pub fn set_wall_floor_colors(&mut self, wall: [u8; 3], floor: [u8; 3]) {
        self.send_pipe(PipeCmd::SetWallFloorColors { wall, floor });
    }

    pub fn set_texture_filter(&mut self, filter: i32) {
        self.send_pipe(PipeCmd::SetTextureFilter(filter));
    }

    pub fn set_gamma(&mut self, gamma: f32) {
        self.send_pipe(PipeCmd::SetGamma(gamma));
    }

    pub fn screenshot(&mut self, path: &str, silent: bool) {
        self.send_pipe(PipeCmd::ScreenShot {
            path: path.to_string(),
            silent,
        });
    }

    pub fn env_shot(&mut self, path: &str, size: i32) {
        self.send_pipe(PipeCmd::EnvShot {
            path: path.to_string(),
            size,
        });
    }

    pub fn resize_framebuffers(&mut self) {
        self.send_pipe(PipeCmd::ResizeFramebuffers);
        self.wait();
        self.sync_frame_buffer_size();
    }

    /// Stops the backend. Later verbs are ignored.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.wait();
        self.send_pipe(PipeCmd::Shutdown);
        self.wait();
        self.shut_down = true;
        self.current = None;

        if let Some(adapter) = self.adapter.as_mut() {
            self.shared.shutdown.store(true, Ordering::Release);
            if let Some(thread) = adapter.thread.take() {
                if thread.join().is_err() {
                    log::warn!("render adapter thread panicked");
                }
            }
        }
        log::debug!("renderer frontend shut down after {} frames", self.frame_num);
    }
}

impl Drop for Frontend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::r_backend::testing::{GpuCall, Trace, TraceBackend};
    use crate::r_config::RenderConfig;

    fn frontend(multithreading: bool) -> (Frontend, Trace) {
        let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
        let (rb, trace) = TraceBackend::rbackend();
        let config = RenderConfig {
            multithreading,
            ..Default::default()
        };
        let ctx = RenderContext::with_backend(rb, config).unwrap();
        (Frontend::new(ctx).unwrap(), trace)
    }

    fn refdef() -> RefDef {
        RefDef {
            width: 800,
            height: 600,
            ..Default::default()
        }
    }

    fn count(trace: &Trace, call: GpuCall) -> usize {
        trace.count(|c| *c == call)
    }

    #[test]
    fn test_sync_runs_verbs_inline() {
        let (mut fe, trace) = frontend(false);
        assert!(!fe.is_threaded());
        assert_eq!(count(&trace, GpuCall::Init), 1);

        let white = fe.with_context(|ctx| ctx.shaders.white_shader.clone());
        fe.begin_frame(false, false);
        assert_eq!(count(&trace, GpuCall::BeginFrame), 1);
        fe.draw_stretch_pic(0, 0, 8, 8, 0.0, 0.0, 1.0, 1.0, [1.0; 4], &white);
        fe.end_frame();

        assert_eq!(trace.draw_count(), 1);
        assert_eq!(count(&trace, GpuCall::EndFrame), 1);
        let stats = fe.frame_stats();
        assert_eq!((stats.submitted, stats.executed, stats.last_executed), (1, 1, 1));
    }

    #[test]
    fn test_threaded_frame_runs_once() {
        let (mut fe, trace) = frontend(true);
        assert!(fe.is_threaded());

        fe.begin_frame(false, false);
        fe.set_scissor(1, 2, 3, 4);
        fe.end_frame();
        fe.wait();

        assert_eq!(count(&trace, GpuCall::BeginFrame), 1);
        assert_eq!(count(&trace, GpuCall::EndFrame), 1);
        assert_eq!(count(&trace, GpuCall::Scissor([1, 2, 3, 4])), 1);
        let stats = fe.frame_stats();
        assert_eq!((stats.submitted, stats.executed, stats.skipped), (1, 1, 0));
        assert_eq!(stats.last_executed, 1);
    }

    #[test]
    fn test_threaded_frames_execute_or_skip() {
        let (mut fe, trace) = frontend(true);
        for _ in 0..20 {
            fe.begin_frame(false, true);
            fe.clear_scene();
            fe.end_frame();
        }
        fe.wait();

        let stats = fe.frame_stats();
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.executed + stats.skipped, 20);
        assert_eq!(count(&trace, GpuCall::BeginFrame) as u64, stats.executed);
        assert_eq!(stats.last_executed, 20);
    }

    #[test]
    fn test_scene_from_before_registration_is_dropped() {
        let (mut fe, _trace) = frontend(true);
        fe.begin_frame(false, false);
        fe.render_scene(&refdef());
        fe.begin_registration();
        fe.end_registration();
        fe.end_frame();
        assert_eq!(fe.with_context(|ctx| ctx.stats.c_views), 0);

        fe.begin_frame(false, false);
        fe.render_scene(&refdef());
        fe.end_frame();
        assert_eq!(fe.with_context(|ctx| ctx.stats.c_views), 1);
    }

    #[test]
    fn test_registration_reaches_backend_and_mirrors_sequence() {
        let (mut fe, trace) = frontend(true);
        let before = fe.registration_sequence();
        fe.begin_registration();
        fe.end_registration();
        // no open registration, nothing sent
        fe.end_registration();

        assert_eq!(fe.registration_sequence(), before + 1);
        assert_eq!(
            fe.with_context(|ctx| ctx.registration_sequence()),
            fe.registration_sequence()
        );
        assert_eq!(count(&trace, GpuCall::BeginRegistration), 1);
        assert_eq!(count(&trace, GpuCall::EndRegistration), 1);
    }

    #[test]
    fn test_custom_color_sent_on_change() {
        let (mut fe, trace) = frontend(false);
        fe.set_custom_color(2, 10, 20, 30);
        fe.set_custom_color(2, 10, 20, 30);
        fe.set_custom_color(NUM_CUSTOMCOLORS, 1, 1, 1);
        assert_eq!(trace.count(|c| matches!(c, GpuCall::CustomColor(..))), 1);
        fe.set_custom_color(2, 10, 20, 31);
        assert_eq!(trace.count(|c| matches!(c, GpuCall::CustomColor(..))), 2);
    }

    #[test]
    fn test_scissor_is_tracked_on_frontend() {
        let (mut fe, _trace) = frontend(true);
        assert_eq!(fe.get_scissor(), [0, 0, 800, 600]);
        fe.set_scissor(5, 6, 7, 8);
        assert_eq!(fe.get_scissor(), [5, 6, 7, 8]);
        fe.reset_scissor();
        assert_eq!(fe.get_scissor(), [0, 0, 800, 600]);
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let (mut fe, trace) = frontend(true);
        fe.set_gamma(1.3);
        fe.shutdown();
        assert_eq!(count(&trace, GpuCall::Gamma(1.3)), 1);
        assert_eq!(count(&trace, GpuCall::Shutdown), 1);

        let after = trace.calls().len();
        fe.begin_frame(true, false);
        fe.end_frame();
        fe.set_gamma(2.0);
        fe.shutdown();
        drop(fe);
        assert_eq!(trace.calls().len(), after);
    }

    #[test]
    fn test_sync_shutdown_on_drop() {
        let (fe, trace) = frontend(false);
        drop(fe);
        assert_eq!(count(&trace, GpuCall::Shutdown), 1);
    }
}
