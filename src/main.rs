// =============================================================================
// MULTI THREADED COMMAND BUFFER SAMPLE
// =============================================================================
//
// A swarm of UFOs circles the camera. Every frame each object gets a job on
// a fixed worker pool: the worker animates it, tests it against the view
// frustum and records a secondary command buffer only if it is visible. The
// main thread then executes the visible secondaries from one primary buffer.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          ├── ParallelRecorder ── ThreadPool (one queue/worker)  │
// │          │                    └── Frustum gate per object       │
// │          └── Vulkan backend (device, swapchain, pipelines)      │
// └─────────────────────────────────────────────────────────────────┘
//
// CONTROLS: WASD move, P pause animation, F11 fullscreen, Escape quit
//
// =============================================================================

mod backend;
mod camera;
mod config;
mod frustum;
mod mesh;
mod recorder;
mod renderer;
mod scene;
mod thread_pool;

use anyhow::Result;
use config::Config;
use renderer::Renderer;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    let (config, config_error) = Config::load_or_default(CONFIG_PATH);

    init_logging(&config);
    log::info!("Starting multithreaded renderer");
    if let Some(e) = config_error {
        log::warn!("Ignoring {}: {:#}. Using defaults.", CONFIG_PATH, e);
    }
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Objects: {}, workers: {}",
        config.threading.object_count,
        config.threading.resolved_worker_count()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    // RUST_LOG still overrides the default level
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "multithread-renderer log");
                let _ = writeln!(file, "started {:?}", std::time::SystemTime::now());
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

/// Field order matters for Drop: the renderer (and its surface) must go
/// before the window.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn render(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        let now = Instant::now();
        // Clamp so a long stall (window drag, breakpoint) doesn't teleport objects
        let delta_time = now.duration_since(self.last_frame_time).as_secs_f32().min(0.1);
        self.last_frame_time = now;

        let size = window.inner_size();
        if renderer.render_frame(delta_time, size.width, size.height)? {
            self.update_stats(now);
        }
        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        let Some(window) = self.window.as_ref() else {
            return;
        };

        self.is_fullscreen = !self.is_fullscreen;
        window.set_fullscreen(self.is_fullscreen.then_some(Fullscreen::Borderless(None)));
        log::info!("Fullscreen {}", if self.is_fullscreen { "on" } else { "off" });

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.request_resize();
        }
    }

    /// FPS in the title, culling stats in the log, once a second
    fn update_stats(&mut self, now: Instant) {
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }

        let fps = self.frame_count as f32 / elapsed;
        let (visible, total) = self
            .renderer
            .as_ref()
            .map_or((0, 0), Renderer::object_counts);

        if self.config.debug.show_fps {
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) - {}/{} visible",
                    self.config.window.title,
                    fps,
                    1000.0 / fps.max(f32::EPSILON),
                    visible,
                    total
                ));
            }
        }
        log::info!("{:.0} FPS, {} of {} objects visible", fps, visible, total);

        self.frame_count = 0;
        self.last_fps_update = now;
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, key: KeyCode, pressed: bool) {
        if let Some(renderer) = self.renderer.as_mut() {
            let keys = &mut renderer.camera.keys;
            match key {
                KeyCode::KeyW => keys.forward = pressed,
                KeyCode::KeyS => keys.backward = pressed,
                KeyCode::KeyA => keys.left = pressed,
                KeyCode::KeyD => keys.right = pressed,
                _ => {}
            }
        }

        if !pressed {
            return;
        }

        match key {
            KeyCode::Escape => {
                log::info!("Escape pressed, exiting");
                event_loop.exit();
            }
            KeyCode::F11 => self.toggle_fullscreen(),
            KeyCode::KeyP => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.paused = !renderer.paused;
                    log::info!("Animation {}", if renderer.paused { "paused" } else { "resumed" });
                }
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => {
                log::info!("Recording on {} worker threads", renderer.worker_count());
                self.renderer = Some(renderer);
            }
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.last_frame_time = Instant::now();
        self.last_fps_update = self.last_frame_time;
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Window closed");
                if let Some(ref renderer) = self.renderer {
                    let _ = renderer.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_resize();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.repeat {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    self.handle_key(event_loop, key, event.state.is_pressed());
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down Vulkan while the window still exists
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
