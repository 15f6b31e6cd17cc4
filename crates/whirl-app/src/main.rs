// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

mod config;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use clap::Parser;
use tracing::{error, info, warn};

use config::{AppCfg, PresentModeCfg};
use whirl_core::init_tracing;
use whirl_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};
use whirl_platform::{framebuffer_extent, is_quit_request, window_attributes};
use whirl_render::{DrawOutcome, RenderSize, Renderer};
use whirl_render_vk::VkRenderer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; defaults are used when it does not exist
    #[arg(long, default_value = "whirl.toml")]
    config: PathBuf,

    /// Directory holding shader.vert.spv and shader.frag.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    #[arg(long)]
    frames_in_flight: Option<usize>,

    #[arg(long, value_enum)]
    present_mode: Option<PresentModeCfg>,
}

/// A renderer and the window its surface was created from. Fields drop in
/// declaration order, so the renderer always goes first.
struct Presenter<R, W> {
    renderer: Option<R>,
    window: Option<W>,
}

impl<R, W> Presenter<R, W> {
    fn empty() -> Self {
        Self {
            renderer: None,
            window: None,
        }
    }

    fn release(&mut self) {
        self.renderer = None;
        self.window = None;
    }
}

impl<R, W> Drop for Presenter<R, W> {
    fn drop(&mut self) {
        self.release();
    }
}

struct App {
    cfg: AppCfg,
    view: Presenter<VkRenderer, Window>,
    paused: bool,
    failure: Option<Error>,

    frames: u32,
    last_fps: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        Self {
            cfg,
            view: Presenter::empty(),
            paused: false,
            failure: None,
            frames: 0,
            last_fps: Instant::now(),
        }
    }

    fn size(window: &Window) -> RenderSize {
        let (width, height) = framebuffer_extent(window);
        RenderSize { width, height }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let w = &self.cfg.window;
        let window = event_loop.create_window(window_attributes(&w.title, w.width, w.height))?;
        let settings = self.cfg.to_settings(Self::size(&window));
        let renderer = VkRenderer::new(&window, &window, &settings)?;
        info!(
            frames_in_flight = renderer.frames_in_flight(),
            "renderer ready"
        );
        self.view.renderer = Some(renderer);
        self.view.window = Some(window);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.view.release();
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: Error) {
        error!("{e:#}");
        self.failure = Some(e);
        self.shutdown(event_loop);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.view.window.is_some() {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(window) = self.view.window.as_ref() else { return };
        if window.id() != id {
            return;
        }
        if is_quit_request(&event) {
            info!("quit requested");
            self.shutdown(event_loop);
            return;
        }

        match event {
            WindowEvent::Resized(size) => {
                let size = RenderSize {
                    width: size.width,
                    height: size.height,
                };
                self.paused = size.is_zero();
                if let Some(r) = self.view.renderer.as_mut() {
                    if let Err(e) = r.resize(size) {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                window.request_redraw();
            }
            WindowEvent::RedrawRequested => {
                let Some(r) = self.view.renderer.as_mut() else { return };
                match r.render() {
                    Ok(DrawOutcome::Presented) => {
                        self.paused = false;
                        self.frames += 1;
                    }
                    Ok(DrawOutcome::Recreated) => self.paused = false,
                    Ok(DrawOutcome::Paused) => self.paused = true,
                    Ok(DrawOutcome::Skipped) => warn!("frame skipped"),
                    Err(e) => self.fail(event_loop, e),
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(window) = self.view.window.as_ref() else { return };

        // Minimised: sleep until the next resize instead of spinning.
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        window.request_redraw();

        let now = Instant::now();
        if now.duration_since(self.last_fps) >= Duration::from_secs(1) {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = config::load(&args.config);
    cfg.apply_overrides(args.shader_dir, args.frames_in_flight, args.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => {
            info!("clean shutdown");
            Ok(())
        }
    }
}
