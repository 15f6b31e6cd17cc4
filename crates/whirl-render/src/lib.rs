// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod frame;
pub mod uniform;

pub use frame::{Acquire, DrawOutcome, FenceWait, FrameBackend, FrameScheduler, PresentStatus, SlotPhase};
pub use uniform::{rotation_angle, Camera, UniformPayload, UniformUpdater};

/// Upper bound on frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Presentation mode the surface must offer. There is no fallback: a missing
/// mode is a fatal configuration error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentMode {
    #[default]
    Mailbox,
    Fifo,
}

#[derive(Clone, Debug)]
pub struct RenderSettings {
    pub size: RenderSize,
    pub clear_color: [f32; 4],
    pub present_mode: PresentMode,
    pub frames_in_flight: usize,
    pub fence_timeout: Duration,
    pub rotation_period: Duration,
    pub shader_dir: PathBuf,
}

impl RenderSettings {
    pub fn new(size: RenderSize, shader_dir: impl Into<PathBuf>) -> Self {
        Self {
            size,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: PresentMode::Mailbox,
            frames_in_flight: 3,
            fence_timeout: Duration::from_secs(1),
            rotation_period: Duration::from_millis(7000),
            shader_dir: shader_dir.into(),
        }
    }

    /// Frame-slot count clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn slot_count(&self) -> usize {
        self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        settings: &RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Record the new framebuffer size. The surface is recreated on the next
    /// `render`, or deferred while the size is zero.
    fn resize(&mut self, size: RenderSize) -> Result<()>;

    fn render(&mut self) -> Result<DrawOutcome>;
}
