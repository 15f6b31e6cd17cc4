// SPDX-License-Identifier: CEPL-1.0
//! `whirl.toml` plus command-line overrides.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use whirl_render::{PresentMode, RenderSettings, RenderSize, MAX_FRAMES_IN_FLIGHT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
}

impl From<PresentModeCfg> for PresentMode {
    fn from(m: PresentModeCfg) -> Self {
        match m {
            PresentModeCfg::Mailbox => PresentMode::Mailbox,
            PresentModeCfg::Fifo => PresentMode::Fifo,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "whirl".into(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub present_mode: PresentModeCfg,
    pub frames_in_flight: usize,
    pub fence_timeout_ms: u64,
    pub rotation_period_ms: u64,
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: PresentModeCfg::Mailbox,
            frames_in_flight: 3,
            fence_timeout_ms: 1000,
            rotation_period_ms: 7000,
            shader_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

/// Missing file gives defaults; a file that fails to parse is reported and
/// also gives defaults.
pub fn load(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match toml::from_str::<AppCfg>(&s) {
            Ok(cfg) => {
                info!(path = %path.display(), "loaded config");
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), "ignoring unparsable config: {e}");
                AppCfg::default()
            }
        },
        Err(_) => AppCfg::default(),
    }
}

impl AppCfg {
    pub fn apply_overrides(
        &mut self,
        shader_dir: Option<PathBuf>,
        frames_in_flight: Option<usize>,
        present_mode: Option<PresentModeCfg>,
    ) {
        if let Some(dir) = shader_dir {
            self.render.shader_dir = Some(dir);
        }
        if let Some(n) = frames_in_flight {
            self.render.frames_in_flight = n;
        }
        if let Some(mode) = present_mode {
            self.render.present_mode = mode;
        }
    }

    pub fn to_settings(&self, size: RenderSize) -> RenderSettings {
        let r = &self.render;
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&r.frames_in_flight) {
            warn!(
                requested = r.frames_in_flight,
                "frames_in_flight out of range 1..={MAX_FRAMES_IN_FLIGHT}, clamping"
            );
        }
        let shader_dir = r
            .shader_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(whirl_render_vk::DEFAULT_SHADER_DIR));

        let mut s = RenderSettings::new(size, shader_dir);
        s.clear_color = r.clear_color;
        s.present_mode = r.present_mode.into();
        s.frames_in_flight = r.frames_in_flight;
        s.fence_timeout = Duration::from_millis(r.fence_timeout_ms);
        s.rotation_period = Duration::from_millis(r.rotation_period_ms);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: RenderSize = RenderSize {
        width: 800,
        height: 600,
    };

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg: AppCfg = toml::from_str("").unwrap();
        assert_eq!(cfg.window.title, "whirl");
        assert_eq!((cfg.window.width, cfg.window.height), (800, 600));
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Mailbox);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: AppCfg = toml::from_str(
            r#"
            [render]
            present_mode = "fifo"
            frames_in_flight = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.render.fence_timeout_ms, 1000);
        assert_eq!(cfg.window.width, 800);
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        let parsed = toml::from_str::<AppCfg>("[render]\npresent_mode = \"immediate\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_or_broken_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("whirl-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let cfg = load(&dir.join("absent.toml"));
        assert_eq!(cfg.render.rotation_period_ms, 7000);

        let broken = dir.join("broken.toml");
        fs::write(&broken, "[render\nframes_in_flight = ").unwrap();
        let cfg = load(&broken);
        assert_eq!(cfg.render.frames_in_flight, 3);

        let good = dir.join("good.toml");
        fs::write(&good, "[window]\ntitle = \"spin\"\n").unwrap();
        assert_eq!(load(&good).window.title, "spin");
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg: AppCfg = toml::from_str("[render]\nframes_in_flight = 2\n").unwrap();
        cfg.apply_overrides(Some(PathBuf::from("/tmp/spv")), Some(5), Some(PresentModeCfg::Fifo));
        assert_eq!(cfg.render.frames_in_flight, 5);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
        assert_eq!(cfg.render.shader_dir, Some(PathBuf::from("/tmp/spv")));

        cfg.apply_overrides(None, None, None);
        assert_eq!(cfg.render.frames_in_flight, 5);
    }

    #[test]
    fn settings_carry_config_values() {
        let mut cfg = AppCfg::default();
        cfg.render.frames_in_flight = 99;
        cfg.render.fence_timeout_ms = 250;
        let s = cfg.to_settings(SIZE);
        assert_eq!(s.size, SIZE);
        assert_eq!(s.slot_count(), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(s.fence_timeout, Duration::from_millis(250));
        assert_eq!(s.rotation_period, Duration::from_millis(7000));
        assert_eq!(s.present_mode, PresentMode::Mailbox);
        assert_eq!(s.shader_dir, PathBuf::from(whirl_render_vk::DEFAULT_SHADER_DIR));
    }
}
