// Configuration loaded from config.toml
//
// Every section and field has a default, so a missing file or a partial one
// is fine.

use anyhow::{Context, Result};
use glam::Vec3;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub threading: ThreadingConfig,
    pub camera: CameraConfig,
    pub shaders: ShadersConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Multi threaded command buffers".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.2, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "multithread.log".to_string(),
            show_fps: true,
        }
    }
}

/// Worker pool and scene size
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// 0 picks one worker per hardware thread
    pub worker_count: usize,
    /// Total objects, split evenly across workers
    pub object_count: usize,
    /// Seed for object placement
    pub seed: u64,
    /// Culling radius as a fraction of the mesh bounding radius
    pub cull_radius_scale: f32,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            object_count: 512,
            seed: 0,
            cull_radius_scale: 0.5,
        }
    }
}

impl ThreadingConfig {
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            crate::thread_pool::available_parallelism()
        } else {
            self.worker_count
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Vertical field of view in degrees
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub position: [f32; 3],
    /// Pitch, yaw, roll in degrees
    pub rotation: [f32; 3],
    pub movement_speed: f32,
    pub flip_y: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov: 60.0,
            near: 0.1,
            far: 256.0,
            position: [0.0, 0.0, -32.5],
            rotation: [0.0, 0.0, 0.0],
            movement_speed: 5.0,
            flip_y: true,
        }
    }
}

impl CameraConfig {
    pub fn position(&self) -> Vec3 {
        Vec3::from(self.position)
    }

    pub fn rotation(&self) -> Vec3 {
        Vec3::from(self.rotation)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShadersConfig {
    /// Directory holding the compiled `.spv` files
    pub directory: PathBuf,
}

impl Default for ShadersConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders")),
        }
    }
}

impl ShadersConfig {
    pub fn path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }
}

impl Config {
    /// Load `path`, falling back to defaults when it is missing or invalid.
    ///
    /// Runs before logging is set up, so a rejected file is handed back
    /// for the caller to report.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path. A missing file is not an
    /// error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        anyhow::ensure!(
            config.graphics.max_frames_in_flight > 0,
            "graphics.max_frames_in_flight must be at least 1"
        );
        anyhow::ensure!(
            config.threading.object_count > 0,
            "threading.object_count must be at least 1"
        );
        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.threading.object_count, 512);
        assert_eq!(config.threading.worker_count, 0);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.camera.position, [0.0, 0.0, -32.5]);
        assert!(config.threading.resolved_worker_count() >= 1);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [threading]
            worker_count = 4
            object_count = 128

            [camera]
            fov = 75.0
            flip_y = false

            [shaders]
            directory = "/opt/spv"
            "#,
        )
        .unwrap();

        assert_eq!(config.threading.resolved_worker_count(), 4);
        assert_eq!(config.threading.object_count, 128);
        assert_eq!(config.threading.seed, 0);
        assert_eq!(config.camera.fov, 75.0);
        assert!(!config.camera.flip_y);
        assert_eq!(config.camera.far, 256.0);
        assert_eq!(config.shaders.path("phong.vert.spv"), Path::new("/opt/spv/phong.vert.spv"));
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::parse("[graphics]\nmax_frames_in_flight = 0").is_err());
        assert!(Config::parse("[threading]\nobject_count = 0").is_err());
        assert!(Config::parse("[threading]\nworker_count = \"many\"").is_err());
    }

    #[test]
    fn rejected_file_falls_back_with_its_error() {
        let path = std::env::temp_dir().join(format!("multithread-renderer-{}.toml", std::process::id()));
        std::fs::write(&path, "[graphics]\nmax_frames_in_flight = 0\n").unwrap();

        let (config, error) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 2);
        let error = error.expect("invalid file must be reported");
        assert!(format!("{:#}", error).contains("max_frames_in_flight"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let (config, error) = Config::load_or_default("/nonexistent/config.toml");
        assert!(error.is_none());
        assert_eq!(config.threading.object_count, 512);
    }

    #[test]
    fn present_mode_names() {
        let mut config = Config::default();
        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
