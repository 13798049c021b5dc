use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RendererError, Result};

/// Fixed camera looking down -Z at the canvas quad.
///
/// The canvas is a flat quad spanning `[-1, 1]` on the XY plane, so a
/// single perspective evaluated at `depth` is enough to map window pixels
/// back onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraConfig {
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Distance from the eye to the canvas plane.
    pub depth: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y: 45f32.to_radians(),
            depth: 2.5,
            near: 0.1,
            far: 10.0,
        }
    }
}

impl CameraConfig {
    pub fn tan_half_fov(&self) -> f32 {
        (self.fov_y * 0.5).tan()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrushConfig {
    /// Initial stamp half-size in layer-local units.
    pub radius: f32,
    pub min_radius: f32,
    pub max_radius: f32,
    /// Multiplier applied by the grow/shrink keys.
    pub step: f32,
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            radius: 0.05,
            min_radius: 0.005,
            max_radius: 1.0,
            step: 1.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPaths {
    pub brush_vertex: PathBuf,
    pub brush_fragment: PathBuf,
    pub layer_vertex: PathBuf,
    pub layer_fragment: PathBuf,
    pub scene_vertex: PathBuf,
    pub scene_fragment: PathBuf,
}

impl Default for ShaderPaths {
    fn default() -> Self {
        Self {
            brush_vertex: "brush_vert.spv".into(),
            brush_fragment: "brush_frag.spv".into(),
            layer_vertex: "layer_vert.spv".into(),
            layer_fragment: "layer_frag.spv".into(),
            scene_vertex: "vert.spv".into(),
            scene_fragment: "frag.spv".into(),
        }
    }
}

/// Startup configuration. Built once and handed to the constructors that
/// need it; nothing reads configuration from global state.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    pub application_name: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub max_frames_in_flight: usize,
    pub num_textures: usize,
    pub max_entities: usize,
    /// Requested sample count for the swapchain pass, clamped to what the
    /// device supports. `1` disables multisampling.
    pub msaa_samples: u32,
    pub enable_validation: bool,
    pub shaders: ShaderPaths,
    pub brush_path: PathBuf,
    pub camera: CameraConfig,
    pub brush: BrushConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "NovaDE Paint".to_string(),
            canvas_width: 1024,
            canvas_height: 1024,
            max_frames_in_flight: 3,
            num_textures: 4,
            max_entities: 8,
            msaa_samples: 1,
            enable_validation: cfg!(debug_assertions),
            shaders: ShaderPaths::default(),
            brush_path: "brush.png".into(),
            camera: CameraConfig::default(),
            brush: BrushConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Builds a configuration from named options, starting from the
    /// defaults. Option names match the constants the painting tool ships
    /// with (`CANVAS_WIDTH`, `MAX_FRAMES_IN_FLIGHT`, `BRUSH_PATH`, ...).
    pub fn from_options<I, K, V>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.apply(name.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "CANVAS_WIDTH" => self.canvas_width = parse(name, value)?,
            "CANVAS_HEIGHT" => self.canvas_height = parse(name, value)?,
            "MAX_FRAMES_IN_FLIGHT" => self.max_frames_in_flight = parse(name, value)?,
            "NUM_TEXTURES" => self.num_textures = parse(name, value)?,
            "MAX_ENTITIES" => self.max_entities = parse(name, value)?,
            "MSAA_SAMPLES" => self.msaa_samples = parse(name, value)?,
            "ENABLE_VALIDATION" => self.enable_validation = parse(name, value)?,
            "BRUSH_VERT_SHADER_PATH" => self.shaders.brush_vertex = value.into(),
            "BRUSH_FRAG_SHADER_PATH" => self.shaders.brush_fragment = value.into(),
            "LAYER_VERT_SHADER_PATH" => self.shaders.layer_vertex = value.into(),
            "LAYER_FRAG_SHADER_PATH" => self.shaders.layer_fragment = value.into(),
            "VERT_SHADER_PATH" => self.shaders.scene_vertex = value.into(),
            "FRAG_SHADER_PATH" => self.shaders.scene_fragment = value.into(),
            "BRUSH_PATH" => self.brush_path = value.into(),
            other => {
                return Err(RendererError::Config(format!(
                    "unrecognized option `{other}`"
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.canvas_width == 0, "CANVAS_WIDTH must be non-zero"),
            (self.canvas_height == 0, "CANVAS_HEIGHT must be non-zero"),
            (
                self.max_frames_in_flight < 2,
                "MAX_FRAMES_IN_FLIGHT must be at least 2",
            ),
            (
                self.num_textures < 2,
                "NUM_TEXTURES must be at least 2 (canvas and brush)",
            ),
            (self.max_entities == 0, "MAX_ENTITIES must be at least 1"),
            (
                !self.msaa_samples.is_power_of_two() || self.msaa_samples > 64,
                "MSAA_SAMPLES must be a power of two no larger than 64",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(RendererError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        RendererError::Config(format!("option `{name}` has invalid value `{value}`"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipped_constants() {
        let config = RendererConfig::default();
        assert_eq!((config.canvas_width, config.canvas_height), (1024, 1024));
        assert_eq!(config.max_frames_in_flight, 3);
        assert_eq!(config.num_textures, 4);
        assert_eq!(config.max_entities, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn named_options_override_defaults() {
        let config = RendererConfig::from_options([
            ("CANVAS_WIDTH", "512"),
            ("MAX_FRAMES_IN_FLIGHT", "2"),
            ("BRUSH_PATH", "round.png"),
            ("LAYER_FRAG_SHADER_PATH", "shaders/layer.frag.spv"),
        ])
        .unwrap();
        assert_eq!(config.canvas_width, 512);
        assert_eq!(config.canvas_height, 1024);
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.brush_path, PathBuf::from("round.png"));
        assert_eq!(
            config.shaders.layer_fragment,
            PathBuf::from("shaders/layer.frag.spv")
        );
    }

    #[test]
    fn unknown_and_malformed_options_are_rejected() {
        assert!(matches!(
            RendererConfig::from_options([("WINDOW_TITLE", "x")]),
            Err(RendererError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_options([("CANVAS_HEIGHT", "tall")]),
            Err(RendererError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_options([("MAX_FRAMES_IN_FLIGHT", "0")]),
            Err(RendererError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_options([("MAX_FRAMES_IN_FLIGHT", "1")]),
            Err(RendererError::Config(message)) if message.contains("at least 2")
        ));
        assert!(matches!(
            RendererConfig::from_options([("MSAA_SAMPLES", "3")]),
            Err(RendererError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_options([("NUM_TEXTURES", "1")]),
            Err(RendererError::Config(_))
        ));
    }

    #[test]
    fn camera_half_fov_is_the_classic_constant() {
        let camera = CameraConfig::default();
        assert!((camera.tan_half_fov() - 0.4142).abs() < 1e-3);
    }
}
