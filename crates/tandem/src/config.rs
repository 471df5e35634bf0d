//! Pipeline configuration.
//!
//! Configuration is read from a TOML file. Every key is optional; missing keys take the defaults
//! of [`Config::default`].

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::video::{Resolution, VideoInput};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file `{}`", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Input size of the SSD detector, which determines its number of anchor boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u32")]
pub enum SsdShape {
    S300,
    S600,
}

impl SsdShape {
    /// Side length of the square input image.
    pub fn side(self) -> usize {
        match self {
            Self::S300 => 300,
            Self::S600 => 600,
        }
    }

    /// Number of anchor boxes the box predictor scores.
    pub fn anchors(self) -> usize {
        match self {
            Self::S300 => 1917,
            Self::S600 => 7326,
        }
    }
}

impl TryFrom<u32> for SsdShape {
    type Error = String;

    fn try_from(side: u32) -> Result<Self, String> {
        match side {
            300 => Ok(Self::S300),
            600 => Ok(Self::S600),
            _ => Err(format!("`ssd_shape` must be 300 or 600, got {side}")),
        }
    }
}

impl fmt::Display for SsdShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.side())
    }
}

/// What to do with a fast-stage result when the slow stage is still busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPolicy {
    /// Discard the result.
    #[default]
    DropNewest,
    /// Keep the result and retry the handoff on the next iteration. A newer fast-stage result
    /// replaces it.
    HoldLatest,
}

/// Names of the model tensors the pipeline feeds and fetches.
///
/// The defaults are the node names of the TensorFlow object detection API's SSD exports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TensorNames {
    pub image: String,
    pub boxes: String,
    pub scores: String,
    pub classes: String,
    pub num_detections: String,
    /// Intermediate class scores, output of the fast stage in split mode.
    pub score_out: String,
    /// Intermediate box encodings, output of the fast stage in split mode.
    pub expand_out: String,
    pub score_in: String,
    pub expand_in: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            image: "image_tensor".into(),
            boxes: "detection_boxes".into(),
            scores: "detection_scores".into(),
            classes: "detection_classes".into(),
            num_detections: "num_detections".into(),
            score_out: "Postprocessor/convert_scores".into(),
            expand_out: "Postprocessor/ExpandDims_1".into(),
            score_in: "Postprocessor/convert_scores_1".into(),
            expand_in: "Postprocessor/ExpandDims_1_1".into(),
        }
    }
}

impl TensorNames {
    /// The final detector outputs, in the order expected by
    /// [`Detections::decode`][crate::detection::Detections::decode].
    pub fn detection_fetches(&self) -> Vec<String> {
        vec![
            self.boxes.clone(),
            self.scores.clone(),
            self.classes.clone(),
            self.num_detections.clone(),
        ]
    }

    /// The outputs of the fast stage in split mode: scores, then box encodings.
    pub fn intermediate_fetches(&self) -> Vec<String> {
        vec![self.score_out.clone(), self.expand_out.clone()]
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub video_input: String,
    pub width: u32,
    pub height: u32,
    pub visualize: bool,
    pub vis_text: bool,
    pub debug_mode: bool,
    pub max_frames: u64,
    /// Seconds.
    pub fps_interval: f64,
    pub det_interval: u64,
    pub det_th: f32,
    pub split_model: bool,
    pub ssd_shape: SsdShape,
    pub num_classes: usize,
    pub model_path: PathBuf,
    pub slow_model_path: Option<PathBuf>,
    pub label_path: PathBuf,
    pub output_dir: PathBuf,
    pub handoff: HandoffPolicy,
    pub tensors: TensorNames,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_input: "webcam".into(),
            width: 600,
            height: 600,
            visualize: false,
            vis_text: true,
            debug_mode: false,
            max_frames: 5000,
            fps_interval: 5.0,
            det_interval: 75,
            det_th: 0.5,
            split_model: false,
            ssd_shape: SsdShape::S300,
            num_classes: 90,
            model_path: "models/ssd_mobilenet_v1.onnx".into(),
            slow_model_path: None,
            label_path: "models/mscoco_label_map.pbtxt".into(),
            output_dir: "output".into(),
            handoff: HandoffPolicy::default(),
            tensors: TensorNames::default(),
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that deserialization alone cannot rule out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if let Err(e) = self.video_input() {
            return invalid(format!("`video_input`: {e}"));
        }
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "resolution must not be empty, got {}x{}",
                self.width, self.height
            ));
        }
        if self.det_interval == 0 {
            return invalid("`det_interval` must be at least 1".into());
        }
        if !(self.fps_interval > 0.0 && self.fps_interval.is_finite()) {
            return invalid(format!(
                "`fps_interval` must be a positive number of seconds, got {}",
                self.fps_interval
            ));
        }
        if !(0.0..=1.0).contains(&self.det_th) {
            return invalid(format!("`det_th` must be in 0..=1, got {}", self.det_th));
        }
        if self.num_classes == 0 {
            return invalid("`num_classes` must be at least 1".into());
        }
        if self.split_model && self.slow_model_path.is_none() {
            return invalid("`split_model` requires `slow_model_path`".into());
        }
        Ok(())
    }

    pub fn video_input(&self) -> anyhow::Result<VideoInput> {
        self.video_input.parse()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn fps_interval(&self) -> Duration {
        Duration::from_secs_f64(self.fps_interval)
    }

    /// Outputs computed by the fast stage.
    pub fn fast_fetches(&self) -> Vec<String> {
        if self.split_model {
            self.tensors.intermediate_fetches()
        } else {
            self.tensors.detection_fetches()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
        assert_eq!(config.fast_fetches().len(), 4);
        assert_eq!(config.video_input().unwrap(), VideoInput::Webcam { name: None });
    }

    #[test]
    fn parse_split_config() {
        let config: Config = toml::from_str(
            r#"
            video_input = "synthetic"
            split_model = true
            ssd_shape = 600
            slow_model_path = "models/ssd_postprocess.onnx"
            handoff = "hold_latest"
            fps_interval = 2.5

            [tensors]
            image = "input"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.ssd_shape, SsdShape::S600);
        assert_eq!(config.ssd_shape.anchors(), 7326);
        assert_eq!(config.handoff, HandoffPolicy::HoldLatest);
        assert_eq!(config.fps_interval(), Duration::from_millis(2500));
        assert_eq!(config.tensors.image, "input");
        assert_eq!(config.tensors.boxes, "detection_boxes");
        assert_eq!(
            config.fast_fetches(),
            ["Postprocessor/convert_scores", "Postprocessor/ExpandDims_1"]
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(toml::from_str::<Config>("ssd_shape = 512").is_err());
        assert!(toml::from_str::<Config>("handoff = \"queue\"").is_err());
        assert!(toml::from_str::<Config>("unknown_key = 1").is_err());

        let invalid = [
            Config {
                det_interval: 0,
                ..Config::default()
            },
            Config {
                fps_interval: 0.0,
                ..Config::default()
            },
            Config {
                split_model: true,
                ..Config::default()
            },
            Config {
                width: 0,
                ..Config::default()
            },
            Config {
                video_input: " ".into(),
                ..Config::default()
            },
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn example_file_matches_defaults() {
        let config: Config = toml::from_str(include_str!("../tandem.example.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Config::load("does/not/exist.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
