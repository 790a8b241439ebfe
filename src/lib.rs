pub mod capture;
pub mod pipeline;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

pub use capture::{decode_frame, DecodeError, Encoding, Frame, FrameError, PixelFormat, RawFrame};
pub use pipeline::{
    FrameBuffer, FrameProcessor, ProcessorKind, SessionState, Snapshot, SnapshotController,
    SnapshotError, SnapshotRequest, StreamSession,
};
pub use transport::{DeviceSelector, Transport, TransportError};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    pub snapshot: SnapshotConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic test pattern, no hardware needed
    #[default]
    Pattern,
    /// V4L2 camera (requires the `v4l2` feature)
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device: DeviceSelector,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub encoding: Encoding,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded wait for each transport event
    pub frame_timeout_ms: u64,
    /// Consecutive misses (timeouts or undecodable frames) before the session errors out
    pub miss_budget: u32,
    /// Transport-to-session channel depth; frames beyond it are dropped
    pub channel_capacity: usize,
    pub processor: ProcessorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub output_dir: PathBuf,
    /// File extension, picks the encoder (`png` or `jpg`)
    pub extension: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Pattern,
            device: DeviceSelector::Auto,
            width: 640,
            height: 480,
            fps: 30,
            encoding: Encoding::Bgr24,
            buffer_count: 4,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 1000,
            miss_budget: 3,
            channel_capacity: 4,
            processor: ProcessorKind::Mirror,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("snapshots"),
            extension: "png".into(),
        }
    }
}

impl SessionConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn processor(&self) -> Arc<dyn FrameProcessor> {
        self.processor.build()
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if it exists, then `IRSNAP__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(Environment::with_prefix("IRSNAP").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture.width and capture.height must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps must be non-zero");
        }
        if self.session.frame_timeout_ms == 0 {
            return invalid("session.frame_timeout_ms must be non-zero");
        }
        if self.session.miss_budget == 0 {
            return invalid("session.miss_budget must be at least 1");
        }
        if self.session.channel_capacity == 0 {
            return invalid("session.channel_capacity must be at least 1");
        }
        Ok(())
    }
}
