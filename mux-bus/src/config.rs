use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::format::{MIME_AAC, MIME_AVC, MediaFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub mime: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            mime: MIME_AAC.to_string(),
            sample_rate: 16000,
            channels: 1,
            bit_rate: 64000,
        }
    }
}

impl AudioSettings {
    pub fn format(&self) -> MediaFormat {
        MediaFormat::audio(&self.mime, self.sample_rate, self.channels).with_bit_rate(self.bit_rate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub iframe_interval: u32,
    /// Derived from size and frame rate when unset.
    pub bit_rate: Option<u64>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            mime: MIME_AVC.to_string(),
            width: 1920,
            height: 1080,
            frame_rate: 25,
            iframe_interval: 10,
            bit_rate: None,
        }
    }
}

impl VideoSettings {
    pub fn bit_rate(&self) -> u64 {
        self.bit_rate.unwrap_or(
            self.width as u64 * self.height as u64 * 3 * 8 * self.frame_rate as u64 / 256,
        )
    }

    pub fn format(&self) -> MediaFormat {
        MediaFormat::video(&self.mime, self.width, self.height)
            .with_frame_rate(self.frame_rate, self.iframe_interval)
            .with_bit_rate(self.bit_rate())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Bounded wait for encoder input/output slots.
    pub codec_timeout_us: u64,
    pub encoder_stop_grace_ms: u64,
    pub muxer_stop_grace_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            codec_timeout_us: 10_000,
            encoder_stop_grace_ms: 10,
            muxer_stop_grace_ms: 100,
        }
    }
}

impl TimingSettings {
    pub fn codec_timeout(&self) -> Duration {
        Duration::from_micros(self.codec_timeout_us)
    }

    pub fn encoder_stop_grace(&self) -> Duration {
        Duration::from_millis(self.encoder_stop_grace_ms)
    }

    pub fn muxer_stop_grace(&self) -> Duration {
        Duration::from_millis(self.muxer_stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub file_extension: String,
    pub audio: AudioSettings,
    pub video: VideoSettings,
    pub timing: TimingSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            file_extension: "lrf".to_string(),
            audio: AudioSettings::default(),
            video: VideoSettings::default(),
            timing: TimingSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Output file for a recording started at `started_at`.
    pub fn output_path(&self, started_at: chrono::DateTime<chrono::Local>) -> PathBuf {
        self.output_dir.join(format!(
            "{}.{}",
            started_at.format("%Y_%m_%d_%H_%M_%S"),
            self.file_extension
        ))
    }
}
