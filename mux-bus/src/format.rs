use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const MIME_AAC: &str = "audio/mp4a-latm";
pub const MIME_AVC: &str = "video/avc";
pub const MIME_RAW_AUDIO: &str = "audio/raw";
pub const MIME_RAW_VIDEO: &str = "video/raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_u8(self) -> u8 {
        match self {
            TrackKind::Audio => 0,
            TrackKind::Video => 1,
        }
    }
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Raw pixel layout handed to a video encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    /// Y plane followed by interleaved U/V (YUV420SemiPlanar).
    Nv12,
    /// Y plane followed by interleaved V/U, the usual camera layout.
    Nv21,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatParams {
    Audio {
        sample_rate: u32,
        channels: u16,
    },
    Video {
        width: u32,
        height: u32,
        frame_rate: u32,
        iframe_interval: u32,
        color_format: ColorFormat,
    },
}

/// Describes a stream either as requested from an encoder (`configure`) or
/// as reported back by it once its output has stabilized.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub mime: String,
    pub params: FormatParams,
    pub bit_rate: u64,
    /// Codec specific data (SPS/PPS, AudioSpecificConfig, ...).
    pub csd: Vec<Bytes>,
}

impl MediaFormat {
    pub fn audio(mime: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            mime: mime.to_string(),
            params: FormatParams::Audio {
                sample_rate,
                channels,
            },
            bit_rate: 0,
            csd: Vec::new(),
        }
    }

    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            params: FormatParams::Video {
                width,
                height,
                frame_rate: 25,
                iframe_interval: 10,
                color_format: ColorFormat::Nv12,
            },
            bit_rate: 0,
            csd: Vec::new(),
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    pub fn with_frame_rate(mut self, rate: u32, iframe_interval_secs: u32) -> Self {
        if let FormatParams::Video {
            frame_rate,
            iframe_interval,
            ..
        } = &mut self.params
        {
            *frame_rate = rate;
            *iframe_interval = iframe_interval_secs;
        }
        self
    }

    pub fn with_csd(mut self, csd: Bytes) -> Self {
        self.csd.push(csd);
        self
    }

    pub fn kind(&self) -> TrackKind {
        match self.params {
            FormatParams::Audio { .. } => TrackKind::Audio,
            FormatParams::Video { .. } => TrackKind::Video,
        }
    }

    /// Width/height for video formats.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.params {
            FormatParams::Video { width, height, .. } => Some((width, height)),
            FormatParams::Audio { .. } => None,
        }
    }
}

impl Display for MediaFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.params {
            FormatParams::Audio {
                sample_rate,
                channels,
            } => write!(
                f,
                "{} {}Hz {}ch {}bps csd={}",
                self.mime,
                sample_rate,
                channels,
                self.bit_rate,
                self.csd.len()
            ),
            FormatParams::Video {
                width,
                height,
                frame_rate,
                ..
            } => write!(
                f,
                "{} {}x{}@{} {}bps csd={}",
                self.mime,
                width,
                height,
                frame_rate,
                self.bit_rate,
                self.csd.len()
            ),
        }
    }
}
