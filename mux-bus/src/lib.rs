#[cfg(feature = "ffmpeg")]
/// Registers FFmpeg components. Call once at startup before using the
/// FFmpeg backend.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod audio_pipeline;
pub mod backend;
pub mod clock;
pub mod codec;
pub mod config;
mod encoder;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod format;
pub mod frame;
#[cfg(feature = "ffmpeg")]
pub mod hw;
pub mod muxer;
pub mod output;
pub mod packet;
pub mod passthrough;
#[cfg(feature = "ffmpeg")]
pub mod scaler;
pub mod session;
pub mod source;
#[cfg(test)]
mod testing;
pub mod video_pipeline;

pub use backend::{MediaBackend, SoftwareBackend};
pub use config::SessionConfig;
pub use session::{RecordingSession, SessionState, SessionSummary};
pub use video_pipeline::FrameSubmitter;
