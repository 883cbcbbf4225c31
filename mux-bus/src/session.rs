use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use bytes::Bytes;
use serde::Serialize;

use crate::{
    audio_pipeline::AudioPipeline,
    backend::MediaBackend,
    config::SessionConfig,
    muxer::{MuxerCoordinator, MuxerState},
    video_pipeline::{FrameSubmitter, VideoPipeline},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Recording => write!(f, "recording"),
            SessionState::Paused => write!(f, "paused"),
        }
    }
}

/// Outcome of one recording.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub path: Option<PathBuf>,
    pub samples_written_audio: u64,
    pub samples_written_video: u64,
    pub write_failures: u64,
    pub samples_dropped: u64,
    /// Whether both tracks made it into the container.
    pub tracks_registered: bool,
    pub fault: Option<String>,
}

/// Owns the muxer and, while recording, both encoder pipelines. Starts
/// producers before the consumer and tears them down in reverse.
pub struct RecordingSession {
    config: SessionConfig,
    backend: Arc<dyn MediaBackend>,
    muxer: MuxerCoordinator,
    audio: Option<AudioPipeline>,
    video: Option<VideoPipeline>,
    frames: FrameSubmitter,
    state: SessionState,
    output_path: Option<PathBuf>,
}

impl RecordingSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let muxer = MuxerCoordinator::new(config.timing.muxer_stop_grace());
        Self {
            config,
            backend,
            muxer,
            audio: None,
            video: None,
            frames: FrameSubmitter::new(),
            state: SessionState::Idle,
            output_path: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Begins a new recording and returns the container path. A missing
    /// codec or container does not fail the call: the affected part stays
    /// inert and the gap shows in `tracks_registered` and `fault`.
    pub fn start_session(&mut self) -> anyhow::Result<PathBuf> {
        if self.state != SessionState::Idle {
            anyhow::bail!("session already {}", self.state);
        }
        let path = self.config.output_path(chrono::Local::now());
        log::info!(
            "starting recording {} with {} backend",
            path.display(),
            self.backend.name()
        );

        if let Err(e) = self.open_writer(&path) {
            log::error!("recording {} has no container: {:#}", path.display(), e);
            self.muxer.record_fault(format!("{:#}", e));
        }

        let sink = self.muxer.sink();
        let mut video = VideoPipeline::new(
            self.backend.as_ref(),
            &self.config.video,
            &self.config.timing,
            sink.clone(),
            self.frames.clone(),
        );
        let mut audio = AudioPipeline::new(
            self.backend.as_ref(),
            &self.config.audio,
            &self.config.timing,
            sink,
        );
        if let Err(e) = video.start() {
            log::error!("video pipeline failed to start: {:#}", e);
        }
        if let Err(e) = audio.start() {
            log::error!("audio pipeline failed to start: {:#}", e);
        }
        self.video = Some(video);
        self.audio = Some(audio);
        self.output_path = Some(path.clone());
        self.state = SessionState::Recording;

        if let Err(e) = self.muxer.start() {
            self.stop_session()?;
            return Err(e);
        }
        Ok(path)
    }

    fn open_writer(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {}", dir.display()))?;
        }
        let writer = self
            .backend
            .create_writer(path)
            .with_context(|| format!("create container {}", path.display()))?;
        self.muxer.attach_writer(writer)
    }

    pub fn pause_session(&mut self) -> anyhow::Result<()> {
        if self.state != SessionState::Recording {
            log::info!("pause ignored, session {}", self.state);
            return Ok(());
        }
        if let Some(video) = &self.video {
            video.pause();
        }
        if let Some(audio) = &self.audio {
            audio.pause();
        }
        self.muxer.pause();
        self.state = SessionState::Paused;
        log::info!("recording paused");
        Ok(())
    }

    pub fn resume_session(&mut self) -> anyhow::Result<()> {
        if self.state != SessionState::Paused {
            log::info!("resume ignored, session {}", self.state);
            return Ok(());
        }
        self.muxer.resume();
        if let Some(video) = &self.video {
            video.resume();
        }
        if let Some(audio) = &self.audio {
            audio.resume();
        }
        self.state = SessionState::Recording;
        log::info!("recording resumed");
        Ok(())
    }

    /// Stops video, then audio, then drains and finalizes the container.
    /// Stopping an idle session returns an empty summary.
    pub fn stop_session(&mut self) -> anyhow::Result<SessionSummary> {
        if self.state == SessionState::Idle {
            return Ok(SessionSummary::default());
        }
        if let Some(mut video) = self.video.take() {
            video.stop();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }

        let tracks_registered = self.muxer.tracks_registered();
        let fault = self.muxer.fault();
        let stats = self.muxer.stop();
        self.state = SessionState::Idle;

        let summary = SessionSummary {
            path: self.output_path.take(),
            samples_written_audio: stats.samples_written_audio,
            samples_written_video: stats.samples_written_video,
            write_failures: stats.write_failures,
            samples_dropped: stats.samples_dropped,
            tracks_registered,
            fault,
        };
        log::info!("recording stopped: {:?}", summary);
        Ok(summary)
    }

    /// Queues one raw NV21 camera frame. False when no video pipeline
    /// accepts frames.
    pub fn submit_raw_video_frame(&self, frame: Bytes) -> bool {
        self.frames.submit_frame(frame)
    }

    pub fn frame_submitter(&self) -> FrameSubmitter {
        self.frames.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn muxer_state(&self) -> MuxerState {
        self.muxer.state()
    }

    pub fn tracks_registered(&self) -> bool {
        self.muxer.tracks_registered()
    }

    pub fn pending(&self) -> usize {
        self.muxer.pending()
    }

    pub fn fault(&self) -> Option<String> {
        self.muxer.fault()
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.state != SessionState::Idle {
            if let Err(e) = self.stop_session() {
                log::error!("stop recording on drop: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
