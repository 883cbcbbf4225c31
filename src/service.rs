use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use mux_bus::{
    FrameSubmitter, MediaBackend, RecordingSession, SessionConfig, SessionState, SessionSummary,
    muxer::MuxerState,
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub muxer_state: MuxerState,
    pub tracks_registered: bool,
    pub pending: usize,
    pub fault: Option<String>,
}

/// Shared handle to the single recording session of this process.
///
/// Session calls join threads and sleep through grace windows, so every
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct RecorderService {
    session: Arc<Mutex<RecordingSession>>,
    frames: FrameSubmitter,
}

impl RecorderService {
    pub fn new(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let session = RecordingSession::new(config, backend);
        let frames = session.frame_submitter();
        Self {
            session: Arc::new(Mutex::new(session)),
            frames,
        }
    }

    async fn with_session<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordingSession) -> anyhow::Result<T> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = session.lock().unwrap();
            f(&mut session)
        })
        .await?
    }

    pub async fn start(&self) -> anyhow::Result<PathBuf> {
        self.with_session(|s| s.start_session()).await
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.with_session(|s| s.pause_session()).await
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.with_session(|s| s.resume_session()).await
    }

    pub async fn stop(&self) -> anyhow::Result<SessionSummary> {
        self.with_session(|s| s.stop_session()).await
    }

    pub async fn status(&self) -> anyhow::Result<SessionStatus> {
        self.with_session(|s| {
            Ok(SessionStatus {
                state: s.state(),
                muxer_state: s.muxer_state(),
                tracks_registered: s.tracks_registered(),
                pending: s.pending(),
                fault: s.fault(),
            })
        })
        .await
    }

    /// Hands a raw NV21 frame to the video pipeline without taking the
    /// session lock.
    pub fn submit_frame(&self, frame: Bytes) -> bool {
        self.frames.submit_frame(frame)
    }
}
