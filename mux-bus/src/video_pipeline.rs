use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use bytes::Bytes;

use crate::{
    backend::MediaBackend,
    clock::PresentationClock,
    codec::HardwareEncoder,
    config::{TimingSettings, VideoSettings},
    encoder::EncoderCore,
    format::TrackKind,
    frame::{nv21_to_nv12, semi_planar_size},
    muxer::SampleSink,
};

#[derive(Debug, Default)]
struct VideoState {
    running: bool,
    paused: bool,
    accepting: bool,
    frames: VecDeque<Bytes>,
}

#[derive(Default)]
struct VideoShared {
    state: Mutex<VideoState>,
    cond: Condvar,
}

/// Hand-off point for raw NV21 camera frames. Cloneable, so a capture
/// thread can keep one while the pipelines behind it are rebuilt for each
/// recording.
#[derive(Clone, Default)]
pub struct FrameSubmitter {
    shared: Arc<VideoShared>,
}

impl FrameSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one frame for encoding. Returns false, dropping the frame,
    /// when no running pipeline accepts frames.
    pub fn submit_frame(&self, frame: Bytes) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if !state.accepting {
            log::trace!("video frame dropped, pipeline not accepting");
            return false;
        }
        state.frames.push_back(frame);
        self.shared.cond.notify_all();
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().unwrap().accepting
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().frames.len()
    }
}

struct VideoParts {
    core: EncoderCore,
    width: u32,
    height: u32,
}

/// Camera frame to encoder pipeline. Frames queue through a
/// [`FrameSubmitter`]; the encoder thread converts each to NV12 and encodes
/// it. Without an encoder it stays inert and refuses frames.
pub struct VideoPipeline {
    frames: FrameSubmitter,
    parts: Option<VideoParts>,
    worker: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl VideoPipeline {
    pub fn new(
        backend: &dyn MediaBackend,
        settings: &VideoSettings,
        timing: &TimingSettings,
        sink: Arc<dyn SampleSink>,
        frames: FrameSubmitter,
    ) -> Self {
        match backend
            .create_encoder(&settings.mime)
            .context("select video encoder")
        {
            Ok(encoder) => Self::with_encoder(encoder, settings, timing, sink, frames),
            Err(e) => {
                log::error!("video pipeline disabled: {:#}", e);
                Self::inert(timing, frames)
            }
        }
    }

    pub fn with_encoder(
        mut encoder: Box<dyn HardwareEncoder>,
        settings: &VideoSettings,
        timing: &TimingSettings,
        sink: Arc<dyn SampleSink>,
        frames: FrameSubmitter,
    ) -> Self {
        let format = settings.format();
        if let Err(e) = encoder.configure(&format) {
            log::error!(
                "video pipeline disabled, {} rejected {}: {:#}",
                encoder.name(),
                format,
                e
            );
            encoder.release();
            return Self::inert(timing, frames);
        }
        let core = EncoderCore::new(
            TrackKind::Video,
            encoder,
            sink,
            PresentationClock::monotonic(),
            timing.codec_timeout(),
        );
        Self {
            frames,
            parts: Some(VideoParts {
                core,
                width: settings.width,
                height: settings.height,
            }),
            worker: None,
            stop_grace: timing.encoder_stop_grace(),
        }
    }

    fn inert(timing: &TimingSettings, frames: FrameSubmitter) -> Self {
        Self {
            frames,
            parts: None,
            worker: None,
            stop_grace: timing.encoder_stop_grace(),
        }
    }

    pub(crate) fn with_clock(mut self, clock: PresentationClock) -> Self {
        if let Some(parts) = self.parts.as_mut() {
            parts.core.set_clock(clock);
        }
        self
    }

    pub fn is_inert(&self) -> bool {
        self.parts.is_none() && self.worker.is_none()
    }

    pub fn frame_submitter(&self) -> FrameSubmitter {
        self.frames.clone()
    }

    pub fn submit_frame(&self, frame: Bytes) -> bool {
        self.frames.submit_frame(frame)
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut parts) = self.parts.take() else {
            log::warn!("video pipeline has no encoder, start ignored");
            return Ok(());
        };
        if let Err(e) = parts.core.start() {
            parts.core.release();
            return Err(e.context("start video encoder"));
        }

        let shared = self.frames.shared.clone();
        {
            let mut state = shared.state.lock().unwrap();
            state.running = true;
            state.paused = false;
            state.accepting = true;
            state.frames.clear();
        }
        let stop_grace = self.stop_grace;
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("video-encoder".to_string())
            .spawn(move || Self::encoder_loop(thread_shared, parts, stop_grace));
        match handle {
            Ok(handle) => {
                log::info!("video pipeline started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = shared.state.lock().unwrap();
                state.running = false;
                state.accepting = false;
                Err(anyhow::anyhow!("spawn video encoder thread: {}", e))
            }
        }
    }

    /// Stops taking frames. Frames already queued wait for resume.
    pub fn pause(&self) {
        let mut state = self.frames.shared.state.lock().unwrap();
        if state.running && !state.paused {
            state.paused = true;
            state.accepting = false;
            log::info!("video pipeline paused, {} frames queued", state.frames.len());
            self.frames.shared.cond.notify_all();
        }
    }

    pub fn resume(&self) {
        let mut state = self.frames.shared.state.lock().unwrap();
        if state.running && state.paused {
            state.paused = false;
            state.accepting = true;
            log::info!("video pipeline resumed");
            self.frames.shared.cond.notify_all();
        }
    }

    /// Refuses new frames, encodes queued ones until the grace window runs
    /// out, then ends the stream and releases the encoder. Safe to repeat
    /// and to call on a pipeline that never started.
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            {
                let mut state = self.frames.shared.state.lock().unwrap();
                state.running = false;
                state.accepting = false;
                self.frames.shared.cond.notify_all();
            }
            if handle.join().is_err() {
                log::error!("video encoder thread panicked");
            }
            log::info!("video pipeline stopped");
        }
        if let Some(mut parts) = self.parts.take() {
            parts.core.release();
        }
    }

    fn encoder_loop(shared: Arc<VideoShared>, mut parts: VideoParts, stop_grace: Duration) {
        let mut nv12 = vec![0u8; semi_planar_size(parts.width, parts.height)];
        log::debug!(
            "video encoder loop started, {}x{}, encoder {}",
            parts.width,
            parts.height,
            parts.core.name()
        );

        loop {
            let frame = {
                let mut state = shared.state.lock().unwrap();
                while state.running && (state.paused || state.frames.is_empty()) {
                    log::trace!("video encoder loop waiting");
                    state = shared.cond.wait(state).unwrap();
                }
                if !state.running {
                    break;
                }
                state.frames.pop_front()
            };
            let Some(frame) = frame else {
                continue;
            };
            if !Self::encode_frame(&mut parts, &mut nv12, &frame) {
                shared.state.lock().unwrap().frames.push_front(frame);
            }
        }

        let deadline = Instant::now() + stop_grace;
        loop {
            let frame = shared.state.lock().unwrap().frames.pop_front();
            let Some(frame) = frame else {
                break;
            };
            if Instant::now() >= deadline {
                let mut state = shared.state.lock().unwrap();
                let dropped = state.frames.len() + 1;
                state.frames.clear();
                log::warn!("dropping {} video frames after stop grace", dropped);
                break;
            }
            if !Self::encode_frame(&mut parts, &mut nv12, &frame) {
                shared.state.lock().unwrap().frames.push_front(frame);
            }
        }
        parts.core.finish();
        log::debug!("video encoder loop finished");
    }

    /// Returns false when the encoder was busy and the frame must be retried.
    fn encode_frame(parts: &mut VideoParts, nv12: &mut [u8], frame: &[u8]) -> bool {
        if let Err(e) = nv21_to_nv12(frame, nv12, parts.width, parts.height) {
            log::warn!("dropping video frame: {:#}", e);
            return true;
        }
        match parts.core.encode(nv12) {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("video encode: {:#}", e);
                true
            }
        }
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "video_pipeline_test.rs"]
mod video_pipeline_test;
