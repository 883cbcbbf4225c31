use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context as _;

use crate::{
    backend::MediaBackend,
    clock::PresentationClock,
    codec::HardwareEncoder,
    config::{AudioSettings, TimingSettings},
    encoder::EncoderCore,
    format::TrackKind,
    muxer::SampleSink,
    source::AudioSource,
};

#[derive(Debug, Default)]
struct AudioState {
    running: bool,
    paused: bool,
}

#[derive(Default)]
struct AudioShared {
    state: Mutex<AudioState>,
    cond: Condvar,
}

struct AudioParts {
    core: EncoderCore,
    source: Box<dyn AudioSource>,
}

/// Microphone to encoder pipeline. Reads one capture buffer per encode
/// unit on its own thread. Without an encoder or source it stays inert.
pub struct AudioPipeline {
    shared: Arc<AudioShared>,
    parts: Option<AudioParts>,
    worker: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl AudioPipeline {
    pub fn new(
        backend: &dyn MediaBackend,
        settings: &AudioSettings,
        timing: &TimingSettings,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        let built = backend
            .create_encoder(&settings.mime)
            .context("select audio encoder")
            .and_then(|encoder| {
                let source = backend
                    .open_audio_source(settings)
                    .context("open audio source")?;
                Ok((encoder, source))
            });
        match built {
            Ok((encoder, source)) => Self::with_parts(encoder, source, settings, timing, sink),
            Err(e) => {
                log::error!("audio pipeline disabled: {:#}", e);
                Self::inert(timing)
            }
        }
    }

    /// Builds a pipeline around an already selected encoder and source.
    pub fn with_parts(
        mut encoder: Box<dyn HardwareEncoder>,
        mut source: Box<dyn AudioSource>,
        settings: &AudioSettings,
        timing: &TimingSettings,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        let format = settings.format();
        if let Err(e) = encoder.configure(&format) {
            log::error!(
                "audio pipeline disabled, {} rejected {}: {:#}",
                encoder.name(),
                format,
                e
            );
            encoder.release();
            source.release();
            return Self::inert(timing);
        }
        let core = EncoderCore::new(
            TrackKind::Audio,
            encoder,
            sink,
            PresentationClock::monotonic(),
            timing.codec_timeout(),
        );
        Self {
            shared: Arc::new(AudioShared::default()),
            parts: Some(AudioParts { core, source }),
            worker: None,
            stop_grace: timing.encoder_stop_grace(),
        }
    }

    fn inert(timing: &TimingSettings) -> Self {
        Self {
            shared: Arc::new(AudioShared::default()),
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

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut parts) = self.parts.take() else {
            log::warn!("audio pipeline has no encoder, start ignored");
            return Ok(());
        };

        let started = parts
            .source
            .start()
            .context("start audio source")
            .and_then(|_| parts.core.start().context("start audio encoder"));
        if let Err(e) = started {
            parts.source.release();
            parts.core.release();
            return Err(e);
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = true;
            state.paused = false;
        }
        let shared = self.shared.clone();
        let stop_grace = self.stop_grace;
        let handle = std::thread::Builder::new()
            .name("audio-encoder".to_string())
            .spawn(move || Self::encoder_loop(shared, parts, stop_grace));
        match handle {
            Ok(handle) => {
                log::info!("audio pipeline started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().unwrap().running = false;
                Err(anyhow::anyhow!("spawn audio encoder thread: {}", e))
            }
        }
    }

    pub fn pause(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.running && !state.paused {
            state.paused = true;
            log::info!("audio pipeline paused");
            self.shared.cond.notify_all();
        }
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.running && state.paused {
            state.paused = false;
            log::info!("audio pipeline resumed");
            self.shared.cond.notify_all();
        }
    }

    /// Stops capture, encodes what was already read within the grace window,
    /// then ends the stream and releases the encoder. Safe to repeat and to
    /// call on a pipeline that never started.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("audio encoder thread panicked");
            }
            log::info!("audio pipeline stopped");
        }
        if let Some(mut parts) = self.parts.take() {
            parts.source.release();
            parts.core.release();
        }
    }

    fn encoder_loop(shared: Arc<AudioShared>, mut parts: AudioParts, stop_grace: Duration) {
        let mut buf = vec![0u8; parts.source.min_buffer_size().max(2)];
        log::debug!(
            "audio encoder loop started, {} byte reads, encoder {}",
            buf.len(),
            parts.core.name()
        );
        // bytes read but not yet accepted by a busy encoder
        let mut pending: Option<usize> = None;
        let mut source_stopped = false;

        loop {
            {
                let state = shared.state.lock().unwrap();
                if !state.running {
                    break;
                }
                if state.paused {
                    drop(state);
                    if !source_stopped {
                        if let Err(e) = parts.source.stop() {
                            log::warn!("stop audio source: {:#}", e);
                        }
                        source_stopped = true;
                    }
                    let mut state = shared.state.lock().unwrap();
                    while state.running && state.paused {
                        log::trace!("audio encoder loop suspended");
                        state = shared.cond.wait(state).unwrap();
                    }
                    log::trace!("audio encoder loop woke up");
                    continue;
                }
            }

            if source_stopped {
                if let Err(e) = parts.source.start() {
                    log::error!("restart audio source: {:#}", e);
                    std::thread::sleep(parts.core.timeout());
                    continue;
                }
                source_stopped = false;
            }

            let len = match pending.take() {
                Some(len) => len,
                None => match parts.source.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(len) => len,
                    Err(e) => {
                        log::warn!("read audio source: {:#}", e);
                        std::thread::sleep(parts.core.timeout());
                        continue;
                    }
                },
            };
            match parts.core.encode(&buf[..len]) {
                Ok(true) => {}
                Ok(false) => pending = Some(len),
                Err(e) => log::error!("audio encode: {:#}", e),
            }
        }

        if !source_stopped {
            if let Err(e) = parts.source.stop() {
                log::warn!("stop audio source: {:#}", e);
            }
        }
        parts.source.release();

        let deadline = Instant::now() + stop_grace;
        while let Some(len) = pending.take() {
            match parts.core.encode(&buf[..len]) {
                Ok(false) if Instant::now() < deadline => pending = Some(len),
                Ok(false) => log::warn!("dropping {} audio bytes after stop grace", len),
                Ok(true) => {}
                Err(e) => log::error!("audio encode: {:#}", e),
            }
        }
        parts.core.finish();
        log::debug!("audio encoder loop finished");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "audio_pipeline_test.rs"]
mod audio_pipeline_test;
