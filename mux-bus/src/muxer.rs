use std::{
    collections::VecDeque,
    fmt::{Display, Formatter},
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    format::{MediaFormat, TrackKind},
    output::{ContainerWriter, SampleInfo},
    packet::CompressedSample,
};

/// Non-owning handle the encoder pipelines report into.
pub trait SampleSink: Send + Sync {
    /// Registers the output format of one track. Fails when the container
    /// rejects the format; the track can then never be written.
    fn add_track_format(&self, track: TrackKind, format: MediaFormat) -> anyhow::Result<()>;

    fn enqueue_sample(&self, sample: CompressedSample);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxerState {
    Uninitialized,
    Started,
    Stopped,
}

impl Display for MuxerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxerState::Uninitialized => write!(f, "uninitialized"),
            MuxerState::Started => write!(f, "started"),
            MuxerState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuxerStats {
    pub samples_written_audio: u64,
    pub samples_written_video: u64,
    pub write_failures: u64,
    /// Samples still queued when the stop grace window ran out.
    pub samples_dropped: u64,
}

struct MuxerInner {
    state: MuxerState,
    running: bool,
    audio_track: Option<usize>,
    video_track: Option<usize>,
    queue: VecDeque<CompressedSample>,
    fault: Option<String>,
    stats: MuxerStats,
}

impl MuxerInner {
    fn new() -> Self {
        Self {
            state: MuxerState::Uninitialized,
            running: false,
            audio_track: None,
            video_track: None,
            queue: VecDeque::new(),
            fault: None,
            stats: MuxerStats::default(),
        }
    }

    fn track_index(&self, track: TrackKind) -> Option<usize> {
        match track {
            TrackKind::Audio => self.audio_track,
            TrackKind::Video => self.video_track,
        }
    }

    fn tracks_registered(&self) -> bool {
        self.audio_track.is_some() && self.video_track.is_some()
    }

    fn record_fault(&mut self, fault: String) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }
}

/// State shared between the coordinator, its consumer thread and the
/// pipelines' sinks. Locks are always taken writer first, then inner.
struct MuxerShared {
    inner: Mutex<MuxerInner>,
    cond: Condvar,
    writer: Mutex<Option<Box<dyn ContainerWriter>>>,
}

impl MuxerShared {
    /// Starts the writer if both tracks are known and it never started.
    /// Caller holds both locks.
    fn start_writer_if_ready(
        writer: &mut Option<Box<dyn ContainerWriter>>,
        inner: &mut MuxerInner,
    ) -> anyhow::Result<bool> {
        if inner.state != MuxerState::Uninitialized || !inner.tracks_registered() {
            return Ok(false);
        }
        let Some(writer) = writer.as_mut() else {
            anyhow::bail!("no container writer attached");
        };
        writer.start()?;
        inner.state = MuxerState::Started;
        log::info!("muxer started");
        Ok(true)
    }

    fn consumer_loop(&self) {
        log::debug!("muxer consumer loop started");
        loop {
            let sample = {
                let mut inner = self.inner.lock().unwrap();
                while inner.running && (inner.state != MuxerState::Started || inner.queue.is_empty())
                {
                    log::trace!(
                        "muxer consumer waiting, state {}, {} queued",
                        inner.state,
                        inner.queue.len()
                    );
                    inner = self.cond.wait(inner).unwrap();
                }
                if !inner.running {
                    break;
                }
                match inner.queue.pop_front() {
                    Some(sample) => sample,
                    None => continue,
                }
            };
            self.write_sample(sample);
        }
        log::debug!("muxer consumer loop finished");
    }

    fn write_sample(&self, sample: CompressedSample) {
        let mut writer = self.writer.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if inner.state != MuxerState::Started {
            // paused between dequeue and write
            inner.queue.push_front(sample);
            return;
        }
        let Some(track_index) = inner.track_index(sample.track()) else {
            log::error!("dropping {} sample for unregistered track", sample.track());
            inner.stats.write_failures += 1;
            return;
        };
        let Some(out) = writer.as_mut() else {
            log::error!("dropping {} sample, no container writer", sample.track());
            inner.stats.write_failures += 1;
            return;
        };
        drop(inner);

        let info = SampleInfo {
            presentation_us: sample.presentation_us(),
            flags: sample.flags(),
            size: sample.size(),
        };
        let result = out.write_sample(track_index, sample.data(), &info);
        let track = sample.track();
        sample.release();

        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(()) => match track {
                TrackKind::Audio => inner.stats.samples_written_audio += 1,
                TrackKind::Video => inner.stats.samples_written_video += 1,
            },
            Err(e) => {
                log::error!(
                    "write {} sample at {}us failed: {:#}",
                    track,
                    info.presentation_us,
                    e
                );
                inner.stats.write_failures += 1;
            }
        }
        drop(writer);
        // stop() waits on the queue draining
        self.cond.notify_all();
    }
}

impl SampleSink for MuxerShared {
    fn add_track_format(&self, track: TrackKind, format: MediaFormat) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if inner.track_index(track).is_some() {
            log::warn!("{} track already registered, ignoring format {}", track, format);
            return Ok(());
        }

        let result = match writer.as_mut() {
            Some(out) => out.add_track(&format),
            None => Err(anyhow::anyhow!("no container writer attached")),
        };
        let index = match result {
            Ok(index) => index,
            Err(e) => {
                let e = e.context(format!("register {} track {}", track, format));
                inner.record_fault(format!("{:#}", e));
                return Err(e);
            }
        };
        match track {
            TrackKind::Audio => inner.audio_track = Some(index),
            TrackKind::Video => inner.video_track = Some(index),
        }
        log::info!("registered {} track #{}: {}", track, index, format);

        let started = Self::start_writer_if_ready(&mut writer, &mut inner);
        self.cond.notify_all();
        if let Err(e) = started {
            let e = e.context("start container");
            inner.record_fault(format!("{:#}", e));
            return Err(e);
        }
        Ok(())
    }

    fn enqueue_sample(&self, sample: CompressedSample) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(sample);
        if inner.state == MuxerState::Started {
            self.cond.notify_all();
        }
    }
}

/// The single consumer writing both tracks into one container.
///
/// A writer is attached per recording. Samples queue in arrival order and
/// are only written once both tracks have registered and the writer started.
pub struct MuxerCoordinator {
    shared: Arc<MuxerShared>,
    consumer: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl MuxerCoordinator {
    pub fn new(stop_grace: Duration) -> Self {
        Self {
            shared: Arc::new(MuxerShared {
                inner: Mutex::new(MuxerInner::new()),
                cond: Condvar::new(),
                writer: Mutex::new(None),
            }),
            consumer: None,
            stop_grace,
        }
    }

    pub fn attach_writer(&self, writer: Box<dyn ContainerWriter>) -> anyhow::Result<()> {
        let mut slot = self.shared.writer.lock().unwrap();
        if slot.is_some() {
            anyhow::bail!("a container writer is already attached");
        }
        *slot = Some(writer);
        Ok(())
    }

    /// Records a session level fault. The first fault wins.
    pub fn record_fault(&self, fault: String) {
        self.shared.inner.lock().unwrap().record_fault(fault);
    }

    pub fn sink(&self) -> Arc<dyn SampleSink> {
        self.shared.clone()
    }

    pub fn add_track_format(&self, track: TrackKind, format: MediaFormat) -> anyhow::Result<()> {
        self.shared.add_track_format(track, format)
    }

    pub fn enqueue_sample(&self, sample: CompressedSample) {
        self.shared.enqueue_sample(sample)
    }

    /// Starts the writer if both tracks are registered. Returns whether
    /// this call started it.
    pub fn request_start(&self) -> anyhow::Result<bool> {
        let mut writer = self.shared.writer.lock().unwrap();
        let mut inner = self.shared.inner.lock().unwrap();
        let started = MuxerShared::start_writer_if_ready(&mut writer, &mut inner)?;
        if started {
            self.shared.cond.notify_all();
        }
        Ok(started)
    }

    /// Spawns the consumer thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.consumer.is_some() {
            return Ok(());
        }
        self.shared.inner.lock().unwrap().running = true;
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("muxer".to_string())
            .spawn(move || shared.consumer_loop());
        match handle {
            Ok(handle) => {
                self.consumer = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.inner.lock().unwrap().running = false;
                Err(anyhow::anyhow!("spawn muxer thread: {}", e))
            }
        }
    }

    /// Suspends writing. Only meaningful once the writer started.
    pub fn pause(&self) {
        let mut writer = self.shared.writer.lock().unwrap();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != MuxerState::Started {
            log::info!("muxer pause ignored in state {}", inner.state);
            return;
        }
        if let Some(out) = writer.as_mut() {
            if let Err(e) = out.stop() {
                log::error!("pause container: {:#}", e);
            }
        }
        inner.state = MuxerState::Stopped;
        log::info!("muxer paused, {} queued", inner.queue.len());
    }

    pub fn resume(&self) {
        let mut writer = self.shared.writer.lock().unwrap();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != MuxerState::Stopped {
            log::info!("muxer resume ignored in state {}", inner.state);
            return;
        }
        let result = match writer.as_mut() {
            Some(out) => out.start(),
            None => Err(anyhow::anyhow!("no container writer attached")),
        };
        match result {
            Ok(()) => {
                inner.state = MuxerState::Started;
                log::info!("muxer resumed, {} queued", inner.queue.len());
                self.shared.cond.notify_all();
            }
            Err(e) => {
                log::error!("resume container: {:#}", e);
                inner.record_fault(format!("resume container: {:#}", e));
            }
        }
    }

    /// Drains what the grace window allows, stops the consumer, finalizes
    /// the writer and resets to `Uninitialized`. Returns what this
    /// recording wrote. Safe to call repeatedly.
    pub fn stop(&mut self) -> MuxerStats {
        {
            let deadline = Instant::now() + self.stop_grace;
            let mut inner = self.shared.inner.lock().unwrap();
            while self.consumer.is_some()
                && inner.state == MuxerState::Started
                && !inner.queue.is_empty()
            {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                inner = self.shared.cond.wait_timeout(inner, deadline - now).unwrap().0;
            }
            inner.running = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                log::error!("muxer consumer thread panicked");
            }
        }

        let mut writer = self.shared.writer.lock().unwrap();
        let mut inner = self.shared.inner.lock().unwrap();
        let leftover = std::mem::take(&mut inner.queue);
        if !leftover.is_empty() {
            log::warn!("dropping {} samples left after stop grace", leftover.len());
            inner.stats.samples_dropped += leftover.len() as u64;
        }
        drop(leftover);

        if let Some(mut out) = writer.take() {
            match out.release() {
                Ok(()) => log::info!("container finalized"),
                Err(e) => log::error!("finalize container: {:#}", e),
            }
        }

        let stats = std::mem::take(&mut inner.stats);
        *inner = MuxerInner::new();
        stats
    }

    pub fn state(&self) -> MuxerState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn tracks_registered(&self) -> bool {
        self.shared.inner.lock().unwrap().tracks_registered()
    }

    pub fn is_registered(&self, track: TrackKind) -> bool {
        self.shared.inner.lock().unwrap().track_index(track).is_some()
    }

    pub fn pending(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    pub fn stats(&self) -> MuxerStats {
        self.shared.inner.lock().unwrap().stats
    }

    pub fn fault(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().fault.clone()
    }
}

impl Drop for MuxerCoordinator {
    fn drop(&mut self) {
        if self.consumer.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
