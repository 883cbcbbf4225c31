use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use crate::{
    clock::PresentationClock,
    codec::{HardwareEncoder, InputStatus, OutputEvent},
    format::TrackKind,
    muxer::SampleSink,
    packet::{CompressedSample, EncodedBuffer, ReleaseHandle, SampleFlags},
};

/// Attempts at handing the end-of-stream flag to a busy encoder.
const EOS_SUBMIT_ATTEMPTS: usize = 10;
/// Consecutive empty polls after which the end-of-stream unit is given up on.
const EOS_IDLE_POLLS: usize = 10;

/// Drives one encoder for a pipeline thread: submits raw units, drains
/// output, stamps presentation time and forwards to the sink. Output slots
/// lent to the sink come back over `release_rx` and are returned to the
/// encoder before the next submit or poll.
pub(crate) struct EncoderCore {
    track: TrackKind,
    encoder: Box<dyn HardwareEncoder>,
    sink: Arc<dyn SampleSink>,
    clock: PresentationClock,
    timeout: Duration,
    release_tx: mpsc::Sender<usize>,
    release_rx: mpsc::Receiver<usize>,
    eos_seen: bool,
    emitted: u64,
}

impl EncoderCore {
    pub(crate) fn new(
        track: TrackKind,
        encoder: Box<dyn HardwareEncoder>,
        sink: Arc<dyn SampleSink>,
        clock: PresentationClock,
        timeout: Duration,
    ) -> Self {
        let (release_tx, release_rx) = mpsc::channel();
        Self {
            track,
            encoder,
            sink,
            clock,
            timeout,
            release_tx,
            release_rx,
            eos_seen: false,
            emitted: 0,
        }
    }

    pub(crate) fn set_clock(&mut self, clock: PresentationClock) {
        self.clock = clock;
    }

    pub(crate) fn name(&self) -> &str {
        self.encoder.name()
    }

    pub(crate) fn start(&mut self) -> anyhow::Result<()> {
        self.eos_seen = false;
        self.encoder.start()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    fn reclaim(&mut self) {
        while let Ok(index) = self.release_rx.try_recv() {
            self.encoder.release_output(index);
        }
    }

    /// Feeds one raw unit, an empty unit meaning end of stream, then drains
    /// everything the encoder has ready. Returns false when the encoder had
    /// no input slot; the caller keeps the unit and retries.
    pub(crate) fn encode(&mut self, data: &[u8]) -> anyhow::Result<bool> {
        self.reclaim();
        let presentation_us = self.clock.input_timestamp();
        let status =
            self.encoder
                .submit_input(data, presentation_us, data.is_empty(), self.timeout)?;
        self.drain()?;
        Ok(status == InputStatus::Accepted)
    }

    pub(crate) fn drain(&mut self) -> anyhow::Result<()> {
        loop {
            self.reclaim();
            let event = self.encoder.poll_output(self.timeout)?;
            if !self.handle_event(event) {
                break;
            }
        }
        Ok(())
    }

    /// Returns false once the encoder has nothing more ready.
    fn handle_event(&mut self, event: OutputEvent) -> bool {
        match event {
            OutputEvent::NotReady => return false,
            OutputEvent::BuffersChanged => {
                log::debug!("{} encoder output buffers changed", self.track);
            }
            OutputEvent::FormatChanged(format) => {
                log::info!("{} encoder output format: {}", self.track, format);
                if let Err(e) = self.sink.add_track_format(self.track, format) {
                    log::error!("{} track registration failed: {:#}", self.track, e);
                }
            }
            OutputEvent::Ready(buffer) => self.forward(buffer),
        }
        true
    }

    fn forward(&mut self, buffer: EncodedBuffer) {
        if buffer.flags.contains(SampleFlags::END_OF_STREAM) {
            self.eos_seen = true;
        }
        if buffer.flags.contains(SampleFlags::CODEC_CONFIG) || buffer.size() == 0 {
            // config travels in the track format's csd
            self.encoder.release_output(buffer.index);
            return;
        }
        let presentation_us = self.clock.output_timestamp();
        let sample = CompressedSample::new(self.track, buffer.data, presentation_us, buffer.flags)
            .with_owner(ReleaseHandle::new(buffer.index, self.release_tx.clone()));
        self.emitted += 1;
        self.sink.enqueue_sample(sample);
    }

    /// Signals end of stream, drains the tail, then stops and releases the
    /// encoder. Never fails: teardown problems are logged.
    pub(crate) fn finish(&mut self) {
        let mut submitted = false;
        for _ in 0..EOS_SUBMIT_ATTEMPTS {
            match self.encode(&[]) {
                Ok(true) => {
                    submitted = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("{} end of stream not accepted: {:#}", self.track, e);
                    break;
                }
            }
        }

        let mut idle = 0;
        while submitted && !self.eos_seen && idle < EOS_IDLE_POLLS {
            self.reclaim();
            match self.encoder.poll_output(self.timeout) {
                Ok(OutputEvent::NotReady) => idle += 1,
                Ok(event) => {
                    idle = 0;
                    self.handle_event(event);
                }
                Err(e) => {
                    log::warn!("{} drain after end of stream: {:#}", self.track, e);
                    break;
                }
            }
        }
        if submitted && !self.eos_seen {
            log::warn!("{} encoder never reported end of stream", self.track);
        }

        self.reclaim();
        if let Err(e) = self.encoder.stop() {
            log::warn!("{} encoder stop: {:#}", self.track, e);
        }
        self.encoder.release();
        log::info!(
            "{} encoder {} finished, {} samples emitted",
            self.track,
            self.encoder.name(),
            self.emitted
        );
    }

    /// Releases an encoder that never started.
    pub(crate) fn release(&mut self) {
        self.encoder.release();
    }
}
