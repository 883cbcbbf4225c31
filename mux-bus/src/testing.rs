//! Scripted collaborators for the pipeline, muxer and session tests.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    backend::MediaBackend,
    clock::TimeSource,
    codec::{HardwareEncoder, InputStatus, OutputEvent},
    config::AudioSettings,
    format::{MediaFormat, TrackKind},
    muxer::SampleSink,
    output::{
        ContainerWriter, FRAMED_MAGIC, SampleInfo, TAG_END, TAG_PAUSE, TAG_RESUME, TAG_SAMPLE,
        TAG_TRACK,
    },
    packet::{CompressedSample, EncodedBuffer, SampleFlags},
    passthrough::PassthroughEncoder,
    source::AudioSource,
};

/// Polls `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Raw clock reading from a fixed list, repeating the last value once the
/// list runs out.
pub(crate) struct ScriptedTime {
    values: VecDeque<i64>,
    last: i64,
}

impl ScriptedTime {
    pub(crate) fn new(values: &[i64]) -> Self {
        Self {
            values: values.iter().copied().collect(),
            last: 0,
        }
    }
}

impl TimeSource for ScriptedTime {
    fn now_us(&mut self) -> i64 {
        if let Some(value) = self.values.pop_front() {
            self.last = value;
        }
        self.last
    }
}

/// Sink keeping every registration and sample it is handed.
#[derive(Default)]
pub(crate) struct CollectingSink {
    formats: Mutex<Vec<(TrackKind, MediaFormat)>>,
    samples: Mutex<Vec<CompressedSample>>,
    reject_formats: bool,
}

impl CollectingSink {
    pub(crate) fn rejecting_formats() -> Self {
        Self {
            reject_formats: true,
            ..Default::default()
        }
    }

    pub(crate) fn formats(&self) -> Vec<(TrackKind, MediaFormat)> {
        self.formats.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.data().to_vec())
            .collect()
    }

    pub(crate) fn timestamps(&self) -> Vec<i64> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.presentation_us())
            .collect()
    }

    /// Releases every collected sample back to its encoder.
    pub(crate) fn release_all(&self) -> usize {
        let samples = std::mem::take(&mut *self.samples.lock().unwrap());
        let n = samples.len();
        samples.into_iter().for_each(CompressedSample::release);
        n
    }

    pub(crate) fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= n)
    }
}

impl SampleSink for CollectingSink {
    fn add_track_format(&self, track: TrackKind, format: MediaFormat) -> anyhow::Result<()> {
        if self.reject_formats {
            anyhow::bail!("format rejected");
        }
        self.formats.lock().unwrap().push((track, format));
        Ok(())
    }

    fn enqueue_sample(&self, sample: CompressedSample) {
        self.samples.lock().unwrap().push(sample);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriterOp {
    AddTrack(TrackKind),
    Start,
    Sample {
        track: usize,
        presentation_us: i64,
        flags: SampleFlags,
        data: Vec<u8>,
    },
    Stop,
    Release,
}

#[derive(Clone, Default)]
pub(crate) struct WriterProbe(Arc<Mutex<Vec<WriterOp>>>);

impl WriterProbe {
    pub(crate) fn ops(&self) -> Vec<WriterOp> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, op: WriterOp) {
        self.0.lock().unwrap().push(op);
    }

    pub(crate) fn samples(&self) -> Vec<(usize, i64, Vec<u8>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WriterOp::Sample {
                    track,
                    presentation_us,
                    data,
                    ..
                } => Some((track, presentation_us, data)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, wanted: &WriterOp) -> usize {
        self.ops().iter().filter(|op| *op == wanted).count()
    }

    pub(crate) fn wait_for_samples(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.samples().len() >= n)
    }
}

/// Container writer that records every call. Enforces the same ordering
/// rules as a real container.
pub(crate) struct RecordingWriter {
    probe: WriterProbe,
    tracks: usize,
    started: bool,
    released: bool,
    fail_add_track: bool,
    fail_writes: bool,
    write_delay: Duration,
}

impl RecordingWriter {
    pub(crate) fn new(probe: &WriterProbe) -> Self {
        Self {
            probe: probe.clone(),
            tracks: 0,
            started: false,
            released: false,
            fail_add_track: false,
            fail_writes: false,
            write_delay: Duration::ZERO,
        }
    }

    pub(crate) fn failing_add_track(mut self) -> Self {
        self.fail_add_track = true;
        self
    }

    pub(crate) fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub(crate) fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }
}

impl ContainerWriter for RecordingWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        if self.fail_add_track {
            anyhow::bail!("format rejected: {}", format);
        }
        if self.started {
            anyhow::bail!("add_track after start");
        }
        self.probe.push(WriterOp::AddTrack(format.kind()));
        self.tracks += 1;
        Ok(self.tracks - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.tracks == 0 || self.released {
            anyhow::bail!("start without tracks or after release");
        }
        self.started = true;
        self.probe.push(WriterOp::Start);
        Ok(())
    }

    fn write_sample(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        if !self.started {
            anyhow::bail!("write while not started");
        }
        if self.fail_writes {
            anyhow::bail!("write rejected");
        }
        self.probe.push(WriterOp::Sample {
            track: track_index,
            presentation_us: info.presentation_us,
            flags: info.flags,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("stop while not started");
        }
        self.started = false;
        self.probe.push(WriterOp::Stop);
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        if !self.released {
            self.released = true;
            self.started = false;
            self.probe.push(WriterOp::Release);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct EncoderLog {
    pub(crate) inputs: Vec<(Vec<u8>, i64, bool)>,
    pub(crate) released_slots: Vec<usize>,
    pub(crate) busy_answers: usize,
    pub(crate) stopped: bool,
    pub(crate) released: bool,
}

#[derive(Clone, Default)]
pub(crate) struct EncoderProbe(Arc<Mutex<EncoderLog>>);

impl EncoderProbe {
    pub(crate) fn with<R>(&self, f: impl FnOnce(&EncoderLog) -> R) -> R {
        f(&self.0.lock().unwrap())
    }

    pub(crate) fn data_inputs(&self) -> Vec<Vec<u8>> {
        self.with(|log| {
            log.inputs
                .iter()
                .filter(|(_, _, eos)| !eos)
                .map(|(data, _, _)| data.clone())
                .collect()
        })
    }
}

/// Encoder answering from a script. Once the script runs dry it echoes
/// each accepted input as one output unit, then an empty end-of-stream
/// unit after the end-of-stream input.
/// Holds `submit_input` calls until opened.
#[derive(Clone, Default)]
pub(crate) struct SubmitGate(Arc<(Mutex<GateState>, Condvar)>);

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl SubmitGate {
    fn pass(&self) {
        let (state, cond) = &*self.0;
        let mut state = state.lock().unwrap();
        state.waiting += 1;
        cond.notify_all();
        while !state.open {
            state = cond.wait(state).unwrap();
        }
        state.waiting -= 1;
    }

    /// Waits until a caller is parked at the gate.
    pub(crate) fn wait_for_caller(&self, timeout: Duration) -> bool {
        let (state, cond) = &*self.0;
        let state = state.lock().unwrap();
        let (state, _) = cond
            .wait_timeout_while(state, timeout, |s| s.waiting == 0)
            .unwrap();
        state.waiting > 0
    }

    pub(crate) fn open(&self) {
        let (state, cond) = &*self.0;
        state.lock().unwrap().open = true;
        cond.notify_all();
    }
}

pub(crate) struct ScriptedEncoder {
    probe: EncoderProbe,
    gate: Option<SubmitGate>,
    script: VecDeque<OutputEvent>,
    echo: VecDeque<(Bytes, i64)>,
    busy: usize,
    next_index: usize,
    eos_pending: bool,
    fail_configure: bool,
}

impl ScriptedEncoder {
    pub(crate) fn new(probe: &EncoderProbe) -> Self {
        Self {
            probe: probe.clone(),
            gate: None,
            script: VecDeque::new(),
            echo: VecDeque::new(),
            busy: 0,
            next_index: 0,
            eos_pending: false,
            fail_configure: false,
        }
    }

    pub(crate) fn with_event(mut self, event: OutputEvent) -> Self {
        self.script.push_back(event);
        self
    }

    /// Answers `Busy` to the next `n` inputs.
    pub(crate) fn busy_for(mut self, n: usize) -> Self {
        self.busy = n;
        self
    }

    /// Parks every `submit_input` at `gate` until it opens.
    pub(crate) fn gated(mut self, gate: &SubmitGate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub(crate) fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    fn ready(&mut self, data: Bytes, presentation_us: i64, flags: SampleFlags) -> OutputEvent {
        let index = self.next_index;
        self.next_index += 1;
        OutputEvent::Ready(EncodedBuffer::new(index, data, presentation_us, flags))
    }
}

impl HardwareEncoder for ScriptedEncoder {
    fn name(&self) -> &str {
        "scripted"
    }

    fn configure(&mut self, _format: &MediaFormat) -> anyhow::Result<()> {
        if self.fail_configure {
            anyhow::bail!("configure rejected");
        }
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn submit_input(
        &mut self,
        data: &[u8],
        presentation_us: i64,
        end_of_stream: bool,
        _timeout: Duration,
    ) -> anyhow::Result<InputStatus> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        let mut log = self.probe.0.lock().unwrap();
        if self.busy > 0 && !end_of_stream {
            self.busy -= 1;
            log.busy_answers += 1;
            return Ok(InputStatus::Busy);
        }
        log.inputs
            .push((data.to_vec(), presentation_us, end_of_stream));
        if end_of_stream {
            self.eos_pending = true;
        } else {
            self.echo
                .push_back((Bytes::copy_from_slice(data), presentation_us));
        }
        Ok(InputStatus::Accepted)
    }

    fn poll_output(&mut self, _timeout: Duration) -> anyhow::Result<OutputEvent> {
        if let Some(event) = self.script.pop_front() {
            return Ok(event);
        }
        if let Some((data, presentation_us)) = self.echo.pop_front() {
            return Ok(self.ready(data, presentation_us, SampleFlags::empty()));
        }
        if self.eos_pending {
            self.eos_pending = false;
            return Ok(self.ready(Bytes::new(), 0, SampleFlags::END_OF_STREAM));
        }
        Ok(OutputEvent::NotReady)
    }

    fn release_output(&mut self, index: usize) {
        self.probe.0.lock().unwrap().released_slots.push(index);
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.probe.0.lock().unwrap().stopped = true;
        Ok(())
    }

    fn release(&mut self) {
        self.probe.0.lock().unwrap().released = true;
    }
}

#[derive(Debug, Default)]
pub(crate) struct SourceLog {
    pub(crate) reads: usize,
    pub(crate) starts: usize,
    pub(crate) stops: usize,
    pub(crate) released: bool,
}

#[derive(Clone, Default)]
pub(crate) struct SourceProbe(Arc<Mutex<SourceLog>>);

impl SourceProbe {
    pub(crate) fn with<R>(&self, f: impl FnOnce(&SourceLog) -> R) -> R {
        f(&self.0.lock().unwrap())
    }
}

/// PCM source returning the same chunk once per period while started.
pub(crate) struct ScriptedSource {
    probe: SourceProbe,
    chunk: Vec<u8>,
    period: Duration,
    started: bool,
}

impl ScriptedSource {
    pub(crate) fn new(probe: &SourceProbe, chunk: Vec<u8>, period: Duration) -> Self {
        Self {
            probe: probe.clone(),
            chunk,
            period,
            started: false,
        }
    }
}

impl AudioSource for ScriptedSource {
    fn start(&mut self) -> anyhow::Result<()> {
        self.started = true;
        self.probe.0.lock().unwrap().starts += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        std::thread::sleep(self.period);
        if !self.started {
            return Ok(0);
        }
        self.probe.0.lock().unwrap().reads += 1;
        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk[..n]);
        Ok(n)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        self.probe.0.lock().unwrap().stops += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.probe.0.lock().unwrap().released = true;
    }

    fn min_buffer_size(&self) -> usize {
        self.chunk.len()
    }
}

/// Backend wiring passthrough encoders to a recording writer and a
/// scripted source, with switches for each configuration failure.
#[derive(Default)]
pub(crate) struct TestBackend {
    pub(crate) writer: WriterProbe,
    pub(crate) source: SourceProbe,
    pub(crate) missing_mimes: Vec<String>,
    pub(crate) fail_writer: bool,
    pub(crate) fail_add_track: bool,
    pub(crate) write_delay: Duration,
}

impl MediaBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    fn create_encoder(&self, mime: &str) -> anyhow::Result<Box<dyn HardwareEncoder>> {
        if self.missing_mimes.iter().any(|m| m == mime) {
            anyhow::bail!("no encoder for {}", mime);
        }
        Ok(Box::new(PassthroughEncoder::new(mime, 8)?))
    }

    fn create_writer(&self, _path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        if self.fail_writer {
            anyhow::bail!("cannot create container");
        }
        let mut writer = RecordingWriter::new(&self.writer).with_write_delay(self.write_delay);
        if self.fail_add_track {
            writer = writer.failing_add_track();
        }
        Ok(Box::new(writer))
    }

    fn open_audio_source(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSource>> {
        let chunk = vec![0x11; (settings.sample_rate as usize / 100) * 2];
        Ok(Box::new(ScriptedSource::new(
            &self.source,
            chunk,
            Duration::from_millis(5),
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FramedRecord {
    Track {
        kind: u8,
        mime: String,
    },
    Sample {
        track: u8,
        flags: u32,
        presentation_us: i64,
        data: Vec<u8>,
    },
    Pause,
    Resume,
    End,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            anyhow::bail!("truncated at {}", self.pos);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into()?))
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into()?))
    }

    fn i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into()?))
    }
}

/// Parses a file produced by `FramedWriter`.
pub(crate) fn read_framed(path: &Path) -> anyhow::Result<Vec<FramedRecord>> {
    let buf = std::fs::read(path)?;
    let mut cur = Cursor { buf: &buf, pos: 0 };
    if cur.take(4)? != FRAMED_MAGIC {
        anyhow::bail!("bad magic");
    }
    let mut records = Vec::new();
    let tracks = cur.u8()?;
    for _ in 0..tracks {
        if cur.u8()? != TAG_TRACK {
            anyhow::bail!("expected track record");
        }
        let kind = cur.u8()?;
        let mime_len = cur.u16()? as usize;
        let mime = String::from_utf8(cur.take(mime_len)?.to_vec())?;
        cur.take(8)?;
        // audio: rate u32 + channels u16, video: width, height, fps as u32
        if kind == TrackKind::Audio.as_u8() {
            cur.take(6)?;
        } else {
            cur.take(12)?;
        }
        for _ in 0..cur.u8()? {
            let len = cur.u32()? as usize;
            cur.take(len)?;
        }
        records.push(FramedRecord::Track { kind, mime });
    }
    while cur.pos < buf.len() {
        let record = match cur.u8()? {
            TAG_SAMPLE => {
                let track = cur.u8()?;
                let flags = cur.u32()?;
                let presentation_us = cur.i64()?;
                let len = cur.u32()? as usize;
                let data = cur.take(len)?.to_vec();
                FramedRecord::Sample {
                    track,
                    flags,
                    presentation_us,
                    data,
                }
            }
            TAG_PAUSE => FramedRecord::Pause,
            TAG_RESUME => FramedRecord::Resume,
            TAG_END => FramedRecord::End,
            tag => anyhow::bail!("unknown record tag {:#x}", tag),
        };
        records.push(record);
    }
    Ok(records)
}
