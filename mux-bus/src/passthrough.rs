use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;

use crate::{
    codec::{HardwareEncoder, InputStatus, OutputEvent},
    format::{FormatParams, MIME_AAC, MIME_AVC, MIME_RAW_AUDIO, MIME_RAW_VIDEO, MediaFormat},
    packet::{EncodedBuffer, SampleFlags},
};

pub const DEFAULT_OUTPUT_SLOTS: usize = 8;

pub fn is_supported_mime(mime: &str) -> bool {
    matches!(mime, MIME_RAW_AUDIO | MIME_RAW_VIDEO | MIME_AAC | MIME_AVC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Configured,
    Running,
    Stopped,
    Released,
}

/// Software encoder with the same stateful contract as a hardware one:
/// a fixed pool of output slots, a format report once running, a codec
/// configuration unit, then one output unit per input. The payload is the
/// raw input untouched.
pub struct PassthroughEncoder {
    name: String,
    mime: String,
    phase: Phase,
    format: Option<MediaFormat>,
    held: Vec<bool>,
    pending: VecDeque<(Bytes, i64, SampleFlags)>,
    format_reported: bool,
    config_emitted: bool,
    eos_submitted: bool,
    eos_emitted: bool,
}

impl PassthroughEncoder {
    pub fn new(mime: &str, output_slots: usize) -> anyhow::Result<Self> {
        if !is_supported_mime(mime) {
            anyhow::bail!("no passthrough encoder for mime {}", mime);
        }
        if output_slots == 0 {
            anyhow::bail!("passthrough encoder needs at least one output slot");
        }
        Ok(Self {
            name: format!("passthrough:{}", mime),
            mime: mime.to_string(),
            phase: Phase::Created,
            format: None,
            held: vec![false; output_slots],
            pending: VecDeque::new(),
            format_reported: false,
            config_emitted: false,
            eos_submitted: false,
            eos_emitted: false,
        })
    }

    fn held_count(&self) -> usize {
        self.held.iter().filter(|h| **h).count()
    }

    fn take_slot(&mut self) -> Option<usize> {
        let index = self.held.iter().position(|h| !h)?;
        self.held[index] = true;
        Some(index)
    }

    fn is_video(&self) -> bool {
        matches!(
            self.format.as_ref().map(|f| &f.params),
            Some(FormatParams::Video { .. })
        )
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.format.as_ref().map(|f| {
            let mut out = f.clone();
            out.mime = self.mime.clone();
            out.csd = vec![Bytes::from(self.mime.clone().into_bytes())];
            out
        })
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        if self.phase != Phase::Running {
            anyhow::bail!("{} is not running ({:?})", self.name, self.phase);
        }
        Ok(())
    }
}

impl HardwareEncoder for PassthroughEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()> {
        if !matches!(self.phase, Phase::Created | Phase::Stopped | Phase::Configured) {
            anyhow::bail!("{} cannot be configured in {:?}", self.name, self.phase);
        }
        if let Some((width, height)) = format.dimensions() {
            if width == 0 || height == 0 {
                anyhow::bail!("invalid video size {}x{}", width, height);
            }
        }
        self.format = Some(format.clone());
        self.phase = Phase::Configured;
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.phase != Phase::Configured {
            anyhow::bail!("{} must be configured before start", self.name);
        }
        self.phase = Phase::Running;
        self.format_reported = false;
        self.config_emitted = false;
        self.eos_submitted = false;
        self.eos_emitted = false;
        Ok(())
    }

    fn submit_input(
        &mut self,
        data: &[u8],
        presentation_us: i64,
        end_of_stream: bool,
        timeout: Duration,
    ) -> anyhow::Result<InputStatus> {
        self.ensure_running()?;
        if self.eos_submitted {
            anyhow::bail!("{} input after end of stream", self.name);
        }
        if end_of_stream {
            self.eos_submitted = true;
            return Ok(InputStatus::Accepted);
        }
        if self.pending.len() + self.held_count() >= self.held.len() {
            std::thread::sleep(timeout);
            return Ok(InputStatus::Busy);
        }
        let flags = if self.is_video() {
            SampleFlags::KEY_FRAME
        } else {
            SampleFlags::empty()
        };
        self.pending
            .push_back((Bytes::copy_from_slice(data), presentation_us, flags));
        Ok(InputStatus::Accepted)
    }

    fn poll_output(&mut self, timeout: Duration) -> anyhow::Result<OutputEvent> {
        self.ensure_running()?;
        if !self.format_reported {
            self.format_reported = true;
            if let Some(format) = self.output_format() {
                return Ok(OutputEvent::FormatChanged(format));
            }
        }

        let next = if !self.config_emitted {
            let csd = Bytes::from(self.mime.clone().into_bytes());
            Some((csd, 0, SampleFlags::CODEC_CONFIG))
        } else if let Some(front) = self.pending.front() {
            Some(front.clone())
        } else if self.eos_submitted && !self.eos_emitted {
            Some((Bytes::new(), 0, SampleFlags::END_OF_STREAM))
        } else {
            None
        };

        let Some((data, presentation_us, flags)) = next else {
            std::thread::sleep(timeout);
            return Ok(OutputEvent::NotReady);
        };
        let Some(index) = self.take_slot() else {
            std::thread::sleep(timeout);
            return Ok(OutputEvent::NotReady);
        };

        if flags.contains(SampleFlags::CODEC_CONFIG) {
            self.config_emitted = true;
        } else if flags.contains(SampleFlags::END_OF_STREAM) {
            self.eos_emitted = true;
        } else {
            self.pending.pop_front();
        }
        Ok(OutputEvent::Ready(EncodedBuffer::new(
            index,
            data,
            presentation_us,
            flags,
        )))
    }

    fn release_output(&mut self, index: usize) {
        match self.held.get_mut(index) {
            Some(held) if *held => *held = false,
            _ => log::warn!("{} release of unknown output slot {}", self.name, index),
        }
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.phase == Phase::Released {
            anyhow::bail!("{} already released", self.name);
        }
        self.pending.clear();
        self.held.iter_mut().for_each(|h| *h = false);
        self.phase = Phase::Stopped;
        Ok(())
    }

    fn release(&mut self) {
        self.pending.clear();
        self.phase = Phase::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn running(mime: &str, format: MediaFormat, slots: usize) -> PassthroughEncoder {
        let mut encoder = PassthroughEncoder::new(mime, slots).unwrap();
        encoder.configure(&format).unwrap();
        encoder.start().unwrap();
        encoder
    }

    fn ready(event: OutputEvent) -> EncodedBuffer {
        match event {
            OutputEvent::Ready(buffer) => buffer,
            other => panic!("Expected ready output, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_mime_is_rejected() {
        assert!(PassthroughEncoder::new("video/hevc", 4).is_err());
        assert!(PassthroughEncoder::new(MIME_AVC, 0).is_err());
    }

    #[test]
    fn test_format_then_config_then_units() {
        let mut encoder = running(MIME_AVC, MediaFormat::video(MIME_AVC, 4, 2), 4);
        assert_eq!(
            encoder.submit_input(b"raw", 10, false, NO_WAIT).unwrap(),
            InputStatus::Accepted
        );

        match encoder.poll_output(NO_WAIT).unwrap() {
            OutputEvent::FormatChanged(format) => {
                assert_eq!(format.mime, MIME_AVC);
                assert_eq!(format.csd.len(), 1);
            }
            other => panic!("Expected format change, got {:?}", other),
        }
        let config = ready(encoder.poll_output(NO_WAIT).unwrap());
        assert!(config.flags.contains(SampleFlags::CODEC_CONFIG));
        let unit = ready(encoder.poll_output(NO_WAIT).unwrap());
        assert_eq!(&unit.data[..], b"raw");
        assert_eq!(unit.presentation_us, 10);
        assert!(unit.flags.contains(SampleFlags::KEY_FRAME));
        assert!(matches!(
            encoder.poll_output(NO_WAIT).unwrap(),
            OutputEvent::NotReady
        ));
    }

    #[test]
    fn test_busy_until_slots_released() {
        let mut encoder = running(MIME_AAC, MediaFormat::audio(MIME_AAC, 8000, 1), 2);
        encoder.poll_output(NO_WAIT).unwrap();
        let config = ready(encoder.poll_output(NO_WAIT).unwrap());
        assert!(!config.flags.contains(SampleFlags::KEY_FRAME));

        // one slot held by the config unit, one free
        assert_eq!(
            encoder.submit_input(b"a", 0, false, NO_WAIT).unwrap(),
            InputStatus::Accepted
        );
        assert_eq!(
            encoder.submit_input(b"b", 1, false, NO_WAIT).unwrap(),
            InputStatus::Busy
        );
        encoder.release_output(config.index);
        assert_eq!(
            encoder.submit_input(b"b", 1, false, NO_WAIT).unwrap(),
            InputStatus::Accepted
        );
    }

    #[test]
    fn test_end_of_stream_unit_is_empty() {
        let mut encoder = running(MIME_RAW_AUDIO, MediaFormat::audio(MIME_RAW_AUDIO, 8000, 1), 4);
        encoder.submit_input(&[], 0, true, NO_WAIT).unwrap();
        encoder.poll_output(NO_WAIT).unwrap();
        ready(encoder.poll_output(NO_WAIT).unwrap());
        let eos = ready(encoder.poll_output(NO_WAIT).unwrap());
        assert!(eos.flags.contains(SampleFlags::END_OF_STREAM));
        assert_eq!(eos.size(), 0);
        assert!(encoder.submit_input(b"late", 0, false, NO_WAIT).is_err());
    }

    #[test]
    fn test_lifecycle_is_enforced() {
        let mut encoder = PassthroughEncoder::new(MIME_AVC, 4).unwrap();
        assert!(encoder.start().is_err());
        assert!(encoder.poll_output(NO_WAIT).is_err());
        assert!(
            encoder
                .configure(&MediaFormat::video(MIME_AVC, 0, 10))
                .is_err()
        );
        encoder.configure(&MediaFormat::video(MIME_AVC, 2, 2)).unwrap();
        encoder.start().unwrap();
        encoder.stop().unwrap();
        encoder.release();
        assert!(encoder.stop().is_err());
    }
}
