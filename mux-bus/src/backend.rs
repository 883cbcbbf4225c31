use std::path::Path;

use crate::{
    codec::HardwareEncoder,
    config::AudioSettings,
    output::{ContainerWriter, FramedWriter},
    passthrough::{DEFAULT_OUTPUT_SLOTS, PassthroughEncoder},
    source::{AudioSource, ToneSource},
};

/// The collaborators one recording needs: encoders, a container writer and
/// an audio capture source. Failing to create an encoder is how a missing
/// codec shows up.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    fn create_encoder(&self, mime: &str) -> anyhow::Result<Box<dyn HardwareEncoder>>;

    fn create_writer(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>>;

    fn open_audio_source(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSource>>;
}

pub struct SoftwareBackend {
    output_slots: usize,
    tone_frequency: f32,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            output_slots: DEFAULT_OUTPUT_SLOTS,
            tone_frequency: 440.0,
        }
    }

    pub fn with_output_slots(mut self, output_slots: usize) -> Self {
        self.output_slots = output_slots;
        self
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn create_encoder(&self, mime: &str) -> anyhow::Result<Box<dyn HardwareEncoder>> {
        let encoder = PassthroughEncoder::new(mime, self.output_slots)?;
        log::info!("selected encoder {} for {}", encoder.name(), mime);
        Ok(Box::new(encoder))
    }

    fn create_writer(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(FramedWriter::new(path)?))
    }

    fn open_audio_source(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSource>> {
        if settings.sample_rate == 0 {
            anyhow::bail!("invalid sample rate 0");
        }
        Ok(Box::new(ToneSource::new(
            settings.sample_rate,
            settings.channels,
            self.tone_frequency,
        )))
    }
}
