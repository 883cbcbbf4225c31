use std::{
    f32::consts::PI,
    time::{Duration, Instant},
};

/// Microphone-like capture source producing interleaved 16-bit PCM.
pub trait AudioSource: Send {
    fn start(&mut self) -> anyhow::Result<()>;

    /// Blocks until some PCM is available; returns the number of bytes read.
    /// Zero means nothing was captured (stopped or starved).
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn stop(&mut self) -> anyhow::Result<()>;

    fn release(&mut self);

    /// Smallest read that keeps the source from overrunning.
    fn min_buffer_size(&self) -> usize;
}

/// Real-time paced sine generator standing in for a microphone.
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    phase: f32,
    chunk_bytes: usize,
    started_at: Option<Instant>,
    frames_produced: u64,
    released: bool,
}

impl ToneSource {
    pub fn new(sample_rate: u32, channels: u16, frequency: f32) -> Self {
        // 20ms per read
        let frames = (sample_rate / 50).max(1) as usize;
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency,
            phase: 0.0,
            chunk_bytes: frames * channels.max(1) as usize * 2,
            started_at: None,
            frames_produced: 0,
            released: false,
        }
    }

    fn due(&self, frames: u64) -> Duration {
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

impl AudioSource for ToneSource {
    fn start(&mut self) -> anyhow::Result<()> {
        if self.released {
            anyhow::bail!("tone source already released");
        }
        self.started_at = Some(Instant::now());
        self.frames_produced = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let Some(started_at) = self.started_at else {
            std::thread::sleep(Duration::from_millis(10));
            return Ok(0);
        };
        let frame_bytes = self.channels as usize * 2;
        let frames = (buf.len().min(self.chunk_bytes) / frame_bytes) as u64;
        if frames == 0 {
            return Ok(0);
        }

        let ready_at = started_at + self.due(self.frames_produced + frames);
        let now = Instant::now();
        if ready_at > now {
            std::thread::sleep(ready_at - now);
        }

        let step = 2.0 * PI * self.frequency / self.sample_rate as f32;
        for frame in buf[..frames as usize * frame_bytes].chunks_exact_mut(frame_bytes) {
            let value = (self.phase.sin() * i16::MAX as f32 * 0.25) as i16;
            for channel in frame.chunks_exact_mut(2) {
                channel.copy_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % (2.0 * PI);
        }
        self.frames_produced += frames;
        Ok(frames as usize * frame_bytes)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started_at = None;
        Ok(())
    }

    fn release(&mut self) {
        self.started_at = None;
        self.released = true;
    }

    fn min_buffer_size(&self) -> usize {
        self.chunk_bytes
    }
}
