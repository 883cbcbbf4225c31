use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::{
    format::{FormatParams, MediaFormat},
    packet::SampleFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub presentation_us: i64,
    pub flags: SampleFlags,
    pub size: usize,
}

/// Container writer. Tracks are added before the first `start`; `stop`
/// suspends writing and a later `start` re-arms it; `release` finalizes.
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize>;

    fn start(&mut self) -> anyhow::Result<()>;

    fn write_sample(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    /// Finalizes the output. Implies `stop`.
    fn release(&mut self) -> anyhow::Result<()>;
}

pub const FRAMED_MAGIC: &[u8; 4] = b"LRF1";
pub const TAG_TRACK: u8 = b'T';
pub const TAG_SAMPLE: u8 = b'S';
pub const TAG_PAUSE: u8 = b'P';
pub const TAG_RESUME: u8 = b'R';
pub const TAG_END: u8 = b'E';

/// Length-prefixed record container: magic, track records, then one record
/// per sample. Pause/resume and end are marked in-band, so a file is only
/// complete once the end marker is present.
pub struct FramedWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    tracks: Vec<MediaFormat>,
    started: bool,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl FramedWriter {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create container file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: Some(BufWriter::new(file)),
            tracks: Vec::new(),
            started: false,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    fn out(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or(anyhow::anyhow!("container already released"))
    }

    fn write_header(&mut self) -> anyhow::Result<()> {
        let mut header = Vec::new();
        header.extend_from_slice(FRAMED_MAGIC);
        header.push(self.tracks.len() as u8);
        for format in &self.tracks {
            encode_track(&mut header, format)?;
        }
        self.out()?.write_all(&header)?;
        self.have_written_header = true;
        Ok(())
    }
}

fn encode_track(buf: &mut Vec<u8>, format: &MediaFormat) -> anyhow::Result<()> {
    let mime = format.mime.as_bytes();
    if mime.len() > u16::MAX as usize {
        anyhow::bail!("mime too long");
    }
    buf.push(TAG_TRACK);
    buf.push(format.kind().as_u8());
    buf.extend_from_slice(&(mime.len() as u16).to_le_bytes());
    buf.extend_from_slice(mime);
    buf.extend_from_slice(&format.bit_rate.to_le_bytes());
    match format.params {
        FormatParams::Audio {
            sample_rate,
            channels,
        } => {
            buf.extend_from_slice(&sample_rate.to_le_bytes());
            buf.extend_from_slice(&channels.to_le_bytes());
        }
        FormatParams::Video {
            width,
            height,
            frame_rate,
            ..
        } => {
            buf.extend_from_slice(&width.to_le_bytes());
            buf.extend_from_slice(&height.to_le_bytes());
            buf.extend_from_slice(&frame_rate.to_le_bytes());
        }
    }
    buf.push(format.csd.len() as u8);
    for csd in &format.csd {
        buf.extend_from_slice(&(csd.len() as u32).to_le_bytes());
        buf.extend_from_slice(csd);
    }
    Ok(())
}

impl ContainerWriter for FramedWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        if self.have_written_header {
            anyhow::bail!("cannot add track after the container started");
        }
        if self.tracks.len() == u8::MAX as usize {
            anyhow::bail!("too many tracks");
        }
        self.tracks.push(format.clone());
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        if self.tracks.is_empty() {
            anyhow::bail!("cannot start a container without tracks");
        }
        if !self.have_written_header {
            self.write_header()?;
        } else {
            self.out()?.write_all(&[TAG_RESUME])?;
        }
        self.started = true;
        Ok(())
    }

    fn write_sample(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("container not started");
        }
        if track_index >= self.tracks.len() {
            anyhow::bail!("unknown track index {}", track_index);
        }
        let mut record = Vec::with_capacity(data.len() + 18);
        record.push(TAG_SAMPLE);
        record.push(track_index as u8);
        record.extend_from_slice(&info.flags.bits().to_le_bytes());
        record.extend_from_slice(&info.presentation_us.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(data);
        self.out()?.write_all(&record)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("container not started");
        }
        let out = self.out()?;
        out.write_all(&[TAG_PAUSE])?;
        out.flush()?;
        self.started = false;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        if self.have_written_trailer {
            return Ok(());
        }
        self.have_written_trailer = true;
        self.started = false;
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        if self.have_written_header {
            out.write_all(&[TAG_END])?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}

impl Drop for FramedWriter {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("framed writer {} release error: {:#}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
