//! FFmpeg backed encoder and container writer.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational,
    format::{Pixel, Sample, sample::Type},
};

use crate::{
    backend::MediaBackend,
    codec::{HardwareEncoder, InputStatus, OutputEvent},
    config::AudioSettings,
    format::{FormatParams, MediaFormat},
    frame::{chroma_plane_dims, semi_planar_size},
    hw::{
        codec_id_for_mime, find_hw_encoder, find_sw_encoder, is_hw_encoder,
        pixel_format_for_encoder, sample_format_for_encoder,
    },
    output::{ContainerWriter, SampleInfo},
    packet::{EncodedBuffer, SampleFlags},
    scaler::Scaler,
    source::{AudioSource, ToneSource},
};

const MICROS: Rational = Rational(1, 1_000_000);

#[derive(Clone, Copy)]
struct AudioLayout {
    sample: Sample,
    channel_layout: ChannelLayout,
    channels: usize,
    rate: u32,
}

enum Opened {
    Video {
        encoder: ffmpeg_next::codec::encoder::Video,
        scaler: Option<Scaler>,
        width: u32,
        height: u32,
    },
    Audio {
        encoder: ffmpeg_next::codec::encoder::Audio,
        layout: AudioLayout,
        fifo: PcmFifo,
        next_pts: Option<i64>,
    },
}

/// Encoder over libavcodec. Hardware codecs are tried first; a hardware
/// codec that fails to open falls back to the software one.
pub struct FfmpegEncoder {
    mime: String,
    name: String,
    input: Option<MediaFormat>,
    opened: Option<Opened>,
    time_base: Rational,
    format_reported: bool,
    next_index: usize,
}

impl FfmpegEncoder {
    pub fn new(mime: &str) -> anyhow::Result<Self> {
        if find_sw_encoder(mime).is_none() && find_hw_encoder(mime).is_none() {
            anyhow::bail!("no ffmpeg encoder for {}", mime);
        }
        Ok(Self {
            mime: mime.to_string(),
            name: format!("ffmpeg:{}", mime),
            input: None,
            opened: None,
            time_base: MICROS,
            format_reported: false,
            next_index: 0,
        })
    }

    fn open(&mut self, codec: ffmpeg_next::Codec, format: &MediaFormat) -> anyhow::Result<Opened> {
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        match format.params {
            FormatParams::Video {
                width,
                height,
                frame_rate,
                iframe_interval,
                ..
            } => {
                let pixel = pixel_format_for_encoder(&codec);
                let mut encoder = ctx.encoder().video()?;
                encoder.set_width(width);
                encoder.set_height(height);
                encoder.set_format(pixel);
                encoder.set_frame_rate(Some(Rational(frame_rate as i32, 1)));
                encoder.set_time_base(MICROS);
                encoder.set_bit_rate(format.bit_rate as usize);
                encoder.set_gop(frame_rate * iframe_interval);
                encoder.set_max_b_frames(0);
                // mp4 wants SPS/PPS in extradata
                encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

                let mut opts = Dictionary::new();
                opts.set("preset", "ultrafast");
                opts.set("tune", "zerolatency");
                let encoder = encoder.open_with(opts)?;

                let scaler = if pixel != Pixel::NV12 {
                    Some(Scaler::new(Pixel::NV12, pixel, width, height)?)
                } else {
                    None
                };
                self.time_base = MICROS;
                Ok(Opened::Video {
                    encoder,
                    scaler,
                    width,
                    height,
                })
            }
            FormatParams::Audio {
                sample_rate,
                channels,
            } => {
                let layout = AudioLayout {
                    sample: sample_format_for_encoder(&codec),
                    channel_layout: channel_layout(channels),
                    channels: channels.max(1) as usize,
                    rate: sample_rate,
                };
                let mut encoder = ctx.encoder().audio()?;
                encoder.set_rate(sample_rate as i32);
                encoder.set_channel_layout(layout.channel_layout);
                encoder.set_format(layout.sample);
                encoder.set_bit_rate(format.bit_rate as usize);
                encoder.set_time_base(Rational(1, sample_rate as i32));
                encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
                let encoder = encoder.open_with(Dictionary::new())?;
                self.time_base = Rational(1, sample_rate as i32);
                Ok(Opened::Audio {
                    encoder,
                    layout,
                    fifo: PcmFifo::default(),
                    next_pts: None,
                })
            }
        }
    }

    fn extradata(opened: &Opened) -> Option<Bytes> {
        let ctx = match opened {
            Opened::Video { encoder, .. } => unsafe { encoder.0.as_ptr() },
            Opened::Audio { encoder, .. } => unsafe { encoder.0.as_ptr() },
        };
        unsafe {
            let data = (*ctx).extradata;
            let size = (*ctx).extradata_size;
            if data.is_null() || size <= 0 {
                return None;
            }
            Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
                data,
                size as usize,
            )))
        }
    }

    fn send_video(
        encoder: &mut ffmpeg_next::codec::encoder::Video,
        scaler: &mut Option<Scaler>,
        (width, height): (u32, u32),
        data: &[u8],
        presentation_us: i64,
    ) -> Result<(), ffmpeg_next::Error> {
        let mut frame = ffmpeg_next::frame::Video::new(Pixel::NV12, width, height);
        let luma = (width * height) as usize;
        let (chroma_row, chroma_rows) = chroma_plane_dims(width, height);
        copy_plane(&mut frame, 0, &data[..luma], width as usize, height as usize);
        copy_plane(
            &mut frame,
            1,
            &data[luma..luma + chroma_row * chroma_rows],
            chroma_row,
            chroma_rows,
        );
        frame.set_pts(Some(presentation_us));

        match scaler {
            Some(scaler) => {
                let mut converted = ffmpeg_next::frame::Video::empty();
                scaler
                    .run(&frame, &mut converted)
                    .map_err(|_| ffmpeg_next::Error::InvalidData)?;
                converted.set_pts(frame.pts());
                encoder.send_frame(&converted)
            }
            None => encoder.send_frame(&frame),
        }
    }

    /// Sends every full codec frame buffered in the fifo. On end of stream
    /// the tail is padded with silence.
    fn send_audio(
        encoder: &mut ffmpeg_next::codec::encoder::Audio,
        layout: AudioLayout,
        fifo: &mut PcmFifo,
        next_pts: &mut Option<i64>,
        flush: bool,
    ) -> Result<(), ffmpeg_next::Error> {
        let channels = layout.channels;
        let frame_size = match encoder.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        let frame_len = frame_size * channels;
        if flush {
            fifo.pad_to_multiple(frame_len);
        }
        while let Some(samples) = fifo.front_frame(frame_len) {
            let mut frame =
                ffmpeg_next::frame::Audio::new(layout.sample, frame_size, layout.channel_layout);
            frame.set_rate(layout.rate);
            let pts = next_pts.unwrap_or(0);
            frame.set_pts(Some(pts));
            fill_audio_frame(&mut frame, &samples, channels);
            match encoder.send_frame(&frame) {
                Ok(()) => {
                    fifo.consume(frame_len);
                    *next_pts = Some(pts + frame_size as i64);
                }
                // codec is full, the samples stay buffered for the next call
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Interleaved S16 samples waiting for a full codec frame.
#[derive(Default)]
struct PcmFifo {
    samples: VecDeque<i16>,
}

impl PcmFifo {
    fn push_le_bytes(&mut self, data: &[u8]) {
        self.samples.extend(
            data.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
    }

    /// Pads with silence up to the next whole frame.
    fn pad_to_multiple(&mut self, frame_len: usize) {
        let rem = self.samples.len() % frame_len;
        if rem != 0 {
            self.samples.extend(std::iter::repeat_n(0, frame_len - rem));
        }
    }

    fn front_frame(&self, frame_len: usize) -> Option<Vec<i16>> {
        if frame_len == 0 || self.samples.len() < frame_len {
            return None;
        }
        Some(self.samples.iter().take(frame_len).copied().collect())
    }

    fn consume(&mut self, frame_len: usize) {
        self.samples.drain(..frame_len.min(self.samples.len()));
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn channel_layout(channels: u16) -> ChannelLayout {
    if channels == 1 {
        ChannelLayout::MONO
    } else {
        ChannelLayout::STEREO
    }
}

fn copy_plane(
    frame: &mut ffmpeg_next::frame::Video,
    plane: usize,
    src: &[u8],
    row_bytes: usize,
    rows: usize,
) {
    let stride = frame.stride(plane);
    let dst = frame.data_mut(plane);
    for row in 0..rows {
        dst[row * stride..row * stride + row_bytes]
            .copy_from_slice(&src[row * row_bytes..(row + 1) * row_bytes]);
    }
}

fn fill_audio_frame(frame: &mut ffmpeg_next::frame::Audio, samples: &[i16], channels: usize) {
    match frame.format() {
        Sample::I16(Type::Packed) => {
            let dst = frame.data_mut(0);
            for (out, s) in dst.chunks_exact_mut(2).zip(samples) {
                out.copy_from_slice(&s.to_ne_bytes());
            }
        }
        Sample::F32(Type::Planar) => {
            for ch in 0..channels {
                let dst = frame.plane_mut::<f32>(ch);
                for (out, s) in dst.iter_mut().zip(samples.iter().skip(ch).step_by(channels)) {
                    *out = *s as f32 / 32768.0;
                }
            }
        }
        Sample::I16(Type::Planar) => {
            for ch in 0..channels {
                let dst = frame.plane_mut::<i16>(ch);
                for (out, s) in dst.iter_mut().zip(samples.iter().skip(ch).step_by(channels)) {
                    *out = *s;
                }
            }
        }
        other => log::warn!("unsupported encoder sample format {:?}, sending silence", other),
    }
}

impl HardwareEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()> {
        // Try hardware encoder first, then fall back to software encoder.
        let opened = match find_hw_encoder(&self.mime) {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                match self.open(hw_codec, format) {
                    Ok(opened) => {
                        self.name = hw_name;
                        Some(opened)
                    }
                    Err(e) => {
                        log::warn!("hardware encoder {} failed: {}, falling back", hw_name, e);
                        None
                    }
                }
            }
            None => None,
        };
        let opened = match opened {
            Some(opened) => opened,
            None => {
                let sw_codec = find_sw_encoder(&self.mime)
                    .ok_or(anyhow::anyhow!("codec not found: {}", self.mime))?;
                let sw_name = sw_codec.name().to_string();
                let opened = self.open(sw_codec, format)?;
                self.name = sw_name;
                opened
            }
        };
        log::info!(
            "encoder opened successfully: {} (hardware: {})",
            self.name,
            is_hw_encoder(&self.name)
        );
        self.input = Some(format.clone());
        self.opened = Some(opened);
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.opened.is_none() {
            anyhow::bail!("{} must be configured before start", self.name);
        }
        self.format_reported = false;
        Ok(())
    }

    fn submit_input(
        &mut self,
        data: &[u8],
        presentation_us: i64,
        end_of_stream: bool,
        _timeout: Duration,
    ) -> anyhow::Result<InputStatus> {
        let opened = self
            .opened
            .as_mut()
            .ok_or(anyhow::anyhow!("{} not configured", self.name))?;

        let result = match opened {
            Opened::Video {
                encoder,
                scaler,
                width,
                height,
            } => {
                if end_of_stream {
                    encoder.send_eof()
                } else {
                    let expected = semi_planar_size(*width, *height);
                    if data.len() < expected {
                        anyhow::bail!("video frame has {} bytes, expected {}", data.len(), expected);
                    }
                    Self::send_video(encoder, scaler, (*width, *height), data, presentation_us)
                }
            }
            Opened::Audio {
                encoder,
                layout,
                fifo,
                next_pts,
            } => {
                if next_pts.is_none() {
                    let rate = layout.rate as i64;
                    *next_pts = Some(presentation_us * rate / 1_000_000);
                }
                fifo.push_le_bytes(data);
                match Self::send_audio(encoder, *layout, fifo, next_pts, end_of_stream) {
                    // the padded tail is still queued, hold end of stream back
                    Ok(()) if end_of_stream && !fifo.is_empty() => return Ok(InputStatus::Busy),
                    Ok(()) if end_of_stream => encoder.send_eof(),
                    other => other,
                }
            }
        };

        match result {
            Ok(()) => Ok(InputStatus::Accepted),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(InputStatus::Busy)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll_output(&mut self, _timeout: Duration) -> anyhow::Result<OutputEvent> {
        let Some(opened) = self.opened.as_mut() else {
            anyhow::bail!("{} not configured", self.name);
        };
        if !self.format_reported {
            self.format_reported = true;
            if let Some(input) = &self.input {
                let mut format = input.clone();
                format.mime = self.mime.clone();
                if let Some(extradata) = Self::extradata(opened) {
                    format.csd.push(extradata);
                }
                return Ok(OutputEvent::FormatChanged(format));
            }
        }

        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        let result = match opened {
            Opened::Video { encoder, .. } => encoder.receive_packet(&mut packet),
            Opened::Audio { encoder, .. } => encoder.receive_packet(&mut packet),
        };
        match result {
            Ok(()) => {
                let index = self.next_index;
                self.next_index += 1;
                let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                let (num, den) = (
                    self.time_base.numerator() as i64,
                    self.time_base.denominator() as i64,
                );
                let presentation_us = packet.pts().map(|pts| pts * 1_000_000 * num / den).unwrap_or(0);
                let flags = if packet.is_key() {
                    SampleFlags::KEY_FRAME
                } else {
                    SampleFlags::empty()
                };
                Ok(OutputEvent::Ready(EncodedBuffer::new(
                    index,
                    data,
                    presentation_us,
                    flags,
                )))
            }
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(OutputEvent::NotReady)
            }
            Err(ffmpeg_next::Error::Eof) => {
                let index = self.next_index;
                self.next_index += 1;
                Ok(OutputEvent::Ready(EncodedBuffer::new(
                    index,
                    Bytes::new(),
                    0,
                    SampleFlags::END_OF_STREAM,
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release_output(&mut self, _index: usize) {
        // packets are copied out, nothing is pinned
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.opened = None;
        Ok(())
    }

    fn release(&mut self) {
        self.opened = None;
        self.input = None;
    }
}

// the codec context is only touched from the owning pipeline thread
unsafe impl Send for FfmpegEncoder {}

/// Builds stream parameters for a track from its reported format.
fn parameters_for(format: &MediaFormat) -> anyhow::Result<ffmpeg_next::codec::Parameters> {
    let codec_id = codec_id_for_mime(&format.mime)
        .ok_or(anyhow::anyhow!("no container codec for {}", format.mime))?;
    let mut params = ffmpeg_next::codec::Parameters::new();
    unsafe {
        let ptr = params.as_mut_ptr();
        (*ptr).codec_id = codec_id.into();
        (*ptr).bit_rate = format.bit_rate as i64;
        match format.params {
            FormatParams::Video { width, height, .. } => {
                (*ptr).codec_type = ffmpeg_next::media::Type::Video.into();
                (*ptr).width = width as i32;
                (*ptr).height = height as i32;
            }
            FormatParams::Audio {
                sample_rate,
                channels,
            } => {
                (*ptr).codec_type = ffmpeg_next::media::Type::Audio.into();
                (*ptr).sample_rate = sample_rate as i32;
                ffmpeg_next::ffi::av_channel_layout_default(&mut (*ptr).ch_layout, channels as i32);
            }
        }
        let csd: Vec<u8> = format.csd.iter().flat_map(|c| c.iter().copied()).collect();
        if !csd.is_empty() {
            let padding = ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffmpeg_next::ffi::av_mallocz(csd.len() + padding) as *mut u8;
            if buf.is_null() {
                anyhow::bail!("allocate extradata");
            }
            std::ptr::copy_nonoverlapping(csd.as_ptr(), buf, csd.len());
            (*ptr).extradata = buf;
            (*ptr).extradata_size = csd.len() as i32;
        }
    }
    Ok(params)
}

/// Container writer over an FFmpeg output context (format picked from the
/// file extension).
pub struct FfmpegWriter {
    path: PathBuf,
    inner: ffmpeg_next::format::context::Output,
    tracks: usize,
    started: bool,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl FfmpegWriter {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let output = ffmpeg_next::format::output(&path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: output,
            tracks: 0,
            started: false,
            have_written_header: false,
            have_written_trailer: false,
        })
    }
}

impl ContainerWriter for FfmpegWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        if self.have_written_header {
            anyhow::bail!("cannot add track after the container started");
        }
        let params = parameters_for(format)?;
        let mut stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(params.id()))?;
        stream.set_parameters(params);
        stream.set_time_base(MICROS);
        self.tracks += 1;
        Ok(stream.index())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        if self.tracks == 0 {
            anyhow::bail!("cannot start a container without tracks");
        }
        if !self.have_written_header {
            self.inner.write_header()?;
            self.have_written_header = true;
            log::info!("container header written: {}", self.path.display());
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
        let out_time_base = self
            .inner
            .stream(track_index)
            .ok_or(anyhow::anyhow!("stream not found"))?
            .time_base();
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(data);
        packet.set_stream(track_index);
        packet.set_pts(Some(info.presentation_us));
        packet.set_dts(Some(info.presentation_us));
        packet.set_position(-1);
        if info.flags.contains(SampleFlags::KEY_FRAME) {
            packet.set_flags(ffmpeg_next::codec::packet::Flags::KEY);
        }
        packet.rescale_ts(MICROS, out_time_base);
        packet.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("container not started");
        }
        unsafe {
            let pb = (*self.inner.as_mut_ptr()).pb;
            if !pb.is_null() {
                ffmpeg_next::ffi::avio_flush(pb);
            }
        }
        self.started = false;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.started = false;
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
            log::info!("container trailer written: {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("finalize {}: {:#}", self.path.display(), e);
        }
    }
}

unsafe impl Send for FfmpegWriter {}

/// Real codecs and containers; capture stays the tone generator.
#[derive(Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> anyhow::Result<Self> {
        crate::init()?;
        Ok(Self)
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn create_encoder(&self, mime: &str) -> anyhow::Result<Box<dyn HardwareEncoder>> {
        Ok(Box::new(FfmpegEncoder::new(mime)?))
    }

    fn create_writer(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(FfmpegWriter::new(path)?))
    }

    fn open_audio_source(&self, settings: &AudioSettings) -> anyhow::Result<Box<dyn AudioSource>> {
        Ok(Box::new(ToneSource::new(
            settings.sample_rate,
            settings.channels,
            440.0,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MIME_AAC, MIME_AVC, MIME_RAW_AUDIO};

    #[test]
    fn test_pcm_fifo_holds_tail_until_sent() {
        let mut fifo = PcmFifo::default();
        fifo.push_le_bytes(&[1, 0, 2, 0, 3, 0]);
        assert_eq!(fifo.front_frame(4), None);

        fifo.pad_to_multiple(4);
        assert_eq!(fifo.front_frame(4), Some(vec![1, 2, 3, 0]));
        // a frame the codec refused stays queued, so end of stream must wait
        assert!(!fifo.is_empty());
        fifo.pad_to_multiple(4);
        assert_eq!(fifo.front_frame(4), Some(vec![1, 2, 3, 0]));

        fifo.consume(4);
        assert!(fifo.is_empty());
        assert_eq!(fifo.front_frame(4), None);
    }

    #[test]
    fn test_unknown_mime_has_no_encoder() {
        assert!(FfmpegEncoder::new(MIME_RAW_AUDIO).is_err());
    }

    #[test]
    fn test_track_parameters_carry_csd() -> anyhow::Result<()> {
        let format = MediaFormat::video(MIME_AVC, 640, 480)
            .with_csd(Bytes::from_static(&[0, 0, 0, 1, 0x67]));
        let params = parameters_for(&format)?;
        assert_eq!(params.id(), ffmpeg_next::codec::Id::H264);
        assert_eq!(params.medium(), ffmpeg_next::media::Type::Video);

        let audio = MediaFormat::audio(MIME_AAC, 16000, 1);
        assert_eq!(parameters_for(&audio)?.medium(), ffmpeg_next::media::Type::Audio);
        assert!(parameters_for(&MediaFormat::audio(MIME_RAW_AUDIO, 16000, 1)).is_err());
        Ok(())
    }

    #[test]
    fn test_writer_rejects_samples_before_start() -> anyhow::Result<()> {
        crate::init()?;
        let dir = tempfile::tempdir()?;
        let mut writer = FfmpegWriter::new(&dir.path().join("out.mp4"))?;
        assert!(writer.start().is_err());
        let info = SampleInfo {
            presentation_us: 0,
            flags: SampleFlags::KEY_FRAME,
            size: 1,
        };
        assert!(writer.write_sample(0, &[0], &info).is_err());
        writer.release()?;
        Ok(())
    }
}
