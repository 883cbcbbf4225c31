//! Hardware-accelerated encoder discovery.
//!
//! Maps a stream mime to the hardware encoders worth trying (NVENC/VAAPI/QSV/V4L2M2M)
//! and to the software encoder used when none of them opens.

use crate::format::{MIME_AAC, MIME_AVC};

/// Software encoder name for the given mime.
pub fn software_encoder_name(mime: &str) -> Option<&'static str> {
    match mime {
        MIME_AVC => Some("libx264"),
        MIME_AAC => Some("aac"),
        _ => None,
    }
}

pub fn codec_id_for_mime(mime: &str) -> Option<ffmpeg_next::codec::Id> {
    match mime {
        MIME_AVC => Some(ffmpeg_next::codec::Id::H264),
        MIME_AAC => Some(ffmpeg_next::codec::Id::AAC),
        _ => None,
    }
}

/// Try to find a hardware-accelerated encoder for the given mime.
/// Returns the first available hardware encoder, or None if none is found.
pub fn find_hw_encoder(mime: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match mime {
        MIME_AVC => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        MIME_AAC => &["aac_at", "aac_mf"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Software encoder for the mime, by name first and by codec id otherwise.
pub fn find_sw_encoder(mime: &str) -> Option<ffmpeg_next::Codec> {
    software_encoder_name(mime)
        .and_then(ffmpeg_next::encoder::find_by_name)
        .or_else(|| codec_id_for_mime(mime).and_then(ffmpeg_next::encoder::find))
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m", "_at", "_mf"]
        .iter()
        .any(|tag| codec_name.contains(tag))
}

/// Pixel format to open a video encoder with. Camera frames arrive as NV12,
/// which hardware encoders take directly; software x264 wants YUV420P.
pub fn pixel_format_for_encoder(codec: &ffmpeg_next::Codec) -> ffmpeg_next::format::Pixel {
    use ffmpeg_next::format::Pixel;
    let supported: Vec<Pixel> = codec
        .video()
        .ok()
        .and_then(|v| v.formats().map(|f| f.collect()))
        .unwrap_or_default();
    if supported.is_empty() || supported.contains(&Pixel::NV12) {
        Pixel::NV12
    } else if supported.contains(&Pixel::YUV420P) {
        Pixel::YUV420P
    } else {
        supported[0]
    }
}

/// Sample format to open an audio encoder with, preferring packed 16-bit so
/// capture data needs no conversion.
pub fn sample_format_for_encoder(codec: &ffmpeg_next::Codec) -> ffmpeg_next::format::Sample {
    use ffmpeg_next::format::{Sample, sample::Type};
    let supported: Vec<Sample> = codec
        .audio()
        .ok()
        .and_then(|a| a.formats().map(|f| f.collect()))
        .unwrap_or_default();
    let packed = Sample::I16(Type::Packed);
    if supported.is_empty() || supported.contains(&packed) {
        packed
    } else if supported.contains(&Sample::F32(Type::Planar)) {
        Sample::F32(Type::Planar)
    } else {
        supported[0]
    }
}
