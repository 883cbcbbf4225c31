use bytes::Bytes;

use super::*;
use crate::{
    format::{MIME_AAC, MIME_AVC, TrackKind},
    testing::{FramedRecord, read_framed},
};

fn info(presentation_us: i64, flags: SampleFlags) -> SampleInfo {
    SampleInfo {
        presentation_us,
        flags,
        size: 0,
    }
}

#[test]
fn test_framed_writer_records_tracks_and_samples() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.lrf");
    let mut writer = FramedWriter::new(&path)?;

    let video = writer.add_track(
        &MediaFormat::video(MIME_AVC, 640, 480).with_csd(Bytes::from_static(b"sps")),
    )?;
    let audio = writer.add_track(&MediaFormat::audio(MIME_AAC, 16000, 1))?;
    assert_eq!((video, audio), (0, 1));

    writer.start()?;
    writer.write_sample(video, b"v0", &info(0, SampleFlags::KEY_FRAME))?;
    writer.write_sample(audio, b"a0", &info(10, SampleFlags::empty()))?;
    writer.release()?;

    let records = read_framed(&path)?;
    assert_eq!(
        records,
        vec![
            FramedRecord::Track {
                kind: TrackKind::Video.as_u8(),
                mime: MIME_AVC.to_string()
            },
            FramedRecord::Track {
                kind: TrackKind::Audio.as_u8(),
                mime: MIME_AAC.to_string()
            },
            FramedRecord::Sample {
                track: 0,
                flags: SampleFlags::KEY_FRAME.bits(),
                presentation_us: 0,
                data: b"v0".to_vec()
            },
            FramedRecord::Sample {
                track: 1,
                flags: 0,
                presentation_us: 10,
                data: b"a0".to_vec()
            },
            FramedRecord::End,
        ]
    );
    Ok(())
}

#[test]
fn test_stop_and_restart_are_marked() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pause.lrf");
    let mut writer = FramedWriter::new(&path)?;
    writer.add_track(&MediaFormat::audio(MIME_AAC, 8000, 1))?;
    writer.start()?;
    writer.stop()?;
    assert!(writer.write_sample(0, b"x", &info(1, SampleFlags::empty())).is_err());
    writer.start()?;
    writer.write_sample(0, b"y", &info(2, SampleFlags::empty()))?;
    writer.release()?;
    // second release is a no-op
    writer.release()?;

    let records = read_framed(&path)?;
    assert_eq!(records.len(), 5);
    assert_eq!(records[1], FramedRecord::Pause);
    assert_eq!(records[2], FramedRecord::Resume);
    assert_eq!(records[4], FramedRecord::End);
    Ok(())
}

#[test]
fn test_ordering_errors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = FramedWriter::new(&dir.path().join("err.lrf"))?;
    assert!(writer.start().is_err());
    assert!(writer.stop().is_err());
    writer.add_track(&MediaFormat::audio(MIME_AAC, 8000, 1))?;
    assert!(writer.write_sample(0, b"early", &info(0, SampleFlags::empty())).is_err());
    writer.start()?;
    assert!(writer.add_track(&MediaFormat::video(MIME_AVC, 2, 2)).is_err());
    assert!(writer.write_sample(3, b"bad", &info(0, SampleFlags::empty())).is_err());
    Ok(())
}

#[test]
fn test_missing_directory_fails_creation() {
    let dir = tempfile::tempdir().unwrap();
    assert!(FramedWriter::new(&dir.path().join("nope").join("out.lrf")).is_err());
}
