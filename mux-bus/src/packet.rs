use std::sync::mpsc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::format::TrackKind;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SampleFlags: u32 {
        const KEY_FRAME = 0b0001;
        /// Codec configuration, not media data.
        const CODEC_CONFIG = 0b0010;
        const END_OF_STREAM = 0b0100;
    }
}

/// One output unit as handed out by an encoder. `index` names the encoder
/// slot holding it; the slot stays busy until released.
#[derive(Debug, Clone)]
pub struct EncodedBuffer {
    pub index: usize,
    pub data: Bytes,
    pub presentation_us: i64,
    pub flags: SampleFlags,
}

impl EncodedBuffer {
    pub fn new(index: usize, data: Bytes, presentation_us: i64, flags: SampleFlags) -> Self {
        Self {
            index,
            data,
            presentation_us,
            flags,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Returns an encoder output slot to the pipeline that owns the encoder.
/// The encoder itself never leaves its pipeline thread; the index travels
/// back over a channel and the pipeline releases it before its next poll.
#[derive(Debug)]
pub struct ReleaseHandle {
    index: usize,
    tx: mpsc::Sender<usize>,
}

impl ReleaseHandle {
    pub(crate) fn new(index: usize, tx: mpsc::Sender<usize>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn release(self) {
        // the pipeline may already be gone, in which case the slot died with the encoder
        let _ = self.tx.send(self.index);
    }
}

/// Compressed unit queued for the container writer. The payload is a view of
/// the encoder's buffer; the producing pipeline keeps the slot until the
/// coordinator calls [`CompressedSample::release`] after the write.
#[derive(Debug)]
pub struct CompressedSample {
    track: TrackKind,
    data: Bytes,
    presentation_us: i64,
    flags: SampleFlags,
    owner: Option<ReleaseHandle>,
}

impl CompressedSample {
    pub fn new(track: TrackKind, data: Bytes, presentation_us: i64, flags: SampleFlags) -> Self {
        Self {
            track,
            data,
            presentation_us,
            flags,
            owner: None,
        }
    }

    pub(crate) fn with_owner(mut self, owner: ReleaseHandle) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn track(&self) -> TrackKind {
        self.track
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn presentation_us(&self) -> i64 {
        self.presentation_us
    }

    pub fn flags(&self) -> SampleFlags {
        self.flags
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// Hands the encoder slot back to the producing pipeline.
    pub fn release(mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release();
        }
    }
}

impl Drop for CompressedSample {
    fn drop(&mut self) {
        // samples discarded without a write still give their slot back
        if let Some(owner) = self.owner.take() {
            owner.release();
        }
    }
}
