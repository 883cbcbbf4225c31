//! Hardware encoder abstraction.
//!
//! An encoder is an opaque stateful device: raw units go in through
//! [`HardwareEncoder::submit_input`], compressed units and format changes come
//! out of [`HardwareEncoder::poll_output`]. Both calls take a bounded timeout;
//! "busy" and "not ready" are normal answers, not errors.

use std::time::Duration;

use crate::{format::MediaFormat, packet::EncodedBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    Accepted,
    /// No input slot became free within the timeout, try again later.
    Busy,
}

#[derive(Debug)]
pub enum OutputEvent {
    Ready(EncodedBuffer),
    /// Nothing became available within the timeout.
    NotReady,
    /// Output format stabilized; later units follow this format.
    FormatChanged(MediaFormat),
    /// Output slot set was reallocated.
    BuffersChanged,
}

pub trait HardwareEncoder: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()>;

    fn start(&mut self) -> anyhow::Result<()>;

    /// Queues one unit of raw input. With `end_of_stream` set the data is
    /// ignored and the encoder is told no more input follows.
    fn submit_input(
        &mut self,
        data: &[u8],
        presentation_us: i64,
        end_of_stream: bool,
        timeout: Duration,
    ) -> anyhow::Result<InputStatus>;

    fn poll_output(&mut self, timeout: Duration) -> anyhow::Result<OutputEvent>;

    /// Gives an output slot back once its data has been consumed.
    fn release_output(&mut self, index: usize);

    fn stop(&mut self) -> anyhow::Result<()>;

    fn release(&mut self);
}
