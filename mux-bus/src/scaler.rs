use ffmpeg_next::{format::Pixel, software::scaling};

/// Pixel format converter between camera NV12 and the encoder's input
/// format, same size on both sides.
pub struct Scaler {
    context: scaling::Context,
}

impl Scaler {
    pub fn new(src: Pixel, dst: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            src,
            width,
            height,
            dst,
            width,
            height,
            scaling::flag::Flags::BILINEAR,
        )?;
        Ok(Self { context })
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

// the context is only touched from the owning encoder thread
unsafe impl Send for Scaler {}
