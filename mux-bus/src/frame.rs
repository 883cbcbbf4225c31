/// Bytes per row of the interleaved chroma plane, and its row count.
/// Odd sizes round up: every 2x2 block (partial ones included) has one pair.
pub fn chroma_plane_dims(width: u32, height: u32) -> (usize, usize) {
    (2 * (width as usize).div_ceil(2), (height as usize).div_ceil(2))
}

/// Byte size of a 4:2:0 semi-planar frame.
pub fn semi_planar_size(width: u32, height: u32) -> usize {
    let (row_bytes, rows) = chroma_plane_dims(width, height);
    width as usize * height as usize + row_bytes * rows
}

/// Converts a camera NV21 frame (Y plane, then V/U pairs) into the NV12
/// layout encoders expect (Y plane, then U/V pairs). The luma plane is
/// copied as-is; each chroma pair is swapped.
pub fn nv21_to_nv12(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> anyhow::Result<()> {
    let expected = semi_planar_size(width, height);
    if width == 0 || height == 0 {
        anyhow::bail!("invalid frame size {}x{}", width, height);
    }
    if src.len() != expected {
        anyhow::bail!(
            "nv21 frame has {} bytes, expected {} for {}x{}",
            src.len(),
            expected,
            width,
            height
        );
    }
    if dst.len() < expected {
        anyhow::bail!("nv12 buffer too small: {} < {}", dst.len(), expected);
    }

    let luma = width as usize * height as usize;
    dst[..luma].copy_from_slice(&src[..luma]);
    for (out, vu) in dst[luma..expected]
        .chunks_exact_mut(2)
        .zip(src[luma..].chunks_exact(2))
    {
        out[0] = vu[1];
        out[1] = vu[0];
    }
    Ok(())
}
