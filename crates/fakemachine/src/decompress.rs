//! Streaming decompressors for kernel module payloads.
//!
//! Most distributions ship kernel modules compressed (`.ko.gz`, `.ko.xz`,
//! `.ko.zst`). The initramfs builder rewrites them as plain `.ko` entries
//! while archiving, so the guest never needs decompression support. All
//! four helpers share the `(dst, src)` transformer shape and are also
//! usable directly by library consumers.

use std::io::{self, Read, Write};

use color_eyre::eyre::Context;
use color_eyre::Result;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// Copy-through transformer for modules that are not compressed.
pub fn null_decompressor(dst: &mut dyn Write, src: &mut dyn Read) -> Result<()> {
    io::copy(src, dst).context("failed to copy uncompressed data")?;
    Ok(())
}

pub fn gzip_decompressor(dst: &mut dyn Write, src: &mut dyn Read) -> Result<()> {
    let mut decoder = GzDecoder::new(src);
    io::copy(&mut decoder, dst).context("failed to decompress gzip data")?;
    Ok(())
}

pub fn xz_decompressor(dst: &mut dyn Write, src: &mut dyn Read) -> Result<()> {
    let mut decoder = XzDecoder::new(src);
    io::copy(&mut decoder, dst).context("failed to decompress xz data")?;
    Ok(())
}

pub fn zstd_decompressor(dst: &mut dyn Write, src: &mut dyn Read) -> Result<()> {
    let mut decoder = ZstdDecoder::new(src).context("failed to create zstd decompressor")?;
    io::copy(&mut decoder, dst).context("failed to decompress zstd data")?;
    Ok(())
}
