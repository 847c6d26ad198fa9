// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek},
};

use flate2::read::GzDecoder;
use liblzma::read::XzDecoder;
use lz4_flex::frame::FrameDecoder;
use thiserror::Error;

static GZIP_MAGIC: &[u8; 2] = b"\x1f\x8b";
static LZ4_LEGACY_MAGIC: &[u8; 4] = b"\x02\x21\x4c\x18";
static XZ_MAGIC: &[u8; 6] = b"\xfd\x37\x7a\x58\x5a\x00";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("I/O error when autodetecting compression format")]
    AutoDetect(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    None,
    Gzip,
    Lz4Legacy,
    Xz,
}

/// Decompressing reader for the formats kernels are shipped in.
pub enum CompressedReader<R: Read> {
    None(R),
    Gzip(GzDecoder<R>),
    Lz4(FrameDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: Read> fmt::Debug for CompressedReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompressedReader")
            .field(&self.format())
            .finish_non_exhaustive()
    }
}

impl<R: Read> CompressedReader<R> {
    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Gzip(_) => CompressedFormat::Gzip,
            Self::Lz4(_) => CompressedFormat::Lz4Legacy,
            Self::Xz(_) => CompressedFormat::Xz,
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Autodetect the format from the magic bytes. Data too short to hold any
    /// magic is treated as unknown.
    pub fn new(mut reader: R, raw_if_unknown: bool) -> Result<Self> {
        let mut magic = Vec::with_capacity(XZ_MAGIC.len());
        (&mut reader)
            .take(XZ_MAGIC.len() as u64)
            .read_to_end(&mut magic)
            .map_err(Error::AutoDetect)?;

        reader.rewind().map_err(Error::AutoDetect)?;

        if magic.starts_with(GZIP_MAGIC) {
            Ok(Self::Gzip(GzDecoder::new(reader)))
        } else if magic.starts_with(LZ4_LEGACY_MAGIC) {
            Ok(Self::Lz4(FrameDecoder::new(reader)))
        } else if magic == XZ_MAGIC {
            Ok(Self::Xz(XzDecoder::new(reader)))
        } else if raw_if_unknown {
            Ok(Self::None(reader))
        } else {
            Err(Error::UnknownFormat)
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use flate2::{Compression, write::GzEncoder};
    use liblzma::write::XzEncoder;

    use super::*;

    const DATA: &[u8] = b"Linux version 6.1.57-android14-11-gdeadbeef";

    fn decompress(data: &[u8]) -> (CompressedFormat, Vec<u8>) {
        let mut reader = CompressedReader::new(Cursor::new(data), false).unwrap();
        let mut output = vec![];
        reader.read_to_end(&mut output).unwrap();

        (reader.format(), output)
    }

    #[test]
    fn detect_gzip_and_xz() {
        let mut gzip = GzEncoder::new(vec![], Compression::default());
        gzip.write_all(DATA).unwrap();
        assert_eq!(decompress(&gzip.finish().unwrap()), (CompressedFormat::Gzip, DATA.to_vec()));

        let mut xz = XzEncoder::new(vec![], 6);
        xz.write_all(DATA).unwrap();
        assert_eq!(decompress(&xz.finish().unwrap()), (CompressedFormat::Xz, DATA.to_vec()));
    }

    #[test]
    fn detect_lz4_legacy() {
        let block = lz4_flex::block::compress(DATA);

        let mut data = LZ4_LEGACY_MAGIC.to_vec();
        data.extend_from_slice(&(block.len() as u32).to_le_bytes());
        data.extend_from_slice(&block);

        assert_eq!(decompress(&data), (CompressedFormat::Lz4Legacy, DATA.to_vec()));
    }

    #[test]
    fn unknown_format() {
        assert_matches!(
            CompressedReader::new(Cursor::new(DATA), false),
            Err(Error::UnknownFormat)
        );

        for data in [DATA, &b"\x1f"[..]] {
            let mut reader = CompressedReader::new(Cursor::new(data), true).unwrap();
            assert_eq!(reader.format(), CompressedFormat::None);

            let mut output = vec![];
            reader.read_to_end(&mut output).unwrap();
            assert_eq!(output, data);
        }
    }
}
