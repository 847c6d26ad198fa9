// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Patch application for the binary diff formats used by `SOURCE_BSDIFF` and
//! `BROTLI_BSDIFF` payload operations.

use std::io::{self, Read};

use bzip2::read::BzDecoder;
use thiserror::Error;

const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";
const HEADER_SIZE: usize = 32;
const CTRL_ENTRY_SIZE: usize = 24;
const BROTLI_BUFFER_SIZE: usize = 16384;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown patch magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Patch is truncated: {0}")]
    Truncated(&'static str),
    #[error("Unsupported stream compression type: {0}")]
    UnsupportedCompression(u8),
    #[error("Invalid {0:?} value: {1}")]
    InvalidValue(&'static str, i64),
    #[error("Patch produces {actual} bytes, but {expected} bytes are expected")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Control entry writes past the end of the {0} byte output")]
    OutputOverflow(u64),
    #[error("Failed to decompress {0} stream")]
    Decompress(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Compression {
    None,
    Bzip2,
    Brotli,
}

impl Compression {
    fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Bzip2),
            2 => Ok(Self::Brotli),
            v => Err(Error::UnsupportedCompression(v)),
        }
    }

    fn reader<'a>(self, data: &'a [u8]) -> Box<dyn Read + 'a> {
        match self {
            Self::None => Box::new(data),
            Self::Bzip2 => Box::new(BzDecoder::new(data)),
            Self::Brotli => Box::new(brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE)),
        }
    }
}

/// Decode bsdiff's sign-magnitude little endian integer encoding.
fn offtin(buf: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);

    let magnitude = (u64::from_le_bytes(raw) & !(1 << 63)) as i64;
    if raw[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn offtin_len(buf: &[u8], name: &'static str) -> Result<usize> {
    let value = offtin(buf);
    usize::try_from(value).map_err(|_| Error::InvalidValue(name, value))
}

fn split<'a>(data: &'a [u8], len: usize, name: &'static str) -> Result<(&'a [u8], &'a [u8])> {
    if data.len() < len {
        return Err(Error::Truncated(name));
    }
    Ok(data.split_at(len))
}

/// Fill `buf` from a decompressed stream. Running out of data is reported as
/// truncation rather than as a decompression failure.
fn read_stream(mut reader: impl Read, buf: &mut [u8], name: &'static str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated(name)
        } else {
            Error::Decompress(name, e)
        }
    })
}

/// Apply a `BSDIFF40` or `BSDF2` patch to `old`, returning the new data. The
/// size declared by the patch must equal `expected_size`. The streams are
/// decompressed incrementally, so nothing larger than the output is ever
/// allocated.
pub fn apply(old: &[u8], patch: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let (header, body) = split(patch, HEADER_SIZE, "header")?;

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&header[..8]);

    let compression = if &magic == BSDIFF40_MAGIC {
        [Compression::Bzip2; 3]
    } else if magic.starts_with(BSDF2_MAGIC) {
        [
            Compression::from_raw(magic[5])?,
            Compression::from_raw(magic[6])?,
            Compression::from_raw(magic[7])?,
        ]
    } else {
        return Err(Error::UnknownMagic(magic));
    };

    let ctrl_len = offtin_len(&header[8..16], "ctrl_len")?;
    let diff_len = offtin_len(&header[16..24], "diff_len")?;
    let new_size = offtin_len(&header[24..32], "new_size")?;

    if new_size as u64 != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: new_size as u64,
        });
    }

    let (ctrl_raw, rest) = split(body, ctrl_len, "ctrl")?;
    let (diff_raw, extra_raw) = split(rest, diff_len, "diff")?;

    let mut ctrl = compression[0].reader(ctrl_raw);
    let mut diff = compression[1].reader(diff_raw);
    let mut extra = compression[2].reader(extra_raw);

    let mut new = vec![0u8; new_size];
    let mut old_pos = 0i64;
    let mut new_pos = 0usize;

    while new_pos < new_size {
        let mut entry = [0u8; CTRL_ENTRY_SIZE];
        read_stream(&mut ctrl, &mut entry, "ctrl")?;

        let add_len = offtin_len(&entry[0..8], "add_len")?;
        let copy_len = offtin_len(&entry[8..16], "copy_len")?;
        let seek = offtin(&entry[16..24]);

        // Add old data to the diff bytes.
        let add_end = new_pos
            .checked_add(add_len)
            .filter(|e| *e <= new_size)
            .ok_or(Error::OutputOverflow(new_size as u64))?;
        let add = &mut new[new_pos..add_end];
        read_stream(&mut diff, add, "diff")?;

        for (i, out) in add.iter_mut().enumerate() {
            let old_byte = old_pos
                .checked_add(i as i64)
                .and_then(|o| usize::try_from(o).ok())
                .and_then(|o| old.get(o))
                .copied()
                .unwrap_or(0);

            *out = out.wrapping_add(old_byte);
        }

        new_pos = add_end;
        old_pos = old_pos
            .checked_add(add_len as i64)
            .ok_or(Error::InvalidValue("add_len", add_len as i64))?;

        // Copy the extra bytes as is.
        let copy_end = new_pos
            .checked_add(copy_len)
            .filter(|e| *e <= new_size)
            .ok_or(Error::OutputOverflow(new_size as u64))?;
        read_stream(&mut extra, &mut new[new_pos..copy_end], "extra")?;

        new_pos = copy_end;
        old_pos = old_pos
            .checked_add(seek)
            .ok_or(Error::InvalidValue("seek", seek))?;
    }

    Ok(new)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use bzip2::{Compression as BzLevel, write::BzEncoder};

    use super::*;

    fn offtout(value: i64) -> [u8; 8] {
        let mut raw = value.unsigned_abs().to_le_bytes();
        if value < 0 {
            raw[7] |= 0x80;
        }
        raw
    }

    fn compress(compression: Compression, data: &[u8]) -> Vec<u8> {
        match compression {
            Compression::None => data.to_vec(),
            Compression::Bzip2 => {
                let mut encoder = BzEncoder::new(Vec::new(), BzLevel::fast());
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            }
            Compression::Brotli => {
                let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
                writer.write_all(data).unwrap();
                writer.into_inner()
            }
        }
    }

    fn build_patch(
        magic: &[u8; 8],
        compression: Compression,
        ctrl: &[(i64, i64, i64)],
        diff: &[u8],
        extra: &[u8],
        new_size: i64,
    ) -> Vec<u8> {
        let mut ctrl_raw = vec![];
        for (x, y, z) in ctrl {
            ctrl_raw.extend_from_slice(&offtout(*x));
            ctrl_raw.extend_from_slice(&offtout(*y));
            ctrl_raw.extend_from_slice(&offtout(*z));
        }

        let ctrl_raw = compress(compression, &ctrl_raw);
        let diff_raw = compress(compression, diff);
        let extra_raw = compress(compression, extra);

        let mut patch = magic.to_vec();
        patch.extend_from_slice(&offtout(ctrl_raw.len() as i64));
        patch.extend_from_slice(&offtout(diff_raw.len() as i64));
        patch.extend_from_slice(&offtout(new_size));
        patch.extend_from_slice(&ctrl_raw);
        patch.extend_from_slice(&diff_raw);
        patch.extend_from_slice(&extra_raw);
        patch
    }

    #[test]
    fn sign_magnitude_integers() {
        assert_eq!(offtin(&offtout(0)), 0);
        assert_eq!(offtin(&offtout(1234)), 1234);
        assert_eq!(offtin(&offtout(-1234)), -1234);
    }

    #[test]
    fn apply_bsdiff40() {
        let old = b"hello world";
        // "hello" + 1 on the first byte, then "!!" from extra, then skip the
        // space and take "world" unchanged.
        let patch = build_patch(
            BSDIFF40_MAGIC,
            Compression::Bzip2,
            &[(5, 2, 1), (5, 0, 0)],
            &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            b"!!",
            12,
        );

        assert_eq!(apply(old, &patch, 12).unwrap(), b"iello!!world");
    }

    #[test]
    fn apply_bsdf2_uncompressed() {
        let old = b"abcdef";
        // Seek backwards to reuse old data.
        let patch = build_patch(
            b"BSDF2\0\0\0",
            Compression::None,
            &[(3, 0, -3), (3, 0, 0)],
            &[0; 6],
            b"",
            6,
        );

        assert_eq!(apply(old, &patch, 6).unwrap(), b"abcabc");
    }

    #[test]
    fn apply_bsdf2_brotli() {
        let old = b"android boot image";
        let patch = build_patch(
            b"BSDF2\x02\x02\x02",
            Compression::Brotli,
            &[(7, 4, 6), (6, 0, 0)],
            &[0; 13],
            b"ROOT",
            17,
        );

        assert_eq!(apply(old, &patch, 17).unwrap(), b"androidROOTimage\0");
    }

    #[test]
    fn reject_unexpected_output_size() {
        let magic = b"BSDF2\0\0\0";
        let patch = build_patch(magic, Compression::None, &[], b"", b"", 1 << 62);

        assert_matches!(
            apply(b"old", &patch, 4096),
            Err(Error::SizeMismatch {
                expected: 4096,
                actual: 0x4000_0000_0000_0000,
            })
        );
    }

    #[test]
    fn reject_bad_patches() {
        let none = Compression::None;

        assert_matches!(apply(b"", b"short", 0), Err(Error::Truncated("header")));

        let patch = build_patch(b"NOTPATCH", none, &[], b"", b"", 0);
        assert_matches!(apply(b"", &patch, 0), Err(Error::UnknownMagic(_)));

        let patch = build_patch(b"BSDF2\x03\0\0", none, &[], b"", b"", 0);
        assert_matches!(apply(b"", &patch, 0), Err(Error::UnsupportedCompression(3)));

        let patch = build_patch(BSDIFF40_MAGIC, Compression::Bzip2, &[(8, 0, 0)], &[0; 8], b"", 4);
        assert_matches!(apply(b"", &patch, 4), Err(Error::OutputOverflow(4)));

        // Control stream ends before the output is complete.
        let patch = build_patch(b"BSDF2\0\0\0", none, &[(2, 0, 0)], &[0; 2], b"", 4);
        assert_matches!(apply(b"", &patch, 4), Err(Error::Truncated("ctrl")));

        // Diff stream is shorter than the control entry claims.
        let patch = build_patch(b"BSDF2\0\0\0", none, &[(4, 0, 0)], &[0; 2], b"", 4);
        assert_matches!(apply(b"", &patch, 4), Err(Error::Truncated("diff")));
    }
}
