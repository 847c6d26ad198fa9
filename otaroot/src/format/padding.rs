// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, Write};

use num_traits::PrimInt;

use crate::{
    stream::{ReadFixedSizeExt, WriteZerosExt},
    util,
};

/// Number of bytes needed to move `offset` up to the next multiple of
/// `page_size`.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round up to the next multiple of the page size.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    offset.checked_add(&calc(offset, page_size))
}

/// Consume padding up to the next page boundary. The padding must consist of
/// zeros since anything else could not be reproduced when the data is written
/// back out. [`Seek`] is only used for querying the position.
pub fn read_zeros(mut reader: impl Read + Seek, page_size: u64) -> io::Result<u64> {
    let pos = reader.stream_position()?;
    let padding = calc(pos, page_size);

    // Page sizes are small enough that this is never a large allocation.
    let buf = reader.read_vec_exact(padding as usize)?;
    if !util::is_zero(&buf) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Padding at offset {pos} contains non-zero bytes"),
        ));
    }

    Ok(padding)
}

/// Write zeros up to the next page boundary. [`Seek`] is only used for
/// querying the position.
pub fn write_zeros(mut writer: impl Write + Seek, page_size: u64) -> io::Result<u64> {
    let pos = writer.stream_position()?;
    let padding = calc(pos, page_size);

    writer.write_zeros_exact(padding)?;

    Ok(padding)
}

pub trait ZeroPadding {
    /// Trim trailing zeros. Zeros before the last non-zero byte are kept.
    fn trim_end_padding(&self) -> &[u8];

    /// Copy the slice into a zero-padded array. Returns [`None`] if the slice
    /// does not fit.
    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]>;
}

impl ZeroPadding for [u8] {
    fn trim_end_padding(&self) -> &[u8] {
        let end = self
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |pos| pos + 1);

        &self[..end]
    }

    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len() > N {
            return None;
        }

        let mut result = [0u8; N];
        result[..self.len()].copy_from_slice(self);

        Some(result)
    }
}
