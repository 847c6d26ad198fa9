// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    ops::{Bound, RangeBounds},
};

use num_traits::PrimInt;
use thiserror::Error;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

#[derive(Debug, Error)]
#[error("{value} not in range {start}..{end}")]
pub struct OutOfBoundsError {
    pub value: String,
    pub start: String,
    pub end: String,
}

/// Ensure that `value` lies within `range`, returning it unchanged if it does.
pub fn check_bounds<T, R>(value: T, range: R) -> Result<T, OutOfBoundsError>
where
    T: PartialOrd + fmt::Display,
    R: RangeBounds<T>,
{
    if range.contains(&value) {
        return Ok(value);
    }

    let start = match range.start_bound() {
        Bound::Included(v) => v.to_string(),
        Bound::Excluded(v) => format!("({v}"),
        Bound::Unbounded => String::new(),
    };
    let end = match range.end_bound() {
        Bound::Included(v) => format!("={v}"),
        Bound::Excluded(v) => v.to_string(),
        Bound::Unbounded => String::new(),
    };

    Err(OutOfBoundsError {
        value: value.to_string(),
        start,
        end,
    })
}

/// Compute the SHA-256 digest of `data` with ring.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let mut result = [0u8; 32];
    result.copy_from_slice(digest.as_ref());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert_eq!(check_bounds(4u32, ..=4).unwrap(), 4);
        assert_eq!(check_bounds(0u32, 0..1).unwrap(), 0);

        let err = check_bounds(5u32, ..=4).unwrap_err();
        assert_eq!(err.to_string(), "5 not in range ..=4");
    }

    #[test]
    fn zero_detection() {
        assert!(is_zero(&[]));
        assert!(is_zero(&vec![0u8; ZEROS.len() * 2 + 1]));

        let mut buf = vec![0u8; ZEROS.len() + 10];
        buf[ZEROS.len() + 3] = 1;
        assert!(!is_zero(&buf));
    }
}
