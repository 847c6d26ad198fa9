// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! dm-verity style hash trees over in-memory partition data.

use std::{
    io,
    ops::Range,
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};
use ring::digest::{Algorithm, Context};
use thiserror::Error;

use crate::{format::padding, patch::run::ErrorKind, stream};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash tree should have size {expected} for input size {input}, but has size {actual}")]
    InvalidHashTreeSize {
        input: u64,
        expected: usize,
        actual: usize,
    },
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("Stored hash tree does not match the data")]
    InvalidHashTree,
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRootDigest { .. } | Self::InvalidHashTree => ErrorKind::Integrity,
            Self::InvalidHashTreeSize { .. } | Self::FieldOutOfBounds(_) | Self::Io(_) => {
                ErrorKind::Format
            }
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

pub struct HashTree {
    block_size: u32,
    salted_context: Context,
}

impl HashTree {
    pub fn new(block_size: u32, algorithm: &'static Algorithm, salt: &[u8]) -> Self {
        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        Self {
            block_size,
            salted_context,
        }
    }

    fn digest_size(&self) -> usize {
        self.salted_context
            .algorithm()
            .output_len()
            .next_power_of_two()
    }

    /// Compute the byte ranges of each tree level within the hash tree data,
    /// bottom level first. The bottom level is stored at the end of the data.
    pub fn compute_level_offsets(&self, image_size: u64) -> Result<Vec<Range<usize>>> {
        let block_size = u64::from(self.block_size);
        let digest_size = self.digest_size() as u64;
        let mut ranges = vec![];
        let mut level_size = image_size;

        while level_size > block_size {
            let blocks = level_size.div_ceil(block_size);
            level_size = blocks
                .checked_mul(digest_size)
                .and_then(|s| padding::round(s, block_size))
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            let size = level_size
                .to_usize()
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            ranges.push(0..size);
        }

        let mut offset = 0;
        for range in ranges.iter_mut().rev() {
            let size = range.end;
            *range = offset..offset + size;
            offset += size;
        }

        Ok(ranges)
    }

    /// Hash consecutive blocks of `input` into `level_data`. The final block
    /// is zero padded and every digest slot is padded to a power of two.
    fn hash_level(
        &self,
        input: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_size = self.digest_size();
        let mut buf = vec![0u8; self.block_size as usize];

        for (block, slot) in input
            .chunks(self.block_size as usize)
            .zip(level_data.chunks_exact_mut(digest_size))
        {
            stream::check_cancel(cancel_signal)?;

            buf[..block.len()].copy_from_slice(block);
            buf[block.len()..].fill(0);

            let mut context = self.salted_context.clone();
            context.update(&buf);
            let digest = context.finish();

            slot[..digest.as_ref().len()].copy_from_slice(digest.as_ref());
            slot[digest.as_ref().len()..].fill(0);
        }

        Ok(())
    }

    /// Hash the leaf level in parallel chunks.
    fn hash_leaves_parallel(
        &self,
        input: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        const BLOCKS_PER_TASK: usize = 1024;

        let block_size = self.block_size as usize;
        let digest_size = self.digest_size();

        level_data
            .par_chunks_mut(digest_size * BLOCKS_PER_TASK)
            .enumerate()
            .map(|(chunk, out_data)| {
                let start = (chunk * BLOCKS_PER_TASK * block_size).min(input.len());
                let end = (start + BLOCKS_PER_TASK * block_size).min(input.len());

                self.hash_level(&input[start..end], out_data, cancel_signal)
            })
            .collect()
    }

    /// Generate the hash tree for `data`. Returns the root digest and the tree.
    /// Inputs no larger than one block have an empty tree and the root digest
    /// is the salted digest of the data itself.
    pub fn generate(&self, data: &[u8], cancel_signal: &AtomicBool) -> Result<(Vec<u8>, Vec<u8>)> {
        let image_size = data.len() as u64;

        if image_size <= u64::from(self.block_size) {
            let mut context = self.salted_context.clone();
            context.update(data);

            return Ok((context.finish().as_ref().to_vec(), vec![]));
        }

        let offsets = self.compute_level_offsets(image_size)?;
        let tree_size = offsets.first().map_or(0, |r| r.end);
        let mut tree = vec![0u8; tree_size];

        for (i, range) in offsets.iter().enumerate() {
            let (front, back) = tree.split_at_mut(range.end);
            let level_data = &mut front[range.clone()];

            if i == 0 {
                self.hash_leaves_parallel(data, level_data, cancel_signal)?;
            } else {
                let prev = &offsets[i - 1];
                let prev_data = &back[..prev.end - prev.start];

                self.hash_level(prev_data, level_data, cancel_signal)?;
            }
        }

        let top = offsets
            .last()
            .cloned()
            .ok_or(Error::FieldOutOfBounds("levels"))?;
        let mut context = self.salted_context.clone();
        context.update(&tree[top]);

        Ok((context.finish().as_ref().to_vec(), tree))
    }

    /// Check both the root digest and the stored tree against `data`.
    pub fn verify(
        &self,
        data: &[u8],
        root_digest: &[u8],
        tree: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let (expected_root, expected_tree) = self.generate(data, cancel_signal)?;

        if tree.len() != expected_tree.len() {
            return Err(Error::InvalidHashTreeSize {
                input: data.len() as u64,
                expected: expected_tree.len(),
                actual: tree.len(),
            });
        }

        if root_digest != expected_root {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(root_digest),
                actual: hex::encode(&expected_root),
            });
        }

        if tree != expected_tree {
            return Err(Error::InvalidHashTree);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ring::digest::SHA256;

    use super::*;

    #[test]
    fn level_offsets() {
        let tree = HashTree::new(4096, &SHA256, b"");

        assert!(tree.compute_level_offsets(4096).unwrap().is_empty());
        // 2 blocks -> 64 bytes of digests -> one padded block.
        assert_eq!(tree.compute_level_offsets(8192).unwrap(), [0..4096]);
        // 129 blocks need two leaf blocks and one top-level block.
        assert_eq!(
            tree.compute_level_offsets(129 * 4096).unwrap(),
            [4096..12288, 0..4096],
        );
    }

    #[test]
    fn small_input_is_hashed_directly() {
        let cancel_signal = AtomicBool::new(false);
        let tree = HashTree::new(4096, &SHA256, b"salt");

        let (root, data) = tree.generate(b"tiny", &cancel_signal).unwrap();
        assert!(data.is_empty());

        let mut context = Context::new(&SHA256);
        context.update(b"salt");
        context.update(b"tiny");
        assert_eq!(root, context.finish().as_ref());
    }

    #[test]
    fn generate_and_verify() {
        let cancel_signal = AtomicBool::new(false);
        let tree = HashTree::new(4096, &SHA256, b"salt");
        let mut data = vec![0u8; 300 * 4096 + 17];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let (root, hash_tree) = tree.generate(&data, &cancel_signal).unwrap();
        tree.verify(&data, &root, &hash_tree, &cancel_signal).unwrap();

        data[5000] ^= 1;
        assert_matches!(
            tree.verify(&data, &root, &hash_tree, &cancel_signal),
            Err(Error::InvalidRootDigest { .. })
        );
    }

    #[test]
    fn salt_changes_root() {
        let cancel_signal = AtomicBool::new(false);
        let data = vec![7u8; 3 * 4096];

        let (a, _) = HashTree::new(4096, &SHA256, b"a")
            .generate(&data, &cancel_signal)
            .unwrap();
        let (b, _) = HashTree::new(4096, &SHA256, b"b")
            .generate(&data, &cancel_signal)
            .unwrap();
        assert_ne!(a, b);
    }
}
