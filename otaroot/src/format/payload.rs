// SPDX-FileCopyrightText: 2022-2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Read, Seek, SeekFrom},
    ops::Range,
    sync::atomic::AtomicBool,
};

use byteorder::{BigEndian, ReadBytesExt};
use bzip2::read::BzDecoder;
use liblzma::read::XzDecoder;
use num_traits::ToPrimitive;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, debug_span, trace};

use crate::{
    format::bsdiff,
    patch::run::ErrorKind,
    stream::{self, CountingReader, FromReader, ReadDiscardExt, ReadFixedSizeExt, ReadSeek},
    util,
};

const OTA_MAGIC: &[u8; 4] = b"CrAU";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Unsupported partition operation: {0:?}")]
    UnsupportedOperation(OperationType),
    #[error("Operation #{index}: expected sha256 {expected:?}, but have {actual:?}")]
    MismatchedDigest {
        index: usize,
        expected: Option<String>,
        actual: String,
    },
    #[error("Expected partition sha256 {expected:?}, but have {actual:?}")]
    MismatchedPartitionDigest { expected: String, actual: String },
    #[error("Size of {0} ({1}) is not aligned to the block size ({2})")]
    InvalidPartitionSize(String, u64, u32),
    #[error("Operation #{index}: destination extent {start}..{end} exceeds partition size {size}")]
    DstExtentOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        size: u64,
    },
    #[error("Operation #{index}: source extent {start}..{end} exceeds base image size {size}")]
    SrcExtentOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        size: u64,
    },
    #[error("Operation #{index}: data range {start}..{end} exceeds payload blob size {size}")]
    DataOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        size: u64,
    },
    #[error("Operation #{index}: produced {actual} bytes, but destination extents hold {expected}")]
    OutputSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Operations cover {actual} bytes, but partition size is {expected}")]
    CoverageMismatch { expected: u64, actual: u64 },
    #[error("Operation #{index}: block {block} was already written by an earlier operation")]
    OverlappingExtent { index: usize, block: u64 },
    #[error("Operation #{index}: requires a base image, but none was provided")]
    MissingBaseImage { index: usize },
    #[error("Partition not found in payload: {0}")]
    MissingPartition(String),
    #[error("Partitions not found in payload: {0:?}")]
    MissingPartitions(BTreeSet<String>),
    #[error("Replacement for partition not in payload: {0}")]
    UnknownReplacement(String),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decompress operation #{index} data")]
    Decompress {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to apply bsdiff patch for operation #{index}")]
    Bsdiff {
        index: usize,
        #[source]
        source: bsdiff::Error,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Structural problems with the payload are format errors. Everything
    /// else means the reconstructed data can't be trusted.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownMagic(_) | Self::UnsupportedVersion(_) | Self::UnsupportedOperation(_) => {
                ErrorKind::Format
            }
            _ => ErrorKind::Integrity,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// The fixed portion of `payload.bin`. The manifest itself is protobuf
/// encoded and is decoded externally into a [`PayloadManifest`].
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_raw: Vec<u8>,
    pub metadata_signature_size: u32,
    pub blob_offset: u64,
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function returns,
    /// the file position is set to the beginning of the blob section.
    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *OTA_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if version != 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;
        let metadata_signature_size = reader.read_u32::<BigEndian>()?;

        let manifest_raw = reader.read_vec_exact(manifest_size)?;

        // Skip manifest signatures.
        reader.read_discard_exact(metadata_signature_size.into())?;

        Ok(Self {
            version,
            manifest_raw,
            metadata_signature_size,
            blob_offset: reader.stream_position()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Replace,
    ReplaceBz,
    Move,
    Bsdiff,
    SourceCopy,
    SourceBsdiff,
    Zero,
    Discard,
    ReplaceXz,
    Puffdiff,
    BrotliBsdiff,
    Zucchini,
    Lz4diffBsdiff,
    Lz4diffPuffdiff,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default)]
    pub data_offset: Option<u64>,
    #[serde(default)]
    pub data_length: Option<u64>,
    #[serde(default)]
    pub src_extents: Vec<Extent>,
    #[serde(default)]
    pub dst_extents: Vec<Extent>,
    /// Empty if absent.
    #[serde(default, with = "hex")]
    pub data_sha256_hash: Vec<u8>,
    /// Empty if absent.
    #[serde(default, with = "hex")]
    pub src_sha256_hash: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct PartitionInfo {
    #[serde(default)]
    pub size: Option<u64>,
    /// Empty if absent.
    #[serde(default, with = "hex")]
    pub hash: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PartitionUpdate {
    pub partition_name: String,
    #[serde(default)]
    pub new_partition_info: Option<PartitionInfo>,
    #[serde(default)]
    pub old_partition_info: Option<PartitionInfo>,
    #[serde(default)]
    pub operations: Vec<InstallOperation>,
}

/// The decoded payload manifest (`DeltaArchiveManifest`), limited to the
/// fields needed for reconstructing partition images.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PayloadManifest {
    pub block_size: u32,
    #[serde(default)]
    pub partitions: Vec<PartitionUpdate>,
}

impl PayloadManifest {
    pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
        self.partitions.iter().find(|p| p.partition_name == name)
    }

    pub fn is_full_ota(&self) -> bool {
        self.partitions.iter().all(|p| p.old_partition_info.is_none())
    }
}

/// Convert extents to byte ranges within an image of `size` bytes.
fn extent_ranges(
    extents: &[Extent],
    block_size: u32,
    size: u64,
    out_of_bounds: impl Fn(u64, u64) -> Error,
) -> Result<Vec<Range<usize>>> {
    let mut ranges = Vec::with_capacity(extents.len());

    for extent in extents {
        let start = extent
            .start_block
            .checked_mul(block_size.into())
            .ok_or(Error::IntegerTooLarge("start_block"))?;
        let end = extent
            .num_blocks
            .checked_mul(block_size.into())
            .and_then(|len| start.checked_add(len))
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;

        if end > size {
            return Err(out_of_bounds(start, end));
        }

        // Bounded by the size of an in-memory buffer.
        ranges.push(start as usize..end as usize);
    }

    Ok(ranges)
}

fn ranges_len(ranges: &[Range<usize>]) -> u64 {
    ranges.iter().map(|r| r.len() as u64).sum()
}

/// Mark the blocks covered by `ranges` as written. Every block of a partition
/// must be written by exactly one operation.
fn mark_written(
    written: &mut [bool],
    ranges: &[Range<usize>],
    block_size: u32,
    index: usize,
) -> Result<()> {
    let block_size = block_size as usize;

    for range in ranges {
        for block in range.start / block_size..range.end / block_size {
            if written[block] {
                return Err(Error::OverlappingExtent {
                    index,
                    block: block as u64,
                });
            }
            written[block] = true;
        }
    }

    Ok(())
}

/// Read the operation's data from the payload blob and check its digest.
fn read_data(
    mut reader: &mut dyn ReadSeek,
    blob_offset: u64,
    blob_size: u64,
    index: usize,
    op: &InstallOperation,
) -> Result<Vec<u8>> {
    let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let data_length = op.data_length.ok_or(Error::MissingField("data_length"))?;

    let data_end = data_offset
        .checked_add(data_length)
        .ok_or(Error::IntegerTooLarge("data_length"))?;
    if data_end > blob_size {
        return Err(Error::DataOutOfBounds {
            index,
            start: data_offset,
            end: data_end,
            size: blob_size,
        });
    }

    let in_offset = blob_offset
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("in_offset"))?;
    reader.seek(SeekFrom::Start(in_offset))?;

    let length = data_length
        .to_usize()
        .ok_or(Error::IntegerTooLarge("data_length"))?;
    let data = reader.read_vec_exact(length)?;

    check_digest(index, &op.data_sha256_hash, &data, true)?;

    Ok(data)
}

/// Check `data` against an optional expected digest. If `required` is set, a
/// missing digest is treated as a mismatch.
fn check_digest(index: usize, expected: &[u8], data: &[u8], required: bool) -> Result<()> {
    if expected.is_empty() && !required {
        return Ok(());
    }

    let digest = util::sha256(data);
    if expected != digest {
        return Err(Error::MismatchedDigest {
            index,
            expected: (!expected.is_empty()).then(|| hex::encode(expected)),
            actual: hex::encode(digest),
        });
    }

    Ok(())
}

fn decompress(index: usize, reader: impl Read, capacity: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(capacity);
    reader
        .take(capacity as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|source| Error::Decompress { index, source })?;
    Ok(data)
}

fn scatter(output: &mut [u8], ranges: &[Range<usize>], mut data: &[u8]) {
    for range in ranges {
        let (chunk, rest) = data.split_at(range.len());
        output[range.clone()].copy_from_slice(chunk);
        data = rest;
    }
}

fn gather(input: &[u8], ranges: &[Range<usize>]) -> Vec<u8> {
    let mut data = Vec::with_capacity(ranges.iter().map(|r| r.len()).sum());
    for range in ranges {
        data.extend_from_slice(&input[range.clone()]);
    }
    data
}

/// Reconstruct a partition image by applying its operations in manifest order
/// to a zero-initialized buffer. Zero and discard operations explicitly write
/// zeros, so every byte of the output is defined before it is hashed. Nothing
/// is returned unless every check passes.
pub fn apply_partition(
    reader: &mut dyn ReadSeek,
    header: &PayloadHeader,
    block_size: u32,
    partition: &PartitionUpdate,
    base_image: Option<&[u8]>,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let name = &partition.partition_name;
    let info = partition
        .new_partition_info
        .as_ref()
        .ok_or(Error::MissingField("new_partition_info"))?;
    let size = info.size.ok_or(Error::MissingField("new_partition_info.size"))?;

    if block_size == 0 || size % u64::from(block_size) != 0 {
        return Err(Error::InvalidPartitionSize(name.clone(), size, block_size));
    }

    let blob_size = reader
        .seek(SeekFrom::End(0))?
        .checked_sub(header.blob_offset)
        .ok_or(Error::IntegerTooLarge("blob_offset"))?;

    let mut output = vec![0u8; size.to_usize().ok_or(Error::IntegerTooLarge("size"))?];
    let mut written = vec![false; output.len() / block_size as usize];

    for (index, op) in partition.operations.iter().enumerate() {
        stream::check_cancel(cancel_signal)?;

        trace!(index, kind = ?op.kind, "Applying operation");

        let dst = extent_ranges(&op.dst_extents, block_size, size, |start, end| {
            Error::DstExtentOutOfBounds {
                index,
                start,
                end,
                size,
            }
        })?;
        let dst_len = ranges_len(&dst);
        mark_written(&mut written, &dst, block_size, index)?;

        let data = match op.kind {
            OperationType::Zero | OperationType::Discard => {
                for range in &dst {
                    output[range.clone()].fill(0);
                }
                continue;
            }
            OperationType::Replace => {
                read_data(reader, header.blob_offset, blob_size, index, op)?
            }
            OperationType::ReplaceBz => {
                let raw = read_data(reader, header.blob_offset, blob_size, index, op)?;
                decompress(index, BzDecoder::new(raw.as_slice()), dst_len as usize)?
            }
            OperationType::ReplaceXz => {
                let raw = read_data(reader, header.blob_offset, blob_size, index, op)?;
                decompress(index, XzDecoder::new(raw.as_slice()), dst_len as usize)?
            }
            OperationType::SourceCopy
            | OperationType::Move
            | OperationType::SourceBsdiff
            | OperationType::Bsdiff
            | OperationType::BrotliBsdiff => {
                let base = base_image.ok_or(Error::MissingBaseImage { index })?;
                let src = extent_ranges(
                    &op.src_extents,
                    block_size,
                    base.len() as u64,
                    |start, end| Error::SrcExtentOutOfBounds {
                        index,
                        start,
                        end,
                        size: base.len() as u64,
                    },
                )?;
                let src_data = gather(base, &src);
                check_digest(index, &op.src_sha256_hash, &src_data, false)?;

                if matches!(op.kind, OperationType::SourceCopy | OperationType::Move) {
                    src_data
                } else {
                    let patch = read_data(reader, header.blob_offset, blob_size, index, op)?;
                    bsdiff::apply(&src_data, &patch, dst_len)
                        .map_err(|source| Error::Bsdiff { index, source })?
                }
            }
            kind => return Err(Error::UnsupportedOperation(kind)),
        };

        if data.len() as u64 != dst_len {
            return Err(Error::OutputSizeMismatch {
                index,
                expected: dst_len,
                actual: data.len() as u64,
            });
        }

        scatter(&mut output, &dst, &data);
    }

    let covered = written.iter().filter(|w| **w).count() as u64 * u64::from(block_size);
    if covered != size {
        return Err(Error::CoverageMismatch {
            expected: size,
            actual: covered,
        });
    }

    if !info.hash.is_empty() {
        let digest = util::sha256(&output);
        if info.hash != digest {
            return Err(Error::MismatchedPartitionDigest {
                expected: hex::encode(&info.hash),
                actual: hex::encode(digest),
            });
        }
    }

    Ok(output)
}

/// Partition images produced by [`extract_images`]. Each partition succeeds or
/// fails independently.
pub type ExtractedImages = BTreeMap<String, Result<Vec<u8>>>;

/// Reconstruct the specified partitions from the payload. Partitions are
/// processed in parallel on rayon's global thread pool and `open_payload` will
/// be called from multiple threads. Partitions in `replacements` are taken as
/// is instead of being extracted, but must still exist in the payload.
pub fn extract_images<'a>(
    open_payload: impl Fn() -> io::Result<Box<dyn ReadSeek>> + Sync,
    header: &PayloadHeader,
    manifest: &PayloadManifest,
    partition_names: impl IntoIterator<Item = &'a str>,
    base_images: &BTreeMap<String, Vec<u8>>,
    mut replacements: BTreeMap<String, Vec<u8>>,
    cancel_signal: &AtomicBool,
) -> Result<ExtractedImages> {
    let requested = partition_names.into_iter().collect::<BTreeSet<_>>();

    let missing = requested
        .iter()
        .filter(|n| manifest.partition(n).is_none())
        .map(|n| (*n).to_owned())
        .collect::<BTreeSet<_>>();
    if !missing.is_empty() {
        return Err(Error::MissingPartitions(missing));
    }

    if let Some(name) = replacements
        .keys()
        .find(|n| manifest.partition(n).is_none())
    {
        return Err(Error::UnknownReplacement(name.clone()));
    }

    let mut images = ExtractedImages::new();
    let mut to_extract = vec![];

    for name in requested {
        match replacements.remove(name) {
            Some(data) => {
                debug!("Using replacement image for {name}");
                images.insert(name.to_owned(), Ok(data));
            }
            None => to_extract.push(name),
        }
    }

    let extracted = to_extract
        .into_par_iter()
        .map(|name| {
            let _span = debug_span!("extract", partition = name).entered();

            let result = (|| -> Result<Vec<u8>> {
                let partition = manifest
                    .partition(name)
                    .ok_or_else(|| Error::MissingPartition(name.to_owned()))?;
                let mut reader = open_payload()?;

                apply_partition(
                    &mut *reader,
                    header,
                    manifest.block_size,
                    partition,
                    base_images.get(name).map(|d| d.as_slice()),
                    cancel_signal,
                )
            })();

            match &result {
                Ok(data) => debug!("Extracted {} bytes", data.len()),
                Err(e) => debug!("Extraction failed: {e}"),
            }

            (name.to_owned(), result)
        })
        .collect::<Vec<_>>();

    images.extend(extracted);

    Ok(images)
}
