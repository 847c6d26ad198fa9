// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
    sync::atomic::AtomicBool,
};

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use thiserror::Error;
use tracing::{Span, debug, debug_span, info, trace, warn};

use crate::{
    chain::{self, ChainImage, SigningChain},
    crypto::{KeySet, RsaSigningKey},
    format::{
        avb,
        bootimage::{self, BootImage, BootImageExt},
        payload,
    },
    manifest::DigestManifest,
    patch::{
        inject::{self, BootImagePatch},
        resign::{self, AvbImage, ResignOptions},
    },
    stream::{self, FromReader},
    util,
};

/// Classification shared by every module's error type. Format and integrity
/// errors only affect the partition they occur in. Chain and algorithm
/// mismatch errors invalidate the whole run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Format,
    Integrity,
    Chain,
    AlgorithmMismatch,
}

impl ErrorKind {
    pub fn is_run_scoped(self) -> bool {
        matches!(self, Self::Chain | Self::AlgorithmMismatch)
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Payload error")]
    Payload(#[from] payload::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Boot image patch error")]
    Inject(#[from] inject::Error),
    #[error("Re-signing error")]
    Resign(#[from] resign::Error),
    #[error("Found non-zero data after the end of the boot image at offset {0}")]
    TrailingData(usize),
    #[error("Patched image ({new} bytes) does not fit in the partition ({old} bytes)")]
    ImageTooLarge { new: usize, old: usize },
}

impl PartitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Payload(e) => e.kind(),
            Self::Avb(e) => e.kind(),
            Self::BootImage(e) => e.kind(),
            Self::Inject(e) => e.kind(),
            Self::Resign(e) => e.kind(),
            Self::TrailingData(_) | Self::ImageTooLarge { .. } => {
                ErrorKind::Format
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signing chain error")]
    Chain(#[from] chain::Error),
    #[error("Re-signing error")]
    Resign(#[source] resign::Error),
    #[error("Failed to process {name}")]
    Partition {
        name: String,
        #[source]
        source: PartitionError,
    },
    #[error("Patch target {0:?} is not in the image set")]
    MissingPatchTarget(String),
    #[error("Run was cancelled")]
    Cancelled,
}

impl Error {
    /// [`None`] if the run was cancelled.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Chain(e) => Some(e.kind()),
            Self::Resign(e) => Some(e.kind()),
            Self::Partition { source, .. } => Some(source.kind()),
            Self::MissingPatchTarget(_) => Some(ErrorKind::Chain),
            Self::Cancelled => None,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

fn check_cancel(cancel_signal: &AtomicBool) -> Result<()> {
    stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageFormat {
    BootV2,
    BootV3,
    BootV4,
    VendorBootV3,
    VendorBootV4,
    Vbmeta,
    Opaque,
}

impl ImageFormat {
    /// Identify an image by its magic and header version without fully parsing
    /// it. Boot images of unsupported versions are reported as opaque.
    pub fn detect(data: &[u8]) -> Self {
        let version_at = |offset: usize| {
            data.get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
        };

        if data.starts_with(&bootimage::BOOT_MAGIC) {
            match version_at(40) {
                Some(2) => Self::BootV2,
                Some(3) => Self::BootV3,
                Some(4) => Self::BootV4,
                _ => Self::Opaque,
            }
        } else if data.starts_with(&bootimage::VENDOR_BOOT_MAGIC) {
            match version_at(8) {
                Some(3) => Self::VendorBootV3,
                Some(4) => Self::VendorBootV4,
                _ => Self::Opaque,
            }
        } else if data.starts_with(&avb::HEADER_MAGIC) {
            Self::Vbmeta
        } else {
            Self::Opaque
        }
    }

    fn from_boot_image(boot_image: &BootImage) -> Self {
        match (boot_image.is_vendor(), boot_image.header_version()) {
            (false, 2) => Self::BootV2,
            (false, 3) => Self::BootV3,
            (false, _) => Self::BootV4,
            (true, 3) => Self::VendorBootV3,
            (true, _) => Self::VendorBootV4,
        }
    }
}

/// Per-partition processing state. Transitions only move forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Stage {
    Unparsed,
    Decoded,
    Patched,
    Rehashed,
    Signed,
    Encoded,
    Failed,
}

#[derive(Debug)]
pub struct PartitionImage {
    pub name: String,
    /// Final bytes once [`Stage::Encoded`] is reached. Until then, the input.
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub has_footer: bool,
    pub stage: Stage,
}

impl PartitionImage {
    fn new(name: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_owned(),
            format: ImageFormat::detect(&data),
            data,
            has_footer: false,
            stage: Stage::Unparsed,
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug_assert!(stage > self.stage, "{:?} -> {stage:?}", self.stage);
        trace!("{}: {:?} -> {stage:?}", self.name, self.stage);
        self.stage = stage;
    }
}

#[derive(Debug, Default)]
pub struct RunOutput {
    /// Final bytes of every partition that did not fail.
    pub images: BTreeMap<String, PartitionImage>,
    /// Partitions whose bytes differ from the input.
    pub changed: BTreeSet<String>,
    pub failures: BTreeMap<String, PartitionError>,
    pub digests: DigestManifest,
}

/// A patch to apply to a boot image partition.
pub struct PatchTarget<'a> {
    pub partition: &'a str,
    pub patcher: &'a (dyn BootImagePatch + Sync),
}

/// Decode a boot image from the data covered by its own descriptor. Anything
/// after the encoded image must be zero so that nothing is silently lost.
fn decode_boot_image(data: &[u8]) -> std::result::Result<BootImage, PartitionError> {
    let mut reader = Cursor::new(data);
    let boot_image = BootImage::from_reader(&mut reader)?;
    let end = reader.position() as usize;

    if !util::is_zero(&data[end..]) {
        return Err(PartitionError::TrailingData(end));
    }

    Ok(boot_image)
}

fn patch_boot_image(
    partition: &mut PartitionImage,
    avb_image: &mut AvbImage,
    patcher: &(dyn BootImagePatch + Sync),
    vts_key: Option<&RsaSigningKey>,
    cancel_signal: &AtomicBool,
) -> std::result::Result<(), PartitionError> {
    let mut boot_image = decode_boot_image(avb_image.data())?;
    partition.format = ImageFormat::from_boot_image(&boot_image);
    partition.advance(Stage::Decoded);

    debug!("Applying {}", patcher.patcher_name());
    patcher.patch(&mut boot_image, cancel_signal)?;

    if let BootImage::V3Through4(b) = &mut boot_image {
        match vts_key {
            Some(key) => {
                if b.resign_vts_signature(key)? {
                    debug!("Updated VTS signature");
                }
            }
            None => {
                if b.v4_extra.as_ref().is_some_and(|v4| !util::is_zero(&v4.signature)) {
                    warn!("No key available to update VTS signature");
                }
            }
        }
    }

    let mut new_data = boot_image.to_vec()?;

    if !partition.has_footer {
        let old_size = avb_image.data().len();
        if new_data.len() > old_size {
            return Err(PartitionError::ImageTooLarge {
                new: new_data.len(),
                old: old_size,
            });
        }
        new_data.resize(old_size, 0);
    }

    avb_image.set_data(new_data);
    partition.advance(Stage::Patched);

    Ok(())
}

/// Run the full pipeline over an image set: decode, inject, re-sign the chain,
/// and encode. Inputs that already failed (eg. during payload extraction) are
/// carried through as failures and cause their ancestors in the chain to fail.
pub fn run(
    inputs: BTreeMap<String, std::result::Result<Vec<u8>, PartitionError>>,
    targets: &[PatchTarget<'_>],
    keys: &KeySet,
    options: &ResignOptions,
    cancel_signal: &AtomicBool,
) -> Result<RunOutput> {
    let parent_span = Span::current();
    let mut output = RunOutput::default();

    for target in targets {
        if !inputs.contains_key(target.partition) {
            return Err(Error::MissingPatchTarget(target.partition.to_owned()));
        }
    }

    // Load AVB metadata for every partition.
    let loaded = inputs
        .into_par_iter()
        .map(|(name, input)| {
            let _span = debug_span!(parent: &parent_span, "load", name = name.as_str()).entered();

            let result = input.and_then(|data| {
                let mut partition = PartitionImage::new(&name, data);
                let avb_image = AvbImage::load(&name, partition.data.clone())?;
                partition.has_footer = avb_image.site() == chain::VbmetaSite::Appended;
                if partition.has_footer {
                    partition.format = ImageFormat::detect(avb_image.data());
                }

                Ok((partition, avb_image))
            });

            (name, result)
        })
        .collect::<Vec<_>>();

    check_cancel(cancel_signal)?;

    let mut partitions = BTreeMap::new();
    let mut avb_images = BTreeMap::new();

    for (name, result) in loaded {
        match result {
            Ok((partition, avb_image)) => {
                partitions.insert(name.clone(), partition);
                avb_images.insert(name, avb_image);
            }
            Err(e) => {
                warn!("Failed to load {name}: {e}");
                // Keep a placeholder so that chain descriptors still resolve.
                let placeholder =
                    AvbImage::load(&name, vec![]).map_err(|e| Error::Partition {
                        name: name.clone(),
                        source: e.into(),
                    })?;
                avb_images.insert(name.clone(), placeholder);
                output.failures.insert(name, e);
            }
        }
    }

    let signing_chain = {
        let chain_images = avb_images
            .values()
            .map(|i| i.as_chain_image())
            .collect::<Vec<ChainImage<'_>>>();
        SigningChain::build(&chain_images)?
    };

    let root_key = signing_chain
        .root()
        .and_then(|id| keys.get(&signing_chain.node(id).name));

    // Patch the boot images.
    let work = targets
        .iter()
        .filter(|t| !output.failures.contains_key(t.partition))
        .filter_map(|t| {
            let partition = partitions.remove(t.partition)?;
            let avb_image = avb_images.remove(t.partition)?;
            Some((t, partition, avb_image))
        })
        .collect::<Vec<_>>();

    let patch_results = work
        .into_par_iter()
        .map(|(target, mut partition, mut avb_image)| {
            let _span =
                debug_span!(parent: &parent_span, "patch", name = target.partition).entered();

            let vts_key = keys.get(target.partition).or(root_key);
            let result = patch_boot_image(
                &mut partition,
                &mut avb_image,
                target.patcher,
                vts_key,
                cancel_signal,
            );

            (target.partition, result, partition, avb_image)
        })
        .collect::<Vec<_>>();

    check_cancel(cancel_signal)?;

    for (name, result, partition, avb_image) in patch_results {
        match result {
            Ok(()) => {
                partitions.insert(name.to_owned(), partition);
            }
            Err(e) if e.kind().is_run_scoped() => {
                return Err(Error::Partition {
                    name: name.to_owned(),
                    source: e,
                });
            }
            Err(e) => {
                let mut partition = partition;
                partition.advance(Stage::Failed);
                warn!("Failed to patch {name}: {e}");
                output.failures.insert(name.to_owned(), e);
            }
        }
        avb_images.insert(name.to_owned(), avb_image);
    }

    // Recompute digests and re-sign.
    let failed = output.failures.keys().cloned().collect::<BTreeSet<_>>();
    let resign_output = resign::resign(
        &signing_chain,
        &mut avb_images,
        keys,
        options,
        &failed,
        cancel_signal,
    )
    .map_err(|e| match e {
        resign::Error::Cancelled => Error::Cancelled,
        e => Error::Resign(e),
    })?;

    for (name, e) in resign_output.failures {
        warn!("Failed to re-sign {name}: {e}");
        partitions.remove(&name);
        output.failures.insert(name, e.into());
    }

    for (name, partition) in &mut partitions {
        let Some(avb_image) = avb_images.get(name) else {
            continue;
        };

        if avb_image.is_changed() {
            partition.advance(Stage::Rehashed);
            if avb_image.header().is_some_and(|h| h.is_signed()) {
                partition.advance(Stage::Signed);
            }
        }
    }

    check_cancel(cancel_signal)?;

    // Produce the final images.
    let encoded = partitions
        .into_par_iter()
        .map(|(name, mut partition)| {
            let _span = debug_span!(parent: &parent_span, "encode", name = name.as_str()).entered();

            let result = avb_images
                .get(&name)
                .map(|i| i.encode())
                .unwrap_or_else(|| Ok(partition.data.clone()));

            match result {
                Ok(data) => {
                    partition.data = data;
                    partition.advance(Stage::Encoded);
                    Ok(partition)
                }
                Err(e) => {
                    partition.advance(Stage::Failed);
                    Err((name, PartitionError::from(e)))
                }
            }
        })
        .collect::<Vec<_>>();

    check_cancel(cancel_signal)?;

    for result in encoded {
        match result {
            Ok(partition) => {
                output.digests.insert(&partition.name, &partition.data);
                output.images.insert(partition.name.clone(), partition);
            }
            Err((name, e)) => {
                warn!("Failed to encode {name}: {e}");
                output.failures.insert(name, e);
            }
        }
    }

    output.changed = resign_output
        .changed
        .into_iter()
        .filter(|n| output.images.contains_key(n))
        .collect();

    info!(
        "Processed {} partitions: {} changed, {} failed",
        output.images.len() + output.failures.len(),
        output.changed.len(),
        output.failures.len(),
    );

    Ok(output)
}

/// Reload final images and check every signature and digest in the chain.
pub fn verify(
    images: &BTreeMap<String, Vec<u8>>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let avb_images = images
        .iter()
        .map(|(name, data)| {
            AvbImage::load(name, data.clone())
                .map(|i| (name.clone(), i))
                .map_err(|e| Error::Partition {
                    name: name.clone(),
                    source: e.into(),
                })
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let chain_images = avb_images
        .values()
        .map(|i| i.as_chain_image())
        .collect::<Vec<_>>();
    let signing_chain = SigningChain::build(&chain_images)?;

    resign::verify(&signing_chain, &avb_images, cancel_signal).map_err(|e| match e {
        resign::Error::Cancelled => Error::Cancelled,
        e => Error::Resign(e),
    })
}
