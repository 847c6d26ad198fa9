// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::AtomicBool,
};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;
use tracing::{Span, debug, debug_span, trace};

use crate::{
    chain::{ChainImage, NodeId, SigningChain, VbmetaSite},
    crypto::KeySet,
    format::avb::{
        self, AlgorithmType, AppendedDescriptorMut, AppendedDescriptorRef, Descriptor, Footer,
        Header,
    },
    patch::run::ErrorKind,
    stream,
};

/// Standalone vbmeta images are padded to this size.
const VBMETA_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{child} descriptor ({actual}) in {parent} must be {expected}")]
    DescriptorMismatch {
        parent: String,
        child: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{child} is a standalone vbmeta image and must be signed to be loaded by {parent}")]
    UnsignedStandaloneChild { parent: String, child: String },
    #[error("No signing key provided for {0}")]
    MissingKey(String),
    #[error("{name}: {key_bits}-bit key does not match algorithm {algorithm:?}")]
    AlgorithmMismatch {
        name: String,
        algorithm: AlgorithmType,
        key_bits: usize,
    },
    #[error("Verified boot is disabled by {name}'s header flags: {flags:#x}")]
    VbmetaFlagsSet { name: String, flags: u32 },
    #[error("{parent} cannot be updated because its descendant {child} failed")]
    ChildFailed { parent: String, child: String },
    #[error("{child}'s public key does not match the chain descriptor in {parent}")]
    ChainKeyMismatch { parent: String, child: String },
    #[error("{0} is part of the chain, but not the image set")]
    MissingImage(String),
    #[error("AVB error for {name}")]
    Avb {
        name: String,
        #[source]
        source: avb::Error,
    },
    #[error("Re-signing was cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DescriptorMismatch { .. }
            | Self::UnsignedStandaloneChild { .. }
            | Self::MissingKey(_)
            | Self::VbmetaFlagsSet { .. }
            | Self::MissingImage(_)
            | Self::Cancelled => ErrorKind::Chain,
            Self::AlgorithmMismatch { .. } => ErrorKind::AlgorithmMismatch,
            Self::ChildFailed { .. } | Self::ChainKeyMismatch { .. } => ErrorKind::Integrity,
            Self::Avb { source, .. } => source.kind(),
        }
    }

    /// Whether the error invalidates the entire run instead of one partition.
    pub fn is_run_scoped(&self) -> bool {
        self.kind().is_run_scoped()
    }
}

type Result<T> = std::result::Result<T, Error>;

fn avb_error(name: &str) -> impl FnOnce(avb::Error) -> Error + '_ {
    move |source| Error::Avb {
        name: name.to_owned(),
        source,
    }
}

#[derive(Clone, Debug)]
pub enum Vbmeta {
    None,
    Root(Header),
    Appended { header: Header, footer: Footer },
}

/// The AVB view of one partition: the raw bytes as loaded, the data covered by
/// its own descriptor and any vbmeta structure it carries.
#[derive(Clone, Debug)]
pub struct AvbImage {
    name: String,
    raw: Vec<u8>,
    data: Vec<u8>,
    vbmeta: Vbmeta,
    tree: Option<Vec<u8>>,
    data_changed: bool,
    header_changed: bool,
}

impl AvbImage {
    /// Detect whether `raw` is a standalone vbmeta image, an image with an
    /// appended vbmeta footer, or plain data.
    pub fn load(name: &str, raw: Vec<u8>) -> std::result::Result<Self, avb::Error> {
        let (data, vbmeta) = if raw.starts_with(&avb::HEADER_MAGIC) {
            (vec![], Vbmeta::Root(avb::parse_vbmeta(&raw)?))
        } else {
            match avb::parse_footer(&raw) {
                Ok((footer, header)) => {
                    // parse_footer() already checked this against the size.
                    let data = raw[..footer.original_image_size as usize].to_vec();
                    (data, Vbmeta::Appended { header, footer })
                }
                Err(avb::Error::InvalidFooterMagic(_) | avb::Error::TooSmallForFooter(_)) => {
                    (raw.clone(), Vbmeta::None)
                }
                Err(e) => return Err(e),
            }
        };

        Ok(Self {
            name: name.to_owned(),
            raw,
            data,
            vbmeta,
            tree: None,
            data_changed: false,
            header_changed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bytes as originally loaded.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Data covered by the image's own descriptor. For images without vbmeta,
    /// this is the entire image. Standalone vbmeta images have no data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn vbmeta(&self) -> &Vbmeta {
        &self.vbmeta
    }

    pub fn header(&self) -> Option<&Header> {
        match &self.vbmeta {
            Vbmeta::None => None,
            Vbmeta::Root(h) | Vbmeta::Appended { header: h, .. } => Some(h),
        }
    }

    pub fn site(&self) -> VbmetaSite {
        match self.vbmeta {
            Vbmeta::None => VbmetaSite::None,
            Vbmeta::Root(_) => VbmetaSite::Root,
            Vbmeta::Appended { .. } => VbmetaSite::Appended,
        }
    }

    /// Replace the data. Identical data is not considered a change.
    pub fn set_data(&mut self, data: Vec<u8>) {
        if data != self.data {
            self.data = data;
            self.data_changed = true;
        }
    }

    pub fn is_changed(&self) -> bool {
        self.data_changed || self.header_changed
    }

    pub fn as_chain_image(&self) -> ChainImage<'_> {
        ChainImage {
            name: &self.name,
            site: self.site(),
            header: self.header(),
        }
    }

    fn set_header(&mut self, new_header: Header) {
        match &mut self.vbmeta {
            Vbmeta::None => {}
            Vbmeta::Root(h) | Vbmeta::Appended { header: h, .. } => *h = new_header,
        }
        self.header_changed = true;
    }

    /// Produce the final partition bytes. Unchanged images are returned as
    /// they were loaded.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, avb::Error> {
        if !self.is_changed() {
            return Ok(self.raw.clone());
        }

        match &self.vbmeta {
            Vbmeta::None => {
                let mut data = self.data.clone();
                if data.len() < self.raw.len() {
                    data.resize(self.raw.len(), 0);
                }
                Ok(data)
            }
            Vbmeta::Root(header) => {
                avb::write_root_image(header, VBMETA_BLOCK_SIZE, self.raw.len() as u64)
            }
            Vbmeta::Appended { header, footer } => {
                let mut footer = footer.clone();
                let partition_size = Some(self.raw.len() as u64);

                match (&self.tree, self.data_changed) {
                    (Some(tree), _) => {
                        let mut image = self.data.clone();
                        image.extend_from_slice(tree);
                        avb::write_appended_image(&image, header, &mut footer, partition_size)
                    }
                    (None, true) => {
                        avb::write_appended_image(&self.data, header, &mut footer, partition_size)
                    }
                    // The data and any hash tree are still in place.
                    (None, false) => {
                        avb::write_appended_image(&self.raw, header, &mut footer, partition_size)
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResignOptions {
    /// Replacement salts for the hash or hash tree descriptors of specific
    /// partitions. All other salts are preserved.
    pub salts: BTreeMap<String, Vec<u8>>,
    /// Clear vbmeta header flags that disable AVB instead of failing.
    pub clear_vbmeta_flags: bool,
}

#[derive(Debug, Default)]
pub struct ResignOutput {
    /// Partitions whose final bytes differ from the input.
    pub changed: BTreeSet<String>,
    /// Partition-scoped failures. Ancestors of a failed partition also fail.
    pub failures: BTreeMap<String, Error>,
}

struct NodeUpdate {
    header: Option<Header>,
    tree: Option<Vec<u8>>,
}

/// Set the salt to the replacement, if any. Returns whether it changed.
fn rotate_salt(salt: &mut Vec<u8>, replacement: Option<&Vec<u8>>) -> bool {
    match replacement {
        Some(r) if r != salt => {
            salt.clone_from(r);
            true
        }
        _ => false,
    }
}

/// Get the text before the first equal sign in the kernel command line if it is
/// not empty.
fn cmdline_prefix(cmdline: &str) -> Option<&str> {
    let (prefix, _) = cmdline.split_once('=')?;
    if prefix.is_empty() {
        return None;
    }

    Some(prefix)
}

/// Point the parent's descriptor for `child` at the child's current state:
/// the public key for signed children, a copy of the self-descriptor for
/// unsigned children, or a digest over the raw data for images without vbmeta.
fn update_security_descriptor(
    parent_header: &mut Header,
    parent_name: &str,
    child: &AvbImage,
) -> Result<()> {
    let child_name = child.name();
    let mismatch = |expected, actual| Error::DescriptorMismatch {
        parent: parent_name.to_owned(),
        child: child_name.to_owned(),
        expected,
        actual,
    };

    // The edge only exists because the descriptor does.
    let parent_descriptor = parent_header
        .descriptor_for_mut(child_name)
        .ok_or_else(|| mismatch("present", "missing"))?;
    let parent_type = parent_descriptor.type_name();

    match child.vbmeta() {
        Vbmeta::Root(h) | Vbmeta::Appended { header: h, .. } if h.is_signed() => {
            match parent_descriptor {
                Descriptor::ChainPartition(pd) => pd.public_key.clone_from(&h.public_key),
                _ => return Err(mismatch("ChainPartition", parent_type)),
            }
        }
        Vbmeta::Root(_) => {
            return Err(Error::UnsignedStandaloneChild {
                parent: parent_name.to_owned(),
                child: child_name.to_owned(),
            });
        }
        Vbmeta::Appended { header, .. } => {
            let child_descriptor = header
                .appended_descriptor()
                .map_err(avb_error(child_name))?;

            match (parent_descriptor, child_descriptor) {
                (Descriptor::Hash(pd), AppendedDescriptorRef::Hash(cd)) => {
                    pd.clone_from(cd);
                }
                (Descriptor::HashTree(pd), AppendedDescriptorRef::HashTree(cd)) => {
                    pd.clone_from(cd);
                }
                (_, AppendedDescriptorRef::Hash(_)) => return Err(mismatch("Hash", parent_type)),
                (_, AppendedDescriptorRef::HashTree(_)) => {
                    return Err(mismatch("HashTree", parent_type));
                }
            }
        }
        Vbmeta::None => match parent_descriptor {
            Descriptor::Hash(pd) => pd.update(child.data()).map_err(avb_error(parent_name))?,
            _ => return Err(mismatch("Hash", parent_type)),
        },
    }

    Ok(())
}

/// Merge property descriptors and kernel command line descriptors from an
/// unsigned child into the parent. Properties are matched by key and command
/// lines by the non-empty text left of the first equal sign.
fn update_metadata_descriptors(parent_header: &mut Header, child: &AvbImage) {
    let Vbmeta::Appended {
        header: child_header,
        ..
    } = child.vbmeta()
    else {
        return;
    };
    if child_header.is_signed() {
        return;
    }

    for child_descriptor in &child_header.descriptors {
        match child_descriptor {
            Descriptor::Property(cd) => {
                let existing = parent_header.descriptors.iter_mut().find_map(|d| match d {
                    Descriptor::Property(p) if p.key == cd.key => Some(p),
                    _ => None,
                });

                match existing {
                    Some(pd) => pd.value.clone_from(&cd.value),
                    None => parent_header
                        .descriptors
                        .push(Descriptor::Property(cd.clone())),
                }
            }
            Descriptor::KernelCmdline(cd) => {
                let Some(prefix) = cmdline_prefix(&cd.cmdline) else {
                    continue;
                };

                let existing = parent_header.descriptors.iter_mut().find_map(|d| match d {
                    Descriptor::KernelCmdline(p) if cmdline_prefix(&p.cmdline) == Some(prefix) => {
                        Some(p)
                    }
                    _ => None,
                });

                match existing {
                    Some(pd) => pd.cmdline.clone_from(&cd.cmdline),
                    None => parent_header
                        .descriptors
                        .push(Descriptor::KernelCmdline(cd.clone())),
                }
            }
            _ => {}
        }
    }
}

fn process_node(
    chain: &SigningChain,
    id: NodeId,
    images: &BTreeMap<String, AvbImage>,
    changed: &BTreeSet<NodeId>,
    keys: &KeySet,
    options: &ResignOptions,
    cancel_signal: &AtomicBool,
) -> Result<Option<NodeUpdate>> {
    let node = chain.node(id);
    let name = node.name.as_str();
    let image = images
        .get(name)
        .ok_or_else(|| Error::MissingImage(name.to_owned()))?;

    let Some(orig_header) = image.header() else {
        return Ok(None);
    };
    let mut header = orig_header.clone();
    let mut tree = None;

    if header.flags != 0 {
        if options.clear_vbmeta_flags {
            debug!("Clearing header flags: {:#x}", header.flags);
            header.flags = 0;
        } else {
            return Err(Error::VbmetaFlagsSet {
                name: name.to_owned(),
                flags: header.flags,
            });
        }
    }

    if image.site() == VbmetaSite::Appended {
        let salt = options.salts.get(name);

        match header.appended_descriptor_mut().map_err(avb_error(name))? {
            AppendedDescriptorMut::Hash(d) => {
                if rotate_salt(&mut d.salt, salt) || image.data_changed {
                    d.update(image.data()).map_err(avb_error(name))?;
                }
            }
            AppendedDescriptorMut::HashTree(d) => {
                if rotate_salt(&mut d.salt, salt) || image.data_changed {
                    let new_tree = d
                        .update(image.data(), cancel_signal)
                        .map_err(avb_error(name))?;
                    tree = Some(new_tree);
                }
            }
        }
    }

    for child_id in node.children.iter().filter(|c| changed.contains(*c)) {
        let child_name = &chain.node(*child_id).name;
        let child = images
            .get(child_name)
            .ok_or_else(|| Error::MissingImage(child_name.clone()))?;

        trace!("Updating descriptor for child: {child_name}");
        update_security_descriptor(&mut header, name, child)?;
        update_metadata_descriptors(&mut header, child);
    }

    if header == *orig_header && tree.is_none() {
        return Ok(None);
    }

    if header.is_signed() {
        let key = keys
            .get(name)
            .ok_or_else(|| Error::MissingKey(name.to_owned()))?;

        // libavb computes the key length from the algorithm, so a key of a
        // different size can never verify.
        if 8 + 2 * key.size() != header.algorithm_type.public_key_len() {
            return Err(Error::AlgorithmMismatch {
                name: name.to_owned(),
                algorithm: header.algorithm_type,
                key_bits: key.size() * 8,
            });
        }

        debug!("Signing vbmeta header");
        header.sign(key).map_err(avb_error(name))?;
    }

    Ok(Some(NodeUpdate {
        header: Some(header),
        tree,
    }))
}

/// Mark every ancestor of `id` as failed, naming `id` as the cause.
fn fail_ancestors(
    chain: &SigningChain,
    id: NodeId,
    failed_ids: &mut BTreeSet<NodeId>,
    failures: &mut BTreeMap<String, Error>,
) {
    let child = &chain.node(id).name;

    for ancestor in chain.ancestors(id) {
        if failed_ids.insert(ancestor) {
            let parent = chain.node(ancestor).name.clone();
            debug!("Skipping {parent} because {child} failed");

            failures.insert(
                parent.clone(),
                Error::ChildFailed {
                    parent,
                    child: child.clone(),
                },
            );
        }
    }
}

/// Recompute digests and re-sign the chain bottom-up. Only nodes whose inputs
/// changed are touched. Partitions listed in `failed` have already failed in an
/// earlier stage and cause their ancestors to fail too.
pub fn resign(
    chain: &SigningChain,
    images: &mut BTreeMap<String, AvbImage>,
    keys: &KeySet,
    options: &ResignOptions,
    failed: &BTreeSet<String>,
    cancel_signal: &AtomicBool,
) -> Result<ResignOutput> {
    let parent_span = Span::current();
    let mut output = ResignOutput::default();
    let mut changed = BTreeSet::new();
    let mut failed_ids = failed
        .iter()
        .filter_map(|n| chain.find(n))
        .collect::<BTreeSet<_>>();

    for id in failed_ids.clone() {
        fail_ancestors(chain, id, &mut failed_ids, &mut output.failures);
    }

    for layer in chain.layers() {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        let shared_images = &*images;
        let shared_changed = &changed;
        let shared_failed = &failed_ids;

        let results = layer
            .par_iter()
            .filter(|id| !shared_failed.contains(*id))
            .map(|&id| {
                let name = chain.node(id).name.as_str();
                let _span = debug_span!(parent: &parent_span, "resign", name).entered();

                let result = process_node(
                    chain,
                    id,
                    shared_images,
                    shared_changed,
                    keys,
                    options,
                    cancel_signal,
                );

                (id, result)
            })
            .collect::<Vec<_>>();

        for (id, result) in results {
            let name = &chain.node(id).name;
            let Some(image) = images.get_mut(name) else {
                return Err(Error::MissingImage(name.clone()));
            };

            match result {
                Ok(Some(update)) => {
                    if let Some(header) = update.header {
                        image.set_header(header);
                    }
                    image.tree = update.tree;
                }
                Ok(None) => {}
                Err(e) if e.is_run_scoped() => return Err(e),
                Err(e) => {
                    failed_ids.insert(id);
                    output.failures.insert(name.clone(), e);
                    fail_ancestors(chain, id, &mut failed_ids, &mut output.failures);
                    continue;
                }
            }

            if image.is_changed() {
                changed.insert(id);
                output.changed.insert(name.clone());
            }
        }
    }

    Ok(output)
}

/// Check every signature and every parent to child edge in the chain against
/// the images as loaded.
pub fn verify(
    chain: &SigningChain,
    images: &BTreeMap<String, AvbImage>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for node in chain.nodes() {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        let image = images
            .get(&node.name)
            .ok_or_else(|| Error::MissingImage(node.name.clone()))?;
        let Some(header) = image.header() else {
            continue;
        };
        let name = node.name.as_str();

        header.verify().map_err(avb_error(name))?;

        if image.site() == VbmetaSite::Appended {
            match header.appended_descriptor().map_err(avb_error(name))? {
                AppendedDescriptorRef::Hash(d) => d.verify(image.raw()),
                AppendedDescriptorRef::HashTree(d) => d.verify(image.raw(), cancel_signal),
            }
            .map_err(avb_error(name))?;
        }

        for child_id in &node.children {
            let child_name = chain.node(*child_id).name.as_str();
            let child = images
                .get(child_name)
                .ok_or_else(|| Error::MissingImage(child_name.to_owned()))?;

            match header.descriptor_for(child_name) {
                Some(Descriptor::ChainPartition(d)) => {
                    let matches = child
                        .header()
                        .is_some_and(|h| h.is_signed() && h.public_key == d.public_key);
                    if !matches {
                        return Err(Error::ChainKeyMismatch {
                            parent: name.to_owned(),
                            child: child_name.to_owned(),
                        });
                    }
                }
                Some(Descriptor::Hash(d)) => d.verify(child.raw()).map_err(avb_error(name))?,
                Some(Descriptor::HashTree(d)) => d
                    .verify(child.raw(), cancel_signal)
                    .map_err(avb_error(name))?,
                _ => {}
            }
        }

        trace!("Verified {name}");
    }

    Ok(())
}
