// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info_span};

use crate::{
    cli::{status, warning},
    config::JobConfig,
    crypto::{self, KeySet},
    format::{
        avb::{self, Descriptor},
        payload::{self, ExtractedImages, PayloadHeader, PayloadManifest},
    },
    patch::{
        inject::{BootImagePatch, PrepatchedImagePatcher, RootInjector, RootPatch},
        run::{self, PartitionError, PatchTarget},
    },
    stream::{FromReader, ReadSeek},
};

fn joined(into_iter: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    into_iter
        .into_iter()
        .map(|s| s.as_ref().to_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read file: {path:?}"))
}

fn read_files(paths: &BTreeMap<String, PathBuf>) -> Result<BTreeMap<String, Vec<u8>>> {
    paths
        .iter()
        .map(|(name, path)| Ok((name.clone(), read_file(path)?)))
        .collect()
}

fn load_keys(config: &JobConfig) -> Result<KeySet> {
    let mut keys = KeySet::new();

    for (name, key_config) in &config.keys {
        let key = crypto::read_pem_key_file(&key_config.path, &key_config.passphrase_source())
            .with_context(|| format!("Failed to load key for {name}: {:?}", key_config.path))?;

        keys.insert(name, key.into());
    }

    Ok(keys)
}

/// Names of partitions chain loaded by the vbmeta images that were extracted
/// successfully.
fn chained_partitions(images: &ExtractedImages) -> BTreeSet<String> {
    images
        .values()
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|data| avb::parse_vbmeta(data).ok())
        .flat_map(|header| header.descriptors)
        .filter_map(|d| match d {
            Descriptor::ChainPartition(c) => Some(c.partition_name),
            _ => None,
        })
        .collect()
}

/// Reconstruct the image set. If the job doesn't list the partitions, start
/// from the vbmeta partitions and pull in everything they chain load until
/// nothing new is found.
fn extract_image_set(
    config: &JobConfig,
    header: &PayloadHeader,
    manifest: &PayloadManifest,
    cancel_signal: &AtomicBool,
) -> Result<ExtractedImages> {
    let open_payload = || -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(BufReader::new(File::open(&config.payload)?)))
    };

    let base_images = read_files(&config.base_images)?;
    let mut replacements = read_files(&config.replace)?;

    let mut pending = match &config.partitions {
        Some(p) => p.iter().cloned().collect::<BTreeSet<_>>(),
        None => manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.clone())
            .filter(|n| n.starts_with("vbmeta"))
            .collect(),
    };
    if let Some(root_patch) = &config.root_patch {
        pending.insert(root_patch.partition.clone());
    }
    if let Some(prepatched) = &config.prepatched {
        pending.insert(prepatched.partition.clone());
    }

    let mut images = ExtractedImages::new();

    while !pending.is_empty() {
        status!("Extracting from the payload: {}", joined(&pending));

        let batch_replacements = pending
            .iter()
            .filter_map(|n| replacements.remove_entry(n))
            .collect();

        let extracted = payload::extract_images(
            open_payload,
            header,
            manifest,
            pending.iter().map(|n| n.as_str()),
            &base_images,
            batch_replacements,
            cancel_signal,
        )
        .context("Failed to extract partitions from payload")?;

        images.extend(extracted);

        if config.partitions.is_some() {
            break;
        }

        // Chain descriptors naming partitions that aren't in the payload are
        // left for the signing chain to report.
        pending = chained_partitions(&images)
            .into_iter()
            .filter(|n| !images.contains_key(n) && manifest.partition(n).is_some())
            .collect();
    }

    if let Some(name) = replacements.keys().next() {
        bail!("Replacement image for {name} is not part of the image set");
    }

    Ok(images)
}

pub fn patch_main(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let start = Instant::now();

    let config = JobConfig::load(&cli.config)?;
    let keys = load_keys(&config)?;

    let header = PayloadHeader::from_reader(BufReader::new(
        File::open(&config.payload)
            .with_context(|| format!("Failed to open payload: {:?}", config.payload))?,
    ))
    .context("Failed to load payload header")?;

    let manifest_raw = fs::read_to_string(&config.manifest)
        .with_context(|| format!("Failed to read manifest: {:?}", config.manifest))?;
    let manifest: PayloadManifest = toml_edit::de::from_str(&manifest_raw)
        .with_context(|| format!("Failed to parse manifest: {:?}", config.manifest))?;

    if !manifest.is_full_ota() && config.base_images.is_empty() {
        warning!("Payload is incremental, but no base images were provided");
    }

    let images = extract_image_set(&config, &header, &manifest, cancel_signal)?;

    let mut patchers: Vec<(&str, Box<dyn BootImagePatch + Sync>)> = vec![];

    if let Some(r) = &config.root_patch {
        let root_patch = RootPatch {
            ramdisk: read_file(&r.ramdisk)?,
            mode: r.mode,
            fragment: r.fragment.clone(),
        };

        patchers.push((r.partition.as_str(), Box::new(RootInjector::new(root_patch)) as _));
    }

    if let Some(p) = &config.prepatched {
        let patcher = PrepatchedImagePatcher::new(&read_file(&p.image)?, p.fatal_level())
            .with_context(|| format!("Failed to load prepatched image: {:?}", p.image))?;

        patchers.push((p.partition.as_str(), Box::new(patcher) as _));
    }

    let targets = patchers
        .iter()
        .map(|(partition, patcher)| PatchTarget {
            partition,
            patcher: &**patcher,
        })
        .collect::<Vec<_>>();

    let inputs = images
        .into_iter()
        .map(|(name, result)| (name, result.map_err(PartitionError::from)))
        .collect();

    status!("Patching and re-signing partitions");

    let output = {
        let _span = info_span!("run").entered();
        run::run(
            inputs,
            &targets,
            &keys,
            &config.resign_options(),
            cancel_signal,
        )?
    };

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", config.output_dir))?;

    for (name, partition) in &output.images {
        let path = config.output_dir.join(format!("{name}.img"));
        let changed = if output.changed.contains(name) { "changed" } else { "unchanged" };

        debug!("Writing {name} ({changed}) to {path:?}");
        fs::write(&path, &partition.data)
            .with_context(|| format!("Failed to write image: {path:?}"))?;
    }

    status!("Changed partitions: {}", joined(&output.changed));

    if let Some(path) = &config.digest_manifest {
        let data = output.digests.to_toml()?;
        fs::write(path, data)
            .with_context(|| format!("Failed to write digest manifest: {path:?}"))?;
    }

    if !output.failures.is_empty() {
        let names = joined(output.failures.keys());

        for (name, e) in output.failures {
            warning!("{name}: {:?}", anyhow::Error::new(e));
        }

        bail!("Failed to process: {names}");
    }

    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Patch and re-sign the boot-critical partitions of an OTA payload.
#[derive(Debug, Parser)]
pub struct PatchCli {
    /// Path to job file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub config: PathBuf,
}
