// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::debug;

use crate::{
    cli::{status, warning},
    manifest::DigestManifest,
    patch::run,
};

/// Load every `<partition>.img` file in a directory.
fn load_images(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut images = BTreeMap::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list directory: {dir:?}"))? {
        let entry = entry.with_context(|| format!("Failed to list directory: {dir:?}"))?;
        let path = entry.path();

        if path.extension().is_none_or(|e| e != "img") {
            continue;
        }

        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warning!("Skipping file with non-UTF-8 name: {path:?}");
            continue;
        };

        debug!("Loading {name} from {path:?}");
        let data = fs::read(&path).with_context(|| format!("Failed to read image: {path:?}"))?;
        images.insert(name.to_owned(), data);
    }

    Ok(images)
}

pub fn verify_main(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let images = load_images(&cli.input_dir)?;
    if images.is_empty() {
        bail!("No images found in {:?}", cli.input_dir);
    }

    status!("Verifying signing chain of {} partitions", images.len());

    run::verify(&images, cancel_signal).context("Signing chain verification failed")?;

    if let Some(path) = &cli.digest_manifest {
        status!("Verifying digests from {path:?}");

        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read digest manifest: {path:?}"))?;
        let manifest = DigestManifest::from_toml(&data)
            .with_context(|| format!("Failed to load digest manifest: {path:?}"))?;

        for name in manifest.sha256.keys() {
            if !images.contains_key(name) {
                bail!("{name} is listed in the digest manifest, but has no image");
            }
        }

        for (name, data) in &images {
            manifest.verify(name, data)?;
        }
    }

    status!("Successfully verified all partitions");

    Ok(())
}

/// Verify the signatures and digests of a directory of partition images.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Directory containing `<partition>.img` files.
    #[arg(short, long, value_name = "DIR", value_parser)]
    pub input_dir: PathBuf,

    /// Digest manifest written by `otaroot patch`.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub digest_manifest: Option<PathBuf>,
}
