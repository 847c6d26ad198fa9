// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Job description for `otaroot patch`. Relative paths are resolved against
//! the directory containing the job file.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    crypto::PassphraseSource,
    patch::{
        inject::{FragmentMeta, InjectMode},
        resign::ResignOptions,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read job file: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse job file: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Key {name:?} has both passphrase_env and passphrase_file")]
    AmbiguousPassphrase { name: String },
    #[error("Partition {0:?} is listed in both replace and base_images")]
    ReplacedBaseImage(String),
    #[error("root_patch and prepatched cannot be used together")]
    ConflictingPatches,
    #[error("prepatched.ignore_compat must be between 0 and 2: {0}")]
    InvalidIgnoreCompat(u8),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Salt(#[serde(with = "hex")] pub Vec<u8>);

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    pub path: PathBuf,
    pub passphrase_env: Option<String>,
    pub passphrase_file: Option<PathBuf>,
}

impl KeyConfig {
    pub fn passphrase_source(&self) -> PassphraseSource {
        PassphraseSource::new(
            &self.path,
            self.passphrase_file.as_deref(),
            self.passphrase_env.as_deref(),
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootPatchConfig {
    pub partition: String,
    pub ramdisk: PathBuf,
    #[serde(default)]
    pub mode: InjectMode,
    #[serde(default)]
    pub fragment: FragmentMeta,
}

/// A boot image that was already patched by an external tool.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepatchedConfig {
    pub partition: String,
    pub image: PathBuf,
    /// Number of compatibility check levels to downgrade to warnings.
    #[serde(default)]
    pub ignore_compat: u8,
}

impl PrepatchedConfig {
    pub const MAX_IGNORE_COMPAT: u8 = 2;

    pub fn fatal_level(&self) -> u8 {
        self.ignore_compat + 1
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Raw `payload.bin` stream.
    pub payload: PathBuf,
    /// Payload manifest, already decoded into TOML form.
    pub manifest: PathBuf,
    pub output_dir: PathBuf,
    pub digest_manifest: Option<PathBuf>,
    #[serde(default)]
    pub clear_vbmeta_flags: bool,
    /// Partitions to process. If unset, the vbmeta partitions, everything they
    /// chain load, and the boot patch target are processed.
    pub partitions: Option<Vec<String>>,
    #[serde(default)]
    pub replace: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub base_images: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyConfig>,
    pub root_patch: Option<RootPatchConfig>,
    pub prepatched: Option<PrepatchedConfig>,
    #[serde(default)]
    pub salts: BTreeMap<String, Salt>,
}

impl JobConfig {
    pub fn from_toml(data: &str, path: &Path) -> Result<Self> {
        let mut config: Self =
            toml_edit::de::from_str(data).map_err(|e| Error::Parse(path.to_owned(), e))?;

        for (name, key) in &config.keys {
            if key.passphrase_env.is_some() && key.passphrase_file.is_some() {
                return Err(Error::AmbiguousPassphrase { name: name.clone() });
            }
        }

        if let Some(name) = config
            .replace
            .keys()
            .find(|n| config.base_images.contains_key(*n))
        {
            return Err(Error::ReplacedBaseImage(name.clone()));
        }

        if let Some(prepatched) = &config.prepatched {
            if config.root_patch.is_some() {
                return Err(Error::ConflictingPatches);
            } else if prepatched.ignore_compat > PrepatchedConfig::MAX_IGNORE_COMPAT {
                return Err(Error::InvalidIgnoreCompat(prepatched.ignore_compat));
            }
        }

        if let Some(parent) = path.parent() {
            config.resolve_paths(parent);
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Self::from_toml(&data, path)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        resolve(&mut self.payload);
        resolve(&mut self.manifest);
        resolve(&mut self.output_dir);
        self.digest_manifest.iter_mut().for_each(resolve);
        self.replace.values_mut().for_each(resolve);
        self.base_images.values_mut().for_each(resolve);

        for key in self.keys.values_mut() {
            resolve(&mut key.path);
            key.passphrase_file.iter_mut().for_each(resolve);
        }

        if let Some(root_patch) = &mut self.root_patch {
            resolve(&mut root_patch.ramdisk);
        }

        if let Some(prepatched) = &mut self.prepatched {
            resolve(&mut prepatched.image);
        }
    }

    pub fn resign_options(&self) -> ResignOptions {
        ResignOptions {
            salts: self
                .salts
                .iter()
                .map(|(n, s)| (n.clone(), s.0.clone()))
                .collect(),
            clear_vbmeta_flags: self.clear_vbmeta_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::patch::inject::FragmentType;

    use super::*;

    const JOB: &str = r#"
        payload = "payload.bin"
        manifest = "manifest.toml"
        output_dir = "/tmp/out"
        partitions = ["vbmeta", "vendor_boot"]

        [replace]
        vbmeta = "vbmeta.img"

        [keys.vbmeta]
        path = "avb.key"
        passphrase_env = "AVB_PASS"

        [root_patch]
        partition = "vendor_boot"
        ramdisk = "root.cpio"
        fragment = { type = "recovery", name = "root" }

        [salts]
        vendor_boot = "00112233"
    "#;

    #[test]
    fn parse_job() {
        let config = JobConfig::from_toml(JOB, Path::new("/jobs/job.toml")).unwrap();

        assert_eq!(config.payload, Path::new("/jobs/payload.bin"));
        assert_eq!(config.output_dir, Path::new("/tmp/out"));
        assert_eq!(config.replace["vbmeta"], Path::new("/jobs/vbmeta.img"));
        assert_eq!(config.keys["vbmeta"].path, Path::new("/jobs/avb.key"));
        assert!(!config.clear_vbmeta_flags);

        let root_patch = config.root_patch.as_ref().unwrap();
        assert_eq!(root_patch.mode, InjectMode::Append);
        assert_eq!(root_patch.fragment.ramdisk_type, FragmentType::Recovery);
        assert_eq!(root_patch.ramdisk, Path::new("/jobs/root.cpio"));

        let options = config.resign_options();
        assert_eq!(options.salts["vendor_boot"], [0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn reject_invalid_jobs() {
        let path = Path::new("job.toml");

        assert_matches!(
            JobConfig::from_toml("payload = \"p\"\nunknown = 1\n", path),
            Err(Error::Parse(_, _))
        );

        let ambiguous = r#"
            payload = "p"
            manifest = "m"
            output_dir = "o"
            [keys.vbmeta]
            path = "k"
            passphrase_env = "E"
            passphrase_file = "f"
        "#;
        assert_matches!(
            JobConfig::from_toml(ambiguous, path),
            Err(Error::AmbiguousPassphrase { name }) if name == "vbmeta"
        );

        let both = format!("{JOB}\n[prepatched]\npartition = \"boot\"\nimage = \"p.img\"\n");
        assert_matches!(JobConfig::from_toml(&both, path), Err(Error::ConflictingPatches));

        let level = r#"
            payload = "p"
            manifest = "m"
            output_dir = "o"
            [prepatched]
            partition = "init_boot"
            image = "magisk_patched.img"
            ignore_compat = 3
        "#;
        assert_matches!(JobConfig::from_toml(level, path), Err(Error::InvalidIgnoreCompat(3)));
    }

    #[test]
    fn parse_prepatched_job() {
        let job = r#"
            payload = "payload.bin"
            manifest = "manifest.toml"
            output_dir = "out"
            [prepatched]
            partition = "init_boot"
            image = "magisk_patched.img"
            ignore_compat = 1
        "#;
        let config = JobConfig::from_toml(job, Path::new("/jobs/job.toml")).unwrap();

        let prepatched = config.prepatched.as_ref().unwrap();
        assert_eq!(prepatched.partition, "init_boot");
        assert_eq!(prepatched.image, Path::new("/jobs/magisk_patched.img"));
        assert_eq!(prepatched.fatal_level(), 2);
        assert!(config.root_patch.is_none());
    }
}
