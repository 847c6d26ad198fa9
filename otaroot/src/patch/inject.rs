// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Cursor, Read},
    sync::atomic::AtomicBool,
};

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{
        bootimage::{
            self, BootImage, BootImageExt, RamdiskMeta, VENDOR_RAMDISK_NAME_SIZE,
            VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE,
        },
        compression::{self, CompressedReader},
    },
    patch::run::ErrorKind,
    stream::{self, FromReader},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Root patch ramdisk is empty")]
    EmptyPayload,
    #[error("Vendor boot v4 images only support appending a new ramdisk fragment")]
    ReplaceUnsupported,
    #[error("Fragment name is too long (>{VENDOR_RAMDISK_NAME_SIZE}): {0:?}")]
    FragmentNameTooLong(String),
    #[error("Vendor boot v3 image has {0} ramdisks instead of 1")]
    InvalidRamdiskCount(usize),
    #[error("Failed to load prepatched boot image")]
    PrepatchedLoad(#[source] bootimage::Error),
    #[error("Boot image ({original}) and prepatched image ({prepatched}) are different types")]
    PrepatchedTypeMismatch {
        original: &'static str,
        prepatched: &'static str,
    },
    #[error("The prepatched boot image is not compatible with the original:{0}")]
    PrepatchedIncompatible(String),
    #[error("Failed to detect kernel compression")]
    KernelCompression(#[from] compression::Error),
    #[error("Failed to decompress kernel")]
    KernelDecompress(#[source] io::Error),
    #[error("Invalid kernel version pattern")]
    KernelVersionPattern(#[from] regex::Error),
    #[error("Patching was cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Format
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectMode {
    /// Substitute the existing ramdisk.
    Replace,
    /// Concatenate after the existing ramdisk. The kernel unpacks every cpio
    /// archive in the ramdisk in order.
    #[default]
    Append,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    None,
    #[default]
    Platform,
    Recovery,
    Dlkm,
}

impl FragmentType {
    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => bootimage::VENDOR_RAMDISK_TYPE_NONE,
            Self::Platform => bootimage::VENDOR_RAMDISK_TYPE_PLATFORM,
            Self::Recovery => bootimage::VENDOR_RAMDISK_TYPE_RECOVERY,
            Self::Dlkm => bootimage::VENDOR_RAMDISK_TYPE_DLKM,
        }
    }
}

/// Metadata for the fragment appended to vendor v4 ramdisk tables.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FragmentMeta {
    #[serde(rename = "type", default)]
    pub ramdisk_type: FragmentType,
    pub name: String,
    #[serde(default)]
    pub board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

impl Default for FragmentMeta {
    fn default() -> Self {
        Self {
            ramdisk_type: FragmentType::default(),
            name: "root".to_owned(),
            board_id: [0; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
        }
    }
}

/// An opaque root framework ramdisk and how to merge it into a boot image.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RootPatch {
    pub ramdisk: Vec<u8>,
    pub mode: InjectMode,
    pub fragment: FragmentMeta,
}

pub trait BootImagePatch {
    fn patcher_name(&self) -> &'static str;

    fn patch(&self, boot_image: &mut BootImage, cancel_signal: &AtomicBool) -> Result<()>;
}

/// Inject a root framework's ramdisk. Only ramdisk sections are modified. The
/// kernel, dtb, command line, and all other header fields are left untouched.
pub struct RootInjector {
    root_patch: RootPatch,
}

impl RootInjector {
    pub fn new(root_patch: RootPatch) -> Self {
        Self { root_patch }
    }

    pub fn inject(boot_image: &mut BootImage, root_patch: &RootPatch) -> Result<()> {
        if root_patch.ramdisk.is_empty() {
            return Err(Error::EmptyPayload);
        }

        let payload = &root_patch.ramdisk;

        let merge = |ramdisk: &mut Vec<u8>| match root_patch.mode {
            InjectMode::Replace => ramdisk.clone_from(payload),
            InjectMode::Append => ramdisk.extend_from_slice(payload),
        };

        match boot_image {
            BootImage::V2(b) => merge(&mut b.ramdisk),
            BootImage::V3Through4(b) => merge(&mut b.ramdisk),
            BootImage::VendorV3Through4(b) => match &mut b.v4_extra {
                None => {
                    if b.ramdisks.is_empty() {
                        b.ramdisks.push(payload.clone());
                    } else if let [ramdisk] = b.ramdisks.as_mut_slice() {
                        merge(ramdisk);
                    } else {
                        return Err(Error::InvalidRamdiskCount(b.ramdisks.len()));
                    }
                }
                Some(v4) => {
                    if root_patch.mode == InjectMode::Replace {
                        return Err(Error::ReplaceUnsupported);
                    }

                    let fragment = &root_patch.fragment;
                    if fragment.name.len() >= VENDOR_RAMDISK_NAME_SIZE {
                        return Err(Error::FragmentNameTooLong(fragment.name.clone()));
                    }

                    v4.ramdisk_metas.push(RamdiskMeta {
                        ramdisk_type: fragment.ramdisk_type.to_raw(),
                        ramdisk_name: fragment.name.clone(),
                        board_id: fragment.board_id,
                    });
                    b.ramdisks.push(payload.clone());
                }
            },
        }

        debug!(
            "Injected {:?} root ramdisk into boot v{} image ({:?})",
            NumBytes(payload.len()),
            boot_image.header_version(),
            root_patch.mode,
        );

        Ok(())
    }
}

impl BootImagePatch for RootInjector {
    fn patcher_name(&self) -> &'static str {
        "RootInjector"
    }

    fn patch(&self, boot_image: &mut BootImage, cancel_signal: &AtomicBool) -> Result<()> {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        Self::inject(boot_image, &self.root_patch)
    }
}

/// Replace the boot image with one that was already patched by an external
/// tool. The replacement is compatible if every non-size header field matches
/// and the same sections are present. The ramdisk may be added where the
/// original had none.
#[derive(Debug)]
pub struct PrepatchedImagePatcher {
    prepatched: BootImage,
    fatal_level: u8,
}

impl PrepatchedImagePatcher {
    const MIN_LEVEL: u8 = 0;
    const MAX_LEVEL: u8 = 2;

    /// Upper bound for decompressed kernels when searching for the version.
    const MAX_KERNEL_SIZE: u64 = 256 * 1024 * 1024;

    // Compiled without Unicode support, so [0-9] instead of \d.
    const VERSION_REGEX: &'static str =
        r"Linux version ([0-9]+\.[0-9]+).[0-9]+-(android[0-9]+)-([0-9]+)-";

    /// Issues at or above `fatal_level` fail the patch. Lower levels are only
    /// logged.
    pub fn new(data: &[u8], fatal_level: u8) -> Result<Self> {
        let prepatched = BootImage::from_reader(Cursor::new(data)).map_err(Error::PrepatchedLoad)?;

        Ok(Self {
            prepatched,
            fatal_level: fatal_level.min(Self::MAX_LEVEL + 1),
        })
    }

    /// Extract the kernel module interface version (eg. `6.1-android14-11`)
    /// from the kernel's version banner.
    fn kmi_version(kernel: &[u8]) -> Result<Option<String>> {
        let mut decompressed = vec![];
        CompressedReader::new(Cursor::new(kernel), true)?
            .take(Self::MAX_KERNEL_SIZE)
            .read_to_end(&mut decompressed)
            .map_err(Error::KernelDecompress)?;

        let regex = Regex::new(Self::VERSION_REGEX)?;
        let Some(captures) = regex.captures(&decompressed) else {
            return Ok(None);
        };

        let kmi_version = captures
            .iter()
            // Capture #0 is the entire match.
            .skip(1)
            .flatten()
            .map(|c| String::from_utf8_lossy(c.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join("-");

        Ok(Some(kmi_version))
    }

    fn image_type(boot_image: &BootImage) -> &'static str {
        match boot_image {
            BootImage::V2(_) => "boot v2",
            BootImage::V3Through4(_) => "boot v3/v4",
            BootImage::VendorV3Through4(_) => "vendor_boot",
        }
    }

    fn non_empty(data: &[u8]) -> Option<&[u8]> {
        (!data.is_empty()).then_some(data)
    }
}

impl BootImagePatch for PrepatchedImagePatcher {
    fn patcher_name(&self) -> &'static str {
        "PrepatchedImagePatcher"
    }

    fn patch(&self, boot_image: &mut BootImage, cancel_signal: &AtomicBool) -> Result<()> {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        // Level 0: differences that don't affect booting
        // Level 1: differences that may affect booting
        // Level 2: differences that are very likely to affect booting
        let mut issues = [vec![], vec![], vec![]];

        macro_rules! check {
            ($level:literal, $old:expr, $new:expr $(,)?) => {
                let old_val = $old;
                let new_val = $new;

                if old_val != new_val {
                    issues[$level].push(format!(
                        "Field differs: {} ({:?}) -> {} ({:?})",
                        stringify!($old),
                        old_val,
                        stringify!($new),
                        new_val,
                    ));
                }
            };
        }

        let kernels = match (&*boot_image, &self.prepatched) {
            (BootImage::V2(old), BootImage::V2(new)) => {
                check!(2, old.kernel_addr, new.kernel_addr);
                check!(2, old.ramdisk_addr, new.ramdisk_addr);
                check!(2, old.second_addr, new.second_addr);
                check!(2, old.tags_addr, new.tags_addr);
                check!(2, old.page_size, new.page_size);
                check!(0, old.os_version, new.os_version);
                check!(0, &old.name, &new.name);
                check!(1, &old.cmdline, &new.cmdline);
                check!(0, &old.id, &new.id);
                check!(1, &old.extra_cmdline, &new.extra_cmdline);
                check!(2, old.kernel.is_empty(), new.kernel.is_empty());
                check!(2, old.second.is_empty(), new.second.is_empty());
                check!(2, old.recovery_dtbo_offset, new.recovery_dtbo_offset);
                check!(2, old.recovery_dtbo.is_empty(), new.recovery_dtbo.is_empty());
                check!(2, old.dtb_addr, new.dtb_addr);
                check!(2, old.dtb.is_empty(), new.dtb.is_empty());

                if !old.ramdisk.is_empty() || new.ramdisk.is_empty() {
                    check!(2, old.ramdisk.is_empty(), new.ramdisk.is_empty());
                }

                Self::non_empty(&old.kernel).zip(Self::non_empty(&new.kernel))
            }
            (BootImage::V3Through4(old), BootImage::V3Through4(new)) => {
                check!(2, old.header_version(), new.header_version());
                check!(0, old.os_version, new.os_version);
                check!(0, old.reserved, new.reserved);
                check!(1, &old.cmdline, &new.cmdline);
                check!(2, old.kernel.is_empty(), new.kernel.is_empty());

                if !old.ramdisk.is_empty() || new.ramdisk.is_empty() {
                    check!(2, old.ramdisk.is_empty(), new.ramdisk.is_empty());
                }

                Self::non_empty(&old.kernel).zip(Self::non_empty(&new.kernel))
            }
            (BootImage::VendorV3Through4(old), BootImage::VendorV3Through4(new)) => {
                check!(2, old.page_size, new.page_size);
                check!(2, old.kernel_addr, new.kernel_addr);
                check!(2, old.ramdisk_addr, new.ramdisk_addr);
                check!(1, &old.cmdline, &new.cmdline);
                check!(2, old.tags_addr, new.tags_addr);
                check!(0, &old.name, &new.name);
                check!(2, old.dtb.is_empty(), new.dtb.is_empty());
                check!(2, old.dtb_addr, new.dtb_addr);
                check!(2, old.ramdisks.len(), new.ramdisks.len());

                if let (Some(old_v4), Some(new_v4)) = (&old.v4_extra, &new.v4_extra) {
                    check!(2, &old_v4.ramdisk_metas, &new_v4.ramdisk_metas);
                    check!(2, &old_v4.bootconfig, &new_v4.bootconfig);
                }

                None
            }
            (old, new) => {
                return Err(Error::PrepatchedTypeMismatch {
                    original: Self::image_type(old),
                    prepatched: Self::image_type(new),
                });
            }
        };

        if let Some((old_kernel, new_kernel)) = kernels {
            let old_kmi_version = Self::kmi_version(old_kernel)?;
            let new_kmi_version = Self::kmi_version(new_kernel)?;

            check!(2, old_kmi_version, new_kmi_version);
        }

        let mut warnings = vec![];
        let mut errors = vec![];

        for level in Self::MIN_LEVEL..self.fatal_level {
            warnings.extend(&issues[level as usize]);
        }
        for level in self.fatal_level..=Self::MAX_LEVEL {
            errors.extend(&issues[level as usize]);
        }

        if !warnings.is_empty() {
            let mut msg =
                "The prepatched boot image may not be compatible with the original:".to_owned();
            for warning in warnings {
                msg.push_str("\n- ");
                msg.push_str(warning);
            }

            warn!("{msg}");
        }

        if !errors.is_empty() {
            let mut msg = String::new();
            for error in errors {
                msg.push_str("\n- ");
                msg.push_str(error);
            }

            return Err(Error::PrepatchedIncompatible(msg));
        }

        debug!(
            "Replacing boot v{} image with prepatched image",
            boot_image.header_version(),
        );

        boot_image.clone_from(&self.prepatched);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::{Compression, write::GzEncoder};

    use crate::format::bootimage::{
        BootImageV2, BootImageV3Through4, V4Extra, VendorBootImageV3Through4, VendorV4Extra,
    };

    use super::*;

    fn root_patch(mode: InjectMode) -> RootPatch {
        RootPatch {
            ramdisk: b"ROOT".to_vec(),
            mode,
            fragment: FragmentMeta::default(),
        }
    }

    fn boot_v4() -> BootImage {
        BootImage::V3Through4(BootImageV3Through4 {
            os_version: 0x1234,
            reserved: [0; 4],
            cmdline: "console=ttyS0".to_owned(),
            v4_extra: Some(V4Extra {
                signature: vec![0; 4096],
            }),
            kernel: b"kernel".to_vec(),
            ramdisk: b"ramdisk".to_vec(),
        })
    }

    fn vendor_boot(v4: bool) -> BootImage {
        BootImage::VendorV3Through4(VendorBootImageV3Through4 {
            page_size: 4096,
            kernel_addr: 0x1000,
            ramdisk_addr: 0x2000,
            cmdline: "androidboot.hardware=test".to_owned(),
            tags_addr: 0x3000,
            name: "test".to_owned(),
            dtb: b"dtb".to_vec(),
            dtb_addr: 0x4000,
            ramdisks: vec![b"first".to_vec()],
            v4_extra: v4.then(|| VendorV4Extra {
                ramdisk_metas: vec![RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_PLATFORM,
                    ramdisk_name: String::new(),
                    board_id: [0; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
                }],
                bootconfig: String::new(),
            }),
        })
    }

    #[test]
    fn replace_and_append_boot_ramdisk() {
        let mut image = boot_v4();
        RootInjector::inject(&mut image, &root_patch(InjectMode::Append)).unwrap();
        let BootImage::V3Through4(b) = &image else { unreachable!() };
        assert_eq!(b.ramdisk, b"ramdiskROOT");
        assert_eq!(b.kernel, b"kernel");
        assert_eq!(b.cmdline, "console=ttyS0");

        RootInjector::inject(&mut image, &root_patch(InjectMode::Replace)).unwrap();
        let BootImage::V3Through4(b) = &image else { unreachable!() };
        assert_eq!(b.ramdisk, b"ROOT");
    }

    #[test]
    fn boot_v2_only_ramdisk_changes() {
        let original = BootImageV2 {
            kernel_addr: 0x8000,
            ramdisk_addr: 0x100_0000,
            second_addr: 0xf0_0000,
            tags_addr: 0x100,
            page_size: 2048,
            os_version: 0,
            name: String::new(),
            cmdline: String::new(),
            id: [0; 8],
            extra_cmdline: String::new(),
            recovery_dtbo_offset: 0,
            dtb_addr: 0x1f0_0000,
            kernel: b"kernel".to_vec(),
            ramdisk: b"ramdisk".to_vec(),
            second: vec![],
            recovery_dtbo: vec![],
            dtb: b"dtb".to_vec(),
        };
        let mut image = BootImage::V2(original.clone());

        RootInjector::inject(&mut image, &root_patch(InjectMode::Replace)).unwrap();

        let expected = BootImageV2 {
            ramdisk: b"ROOT".to_vec(),
            ..original
        };
        assert_eq!(image, BootImage::V2(expected));
    }

    #[test]
    fn vendor_v4_appends_fragment() {
        let mut image = vendor_boot(true);
        let BootImage::VendorV3Through4(before) = image.clone() else { unreachable!() };

        RootInjector::inject(&mut image, &root_patch(InjectMode::Append)).unwrap();

        let BootImage::VendorV3Through4(after) = &image else { unreachable!() };
        assert_eq!(after.ramdisks, [b"first".to_vec(), b"ROOT".to_vec()]);
        assert_eq!(after.dtb, before.dtb);

        let metas = &after.v4_extra.as_ref().unwrap().ramdisk_metas;
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0], before.v4_extra.as_ref().unwrap().ramdisk_metas[0]);
        assert_eq!(metas[1].ramdisk_name, "root");
        assert_eq!(metas[1].ramdisk_type, bootimage::VENDOR_RAMDISK_TYPE_PLATFORM);
    }

    #[test]
    fn vendor_v3_appends_to_single_ramdisk() {
        let mut image = vendor_boot(false);
        RootInjector::inject(&mut image, &root_patch(InjectMode::Append)).unwrap();

        let BootImage::VendorV3Through4(b) = &image else { unreachable!() };
        assert_eq!(b.ramdisks, [b"firstROOT".to_vec()]);
    }

    #[test]
    fn rejected_patches() {
        let mut image = vendor_boot(true);
        assert_matches!(
            RootInjector::inject(&mut image, &root_patch(InjectMode::Replace)),
            Err(Error::ReplaceUnsupported)
        );

        let empty = RootPatch {
            ramdisk: vec![],
            ..root_patch(InjectMode::Append)
        };
        assert_matches!(RootInjector::inject(&mut image, &empty), Err(Error::EmptyPayload));
        assert_eq!(image, vendor_boot(true));
    }

    fn with_boot_v4(f: impl FnOnce(&mut BootImageV3Through4)) -> BootImage {
        let mut image = boot_v4();
        let BootImage::V3Through4(b) = &mut image else { unreachable!() };
        f(b);
        image
    }

    fn prepatched(image: &BootImage, fatal_level: u8) -> PrepatchedImagePatcher {
        PrepatchedImagePatcher::new(&image.to_vec().unwrap(), fatal_level).unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(vec![], Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn prepatched_replaces_compatible_image() {
        let patched = with_boot_v4(|b| b.ramdisk = b"patched ramdisk".to_vec());
        let patcher = prepatched(&patched, 1);

        let mut image = boot_v4();
        patcher.patch(&mut image, &AtomicBool::new(false)).unwrap();
        assert_eq!(image, patched);

        // A ramdisk may be added, but not removed.
        let mut image = with_boot_v4(|b| b.ramdisk.clear());
        patcher.patch(&mut image, &AtomicBool::new(false)).unwrap();
        assert_eq!(image, patched);

        let patcher = prepatched(&with_boot_v4(|b| b.ramdisk.clear()), 1);
        let mut image = boot_v4();
        assert_matches!(
            patcher.patch(&mut image, &AtomicBool::new(false)),
            Err(Error::PrepatchedIncompatible(m)) if m.contains("ramdisk.is_empty()")
        );
        assert_eq!(image, boot_v4());
    }

    #[test]
    fn prepatched_fatal_level() {
        let cmdline = with_boot_v4(|b| b.cmdline = "console=ttyS1".to_owned());
        let os_version = with_boot_v4(|b| b.os_version = 0x5678);

        for (patched, fatal_level, ok) in [
            (&cmdline, 1, false),
            (&cmdline, 2, true),
            (&os_version, 0, false),
            (&os_version, 1, true),
        ] {
            let mut image = boot_v4();
            let patcher = prepatched(patched, fatal_level);
            let result = patcher.patch(&mut image, &AtomicBool::new(false));

            if ok {
                assert_matches!(result, Ok(()));
                assert_eq!(&image, patched);
            } else {
                assert_matches!(result, Err(Error::PrepatchedIncompatible(_)));
                assert_eq!(image, boot_v4());
            }
        }
    }

    #[test]
    fn prepatched_kernel_version() {
        let banner = |version: &str| format!("\0Linux version {version}-gabcdef (build)\0");
        let android14 = banner("6.1.57-android14-11");
        let android13 = banner("5.15.110-android13-8");

        assert_eq!(
            PrepatchedImagePatcher::kmi_version(android14.as_bytes()).unwrap().as_deref(),
            Some("6.1-android14-11"),
        );
        assert_eq!(
            PrepatchedImagePatcher::kmi_version(&gzip(android13.as_bytes())).unwrap().as_deref(),
            Some("5.15-android13-8"),
        );
        assert_eq!(PrepatchedImagePatcher::kmi_version(b"kernel").unwrap(), None);

        let original = with_boot_v4(|b| b.kernel = android14.as_bytes().to_vec());

        // Same version, different compression.
        let patched = with_boot_v4(|b| b.kernel = gzip(android14.as_bytes()));
        let mut image = original.clone();
        prepatched(&patched, 1).patch(&mut image, &AtomicBool::new(false)).unwrap();
        assert_eq!(image, patched);

        let patched = with_boot_v4(|b| b.kernel = android13.as_bytes().to_vec());
        let mut image = original.clone();
        assert_matches!(
            prepatched(&patched, 2).patch(&mut image, &AtomicBool::new(false)),
            Err(Error::PrepatchedIncompatible(m)) if m.contains("kmi_version")
        );

        // Everything is a warning once the highest level is ignored.
        prepatched(&patched, 3).patch(&mut image, &AtomicBool::new(false)).unwrap();
        assert_eq!(image, patched);
    }

    #[test]
    fn prepatched_type_mismatch() {
        let patcher = prepatched(&boot_v4(), 0);
        let mut image = vendor_boot(true);

        assert_matches!(
            patcher.patch(&mut image, &AtomicBool::new(false)),
            Err(Error::PrepatchedTypeMismatch {
                original: "vendor_boot",
                prepatched: "boot v3/v4",
            })
        );

        assert_matches!(
            PrepatchedImagePatcher::new(b"not a boot image", 0),
            Err(Error::PrepatchedLoad(_))
        );
    }
}
