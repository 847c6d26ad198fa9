// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, Write},
    mem,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use ring::digest::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto::RsaSigningKey,
    format::{
        avb::{self, Descriptor, Header},
        padding::{self, ZeroPadding},
    },
    patch::run::ErrorKind,
    stream::{
        CountingReader, CountingWriter, FromReader, HashingWriter, ReadFixedSizeExt, ToWriter,
    },
    util::{self, NumBytes, OutOfBoundsError},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

pub const VENDOR_BOOT_MAGIC: [u8; 8] = *b"VNDRBOOT";
pub const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
pub const VENDOR_BOOT_NAME_SIZE: usize = 16;

pub const VENDOR_RAMDISK_TYPE_NONE: u32 = 0;
pub const VENDOR_RAMDISK_TYPE_PLATFORM: u32 = 1;
pub const VENDOR_RAMDISK_TYPE_RECOVERY: u32 = 2;
pub const VENDOR_RAMDISK_TYPE_DLKM: u32 = 3;
pub const VENDOR_RAMDISK_NAME_SIZE: usize = 32;
pub const VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE: usize = 16;

/// Page size for boot v3 and v4 images, which have no page size field.
pub const PAGE_SIZE: u32 = 4096;

const HDR_V4_SIGNATURE_SIZE: u32 = 4096;

/// Offset of the header version field in boot images of every version.
const BOOT_HEADER_VERSION_OFFSET: usize = 40;
/// Offset of the header version field in vendor boot images.
const VENDOR_HEADER_VERSION_OFFSET: usize = 8;

/// Maximum size of any individual boot image component, like the kernel. No
/// known device has a boot image anywhere near this large.
const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;
/// Maximum size of the bootconfig component in vendor v4 images.
const BOOTCONFIG_MAX_SIZE: u32 = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {:?}", .0.as_bstr())]
    UnknownMagic([u8; 8]),
    #[error("Unknown {kind} header version: {version}")]
    UnknownHeaderVersion { kind: &'static str, version: u32 },
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
    #[error("{0:?} field is too long (>{1}): {2:?}")]
    StringTooLong(&'static str, usize, String),
    #[error("{0:?} field is out of bounds")]
    IntOutOfBounds(&'static str, #[source] OutOfBoundsError),
    #[error("{0:?} overflowed integer bounds during calculations")]
    IntOverflow(&'static str),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size for boot image type: {actual} != {expected}")]
    InvalidHeaderSize { actual: u32, expected: u64 },
    #[error("Mismatched ramdisk ({ramdisks}) and metadata ({metas}) counts")]
    MismatchedRamdiskCounts { ramdisks: usize, metas: usize },
    #[error("Vendor V3 only supports a single ramdisk (count: {0})")]
    VendorV3TooManyRamdisks(usize),
    #[error("Invalid vendor v4 total ramdisk size: {field_value} != {total_size}")]
    VendorV4InvalidRamdiskSize { field_value: u32, total_size: u32 },
    #[error("Invalid vendor v4 ramdisk table size: {actual} != {expected}")]
    VendorV4InvalidRamdiskTableSize { actual: u32, expected: u32 },
    #[error("Invalid vendor v4 ramdisk entry size: {0}")]
    VendorV4InvalidRamdiskEntrySize(u32),
    #[error("Invalid vendor v4 ramdisk entry [{index}] offset: {field_value} != {expected}")]
    VendorV4InvalidRamdiskEntryOffset {
        index: u32,
        field_value: u32,
        expected: u64,
    },
    #[error("VTS signature is missing hash descriptor")]
    MissingHashDescriptor,
    #[error("VTS signature ({new} bytes) no longer fits in its {old} byte region")]
    VtsSignatureTooLarge { old: usize, new: usize },
    #[error("Failed to load VTS AVB signature")]
    VtsAvbLoad(#[source] avb::Error),
    #[error("Failed to save VTS AVB signature")]
    VtsAvbSave(#[source] avb::Error),
    #[error("Failed to generate VTS AVB signature")]
    VtsAvbSign(#[source] avb::Error),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write boot image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VtsAvbLoad(e) | Self::VtsAvbSave(e) | Self::VtsAvbSign(e) => e.kind(),
            _ => ErrorKind::Format,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

pub trait BootImageExt {
    fn header_version(&self) -> u32;

    fn header_size(&self) -> u32;
}

fn parse_string(data: &[u8], field: &'static str) -> Result<String> {
    let data = data.trim_end_padding();

    str::from_utf8(data)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, e, data.to_vec()))
}

fn pad_string<const N: usize>(data: &str, field: &'static str) -> Result<[u8; N]> {
    data.as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, N, data.to_owned()))
}

fn check_component(size: usize, field: &'static str) -> Result<u32> {
    util::check_bounds(size, ..=COMPONENT_MAX_SIZE as usize)
        .map(|s| s as u32)
        .map_err(|e| Error::IntOutOfBounds(field, e))
}

fn read_section(
    reader: &mut CountingReader<impl Read>,
    size: u32,
    page_size: u32,
    field: &'static str,
) -> Result<Vec<u8>> {
    let data = reader
        .read_vec_exact(size as usize)
        .map_err(|e| Error::DataRead(field, e))?;
    padding::read_zeros(reader, page_size.into()).map_err(|e| Error::DataRead(field, e))?;

    Ok(data)
}

fn write_section(
    writer: &mut CountingWriter<impl Write>,
    data: &[u8],
    page_size: u32,
    field: &'static str,
) -> Result<()> {
    writer
        .write_all(data)
        .map_err(|e| Error::DataWrite(field, e))?;
    padding::write_zeros(writer, page_size.into()).map_err(|e| Error::DataWrite(field, e))?;

    Ok(())
}

fn check_header_size(reader: &mut CountingReader<impl Read>, header_size: u32) -> Result<()> {
    let pos = reader
        .stream_position()
        .map_err(|e| Error::DataRead("header_size", e))?;

    if pos != u64::from(header_size) {
        return Err(Error::InvalidHeaderSize {
            actual: header_size,
            expected: pos,
        });
    }

    Ok(())
}

/// Raw on-disk layout for the v0 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV0 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v1 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV1Extra {
    recovery_dtbo_size: little_endian::U32,
    recovery_dtbo_offset: little_endian::U64,
    header_size: little_endian::U32,
}

/// Raw on-disk layout for the extra v2 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV2Extra {
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// A v2 boot image. Older header versions predate AVB 2.0 on every device this
/// tool targets and are rejected.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV2 {
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub id: [u32; 8],
    pub extra_cmdline: String,
    pub recovery_dtbo_offset: u64,
    pub dtb_addr: u64,
    // Images.
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
    #[serde(skip)]
    pub second: Vec<u8>,
    #[serde(skip)]
    pub recovery_dtbo: Vec<u8>,
    #[serde(skip)]
    pub dtb: Vec<u8>,
}

impl fmt::Debug for BootImageV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV2")
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("second_addr", &self.second_addr)
            .field("tags_addr", &self.tags_addr)
            .field("page_size", &self.page_size)
            .field("os_version", &self.os_version)
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("id", &self.id)
            .field("extra_cmdline", &self.extra_cmdline)
            .field("recovery_dtbo_offset", &self.recovery_dtbo_offset)
            .field("dtb_addr", &self.dtb_addr)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("second", &NumBytes(self.second.len()))
            .field("recovery_dtbo", &NumBytes(self.recovery_dtbo.len()))
            .field("dtb", &NumBytes(self.dtb.len()))
            .finish()
    }
}

impl BootImageExt for BootImageV2 {
    fn header_version(&self) -> u32 {
        2
    }

    fn header_size(&self) -> u32 {
        (mem::size_of::<RawV0>() + mem::size_of::<RawV1Extra>() + mem::size_of::<RawV2Extra>())
            as u32
    }
}

impl<R: Read> FromReader<R> for BootImageV2 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw_v0 =
            RawV0::read_from_io(&mut reader).map_err(|e| Error::DataRead("Boot::V0::header", e))?;

        if raw_v0.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v0.magic));
        }

        let header_version = raw_v0.header_version.get();
        if header_version != 2 {
            return Err(Error::UnknownHeaderVersion {
                kind: "boot",
                version: header_version,
            });
        }

        let kernel_size = util::check_bounds(raw_v0.kernel_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::kernel_size", e))?;
        let ramdisk_size = util::check_bounds(raw_v0.ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::ramdisk_size", e))?;
        let second_size = util::check_bounds(raw_v0.second_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::second_size", e))?;

        let page_size = raw_v0.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let name = parse_string(&raw_v0.name, "Boot::V0::name")?;
        let cmdline = parse_string(&raw_v0.cmdline, "Boot::V0::cmdline")?;
        let extra_cmdline = parse_string(&raw_v0.extra_cmdline, "Boot::V0::extra_cmdline")?;

        let raw_v1 = RawV1Extra::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("Boot::V1::header", e))?;
        let recovery_dtbo_size =
            util::check_bounds(raw_v1.recovery_dtbo_size.get(), ..=COMPONENT_MAX_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Boot::V1::recovery_dtbo_size", e))?;

        let raw_v2 = RawV2Extra::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("Boot::V2::header", e))?;
        let dtb_size = util::check_bounds(raw_v2.dtb_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V2::dtb_size", e))?;

        check_header_size(&mut reader, raw_v1.header_size.get())?;
        padding::read_zeros(&mut reader, page_size.into())
            .map_err(|e| Error::DataRead("Boot::V0::header_padding", e))?;

        let kernel = read_section(&mut reader, kernel_size, page_size, "Boot::V0::kernel")?;
        let ramdisk = read_section(&mut reader, ramdisk_size, page_size, "Boot::V0::ramdisk")?;
        let second = read_section(&mut reader, second_size, page_size, "Boot::V0::second")?;
        let recovery_dtbo = read_section(
            &mut reader,
            recovery_dtbo_size,
            page_size,
            "Boot::V1::recovery_dtbo",
        )?;
        let dtb = read_section(&mut reader, dtb_size, page_size, "Boot::V2::dtb")?;

        Ok(Self {
            kernel_addr: raw_v0.kernel_addr.get(),
            ramdisk_addr: raw_v0.ramdisk_addr.get(),
            second_addr: raw_v0.second_addr.get(),
            tags_addr: raw_v0.tags_addr.get(),
            page_size,
            os_version: raw_v0.os_version.get(),
            name,
            cmdline,
            id: raw_v0.id.map(|id| id.get()),
            extra_cmdline,
            recovery_dtbo_offset: raw_v1.recovery_dtbo_offset.get(),
            dtb_addr: raw_v2.dtb_addr.get(),
            kernel,
            ramdisk,
            second,
            recovery_dtbo,
            dtb,
        })
    }
}

impl<W: Write> ToWriter<W> for BootImageV2 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        let kernel_size = check_component(self.kernel.len(), "Boot::V0::kernel_size")?;
        let ramdisk_size = check_component(self.ramdisk.len(), "Boot::V0::ramdisk_size")?;
        let second_size = check_component(self.second.len(), "Boot::V0::second_size")?;
        let recovery_dtbo_size =
            check_component(self.recovery_dtbo.len(), "Boot::V1::recovery_dtbo_size")?;
        let dtb_size = check_component(self.dtb.len(), "Boot::V2::dtb_size")?;

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let mut writer = CountingWriter::new(writer);

        let raw_v0 = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: kernel_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: ramdisk_size.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: second_size.into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: self.header_version().into(),
            os_version: self.os_version.into(),
            name: pad_string(&self.name, "Boot::V0::name")?,
            cmdline: pad_string(&self.cmdline, "Boot::V0::cmdline")?,
            id: self.id.map(|id| id.into()),
            extra_cmdline: pad_string(&self.extra_cmdline, "Boot::V0::extra_cmdline")?,
        };
        let raw_v1 = RawV1Extra {
            recovery_dtbo_size: recovery_dtbo_size.into(),
            recovery_dtbo_offset: self.recovery_dtbo_offset.into(),
            header_size: self.header_size().into(),
        };
        let raw_v2 = RawV2Extra {
            dtb_size: dtb_size.into(),
            dtb_addr: self.dtb_addr.into(),
        };

        raw_v0
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V0::header", e))?;
        raw_v1
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V1::header", e))?;
        raw_v2
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V2::header", e))?;
        padding::write_zeros(&mut writer, self.page_size.into())
            .map_err(|e| Error::DataWrite("Boot::V0::header_padding", e))?;

        write_section(&mut writer, &self.kernel, self.page_size, "Boot::V0::kernel")?;
        write_section(&mut writer, &self.ramdisk, self.page_size, "Boot::V0::ramdisk")?;
        write_section(&mut writer, &self.second, self.page_size, "Boot::V0::second")?;
        write_section(
            &mut writer,
            &self.recovery_dtbo,
            self.page_size,
            "Boot::V1::recovery_dtbo",
        )?;
        write_section(&mut writer, &self.dtb, self.page_size, "Boot::V2::dtb")?;

        Ok(())
    }
}

/// Raw on-disk layout for the v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV3 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    ramdisk_size: little_endian::U32,
    os_version: little_endian::U32,
    header_size: little_endian::U32,
    reserved: [little_endian::U32; 4],
    header_version: little_endian::U32,
    cmdline: [u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV4Extra {
    signature_size: little_endian::U32,
}

/// The v4 signature region. It is kept byte-for-byte since some OEMs fill it
/// with zeros or other data that is not a valid vbmeta structure.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V4Extra {
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl fmt::Debug for V4Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4Extra")
            .field("signature", &NumBytes(self.signature.len()))
            .finish()
    }
}

impl V4Extra {
    /// Parse the VTS signature. Returns [`None`] if the region is empty or all
    /// zeros.
    pub fn vts_header(&self) -> Result<Option<Header>> {
        if util::is_zero(&self.signature) {
            return Ok(None);
        }

        Header::from_reader(Cursor::new(&self.signature))
            .map(Some)
            .map_err(Error::VtsAvbLoad)
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV3Through4 {
    pub os_version: u32,
    pub reserved: [u32; 4],
    pub cmdline: String,
    pub v4_extra: Option<V4Extra>,
    // Images.
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
}

impl fmt::Debug for BootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV3Through4")
            .field("os_version", &self.os_version)
            .field("reserved", &self.reserved)
            .field("cmdline", &self.cmdline)
            .field("v4_extra", &self.v4_extra)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .finish()
    }
}

impl BootImageExt for BootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawV4Extra>();
        }

        size as u32
    }
}

impl<R: Read> FromReader<R> for BootImageV3Through4 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw_v3 =
            RawV3::read_from_io(&mut reader).map_err(|e| Error::DataRead("Boot::V3::header", e))?;

        if raw_v3.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion {
                kind: "boot",
                version: header_version,
            });
        }

        let kernel_size = util::check_bounds(raw_v3.kernel_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V3::kernel_size", e))?;
        let ramdisk_size = util::check_bounds(raw_v3.ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V3::ramdisk_size", e))?;

        let cmdline = parse_string(&raw_v3.cmdline, "Boot::V3::cmdline")?;

        let signature_size = if header_version == 4 {
            let raw_v4 = RawV4Extra::read_from_io(&mut reader)
                .map_err(|e| Error::DataRead("Boot::V4::header", e))?;

            let size = util::check_bounds(raw_v4.signature_size.get(), ..=HDR_V4_SIGNATURE_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;

            Some(size)
        } else {
            None
        };

        check_header_size(&mut reader, raw_v3.header_size.get())?;
        padding::read_zeros(&mut reader, PAGE_SIZE.into())
            .map_err(|e| Error::DataRead("Boot::V3::header_padding", e))?;

        let kernel = read_section(&mut reader, kernel_size, PAGE_SIZE, "Boot::V3::kernel")?;
        let ramdisk = read_section(&mut reader, ramdisk_size, PAGE_SIZE, "Boot::V3::ramdisk")?;

        let v4_extra = match signature_size {
            Some(s) => Some(V4Extra {
                signature: read_section(&mut reader, s, PAGE_SIZE, "Boot::V4::signature")?,
            }),
            None => None,
        };

        Ok(Self {
            os_version: raw_v3.os_version.get(),
            reserved: raw_v3.reserved.map(|r| r.get()),
            cmdline,
            v4_extra,
            kernel,
            ramdisk,
        })
    }
}

impl BootImageV3Through4 {
    fn to_writer_internal(&self, writer: impl Write, skip_v4_sig: bool) -> Result<()> {
        let kernel_size = check_component(self.kernel.len(), "Boot::V3::kernel_size")?;
        let ramdisk_size = check_component(self.ramdisk.len(), "Boot::V3::ramdisk_size")?;

        let mut writer = CountingWriter::new(writer);

        let raw_v3 = RawV3 {
            magic: BOOT_MAGIC,
            kernel_size: kernel_size.into(),
            ramdisk_size: ramdisk_size.into(),
            os_version: self.os_version.into(),
            header_size: self.header_size().into(),
            reserved: self.reserved.map(|r| r.into()),
            header_version: self.header_version().into(),
            cmdline: pad_string(&self.cmdline, "Boot::V3::cmdline")?,
        };

        raw_v3
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V3::header", e))?;

        if let Some(v4) = &self.v4_extra {
            let signature_size = util::check_bounds(
                v4.signature.len(),
                ..=HDR_V4_SIGNATURE_SIZE as usize,
            )
            .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;

            let raw_v4 = RawV4Extra {
                signature_size: (signature_size as u32).into(),
            };

            raw_v4
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("Boot::V4::header", e))?;
        }

        padding::write_zeros(&mut writer, PAGE_SIZE.into())
            .map_err(|e| Error::DataWrite("Boot::V3::header_padding", e))?;

        write_section(&mut writer, &self.kernel, PAGE_SIZE, "Boot::V3::kernel")?;
        write_section(&mut writer, &self.ramdisk, PAGE_SIZE, "Boot::V3::ramdisk")?;

        if !skip_v4_sig {
            if let Some(v4) = &self.v4_extra {
                write_section(&mut writer, &v4.signature, PAGE_SIZE, "Boot::V4::signature")?;
            }
        }

        Ok(())
    }

    /// Recompute the legacy VTS signature over the current image contents and
    /// sign it with `key`. The new signature is written into the existing
    /// region, which keeps its size. Returns false if there is no VTS signature
    /// to update (v3 image, or an empty or all-zero v4 region).
    pub fn resign_vts_signature(&mut self, key: &RsaSigningKey) -> Result<bool> {
        let Some(v4) = &self.v4_extra else {
            return Ok(false);
        };
        let Some(mut header) = v4.vts_header()? else {
            return Ok(false);
        };
        let region_size = v4.signature.len();

        let descriptor = header
            .descriptors
            .iter_mut()
            .find_map(|d| match d {
                Descriptor::Hash(h) => Some(h),
                _ => None,
            })
            .ok_or(Error::MissingHashDescriptor)?;

        if descriptor.hash_algorithm != "sha256" {
            return Err(Error::VtsAvbSign(avb::Error::UnsupportedHashAlgorithm(
                descriptor.hash_algorithm.clone(),
            )));
        }

        // The hash includes everything but the signature at the end.
        let mut context = Context::new(&ring::digest::SHA256);
        context.update(&descriptor.salt);

        let hashing_writer = HashingWriter::new(io::sink(), context);
        let mut counting_writer = CountingWriter::new(hashing_writer);
        self.to_writer_internal(&mut counting_writer, true)?;

        let (hashing_writer, image_size) = counting_writer.finish();
        let (_, context) = hashing_writer.finish();

        descriptor.image_size = image_size;
        descriptor.root_digest = context.finish().as_ref().to_vec();
        header.sign(key).map_err(Error::VtsAvbSign)?;

        let mut signature = header.to_vec().map_err(Error::VtsAvbSave)?;
        if signature.len() > region_size {
            return Err(Error::VtsSignatureTooLarge {
                old: region_size,
                new: signature.len(),
            });
        }
        signature.resize(region_size, 0);

        if let Some(v4) = &mut self.v4_extra {
            v4.signature = signature;
        }

        Ok(true)
    }
}

impl<W: Write> ToWriter<W> for BootImageV3Through4 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.to_writer_internal(writer, false)
    }
}

/// Raw on-disk layout for the vendor v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV3 {
    /// Magic value. This should be equal to [`VENDOR_BOOT_MAGIC`].
    magic: [u8; 8],
    header_version: little_endian::U32,
    page_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    vendor_ramdisk_size: little_endian::U32,
    cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    tags_addr: little_endian::U32,
    name: [u8; VENDOR_BOOT_NAME_SIZE],
    header_size: little_endian::U32,
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// Raw on-disk layout for the extra vendor v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4Extra {
    vendor_ramdisk_table_size: little_endian::U32,
    vendor_ramdisk_table_entry_num: little_endian::U32,
    vendor_ramdisk_table_entry_size: little_endian::U32,
    bootconfig_size: little_endian::U32,
}

/// Raw on-disk layout for the vendor v4 ramdisk table entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4RamdiskTableEntry {
    ramdisk_size: little_endian::U32,
    ramdisk_offset: little_endian::U32,
    ramdisk_type: little_endian::U32,
    ramdisk_name: [u8; VENDOR_RAMDISK_NAME_SIZE],
    board_id: [little_endian::U32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

/// Metadata for one vendor ramdisk fragment. The fragment's size and offset
/// are derived from the fragment data when writing.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RamdiskMeta {
    pub ramdisk_type: u32,
    pub ramdisk_name: String,
    pub board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorV4Extra {
    pub ramdisk_metas: Vec<RamdiskMeta>,
    pub bootconfig: String,
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorBootImageV3Through4 {
    pub page_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub cmdline: String,
    pub tags_addr: u32,
    pub name: String,
    #[serde(skip)]
    pub dtb: Vec<u8>,
    pub dtb_addr: u64,
    #[serde(skip)]
    pub ramdisks: Vec<Vec<u8>>,
    pub v4_extra: Option<VendorV4Extra>,
}

impl fmt::Debug for VendorBootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorBootImageV3Through4")
            .field("page_size", &self.page_size)
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("cmdline", &self.cmdline)
            .field("tags_addr", &self.tags_addr)
            .field("name", &self.name)
            .field("dtb", &NumBytes(self.dtb.len()))
            .field("dtb_addr", &self.dtb_addr)
            .field(
                "ramdisks",
                &self
                    .ramdisks
                    .iter()
                    .map(|r| NumBytes(r.len()))
                    .collect::<Vec<_>>(),
            )
            .field("v4_extra", &self.v4_extra)
            .finish()
    }
}

impl BootImageExt for VendorBootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawVendorV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawVendorV4Extra>();
        }

        size as u32
    }
}

impl<R: Read> FromReader<R> for VendorBootImageV3Through4 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw_v3 = RawVendorV3::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("Vendor::V3::header", e))?;

        if raw_v3.magic != VENDOR_BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion {
                kind: "vendor_boot",
                version: header_version,
            });
        }

        let page_size = raw_v3.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let vendor_ramdisk_size =
            util::check_bounds(raw_v3.vendor_ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Vendor::V3::vendor_ramdisk_size", e))?;

        let cmdline = parse_string(&raw_v3.cmdline, "Vendor::V3::cmdline")?;
        let name = parse_string(&raw_v3.name, "Vendor::V3::name")?;

        let dtb_size = util::check_bounds(raw_v3.dtb_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Vendor::V3::dtb_size", e))?;

        // (entry count, bootconfig size)
        let v4_sizes = if header_version == 4 {
            let raw_v4 = RawVendorV4Extra::read_from_io(&mut reader)
                .map_err(|e| Error::DataRead("Vendor::V4::header", e))?;

            let table_size = raw_v4.vendor_ramdisk_table_size.get();
            let table_entry_num = raw_v4.vendor_ramdisk_table_entry_num.get();
            let table_entry_size = raw_v4.vendor_ramdisk_table_entry_size.get();

            let bootconfig_size =
                util::check_bounds(raw_v4.bootconfig_size.get(), ..=BOOTCONFIG_MAX_SIZE)
                    .map_err(|e| Error::IntOutOfBounds("Vendor::V4::bootconfig_size", e))?;

            if table_entry_size != mem::size_of::<RawVendorV4RamdiskTableEntry>() as u32 {
                return Err(Error::VendorV4InvalidRamdiskEntrySize(table_entry_size));
            }

            let actual_table_size = table_entry_num
                .checked_mul(table_entry_size)
                .ok_or(Error::IntOverflow("Vendor::V4::actual_table_size"))?;
            if actual_table_size != table_size {
                return Err(Error::VendorV4InvalidRamdiskTableSize {
                    actual: actual_table_size,
                    expected: table_size,
                });
            }

            Some((table_entry_num, bootconfig_size))
        } else {
            None
        };

        check_header_size(&mut reader, raw_v3.header_size.get())?;
        padding::read_zeros(&mut reader, page_size.into())
            .map_err(|e| Error::DataRead("Vendor::V3::header_padding", e))?;

        // For v4, the fragments can only be split up once the table, which
        // comes after the dtb, has been read.
        let vendor_ramdisk_data = read_section(
            &mut reader,
            vendor_ramdisk_size,
            page_size,
            "Vendor::V3::ramdisk",
        )?;
        let dtb = read_section(&mut reader, dtb_size, page_size, "Vendor::V3::dtb")?;

        let mut ramdisks = vec![];

        let v4_extra = if let Some((entry_num, bootconfig_size)) = v4_sizes {
            let mut ramdisk_metas = vec![];
            let mut expected_offset = 0u32;

            for index in 0..entry_num {
                let raw_entry = RawVendorV4RamdiskTableEntry::read_from_io(&mut reader)
                    .map_err(|e| Error::DataRead("Vendor::V4::table_entry", e))?;

                let ramdisk_size =
                    util::check_bounds(raw_entry.ramdisk_size.get(), ..=vendor_ramdisk_size)
                        .map_err(|e| Error::IntOutOfBounds("Vendor::V4::ramdisk_size", e))?;
                let ramdisk_offset = raw_entry.ramdisk_offset.get();

                // Fragments must be contiguous and in table order.
                if ramdisk_offset != expected_offset {
                    return Err(Error::VendorV4InvalidRamdiskEntryOffset {
                        index,
                        field_value: ramdisk_offset,
                        expected: expected_offset.into(),
                    });
                }

                let end = ramdisk_offset
                    .checked_add(ramdisk_size)
                    .filter(|e| *e <= vendor_ramdisk_size)
                    .ok_or(Error::VendorV4InvalidRamdiskSize {
                        field_value: vendor_ramdisk_size,
                        total_size: ramdisk_offset.saturating_add(ramdisk_size),
                    })?;

                ramdisks.push(vendor_ramdisk_data[ramdisk_offset as usize..end as usize].to_vec());
                ramdisk_metas.push(RamdiskMeta {
                    ramdisk_type: raw_entry.ramdisk_type.get(),
                    ramdisk_name: parse_string(
                        &raw_entry.ramdisk_name,
                        "Vendor::V4::ramdisk_name",
                    )?,
                    board_id: raw_entry.board_id.map(|id| id.get()),
                });

                expected_offset = end;
            }

            if expected_offset != vendor_ramdisk_size {
                return Err(Error::VendorV4InvalidRamdiskSize {
                    field_value: vendor_ramdisk_size,
                    total_size: expected_offset,
                });
            }

            padding::read_zeros(&mut reader, page_size.into())
                .map_err(|e| Error::DataRead("Vendor::V4::table_padding", e))?;

            let bootconfig = read_section(
                &mut reader,
                bootconfig_size,
                page_size,
                "Vendor::V4::bootconfig",
            )?;
            let bootconfig = String::from_utf8(bootconfig).map_err(|e| {
                Error::StringNotUtf8("Vendor::V4::bootconfig", e.utf8_error(), e.into_bytes())
            })?;

            Some(VendorV4Extra {
                ramdisk_metas,
                bootconfig,
            })
        } else {
            ramdisks.push(vendor_ramdisk_data);
            None
        };

        Ok(Self {
            page_size,
            kernel_addr: raw_v3.kernel_addr.get(),
            ramdisk_addr: raw_v3.ramdisk_addr.get(),
            cmdline,
            tags_addr: raw_v3.tags_addr.get(),
            name,
            dtb,
            dtb_addr: raw_v3.dtb_addr.get(),
            ramdisks,
            v4_extra,
        })
    }
}

impl<W: Write> ToWriter<W> for VendorBootImageV3Through4 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        // These states can't exist if this instance was just parsed from a
        // real boot image.
        if let Some(v4) = &self.v4_extra {
            if v4.ramdisk_metas.len() != self.ramdisks.len() {
                return Err(Error::MismatchedRamdiskCounts {
                    ramdisks: self.ramdisks.len(),
                    metas: v4.ramdisk_metas.len(),
                });
            }
        } else if self.ramdisks.len() > 1 {
            return Err(Error::VendorV3TooManyRamdisks(self.ramdisks.len()));
        }

        let vendor_ramdisk_size = check_component(
            self.ramdisks.iter().map(|r| r.len()).sum::<usize>(),
            "Vendor::V3::vendor_ramdisk_size",
        )?;
        let dtb_size = check_component(self.dtb.len(), "Vendor::V3::dtb_size")?;

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        if let Some(v4) = &self.v4_extra {
            util::check_bounds(v4.bootconfig.len(), ..=BOOTCONFIG_MAX_SIZE as usize)
                .map_err(|e| Error::IntOutOfBounds("Vendor::V4::bootconfig_size", e))?;
        }

        let mut writer = CountingWriter::new(writer);

        let raw_v3 = RawVendorV3 {
            magic: VENDOR_BOOT_MAGIC,
            header_version: self.header_version().into(),
            page_size: self.page_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            vendor_ramdisk_size: vendor_ramdisk_size.into(),
            cmdline: pad_string(&self.cmdline, "Vendor::V3::cmdline")?,
            tags_addr: self.tags_addr.into(),
            name: pad_string(&self.name, "Vendor::V3::name")?,
            header_size: self.header_size().into(),
            dtb_size: dtb_size.into(),
            dtb_addr: self.dtb_addr.into(),
        };

        raw_v3
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Vendor::V3::header", e))?;

        if let Some(v4) = &self.v4_extra {
            let table_entry_num = self.ramdisks.len().to_u32().ok_or(Error::IntOverflow(
                "Vendor::V4::vendor_ramdisk_table_entry_num",
            ))?;
            let table_entry_size = mem::size_of::<RawVendorV4RamdiskTableEntry>() as u32;
            let table_size = table_entry_num
                .checked_mul(table_entry_size)
                .ok_or(Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_size"))?;

            let raw_v4 = RawVendorV4Extra {
                vendor_ramdisk_table_size: table_size.into(),
                vendor_ramdisk_table_entry_num: table_entry_num.into(),
                vendor_ramdisk_table_entry_size: table_entry_size.into(),
                bootconfig_size: (v4.bootconfig.len() as u32).into(),
            };

            raw_v4
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("Vendor::V4::header", e))?;
        }

        padding::write_zeros(&mut writer, self.page_size.into())
            .map_err(|e| Error::DataWrite("Vendor::V3::header_padding", e))?;

        for ramdisk in &self.ramdisks {
            writer
                .write_all(ramdisk)
                .map_err(|e| Error::DataWrite("Vendor::V3::ramdisk", e))?;
        }
        padding::write_zeros(&mut writer, self.page_size.into())
            .map_err(|e| Error::DataWrite("Vendor::V3::ramdisk_padding", e))?;

        write_section(&mut writer, &self.dtb, self.page_size, "Vendor::V3::dtb")?;

        if let Some(v4) = &self.v4_extra {
            let mut ramdisk_offset = 0u32;

            for (ramdisk, meta) in self.ramdisks.iter().zip(&v4.ramdisk_metas) {
                let ramdisk_size = ramdisk.len() as u32;

                let raw_entry = RawVendorV4RamdiskTableEntry {
                    ramdisk_size: ramdisk_size.into(),
                    ramdisk_offset: ramdisk_offset.into(),
                    ramdisk_type: meta.ramdisk_type.into(),
                    ramdisk_name: pad_string(&meta.ramdisk_name, "Vendor::V4::ramdisk_name")?,
                    board_id: meta.board_id.map(|id| id.into()),
                };

                raw_entry
                    .write_to_io(&mut writer)
                    .map_err(|e| Error::DataWrite("Vendor::V4::table_entry", e))?;

                ramdisk_offset += ramdisk_size;
            }
            padding::write_zeros(&mut writer, self.page_size.into())
                .map_err(|e| Error::DataWrite("Vendor::V4::table_padding", e))?;

            write_section(
                &mut writer,
                v4.bootconfig.as_bytes(),
                self.page_size,
                "Vendor::V4::bootconfig",
            )?;
        }

        Ok(())
    }
}

/// A boot or vendor_boot image of any supported header version.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum BootImage {
    V2(BootImageV2),
    V3Through4(BootImageV3Through4),
    VendorV3Through4(VendorBootImageV3Through4),
}

impl BootImage {
    /// Whether this is a vendor_boot image.
    pub fn is_vendor(&self) -> bool {
        matches!(self, Self::VendorV3Through4(_))
    }

    /// Serialize to a new buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.to_writer(&mut data)?;
        Ok(data)
    }
}

impl BootImageExt for BootImage {
    fn header_version(&self) -> u32 {
        match self {
            Self::V2(b) => b.header_version(),
            Self::V3Through4(b) => b.header_version(),
            Self::VendorV3Through4(b) => b.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::V2(b) => b.header_size(),
            Self::V3Through4(b) => b.header_size(),
            Self::VendorV3Through4(b) => b.header_size(),
        }
    }
}

impl<R: Read + Seek> FromReader<R> for BootImage {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut prefix = [0u8; BOOT_HEADER_VERSION_OFFSET + 4];
        reader
            .read_exact(&mut prefix)
            .map_err(|e| Error::DataRead("autodetect", e))?;
        reader
            .rewind()
            .map_err(|e| Error::DataRead("autodetect", e))?;

        let version_at = |offset: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&prefix[offset..offset + 4]);
            u32::from_le_bytes(raw)
        };

        // The magic and version are at the same offsets in every layout of
        // each image type, so the right parser can be picked up front.
        let magic: [u8; 8] = prefix[..8].try_into().unwrap_or_default();

        if magic == BOOT_MAGIC {
            match version_at(BOOT_HEADER_VERSION_OFFSET) {
                2 => BootImageV2::from_reader(reader).map(Self::V2),
                3 | 4 => BootImageV3Through4::from_reader(reader).map(Self::V3Through4),
                version => Err(Error::UnknownHeaderVersion {
                    kind: "boot",
                    version,
                }),
            }
        } else if magic == VENDOR_BOOT_MAGIC {
            match version_at(VENDOR_HEADER_VERSION_OFFSET) {
                3 | 4 => VendorBootImageV3Through4::from_reader(reader).map(Self::VendorV3Through4),
                version => Err(Error::UnknownHeaderVersion {
                    kind: "vendor_boot",
                    version,
                }),
            }
        } else {
            Err(Error::UnknownMagic(magic))
        }
    }
}

impl<W: Write> ToWriter<W> for BootImage {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        match self {
            Self::V2(b) => b.to_writer(writer),
            Self::V3Through4(b) => b.to_writer(writer),
            Self::VendorV3Through4(b) => b.to_writer(writer),
        }
    }
}
