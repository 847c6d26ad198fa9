// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    ops::Range,
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use ring::digest::{Algorithm, Context};
use rsa::{BigUint, RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{self, RsaPublicKeyExt, RsaSigningKey, SignatureAlgorithm},
    format::{
        hashtree::{self, HashTree},
        padding,
    },
    patch::run::ErrorKind,
    stream::{
        CountingReader, CountingWriter, FromReader, ReadDiscardExt, ReadStringExt, ToWriter,
        WriteStringExt, WriteZerosExt,
    },
    util,
};

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";
pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";

/// Maximum header size. This matches avbtool and doubles as the upper bound for
/// individual descriptor fields so that bogus lengths fail early.
pub const HEADER_MAX_SIZE: u64 = 64 * 1024;

/// Block size that avbtool uses for appended (footer) images.
pub const APPENDED_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?} field: {1}")]
    ReadFieldError(&'static str, io::Error),
    #[error("Failed to write {0:?} field: {1}")]
    WriteFieldError(&'static str, io::Error),
    #[error("{0:?} field does not have NULL terminator")]
    StringNotNullTerminated(&'static str),
    #[error("{0:?} field is not ASCII encoded: {1:?}")]
    StringNotAscii(&'static str, String),
    #[error("Header exceeds maximum size of {HEADER_MAX_SIZE}")]
    HeaderTooLarge,
    #[error("Descriptor padding is too long or data was not consumed")]
    PaddingTooLong,
    #[error("{0:?} field padding contains non-zero bytes")]
    PaddingNotZero(&'static str),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Invalid VBMeta header magic: {:?}", .0.as_bstr())]
    InvalidHeaderMagic([u8; 4]),
    #[error("Invalid VBMeta footer magic: {:?}", .0.as_bstr())]
    InvalidFooterMagic([u8; 4]),
    #[error("RSA public key exponent not supported: {0}")]
    UnsupportedRsaPublicExponent(BigUint),
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(AlgorithmType),
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Key size ({bits} bits) does not match algorithm {1:?}", bits = .0 * 8)]
    IncorrectKeySize(usize, AlgorithmType),
    #[error("Hash tree does not immediately follow image data")]
    HashTreeGap,
    #[error("Cannot regenerate hash tree for {0:?}: FEC data is present")]
    FecUnsupported(String),
    #[error("Must have exactly one hash or hash tree descriptor")]
    NoAppendedDescriptor,
    #[error("{0} byte image size is too small to fit header")]
    TooSmallForHeader(u64),
    #[error("{0} byte image size is too small to fit footer")]
    TooSmallForFooter(u64),
    #[error("Expected {partition:?} digest {expected}, but have {actual}")]
    InvalidDigest {
        partition: String,
        expected: String,
        actual: String,
    },
    #[error("VBMeta hash does not match header contents")]
    InvalidHeaderHash,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Hash tree error")]
    HashTree(#[from] hashtree::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDigest { .. } | Self::InvalidHeaderHash => ErrorKind::Integrity,
            Self::Crypto(crypto::Error::RsaVerify(_)) => ErrorKind::Integrity,
            Self::HashTree(e) => e.kind(),
            Self::IncorrectKeySize(..) => ErrorKind::AlgorithmMismatch,
            _ => ErrorKind::Format,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ring_algorithm(name: &str, for_verify: bool) -> Result<&'static Algorithm> {
    match name {
        "sha1" if for_verify => Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
        "sha256" => Ok(&ring::digest::SHA256),
        "sha512" => Ok(&ring::digest::SHA512),
        a => Err(Error::UnsupportedHashAlgorithm(a.to_owned())),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum AlgorithmType {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
    #[serde(untagged)]
    Unknown(u32),
}

impl AlgorithmType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
            Self::Unknown(v) => v,
        }
    }

    pub fn to_digest_algorithm(self) -> Option<SignatureAlgorithm> {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Some(SignatureAlgorithm::Sha256WithRsa)
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Some(SignatureAlgorithm::Sha512WithRsa)
            }
            _ => None,
        }
    }

    /// Size in bits of the RSA key this algorithm requires.
    pub fn key_bits(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 2048,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 4096,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 8192,
        }
    }

    pub fn digest_len(self) -> usize {
        self.to_digest_algorithm()
            .map(|a| a.digest_len())
            .unwrap_or_default()
    }

    pub fn signature_len(self) -> usize {
        self.key_bits() / 8
    }

    pub fn public_key_len(self) -> usize {
        match self.key_bits() {
            0 => 0,
            bits => 8 + 2 * bits / 8,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        self.to_digest_algorithm()
            .map(|a| a.hash(data))
            .unwrap_or_default()
    }

    pub fn sign(self, key: &RsaSigningKey, digest: &[u8]) -> Result<Vec<u8>> {
        match self.to_digest_algorithm() {
            Some(algo) => key.sign(algo, digest).map_err(|e| e.into()),
            None if self == Self::None => Ok(vec![]),
            None => Err(Error::UnsupportedAlgorithm(self)),
        }
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        match self.to_digest_algorithm() {
            Some(algo) => key
                .verify_sig(algo, digest, signature)
                .map_err(|e| e.into()),
            None if self == Self::None => Ok(()),
            None => Err(Error::UnsupportedAlgorithm(self)),
        }
    }
}

trait DescriptorTag {
    const TAG: u64;
}

fn check_len(len: usize, field: &'static str) -> Result<u32> {
    if len > HEADER_MAX_SIZE as usize {
        return Err(Error::FieldOutOfBounds(field));
    }
    Ok(len as u32)
}

fn read_len_u32(reader: &mut impl Read, field: &'static str) -> Result<usize> {
    let len = reader.read_u32::<BigEndian>()?;
    if u64::from(len) > HEADER_MAX_SIZE {
        return Err(Error::FieldOutOfBounds(field));
    }
    Ok(len as usize)
}

fn read_hash_algorithm(reader: &mut impl Read) -> Result<String> {
    let hash_algorithm = reader
        .read_string_padded(32)
        .map_err(|e| Error::ReadFieldError("hash_algorithm", e))?;
    if !hash_algorithm.is_ascii() {
        return Err(Error::StringNotAscii("hash_algorithm", hash_algorithm));
    }
    Ok(hash_algorithm)
}

fn write_hash_algorithm(writer: &mut impl Write, hash_algorithm: &str) -> Result<()> {
    if !hash_algorithm.is_ascii() {
        return Err(Error::StringNotAscii(
            "hash_algorithm",
            hash_algorithm.to_owned(),
        ));
    }
    writer
        .write_string_padded(hash_algorithm, 32)
        .map_err(|e| Error::WriteFieldError("hash_algorithm", e))
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct PropertyDescriptor {
    pub key: String,
    #[serde(with = "hex")]
    pub value: Vec<u8>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("key", &self.key)
            .field("value", &self.value.as_bstr())
            .finish()
    }
}

impl DescriptorTag for PropertyDescriptor {
    const TAG: u64 = 0;
}

impl<R: Read> FromReader<R> for PropertyDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let key_size = reader.read_u64::<BigEndian>()?;
        let value_size = reader.read_u64::<BigEndian>()?;

        if key_size > HEADER_MAX_SIZE {
            return Err(Error::FieldOutOfBounds("key_size"));
        } else if value_size > HEADER_MAX_SIZE {
            return Err(Error::FieldOutOfBounds("value_size"));
        }

        let key = reader
            .read_string_exact(key_size as usize)
            .map_err(|e| Error::ReadFieldError("key", e))?;
        if reader.read_u8()? != 0 {
            return Err(Error::StringNotNullTerminated("key"));
        }

        let mut value = vec![0u8; value_size as usize];
        reader.read_exact(&mut value)?;
        // The value is NULL terminated too, even though it is not a string.
        if reader.read_u8()? != 0 {
            return Err(Error::StringNotNullTerminated("value"));
        }

        Ok(Self { key, value })
    }
}

impl<W: Write> ToWriter<W> for PropertyDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        check_len(self.key.len(), "key_size")?;
        check_len(self.value.len(), "value_size")?;

        writer.write_u64::<BigEndian>(self.key.len() as u64)?;
        writer.write_u64::<BigEndian>(self.value.len() as u64)?;
        writer.write_all(self.key.as_bytes())?;
        writer.write_all(b"\0")?;
        writer.write_all(&self.value)?;
        writer.write_all(b"\0")?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HashTreeDescriptor {
    pub dm_verity_version: u32,
    pub image_size: u64,
    pub tree_offset: u64,
    pub tree_size: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub fec_num_roots: u32,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    #[serde(with = "hex")]
    pub root_digest: Vec<u8>,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashTreeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTreeDescriptor")
            .field("dm_verity_version", &self.dm_verity_version)
            .field("image_size", &self.image_size)
            .field("tree_offset", &self.tree_offset)
            .field("tree_size", &self.tree_size)
            .field("data_block_size", &self.data_block_size)
            .field("hash_block_size", &self.hash_block_size)
            .field("fec_num_roots", &self.fec_num_roots)
            .field("fec_offset", &self.fec_offset)
            .field("fec_size", &self.fec_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl HashTreeDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
    pub const FLAG_CHECK_AT_MOST_ONCE: u32 = 1 << 1;

    fn hash_tree(&self, for_verify: bool) -> Result<HashTree> {
        let algorithm = ring_algorithm(&self.hash_algorithm, for_verify)?;
        Ok(HashTree::new(self.data_block_size, algorithm, &self.salt))
    }

    /// Regenerate the hash tree over `image` and update the size, offset, and
    /// root digest fields. Returns the new hash tree, which must be stored
    /// immediately after the image data. Images carrying FEC data are rejected
    /// since the parity data would go stale.
    pub fn update(&mut self, image: &[u8], cancel_signal: &AtomicBool) -> Result<Vec<u8>> {
        if self.fec_num_roots != 0 {
            return Err(Error::FecUnsupported(self.partition_name.clone()));
        }

        let (root_digest, tree) = self.hash_tree(false)?.generate(image, cancel_signal)?;

        self.image_size = image.len() as u64;
        self.tree_offset = self.image_size;
        self.tree_size = tree.len() as u64;
        self.root_digest = root_digest;

        Ok(tree)
    }

    /// Verify the root digest and the stored hash tree against the partition
    /// data, which must contain the hash tree at [`Self::tree_offset`].
    pub fn verify(&self, data: &[u8], cancel_signal: &AtomicBool) -> Result<()> {
        if self.tree_offset != self.image_size {
            return Err(Error::HashTreeGap);
        }

        let image = slice_range(data, 0..self.image_size, "image_size")?;
        let tree = slice_range(
            data,
            self.tree_offset..self.tree_offset.saturating_add(self.tree_size),
            "tree_size",
        )?;

        self.hash_tree(true)?
            .verify(image, &self.root_digest, tree, cancel_signal)
            .map_err(|e| match e {
                hashtree::Error::InvalidRootDigest { expected, actual } => Error::InvalidDigest {
                    partition: self.partition_name.clone(),
                    expected,
                    actual,
                },
                e => e.into(),
            })
    }
}

impl DescriptorTag for HashTreeDescriptor {
    const TAG: u64 = 1;
}

impl<R: Read> FromReader<R> for HashTreeDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let dm_verity_version = reader.read_u32::<BigEndian>()?;
        let image_size = reader.read_u64::<BigEndian>()?;
        let tree_offset = reader.read_u64::<BigEndian>()?;
        let tree_size = reader.read_u64::<BigEndian>()?;
        let data_block_size = reader.read_u32::<BigEndian>()?;
        let hash_block_size = reader.read_u32::<BigEndian>()?;
        let fec_num_roots = reader.read_u32::<BigEndian>()?;
        let fec_offset = reader.read_u64::<BigEndian>()?;
        let fec_size = reader.read_u64::<BigEndian>()?;
        let hash_algorithm = read_hash_algorithm(&mut reader)?;

        let partition_name_len = read_len_u32(&mut reader, "partition_name_len")?;
        let salt_len = read_len_u32(&mut reader, "salt_len")?;
        let root_digest_len = read_len_u32(&mut reader, "root_digest_len")?;
        let flags = reader.read_u32::<BigEndian>()?;

        let mut reserved = [0u8; 60];
        reader.read_exact(&mut reserved)?;

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let mut salt = vec![0u8; salt_len];
        reader.read_exact(&mut salt)?;

        let mut root_digest = vec![0u8; root_digest_len];
        reader.read_exact(&mut root_digest)?;

        if data_block_size == 0 || hash_block_size == 0 {
            return Err(Error::FieldOutOfBounds("block_size"));
        }

        Ok(Self {
            dm_verity_version,
            image_size,
            tree_offset,
            tree_size,
            data_block_size,
            hash_block_size,
            fec_num_roots,
            fec_offset,
            fec_size,
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for HashTreeDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let partition_name_len = check_len(self.partition_name.len(), "partition_name_len")?;
        let salt_len = check_len(self.salt.len(), "salt_len")?;
        let root_digest_len = check_len(self.root_digest.len(), "root_digest_len")?;

        writer.write_u32::<BigEndian>(self.dm_verity_version)?;
        writer.write_u64::<BigEndian>(self.image_size)?;
        writer.write_u64::<BigEndian>(self.tree_offset)?;
        writer.write_u64::<BigEndian>(self.tree_size)?;
        writer.write_u32::<BigEndian>(self.data_block_size)?;
        writer.write_u32::<BigEndian>(self.hash_block_size)?;
        writer.write_u32::<BigEndian>(self.fec_num_roots)?;
        writer.write_u64::<BigEndian>(self.fec_offset)?;
        writer.write_u64::<BigEndian>(self.fec_size)?;
        write_hash_algorithm(&mut writer, &self.hash_algorithm)?;
        writer.write_u32::<BigEndian>(partition_name_len)?;
        writer.write_u32::<BigEndian>(salt_len)?;
        writer.write_u32::<BigEndian>(root_digest_len)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.root_digest)?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    #[serde(with = "hex")]
    pub root_digest: Vec<u8>,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashDescriptor")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl HashDescriptor {
    fn calculate(&self, image: &[u8], for_verify: bool) -> Result<ring::digest::Digest> {
        let algorithm = ring_algorithm(&self.hash_algorithm, for_verify)?;
        let mut context = Context::new(algorithm);
        context.update(&self.salt);
        context.update(image);

        Ok(context.finish())
    }

    /// Set the image size and root digest from `image`.
    pub fn update(&mut self, image: &[u8]) -> Result<()> {
        let digest = self.calculate(image, false)?;
        self.image_size = image.len() as u64;
        self.root_digest = digest.as_ref().to_vec();
        Ok(())
    }

    /// Verify the root digest against the first [`Self::image_size`] bytes of
    /// `data`.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let image = slice_range(data, 0..self.image_size, "image_size")?;
        let digest = self.calculate(image, true)?;

        if self.root_digest != digest.as_ref() {
            return Err(Error::InvalidDigest {
                partition: self.partition_name.clone(),
                expected: hex::encode(&self.root_digest),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }
}

impl DescriptorTag for HashDescriptor {
    const TAG: u64 = 2;
}

impl<R: Read> FromReader<R> for HashDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let image_size = reader.read_u64::<BigEndian>()?;
        let hash_algorithm = read_hash_algorithm(&mut reader)?;

        let partition_name_len = read_len_u32(&mut reader, "partition_name_len")?;
        let salt_len = read_len_u32(&mut reader, "salt_len")?;
        let root_digest_len = read_len_u32(&mut reader, "root_digest_len")?;
        let flags = reader.read_u32::<BigEndian>()?;

        let mut reserved = [0u8; 60];
        reader.read_exact(&mut reserved)?;

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let mut salt = vec![0u8; salt_len];
        reader.read_exact(&mut salt)?;

        let mut root_digest = vec![0u8; root_digest_len];
        reader.read_exact(&mut root_digest)?;

        Ok(Self {
            image_size,
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for HashDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let partition_name_len = check_len(self.partition_name.len(), "partition_name_len")?;
        let salt_len = check_len(self.salt.len(), "salt_len")?;
        let root_digest_len = check_len(self.root_digest.len(), "root_digest_len")?;

        writer.write_u64::<BigEndian>(self.image_size)?;
        write_hash_algorithm(&mut writer, &self.hash_algorithm)?;
        writer.write_u32::<BigEndian>(partition_name_len)?;
        writer.write_u32::<BigEndian>(salt_len)?;
        writer.write_u32::<BigEndian>(root_digest_len)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.root_digest)?;

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct KernelCmdlineDescriptor {
    pub flags: u32,
    pub cmdline: String,
}

impl KernelCmdlineDescriptor {
    pub const FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED: u32 = 1 << 0;
    pub const FLAG_USE_ONLY_IF_HASHTREE_DISABLED: u32 = 1 << 1;
}

impl DescriptorTag for KernelCmdlineDescriptor {
    const TAG: u64 = 3;
}

impl<R: Read> FromReader<R> for KernelCmdlineDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let flags = reader.read_u32::<BigEndian>()?;
        let cmdline_len = read_len_u32(&mut reader, "cmdline_len")?;

        // Not NULL-terminated.
        let cmdline = reader
            .read_string_exact(cmdline_len)
            .map_err(|e| Error::ReadFieldError("cmdline", e))?;

        Ok(Self { flags, cmdline })
    }
}

impl<W: Write> ToWriter<W> for KernelCmdlineDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let cmdline_len = check_len(self.cmdline.len(), "cmdline_len")?;

        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(cmdline_len)?;
        writer.write_all(self.cmdline.as_bytes())?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChainPartitionDescriptor {
    pub rollback_index_location: u32,
    pub partition_name: String,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl ChainPartitionDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
}

impl fmt::Debug for ChainPartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPartitionDescriptor")
            .field("rollback_index_location", &self.rollback_index_location)
            .field("partition_name", &self.partition_name)
            .field("public_key", &hex::encode(&self.public_key))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for ChainPartitionDescriptor {
    const TAG: u64 = 4;
}

impl<R: Read> FromReader<R> for ChainPartitionDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let rollback_index_location = reader.read_u32::<BigEndian>()?;
        let partition_name_len = read_len_u32(&mut reader, "partition_name_len")?;
        let public_key_len = read_len_u32(&mut reader, "public_key_len")?;
        let flags = reader.read_u32::<BigEndian>()?;

        let mut reserved = [0u8; 60];
        reader.read_exact(&mut reserved)?;

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let mut public_key = vec![0u8; public_key_len];
        reader.read_exact(&mut public_key)?;

        Ok(Self {
            rollback_index_location,
            partition_name,
            public_key,
            flags,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for ChainPartitionDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let partition_name_len = check_len(self.partition_name.len(), "partition_name_len")?;
        let public_key_len = check_len(self.public_key.len(), "public_key_len")?;

        writer.write_u32::<BigEndian>(self.rollback_index_location)?;
        writer.write_u32::<BigEndian>(partition_name_len)?;
        writer.write_u32::<BigEndian>(public_key_len)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.public_key)?;

        Ok(())
    }
}

/// A vbmeta descriptor. Tags that are not interpreted are kept as opaque data
/// so that they survive being written back out.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Descriptor {
    Property(PropertyDescriptor),
    HashTree(HashTreeDescriptor),
    Hash(HashDescriptor),
    KernelCmdline(KernelCmdlineDescriptor),
    ChainPartition(ChainPartitionDescriptor),
    Unknown {
        tag: u64,
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
}

impl Descriptor {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Property(_) => "Property",
            Self::HashTree(_) => "HashTree",
            Self::Hash(_) => "Hash",
            Self::KernelCmdline(_) => "KernelCmdline",
            Self::ChainPartition(_) => "ChainPartition",
            Self::Unknown { .. } => "Unknown",
        }
    }

    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Self::HashTree(d) => Some(&d.partition_name),
            Self::Hash(d) => Some(&d.partition_name),
            Self::ChainPartition(d) => Some(&d.partition_name),
            _ => None,
        }
    }
}

impl<R: Read> FromReader<R> for Descriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let tag = reader.read_u64::<BigEndian>()?;
        let nbf = reader.read_u64::<BigEndian>()?;

        if nbf > HEADER_MAX_SIZE {
            return Err(Error::FieldOutOfBounds("num_bytes_following"));
        }

        let mut inner_reader = CountingReader::new(reader.take(nbf));

        let descriptor = match tag {
            PropertyDescriptor::TAG => {
                Self::Property(PropertyDescriptor::from_reader(&mut inner_reader)?)
            }
            HashTreeDescriptor::TAG => {
                Self::HashTree(HashTreeDescriptor::from_reader(&mut inner_reader)?)
            }
            HashDescriptor::TAG => Self::Hash(HashDescriptor::from_reader(&mut inner_reader)?),
            KernelCmdlineDescriptor::TAG => {
                Self::KernelCmdline(KernelCmdlineDescriptor::from_reader(&mut inner_reader)?)
            }
            ChainPartitionDescriptor::TAG => {
                Self::ChainPartition(ChainPartitionDescriptor::from_reader(&mut inner_reader)?)
            }
            _ => {
                let mut data = vec![0u8; nbf as usize];
                inner_reader.read_exact(&mut data)?;

                Self::Unknown { tag, data }
            }
        };

        // Descriptors are always padded to 8 bytes.
        padding::read_zeros(&mut inner_reader, 8)
            .map_err(|_| Error::PaddingNotZero("descriptor"))?;
        if inner_reader.stream_position()? != nbf {
            return Err(Error::PaddingTooLong);
        }

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for Descriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let mut inner = Vec::new();

        let tag = match self {
            Self::Property(d) => {
                d.to_writer(&mut inner)?;
                PropertyDescriptor::TAG
            }
            Self::HashTree(d) => {
                d.to_writer(&mut inner)?;
                HashTreeDescriptor::TAG
            }
            Self::Hash(d) => {
                d.to_writer(&mut inner)?;
                HashDescriptor::TAG
            }
            Self::KernelCmdline(d) => {
                d.to_writer(&mut inner)?;
                KernelCmdlineDescriptor::TAG
            }
            Self::ChainPartition(d) => {
                d.to_writer(&mut inner)?;
                ChainPartitionDescriptor::TAG
            }
            Self::Unknown { tag, data } => {
                inner.extend_from_slice(data);
                *tag
            }
        };

        if inner.len() > HEADER_MAX_SIZE as usize {
            return Err(Error::FieldOutOfBounds("num_bytes_following"));
        }

        let padding_len = padding::calc(inner.len(), 8);

        writer.write_u64::<BigEndian>(tag)?;
        writer.write_u64::<BigEndian>((inner.len() + padding_len) as u64)?;
        writer.write_all(&inner)?;
        writer.write_zeros_exact(padding_len as u64)?;

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendedDescriptorRef<'a> {
    HashTree(&'a HashTreeDescriptor),
    Hash(&'a HashDescriptor),
}

impl AppendedDescriptorRef<'_> {
    /// Size of the data covered by the footer, excluding vbmeta.
    pub fn logical_image_size(&self) -> Result<u64> {
        match self {
            Self::HashTree(d) => d
                .image_size
                .checked_add(d.tree_size)
                .and_then(|s| s.checked_add(d.fec_size))
                .ok_or(Error::FieldOutOfBounds("logical_image_size")),
            Self::Hash(d) => Ok(d.image_size),
        }
    }

    pub fn image_size(&self) -> u64 {
        match self {
            Self::HashTree(d) => d.image_size,
            Self::Hash(d) => d.image_size,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum AppendedDescriptorMut<'a> {
    HashTree(&'a mut HashTreeDescriptor),
    Hash(&'a mut HashDescriptor),
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Header {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub algorithm_type: AlgorithmType,
    #[serde(with = "hex")]
    pub hash: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex")]
    pub public_key_metadata: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
    #[serde(with = "hex")]
    pub reserved: [u8; 80],
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                "required_libavb_version_major",
                &self.required_libavb_version_major,
            )
            .field(
                "required_libavb_version_minor",
                &self.required_libavb_version_minor,
            )
            .field("algorithm_type", &self.algorithm_type)
            .field("hash", &hex::encode(&self.hash))
            .field("signature", &hex::encode(&self.signature))
            .field("public_key", &hex::encode(&self.public_key))
            .field(
                "public_key_metadata",
                &hex::encode(&self.public_key_metadata),
            )
            .field("descriptors", &self.descriptors)
            .field("rollback_index", &self.rollback_index)
            .field("flags", &self.flags)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("release_string", &self.release_string)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Header {
    pub const SIZE: usize = 256;

    pub const FLAG_HASHTREE_DISABLED: u32 = 1 << 0;
    pub const FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;

    fn to_writer_internal(&self, mut writer: impl Write, skip_auth_block: bool) -> Result<()> {
        let mut descriptors_raw = Vec::new();
        for d in &self.descriptors {
            d.to_writer(&mut descriptors_raw)?;
        }

        // Auth block: hash, then signature.
        let auth_block_data_size = self
            .hash
            .len()
            .checked_add(self.signature.len())
            .ok_or(Error::FieldOutOfBounds("auth_block_data_size"))?;
        let auth_block_padding_size = padding::calc(auth_block_data_size, 64);
        let auth_block_size = auth_block_data_size
            .checked_add(auth_block_padding_size)
            .ok_or(Error::FieldOutOfBounds("auth_block_size"))?;

        let hash_offset = 0usize;
        let signature_offset = hash_offset + self.hash.len();

        // Aux block: descriptors, public key, then public key metadata.
        let aux_block_data_size = descriptors_raw
            .len()
            .checked_add(self.public_key.len())
            .and_then(|s| s.checked_add(self.public_key_metadata.len()))
            .ok_or(Error::FieldOutOfBounds("aux_block_data_size"))?;
        let aux_block_padding_size = padding::calc(aux_block_data_size, 64);
        let aux_block_size = aux_block_data_size
            .checked_add(aux_block_padding_size)
            .ok_or(Error::FieldOutOfBounds("aux_block_size"))?;

        let descriptors_offset = 0usize;
        let public_key_offset = descriptors_offset + descriptors_raw.len();
        let public_key_metadata_offset = public_key_offset + self.public_key.len();

        let total_size = Self::SIZE
            .checked_add(auth_block_size)
            .and_then(|s| s.checked_add(aux_block_size))
            .ok_or(Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE as usize {
            return Err(Error::HeaderTooLarge);
        }

        writer.write_all(&HEADER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_major)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_minor)?;
        writer.write_u64::<BigEndian>(auth_block_size as u64)?;
        writer.write_u64::<BigEndian>(aux_block_size as u64)?;
        writer.write_u32::<BigEndian>(self.algorithm_type.to_raw())?;
        writer.write_u64::<BigEndian>(hash_offset as u64)?;
        writer.write_u64::<BigEndian>(self.hash.len() as u64)?;
        writer.write_u64::<BigEndian>(signature_offset as u64)?;
        writer.write_u64::<BigEndian>(self.signature.len() as u64)?;
        writer.write_u64::<BigEndian>(public_key_offset as u64)?;
        writer.write_u64::<BigEndian>(self.public_key.len() as u64)?;
        writer.write_u64::<BigEndian>(public_key_metadata_offset as u64)?;
        writer.write_u64::<BigEndian>(self.public_key_metadata.len() as u64)?;
        writer.write_u64::<BigEndian>(descriptors_offset as u64)?;
        writer.write_u64::<BigEndian>(descriptors_raw.len() as u64)?;
        writer.write_u64::<BigEndian>(self.rollback_index)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(self.rollback_index_location)?;
        writer
            .write_string_padded(&self.release_string, 48)
            .map_err(|e| Error::WriteFieldError("release_string", e))?;
        writer.write_all(&self.reserved)?;

        if !skip_auth_block {
            writer.write_all(&self.hash)?;
            writer.write_all(&self.signature)?;
            writer.write_zeros_exact(auth_block_padding_size as u64)?;
        }

        writer.write_all(&descriptors_raw)?;
        writer.write_all(&self.public_key)?;
        writer.write_all(&self.public_key_metadata)?;
        writer.write_zeros_exact(aux_block_padding_size as u64)?;

        Ok(())
    }

    /// Serialize the header to a new buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.to_writer(&mut data)?;
        Ok(data)
    }

    /// Get the only hash or hash tree descriptor. Appended vbmeta images always
    /// have exactly one.
    pub fn appended_descriptor(&self) -> Result<AppendedDescriptorRef<'_>> {
        let mut result = None;

        for descriptor in &self.descriptors {
            let found = match descriptor {
                Descriptor::HashTree(d) => AppendedDescriptorRef::HashTree(d),
                Descriptor::Hash(d) => AppendedDescriptorRef::Hash(d),
                _ => continue,
            };
            if result.replace(found).is_some() {
                return Err(Error::NoAppendedDescriptor);
            }
        }

        result.ok_or(Error::NoAppendedDescriptor)
    }

    /// Mutable variant of [`Self::appended_descriptor`].
    pub fn appended_descriptor_mut(&mut self) -> Result<AppendedDescriptorMut<'_>> {
        let mut result = None;

        for descriptor in &mut self.descriptors {
            let found = match descriptor {
                Descriptor::HashTree(d) => AppendedDescriptorMut::HashTree(d),
                Descriptor::Hash(d) => AppendedDescriptorMut::Hash(d),
                _ => continue,
            };
            if result.replace(found).is_some() {
                return Err(Error::NoAppendedDescriptor);
            }
        }

        result.ok_or(Error::NoAppendedDescriptor)
    }

    /// Find the descriptor that refers to `partition_name`.
    pub fn descriptor_for(&self, partition_name: &str) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.partition_name() == Some(partition_name))
    }

    /// Mutable variant of [`Self::descriptor_for`].
    pub fn descriptor_for_mut(&mut self, partition_name: &str) -> Option<&mut Descriptor> {
        self.descriptors
            .iter_mut()
            .find(|d| d.partition_name() == Some(partition_name))
    }

    pub fn is_signed(&self) -> bool {
        self.algorithm_type != AlgorithmType::None
    }

    /// Sign the header with `key`. The key must match the size required by
    /// [`Self::algorithm_type`]; the algorithm is never changed to fit the key.
    pub fn sign(&mut self, key: &RsaSigningKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;

        if key_raw.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(key.size(), self.algorithm_type));
        }

        // The public key and the sizes of the hash and signature are part of
        // the signed data, so they must be final before hashing.
        self.public_key = key_raw;
        self.hash.resize(self.algorithm_type.digest_len(), 0);
        self.signature
            .resize(self.algorithm_type.signature_len(), 0);

        let mut without_auth = Vec::new();
        self.to_writer_internal(&mut without_auth, true)?;

        let hash = self.algorithm_type.hash(&without_auth);
        let signature = self.algorithm_type.sign(key, &hash)?;

        self.hash = hash;
        self.signature = signature;

        Ok(())
    }

    /// Recompute the header's digest and verify the signature against the
    /// embedded public key, which is returned. Unsigned headers return
    /// [`None`].
    pub fn verify(&self) -> Result<Option<RsaPublicKey>> {
        if !self.is_signed() {
            return Ok(None);
        }

        let public_key = decode_public_key(&self.public_key)?;

        if self.public_key.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(
                public_key.size(),
                self.algorithm_type,
            ));
        }

        let mut without_auth = Vec::new();
        self.to_writer_internal(&mut without_auth, true)?;

        let hash = self.algorithm_type.hash(&without_auth);
        if hash != self.hash {
            return Err(Error::InvalidHeaderHash);
        }

        self.algorithm_type
            .verify(&public_key, &hash, &self.signature)?;

        Ok(Some(public_key))
    }
}

impl<R: Read> FromReader<R> for Header {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(magic));
        }

        let required_libavb_version_major = reader.read_u32::<BigEndian>()?;
        let required_libavb_version_minor = reader.read_u32::<BigEndian>()?;
        let auth_block_size = reader.read_u64::<BigEndian>()?;
        let aux_block_size = reader.read_u64::<BigEndian>()?;

        let algorithm_type = AlgorithmType::from_raw(reader.read_u32::<BigEndian>()?);

        let hash_offset = reader.read_u64::<BigEndian>()?;
        let hash_size = reader.read_u64::<BigEndian>()?;
        let signature_offset = reader.read_u64::<BigEndian>()?;
        let signature_size = reader.read_u64::<BigEndian>()?;

        let auth_block_combined = hash_size
            .checked_add(signature_size)
            .ok_or(Error::FieldOutOfBounds("auth_block_combined"))?;
        let auth_block_padding = padding::calc(auth_block_combined, 64);
        if auth_block_combined.checked_add(auth_block_padding) != Some(auth_block_size) {
            return Err(Error::FieldOutOfBounds("auth_block_size"));
        } else if hash_offset > auth_block_combined - hash_size {
            return Err(Error::FieldOutOfBounds("hash_offset"));
        } else if signature_offset > auth_block_combined - signature_size {
            return Err(Error::FieldOutOfBounds("signature_offset"));
        }

        let public_key_offset = reader.read_u64::<BigEndian>()?;
        let public_key_size = reader.read_u64::<BigEndian>()?;
        let public_key_metadata_offset = reader.read_u64::<BigEndian>()?;
        let public_key_metadata_size = reader.read_u64::<BigEndian>()?;
        let descriptors_offset = reader.read_u64::<BigEndian>()?;
        let descriptors_size = reader.read_u64::<BigEndian>()?;

        let aux_block_combined = public_key_size
            .checked_add(public_key_metadata_size)
            .and_then(|s| s.checked_add(descriptors_size))
            .ok_or(Error::FieldOutOfBounds("aux_block_combined"))?;
        let aux_block_padding = padding::calc(aux_block_combined, 64);
        if aux_block_combined.checked_add(aux_block_padding) != Some(aux_block_size) {
            return Err(Error::FieldOutOfBounds("aux_block_size"));
        } else if public_key_offset > aux_block_combined - public_key_size {
            return Err(Error::FieldOutOfBounds("public_key_offset"));
        } else if public_key_metadata_offset > aux_block_combined - public_key_metadata_size {
            return Err(Error::FieldOutOfBounds("public_key_metadata_offset"));
        } else if descriptors_offset > aux_block_combined - descriptors_size {
            return Err(Error::FieldOutOfBounds("descriptors_offset"));
        }

        let rollback_index = reader.read_u64::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;
        let rollback_index_location = reader.read_u32::<BigEndian>()?;

        let release_string = reader
            .read_string_padded(48)
            .map_err(|e| Error::ReadFieldError("release_string", e))?;

        let mut reserved = [0u8; 80];
        reader.read_exact(&mut reserved)?;

        let header_size = reader.stream_position()?;
        let total_size = header_size
            .checked_add(auth_block_size)
            .and_then(|v| v.checked_add(aux_block_size))
            .ok_or(Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        // Every size above now fits in a usize.

        let mut auth_block = vec![0u8; auth_block_size as usize];
        reader.read_exact(&mut auth_block)?;

        let mut aux_block = vec![0u8; aux_block_size as usize];
        reader.read_exact(&mut aux_block)?;

        // Signatures are verified against the re-serialized fields, so the
        // padding is the only place where unverified data could hide.
        if !util::is_zero(&auth_block[auth_block_combined as usize..]) {
            return Err(Error::PaddingNotZero("auth_block"));
        }
        if !util::is_zero(&aux_block[aux_block_combined as usize..]) {
            return Err(Error::PaddingNotZero("aux_block"));
        }

        let hash = &auth_block[hash_offset as usize..][..hash_size as usize];
        let signature = &auth_block[signature_offset as usize..][..signature_size as usize];

        let public_key = &aux_block[public_key_offset as usize..][..public_key_size as usize];
        let public_key_metadata =
            &aux_block[public_key_metadata_offset as usize..][..public_key_metadata_size as usize];

        let mut descriptors = vec![];
        let descriptors_end = descriptors_offset + descriptors_size;
        let mut descriptor_reader = Cursor::new(&aux_block[..descriptors_end as usize]);
        let mut pos = descriptor_reader.seek(SeekFrom::Start(descriptors_offset))?;

        while pos < descriptors_end {
            descriptors.push(Descriptor::from_reader(&mut descriptor_reader)?);
            pos = descriptor_reader.stream_position()?;
        }

        Ok(Self {
            required_libavb_version_major,
            required_libavb_version_minor,
            algorithm_type,
            hash: hash.to_owned(),
            signature: signature.to_owned(),
            public_key: public_key.to_owned(),
            public_key_metadata: public_key_metadata.to_owned(),
            descriptors,
            rollback_index,
            flags,
            rollback_index_location,
            release_string,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for Header {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.to_writer_internal(writer, false)
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
    #[serde(with = "hex")]
    pub reserved: [u8; 28],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("original_image_size", &self.original_image_size)
            .field("vbmeta_offset", &self.vbmeta_offset)
            .field("vbmeta_size", &self.vbmeta_size)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Footer {
    pub const SIZE: usize = 64;
    pub const VERSION_MAJOR: u32 = 1;
    pub const VERSION_MINOR: u32 = 0;

    pub fn new() -> Self {
        Self {
            version_major: Self::VERSION_MAJOR,
            version_minor: Self::VERSION_MINOR,
            original_image_size: 0,
            vbmeta_offset: 0,
            vbmeta_size: 0,
            reserved: [0u8; 28],
        }
    }
}

impl Default for Footer {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read> FromReader<R> for Footer {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != FOOTER_MAGIC {
            return Err(Error::InvalidFooterMagic(magic));
        }

        let version_major = reader.read_u32::<BigEndian>()?;
        let version_minor = reader.read_u32::<BigEndian>()?;
        let original_image_size = reader.read_u64::<BigEndian>()?;
        let vbmeta_offset = reader.read_u64::<BigEndian>()?;
        let vbmeta_size = reader.read_u64::<BigEndian>()?;

        let mut reserved = [0u8; 28];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            version_major,
            version_minor,
            original_image_size,
            vbmeta_offset,
            vbmeta_size,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for Footer {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&FOOTER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.version_major)?;
        writer.write_u32::<BigEndian>(self.version_minor)?;
        writer.write_u64::<BigEndian>(self.original_image_size)?;
        writer.write_u64::<BigEndian>(self.vbmeta_offset)?;
        writer.write_u64::<BigEndian>(self.vbmeta_size)?;
        writer.write_all(&self.reserved)?;
        Ok(())
    }
}

fn slice_range<'a>(data: &'a [u8], range: Range<u64>, field: &'static str) -> Result<&'a [u8]> {
    let start = range.start.to_usize().ok_or(Error::FieldOutOfBounds(field))?;
    let end = range.end.to_usize().ok_or(Error::FieldOutOfBounds(field))?;

    data.get(start..end).ok_or(Error::FieldOutOfBounds(field))
}

/// Encode a public key in the AVB binary format.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    if key.e() != &BigUint::from(65537u32) {
        return Err(Error::UnsupportedRsaPublicExponent(key.e().clone()));
    }

    // libavb wants a few values precomputed so verification in the bootloader
    // is cheap:
    //   n0inv = -1 / n[0] (mod 2^32)
    //   rr = (2^bits)^2 (mod n)

    let b = BigUint::from(1u64 << 32);
    let n0inv = key
        .n()
        .mod_inverse(&b)
        .and_then(|inv| Some(b.to_bigint()? - inv))
        .and_then(|v| v.to_u32())
        .ok_or(Error::FieldOutOfBounds("n0inv"))?;
    let r = BigUint::from(2u32).pow(key.n().bits());
    let rrmodn = r.modpow(&BigUint::from(2u32), key.n());

    let key_bits = (key.size() * 8)
        .to_u32()
        .ok_or(Error::FieldOutOfBounds("key_bits"))?;

    let mut data = vec![];
    data.extend_from_slice(&key_bits.to_be_bytes());
    data.extend_from_slice(&n0inv.to_be_bytes());

    let modulus_raw = key.n().to_bytes_be();
    data.resize(data.len() + key.size() - modulus_raw.len(), 0);
    data.extend_from_slice(&modulus_raw);

    let rrmodn_raw = rrmodn.to_bytes_be();
    data.resize(data.len() + key.size() - rrmodn_raw.len(), 0);
    data.extend_from_slice(&rrmodn_raw);

    Ok(data)
}

/// Decode a public key from the AVB binary format.
pub fn decode_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    let mut reader = Cursor::new(data);
    let key_bits = reader
        .read_u32::<BigEndian>()?
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("key_bits"))?;

    if key_bits % 8 != 0 || data.len() != 8 + 2 * key_bits / 8 {
        return Err(Error::FieldOutOfBounds("key_bits"));
    }

    // Skip n0inv.
    reader.read_discard_exact(4)?;

    let mut modulus_raw = vec![0u8; key_bits / 8];
    reader.read_exact(&mut modulus_raw)?;

    let modulus = BigUint::from_bytes_be(&modulus_raw);
    let public_key = RsaPublicKey::new(modulus, BigUint::from(65537u32))?;

    Ok(public_key)
}

/// Parse a standalone vbmeta image (eg. the `vbmeta` partition).
pub fn parse_vbmeta(data: &[u8]) -> Result<Header> {
    Header::from_reader(Cursor::new(data))
}

/// Parse the footer at the end of a partition image and the vbmeta structure
/// it points to.
pub fn parse_footer(data: &[u8]) -> Result<(Footer, Header)> {
    let footer_offset = data
        .len()
        .checked_sub(Footer::SIZE)
        .ok_or(Error::TooSmallForFooter(data.len() as u64))?;
    let footer = Footer::from_reader(Cursor::new(&data[footer_offset..]))?;

    let end = footer
        .vbmeta_offset
        .checked_add(footer.vbmeta_size)
        .ok_or(Error::FieldOutOfBounds("vbmeta_size"))?;
    if end > footer_offset as u64 || footer.original_image_size > footer.vbmeta_offset {
        return Err(Error::FieldOutOfBounds("vbmeta_offset"));
    }

    let vbmeta = slice_range(data, footer.vbmeta_offset..end, "vbmeta_offset")?;
    let header = parse_vbmeta(vbmeta)?;

    Ok((footer, header))
}

/// Serialize a standalone vbmeta image. The output is padded to a multiple of
/// `block_size` and to at least `min_size` bytes.
pub fn write_root_image(header: &Header, block_size: u64, min_size: u64) -> Result<Vec<u8>> {
    let mut writer = CountingWriter::new(Vec::new());

    header.to_writer(&mut writer)?;
    padding::write_zeros(&mut writer, block_size)?;

    let (mut data, size) = writer.finish();
    if size < min_size {
        data.resize(min_size as usize, 0);
    }

    Ok(data)
}

/// Append a vbmeta header and footer to partition data. `image` holds the data
/// covered by the header's appended descriptor (including any hash tree). If
/// `partition_size` is specified, the output is exactly that size and an error
/// is returned if the header and footer won't fit. Otherwise, the output is
/// only as large as needed.
pub fn write_appended_image(
    image: &[u8],
    header: &Header,
    footer: &mut Footer,
    partition_size: Option<u64>,
) -> Result<Vec<u8>> {
    let descriptor = header.appended_descriptor()?;
    let logical_image_size = descriptor.logical_image_size()?;
    let logical = slice_range(image, 0..logical_image_size, "logical_image_size")?;

    let mut writer = Cursor::new(logical.to_vec());
    writer.seek(SeekFrom::End(0))?;

    // The header starts on a block boundary.
    let header_offset = {
        let padding_size = padding::write_zeros(&mut writer, APPENDED_BLOCK_SIZE)?;
        logical_image_size
            .checked_add(padding_size)
            .ok_or(Error::FieldOutOfBounds("header_offset"))?
    };

    let mut header_buf = Cursor::new(Vec::new());
    header.to_writer(&mut header_buf)?;
    let header_size = header_buf.stream_position()?;
    let header_padding = padding::write_zeros(&mut header_buf, APPENDED_BLOCK_SIZE)?;
    let header_end_padded = header_offset
        .checked_add(header_size)
        .and_then(|s| s.checked_add(header_padding))
        .ok_or(Error::FieldOutOfBounds("header_end_padded"))?;

    if let Some(s) = partition_size {
        if header_end_padded > s {
            return Err(Error::TooSmallForHeader(s));
        }
    }

    writer.write_all(&header_buf.into_inner())?;

    // The footer lives in its own block at the very end.
    let footer_end = match partition_size {
        Some(s) => {
            if s - header_end_padded < APPENDED_BLOCK_SIZE {
                return Err(Error::TooSmallForFooter(s));
            }
            s
        }
        None => header_end_padded
            .checked_add(APPENDED_BLOCK_SIZE)
            .ok_or(Error::FieldOutOfBounds("footer_end"))?,
    };

    footer.original_image_size = descriptor.image_size();
    footer.vbmeta_offset = header_offset;
    footer.vbmeta_size = header_size;

    // Seeking past the end of a cursor zero fills the gap on the next write.
    writer.seek(SeekFrom::Start(footer_end - Footer::SIZE as u64))?;
    footer.to_writer(&mut writer)?;

    Ok(writer.into_inner())
}
