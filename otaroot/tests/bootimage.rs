// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use assert_matches::assert_matches;
use pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use otaroot::{
    crypto::RsaSigningKey,
    format::{
        avb::{AlgorithmType, Descriptor, HashDescriptor, Header},
        bootimage::{
            self, BootImage, BootImageExt, BootImageV2, BootImageV3Through4, RamdiskMeta,
            V4Extra, VendorBootImageV3Through4, VendorV4Extra,
        },
    },
    stream::FromReader,
};

fn get_test_key() -> RsaSigningKey {
    let data = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/TEST_KEY_DO_NOT_USE_avb_4096.key",
    ));

    RsaPrivateKey::from_pkcs8_pem(data).unwrap().into()
}

fn repeat(s: &str, max_len: usize) -> String {
    assert!(!s.is_empty());

    let mut result = s.repeat(max_len / s.len());
    result.push_str(&s[..max_len % s.len()]);

    result
}

fn round_trip(image: &BootImage, expected_version: u32) -> Vec<u8> {
    assert_eq!(image.header_version(), expected_version);

    let data = image.to_vec().unwrap();

    let new_image = BootImage::from_reader(Cursor::new(&data)).unwrap();
    assert_eq!(&new_image, image);

    // Encoding is deterministic.
    assert_eq!(new_image.to_vec().unwrap(), data);

    data
}

fn boot_v4(signature: Vec<u8>) -> BootImage {
    BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0x01234567,
        reserved: [0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff],
        cmdline: repeat("Cmdline", 1536),
        v4_extra: Some(V4Extra { signature }),
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
    })
}

#[test]
fn round_trip_v2() {
    let image = BootImage::V2(BootImageV2 {
        kernel_addr: 0x11111111,
        ramdisk_addr: 0x22222222,
        second_addr: 0x33333333,
        tags_addr: 0x44444444,
        page_size: 2048,
        os_version: 0x55555555,
        name: repeat("Name", 16),
        cmdline: repeat("Cmdline", 512),
        id: [0x66666666; 8],
        extra_cmdline: repeat("ExtraCmdline", 1024),
        recovery_dtbo_offset: 0,
        dtb_addr: 0x7777777777777777,
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
        second: b"second data".to_vec(),
        recovery_dtbo: vec![],
        dtb: b"dtb data".to_vec(),
    });

    let data = round_trip(&image, 2);
    assert_eq!(&data[..8], bootimage::BOOT_MAGIC);
    assert_eq!(data.len() % 2048, 0);
}

#[test]
fn round_trip_v3() {
    let image = BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0x01234567,
        reserved: [0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff],
        cmdline: repeat("Cmdline", 1536),
        v4_extra: None,
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
    });

    let data = round_trip(&image, 3);
    // Header, kernel, and ramdisk pages.
    assert_eq!(data.len(), 3 * 4096);
}

#[test]
fn round_trip_v4() {
    let data = round_trip(&boot_v4(vec![0; 4096]), 4);
    assert_eq!(data.len(), 4 * 4096);

    round_trip(&boot_v4(vec![]), 4);
}

#[test]
fn resign_v4_vts_signature() {
    let key = get_test_key();

    let mut vts = Header {
        required_libavb_version_major: 1,
        required_libavb_version_minor: 0,
        algorithm_type: AlgorithmType::Sha256Rsa4096,
        hash: vec![],       // autogenerated
        signature: vec![],  // autogenerated
        public_key: vec![], // autogenerated
        public_key_metadata: vec![],
        descriptors: vec![Descriptor::Hash(HashDescriptor {
            image_size: 0,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "boot".to_owned(),
            salt: b"d00df00d".to_vec(),
            root_digest: vec![0; 32],
            flags: 0,
            reserved: [0; 60],
        })],
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: "avbtool 1.2.0".to_owned(),
        reserved: [0; 80],
    };
    vts.sign(&key).unwrap();

    let mut signature = vts.to_vec().unwrap();
    signature.resize(4096, 0);

    let BootImage::V3Through4(mut image) = boot_v4(signature) else {
        unreachable!();
    };
    image.ramdisk.extend_from_slice(b"ROOT");

    assert!(image.resign_vts_signature(&key).unwrap());

    let data = BootImage::V3Through4(image.clone()).to_vec().unwrap();
    let signed_len = data.len() - 4096;

    let v4 = image.v4_extra.as_ref().unwrap();
    assert_eq!(v4.signature.len(), 4096);

    let header = v4.vts_header().unwrap().unwrap();
    assert_eq!(header.verify().unwrap().unwrap(), key.to_public_key());

    let Descriptor::Hash(d) = &header.descriptors[0] else {
        panic!("Expected hash descriptor");
    };
    assert_eq!(d.image_size, signed_len as u64);
    d.verify(&data).unwrap();
}

#[test]
fn zeroed_vts_region_is_kept() {
    let BootImage::V3Through4(mut image) = boot_v4(vec![0; 4096]) else {
        unreachable!();
    };

    assert!(!image.resign_vts_signature(&get_test_key()).unwrap());
    assert_eq!(image.v4_extra.unwrap().signature, vec![0; 4096]);
}

#[test]
fn round_trip_vendor_v3() {
    let image = BootImage::VendorV3Through4(VendorBootImageV3Through4 {
        page_size: 4096,
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x89abcdef,
        cmdline: repeat("Cmdline", 2048),
        tags_addr: 0xfedcba98,
        name: repeat("Name", 16),
        dtb: b"dtb data".to_vec(),
        dtb_addr: 0x76543210,
        ramdisks: vec![b"ramdisk data".to_vec()],
        v4_extra: None,
    });

    let data = round_trip(&image, 3);
    assert!(image.is_vendor());
    assert_eq!(&data[..8], bootimage::VENDOR_BOOT_MAGIC);
}

#[test]
fn round_trip_vendor_v4() {
    let board_id = [
        0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff, 0xffeeddcc, 0xbbaa9988, 0x77665544,
        0x33221100, 0x004488cc, 0x115599dd, 0x2266aaee, 0x3377bbff, 0xffbb7733, 0xeeaa6622,
        0xdd995511, 0xcc884400,
    ];
    let image = BootImage::VendorV3Through4(VendorBootImageV3Through4 {
        page_size: 2048,
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x89abcdef,
        cmdline: repeat("Cmdline", 2048),
        tags_addr: 0xfedcba98,
        name: repeat("Name", 16),
        dtb: b"dtb data".to_vec(),
        dtb_addr: 0x76543210,
        ramdisks: vec![
            b"ramdisk 0 data".to_vec(),
            b"ramdisk 1 data".to_vec(),
            b"ramdisk 2 data".to_vec(),
        ],
        v4_extra: Some(VendorV4Extra {
            ramdisk_metas: vec![
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_NONE,
                    ramdisk_name: repeat("None", 31),
                    board_id,
                },
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_PLATFORM,
                    ramdisk_name: repeat("Platform", 31),
                    board_id,
                },
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_DLKM,
                    ramdisk_name: String::new(),
                    board_id: [0; 16],
                },
            ],
            bootconfig: "androidboot.hardware=test\n".to_owned(),
        }),
    });

    round_trip(&image, 4);
}

#[test]
fn reject_unsupported_images() {
    let image = BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0,
        reserved: [0; 4],
        cmdline: String::new(),
        v4_extra: None,
        kernel: b"kernel".to_vec(),
        ramdisk: b"ramdisk".to_vec(),
    });
    let data = image.to_vec().unwrap();

    for version in [0u32, 1, 5] {
        let mut modified = data.clone();
        modified[40..44].copy_from_slice(&version.to_le_bytes());

        assert_matches!(
            BootImage::from_reader(Cursor::new(&modified)),
            Err(bootimage::Error::UnknownHeaderVersion { kind: "boot", version: v }) if v == version
        );
    }

    let mut garbage = data.clone();
    garbage[..8].copy_from_slice(b"NOTBOOT!");
    assert_matches!(
        BootImage::from_reader(Cursor::new(&garbage)),
        Err(bootimage::Error::UnknownMagic(_))
    );
}
