// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use otaroot::{
    crypto::{KeySet, RsaSigningKey},
    format::{
        avb::{
            self, AlgorithmType, AppendedDescriptorRef, ChainPartitionDescriptor, Descriptor,
            Footer, HashDescriptor, HashTreeDescriptor, Header, PropertyDescriptor,
        },
        bootimage::{self, BootImage, BootImageV3Through4, V4Extra},
        payload,
    },
    patch::{
        inject::{FragmentMeta, InjectMode, PrepatchedImagePatcher, RootInjector, RootPatch},
        resign::{self, ResignOptions},
        run::{self, ErrorKind, PartitionError, PatchTarget, RunOutput, Stage},
    },
    stream::FromReader,
    util,
};

const BOOT_PARTITION_SIZE: u64 = 64 * 1024;

fn get_test_key(name: &str) -> RsaSigningKey {
    let path = format!(
        "{}/tests/keys/TEST_KEY_DO_NOT_USE_{name}.key",
        env!("CARGO_MANIFEST_DIR"),
    );
    let data = std::fs::read_to_string(path).unwrap();

    RsaPrivateKey::from_pkcs8_pem(&data).unwrap().into()
}

fn test_keys() -> KeySet {
    let mut keys = KeySet::new();
    keys.insert("vbmeta", get_test_key("avb_4096"));
    keys.insert("vbmeta_system", get_test_key("system_2048"));
    keys
}

fn new_header(algorithm_type: AlgorithmType, descriptors: Vec<Descriptor>) -> Header {
    Header {
        required_libavb_version_major: 1,
        required_libavb_version_minor: 0,
        algorithm_type,
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors,
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: "avbtool 1.3.0".to_owned(),
        reserved: [0; 80],
    }
}

fn hash_descriptor(partition_name: &str, data: &[u8]) -> HashDescriptor {
    let mut descriptor = HashDescriptor {
        image_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: partition_name.to_owned(),
        salt: format!("{partition_name} salt").into_bytes(),
        root_digest: vec![],
        flags: 0,
        reserved: [0; 60],
    };
    descriptor.update(data).unwrap();
    descriptor
}

fn boot_data() -> Vec<u8> {
    BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0,
        reserved: [0; 4],
        cmdline: "console=ttyS0".to_owned(),
        v4_extra: Some(V4Extra {
            signature: vec![0; 4096],
        }),
        kernel: b"kernel".to_vec(),
        ramdisk: b"ramdisk".to_vec(),
    })
    .to_vec()
    .unwrap()
}

/// Boot v4 image with an unsigned appended hash footer.
fn boot_image() -> (Vec<u8>, HashDescriptor) {
    let data = boot_data();
    let descriptor = hash_descriptor("boot", &data);
    let header = new_header(AlgorithmType::None, vec![Descriptor::Hash(descriptor.clone())]);

    let mut footer = Footer::new();
    let image =
        avb::write_appended_image(&data, &header, &mut footer, Some(BOOT_PARTITION_SIZE)).unwrap();

    (image, descriptor)
}

/// vbmeta chain loads vbmeta_system and covers boot and dtbo with hash
/// descriptors. boot has an unsigned footer and dtbo has no AVB metadata.
fn image_set(vbmeta_flags: u32) -> BTreeMap<String, Vec<u8>> {
    let vbmeta_key = get_test_key("avb_4096");
    let system_key = get_test_key("system_2048");

    let mut vbmeta_system = new_header(
        AlgorithmType::Sha256Rsa2048,
        vec![Descriptor::Property(PropertyDescriptor {
            key: "com.android.build.system.fingerprint".to_owned(),
            value: b"test/system".to_vec(),
        })],
    );
    vbmeta_system.sign(&system_key).unwrap();

    let (boot, boot_descriptor) = boot_image();
    let dtbo = vec![0xd7; 8192];

    let mut vbmeta = new_header(
        AlgorithmType::Sha256Rsa4096,
        vec![
            Descriptor::Hash(boot_descriptor),
            Descriptor::ChainPartition(ChainPartitionDescriptor {
                rollback_index_location: 1,
                partition_name: "vbmeta_system".to_owned(),
                public_key: vbmeta_system.public_key.clone(),
                flags: 0,
                reserved: [0; 60],
            }),
            Descriptor::Hash(hash_descriptor("dtbo", &dtbo)),
        ],
    );
    vbmeta.flags = vbmeta_flags;
    vbmeta.sign(&vbmeta_key).unwrap();

    BTreeMap::from([
        ("boot".to_owned(), boot),
        ("dtbo".to_owned(), dtbo),
        (
            "vbmeta".to_owned(),
            avb::write_root_image(&vbmeta, 4096, 0).unwrap(),
        ),
        (
            "vbmeta_system".to_owned(),
            avb::write_root_image(&vbmeta_system, 4096, 0).unwrap(),
        ),
    ])
}

fn injector() -> RootInjector {
    RootInjector::new(RootPatch {
        ramdisk: b"ROOT".to_vec(),
        mode: InjectMode::Append,
        fragment: FragmentMeta::default(),
    })
}

fn run_patch(
    images: &BTreeMap<String, Vec<u8>>,
    patch: bool,
    keys: &KeySet,
    options: &ResignOptions,
) -> Result<RunOutput, run::Error> {
    let cancel_signal = AtomicBool::new(false);
    let injector = injector();
    let targets = if patch {
        vec![PatchTarget {
            partition: "boot",
            patcher: &injector,
        }]
    } else {
        vec![]
    };

    let inputs = images
        .iter()
        .map(|(name, data)| (name.clone(), Ok(data.clone())))
        .collect();

    run::run(inputs, &targets, keys, options, &cancel_signal)
}

fn final_images(output: &RunOutput) -> BTreeMap<String, Vec<u8>> {
    output
        .images
        .iter()
        .map(|(name, p)| (name.clone(), p.data.clone()))
        .collect()
}

fn names<const N: usize>(list: [&str; N]) -> BTreeSet<String> {
    list.into_iter().map(|n| n.to_owned()).collect()
}

#[test]
fn patch_and_resign_chain() {
    let images = image_set(0);
    let output = run_patch(&images, true, &test_keys(), &ResignOptions::default()).unwrap();

    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.changed, names(["boot", "vbmeta"]));

    // Untouched partitions are byte-for-byte identical.
    assert_eq!(output.images["dtbo"].data, images["dtbo"]);
    assert_eq!(output.images["vbmeta_system"].data, images["vbmeta_system"]);
    assert_eq!(output.images["dtbo"].stage, Stage::Encoded);

    // Partition sizes are preserved.
    for (name, data) in &images {
        assert_eq!(output.images[name].data.len(), data.len(), "{name}");
    }

    let cancel_signal = AtomicBool::new(false);
    let outputs = final_images(&output);
    run::verify(&outputs, &cancel_signal).unwrap();

    // The root ramdisk made it in.
    let (footer, header) = avb::parse_footer(&outputs["boot"]).unwrap();
    let data = &outputs["boot"][..footer.original_image_size as usize];
    let BootImage::V3Through4(boot) = BootImage::from_reader(Cursor::new(data)).unwrap() else {
        panic!("Expected boot v4 image");
    };
    assert_eq!(boot.ramdisk, b"ramdiskROOT");
    assert_eq!(boot.cmdline, "console=ttyS0");

    // The parent holds a copy of the child's self-descriptor.
    let AppendedDescriptorRef::Hash(boot_descriptor) = header.appended_descriptor().unwrap() else {
        panic!("Expected hash descriptor");
    };
    let vbmeta = avb::parse_vbmeta(&outputs["vbmeta"]).unwrap();
    assert_eq!(
        vbmeta.descriptor_for("boot"),
        Some(&Descriptor::Hash(boot_descriptor.clone()))
    );

    for (name, data) in &outputs {
        output.digests.verify(name, data).unwrap();
        assert_eq!(output.digests.get(name), Some(&util::sha256(data)));
    }
}

#[test]
fn unpatched_run_is_noop() {
    let images = image_set(0);
    let output = run_patch(&images, false, &test_keys(), &ResignOptions::default()).unwrap();

    assert!(output.failures.is_empty());
    assert!(output.changed.is_empty());
    assert_eq!(final_images(&output), images);
}

#[test]
fn reproducible_output() {
    let images = image_set(0);
    let keys = test_keys();

    let first = run_patch(&images, true, &keys, &ResignOptions::default()).unwrap();
    let second = run_patch(&images, true, &keys, &ResignOptions::default()).unwrap();

    assert_eq!(final_images(&first), final_images(&second));
    assert_eq!(first.digests, second.digests);
}

#[test]
fn rotated_salt_forces_rehash() {
    let images = image_set(0);
    let options = ResignOptions {
        salts: BTreeMap::from([("dtbo".to_owned(), b"ignored".to_vec())]),
        ..Default::default()
    };

    // dtbo has no footer, so there is no descriptor of its own to rotate.
    let output = run_patch(&images, false, &test_keys(), &options).unwrap();
    assert!(output.changed.is_empty());

    let options = ResignOptions {
        salts: BTreeMap::from([("boot".to_owned(), b"new salt".to_vec())]),
        ..Default::default()
    };

    let output = run_patch(&images, false, &test_keys(), &options).unwrap();
    assert_eq!(output.changed, names(["boot", "vbmeta"]));

    let outputs = final_images(&output);
    run::verify(&outputs, &AtomicBool::new(false)).unwrap();

    let (_, header) = avb::parse_footer(&outputs["boot"]).unwrap();
    let AppendedDescriptorRef::Hash(d) = header.appended_descriptor().unwrap() else {
        panic!("Expected hash descriptor");
    };
    assert_eq!(d.salt, b"new salt");
}

#[test]
fn key_must_match_algorithm() {
    let images = image_set(0);

    let mut keys = test_keys();
    keys.insert("vbmeta", get_test_key("avb_2048"));

    let e = run_patch(&images, true, &keys, &ResignOptions::default()).unwrap_err();
    assert_matches!(
        e,
        run::Error::Resign(resign::Error::AlgorithmMismatch { ref name, key_bits: 2048, .. })
            if name == "vbmeta"
    );
    assert_eq!(e.kind(), Some(ErrorKind::AlgorithmMismatch));
}

#[test]
fn missing_key_fails_run() {
    let images = image_set(0);

    let mut keys = KeySet::new();
    keys.insert("vbmeta_system", get_test_key("system_2048"));

    let e = run_patch(&images, true, &keys, &ResignOptions::default()).unwrap_err();
    assert_matches!(e, run::Error::Resign(resign::Error::MissingKey(ref n)) if n == "vbmeta");
    assert_eq!(e.kind(), Some(ErrorKind::Chain));

    // Nothing to sign means no key is needed.
    run_patch(&images, false, &keys, &ResignOptions::default()).unwrap();
}

#[test]
fn vbmeta_flags() {
    let images = image_set(Header::FLAG_VERIFICATION_DISABLED);

    let e = run_patch(&images, false, &test_keys(), &ResignOptions::default()).unwrap_err();
    assert_matches!(
        e,
        run::Error::Resign(resign::Error::VbmetaFlagsSet { flags: 2, .. })
    );

    let options = ResignOptions {
        clear_vbmeta_flags: true,
        ..Default::default()
    };
    let output = run_patch(&images, false, &test_keys(), &options).unwrap();
    assert_eq!(output.changed, names(["vbmeta"]));

    let outputs = final_images(&output);
    run::verify(&outputs, &AtomicBool::new(false)).unwrap();
    assert_eq!(avb::parse_vbmeta(&outputs["vbmeta"]).unwrap().flags, 0);
}

#[test]
fn failed_partition_fails_ancestors() {
    let images = image_set(0);
    let cancel_signal = AtomicBool::new(false);
    let injector = injector();
    let targets = [PatchTarget {
        partition: "boot",
        patcher: &injector,
    }];

    let mut inputs = images
        .iter()
        .map(|(name, data)| (name.clone(), Ok(data.clone())))
        .collect::<BTreeMap<_, _>>();
    inputs.insert(
        "dtbo".to_owned(),
        Err(PartitionError::from(payload::Error::MissingBaseImage {
            index: 0,
        })),
    );

    let output = run::run(
        inputs,
        &targets,
        &test_keys(),
        &ResignOptions::default(),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(
        output.failures.keys().cloned().collect::<BTreeSet<_>>(),
        names(["dtbo", "vbmeta"])
    );
    assert_matches!(
        &output.failures["vbmeta"],
        PartitionError::Resign(resign::Error::ChildFailed { child, .. }) if child == "dtbo"
    );

    // Independent partitions are still produced.
    assert_eq!(output.changed, names(["boot"]));
    assert!(output.images.contains_key("vbmeta_system"));
    assert!(!output.images.contains_key("vbmeta"));
    assert!(output.digests.get("vbmeta").is_none());
}

#[test]
fn verify_detects_tampering() {
    let images = image_set(0);
    let output = run_patch(&images, true, &test_keys(), &ResignOptions::default()).unwrap();
    let cancel_signal = AtomicBool::new(false);

    let mut outputs = final_images(&output);
    outputs.get_mut("dtbo").unwrap()[0] ^= 0xff;
    assert_matches!(
        run::verify(&outputs, &cancel_signal),
        Err(run::Error::Resign(resign::Error::Avb {
            source: avb::Error::InvalidDigest { .. },
            ..
        }))
    );

    // Signed by a key that vbmeta doesn't know about.
    let mut vbmeta_system = avb::parse_vbmeta(&images["vbmeta_system"]).unwrap();
    vbmeta_system.sign(&get_test_key("avb_2048")).unwrap();

    let mut outputs = final_images(&output);
    outputs.insert(
        "vbmeta_system".to_owned(),
        avb::write_root_image(&vbmeta_system, 4096, 0).unwrap(),
    );
    assert_matches!(
        run::verify(&outputs, &cancel_signal),
        Err(run::Error::Resign(resign::Error::ChainKeyMismatch { .. }))
    );
}

#[test]
fn dangling_chain_descriptor() {
    let mut images = image_set(0);
    images.remove("vbmeta_system");

    let e = run_patch(&images, false, &test_keys(), &ResignOptions::default()).unwrap_err();
    assert_matches!(e, run::Error::Chain(_));
    assert_eq!(e.kind(), Some(ErrorKind::Chain));
}

#[test]
fn chained_boot_signed_with_new_key() {
    let vbmeta_key = get_test_key("avb_4096");
    let new_key = get_test_key("avb_2048");

    let data = boot_data();
    let mut boot_header = new_header(
        AlgorithmType::Sha256Rsa2048,
        vec![Descriptor::Hash(hash_descriptor("boot", &data))],
    );
    boot_header.sign(&get_test_key("system_2048")).unwrap();
    let boot = avb::write_appended_image(
        &data,
        &boot_header,
        &mut Footer::new(),
        Some(BOOT_PARTITION_SIZE),
    )
    .unwrap();

    let mut vbmeta = new_header(
        AlgorithmType::Sha256Rsa4096,
        vec![Descriptor::ChainPartition(ChainPartitionDescriptor {
            rollback_index_location: 2,
            partition_name: "boot".to_owned(),
            public_key: boot_header.public_key.clone(),
            flags: 0,
            reserved: [0; 60],
        })],
    );
    vbmeta.sign(&vbmeta_key).unwrap();

    let images = BTreeMap::from([
        ("boot".to_owned(), boot),
        (
            "vbmeta".to_owned(),
            avb::write_root_image(&vbmeta, 4096, 0).unwrap(),
        ),
    ]);

    let mut keys = KeySet::new();
    keys.insert("vbmeta", vbmeta_key);
    keys.insert("boot", new_key.clone());

    let output = run_patch(&images, true, &keys, &ResignOptions::default()).unwrap();
    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.changed, names(["boot", "vbmeta"]));

    let outputs = final_images(&output);
    run::verify(&outputs, &AtomicBool::new(false)).unwrap();

    let (_, header) = avb::parse_footer(&outputs["boot"]).unwrap();
    assert_eq!(header.verify().unwrap(), Some(new_key.to_public_key()));

    let new_public_key = avb::encode_public_key(&new_key.to_public_key()).unwrap();
    assert_ne!(new_public_key, boot_header.public_key);

    let vbmeta = avb::parse_vbmeta(&outputs["vbmeta"]).unwrap();
    assert_matches!(
        vbmeta.descriptor_for("boot"),
        Some(Descriptor::ChainPartition(d)) if d.public_key == new_public_key
    );
}

#[test]
fn rotated_salt_regenerates_hash_tree() {
    let cancel_signal = AtomicBool::new(false);
    let data = (0..16 * 4096).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let mut descriptor = HashTreeDescriptor {
        dm_verity_version: 1,
        image_size: 0,
        tree_offset: 0,
        tree_size: 0,
        data_block_size: 4096,
        hash_block_size: 4096,
        fec_num_roots: 0,
        fec_offset: 0,
        fec_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: "system".to_owned(),
        salt: b"system salt".to_vec(),
        root_digest: vec![],
        flags: 0,
        reserved: [0; 60],
    };
    let tree = descriptor.update(&data, &cancel_signal).unwrap();

    let mut with_tree = data.clone();
    with_tree.extend_from_slice(&tree);

    let system_header = new_header(
        AlgorithmType::None,
        vec![Descriptor::HashTree(descriptor.clone())],
    );
    let system = avb::write_appended_image(
        &with_tree,
        &system_header,
        &mut Footer::new(),
        Some(128 * 1024),
    )
    .unwrap();

    let mut images = image_set(0);
    let mut vbmeta = avb::parse_vbmeta(&images["vbmeta"]).unwrap();
    vbmeta.descriptors.push(Descriptor::HashTree(descriptor.clone()));
    vbmeta.sign(&get_test_key("avb_4096")).unwrap();
    images.insert("vbmeta".to_owned(), avb::write_root_image(&vbmeta, 4096, 0).unwrap());
    images.insert("system".to_owned(), system);

    run::verify(&images, &cancel_signal).unwrap();

    let options = ResignOptions {
        salts: BTreeMap::from([("system".to_owned(), b"new salt".to_vec())]),
        ..Default::default()
    };
    let output = run_patch(&images, false, &test_keys(), &options).unwrap();
    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.changed, names(["system", "vbmeta"]));

    let outputs = final_images(&output);
    assert_eq!(outputs["system"].len(), images["system"].len());
    run::verify(&outputs, &cancel_signal).unwrap();

    let (footer, header) = avb::parse_footer(&outputs["system"]).unwrap();
    let AppendedDescriptorRef::HashTree(d) = header.appended_descriptor().unwrap() else {
        panic!("Expected hash tree descriptor");
    };
    assert_eq!(d.salt, b"new salt");
    assert_ne!(d.root_digest, descriptor.root_digest);
    assert_eq!(footer.original_image_size, data.len() as u64);

    // The data is untouched. Only the tree after it is regenerated.
    assert_eq!(outputs["system"][..data.len()], data);
    assert_ne!(outputs["system"][data.len()..with_tree.len()], tree);

    let vbmeta = avb::parse_vbmeta(&outputs["vbmeta"]).unwrap();
    assert_eq!(
        vbmeta.descriptor_for("system"),
        Some(&Descriptor::HashTree(d.clone()))
    );
}

#[test]
fn unknown_boot_version_fails_partition() {
    // Boot magic with header version 7 at offset 40.
    let mut data = vec![0u8; 4096];
    data[..8].copy_from_slice(&bootimage::BOOT_MAGIC);
    data[40..44].copy_from_slice(&7u32.to_le_bytes());

    let descriptor = hash_descriptor("boot", &data);
    let boot_header = new_header(AlgorithmType::None, vec![Descriptor::Hash(descriptor.clone())]);
    let boot = avb::write_appended_image(
        &data,
        &boot_header,
        &mut Footer::new(),
        Some(BOOT_PARTITION_SIZE),
    )
    .unwrap();

    let mut images = image_set(0);
    let mut vbmeta = avb::parse_vbmeta(&images["vbmeta"]).unwrap();
    *vbmeta.descriptor_for_mut("boot").unwrap() = Descriptor::Hash(descriptor);
    vbmeta.sign(&get_test_key("avb_4096")).unwrap();
    images.insert("vbmeta".to_owned(), avb::write_root_image(&vbmeta, 4096, 0).unwrap());
    images.insert("boot".to_owned(), boot);

    let output = run_patch(&images, true, &test_keys(), &ResignOptions::default()).unwrap();

    assert_eq!(
        output.failures.keys().cloned().collect::<BTreeSet<_>>(),
        names(["boot", "vbmeta"])
    );
    assert_matches!(
        &output.failures["boot"],
        PartitionError::BootImage(bootimage::Error::UnknownHeaderVersion { version: 7, .. })
    );
    assert_matches!(
        &output.failures["vbmeta"],
        PartitionError::Resign(resign::Error::ChildFailed { child, .. }) if child == "boot"
    );

    assert!(!output.images.contains_key("boot"));
    assert!(!output.images.contains_key("vbmeta"));
    assert!(output.changed.is_empty());

    // Unrelated partitions pass through unchanged.
    assert_eq!(output.images["dtbo"].data, images["dtbo"]);
    assert_eq!(output.images["vbmeta_system"].data, images["vbmeta_system"]);
}

#[test]
fn prepatched_boot_replaces_image() {
    let images = image_set(0);
    let cancel_signal = AtomicBool::new(false);

    let prepatched = BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0,
        reserved: [0; 4],
        cmdline: "console=ttyS0".to_owned(),
        v4_extra: Some(V4Extra {
            signature: vec![0; 4096],
        }),
        kernel: b"kernel".to_vec(),
        ramdisk: b"prepatched ramdisk".to_vec(),
    });
    let patcher = PrepatchedImagePatcher::new(&prepatched.to_vec().unwrap(), 1).unwrap();
    let targets = [PatchTarget {
        partition: "boot",
        patcher: &patcher,
    }];

    let inputs = images
        .iter()
        .map(|(name, data)| (name.clone(), Ok(data.clone())))
        .collect();
    let output = run::run(
        inputs,
        &targets,
        &test_keys(),
        &ResignOptions::default(),
        &cancel_signal,
    )
    .unwrap();

    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.changed, names(["boot", "vbmeta"]));

    let outputs = final_images(&output);
    run::verify(&outputs, &cancel_signal).unwrap();

    let (footer, _) = avb::parse_footer(&outputs["boot"]).unwrap();
    let data = &outputs["boot"][..footer.original_image_size as usize];
    assert_eq!(BootImage::from_reader(Cursor::new(data)).unwrap(), prepatched);
}
