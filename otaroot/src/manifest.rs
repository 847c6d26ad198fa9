// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Digests of the final partition images produced by a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{patch::run::ErrorKind, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{partition}: expected SHA-256 {expected}, but have {actual}")]
    Mismatch {
        partition: String,
        expected: String,
        actual: String,
    },
    #[error("{0} is not in the digest manifest")]
    Missing(String),
    #[error("Failed to parse digest manifest")]
    Deserialize(#[from] toml_edit::de::Error),
    #[error("Failed to serialize digest manifest")]
    Serialize(#[from] toml_edit::ser::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Mismatch { .. } | Self::Missing(_) => ErrorKind::Integrity,
            Self::Deserialize(_) | Self::Serialize(_) => ErrorKind::Format,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Map of partition name to the SHA-256 digest of its final bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct DigestManifest {
    #[serde(with = "hex_map")]
    pub sha256: BTreeMap<String, [u8; 32]>,
}

mod hex_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer, de, ser::SerializeMap};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, [u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            s.serialize_entry(k, &hex::encode(v))?;
        }
        s.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, [u8; 32]>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| {
                let mut digest = [0u8; 32];
                hex::decode_to_slice(&v, &mut digest).map_err(de::Error::custom)?;
                Ok((k, digest))
            })
            .collect()
    }
}

impl DigestManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: &[u8]) {
        self.sha256.insert(name.into(), util::sha256(data));
    }

    pub fn get(&self, name: &str) -> Option<&[u8; 32]> {
        self.sha256.get(name)
    }

    pub fn len(&self) -> usize {
        self.sha256.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sha256.is_empty()
    }

    /// Check that `data` matches the recorded digest for `name`.
    pub fn verify(&self, name: &str, data: &[u8]) -> Result<()> {
        let expected = self
            .get(name)
            .ok_or_else(|| Error::Missing(name.to_owned()))?;
        let actual = util::sha256(data);

        if expected != &actual {
            return Err(Error::Mismatch {
                partition: name.to_owned(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml_edit::de::from_str(data)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }
}
