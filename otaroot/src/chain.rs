// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The AVB signing chain as an explicit DAG. Nodes live in an arena and edges
//! point from a vbmeta structure to the partitions its descriptors protect.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use topological_sort::TopologicalSort;
use tracing::{debug, warn};

use crate::{
    format::avb::{Descriptor, Header},
    patch::run::ErrorKind,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{parent} has a chain descriptor for {child}, which is not in the image set")]
    DanglingReference { parent: String, child: String },
    #[error("vbmeta dependency graph has a cycle involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("Found multiple root vbmeta images: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Chain
    }
}

type Result<T> = std::result::Result<T, Error>;

pub type NodeId = usize;

/// Where a partition's vbmeta structure lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VbmetaSite {
    /// Standalone vbmeta partition.
    Root,
    /// Embedded before an `AVBf` footer at the end of the partition.
    Appended,
    /// The partition carries no vbmeta at all.
    None,
}

/// One partition of the image set, as seen by [`SigningChain::build`].
#[derive(Clone, Copy, Debug)]
pub struct ChainImage<'a> {
    pub name: &'a str,
    pub site: VbmetaSite,
    pub header: Option<&'a Header>,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub site: VbmetaSite,
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct SigningChain {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    layers: Vec<Vec<NodeId>>,
    root: Option<NodeId>,
}

impl SigningChain {
    /// Build the chain by walking every descriptor in every header. Hash and
    /// hash tree descriptors for partitions outside of the image set are
    /// ignored since those partitions are never modified. Chain descriptors
    /// must resolve because the child's public key is needed for re-signing.
    pub fn build(images: &[ChainImage<'_>]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(images.len());
        let mut index = HashMap::new();

        for image in images {
            index.insert(image.name.to_owned(), nodes.len());
            nodes.push(Node {
                name: image.name.to_owned(),
                site: if image.header.is_some() {
                    image.site
                } else {
                    VbmetaSite::None
                },
                parents: vec![],
                children: vec![],
            });
        }

        for (parent_id, image) in images.iter().enumerate() {
            let Some(header) = image.header else {
                continue;
            };

            for descriptor in &header.descriptors {
                let Some(child_name) = descriptor.partition_name() else {
                    continue;
                };
                let is_chain = matches!(descriptor, Descriptor::ChainPartition(_));

                if child_name == image.name {
                    // An appended image's own hash or hash tree descriptor.
                    if is_chain {
                        return Err(Error::Cycle(vec![image.name.to_owned()]));
                    }
                    continue;
                }

                let Some(&child_id) = index.get(child_name) else {
                    if is_chain {
                        return Err(Error::DanglingReference {
                            parent: image.name.to_owned(),
                            child: child_name.to_owned(),
                        });
                    }
                    debug!(
                        "Ignoring {} descriptor in {} for unmodified partition {child_name}",
                        descriptor.type_name(),
                        image.name,
                    );
                    continue;
                };

                if !nodes[parent_id].children.contains(&child_id) {
                    nodes[parent_id].children.push(child_id);
                    nodes[child_id].parents.push(parent_id);
                }
            }
        }

        // Ensure that there's only a single root of trust. Otherwise, there
        // could be eg. a `vbmeta_unused` containing all the relevant
        // descriptors that the bootloader never loads.
        let roots = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.site == VbmetaSite::Root && n.parents.is_empty())
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        if roots.len() > 1 {
            return Err(Error::MultipleRoots(
                roots.iter().map(|id| nodes[*id].name.clone()).collect(),
            ));
        }

        let unprotected = nodes
            .iter()
            .filter(|n| n.site != VbmetaSite::Root && n.parents.is_empty())
            .map(|n| n.name.as_str())
            .collect::<BTreeSet<_>>();

        if !unprotected.is_empty() {
            warn!(
                "Partitions aren't protected by AVB: {}",
                unprotected.into_iter().collect::<Vec<_>>().join(", "),
            );
        }

        let layers = compute_layers(&nodes)?;

        Ok(Self {
            nodes,
            index,
            layers,
            root: roots.first().copied(),
        })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    /// The standalone vbmeta image that anchors the chain, if any.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Nodes grouped leaves-first. Every node's children are in earlier
    /// layers, so nodes within a layer can be processed independently.
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    /// All transitive ancestors of `id`, excluding itself.
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        let mut pending = self.nodes[id].parents.clone();

        while let Some(parent) = pending.pop() {
            if result.insert(parent) {
                pending.extend_from_slice(&self.nodes[parent].parents);
            }
        }

        result
    }
}

fn compute_layers(nodes: &[Node]) -> Result<Vec<Vec<NodeId>>> {
    let mut topo = TopologicalSort::<NodeId>::new();

    for (id, node) in nodes.iter().enumerate() {
        topo.insert(id);

        // Children must be processed before their parents.
        for child in &node.children {
            topo.add_dependency(*child, id);
        }
    }

    let mut layers = vec![];

    while !topo.is_empty() {
        let mut layer = topo.pop_all();
        if layer.is_empty() {
            // Whatever is left has unresolved dependencies.
            let mut remaining = nodes
                .iter()
                .enumerate()
                .filter(|(id, _)| !layers.iter().flatten().any(|l| l == id))
                .map(|(_, n)| n.name.clone())
                .collect::<Vec<_>>();
            remaining.sort();

            return Err(Error::Cycle(remaining));
        }

        layer.sort_unstable();
        layers.push(layer);
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::format::avb::{
        AlgorithmType, ChainPartitionDescriptor, HashDescriptor, HashTreeDescriptor,
    };

    use super::*;

    fn header(descriptors: Vec<Descriptor>) -> Header {
        Header {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 0,
            algorithm_type: AlgorithmType::Sha256Rsa2048,
            hash: vec![],
            signature: vec![],
            public_key: vec![],
            public_key_metadata: vec![],
            descriptors,
            rollback_index: 0,
            flags: 0,
            rollback_index_location: 0,
            release_string: String::new(),
            reserved: [0; 80],
        }
    }

    fn chain(name: &str) -> Descriptor {
        Descriptor::ChainPartition(ChainPartitionDescriptor {
            rollback_index_location: 1,
            partition_name: name.to_owned(),
            public_key: vec![],
            flags: 0,
            reserved: [0; 60],
        })
    }

    fn hash(name: &str) -> Descriptor {
        Descriptor::Hash(HashDescriptor {
            image_size: 0,
            hash_algorithm: "sha256".to_owned(),
            partition_name: name.to_owned(),
            salt: vec![],
            root_digest: vec![],
            flags: 0,
            reserved: [0; 60],
        })
    }

    fn hash_tree(name: &str) -> Descriptor {
        Descriptor::HashTree(HashTreeDescriptor {
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
            partition_name: name.to_owned(),
            salt: vec![],
            root_digest: vec![],
            flags: 0,
            reserved: [0; 60],
        })
    }

    fn image<'a>(name: &'a str, site: VbmetaSite, header: Option<&'a Header>) -> ChainImage<'a> {
        ChainImage { name, site, header }
    }

    fn names(chain: &SigningChain, layer: &[NodeId]) -> Vec<String> {
        layer.iter().map(|id| chain.node(*id).name.clone()).collect()
    }

    #[test]
    fn layers_are_leaves_first() {
        let vbmeta = header(vec![chain("boot"), hash("dtbo"), chain("vbmeta_system")]);
        let vbmeta_system = header(vec![hash_tree("system")]);
        let boot = header(vec![hash("boot")]);

        let images = [
            image("vbmeta", VbmetaSite::Root, Some(&vbmeta)),
            image("vbmeta_system", VbmetaSite::Root, Some(&vbmeta_system)),
            image("boot", VbmetaSite::Appended, Some(&boot)),
            image("dtbo", VbmetaSite::None, None),
        ];

        let chain = SigningChain::build(&images).unwrap();
        let layers = chain.layers();

        assert_eq!(layers.len(), 2);
        assert_eq!(names(&chain, &layers[0]), ["vbmeta_system", "boot", "dtbo"]);
        assert_eq!(names(&chain, &layers[1]), ["vbmeta"]);
        assert_eq!(chain.root(), chain.find("vbmeta"));

        let boot_id = chain.find("boot").unwrap();
        assert_eq!(chain.ancestors(boot_id), BTreeSet::from([0]));
    }

    #[test]
    fn dangling_chain_reference() {
        let vbmeta = header(vec![chain("init_boot")]);
        let images = [image("vbmeta", VbmetaSite::Root, Some(&vbmeta))];

        assert_matches!(
            SigningChain::build(&images),
            Err(Error::DanglingReference { parent, child })
                if parent == "vbmeta" && child == "init_boot"
        );
    }

    #[test]
    fn missing_hash_target_is_ignored() {
        let vbmeta = header(vec![hash("odm")]);
        let images = [image("vbmeta", VbmetaSite::Root, Some(&vbmeta))];

        let chain = SigningChain::build(&images).unwrap();
        assert_eq!(chain.layers().len(), 1);
        assert!(chain.node(0).children.is_empty());
    }

    #[test]
    fn self_reference_is_cycle() {
        let vbmeta = header(vec![chain("vbmeta")]);
        let images = [image("vbmeta", VbmetaSite::Root, Some(&vbmeta))];

        assert_matches!(SigningChain::build(&images), Err(Error::Cycle(n)) if n == ["vbmeta"]);
    }

    #[test]
    fn mutual_reference_is_cycle() {
        let vbmeta = header(vec![chain("vbmeta_system")]);
        let vbmeta_system = header(vec![chain("vbmeta")]);
        let images = [
            image("vbmeta", VbmetaSite::Root, Some(&vbmeta)),
            image("vbmeta_system", VbmetaSite::Root, Some(&vbmeta_system)),
        ];

        assert_matches!(
            SigningChain::build(&images),
            Err(Error::Cycle(n)) if n == ["vbmeta", "vbmeta_system"]
        );
    }

    #[test]
    fn multiple_roots() {
        let vbmeta = header(vec![]);
        let vbmeta_unused = header(vec![]);
        let images = [
            image("vbmeta", VbmetaSite::Root, Some(&vbmeta)),
            image("vbmeta_unused", VbmetaSite::Root, Some(&vbmeta_unused)),
        ];

        assert_matches!(SigningChain::build(&images), Err(Error::MultipleRoots(_)));
    }
}
