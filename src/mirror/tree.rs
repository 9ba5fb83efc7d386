//! Target tree: mappings grouped by source repository

use super::mappings::{DestinationType, Mapping};
use crate::digest::Digest;
use crate::reference::ImageReference;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
    pub registry: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub destination_type: DestinationType,
    pub registry: String,
    pub repository: String,
}

/// One destination repository and the tags to push there. An empty tag set pushes by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub reference: ImageReference,
    pub destination_type: DestinationType,
    pub tags: BTreeSet<String>,
}

pub type PushTargets = BTreeMap<TargetKey, PushTarget>;

/// Everything to copy out of one source repository
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub reference: ImageReference,
    pub tags: BTreeMap<String, PushTargets>,
    pub digests: BTreeMap<Digest, PushTargets>,
}

impl SourceNode {
    fn new(reference: ImageReference) -> Self {
        Self {
            reference,
            tags: BTreeMap::new(),
            digests: BTreeMap::new(),
        }
    }

    /// Fold the targets of a resolved tag into the targets of its digest
    pub fn merge_into_digests(&mut self, digest: Digest, targets: PushTargets) {
        let current = self.digests.entry(digest).or_default();
        merge_targets(current, targets);
    }
}

fn merge_targets(current: &mut PushTargets, targets: PushTargets) {
    for (key, target) in targets {
        match current.get_mut(&key) {
            Some(existing) => existing.tags.extend(target.tags),
            None => {
                current.insert(key, target);
            }
        }
    }
}

pub type TargetTree = BTreeMap<SourceKey, SourceNode>;

pub fn build_target_tree(mappings: &[Mapping]) -> TargetTree {
    let mut tree = TargetTree::new();
    for m in mappings {
        let source_key = SourceKey {
            registry: m.source.registry.clone(),
            repository: m.source.repository.clone(),
        };
        let target_key = TargetKey {
            destination_type: m.destination_type,
            registry: m.destination.registry.clone(),
            repository: m.destination.repository.clone(),
        };

        let node = tree
            .entry(source_key)
            .or_insert_with(|| SourceNode::new(m.source.as_repository()));
        let targets = match (&m.source.tag, &m.source.digest) {
            (_, Some(digest)) => node.digests.entry(digest.clone()).or_default(),
            (Some(tag), None) => node.tags.entry(tag.clone()).or_default(),
            (None, None) => continue,
        };
        let target = targets.entry(target_key).or_insert_with(|| PushTarget {
            reference: m.destination.as_repository(),
            destination_type: m.destination_type,
            tags: BTreeSet::new(),
        });
        if let Some(tag) = &m.destination.tag {
            target.tags.insert(tag.clone());
        }
    }
    tree
}

/// Registries that receive at least one push
pub fn destination_registries(tree: &TargetTree) -> BTreeSet<String> {
    tree.values()
        .flat_map(|node| node.tags.values().chain(node.digests.values()))
        .flat_map(|targets| targets.keys())
        .map(|key| key.registry.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::mappings::{Overlap, parse_args};

    fn tree(args: &[&str]) -> TargetTree {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        build_target_tree(&parse_args(&args, &mut Overlap::new()).unwrap())
    }

    #[test]
    fn test_repeated_sources_are_unioned() {
        let tree = tree(&[
            "quay.io/a/b:1=reg.example/x:1",
            "quay.io/a/b:1=reg.example/x:latest",
            "quay.io/a/b:1=other.example/y:1",
            "quay.io/a/b:2=reg.example/x:2",
        ]);
        assert_eq!(tree.len(), 1);
        let node = tree.values().next().unwrap();
        assert_eq!(node.reference.to_string(), "quay.io/a/b");

        let v1 = &node.tags["1"];
        assert_eq!(v1.len(), 2);
        let x = v1.values().find(|t| t.reference.registry == "reg.example").unwrap();
        assert_eq!(x.tags, BTreeSet::from(["1".to_string(), "latest".to_string()]));
        assert_eq!(node.tags["2"].len(), 1);
    }

    #[test]
    fn test_digest_sources_and_merge() {
        let digest = Digest::from_bytes(b"manifest");
        let by_digest = format!("quay.io/a/b@{}=reg.example/x:pinned", digest);
        let mut tree = tree(&[by_digest.as_str(), "quay.io/a/b:1=reg.example/x:1", "quay.io/a/b:1=reg.example/y"]);
        let node = tree.values_mut().next().unwrap();
        assert_eq!(node.digests[&digest].len(), 1);

        let tag_targets = node.tags["1"].clone();
        node.merge_into_digests(digest.clone(), tag_targets);
        let merged = &node.digests[&digest];
        assert_eq!(merged.len(), 2);
        let x = merged.values().find(|t| t.reference.repository == "x").unwrap();
        assert_eq!(x.tags, BTreeSet::from(["1".to_string(), "pinned".to_string()]));
        let y = merged.values().find(|t| t.reference.repository == "y").unwrap();
        assert!(y.tags.is_empty());
    }

    #[test]
    fn test_destination_registries() {
        let tree = tree(&["quay.io/a/b:1=reg.example/x:1", "quay.io/a/c:1=s3://bucket.example/y:1"]);
        let registries = destination_registries(&tree);
        assert_eq!(
            registries,
            BTreeSet::from(["bucket.example".to_string(), "reg.example".to_string()])
        );
    }
}
