//! Token scopes per destination registry
//!
//! Every repository a run touches on a destination registry is requested in one token:
//! destinations with `pull,push`, sources living on the same registry with `pull` so blobs can
//! be mounted from them.

use super::mappings::DestinationType;
use super::tree::TargetTree;
use crate::registry::Scope;
use std::collections::{BTreeMap, BTreeSet};

const PULL: &str = "pull";
const PUSH: &str = "push";

pub fn calculate_scopes(tree: &TargetTree) -> BTreeMap<String, Vec<Scope>> {
    let mut repositories: BTreeMap<String, BTreeMap<String, BTreeSet<&str>>> = BTreeMap::new();

    for node in tree.values() {
        for key in node.tags.values().chain(node.digests.values()).flat_map(|t| t.keys()) {
            if key.destination_type != DestinationType::Registry {
                continue;
            }
            repositories
                .entry(key.registry.clone())
                .or_default()
                .entry(key.repository.clone())
                .or_default()
                .extend([PULL, PUSH]);
        }
    }

    for node in tree.values() {
        if let Some(repos) = repositories.get_mut(&node.reference.registry) {
            repos
                .entry(node.reference.repository.clone())
                .or_default()
                .insert(PULL);
        }
    }

    repositories
        .into_iter()
        .map(|(registry, repos)| {
            let scopes = repos
                .into_iter()
                .map(|(repository, actions)| {
                    // push sorts after pull, keeping `pull,push` order
                    let actions: Vec<&str> = actions.into_iter().collect();
                    Scope::new(&repository, &actions)
                })
                .collect();
            (registry, scopes)
        })
        .collect()
}
