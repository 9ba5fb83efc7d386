//! Manifest list filtering and rebuilding

use super::{Descriptor, Manifest, ManifestKind, ManifestList, Platform};
use crate::digest::Digest;
use crate::error::RegistryError;
use bytes::Bytes;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

/// Serialize `value` the way the docker distribution libraries do for rebuilt manifests:
/// pretty printed with a three space indent.
pub(crate) fn to_indented_json<T: Serialize>(value: &T, prefix: &str) -> Result<Vec<u8>, RegistryError> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"   "));
    value.serialize(&mut ser)?;
    if prefix.is_empty() {
        return Ok(buf);
    }
    let mut prefixed = Vec::with_capacity(buf.len() + prefix.len() * 16);
    for byte in buf {
        prefixed.push(byte);
        if byte == b'\n' {
            prefixed.extend_from_slice(prefix.as_bytes());
        }
    }
    Ok(prefixed)
}

impl ManifestList {
    /// Build a new list of `media_type` holding `descriptors`
    pub fn from_descriptors(media_type: &str, descriptors: Vec<Descriptor>) -> Result<Manifest, RegistryError> {
        let list = ManifestList {
            schema_version: 2,
            media_type: media_type.to_string(),
            manifests: descriptors,
            annotations: None,
        };
        let payload = Bytes::from(to_indented_json(&list, "")?);
        Ok(Manifest::from_parts(media_type, payload, ManifestKind::List(list)))
    }
}

/// Result of applying a platform filter to a manifest list
#[derive(Debug, Clone)]
pub struct FilteredList {
    /// The list to push; the original when nothing was removed
    pub manifest: Manifest,
    pub digest: Digest,
    /// Entries that survived the filter, in list order
    pub children: Vec<Descriptor>,
}

/// Keep the entries of `manifest` whose platform passes `include`.
///
/// Returns `None` when every entry is filtered out. When some entries are removed the list is
/// rebuilt and receives a new digest; a list that keeps all of its entries keeps its original
/// payload and digest.
pub fn filter_manifest_list(
    digest: &Digest,
    manifest: &Manifest,
    include: impl Fn(&Platform) -> bool,
) -> Result<Option<FilteredList>, RegistryError> {
    let Some(list) = manifest.as_list() else {
        return Err(RegistryError::Parse(format!(
            "manifest {} is not a manifest list",
            digest
        )));
    };

    let children: Vec<Descriptor> = list
        .manifests
        .iter()
        .filter(|d| {
            let platform = d.platform.clone().unwrap_or_default();
            let keep = include(&platform);
            tracing::trace!(platform = %platform, keep, "filtering manifest list entry");
            keep
        })
        .cloned()
        .collect();

    if children.is_empty() {
        return Ok(None);
    }

    if children.len() == list.manifests.len() {
        return Ok(Some(FilteredList {
            manifest: manifest.clone(),
            digest: digest.clone(),
            children,
        }));
    }

    let rebuilt = ManifestList::from_descriptors(manifest.media_type(), children.clone())?;
    let digest = rebuilt.digest();
    Ok(Some(FilteredList {
        manifest: rebuilt,
        digest,
        children,
    }))
}
