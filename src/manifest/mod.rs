//! Manifest model
//!
//! A [`Manifest`] keeps the exact payload bytes it was parsed from (or serialized to) next to
//! the decoded structure, because manifest digests are computed over those bytes. Image
//! manifests (docker schema2 and OCI), manifest lists (docker list and OCI index) and signed
//! schema1 manifests are supported.

pub mod list;
pub mod schema1;

pub use list::{filter_manifest_list, FilteredList};
pub use schema1::{Schema1Builder, SigningKey, SigningKeyCache};

use crate::digest::Digest;
use crate::error::RegistryError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Media types requested when fetching source manifests: lists first, never schema1
pub const SCHEMA2_MANIFEST_ONLY: &[&str] = &[
    MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_SCHEMA2,
    MEDIA_TYPE_OCI_MANIFEST,
];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = self.variant.as_deref().filter(|v| !v.is_empty()) {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Content descriptor; `platform` is only set on manifest list entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: &str, size: u64, digest: Digest) -> Self {
        Self {
            media_type: media_type.to_string(),
            size,
            digest,
            urls: Vec::new(),
            annotations: None,
            platform: None,
        }
    }
}

/// Docker schema2 or OCI image manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Docker manifest list or OCI index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// Legacy schema1 manifest body (without signatures)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<V1History>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestKind {
    Image(ImageManifest),
    List(ManifestList),
    /// Signed schema1; `canonical` is the payload the signatures cover and the digest is taken over
    Schema1 {
        manifest: Schema1Manifest,
        canonical: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
    kind: ManifestKind,
}

#[derive(Deserialize)]
struct Probe {
    #[serde(rename = "schemaVersion", default)]
    schema_version: u32,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl Manifest {
    /// Decode `payload`, using `content_type` when it names a known manifest type and the
    /// payload's own `mediaType` or shape otherwise.
    pub fn from_bytes(content_type: Option<&str>, payload: Bytes) -> Result<Self, RegistryError> {
        let probe: Probe = serde_json::from_slice(&payload)?;
        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| is_known_media_type(ct));

        let media_type = match (declared, probe.media_type.as_deref()) {
            (Some(ct), _) => ct.to_string(),
            (None, Some(mt)) if is_known_media_type(mt) => mt.to_string(),
            _ if probe.schema_version == 1 => MEDIA_TYPE_SCHEMA1_SIGNED.to_string(),
            _ if probe.manifests.is_some() => MEDIA_TYPE_OCI_INDEX.to_string(),
            _ if probe.config.is_some() => MEDIA_TYPE_OCI_MANIFEST.to_string(),
            _ => {
                return Err(RegistryError::Parse(
                    "unrecognized manifest content".to_string(),
                ));
            }
        };

        let kind = match media_type.as_str() {
            MEDIA_TYPE_SCHEMA2 | MEDIA_TYPE_OCI_MANIFEST => {
                ManifestKind::Image(serde_json::from_slice(&payload)?)
            }
            MEDIA_TYPE_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => {
                ManifestKind::List(serde_json::from_slice(&payload)?)
            }
            _ => ManifestKind::Schema1 {
                manifest: serde_json::from_slice(&payload)?,
                canonical: schema1::canonical_payload(&payload)?,
            },
        };

        Ok(Self {
            media_type,
            payload,
            kind,
        })
    }

    pub(crate) fn from_parts(media_type: &str, payload: Bytes, kind: ManifestKind) -> Self {
        Self {
            media_type: media_type.to_string(),
            payload,
            kind,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn kind(&self) -> &ManifestKind {
        &self.kind
    }

    pub fn digest(&self) -> Digest {
        match &self.kind {
            ManifestKind::Schema1 { canonical, .. } => Digest::from_bytes(canonical),
            _ => Digest::from_bytes(&self.payload),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, ManifestKind::List(_))
    }

    /// Schema2 and OCI image manifests, which may be downgraded to schema1
    pub fn as_image(&self) -> Option<&ImageManifest> {
        match &self.kind {
            ManifestKind::Image(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ManifestList> {
        match &self.kind {
            ManifestKind::List(l) => Some(l),
            _ => None,
        }
    }

    /// Everything this manifest points at: config and layers for images, child manifests
    /// for lists, layer blobs for schema1.
    pub fn references(&self) -> Vec<Descriptor> {
        match &self.kind {
            ManifestKind::Image(m) => std::iter::once(m.config.clone())
                .chain(m.layers.iter().cloned())
                .collect(),
            ManifestKind::List(l) => l.manifests.clone(),
            ManifestKind::Schema1 { manifest, .. } => {
                let mut seen = std::collections::BTreeSet::new();
                manifest
                    .fs_layers
                    .iter()
                    .rev()
                    .filter(|l| seen.insert(l.blob_sum.clone()))
                    .map(|l| Descriptor::new(MEDIA_TYPE_LAYER, 0, l.blob_sum.clone()))
                    .collect()
            }
        }
    }
}

pub fn is_known_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_SCHEMA2
            | MEDIA_TYPE_MANIFEST_LIST
            | MEDIA_TYPE_OCI_MANIFEST
            | MEDIA_TYPE_OCI_INDEX
            | MEDIA_TYPE_SCHEMA1
            | MEDIA_TYPE_SCHEMA1_SIGNED
    )
}
