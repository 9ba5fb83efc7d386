//! Signed schema1 manifests
//!
//! Some registries only accept the legacy schema1 format. [`Schema1Builder`] converts an
//! image manifest plus its config blob into a schema1 manifest the way the docker
//! distribution "config manifest builder" does, and [`SigningKey`] signs it as a
//! libtrust-compatible JWS.

use super::list::to_indented_json;
use super::{
    Descriptor, FsLayer, Manifest, ManifestKind, Schema1Manifest, V1History,
    MEDIA_TYPE_SCHEMA1_SIGNED,
};
use crate::digest::Digest;
use crate::error::RegistryError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A gzipped tar archive with no entries, used as the blob for empty history layers
pub const GZIPPED_EMPTY_TAR: &[u8] = &[
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

pub const EMPTY_TAR_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

const JSON_INDENT: &str = "   ";
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

// DER prefix of a SubjectPublicKeyInfo for an uncompressed P-256 point
const P256_SPKI_PREFIX: &[u8] = &[
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

fn crypto_error(context: &str, err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Parse(format!("{}: {}", context, err))
}

/// ECDSA P-256 key used to sign schema1 manifests
pub struct SigningKey {
    pair: EcdsaKeyPair,
    rng: SystemRandom,
    key_id: String,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("key_id", &self.key_id).finish()
    }
}

impl SigningKey {
    pub fn generate() -> Result<Self, RegistryError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| crypto_error("unable to generate signing key", e))?;
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| crypto_error("unable to load signing key", e))?;
        let key_id = key_id_for_point(pair.public_key().as_ref());
        Ok(Self { pair, rng, key_id })
    }

    /// libtrust key id: base32 of the first 240 bits of sha256(SPKI DER), in groups of four
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn jwk(&self) -> Jwk {
        let point = self.pair.public_key().as_ref();
        Jwk {
            crv: "P-256".to_string(),
            kid: self.key_id.clone(),
            kty: "EC".to_string(),
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..65]),
        }
    }

    /// Sign an indented JSON document and return it with a `signatures` member appended
    pub fn sign_pretty(&self, content: &[u8]) -> Result<Vec<u8>, RegistryError> {
        let close = content
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .filter(|&i| content[i] == b'}')
            .ok_or_else(|| RegistryError::Parse("invalid JSON content to sign".to_string()))?;
        let last = content[..close]
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .ok_or_else(|| RegistryError::Parse("invalid JSON content to sign".to_string()))?;
        if content[last] == b',' {
            return Err(RegistryError::Parse("invalid JSON content to sign".to_string()));
        }
        let format_length = last + 1;
        let format_tail = &content[format_length..];

        let protected = ProtectedHeader {
            format_length,
            format_tail: URL_SAFE_NO_PAD.encode(format_tail),
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
        let sign_input = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(content));
        let signature = self
            .pair
            .sign(&self.rng, sign_input.as_bytes())
            .map_err(|e| crypto_error("unable to sign manifest", e))?;

        let signatures = vec![JwsSignature {
            header: JwsHeader {
                jwk: self.jwk(),
                alg: "ES256".to_string(),
            },
            signature: URL_SAFE_NO_PAD.encode(signature.as_ref()),
            protected,
        }];
        let marshalled = to_indented_json(&signatures, JSON_INDENT)?;

        let mut out = Vec::with_capacity(format_length + marshalled.len() + 34);
        out.extend_from_slice(&content[..format_length]);
        out.extend_from_slice(b",\n");
        out.extend_from_slice(JSON_INDENT.as_bytes());
        out.extend_from_slice(b"\"signatures\": ");
        out.extend_from_slice(&marshalled);
        out.extend_from_slice(b"\n}");
        Ok(out)
    }
}

fn key_id_for_point(point: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(P256_SPKI_PREFIX);
    hasher.update(point);
    let hash = hasher.finalize();
    let encoded = base32_encode(&hash[..30]);
    encoded
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Lazily generated signing key shared by every conversion in one mirror run
#[derive(Debug, Default)]
pub struct SigningKeyCache {
    key: OnceCell<Arc<SigningKey>>,
}

impl SigningKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Result<Arc<SigningKey>, RegistryError> {
        self.key
            .get_or_try_init(|| async { SigningKey::generate().map(Arc::new) })
            .await
            .cloned()
    }
}

#[derive(Serialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
    time: String,
}

#[derive(Serialize)]
struct Jwk {
    crv: String,
    kid: String,
    kty: String,
    x: String,
    y: String,
}

#[derive(Serialize)]
struct JwsHeader {
    jwk: Jwk,
    alg: String,
}

#[derive(Serialize)]
struct JwsSignature {
    header: JwsHeader,
    signature: String,
    protected: String,
}

#[derive(Deserialize)]
struct SignedEnvelope {
    #[serde(default)]
    signatures: Vec<EnvelopeSignature>,
}

#[derive(Deserialize)]
struct EnvelopeSignature {
    protected: String,
}

#[derive(Deserialize)]
struct EnvelopeProtected {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

/// The signed portion of a schema1 payload, which is what its digest covers
pub fn canonical_payload(payload: &Bytes) -> Result<Bytes, RegistryError> {
    let envelope: SignedEnvelope = serde_json::from_slice(payload)?;
    let Some(first) = envelope.signatures.first() else {
        return Ok(payload.clone());
    };
    let protected = URL_SAFE_NO_PAD
        .decode(first.protected.trim_end_matches('='))
        .map_err(|e| crypto_error("invalid protected header", e))?;
    let protected: EnvelopeProtected = serde_json::from_slice(&protected)?;
    if protected.format_length > payload.len() {
        return Err(RegistryError::Parse(
            "schema1 format length exceeds payload".to_string(),
        ));
    }
    let tail = URL_SAFE_NO_PAD
        .decode(protected.format_tail.trim_end_matches('='))
        .map_err(|e| crypto_error("invalid format tail", e))?;
    let mut canonical = payload[..protected.format_length].to_vec();
    canonical.extend_from_slice(&tail);
    Ok(Bytes::from(canonical))
}

#[derive(Deserialize)]
struct ImageConfig {
    rootfs: Option<RootFs>,
    #[serde(default)]
    history: Vec<ConfigHistory>,
    #[serde(default)]
    architecture: String,
}

#[derive(Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
    #[serde(default)]
    base_layer: String,
}

#[derive(Deserialize)]
struct ConfigHistory {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    author: String,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    empty_layer: bool,
}

#[derive(Serialize)]
struct ContainerConfig {
    #[serde(rename = "Cmd")]
    cmd: Vec<String>,
}

#[derive(Serialize)]
struct V1Compatibility {
    id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    parent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    comment: String,
    created: String,
    container_config: ContainerConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    author: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    throwaway: bool,
}

/// A converted manifest and whether it refers to the empty tar blob
#[derive(Debug, Clone)]
pub struct Schema1Output {
    pub manifest: Manifest,
    pub uses_empty_layer: bool,
}

/// Builds a signed schema1 manifest from an image config and its layer descriptors
pub struct Schema1Builder<'a> {
    name: &'a str,
    tag: &'a str,
    config: &'a [u8],
    layers: &'a [Descriptor],
}

impl<'a> Schema1Builder<'a> {
    pub fn new(name: &'a str, tag: &'a str, config: &'a [u8], layers: &'a [Descriptor]) -> Self {
        Self {
            name,
            tag,
            config,
            layers,
        }
    }

    pub fn build(&self, key: &SigningKey) -> Result<Schema1Output, RegistryError> {
        let img: ImageConfig = serde_json::from_slice(self.config)?;
        let Some(last) = img.history.last() else {
            return Err(RegistryError::Parse(
                "empty history when trying to create schema1 manifest".to_string(),
            ));
        };
        let rootfs = img.rootfs.as_ref().ok_or_else(|| {
            RegistryError::Parse("image config has no rootfs section".to_string())
        })?;
        if rootfs.diff_ids.len() != self.layers.len() {
            return Err(RegistryError::Parse(format!(
                "number of descriptors and number of layers in rootfs must match: len({}) != len({})",
                rootfs.diff_ids.len(),
                self.layers.len()
            )));
        }

        let empty_tar = Digest::parse(EMPTY_TAR_DIGEST)?;
        let count = img.history.len();
        let mut fs_layers = vec![None; count];
        let mut history = vec![None; count];
        let mut uses_empty_layer = false;
        let mut parent = String::new();
        let mut layer_counter = 0;

        let mut blobsum_for = |h: &ConfigHistory, counter: &mut usize| -> Result<Digest, RegistryError> {
            if h.empty_layer {
                uses_empty_layer = true;
                return Ok(empty_tar.clone());
            }
            let layer = self.layers.get(*counter).ok_or_else(|| {
                RegistryError::Parse("too many non-empty layers in History section".to_string())
            })?;
            *counter += 1;
            Ok(layer.digest.clone())
        };

        for (i, h) in img.history[..count - 1].iter().enumerate() {
            let blobsum = blobsum_for(h, &mut layer_counter)?;
            let v1_id = hex_sha256(format!("{} {}", blobsum.hex(), parent).as_bytes());

            if i == 0 && !rootfs.base_layer.is_empty() {
                let base = Sha384::digest(rootfs.base_layer.as_bytes());
                parent = hex::encode(&base[..32]);
            }

            let compat = V1Compatibility {
                id: v1_id.clone(),
                parent: parent.clone(),
                comment: h.comment.clone(),
                created: h.created.clone().unwrap_or_else(|| ZERO_TIME.to_string()),
                container_config: ContainerConfig {
                    cmd: vec![h.created_by.clone()],
                },
                author: h.author.clone(),
                throwaway: h.empty_layer,
            };

            let reversed = count - i - 1;
            history[reversed] = Some(V1History {
                v1_compatibility: serde_json::to_string(&compat)?,
            });
            fs_layers[reversed] = Some(FsLayer { blob_sum: blobsum });
            parent = v1_id;
        }

        let blobsum = blobsum_for(last, &mut layer_counter)?;
        let mut top_input = format!("{} {} ", blobsum.hex(), parent).into_bytes();
        top_input.extend_from_slice(self.config);
        let top_id = hex_sha256(&top_input);

        history[0] = Some(V1History {
            v1_compatibility: make_v1_config(self.config, &top_id, &parent, last.empty_layer)?,
        });
        fs_layers[0] = Some(FsLayer { blob_sum: blobsum });

        let manifest = Schema1Manifest {
            schema_version: 1,
            name: self.name.to_string(),
            tag: self.tag.to_string(),
            architecture: img.architecture.clone(),
            fs_layers: fs_layers.into_iter().flatten().collect(),
            history: history.into_iter().flatten().collect(),
        };

        let canonical = Bytes::from(to_indented_json(&manifest, "")?);
        let signed = Bytes::from(key.sign_pretty(&canonical)?);
        Ok(Schema1Output {
            manifest: Manifest::from_parts(
                MEDIA_TYPE_SCHEMA1_SIGNED,
                signed,
                ManifestKind::Schema1 {
                    manifest,
                    canonical,
                },
            ),
            uses_empty_layer,
        })
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The image config with fields unknown to schema1 removed and the v1 ids added
fn make_v1_config(config: &[u8], id: &str, parent: &str, throwaway: bool) -> Result<String, RegistryError> {
    let mut map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(config)?;
    map.remove("rootfs");
    map.remove("history");
    map.insert("id".to_string(), id.into());
    if !parent.is_empty() {
        map.insert("parent".to_string(), parent.into());
    }
    if throwaway {
        map.insert("throwaway".to_string(), true.into());
    }
    Ok(serde_json::to_string(&map)?)
}
