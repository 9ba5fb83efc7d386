//! Manifest and tag operations over HTTP

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::{
    Descriptor, MEDIA_TYPE_SCHEMA1_SIGNED, Manifest, SCHEMA2_MANIFEST_ONLY,
};
use crate::registry::client::{Session, check};
use crate::registry::{ManifestService, TagService};
use async_trait::async_trait;
use reqwest::{Response, StatusCode, header};
use std::sync::Arc;

fn accept_all() -> String {
    SCHEMA2_MANIFEST_ONLY
        .iter()
        .copied()
        .chain(std::iter::once(MEDIA_TYPE_SCHEMA1_SIGNED))
        .collect::<Vec<_>>()
        .join(", ")
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

fn content_digest(response: &Response) -> Option<Digest> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| Digest::parse(h).ok())
}

pub struct HttpManifestService {
    session: Arc<Session>,
}

impl HttpManifestService {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ManifestService for HttpManifestService {
    async fn exists(&self, digest: &Digest) -> Result<bool, RegistryError> {
        let url = self.session.url(&format!("manifests/{}", digest))?;
        let accept = accept_all();
        let response = self
            .session
            .execute("check manifest", |client| {
                client.head(url.clone()).header(header::ACCEPT, accept.as_str())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, "check manifest").await.map(|_| true)
    }

    async fn get(&self, digest: &Digest, media_types: &[&str]) -> Result<Manifest, RegistryError> {
        let url = self.session.url(&format!("manifests/{}", digest))?;
        let accept = media_types.join(", ");
        let response = self
            .session
            .execute("get manifest", |client| {
                client.get(url.clone()).header(header::ACCEPT, accept.as_str())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ManifestUnknown(digest.to_string()));
        }
        let response = check(response, "get manifest").await?;
        let media_type = content_type(&response);
        let payload = response.bytes().await?;
        let manifest = Manifest::from_bytes(media_type.as_deref(), payload)?;

        let actual = manifest.digest();
        if &actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(manifest)
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest, RegistryError> {
        let reference = match tag {
            Some(tag) => tag.to_string(),
            None => manifest.digest().to_string(),
        };
        let url = self.session.url(&format!("manifests/{}", reference))?;
        let response = self
            .session
            .execute("put manifest", |client| {
                client
                    .put(url.clone())
                    .header(header::CONTENT_TYPE, manifest.media_type())
                    .body(manifest.payload().clone())
            })
            .await?;
        let response = check(response, "put manifest").await?;
        Ok(content_digest(&response).unwrap_or_else(|| manifest.digest()))
    }
}

pub struct HttpTagService {
    session: Arc<Session>,
}

impl HttpTagService {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl TagService for HttpTagService {
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError> {
        let url = self.session.url(&format!("manifests/{}", tag))?;
        let accept = accept_all();
        let response = self
            .session
            .execute("resolve tag", |client| {
                client.head(url.clone()).header(header::ACCEPT, accept.as_str())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ManifestUnknown(tag.to_string()));
        }
        let response = check(response, "resolve tag").await?;
        let media_type = content_type(&response).unwrap_or_default();
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse().ok())
            .unwrap_or(0);
        if let Some(digest) = content_digest(&response) {
            return Ok(Descriptor::new(&media_type, size, digest));
        }

        // registries that omit the digest header on HEAD still return the body on GET
        let response = self
            .session
            .execute("resolve tag", |client| {
                client.get(url.clone()).header(header::ACCEPT, accept.as_str())
            })
            .await?;
        let response = check(response, "resolve tag").await?;
        let media_type = content_type(&response).unwrap_or_default();
        let payload = response.bytes().await?;
        let manifest = Manifest::from_bytes(Some(&media_type), payload)?;
        Ok(Descriptor::new(
            manifest.media_type(),
            manifest.payload().len() as u64,
            manifest.digest(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ImageManifest, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_SCHEMA2};
    use crate::reference::ImageReference;
    use crate::registry::{CredentialStore, RegistryContext, RepositoryConnector};
    use bytes::Bytes;

    fn schema2() -> Manifest {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_SCHEMA2.to_string(),
            config: Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, 2, Digest::from_bytes(b"{}")),
            layers: vec![],
            annotations: None,
        };
        let payload = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        Manifest::from_bytes(Some(MEDIA_TYPE_SCHEMA2), payload).unwrap()
    }

    async fn repository(server: &mut mockito::ServerGuard) -> Arc<dyn crate::registry::Repository> {
        server.mock("GET", "/v2/").with_status(200).create_async().await;
        let reference = ImageReference::parse(&format!("{}/ns/app", server.host_with_port())).unwrap();
        RegistryContext::new(CredentialStore::empty())
            .unwrap()
            .repository(&reference, true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tag_resolves_from_digest_header() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let manifest = schema2();
        server
            .mock("HEAD", "/v2/ns/app/manifests/v1")
            .with_status(200)
            .with_header("content-type", MEDIA_TYPE_SCHEMA2)
            .with_header("docker-content-digest", manifest.digest().as_str())
            .create_async()
            .await;
        let desc = repo.tags().get("v1").await.unwrap();
        assert_eq!(desc.digest, manifest.digest());
        assert_eq!(desc.media_type, MEDIA_TYPE_SCHEMA2);
    }

    #[tokio::test]
    async fn test_get_verifies_digest() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let manifest = schema2();
        let wrong = Digest::from_bytes(b"other");
        server
            .mock("GET", format!("/v2/ns/app/manifests/{}", wrong).as_str())
            .with_status(200)
            .with_header("content-type", MEDIA_TYPE_SCHEMA2)
            .with_body(manifest.payload().clone())
            .create_async()
            .await;
        let err = repo.manifests().get(&wrong, SCHEMA2_MANIFEST_ONLY).await.unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_put_manifest_invalid_is_classified() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        server
            .mock("PUT", "/v2/ns/app/manifests/latest")
            .match_header("content-type", MEDIA_TYPE_SCHEMA2)
            .with_status(400)
            .with_body(r#"{"errors":[{"code":"MANIFEST_INVALID","message":"manifest invalid"}]}"#)
            .create_async()
            .await;
        let err = repo.manifests().put(&schema2(), Some("latest")).await.unwrap_err();
        assert!(err.is_manifest_invalid());
    }

    #[tokio::test]
    async fn test_exists_false_on_404() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let digest = Digest::from_bytes(b"absent");
        server
            .mock("HEAD", format!("/v2/ns/app/manifests/{}", digest).as_str())
            .with_status(404)
            .create_async()
            .await;
        assert!(!repo.manifests().exists(&digest).await.unwrap());
    }
}
