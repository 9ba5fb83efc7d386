//! Blob operations over HTTP
//!
//! Implements the Docker Registry v2 blob endpoints:
//! - existence checks (`HEAD /v2/<name>/blobs/<digest>`)
//! - downloads (`GET /v2/<name>/blobs/<digest>`), whole or streamed
//! - uploads through `POST /v2/<name>/blobs/uploads/`, optionally mounting with
//!   `?mount=<digest>&from=<repository>`, then `PATCH` for content and `PUT ?digest=` to commit

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::Descriptor;
use crate::registry::client::{Session, check};
use crate::registry::{BlobCreateOptions, BlobStore, BlobStream, BlobWriter, CreateOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Response, StatusCode, header};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

const OCTET_STREAM: &str = "application/octet-stream";

pub struct HttpBlobStore {
    session: Arc<Session>,
}

impl HttpBlobStore {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn start_upload(&self, query: &[(&str, &str)]) -> Result<Response, RegistryError> {
        let mut url = self.session.url("blobs/uploads/")?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let response = self
            .session
            .execute("start blob upload", |client| {
                client.post(url.clone()).header(header::CONTENT_LENGTH, 0)
            })
            .await?;
        check(response, "start blob upload").await
    }
}

fn header_digest(response: &Response) -> Option<Digest> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| Digest::parse(h).ok())
}

fn header_size(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse().ok())
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, RegistryError> {
        let url = self.session.url(&format!("blobs/{}", digest))?;
        let response = self
            .session
            .execute("stat blob", |client| client.head(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::BlobUnknown);
        }
        let response = check(response, "stat blob").await?;
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or(OCTET_STREAM);
        Ok(Descriptor::new(
            media_type,
            header_size(&response).unwrap_or(0),
            header_digest(&response).unwrap_or_else(|| digest.clone()),
        ))
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes, RegistryError> {
        let url = self.session.url(&format!("blobs/{}", digest))?;
        let response = self
            .session
            .execute("get blob", |client| client.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::BlobUnknown);
        }
        let data = check(response, "get blob").await?.bytes().await?;
        digest.verify(&data)?;
        Ok(data)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream, RegistryError> {
        let url = self.session.url(&format!("blobs/{}", digest))?;
        let response = self
            .session
            .execute("open blob", |client| client.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::BlobUnknown);
        }
        let response = check(response, "open blob").await?;
        Ok(response.bytes_stream().map_err(RegistryError::from).boxed())
    }

    async fn create(&self, options: BlobCreateOptions) -> Result<CreateOutcome, RegistryError> {
        let mount = options
            .mount_from
            .as_ref()
            .and_then(|from| from.digest.as_ref().map(|d| (d.to_string(), from.repository_name().to_string())));

        let response = match &mount {
            Some((digest, from)) => {
                tracing::debug!(digest = %digest, from = %from, "requesting cross-repository mount");
                self.start_upload(&[("mount", digest.as_str()), ("from", from.as_str())]).await?
            }
            None => self.start_upload(&[]).await?,
        };

        if response.status() == StatusCode::CREATED {
            let digest = header_digest(&response)
                .or_else(|| options.descriptor.as_ref().map(|d| d.digest.clone()))
                .ok_or_else(|| RegistryError::Parse("mounted blob response carried no digest".to_string()))?;
            let descriptor = match options.descriptor {
                Some(mut d) => {
                    d.digest = digest;
                    d
                }
                None => Descriptor::new(OCTET_STREAM, 0, digest),
            };
            return Ok(CreateOutcome::Mounted(descriptor));
        }

        let location = self.session.resolve_location(&response)?;
        Ok(CreateOutcome::Writer(Box::new(HttpBlobWriter {
            session: self.session.clone(),
            location,
        })))
    }

    async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, RegistryError> {
        let digest = Digest::from_bytes(&data);
        let response = self.start_upload(&[]).await?;
        let mut location = self.session.resolve_location(&response)?;
        location.query_pairs_mut().append_pair("digest", digest.as_str());

        let size = data.len() as u64;
        let response = self
            .session
            .execute("put blob", |client| {
                client
                    .put(location.clone())
                    .header(header::CONTENT_TYPE, OCTET_STREAM)
                    .body(data.clone())
            })
            .await?;
        let response = check(response, "put blob").await?;
        let returned = header_digest(&response).unwrap_or_else(|| digest.clone());
        Ok(Descriptor::new(media_type, size, returned))
    }
}

/// An upload session identified by its `Location`
pub struct HttpBlobWriter {
    session: Arc<Session>,
    location: Url,
}

#[async_trait]
impl BlobWriter for HttpBlobWriter {
    async fn write_from(&mut self, stream: BlobStream) -> Result<u64, RegistryError> {
        let written = Arc::new(AtomicU64::new(0));
        let counter = written.clone();
        let body = stream.inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let request = self
            .session
            .client
            .patch(self.location.clone())
            .header(header::CONTENT_TYPE, OCTET_STREAM)
            .body(reqwest::Body::wrap_stream(body));
        let response = self.session.execute_once("upload blob", request).await?;
        let response = check(response, "upload blob").await?;
        if response.headers().contains_key(header::LOCATION) {
            self.location = self.session.resolve_location(&response)?;
        }
        Ok(written.load(Ordering::Relaxed))
    }

    async fn commit(&mut self, descriptor: &Descriptor) -> Result<Descriptor, RegistryError> {
        let mut url = self.location.clone();
        url.query_pairs_mut().append_pair("digest", descriptor.digest.as_str());
        let response = self
            .session
            .execute("commit blob", |client| {
                client.put(url.clone()).header(header::CONTENT_LENGTH, 0)
            })
            .await?;
        let response = check(response, "commit blob").await?;
        let mut committed = descriptor.clone();
        if let Some(digest) = header_digest(&response) {
            committed.digest = digest;
        }
        Ok(committed)
    }

    async fn cancel(self: Box<Self>) -> Result<(), RegistryError> {
        let response = self
            .session
            .execute("cancel blob upload", |client| client.delete(self.location.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, "cancel blob upload").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ImageReference;
    use crate::registry::{CredentialStore, RegistryContext, RepositoryConnector};

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
    async fn test_stat_missing_blob_is_blob_unknown() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let digest = Digest::from_bytes(b"missing");
        server
            .mock("HEAD", format!("/v2/ns/app/blobs/{}", digest).as_str())
            .with_status(404)
            .create_async()
            .await;
        let err = repo.blobs().stat(&digest).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobUnknown));
    }

    #[tokio::test]
    async fn test_put_uploads_with_local_digest() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let digest = Digest::from_bytes(b"config");
        server
            .mock("POST", "/v2/ns/app/blobs/uploads/")
            .with_status(202)
            .with_header("location", "/v2/ns/app/blobs/uploads/session-1?state=abc")
            .create_async()
            .await;
        let commit = server
            .mock("PUT", "/v2/ns/app/blobs/uploads/session-1")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("state".into(), "abc".into()),
                mockito::Matcher::UrlEncoded("digest".into(), digest.to_string()),
            ]))
            .match_body("config")
            .with_status(201)
            .with_header("docker-content-digest", digest.as_str())
            .create_async()
            .await;

        let desc = repo
            .blobs()
            .put("application/vnd.docker.container.image.v1+json", Bytes::from_static(b"config"))
            .await
            .unwrap();
        assert_eq!(desc.digest, digest);
        assert_eq!(desc.size, 6);
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_with_mount_returns_mounted() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let digest = Digest::from_bytes(b"layer");
        server
            .mock("POST", "/v2/ns/app/blobs/uploads/")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("mount".into(), digest.to_string()),
                mockito::Matcher::UrlEncoded("from".into(), "ns/other".into()),
            ]))
            .with_status(201)
            .with_header("docker-content-digest", digest.as_str())
            .create_async()
            .await;

        let from = ImageReference::parse(&format!("{}/ns/other", server.host_with_port()))
            .unwrap()
            .with_digest(&digest);
        let outcome = repo
            .blobs()
            .create(BlobCreateOptions {
                mount_from: Some(from),
                descriptor: Some(Descriptor::new("application/octet-stream", 5, digest.clone())),
            })
            .await
            .unwrap();
        match outcome {
            CreateOutcome::Mounted(desc) => {
                assert_eq!(desc.digest, digest);
                assert_eq!(desc.size, 5);
            }
            other => panic!("expected mount, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streamed_upload_counts_bytes() {
        let mut server = mockito::Server::new_async().await;
        let repo = repository(&mut server).await;
        let content = vec![7u8; 20000];
        let digest = Digest::from_bytes(&content);
        server
            .mock("POST", "/v2/ns/app/blobs/uploads/")
            .with_status(202)
            .with_header("location", "/v2/ns/app/blobs/uploads/s2")
            .create_async()
            .await;
        server
            .mock("PATCH", "/v2/ns/app/blobs/uploads/s2")
            .with_status(202)
            .with_header("location", "/v2/ns/app/blobs/uploads/s2?part=1")
            .create_async()
            .await;
        let commit = server
            .mock("PUT", "/v2/ns/app/blobs/uploads/s2")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("part".into(), "1".into()),
                mockito::Matcher::UrlEncoded("digest".into(), digest.to_string()),
            ]))
            .with_status(201)
            .create_async()
            .await;

        let CreateOutcome::Writer(mut writer) = repo.blobs().create(BlobCreateOptions::default()).await.unwrap() else {
            panic!("expected writer");
        };
        let chunks: Vec<Result<Bytes, RegistryError>> = content
            .chunks(4096)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let written = writer.write_from(futures::stream::iter(chunks).boxed()).await.unwrap();
        assert_eq!(written, 20000);
        writer
            .commit(&Descriptor::new("application/octet-stream", 20000, digest))
            .await
            .unwrap();
        commit.assert_async().await;
    }
}
