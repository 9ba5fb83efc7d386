//! Blob and manifest copying

use super::greedy::WorkPlan;
use super::plan::{BlobCopy, ManifestPlan, Plan, RegistryPlan, RepositoryPlan, lock};
use crate::config::MirrorOptions;
use crate::digest::Digest;
use crate::error::{MirrorError, RegistryError};
use crate::logging::{Logger, format_size};
use crate::manifest::schema1::{EMPTY_TAR_DIGEST, GZIPPED_EMPTY_TAR};
use crate::manifest::{
    Descriptor, ImageManifest, MEDIA_TYPE_LAYER, MEDIA_TYPE_SCHEMA2, Manifest, Schema1Builder,
    SigningKeyCache,
};
use crate::reference::ImageReference;
use crate::registry::{BlobCreateOptions, BlobStore, BlobWriter, CreateOutcome};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Blobs smaller than this are fetched whole and pushed in one request
pub const SMALL_BLOB_SIZE: u64 = 16384;

type InflightKey = (String, Digest);

/// Holds a claim on a blob upload into one repository until dropped
struct InflightClaim<'a> {
    inflight: &'a Mutex<HashSet<InflightKey>>,
    key: Option<InflightKey>,
}

impl Drop for InflightClaim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(self.inflight).remove(&key);
        }
    }
}

/// Executes the copies of one mirror run
pub struct Executor {
    force: bool,
    skip_mount: bool,
    logger: Logger,
    plan: Arc<Plan>,
    work: Arc<WorkPlan>,
    keys: SigningKeyCache,
    inflight: Mutex<HashSet<InflightKey>>,
}

impl Executor {
    pub fn new(
        options: &MirrorOptions,
        logger: &Logger,
        plan: Arc<Plan>,
        work: Arc<WorkPlan>,
    ) -> Self {
        Self {
            force: options.force,
            skip_mount: options.skip_mount,
            logger: logger.clone(),
            plan,
            work,
            keys: SigningKeyCache::new(),
            inflight: Mutex::default(),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    fn claim(
        &self,
        registry: &str,
        repository: &str,
        digest: &Digest,
    ) -> Option<InflightClaim<'_>> {
        let key = (format!("{}/{}", registry, repository), digest.clone());
        if !lock(&self.inflight).insert(key.clone()) {
            return None;
        }
        Some(InflightClaim {
            inflight: &self.inflight,
            key: Some(key),
        })
    }

    /// Make `blob` present in the destination of `copy`: skip when it is already there, mount
    /// it from a sibling repository when possible, and upload it otherwise.
    pub async fn copy_blob(
        &self,
        registry: &RegistryPlan,
        repository: &RepositoryPlan,
        copy: &BlobCopy,
        blob: &Descriptor,
    ) -> Result<(), MirrorError> {
        if repository.is_expected(&blob.digest) {
            tracing::debug!("blob {} was already copied to {}", blob.digest, copy.to_ref);
            return Ok(());
        }
        if !self.force {
            match copy.to.stat(&blob.digest).await {
                Ok(_) => {
                    tracing::debug!(
                        "server reports blob {} exists in {}",
                        blob.digest,
                        copy.to_ref
                    );
                    registry.associate_blob(&blob.digest, &repository.name);
                    repository.expect_blob(&blob.digest);
                    return Ok(());
                }
                Err(RegistryError::BlobUnknown) => {}
                Err(e) => {
                    tracing::debug!(
                        "server was unable to check whether blob {} exists: {}",
                        blob.digest,
                        e
                    );
                }
            }
        }

        let Some(_claim) = self.claim(&registry.name, &repository.name, &blob.digest) else {
            tracing::debug!("blob {} is already being copied to {}", blob.digest, copy.to_ref);
            return Ok(());
        };

        let mut options = BlobCreateOptions::default();
        let mut expect_mount = None;
        if !self.skip_mount {
            if let Some(from) = registry.mount_from(&blob.digest, &repository.name) {
                options.mount_from = Some(ImageReference {
                    registry: registry.name.clone(),
                    repository: from.clone(),
                    tag: None,
                    digest: Some(blob.digest.clone()),
                });
                options.descriptor = Some(blob.clone());
                expect_mount = Some(from);
            }
        }

        if blob.size > 0 && blob.size < SMALL_BLOB_SIZE {
            return self.put_small_blob(copy, blob).await;
        }

        let writer = match copy.to.create(options).await {
            Ok(CreateOutcome::Writer(writer)) => writer,
            Ok(CreateOutcome::Mounted(mounted)) => {
                if mounted.digest != blob.digest {
                    return Err(MirrorError::Copy(format!(
                        "unable to push {}: tried to mount blob {} source and got back a \
                         different digest {}",
                        copy.from_ref, blob.digest, mounted.digest
                    )));
                }
                self.logger.line(&format!(
                    "mounted: {}{} {} {}",
                    copy.destination_type.prefix(),
                    copy.to_ref,
                    blob.digest,
                    format_size(blob.size)
                ));
                repository.expect_blob(&blob.digest);
                return Ok(());
            }
            Err(e) => {
                return Err(MirrorError::Copy(format!(
                    "unable to upload blob {} to {}: {}",
                    blob.digest, copy.to_ref, e
                )));
            }
        };

        if let Some(from) = expect_mount {
            self.logger.warning(&format!(
                "Expected to mount {} from {}/{} but mount was ignored",
                blob.digest, registry.name, from
            ));
        }

        self.upload(copy, blob, writer).await.map_err(|e| {
            MirrorError::Copy(format!(
                "failed to commit blob {} from {} to {}: {}",
                blob.digest, copy.location, copy.to_ref, e
            ))
        })?;
        repository.expect_blob(&blob.digest);
        Ok(())
    }

    async fn put_small_blob(&self, copy: &BlobCopy, blob: &Descriptor) -> Result<(), MirrorError> {
        let data = copy.from.get(&blob.digest).await.map_err(|e| {
            MirrorError::Copy(format!(
                "unable to push {}: failed to retrieve blob {}: {}",
                copy.from_ref, blob.digest, e
            ))
        })?;
        let put = copy.to.put(&blob.media_type, data).await.map_err(|e| {
            MirrorError::Copy(format!(
                "unable to push {}: failed to upload blob {}: {}",
                copy.from_ref, blob.digest, e
            ))
        })?;
        if put.digest != blob.digest {
            return Err(MirrorError::Copy(format!(
                "unable to push {}: tried to copy blob {} and got back a different digest {}",
                copy.from_ref, blob.digest, put.digest
            )));
        }
        self.work.bytes_copied(blob.size);
        Ok(())
    }

    async fn upload(
        &self,
        copy: &BlobCopy,
        blob: &Descriptor,
        mut writer: Box<dyn BlobWriter>,
    ) -> Result<(), String> {
        tracing::debug!("uploading blob {}", blob.digest);
        let source = match copy.from.open(&blob.digest).await {
            Ok(source) => source,
            Err(e) => {
                cancel(writer).await;
                return Err(format!(
                    "unable to open source layer {} to copy to {}: {}",
                    blob.digest, copy.to_ref, e
                ));
            }
        };

        self.logger.line(&format!(
            "uploading: {}{} {} {}",
            copy.destination_type.prefix(),
            copy.to_ref,
            blob.digest,
            format_size(blob.size)
        ));

        let written = match writer.write_from(source).await {
            Ok(n) => n,
            Err(e) => {
                cancel(writer).await;
                return Err(format!(
                    "unable to copy layer {} to {}: {}",
                    blob.digest, copy.to_ref, e
                ));
            }
        };
        if written != blob.size {
            self.logger.warning(&format!(
                "Layer size mismatch for {}: had {}, wrote {}",
                blob.digest, blob.size, written
            ));
        }
        if let Err(e) = writer.commit(blob).await {
            cancel(writer).await;
            return Err(e.to_string());
        }
        self.work.bytes_copied(written);
        Ok(())
    }

    /// Push every manifest of `manifests`: digest-only pushes first, in planned order, then
    /// one push per tag. Returns the errors of the pushes that failed.
    pub async fn copy_manifests(
        &self,
        registry: &RegistryPlan,
        repository: &RepositoryPlan,
        manifests: &ManifestPlan,
    ) -> Vec<MirrorError> {
        let mut pushes: Vec<(&Digest, Option<&str>)> =
            manifests.digest_copies.iter().map(|d| (d, None)).collect();
        for (digest, tags) in &manifests.digests_to_tags {
            pushes.extend(tags.iter().map(|t| (digest, Some(t.as_str()))));
        }

        let mut errors = Vec::new();
        for (digest, tag) in pushes {
            let Some(manifest) = self.plan.manifest(digest) else {
                errors.push(MirrorError::Copy(format!(
                    "no source manifest was loaded for {}",
                    digest
                )));
                continue;
            };
            let pushed = self
                .put_manifest_in_compatible_schema(&manifest, tag, manifests)
                .await;
            let to_digest = match pushed {
                Ok(d) => d,
                Err(e) => {
                    errors.push(MirrorError::Copy(format!(
                        "unable to push manifest to {}: {}",
                        manifests.to_ref, e
                    )));
                    continue;
                }
            };
            for desc in manifest.references() {
                registry.associate_blob(&desc.digest, &repository.name);
            }
            let prefix = manifests.destination_type.prefix();
            match tag {
                Some(tag) => self.logger.result(&format!(
                    "{} {}{}:{}",
                    to_digest, prefix, manifests.to_ref, tag
                )),
                None => {
                    self.logger
                        .result(&format!("{} {}{}", to_digest, prefix, manifests.to_ref))
                }
            }
        }
        errors
    }

    /// Push `manifest`. A docker schema2 manifest rejected as `MANIFEST_INVALID` under a tag is
    /// converted to signed schema1 and pushed once more; if that fails too, the original
    /// rejection is returned.
    pub async fn put_manifest_in_compatible_schema(
        &self,
        manifest: &Manifest,
        tag: Option<&str>,
        plan: &ManifestPlan,
    ) -> Result<Digest, RegistryError> {
        let err = match plan.to.put(manifest, tag).await {
            Ok(digest) => return Ok(digest),
            Err(err) => err,
        };
        if !err.is_manifest_invalid() || manifest.media_type() != MEDIA_TYPE_SCHEMA2 {
            return Err(err);
        }
        let (Some(image), Some(tag)) = (manifest.as_image(), tag) else {
            return Err(err);
        };

        tracing::debug!(
            "registry reported invalid manifest error, attempting to convert to schema1 as {}:{}",
            plan.to_ref,
            tag
        );
        let converted = self
            .convert_to_schema1(image, &plan.to_ref, tag, &plan.to_blobs)
            .await;
        let converted = match converted {
            Ok(converted) => converted,
            Err(e) => {
                tracing::debug!("schema1 conversion failed: {}", e);
                return Err(err);
            }
        };
        tracing::trace!("converted to schema1\n{}", String::from_utf8_lossy(converted.payload()));
        match plan.to.put(&converted, Some(tag)).await {
            Ok(digest) => Ok(digest),
            Err(e) => {
                tracing::debug!("schema1 push failed: {}", e);
                Err(err)
            }
        }
    }

    async fn convert_to_schema1(
        &self,
        image: &ImageManifest,
        to_ref: &ImageReference,
        tag: &str,
        blobs: &Arc<dyn BlobStore>,
    ) -> Result<Manifest, RegistryError> {
        let config = blobs.get(&image.config.digest).await?;
        let key = self.keys.get().await?;
        let output =
            Schema1Builder::new(&to_ref.repository, tag, &config, &image.layers).build(&key)?;
        if output.uses_empty_layer {
            ensure_empty_layer(blobs).await?;
        }
        Ok(output.manifest)
    }
}

async fn ensure_empty_layer(blobs: &Arc<dyn BlobStore>) -> Result<(), RegistryError> {
    let digest = Digest::parse(EMPTY_TAR_DIGEST)?;
    match blobs.stat(&digest).await {
        Ok(_) => return Ok(()),
        Err(RegistryError::BlobUnknown) => {}
        Err(e) => return Err(e),
    }
    let put = blobs
        .put(MEDIA_TYPE_LAYER, Bytes::from_static(GZIPPED_EMPTY_TAR))
        .await?;
    if put.digest != digest {
        return Err(RegistryError::DigestMismatch {
            expected: digest.to_string(),
            actual: put.digest.to_string(),
        });
    }
    Ok(())
}

async fn cancel(writer: Box<dyn BlobWriter>) {
    if let Err(e) = writer.cancel().await {
        tracing::debug!("unable to cancel blob upload: {}", e);
    }
}
