//! End-to-end mirror runs against the in-memory registry

use async_trait::async_trait;
use bytes::Bytes;
use image_mirror::config::MirrorOptions;
use image_mirror::digest::Digest;
use image_mirror::error::{ErrorCode, MirrorError, RegistryError};
use image_mirror::logging::{Logger, SharedBuffer};
use image_mirror::manifest::schema1::EMPTY_TAR_DIGEST;
use image_mirror::manifest::{
    MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_SCHEMA1_SIGNED,
    MEDIA_TYPE_SCHEMA2, Manifest,
};
use image_mirror::mirror::Mirror;
use image_mirror::mirror::mappings::{Overlap, parse_args};
use image_mirror::reference::ImageReference;
use image_mirror::registry::{MemoryRegistry, Repository, RepositoryConnector, Scope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::timeout;

const LARGE: usize = 20_000;

struct Image {
    digest: Digest,
    config: Digest,
    layers: Vec<Digest>,
}

fn config_json(arch: &str) -> Vec<u8> {
    json!({
        "architecture": arch,
        "os": "linux",
        "config": {"Cmd": ["sh"]},
        "rootfs": {"type": "layers", "diff_ids": [format!("sha256:{}", "0".repeat(64))]},
        "history": [
            {"created": "2020-01-01T00:00:00Z", "created_by": "ADD file"},
            {"created": "2020-01-02T00:00:00Z", "created_by": "CMD [\"sh\"]", "empty_layer": true}
        ]
    })
    .to_string()
    .into_bytes()
}

fn image_manifest(
    registry: &MemoryRegistry,
    host: &str,
    repo: &str,
    arch: &str,
    layer: &[u8],
) -> (Manifest, Image) {
    let config = registry.add_blob(host, repo, &config_json(arch));
    let layer = registry.add_blob(host, repo, layer);
    let payload = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_SCHEMA2,
        "config": {
            "mediaType": MEDIA_TYPE_IMAGE_CONFIG,
            "size": config.size,
            "digest": config.digest
        },
        "layers": [{"mediaType": MEDIA_TYPE_LAYER, "size": layer.size, "digest": layer.digest}]
    });
    let manifest =
        Manifest::from_bytes(Some(MEDIA_TYPE_SCHEMA2), Bytes::from(payload.to_string())).unwrap();
    let image = Image {
        digest: manifest.digest(),
        config: config.digest,
        layers: vec![layer.digest],
    };
    (manifest, image)
}

fn add_image(registry: &MemoryRegistry, host: &str, repo: &str, tag: &str, layer: &[u8]) -> Image {
    let (manifest, image) = image_manifest(registry, host, repo, "amd64", layer);
    registry.add_manifest(host, repo, &manifest, Some(tag));
    image
}

fn mirror(
    registry: &MemoryRegistry,
    options: MirrorOptions,
    args: &[&str],
) -> (Mirror, SharedBuffer, SharedBuffer) {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mappings = parse_args(&args, &mut Overlap::new()).unwrap();
    let (logger, out, err_out) = Logger::capture();
    let connector: Arc<dyn RepositoryConnector> = Arc::new(registry.clone());
    (Mirror::new(options, mappings, logger, connector).unwrap(), out, err_out)
}

#[tokio::test]
async fn test_copies_image_to_new_registry() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "src.example", "team/app", "v1", &vec![7u8; LARGE]);

    let (m, out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=dst.example/mirror/app:v1"],
    );
    m.run().await.unwrap();

    assert_eq!(registry.tag("dst.example", "mirror/app", "v1"), Some(image.digest.clone()));
    assert!(registry.has_blob("dst.example", "mirror/app", &image.config));
    assert!(registry.has_blob("dst.example", "mirror/app", &image.layers[0]));
    assert_eq!(
        out.contents(),
        format!("{} dst.example/mirror/app:v1\n", image.digest)
    );

    let err = err_out.contents();
    assert!(err.contains("dst.example/\n  mirror/app\n    blobs:\n"));
    assert!(err.contains(&format!("      {} -> v1\n", image.digest)));
    assert!(err.contains("uploading: dst.example/mirror/app"));
    assert!(err.contains("info: Planning completed in "));
    assert!(err.contains("info: Mirroring completed in "));
}

#[tokio::test]
async fn test_retag_in_same_repository_copies_no_blobs() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "reg.example", "team/app", "v1", b"layer");

    let (m, _out, _err) = mirror(
        &registry,
        MirrorOptions::default(),
        &["reg.example/team/app:v1=reg.example/team/app:v2"],
    );
    m.run().await.unwrap();

    let counts = registry.counts();
    assert_eq!(counts.blob_puts, 0);
    assert_eq!(counts.upload_sessions, 0);
    assert_eq!(counts.mounts, 0);
    assert_eq!(counts.manifest_puts, 1);
    assert_eq!(registry.tag("reg.example", "team/app", "v2"), Some(image.digest));
}

#[tokio::test]
async fn test_existing_manifest_is_only_retagged() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "src.example", "team/app", "v1", b"layer");
    let (manifest, _) = image_manifest(&registry, "dst.example", "team/app", "amd64", b"layer");
    registry.add_manifest("dst.example", "team/app", &manifest, None);
    let before = registry.counts();

    let (m, _out, _err) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=dst.example/team/app:v1"],
    );
    m.run().await.unwrap();

    let after = registry.counts();
    assert_eq!(after.blob_puts, before.blob_puts);
    assert_eq!(after.manifest_puts, 1);
    assert_eq!(registry.tag("dst.example", "team/app", "v1"), Some(image.digest));
}

/// Everything logged before the planning time, which differs between runs
fn plan_text(err: &str) -> &str {
    &err[..err.find("info: Planning completed").unwrap()]
}

#[tokio::test]
async fn test_dry_run_prints_the_real_plan_and_writes_nothing() {
    let args = ["src.example/team/app:v1", "dst.example/a:v1", "dst.example/b:v1"];
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", &vec![1u8; LARGE]);
    let before = registry.counts();

    let options = MirrorOptions {
        dry_run: true,
        ..MirrorOptions::default()
    };
    let (m, out, err_out) = mirror(&registry, options, &args);
    m.run().await.unwrap();

    assert_eq!(registry.counts().total(), before.total());
    assert_eq!(registry.tag("dst.example", "a", "v1"), None);
    assert!(out.contents().is_empty());
    let dry = err_out.contents();
    assert!(dry.contains("phase 0:\n"));
    assert!(dry.contains("info: Dry run complete\n"));
    assert!(!dry.contains("Mirroring completed"));

    let real_registry = MemoryRegistry::new();
    let image = add_image(&real_registry, "src.example", "team/app", "v1", &vec![1u8; LARGE]);
    let (m, _out, err_out) = mirror(&real_registry, MirrorOptions::default(), &args);
    m.run().await.unwrap();

    let real = err_out.contents();
    assert_eq!(plan_text(&dry), plan_text(&real));
    assert_eq!(real_registry.tag("dst.example", "a", "v1"), Some(image.digest.clone()));
    assert_eq!(real_registry.tag("dst.example", "b", "v1"), Some(image.digest));
}

#[tokio::test]
async fn test_force_retag_in_same_repository_copies_blobs() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "reg.example", "team/app", "v1", &vec![5u8; LARGE]);

    let options = MirrorOptions {
        force: true,
        ..MirrorOptions::default()
    };
    let (m, _out, err_out) = mirror(
        &registry,
        options,
        &["reg.example/team/app:v1=reg.example/team/app:v2"],
    );
    m.run().await.unwrap();

    let err = err_out.contents();
    assert!(err.contains("reg.example/\n  team/app\n    blobs:\n"));
    assert!(err.contains(&format!("      {} -> v2\n", image.digest)));

    let counts = registry.counts();
    assert_eq!(counts.blob_puts, 1);
    assert_eq!(counts.upload_sessions, 1);
    assert_eq!(counts.commits, 1);
    assert_eq!(counts.mounts, 0);
    assert_eq!(counts.manifest_puts, 1);
    assert_eq!(registry.tag("reg.example", "team/app", "v2"), Some(image.digest));
}

#[tokio::test]
async fn test_force_copies_blobs_of_existing_manifest() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "src.example", "team/app", "v1", b"layer");
    let (manifest, _) = image_manifest(&registry, "dst.example", "team/app", "amd64", b"layer");
    registry.add_manifest("dst.example", "team/app", &manifest, None);
    let before = registry.counts();

    let options = MirrorOptions {
        force: true,
        ..MirrorOptions::default()
    };
    let (m, _out, err_out) = mirror(
        &registry,
        options,
        &["src.example/team/app:v1=dst.example/team/app:v1"],
    );
    m.run().await.unwrap();

    assert!(err_out.contents().contains("dst.example/\n  team/app\n    blobs:\n"));
    let after = registry.counts();
    assert_eq!(after.blob_puts, before.blob_puts + 2);
    assert_eq!(after.manifest_puts, 1);
    assert_eq!(registry.tag("dst.example", "team/app", "v1"), Some(image.digest));
}

#[tokio::test]
async fn test_shared_layers_are_mounted_in_a_later_phase() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "src.example", "team/app", "v1", &vec![3u8; LARGE]);

    let (m, _out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1", "dst.example/mirror/a:v1", "dst.example/mirror/b:v1"],
    );
    m.run().await.unwrap();

    let err = err_out.contents();
    assert!(err.contains(
        "phase 0:\n  dst.example mirror/a blobs=2 mounts=0 manifests=1 shared=2\n"
    ));
    assert!(err.contains(
        "phase 1:\n  dst.example mirror/b blobs=2 mounts=2 manifests=1 shared=2\n"
    ));
    assert!(err.contains("mounted: dst.example/mirror/b"));

    let counts = registry.counts();
    assert_eq!(counts.mounts, 1);
    assert_eq!(counts.commits, 1);
    for repo in ["mirror/a", "mirror/b"] {
        assert!(registry.has_blob("dst.example", repo, &image.layers[0]));
        assert_eq!(registry.tag("dst.example", repo, "v1"), Some(image.digest.clone()));
    }
}

#[tokio::test]
async fn test_skip_mount_uploads_every_layer() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", &vec![4u8; LARGE]);

    let options = MirrorOptions {
        skip_mount: true,
        ..MirrorOptions::default()
    };
    let (m, _out, _err) = mirror(
        &registry,
        options,
        &["src.example/team/app:v1", "dst.example/mirror/a:v1", "dst.example/mirror/b:v1"],
    );
    m.run().await.unwrap();

    let counts = registry.counts();
    assert_eq!(counts.mounts, 0);
    assert_eq!(counts.commits, 2);
}

#[tokio::test]
async fn test_filtered_manifest_list_gets_new_digest() {
    let registry = MemoryRegistry::new();
    let (amd64, amd64_image) =
        image_manifest(&registry, "src.example", "team/app", "amd64", b"amd64 layer");
    let (arm64, arm64_image) =
        image_manifest(&registry, "src.example", "team/app", "arm64", b"arm64 layer");
    registry.add_manifest("src.example", "team/app", &amd64, None);
    registry.add_manifest("src.example", "team/app", &arm64, None);

    let entry = |m: &Manifest, arch: &str| {
        json!({
            "mediaType": MEDIA_TYPE_SCHEMA2,
            "size": m.payload().len(),
            "digest": m.digest(),
            "platform": {"architecture": arch, "os": "linux"}
        })
    };
    let list_json = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST_LIST,
        "manifests": [entry(&amd64, "amd64"), entry(&arm64, "arm64")]
    });
    let list = Manifest::from_bytes(
        Some(MEDIA_TYPE_MANIFEST_LIST),
        Bytes::from(list_json.to_string()),
    )
    .unwrap();
    let source_digest = registry.add_manifest("src.example", "team/app", &list, Some("v1"));

    let options = MirrorOptions::default().with_filter("linux/amd64").unwrap();
    let (m, _out, _err) = mirror(
        &registry,
        options,
        &["src.example/team/app:v1=dst.example/team/app:v1"],
    );
    m.run().await.unwrap();

    let pushed = registry.tag("dst.example", "team/app", "v1").unwrap();
    assert_ne!(pushed, source_digest);
    let manifest = registry.manifest("dst.example", "team/app", &pushed).unwrap();
    let entries = &manifest.as_list().unwrap().manifests;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].digest, amd64_image.digest);

    assert!(registry.has_blob("dst.example", "team/app", &amd64_image.layers[0]));
    assert!(!registry.has_blob("dst.example", "team/app", &arm64_image.layers[0]));
    assert!(!registry.has_blob("dst.example", "team/app", &arm64_image.config));

    let pushes: Vec<_> = registry
        .pushes()
        .into_iter()
        .filter(|p| p.registry == "dst.example")
        .collect();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0].digest, amd64_image.digest);
    assert_eq!(pushes[0].tag, None);
    assert_eq!(pushes[1].tag.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_filter_removing_every_image_skips_source() {
    let registry = MemoryRegistry::new();
    let (arm64, _) = image_manifest(&registry, "src.example", "team/app", "arm64", b"arm64 layer");
    registry.add_manifest("src.example", "team/app", &arm64, None);
    let list_json = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST_LIST,
        "manifests": [{
            "mediaType": MEDIA_TYPE_SCHEMA2,
            "size": arm64.payload().len(),
            "digest": arm64.digest(),
            "platform": {"architecture": "arm64", "os": "linux"}
        }]
    });
    let list = Manifest::from_bytes(
        Some(MEDIA_TYPE_MANIFEST_LIST),
        Bytes::from(list_json.to_string()),
    )
    .unwrap();
    registry.add_manifest("src.example", "team/app", &list, Some("v1"));

    let options = MirrorOptions::default().with_filter("linux/amd64").unwrap();
    let (m, _out, err_out) = mirror(
        &registry,
        options,
        &["src.example/team/app:v1=dst.example/team/app:v1"],
    );
    m.run().await.unwrap();

    assert!(err_out.contents().contains("Filtered all images from src.example/team/app, skipping"));
    assert!(registry.pushes().iter().all(|p| p.registry != "dst.example"));
}

fn manifest_invalid() -> RegistryError {
    RegistryError::Registry {
        status: 400,
        errors: vec![ErrorCode {
            code: "MANIFEST_INVALID".to_string(),
            message: "manifest invalid".to_string(),
        }],
    }
}

#[tokio::test]
async fn test_manifest_invalid_falls_back_to_schema1() {
    let registry = MemoryRegistry::new();
    let image = add_image(&registry, "src.example", "team/app", "v1", b"layer");
    registry.reject_manifests("dst.example", "legacy/app", MEDIA_TYPE_SCHEMA2, manifest_invalid());

    let (m, _out, _err) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=dst.example/legacy/app:v1"],
    );
    m.run().await.unwrap();

    let pushes: Vec<_> = registry
        .pushes()
        .into_iter()
        .filter(|p| p.registry == "dst.example")
        .collect();
    assert_eq!(pushes.len(), 2);
    assert!(!pushes[0].accepted);
    assert_eq!(pushes[0].digest, image.digest);
    assert!(pushes[1].accepted);
    assert_eq!(pushes[1].media_type, MEDIA_TYPE_SCHEMA1_SIGNED);
    assert_eq!(pushes[1].tag.as_deref(), Some("v1"));

    let tagged = registry.tag("dst.example", "legacy/app", "v1").unwrap();
    let stored = registry.manifest("dst.example", "legacy/app", &tagged).unwrap();
    assert_eq!(stored.media_type(), MEDIA_TYPE_SCHEMA1_SIGNED);
    let empty_layer = Digest::parse(EMPTY_TAR_DIGEST).unwrap();
    assert!(registry.has_blob("dst.example", "legacy/app", &empty_layer));
}

#[tokio::test]
async fn test_failed_schema1_fallback_reports_original_error() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", b"layer");
    registry.reject_manifests("dst.example", "legacy/app", MEDIA_TYPE_SCHEMA2, manifest_invalid());
    registry.reject_manifests(
        "dst.example",
        "legacy/app",
        MEDIA_TYPE_SCHEMA1_SIGNED,
        RegistryError::Denied("schema1 disabled".to_string()),
    );

    let (m, _out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=dst.example/legacy/app:v1"],
    );
    let err = m.run().await.unwrap_err();
    assert!(matches!(err, MirrorError::Mirroring));

    let pushes: Vec<_> = registry
        .pushes()
        .into_iter()
        .filter(|p| p.registry == "dst.example")
        .collect();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().all(|p| !p.accepted));

    let err = err_out.contents();
    assert!(err.contains("error: unable to push manifest to dst.example/legacy/app"));
    assert!(err.contains("manifest invalid"));
    assert!(!err.contains("schema1 disabled"));
}

#[tokio::test]
async fn test_small_blob_digest_mismatch_fails_phase() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", b"layer");
    registry.set_corrupt_puts(true);

    let (m, out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=dst.example/team/app:v1"],
    );
    let err = m.run().await.unwrap_err();
    assert!(matches!(err, MirrorError::Mirroring));
    assert!(err_out.contents().contains("got back a different digest"));
    assert!(out.contents().is_empty());
    assert_eq!(registry.tag("dst.example", "team/app", "v1"), None);
}

#[tokio::test]
async fn test_unreachable_destination_is_a_planning_error() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", b"layer");
    registry.set_unreachable("down.example");

    let (m, _out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1", "down.example/team/app:v1", "dst.example/team/app:v1"],
    );
    let err = m.run().await.unwrap_err();
    assert!(matches!(err, MirrorError::Planning));

    let err = err_out.contents();
    assert!(err.contains("error: unable to connect to down.example/team/app: "));
    assert!(err.contains("info: Planning completed in "));
    assert_eq!(registry.counts().manifest_puts, 0);
}

#[tokio::test]
async fn test_missing_source_tag_is_a_planning_error() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", b"layer");

    let (m, _out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v2=dst.example/team/app:v2"],
    );
    assert!(matches!(m.run().await.unwrap_err(), MirrorError::Planning));
    assert!(
        err_out
            .contents()
            .contains("unable to retrieve source image src.example/team/app by tag v2")
    );
}

#[tokio::test]
async fn test_s3_destination_is_unsupported() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "src.example", "team/app", "v1", b"layer");

    let (m, _out, err_out) = mirror(
        &registry,
        MirrorOptions::default(),
        &["src.example/team/app:v1=s3://bucket.example/team/app:v1"],
    );
    assert!(matches!(m.run().await.unwrap_err(), MirrorError::Planning));
    assert!(err_out.contents().contains("no S3 blob store driver"));
}

/// Holds every source connection until `gate` is full, so planning only finishes when that many
/// sources are connecting at once
struct GatedConnector {
    registry: MemoryRegistry,
    gate: Arc<Barrier>,
}

#[async_trait]
impl RepositoryConnector for GatedConnector {
    async fn repository(
        &self,
        reference: &ImageReference,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>, RegistryError> {
        self.gate.wait().await;
        self.registry.repository(reference, insecure).await
    }

    fn scoped(&self, _actions: &[&str], _scopes: &[Scope]) -> Arc<dyn RepositoryConnector> {
        Arc::new(self.registry.clone())
    }
}

fn gated_mirror(registry: &MemoryRegistry, max_registry: usize) -> Mirror {
    let args: Vec<String> = [
        "one.example/team/app:v1=dst.example/one/app:v1",
        "two.example/team/app:v1=dst.example/two/app:v1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let mappings = parse_args(&args, &mut Overlap::new()).unwrap();
    let options = MirrorOptions {
        max_registry,
        ..MirrorOptions::default()
    };
    let connector: Arc<dyn RepositoryConnector> = Arc::new(GatedConnector {
        registry: registry.clone(),
        gate: Arc::new(Barrier::new(2)),
    });
    let (logger, _out, _err) = Logger::capture();
    Mirror::new(options, mappings, logger, connector).unwrap()
}

#[tokio::test]
async fn test_sources_on_different_registries_are_planned_concurrently() {
    let registry = MemoryRegistry::new();
    let one = add_image(&registry, "one.example", "team/app", "v1", b"one layer");
    let two = add_image(&registry, "two.example", "team/app", "v1", b"two layer");

    let m = gated_mirror(&registry, 2);
    timeout(Duration::from_secs(10), m.run())
        .await
        .expect("both sources connect at once")
        .unwrap();

    assert_eq!(registry.tag("dst.example", "one/app", "v1"), Some(one.digest));
    assert_eq!(registry.tag("dst.example", "two/app", "v1"), Some(two.digest));
}

#[tokio::test]
async fn test_max_registry_limits_sources_planned_at_once() {
    let registry = MemoryRegistry::new();
    add_image(&registry, "one.example", "team/app", "v1", b"one layer");
    add_image(&registry, "two.example", "team/app", "v1", b"two layer");

    let m = gated_mirror(&registry, 1);
    assert!(timeout(Duration::from_millis(200), m.plan()).await.is_err());
    assert_eq!(registry.counts().total(), 0);
}
