//! Command-line argument parsing

use crate::config::MirrorOptions;
use crate::error::Result;
use crate::mirror::mappings::{self, Mapping, Overlap};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "image-mirror")]
#[command(about = "Mirror images from one image repository to another")]
#[command(
    override_usage = "image-mirror SRC DST [DST ...]\n       image-mirror SRC=DST [SRC=DST ...]\n       image-mirror -f FILE"
)]
#[command(version)]
pub struct Args {
    /// SRC=DST pairs, or one SRC followed by one or more DST
    #[arg(value_name = "MAPPING")]
    pub mappings: Vec<String>,

    /// Files of mappings, one set per line
    #[arg(
        long = "filename",
        short = 'f',
        help = "One or more files to read SRC=DST or SRC DST [DST ...] mappings from"
    )]
    pub filenames: Vec<PathBuf>,

    #[arg(
        long = "dry-run",
        help = "Print the actions that would be taken and exit without writing to the destinations"
    )]
    pub dry_run: bool,

    #[arg(
        long = "insecure",
        help = "Allow push and pull operations to registries to be made over HTTP"
    )]
    pub insecure: bool,

    #[arg(
        long = "skip-mount",
        help = "Always push layers instead of cross-mounting them"
    )]
    pub skip_mount: bool,

    #[arg(
        long = "skip-multiple-scopes",
        help = "Some registries do not support multiple scopes passed to the registry login"
    )]
    pub skip_multiple_scopes: bool,

    #[arg(
        long = "filter-by-os",
        default_value = "",
        help = "A regular expression to control which images are mirrored. Images will be passed as '<platform>/<architecture>[/<variant>]'"
    )]
    pub filter_by_os: String,

    #[arg(
        long = "force",
        help = "Attempt to write all layers and manifests even if they exist in the remote repository"
    )]
    pub force: bool,

    #[arg(
        long = "max-registry",
        default_value = "4",
        help = "Number of concurrent registries to connect to at any one time"
    )]
    pub max_registry: usize,

    #[arg(
        long = "max-per-registry",
        default_value = "6",
        help = "Number of concurrent requests allowed per registry"
    )]
    pub max_per_registry: usize,

    #[arg(
        long = "s3-source-bucket",
        value_delimiter = ',',
        help = "A list of S3 buckets that may be used as sources for mirroring"
    )]
    pub s3_source_buckets: Vec<String>,

    /// Docker config.json holding registry credentials
    #[arg(
        long = "registry-config",
        env = "REGISTRY_AUTH_FILE",
        help = "Path to a docker config.json with registry credentials (defaults to ~/.docker/config.json)"
    )]
    pub registry_config: Option<PathBuf>,

    #[arg(
        long = "timeout",
        short = 't',
        default_value = "300",
        help = "Timeout for a single registry request in seconds"
    )]
    pub timeout: u64,

    #[arg(
        long = "verbose",
        short = 'v',
        action = ArgAction::Count,
        help = "Increase diagnostic output, may be repeated"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Options for a mirror run, with environment overrides applied
    pub fn options(&self) -> Result<MirrorOptions> {
        let options = MirrorOptions {
            dry_run: self.dry_run,
            insecure: self.insecure,
            skip_mount: self.skip_mount,
            skip_multiple_scopes: self.skip_multiple_scopes,
            force: self.force,
            filter_by_os: None,
            max_registry: self.max_registry,
            max_per_registry: self.max_per_registry,
            s3_source_buckets: self.s3_source_buckets.clone(),
            registry_config: self.registry_config.clone(),
        }
        .from_env()
        .with_filter(&self.filter_by_os)?;
        options.validate()?;
        Ok(options)
    }

    /// Mappings from the positional arguments followed by every `--filename`. A destination
    /// may be named only once across all of them.
    pub fn mappings(&self) -> Result<Vec<Mapping>> {
        let mut overlap = Overlap::new();
        let mut all = mappings::parse_args(&self.mappings, &mut overlap)?;
        for path in &self.filenames {
            all.extend(mappings::parse_file(path, &mut overlap)?);
        }
        mappings::validate(&all)?;
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["image-mirror", "quay.io/a/b:1", "reg.example/c/d"]).unwrap();
        assert_eq!(args.max_registry, 4);
        assert_eq!(args.max_per_registry, 6);
        assert_eq!(args.timeout, 300);
        assert!(!args.dry_run);
        assert_eq!(args.verbose, 0);

        let mappings = args.mappings().unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].source.to_string(), "quay.io/a/b:1");
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "image-mirror",
            "--dry-run",
            "--skip-mount",
            "--filter-by-os",
            "linux/.*",
            "--max-per-registry",
            "2",
            "--s3-source-bucket",
            "one,two",
            "-vv",
            "quay.io/a/b:1=reg.example/c/d:1",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.s3_source_buckets, vec!["one", "two"]);

        let options = args.options().unwrap();
        assert!(options.dry_run);
        assert!(options.skip_mount);
        assert_eq!(options.max_per_registry, 2);
        assert!(options.filter_by_os.is_some());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let args = Args::try_parse_from(["image-mirror", "--filter-by-os", "(", "a=b"]).unwrap();
        assert!(args.options().is_err());
    }

    #[test]
    fn test_mappings_from_files_share_destinations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "quay.io/a/c:1=reg.example/c/d:1").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = Args::try_parse_from([
            "image-mirror",
            "-f",
            path.as_str(),
            "quay.io/a/b:1=reg.example/c/d:1",
        ])
        .unwrap();
        let err = args.mappings().unwrap_err();
        assert!(err.to_string().contains("each destination tag may only be specified once"));
    }

    #[test]
    fn test_no_mappings_rejected() {
        let args = Args::try_parse_from(["image-mirror"]).unwrap();
        assert!(args.mappings().is_err());
    }
}
