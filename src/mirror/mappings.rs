//! Source to destination mappings
//!
//! Mappings come from `SRC=DST` arguments, from a `SRC DST [DST...]` argument list, or from
//! mapping files with one set per line.

use crate::error::{MirrorError, Result};
use crate::reference::ImageReference;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

const S3_SCHEME: &str = "s3://";
const DEFAULT_TAG: &str = "latest";

/// Where a destination lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DestinationType {
    #[default]
    Registry,
    S3,
}

impl DestinationType {
    /// Prefix used when printing references of this type
    pub fn prefix(&self) -> &'static str {
        match self {
            DestinationType::Registry => "",
            DestinationType::S3 => S3_SCHEME,
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Registry => f.write_str("registry"),
            DestinationType::S3 => f.write_str("s3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub source: ImageReference,
    pub destination: ImageReference,
    pub destination_type: DestinationType,
}

/// Destinations already claimed, keyed by destination and holding the source that claimed it
pub type Overlap = HashMap<String, String>;

fn invalid_reference(input: &str, err: impl fmt::Display) -> MirrorError {
    MirrorError::Validation(format!("\"{}\" is not a valid image reference: {}", input, err))
}

pub fn parse_source(input: &str) -> Result<ImageReference> {
    let mut source = ImageReference::parse(input).map_err(|e| invalid_reference(input, e))?;
    if source.tag.is_none() && source.digest.is_none() {
        source.tag = Some(DEFAULT_TAG.to_string());
    }
    Ok(source)
}

pub fn parse_destination(input: &str) -> Result<(ImageReference, DestinationType)> {
    let (trimmed, destination_type) = match input.strip_prefix(S3_SCHEME) {
        Some(rest) => (rest, DestinationType::S3),
        None => (input, DestinationType::Registry),
    };
    let destination = ImageReference::parse(trimmed).map_err(|e| invalid_reference(input, e))?;
    if destination.digest.is_some() {
        return Err(MirrorError::Validation(
            "you must specify a tag for DST or leave it blank to only push by digest".to_string(),
        ));
    }
    Ok((destination, destination_type))
}

fn claim(overlap: &mut Overlap, source: &ImageReference, destination: &ImageReference) -> Result<()> {
    let key = destination.to_string();
    if overlap.contains_key(&key) {
        return Err(MirrorError::Validation(format!(
            "each destination tag may only be specified once: {}",
            key
        )));
    }
    overlap.insert(key, source.to_string());
    Ok(())
}

fn mapping(source: &ImageReference, dst: &str, overlap: &mut Overlap) -> Result<Mapping> {
    let (destination, destination_type) = parse_destination(dst)?;
    claim(overlap, source, &destination)?;
    Ok(Mapping {
        source: source.clone(),
        destination,
        destination_type,
    })
}

/// Parse command line arguments into mappings.
///
/// Arguments of the form `SRC=DST` are pairs. When no pair is given, the first argument is the
/// source and every other argument is a destination for it.
pub fn parse_args(args: &[String], overlap: &mut Overlap) -> Result<Vec<Mapping>> {
    let mut remaining = Vec::new();
    let mut mappings = Vec::new();
    for arg in args {
        let Some((src, dst)) = arg.split_once('=') else {
            remaining.push(arg.as_str());
            continue;
        };
        if src.is_empty() || dst.is_empty() {
            return Err(MirrorError::Validation(
                "all arguments must be valid SRC=DST mappings".to_string(),
            ));
        }
        let source = parse_source(src)?;
        mappings.push(mapping(&source, dst, overlap)?);
    }

    if mappings.is_empty() {
        match remaining.as_slice() {
            [] => {}
            [_] => {
                return Err(MirrorError::Validation(
                    "all arguments must be valid SRC=DST mappings, or you must specify one SRC argument and one or more DST arguments"
                        .to_string(),
                ));
            }
            [src, dsts @ ..] => {
                let source = parse_source(src)?;
                for dst in dsts.iter().filter(|d| !d.is_empty()) {
                    mappings.push(mapping(&source, dst, overlap)?);
                }
            }
        }
    }
    Ok(mappings)
}

/// Parse a mapping file: each line holds arguments as accepted by [`parse_args`]; blank lines
/// and lines starting with `#` are ignored.
pub fn parse_file(path: &Path, overlap: &mut Overlap) -> Result<Vec<Mapping>> {
    let contents = fs::read_to_string(path)?;
    let name = path.display();
    let mut mappings = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let parsed = parse_args(&fields, overlap).map_err(|e| {
            MirrorError::Validation(format!("file {}, line {}: {}", name, i + 1, e))
        })?;
        mappings.extend(parsed);
    }
    Ok(mappings)
}

/// Reject an empty mapping set and mappings that copy an image onto itself
pub fn validate(mappings: &[Mapping]) -> Result<()> {
    if mappings.is_empty() {
        return Err(MirrorError::Validation(
            "you must specify at least one source image to pull and the destination to push to as SRC=DST or SRC DST [DST2 DST3 ...]"
                .to_string(),
        ));
    }
    for m in mappings {
        if m.source == m.destination {
            return Err(MirrorError::Validation(
                "SRC and DST may not be the same".to_string(),
            ));
        }
    }
    Ok(())
}
