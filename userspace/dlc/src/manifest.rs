// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `imageloader.json` manifest parser.
//!
//! The parser validates the document and reports typed errors so it can be
//! exercised without touching the filesystem; [`Manifest::load`] adds the
//! directory lookup used by the engine.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::utils::MANIFEST_FILE_NAME;

/// Result alias returned by the parser.
pub type Result<T> = core::result::Result<T, ManifestError>;

/// Errors emitted while parsing DLC manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest failed to parse as JSON.
    #[error("manifest parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// The manifest could not be read.
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A required field was not provided.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A field contained a malformed value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Who the DLC is installed for; selects the ref-count variant and expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedBy {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Squashfs,
}

/// Validated DLC manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub id: String,
    pub package: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub manifest_version: u32,
    /// Size every slot image is allocated to.
    pub preallocated_size: u64,
    /// Number of leading image bytes covered by `image_sha256`.
    pub image_size: u64,
    pub image_sha256: [u8; 32],
    pub table_sha256: Option<[u8; 32]>,
    pub image_type: String,
    pub fs_type: FsType,
    pub preload_allowed: bool,
    pub factory_install: bool,
    pub used_by: UsedBy,
    pub is_removable: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawManifest {
    manifest_version: Option<u32>,
    image_sha256_hash: Option<String>,
    table_sha256_hash: Option<String>,
    version: Option<String>,
    size: Option<SizeField>,
    preallocated_size: Option<SizeField>,
    id: Option<String>,
    package: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    image_type: String,
    fs_type: Option<String>,
    #[serde(default)]
    preload_allowed: bool,
    #[serde(default)]
    factory_install: bool,
    used_by: Option<String>,
    #[serde(default)]
    is_removable: bool,
}

impl Manifest {
    /// Parses and validates a manifest document.
    pub fn parse_str(input: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(input)?;

        let id = require_string(raw.id, "id")?;
        let package = require_string(raw.package, "package")?;
        let image_size = parse_size(raw.size, "size")?;
        let preallocated_size = parse_size(raw.preallocated_size, "preallocated-size")?;
        if image_size > preallocated_size {
            return Err(ManifestError::InvalidField {
                field: "size",
                reason: format!("{image_size} exceeds preallocated-size {preallocated_size}"),
            });
        }
        let image_sha256 = parse_digest(
            raw.image_sha256_hash.ok_or(ManifestError::MissingField("image-sha256-hash"))?,
            "image-sha256-hash",
        )?;
        let table_sha256 = raw
            .table_sha256_hash
            .map(|value| parse_digest(value, "table-sha256-hash"))
            .transpose()?;

        let fs_type = match raw.fs_type.as_deref() {
            None | Some("squashfs") => FsType::Squashfs,
            Some("ext4") => FsType::Ext4,
            Some(other) => {
                return Err(ManifestError::InvalidField {
                    field: "fs-type",
                    reason: format!("unsupported filesystem `{other}`"),
                })
            }
        };
        let used_by = match raw.used_by.as_deref() {
            None | Some("system") => UsedBy::System,
            Some("user") => UsedBy::User,
            Some(other) => {
                return Err(ManifestError::InvalidField {
                    field: "used-by",
                    reason: format!("unknown class `{other}`"),
                })
            }
        };

        Ok(Self {
            name: raw.name.unwrap_or_else(|| id.clone()),
            id,
            package,
            description: raw.description,
            version: raw.version.unwrap_or_default(),
            manifest_version: raw.manifest_version.unwrap_or(1),
            preallocated_size,
            image_size,
            image_sha256,
            table_sha256,
            image_type: raw.image_type,
            fs_type,
            preload_allowed: raw.preload_allowed,
            factory_install: raw.factory_install,
            used_by,
            is_removable: raw.is_removable,
        })
    }

    /// Loads `<manifest_dir>/<id>/<package>/imageloader.json` and checks that
    /// the document describes `id`.
    pub fn load(manifest_dir: &Path, id: &str, package: &str) -> Result<Self> {
        let path = manifest_dir.join(id).join(package).join(MANIFEST_FILE_NAME);
        let text = fs::read_to_string(&path)
            .map_err(|source| ManifestError::Io { path: path.display().to_string(), source })?;
        let manifest = Self::parse_str(&text)?;
        if manifest.id != id {
            return Err(ManifestError::InvalidField {
                field: "id",
                reason: format!("manifest declares `{}` but lives under `{id}`", manifest.id),
            });
        }
        Ok(manifest)
    }
}

fn require_string(value: Option<String>, field: &'static str) -> Result<String> {
    let value = value.ok_or(ManifestError::MissingField(field))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ManifestError::InvalidField { field, reason: "must not be empty".into() });
    }
    if trimmed.contains('/') || trimmed == "." || trimmed == ".." {
        return Err(ManifestError::InvalidField {
            field,
            reason: format!("`{trimmed}` is not a valid directory name"),
        });
    }
    Ok(trimmed.to_string())
}

fn parse_size(value: Option<SizeField>, field: &'static str) -> Result<u64> {
    let size = match value.ok_or(ManifestError::MissingField(field))? {
        SizeField::Number(n) => n,
        SizeField::Text(text) => text.trim().parse().map_err(|_| ManifestError::InvalidField {
            field,
            reason: format!("`{text}` is not an unsigned integer"),
        })?,
    };
    if size == 0 {
        return Err(ManifestError::InvalidField { field, reason: "must be positive".into() });
    }
    Ok(size)
}

fn parse_digest(value: String, field: &'static str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim())
        .map_err(|err| ManifestError::InvalidField { field, reason: err.to_string() })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| ManifestError::InvalidField {
        field,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}
