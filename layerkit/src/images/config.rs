//! Image manifest and config documents.
//!
//! These follow the OCI image layout field names. Nothing time-dependent is
//! written into them, so the same build inputs always serialize to the same
//! bytes and therefore the same digests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};

use crate::layers::{Digest, LayerDescriptor};
use crate::recipe::ExposedPort;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: &[LayerDescriptor]) -> Self {
        Self {
            schema_version: 2,
            media_type: MediaType::ImageManifest,
            config,
            layers: layers
                .iter()
                .map(|layer| Descriptor {
                    media_type: MediaType::ImageLayerGzip,
                    digest: layer.digest.clone(),
                    size: layer.size,
                })
                .collect(),
        }
    }
}

/// Serializes as `{}`, the value type of `ExposedPorts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "WorkingDir")]
    pub working_dir: PathBuf,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    pub history: Vec<History>,
}

impl ImageConfig {
    pub fn new(
        working_dir: PathBuf,
        exposed: &[ExposedPort],
        cmd: Vec<String>,
        layers: &[LayerDescriptor],
        history: Vec<History>,
    ) -> Self {
        Self {
            architecture: host_architecture().to_string(),
            os: std::env::consts::OS.to_string(),
            config: ContainerConfig {
                working_dir,
                exposed_ports: exposed
                    .iter()
                    .map(|port| (port.to_string(), EmptyObject {}))
                    .collect(),
                cmd,
            },
            rootfs: RootFs {
                kind: "layers".into(),
                diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect(),
            },
            history,
        }
    }
}

/// Host CPU architecture in OCI naming.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
