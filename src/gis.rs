//! Remote feature service boundary.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A hosted resource exposing one or more layers.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub title: String,
    pub layers: Vec<Layer>,
}

/// A sub-resource of a collection holding records.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Position within the collection's declared layer order.
    pub index: usize,
    /// Layer id as assigned by the service.
    pub id: i64,
    pub name: String,
    pub supports_attachments: bool,
    pub object_id_field: String,
    /// REST endpoint of the layer. Empty for in-memory services.
    pub url: String,
}

/// Metadata describing one attachment of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Point geometry in WGS84 (`x` = longitude, `y` = latitude).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A record with its attribute values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feature {
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Point>,
}

/// Operations consumed from the hosted GIS service.
///
/// Implementations are expected to be reliable black boxes: no retries are
/// attempted by callers.
#[async_trait]
pub trait FeatureService: Send + Sync {
    /// Resolve a collection by id. Fails with `Error::NotFound` when the id
    /// does not resolve.
    async fn get_collection(&self, id: &str) -> Result<Collection>;

    /// Object ids of all records in `layer` matching `where_clause`.
    async fn query_object_ids(&self, layer: &Layer, where_clause: &str) -> Result<Vec<i64>>;

    /// Attachments of a single record, in service order.
    async fn list_attachments(&self, layer: &Layer, object_id: i64) -> Result<Vec<AttachmentInfo>>;

    /// Download an attachment into `dest_dir` and return the path of the
    /// downloaded file. The file name is chosen by the implementation and
    /// must not collide with existing files.
    async fn download_attachment(
        &self,
        layer: &Layer,
        object_id: i64,
        attachment: &AttachmentInfo,
        dest_dir: &Path,
    ) -> Result<PathBuf>;

    /// Full records (all fields, WGS84 geometry) matching `where_clause`.
    async fn query_features(&self, layer: &Layer, where_clause: &str) -> Result<Vec<Feature>>;

    /// Set a single attribute on one record.
    async fn update_attribute(
        &self,
        layer: &Layer,
        object_id: i64,
        field: &str,
        value: &str,
    ) -> Result<()>;
}

/// Temp file name for an in-flight download.
#[must_use]
pub fn temp_download_name() -> String {
    format!(".download-{}.part", uuid::Uuid::new_v4().simple())
}
