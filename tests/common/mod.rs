//! Shared test doubles.

#![allow(dead_code)]

pub mod smtp;

use async_trait::async_trait;
use feature_mailer::{
    AttachmentInfo, Collection, Error, Feature, FeatureService, Layer, Mailer, OutgoingMail,
    Point, Result,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A record held by [`FakeService`].
#[derive(Clone)]
pub struct FakeRecord {
    pub object_id: i64,
    pub attributes: Map<String, Value>,
    pub geometry: Option<Point>,
    pub attachments: Vec<(AttachmentInfo, Vec<u8>)>,
}

impl FakeRecord {
    pub fn new(object_id: i64) -> Self {
        let mut attributes = Map::new();
        attributes.insert("objectid".to_string(), Value::from(object_id));
        Self {
            object_id,
            attributes,
            geometry: None,
            attachments: Vec::new(),
        }
    }

    pub fn attachment(mut self, id: i64, name: &str, data: &[u8]) -> Self {
        self.attachments.push((
            AttachmentInfo {
                id,
                name: name.to_string(),
                size: data.len() as u64,
                content_type: None,
            },
            data.to_vec(),
        ));
        self
    }

    /// Attachment whose reported size differs from its content length.
    pub fn sized_attachment(mut self, id: i64, name: &str, size: u64) -> Self {
        self.attachments.push((
            AttachmentInfo {
                id,
                name: name.to_string(),
                size,
                content_type: None,
            },
            vec![0; 16],
        ));
        self
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.geometry = Some(Point { x, y });
        self
    }
}

/// In-memory [`FeatureService`].
///
/// Where clauses mentioning `report_emailed` match records whose
/// `report_emailed` attribute is not `yes`; every other clause matches all.
pub struct FakeService {
    collection: Collection,
    records: Mutex<Vec<Vec<FakeRecord>>>,
    pub queries: Mutex<Vec<String>>,
    pub downloads: AtomicUsize,
    /// (record, attachment) pairs whose download fails.
    pub failing_downloads: Mutex<HashSet<(i64, i64)>>,
    /// Records whose attachment listing fails.
    pub failing_listings: Mutex<HashSet<i64>>,
    /// Paths written by a "concurrent run" while a download is in flight.
    pub racing_targets: Mutex<Vec<PathBuf>>,
    pub updates: Mutex<Vec<(i64, String, String)>>,
}

impl FakeService {
    pub fn new(id: &str) -> Self {
        Self {
            collection: Collection {
                id: id.to_string(),
                title: format!("Collection {id}"),
                layers: Vec::new(),
            },
            records: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            downloads: AtomicUsize::new(0),
            failing_downloads: Mutex::new(HashSet::new()),
            failing_listings: Mutex::new(HashSet::new()),
            racing_targets: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn layer(mut self, name: &str, supports_attachments: bool, records: Vec<FakeRecord>) -> Self {
        let index = self.collection.layers.len();
        self.collection.layers.push(Layer {
            index,
            id: index as i64,
            name: name.to_string(),
            supports_attachments,
            object_id_field: "objectid".to_string(),
            url: String::new(),
        });
        self.records.get_mut().unwrap().push(records);
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn matching(&self, layer: &Layer, where_clause: &str) -> Vec<FakeRecord> {
        self.queries.lock().unwrap().push(where_clause.to_string());
        let records = self.records.lock().unwrap();
        records[layer.index]
            .iter()
            .filter(|r| {
                !where_clause.contains("report_emailed")
                    || r.attributes.get("report_emailed") != Some(&Value::from("yes"))
            })
            .cloned()
            .collect()
    }

    fn record(&self, layer: &Layer, object_id: i64) -> Option<FakeRecord> {
        self.records.lock().unwrap()[layer.index]
            .iter()
            .find(|r| r.object_id == object_id)
            .cloned()
    }
}

#[async_trait]
impl FeatureService for FakeService {
    async fn get_collection(&self, id: &str) -> Result<Collection> {
        if id == self.collection.id {
            Ok(self.collection.clone())
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }

    async fn query_object_ids(&self, layer: &Layer, where_clause: &str) -> Result<Vec<i64>> {
        Ok(self
            .matching(layer, where_clause)
            .iter()
            .map(|r| r.object_id)
            .collect())
    }

    async fn list_attachments(&self, layer: &Layer, object_id: i64) -> Result<Vec<AttachmentInfo>> {
        if self.failing_listings.lock().unwrap().contains(&object_id) {
            return Err(Error::Http("connection reset".to_string()));
        }
        Ok(self
            .record(layer, object_id)
            .map(|r| r.attachments.into_iter().map(|(info, _)| info).collect())
            .unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        layer: &Layer,
        object_id: i64,
        attachment: &AttachmentInfo,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        if self
            .failing_downloads
            .lock()
            .unwrap()
            .contains(&(object_id, attachment.id))
        {
            return Err(Error::Http("download interrupted".to_string()));
        }

        let data = self
            .record(layer, object_id)
            .and_then(|r| {
                r.attachments
                    .into_iter()
                    .find(|(info, _)| info.id == attachment.id)
            })
            .map(|(_, data)| data)
            .ok_or_else(|| Error::NotFound(format!("attachment {}", attachment.id)))?;

        let racing: Vec<PathBuf> = self.racing_targets.lock().unwrap().drain(..).collect();
        for path in racing {
            tokio::fs::write(path, b"written by another run").await?;
        }

        let temp = dest_dir.join(feature_mailer::gis::temp_download_name());
        tokio::fs::write(&temp, data).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(temp)
    }

    async fn query_features(&self, layer: &Layer, where_clause: &str) -> Result<Vec<Feature>> {
        Ok(self
            .matching(layer, where_clause)
            .into_iter()
            .map(|r| Feature {
                attributes: r.attributes,
                geometry: r.geometry,
            })
            .collect())
    }

    async fn update_attribute(
        &self,
        layer: &Layer,
        object_id: i64,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records[layer.index]
            .iter_mut()
            .find(|r| r.object_id == object_id)
            .ok_or_else(|| Error::NotFound(format!("record {object_id}")))?;
        record
            .attributes
            .insert(field.to_string(), Value::from(value));
        self.updates
            .lock()
            .unwrap()
            .push((object_id, field.to_string(), value.to_string()));
        Ok(())
    }
}

/// [`Mailer`] that keeps every message instead of sending it.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutgoingMail>>,
    /// Recipients that cause `send` to fail.
    pub rejecting: Mutex<HashSet<String>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        if self.rejecting.lock().unwrap().contains(&mail.to) {
            return Err(Error::Mail(format!("550 mailbox unavailable: {}", mail.to)));
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}
