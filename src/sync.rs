//! Attachment synchronization from a feature service to a local folder tree.
//!
//! A file existing at its computed path is the only record that an attachment
//! was already downloaded. Downloads land in a temp file inside the target
//! directory and are published with an exclusive hard link, so an existing
//! target is never overwritten, even by a concurrent run.

use crate::error::{Error, Result};
use crate::gis::{AttachmentInfo, FeatureService, Layer};
use crate::naming::{combine_filter, layer_folder_name, NamingPolicy};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How errors affecting a single layer, record or attachment are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ErrorMode {
    /// Record the failure and continue with the next unit of work.
    #[default]
    Continue,
    /// Abort the whole sync on the first failure.
    FailFast,
}

/// Configuration for a sync run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root directory for downloaded attachments.
    pub save_attachments_to: PathBuf,
    /// Default naming policy, as configured (`individual-folder` or `grouped-folder`).
    pub attachment_storage: String,
    /// Per-layer naming policy overrides keyed by layer name.
    pub layer_storage: BTreeMap<String, String>,
    pub error_mode: ErrorMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_attachments_to: PathBuf::from("ScriptDownloads"),
            attachment_storage: NamingPolicy::default().to_string(),
            layer_storage: BTreeMap::new(),
            error_mode: ErrorMode::default(),
        }
    }
}

impl SyncConfig {
    /// Parse every configured policy once. Under [`ErrorMode::FailFast`] the
    /// first invalid value is returned as an error; otherwise invalid values
    /// are kept and reported against the layers that use them.
    fn resolve_policies(&self) -> Result<ResolvedPolicies> {
        let parse = |raw: &str| -> std::result::Result<NamingPolicy, String> {
            raw.parse::<NamingPolicy>().map_err(|e| e.to_string())
        };

        let resolved = ResolvedPolicies {
            default: parse(&self.attachment_storage),
            overrides: self
                .layer_storage
                .iter()
                .map(|(layer, raw)| (layer.clone(), parse(raw)))
                .collect(),
        };

        if self.error_mode == ErrorMode::FailFast {
            if let Err(msg) = &resolved.default {
                return Err(Error::Config(msg.clone()));
            }
            if let Some((layer, Err(msg))) = resolved.overrides.iter().find(|(_, p)| p.is_err()) {
                return Err(Error::Config(format!("layer {layer:?}: {msg}")));
            }
        }

        Ok(resolved)
    }

    /// Naming policy that applies to `layer_name`.
    pub fn policy_for(&self, layer_name: &str) -> Result<NamingPolicy> {
        self.layer_storage
            .get(layer_name)
            .unwrap_or(&self.attachment_storage)
            .parse()
    }

    /// Download directory of a layer.
    #[must_use]
    pub fn layer_folder(&self, layer: &Layer) -> PathBuf {
        self.save_attachments_to
            .join(layer_folder_name(layer.index, &layer.name))
    }
}

struct ResolvedPolicies {
    default: std::result::Result<NamingPolicy, String>,
    overrides: BTreeMap<String, std::result::Result<NamingPolicy, String>>,
}

impl ResolvedPolicies {
    fn for_layer(&self, layer_name: &str) -> std::result::Result<NamingPolicy, String> {
        self.overrides
            .get(layer_name)
            .unwrap_or(&self.default)
            .clone()
    }
}

/// One failed unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub layer: String,
    pub record_id: Option<i64>,
    pub attachment_id: Option<i64>,
    pub message: String,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {:?}", self.layer)?;
        if let Some(record_id) = self.record_id {
            write!(f, ", record {record_id}")?;
        }
        if let Some(attachment_id) = self.attachment_id {
            write!(f, ", attachment {attachment_id}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Aggregate counts of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes_downloaded: u64,
    pub records_without_attachments: usize,
    pub layers_without_attachments: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncSummary {
    #[must_use]
    pub fn errored(&self) -> usize {
        self.failures.len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn log(&self) {
        info!(
            "Summary: {} new files have been downloaded totalling {:.2}MB in size",
            self.downloaded,
            self.bytes_downloaded as f64 / 1_000_000.0
        );
        info!(
            "Summary: {} attachments already existed so were not downloaded again",
            self.skipped
        );
        if self.records_without_attachments > 0 {
            info!(
                "Summary: {} records do not contain attachments",
                self.records_without_attachments
            );
        }
        if !self.failures.is_empty() {
            warn!("Summary: {} failures", self.failures.len());
            for failure in &self.failures {
                warn!("  {failure}");
            }
        }
    }
}

/// What happened to a single attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The downloaded file now lives at the target path.
    Published,
    /// The target appeared while downloading; the download was discarded.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachmentOutcome {
    Skipped,
    Downloaded(PublishOutcome),
}

/// Downloads attachments of records matching a filter.
pub struct AttachmentSync {
    service: Arc<dyn FeatureService>,
    config: SyncConfig,
}

impl AttachmentSync {
    #[must_use]
    pub fn new(service: Arc<dyn FeatureService>, config: SyncConfig) -> Self {
        Self { service, config }
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Download every attachment of every record matching `row_filter` that
    /// is not already present locally.
    ///
    /// Zero matching records or attachments yields zero counts, not an error.
    /// An unresolvable collection id fails with [`Error::NotFound`].
    pub async fn sync(&self, collection_id: &str, row_filter: Option<&str>) -> Result<SyncSummary> {
        let policies = self.config.resolve_policies()?;
        let collection = self.service.get_collection(collection_id).await?;
        let where_clause = combine_filter(row_filter);

        info!(
            "Iterating through {} layers in {:?}",
            collection.layers.len(),
            collection.title
        );

        let mut summary = SyncSummary::default();
        for layer in &collection.layers {
            if !layer.supports_attachments {
                info!("Layer {} does not have attachments enabled", layer.name);
                summary.layers_without_attachments += 1;
                continue;
            }

            let policy = match policies.for_layer(&layer.name) {
                Ok(policy) => policy,
                Err(msg) => {
                    self.fail(&mut summary, layer, None, None, Error::Config(msg))?;
                    continue;
                }
            };

            self.sync_layer(layer, policy, &where_clause, &mut summary)
                .await?;
        }

        summary.log();
        Ok(summary)
    }

    async fn sync_layer(
        &self,
        layer: &Layer,
        policy: NamingPolicy,
        where_clause: &str,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let folder = self.config.layer_folder(layer);

        let object_ids = match self.service.query_object_ids(layer, where_clause).await {
            Ok(ids) => ids,
            Err(e) => return self.fail(summary, layer, None, None, e),
        };

        info!(
            "Looping through attachments of {} records in layer {}, storing in {} ({policy})",
            object_ids.len(),
            layer.name,
            folder.display()
        );

        let mut empty = 0;
        for object_id in object_ids {
            let attachments = match self.service.list_attachments(layer, object_id).await {
                Ok(attachments) => attachments,
                Err(e) => {
                    self.fail(summary, layer, Some(object_id), None, e)?;
                    continue;
                }
            };

            if attachments.is_empty() {
                empty += 1;
                continue;
            }

            for attachment in &attachments {
                let target =
                    policy.compute_path(&folder, object_id, attachment.id, &attachment.name);
                match self
                    .sync_attachment(layer, object_id, attachment, &target)
                    .await
                {
                    Ok(AttachmentOutcome::Skipped) => summary.skipped += 1,
                    Ok(AttachmentOutcome::Downloaded(_)) => {
                        summary.downloaded += 1;
                        summary.bytes_downloaded += attachment.size;
                    }
                    Err(e) => {
                        self.fail(summary, layer, Some(object_id), Some(attachment.id), e)?;
                    }
                }
            }
        }

        if empty > 0 {
            info!("{empty} records in layer {} do not contain attachments", layer.name);
        }
        summary.records_without_attachments += empty;
        Ok(())
    }

    async fn sync_attachment(
        &self,
        layer: &Layer,
        object_id: i64,
        attachment: &AttachmentInfo,
        target: &Path,
    ) -> Result<AttachmentOutcome> {
        if exists(target).await {
            debug!("File {} already exists. Not downloading again", target.display());
            return Ok(AttachmentOutcome::Skipped);
        }

        let dir = target
            .parent()
            .ok_or_else(|| Error::Config(format!("no parent directory for {}", target.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        debug!(
            "Downloading {} ({:.3}MB) to {}",
            attachment.name,
            bytes_to_mb(attachment.size),
            target.display()
        );
        let temp = self
            .service
            .download_attachment(layer, object_id, attachment, dir)
            .await?;

        publish(&temp, target)
            .await
            .map(AttachmentOutcome::Downloaded)
    }

    fn fail(
        &self,
        summary: &mut SyncSummary,
        layer: &Layer,
        record_id: Option<i64>,
        attachment_id: Option<i64>,
        err: Error,
    ) -> Result<()> {
        let failure = SyncFailure {
            layer: layer.name.clone(),
            record_id,
            attachment_id,
            message: err.to_string(),
        };
        error!("{failure}");

        match self.config.error_mode {
            ErrorMode::FailFast => Err(err),
            ErrorMode::Continue => {
                summary.failures.push(failure);
                Ok(())
            }
        }
    }
}

/// Move a downloaded temp file to `target` without ever overwriting it.
///
/// If `target` already exists the temp file is removed instead.
pub async fn publish(temp: &Path, target: &Path) -> Result<PublishOutcome> {
    match tokio::fs::hard_link(temp, target).await {
        Ok(()) => {
            tokio::fs::remove_file(temp).await?;
            Ok(PublishOutcome::Published)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(
                "Not able to rename {} as {} because file already exists. Removing {}",
                temp.display(),
                target.display(),
                temp.display()
            );
            tokio::fs::remove_file(temp).await?;
            Ok(PublishOutcome::Discarded)
        }
        Err(e) => {
            // Filesystems without hard links: check-then-rename.
            debug!("hard link to {} failed ({e}), renaming instead", target.display());
            if exists(target).await {
                tokio::fs::remove_file(temp).await?;
                Ok(PublishOutcome::Discarded)
            } else {
                tokio::fs::rename(temp, target).await?;
                Ok(PublishOutcome::Published)
            }
        }
    }
}

/// Any entry at `path` counts, including directories and dangling links.
async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

#[allow(clippy::cast_precision_loss)]
fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1_000_000.0
}
