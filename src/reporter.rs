//! Emails a report for every unprocessed record and flags it as processed.

use crate::error::{Error, Result};
use crate::gis::{Feature, FeatureService, Layer};
use crate::mail::{Mailer, OutgoingMail};
use crate::naming::{combine_filter, NamingPolicy};
use crate::report::{Report, Routing, THANK_YOU_SUBJECT};
use crate::sync::{AttachmentSync, SyncConfig, SyncSummary};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Options for a reporting run.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub collection_id: String,
    /// Records to report on; also limits which attachments are synced.
    pub filter: String,
    /// Attribute set once a record's report has been sent.
    pub processed_field: String,
    pub processed_value: String,
    /// Sender address of every outgoing message.
    pub sender: String,
    pub routing: Routing,
    /// Also send a copy of the report back to the submitter.
    pub thank_submitter: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            collection_id: String::new(),
            filter: "report_emailed = 'no' OR report_emailed IS NULL".to_string(),
            processed_field: "report_emailed".to_string(),
            processed_value: "yes".to_string(),
            sender: String::new(),
            routing: Routing::default(),
            thank_submitter: true,
        }
    }
}

/// Outcome of a reporting run.
#[derive(Debug, Clone, Default)]
pub struct ReportSummary {
    pub sync: SyncSummary,
    pub sent: usize,
    pub failed: usize,
}

/// Attachment sync followed by one email per matching record.
pub struct Reporter {
    service: Arc<dyn FeatureService>,
    mailer: Arc<dyn Mailer>,
    sync: AttachmentSync,
    options: ReportOptions,
}

impl Reporter {
    #[must_use]
    pub fn new(
        service: Arc<dyn FeatureService>,
        mailer: Arc<dyn Mailer>,
        sync_config: SyncConfig,
        options: ReportOptions,
    ) -> Self {
        Self {
            sync: AttachmentSync::new(Arc::clone(&service), sync_config),
            service,
            mailer,
            options,
        }
    }

    pub async fn run(&self) -> Result<ReportSummary> {
        let mut summary = ReportSummary {
            sync: self
                .sync
                .sync(&self.options.collection_id, Some(&self.options.filter))
                .await?,
            ..ReportSummary::default()
        };

        let collection = self
            .service
            .get_collection(&self.options.collection_id)
            .await?;
        let Some(layer) = collection.layers.first() else {
            info!("Collection {:?} has no layers, nothing to report", collection.title);
            return Ok(summary);
        };

        let policy = self.sync.config().policy_for(&layer.name)?;
        let folder = self.sync.config().layer_folder(layer);
        let features = self
            .service
            .query_features(layer, &combine_filter(Some(&self.options.filter)))
            .await?;

        if features.is_empty() {
            info!("No new reports created");
            return Ok(summary);
        }

        info!("Sending reports for {} records", features.len());
        for feature in &features {
            match self.report_feature(layer, policy, &folder, feature).await {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    error!("Failed to report record: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Summary: {} reports sent, {} failed",
            summary.sent, summary.failed
        );
        Ok(summary)
    }

    async fn report_feature(
        &self,
        layer: &Layer,
        policy: NamingPolicy,
        folder: &Path,
        feature: &Feature,
    ) -> Result<()> {
        let report = Report::from_feature(feature, &layer.object_id_field);
        let object_id = report
            .object_id
            .ok_or_else(|| Error::Parse(format!("record has no {}", layer.object_id_field)))?;
        let attachments = policy.record_files(folder, object_id).await?;
        let recipient = self.options.routing.recipient_for(&report);

        self.mailer
            .send(&OutgoingMail {
                from: self.options.sender.clone(),
                to: recipient.to_string(),
                subject: report.subject(),
                body: report.stakeholder_body(),
                attachments: attachments.clone(),
            })
            .await?;

        self.service
            .update_attribute(
                layer,
                object_id,
                &self.options.processed_field,
                &self.options.processed_value,
            )
            .await?;
        info!(
            "Report for record {object_id} sent to {recipient} with {} attachments",
            attachments.len()
        );

        if self.options.thank_submitter && !report.email.is_empty() {
            let thanks = OutgoingMail {
                from: self.options.sender.clone(),
                to: report.email.clone(),
                subject: THANK_YOU_SUBJECT.to_string(),
                body: report.thank_you_body(),
                attachments,
            };
            // The record is already flagged, so a failed thank-you is not retried.
            if let Err(e) = self.mailer.send(&thanks).await {
                warn!("Could not thank submitter of record {object_id}: {e}");
            }
        }

        Ok(())
    }
}
