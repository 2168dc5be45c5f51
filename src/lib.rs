//! Download feature-layer attachments from a hosted GIS service and email
//! per-record reports to stakeholders.

pub mod arcgis;
mod error;
pub mod gis;
pub mod logging;
pub mod mail;
pub mod naming;
pub mod report;
pub mod reporter;
pub mod sync;

pub use arcgis::{ArcGisClient, PortalOptions};
pub use error::{Error, Result};
pub use gis::{AttachmentInfo, Collection, Feature, FeatureService, Layer, Point};
pub use mail::{Mailer, OutgoingMail, SmtpMailer, SmtpSecurity, SmtpSettings};
pub use naming::NamingPolicy;
pub use reporter::{ReportOptions, ReportSummary, Reporter};
pub use sync::{AttachmentSync, ErrorMode, SyncConfig, SyncFailure, SyncSummary};

use std::sync::Arc;

/// Connect to the portal and download attachments of records matching
/// `row_filter`.
pub async fn sync_attachments(
    portal: &PortalOptions,
    config: SyncConfig,
    collection_id: &str,
    row_filter: Option<&str>,
) -> Result<SyncSummary> {
    let client = ArcGisClient::connect(portal).await?;
    AttachmentSync::new(Arc::new(client), config)
        .sync(collection_id, row_filter)
        .await
}

/// Connect to the portal and SMTP relay, then run the reporting pipeline.
pub async fn send_reports(
    portal: &PortalOptions,
    smtp: &SmtpSettings,
    config: SyncConfig,
    options: ReportOptions,
) -> Result<ReportSummary> {
    let client = ArcGisClient::connect(portal).await?;
    let mailer = SmtpMailer::new(smtp)?;
    Reporter::new(Arc::new(client), Arc::new(mailer), config, options)
        .run()
        .await
}
