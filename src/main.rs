//! CLI entry point for feature-mailer.

use clap::{ArgAction, Args, Parser, Subcommand};
use feature_mailer::report::Routing;
use feature_mailer::{
    logging, send_reports, sync_attachments, ErrorMode, PortalOptions, ReportOptions,
    SmtpSecurity, SmtpSettings, SyncConfig,
};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "feature-mailer")]
#[command(about = "Download feature-layer attachments and email per-record reports")]
struct Cli {
    #[command(flatten)]
    portal: PortalArgs,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PortalArgs {
    /// Portal root URL
    #[arg(long, global = true, default_value = "https://www.arcgis.com")]
    portal_url: String,

    /// Portal username (anonymous access when omitted)
    #[arg(long, global = true, env = "PORTAL_USER")]
    portal_user: Option<String>,

    /// Portal password
    #[arg(long, global = true, env = "PORTAL_PASSWORD", hide_env_values = true)]
    portal_password: Option<String>,

    /// Validate the portal's TLS certificate
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    cert_verification: bool,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value = "120")]
    timeout: u64,
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Root directory for downloaded attachments
    #[arg(long, global = true, default_value = "ScriptDownloads")]
    save_attachments_to: PathBuf,

    /// Directory for per-run log files
    #[arg(long, global = true, default_value = "Logging")]
    save_logs_to: PathBuf,

    /// How attachments are laid out: individual-folder or grouped-folder
    #[arg(long, global = true, default_value = "individual-folder")]
    attachment_storage: String,

    /// Per-layer layout override, as LAYER=POLICY (repeatable)
    #[arg(long = "layer-storage", global = true, value_parser = parse_key_val)]
    layer_storage: Vec<(String, String)>,

    /// Whether a failing layer, record or attachment aborts the run
    #[arg(long, global = true, value_enum, default_value_t = ErrorMode::Continue)]
    error_mode: ErrorMode,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download attachments of matching records
    Sync {
        /// Item id of the hosted feature layer
        item: String,

        /// Row filter (where clause); all records when omitted
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Download attachments, then email a report for every unprocessed record
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Item id of the hosted feature layer
    item: String,

    /// Records still to be reported
    #[arg(short, long, default_value = "report_emailed = 'no' OR report_emailed IS NULL")]
    filter: String,

    /// Attribute flagging a record as reported
    #[arg(long, default_value = "report_emailed")]
    processed_field: String,

    /// Sender address
    #[arg(long)]
    from: String,

    /// Default report recipient
    #[arg(long)]
    to: String,

    /// Recipient for records in one of --regions
    #[arg(long)]
    regional_to: Option<String>,

    /// Comma-separated state codes routed to --regional-to
    #[arg(long, value_delimiter = ',', default_value = "CA,WA,OR,BC,AK")]
    regions: Vec<String>,

    /// Do not send a thank-you copy to the submitter
    #[arg(long)]
    no_thanks: bool,

    /// SMTP relay host
    #[arg(long, default_value = "smtp.office365.com")]
    smtp_host: String,

    /// SMTP relay port
    #[arg(long, default_value = "587")]
    smtp_port: u16,

    /// SMTP connection security
    #[arg(long, value_enum, default_value_t = SmtpSecurity::StartTls)]
    smtp_security: SmtpSecurity,

    /// SMTP username (defaults to the sender address)
    #[arg(long, env = "SMTP_USER")]
    smtp_user: Option<String>,

    /// SMTP password
    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LAYER=POLICY, got {s:?}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(&cli.storage.save_logs_to)?;
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let portal = PortalOptions {
        url: cli.portal.portal_url,
        username: cli.portal.portal_user,
        password: cli.portal.portal_password,
        cert_verification: cli.portal.cert_verification,
        timeout: Duration::from_secs(cli.portal.timeout),
    };

    let config = SyncConfig {
        save_attachments_to: cli.storage.save_attachments_to,
        attachment_storage: cli.storage.attachment_storage,
        layer_storage: cli.storage.layer_storage.into_iter().collect::<BTreeMap<_, _>>(),
        error_mode: cli.storage.error_mode,
    };

    let failures = match cli.command {
        Command::Sync { item, filter } => {
            let summary = sync_attachments(&portal, config, &item, filter.as_deref()).await?;
            summary.errored()
        }
        Command::Report(args) => {
            let smtp = SmtpSettings {
                host: args.smtp_host,
                port: args.smtp_port,
                security: args.smtp_security,
                username: args.smtp_user.or_else(|| Some(args.from.clone())),
                password: args.smtp_password,
            };
            let options = ReportOptions {
                collection_id: args.item,
                filter: args.filter,
                processed_field: args.processed_field,
                sender: args.from,
                routing: Routing {
                    default_recipient: args.to,
                    regional_recipient: args.regional_to,
                    regions: args.regions,
                },
                thank_submitter: !args.no_thanks,
                ..ReportOptions::default()
            };
            let summary = send_reports(&portal, &smtp, config, options).await?;
            summary.sync.errored() + summary.failed
        }
    };

    if failures > 0 {
        error!("Finished with {failures} failures");
        return Err(io::Error::other(format!("{failures} failures")));
    }
    Ok(())
}
