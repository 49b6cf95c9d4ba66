use anyhow::{Context, Result, bail};
use bandwidth_probe::{
    metadata::MetadataClient,
    orchestrator::{SessionOutcome, TestOrchestrator},
    report,
    sampler::BandwidthSampler,
    settings::Settings,
    types::ConnectionMetadata,
    urls::{UrlProvider, new_test_id},
};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Parser, Debug)]
#[command(
    name = "bandwidth-probe",
    about = "Measure bandwidth and latency against HTTP speed-test endpoints",
    version,
    author,
    after_help = r#"Configuration:
    Configuration can be provided via:
    1. Environment variables with SPEEDTEST__ prefix (e.g., SPEEDTEST__ENDPOINT__BASE_URL)
    2. .env file in the current directory
    3. Config file with -c option

Examples:
    # Run the default plan and print the summary as JSON
    bandwidth-probe

    # Run against a self-hosted endpoint and print tables
    SPEEDTEST__ENDPOINT__BASE_URL=http://10.0.0.5:8080 bandwidth-probe --output table"#
)]
struct Cli {
    /// Path to the configuration file (TOML format)
    ///
    /// If not provided, will attempt to load from environment variables
    #[clap(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Format of the final summary written to stdout
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    /// Do not query the metadata endpoint before probing
    #[arg(long)]
    skip_metadata: bool,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = if let Some(config_path) = &self.config {
            Settings::from_path(config_path)?
        } else {
            Settings::from_env()?
        };
        init_logging(&settings.log_level)?;

        if let Some(metrics) = &settings.metrics {
            PrometheusBuilder::new()
                .with_http_listener(metrics.addr)
                .install()
                .context("Failed to install prometheus exporter")?;
        }

        let urls = UrlProvider::new(&settings.endpoint.base_url)?;
        let sampler = BandwidthSampler::new(&settings.http)?;
        let plan = settings.test_plan()?;

        let metadata = if self.skip_metadata {
            ConnectionMetadata::default()
        } else {
            MetadataClient::new(sampler.client().clone(), urls.metadata_url()?)
                .fetch()
                .await
                .context("Failed to fetch connection metadata")?
        };

        let cancel = shutdown_listener()?;
        let total = plan.total_iterations();
        let mut session =
            TestOrchestrator::new(sampler, urls, plan, new_test_id()).start(metadata, cancel);

        while let Some(summary) = session.next_summary().await {
            info!(
                completed = summary.test_results.len(),
                total,
                ping_p90 = summary.bandwidth.ping,
                download_p90_mbps = summary.bandwidth.download_speed_mbps,
                upload_p90_mbps = summary.bandwidth.upload_speed_mbps,
                "measuring"
            );
        }

        match session.finish().await? {
            SessionOutcome::Completed(summary) => {
                self.print(&summary)?;
                Ok(())
            }
            SessionOutcome::Aborted { last, error } => {
                if let Some(summary) = &last {
                    warn!("printing partial results");
                    self.print(summary)?;
                }
                bail!("measurement aborted: {error}")
            }
        }
    }

    fn print(&self, summary: &bandwidth_probe::types::SessionSummary) -> Result<()> {
        let rendered = match self.output {
            OutputFormat::Json => report::render_json(summary)?,
            OutputFormat::Table => report::render_table(summary),
        };
        println!("{rendered}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}

fn init_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn shutdown_listener() -> Result<CancellationToken> {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("sigterm listener failed")?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    Ok(cancellation_token)
}
