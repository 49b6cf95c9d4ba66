use crate::types::{PercentileSummary, SessionSummary};
use tabled::{Table, builder::Builder, settings::Style};

pub fn render_json(summary: &SessionSummary) -> serde_json::Result<String> {
    serde_json::to_string_pretty(summary)
}

/// Percentile summary followed by every individual result.
pub fn render_table(summary: &SessionSummary) -> String {
    let results = Table::new(summary.test_results.clone())
        .with(Style::psql().remove_horizontals())
        .to_string();

    format!("{}\n\n{results}", percentile_table(&summary.bandwidth))
}

fn percentile_table(bandwidth: &PercentileSummary) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Metric", "p90"]);
    builder.push_record(["Ping (s)".to_string(), format_value(bandwidth.ping)]);
    builder.push_record([
        "Download (Mbps)".to_string(),
        format_value(bandwidth.download_speed_mbps),
    ]);
    builder.push_record([
        "Upload (Mbps)".to_string(),
        format_value(bandwidth.upload_speed_mbps),
    ]);

    builder
        .build()
        .with(Style::psql().remove_horizontals())
        .to_string()
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}
