//! Health and health history commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, CheckResult, HealthReport};
use crate::output::{
    color_percent, color_status, format_bytes, format_timestamp, print_json, print_table,
    print_warning, OutputFormat,
};

/// Row for the health check table
#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Check")]
    check: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Latency")]
    latency: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Row for the history table
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Check")]
    check: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl From<&CheckResult> for CheckRow {
    fn from(result: &CheckResult) -> Self {
        Self {
            check: result.check.clone(),
            status: color_status(&result.status),
            latency: format!("{} ms", result.latency_ms),
            message: result.message.clone(),
        }
    }
}

impl From<&CheckResult> for HistoryRow {
    fn from(result: &CheckResult) -> Self {
        Self {
            time: format_timestamp(&result.timestamp),
            check: result.check.clone(),
            status: color_status(&result.status),
            message: result.message.clone(),
        }
    }
}

/// Show the latest aggregate health
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => print_health(&health),
    }

    Ok(())
}

fn print_health(health: &HealthReport) {
    println!(
        "{} {}",
        "Overall:".bold(),
        color_status(&health.overall)
    );
    if let Some(checked_at) = &health.checked_at {
        println!("Checked at: {}", format_timestamp(checked_at).dimmed());
    }
    if let Some(message) = &health.message {
        print_warning(message);
    }
    println!();

    let rows: Vec<CheckRow> = health.checks.iter().map(CheckRow::from).collect();
    print_table(&rows);

    if let Some(metrics) = &health.metrics {
        println!();
        println!("{}", "Host".bold());
        println!("{}", "-".repeat(50));
        println!(
            "Memory:                 {} of {} ({})",
            format_bytes(metrics.memory_used_bytes),
            format_bytes(metrics.memory_total_bytes),
            color_percent(metrics.memory_used_percent)
        );
        if let Some(disk) = &metrics.disk {
            println!(
                "Disk:                   {} free on {} ({})",
                format_bytes(disk.available_bytes),
                disk.mount,
                color_percent(disk.used_percent)
            );
        }
    }
}

/// Show persisted health results, newest first
pub async fn show_history(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let history = client.history(limit).await?;

    match format {
        OutputFormat::Json => print_json(&history)?,
        OutputFormat::Table => {
            let rows: Vec<HistoryRow> = history.iter().map(HistoryRow::from).collect();
            print_table(&rows);
        }
    }

    Ok(())
}
