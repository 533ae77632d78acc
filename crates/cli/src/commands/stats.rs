//! Usage statistics command

use anyhow::Result;
use colored::Colorize;

use crate::client::{ApiClient, UsageSnapshot};
use crate::output::{color_percent, print_json, OutputFormat};

/// Show the current quota and call statistics
pub async fn show_stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats = client.stats().await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => print_stats(&stats),
    }

    Ok(())
}

fn print_stats(stats: &UsageSnapshot) {
    println!("{}", "API Usage".bold());
    println!("{}", "=".repeat(50));

    let cap = stats.current_minute_calls + stats.remaining_calls_this_minute;
    println!(
        "This minute:            {} / {} ({})",
        stats.current_minute_calls,
        cap,
        color_percent(minute_usage_percent(stats))
    );
    println!("Remaining:              {}", stats.remaining_calls_this_minute);
    println!();

    println!("{}", "Last 60 seconds".bold());
    println!("{}", "-".repeat(50));
    println!("Calls:                  {}", stats.calls_in_last_minute);
    println!("Successful:             {}", stats.successful_calls.to_string().green());
    let failed = stats.failed_calls.to_string();
    if stats.failed_calls > 0 {
        println!("Failed:                 {}", failed.red());
    } else {
        println!("Failed:                 {}", failed);
    }
    println!("Avg response time:      {:.0} ms", stats.avg_response_time);
}

fn minute_usage_percent(stats: &UsageSnapshot) -> f64 {
    let cap = stats.current_minute_calls + stats.remaining_calls_this_minute;
    if cap == 0 {
        return 0.0;
    }
    stats.current_minute_calls as f64 / cap as f64 * 100.0
}
