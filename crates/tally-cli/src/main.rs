//! tally: administrative CLI for a running tallyd.
//!
//! Thin by design: every command is one HTTP call against the daemon's
//! control plane. The daemon owns the store; the CLI never touches the
//! database file directly.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tally", about = "Administrative CLI for the tally attendance agent")]
struct Cli {
    /// Base URL of the running daemon.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    daemon: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Station snapshot: identity, totals, connectivity, config echoes.
    Status,
    /// Submit a badge scan.
    Scan {
        /// Raw badge input (numeric id or roster search text).
        badge: String,
    },
    /// Trigger a manual sync cycle and print the summary.
    Sync,
    /// Per-status scan counts.
    Counts,
    /// Reset failed scans to pending.
    ResetFailed,
    /// Purge all scans and re-identify the station (PIN-gated).
    ResetStation {
        #[arg(long)]
        pin: String,
        /// New station name (1–50 chars, `[A-Za-z0-9 _-]`).
        #[arg(long)]
        station: String,
    },
    /// Kick a connectivity probe; the result lands on the signal stream.
    TestConnectivity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let http = reqwest::Client::new();
    let base = cli.daemon.trim_end_matches('/');

    match cli.command {
        Command::Status => {
            let snap = get(&http, &format!("{base}/v1/snapshot")).await?;
            println!("station:      {}", field_str(&snap, "station"));
            println!("connectivity: {}", field_str(&snap, "connectivity"));
            println!(
                "scans:        pending={} synced={} failed={} (today {})",
                snap["counts"]["pending"], snap["counts"]["synced"], snap["counts"]["failed"],
                snap["today_count"],
            );
            println!("roster:       {} entries", snap["roster_count"]);
            println!(
                "cloud:        {} (batch size {})",
                field_str(&snap["config"], "cloud_url"),
                snap["config"]["batch_size"],
            );
        }

        Command::Scan { badge } => {
            let resp = post(
                &http,
                &format!("{base}/v1/scans"),
                Some(serde_json::json!({ "raw": badge })),
            )
            .await?;
            if resp["ok"].as_bool().unwrap_or(false) {
                let mark = if resp["matched"].as_bool().unwrap_or(false) {
                    "matched"
                } else {
                    "unmatched"
                };
                let dup = if resp["is_duplicate"].as_bool().unwrap_or(false) {
                    " (duplicate)"
                } else {
                    ""
                };
                println!(
                    "recorded {} [{}]{}: {} today, {} total",
                    field_str(&resp, "badge_id"),
                    mark,
                    dup,
                    resp["today_count"],
                    resp["total_count"],
                );
            } else if resp["is_duplicate"].as_bool().unwrap_or(false) {
                println!("duplicate suppressed: {}", field_str(&resp, "badge_id"));
            } else {
                bail!("scan rejected: {}", field_str(&resp, "reason"));
            }
        }

        Command::Sync => {
            let summary = post(&http, &format!("{base}/v1/sync/now"), None).await?;
            if summary["skipped"].as_bool().unwrap_or(false) {
                println!("sync skipped: {}", field_str(&summary, "skip_reason"));
            } else {
                println!(
                    "synced={} failed={} batches={} remaining={}",
                    summary["synced"],
                    summary["failed"],
                    summary["batches"],
                    summary["remaining_pending"],
                );
                if summary["auth_failed"].as_bool().unwrap_or(false) {
                    bail!("authentication error; check the cloud credential");
                }
            }
        }

        Command::Counts => {
            let counts = get(&http, &format!("{base}/v1/sync/counts")).await?;
            println!(
                "pending={} synced={} failed={}",
                counts["pending"], counts["synced"], counts["failed"],
            );
        }

        Command::ResetFailed => {
            let resp = post(&http, &format!("{base}/v1/admin/reset-failed"), None).await?;
            println!("reset {} scan(s) to pending", resp["reset"]);
        }

        Command::ResetStation { pin, station } => {
            let resp = post(
                &http,
                &format!("{base}/v1/admin/reset-station"),
                Some(serde_json::json!({ "pin": pin, "new_station": station.as_str() })),
            )
            .await?;
            if resp["ok"].as_bool().unwrap_or(false) {
                println!("station reset to {station}; prior scans purged");
            }
        }

        Command::TestConnectivity => {
            post(&http, &format!("{base}/v1/connectivity/test"), None).await?;
            println!("probe requested; watch the daemon stream for the result");
        }
    }

    Ok(())
}

async fn get(http: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let resp = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url} (is tallyd running?)"))?;
    parse(url, resp).await
}

async fn post(
    http: &reqwest::Client,
    url: &str,
    body: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let mut req = http.post(url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req
        .send()
        .await
        .with_context(|| format!("POST {url} (is tallyd running?)"))?;
    parse(url, resp).await
}

async fn parse(url: &str, resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    let value: serde_json::Value = resp
        .json()
        .await
        .with_context(|| format!("{url}: unparseable response"))?;
    if !status.is_success() {
        bail!(
            "{url}: http {}: {}",
            status.as_u16(),
            value["error"].as_str().unwrap_or("unknown error"),
        );
    }
    Ok(value)
}

fn field_str<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v[key].as_str().unwrap_or("-")
}
