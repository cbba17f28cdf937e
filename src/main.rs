//! CLI entry point for the climate extractor.

use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result, bail};
use clap::Parser;
use climate_extract::{ClientConfig, ClimateClient, StationId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let loaded = app_config::load_config(args.config.as_deref())?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config verbosity > info
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => loaded
                .config
                .as_ref()
                .and_then(|c| c.verbosity)
                .map_or("info", app_config::VerbositySetting::filter),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, config_path = ?loaded.path, "CLI arguments parsed");

    if args.start > args.end {
        bail!("--start {} is after --end {}", args.start, args.end);
    }

    let mut config = ClientConfig::from_env();
    if let Some(file) = &loaded.config {
        file.apply_to(&mut config);
    }
    if let Some(months) = args.max_span_months {
        config.max_span_months = months;
    }

    let client = ClimateClient::new(config).context("Failed to build API client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let result = run(&client, &args, &cancel).await;

    if args.stats {
        let stats = serde_json::json!({
            "rate_limiter": client.rate_limiter_stats(),
            "pool": client.pool_stats(),
        });
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    client.close();

    result
}

async fn run(client: &ClimateClient, args: &Args, cancel: &CancellationToken) -> Result<()> {
    let station = match (&args.station, args.lat, args.lon) {
        (Some(id), _, _) => StationId::new(id),
        (None, Some(lat), Some(lon)) => client
            .resolve_station(lat, lon, cancel)
            .await
            .context("Failed to load station inventory")?
            .with_context(|| format!("No station found near ({lat}, {lon})"))?,
        _ => bail!("either --station or both --lat and --lon are required"),
    };

    info!(station = %station, start = %args.start, end = %args.end, "Extracting daily records");

    let records = client
        .fetch_range(&station, args.start, args.end, cancel)
        .await
        .with_context(|| format!("Failed to extract records for station {station}"))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for record in &records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    info!(station = %station, records = records.len(), "Extraction complete");
    Ok(())
}
