//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{ArgGroup, Parser};

/// Extract daily climate records for a weather station.
///
/// Records are written to stdout as one JSON object per line, oldest first.
/// The API key is read from the `AEMET_API_KEY` environment variable.
#[derive(Parser, Debug)]
#[command(name = "climate-extract")]
#[command(author, version, about)]
#[command(group(ArgGroup::new("target").required(true).args(["station", "lat"])))]
pub struct Args {
    /// Station id (e.g. 5790Y)
    #[arg(short, long, conflicts_with_all = ["lat", "lon"])]
    pub station: Option<String>,

    /// Latitude in decimal degrees; the nearest station is used
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Longitude in decimal degrees (west negative)
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// First day to fetch (YYYY-MM-DD)
    #[arg(long)]
    pub start: NaiveDate,

    /// Last day to fetch, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub end: NaiveDate,

    /// Largest window of a single upstream request, in months (1-120)
    #[arg(short = 'm', long, value_parser = clap::value_parser!(u32).range(1..=120))]
    pub max_span_months: Option<u32>,

    /// Print rate limiter and pool statistics to stderr when done
    #[arg(long)]
    pub stats: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/climate-extract/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
