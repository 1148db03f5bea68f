//! Shared pieces of the `scooter-scan` binary
//!
//! Argument parsing, configuration loading and target selection live here so
//! they can be tested without a Bluetooth stack.

use anyhow::Context;
use clap::Parser;
use scooter_session::{DiscoveredScooter, SessionConfig, SessionConfigBuilder};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "scooter-scan")]
#[command(about = "Scan for Ninebot/Xiaomi scooters and open a session")]
pub struct Args {
    /// How long to scan before listing scooters, in seconds
    #[arg(long, default_value_t = 10)]
    pub scan_secs: u64,

    /// Connect to the scooter with this name or device id after scanning
    #[arg(long, short)]
    pub connect: Option<String>,

    /// Force encrypted Ninebot framing regardless of the detected model
    #[arg(long)]
    pub force_nb_crypto: bool,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the scan result as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// Scan duration
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }
}

/// Install the global tracing subscriber
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load the configuration file, or defaults when none is given
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfigBuilder::new().build());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    SessionConfig::from_json_str(&json).with_context(|| format!("parsing {}", path.display()))
}

/// Pick the scooter matching `query` by device id, then by name
pub fn select_target(scooters: &[DiscoveredScooter], query: &str) -> Option<DiscoveredScooter> {
    scooters
        .iter()
        .find(|s| s.id.as_str() == query)
        .or_else(|| scooters.iter().find(|s| s.name == query))
        .or_else(|| {
            scooters
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(query))
        })
        .cloned()
}

/// JSON view of a scan result
pub fn scan_report(scooters: &[DiscoveredScooter]) -> serde_json::Value {
    let entries: Vec<_> = scooters
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "name": s.name,
                "model": s.model,
                "rssi": s.rssi,
                "mac": s.mac,
                "last_seen": s.last_seen.to_rfc3339(),
            })
        })
        .collect();
    serde_json::json!({ "scooters": entries })
}

/// One line per scooter for the plain listing
pub fn scan_line(scooter: &DiscoveredScooter) -> String {
    format!(
        "{:<20} {:<18} {:>4} dBm  {}",
        scooter.name,
        scooter.model.display_name(),
        scooter.rssi,
        scooter.mac.as_deref().unwrap_or("-"),
    )
}
