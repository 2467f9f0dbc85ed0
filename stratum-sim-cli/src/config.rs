//! CLI flags and the `ScenarioConfig` they build, following the teacher's
//! `pool/src/config.rs` pattern of `#[derive(Deserialize, Clone, Debug)]`
//! structs with `#[serde(default = ...)]` fields, so a scenario can also be
//! loaded from a TOML file (needed by the latency-sweep scenario).

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// `--v1` / `--v2v1` / the implicit default of "v2 direct" (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolMode {
    /// Miners and pool both speak Stratum V1.
    V1,
    /// Miners and pool both speak Stratum V2 (the default).
    V2,
    /// Miners speak V2, a translating proxy bridges to a V1 pool.
    V2v1,
}

impl Default for ProtocolMode {
    fn default() -> Self {
        ProtocolMode::V2
    }
}

/// One `--miners <count>@<speed_ghps>` group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinerGroup {
    pub count: u32,
    pub speed_ghps: f64,
}

impl std::str::FromStr for MinerGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, speed) = s
            .split_once('@')
            .ok_or_else(|| format!("expected <count>@<speed_ghps>, got '{s}'"))?;
        let count: u32 = count
            .parse()
            .map_err(|_| format!("invalid miner count '{count}'"))?;
        let speed_ghps: f64 = speed
            .parse()
            .map_err(|_| format!("invalid speed_ghps '{speed}'"))?;
        Ok(MinerGroup { count, speed_ghps })
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "stratum-sim",
    version,
    author,
    about = "Discrete-event simulator for the Stratum V1/V2/proxy mining-pool protocol family",
    long_about = None
)]
pub struct Cli {
    /// Use the live (unpaused) tokio clock instead of the virtual one.
    #[arg(long, default_value_t = false)]
    pub realtime: bool,

    /// Wall/virtual time ratio under `--realtime` (0.5 = 2x real time).
    #[arg(long, default_value_t = 1.0)]
    pub rt_factor: f64,

    /// Simulation end, in virtual seconds.
    #[arg(long, default_value_t = 500)]
    pub limit: u64,

    /// Subscribe an event-bus logger that re-emits every record through
    /// `tracing`.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Mean link latency, in seconds.
    #[arg(long, default_value_t = 0.01)]
    pub latency: f64,

    /// Disable exponential/normal sampling: every randomized delay uses
    /// its mean deterministically.
    #[arg(long, default_value_t = false)]
    pub no_luck: bool,

    /// Protocol configuration. Defaults to direct V2.
    #[arg(long, value_enum, default_value_t = ProtocolMode::V2)]
    pub protocol: ProtocolMode,

    /// Emit a CSV line: accepted_shares, accepted_submits, stale_shares,
    /// stale_submits, rejected_submits.
    #[arg(long, default_value_t = false)]
    pub plain_output: bool,

    /// Also write the `--plain-output` CSV line to this file (appending),
    /// for batch/sweep runs.
    #[arg(long)]
    pub csv_path: Option<std::path::PathBuf>,

    /// One or more `<count>@<speed_ghps>` miner groups. Repeatable.
    /// Defaults to a single miner at 1e6 Gh/s if omitted.
    #[arg(long = "miners", value_name = "COUNT@SPEED_GHPS")]
    pub miners: Vec<MinerGroup>,

    /// RNG seed for link latency, block arrival, and share discovery.
    #[arg(long, default_value_t = 123)]
    pub seed: u64,

    /// Load a `ScenarioConfig` from a TOML/JSON file instead of flags
    /// (scenario 5's latency sweep drives the binary this way).
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}

/// Fully resolved scenario parameters, independent of how they were
/// supplied (flags or a config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub realtime: bool,
    #[serde(default = "default_rt_factor")]
    pub rt_factor: f64,
    #[serde(default = "default_limit")]
    pub limit_secs: u64,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_latency")]
    pub latency_secs: f64,
    #[serde(default)]
    pub no_luck: bool,
    #[serde(default)]
    pub protocol: ProtocolMode,
    #[serde(default)]
    pub plain_output: bool,
    #[serde(default)]
    pub csv_path: Option<std::path::PathBuf>,
    #[serde(default = "default_miners")]
    pub miners: Vec<MinerGroup>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_rt_factor() -> f64 {
    1.0
}
fn default_limit() -> u64 {
    500
}
fn default_latency() -> f64 {
    0.01
}
fn default_seed() -> u64 {
    123
}
fn default_miners() -> Vec<MinerGroup> {
    vec![MinerGroup {
        count: 1,
        speed_ghps: 1_000_000.0,
    }]
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            rt_factor: default_rt_factor(),
            limit_secs: default_limit(),
            verbose: false,
            latency_secs: default_latency(),
            no_luck: false,
            protocol: ProtocolMode::default(),
            plain_output: false,
            csv_path: None,
            miners: default_miners(),
            seed: default_seed(),
        }
    }
}

impl ScenarioConfig {
    pub fn mean_latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency_secs.max(0.0))
    }

    pub fn simulate_luck(&self) -> bool {
        !self.no_luck
    }

    /// Loads from `path` (JSON; the sweep script in scenario 5 generates
    /// one file per latency point) and falls back to the CLI flags'
    /// values for anything the file omits via `#[serde(default)]`.
    pub fn load_from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }
}

impl From<Cli> for ScenarioConfig {
    fn from(cli: Cli) -> Self {
        let miners = if cli.miners.is_empty() {
            default_miners()
        } else {
            cli.miners
        };
        Self {
            realtime: cli.realtime,
            rt_factor: cli.rt_factor,
            limit_secs: cli.limit,
            verbose: cli.verbose,
            latency_secs: cli.latency,
            no_luck: cli.no_luck,
            protocol: cli.protocol,
            plain_output: cli.plain_output,
            csv_path: cli.csv_path,
            miners,
            seed: cli.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_group_parses_count_at_speed() {
        let group: MinerGroup = "10000@1e6".parse().unwrap();
        assert_eq!(group.count, 10000);
        assert_eq!(group.speed_ghps, 1e6);
    }

    #[test]
    fn miner_group_rejects_missing_separator() {
        assert!("10000".parse::<MinerGroup>().is_err());
    }

    #[test]
    fn default_scenario_config_matches_spec_defaults() {
        let config = ScenarioConfig::default();
        assert_eq!(config.limit_secs, 500);
        assert_eq!(config.rt_factor, 1.0);
        assert!((config.latency_secs - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.protocol, ProtocolMode::V2);
    }
}
