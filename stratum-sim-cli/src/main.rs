//! `stratum-sim`: runs one pool/miner simulation scenario and reports its
//! aggregate counters, either as a human-readable summary or (with
//! `--plain-output`) a CSV line suitable for scripting the latency sweep
//! in spec §8's scenario 5.

use clap::Parser;

use stratum_sim_cli::config::{Cli, ScenarioConfig};
use stratum_sim_cli::scenario;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ScenarioConfig::load_from_file(path)?,
        None => ScenarioConfig::from(cli),
    };

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .with_thread_ids(false)
        .init();

    if !config.realtime {
        tokio::time::pause();
    }

    tracing::info!(
        protocol = ?config.protocol,
        limit_secs = config.limit_secs,
        miners = config.miners.len(),
        seed = config.seed,
        "starting scenario"
    );

    let snapshot = scenario::run(&config).await?;

    if config.plain_output {
        let line = format!(
            "{},{},{},{},{}",
            snapshot.accepted_shares,
            snapshot.accepted_submits,
            snapshot.stale_shares,
            snapshot.stale_submits,
            snapshot.rejected_submits,
        );
        println!("{line}");
        if let Some(path) = &config.csv_path {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{line}")?;
        }
    } else {
        println!("accepted_shares:   {:.2}", snapshot.accepted_shares);
        println!("accepted_submits:  {}", snapshot.accepted_submits);
        println!("stale_shares:      {:.2}", snapshot.stale_shares);
        println!("stale_submits:     {}", snapshot.stale_submits);
        println!("rejected_submits:  {}", snapshot.rejected_submits);
    }

    Ok(())
}
