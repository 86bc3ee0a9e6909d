//! Host simulator for the sensor node firmware core.
//!
//! Replays long deterministic histories of deep sleeps, power losses, flash
//! damage and modem hiccups against the real reconciliation, session and
//! scheduling code, and checks that uplink counters never repeat.

mod histories;
mod sim;

use clap::Parser;
use colored::Colorize;

use histories::{all_histories, run_history, Stats};
use lora_node_firmware::config::NodeConfig;

#[derive(Parser)]
#[command(name = "node-sim")]
#[command(about = "Boot history simulator for the LoRa node firmware")]
struct Args {
    /// Wake cycles per history
    #[arg(short, long, default_value = "2000")]
    boots: u32,

    /// Only run the named history
    #[arg(long)]
    history: Option<String>,

    /// Uplinks between durable checkpoints
    #[arg(long, default_value = "100")]
    checkpoint: u32,

    /// Resumed boots before a forced rejoin
    #[arg(long, default_value = "300")]
    rejoin: u32,

    /// Margin added to the durable counter at boot (default: checkpoint + 1)
    #[arg(long)]
    margin: Option<u32>,

    /// Print every boot
    #[arg(short, long)]
    verbose: bool,
}

fn print_stats(stats: &Stats) {
    println!(
        "    {} boots, {} uplinks, {} resumes, {} joins ({} failed), {} skipped",
        stats.boots, stats.uplinks, stats.resumes, stats.joins, stats.join_failures, stats.skipped
    );
    println!(
        "    {} power losses, {} corruptions, {} flash writes, {} checkpoint gaps verified, final fcnt {}",
        stats.power_losses, stats.corruptions, stats.durable_writes, stats.checkpoint_gaps, stats.final_counter
    );
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = NodeConfig {
        checkpoint_interval: args.checkpoint,
        rejoin_threshold: args.rejoin,
        rewrite_margin: args.margin.unwrap_or(args.checkpoint + 1),
        ..NodeConfig::default()
    };
    if config.rewrite_margin <= config.checkpoint_interval {
        anyhow::bail!(
            "Margin {} must exceed the checkpoint interval {}",
            config.rewrite_margin,
            config.checkpoint_interval
        );
    }

    println!("{}", "LoRa Node Boot History Simulator".bold());
    println!(
        "Checkpoint every {}, margin {}, rejoin after {}",
        config.checkpoint_interval, config.rewrite_margin, config.rejoin_threshold
    );
    println!();

    let histories: Vec<_> = all_histories()
        .into_iter()
        .filter(|h| args.history.as_deref().map_or(true, |name| name == h.name))
        .collect();
    if histories.is_empty() {
        anyhow::bail!("No history named {:?}", args.history.unwrap_or_default());
    }

    let mut failed = 0;
    for history in &histories {
        println!("  {} ...", history.name);
        match run_history(history, config, args.boots, args.verbose) {
            Ok(stats) => {
                print_stats(&stats);
                println!("  {} {}", "[PASS]".green().bold(), history.name);
            }
            Err(e) => {
                println!("  {} {}", "[FAIL]".red().bold(), history.name);
                println!("         {}", e.to_string().red());
                failed += 1;
            }
        }
    }

    println!("{}", "-".repeat(60));
    println!(
        "  Total: {} passed, {} failed",
        (histories.len() - failed).to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );

    // Exit with error code if any history failed
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
