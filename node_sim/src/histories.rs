//! Boot histories and the properties checked over them.

use anyhow::{anyhow, ensure, Result};
use colored::Colorize;
use futures::executor::block_on;

use lora_node_firmware::config::storage::{
    DATA_VALID, RECORD_BASE_OFFSET, RECORD_SLOT_STRIDE, REG_DATA_VALID, REG_TRANSMITS_SINCE_JOIN,
};
use lora_node_firmware::config::NodeConfig;
use lora_node_firmware::node::{CycleOutcome, Node};
use lora_node_firmware::session::SessionState;
use lora_node_firmware::storage::RegisterBank;

use crate::sim::{Network, SimFlash, SimMac, SimRegisters};

/// Offset of the uplink counter inside a durable record
const COUNTER_OFFSET: usize = 12;

/// A deterministic fault pattern. `Some(n)` fires on every nth boot.
pub struct History {
    pub name: &'static str,
    pub power_loss_every: Option<u32>,
    pub corrupt_every: Option<u32>,
    pub join_fail_every: Option<u32>,
    pub busy_every: Option<u32>,
    pub overrun_every: Option<u32>,
}

impl History {
    const fn quiet(name: &'static str) -> Self {
        Self {
            name,
            power_loss_every: None,
            corrupt_every: None,
            join_fail_every: None,
            busy_every: None,
            overrun_every: None,
        }
    }
}

pub fn all_histories() -> Vec<History> {
    vec![
        History::quiet("steady"),
        History {
            power_loss_every: Some(37),
            ..History::quiet("cold-loss")
        },
        History {
            corrupt_every: Some(53),
            ..History::quiet("flash-corruption")
        },
        History {
            power_loss_every: Some(41),
            join_fail_every: Some(3),
            ..History::quiet("flaky-join")
        },
        History {
            busy_every: Some(7),
            overrun_every: Some(11),
            ..History::quiet("busy-modem")
        },
        History {
            power_loss_every: Some(37),
            corrupt_every: Some(53),
            join_fail_every: Some(5),
            busy_every: Some(19),
            overrun_every: Some(97),
            ..History::quiet("mixed")
        },
    ]
}

fn every(period: Option<u32>, boot: u32) -> bool {
    period.is_some_and(|n| n > 0 && boot % n == n - 1)
}

/// What a history did.
#[derive(Debug, Default)]
pub struct Stats {
    pub boots: u32,
    pub uplinks: u32,
    pub resumes: u32,
    pub joins: usize,
    pub join_failures: u32,
    pub skipped: u32,
    pub power_losses: u32,
    pub corruptions: u32,
    pub durable_writes: usize,
    /// Checkpoint gaps verified to be exactly one interval
    pub checkpoint_gaps: u32,
    pub final_counter: u32,
}

/// Run `boots` wake cycles under `history`, failing on the first violated property.
pub fn run_history(history: &History, config: NodeConfig, boots: u32, verbose: bool) -> Result<Stats> {
    let mut flash = SimFlash::new();
    let mut regs = SimRegisters::new();
    let mut network = Network::default();
    let mut stats = Stats::default();

    let mut max_effective: Option<u32> = None;
    let mut last_used: Option<u32> = None;
    let mut last_fault: Option<u32> = None;
    let mut last_checkpoint: Option<u32> = None;
    let mut resumed_run = 0u32;
    // One fault per window, so a checkpoint lands between any two faults
    let window = 2 * config.checkpoint_interval;

    for boot in 0..boots {
        let quiet = last_fault.map_or(true, |fault| boot - fault > window);
        let mut faulted = false;
        if quiet && every(history.power_loss_every, boot) {
            regs.power_loss();
            stats.power_losses += 1;
            faulted = true;
        } else if quiet && every(history.corrupt_every, boot) {
            let slot = (stats.corruptions % 2) as usize;
            flash.corrupt(RECORD_BASE_OFFSET as usize + slot * RECORD_SLOT_STRIDE as usize + COUNTER_OFFSET, 2);
            stats.corruptions += 1;
            faulted = true;
        }
        if faulted {
            last_fault = Some(boot);
            last_checkpoint = None;
        }

        let cold = regs.read(REG_DATA_VALID) != DATA_VALID;
        let worn = !cold && regs.read(REG_TRANSMITS_SINCE_JOIN) >= config.rejoin_threshold;
        let writes_before = flash.writes;

        let mut node = Node::boot(flash, regs, config).map_err(|e| anyhow!("boot {}: {:?}", boot, e))?;
        let entry = *node.state();

        if let Some(max) = max_effective {
            ensure!(
                entry.effective_counter >= max,
                "boot {}: counter {} below earlier boot's {}",
                boot,
                entry.effective_counter,
                max
            );
        }
        max_effective = Some(entry.effective_counter);
        if cold {
            ensure!(entry.session == SessionState::NeedsJoin, "boot {}: cold boot resumed", boot);
        }
        if worn {
            ensure!(entry.session == SessionState::NeedsJoin, "boot {}: threshold not enforced", boot);
        }

        let mut mac = SimMac::new(&mut network);
        mac.fail_join = every(history.join_fail_every, boot);
        mac.busy = every(history.busy_every, boot);
        mac.downlink = boot % 25 == 24;
        let elapsed = if every(history.overrun_every, boot) {
            config.tx_interval_secs.saturating_mul(1000).saturating_add(10_000)
        } else {
            2_500
        };

        let outcome = block_on(node.run_cycle(&mut mac, b"Test", || elapsed))
            .map_err(|e| anyhow!("boot {}: cycle failed: {:?}", boot, e))?;
        let used = std::mem::take(&mut mac.uplinks);
        drop(mac);

        for counter in used {
            if let Some(last) = last_used {
                ensure!(counter > last, "boot {}: counter {} sent after {}", boot, counter, last);
            }
            last_used = Some(counter);
        }

        match outcome {
            CycleOutcome::Sleep(sleep) => {
                ensure!(
                    sleep.seconds <= config.tx_interval_secs,
                    "boot {}: sleep {} s exceeds interval",
                    boot,
                    sleep.seconds
                );
                stats.uplinks += 1;
            }
            CycleOutcome::Skipped => stats.skipped += 1,
            CycleOutcome::JoinFailed => stats.join_failures += 1,
        }

        let counter_now = node.state().effective_counter;
        let (f, r) = node.into_parts();
        flash = f;
        regs = r;
        let wrote = flash.writes - writes_before;
        stats.durable_writes += wrote;

        if entry.session == SessionState::ResumingSession {
            stats.resumes += 1;
            resumed_run += 1;
            ensure!(
                resumed_run <= config.rejoin_threshold,
                "boot {}: {} resumes without a join",
                boot,
                resumed_run
            );
        } else {
            resumed_run = 0;
        }

        // Steady resumed operation checkpoints exactly once per interval
        if entry.session == SessionState::ResumingSession && !faulted {
            if wrote > 0 {
                if let Some(previous) = last_checkpoint {
                    ensure!(
                        counter_now - previous == config.checkpoint_interval,
                        "boot {}: checkpoint after {} uplinks",
                        boot,
                        counter_now - previous
                    );
                    stats.checkpoint_gaps += 1;
                }
                last_checkpoint = Some(counter_now);
            }
        } else {
            last_checkpoint = None;
        }

        if verbose {
            println!(
                "    boot {:5}  {:<16} fcnt {:6}  {:?}{}",
                boot,
                format!("{:?}", entry.session),
                entry.effective_counter,
                outcome,
                if wrote > 0 { " [flash]".yellow().to_string() } else { String::new() }
            );
        }
        stats.boots += 1;
        stats.final_counter = counter_now;
    }

    stats.joins = network.joins;
    ensure!(network.replays == 0, "network rejected {} replayed uplinks", network.replays);
    Ok(stats)
}
