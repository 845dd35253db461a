// SPDX-License-Identifier: AGPL-3.0-only

//! `pexfab`: diagnostics for PCIe bridge fabrics.
//!
//! ```text
//! USAGE:
//!   pexfab topology                      Dump the discovered bridge tree
//!   pexfab info <leaf-addr>              Per-hop link parameters above a leaf
//!   pexfab aspm <leaf-addr> [state]      Show or set ASPM on the leaf's link
//!   pexfab errors <leaf-addr>            Error counts at every hop
//!   pexfab aer <leaf-addr> [--clear]     AER snapshots at every hop
//!   pexfab watch <leaf-addr>             Run the collector and print counts
//!   pexfab roundtrip <leaf-addr> [what]  Save, then restore, link settings
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pexfab_driver::prelude::*;
use pexfab_driver::{LeafDevice, PortSelect as Select};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pexfab", about = "PCIe bridge fabric diagnostics", version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Alternate sysfs root (defaults to PEXFAB_SYSFS_ROOT or /sys).
    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the discovered bridge tree.
    Topology,
    /// Print link parameters at every hop above a leaf.
    Info {
        /// Leaf PCIe address (e.g. 0000:01:00.0).
        leaf: String,
    },
    /// Show or set ASPM on the link directly above a leaf.
    Aspm {
        /// Leaf PCIe address.
        leaf: String,
        /// New state: off, l0s, l1, l0s+l1.
        state: Option<String>,
        /// Ignore capability clamping.
        #[arg(long)]
        force: bool,
    },
    /// Print error counts at every hop above a leaf.
    Errors {
        /// Leaf PCIe address.
        leaf: String,
        /// combined, hw or flags.
        #[arg(long, default_value = "combined")]
        source: String,
    },
    /// Print AER snapshots at every hop above a leaf.
    Aer {
        /// Leaf PCIe address.
        leaf: String,
        /// Empty the logs after printing.
        #[arg(long)]
        clear: bool,
    },
    /// Start the collector and print counts periodically.
    Watch {
        /// Leaf PCIe address.
        leaf: String,
        /// Print interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Number of prints (0 = forever).
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
    /// Save link settings above a leaf and restore them immediately.
    Roundtrip {
        /// Leaf PCIe address.
        leaf: String,
        /// Comma-separated: speed, aspm, l1ss, width, dpc, all.
        #[arg(default_value = "all")]
        what: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let mut config = ManagerConfig::from_env().context("Invalid PEXFAB_* environment")?;
    if let Some(root) = cli.sysfs_root {
        config.sysfs_root = root;
    }
    let manager = Manager::linux(config);
    let topology = manager.find_devices().context("Fabric discovery failed")?;
    tracing::info!(
        devices = topology.devices().len(),
        leaves = topology.leaves().len(),
        "Fabric discovered"
    );

    match cli.command {
        Cmd::Topology => cmd_topology(&manager)?,
        Cmd::Info { leaf } => cmd_info(&manager, &leaf)?,
        Cmd::Aspm { leaf, state, force } => cmd_aspm(&manager, &leaf, state.as_deref(), force)?,
        Cmd::Errors { leaf, source } => cmd_errors(&manager, &leaf, &source)?,
        Cmd::Aer { leaf, clear } => cmd_aer(&manager, &leaf, clear)?,
        Cmd::Watch { leaf, interval_ms, count } => cmd_watch(&manager, &leaf, interval_ms, count)?,
        Cmd::Roundtrip { leaf, what } => cmd_roundtrip(&manager, &leaf, &what)?,
    }

    Ok(())
}

fn find_leaf<'a>(manager: &'a Manager, addr: &str) -> Result<&'a LeafDevice> {
    let addr: PciAddress = addr.parse().with_context(|| format!("Bad address {addr}"))?;
    let topology = manager.topology()?;
    let id = manager.leaf_id(addr).with_context(|| format!("{addr} is not a discovered leaf"))?;
    Ok(topology.leaf(id)?)
}

fn cmd_topology(manager: &Manager) -> Result<()> {
    let topology = manager.topology()?;
    print!("{topology}");
    println!(
        "{} devices, {} leaves",
        topology.devices().len(),
        topology.leaves().len()
    );
    Ok(())
}

fn cmd_info(manager: &Manager, addr: &str) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    println!("Leaf         : {} ({})", leaf.addr(), leaf.port().id());

    let mut hop = leaf.parent();
    while let Some((id, index)) = hop {
        let dev = manager.device(id)?;
        let port = dev.downstream(index)?;
        println!();
        println!("{id} {} depth {}", dev.family(), dev.depth().unwrap_or(0));
        println!("  port       : {port}");
        match dev.link_status(Select::Downstream(index)) {
            Ok(s) => println!(
                "  link       : {} x{}{}",
                s.speed.map_or_else(|| "?".to_string(), |v| v.to_string()),
                s.width,
                if s.dll_active { "" } else { " (down)" }
            ),
            Err(e) => println!("  link       : ({e})"),
        }
        if let Ok(max) = dev.max_speed(index) {
            println!("  max speed  : {max}");
        }
        match dev.downstream_aspm(index) {
            Ok(a) => println!("  aspm       : {a} (capable {})", dev.aspm_capability()?),
            Err(e) => println!("  aspm       : ({e})"),
        }
        if let Ok(l1ss) = dev.l1ss(Select::Downstream(index)) {
            println!("  l1ss       : {l1ss}");
        }
        if let Ok(dpc) = dev.dpc_mode(index) {
            println!("  dpc        : {dpc}");
        }
        hop = dev.parent();
    }
    Ok(())
}

fn cmd_aspm(manager: &Manager, addr: &str, state: Option<&str>, force: bool) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    let (id, index) = leaf
        .parent()
        .with_context(|| format!("{} sits on a root bus; no bridge link to manage", leaf.addr()))?;

    if let Some(state) = state {
        let state: Aspm = state.parse().context("Bad ASPM state")?;
        let written = manager.set_link_aspm(id, index, state, force)?;
        println!("Set {written} on link {id}:{index} -> {}", leaf.addr());
    }

    let (parent, child) = manager.topology()?.link(id, index)?;
    let (parent_state, child_state) = manager.link_aspm(id, index)?;
    println!("parent {} : {parent_state}", parent.addr());
    if let (Some(child), Some(state)) = (child, child_state) {
        println!("child  {} : {state}", child.addr());
    }
    Ok(())
}

fn cmd_errors(manager: &Manager, addr: &str, source: &str) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    let source: ErrorSource = source.parse()?;
    let hops = manager.chain_error_counts(leaf.id(), source)?;
    if hops.is_empty() {
        println!("{}: no bridges above this leaf", leaf.addr());
    }
    for hop in hops {
        println!("{} port {}: {}", hop.device, hop.port, hop.counts);
    }
    let own = manager.leaf_error_counts(leaf.id(), source)?;
    println!("{}: {own}", leaf.addr());
    Ok(())
}

fn cmd_aer(manager: &Manager, addr: &str, clear: bool) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    manager.set_aer_capture(true);

    let mut hop = leaf.parent();
    while let Some((id, index)) = hop {
        let select = Select::Downstream(index);
        // drain pending status into the log before printing
        manager.port_error_counts(id, select, ErrorSource::FlagOnly)?;
        let log = manager.aer_log(id, select)?;
        println!("{id} port {index}: {} entries", log.len());
        for entry in &log {
            println!("  {entry}");
        }
        if clear {
            manager.clear_aer_log(id, select)?;
        }
        hop = manager.device(id)?.parent();
    }
    Ok(())
}

fn cmd_watch(manager: &Manager, addr: &str, interval_ms: u64, count: u64) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    manager.initialize_all().context("Device initialization failed")?;

    let mut printed = 0u64;
    while count == 0 || printed < count {
        thread::sleep(Duration::from_millis(interval_ms));
        for hop in manager.chain_error_counts(leaf.id(), ErrorSource::Combined)? {
            if hop.counts.nonzero().next().is_some() {
                println!("{} port {}: {}", hop.device, hop.port, hop.counts);
            }
        }
        printed += 1;
    }

    manager.shutdown_all()?;
    Ok(())
}

fn cmd_roundtrip(manager: &Manager, addr: &str, what: &str) -> Result<()> {
    let leaf = find_leaf(manager, addr)?;
    let mask: SaveMask = what.parse()?;

    let session = manager.save_setting(leaf.id(), mask)?;
    let saved = manager.session(session)?;
    println!("Saved {session} ({} hops)", saved.hops.len());
    for hop in &saved.hops {
        println!("  {hop:?}");
    }

    let restored = manager.restore_setting(session, mask, RestoreOptions::default());
    manager.discard_setting(session)?;
    restored.context("Restore failed")?;
    println!("Restored and discarded {session}");
    Ok(())
}
