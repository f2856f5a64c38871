// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sample client for demo_daemon.
//
// Usage:
//   demo_client [pid]
//
// Registers "x11-manager", lists the windows of <pid> (default 4242), then
// counts all windows with a two-step chain executed in one round trip.

use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use capipc::{CallArgs, CapabilityLibrary, Config, Mode};

fn run(pid: u64) -> capipc::Result<()> {
    let lib = CapabilityLibrary::connect_with(Config::from_env())?;
    info!(alive = lib.is_alive(), "connected");

    let x11 = lib.get_capability("x11-manager", Mode::Sync)?;
    let windows = x11.invoke("get_windows_by_pid", CallArgs::new().arg(json!(pid)))?;
    println!("windows of {pid}: {windows:?}");

    let lazy = x11.with_mode(Mode::Lazy);
    let ids = lazy.invoke("list_windows", CallArgs::new())?;
    let count = match ids.into_deferred() {
        Some(ids) => {
            let total = x11.invoke("count", CallArgs::new().arg(ids))?;
            match total.into_deferred() {
                Some(chain) => x11.execute(&chain)?,
                None => json!(null),
            }
        }
        None => json!(null),
    };
    println!("window count: {count}");

    lib.disconnect();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pid = match std::env::args().nth(1).map(|a| a.parse::<u64>()) {
        None => 4242,
        Some(Ok(pid)) => pid,
        Some(Err(_)) => {
            eprintln!("usage: demo_client [pid]");
            std::process::exit(1);
        }
    };
    if let Err(e) = run(pid) {
        error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}
