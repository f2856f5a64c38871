// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sample daemon serving an in-memory "x11-manager" capability.
//
// Usage:
//   demo_daemon
//
// Listens on CAPIPC_HOST:CAPIPC_PORT (default 127.0.0.1:42000) until
// interrupted. Set RUST_LOG=debug to see every frame.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use capipc::{cleanup, Capability, CapabilityRegistry, Config, Daemon, MethodSpec, TypeSpec};

struct Window {
    id: u64,
    pid: u64,
    title: &'static str,
}

const WINDOWS: &[Window] = &[
    Window { id: 0x0120_0001, pid: 4242, title: "Terminal" },
    Window { id: 0x0120_0002, pid: 4242, title: "Terminal (2)" },
    Window { id: 0x0340_0001, pid: 5150, title: "Editor" },
];

struct X11Manager;

impl X11Manager {
    fn window(&self, id: u64) -> Result<&'static Window, String> {
        WINDOWS
            .iter()
            .find(|w| w.id == id)
            .ok_or_else(|| format!("no window {id:#x}"))
    }
}

fn number(args: &[Value], i: usize) -> Result<u64, String> {
    args.get(i)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("argument {i} must be a non-negative integer"))
}

impl Capability for X11Manager {
    fn methods(&self) -> BTreeMap<String, MethodSpec> {
        let window = TypeSpec::object(TypeSpec::Any);
        BTreeMap::from([
            (
                "get_windows_by_pid".to_string(),
                MethodSpec::returning(TypeSpec::array(window)).arg("pid", TypeSpec::Number),
            ),
            (
                "list_windows".to_string(),
                MethodSpec::returning(TypeSpec::array(TypeSpec::Number)),
            ),
            (
                "get_window_title".to_string(),
                MethodSpec::returning(TypeSpec::String).arg("wid", TypeSpec::Number),
            ),
            (
                "count".to_string(),
                MethodSpec::returning(TypeSpec::Number).arg("items", TypeSpec::array(TypeSpec::Any)),
            ),
        ])
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, String> {
        match method {
            "get_windows_by_pid" => {
                let pid = number(&args, 0)?;
                Ok(WINDOWS
                    .iter()
                    .filter(|w| w.pid == pid)
                    .map(|w| json!({"id": w.id, "pid": w.pid, "title": w.title}))
                    .collect())
            }
            "list_windows" => Ok(WINDOWS.iter().map(|w| json!(w.id)).collect()),
            "get_window_title" => Ok(json!(self.window(number(&args, 0)?)?.title)),
            "count" => match args.first() {
                Some(Value::Array(items)) => Ok(json!(items.len())),
                _ => Err("argument 0 must be an array".into()),
            },
            other => Err(format!("unknown method `{other}`")),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    cleanup::install();

    let config = Config::from_env();
    let registry = CapabilityRegistry::new().with("x11-manager", X11Manager);
    let daemon = match Daemon::bind(config, registry) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "cannot bind bootstrap socket");
            std::process::exit(1);
        }
    };
    if let Err(e) = daemon.serve() {
        error!(error = %e, "cannot start accept loop");
        std::process::exit(1);
    }
    info!("serving x11-manager; Ctrl-C to stop");
    daemon.wait();
}
