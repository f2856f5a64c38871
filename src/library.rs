// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process entry point: owns the connection and the registered
// capabilities, and tears both down in the right order.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::cleanup;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::proxy::{CapabilityProxy, Mode};

#[derive(Default)]
struct State {
    connection: Option<Arc<Connection>>,
    capabilities: HashMap<String, CapabilityProxy>,
}

/// Connects to the daemon and hands out capability proxies.
///
/// Dropping the library disconnects it.
pub struct CapabilityLibrary {
    config: Config,
    state: Mutex<State>,
}

impl CapabilityLibrary {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Build a library and connect it.
    pub fn connect_with(config: Config) -> Result<Self> {
        let lib = Self::new(config);
        lib.connect()?;
        Ok(lib)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handshake with the daemon. Does nothing if already connected.
    ///
    /// Also installs the signal handlers that unlink this process's shared
    /// resources on SIGINT, SIGTERM or SIGHUP.
    pub fn connect(&self) -> Result<()> {
        let mut state = self.state();
        if state.connection.as_ref().is_some_and(|c| !c.is_closed()) {
            return Ok(());
        }
        cleanup::install();
        state.connection = Some(Arc::new(Connection::open(self.config.clone())?));
        state.capabilities.clear();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state().connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.state().connection.clone().ok_or(Error::NotConnected)
    }

    /// Liveness of the daemon behind this connection.
    pub fn is_alive(&self) -> bool {
        match self.connection() {
            Ok(conn) => conn.is_alive(),
            Err(_) => false,
        }
    }

    /// Proxy for capability `name`. A capability already registered on this
    /// connection is reused, with `mode` applied to the returned handle.
    ///
    /// The registration round trip runs without the library lock held, so
    /// `disconnect` is never stuck behind it. When two threads register the
    /// same name at once, the first to finish is kept and shared.
    pub fn get_capability(&self, name: &str, mode: Mode) -> Result<CapabilityProxy> {
        let conn = {
            let state = self.state();
            if let Some(proxy) = state.capabilities.get(name).filter(|p| !p.is_dropped()) {
                debug!(capability = name, "capability cache hit");
                return Ok(proxy.with_mode(mode));
            }
            state.connection.clone().ok_or(Error::NotConnected)?
        };
        let proxy = CapabilityProxy::register(Arc::clone(&conn), name, mode)?;

        let mut state = self.state();
        if !state.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
            // Disconnected or reconnected while registering; the old
            // connection's registrations went with it.
            return Err(Error::NotConnected);
        }
        if let Some(existing) = state.capabilities.get(name).filter(|p| !p.is_dropped()) {
            // UNREGISTER is by name, so the kept proxy's release also drops
            // this duplicate on the daemon.
            debug!(capability = name, "concurrent registration lost the race");
            return Ok(existing.with_mode(mode));
        }
        state.capabilities.insert(name.to_string(), proxy.clone());
        Ok(proxy)
    }

    /// Unregister `name` and forget it. Unknown names are ignored.
    pub fn release(&self, name: &str) -> Result<()> {
        match self.state().capabilities.remove(name) {
            Some(proxy) => proxy.unregister(),
            None => Ok(()),
        }
    }

    /// Acquire `name` for the lifetime of the returned guard.
    pub fn scoped(&self, name: &str, mode: Mode) -> Result<ScopedCapability<'_>> {
        let proxy = self.get_capability(name, mode)?;
        Ok(ScopedCapability {
            library: self,
            proxy,
        })
    }

    /// Unregister every capability, stop the workers and unlink the shared
    /// resources. Safe to call repeatedly and with calls still in flight.
    pub fn disconnect(&self) {
        let (conn, capabilities) = {
            let mut state = self.state();
            (state.connection.take(), std::mem::take(&mut state.capabilities))
        };
        for (name, proxy) in capabilities {
            if let Err(e) = proxy.unregister() {
                warn!(capability = %name, error = %e, "unregister during disconnect failed");
            }
        }
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl Drop for CapabilityLibrary {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A capability released when the guard is dropped.
pub struct ScopedCapability<'a> {
    library: &'a CapabilityLibrary,
    proxy: CapabilityProxy,
}

impl Deref for ScopedCapability<'_> {
    type Target = CapabilityProxy;

    fn deref(&self) -> &CapabilityProxy {
        &self.proxy
    }
}

impl Drop for ScopedCapability<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.library.release(self.proxy.name()) {
            warn!(capability = %self.proxy.name(), error = %e, "release failed");
        }
    }
}
