// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Capability transport: lets an unprivileged client invoke named operations
// exposed by a local daemon over a pair of shared memory regions, after a
// short TCP rendezvous that only agrees on their names.

pub mod shm_name;

mod platform;
mod backoff;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod semaphore;
pub use semaphore::IpcSemaphore;

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::Config;

pub mod codec;
pub use codec::Command;

pub mod region;
pub use region::{Region, SharedChannel, Side};

pub mod handshake;
pub use handshake::ClientId;

pub mod dispatcher;
pub use dispatcher::Dispatcher;

pub mod correlator;
pub use correlator::Correlator;

mod connection;
pub use connection::Connection;

pub mod schema;
pub use schema::{ArgSpec, CapabilitySpec, MethodSpec, TypeSpec};

pub mod chain;
pub use chain::{Arg, CallTable, DeferredValue};

mod proxy;
pub use proxy::{CallArgs, CapabilityProxy, Invocation, Mode};

mod library;
pub use library::{CapabilityLibrary, ScopedCapability};

pub mod cleanup;

pub mod daemon;
pub use daemon::{Capability, CapabilityRegistry, Daemon};
