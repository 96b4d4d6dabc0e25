//! circus daemon - control reactor, command dispatch and supervisor
//!
//! This crate provides the daemon side of circus:
//! - `controller` - the reactor task and the dispatch pipeline
//! - `router` - multi-client control socket with per-client identities
//! - `commands` - the command trait, registry and built-in commands
//! - `arbiter` - the supervisory layer (watchers of processes)
//! - `discovery` - UDP endpoint discovery
//! - `config` - TOML configuration
//! - `signals` - termination signals
//! - `monitor` - daemon CPU and memory metrics
//! - `client` - control client used by `circusctl`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        circusd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  Incoming  ┌────────────────────────┐  │
//! │  │  RouterSocket   │───────────▶│  Controller (reactor)  │  │
//! │  │ (tcp:// ipc://) │◀───────────│  Job queue, ticker     │  │
//! │  └─────────────────┘  Multipart └───────────┬────────────┘  │
//! │                                             │ dispatch      │
//! │  ┌─────────────────┐                        ▼               │
//! │  │DiscoveryResponder│           ┌────────────────────────┐  │
//! │  │    (udp://)     │            │  CommandRegistry       │  │
//! │  └─────────────────┘            └───────────┬────────────┘  │
//! │                                             │ execute       │
//! │                                             ▼               │
//! │                                 ┌────────────────────────┐  │
//! │                                 │ Supervisor ─▶ Watchers │  │
//! │                                 │        ─▶ Processes    │  │
//! │                                 └────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Panics raised by command implementations are caught by the dispatcher

pub mod arbiter;
pub mod client;
pub mod commands;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod monitor;
pub mod router;
pub mod signals;
