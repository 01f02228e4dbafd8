//! runledger-core: durable dual-write event store for agent runs.
//!
//! Every accepted write lands in two places: an append-only JSONL replay log
//! (ground truth) and a SQLite indexed store (fast queries). The two are
//! reconciled by replaying the log through the same apply path live writes
//! use, so recovery and normal operation cannot diverge. Confirmed runs are
//! forwarded to a remote collector in the background with at-least-once
//! semantics.
//!
//! The write surface is [`facade::RunRecorder`], which never returns an
//! error to the instrumented caller: failures degrade to side-channel
//! counters and log lines, summarized per write in a [`facade::Receipt`].

pub mod applog;
pub mod backup;
pub mod config;
pub mod error;
pub mod facade;
pub mod forwarder;
pub mod lock;
pub mod logging;
pub mod model;
pub mod recovery;
pub mod retry;
pub mod server;
pub mod status;
pub mod store;
pub mod telemetry;

pub use config::LedgerConfig;
pub use error::{Error, Result};
pub use facade::{Receipt, RunRecorder, StartRun};
pub use model::{Run, RunPatch};
pub use status::RunStatus;
pub use store::{RunFilter, RunStore};
