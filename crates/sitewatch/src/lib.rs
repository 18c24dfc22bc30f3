//! # sitewatch
//!
//! The engine behind a multi-tenant website-change-monitoring service.
//!
//! Users register URLs through a chat front-end; the engine periodically
//! fetches each one, reduces the page to a noise-filtered weighted
//! fingerprint, compares it against the stored baseline, classifies the
//! difference, and hands the owning user a compact diff through the
//! [`engine::Notifier`] boundary when the difference is meaningful.
//!
//! ## Features
//!
//! - **Durable state** — a single-writer atomic store with shadow writes,
//!   fsync + rename swaps, pre-migration backups, and schema migrations.
//! - **Hostile-target survival** — per-host circuit breakers, block-page
//!   detection, rotating browser signatures, and robots.txt honouring.
//! - **Request collapsing** — concurrent fetches of the same normalized
//!   URL share one network round trip and a 30-second result cache.
//! - **Rate governance** — a global fetch token bucket and a bounded,
//!   paced notification queue with a congestion signal.
//! - **Forensics** — every meaningful change keeps a compressed
//!   before/after pair that can be replayed under current algorithms.
//!
//! ## Pipeline
//!
//! Each patrol cycle runs **governor → breaker → fetch → fingerprint →
//! detect → store → notify**:
//!
//! 1. [`patrol::run_cycle`] selects due monitors from a store snapshot.
//! 2. [`request::RequestManager::fetch`] collapses, paces, and guards the
//!    network round trip.
//! 3. [`fingerprint::fingerprint`] short-circuits block pages and digests
//!    real content into a versioned [`types::WeightedFingerprint`].
//! 4. [`detect::detect`] scores similarity and classifies the change.
//! 5. One coalesced [`store::AtomicStore::submit_write`] lands history,
//!    evidence, and baselines atomically; only then are notifications
//!    enqueued.
//!
//! ## Modules
//!
//! - [`engine`] — root lifecycle and the chat-facing command surface
//! - [`patrol`] — the periodic cycle driver
//! - [`request`] — HTTP facade: collapsing, headers, robots, timeouts
//! - [`breaker`] — per-host CLOSED/OPEN/HALF_OPEN state machines
//! - [`fingerprint`] — HTML → weighted fingerprint pipeline
//! - [`detect`] — comparison, classification, forensic snapshots
//! - [`store`] — crash-safe persistence with migrations
//! - [`types`] — the persisted document and domain types
//! - [`error`] — the engine's failure taxonomy

pub mod breaker;
pub mod detect;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod patrol;
pub mod request;
pub mod store;
pub mod types;

pub use engine::{Engine, EngineConfig, ExportFormat, Notifier, SnoozeDuration};
pub use error::WatchError;
