//! # docvault
//!
//! Incremental document ingestion into a local vector collection.
//!
//! A run walks a source directory, parses every supported file on a bounded
//! worker pool, splits the text into overlapping chunks and writes them,
//! embedded, into a named collection. Re-running against the same
//! collection only processes files it does not already contain.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌──────────┐   ┌─────────┐   ┌───────────┐
//! │ Reconciler │──▶│ Discovery │──▶│ Parallel │──▶│ Chunker │──▶│  Store    │
//! │ known srcs │   │ walk+skip │   │  loader  │   │         │   │ SQLite    │
//! └────────────┘   └───────────┘   └──────────┘   └─────────┘   └───────────┘
//!        ▲                                                            │
//!        └────────────────── persisted chunk metadata ◀───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Layered configuration (CLI, env, TOML, defaults) |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`layout`] | Workspace directory layout and `.env` updates |
//! | [`loader`] | Extension-keyed parser registry |
//! | [`extract`] | PDF and OOXML text extraction |
//! | [`discovery`] | Source file discovery |
//! | [`parallel`] | Bounded parallel parsing |
//! | [`chunk`] | Recursive overlapping chunker |
//! | [`reconcile`] | Known-source reconciliation and store validity |
//! | [`store`] | Collection store trait, SQLite and in-memory backends |
//! | [`embedding`] | Embedding providers |
//! | [`progress`] | Progress reporting |
//! | [`ingest`] | Run orchestration state machine |
//! | [`prompt`] | Interactive directory menu |

pub mod chunk;
pub mod config;
pub mod discovery;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod layout;
pub mod loader;
pub mod models;
pub mod parallel;
pub mod progress;
pub mod prompt;
pub mod reconcile;
pub mod store;
