//! # docrag
//!
//! Document-grounded chat: a per-user ingestion-to-retrieval pipeline
//! with traceable source references.
//!
//! Documents are split into overlapping chunks, embedded, and indexed
//! into one vector index per document. At query time every processed
//! document of the requesting user is merged into a single search space,
//! the nearest chunks are diversity-filtered across documents, and the
//! assembled context is handed to a generation provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌───────────────┐
//! │  Documents   │──▶│ Ingestion pipeline │──▶│ SQLite chunks │
//! │ pdf/docx/txt │   │ chunk·embed·index  │   │ + index files │
//! └──────────────┘   └────────────────────┘   └──────┬────────┘
//!                                                    │
//!                        ┌───────────────────────────┤
//!                        ▼                           ▼
//!                 ┌─────────────┐            ┌──────────────┐
//!                 │  Retrieval  │──context──▶│  Generation  │
//!                 │ merge+k-NN  │            │   provider   │
//!                 └─────────────┘            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | pdf/docx/txt text extraction |
//! | [`chunker`] | Overlapping fixed-size chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Exact and trained vector indices |
//! | [`index_store`] | Per-document index artifacts |
//! | [`ingest`] | Ingestion pipeline |
//! | [`tasks`] | Retry queue and worker pool |
//! | [`retrieval`] | Merge, search, diversity filter |
//! | [`generation`] | Generation provider abstraction |
//! | [`respond`] | Bot-turn orchestration |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod index_store;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod respond;
pub mod retrieval;
pub mod tasks;

pub use error::{Error, Result};
