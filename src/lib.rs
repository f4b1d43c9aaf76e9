//! # Proto Harness
//!
//! A prototyping harness for retrieval-augmented text workflows.
//!
//! Each client is a directory with a `config.json` naming the steps of its
//! workflow. The HTTP dispatcher runs a step inline or as a tracked
//! background task; the ingestion pipeline turns the client's
//! `source_documents` into a persisted vector index that workflows search.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Loaders    │──▶│ Chunk+Filter │──▶│ Vector index │
//! │ txt/md/pdf.. │   │   (ingest)   │   │   (SQLite)   │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ search
//!   POST /{client} ──▶ Dispatcher ──▶ Workflow step ──▶ LLM
//!                          │
//!                          └──▶ Task registry ◀── GET /{client}/{task_id}
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Document units, chunks, task records |
//! | [`extract`] | PDF / OOXML / HTML / CSV text extraction |
//! | [`loader`] | Extension-to-loader mapping |
//! | [`filter`] | Change detection by modification time |
//! | [`chunk`] | Overlapping window chunking |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Vector store trait, SQLite and in-memory backends |
//! | [`ingest`] | Ingestion pipeline |
//! | [`prepare`] | Front matter extraction and translation of raw Markdown |
//! | [`progress`] | Ingest progress reporting |
//! | [`tasks`] | Async task registry |
//! | [`workflow`] | Steps, workflows and the workflow catalog |
//! | [`client`] | Per-client configuration |
//! | [`dispatch`] | Step validation, input resolution, sync/async dispatch |
//! | [`server`] | HTTP server |
//! | [`llm`] | Language model client |
//! | [`translate`] | Translation with resource-exhaustion fallback |
//! | [`prototypes`] | Built-in `complaint`, `demo` and `support` workflows, retrieval QA |

pub mod chunk;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod extract;
pub mod filter;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod models;
pub mod prepare;
pub mod progress;
pub mod prototypes;
pub mod server;
pub mod store;
pub mod tasks;
pub mod translate;
pub mod workflow;
