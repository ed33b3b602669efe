//! # KB Engine
//!
//! A multi-tenant knowledge-base assistant engine.
//!
//! KB Engine ingests documents of many formats into per-tenant knowledge
//! bases, indexes them for semantic retrieval, and serves two generative
//! workflows on top: retrieval-augmented chat with streaming answers and
//! inline citations, and bounded draft-review-revise course generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌─────────────┐
//! │ Uploads   │──▶│  Pipeline                      │──▶│  SQLite      │
//! │ pdf/docx/ │   │ classify→extract→chunk→embed  │   │  + Qdrant    │
//! │ pptx/video│   └──────────────────────────────┘   └──────┬──────┘
//! └──────────┘                                              │
//!                            ┌───────────────┬──────────────┤
//!                            ▼               ▼              ▼
//!                      ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                      │   Chat    │   │  Courses  │   │ Retrieval │
//!                      │ (stream)  │   │ (stream)  │   │  (tool)   │
//!                      └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`classify`] | Document kind detection |
//! | [`extract`] | Per-format text extraction providers |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Vector index abstraction (Qdrant, in-memory) |
//! | [`pipeline`] | Document ingestion pipeline |
//! | [`jobs`] | Background job queue |
//! | [`retrieval`] | Semantic retrieval tool |
//! | [`chat`] | Conversational agent |
//! | [`course`] | Course generation |
//! | [`server`] | HTTP API server |
//! | [`store`] | SQLite persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod course;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod retrieval;
pub mod server;
pub mod store;
pub mod transport;
pub mod vector_index;

pub use error::{EngineError, Result};
