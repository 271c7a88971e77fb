//! # ragline
//!
//! A broker-driven pipeline that turns published documents into stored
//! embeddings and answers questions from them.
//!
//! Documents arrive on a RabbitMQ queue, are cleaned and chunked, embedded in
//! batches, and written to a vector store (Weaviate, or SQLite/in-memory for
//! local use). A query is embedded, its nearest chunks are retrieved, and a
//! chat completion answers it from that context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Publisher│──▶│ RabbitMQ  │──▶│  Consumers   │──▶│ Vector store │
//! │ HTTP/CLI │   │ rag_queue │   │ chunk+embed  │   │ DocumentChunk│
//! └──────────┘   │ + dlx/dlq │   └──────────────┘   └──────┬───────┘
//!                └───────────┘                             │
//!                       ┌──────────────────────────────────┤
//!                       ▼                                  ▼
//!                ┌────────────┐                     ┌────────────┐
//!                │ /rag/reply │◀────── prompt ──────│ Retriever  │
//!                │ completion │                     │ top-k      │
//!                └────────────┘                     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline setup                                   # topology + collection
//! ragline consume &                               # run consumers
//! ragline publish document --source faq --file faq.txt
//! ragline query "What is the refund policy?"
//! ragline serve                                   # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Message envelopes and stored records |
//! | [`broker`] | Broker abstraction, AMQP and in-memory implementations |
//! | [`topology`] | Idempotent queue/exchange declaration |
//! | [`publisher`] | Confirmed, persistent publishing |
//! | [`consumer`] | Consumer runtime: subscriptions, ack/reject, shutdown |
//! | [`handlers`] | Document and user-message handlers |
//! | [`chunk`] | Text cleaning and recursive chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`gateway`] | Batched embed-and-store |
//! | [`store`] | Vector store abstraction and backends |
//! | [`retrieve`] | Query embedding and nearest-neighbour search |
//! | [`prompt`] | Prompt composition |
//! | [`completion`] | Chat completion providers |
//! | [`rag`] | Query-to-answer service |
//! | [`server`] | HTTP server |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | SQLite schema |

pub mod broker;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod consumer;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod prompt;
pub mod publisher;
pub mod rag;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod topology;
