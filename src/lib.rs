//! # Knowledge Space
//!
//! A self-hosted knowledge platform. Users collaborate in spaces; each space
//! holds knowledge bases fed by text notes, uploaded files, and crawled web
//! pages. Ingestion runs on a durable SQLite job queue, content is chunked
//! and indexed for keyword (FTS5) and vector search, and assistants answer
//! questions over their knowledge bases with streamed, cited replies.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP /api/v1 ──▶ spaces / knowledge / assistants / chat
//!        │                 │ enqueue             │ search_chunks
//!        │                 ▼                     ▼
//!        │           ┌──────────┐   claim  ┌──────────┐
//!        │           │  queue   │◀─────────│  worker  │── ingest ── extract / crawl
//!        │           └──────────┘          └──────────┘      │
//!        │                                                    ▼
//!        └──────────── search ◀──────────── SQLite (FTS5 + vectors) ◀── chunk + embed
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                                   # create database
//! kb user create --email me@example.com --password 'correct horse'
//! kb serve --workers 2                      # API with embedded workers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Domain error type and HTTP codes |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`auth`] / [`users`] | Password hashing, tokens, accounts |
//! | [`spaces`] | Spaces, members, and role checks |
//! | [`knowledge`] | Knowledge bases and sources |
//! | [`queue`] / [`worker`] | Durable job queue and worker pool |
//! | [`ingest`] | Source ingestion pipeline |
//! | [`extract`] / [`crawl`] | File text extraction and web crawling |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding providers |
//! | [`index`] | Document, chunk, and vector storage |
//! | [`search`] | Keyword, semantic, and hybrid search |
//! | [`assistants`] | Assistant configuration |
//! | [`llm`] | Streaming chat-completion clients |
//! | [`chat`] | Conversations and answer streams |
//! | [`server`] | HTTP API |
//! | [`stats`] / [`commands`] | Operator commands |

pub mod assistants;
pub mod auth;
pub mod chat;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod search;
pub mod server;
pub mod spaces;
pub mod stats;
pub mod users;
pub mod worker;
