//! # Second Brain
//!
//! Retrieval orchestration and migration safety for a personal
//! second-brain backend.
//!
//! A recall run routes each query to one memory provider, retrieves
//! candidates (real backend or deterministic fallback), applies the rerank
//! policy, and classifies the result into a branch that tells the caller
//! what to do next. The planner wraps recall in a multi-turn chat loop.
//! Alongside, a checksum-verified migration runner keeps the SQLite schema
//! honest and a linter blocks destructive migration SQL. Markdown notes
//! are ingested as deduplicated knowledge chunks with a managed lifecycle.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//!  │ Planner  │──▶│  Recall  │──▶│ MemoryService │──▶│ mem0 /   │
//!  │ (chat)   │   │ route →  │   │ mock/real/    │   │ Supabase │
//!  └──────────┘   │ rerank → │   │ fallback      │   └──────────┘
//!                 │ classify │   └──────────────┘
//!                 └────┬─────┘
//!                      ▼
//!                ┌───────────┐        ┌──────────────────────┐
//!                │  Traces   │        │ SchemaManager +       │
//!                └───────────┘        │ MigrationRunner (SQL) │
//!                                     └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | tracing subscriber setup |
//! | [`services`] | Component wiring from a [`config::Config`] |
//! | [`recall`] | One retrieval pass |
//! | [`planner`] | Chat loop and reply formatting |
//! | [`memory`] | Provider facade with deterministic fallback |
//! | [`rerank`] | External rerank stage |
//! | [`mem0`], [`supabase`], [`voyage`], [`llm`] | HTTP adapters |
//! | [`pool`] | Retry and circuit breaker |
//! | [`trace`] | Retrieval traces |
//! | [`conversation`] | Session store |
//! | [`validation`] | Branch scenarios |
//! | [`schema`], [`migrate`], [`sqlite_executor`] | Schema migrations |
//! | [`policy`] | Migration SQL linter |
//! | [`ingest`], [`knowledge_store`] | Markdown ingestion into SQLite knowledge chunks |

pub mod commands;
pub mod config;
pub mod conversation;
pub mod db;
pub mod http;
pub mod ingest;
pub mod knowledge_store;
pub mod llm;
pub mod logging;
pub mod mem0;
pub mod memory;
pub mod migrate;
pub mod planner;
pub mod policy;
pub mod pool;
pub mod recall;
pub mod rerank;
pub mod schema;
pub mod services;
pub mod sqlite_executor;
pub mod supabase;
pub mod trace;
pub mod validation;
pub mod voyage;
