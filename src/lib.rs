//! # Veritor
//!
//! A batch content-verification pipeline for AI-generated text.
//!
//! Veritor takes a batch of documents submitted together, fans each one out
//! to an independent analysis worker, tracks partial completion through the
//! durable store, classifies and reacts to per-document failures, and
//! aggregates everything into a single report. A fleet health monitor runs
//! alongside, independent of any batch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌────────────┐
//! │  Submit  │──▶│ Dispatch  │──▶│  Workers  │──▶│ Aggregator │
//! │  batch   │   │  queue    │   │ (analyze) │   │ (finalize) │
//! └──────────┘   └───────────┘   └─────┬─────┘   └─────┬──────┘
//!                      ▲               │               │
//!                      │ retry         ▼               ▼
//!                ┌─────┴─────┐   ┌───────────┐   ┌───────────┐
//!                │   Error   │◀──│  SQLite   │──▶│  Report   │
//!                │  handler  │   │  + blobs  │   │ artifact  │
//!                └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! No component holds batch progress in memory: completion is re-derived
//! from stored outcomes, writes are keyed by `(document_id, attempt)`, and
//! every operation is idempotent and resumable.
//!
//! ## Quick Start
//!
//! ```bash
//! veritor init                       # create database
//! veritor submit docs/*.txt          # submit a batch
//! veritor work --drain               # process until idle
//! veritor status <batch-id>          # poll progress
//! veritor report <batch-id>          # fetch the report
//! veritor monitor --once             # one health evaluation cycle
//! veritor serve api                  # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`analyzer`] | Model-backed analysis with heuristic fallback |
//! | [`store`] | Content store for documents and reports |
//! | [`queue`] | Dispatch queue with leases and delayed visibility |
//! | [`worker`] | Per-attempt pipeline and worker pool |
//! | [`aggregator`] | Completion detection and batch finalization |
//! | [`failure`] | Failure classification and retry policy |
//! | [`batches`] | Submit / status / report / cancel operations |
//! | [`metrics`] | Append-only metrics store |
//! | [`monitor`] | Fleet health monitor and scaling recommendations |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aggregator;
pub mod analyzer;
pub mod batches;
pub mod config;
pub mod db;
pub mod failure;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod server;
pub mod stats;
pub mod store;
pub mod worker;
