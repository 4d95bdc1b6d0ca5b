//! Incremental board crawler that builds a deduplicated, labeled image corpus.
//!
//! A run crawls each configured board through a browser session, reconciles
//! the discovered pins against the SQLite store, downloads and verifies new
//! images and labels them with a vision model under a request quota.

pub mod clock;
pub mod config;
pub mod crawler;
pub mod db;
pub mod download;
pub mod error;
pub mod export;
pub mod labels;
pub mod logging;
pub mod pipeline;
pub mod reconcile;

pub use config::{BoardSource, Config, Limits};
pub use pipeline::{Pipeline, RunReport};
