//! cacheeasy-exporter - Prometheus exporter for Redis servers and Predixy proxies
//!
//! The set of monitored targets is read from a configuration file and
//! re-read periodically. Each refresh reconciles the live collectors against
//! the file: new targets get a collector, changed ones are swapped, removed
//! ones are dropped, without restarting the exporter.

pub mod adapter;
pub mod collectors;
pub mod config;
pub mod reconcile;
pub mod scheduler;
pub mod server;
pub mod target;
