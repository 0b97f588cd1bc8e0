//! Redis server collector
//!
//! Scrapes `INFO` on every collection and exports the numeric fields listed
//! in [`REDIS_METRICS`] plus per-database key counts. Every sample is labelled
//! with the target `addr` and `alias`.

use super::{ExtraMetric, InfoMetric, InfoTarget, ScrapeOptions};
use crate::adapter::AdapterError;
use crate::target::Target;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{MetricFamily, MetricType};
use std::sync::Arc;

const fn gauge(key: &'static str, name: &'static str, help: &'static str) -> InfoMetric {
    InfoMetric {
        section: None,
        key,
        name,
        help,
        kind: MetricType::GAUGE,
    }
}

const fn counter(key: &'static str, name: &'static str, help: &'static str) -> InfoMetric {
    InfoMetric {
        section: None,
        key,
        name,
        help,
        kind: MetricType::COUNTER,
    }
}

pub(crate) const REDIS_METRICS: &[InfoMetric] = &[
    // Server
    gauge("uptime_in_seconds", "uptime_in_seconds", "Number of seconds since Redis server start"),
    // Clients
    gauge("connected_clients", "connected_clients", "Number of client connections (excluding connections from replicas)"),
    gauge("blocked_clients", "blocked_clients", "Number of clients pending on a blocking call"),
    // Memory
    gauge("used_memory", "memory_used_bytes", "Total number of bytes allocated by Redis using its allocator"),
    gauge("used_memory_rss", "memory_used_rss_bytes", "Number of bytes that Redis allocated as seen by the operating system"),
    gauge("used_memory_peak", "memory_used_peak_bytes", "Peak memory consumed by Redis in bytes"),
    gauge("maxmemory", "memory_max_bytes", "The value of the maxmemory configuration directive"),
    gauge("mem_fragmentation_ratio", "mem_fragmentation_ratio", "Ratio between used_memory_rss and used_memory"),
    // Persistence
    gauge("rdb_changes_since_last_save", "rdb_changes_since_last_save", "Number of changes since the last dump"),
    gauge("rdb_last_save_time", "rdb_last_save_timestamp_seconds", "Epoch-based timestamp of the last successful RDB save"),
    gauge("rdb_last_bgsave_status", "rdb_last_bgsave_ok", "Whether the last RDB save operation succeeded"),
    gauge("aof_enabled", "aof_enabled", "Flag indicating AOF logging is activated"),
    // Stats
    counter("total_connections_received", "connections_received_total", "Total number of connections accepted by the server"),
    counter("total_commands_processed", "commands_processed_total", "Total number of commands processed by the server"),
    gauge("instantaneous_ops_per_sec", "instantaneous_ops_per_sec", "Number of commands processed per second"),
    counter("total_net_input_bytes", "net_input_bytes_total", "The total number of bytes read from the network"),
    counter("total_net_output_bytes", "net_output_bytes_total", "The total number of bytes written to the network"),
    counter("rejected_connections", "rejected_connections_total", "Number of connections rejected because of maxclients limit"),
    counter("expired_keys", "expired_keys_total", "Total number of key expiration events"),
    counter("evicted_keys", "evicted_keys_total", "Number of evicted keys due to maxmemory limit"),
    counter("keyspace_hits", "keyspace_hits_total", "Number of successful lookup of keys in the main dictionary"),
    counter("keyspace_misses", "keyspace_misses_total", "Number of failed lookup of keys in the main dictionary"),
    gauge("pubsub_channels", "pubsub_channels", "Global number of pub/sub channels with client subscriptions"),
    // Replication
    gauge("connected_slaves", "connected_slaves", "Number of connected replicas"),
    // CPU
    counter("used_cpu_sys", "cpu_sys_seconds_total", "System CPU consumed by the Redis server"),
    counter("used_cpu_user", "cpu_user_seconds_total", "User CPU consumed by the Redis server"),
];

const REDIS_EXTRAS: &[ExtraMetric] = &[
    ExtraMetric {
        name: "db_keys",
        help: "Number of keys in the database",
        labels: &["db"],
    },
    ExtraMetric {
        name: "db_expires",
        help: "Number of keys with an expiration in the database",
        labels: &["db"],
    },
    ExtraMetric {
        name: "db_avg_ttl_milliseconds",
        help: "Average TTL of keys with an expiration in the database",
        labels: &["db"],
    },
];

/// Collector for one Redis server
#[derive(Debug, Clone)]
pub struct RedisCollector {
    inner: Arc<InfoTarget>,
}

impl RedisCollector {
    pub fn new(target: &Target, options: ScrapeOptions) -> Result<Self, AdapterError> {
        let inner = InfoTarget::new("redis", REDIS_METRICS, REDIS_EXTRAS, target, options)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn prefetch(&self) {
        self.inner.prefetch();
    }
}

impl Collector for RedisCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.descs()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let scrape = self.inner.latest();

        let info = match &scrape.result {
            Ok(info) => info,
            Err(e) => {
                self.inner.log_failure(e);
                return self.inner.status_families(false, scrape.elapsed);
            }
        };

        let mut families = self.inner.status_families(true, scrape.elapsed);
        families.extend(self.inner.table_families(REDIS_METRICS, info));

        for keyspace in info.keyspace() {
            let db = [("db", keyspace.db.as_str())];
            for (extra, value) in REDIS_EXTRAS
                .iter()
                .zip([keyspace.keys, keyspace.expires, keyspace.avg_ttl])
            {
                families.push(
                    self.inner
                        .family(extra.name, extra.help, MetricType::GAUGE, &db, value),
                );
            }
        }

        families
    }
}
