//! Predixy proxy collector
//!
//! Predixy answers `INFO` with proxy-wide `SystemResource` and `Stats`
//! sections and a `Servers` section holding one block per backend, each block
//! starting with a `Server:<address>` line.

use super::info::{parse_number, Info};
use super::{ExtraMetric, InfoMetric, InfoTarget, ScrapeOptions};
use crate::adapter::AdapterError;
use crate::target::Target;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{MetricFamily, MetricType};
use std::sync::Arc;

const fn field(
    section: &'static str,
    key: &'static str,
    name: &'static str,
    help: &'static str,
    kind: MetricType,
) -> InfoMetric {
    InfoMetric {
        section: Some(section),
        key,
        name,
        help,
        kind,
    }
}

pub(crate) const PREDIXY_METRICS: &[InfoMetric] = &[
    field("Proxy", "WorkerThreads", "worker_threads", "Number of proxy worker threads", MetricType::GAUGE),
    field("SystemResource", "UsedMemory", "used_memory_bytes", "Memory used by the proxy", MetricType::GAUGE),
    field("SystemResource", "MaxMemory", "max_memory_bytes", "Configured memory limit of the proxy", MetricType::GAUGE),
    field("SystemResource", "MaxRSS", "max_rss_bytes", "Peak resident set size of the proxy", MetricType::GAUGE),
    field("SystemResource", "UsedCpuSys", "used_cpu_sys_seconds_total", "System CPU consumed by the proxy", MetricType::COUNTER),
    field("SystemResource", "UsedCpuUser", "used_cpu_user_seconds_total", "User CPU consumed by the proxy", MetricType::COUNTER),
    field("Stats", "Accept", "accept_total", "Client connections accepted", MetricType::COUNTER),
    field("Stats", "ClientConnections", "client_connections", "Current client connections", MetricType::GAUGE),
    field("Stats", "TotalRequests", "requests_total", "Requests received from clients", MetricType::COUNTER),
    field("Stats", "TotalResponses", "responses_total", "Responses sent to clients", MetricType::COUNTER),
    field("Stats", "TotalRecvClientBytes", "recv_client_bytes_total", "Bytes received from clients", MetricType::COUNTER),
    field("Stats", "TotalSendServerBytes", "send_server_bytes_total", "Bytes sent to backend servers", MetricType::COUNTER),
    field("Stats", "TotalRecvServerBytes", "recv_server_bytes_total", "Bytes received from backend servers", MetricType::COUNTER),
    field("Stats", "TotalSendClientBytes", "send_client_bytes_total", "Bytes sent to clients", MetricType::COUNTER),
];

/// Per-backend fields: (INFO key, metric, sample type)
const SERVER_FIELDS: &[(&str, ExtraMetric, MetricType)] = &[
    ("CurrentIsFail", server_metric("server_failed", "Whether the proxy currently marks the backend as failed"), MetricType::GAUGE),
    ("Connections", server_metric("server_connections", "Open connections to the backend"), MetricType::GAUGE),
    ("Connect", server_metric("server_connect_total", "Connection attempts to the backend"), MetricType::COUNTER),
    ("Requests", server_metric("server_requests_total", "Requests forwarded to the backend"), MetricType::COUNTER),
    ("Responses", server_metric("server_responses_total", "Responses received from the backend"), MetricType::COUNTER),
    ("SendBytes", server_metric("server_send_bytes_total", "Bytes sent to the backend"), MetricType::COUNTER),
    ("RecvBytes", server_metric("server_recv_bytes_total", "Bytes received from the backend"), MetricType::COUNTER),
];

const fn server_metric(name: &'static str, help: &'static str) -> ExtraMetric {
    ExtraMetric {
        name,
        help,
        labels: &["server"],
    }
}

/// Metrics of one backend block in the `Servers` section
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BackendStats {
    pub server: String,
    pub values: Vec<(&'static str, f64)>,
}

/// Split the `Servers` section into per-backend blocks
pub(crate) fn backend_stats(info: &Info) -> Vec<BackendStats> {
    let Some(entries) = info.section("Servers") else {
        return Vec::new();
    };

    let mut backends: Vec<BackendStats> = Vec::new();
    for (key, value) in entries {
        if key == "Server" {
            backends.push(BackendStats {
                server: value.clone(),
                values: Vec::new(),
            });
            continue;
        }

        let Some(current) = backends.last_mut() else {
            continue;
        };
        if let Some((field, _, _)) = SERVER_FIELDS.iter().find(|(field, _, _)| *field == key.as_str()) {
            if let Some(num) = parse_number(value) {
                current.values.push((*field, num));
            }
        }
    }

    backends
}

/// Collector for one Predixy proxy
#[derive(Debug, Clone)]
pub struct PredixyCollector {
    inner: Arc<InfoTarget>,
}

impl PredixyCollector {
    pub fn new(target: &Target, options: ScrapeOptions) -> Result<Self, AdapterError> {
        let extras: Vec<ExtraMetric> = SERVER_FIELDS.iter().map(|(_, m, _)| *m).collect();
        let inner = InfoTarget::new("predixy", PREDIXY_METRICS, &extras, target, options)?;
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

impl Collector for PredixyCollector {
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
        families.extend(self.inner.table_families(PREDIXY_METRICS, info));

        for backend in backend_stats(info) {
            let server = [("server", backend.server.as_str())];
            for (key, value) in backend.values {
                if let Some((_, metric, kind)) = SERVER_FIELDS.iter().find(|(k, _, _)| *k == key) {
                    families.push(self.inner.family(metric.name, metric.help, *kind, &server, value));
                }
            }
        }

        families
    }
}
