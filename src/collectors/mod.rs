//! Prometheus collectors for monitored targets
//!
//! Each target kind has its own collector that scrapes the endpoint with
//! `INFO`. [`prefetch`] runs those scrapes concurrently ahead of a gather and
//! collection replays the fresh result, falling back to an inline scrape.
//! [`TargetCollector`] dispatches over the closed set of kinds and
//! [`PrometheusAdapter`] plugs them into a shared `prometheus::Registry` for
//! the reconciler.

pub mod info;
pub mod machine;
pub mod predixy;
pub mod resp;
pub mod redis;

pub use machine::MachineCollector;
pub use predixy::PredixyCollector;
pub use redis::RedisCollector;

use crate::adapter::{validate_address, AdapterError, RegistryAdapter};
use crate::target::{Target, TargetKind};
use info::{parse_number, Info};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default timeout for connecting to and reading from a target
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-scrape settings shared by every target collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeOptions {
    pub timeout: Duration,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCRAPE_TIMEOUT,
        }
    }
}

/// One numeric `INFO` field exported as a sample
#[derive(Debug, Clone, Copy)]
pub(crate) struct InfoMetric {
    /// Section to read from, `None` for the first match anywhere
    pub section: Option<&'static str>,
    pub key: &'static str,
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricType,
}

/// A metric that does not come straight from the field table
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtraMetric {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

/// State shared by the `INFO` based collectors: target identity, descriptors
/// and the labels attached to every sample.
#[derive(Debug)]
pub(crate) struct InfoTarget {
    pub address: String,
    pub alias: String,
    prefix: &'static str,
    timeout: Duration,
    descs: Vec<Desc>,
    labels: Vec<LabelPair>,
    prefetched: Mutex<Option<Scrape>>,
}

/// Outcome of one `INFO` round trip
#[derive(Debug, Clone)]
pub(crate) struct Scrape {
    pub result: Result<Info, Arc<resp::RespError>>,
    pub elapsed: Duration,
    finished: Instant,
}

/// A prefetched scrape is reused while younger than this many timeouts. One
/// prefetch round can spend a connect, a write and a read timeout.
const PREFETCH_MAX_AGE_TIMEOUTS: u32 = 3;

impl InfoTarget {
    pub fn new(
        prefix: &'static str,
        table: &[InfoMetric],
        extras: &[ExtraMetric],
        target: &Target,
        options: ScrapeOptions,
    ) -> Result<Self, AdapterError> {
        validate_address(&target.address)?;

        let mut const_labels = HashMap::new();
        const_labels.insert("addr".to_string(), target.address.clone());
        const_labels.insert("alias".to_string(), target.name.clone());

        let mut descs = Vec::with_capacity(table.len() + STATUS_METRICS.len() + extras.len());
        for metric in table {
            descs.push(
                Desc::new(
                    format!("{}_{}", prefix, metric.name),
                    metric.help.to_string(),
                    Vec::new(),
                    const_labels.clone(),
                )
                .map_err(AdapterError::Descriptor)?,
            );
        }
        for extra in STATUS_METRICS.iter().chain(extras) {
            descs.push(
                Desc::new(
                    format!("{}_{}", prefix, extra.name),
                    extra.help.to_string(),
                    extra.labels.iter().map(|l| l.to_string()).collect(),
                    const_labels.clone(),
                )
                .map_err(AdapterError::Descriptor)?,
            );
        }

        Ok(Self {
            address: target.address.clone(),
            alias: target.name.clone(),
            prefix,
            timeout: options.timeout,
            descs,
            labels: vec![
                label_pair("addr", &target.address),
                label_pair("alias", &target.name),
            ],
            prefetched: Mutex::new(None),
        })
    }

    pub fn descs(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    /// Fetch and parse `INFO` right now
    fn scrape_now(&self) -> Scrape {
        let start = Instant::now();
        let result = resp::Client::connect(&self.address, self.timeout)
            .and_then(|mut client| client.info())
            .map(|text| Info::parse(&text))
            .map_err(Arc::new);
        Scrape {
            result,
            elapsed: start.elapsed(),
            finished: Instant::now(),
        }
    }

    fn lock_prefetched(&self) -> MutexGuard<'_, Option<Scrape>> {
        match self.prefetched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Scrape ahead of a registry gather and keep the result for `latest`
    pub fn prefetch(&self) {
        let scrape = self.scrape_now();
        *self.lock_prefetched() = Some(scrape);
    }

    /// The prefetched scrape while it is fresh, otherwise a new one
    pub fn latest(&self) -> Scrape {
        let max_age = self.timeout * PREFETCH_MAX_AGE_TIMEOUTS;
        if let Some(scrape) = self.lock_prefetched().as_ref() {
            if scrape.finished.elapsed() <= max_age {
                return scrape.clone();
            }
        }
        self.scrape_now()
    }

    /// Build a single-sample family carrying the target labels plus `extra`
    pub fn family(
        &self,
        name: &str,
        help: &str,
        kind: MetricType,
        extra: &[(&str, &str)],
        value: f64,
    ) -> MetricFamily {
        let mut labels = self.labels.clone();
        labels.extend(extra.iter().map(|(k, v)| label_pair(k, v)));
        metric_family(&format!("{}_{}", self.prefix, name), help, kind, labels, value)
    }

    /// Families for every table entry present in `info`
    pub fn table_families(&self, table: &[InfoMetric], info: &Info) -> Vec<MetricFamily> {
        table
            .iter()
            .filter_map(|metric| {
                let value = match metric.section {
                    Some(section) => info
                        .section(section)?
                        .iter()
                        .find(|(k, _)| k == metric.key)
                        .and_then(|(_, v)| parse_number(v))?,
                    None => info.number(metric.key)?,
                };
                Some(self.family(metric.name, metric.help, metric.kind, &[], value))
            })
            .collect()
    }

    /// `<prefix>_up` and `<prefix>_scrape_duration_seconds` for one scrape
    pub fn status_families(&self, up: bool, elapsed: Duration) -> Vec<MetricFamily> {
        let [up_metric, duration_metric] = STATUS_METRICS;
        vec![
            self.family(
                up_metric.name,
                up_metric.help,
                MetricType::GAUGE,
                &[],
                if up { 1.0 } else { 0.0 },
            ),
            self.family(
                duration_metric.name,
                duration_metric.help,
                MetricType::GAUGE,
                &[],
                elapsed.as_secs_f64(),
            ),
        ]
    }

    pub fn log_failure(&self, err: &resp::RespError) {
        debug!(
            "scrape of {} {} ({}) failed: {}",
            self.prefix, self.address, self.alias, err
        );
    }
}

/// Status metrics every `INFO` collector reports
pub(crate) const STATUS_METRICS: [ExtraMetric; 2] = [
    ExtraMetric {
        name: "up",
        help: "Whether the last scrape of the target succeeded",
        labels: &[],
    },
    ExtraMetric {
        name: "scrape_duration_seconds",
        help: "Time spent scraping the target",
        labels: &[],
    },
];

pub(crate) fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

pub(crate) fn metric_family(
    name: &str,
    help: &str,
    kind: MetricType,
    labels: Vec<LabelPair>,
    value: f64,
) -> MetricFamily {
    let mut metric = Metric::default();
    metric.set_label(labels);
    match kind {
        MetricType::COUNTER => {
            let mut counter = prometheus::proto::Counter::default();
            counter.set_value(value);
            metric.set_counter(counter);
        }
        _ => {
            let mut gauge = prometheus::proto::Gauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
        }
    }

    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(if kind == MetricType::COUNTER {
        MetricType::COUNTER
    } else {
        MetricType::GAUGE
    });
    family.set_metric(vec![metric]);
    family
}

/// Live collector for one target, one variant per target kind
#[derive(Debug, Clone)]
pub enum TargetCollector {
    Redis(RedisCollector),
    Predixy(PredixyCollector),
}

impl TargetCollector {
    pub fn new(target: &Target, options: ScrapeOptions) -> Result<Self, AdapterError> {
        match target.kind {
            TargetKind::CacheServer => Ok(Self::Redis(RedisCollector::new(target, options)?)),
            TargetKind::Proxy => Ok(Self::Predixy(PredixyCollector::new(target, options)?)),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Redis(_) => TargetKind::CacheServer,
            Self::Predixy(_) => TargetKind::Proxy,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Redis(c) => c.address(),
            Self::Predixy(c) => c.address(),
        }
    }

    /// Scrape the target now so the next collection can skip the round trip
    pub fn prefetch(&self) {
        match self {
            Self::Redis(c) => c.prefetch(),
            Self::Predixy(c) => c.prefetch(),
        }
    }
}

/// Scrape every collector concurrently on the blocking pool.
///
/// `Registry::gather` collects one collector after another, so without this
/// a scrape would wait for each unresponsive target in turn.
pub async fn prefetch(collectors: Vec<TargetCollector>) {
    let mut tasks = JoinSet::new();
    for collector in collectors {
        tasks.spawn_blocking(move || collector.prefetch());
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("prefetch task failed: {}", e);
        }
    }
}

impl Collector for TargetCollector {
    fn desc(&self) -> Vec<&Desc> {
        match self {
            Self::Redis(c) => c.desc(),
            Self::Predixy(c) => c.desc(),
        }
    }

    fn collect(&self) -> Vec<MetricFamily> {
        match self {
            Self::Redis(c) => c.collect(),
            Self::Predixy(c) => c.collect(),
        }
    }
}

/// Registry adapter backed by a `prometheus::Registry`
#[derive(Clone)]
pub struct PrometheusAdapter {
    registry: prometheus::Registry,
    options: ScrapeOptions,
}

impl PrometheusAdapter {
    pub fn new(registry: prometheus::Registry) -> Self {
        Self::with_options(registry, ScrapeOptions::default())
    }

    pub fn with_options(registry: prometheus::Registry, options: ScrapeOptions) -> Self {
        Self { registry, options }
    }
}

impl RegistryAdapter for PrometheusAdapter {
    type Handle = TargetCollector;

    fn instantiate(&self, target: &Target) -> Result<TargetCollector, AdapterError> {
        TargetCollector::new(target, self.options)
    }

    fn register(&self, handle: &TargetCollector) -> Result<(), AdapterError> {
        self.registry
            .register(Box::new(handle.clone()))
            .map_err(AdapterError::Registration)
    }

    fn deregister(&self, handle: &TargetCollector) {
        if let Err(e) = self.registry.unregister(Box::new(handle.clone())) {
            warn!(
                "failed to unregister {} collector for {}: {}",
                handle.kind(),
                handle.address(),
                e
            );
        }
    }
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn fast_options() -> ScrapeOptions {
        ScrapeOptions {
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_collector_dispatch_by_kind() {
        let redis = Target::new("127.0.0.1:6379", "cache", TargetKind::CacheServer);
        let proxy = Target::new("127.0.0.1:7617", "proxy", TargetKind::Proxy);

        let c = TargetCollector::new(&redis, fast_options()).unwrap();
        assert!(matches!(c, TargetCollector::Redis(_)));
        assert_eq!(c.kind(), TargetKind::CacheServer);
        assert_eq!(c.address(), "127.0.0.1:6379");

        let c = TargetCollector::new(&proxy, fast_options()).unwrap();
        assert!(matches!(c, TargetCollector::Predixy(_)));
        assert_eq!(c.kind(), TargetKind::Proxy);
    }

    #[test]
    fn test_instantiate_rejects_bad_address() {
        let adapter = PrometheusAdapter::new(prometheus::Registry::new());
        let target = Target::new("no-port", "cache", TargetKind::CacheServer);
        assert!(matches!(
            adapter.instantiate(&target),
            Err(AdapterError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_register_twice_fails() {
        let adapter = PrometheusAdapter::with_options(prometheus::Registry::new(), fast_options());
        let target = Target::new("127.0.0.1:6379", "cache", TargetKind::CacheServer);
        let first = adapter.instantiate(&target).unwrap();
        let second = adapter.instantiate(&target).unwrap();

        adapter.register(&first).unwrap();
        assert!(matches!(
            adapter.register(&second),
            Err(AdapterError::Registration(_))
        ));

        adapter.deregister(&first);
        adapter.register(&second).unwrap();
    }

    #[test]
    fn test_distinct_targets_register_side_by_side() {
        let adapter = PrometheusAdapter::with_options(prometheus::Registry::new(), fast_options());
        for target in [
            Target::new("127.0.0.1:6379", "a", TargetKind::CacheServer),
            Target::new("127.0.0.1:6380", "b", TargetKind::CacheServer),
            Target::new("127.0.0.1:7617", "c", TargetKind::Proxy),
        ] {
            let handle = adapter.instantiate(&target).unwrap();
            adapter.register(&handle).unwrap();
        }
    }

    #[test]
    fn test_metric_family_shape() {
        let family = metric_family(
            "redis_up",
            "help",
            MetricType::GAUGE,
            vec![label_pair("addr", "127.0.0.1:6379")],
            1.0,
        );
        assert_eq!(family.get_name(), "redis_up");
        assert_eq!(family.get_field_type(), MetricType::GAUGE);
        assert_eq!(family.get_metric().len(), 1);
        assert_eq!(family.get_metric()[0].get_gauge().value(), 1.0);
    }

    fn up_value(families: &[MetricFamily], name: &str) -> f64 {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .unwrap()
            .get_metric()[0]
            .get_gauge()
            .value()
    }

    /// Accepts connections and never answers them
    fn silent_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        address
    }

    #[test]
    fn test_collect_uses_prefetched_scrape() {
        let (address, server) = serve_info_once("# Server\r\nuptime_in_seconds:5\r\n");
        let target = Target::new(address, "cache", TargetKind::CacheServer);
        let collector = TargetCollector::new(&target, fast_options()).unwrap();
        collector.prefetch();
        server.join().unwrap();

        let families = collector.collect();
        assert_eq!(up_value(&families, "redis_up"), 1.0);
        assert_eq!(up_value(&families, "redis_uptime_in_seconds"), 5.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefetch_scrapes_targets_concurrently() {
        let options = ScrapeOptions {
            timeout: Duration::from_millis(500),
        };
        let collectors: Vec<TargetCollector> = (0..4)
            .map(|i| {
                let target = Target::new(silent_endpoint(), format!("hung-{}", i), TargetKind::CacheServer);
                TargetCollector::new(&target, options).unwrap()
            })
            .collect();

        let start = Instant::now();
        prefetch(collectors.clone()).await;
        let families: Vec<MetricFamily> = collectors.iter().flat_map(|c| c.collect()).collect();
        let elapsed = start.elapsed();

        // One timeout for the batch, not one per target
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
        assert_eq!(families.iter().filter(|f| f.get_name() == "redis_up").count(), 4);
        for family in families.iter().filter(|f| f.get_name() == "redis_up") {
            assert_eq!(family.get_metric()[0].get_gauge().value(), 0.0);
        }
    }

    fn serve_info_once(body: &'static str) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // Answers exactly one connection, then the port closes
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 14];
            stream.read_exact(&mut request).unwrap();
            let reply = format!("${}\r\n{}\r\n", body.len(), body);
            stream.write_all(reply.as_bytes()).unwrap();
        });
        (address, server)
    }

    #[test]
    fn test_stale_prefetch_is_rescraped() {
        let (address, server) = serve_info_once("# Server\r\nuptime_in_seconds:5\r\n");
        let target = Target::new(address, "cache", TargetKind::CacheServer);
        let options = ScrapeOptions {
            timeout: Duration::from_millis(50),
        };
        let collector = RedisCollector::new(&target, options).unwrap();
        collector.prefetch();
        server.join().unwrap();
        thread::sleep(Duration::from_millis(300));

        // The prefetched success is too old, the live scrape finds the port closed
        let families = collector.collect();
        assert_eq!(up_value(&families, "redis_up"), 0.0);
    }
}
