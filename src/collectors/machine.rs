//! Host level collector
//!
//! Reports memory, swap, load and uptime of the machine the exporter runs on.
//! Registered once at startup, independent of the configured targets.

use super::metric_family;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{MetricFamily, MetricType};
use std::collections::HashMap;
use std::sync::Mutex;
use sysinfo::System;

const MACHINE_METRICS: &[(&str, &str)] = &[
    ("machine_memory_total_bytes", "Total physical memory"),
    ("machine_memory_used_bytes", "Used physical memory"),
    ("machine_memory_available_bytes", "Memory available for new allocations"),
    ("machine_swap_total_bytes", "Total swap space"),
    ("machine_swap_used_bytes", "Used swap space"),
    ("machine_load1", "One minute load average"),
    ("machine_load5", "Five minute load average"),
    ("machine_load15", "Fifteen minute load average"),
    ("machine_cpu_count", "Number of logical CPUs"),
    ("machine_uptime_seconds", "Seconds since the machine booted"),
];

pub struct MachineCollector {
    system: Mutex<System>,
    descs: Vec<Desc>,
}

impl MachineCollector {
    pub fn new() -> prometheus::Result<Self> {
        let descs = MACHINE_METRICS
            .iter()
            .map(|(name, help)| {
                Desc::new(
                    name.to_string(),
                    help.to_string(),
                    Vec::new(),
                    HashMap::new(),
                )
            })
            .collect::<prometheus::Result<Vec<_>>>()?;

        Ok(Self {
            system: Mutex::new(System::new()),
            descs,
        })
    }

    fn sample(&self) -> [f64; 10] {
        // A poisoned lock only means a previous scrape panicked mid-refresh
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        system.refresh_cpu();

        let load = System::load_average();
        [
            system.total_memory() as f64,
            system.used_memory() as f64,
            system.available_memory() as f64,
            system.total_swap() as f64,
            system.used_swap() as f64,
            load.one,
            load.five,
            load.fifteen,
            system.cpus().len() as f64,
            System::uptime() as f64,
        ]
    }
}

impl Collector for MachineCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        MACHINE_METRICS
            .iter()
            .zip(self.sample())
            .map(|((name, help), value)| {
                metric_family(name, help, MetricType::GAUGE, Vec::new(), value)
            })
            .collect()
    }
}
