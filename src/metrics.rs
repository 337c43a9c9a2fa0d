use crate::state::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub linksd_cpu_usage_percent: Gauge,
    pub linksd_cpu_temperature_celsius: GaugeVec,
    pub linksd_memory_used_bytes: Gauge,
    pub linksd_memory_total_bytes: Gauge,
    pub linksd_memory_usage_percent: Gauge,
    pub linksd_swap_used_bytes: Gauge,
    pub linksd_swap_total_bytes: Gauge,
    pub linksd_disk_used_bytes: GaugeVec,
    pub linksd_disk_total_bytes: GaugeVec,
    pub linksd_disk_usage_percent: GaugeVec,
    pub linksd_gpu_utilization_percent: GaugeVec,
    pub linksd_gpu_memory_used_bytes: GaugeVec,
    pub linksd_gpu_memory_total_bytes: GaugeVec,
    pub linksd_gpu_temperature_celsius: GaugeVec,
    pub linksd_processes: Gauge,
    pub linksd_history_points: Gauge,
    pub linksd_last_tick_timestamp_seconds: Gauge,
    pub linksd_uptime_seconds: Gauge,
    pub linksd_ticks_total: Counter,
    pub linksd_family_errors_total: CounterVec,
    pub linksd_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let linksd_cpu_usage_percent = Gauge::with_opts(opts!(
            "linksd_cpu_usage_percent",
            "Host CPU busy time in percent (0..100)"
        ))?;
        let linksd_cpu_temperature_celsius = GaugeVec::new(
            opts!(
                "linksd_cpu_temperature_celsius",
                "Best CPU temperature sensor reading in Celsius; absent without a sensor"
            ),
            &["model"],
        )?;
        let linksd_memory_used_bytes =
            Gauge::with_opts(opts!("linksd_memory_used_bytes", "Used RAM in bytes"))?;
        let linksd_memory_total_bytes =
            Gauge::with_opts(opts!("linksd_memory_total_bytes", "Total RAM in bytes"))?;
        let linksd_memory_usage_percent =
            Gauge::with_opts(opts!("linksd_memory_usage_percent", "RAM usage in percent"))?;
        let linksd_swap_used_bytes =
            Gauge::with_opts(opts!("linksd_swap_used_bytes", "Used swap in bytes"))?;
        let linksd_swap_total_bytes =
            Gauge::with_opts(opts!("linksd_swap_total_bytes", "Total swap in bytes"))?;
        let linksd_disk_used_bytes = GaugeVec::new(
            opts!("linksd_disk_used_bytes", "Disk used bytes by mount"),
            &["mount"],
        )?;
        let linksd_disk_total_bytes = GaugeVec::new(
            opts!("linksd_disk_total_bytes", "Disk total bytes by mount"),
            &["mount"],
        )?;
        let linksd_disk_usage_percent = GaugeVec::new(
            opts!("linksd_disk_usage_percent", "Disk usage in percent by mount"),
            &["mount"],
        )?;
        let linksd_gpu_utilization_percent = GaugeVec::new(
            opts!(
                "linksd_gpu_utilization_percent",
                "GPU utilization in percent by adapter"
            ),
            &["index", "name"],
        )?;
        let linksd_gpu_memory_used_bytes = GaugeVec::new(
            opts!(
                "linksd_gpu_memory_used_bytes",
                "GPU memory used bytes by adapter"
            ),
            &["index", "name"],
        )?;
        let linksd_gpu_memory_total_bytes = GaugeVec::new(
            opts!(
                "linksd_gpu_memory_total_bytes",
                "GPU memory total bytes by adapter"
            ),
            &["index", "name"],
        )?;
        let linksd_gpu_temperature_celsius = GaugeVec::new(
            opts!(
                "linksd_gpu_temperature_celsius",
                "GPU temperature in Celsius by adapter"
            ),
            &["index", "name"],
        )?;
        let linksd_processes =
            Gauge::with_opts(opts!("linksd_processes", "Number of running processes"))?;
        let linksd_history_points = Gauge::with_opts(opts!(
            "linksd_history_points",
            "Points currently held in the resource history"
        ))?;
        let linksd_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "linksd_last_tick_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;
        let linksd_uptime_seconds =
            Gauge::with_opts(opts!("linksd_uptime_seconds", "Service uptime in seconds"))?;
        let linksd_ticks_total = Counter::with_opts(opts!(
            "linksd_ticks_total",
            "Published resource snapshots"
        ))?;
        let linksd_family_errors_total = CounterVec::new(
            opts!(
                "linksd_family_errors_total",
                "Snapshots that carried an error, by metric family"
            ),
            &["family"],
        )?;
        let linksd_scrape_count_total = Counter::with_opts(opts!(
            "linksd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &linksd_cpu_usage_percent)?;
        register(&registry, &linksd_cpu_temperature_celsius)?;
        register(&registry, &linksd_memory_used_bytes)?;
        register(&registry, &linksd_memory_total_bytes)?;
        register(&registry, &linksd_memory_usage_percent)?;
        register(&registry, &linksd_swap_used_bytes)?;
        register(&registry, &linksd_swap_total_bytes)?;
        register(&registry, &linksd_disk_used_bytes)?;
        register(&registry, &linksd_disk_total_bytes)?;
        register(&registry, &linksd_disk_usage_percent)?;
        register(&registry, &linksd_gpu_utilization_percent)?;
        register(&registry, &linksd_gpu_memory_used_bytes)?;
        register(&registry, &linksd_gpu_memory_total_bytes)?;
        register(&registry, &linksd_gpu_temperature_celsius)?;
        register(&registry, &linksd_processes)?;
        register(&registry, &linksd_history_points)?;
        register(&registry, &linksd_last_tick_timestamp_seconds)?;
        register(&registry, &linksd_uptime_seconds)?;
        register(&registry, &linksd_ticks_total)?;
        register(&registry, &linksd_family_errors_total)?;
        register(&registry, &linksd_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            linksd_cpu_usage_percent,
            linksd_cpu_temperature_celsius,
            linksd_memory_used_bytes,
            linksd_memory_total_bytes,
            linksd_memory_usage_percent,
            linksd_swap_used_bytes,
            linksd_swap_total_bytes,
            linksd_disk_used_bytes,
            linksd_disk_total_bytes,
            linksd_disk_usage_percent,
            linksd_gpu_utilization_percent,
            linksd_gpu_memory_used_bytes,
            linksd_gpu_memory_total_bytes,
            linksd_gpu_temperature_celsius,
            linksd_processes,
            linksd_history_points,
            linksd_last_tick_timestamp_seconds,
            linksd_uptime_seconds,
            linksd_ticks_total,
            linksd_family_errors_total,
            linksd_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot, history_points: usize) {
        self.linksd_ticks_total.inc();
        for family in snapshot.errors.failed_families() {
            self.linksd_family_errors_total
                .with_label_values(&[family])
                .inc();
        }

        self.linksd_cpu_usage_percent.set(snapshot.cpu.percent);
        self.linksd_cpu_temperature_celsius.reset();
        if let Some(t) = snapshot.cpu.temperature_c {
            self.linksd_cpu_temperature_celsius
                .with_label_values(&[&snapshot.cpu.model])
                .set(t);
        }

        let mem = &snapshot.memory;
        self.linksd_memory_used_bytes.set(mem.used_bytes as f64);
        self.linksd_memory_total_bytes.set(mem.total_bytes as f64);
        self.linksd_memory_usage_percent.set(mem.used_percent);
        self.linksd_swap_used_bytes.set(mem.swap_used_bytes as f64);
        self.linksd_swap_total_bytes.set(mem.swap_total_bytes as f64);

        self.linksd_disk_used_bytes.reset();
        self.linksd_disk_total_bytes.reset();
        self.linksd_disk_usage_percent.reset();
        for d in &snapshot.disks {
            self.linksd_disk_used_bytes
                .with_label_values(&[&d.mountpoint])
                .set(d.used_bytes as f64);
            self.linksd_disk_total_bytes
                .with_label_values(&[&d.mountpoint])
                .set(d.total_bytes as f64);
            self.linksd_disk_usage_percent
                .with_label_values(&[&d.mountpoint])
                .set(d.used_percent);
        }

        self.linksd_gpu_utilization_percent.reset();
        self.linksd_gpu_memory_used_bytes.reset();
        self.linksd_gpu_memory_total_bytes.reset();
        self.linksd_gpu_temperature_celsius.reset();
        for g in &snapshot.gpus {
            let index = g.index.to_string();
            let labels = [index.as_str(), g.name.as_str()];
            if let Some(v) = g.utilization_percent {
                self.linksd_gpu_utilization_percent
                    .with_label_values(&labels)
                    .set(v);
            }
            if let Some(v) = g.memory_used_bytes {
                self.linksd_gpu_memory_used_bytes
                    .with_label_values(&labels)
                    .set(v as f64);
            }
            if let Some(v) = g.memory_total_bytes {
                self.linksd_gpu_memory_total_bytes
                    .with_label_values(&labels)
                    .set(v as f64);
            }
            if let Some(v) = g.temperature_c {
                self.linksd_gpu_temperature_celsius
                    .with_label_values(&labels)
                    .set(v);
            }
        }

        self.linksd_processes.set(snapshot.processes as f64);
        self.linksd_history_points.set(history_points as f64);
        self.linksd_last_tick_timestamp_seconds
            .set(snapshot.updated_at as f64 / 1000.0);
        self.linksd_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64().floor());
    }

    pub fn inc_scrape_count(&self) {
        self.linksd_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiskStat, GpuStat, SnapshotErrors};

    fn snapshot() -> Snapshot {
        let mut s = Snapshot {
            updated_at: 1_700_000_000_000,
            processes: 321,
            disks: vec![DiskStat {
                mountpoint: "/".to_string(),
                total_bytes: 100,
                used_bytes: 25,
                used_percent: 25.0,
                ..DiskStat::default()
            }],
            gpus: vec![GpuStat {
                index: 0,
                name: "RTX".to_string(),
                utilization_percent: Some(40.0),
                ..GpuStat::default()
            }],
            errors: SnapshotErrors {
                gpus: "nvidia-smi не найден".to_string(),
                ..SnapshotErrors::default()
            },
            ..Snapshot::default()
        };
        s.cpu.percent = 12.5;
        s
    }

    #[test]
    fn snapshot_is_exported() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.update_from_snapshot(&snapshot(), 7);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();

        assert!(text.contains("linksd_cpu_usage_percent 12.5"));
        assert!(text.contains("linksd_disk_usage_percent{mount=\"/\"} 25"));
        assert!(text.contains("linksd_gpu_utilization_percent{index=\"0\",name=\"RTX\"} 40"));
        assert!(text.contains("linksd_processes 321"));
        assert!(text.contains("linksd_history_points 7"));
        assert!(text.contains("linksd_family_errors_total{family=\"gpus\"} 1"));
        assert!(text.contains("linksd_ticks_total 1"));
        assert!(!text.contains("linksd_gpu_temperature_celsius{"));
    }

    #[test]
    fn vanished_mounts_are_dropped() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut s = snapshot();
        s.disks[0].mountpoint = "/mnt/usb".to_string();
        metrics.update_from_snapshot(&s, 1);
        metrics.update_from_snapshot(&snapshot(), 2);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text.contains("/mnt/usb"));
        assert!(text.contains("linksd_ticks_total 2"));
    }

    #[test]
    fn cpu_temperature_is_absent_without_sensor() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut s = snapshot();
        s.cpu.model = "Test CPU".to_string();
        s.cpu.temperature_c = Some(48.5);
        metrics.update_from_snapshot(&s, 1);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("linksd_cpu_temperature_celsius{model=\"Test CPU\"} 48.5"));

        s.cpu.temperature_c = None;
        metrics.update_from_snapshot(&s, 2);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text.contains("linksd_cpu_temperature_celsius{"));
    }
}
