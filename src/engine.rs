use crate::cache::Cached;
use crate::collectors::gpu::combine_gpus;
use crate::collectors::{Platform, Sampled};
use crate::config::ResourcesConfig;
use crate::estimator::{ProcessCpuTracker, TopProcesses};
use crate::history::HistoryRing;
use crate::metrics::Metrics;
use crate::state::{
    CpuDynamics, CpuIdentity, CpuStats, DiskStat, GpuStat, HistoryPoint, MemoryStats, Snapshot,
    SnapshotErrors,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

struct Published {
    snapshot: Snapshot,
    history: HistoryRing,
}

#[derive(Clone)]
pub struct ResourceMonitor {
    shared: Arc<RwLock<Published>>,
    config: ResourcesConfig,
    metrics: Arc<Metrics>,
}

impl ResourceMonitor {
    pub fn new(config: ResourcesConfig, metrics: Arc<Metrics>) -> Self {
        let history = HistoryRing::new(config.history_max_age, config.history_max_points);
        Self {
            shared: Arc::new(RwLock::new(Published {
                snapshot: Snapshot::default(),
                history,
            })),
            config,
            metrics,
        }
    }

    pub fn start(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let platform = Platform::detect(&self.config);
        self.start_with(platform, shutdown)
    }

    /// Ticks immediately, then every `tick_interval`, until `shutdown` flips to `true`
    /// or its sender goes away.
    pub fn start_with(
        &self,
        platform: Platform,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut sampler = Sampler::new(platform, &self.config);
        let tick_interval = self.config.tick_interval;

        tokio::spawn(async move {
            info!(
                platform = sampler.platform_name(),
                tick_interval = ?tick_interval,
                "мониторинг ресурсов запущен"
            );
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("получен сигнал остановки мониторинга ресурсов");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let snapshot = sampler.tick(Instant::now(), now_millis()).await;
                        monitor.publish(snapshot).await;
                    }
                }
            }
        })
    }

    pub async fn snapshot(&self, include_history: bool) -> Snapshot {
        let guard = self.shared.read().await;
        let mut snapshot = guard.snapshot.clone();
        snapshot.history = include_history.then(|| guard.history.to_vec());
        snapshot
    }

    async fn publish(&self, snapshot: Snapshot) {
        let point = HistoryPoint::from_snapshot(&snapshot);
        let history_points = {
            let mut guard = self.shared.write().await;
            guard.snapshot = snapshot.clone();
            guard.history.push(point);
            guard.history.len()
        };
        self.metrics.update_from_snapshot(&snapshot, history_points);
    }
}

struct Sampler {
    platform: Platform,
    top_processes: bool,
    gpu_tool_timeout: Duration,
    host_ip: Cached<String>,
    cpu_static: Cached<CpuIdentity>,
    cpu_dynamic: Cached<CpuDynamics>,
    disks: Cached<Vec<DiskStat>>,
    gpus: Cached<Vec<GpuStat>>,
    gpu_inventory: Cached<Vec<GpuStat>>,
    process_cpu: ProcessCpuTracker,
}

impl Sampler {
    fn new(platform: Platform, cfg: &ResourcesConfig) -> Self {
        Self {
            platform,
            top_processes: cfg.top_processes,
            gpu_tool_timeout: cfg.gpu_tool_timeout,
            host_ip: Cached::new(cfg.host_ip_ttl),
            cpu_static: Cached::new(cfg.cpu_static_ttl),
            cpu_dynamic: Cached::new(cfg.cpu_dynamic_ttl),
            disks: Cached::new(cfg.disks_ttl),
            gpus: Cached::new(cfg.gpus_ttl),
            gpu_inventory: Cached::new(cfg.hardware_meta_ttl),
            process_cpu: ProcessCpuTracker::new(),
        }
    }

    fn platform_name(&self) -> &'static str {
        self.platform.name
    }

    async fn tick(&mut self, now: Instant, now_ms: i64) -> Snapshot {
        let platform = &mut self.platform;

        let (host_ip, host_ip_err) = self
            .host_ip
            .get_or_refresh(now, || platform.host_ip.preferred_ip().into());

        let mut cpu_errors = Vec::new();
        let busy = match platform.cpu_load.busy_percent() {
            Ok(v) => v,
            Err(err) => {
                cpu_errors.push(err.to_string());
                0.0
            }
        };
        let (identity, identity_err) = self
            .cpu_static
            .get_or_refresh(now, || platform.cpu_info.identity());
        let (dynamics, dynamics_err) = self
            .cpu_dynamic
            .get_or_refresh(now, || platform.cpu_info.dynamics());
        cpu_errors.extend(identity_err);
        cpu_errors.extend(dynamics_err);
        let cpu = CpuStats::assemble(busy, &identity, &dynamics);

        let Sampled {
            value: memory,
            error: memory_err,
        } = platform.memory.memory();
        let memory: MemoryStats = memory.unwrap_or_default();

        let (disks, disks_err) = self.disks.get_or_refresh(now, || platform.disks.disks());

        if self.gpus.needs_refresh(now) {
            let (inventory, inventory_err) = self
                .gpu_inventory
                .get_or_refresh(now, || platform.gpu_inventory.inventory().into());
            let probe = platform.gpu_probe.probe(self.gpu_tool_timeout).await;
            self.gpus
                .store(now, combine_gpus(inventory, inventory_err, probe));
        }
        let (gpus, gpus_err) = self.gpus.current();

        let mut processes = 0;
        let mut top = TopProcesses::default();
        let mut counted = false;
        if self.top_processes {
            match platform.processes.census() {
                Ok(readings) => {
                    processes = readings.len() as u64;
                    counted = true;
                    top = self.process_cpu.observe(
                        now,
                        &readings,
                        cpu.logical_cores,
                        memory.total_bytes,
                    );
                }
                Err(err) => cpu_errors.push(format!("топ процессов: {err}")),
            }
        }
        if !counted {
            match platform.processes.count() {
                Ok(n) => processes = n,
                Err(err) => cpu_errors.push(format!("процессы: {err}")),
            }
        }

        let errors = SnapshotErrors {
            cpu: cpu_errors.join("; "),
            memory: memory_err.unwrap_or_default(),
            disks: disks_err.unwrap_or_default(),
            gpus: gpus_err.unwrap_or_default(),
            host_ip: host_ip_err.unwrap_or_default(),
        };
        for (family, error) in errors.entries() {
            if !error.is_empty() {
                debug!(family, error, "семейство метрик вернуло ошибку");
            }
        }

        Snapshot {
            host_ip,
            updated_at: now_ms,
            cpu,
            memory,
            disks,
            gpus,
            processes,
            top_cpu: top.top_cpu,
            top_memory: top.top_memory,
            history: None,
            errors,
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
