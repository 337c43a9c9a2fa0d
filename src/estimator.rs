use crate::state::{percent, ProcessSample};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub total: f64,
    pub idle: f64,
}

#[derive(Debug, Default)]
pub struct CpuPercentEstimator {
    prev: Option<CpuTimes>,
}

impl CpuPercentEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns busy percent in `0..=100`. The first observation only seeds the baseline and
    /// yields 0.
    pub fn observe(&mut self, now: CpuTimes) -> f64 {
        let Some(prev) = self.prev.replace(now) else {
            return 0.0;
        };

        let total_delta = now.total - prev.total;
        let idle_delta = now.idle - prev.idle;
        if total_delta.is_nan() || total_delta <= 0.0 {
            return 0.0;
        }

        let busy = (total_delta - idle_delta) / total_delta * 100.0;
        if busy.is_nan() {
            return 0.0;
        }
        busy.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessCpu {
    CumulativeSecs(f64),
    Percent(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReading {
    pub pid: u32,
    pub name: String,
    pub cpu: Option<ProcessCpu>,
    pub rss_bytes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ProcessCpuTracker {
    prev: HashMap<u32, f64>,
    last_sample: Option<Instant>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopProcesses {
    pub top_cpu: Option<ProcessSample>,
    pub top_memory: Option<ProcessSample>,
}

impl ProcessCpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        now: Instant,
        readings: &[ProcessReading],
        logical_cores: u32,
        memory_total: u64,
    ) -> TopProcesses {
        let elapsed = self
            .last_sample
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        let cores = logical_cores.max(1) as f64;
        let mut next_prev = HashMap::with_capacity(readings.len());
        let mut top = TopProcesses::default();

        for p in readings {
            let cpu_percent = match &p.cpu {
                Some(ProcessCpu::CumulativeSecs(secs)) => {
                    next_prev.insert(p.pid, *secs);
                    match self.prev.get(&p.pid) {
                        Some(prev) if elapsed > 0.0 => {
                            let delta = (secs - prev).max(0.0);
                            Some((delta / elapsed * 100.0 / cores).clamp(0.0, 100.0))
                        }
                        _ => None,
                    }
                }
                Some(ProcessCpu::Percent(pct)) => {
                    next_prev.insert(p.pid, *pct);
                    // the rate source reports 0 for every pid on its first refresh
                    self.prev
                        .contains_key(&p.pid)
                        .then(|| (pct / cores).clamp(0.0, 100.0))
                }
                None => None,
            };

            if let Some(cpu_percent) = cpu_percent {
                let better = top
                    .top_cpu
                    .as_ref()
                    .map_or(true, |cur| cpu_percent > cur.cpu_percent);
                if better {
                    top.top_cpu = Some(ProcessSample {
                        pid: p.pid,
                        name: p.name.clone(),
                        cpu_percent,
                        memory_bytes: p.rss_bytes.unwrap_or(0),
                        memory_percent: percent(p.rss_bytes.unwrap_or(0), memory_total),
                    });
                }
            }

            if let Some(rss) = p.rss_bytes {
                let better = top
                    .top_memory
                    .as_ref()
                    .map_or(true, |cur| rss > cur.memory_bytes);
                if better {
                    top.top_memory = Some(ProcessSample {
                        pid: p.pid,
                        name: p.name.clone(),
                        cpu_percent: 0.0,
                        memory_bytes: rss,
                        memory_percent: percent(rss, memory_total),
                    });
                }
            }
        }

        self.prev = next_prev;
        self.last_sample = Some(now);
        top
    }
}
