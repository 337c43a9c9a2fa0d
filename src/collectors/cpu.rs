use crate::collectors::{CpuInfoSource, CpuLoadSource, SampleError, Sampled};
use crate::estimator::{CpuPercentEstimator, CpuTimes};
use crate::state::{CpuDynamics, CpuIdentity};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";
const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
const SYSFS_THERMAL_ROOT: &str = "/sys/class/thermal";

pub struct ProcStatLoad {
    path: PathBuf,
    estimator: CpuPercentEstimator,
}

impl ProcStatLoad {
    pub fn new() -> Self {
        Self::with_path(PROC_STAT)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            estimator: CpuPercentEstimator::new(),
        }
    }
}

impl CpuLoadSource for ProcStatLoad {
    fn busy_percent(&mut self) -> Result<f64, SampleError> {
        let text = fs::read_to_string(&self.path).map_err(|e| SampleError::io(&self.path, e))?;
        let times = parse_proc_stat(&text)?;
        Ok(self.estimator.observe(times))
    }
}

/// Parses the aggregate `cpu` line. Guest time is already part of user time, so only
/// user..steal are summed.
pub fn parse_proc_stat(text: &str) -> Result<CpuTimes, SampleError> {
    let line = text
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SampleError::Parse("в /proc/stat нет строки cpu".to_string()))?;

    let values: Vec<f64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| SampleError::Parse(format!("/proc/stat: {e}")))?;
    if values.len() < 4 {
        return Err(SampleError::Parse(
            "в строке cpu меньше четырёх счётчиков".to_string(),
        ));
    }

    let idle = values[3] + values.get(4).copied().unwrap_or(0.0);
    Ok(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

pub struct SysinfoLoad {
    system: System,
    seeded: bool,
}

impl SysinfoLoad {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            seeded: false,
        }
    }
}

impl CpuLoadSource for SysinfoLoad {
    fn busy_percent(&mut self) -> Result<f64, SampleError> {
        self.system.refresh_cpu();
        if self.system.cpus().is_empty() {
            return Err(SampleError::Unsupported(std::env::consts::OS));
        }
        // the first refresh reports the average since boot
        if !self.seeded {
            self.seeded = true;
            return Ok(0.0);
        }
        let usage = self.system.global_cpu_info().cpu_usage() as f64;
        if !usage.is_finite() {
            return Ok(0.0);
        }
        Ok(usage.clamp(0.0, 100.0))
    }
}

fn sysinfo_identity(system: &mut System) -> Sampled<CpuIdentity> {
    system.refresh_cpu();
    let mut warnings = Vec::new();
    let mut identity = CpuIdentity::default();

    match system.cpus().first() {
        Some(cpu) => identity.model = cpu.brand().trim().to_string(),
        None => warnings.push("сведения о CPU недоступны".to_string()),
    }
    identity.logical_cores = system.cpus().len() as u32;
    match system.physical_core_count() {
        Some(n) => identity.physical_cores = n as u32,
        None => warnings.push("число физических ядер неизвестно".to_string()),
    }

    Sampled::with_warnings(identity, warnings)
}

pub struct SysinfoCpuInfo {
    system: System,
}

impl SysinfoCpuInfo {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_components_list();
        Self { system }
    }
}

impl CpuInfoSource for SysinfoCpuInfo {
    fn identity(&mut self) -> Sampled<CpuIdentity> {
        sysinfo_identity(&mut self.system)
    }

    fn dynamics(&mut self) -> Sampled<CpuDynamics> {
        self.system.refresh_cpu();
        let freqs: Vec<f64> = self
            .system
            .cpus()
            .iter()
            .map(|c| c.frequency() as f64)
            .filter(|f| *f > 0.0)
            .collect();

        let mut dynamics = CpuDynamics::default();
        if !freqs.is_empty() {
            dynamics.current_mhz = freqs.iter().sum::<f64>() / freqs.len() as f64;
        }

        self.system.refresh_components();
        let candidates = component_temperatures(&self.system);
        dynamics.temperature_c = pick_cpu_temperature(&candidates);

        if self.system.cpus().is_empty() {
            return Sampled::partial(dynamics, "частота CPU недоступна");
        }
        Sampled::ok(dynamics)
    }
}

pub struct SysfsCpuInfo {
    system: System,
    cpu_root: PathBuf,
    thermal_root: PathBuf,
}

impl SysfsCpuInfo {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_CPU_ROOT, SYSFS_THERMAL_ROOT)
    }

    pub fn with_roots(cpu_root: impl Into<PathBuf>, thermal_root: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_components_list();
        Self {
            system,
            cpu_root: cpu_root.into(),
            thermal_root: thermal_root.into(),
        }
    }
}

impl CpuInfoSource for SysfsCpuInfo {
    fn identity(&mut self) -> Sampled<CpuIdentity> {
        sysinfo_identity(&mut self.system)
    }

    fn dynamics(&mut self) -> Sampled<CpuDynamics> {
        let mut warnings = Vec::new();
        let mut dynamics = CpuDynamics::default();

        match cpu_freq_summary(&self.cpu_root) {
            Ok(freq) => {
                dynamics.current_mhz = freq.current_mhz;
                dynamics.max_mhz = freq.max_mhz;
                if freq.max_mhz > 0.0 && freq.current_mhz > 0.0 {
                    dynamics.current_percent_of_max = freq.current_mhz / freq.max_mhz * 100.0;
                }
                dynamics.performance_cores = freq.performance_cores;
                dynamics.efficiency_cores = freq.efficiency_cores;
                dynamics.performance_threads = freq.performance_threads;
                dynamics.efficiency_threads = freq.efficiency_threads;
            }
            Err(err) => warnings.push(format!("частота CPU: {err}")),
        }

        self.system.refresh_components();
        let mut candidates = component_temperatures(&self.system);
        candidates.extend(thermal_zone_temperatures(&self.thermal_root));
        dynamics.temperature_c = pick_cpu_temperature(&candidates);

        Sampled::with_warnings(dynamics, warnings)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuFreqSummary {
    pub current_mhz: f64,
    pub max_mhz: f64,
    pub performance_cores: u32,
    pub efficiency_cores: u32,
    pub performance_threads: u32,
    pub efficiency_threads: u32,
}

const HYBRID_MIN_GAP_KHZ: i64 = 100_000;
const HYBRID_TOLERANCE_KHZ: i64 = 50_000;

pub fn cpu_freq_summary(cpu_root: &Path) -> Result<CpuFreqSummary, SampleError> {
    let entries = fs::read_dir(cpu_root).map_err(|e| SampleError::io(cpu_root, e))?;

    #[derive(Default)]
    struct CoreAgg {
        max_khz: i64,
        threads: u32,
    }

    let mut cores: HashMap<String, CoreAgg> = HashMap::new();
    let mut cur_sum_khz = 0_i64;
    let mut cur_count = 0_i64;

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name.strip_prefix("cpu") else {
            continue;
        };
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let base = entry.path();
        let Some(max_khz) = read_positive_i64(&base.join("cpufreq/cpuinfo_max_freq"))
            .or_else(|| read_positive_i64(&base.join("cpufreq/scaling_max_freq")))
        else {
            continue;
        };

        if let Some(cur) = read_positive_i64(&base.join("cpufreq/scaling_cur_freq"))
            .or_else(|| read_positive_i64(&base.join("cpufreq/cpuinfo_cur_freq")))
        {
            cur_sum_khz += cur;
            cur_count += 1;
        }

        let package = read_i64(&base.join("topology/physical_package_id"));
        let core = read_i64(&base.join("topology/core_id"));
        let key = match (package, core) {
            (Some(p), Some(c)) => format!("{p}:{c}"),
            _ => name.clone(),
        };

        let agg = cores.entry(key).or_default();
        agg.max_khz = agg.max_khz.max(max_khz);
        agg.threads += 1;
    }

    let distinct: BTreeSet<i64> = cores.values().map(|c| c.max_khz).collect();
    let (Some(&eff_khz), Some(&perf_khz)) = (distinct.first(), distinct.last()) else {
        return Err(SampleError::Parse("данные cpufreq не найдены".to_string()));
    };

    let mut summary = CpuFreqSummary {
        max_mhz: perf_khz as f64 / 1000.0,
        ..CpuFreqSummary::default()
    };
    if cur_count > 0 {
        summary.current_mhz = cur_sum_khz as f64 / cur_count as f64 / 1000.0;
    }

    if distinct.len() >= 2 && (perf_khz - eff_khz).abs() >= HYBRID_MIN_GAP_KHZ {
        for c in cores.values() {
            if (c.max_khz - perf_khz).abs() <= HYBRID_TOLERANCE_KHZ {
                summary.performance_cores += 1;
                summary.performance_threads += c.threads;
            } else if (c.max_khz - eff_khz).abs() <= HYBRID_TOLERANCE_KHZ {
                summary.efficiency_cores += 1;
                summary.efficiency_threads += c.threads;
            }
        }
    }

    Ok(summary)
}

fn read_i64(path: &Path) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse::<i64>().ok()
}

fn read_positive_i64(path: &Path) -> Option<i64> {
    read_i64(path).filter(|v| *v > 0)
}

fn component_temperatures(system: &System) -> Vec<(String, f64)> {
    system
        .components()
        .iter()
        .map(|c| (c.label().to_string(), c.temperature() as f64))
        .collect()
}

fn thermal_zone_temperatures(root: &Path) -> Vec<(String, f64)> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }

        let typ = fs::read_to_string(path.join("type"))
            .ok()
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| name.to_string());
        let Some(v) = fs::read_to_string(path.join("temp"))
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
        else {
            continue;
        };
        let celsius = if v > 1000.0 { v / 1000.0 } else { v };
        out.push((typ, celsius));
    }

    debug!(zones = out.len(), "температуры thermal zone");
    out
}

pub fn pick_cpu_temperature(candidates: &[(String, f64)]) -> Option<f64> {
    let mut best: Option<(i32, f64)> = None;

    for (label, temp) in candidates {
        if !temp.is_finite() || *temp <= 0.0 {
            continue;
        }
        let key = label.trim().to_lowercase();
        let mut score = 0;
        if key.contains("package") || key.contains("pkg") {
            score += 50;
        } else if key.contains("tctl") || key.contains("tdie") {
            score += 40;
        }
        if key.contains("coretemp") || key.contains("k10temp") {
            score += 20;
        }
        if key.contains("cpu") {
            score += 10;
        }
        if key.contains("core") {
            score += 5;
        }

        let replace = match best {
            None => true,
            Some((s, t)) => score > s || (score == s && *temp > t),
        };
        if replace {
            best = Some((score, *temp));
        }
    }

    best.map(|(_, t)| t)
}
