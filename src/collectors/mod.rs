pub mod cpu;
pub mod disks;
pub mod gpu;
pub mod host_ip;
pub mod memory;
pub mod processes;

use crate::config::ResourcesConfig;
use crate::state::{CpuDynamics, CpuIdentity, DiskStat, GpuStat, MemoryStats};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0}")]
    Parse(String),
    #[error("не поддерживается на {0}")]
    Unsupported(&'static str),
    #[error("{0} не найден")]
    ToolMissing(&'static str),
    #[error("{tool}: превышено время ожидания {timeout:?}")]
    ToolTimeout {
        tool: &'static str,
        timeout: Duration,
    },
    #[error("{tool}: {message}")]
    ToolFailed { tool: &'static str, message: String },
}

impl SampleError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of one sampler call: a value, a value with a warning, or only an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampled<T> {
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> Sampled<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn partial(value: T, error: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            error: Some(error.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<String>) -> Self {
        if warnings.is_empty() {
            Self::ok(value)
        } else {
            Self::partial(value, warnings.join("; "))
        }
    }
}

impl<T> From<Result<T, SampleError>> for Sampled<T> {
    fn from(result: Result<T, SampleError>) -> Self {
        match result {
            Ok(v) => Self::ok(v),
            Err(err) => Self::failed(err.to_string()),
        }
    }
}

pub trait HostIpSource: Send {
    fn preferred_ip(&mut self) -> Result<String, SampleError>;
}

pub trait CpuLoadSource: Send {
    fn busy_percent(&mut self) -> Result<f64, SampleError>;
}

pub trait CpuInfoSource: Send {
    fn identity(&mut self) -> Sampled<CpuIdentity>;
    fn dynamics(&mut self) -> Sampled<CpuDynamics>;
}

pub trait MemorySource: Send {
    fn memory(&mut self) -> Sampled<MemoryStats>;
}

pub trait DiskSource: Send {
    fn disks(&mut self) -> Sampled<Vec<DiskStat>>;
}

pub trait GpuInventorySource: Send {
    fn inventory(&mut self) -> Result<Vec<GpuStat>, SampleError>;
}

#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn probe(&self, timeout: Duration) -> Result<Vec<gpu::GpuReading>, SampleError>;
}

pub trait ProcessSource: Send {
    fn count(&mut self) -> Result<u64, SampleError>;
    fn census(&mut self) -> Result<Vec<processes::ProcessReading>, SampleError>;
}

pub struct Platform {
    pub name: &'static str,
    pub host_ip: Box<dyn HostIpSource>,
    pub cpu_load: Box<dyn CpuLoadSource>,
    pub cpu_info: Box<dyn CpuInfoSource>,
    pub memory: Box<dyn MemorySource>,
    pub disks: Box<dyn DiskSource>,
    pub gpu_inventory: Box<dyn GpuInventorySource>,
    pub gpu_probe: Box<dyn GpuProbe>,
    pub processes: Box<dyn ProcessSource>,
}

impl Platform {
    pub fn detect(cfg: &ResourcesConfig) -> Self {
        let name = std::env::consts::OS;
        let host_ip: Box<dyn HostIpSource> = Box::new(host_ip::InterfaceHostIp);
        let memory: Box<dyn MemorySource> = Box::new(memory::SystemMemory::new());
        let disks: Box<dyn DiskSource> = Box::new(disks::SystemDisks::new(
            disks::DiskPolicy::for_os(name),
            cfg.hardware_meta_ttl,
        ));
        let gpu_probe: Box<dyn GpuProbe> = Box::new(gpu::NvidiaSmi);

        if cfg!(target_os = "linux") {
            Self {
                name,
                host_ip,
                cpu_load: Box::new(cpu::ProcStatLoad::new()),
                cpu_info: Box::new(cpu::SysfsCpuInfo::new()),
                memory,
                disks,
                gpu_inventory: Box::new(gpu::DrmInventory::new()),
                gpu_probe,
                processes: Box::new(processes::ProcfsProcesses::new()),
            }
        } else {
            Self {
                name,
                host_ip,
                cpu_load: Box::new(cpu::SysinfoLoad::new()),
                cpu_info: Box::new(cpu::SysinfoCpuInfo::new()),
                memory,
                disks,
                gpu_inventory: Box::new(gpu::NoInventory),
                gpu_probe,
                processes: Box::new(processes::SysinfoProcesses::new()),
            }
        }
    }
}

pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | 'e' | 'E' | '-' | '+'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
