use crate::collectors::{parse_f64_loose, GpuInventorySource, GpuProbe, SampleError, Sampled};
use crate::state::GpuStat;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const NVIDIA_SMI: &str = "nvidia-smi";
const NVIDIA_SMI_ARGS: [&str; 2] = [
    "--query-gpu=name,utilization.gpu,memory.used,memory.total,temperature.gpu",
    "--format=csv,noheader,nounits",
];
const MIB: f64 = 1024.0 * 1024.0;

const DRM_ROOT: &str = "/sys/class/drm";
const PCI_IDS: [&str; 2] = ["/usr/share/hwdata/pci.ids", "/usr/share/misc/pci.ids"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuReading {
    pub name: String,
    pub utilization_percent: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub temperature_c: Option<f64>,
}

pub struct NvidiaSmi;

#[async_trait]
impl GpuProbe for NvidiaSmi {
    async fn probe(&self, timeout: Duration) -> Result<Vec<GpuReading>, SampleError> {
        let path = find_nvidia_smi().ok_or(SampleError::ToolMissing(NVIDIA_SMI))?;
        let stdout = run_tool(NVIDIA_SMI, &path, &NVIDIA_SMI_ARGS, timeout).await?;
        Ok(parse_nvidia_smi_csv(&stdout))
    }
}

pub(crate) async fn run_tool(
    tool: &'static str,
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<String, SampleError> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return Err(SampleError::ToolTimeout { tool, timeout }),
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
            return Err(SampleError::ToolMissing(tool))
        }
        Ok(Err(err)) => {
            return Err(SampleError::ToolFailed {
                tool,
                message: err.to_string(),
            })
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(SampleError::ToolFailed {
            tool,
            message: format!("{}: {detail}", output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn find_nvidia_smi() -> Option<PathBuf> {
    let exe = if cfg!(windows) {
        "nvidia-smi.exe"
    } else {
        NVIDIA_SMI
    };
    if let Some(paths) = std::env::var_os("PATH") {
        if let Some(found) = std::env::split_paths(&paths)
            .map(|dir| dir.join(exe))
            .find(|p| p.is_file())
        {
            return Some(found);
        }
    }

    if cfg!(windows) {
        for var in ["ProgramFiles", "ProgramFiles(x86)"] {
            let Some(base) = std::env::var_os(var) else {
                continue;
            };
            let candidate = PathBuf::from(base)
                .join("NVIDIA Corporation")
                .join("NVSMI")
                .join(exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

pub fn parse_nvidia_smi_csv(text: &str) -> Vec<GpuReading> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 5 {
                return None;
            }
            let mib = |s: &str| parse_f64_loose(s).map(|v| (v.max(0.0) * MIB) as u64);
            Some(GpuReading {
                name: parts[0].to_string(),
                utilization_percent: parse_f64_loose(parts[1]),
                memory_used_bytes: mib(parts[2]),
                memory_total_bytes: mib(parts[3]),
                temperature_c: parse_f64_loose(parts[4]),
            })
        })
        .collect()
}

/// Overlays tool readings onto the inventory.
///
/// Readings pair with NVIDIA-tagged inventory entries by position, which is only an
/// approximation when the two sources enumerate adapters in different orders. Without any
/// such entry the readings become new entries of their own.
pub fn merge_gpu_readings(inventory: Vec<GpuStat>, readings: &[GpuReading]) -> Vec<GpuStat> {
    let mut gpus = inventory;
    let nvidia: Vec<usize> = gpus
        .iter()
        .enumerate()
        .filter(|(_, g)| g.vendor.to_lowercase().contains("nvidia"))
        .map(|(i, _)| i)
        .collect();

    if nvidia.is_empty() {
        for (i, r) in readings.iter().enumerate() {
            gpus.push(GpuStat {
                index: i as u32,
                name: r.name.clone(),
                vendor: "NVIDIA".to_string(),
                driver: String::new(),
                utilization_percent: r.utilization_percent,
                memory_total_bytes: r.memory_total_bytes,
                memory_used_bytes: r.memory_used_bytes,
                temperature_c: r.temperature_c,
            });
        }
        return gpus;
    }

    for (pos, r) in nvidia.into_iter().zip(readings) {
        let gpu = &mut gpus[pos];
        if gpu.name.trim().is_empty() {
            gpu.name = r.name.clone();
        }
        gpu.utilization_percent = r.utilization_percent;
        gpu.memory_total_bytes = r.memory_total_bytes;
        gpu.memory_used_bytes = r.memory_used_bytes;
        gpu.temperature_c = r.temperature_c;
    }
    gpus
}

/// Builds the GPU family result from both sources. Only a double failure with nothing to
/// show is an error.
pub fn combine_gpus(
    inventory: Vec<GpuStat>,
    inventory_error: Option<String>,
    probe: Result<Vec<GpuReading>, SampleError>,
) -> Sampled<Vec<GpuStat>> {
    let (readings, probe_error) = match probe {
        Ok(r) => (r, None),
        Err(err) => (Vec::new(), Some(err.to_string())),
    };
    let gpus = merge_gpu_readings(inventory, &readings);

    if gpus.is_empty() {
        if let (Some(inv), Some(tool)) = (inventory_error, probe_error) {
            return Sampled::failed(format!("gpu: инвентарь={inv}; {NVIDIA_SMI}={tool}"));
        }
    }
    Sampled::ok(gpus)
}

pub struct DrmInventory {
    drm_root: PathBuf,
    pci_ids: Vec<PathBuf>,
}

impl DrmInventory {
    pub fn new() -> Self {
        Self::with_paths(DRM_ROOT, PCI_IDS.iter().map(PathBuf::from).collect())
    }

    pub fn with_paths(drm_root: impl Into<PathBuf>, pci_ids: Vec<PathBuf>) -> Self {
        Self {
            drm_root: drm_root.into(),
            pci_ids,
        }
    }
}

impl GpuInventorySource for DrmInventory {
    fn inventory(&mut self) -> Result<Vec<GpuStat>, SampleError> {
        let entries =
            fs::read_dir(&self.drm_root).map_err(|e| SampleError::io(&self.drm_root, e))?;

        let mut cards: Vec<(u32, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let index = name.strip_prefix("card")?.parse::<u32>().ok()?;
                Some((index, e.path().join("device")))
            })
            .collect();
        cards.sort_by_key(|(index, _)| *index);
        if cards.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<(String, String)> = cards
            .iter()
            .map(|(_, dev)| (read_hex_id(&dev.join("vendor")), read_hex_id(&dev.join("device"))))
            .collect();
        let vendors: Vec<&str> = ids.iter().map(|(v, _)| v.as_str()).collect();
        let names = self
            .pci_ids
            .iter()
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|db| pci_names(&db, &vendors))
            .unwrap_or_default();

        Ok(cards
            .iter()
            .zip(ids)
            .map(|((index, dev), (vendor_id, device_id))| {
                let driver = fs::read_link(dev.join("driver"))
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                    .unwrap_or_default();
                let (vendor_name, device_name) = names
                    .get(&vendor_id)
                    .map(|v| (v.name.clone(), v.devices.get(&device_id).cloned()))
                    .unwrap_or_default();
                let vendor = if vendor_name.is_empty() {
                    known_vendor(&vendor_id).to_string()
                } else {
                    vendor_name
                };
                let name = device_name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| if vendor.is_empty() { driver.clone() } else { vendor.clone() });

                GpuStat {
                    index: *index,
                    name,
                    vendor,
                    driver,
                    ..GpuStat::default()
                }
            })
            .collect())
    }
}

pub struct NoInventory;

impl GpuInventorySource for NoInventory {
    fn inventory(&mut self) -> Result<Vec<GpuStat>, SampleError> {
        Err(SampleError::Unsupported(std::env::consts::OS))
    }
}

fn read_hex_id(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().trim_start_matches("0x").to_lowercase())
        .unwrap_or_default()
}

fn known_vendor(id: &str) -> &'static str {
    match id {
        "10de" => "NVIDIA",
        "1002" => "AMD",
        "8086" => "Intel",
        "1af4" => "Red Hat",
        "15ad" => "VMware",
        "1234" => "QEMU",
        "1414" => "Microsoft",
        _ => "",
    }
}

#[derive(Debug, Default, Clone)]
struct PciVendor {
    name: String,
    devices: HashMap<String, String>,
}

fn pci_names(db: &str, vendors: &[&str]) -> HashMap<String, PciVendor> {
    let mut out: HashMap<String, PciVendor> = HashMap::new();
    let mut current: Option<String> = None;

    for line in db.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if line.starts_with("C ") {
            // device class section follows the vendor list
            break;
        }
        if let Some(rest) = line.strip_prefix('\t') {
            if rest.starts_with('\t') {
                continue;
            }
            let Some(vendor) = current.as_ref() else {
                continue;
            };
            if let Some((id, name)) = rest.split_once("  ") {
                if let Some(v) = out.get_mut(vendor) {
                    v.devices.insert(id.trim().to_lowercase(), name.trim().to_string());
                }
            }
            continue;
        }

        current = None;
        if let Some((id, name)) = line.split_once("  ") {
            let id = id.trim().to_lowercase();
            if vendors.contains(&id.as_str()) {
                out.insert(
                    id.clone(),
                    PciVendor {
                        name: name.trim().to_string(),
                        devices: HashMap::new(),
                    },
                );
                current = Some(id);
            }
        }
    }
    out
}
