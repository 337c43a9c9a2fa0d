use crate::collectors::{MemorySource, SampleError, Sampled};
use crate::state::{percent, MemoryModule, MemoryStats, SwapDevice};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{System, SystemExt};
use tracing::debug;

const DMI_ENTRIES: &str = "/sys/firmware/dmi/entries";
const PROC_SWAPS: &str = "/proc/swaps";
const DEVICE_TREE_MODELS: [&str; 2] = [
    "/proc/device-tree/model",
    "/sys/firmware/devicetree/base/model",
];

pub struct SystemMemory {
    system: System,
    dmi_root: PathBuf,
    swaps_path: PathBuf,
    model_paths: Vec<PathBuf>,
    modules: Option<Vec<MemoryModule>>,
    board_model: Option<String>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self::with_paths(
            DMI_ENTRIES,
            PROC_SWAPS,
            DEVICE_TREE_MODELS.iter().map(PathBuf::from).collect(),
        )
    }

    pub fn with_paths(
        dmi_root: impl Into<PathBuf>,
        swaps_path: impl Into<PathBuf>,
        model_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            system: System::new(),
            dmi_root: dmi_root.into(),
            swaps_path: swaps_path.into(),
            model_paths,
            modules: None,
            board_model: None,
        }
    }

    fn modules(&mut self, total_bytes: u64) -> Vec<MemoryModule> {
        if self.modules.is_none() {
            let modules = match read_dmi_modules(&self.dmi_root) {
                Ok(m) => m,
                Err(err) => {
                    debug!(error = %err, "инвентарь модулей памяти недоступен");
                    Vec::new()
                }
            };
            self.modules = Some(modules);
        }

        let modules = self.modules.clone().unwrap_or_default();
        if !modules.is_empty() {
            return modules;
        }

        let model = self.board_model();
        if model.to_lowercase().contains("raspberry pi") {
            return vec![MemoryModule {
                label: "SoC".to_string(),
                vendor: model,
                size_bytes: total_bytes,
            }];
        }
        Vec::new()
    }

    fn board_model(&mut self) -> String {
        if let Some(model) = &self.board_model {
            return model.clone();
        }
        let model = self
            .model_paths
            .iter()
            .filter_map(|p| fs::read(p).ok())
            .map(|b| {
                String::from_utf8_lossy(&b)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string()
            })
            .find(|m| !m.is_empty())
            .unwrap_or_default();
        self.board_model = Some(model.clone());
        model
    }
}

impl MemorySource for SystemMemory {
    fn memory(&mut self) -> Sampled<MemoryStats> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Sampled::failed("сведения о памяти недоступны");
        }
        let used = self.system.used_memory();
        let swap_total = self.system.total_swap();
        let swap_used = self.system.used_swap();

        let swap_devices = read_swap_devices(&self.swaps_path).unwrap_or_default();

        Sampled::ok(MemoryStats {
            total_bytes: total,
            used_bytes: used,
            used_percent: percent(used, total),
            swap_total_bytes: swap_total,
            swap_used_bytes: swap_used,
            swap_used_percent: percent(swap_used, swap_total),
            modules: self.modules(total),
            swap_devices,
        })
    }
}

pub fn read_swap_devices(path: &Path) -> Result<Vec<SwapDevice>, SampleError> {
    let text = fs::read_to_string(path).map_err(|e| SampleError::io(path, e))?;
    Ok(parse_swaps(&text))
}

pub fn parse_swaps(text: &str) -> Vec<SwapDevice> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let size_kb = fields[2].parse::<u64>().unwrap_or(0);
            let used_kb = fields[3].parse::<u64>().unwrap_or(0);
            Some(SwapDevice {
                name: fields[0].to_string(),
                kind: fields[1].to_string(),
                size_bytes: size_kb.saturating_mul(1024),
                used_bytes: used_kb.saturating_mul(1024),
            })
        })
        .collect()
}

fn read_dmi_modules(root: &Path) -> Result<Vec<MemoryModule>, SampleError> {
    let entries = fs::read_dir(root).map_err(|e| SampleError::io(root, e))?;
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("17-"))
        .map(|e| e.path())
        .collect();
    dirs.sort();

    let mut modules = Vec::new();
    for dir in dirs {
        let raw_path = dir.join("raw");
        let raw = fs::read(&raw_path).map_err(|e| SampleError::io(&raw_path, e))?;
        if let Some(module) = parse_memory_device(&raw) {
            modules.push(module);
        }
    }
    Ok(modules)
}

pub fn parse_memory_device(raw: &[u8]) -> Option<MemoryModule> {
    if raw.len() < 0x15 || raw[0] != 17 {
        return None;
    }
    let len = raw[1] as usize;
    if len < 0x15 || raw.len() < len {
        return None;
    }

    let size_word = u16::from_le_bytes([raw[0x0C], raw[0x0D]]);
    let size_bytes = match size_word {
        0 => return None,
        0xFFFF => 0,
        0x7FFF if len >= 0x20 => {
            let ext = u32::from_le_bytes([raw[0x1C], raw[0x1D], raw[0x1E], raw[0x1F]]);
            u64::from(ext & 0x7FFF_FFFF) * 1024 * 1024
        }
        w if w & 0x8000 != 0 => u64::from(w & 0x7FFF) * 1024,
        w => u64::from(w) * 1024 * 1024,
    };

    let strings = smbios_strings(&raw[len..]);
    let string_at = |offset: usize| -> String {
        if offset >= len {
            return String::new();
        }
        let idx = raw[offset] as usize;
        if idx == 0 {
            return String::new();
        }
        strings
            .get(idx - 1)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut label = string_at(0x10);
    if label.is_empty() {
        label = string_at(0x11);
    }

    Some(MemoryModule {
        label,
        vendor: string_at(0x17),
        size_bytes,
    })
}

fn smbios_strings(area: &[u8]) -> Vec<String> {
    area.split(|b| *b == 0)
        .take_while(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect()
}
