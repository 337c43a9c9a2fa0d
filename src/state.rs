use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub host_ip: String,
    pub updated_at: i64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disks: Vec<DiskStat>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuStat>,
    pub processes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_cpu: Option<ProcessSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_memory: Option<ProcessSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryPoint>>,
    pub errors: SnapshotErrors,
}

/// Empty string means the family is healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotErrors {
    pub cpu: String,
    pub memory: String,
    pub disks: String,
    pub gpus: String,
    pub host_ip: String,
}

impl SnapshotErrors {
    pub fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("cpu", self.cpu.as_str()),
            ("memory", self.memory.as_str()),
            ("disks", self.disks.as_str()),
            ("gpus", self.gpus.as_str()),
            ("host_ip", self.host_ip.as_str()),
        ]
    }

    pub fn failed_families(&self) -> Vec<&'static str> {
        self.entries()
            .into_iter()
            .filter(|(_, msg)| !msg.is_empty())
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub percent: f64,
    pub model: String,
    pub physical_cores: u32,
    pub logical_cores: u32,
    #[serde(rename = "currentMHz")]
    pub current_mhz: f64,
    #[serde(rename = "maxMHz")]
    pub max_mhz: f64,
    pub current_percent_of_max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    pub performance_cores: u32,
    pub efficiency_cores: u32,
    pub performance_threads: u32,
    pub efficiency_threads: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuIdentity {
    pub model: String,
    pub physical_cores: u32,
    pub logical_cores: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuDynamics {
    pub current_mhz: f64,
    pub max_mhz: f64,
    pub current_percent_of_max: f64,
    pub temperature_c: Option<f64>,
    pub performance_cores: u32,
    pub efficiency_cores: u32,
    pub performance_threads: u32,
    pub efficiency_threads: u32,
}

impl CpuStats {
    pub fn assemble(percent: f64, identity: &CpuIdentity, dynamics: &CpuDynamics) -> Self {
        Self {
            percent,
            model: identity.model.clone(),
            physical_cores: identity.physical_cores,
            logical_cores: identity.logical_cores,
            current_mhz: dynamics.current_mhz,
            max_mhz: dynamics.max_mhz,
            current_percent_of_max: dynamics.current_percent_of_max,
            temperature_c: dynamics.temperature_c,
            performance_cores: dynamics.performance_cores,
            efficiency_cores: dynamics.efficiency_cores,
            performance_threads: dynamics.performance_threads,
            efficiency_threads: dynamics.efficiency_threads,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_used_percent: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<MemoryModule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub swap_devices: Vec<SwapDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryModule {
    pub label: String,
    pub vendor: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStat {
    pub mountpoint: String,
    pub device: String,
    pub filesystem: String,
    pub drive_type: String,
    pub model: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStat {
    pub index: u32,
    pub name: String,
    pub vendor: String,
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub time: i64,
    pub cpu: f64,
    pub mem: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub disks: BTreeMap<String, f64>,
}

impl HistoryPoint {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let disks = snapshot
            .disks
            .iter()
            .filter(|d| !d.mountpoint.is_empty())
            .map(|d| (d.mountpoint.clone(), d.used_percent))
            .collect();
        Self {
            time: snapshot.updated_at,
            cpu: snapshot.cpu.percent,
            mem: snapshot.memory.used_percent,
            disks,
        }
    }
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_point_keeps_only_named_mounts() {
        let snapshot = Snapshot {
            updated_at: 42,
            cpu: CpuStats {
                percent: 12.5,
                ..CpuStats::default()
            },
            memory: MemoryStats {
                used_percent: 40.0,
                ..MemoryStats::default()
            },
            disks: vec![
                DiskStat {
                    mountpoint: "/".to_string(),
                    used_percent: 70.0,
                    ..DiskStat::default()
                },
                DiskStat {
                    mountpoint: String::new(),
                    used_percent: 5.0,
                    ..DiskStat::default()
                },
            ],
            ..Snapshot::default()
        };

        let point = HistoryPoint::from_snapshot(&snapshot);
        assert_eq!(point.time, 42);
        assert_eq!(point.cpu, 12.5);
        assert_eq!(point.mem, 40.0);
        assert_eq!(point.disks.len(), 1);
        assert_eq!(point.disks.get("/"), Some(&70.0));
    }

    #[test]
    fn snapshot_serializes_camel_case_and_omits_history() {
        let json = serde_json::to_value(Snapshot::default()).expect("сериализация снимка");
        assert!(json.get("hostIp").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(json["cpu"].get("currentMHz").is_some());
        assert!(json["errors"].get("hostIp").is_some());
        assert!(json.get("history").is_none());
        assert!(json.get("gpus").is_none());
    }

    #[test]
    fn failed_families_lists_non_empty_errors() {
        let errors = SnapshotErrors {
            disks: "нет данных".to_string(),
            host_ip: "нет интерфейсов".to_string(),
            ..SnapshotErrors::default()
        };
        assert_eq!(errors.failed_families(), vec!["disks", "host_ip"]);
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
