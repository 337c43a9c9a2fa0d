use crate::collectors::{ProcessSource, SampleError};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt};

pub use crate::estimator::{ProcessCpu, ProcessReading};

const PROC_ROOT: &str = "/proc";
const USER_HZ: f64 = 100.0;

pub struct ProcfsProcesses {
    root: PathBuf,
}

impl ProcfsProcesses {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pids(&self) -> Result<Vec<u32>, SampleError> {
        let entries = fs::read_dir(&self.root).map_err(|e| SampleError::io(&self.root, e))?;
        Ok(entries
            .flatten()
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }
}

impl ProcessSource for ProcfsProcesses {
    fn count(&mut self) -> Result<u64, SampleError> {
        Ok(self.pids()?.len() as u64)
    }

    fn census(&mut self) -> Result<Vec<ProcessReading>, SampleError> {
        let pids = self.pids()?;
        // processes exit between listing and reading; those are skipped
        Ok(pids
            .into_iter()
            .filter_map(|pid| read_process(&self.root.join(pid.to_string()), pid))
            .collect())
    }
}

fn read_process(dir: &Path, pid: u32) -> Option<ProcessReading> {
    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let (name, cpu_secs) = parse_pid_stat(&stat)?;
    let rss_bytes = fs::read_to_string(dir.join("status"))
        .ok()
        .and_then(|s| parse_vm_rss(&s));
    Some(ProcessReading {
        pid,
        name,
        cpu: Some(ProcessCpu::CumulativeSecs(cpu_secs)),
        rss_bytes,
    })
}

pub fn parse_pid_stat(text: &str) -> Option<(String, f64)> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    if close < open {
        return None;
    }
    let name = text[open + 1..close].to_string();
    let fields: Vec<&str> = text[close + 1..].split_whitespace().collect();
    // fields[0] is the state (field 3), utime and stime are fields 14 and 15
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some((name, (utime + stime) as f64 / USER_HZ))
}

pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kb.saturating_mul(1024))
}

pub struct SysinfoProcesses {
    system: System,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ProcessSource for SysinfoProcesses {
    fn count(&mut self) -> Result<u64, SampleError> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new());
        Ok(self.system.processes().len() as u64)
    }

    fn census(&mut self) -> Result<Vec<ProcessReading>, SampleError> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        Ok(self
            .system
            .processes()
            .values()
            .map(|p| ProcessReading {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu: Some(ProcessCpu::Percent(f64::from(p.cpu_usage()))),
                rss_bytes: Some(p.memory()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (tokio-runtime (w)) S 1 4242 4242 0 -1 4194560 \
                        1500 0 0 0 250 130 0 0 20 0 8 0 123456 0 0";

    #[test]
    fn parses_pid_stat_with_parens_in_name() {
        let (name, secs) = parse_pid_stat(STAT).unwrap();
        assert_eq!(name, "tokio-runtime (w)");
        assert!((secs - 3.8).abs() < 1e-9);
    }

    #[test]
    fn truncated_pid_stat_is_rejected() {
        assert!(parse_pid_stat("1 (init) S 0 1").is_none());
        assert!(parse_pid_stat("garbage").is_none());
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tbash\nVmPeak:\t  9000 kB\nVmRSS:\t    5120 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(5120 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn procfs_census_reads_numeric_entries() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("4242");
        fs::create_dir_all(&p1).unwrap();
        fs::write(p1.join("stat"), STAT).unwrap();
        fs::write(p1.join("status"), "VmRSS:\t2048 kB\n").unwrap();

        let p2 = dir.path().join("2");
        fs::create_dir_all(&p2).unwrap();
        fs::write(p2.join("stat"), "2 (kthreadd) S 0 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1").unwrap();

        // vanished before its stat was read
        fs::create_dir_all(dir.path().join("77")).unwrap();
        fs::create_dir_all(dir.path().join("self")).unwrap();

        let mut procs = ProcfsProcesses::with_root(dir.path());
        assert_eq!(procs.count().unwrap(), 3);

        let mut readings = procs.census().unwrap();
        readings.sort_by_key(|r| r.pid);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].name, "kthreadd");
        assert_eq!(readings[0].rss_bytes, None);
        assert_eq!(readings[1].rss_bytes, Some(2048 * 1024));
        assert_eq!(readings[1].cpu, Some(ProcessCpu::CumulativeSecs(3.8)));
    }

    #[test]
    fn missing_proc_root_is_an_error() {
        let mut procs = ProcfsProcesses::with_root("/definitely/not/proc");
        assert!(matches!(procs.count(), Err(SampleError::Io { .. })));
    }
}
