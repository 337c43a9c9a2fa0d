use crate::cache::Cached;
use crate::collectors::{DiskSource, SampleError, Sampled};
use crate::state::{percent, DiskStat};
use std::collections::{BTreeSet, HashMap};
#[cfg(unix)]
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{DiskExt, DiskKind, System, SystemExt};
use tracing::debug;

const PROC_MOUNTS: &str = "/proc/self/mounts";
const SYSFS_ROOT: &str = "/sys";

const IGNORED_FS_TYPES: &[&str] = &[
    "autofs",
    "binfmt_misc",
    "bpf",
    "cgroup",
    "cgroup2",
    "configfs",
    "debugfs",
    "devfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "fusectl",
    "fuse.portal",
    "hugetlbfs",
    "mqueue",
    "nsfs",
    "overlay",
    "proc",
    "pstore",
    "ramfs",
    "rpc_pipefs",
    "securityfs",
    "selinuxfs",
    "squashfs",
    "sysfs",
    "tmpfs",
    "tracefs",
];

const REMOVABLE_ROOTS: &[&str] = &["/mnt/", "/media/", "/run/media/"];
const SYSTEM_ROOTS: &[&str] = &["/sys/", "/proc/", "/dev/"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPolicy {
    Linux,
    DriveLetters,
    RootOnly,
}

impl DiskPolicy {
    pub fn for_os(os: &str) -> Self {
        match os {
            "linux" => Self::Linux,
            "windows" => Self::DriveLetters,
            _ => Self::RootOnly,
        }
    }

    /// Sorted, de-duplicated mountpoints to report. Never empty while `mounts` has a named
    /// entry.
    pub fn select(self, mounts: &[MountEntry]) -> Vec<String> {
        let mut selected = BTreeSet::new();

        match self {
            Self::Linux => {
                selected.insert("/".to_string());
                for m in mounts {
                    let mp = m.mountpoint.trim();
                    if mp.is_empty() || mp == "/" {
                        continue;
                    }
                    if IGNORED_FS_TYPES.contains(&m.fstype.as_str()) {
                        continue;
                    }
                    if mp == "/mnt" || REMOVABLE_ROOTS.iter().any(|r| mp.starts_with(r)) {
                        selected.insert(mp.to_string());
                        continue;
                    }
                    let dev = m.device.trim();
                    if dev.starts_with("/dev/") && !dev.contains("loop") {
                        selected.insert(mp.to_string());
                        continue;
                    }
                    if mp.starts_with('/') && !SYSTEM_ROOTS.iter().any(|r| mp.starts_with(r)) {
                        selected.insert(mp.to_string());
                    }
                }
            }
            Self::DriveLetters => {
                for m in mounts {
                    if m.mountpoint.as_bytes().get(1) == Some(&b':') {
                        selected.insert(m.mountpoint.clone());
                    }
                }
            }
            Self::RootOnly => {
                selected.insert("/".to_string());
            }
        }

        if selected.is_empty() {
            if let Some(m) = mounts.iter().find(|m| !m.mountpoint.is_empty()) {
                selected.insert(m.mountpoint.clone());
            }
        }

        selected.into_iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskMeta {
    pub drive_type: String,
    pub model: String,
}

struct Listed {
    device: String,
    filesystem: String,
    kind: DiskKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    pub total: u64,
    pub free: u64,
}

pub trait MountUsage: Send {
    fn usage(&mut self, mountpoint: &str) -> Result<SpaceUsage, SampleError>;
}

#[cfg(unix)]
pub struct Statvfs;

#[cfg(unix)]
impl MountUsage for Statvfs {
    fn usage(&mut self, mountpoint: &str) -> Result<SpaceUsage, SampleError> {
        let c_path = CString::new(mountpoint)
            .map_err(|e| SampleError::Parse(format!("{mountpoint}: {e}")))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(SampleError::io(mountpoint, std::io::Error::last_os_error()));
        }

        let block_size = stat.f_frsize as u64;
        Ok(SpaceUsage {
            total: (stat.f_blocks as u64).saturating_mul(block_size),
            free: (stat.f_bfree as u64).saturating_mul(block_size),
        })
    }
}

#[cfg(not(unix))]
pub struct SysinfoSpace {
    system: System,
}

#[cfg(not(unix))]
impl MountUsage for SysinfoSpace {
    fn usage(&mut self, mountpoint: &str) -> Result<SpaceUsage, SampleError> {
        self.system.refresh_disks_list();
        self.system
            .disks()
            .iter()
            .find(|d| d.mount_point() == Path::new(mountpoint))
            .map(|d| SpaceUsage {
                total: d.total_space(),
                free: d.available_space(),
            })
            .ok_or_else(|| SampleError::Parse(format!("{mountpoint}: нет в списке дисков")))
    }
}

fn default_space() -> Box<dyn MountUsage> {
    #[cfg(unix)]
    {
        Box::new(Statvfs)
    }
    #[cfg(not(unix))]
    {
        Box::new(SysinfoSpace {
            system: System::new(),
        })
    }
}

pub struct SystemDisks {
    system: System,
    policy: DiskPolicy,
    mounts_path: PathBuf,
    sys_root: PathBuf,
    space: Box<dyn MountUsage>,
    meta: Cached<HashMap<String, DiskMeta>>,
}

impl SystemDisks {
    pub fn new(policy: DiskPolicy, meta_ttl: Duration) -> Self {
        Self::with_parts(policy, meta_ttl, PROC_MOUNTS, SYSFS_ROOT, default_space())
    }

    pub fn with_parts(
        policy: DiskPolicy,
        meta_ttl: Duration,
        mounts_path: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        space: Box<dyn MountUsage>,
    ) -> Self {
        Self {
            system: System::new(),
            policy,
            mounts_path: mounts_path.into(),
            sys_root: sys_root.into(),
            space,
            meta: Cached::new(meta_ttl),
        }
    }

    fn listed_disks(&mut self) -> HashMap<String, Listed> {
        self.system.refresh_disks_list();
        let mut out = HashMap::new();
        for d in self.system.disks() {
            let mp = d.mount_point().to_string_lossy().to_string();
            out.entry(mp).or_insert_with(|| Listed {
                device: d.name().to_string_lossy().to_string(),
                filesystem: String::from_utf8_lossy(d.file_system()).to_string(),
                kind: d.kind(),
            });
        }
        out
    }
}

impl DiskSource for SystemDisks {
    fn disks(&mut self) -> Sampled<Vec<DiskStat>> {
        let listed = self.listed_disks();

        let mounts = match (self.policy, read_mounts(&self.mounts_path)) {
            (DiskPolicy::Linux, Ok(m)) if !m.is_empty() => m,
            (_, res) => {
                if let (DiskPolicy::Linux, Err(err)) = (self.policy, res) {
                    debug!(error = %err, "таблица монтирования недоступна, используется sysinfo");
                }
                let mut m: Vec<MountEntry> = listed
                    .iter()
                    .map(|(mp, d)| MountEntry {
                        device: d.device.clone(),
                        mountpoint: mp.clone(),
                        fstype: d.filesystem.clone(),
                    })
                    .collect();
                m.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
                m
            }
        };
        if mounts.is_empty() {
            return Sampled::failed("точки монтирования не найдены");
        }

        let selected = self.policy.select(&mounts);
        let by_mount: HashMap<&str, &MountEntry> = mounts
            .iter()
            .map(|m| (m.mountpoint.as_str(), m))
            .collect();

        let (meta, meta_err) = {
            let policy = self.policy;
            let sys_root = self.sys_root.clone();
            let kinds: HashMap<String, DiskKind> =
                listed.iter().map(|(mp, d)| (mp.clone(), d.kind)).collect();
            self.meta.get_or_refresh(Instant::now(), || {
                disk_inventory(policy, &sys_root, &mounts, &kinds)
            })
        };

        let mut out = Vec::with_capacity(selected.len());
        let mut warnings = Vec::new();
        for mp in &selected {
            let space = match self.space.usage(mp) {
                Ok(space) => space,
                Err(err) => {
                    warnings.push(format!("использование {mp}: {err}"));
                    continue;
                }
            };
            let entry = by_mount.get(mp.as_str());
            let fallback = listed.get(mp);
            let device = entry
                .map(|e| e.device.trim().to_string())
                .filter(|d| !d.is_empty())
                .or_else(|| fallback.map(|d| d.device.clone()))
                .unwrap_or_default();
            let filesystem = entry
                .map(|e| e.fstype.trim().to_string())
                .filter(|f| !f.is_empty())
                .or_else(|| fallback.map(|d| d.filesystem.clone()))
                .unwrap_or_default();
            let used = space.total.saturating_sub(space.free);
            let m = meta.get(mp).cloned().unwrap_or_default();

            out.push(DiskStat {
                mountpoint: mp.clone(),
                device,
                filesystem,
                drive_type: m.drive_type,
                model: m.model,
                total_bytes: space.total,
                used_bytes: used,
                used_percent: percent(used, space.total),
            });
        }

        if out.is_empty() {
            return Sampled::failed(format!(
                "нет данных об использовании для {}: {}",
                selected.join(", "),
                warnings.join("; ")
            ));
        }
        if let Some(err) = meta_err {
            warnings.push(format!("метаданные дисков: {err}"));
        }
        Sampled::with_warnings(out, warnings)
    }
}

pub fn read_mounts(path: &Path) -> Result<Vec<MountEntry>, SampleError> {
    let text = fs::read_to_string(path).map_err(|e| SampleError::io(path, e))?;
    Ok(parse_mounts(&text))
}

pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mountpoint: unescape_mount_field(mountpoint),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn unescape_mount_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn disk_inventory(
    policy: DiskPolicy,
    sys_root: &Path,
    mounts: &[MountEntry],
    kinds: &HashMap<String, DiskKind>,
) -> Sampled<HashMap<String, DiskMeta>> {
    let mut meta: HashMap<String, DiskMeta> = kinds
        .iter()
        .filter_map(|(mp, kind)| {
            let drive_type = match kind {
                DiskKind::SSD => "SSD",
                DiskKind::HDD => "HDD",
                DiskKind::Unknown(_) => return None,
            };
            Some((
                mp.clone(),
                DiskMeta {
                    drive_type: drive_type.to_string(),
                    model: String::new(),
                },
            ))
        })
        .collect();

    if policy != DiskPolicy::Linux {
        return Sampled::ok(meta);
    }

    let class_block = sys_root.join("class/block");
    if let Err(err) = fs::read_dir(&class_block) {
        return Sampled::partial(meta, SampleError::io(&class_block, err).to_string());
    }

    for m in mounts {
        let Some(name) = m.device.strip_prefix("/dev/") else {
            continue;
        };
        if name.contains('/') {
            continue;
        }
        if let Some(found) = block_device_meta(sys_root, name) {
            meta.insert(m.mountpoint.clone(), found);
        }
    }

    Sampled::ok(meta)
}

fn block_device_meta(sys_root: &Path, name: &str) -> Option<DiskMeta> {
    let node = fs::canonicalize(sys_root.join("class/block").join(name)).ok()?;
    let disk_dir = if node.join("partition").exists() {
        node.parent()?.to_path_buf()
    } else {
        node
    };
    let disk = disk_dir.file_name()?.to_string_lossy().to_string();

    let read = |rel: &str| -> String {
        fs::read_to_string(disk_dir.join(rel))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let model = normalize_spaces(&format!("{} {}", read("device/vendor"), read("device/model")));
    let drive_type = if disk.starts_with("nvme") {
        "NVMe".to_string()
    } else if disk.starts_with("mmcblk") {
        "MMC".to_string()
    } else if disk.starts_with("vd") {
        "VIRTIO".to_string()
    } else {
        match read("queue/rotational").as_str() {
            "0" => "SSD".to_string(),
            "1" => "HDD".to_string(),
            _ => String::new(),
        }
    };

    if model.is_empty() && drive_type.is_empty() {
        return None;
    }
    Some(DiskMeta { drive_type, model })
}

fn normalize_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(device: &str, mountpoint: &str, fstype: &str) -> MountEntry {
        MountEntry {
            device: device.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.to_string(),
        }
    }

    #[test]
    fn linux_policy_always_includes_root() {
        let mounts = vec![
            mount("proc", "/proc", "proc"),
            mount("tmpfs", "/run", "tmpfs"),
            mount("sysfs", "/sys", "sysfs"),
        ];
        assert_eq!(DiskPolicy::Linux.select(&mounts), vec!["/".to_string()]);
        assert_eq!(DiskPolicy::Linux.select(&[]), vec!["/".to_string()]);
    }

    #[test]
    fn linux_policy_keeps_user_mounts_and_drops_pseudo() {
        let mounts = vec![
            mount("/dev/nvme0n1p2", "/", "ext4"),
            mount("/dev/nvme0n1p1", "/boot/efi", "vfat"),
            mount("/dev/sdb1", "/run/media/me/USB", "exfat"),
            mount("server:/export", "/mnt/nas", "nfs4"),
            mount("/dev/loop3", "/snap/core/1", "squashfs"),
            mount("/dev/loop4", "/opt/image", "ext4"),
            mount("cgroup2", "/sys/fs/cgroup", "cgroup2"),
            mount("overlay", "/var/lib/docker/overlay2/x/merged", "overlay"),
            mount("debugfs", "/sys/kernel/debug", "debugfs"),
            mount("/dev/sdc1", "/dev/odd", "ext4"),
        ];
        let selected = DiskPolicy::Linux.select(&mounts);
        assert_eq!(
            selected,
            vec![
                "/",
                "/boot/efi",
                "/dev/odd",
                "/mnt/nas",
                "/opt/image",
                "/run/media/me/USB"
            ]
        );
    }

    #[test]
    fn drive_letter_policy_takes_letters() {
        let mounts = vec![
            mount("", "C:\\", "NTFS"),
            mount("", "D:\\", "FAT32"),
            mount("", "\\\\?\\Volume{x}", "NTFS"),
        ];
        assert_eq!(
            DiskPolicy::DriveLetters.select(&mounts),
            vec!["C:\\".to_string(), "D:\\".to_string()]
        );
    }

    #[test]
    fn empty_selection_falls_back_to_first_mount() {
        let mounts = vec![mount("", "", "x"), mount("", "\\\\?\\Volume{x}", "NTFS")];
        assert_eq!(
            DiskPolicy::DriveLetters.select(&mounts),
            vec!["\\\\?\\Volume{x}".to_string()]
        );
    }

    #[test]
    fn policy_is_chosen_by_os() {
        assert_eq!(DiskPolicy::for_os("linux"), DiskPolicy::Linux);
        assert_eq!(DiskPolicy::for_os("windows"), DiskPolicy::DriveLetters);
        assert_eq!(DiskPolicy::for_os("macos"), DiskPolicy::RootOnly);
    }

    #[test]
    fn parses_escaped_mount_table() {
        let text = "/dev/sda1 / ext4 rw,relatime 0 0\n\
                    /dev/sdb1 /media/me/My\\040Disk vfat rw 0 0\n\
                    broken\n";
        let mounts = parse_mounts(text);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].mountpoint, "/media/me/My Disk");
        assert_eq!(mounts[1].fstype, "vfat");
    }

    #[cfg(unix)]
    #[test]
    fn inventory_resolves_partition_to_parent_disk() {
        use std::os::unix::fs::symlink;
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path();

        let nvme = sys.join("devices/pci0000:00/nvme/nvme0/nvme0n1");
        fs::create_dir_all(nvme.join("nvme0n1p2")).unwrap();
        fs::create_dir_all(nvme.join("device")).unwrap();
        fs::write(nvme.join("nvme0n1p2/partition"), "2\n").unwrap();
        fs::write(nvme.join("device/model"), "Samsung SSD  980 PRO 1TB   \n").unwrap();

        let sda = sys.join("devices/ata1/sda");
        fs::create_dir_all(sda.join("queue")).unwrap();
        fs::create_dir_all(sda.join("device")).unwrap();
        fs::write(sda.join("queue/rotational"), "1\n").unwrap();
        fs::write(sda.join("device/vendor"), "ATA\n").unwrap();
        fs::write(sda.join("device/model"), "WDC WD40EFRX\n").unwrap();

        fs::create_dir_all(sys.join("class/block")).unwrap();
        symlink(nvme.join("nvme0n1p2"), sys.join("class/block/nvme0n1p2")).unwrap();
        symlink(&sda, sys.join("class/block/sda")).unwrap();

        let mounts = vec![
            mount("/dev/nvme0n1p2", "/", "ext4"),
            mount("/dev/sda", "/srv/backup", "xfs"),
            mount("/dev/mapper/vg-home", "/home", "ext4"),
            mount("tmpfs", "/tmp", "tmpfs"),
        ];
        let sampled = disk_inventory(DiskPolicy::Linux, sys, &mounts, &HashMap::new());
        assert!(sampled.error.is_none());
        let meta = sampled.value.unwrap();

        assert_eq!(
            meta.get("/"),
            Some(&DiskMeta {
                drive_type: "NVMe".to_string(),
                model: "Samsung SSD 980 PRO 1TB".to_string(),
            })
        );
        assert_eq!(
            meta.get("/srv/backup"),
            Some(&DiskMeta {
                drive_type: "HDD".to_string(),
                model: "ATA WDC WD40EFRX".to_string(),
            })
        );
        assert!(meta.get("/home").is_none());
        assert!(meta.get("/tmp").is_none());
    }

    struct FakeSpace(HashMap<&'static str, SpaceUsage>);
    impl MountUsage for FakeSpace {
        fn usage(&mut self, mountpoint: &str) -> Result<SpaceUsage, SampleError> {
            self.0
                .get(mountpoint)
                .copied()
                .ok_or_else(|| SampleError::Parse(format!("{mountpoint}: нет ответа")))
        }
    }

    const MOUNT_TABLE: &str = "/dev/sda1 / ext4 rw,relatime 0 0\n\
                               server:/export /mnt/nas nfs4 rw 0 0\n\
                               /dev/sdb1 /mnt/gone ext4 rw 0 0\n\
                               proc /proc proc rw 0 0\n";

    fn disks_with(space: FakeSpace) -> (SystemDisks, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, MOUNT_TABLE).unwrap();
        let sys_root = dir.path().join("no-sysfs");
        let disks = SystemDisks::with_parts(
            DiskPolicy::Linux,
            Duration::from_secs(30),
            mounts,
            sys_root,
            Box::new(space),
        );
        (disks, dir)
    }

    #[test]
    fn every_selected_mount_is_queried_for_usage() {
        let space = FakeSpace(HashMap::from([
            ("/", SpaceUsage { total: 1_000, free: 250 }),
            ("/mnt/nas", SpaceUsage { total: 4_000, free: 1_000 }),
        ]));
        let (mut disks, _dir) = disks_with(space);

        let sampled = disks.disks();
        let stats = sampled.value.expect("статистика дисков");
        let mountpoints: Vec<&str> = stats.iter().map(|d| d.mountpoint.as_str()).collect();
        assert_eq!(mountpoints, vec!["/", "/mnt/nas"]);

        let nas = &stats[1];
        assert_eq!(nas.device, "server:/export");
        assert_eq!(nas.filesystem, "nfs4");
        assert_eq!(nas.total_bytes, 4_000);
        assert_eq!(nas.used_bytes, 3_000);
        assert_eq!(nas.used_percent, 75.0);
        assert_eq!(stats[0].used_bytes, 750);

        // metadata is missing, the mounts are still reported
        let err = sampled.error.expect("предупреждения");
        assert!(err.contains("/mnt/gone"), "{err}");
        assert!(err.contains("метаданные дисков"), "{err}");
    }

    #[test]
    fn no_usage_for_any_mount_is_an_error() {
        let (mut disks, _dir) = disks_with(FakeSpace(HashMap::new()));
        let sampled = disks.disks();
        assert!(sampled.value.is_none());
        let err = sampled.error.unwrap();
        assert!(err.contains("нет данных об использовании"), "{err}");
        assert!(err.contains("/mnt/nas"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn statvfs_reports_root_filesystem() {
        let space = Statvfs.usage("/").unwrap();
        assert!(space.total > 0);
        assert!(space.free <= space.total);
        assert!(Statvfs.usage("/definitely/not/mounted").is_err());
    }

    #[test]
    fn inventory_without_sysfs_reports_error_but_keeps_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let kinds = HashMap::from([("/".to_string(), DiskKind::SSD)]);
        let sampled = disk_inventory(DiskPolicy::Linux, dir.path(), &[], &kinds);
        assert!(sampled.error.is_some());
        assert_eq!(
            sampled.value.unwrap().get("/").map(|m| m.drive_type.as_str()),
            Some("SSD")
        );
    }
}
