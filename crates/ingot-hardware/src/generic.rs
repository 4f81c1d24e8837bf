//! The built-in hardware manager for commodity hosts.
//!
//! Reads inventory from sysfs and procfs, lists disks with `lsblk`, and
//! erases devices with ATA secure erase (`hdparm`) falling back to `shred`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{error, info, warn};

use ingot_proto::{BlockDevice, Cpu, Memory, NetworkInterface};

use crate::{support, HardwareError, HardwareManager, HardwareResult};

const HARDWARE_MANAGER_NAME: &str = "generic_hardware_manager";
const HARDWARE_MANAGER_VERSION: &str = "1.0";

/// Smallest device considered a plausible OS disk.
const MIN_OS_DISK_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Symlink the boot loader leaves behind for the virtual media device; that
/// device must never be erased.
const VIRTUAL_MEDIA_LABEL: &str = "/dev/disk/by-label/ir-vfd-dev";

pub struct GenericHardwareManager {
    sys_root: PathBuf,
    proc_root: PathBuf,
}

impl GenericHardwareManager {
    pub fn new() -> Self {
        Self::with_roots("/sys", "/proc")
    }

    /// Probe alternate sysfs/procfs roots. Used by tests.
    pub fn with_roots(sys_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            proc_root: proc_root.into(),
        }
    }

    /// An interface is physical when sysfs exposes a backing device.
    async fn is_device(&self, interface: &str) -> bool {
        let device_path = self.sys_root.join("class/net").join(interface).join("device");
        tokio::fs::metadata(&device_path).await.is_ok()
    }

    async fn interface_info(&self, interface: &str) -> HardwareResult<NetworkInterface> {
        let addr_path = self.sys_root.join("class/net").join(interface).join("address");
        let mac = tokio::fs::read_to_string(&addr_path).await?;
        Ok(NetworkInterface::new(interface, mac.trim()))
    }

    async fn is_virtual_media_device(&self, device: &BlockDevice) -> bool {
        let label = Path::new(VIRTUAL_MEDIA_LABEL);
        match tokio::fs::read_link(label).await {
            Ok(target) => {
                let base = label.parent().unwrap_or_else(|| Path::new("/"));
                normalized(base.join(target)) == Path::new(&device.name)
            }
            Err(_) => false,
        }
    }

    async fn ata_security_lines(&self, device: &BlockDevice) -> HardwareResult<Vec<String>> {
        let output = run("hdparm", &["-I", &device.name]).await?;
        Ok(parse_security_lines(&output))
    }

    /// Attempt an ATA secure erase. `Ok(false)` means the drive does not
    /// support it and the caller should fall back to another mechanism; once
    /// the drive claims support, any irregularity is a hard failure.
    async fn ata_erase(&self, device: &BlockDevice) -> HardwareResult<bool> {
        let security_lines = self.ata_security_lines(device).await?;

        if !security_lines.iter().any(|l| l == "supported") {
            return Ok(false);
        }

        if security_lines.iter().any(|l| l == "enabled") {
            return Err(HardwareError::Erase(format!(
                "block device {} already has a security password set",
                device.name
            )));
        }

        if !security_lines.iter().any(|l| l == "not frozen") {
            return Err(HardwareError::Erase(format!(
                "block device {} is frozen and cannot be erased",
                device.name
            )));
        }

        run(
            "hdparm",
            &["--user-master", "u", "--security-set-pass", "NULL", &device.name],
        )
        .await?;

        // Prefer the enhanced erase when the drive offers it.
        let erase_option = if security_lines
            .iter()
            .any(|l| l == "not supported: enhanced erase")
        {
            "--security-erase"
        } else {
            "--security-erase-enhanced"
        };

        run(
            "hdparm",
            &["--user-master", "u", erase_option, "NULL", &device.name],
        )
        .await?;

        // Security must read back as disabled or the erase did not take.
        let security_lines = self.ata_security_lines(device).await?;
        if !security_lines.iter().any(|l| l == "not enabled") {
            return Err(HardwareError::Erase(format!(
                "an unknown error occurred erasing block device {}",
                device.name
            )));
        }

        Ok(true)
    }

    /// Overwrite the device with `shred`. Pass count comes from the node's
    /// `driver_internal_info.agent_erase_devices_iterations`, default 1.
    async fn shred_device(&self, node: &Value, device: &BlockDevice) -> bool {
        let npasses = node
            .get("driver_internal_info")
            .and_then(|info| info.get("agent_erase_devices_iterations"))
            .and_then(Value::as_u64)
            .unwrap_or(1);

        match run(
            "shred",
            &[
                "--force",
                "--zero",
                "--verbose",
                "--iterations",
                &npasses.to_string(),
                &device.name,
            ],
        )
        .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(device = %device.name, error = %err, "shred failed");
                false
            }
        }
    }
}

impl Default for GenericHardwareManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareManager for GenericHardwareManager {
    fn name(&self) -> &str {
        HARDWARE_MANAGER_NAME
    }

    fn evaluate_hardware_support(&self) -> u32 {
        support::GENERIC
    }

    fn version(&self) -> String {
        HARDWARE_MANAGER_VERSION.to_string()
    }

    async fn list_network_interfaces(&self) -> HardwareResult<Vec<NetworkInterface>> {
        let net_dir = self.sys_root.join("class/net");
        let mut entries = tokio::fs::read_dir(&net_dir).await?;
        let mut interfaces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_device(&name).await {
                interfaces.push(self.interface_info(&name).await?);
            }
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    async fn get_ipv4_addr(&self, interface: &str) -> HardwareResult<Option<String>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| HardwareError::Other(e.to_string()))?;
        for ifaddr in addrs {
            if ifaddr.interface_name != interface {
                continue;
            }
            if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                return Ok(Some(sin.ip().to_string()));
            }
        }
        Ok(None)
    }

    async fn get_cpus(&self) -> HardwareResult<Cpu> {
        let cpuinfo = tokio::fs::read_to_string(self.proc_root.join("cpuinfo")).await?;
        let (model_name, frequency) = parse_cpuinfo(&cpuinfo);
        Ok(Cpu {
            model_name,
            frequency,
            count: num_cpus::get() as u32,
        })
    }

    async fn get_memory(&self) -> HardwareResult<Memory> {
        let meminfo = tokio::fs::read_to_string(self.proc_root.join("meminfo")).await?;
        Ok(Memory {
            total: parse_meminfo_total(&meminfo)?,
        })
    }

    async fn list_block_devices(&self) -> HardwareResult<Vec<BlockDevice>> {
        // -P for KEY="value" output, -b for sizes in bytes, -d to exclude
        // dependent devices, -i for ascii, -o for the exact field list
        let report = run("lsblk", &["-PbdioKNAME,MODEL,SIZE,ROTA,TYPE"]).await?;
        parse_lsblk_report(&report)
    }

    async fn get_os_install_device(&self) -> HardwareResult<String> {
        let devices = self.list_block_devices().await?;
        choose_os_install_device(devices)
    }

    async fn erase_block_device(&self, node: &Value, device: &BlockDevice) -> HardwareResult<()> {
        if self.is_virtual_media_device(device).await {
            info!(device = %device.name, "skipping erase of virtual media device");
            return Ok(());
        }

        if self.ata_erase(device).await? {
            return Ok(());
        }

        if self.shred_device(node, device).await {
            return Ok(());
        }

        error!(device = %device.name, "unable to erase block device: device is unsupported");
        Err(HardwareError::Incompatible)
    }
}

// ─── Shell + parsing helpers ─────────────────────────────────────────────────

async fn run(command: &str, args: &[&str]) -> HardwareResult<String> {
    let output = Command::new(command).args(args).output().await?;
    if !output.status.success() {
        return Err(HardwareError::Other(format!(
            "{command} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `lsblk -P` output into block devices, keeping disks only. All four
/// inventory keys must be present on every disk line.
fn parse_lsblk_report(report: &str) -> HardwareResult<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    for line in report.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = parse_key_values(line);
        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        if get("TYPE") != Some("disk") {
            continue;
        }

        let missing: Vec<&str> = ["KNAME", "MODEL", "SIZE", "ROTA"]
            .into_iter()
            .filter(|&key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(HardwareError::BlockDevice(format!(
                "{missing:?} must be returned by lsblk"
            )));
        }

        let size = get("SIZE")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                HardwareError::BlockDevice(format!("unparseable SIZE in lsblk line: {line}"))
            })?;

        devices.push(BlockDevice {
            name: format!("/dev/{}", get("KNAME").unwrap_or_default()),
            model: get("MODEL").unwrap_or_default().to_string(),
            size,
            rotational: get("ROTA") == Some("1"),
        });
    }
    Ok(devices)
}

/// Split a `KEY="value" KEY="value"` line into pairs. Values may contain
/// spaces; lsblk escapes embedded quotes.
fn parse_key_values(line: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let value_and_rest = &rest[eq + 2..];
        let Some(end) = value_and_rest.find('"') else {
            break;
        };
        pairs.push((key, value_and_rest[..end].to_string()));
        rest = &value_and_rest[end + 1..];
    }
    pairs
}

/// First `model name` / `cpu MHz` values from /proc/cpuinfo.
fn parse_cpuinfo(cpuinfo: &str) -> (Option<String>, Option<String>) {
    let mut model = None;
    let mut freq = None;
    for line in cpuinfo.lines() {
        if model.is_some() && freq.is_some() {
            break;
        }
        if model.is_none() && line.starts_with("model name") {
            model = line.split(':').nth(1).map(|v| v.trim().to_string());
        }
        if freq.is_none() && line.starts_with("cpu MHz") {
            freq = line.split(':').nth(1).map(|v| v.trim().to_string());
        }
    }
    (model, freq)
}

/// MemTotal from /proc/meminfo, converted from kB to bytes.
fn parse_meminfo_total(meminfo: &str) -> HardwareResult<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .ok_or_else(|| HardwareError::Other("MemTotal missing from meminfo".to_string()))
}

/// Pick the smallest device large enough to plausibly hold an OS.
fn choose_os_install_device(mut devices: Vec<BlockDevice>) -> HardwareResult<String> {
    devices.sort_by_key(|device| device.size);
    devices
        .into_iter()
        .find(|device| device.size >= MIN_OS_DISK_BYTES)
        .map(|device| device.name)
        .ok_or_else(|| {
            HardwareError::BlockDevice("no suitable device found for OS installation".to_string())
        })
}

/// Security section of `hdparm -I` output: the tab-indented lines following
/// the `Security:` header, whitespace-normalized.
fn parse_security_lines(output: &str) -> Vec<String> {
    let Some((_, after)) = output.split_once("\nSecurity: \n") else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    for line in after.lines() {
        match line.strip_prefix('\t') {
            Some(rest) => lines.push(rest.trim().replace('\t', " ")),
            None => break,
        }
    }
    lines
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalized(path: PathBuf) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
