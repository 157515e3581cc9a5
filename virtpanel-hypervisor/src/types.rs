//! Type definitions for domain, storage and network configuration and status.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// DOMAIN CONFIGURATION
// =============================================================================

/// Full definition of a domain as handed to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// CPU configuration
    pub cpu: CpuConfig,
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Guest architecture, e.g. "x86_64"
    pub arch: String,
    pub machine: MachineType,
    pub clock: ClockOffset,
    /// Boot order
    pub boot: Vec<BootDevice>,
    /// Disk devices
    pub disks: Vec<DiskConfig>,
    /// Network interfaces
    pub nics: Vec<NicConfig>,
    /// CD-ROM drive, if the domain has one
    pub cdrom: Option<CdromConfig>,
    /// Start the domain when the host boots
    pub autostart: bool,
}

impl VmConfig {
    /// Create a new domain definition with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cpu: CpuConfig::default(),
            memory_mib: 2048,
            arch: "x86_64".to_string(),
            machine: MachineType::default(),
            clock: ClockOffset::default(),
            boot: vec![BootDevice::Disk, BootDevice::Cdrom],
            disks: Vec::new(),
            nics: Vec::new(),
            cdrom: None,
            autostart: false,
        }
    }

    /// Set the domain UUID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the number of vCPUs.
    pub fn with_cpu(mut self, vcpus: u32) -> Self {
        self.cpu.vcpus = vcpus;
        self
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, size_mib: u64) -> Self {
        self.memory_mib = size_mib;
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn with_boot_order(mut self, order: Vec<BootDevice>) -> Self {
        self.boot = order;
        self
    }

    /// Add a disk.
    pub fn with_disk(mut self, disk: DiskConfig) -> Self {
        self.disks.push(disk);
        self
    }

    /// Add a network interface.
    pub fn with_nic(mut self, nic: NicConfig) -> Self {
        self.nics.push(nic);
        self
    }

    /// Set the CD-ROM drive.
    pub fn with_cdrom(mut self, cdrom: CdromConfig) -> Self {
        self.cdrom = Some(cdrom);
        self
    }
}

/// CPU configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// CPU model (optional, e.g., "host-passthrough")
    pub model: Option<String>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            vcpus: 2,
            model: None,
        }
    }
}

/// Emulated chipset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// i440FX
    #[default]
    Pc,
    Q35,
}

impl MachineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Pc => "pc",
            MachineType::Q35 => "q35",
        }
    }
}

/// Guest clock offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOffset {
    #[default]
    Utc,
    Localtime,
}

/// Disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path of the backing volume
    pub source: String,
    /// Guest device node, e.g. "vda"
    pub target: String,
    pub bus: DiskBus,
    pub format: DiskFormat,
    /// The domain boots from this disk
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub readonly: bool,
}

impl DiskConfig {
    /// Create a disk on the virtio bus with the format guessed from the path.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            format: DiskFormat::from_path(&source),
            source,
            target: target.into(),
            bus: DiskBus::Virtio,
            bootable: false,
            readonly: false,
        }
    }

    /// Device class of the attachment.
    pub fn device(&self) -> &'static str {
        "disk"
    }
}

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Get the device prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi => "sd",
            DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "virtio" => Some(DiskBus::Virtio),
            "scsi" => Some(DiskBus::Scsi),
            "sata" => Some(DiskBus::Sata),
            "ide" => Some(DiskBus::Ide),
            _ => None,
        }
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "qcow2" => Some(DiskFormat::Qcow2),
            "raw" => Some(DiskFormat::Raw),
            "vmdk" => Some(DiskFormat::Vmdk),
            "vdi" => Some(DiskFormat::Vdi),
            _ => None,
        }
    }

    /// Guess the format from a file name. Raw for `.raw`/`.img`, qcow2 otherwise.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".raw") || lower.ends_with(".img") {
            DiskFormat::Raw
        } else if lower.ends_with(".vmdk") {
            DiskFormat::Vmdk
        } else if lower.ends_with(".vdi") {
            DiskFormat::Vdi
        } else {
            DiskFormat::Qcow2
        }
    }

    /// File extension used for new volumes.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }
}

/// CD-ROM drive configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdromConfig {
    /// Guest device node, e.g. "hdc"
    pub target: String,
    pub bus: DiskBus,
    /// Path to the inserted ISO (None for an empty drive)
    pub media: Option<String>,
}

impl CdromConfig {
    /// An empty drive on the given bus.
    pub fn empty(bus: DiskBus) -> Self {
        let target = match bus {
            DiskBus::Ide => "hdc".to_string(),
            other => format!("{}z", other.device_prefix()),
        };
        Self {
            target,
            bus,
            media: None,
        }
    }

    pub fn device(&self) -> &'static str {
        "cdrom"
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    #[serde(rename = "type")]
    pub kind: NicKind,
    /// Virtual network (or bridge) name
    pub source: String,
    /// MAC address, lower case
    pub mac: String,
    pub model: NicModel,
}

/// How the interface is connected on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicKind {
    #[default]
    Network,
    Bridge,
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
    Rtl8139,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "virtio" => Some(NicModel::Virtio),
            "e1000" => Some(NicModel::E1000),
            "rtl8139" => Some(NicModel::Rtl8139),
            _ => None,
        }
    }
}

/// Boot device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Disk,
    Cdrom,
    Network,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Disk => "hd",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Network => "network",
        }
    }
}

/// A hot-pluggable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "lowercase")]
pub enum Device {
    Disk(DiskConfig),
    Cdrom(CdromConfig),
    Nic(NicConfig),
}

impl Device {
    /// Identity of the device within its domain (target or MAC).
    pub fn key(&self) -> &str {
        match self {
            Device::Disk(disk) => &disk.target,
            Device::Cdrom(cdrom) => &cdrom.target,
            Device::Nic(nic) => &nic.mac,
        }
    }
}

// =============================================================================
// DOMAIN STATUS
// =============================================================================

/// Power state as reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Running,
    /// Running but blocked on a resource
    Blocked,
    Paused,
    /// Guest acknowledged a shutdown request and is going down
    ShuttingDown,
    Shutoff,
    Crashed,
    /// Suspended by guest power management
    PmSuspended,
    #[default]
    Unknown,
}

impl PowerState {
    /// True when the domain holds guest memory on the host.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PowerState::Running
                | PowerState::Blocked
                | PowerState::Paused
                | PowerState::ShuttingDown
                | PowerState::PmSuspended
        )
    }
}

/// Ground truth for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInfo {
    pub config: VmConfig,
    pub state: PowerState,
    /// Names of the snapshots the driver holds for this domain
    pub snapshots: Vec<String>,
}

/// Snapshot information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot name
    pub name: String,
    /// Description
    pub description: String,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Domain state at snapshot time
    pub vm_state: PowerState,
}

// =============================================================================
// STORAGE
// =============================================================================

/// Storage pool backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Plain directory on the host
    #[default]
    Dir,
    /// Pre-formatted block device mounted by the host
    Fs,
    /// Network filesystem (NFS)
    Netfs,
    /// LVM volume group
    Logical,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Dir => "dir",
            PoolType::Fs => "fs",
            PoolType::Netfs => "netfs",
            PoolType::Logical => "logical",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dir" => Some(PoolType::Dir),
            "fs" => Some(PoolType::Fs),
            "netfs" => Some(PoolType::Netfs),
            "logical" => Some(PoolType::Logical),
            _ => None,
        }
    }
}

/// Storage pool definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    pub name: String,
    pub pool_type: PoolType,
    /// Target directory on the host
    pub path: String,
}

/// Storage pool status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: String,
    pub name: String,
    pub pool_type: PoolType,
    pub path: String,
    pub active: bool,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub available_bytes: u64,
    pub volumes: Vec<VolumeInfo>,
}

/// Volume backing type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    #[default]
    File,
    Block,
    Dir,
    Network,
}

/// Request to allocate a volume inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub capacity_bytes: u64,
    pub format: DiskFormat,
}

/// Storage volume status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub path: String,
    pub volume_type: VolumeType,
    pub format: DiskFormat,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
}

// =============================================================================
// NETWORK
// =============================================================================

/// How traffic leaves a virtual network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    Nat,
    Route,
    Bridge,
    /// No forwarding; guests only see each other and the host
    Isolated,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Nat => "nat",
            ForwardMode::Route => "route",
            ForwardMode::Bridge => "bridge",
            ForwardMode::Isolated => "isolated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nat" => Some(ForwardMode::Nat),
            "route" => Some(ForwardMode::Route),
            "bridge" => Some(ForwardMode::Bridge),
            "isolated" | "none" => Some(ForwardMode::Isolated),
            _ => None,
        }
    }
}

/// DHCP address range served on a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

/// Virtual network definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: String,
    pub name: String,
    pub forward: ForwardMode,
    pub bridge: String,
    /// Host address on the network
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
}

impl NetworkConfig {
    /// Prefix length of the netmask.
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }

    /// Subnet in `address/prefix` form, as shown to users.
    pub fn subnet(&self) -> String {
        format!("{}/{}", self.gateway, self.prefix_len())
    }
}

/// Virtual network status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub config: NetworkConfig,
    pub active: bool,
}

/// An IPv4 address handed out by a network's DHCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    /// MAC address, lower case
    pub mac: String,
    /// Client hostname, empty when the guest sent none
    pub hostname: String,
}

// =============================================================================
// HOST SNAPSHOT
// =============================================================================

/// Everything the driver manages, read in one pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostState {
    pub domains: Vec<DomainInfo>,
    pub pools: Vec<PoolInfo>,
    pub networks: Vec<NetworkInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_format_from_path() {
        assert_eq!(DiskFormat::from_path("/data/disk.img"), DiskFormat::Raw);
        assert_eq!(DiskFormat::from_path("/data/disk.RAW"), DiskFormat::Raw);
        assert_eq!(DiskFormat::from_path("/data/disk.qcow2"), DiskFormat::Qcow2);
        assert_eq!(DiskFormat::from_path("/data/disk"), DiskFormat::Qcow2);
    }

    #[test]
    fn test_network_subnet() {
        let config = NetworkConfig {
            id: "n".into(),
            name: "default".into(),
            forward: ForwardMode::Nat,
            bridge: "virbr0".into(),
            gateway: Ipv4Addr::new(192, 168, 100, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dhcp: None,
        };
        assert_eq!(config.prefix_len(), 24);
        assert_eq!(config.subnet(), "192.168.100.1/24");
    }

    #[test]
    fn test_empty_cdrom_target() {
        assert_eq!(CdromConfig::empty(DiskBus::Ide).target, "hdc");
        assert_eq!(CdromConfig::empty(DiskBus::Sata).target, "sdz");
    }
}
