//! Domain model: VMs, snapshots, storage, networks and port forward rules.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtpanel_hypervisor::{
    BootDevice, CdromConfig, ClockOffset, CpuConfig, DhcpRange, DiskConfig, DiskFormat,
    ForwardMode, MachineType, NetworkInfo, NicConfig, PoolInfo, PoolType, PortForward, VmConfig,
    VolumeInfo, VolumeType,
};

/// One GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// VM
// =============================================================================

/// Lifecycle state of a VM as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    /// Created, never started since definition
    Defined,
    Running,
    /// Suspended
    Paused,
    /// Driver-acknowledged graceful shutdown in flight
    ShuttingDown,
    Stopped,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Defined => "defined",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::ShuttingDown => "shutting-down",
            VmState::Stopped => "stopped",
        }
    }

    /// States that only exist while a driver operation settles.
    pub fn is_transient(&self) -> bool {
        matches!(self, VmState::ShuttingDown)
    }

    /// The domain exists on the host as a live process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Paused | VmState::ShuttingDown
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural definition of a VM, everything except identity and state.
///
/// Snapshots capture one of these so a revert restores the attachments the
/// VM had when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub cpu: u32,
    pub cpu_model: Option<String>,
    pub memory_mib: u64,
    pub arch: String,
    pub machine: MachineType,
    pub clock: ClockOffset,
    pub boot: Vec<BootDevice>,
    pub disks: Vec<DiskConfig>,
    pub nics: Vec<NicConfig>,
    pub cdrom: Option<CdromConfig>,
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    pub uuid: String,
    pub state: VmState,
    pub cpu: u32,
    pub cpu_model: Option<String>,
    pub memory_mib: u64,
    pub arch: String,
    pub machine: MachineType,
    pub clock: ClockOffset,
    pub boot: Vec<BootDevice>,
    pub autostart: bool,
    pub disks: Vec<DiskConfig>,
    pub nics: Vec<NicConfig>,
    pub cdrom: Option<CdromConfig>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

impl Vm {
    /// Build a VM record from a driver definition.
    pub fn from_config(config: &VmConfig, state: VmState) -> Self {
        let now = Utc::now();
        Self {
            name: config.name.clone(),
            uuid: config.id.clone(),
            state,
            cpu: config.cpu.vcpus,
            cpu_model: config.cpu.model.clone(),
            memory_mib: config.memory_mib,
            arch: config.arch.clone(),
            machine: config.machine,
            clock: config.clock,
            boot: config.boot.clone(),
            autostart: config.autostart,
            disks: config.disks.clone(),
            nics: config.nics.clone(),
            cdrom: config.cdrom.clone(),
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Driver definition of this VM.
    pub fn to_config(&self) -> VmConfig {
        VmConfig {
            id: self.uuid.clone(),
            name: self.name.clone(),
            cpu: CpuConfig {
                vcpus: self.cpu,
                model: self.cpu_model.clone(),
            },
            memory_mib: self.memory_mib,
            arch: self.arch.clone(),
            machine: self.machine,
            clock: self.clock,
            boot: self.boot.clone(),
            disks: self.disks.clone(),
            nics: self.nics.clone(),
            cdrom: self.cdrom.clone(),
            autostart: self.autostart,
        }
    }

    pub fn descriptor(&self) -> VmDescriptor {
        VmDescriptor {
            cpu: self.cpu,
            cpu_model: self.cpu_model.clone(),
            memory_mib: self.memory_mib,
            arch: self.arch.clone(),
            machine: self.machine,
            clock: self.clock,
            boot: self.boot.clone(),
            disks: self.disks.clone(),
            nics: self.nics.clone(),
            cdrom: self.cdrom.clone(),
        }
    }

    pub fn apply_descriptor(&mut self, descriptor: &VmDescriptor) {
        self.cpu = descriptor.cpu;
        self.cpu_model = descriptor.cpu_model.clone();
        self.memory_mib = descriptor.memory_mib;
        self.arch = descriptor.arch.clone();
        self.machine = descriptor.machine;
        self.clock = descriptor.clock;
        self.boot = descriptor.boot.clone();
        self.disks = descriptor.disks.clone();
        self.nics = descriptor.nics.clone();
        self.cdrom = descriptor.cdrom.clone();
    }

    /// Update the state, stamping the change time when it differs.
    pub fn set_state(&mut self, state: VmState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = Utc::now();
        }
    }

    /// Path of the inserted ISO, if any.
    pub fn iso(&self) -> Option<&str> {
        self.cdrom.as_ref().and_then(|c| c.media.as_deref())
    }

    pub fn disk(&self, target: &str) -> Option<&DiskConfig> {
        self.disks.iter().find(|d| d.target == target)
    }

    pub fn nic(&self, mac: &str) -> Option<&NicConfig> {
        self.nics.iter().find(|n| n.mac == mac)
    }

    /// True if a disk or the CD-ROM drive already uses `target`.
    pub fn target_in_use(&self, target: &str) -> bool {
        self.disk(target).is_some() || self.cdrom.as_ref().is_some_and(|c| c.target == target)
    }

    pub fn references_volume(&self, path: &str) -> bool {
        self.disks.iter().any(|d| d.source == path)
    }

    pub fn references_network(&self, network: &str) -> bool {
        self.nics.iter().any(|n| n.source == network)
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Point-in-time capture of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub description: String,
    /// VM state when the snapshot was taken
    pub state: VmState,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
    /// Structural definition when the snapshot was taken
    pub descriptor: VmDescriptor,
}

// =============================================================================
// STORAGE
// =============================================================================

/// A storage pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub uuid: String,
    pub active: bool,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    pub path: String,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub available_bytes: u64,
}

impl From<&PoolInfo> for StoragePool {
    fn from(info: &PoolInfo) -> Self {
        Self {
            name: info.name.clone(),
            uuid: info.id.clone(),
            active: info.active,
            pool_type: info.pool_type,
            path: info.path.clone(),
            capacity_bytes: info.capacity_bytes,
            allocation_bytes: info.allocation_bytes,
            available_bytes: info.available_bytes,
        }
    }
}

/// A volume inside a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    pub pool: String,
    pub path: String,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub format: DiskFormat,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
}

impl StorageVolume {
    pub fn from_info(pool: &str, info: &VolumeInfo) -> Self {
        Self {
            name: info.name.clone(),
            pool: pool.to_string(),
            path: info.path.clone(),
            volume_type: info.volume_type,
            format: info.format,
            capacity_bytes: info.capacity_bytes,
            allocation_bytes: info.allocation_bytes,
        }
    }

    /// Capacity in GiB, rounded up.
    pub fn capacity_gib(&self) -> u64 {
        self.capacity_bytes.div_ceil(GIB)
    }
}

// =============================================================================
// NETWORK
// =============================================================================

/// A virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub uuid: String,
    pub active: bool,
    pub forward: ForwardMode,
    pub bridge: String,
    /// `address/prefix` of the host side
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
}

impl From<&NetworkInfo> for Network {
    fn from(info: &NetworkInfo) -> Self {
        let config = &info.config;
        Self {
            name: config.name.clone(),
            uuid: config.id.clone(),
            active: info.active,
            forward: config.forward,
            bridge: config.bridge.clone(),
            subnet: config.subnet(),
            gateway: config.gateway,
            netmask: config.netmask,
            dhcp: config.dhcp,
        }
    }
}

// =============================================================================
// PORT FORWARD
// =============================================================================

/// An installation image in the ISO directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoImage {
    /// File name inside the ISO directory
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// VMs with this image in their CD-ROM drive
    pub used_by: Vec<String>,
}

/// A host port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub id: String,
    #[serde(flatten)]
    pub forward: PortForward,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}
