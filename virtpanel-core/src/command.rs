//! Typed commands and the validation stage.
//!
//! Requests mirror what an API client sends: loosely typed, optional fields,
//! signed numbers. [`Validate::validate`] turns each request into a command
//! whose fields already satisfy every field-level constraint, so the managers
//! only deal with state and references.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::Deserialize;
use virtpanel_hypervisor::{
    normalize_mac, BootDevice, ClockOffset, DhcpRange, DiskBus, DiskFormat, ForwardMode,
    MachineType, NicModel, PoolType, PortForward, Protocol,
};

use crate::error::{CoreError, Result};

/// Maximum length of an entity name.
pub const MAX_NAME_LEN: usize = 64;

/// Upper bound for a single VM, matching what the driver accepts.
const MAX_VCPUS: i64 = 256;
const MAX_MEMORY_MIB: i64 = 1024 * 1024;
const MAX_DISK_GIB: i64 = 64 * 1024;

/// Turn a loosely typed request into a checked command.
pub trait Validate {
    type Output;

    fn validate(self) -> Result<Self::Output>;
}

// =============================================================================
// FIELD CHECKS
// =============================================================================

/// Names may only use ASCII letters, digits, `.`, `_` and `-`.
pub fn validate_name(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CoreError::invalid(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(CoreError::invalid(
            field,
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if value.starts_with('.') || value.starts_with('-') {
        return Err(CoreError::invalid(field, "must start with a letter, digit or '_'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(CoreError::invalid(
            field,
            format!("'{}' may only contain letters, digits, '.', '_' and '-'", value),
        ));
    }
    Ok(value.to_string())
}

fn positive(field: &str, value: i64, max: i64) -> Result<u64> {
    if value <= 0 {
        return Err(CoreError::invalid(field, "must be greater than zero"));
    }
    if value > max {
        return Err(CoreError::invalid(field, format!("must be at most {}", max)));
    }
    Ok(value as u64)
}

fn port(field: &str, value: i64) -> Result<u16> {
    if !(1..=i64::from(u16::MAX)).contains(&value) {
        return Err(CoreError::invalid(field, "must be between 1 and 65535"));
    }
    Ok(value as u16)
}

fn parse_enum<T>(field: &str, value: &str, parse: fn(&str) -> Option<T>, allowed: &str) -> Result<T> {
    parse(value.trim()).ok_or_else(|| {
        CoreError::invalid(field, format!("'{}' is not one of {}", value, allowed))
    })
}

fn ipv4(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::invalid(field, format!("'{}' is not an IPv4 address", value)))
}

fn absolute_path(field: &str, value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value.trim());
    if !path.is_absolute() {
        return Err(CoreError::invalid(field, "must be an absolute path"));
    }
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(CoreError::invalid(field, "must not contain '..'"));
    }
    Ok(path)
}

// =============================================================================
// VM COMMANDS
// =============================================================================

/// Guest OS family; picks disk bus, NIC model and machine defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsPreset {
    Linux,
    Windows,
    /// Old guests without virtio drivers
    Legacy,
}

impl OsPreset {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "linux" => Some(OsPreset::Linux),
            "windows" => Some(OsPreset::Windows),
            "legacy" => Some(OsPreset::Legacy),
            _ => None,
        }
    }

    fn disk_bus(&self) -> DiskBus {
        match self {
            OsPreset::Linux => DiskBus::Virtio,
            OsPreset::Windows => DiskBus::Sata,
            OsPreset::Legacy => DiskBus::Ide,
        }
    }

    fn nic_model(&self) -> NicModel {
        match self {
            OsPreset::Linux => NicModel::Virtio,
            OsPreset::Windows => NicModel::E1000,
            OsPreset::Legacy => NicModel::Rtl8139,
        }
    }
}

/// Create a VM, as sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu: i64,
    /// MiB
    pub memory: i64,
    /// GiB of a new root volume; ignored when `volume` names an existing one
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub pool: Option<String>,
    /// Existing volume in `pool` to boot from (import)
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub disk_bus: Option<String>,
    #[serde(default)]
    pub net_model: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    /// Install media
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub autostart: bool,
}

impl CreateVmRequest {
    /// Minimal request: name, vCPUs, memory (MiB) and a new disk (GiB).
    pub fn new(name: impl Into<String>, cpu: i64, memory: i64, disk: i64) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory,
            disk,
            pool: None,
            volume: None,
            disk_format: None,
            os_type: None,
            disk_bus: None,
            net_model: None,
            network: None,
            iso: None,
            arch: None,
            autostart: false,
        }
    }
}

/// Where the root disk of a new VM comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// Allocate `{vm}.{ext}` in the pool.
    New {
        pool: Option<String>,
        size_gib: u64,
        format: DiskFormat,
    },
    /// Boot from a volume that already exists.
    Existing { pool: Option<String>, volume: String },
}

/// Validated VM creation.
#[derive(Debug, Clone)]
pub struct CreateVm {
    pub name: String,
    pub cpu: u32,
    pub cpu_model: Option<String>,
    pub memory_mib: u64,
    pub disk: DiskSource,
    pub disk_bus: DiskBus,
    pub net_model: NicModel,
    pub network: Option<String>,
    pub iso: Option<PathBuf>,
    pub arch: Option<String>,
    pub machine: MachineType,
    pub clock: ClockOffset,
    pub autostart: bool,
}

impl CreateVm {
    /// Boot order: install media first when an ISO is supplied.
    pub fn boot_order(&self) -> Vec<BootDevice> {
        if self.iso.is_some() {
            vec![BootDevice::Cdrom, BootDevice::Disk]
        } else {
            vec![BootDevice::Disk, BootDevice::Cdrom]
        }
    }
}

impl Validate for CreateVmRequest {
    type Output = CreateVm;

    fn validate(self) -> Result<CreateVm> {
        let name = validate_name("name", &self.name)?;
        let cpu = positive("cpu", self.cpu, MAX_VCPUS)? as u32;
        let memory_mib = positive("memory", self.memory, MAX_MEMORY_MIB)?;

        let preset = match self.os_type.as_deref() {
            Some(os) => parse_enum("os_type", os, OsPreset::from_name, "linux, windows, legacy")?,
            None => OsPreset::Linux,
        };
        let disk_bus = match self.disk_bus.as_deref() {
            Some(bus) => parse_enum("disk_bus", bus, DiskBus::from_name, "virtio, sata, scsi, ide")?,
            None => preset.disk_bus(),
        };
        let net_model = match self.net_model.as_deref() {
            Some(model) => parse_enum("net_model", model, NicModel::from_name, "virtio, e1000, rtl8139")?,
            None => preset.nic_model(),
        };
        let (machine, clock, cpu_model) = match preset {
            OsPreset::Windows => (
                MachineType::Q35,
                ClockOffset::Localtime,
                Some("host-passthrough".to_string()),
            ),
            _ => (MachineType::Pc, ClockOffset::Utc, None),
        };

        let pool = self.pool.as_deref().map(|p| validate_name("pool", p)).transpose()?;
        let disk = match self.volume.as_deref() {
            Some(volume) => DiskSource::Existing {
                pool,
                volume: validate_name("volume", volume)?,
            },
            None => DiskSource::New {
                pool,
                size_gib: positive("disk", self.disk, MAX_DISK_GIB)?,
                format: match self.disk_format.as_deref() {
                    Some(f) => parse_enum("disk_format", f, DiskFormat::from_name, "qcow2, raw, vmdk, vdi")?,
                    None => DiskFormat::Qcow2,
                },
            },
        };

        let network = self
            .network
            .as_deref()
            .map(|n| validate_name("network", n))
            .transpose()?;
        let iso = self.iso.as_deref().map(validate_iso_path).transpose()?;
        let arch = self.arch.as_deref().map(|a| validate_name("arch", a)).transpose()?;

        Ok(CreateVm {
            name,
            cpu,
            cpu_model,
            memory_mib,
            disk,
            disk_bus,
            net_model,
            network,
            iso,
            arch,
            machine,
            clock,
            autostart: self.autostart,
        })
    }
}

/// Change vCPUs and/or memory of a stopped VM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateVmRequest {
    #[serde(default)]
    pub cpu: Option<i64>,
    /// MiB
    #[serde(default)]
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateVm {
    pub cpu: Option<u32>,
    pub memory_mib: Option<u64>,
}

impl Validate for UpdateVmRequest {
    type Output = UpdateVm;

    fn validate(self) -> Result<UpdateVm> {
        Ok(UpdateVm {
            cpu: self
                .cpu
                .map(|c| positive("cpu", c, MAX_VCPUS).map(|c| c as u32))
                .transpose()?,
            memory_mib: self
                .memory
                .map(|m| positive("memory", m, MAX_MEMORY_MIB))
                .transpose()?,
        })
    }
}

/// Attach an existing volume as a disk.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachDiskRequest {
    pub pool: String,
    pub volume: String,
    /// Device node; chosen from the bus prefix when omitted
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachDisk {
    pub pool: String,
    pub volume: String,
    pub target: Option<String>,
    pub bus: DiskBus,
    pub readonly: bool,
}

impl Validate for AttachDiskRequest {
    type Output = AttachDisk;

    fn validate(self) -> Result<AttachDisk> {
        let target = match self.target.as_deref() {
            Some(t) => Some(validate_target(t)?),
            None => None,
        };
        Ok(AttachDisk {
            pool: validate_name("pool", &self.pool)?,
            volume: validate_name("volume", &self.volume)?,
            target,
            bus: match self.bus.as_deref() {
                Some(bus) => parse_enum("bus", bus, DiskBus::from_name, "virtio, sata, scsi, ide")?,
                None => DiskBus::Virtio,
            },
            readonly: self.readonly,
        })
    }
}

/// Device nodes look like `vdb`, `sda`, `hdc`.
fn validate_target(target: &str) -> Result<String> {
    let target = target.trim();
    let valid = target.len() >= 3
        && target.len() <= 6
        && ["vd", "sd", "hd"].iter().any(|p| target.starts_with(p))
        && target[2..].chars().all(|c| c.is_ascii_lowercase());
    if !valid {
        return Err(CoreError::invalid(
            "target",
            format!("'{}' is not a device node like vdb, sda or hdc", target),
        ));
    }
    Ok(target.to_string())
}

/// Attach a NIC to a virtual network.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachNicRequest {
    pub network: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachNic {
    pub network: String,
    pub model: NicModel,
    /// Lower-case, unicast; generated when `None`
    pub mac: Option<String>,
}

impl Validate for AttachNicRequest {
    type Output = AttachNic;

    fn validate(self) -> Result<AttachNic> {
        let mac = match self.mac.as_deref() {
            Some(mac) => Some(normalize_mac(mac).ok_or_else(|| {
                CoreError::invalid("mac", format!("'{}' is not a unicast MAC address", mac))
            })?),
            None => None,
        };
        Ok(AttachNic {
            network: validate_name("network", &self.network)?,
            model: match self.model.as_deref() {
                Some(model) => parse_enum("model", model, NicModel::from_name, "virtio, e1000, rtl8139")?,
                None => NicModel::Virtio,
            },
            mac,
        })
    }
}

/// Normalise a MAC used to address an attached NIC.
pub fn validate_mac(mac: &str) -> Result<String> {
    normalize_mac(mac)
        .ok_or_else(|| CoreError::invalid("mac", format!("'{}' is not a unicast MAC address", mac)))
}

fn validate_iso_path(path: &str) -> Result<PathBuf> {
    let path = absolute_path("iso", path)?;
    let is_iso = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("iso"));
    if !is_iso {
        return Err(CoreError::invalid("iso", "must be an .iso file"));
    }
    Ok(path)
}

/// Check a file name for the ISO directory: a plain `.iso` name, no path.
pub fn validate_iso_file_name(value: &str) -> Result<String> {
    let name = validate_name("file_name", value)?;
    if name.len() <= 4 || !name.to_ascii_lowercase().ends_with(".iso") {
        return Err(CoreError::invalid("file_name", format!("'{}' is not an .iso file", name)));
    }
    Ok(name)
}

/// Store a new image in the ISO directory.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadIsoRequest {
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadIso {
    pub file_name: String,
}

impl Validate for UploadIsoRequest {
    type Output = UploadIso;

    fn validate(self) -> Result<UploadIso> {
        Ok(UploadIso {
            file_name: validate_iso_file_name(&self.file_name)?,
        })
    }
}

/// Insert an ISO into the CD-ROM drive.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachIsoRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachIso {
    pub path: PathBuf,
}

impl Validate for AttachIsoRequest {
    type Output = AttachIso;

    fn validate(self) -> Result<AttachIso> {
        Ok(AttachIso {
            path: validate_iso_path(&self.path)?,
        })
    }
}

/// Clone a VM (and its volumes) under a new name.
#[derive(Debug, Clone, Deserialize)]
pub struct CloneVmRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneVm {
    pub new_name: String,
}

impl Validate for CloneVmRequest {
    type Output = CloneVm;

    fn validate(self) -> Result<CloneVm> {
        Ok(CloneVm {
            new_name: validate_name("new_name", &self.new_name)?,
        })
    }
}

/// Rename a stopped VM.
#[derive(Debug, Clone, Deserialize)]
pub struct RenameVmRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameVm {
    pub new_name: String,
}

impl Validate for RenameVmRequest {
    type Output = RenameVm;

    fn validate(self) -> Result<RenameVm> {
        Ok(RenameVm {
            new_name: validate_name("new_name", &self.new_name)?,
        })
    }
}

/// Lifecycle operation applied to several VMs at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Start,
    Shutdown,
    Destroy,
    Delete,
}

impl BatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchAction::Start => "start",
            BatchAction::Shutdown => "shutdown",
            BatchAction::Destroy => "destroy",
            BatchAction::Delete => "delete",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(BatchAction::Start),
            "shutdown" => Some(BatchAction::Shutdown),
            "destroy" => Some(BatchAction::Destroy),
            "delete" => Some(BatchAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub action: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub action: BatchAction,
    pub names: Vec<String>,
}

impl Validate for BatchRequest {
    type Output = Batch;

    fn validate(self) -> Result<Batch> {
        let action = parse_enum(
            "action",
            &self.action,
            BatchAction::from_name,
            "start, shutdown, destroy, delete",
        )?;
        if self.names.is_empty() {
            return Err(CoreError::invalid("names", "must list at least one VM"));
        }
        let mut names = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let name = validate_name("names", name)?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(Batch { action, names })
    }
}

// =============================================================================
// SNAPSHOT COMMANDS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshot {
    pub name: String,
    pub description: String,
}

impl Validate for CreateSnapshotRequest {
    type Output = CreateSnapshot;

    fn validate(self) -> Result<CreateSnapshot> {
        let description = self.description.unwrap_or_default();
        if description.len() > 1024 {
            return Err(CoreError::invalid("description", "must be at most 1024 characters"));
        }
        Ok(CreateSnapshot {
            name: validate_name("name", &self.name)?,
            description,
        })
    }
}

// =============================================================================
// STORAGE COMMANDS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    /// Defaults to `{storage_root}/{name}`
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub pool_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePool {
    pub name: String,
    pub path: Option<PathBuf>,
    pub pool_type: PoolType,
}

impl Validate for CreatePoolRequest {
    type Output = CreatePool;

    fn validate(self) -> Result<CreatePool> {
        Ok(CreatePool {
            name: validate_name("name", &self.name)?,
            path: self.path.as_deref().map(|p| absolute_path("path", p)).transpose()?,
            pool_type: match self.pool_type.as_deref() {
                Some(t) => parse_enum("type", t, PoolType::from_name, "dir, fs, netfs, logical")?,
                None => PoolType::Dir,
            },
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// GiB
    pub capacity: i64,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolume {
    pub name: String,
    pub capacity_gib: u64,
    pub format: DiskFormat,
}

impl Validate for CreateVolumeRequest {
    type Output = CreateVolume;

    fn validate(self) -> Result<CreateVolume> {
        Ok(CreateVolume {
            name: validate_name("name", &self.name)?,
            capacity_gib: positive("capacity", self.capacity, MAX_DISK_GIB)?,
            format: match self.format.as_deref() {
                Some(f) => parse_enum("format", f, DiskFormat::from_name, "qcow2, raw, vmdk, vdi")?,
                None => DiskFormat::Qcow2,
            },
        })
    }
}

// =============================================================================
// NETWORK COMMANDS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub bridge: Option<String>,
    /// Host address on the network
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub dhcp_start: Option<String>,
    #[serde(default)]
    pub dhcp_end: Option<String>,
    #[serde(default)]
    pub forward: Option<String>,
    /// Start right after creation (default true)
    #[serde(default)]
    pub autostart: Option<bool>,
}

impl CreateNetworkRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: None,
            subnet: None,
            netmask: None,
            dhcp_start: None,
            dhcp_end: None,
            forward: None,
            autostart: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNetwork {
    pub name: String,
    pub bridge: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
    pub forward: ForwardMode,
    pub autostart: bool,
}

fn in_subnet(addr: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    u32::from(addr) & mask == u32::from(gateway) & mask
}

impl Validate for CreateNetworkRequest {
    type Output = CreateNetwork;

    fn validate(self) -> Result<CreateNetwork> {
        let name = validate_name("name", &self.name)?;

        let bridge = match self.bridge.as_deref() {
            Some(b) => validate_name("bridge", b)?,
            None => format!("virbr-{}", name),
        };
        // Linux interface names are limited to 15 bytes.
        if bridge.len() > 15 {
            return Err(CoreError::invalid(
                "bridge",
                format!("'{}' is longer than 15 characters", bridge),
            ));
        }

        let gateway = match self.subnet.as_deref() {
            Some(s) => ipv4("subnet", s)?,
            None => Ipv4Addr::new(192, 168, 100, 1),
        };
        let netmask = match self.netmask.as_deref() {
            Some(m) => ipv4("netmask", m)?,
            None => Ipv4Addr::new(255, 255, 255, 0),
        };
        let mask = u32::from(netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 || mask.leading_ones() > 30 {
            return Err(CoreError::invalid("netmask", format!("'{}' is not a usable netmask", netmask)));
        }

        let base = u32::from(gateway) & mask;
        let (default_start, default_end) = if mask.leading_ones() == 24 {
            (Ipv4Addr::from(base | 100), Ipv4Addr::from(base | 200))
        } else {
            (Ipv4Addr::from(base + 2), Ipv4Addr::from((base | !mask) - 1))
        };
        let start = match self.dhcp_start.as_deref() {
            Some(s) => ipv4("dhcp_start", s)?,
            None => default_start,
        };
        let end = match self.dhcp_end.as_deref() {
            Some(e) => ipv4("dhcp_end", e)?,
            None => default_end,
        };

        let forward = match self.forward.as_deref() {
            Some(f) => parse_enum("forward", f, ForwardMode::from_name, "nat, route, bridge, isolated")?,
            None => ForwardMode::Nat,
        };

        let dhcp = if forward == ForwardMode::Bridge {
            None
        } else {
            for (field, addr) in [("dhcp_start", start), ("dhcp_end", end)] {
                if !in_subnet(addr, gateway, netmask) {
                    return Err(CoreError::invalid(
                        field,
                        format!("{} is outside {}/{}", addr, gateway, mask.leading_ones()),
                    ));
                }
            }
            if u32::from(start) > u32::from(end) {
                return Err(CoreError::invalid("dhcp_end", "must not be below dhcp_start"));
            }
            if (u32::from(start)..=u32::from(end)).contains(&u32::from(gateway)) {
                return Err(CoreError::invalid("subnet", "gateway lies inside the DHCP range"));
            }
            Some(DhcpRange { start, end })
        };

        Ok(CreateNetwork {
            name,
            bridge,
            gateway,
            netmask,
            dhcp,
            forward,
            autostart: self.autostart.unwrap_or(true),
        })
    }
}

// =============================================================================
// PORT FORWARD COMMANDS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AddPortForwardRequest {
    pub protocol: String,
    pub host_port: i64,
    #[serde(default)]
    pub host_port_end: Option<i64>,
    pub vm_ip: String,
    pub vm_port: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPortForward {
    pub forward: PortForward,
    pub comment: String,
}

impl Validate for AddPortForwardRequest {
    type Output = AddPortForward;

    fn validate(self) -> Result<AddPortForward> {
        let protocol = parse_enum("protocol", &self.protocol, Protocol::from_name, "tcp, udp")?;
        let host_port = port("host_port", self.host_port)?;
        let host_port_end = match self.host_port_end {
            // A zero end is how clients say "no range".
            None | Some(0) => None,
            Some(end) => {
                let end = port("host_port_end", end)?;
                if end < host_port {
                    return Err(CoreError::invalid("host_port_end", "must not be below host_port"));
                }
                (end != host_port).then_some(end)
            }
        };
        let vm_ip: IpAddr = self
            .vm_ip
            .trim()
            .parse()
            .map_err(|_| CoreError::invalid("vm_ip", format!("'{}' is not an IP address", self.vm_ip)))?;
        if vm_ip.is_unspecified() || vm_ip.is_multicast() || vm_ip.is_loopback() {
            return Err(CoreError::invalid("vm_ip", format!("{} cannot be a forward target", vm_ip)));
        }
        let vm_port = port("vm_port", self.vm_port)?;

        let forward = PortForward {
            protocol,
            host_port,
            host_port_end,
            vm_ip,
            vm_port,
        };
        if u32::from(vm_port) + u32::from(forward.span()) > u32::from(u16::MAX) {
            return Err(CoreError::invalid("vm_port", "guest port range exceeds 65535"));
        }

        let comment = self.comment.unwrap_or_default().trim().to_string();
        if comment.len() > 256 || comment.chars().any(|c| c.is_control()) {
            return Err(CoreError::invalid(
                "comment",
                "must be at most 256 printable characters",
            ));
        }

        Ok(AddPortForward { forward, comment })
    }
}
