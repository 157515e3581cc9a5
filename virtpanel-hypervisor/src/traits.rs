//! Driver contracts consumed by the control-plane core.

use async_trait::async_trait;

use crate::error::Result;
use crate::forward::PortForward;
use crate::types::*;

/// Capabilities supported by a hypervisor backend.
#[derive(Debug, Clone)]
pub struct HypervisorCapabilities {
    /// Name of the hypervisor (e.g., "libvirt", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Supports snapshots
    pub supports_snapshots: bool,
    /// Supports hot-plug of devices into running domains
    pub supports_hotplug: bool,
    /// Maximum vCPUs per VM
    pub max_vcpus: u32,
    /// Maximum memory per VM in MiB
    pub max_memory_mib: u64,
}

/// Core hypervisor abstraction trait.
///
/// Every call acts on exactly one object and returns once the driver has
/// acknowledged it. Domains are addressed by UUID, pools and networks by
/// name. Implementations report ground truth through [`Hypervisor::poll_state`];
/// callers must not assume a failed call left the object untouched.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Capabilities & Health
    // =========================================================================

    /// Get hypervisor capabilities.
    async fn capabilities(&self) -> Result<HypervisorCapabilities>;

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Domain Lifecycle
    // =========================================================================

    /// Define a domain, or redefine it when the UUID is already known.
    ///
    /// Redefinition of an active domain takes effect on its next boot.
    async fn define_vm(&self, config: &VmConfig) -> Result<()>;

    /// Remove a domain definition together with its snapshot metadata.
    ///
    /// The domain must be inactive.
    async fn undefine_vm(&self, vm_id: &str) -> Result<()>;

    /// Start a VM.
    async fn start_vm(&self, vm_id: &str) -> Result<()>;

    /// Stop a VM.
    ///
    /// With `graceful` the guest is asked to power off (ACPI) and the call
    /// returns once the request is acknowledged; the domain may still be
    /// shutting down. Without it the domain is powered off immediately.
    async fn shutdown_vm(&self, vm_id: &str, graceful: bool) -> Result<()>;

    /// Force stop a VM (power off).
    async fn destroy_vm(&self, vm_id: &str) -> Result<()>;

    /// Pause a VM (freeze execution).
    async fn suspend_vm(&self, vm_id: &str) -> Result<()>;

    /// Resume a paused VM.
    async fn resume_vm(&self, vm_id: &str) -> Result<()>;

    /// Reboot a VM.
    async fn reboot_vm(&self, vm_id: &str) -> Result<()>;

    /// Rename an inactive domain.
    async fn rename_vm(&self, vm_id: &str, new_name: &str) -> Result<()>;

    /// Set whether the domain starts with the host.
    async fn set_autostart(&self, vm_id: &str, enabled: bool) -> Result<()>;

    /// Current power state of one domain.
    async fn domain_state(&self, vm_id: &str) -> Result<PowerState>;

    // =========================================================================
    // Devices
    // =========================================================================

    /// Attach a device to the persistent definition, and to the running
    /// domain too when `live` is set.
    async fn attach_device(&self, vm_id: &str, device: &Device, live: bool) -> Result<()>;

    /// Detach a device, identified by its target (disks) or MAC (NICs).
    async fn detach_device(&self, vm_id: &str, device: &Device, live: bool) -> Result<()>;

    /// Insert (`Some`) or eject (`None`) the media of the CD-ROM drive.
    async fn change_media(&self, vm_id: &str, media: Option<&str>) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        description: &str,
    ) -> Result<SnapshotInfo>;

    /// Revert to a snapshot.
    async fn revert_snapshot(&self, vm_id: &str, name: &str) -> Result<()>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, vm_id: &str, name: &str) -> Result<()>;

    // =========================================================================
    // Storage
    // =========================================================================

    /// Define and build a pool. New pools are inactive.
    async fn create_pool(&self, config: &PoolConfig) -> Result<()>;

    async fn start_pool(&self, name: &str) -> Result<()>;

    async fn stop_pool(&self, name: &str) -> Result<()>;

    /// Stop (if active) and undefine a pool.
    async fn delete_pool(&self, name: &str) -> Result<()>;

    async fn pool_info(&self, name: &str) -> Result<PoolInfo>;

    /// Allocate a volume in an active pool.
    async fn create_volume(&self, pool: &str, config: &VolumeConfig) -> Result<VolumeInfo>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    /// Copy a volume inside its pool.
    async fn clone_volume(&self, pool: &str, source: &str, target: &str) -> Result<VolumeInfo>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Define a network. New networks are inactive.
    async fn create_network(&self, config: &NetworkConfig) -> Result<()>;

    async fn start_network(&self, name: &str) -> Result<()>;

    async fn stop_network(&self, name: &str) -> Result<()>;

    /// Stop (if active) and undefine a network.
    async fn delete_network(&self, name: &str) -> Result<()>;

    async fn network_info(&self, name: &str) -> Result<NetworkInfo>;

    /// Current IPv4 leases of a network's DHCP server.
    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>>;

    // =========================================================================
    // Ground Truth
    // =========================================================================

    /// Read the state of every domain, pool and network on the host.
    async fn poll_state(&self) -> Result<HostState>;
}

/// Host firewall/NAT programming for port forwards.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Install the rules for a forward. `id` tags the rules on the host.
    async fn apply_port_forward(&self, id: &str, forward: &PortForward) -> Result<()>;

    /// Remove the rules for a forward. Rules already gone are not an error.
    async fn remove_port_forward(&self, id: &str, forward: &PortForward) -> Result<()>;
}
