//! Platform collaborators: the privileged tunnel interface and the
//! persistent "running" notification.

pub mod linux;

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Everything the platform needs to bring a tunnel interface up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub interface: String,
    pub mtu: u16,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub dns: IpAddr,
    /// Network routed through the tunnel, `(address, prefix)`.
    pub route: (Ipv4Addr, u8),
    /// Targets whose traffic uses the tunnel. Never contains our own id.
    pub allowed_targets: Vec<String>,
}

/// A pending request for the user to grant the privileged-tunnel permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub reason: String,
}

/// Creates privileged tunnel interfaces.
pub trait TunnelPlatform: Send + Sync {
    fn permission_granted(&self) -> bool;
    /// Ask the user for the permission; the answer arrives later through
    /// the session controller's permission-result call.
    fn request_permission(&self) -> PermissionRequest;
    fn establish(&self, params: &TunnelParams) -> Result<Box<dyn TunnelInterface>, String>;
}

/// A live tunnel interface returned by [`TunnelPlatform::establish`].
pub trait TunnelInterface: Send {
    fn name(&self) -> &str;
    /// Hand the raw descriptor over; the caller owns it afterwards. Returns
    /// `None` if it was already detached.
    fn detach_fd(&mut self) -> Option<RawFd>;
    fn close(&mut self) -> Result<(), String>;
}

/// The user-visible "tunnel is running" indicator.
pub trait Notifier: Send + Sync {
    fn show_running(&self, interface: &str);
    /// Remove the indicator. Errors when nothing is shown.
    fn cancel(&self) -> Result<(), String>;
}

/// Notifier that writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier {
    shown: AtomicBool,
}

impl Notifier for LogNotifier {
    fn show_running(&self, interface: &str) {
        self.shown.store(true, Ordering::SeqCst);
        info!("Tunnel running on {interface}");
    }

    fn cancel(&self) -> Result<(), String> {
        if self.shown.swap(false, Ordering::SeqCst) {
            info!("Tunnel stopped");
            Ok(())
        } else {
            Err("no running notification shown".to_string())
        }
    }
}
