//! Linux TUN device platform.
//!
//! Opens `/dev/net/tun`, attaches a TUN interface with `TUNSETIFF`, then
//! configures it with `ip`. Needs root (or `CAP_NET_ADMIN`, which is not
//! detected; run as root).

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::process::Command;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PermissionRequest, TunnelInterface, TunnelParams, TunnelPlatform};

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFNAMSIZ: usize = 16;

/// `struct ifreq` restricted to the name and flags members.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn new(name: &str) -> Self {
        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (slot, byte) in req.name.iter_mut().zip(name.bytes().take(IFNAMSIZ - 1)) {
            *slot = byte as libc::c_char;
        }
        req
    }

    #[allow(clippy::cast_sign_loss)]
    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// TUN platform for Linux hosts.
#[derive(Debug, Default)]
pub struct LinuxTun {
    /// Add `TunnelParams::route` to the host routing table.
    pub install_routes: bool,
}

impl TunnelPlatform for LinuxTun {
    fn permission_granted(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn request_permission(&self) -> PermissionRequest {
        PermissionRequest {
            id: Uuid::new_v4(),
            reason: "creating a TUN interface requires root; restart surfbridge as root"
                .to_string(),
        }
    }

    fn establish(&self, params: &TunnelParams) -> Result<Box<dyn TunnelInterface>, String> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| format!("open {TUN_DEVICE}: {e}"))?;

        let mut req = IfReq::new(&params.interface);
        // SAFETY: TUNSETIFF reads and writes a struct ifreq; IfReq has the
        // same size and layout for the name and flags members.
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                TUNSETIFF as _,
                std::ptr::addr_of_mut!(req),
            )
        };
        if ret == -1 {
            return Err(format!(
                "TUNSETIFF {}: {}",
                params.interface,
                std::io::Error::last_os_error()
            ));
        }
        let name = req.name();

        configure(&name, params, self.install_routes)?;
        info!(
            "Tunnel: {name} up ({}/{}, mtu {})",
            params.address, params.prefix_len, params.mtu
        );
        debug!(
            "Tunnel: dns {} and {} allowed targets are not enforced on this host",
            params.dns,
            params.allowed_targets.len()
        );

        Ok(Box::new(LinuxTunInterface {
            name,
            file: Some(file),
            closed: false,
        }))
    }
}

fn configure(name: &str, params: &TunnelParams, install_routes: bool) -> Result<(), String> {
    let mtu = params.mtu.to_string();
    let cidr = format!("{}/{}", params.address, params.prefix_len);
    ip(&["link", "set", "dev", name, "mtu", &mtu])?;
    ip(&["addr", "add", &cidr, "dev", name])?;
    ip(&["link", "set", "dev", name, "up"])?;
    if install_routes {
        let route = format!("{}/{}", params.route.0, params.route.1);
        ip(&["route", "add", &route, "dev", name])?;
    }
    Ok(())
}

fn ip(args: &[&str]) -> Result<(), String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| format!("failed to run ip: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// A TUN interface; it disappears once every descriptor to it is closed.
struct LinuxTunInterface {
    name: String,
    file: Option<File>,
    closed: bool,
}

impl TunnelInterface for LinuxTunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn detach_fd(&mut self) -> Option<RawFd> {
        self.file.take().map(IntoRawFd::into_raw_fd)
    }

    fn close(&mut self) -> Result<(), String> {
        if self.closed {
            return Err(format!("{} already closed", self.name));
        }
        self.closed = true;
        if self.file.take().is_none() {
            // Descriptor belongs to the engine now; the interface goes away
            // when the engine drops it.
            debug!("Tunnel: {} descriptor owned by engine", self.name);
        }
        Ok(())
    }
}

impl Drop for LinuxTunInterface {
    fn drop(&mut self) {
        if !self.closed && self.file.is_some() {
            warn!("Tunnel: {} dropped without close", self.name);
        }
    }
}
