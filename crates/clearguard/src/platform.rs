//! Platform tunnel backends.
//!
//! The engine only knows the [`TunnelProvider`] seam; this module supplies
//! the Linux `/dev/net/tun` implementation and a stub for platforms without
//! one.

use clearguard_net::{TunnelConfig, TunnelDevice, TunnelError, TunnelProvider};
use std::sync::Arc;

/// The tunnel backend for the current platform.
pub fn default_provider() -> Arc<dyn TunnelProvider> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxTunProvider)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedTunProvider)
    }
}

/// Provider for platforms without a tun backend.
pub struct UnsupportedTunProvider;

impl TunnelProvider for UnsupportedTunProvider {
    fn establish(&self, _config: &TunnelConfig) -> Result<Arc<dyn TunnelDevice>, TunnelError> {
        Err(TunnelError::Unavailable(
            "no tunnel backend for this platform".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    //! `/dev/net/tun` backend.
    //!
    //! Interface address, MTU and default route are configured best-effort
    //! through `ip(8)`; a failure there leaves the device usable for tests
    //! and is logged rather than fatal.

    use super::*;
    use std::io;
    use std::process::Command;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tracing::{info, warn};

    const TUN_PATH: &[u8] = b"/dev/net/tun\0";
    const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub struct LinuxTunProvider;

    struct LinuxTunDevice {
        fd: AtomicI32,
    }

    impl LinuxTunDevice {
        fn current_fd(&self) -> io::Result<i32> {
            let fd = self.fd.load(Ordering::SeqCst);
            if fd < 0 {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"))
            } else {
                Ok(fd)
            }
        }
    }

    impl TunnelDevice for LinuxTunDevice {
        fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            let fd = self.current_fd()?;
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }

        fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
            let fd = self.current_fd()?;
            let n = unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }

        fn close(&self) {
            let fd = self.fd.swap(-1, Ordering::SeqCst);
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }

    impl Drop for LinuxTunDevice {
        fn drop(&mut self) {
            self.close();
        }
    }

    impl TunnelProvider for LinuxTunProvider {
        fn establish(
            &self,
            config: &TunnelConfig,
        ) -> Result<Arc<dyn TunnelDevice>, TunnelError> {
            let fd = unsafe { libc::open(TUN_PATH.as_ptr().cast(), libc::O_RDWR) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                return Err(match err.raw_os_error() {
                    Some(libc::EPERM) | Some(libc::EACCES) => TunnelError::PermissionDenied,
                    Some(libc::ENOENT) => {
                        TunnelError::Unavailable("/dev/net/tun not present".to_string())
                    }
                    _ => TunnelError::Io(err),
                });
            }

            let mut ifr = IfReq {
                ifr_name: [0; IFNAMSIZ],
                ifr_flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            let name = config.session_name.as_bytes();
            let len = name.len().min(IFNAMSIZ - 1);
            ifr.ifr_name[..len].copy_from_slice(&name[..len]);

            if unsafe { libc::ioctl(fd, TUNSETIFF, &ifr as *const IfReq) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(match err.raw_os_error() {
                    Some(libc::EPERM) | Some(libc::EACCES) => TunnelError::PermissionDenied,
                    _ => TunnelError::Io(err),
                });
            }

            let end = ifr
                .ifr_name
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(IFNAMSIZ);
            let ifname = String::from_utf8_lossy(&ifr.ifr_name[..end]).to_string();

            configure_interface(&ifname, config);

            if !config.excluded_apps.is_empty() {
                // There is no per-app routing on a plain tun interface.
                warn!(
                    "per-app exclusion unavailable on this platform; skipping {} whitelisted apps",
                    config.excluded_apps.len()
                );
            }

            info!("tunnel established on {}", ifname);
            Ok(Arc::new(LinuxTunDevice {
                fd: AtomicI32::new(fd),
            }))
        }
    }

    /// Best-effort interface configuration via `ip(8)`.
    fn configure_interface(ifname: &str, config: &TunnelConfig) {
        let address = format!("{}/{}", config.address, config.prefix_len);
        let mtu = config.mtu.to_string();
        let route = format!("{}/{}", config.route.0, config.route.1);
        let steps: [&[&str]; 3] = [
            &["addr", "add", &address, "dev", ifname],
            &["link", "set", ifname, "up", "mtu", &mtu],
            &["route", "add", &route, "dev", ifname],
        ];

        for step in steps {
            match Command::new("ip").args(step).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("ip {:?} exited with {}", step, status),
                Err(err) => warn!("failed to run ip {:?}: {}", step, err),
            }
        }
    }
}
