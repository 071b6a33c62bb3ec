//! Preparing booted guests for a benchmark.

use log::{info, warn};

use crate::error::RemoteCommandError;
use crate::remote::{run_all, Guest, RemoteExec};

/// virtiofs tags exported by every VM, and where they are mounted in the guest (relative to the
/// guest user's home).
pub const SHARED_MOUNTS: &[(&str, &str)] = &[("Projects", "Projects"), ("Output", "Output")];

/// Turn automatic NUMA balancing on or off in every guest. Mandatory: fails on the first guest
/// that refuses.
pub fn set_guest_numa_balancing(
    remote: &dyn RemoteExec,
    guests: &[Guest],
    on: bool,
) -> Result<(), RemoteCommandError> {
    run_all(
        remote,
        guests,
        &argv![
            "sudo",
            "sysctl",
            "-w",
            format!("kernel.numa_balancing={}", on as u8)
        ],
        true,
    )?;
    info!("guest kernel.numa_balancing enabled: {}", on);
    Ok(())
}

/// Mount the shared directories in every guest. Guests whose image already mounts them at boot
/// just complain, so failures are only logged.
pub fn mount_shared_dirs(remote: &dyn RemoteExec, guests: &[Guest], user: &str) {
    for guest in guests {
        for (tag, dir) in SHARED_MOUNTS {
            let mount_point = format!("/home/{}/{}", user, dir);
            let argv = argv!["sudo", "mount", "-t", "virtiofs", tag, mount_point];
            if let Err(e) = remote.run(guest, &argv, false) {
                warn!("{}", e);
            }
        }
    }
    info!("virtiofs mounted");
}
