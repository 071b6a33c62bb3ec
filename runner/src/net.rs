//! Per-VM networking on the host: a static DHCP lease in the libvirt network plus a tap device
//! enslaved to the network's bridge.

use log::{info, warn};

use crate::config::HostConfig;
use crate::error::{NetworkError, TeardownError};
use crate::host::{Host, HostCommand};
use crate::vm::VmConfig;

/// Adds and removes leases and taps. Both halves are always attempted, so a failure in one never
/// leaves the other behind.
pub struct NetworkProvisioner<'h> {
    host: &'h dyn Host,
    network: String,
    bridge: String,
}

impl<'h> NetworkProvisioner<'h> {
    /// Look up the live network. Fails with `NetworkError::Unreachable` if libvirt does not know
    /// it or it is not running.
    pub fn connect(host: &'h dyn Host, cfg: &HostConfig) -> Result<Self, NetworkError> {
        host.run(&virsh(&["net-info", &cfg.network_name]))
            .map_err(|e| NetworkError::Unreachable {
                network: cfg.network_name.clone(),
                cause: e.to_string(),
            })?;

        Ok(NetworkProvisioner {
            host,
            network: cfg.network_name.clone(),
            bridge: cfg.bridge.clone(),
        })
    }

    /// The DHCP host entry binding the VM's MAC to its address.
    pub fn lease_xml(vm: &VmConfig) -> String {
        format!("<host mac='{}' ip='{}' />", vm.mac, vm.ip)
    }

    fn lease_cmd(&self, action: &str, vm: &VmConfig) -> HostCommand {
        virsh(&[
            "net-update",
            &self.network,
            action,
            "ip-dhcp-host",
            &Self::lease_xml(vm),
            "--live",
            "--config",
        ])
    }

    /// Run every step, returning all failures.
    fn run_steps(&self, steps: &[HostCommand]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|step| self.host.run(step).err().map(|e| e.to_string()))
            .collect()
    }

    pub fn create(&self, vm: &VmConfig) -> Result<(), NetworkError> {
        let errors = self.run_steps(&[
            self.lease_cmd("add-last", vm),
            HostCommand::from_argv(&["sudo", "ip", "tuntap", "add", &vm.tap, "mode", "tap"]),
            HostCommand::from_argv(&["sudo", "brctl", "addif", &self.bridge, &vm.tap]),
        ]);

        if errors.is_empty() {
            info!("vm{}: lease {} -> {} on {}", vm.id, vm.mac, vm.ip, vm.tap);
            Ok(())
        } else {
            Err(NetworkError::Provision {
                vm: vm.id,
                causes: errors.join("; "),
            })
        }
    }

    pub fn remove(&self, vm: &VmConfig) -> Result<(), NetworkError> {
        let errors = self.run_steps(&[
            self.lease_cmd("delete", vm),
            HostCommand::from_argv(&["sudo", "ip", "tuntap", "del", &vm.tap, "mode", "tap"]),
        ]);

        if errors.is_empty() {
            info!("vm{}: removed lease and {}", vm.id, vm.tap);
            Ok(())
        } else {
            Err(NetworkError::Provision {
                vm: vm.id,
                causes: errors.join("; "),
            })
        }
    }

    /// Create networking for every VM, stopping at the first failure. The caller owns cleanup:
    /// `attempted` is told about each VM before its `create` runs, so a half-created VM is torn
    /// down too.
    pub fn create_all(
        &self,
        vms: &[VmConfig],
        mut attempted: impl FnMut(&VmConfig),
    ) -> Result<(), NetworkError> {
        for vm in vms {
            attempted(vm);
            self.create(vm)?;
        }
        Ok(())
    }

    /// Remove networking for every VM. Never stops early; returns whatever failed.
    pub fn remove_all(&self, vms: &[VmConfig]) -> Vec<TeardownError> {
        let mut errors = vec![];
        for vm in vms {
            if let Err(e) = self.remove(vm) {
                warn!("{}", e);
                errors.push(TeardownError::new(format!("vm{} network", vm.id), e));
            }
        }
        errors
    }
}

fn virsh(args: &[&str]) -> HostCommand {
    HostCommand::new("virsh")
        .args(&["--connect", "qemu:///system"])
        .args(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use crate::host::Process;

    /// Records commands; fails any command containing one of `fail_on`.
    struct ScriptedHost {
        log: RefCell<Vec<String>>,
        fail_on: Vec<&'static str>,
    }

    impl Host for ScriptedHost {
        fn run(&self, cmd: &HostCommand) -> Result<String, failure::Error> {
            let line = cmd.to_string();
            self.log.borrow_mut().push(line.clone());
            if self.fail_on.iter().any(|f| line.contains(f)) {
                failure::bail!("{} failed", line);
            }
            Ok(String::new())
        }

        fn spawn(&self, _cmd: &HostCommand) -> Result<Box<dyn Process>, failure::Error> {
            unreachable!()
        }
    }

    fn vm(id: usize) -> VmConfig {
        VmConfig::for_test(id)
    }

    #[test]
    fn lease_xml_uses_derived_identity() {
        assert_eq!(
            NetworkProvisioner::lease_xml(&vm(5)),
            "<host mac='2e:89:a8:e4:b9:4d' ip='192.168.122.171' />"
        );
    }

    #[test]
    fn create_attempts_every_step() {
        let host = ScriptedHost {
            log: RefCell::new(vec![]),
            fail_on: vec!["net-update"],
        };
        let net = NetworkProvisioner::connect(&host, &HostConfig::default()).unwrap();
        let err = net.create(&vm(0)).unwrap_err();

        assert!(matches!(err, NetworkError::Provision { vm: 0, .. }));
        let log = host.log.borrow();
        assert!(log.iter().any(|l| l.contains("tuntap add ich0")));
        assert!(log.iter().any(|l| l.contains("brctl addif virbr0 ich0")));
    }

    #[test]
    fn remove_all_continues_past_failures() {
        let host = ScriptedHost {
            log: RefCell::new(vec![]),
            fail_on: vec!["ich0"],
        };
        let net = NetworkProvisioner::connect(&host, &HostConfig::default()).unwrap();
        let errors = net.remove_all(&[vm(0), vm(1), vm(2)]);

        assert_eq!(errors.len(), 1);
        let log = host.log.borrow();
        assert!(log.iter().any(|l| l.contains("tuntap del ich1")));
        assert!(log.iter().any(|l| l.contains("tuntap del ich2")));
    }

    #[test]
    fn unreachable_network() {
        let host = ScriptedHost {
            log: RefCell::new(vec![]),
            fail_on: vec!["net-info"],
        };
        assert!(matches!(
            NetworkProvisioner::connect(&host, &HostConfig::default()),
            Err(NetworkError::Unreachable { .. })
        ));
    }
}
