use crate::instance::EbsRequest;
use crate::volume::BlockUri;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One backing drive in the hypervisor command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveSpec {
    pub volume_id: String,
    pub uri: String,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub efi: bool,
    #[serde(default)]
    pub cdrom: bool,
}

impl DriveSpec {
    pub fn from_request(req: &EbsRequest, uri: impl Into<String>) -> Self {
        Self {
            volume_id: req.volume_id.clone(),
            uri: uri.into(),
            boot: req.boot,
            efi: req.efi,
            cdrom: req.cloud_init,
        }
    }
}

/// Snapshot of the hypervisor command configuration. Persisted with the VM
/// record so stopped and crashed instances relaunch identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QemuSpec {
    pub name: String,
    pub machine: String,
    pub architecture: String,
    pub cpu_type: String,
    pub enable_kvm: bool,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub drives: Vec<DriveSpec>,
    pub ssh_port: u16,
    pub qmp_socket: PathBuf,
    pub pid_file: PathBuf,
}

/// Root ports reserved for runtime disk insertion, /dev/sd[f-p].
pub const HOTPLUG_PORT_COUNT: usize = 11;

impl QemuSpec {
    pub fn binary(&self) -> String {
        format!("qemu-system-{}", self.architecture)
    }

    /// Whether hardware acceleration is available on this host.
    pub fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
    }

    /// Build the full argument vector (binary first).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.binary()];

        args.push("-name".to_string());
        args.push(self.name.clone());

        args.push("-machine".to_string());
        args.push(self.machine.clone());

        if self.enable_kvm {
            args.push("-enable-kvm".to_string());
        }

        args.push("-cpu".to_string());
        args.push(self.cpu_type.clone());

        args.push("-smp".to_string());
        args.push(self.vcpus.to_string());

        args.push("-m".to_string());
        args.push(format!("{}M", self.memory_mib));

        for drive in &self.drives {
            let file = match BlockUri::parse(&drive.uri) {
                Ok(uri) => uri.qemu_drive_file(),
                // Local path fallback, used by tests and pre-staged images
                Err(_) => drive.uri.clone(),
            };

            if drive.boot {
                // Boot disk: dedicated IO thread, multi-queue virtio-blk.
                args.push("-object".to_string());
                args.push(format!("iothread,id=io-{}", drive.volume_id));
                args.push("-drive".to_string());
                args.push(format!(
                    "file={},format=raw,if=none,id=drive-{},cache=none",
                    file, drive.volume_id
                ));
                args.push("-device".to_string());
                args.push(format!(
                    "virtio-blk-pci,drive=drive-{},iothread=io-{},num-queues={},bootindex=1",
                    drive.volume_id, drive.volume_id, self.vcpus
                ));
            } else if drive.efi {
                args.push("-drive".to_string());
                args.push(format!("if=pflash,unit=1,format=raw,file={}", file));
            } else if drive.cdrom {
                args.push("-drive".to_string());
                args.push(format!("file={},format=raw,media=cdrom,if=virtio", file));
            } else {
                // Data volumes present at launch; hot-plugged ones go
                // through QMP instead.
                args.push("-drive".to_string());
                args.push(format!(
                    "file={},format=raw,if=none,id=drive-{}",
                    file, drive.volume_id
                ));
                args.push("-device".to_string());
                args.push(format!(
                    "virtio-blk-pci,drive=drive-{}",
                    drive.volume_id
                ));
            }
        }

        // Reserved hot-plug slots.
        for n in 1..=HOTPLUG_PORT_COUNT {
            args.push("-device".to_string());
            args.push(format!("pcie-root-port,id=hotplug{},chassis={}", n, n));
        }

        args.push("-device".to_string());
        args.push("virtio-rng-pci".to_string());

        args.push("-netdev".to_string());
        args.push(format!(
            "user,id=net0,hostfwd=tcp::{}-:22",
            self.ssh_port
        ));
        args.push("-device".to_string());
        args.push("virtio-net-pci,netdev=net0".to_string());

        args.push("-display".to_string());
        args.push("none".to_string());

        args.push("-qmp".to_string());
        args.push(format!(
            "unix:{},server=on,wait=off",
            self.qmp_socket.to_string_lossy()
        ));

        args.push("-pidfile".to_string());
        args.push(self.pid_file.to_string_lossy().to_string());

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> QemuSpec {
        QemuSpec {
            name: "i-0123456789abcdef0".to_string(),
            machine: "q35".to_string(),
            architecture: "x86_64".to_string(),
            cpu_type: "host".to_string(),
            enable_kvm: true,
            vcpus: 2,
            memory_mib: 1024,
            drives: vec![
                DriveSpec {
                    volume_id: "vol-boot".to_string(),
                    uri: "nbd://127.0.0.1:10809/vol-boot".to_string(),
                    boot: true,
                    efi: false,
                    cdrom: false,
                },
                DriveSpec {
                    volume_id: "vol-ci".to_string(),
                    uri: "nbd+unix:///vol-ci?socket=/run/vb.sock".to_string(),
                    boot: false,
                    efi: false,
                    cdrom: true,
                },
            ],
            ssh_port: 50022,
            qmp_socket: PathBuf::from("/run/hive/i-x.qmp"),
            pid_file: PathBuf::from("/run/hive/i-x.pid"),
        }
    }

    #[test]
    fn test_boot_drive_args() {
        let args = test_spec().to_args();
        let joined = args.join(" ");

        assert_eq!(args[0], "qemu-system-x86_64");
        assert!(joined.contains("iothread,id=io-vol-boot"));
        assert!(joined.contains(
            "file=nbd:127.0.0.1:10809:exportname=vol-boot,format=raw,if=none,id=drive-vol-boot,cache=none"
        ));
        assert!(joined.contains("num-queues=2,bootindex=1"));
    }

    #[test]
    fn test_cloud_init_is_virtio_cdrom() {
        let joined = test_spec().to_args().join(" ");
        assert!(joined
            .contains("file=nbd:unix:/run/vb.sock:exportname=vol-ci,format=raw,media=cdrom,if=virtio"));
    }

    #[test]
    fn test_eleven_hotplug_ports() {
        let args = test_spec().to_args();
        let ports = args
            .iter()
            .filter(|a| a.starts_with("pcie-root-port,id=hotplug"))
            .count();
        assert_eq!(ports, 11);
        assert!(args.iter().any(|a| a == "pcie-root-port,id=hotplug11,chassis=11"));
    }

    #[test]
    fn test_network_and_qmp_args() {
        let joined = test_spec().to_args().join(" ");
        assert!(joined.contains("user,id=net0,hostfwd=tcp::50022-:22"));
        assert!(joined.contains("virtio-net-pci,netdev=net0"));
        assert!(joined.contains("virtio-rng-pci"));
        assert!(joined.contains("unix:/run/hive/i-x.qmp,server=on,wait=off"));
        assert!(joined.contains("-pidfile /run/hive/i-x.pid"));
    }

    #[test]
    fn test_kvm_flag_respected() {
        let mut spec = test_spec();
        spec.enable_kvm = false;
        spec.cpu_type = "max".to_string();
        let args = spec.to_args();
        assert!(!args.iter().any(|a| a == "-enable-kvm"));
        let joined = args.join(" ");
        assert!(joined.contains("-cpu max"));
    }
}
