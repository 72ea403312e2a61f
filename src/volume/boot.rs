use crate::error::{HiveError, Result};
use crate::instance::{EbsRequest, VmRecord};
use crate::services::{BlockVolume, Services};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const EFI_VOLUME_BYTES: u64 = 64 * 1024 * 1024;
pub const CLOUD_INIT_VOLUME_BYTES: u64 = 1024 * 1024;
const FLUSH_INTERVAL_BYTES: u64 = 4 * 1024 * 1024;

/// Deterministic volume id: prefix plus 17 hex chars of the seed's digest.
pub fn derive_volume_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("vol-{}", &hex::encode(digest)[..17])
}

/// Render the cloud-config user-data document. The write-files block is
/// only emitted when content was supplied.
pub fn render_user_data(ssh_key: Option<&str>, write_files: Option<&str>) -> String {
    let mut doc = String::from("#cloud-config\nusers:\n");
    doc.push_str("  - name: ec2-user\n");
    doc.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
    doc.push_str("    shell: /bin/bash\n");
    if let Some(key) = ssh_key {
        doc.push_str("    ssh_authorized_keys:\n");
        doc.push_str(&format!("      - {}\n", key));
    }
    if let Some(files) = write_files {
        doc.push_str("write_files:\n");
        doc.push_str(files);
        if !files.ends_with('\n') {
            doc.push('\n');
        }
    }
    doc
}

pub fn render_meta_data(instance_id: &str, hostname: &str) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        instance_id, hostname
    )
}

/// Prepares the boot, EFI, and cloud-init backing volumes for a launch and
/// appends them, plus any user-declared data volumes, to the VM's EBS list.
pub struct BootVolumeBuilder {
    services: Services,
}

impl BootVolumeBuilder {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Clone-on-first-boot: the boot volume id is derived from the instance
    /// and image, so a relaunch finds and reuses the existing volume.
    pub async fn prepare_boot_volume(&self, vm: &VmRecord) -> Result<EbsRequest> {
        let boot_id = derive_volume_id(&format!("{}/{}", vm.id, vm.image_id));

        if self.services.blocks.exists(&boot_id).await? {
            debug!("Reusing existing boot volume {} for {}", boot_id, vm.id);
        } else {
            let source_name = self.services.images.source_volume(&vm.image_id).await?;
            if !self.services.blocks.exists(&source_name).await? {
                return Err(HiveError::BlockStorage(format!(
                    "image source volume {} missing",
                    source_name
                )));
            }
            let mut source = self.services.blocks.open(&source_name, 0).await?;
            let size_bytes = source.block_count() * source.block_size() as u64;
            let mut dest = self.services.blocks.open(&boot_id, size_bytes).await?;

            copy_volume(source.as_mut(), dest.as_mut()).await?;

            source.close().await?;
            dest.close().await?;
            info!(
                "Cloned boot volume {} from image {} ({} bytes)",
                boot_id, vm.image_id, size_bytes
            );

            let size_gib = size_bytes.div_ceil(1024 * 1024 * 1024);
            self.services.volumes.register(&boot_id, size_gib).await?;
        }

        let mut req = EbsRequest::data_volume(boot_id, "/dev/sda");
        req.boot = true;
        req.delete_on_termination = true;
        Ok(req)
    }

    /// 64 MiB of EFI variable storage, created once per instance.
    pub async fn prepare_efi_volume(&self, vm: &VmRecord) -> Result<EbsRequest> {
        let efi_id = derive_volume_id(&format!("{}/efi", vm.id));
        if !self.services.blocks.exists(&efi_id).await? {
            let mut vol = self.services.blocks.open(&efi_id, EFI_VOLUME_BYTES).await?;
            vol.close().await?;
            debug!("Created EFI volume {} for {}", efi_id, vm.id);
        }

        let mut req = EbsRequest::data_volume(efi_id, "/dev/sdb");
        req.efi = true;
        req.delete_on_termination = true;
        Ok(req)
    }

    /// 1 MiB cloud-init seed populated from the rendered user-data and
    /// meta-data documents.
    pub async fn prepare_cloud_init_volume(&self, vm: &VmRecord) -> Result<EbsRequest> {
        let ci_id = derive_volume_id(&format!("{}/cloud-init", vm.id));

        let ssh_key = match &vm.key_name {
            Some(name) => self.services.keys.public_key(name).await?,
            None => None,
        };
        let user_data = match &vm.user_data {
            Some(custom) => custom.clone(),
            None => render_user_data(ssh_key.as_deref(), None),
        };
        let meta_data = render_meta_data(&vm.id, &vm.id);

        let iso = self
            .services
            .cloud_init
            .build_iso(&user_data, &meta_data)
            .await?;
        if iso.len() as u64 > CLOUD_INIT_VOLUME_BYTES {
            return Err(HiveError::BlockStorage(format!(
                "cloud-init seed is {} bytes, exceeds the 1 MiB volume",
                iso.len()
            )));
        }

        let mut vol = self
            .services
            .blocks
            .open(&ci_id, CLOUD_INIT_VOLUME_BYTES)
            .await?;
        let block_size = vol.block_size();
        for (i, chunk) in iso.chunks(block_size).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            vol.write_block(i as u64, &block).await?;
        }
        vol.close().await?;

        let mut req = EbsRequest::data_volume(ci_id, "/dev/sdc");
        req.cloud_init = true;
        req.delete_on_termination = true;
        Ok(req)
    }

    /// Full launch preparation: boot + EFI + cloud-init plus the declared
    /// data volumes, appended in order to the VM's EBS list. A relaunch
    /// that already carries the internal entries keeps them untouched.
    pub async fn prepare(&self, vm: &VmRecord, data_volumes: Vec<EbsRequest>) -> Result<()> {
        let (has_boot, has_efi, has_cloud_init) = {
            let list = vm.ebs_requests.lock().unwrap();
            (
                list.iter().any(|e| e.boot),
                list.iter().any(|e| e.efi),
                list.iter().any(|e| e.cloud_init),
            )
        };

        if !has_boot {
            let boot = self.prepare_boot_volume(vm).await?;
            vm.upsert_ebs(boot);
        }
        if !has_efi {
            let efi = self.prepare_efi_volume(vm).await?;
            vm.upsert_ebs(efi);
        }
        if !has_cloud_init {
            let cloud_init = self.prepare_cloud_init_volume(vm).await?;
            vm.upsert_ebs(cloud_init);
        }
        for data in data_volumes {
            vm.upsert_ebs(data);
        }
        Ok(())
    }
}

/// Block-by-block clone. All-zero source blocks are skipped; the
/// destination flushes every 4 MiB of written data.
async fn copy_volume(source: &mut dyn BlockVolume, dest: &mut dyn BlockVolume) -> Result<()> {
    let mut since_flush: u64 = 0;
    for index in 0..source.block_count() {
        let block = source.read_block(index).await?;
        if block.iter().all(|&b| b == 0) {
            continue;
        }
        dest.write_block(index, &block).await?;
        since_flush += block.len() as u64;
        if since_flush >= FLUSH_INTERVAL_BYTES {
            dest.flush().await?;
            since_flush = 0;
        }
    }
    dest.flush().await?;
    Ok(())
}
