//! Drives one Firecracker subprocess per sandbox over its control UDS.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError};
use crate::process::kill_process_group;

const CONTROL_SOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/init";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("control socket did not appear within {0:?}")]
    BootTimeout(Duration),
    #[error("failed to spawn firecracker: {0}")]
    Spawn(String),
    #[error("firecracker api error: {0}")]
    Api(#[from] ApiError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for a fresh-boot `configure` sequence.
pub struct MachineConfig<'a> {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub kernel_path: &'a Path,
    pub rootfs_path: &'a Path,
    pub guest_cid: u32,
    pub vsock_uds_path: &'a Path,
}

/// A running Firecracker subprocess plus the control-API client bound to
/// its UDS. Dropping this does not kill the process — callers own the
/// child's lifecycle explicitly via [`HypervisorDriver::kill`].
pub struct HypervisorDriver {
    child: tokio::process::Child,
    api: ApiClient,
}

impl HypervisorDriver {
    /// Spawn the hypervisor binary bound to `control_sock`, with `cwd` as
    /// its working directory, and wait for the control socket to appear.
    pub async fn spawn(
        firecracker_bin: &Path,
        control_sock: &Path,
        cwd: &Path,
        boot_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let _ = tokio::fs::remove_file(control_sock).await;

        let mut child = tokio::process::Command::new(firecracker_bin)
            .arg("--api-sock")
            .arg(control_sock)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;

        stream_logs(&mut child);

        let deadline = Instant::now() + boot_timeout;
        loop {
            if control_sock.exists() {
                break;
            }
            if Instant::now() >= deadline {
                kill_process_group(&child);
                let _ = child.wait().await;
                return Err(DriverError::BootTimeout(boot_timeout));
            }
            tokio::time::sleep(CONTROL_SOCK_POLL_INTERVAL).await;
        }

        let api = ApiClient::new(control_sock);
        Ok(Self { child, api })
    }

    /// Run the fresh-boot configure/attach/start sequence in fixed order.
    pub async fn configure_and_start(&self, config: &MachineConfig<'_>) -> Result<(), DriverError> {
        self.api
            .configure_machine(config.vcpu_count, config.mem_size_mib)
            .await?;
        self.api
            .set_boot_source(config.kernel_path, DEFAULT_BOOT_ARGS)
            .await?;
        self.api
            .attach_root_drive("rootfs", config.rootfs_path)
            .await?;
        self.api
            .attach_vsock("vsock0", config.guest_cid, config.vsock_uds_path)
            .await?;
        self.api.instance_start().await?;
        Ok(())
    }

    /// Pause the VM and write a full snapshot to `snapshot_path`/`mem_path`.
    pub async fn pause_and_snapshot(
        &self,
        snapshot_path: &Path,
        mem_path: &Path,
    ) -> Result<(), DriverError> {
        self.api.pause_vm().await?;
        self.api.snapshot_create(snapshot_path, mem_path).await?;
        Ok(())
    }

    /// Load a snapshot and resume execution. Used right after `spawn` when
    /// restoring instead of fresh-booting.
    pub async fn load_snapshot(
        &self,
        snapshot_path: &Path,
        mem_path: &Path,
    ) -> Result<(), DriverError> {
        self.api.snapshot_load(snapshot_path, mem_path).await?;
        Ok(())
    }

    /// Best-effort graceful shutdown request; does not wait for the guest
    /// to act on it.
    pub async fn ctrl_alt_del(&self) -> Result<(), DriverError> {
        self.api.ctrl_alt_del().await?;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Force-kill the subprocess's entire process group and reap it so
    /// repeated create/destroy cycles do not accumulate zombies.
    pub async fn kill(mut self) {
        kill_process_group(&self.child);
        let _ = self.child.wait().await;
    }
}

fn stream_logs(child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(target: "firecracker", "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(target: "firecracker", "stderr: {line}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_reports_boot_timeout_when_binary_never_creates_socket() {
        let dir = tempfile::tempdir().unwrap();
        let control_sock = dir.path().join("firecracker.sock");

        // `sleep` never creates the control socket, so spawn should time out
        // quickly and kill the child rather than hang.
        let result = HypervisorDriver::spawn(
            Path::new("/bin/sleep"),
            &control_sock,
            dir.path(),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(DriverError::BootTimeout(_))));
    }
}
