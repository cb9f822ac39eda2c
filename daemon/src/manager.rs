//! Orchestrator owning the sandbox table, the vsock client table, and the
//! CID cursor behind one lock. Every lifecycle method runs under a single
//! `tracing::info_span!` tagged with the sandbox id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hypervisor::{ArtifactLayout, HypervisorDriver, MachineConfig, create_overlay};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn};
use vsock_host::VsockRpc;

use crate::config::ConfigStore;
use crate::error::{ManagerError, ManagerResult};
use crate::types::{Sandbox, SandboxStatus};

const FIRST_GUEST_CID: u32 = 3;
const POST_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct ManagerState {
    table: HashMap<String, Sandbox>,
    clients: HashMap<String, Arc<Mutex<VsockRpc>>>,
    drivers: HashMap<String, HypervisorDriver>,
    next_cid: u32,
}

pub struct SandboxManager {
    config: Arc<ConfigStore>,
    layout: ArtifactLayout,
    state: Mutex<ManagerState>,
}

impl SandboxManager {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let layout = ArtifactLayout::new(
            config.paths.kernels_dir.clone(),
            config.paths.rootfs_dir.clone(),
            config.paths.sandboxes_dir.clone(),
            config.paths.snapshots_dir.clone(),
        );
        Self {
            config,
            layout,
            state: Mutex::new(ManagerState {
                table: HashMap::new(),
                clients: HashMap::new(),
                drivers: HashMap::new(),
                next_cid: FIRST_GUEST_CID,
            }),
        }
    }

    /// Walk the sandboxes root on startup, materializing every parseable
    /// state file as a `stopped`, inventory-only entry and advancing the
    /// CID cursor past it. Unparseable entries are logged and left alone.
    pub async fn reload(&self) -> std::io::Result<()> {
        let root = self.layout.sandboxes_root();
        if !root.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut state = self.state.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let state_path = self.layout.state_file(&id);
            let contents = match tokio::fs::read(&state_path).await {
                Ok(c) => c,
                Err(_) => {
                    warn!(sandbox_id = %id, "skipping sandbox dir with no state file");
                    continue;
                }
            };
            match serde_json::from_slice::<Sandbox>(&contents) {
                Ok(mut sandbox) => {
                    sandbox.status = SandboxStatus::Stopped;
                    sandbox.firecracker_pid = None;
                    if sandbox.vsock_cid >= state.next_cid {
                        state.next_cid = sandbox.vsock_cid + 1;
                    }
                    info!(sandbox_id = %id, "reloaded sandbox as stopped");
                    state.table.insert(id, sandbox);
                }
                Err(e) => {
                    warn!(sandbox_id = %id, error = %e, "unparseable state file, skipping");
                }
            }
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<Sandbox> {
        self.state.lock().await.table.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> ManagerResult<Sandbox> {
        self.state
            .lock()
            .await
            .table
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    pub async fn memory_used_mb(&self) -> u32 {
        self.state
            .lock()
            .await
            .table
            .values()
            .filter(|s| s.status == SandboxStatus::Running)
            .map(|s| s.memory_mb)
            .sum()
    }

    pub async fn live_count(&self) -> usize {
        self.state
            .lock()
            .await
            .table
            .values()
            .filter(|s| matches!(s.status, SandboxStatus::Running | SandboxStatus::Paused))
            .count()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    #[allow(clippy::too_many_lines)]
    pub async fn create(
        &self,
        template: String,
        memory_mb: Option<u32>,
        vcpu_count: Option<u32>,
        workspace_id: Option<String>,
    ) -> ManagerResult<Sandbox> {
        let memory_mb = memory_mb.unwrap_or(self.config.limits.default_memory_mb);
        let vcpu_count = vcpu_count.unwrap_or(self.config.limits.default_vcpu_count);
        if vcpu_count < self.config.limits.min_vcpu_count
            || vcpu_count > self.config.limits.max_vcpu_count
        {
            return Err(ManagerError::ValidationError(format!(
                "vcpu_count {vcpu_count} outside [{}, {}]",
                self.config.limits.min_vcpu_count, self.config.limits.max_vcpu_count
            )));
        }

        {
            let state = self.state.lock().await;
            let live_count = state
                .table
                .values()
                .filter(|s| matches!(s.status, SandboxStatus::Running | SandboxStatus::Paused))
                .count();
            let memory_used: u32 = state
                .table
                .values()
                .filter(|s| s.status == SandboxStatus::Running)
                .map(|s| s.memory_mb)
                .sum();
            let budget = self.config.total_memory_budget_mb();
            let accountant =
                crate::capacity::CapacityAccountant::new(&self.config.limits, budget);
            accountant
                .can_admit(live_count, memory_used, memory_mb)
                .map_err(|e| match e {
                    crate::capacity::AdmitError::Validation(reason) => {
                        ManagerError::ValidationError(reason)
                    }
                    crate::capacity::AdmitError::Capacity(reason) => {
                        ManagerError::CapacityExceeded(reason)
                    }
                })?;
        }

        let sandbox_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let workspace_id = workspace_id.unwrap_or_else(|| sandbox_id.clone());
        let span = info_span!("create_sandbox", sandbox_id = %sandbox_id);
        let _enter = span.enter();

        let kernel = self.layout.kernel(&template);
        if !kernel.exists() {
            return Err(ManagerError::MissingArtifact(format!(
                "kernel not found for template {template}: {}",
                kernel.display()
            )));
        }
        let base_rootfs = self.layout.base_rootfs(&template);
        if !base_rootfs.exists() {
            return Err(ManagerError::MissingArtifact(format!(
                "rootfs not found for template {template}: {}",
                base_rootfs.display()
            )));
        }

        let sandbox_dir = self.layout.sandbox_dir(&sandbox_id);
        tokio::fs::create_dir_all(&sandbox_dir).await?;
        tokio::fs::create_dir_all(self.layout.workspace_dir(&sandbox_id)).await?;

        let overlay = self.layout.overlay(&sandbox_id);
        if let Err(e) = create_overlay(&base_rootfs, &overlay).await {
            let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;
            return Err(ManagerError::HypervisorError(e.to_string()));
        }

        let vsock_cid = {
            let mut state = self.state.lock().await;
            let cid = state.next_cid;
            state.next_cid += 1;
            cid
        };

        let control_sock = self.layout.control_sock(&sandbox_id);
        let vsock_sock = self.layout.vsock_sock(&sandbox_id);

        let driver = match HypervisorDriver::spawn(
            &self.config.paths.firecracker_bin,
            &control_sock,
            &sandbox_dir,
            self.config.timeouts.vm_boot_timeout,
        )
        .await
        {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;
                return Err(ManagerError::HypervisorError(e.to_string()));
            }
        };

        let machine_config = MachineConfig {
            vcpu_count,
            mem_size_mib: memory_mb,
            kernel_path: &kernel,
            rootfs_path: &overlay,
            guest_cid: vsock_cid,
            vsock_uds_path: &vsock_sock,
        };
        if let Err(e) = driver.configure_and_start(&machine_config).await {
            driver.kill().await;
            let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;
            return Err(ManagerError::HypervisorError(e.to_string()));
        }

        let pid = driver.pid();
        let sandbox = Sandbox {
            sandbox_id: sandbox_id.clone(),
            workspace_id,
            template,
            memory_mb,
            vcpu_count,
            status: SandboxStatus::Running,
            created_at: chrono::Utc::now(),
            vsock_cid,
            firecracker_pid: pid,
            guest_ip: None,
        };
        self.persist(&sandbox).await?;

        {
            let mut state = self.state.lock().await;
            state.table.insert(sandbox_id.clone(), sandbox.clone());
            state.drivers.insert(sandbox_id.clone(), driver);
        }

        match VsockRpc::connect(
            &vsock_sock.to_string_lossy(),
            self.config.transport.vsock_port,
            self.config.transport.max_message_size,
            self.config.timeouts.guest_agent_timeout,
        )
        .await
        {
            Ok(client) => {
                let mut state = self.state.lock().await;
                state
                    .clients
                    .insert(sandbox_id.clone(), Arc::new(Mutex::new(client)));
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "guest agent unreachable at create, will retry on first use");
            }
        }

        info!(sandbox_id = %sandbox_id, "sandbox created");
        Ok(sandbox)
    }

    pub async fn destroy(&self, id: &str) -> ManagerResult<()> {
        let span = info_span!("destroy_sandbox", sandbox_id = %id);
        let _enter = span.enter();

        let (driver, _client) = {
            let mut state = self.state.lock().await;
            if !state.table.contains_key(id) {
                return Err(ManagerError::NotFound(id.to_string()));
            }
            let driver = state.drivers.remove(id);
            let client = state.clients.remove(id);
            (driver, client)
        };

        if let Some(driver) = driver {
            let _ = driver.ctrl_alt_del().await;
            tokio::time::sleep(POST_SHUTDOWN_GRACE).await;
            driver.kill().await;
        }

        let sandbox_dir = self.layout.sandbox_dir(id);
        let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;

        self.state.lock().await.table.remove(id);
        info!(sandbox_id = %id, "sandbox destroyed");
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> ManagerResult<()> {
        let span = info_span!("pause_sandbox", sandbox_id = %id);
        let _enter = span.enter();

        let mut sandbox = self.get(id).await?;
        if sandbox.status != SandboxStatus::Running {
            return Err(ManagerError::InvalidState(format!(
                "sandbox {id} is not running"
            )));
        }

        let snapshot_dir = self.layout.snapshot_dir(id);
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        let snapshot_path = self.layout.snapshot_file(id);
        let mem_path = self.layout.memory_file(id);

        let driver = {
            let mut state = self.state.lock().await;
            state
                .drivers
                .remove(id)
                .ok_or_else(|| ManagerError::InvalidState(format!("no driver for sandbox {id}")))?
        };
        let snapshot_result = driver.pause_and_snapshot(&snapshot_path, &mem_path).await;
        driver.kill().await;
        snapshot_result?;

        sandbox.status = SandboxStatus::Paused;
        sandbox.firecracker_pid = None;
        self.persist(&sandbox).await?;

        let mut state = self.state.lock().await;
        state.table.insert(id.to_string(), sandbox);
        state.clients.remove(id);
        info!(sandbox_id = %id, "sandbox paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> ManagerResult<Sandbox> {
        let span = info_span!("resume_sandbox", sandbox_id = %id);
        let _enter = span.enter();

        let mut sandbox = self.get(id).await?;
        if sandbox.status == SandboxStatus::Running {
            return Err(ManagerError::InvalidState(format!(
                "sandbox {id} is already running"
            )));
        }
        let snapshot_path = self.layout.snapshot_file(id);
        if !snapshot_path.exists() {
            return Err(ManagerError::MissingArtifact(format!(
                "no snapshot for sandbox {id}"
            )));
        }
        let mem_path = self.layout.memory_file(id);

        let control_sock = self.layout.control_sock(id);
        let sandbox_dir = self.layout.sandbox_dir(id);
        let driver = HypervisorDriver::spawn(
            &self.config.paths.firecracker_bin,
            &control_sock,
            &sandbox_dir,
            self.config.timeouts.vm_boot_timeout,
        )
        .await?;
        driver.load_snapshot(&snapshot_path, &mem_path).await?;

        sandbox.status = SandboxStatus::Running;
        sandbox.firecracker_pid = driver.pid();
        self.persist(&sandbox).await?;

        let vsock_sock = self.layout.vsock_sock(id);
        {
            let mut state = self.state.lock().await;
            state.drivers.insert(id.to_string(), driver);
            state.table.insert(id.to_string(), sandbox.clone());
        }

        match VsockRpc::connect(
            &vsock_sock.to_string_lossy(),
            self.config.transport.vsock_port,
            self.config.transport.max_message_size,
            self.config.timeouts.guest_agent_timeout,
        )
        .await
        {
            Ok(client) => {
                self.state
                    .lock()
                    .await
                    .clients
                    .insert(id.to_string(), Arc::new(Mutex::new(client)));
            }
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "guest agent unreachable after resume, will retry on first use");
            }
        }

        info!(sandbox_id = %id, "sandbox resumed");
        Ok(sandbox)
    }

    /// Returns the per-sandbox RPC client, connecting lazily if a prior
    /// connect attempt failed or was never made.
    pub async fn rpc_client(&self, id: &str) -> ManagerResult<Arc<Mutex<VsockRpc>>> {
        {
            let state = self.state.lock().await;
            if let Some(client) = state.clients.get(id) {
                return Ok(client.clone());
            }
            if !state.table.contains_key(id) {
                return Err(ManagerError::NotFound(id.to_string()));
            }
        }

        let vsock_sock = self.layout.vsock_sock(id);
        let client = VsockRpc::connect(
            &vsock_sock.to_string_lossy(),
            self.config.transport.vsock_port,
            self.config.transport.max_message_size,
            self.config.timeouts.guest_agent_timeout,
        )
        .await
        .map_err(|e| ManagerError::GuestUnreachable(e.to_string()))?;

        let client = Arc::new(Mutex::new(client));
        self.state
            .lock()
            .await
            .clients
            .insert(id.to_string(), client.clone());
        Ok(client)
    }

    async fn persist(&self, sandbox: &Sandbox) -> std::io::Result<()> {
        let sandbox_dir = self.layout.sandbox_dir(&sandbox.sandbox_id);
        tokio::fs::create_dir_all(&sandbox_dir).await?;
        let tmp = sandbox_dir.join("state.json.tmp");
        let bytes = serde_json::to_vec_pretty(sandbox)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.layout.state_file(&sandbox.sandbox_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &std::path::Path) -> ConfigStore {
        let mut config = ConfigStore::from_env();
        config.paths.kernels_dir = base.join("kernels");
        config.paths.rootfs_dir = base.join("rootfs");
        config.paths.sandboxes_dir = base.join("sandboxes");
        config.paths.snapshots_dir = base.join("snapshots");
        config
    }

    fn sample_sandbox(id: &str, cid: u32, status: SandboxStatus) -> Sandbox {
        Sandbox {
            sandbox_id: id.to_string(),
            workspace_id: id.to_string(),
            template: "default".to_string(),
            memory_mb: 512,
            vcpu_count: 1,
            status,
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
            vsock_cid: cid,
            firecracker_pid: Some(1234),
            guest_ip: None,
        }
    }

    #[tokio::test]
    async fn reload_on_missing_root_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let manager = SandboxManager::new(config);
        manager.reload().await.expect("reload");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn persist_then_reload_forces_stopped_and_clears_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let manager = SandboxManager::new(config);

        let sandbox = sample_sandbox("abcd1234", 7, SandboxStatus::Running);
        manager.persist(&sandbox).await.expect("persist");

        manager.reload().await.expect("reload");
        let reloaded = manager.get("abcd1234").await.expect("reloaded sandbox");
        assert_eq!(reloaded.status, SandboxStatus::Stopped);
        assert!(reloaded.firecracker_pid.is_none());
    }

    #[tokio::test]
    async fn reload_advances_cid_cursor_past_highest_reloaded_cid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let manager = SandboxManager::new(config);

        manager
            .persist(&sample_sandbox("aaaa0001", 9, SandboxStatus::Running))
            .await
            .expect("persist");
        manager.reload().await.expect("reload");

        let next_cid = manager.state.lock().await.next_cid;
        assert_eq!(next_cid, 10);
    }

    #[tokio::test]
    async fn reload_skips_directories_with_no_state_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        tokio::fs::create_dir_all(config.paths.sandboxes_dir.join("orphan"))
            .await
            .expect("mkdir");
        let manager = SandboxManager::new(config);

        manager.reload().await.expect("reload");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn reload_skips_unparseable_state_file_without_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let sandbox_dir = config.paths.sandboxes_dir.join("badd0001");
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .expect("mkdir");
        tokio::fs::write(sandbox_dir.join("state.json"), b"not json")
            .await
            .expect("write");
        let manager = SandboxManager::new(config);

        manager.reload().await.expect("reload");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn memory_used_mb_counts_only_running_sandboxes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let manager = SandboxManager::new(config);

        {
            let mut state = manager.state.lock().await;
            state.table.insert(
                "run00001".to_string(),
                sample_sandbox("run00001", 3, SandboxStatus::Running),
            );
            state.table.insert(
                "pau00001".to_string(),
                sample_sandbox("pau00001", 4, SandboxStatus::Paused),
            );
            state.table.insert(
                "sto00001".to_string(),
                sample_sandbox("sto00001", 5, SandboxStatus::Stopped),
            );
        }

        assert_eq!(manager.memory_used_mb().await, 512);
        assert_eq!(manager.live_count().await, 2);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(dir.path()));
        let manager = SandboxManager::new(config);

        let err = manager.get("missing1").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_below_min_memory_is_a_validation_error_not_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.limits.min_memory_mb = 256;
        let manager = SandboxManager::new(Arc::new(config));

        let err = manager
            .create("default".to_string(), Some(128), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ValidationError(ref r) if r.contains("Memory too low")));
    }

    #[tokio::test]
    async fn create_at_max_sandboxes_is_a_capacity_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.limits.max_sandboxes = 0;
        let manager = SandboxManager::new(Arc::new(config));

        let err = manager
            .create("default".to_string(), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::CapacityExceeded(ref r) if r.contains("Maximum sandbox limit")));
    }
}
