//! Client for the per-sandbox Firecracker control API, reached over a
//! UNIX domain socket via HTTP/1.1.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("request error: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("firecracker rejected request to {endpoint}: {message}")]
    Rejected { endpoint: String, message: String },
}

#[derive(Debug, Deserialize)]
struct FaultMessage {
    fault_message: String,
}

/// Thin wrapper over Firecracker's control-UDS HTTP API for one sandbox.
pub struct ApiClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::unix(),
            socket_path: socket_path.into(),
        }
    }

    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        expected: StatusCode,
    ) -> Result<(), ApiError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, path).into();
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };

        let mut builder = Request::builder().method(method).uri(uri);
        if !body_bytes.is_empty() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body_bytes)))?;

        let response = self.client.request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if status == expected {
            return Ok(());
        }

        let message = serde_json::from_slice::<FaultMessage>(&body)
            .map(|f| f.fault_message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

        Err(ApiError::Rejected {
            endpoint: path.to_string(),
            message,
        })
    }

    pub async fn configure_machine(&self, vcpu_count: u32, mem_size_mib: u32) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/machine-config",
            Some(&serde_json::json!({
                "vcpu_count": vcpu_count,
                "mem_size_mib": mem_size_mib,
                "smt": false,
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/boot-source",
            Some(&serde_json::json!({
                "kernel_image_path": kernel_path.display().to_string(),
                "boot_args": boot_args,
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn attach_root_drive(&self, drive_id: &str, host_path: &Path) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            &format!("/drives/{drive_id}"),
            Some(&serde_json::json!({
                "drive_id": drive_id,
                "path_on_host": host_path.display().to_string(),
                "is_root_device": true,
                "is_read_only": false,
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn attach_vsock(&self, vsock_id: &str, guest_cid: u32, uds_path: &Path) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/vsock",
            Some(&serde_json::json!({
                "vsock_id": vsock_id,
                "guest_cid": guest_cid,
                "uds_path": uds_path.display().to_string(),
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn instance_start(&self) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/actions",
            Some(&serde_json::json!({ "action_type": "InstanceStart" })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/actions",
            Some(&serde_json::json!({ "action_type": "SendCtrlAltDel" })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn pause_vm(&self) -> Result<(), ApiError> {
        self.request(
            Method::PATCH,
            "/vm",
            Some(&serde_json::json!({ "state": "Paused" })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn snapshot_create(&self, snapshot_path: &Path, mem_file_path: &Path) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/snapshot/create",
            Some(&serde_json::json!({
                "snapshot_type": "Full",
                "snapshot_path": snapshot_path.display().to_string(),
                "mem_file_path": mem_file_path.display().to_string(),
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }

    pub async fn snapshot_load(&self, snapshot_path: &Path, mem_file_path: &Path) -> Result<(), ApiError> {
        self.request(
            Method::PUT,
            "/snapshot/load",
            Some(&serde_json::json!({
                "snapshot_path": snapshot_path.display().to_string(),
                "mem_backend": {
                    "backend_type": "File",
                    "backend_path": mem_file_path.display().to_string(),
                },
                "enable_diff_snapshots": false,
                "resume_vm": true,
            })),
            StatusCode::NO_CONTENT,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_normalizes_path() {
        let client = ApiClient::new("/tmp/sandbox/firecracker.sock");
        assert_eq!(
            client.socket_path,
            PathBuf::from("/tmp/sandbox/firecracker.sock")
        );
    }
}
