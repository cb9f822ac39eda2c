//! Host-side client for the per-sandbox vsock RPC channel.
//!
//! The hypervisor exposes its vsock device to the host as a UNIX domain
//! socket (the multiplexer). Reaching a specific guest port means dialing
//! that UDS and performing a short textual handshake:
//!
//! ```text
//! host:  CONNECT <port>\n
//! guest: OK <local-port>\n
//! ```
//!
//! After the handshake the socket is a raw bidirectional stream to the
//! guest agent's accept side, framed as `[4-byte BE length][JSON body]`
//! (see `vsock_proto`).

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};

use vsock_proto::{Decoder, Request, Response};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);
const READ_BUF_SIZE: usize = 64 * 1024;

/// Host-side handle to a single guest agent, reached through the
/// sandbox's vsock multiplexer UDS.
pub struct VsockRpc {
    stream: UnixStream,
    decoder: Decoder,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
    max_message_size: usize,
}

impl VsockRpc {
    /// Dial the multiplexer UDS and connect to the guest's listening port,
    /// retrying the handshake with a fixed backoff until `timeout` elapses.
    /// Every retry opens a fresh socket — a half-open one is never reused.
    pub async fn connect(
        multiplexer_path: &str,
        guest_port: u32,
        max_message_size: usize,
        timeout: Duration,
    ) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;

        loop {
            match Self::try_connect_once(multiplexer_path, guest_port, max_message_size).await {
                Ok(rpc) => return Ok(rpc),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_connect_once(
        multiplexer_path: &str,
        guest_port: u32,
        max_message_size: usize,
    ) -> io::Result<Self> {
        let mut stream = UnixStream::connect(multiplexer_path).await?;
        stream
            .write_all(format!("CONNECT {guest_port}\n").as_bytes())
            .await?;

        let mut line = String::new();
        {
            let mut reader = BufReader::new(&mut stream);
            reader.read_line(&mut line).await?;
        }

        if !line.trim_end().starts_with("OK") {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("vsock handshake refused: {}", line.trim_end()),
            ));
        }

        Ok(Self {
            stream,
            decoder: Decoder::new(max_message_size),
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
            max_message_size,
        })
    }

    /// Send one request and read back one response, applying `deadline` as
    /// a socket-level cutoff.
    async fn call(&mut self, request: &Request, deadline: Instant) -> io::Result<Response> {
        let frame = vsock_proto::encode(request, self.max_message_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        time::timeout_at(deadline, self.stream.write_all(&frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))??;

        loop {
            let n = time::timeout_at(deadline, self.stream.read(self.read_buf.as_mut()))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "guest connection closed",
                ));
            }

            let frames = self
                .decoder
                .decode(self.read_buf.get(..n).unwrap_or_default())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

            if let Some(body) = frames.first() {
                let response: Response = serde_json::from_slice(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                return Ok(response);
            }
        }
    }

    /// Run a command in the guest. `timeout` is the logical command
    /// timeout; the socket deadline is `timeout + 5s`.
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        working_dir: Option<&str>,
        env: std::collections::HashMap<String, String>,
    ) -> io::Result<Response> {
        let deadline = Instant::now() + timeout + Duration::from_secs(5);
        let request = Request::Exec {
            command: command.to_string(),
            timeout: Some(timeout.as_secs()),
            working_dir: working_dir.map(str::to_string),
            env,
        };
        self.call(&request, deadline).await
    }

    pub async fn read_file(&mut self, path: &str) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::ReadFile {
                path: path.to_string(),
            },
            deadline,
        )
        .await
    }

    pub async fn write_file(
        &mut self,
        path: &str,
        content: &str,
        is_base64: bool,
        mode: Option<u32>,
    ) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::WriteFile {
                path: path.to_string(),
                content: content.to_string(),
                is_base64,
                mode,
            },
            deadline,
        )
        .await
    }

    pub async fn delete_file(&mut self, path: &str, recursive: bool) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::DeleteFile {
                path: path.to_string(),
                recursive,
            },
            deadline,
        )
        .await
    }

    pub async fn list_files(&mut self, path: &str, recursive: bool) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::ListFiles {
                path: path.to_string(),
                recursive,
            },
            deadline,
        )
        .await
    }

    pub async fn mkdir(&mut self, path: &str, parents: bool) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::Mkdir {
                path: path.to_string(),
                parents,
            },
            deadline,
        )
        .await
    }

    pub async fn stat(&mut self, path: &str) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(
            &Request::Stat {
                path: path.to_string(),
            },
            deadline,
        )
        .await
    }

    pub async fn ping(&mut self) -> io::Result<Response> {
        let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
        self.call(&Request::Ping, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// A tempdir-backed socket path. Leaks the tempdir so the path stays
    /// valid for the life of the test; fine at test scope.
    fn socket_path() -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        std::mem::forget(dir);
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn connect_rejects_bad_handshake_line() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"NOPE\n").await.unwrap();
        });

        let err = VsockRpc::connect(
            &path,
            5000,
            vsock_proto::DEFAULT_MAX_MESSAGE_SIZE,
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            {
                let mut reader = BufReader::new(&mut stream);
                reader.read_line(&mut line).await.unwrap();
            }
            assert!(line.starts_with("CONNECT "));
            stream.write_all(b"OK 1\n").await.unwrap();

            let mut decoder = Decoder::new(vsock_proto::DEFAULT_MAX_MESSAGE_SIZE);
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let frames = decoder.decode(buf.get(..n).unwrap()).unwrap();
            let req: Request = serde_json::from_slice(frames.first().unwrap()).unwrap();
            assert!(matches!(req, Request::Ping));

            let resp = Response {
                success: true,
                message: Some("pong".into()),
                pid: Some(123),
                ..Default::default()
            };
            let frame =
                vsock_proto::encode(&resp, vsock_proto::DEFAULT_MAX_MESSAGE_SIZE).unwrap();
            stream.write_all(&frame).await.unwrap();
        });

        let mut client = VsockRpc::connect(
            &path,
            5000,
            vsock_proto::DEFAULT_MAX_MESSAGE_SIZE,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let resp = client.ping().await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.message.as_deref(), Some("pong"));
        assert_eq!(resp.pid, Some(123));
    }

    #[tokio::test]
    async fn exec_reports_guest_error_without_transport_failure() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            {
                let mut reader = BufReader::new(&mut stream);
                reader.read_line(&mut line).await.unwrap();
            }
            stream.write_all(b"OK 1\n").await.unwrap();

            let mut decoder = Decoder::new(vsock_proto::DEFAULT_MAX_MESSAGE_SIZE);
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let _frames = decoder.decode(buf.get(..n).unwrap()).unwrap();

            let resp = Response {
                success: false,
                error: Some("command not found".into()),
                ..Default::default()
            };
            let frame =
                vsock_proto::encode(&resp, vsock_proto::DEFAULT_MAX_MESSAGE_SIZE).unwrap();
            stream.write_all(&frame).await.unwrap();
        });

        let mut client = VsockRpc::connect(
            &path,
            5000,
            vsock_proto::DEFAULT_MAX_MESSAGE_SIZE,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let resp = client
            .exec(
                "badcmd",
                Duration::from_secs(5),
                None,
                std::collections::HashMap::new(),
            )
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("command not found"));
    }

    #[tokio::test]
    async fn connect_retries_until_listener_is_ready() {
        let path = socket_path();
        let path_for_connector = path.clone();

        let connector = tokio::spawn(async move {
            VsockRpc::connect(
                &path_for_connector,
                5000,
                vsock_proto::DEFAULT_MAX_MESSAGE_SIZE,
                Duration::from_secs(2),
            )
            .await
        });

        // Listener doesn't exist yet; the first connect attempts fail and
        // retry until we bind it here.
        time::sleep(Duration::from_millis(250)).await;
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"OK 1\n").await.unwrap();
        });

        let result = connector.await.unwrap();
        assert!(result.is_ok());
    }
}
