//! Shared test doubles: a scripted `DeviceLink` and a raw-TCP HTTP server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pixelflash_transfer::digest_bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};

use crate::config::EngineConfig;
use crate::device::{DeviceConnector, DeviceFuture, DeviceLink};
use crate::error::DeviceError;
use crate::types::{ChunkRequest, Destination, HashReport, UploadRequest};

// ---------------------------------------------------------------------------
// MockDevice
// ---------------------------------------------------------------------------

/// How the mock answers hash queries.
pub(crate) enum HashMode {
    /// No hash endpoint.
    Absent,
    /// Digest of whatever was stored, upper-cased.
    Echo,
    Fixed(HashReport),
    Error,
}

/// Pauses `upload_chunk` for one index until released.
pub(crate) struct ChunkGate {
    pub index: u32,
    pub reached: oneshot::Sender<()>,
    pub release: Arc<Notify>,
}

pub(crate) struct MockDevice {
    pub probe_fails: bool,
    pub hash: Mutex<HashMode>,
    pub hash_delay: Option<Duration>,
    pub stored: Mutex<Vec<u8>>,
    pub uploads: Mutex<Vec<UploadRequest>>,
    pub chunks: Mutex<Vec<ChunkRequest>>,
    pub metadata: Mutex<Vec<serde_json::Value>>,
    /// Remaining forced failures per chunk index.
    pub chunk_failures: Mutex<HashMap<u32, u32>>,
    /// Remaining forced upload failures.
    pub upload_failures: AtomicU32,
    pub chunk_attempts: AtomicU32,
    pub upload_attempts: AtomicU32,
    pub probes: AtomicU32,
    pub gate: Mutex<Option<ChunkGate>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            probe_fails: false,
            hash: Mutex::new(HashMode::Echo),
            hash_delay: None,
            stored: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            metadata: Mutex::new(Vec::new()),
            chunk_failures: Mutex::new(HashMap::new()),
            upload_failures: AtomicU32::new(0),
            chunk_attempts: AtomicU32::new(0),
            upload_attempts: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn with_hash(self, mode: HashMode) -> Self {
        *self.hash.lock().unwrap() = mode;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn injected_failure() -> DeviceError {
        DeviceError::Status {
            status: 500,
            body: "injected failure".into(),
        }
    }
}

impl DeviceLink for MockDevice {
    fn probe(&self) -> DeviceFuture<'_, ()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let fails = self.probe_fails;
        Box::pin(async move {
            if fails {
                Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            } else {
                Ok(())
            }
        })
    }

    fn upload(&self, request: UploadRequest) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.upload_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.upload_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.upload_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::injected_failure());
            }
            *self.stored.lock().unwrap() = request.data.clone();
            self.uploads.lock().unwrap().push(request);
            Ok(())
        })
    }

    fn upload_chunk(&self, request: ChunkRequest) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.chunk_attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut failures = self.chunk_failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&request.index)
                    && *left > 0
                {
                    *left -= 1;
                    return Err(Self::injected_failure());
                }
            }

            let index = request.index;
            self.stored.lock().unwrap().extend_from_slice(&request.data);
            self.chunks.lock().unwrap().push(request);

            let gate = {
                let mut slot = self.gate.lock().unwrap();
                if slot.as_ref().is_some_and(|g| g.index == index) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                let _ = gate.reached.send(());
                gate.release.notified().await;
            }
            Ok(())
        })
    }

    fn post_metadata(&self, metadata: serde_json::Value) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.metadata.lock().unwrap().push(metadata);
            Ok(())
        })
    }

    fn query_hash(&self) -> DeviceFuture<'_, Option<HashReport>> {
        Box::pin(async move {
            if let Some(delay) = self.hash_delay {
                tokio::time::sleep(delay).await;
            }
            let stored = self.stored.lock().unwrap().clone();
            match &*self.hash.lock().unwrap() {
                HashMode::Absent => Ok(None),
                HashMode::Echo => Ok(Some(HashReport {
                    status: "success".into(),
                    file: Some("/firmware.bin".into()),
                    size: Some(stored.len() as u64),
                    hash: digest_bytes(&stored).to_hex().to_uppercase(),
                })),
                HashMode::Fixed(report) => Ok(Some(report.clone())),
                HashMode::Error => Err(DeviceError::Status {
                    status: 500,
                    body: "hash unavailable".into(),
                }),
            }
        })
    }
}

pub(crate) struct MockConnector {
    pub device: Arc<MockDevice>,
}

impl DeviceConnector for MockConnector {
    fn connect(
        &self,
        _destination: &Destination,
        _config: &EngineConfig,
    ) -> Result<Arc<dyn DeviceLink>, DeviceError> {
        let device: Arc<dyn DeviceLink> = self.device.clone();
        Ok(device)
    }
}

// ---------------------------------------------------------------------------
// MockHttpServer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    pub fn json(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

type Handler = dyn Fn(&RecordedRequest) -> Reply + Send + Sync;

/// Minimal HTTP/1.1 server: one request per connection, records every
/// request before answering.
pub(crate) struct MockHttpServer {
    port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _ = serve_one(stream, recorded, handler).await;
                });
            }
        });

        Self {
            port,
            requests,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    handler: Arc<Handler>,
) -> std::io::Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let reply = handler(&request);
    recorded.lock().unwrap().push(request);

    let resp = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.content_type,
        reply.body.len(),
        reply.body
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.shutdown().await
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut request = RecordedRequest {
        method,
        path,
        headers,
        body: buf[header_end..].to_vec(),
    };

    let chunked = request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let content_length: usize = request
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    loop {
        let done = if chunked {
            request.body.ends_with(b"0\r\n\r\n")
        } else {
            request.body.len() >= content_length
        };
        if done {
            break;
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        request.body.extend_from_slice(&tmp[..n]);
    }

    Ok(Some(request))
}
