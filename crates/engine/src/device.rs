//! Device link trait and its HTTP implementation.
//!
//! `DeviceLink` is the seam between transfer logic and the device's HTTP
//! surface. Sessions only talk to a `dyn DeviceLink`, so tests drive them
//! with mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::DeviceError;
use crate::types::{ChunkRequest, Destination, DestinationKind, HashReport, UploadRequest};

/// Boxed future returned by [`DeviceLink`] methods.
pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeviceError>> + Send + 'a>>;

/// Abstract connection to one device.
pub trait DeviceLink: Send + Sync {
    /// Lightweight reachability check.
    fn probe(&self) -> DeviceFuture<'_, ()>;

    /// Sends the whole payload in one request.
    fn upload(&self, request: UploadRequest) -> DeviceFuture<'_, ()>;

    /// Sends one numbered chunk.
    fn upload_chunk(&self, request: ChunkRequest) -> DeviceFuture<'_, ()>;

    /// Declares chunk and record boundaries after the last chunk.
    fn post_metadata(&self, metadata: serde_json::Value) -> DeviceFuture<'_, ()>;

    /// Asks the device for the digest of what it stored.
    ///
    /// `Ok(None)` means the device has no such capability.
    fn query_hash(&self) -> DeviceFuture<'_, Option<HashReport>>;
}

/// Creates device links for destinations.
pub trait DeviceConnector: Send + Sync {
    fn connect(
        &self,
        destination: &Destination,
        config: &EngineConfig,
    ) -> Result<Arc<dyn DeviceLink>, DeviceError>;
}

/// Default connector: one shared `reqwest` client.
pub struct HttpConnector {
    http: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }
}

impl DeviceConnector for HttpConnector {
    fn connect(
        &self,
        destination: &Destination,
        config: &EngineConfig,
    ) -> Result<Arc<dyn DeviceLink>, DeviceError> {
        Ok(Arc::new(HttpDevice::new(
            self.http.clone(),
            destination.clone(),
            config,
        )))
    }
}

/// HTTP device link.
pub struct HttpDevice {
    http: reqwest::Client,
    destination: Destination,
    probe_timeout: Duration,
    request_timeout: Duration,
    verify_timeout: Duration,
}

impl HttpDevice {
    pub fn new(http: reqwest::Client, destination: Destination, config: &EngineConfig) -> Self {
        Self {
            http,
            destination,
            probe_timeout: config.probe_timeout(),
            request_timeout: config.request_timeout(),
            verify_timeout: config.verify_timeout(),
        }
    }

    fn url(&self, path: &str) -> Result<String, DeviceError> {
        self.destination
            .url(path)
            .ok_or(DeviceError::MissingEndpoint("http"))
    }

    async fn post(&self, url: &str, form: Form) -> Result<(), DeviceError> {
        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(DeviceError::from_reqwest)?;
        check_status(resp).await
    }

    async fn probe_http(&self) -> Result<(), DeviceError> {
        let url = self.url(&self.destination.paths.probe)?;
        let resp = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(DeviceError::from_reqwest)?;
        // Any HTTP answer proves the device is up.
        debug!(%url, status = resp.status().as_u16(), "probe answered");
        Ok(())
    }

    async fn probe_ota(&self) -> Result<(), DeviceError> {
        let addr = self.destination.socket_addr();
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                debug!(%addr, "OTA port reachable");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    async fn query_hash_inner(&self) -> Result<Option<HashReport>, DeviceError> {
        let Some(path) = self.destination.paths.hash_query.as_deref() else {
            return Ok(None);
        };
        let Some(url) = self.destination.url(path) else {
            return Ok(None);
        };

        let resp = self
            .http
            .get(&url)
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(DeviceError::from_reqwest)?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!(%url, "hash query endpoint not present");
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeviceError::Status { status, body });
        }

        let body = resp.bytes().await.map_err(DeviceError::from_reqwest)?;
        let report: HashReport = serde_json::from_slice(&body)?;
        Ok(Some(report))
    }
}

impl DeviceLink for HttpDevice {
    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            match self.destination.kind {
                DestinationKind::Http => self.probe_http().await,
                DestinationKind::RawOta => self.probe_ota().await,
            }
        })
    }

    fn upload(&self, request: UploadRequest) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let url = self.url(&self.destination.paths.upload)?;
            let part = Part::bytes(request.data)
                .file_name(request.file_name)
                .mime_str("application/octet-stream")?;
            let form = Form::new()
                .part("file", part)
                .text("metadata", request.metadata.to_string());
            self.post(&url, form).await
        })
    }

    fn upload_chunk(&self, request: ChunkRequest) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let path = self
                .destination
                .paths
                .chunked_upload
                .as_deref()
                .ok_or(DeviceError::MissingEndpoint("chunked_upload"))?;
            let url = self.url(path)?;
            let part = Part::bytes(request.data)
                .file_name(request.file_name.clone())
                .mime_str("application/octet-stream")?;
            let form = Form::new()
                .part("file", part)
                .text("chunk_name", request.file_name)
                .text("chunk_index", request.index.to_string())
                .text("total_chunks", request.total.to_string());
            self.post(&url, form).await
        })
    }

    fn post_metadata(&self, metadata: serde_json::Value) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let path = self
                .destination
                .paths
                .metadata
                .as_deref()
                .ok_or(DeviceError::MissingEndpoint("metadata"))?;
            let url = self.url(path)?;
            let resp = self
                .http
                .post(&url)
                .timeout(self.request_timeout)
                .form(&[("metadata", metadata.to_string())])
                .send()
                .await
                .map_err(DeviceError::from_reqwest)?;
            check_status(resp).await
        })
    }

    fn query_hash(&self) -> DeviceFuture<'_, Option<HashReport>> {
        Box::pin(self.query_hash_inner())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<(), DeviceError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(DeviceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}
