//! Certificate material exchanged with devices.
//!
//! The server certificate is the only state shared across peer sessions.
//! It lives in a [`CertificateStore`] as an immutable snapshot behind an
//! epoch counter: the refresh task swaps in a new snapshot and bumps the
//! epoch, while exchange contexts hold on to the snapshot they started with
//! and compare epochs to detect a replacement mid-transfer.

use bytes::Bytes;
use gateway_wire::{BufferSink, Fill, PacketizerError, PayloadSink, PayloadSource, SinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Default bound on device certificates
pub const DEFAULT_DEVICE_CERT_MAX_LEN: usize = 1024;

/// Certificate errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertError {
    /// No server certificate loaded yet
    #[error("no server certificate available")]
    Unavailable,
    /// Not a parseable X.509 certificate
    #[error("certificate parsing failed: {0}")]
    Parse(String),
    /// Device certificate exceeds the configured bound
    #[error("certificate exceeds {limit} bytes")]
    TooLarge {
        /// Configured bound
        limit: usize,
    },
    /// Device sent an empty certificate
    #[error("empty certificate")]
    Empty,
    /// Cloud did not accept the certificate
    #[error("certificate submission failed: {0}")]
    Submit(String),
}

/// One version of the server certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    epoch: u64,
    raw: Bytes,
    serial: Bytes,
}

impl ServerCertificate {
    /// Parse a PEM or DER certificate; `raw` is what devices receive
    pub fn parse(epoch: u64, raw: Bytes) -> Result<Self, CertError> {
        let serial = parse_serial(&raw)?;
        Ok(Self { epoch, raw, serial })
    }

    /// Epoch this version was installed at
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Certificate bytes as sent to devices
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Serial number (big-endian, as encoded in the certificate)
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }
}

fn parse_serial(raw: &[u8]) -> Result<Bytes, CertError> {
    if raw.starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(raw)
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CertError::Parse(e.to_string()))?;
        Ok(Bytes::copy_from_slice(cert.tbs_certificate.raw_serial()))
    } else {
        let (_, cert) = x509_parser::parse_x509_certificate(raw)
            .map_err(|e| CertError::Parse(e.to_string()))?;
        Ok(Bytes::copy_from_slice(cert.tbs_certificate.raw_serial()))
    }
}

/// Render a serial for logs
pub fn serial_hex(serial: &[u8]) -> String {
    serial.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Process-wide, epoch-versioned server certificate
#[derive(Debug, Default)]
pub struct CertificateStore {
    current: RwLock<Option<Arc<ServerCertificate>>>,
    epoch: AtomicU64,
}

impl CertificateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a certificate, returning the live epoch.
    ///
    /// Installing the bytes already in place keeps the epoch, so pushes in
    /// progress are not restarted by a periodic refresh.
    pub fn update(&self, raw: Bytes) -> Result<u64, CertError> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(cert) = current.as_ref() {
            if cert.raw == raw {
                debug!("Server certificate unchanged (epoch {})", cert.epoch);
                return Ok(cert.epoch);
            }
        }

        let epoch = self.epoch.load(Ordering::Acquire) + 1;
        let cert = ServerCertificate::parse(epoch, raw)?;
        info!(
            "Server certificate updated: serial {} ({} bytes, epoch {})",
            serial_hex(cert.serial()),
            cert.raw.len(),
            epoch
        );

        *current = Some(Arc::new(cert));
        self.epoch.store(epoch, Ordering::Release);
        Ok(epoch)
    }

    /// Current certificate snapshot
    pub fn current(&self) -> Option<Arc<ServerCertificate>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Live epoch (0 until the first certificate is installed)
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Serial of the current certificate
    pub fn serial(&self) -> Option<Bytes> {
        self.current().map(|cert| cert.serial.clone())
    }
}

/// Pull source over one server certificate snapshot
#[derive(Debug)]
pub struct ServerCertSource {
    store: Arc<CertificateStore>,
    cert: Arc<ServerCertificate>,
    offset: usize,
}

impl ServerCertSource {
    /// Capture the current certificate
    pub fn snapshot(store: Arc<CertificateStore>) -> Result<Self, CertError> {
        let cert = store.current().ok_or(CertError::Unavailable)?;
        Ok(Self {
            store,
            cert,
            offset: 0,
        })
    }

    /// Whether the captured certificate is still the live one
    pub fn is_newest(&self) -> bool {
        self.cert.epoch == self.store.epoch()
    }

    /// The captured certificate
    pub fn certificate(&self) -> &ServerCertificate {
        &self.cert
    }

    /// Whether every byte was handed out
    pub fn is_complete(&self) -> bool {
        self.offset >= self.cert.raw.len()
    }
}

impl PayloadSource for ServerCertSource {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        let raw = &self.cert.raw;
        let len = dst.len().min(raw.len() - self.offset);
        dst[..len].copy_from_slice(&raw[self.offset..self.offset + len]);
        self.offset += len;

        Ok(Fill::Data {
            len,
            last: self.is_complete(),
        })
    }
}

/// Accumulates a device certificate up to a bound
#[derive(Debug, Clone)]
pub struct DeviceCertBuffer {
    sink: BufferSink,
    limit: usize,
}

impl DeviceCertBuffer {
    /// Create a buffer accepting at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            sink: BufferSink::new(limit),
            limit,
        }
    }

    /// Configured bound
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes collected so far
    pub fn len(&self) -> usize {
        self.sink.data().len()
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.sink.data().is_empty()
    }

    /// Take the certificate once the transfer completed
    pub fn finish(self) -> Result<Bytes, CertError> {
        if self.is_empty() {
            return Err(CertError::Empty);
        }
        Ok(self.sink.into_bytes())
    }
}

impl PayloadSink for DeviceCertBuffer {
    fn push(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<(), SinkError> {
        self.sink.push(chunk, first, last)
    }
}

impl From<SinkError> for CertError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Overflow { limit } => CertError::TooLarge { limit },
            SinkError::Rejected(reason) => CertError::Submit(reason),
        }
    }
}
