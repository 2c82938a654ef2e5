//! Executor identities
//!
//! Every remote executor owns a client certificate issued by the local CA.
//! The certificate serial is stored on the executor row and is the only
//! thing that authorizes pushes coming back from that executor.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Header carrying the serial of the client certificate, as `...[<decimal>]`
pub const CERT_SERIAL_HEADER: &str = "x-ivis-cert-serial";

const CERT_GEN_SCRIPT: &str = "./remote_executor_cert_gen.sh";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("credentials of executor {0} already exist")]
    AlreadyExists(i64),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("credential file missing: {0}")]
    Missing(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Material installed on a remote executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCredentials {
    pub ca_cert: String,
    pub cert: String,
    pub key: String,
}

/// Issues and revokes executor certificates (trait-based for mocking)
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issue a certificate for the executor and return its hex serial
    async fn issue(
        &self,
        executor_id: i64,
        ip: Option<&str>,
        dns_name: Option<&str>,
    ) -> Result<String, IdentityError>;

    /// Delete the executor's certificate and key; never fails
    async fn remove(&self, executor_id: i64);

    async fn credentials(&self, executor_id: i64) -> Result<ExecutorCredentials, IdentityError>;
}

/// Certificates produced by the CA generation script in `dir`
pub struct ScriptCertificateAuthority {
    dir: PathBuf,
    ca_cert_path: PathBuf,
}

impl ScriptCertificateAuthority {
    pub fn new(dir: impl Into<PathBuf>, ca_cert_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ca_cert_path: ca_cert_path.into(),
        }
    }

    fn prefix(executor_id: i64) -> String {
        format!("remote_executor_{}", executor_id)
    }

    pub fn cert_path(&self, executor_id: i64) -> PathBuf {
        self.dir.join(format!("{}.cert", Self::prefix(executor_id)))
    }

    pub fn key_path(&self, executor_id: i64) -> PathBuf {
        self.dir.join(format!("{}.pem", Self::prefix(executor_id)))
    }

    async fn read(path: &Path) -> Result<String, IdentityError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(IdentityError::Missing(path.to_path_buf()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CertificateAuthority for ScriptCertificateAuthority {
    async fn issue(
        &self,
        executor_id: i64,
        ip: Option<&str>,
        dns_name: Option<&str>,
    ) -> Result<String, IdentityError> {
        let cert_path = self.cert_path(executor_id);
        if cert_path.exists() || self.key_path(executor_id).exists() {
            return Err(IdentityError::AlreadyExists(executor_id));
        }

        let mut generate = Command::new(CERT_GEN_SCRIPT);
        generate
            .current_dir(&self.dir)
            .arg(ip.unwrap_or("null"))
            .arg(Self::prefix(executor_id));
        if let Some(dns) = dns_name.map(str::trim).filter(|dns| !dns.is_empty()) {
            generate.arg(dns);
        }

        tracing::debug!("Creating certificate for executor {}", executor_id);
        let output = generate.output().await?;
        if !output.status.success() {
            self.remove(executor_id).await;
            return Err(IdentityError::Generation(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let output = Command::new("openssl")
            .arg("x509")
            .arg("-in")
            .arg(&cert_path)
            .args(["-noout", "-serial"])
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let serial = parse_openssl_serial(&String::from_utf8_lossy(&output.stdout));

        match serial {
            Some(serial) if output.status.success() && stderr.trim().is_empty() => {
                tracing::info!("Executor {} certificate serial {}", executor_id, serial);
                Ok(serial)
            }
            _ => {
                self.remove(executor_id).await;
                Err(IdentityError::Generation(stderr.into_owned()))
            }
        }
    }

    async fn remove(&self, executor_id: i64) {
        for path in [self.cert_path(executor_id), self.key_path(executor_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::error!("Cannot remove {}: {}", path.display(), err),
            }
        }
    }

    async fn credentials(&self, executor_id: i64) -> Result<ExecutorCredentials, IdentityError> {
        Ok(ExecutorCredentials {
            ca_cert: Self::read(&self.ca_cert_path).await?,
            cert: Self::read(&self.cert_path(executor_id)).await?,
            key: Self::read(&self.key_path(executor_id)).await?,
        })
    }
}

// =============================================================================
// Serial numbers
// =============================================================================

/// `serial=0A1B` -> `0A1B`
pub fn parse_openssl_serial(output: &str) -> Option<String> {
    let serial = output.trim().strip_prefix("serial=")?.trim();
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(serial.to_string())
}

/// Extract the decimal serial between the last pair of brackets and return
/// it as upper-case hex
pub fn parse_serial_header(value: &str) -> Option<String> {
    let start = value.rfind('[')?;
    let rest = &value[start + 1..];
    let end = rest.find(']')?;
    decimal_to_hex(rest[..end].trim())
}

/// Convert an arbitrarily long decimal number to upper-case hex
pub fn decimal_to_hex(decimal: &str) -> Option<String> {
    if decimal.is_empty() || !decimal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut digits: Vec<u32> = decimal.bytes().map(|b| u32::from(b - b'0')).collect();
    let mut hex = Vec::new();

    while !(digits.is_empty() || digits.iter().all(|&d| d == 0)) {
        let mut quotient = Vec::with_capacity(digits.len());
        let mut remainder = 0u32;
        for digit in digits {
            let current = remainder * 10 + digit;
            let q = current / 16;
            remainder = current % 16;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        hex.push(std::char::from_digit(remainder, 16)?.to_ascii_uppercase());
        digits = quotient;
    }

    if hex.is_empty() {
        return Some("0".to_string());
    }
    Some(hex.iter().rev().collect())
}

/// Compare two hex serials ignoring case and leading zeros
pub fn serials_match(stored: &str, presented: &str) -> bool {
    fn normalize(serial: &str) -> String {
        let trimmed = serial.trim().trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_ascii_uppercase()
        }
    }
    !stored.trim().is_empty() && normalize(stored) == normalize(presented)
}
