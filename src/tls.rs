//! Mutual TLS between fleet members.
//!
//! The coordinator and every worker load the same CA plus their own
//! certificate; the coordinator requires client certificates, so only
//! fleet members can attach or use the job API.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Subject name the coordinator certificate must carry.
pub const FLEET_DOMAIN: &str = "synthfleet-fleet";

/// Which of the three PEM files a TLS error concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemFile {
    FleetCa,
    MemberCert,
    MemberKey,
}

impl fmt::Display for PemFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PemFile::FleetCa => write!(f, "fleet CA certificate"),
            PemFile::MemberCert => write!(f, "member certificate"),
            PemFile::MemberKey => write!(f, "member private key"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls is enabled but no {0} path is set")]
    NotConfigured(PemFile),

    #[error("{file} {path} does not exist")]
    NotFound { file: PemFile, path: PathBuf },

    #[error("cannot read {file} {path}: {source}")]
    Unreadable {
        file: PemFile,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A fleet member's certificate and key, plus the fleet CA that signs
/// every other member.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    fleet_ca: Certificate,
}

impl TlsIdentity {
    /// Read the fleet CA, then this member's certificate and key.
    ///
    /// Errors name the first file that is unset, missing or unreadable, in
    /// that order.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca = required(&config.ca_cert_path, PemFile::FleetCa)?;
        let cert = required(&config.cert_path, PemFile::MemberCert)?;
        let key = required(&config.key_path, PemFile::MemberKey)?;

        let fleet_ca = Certificate::from_pem(read_pem(ca, PemFile::FleetCa).await?);
        let identity = Identity::from_pem(
            read_pem(cert, PemFile::MemberCert).await?,
            read_pem(key, PemFile::MemberKey).await?,
        );
        Ok(Self { identity, fleet_ca })
    }

    /// Coordinator side: present our certificate and only accept workers
    /// and CLI clients signed by the fleet CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.fleet_ca.clone())
    }

    /// Worker and CLI side. Members dial the coordinator by address, so its
    /// certificate is matched against [`FLEET_DOMAIN`].
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(FLEET_DOMAIN)
            .ca_certificate(self.fleet_ca.clone())
            .identity(self.identity.clone())
    }
}

fn required(path: &Option<PathBuf>, file: PemFile) -> Result<&Path, TlsError> {
    let path = path.as_deref().ok_or(TlsError::NotConfigured(file))?;
    if !path.exists() {
        return Err(TlsError::NotFound {
            file,
            path: path.to_path_buf(),
        });
    }
    Ok(path)
}

async fn read_pem(path: &Path, file: PemFile) -> Result<Vec<u8>, TlsError> {
    fs::read(path).await.map_err(|source| TlsError::Unreadable {
        file,
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the configured TLS identity, if any.
///
/// With `allow_insecure`, incomplete paths or unreadable files downgrade to
/// plaintext with a warning instead of failing.
pub async fn resolve_identity(config: &TlsConfig) -> Result<Option<TlsIdentity>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }
    if !config.is_complete() {
        if config.allow_insecure {
            tracing::warn!("TLS paths incomplete, allow_insecure set, using plaintext");
            return Ok(None);
        }
        // Fails with the first missing path.
        return TlsIdentity::load(config).await.map(Some);
    }
    match TlsIdentity::load(config).await {
        Ok(identity) => {
            tracing::info!("Fleet mTLS enabled");
            Ok(Some(identity))
        }
        Err(e) if config.allow_insecure => {
            tracing::warn!(error = %e, "Could not load TLS files, allow_insecure set, using plaintext");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_completeness() {
        let mut config = TlsConfig::default();
        assert!(!config.is_complete());

        config.enabled = true;
        assert!(!config.is_complete());

        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.crt"));
        assert!(!config.is_complete());

        config.cert_path = Some(PathBuf::from("/tmp/worker.crt"));
        assert!(!config.is_complete());

        config.key_path = Some(PathBuf::from("/tmp/worker.key"));
        assert!(config.is_complete());
    }

    #[tokio::test]
    async fn load_requires_all_paths() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: None,
            cert_path: None,
            key_path: None,
            allow_insecure: false,
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::NotConfigured(PemFile::FleetCa))));
    }

    #[tokio::test]
    async fn load_reports_missing_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/worker.crt")),
            key_path: Some(PathBuf::from("/nonexistent/worker.key")),
            allow_insecure: false,
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::NotFound { file: PemFile::FleetCa, .. })));
    }

    #[tokio::test]
    async fn load_names_unreadable_file() {
        let dir = tempfile::TempDir::new().unwrap();
        // A directory passes the existence check but cannot be read as PEM.
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(dir.path().to_path_buf()),
            cert_path: Some(dir.path().to_path_buf()),
            key_path: Some(dir.path().to_path_buf()),
            allow_insecure: false,
        };

        let err = TlsIdentity::load(&config).await.err().unwrap();
        assert!(matches!(
            err,
            TlsError::Unreadable { file: PemFile::FleetCa, .. }
        ));
        assert!(err.to_string().starts_with("cannot read fleet CA certificate"));
    }

    #[tokio::test]
    async fn insecure_fallback() {
        let mut config = TlsConfig::default();
        assert!(resolve_identity(&config).await.unwrap().is_none());

        config.enabled = true;
        assert!(matches!(
            resolve_identity(&config).await,
            Err(TlsError::NotConfigured(PemFile::FleetCa))
        ));

        config.allow_insecure = true;
        assert!(resolve_identity(&config).await.unwrap().is_none());

        config.ca_cert_path = Some(PathBuf::from("/nonexistent/ca.crt"));
        config.cert_path = Some(PathBuf::from("/nonexistent/worker.crt"));
        config.key_path = Some(PathBuf::from("/nonexistent/worker.key"));
        assert!(resolve_identity(&config).await.unwrap().is_none());
    }
}
