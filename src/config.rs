//! Configuration
//!
//! Environment-first: every option maps to the environment variable the
//! deployment surface sets, with a long flag for local runs.

use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Parser)]
#[command(name = "ldapd", version, about = "LDAPv3 directory server")]
pub struct Opts {
    /// Bind address for the LDAP listener
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// LDAP port
    #[arg(long, env = "PORT", default_value_t = 389)]
    pub port: u16,

    /// Serve TLS from the first byte (LDAPS) instead of plaintext+StartTLS
    #[arg(long, env = "USE_CORE_TLS", default_value_t = false, action = clap::ArgAction::Set)]
    pub use_core_tls: bool,

    /// Server certificate (PEM)
    #[arg(long, env = "SSL_CERT")]
    pub ssl_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "SSL_KEY")]
    pub ssl_key: Option<PathBuf>,

    /// Optional intermediate chain (PEM), appended to the certificate
    #[arg(long, env = "SSL_CHAIN")]
    pub ssl_chain: Option<PathBuf>,

    /// Client CA bundle (PEM); when set, client certificates are requested
    /// and verified if presented
    #[arg(long, env = "SSL_CA")]
    pub ssl_ca: Option<PathBuf>,

    /// DSN of an external relational store implementation
    #[arg(long, env = "POSTGRES_URI")]
    pub postgres_uri: Option<String>,

    /// Base URI of the multifactor provider API
    #[arg(long, env = "MFA_API_URI")]
    pub mfa_api_uri: Option<String>,

    /// How long a Bind waits for the second-factor callback
    #[arg(long, env = "MFA_TIMEOUT_SECONDS", default_value_t = 60)]
    pub mfa_timeout_seconds: u64,

    /// External URL of the MFA callback endpoint; derived from the HTTP
    /// listener when unset
    #[arg(long, env = "MFA_CALLBACK_URL")]
    pub mfa_callback_url: Option<String>,

    #[arg(long, env = "VENDOR_NAME", default_value = "MultiDirectory")]
    pub vendor_name: String,

    #[arg(long, env = "VENDOR_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub vendor_version: String,

    /// Naming context used when bootstrapping the in-memory store
    #[arg(long, env = "BASE_DN", default_value = "dc=md,dc=test")]
    pub base_dn: String,

    /// Bind address for the HTTP/WS side channel
    #[arg(long, env = "HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: IpAddr,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8000)]
    pub http_port: u16,

    #[arg(long, env = "ALLOW_ANONYMOUS_BIND", default_value_t = false, action = clap::ArgAction::Set)]
    pub allow_anonymous_bind: bool,

    /// Evaluate `~=` as inequality (historical behaviour); false restores
    /// the RFC reading
    #[arg(long, env = "APPROX_AS_INEQUALITY", default_value_t = true, action = clap::ArgAction::Set)]
    pub approx_as_inequality: bool,

    /// Bound on transitive group-closure walks
    #[arg(long, env = "GROUP_DEPTH_LIMIT", default_value_t = 16)]
    pub group_depth_limit: u32,

    /// Close idle connections after this many seconds; 0 disables
    #[arg(long, env = "READ_IDLE_SECONDS", default_value_t = 0)]
    pub read_idle_seconds: u64,

    /// Worker tasks per connection
    #[arg(long, env = "CONNECTION_WORKERS", default_value_t = 3)]
    pub connection_workers: usize,
}

/// Runtime settings shared by the handlers and the session engine
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub vendor_name: String,
    pub vendor_version: String,
    pub allow_anonymous_bind: bool,
    pub approx_as_inequality: bool,
    pub group_depth_limit: u32,
    pub mfa_timeout: Duration,
    pub mfa_callback_url: String,
    pub workers_per_connection: usize,
    pub read_idle: Option<Duration>,
}

impl Opts {
    pub fn server_config(&self) -> ServerConfig {
        let scheme = if self.use_core_tls { "https" } else { "http" };
        let callback = self.mfa_callback_url.clone().unwrap_or_else(|| {
            format!(
                "{scheme}://{}:{}/multifactor/create",
                self.http_host, self.http_port
            )
        });
        ServerConfig {
            vendor_name: self.vendor_name.clone(),
            vendor_version: self.vendor_version.clone(),
            allow_anonymous_bind: self.allow_anonymous_bind,
            approx_as_inequality: self.approx_as_inequality,
            group_depth_limit: self.group_depth_limit,
            mfa_timeout: Duration::from_secs(self.mfa_timeout_seconds),
            mfa_callback_url: callback,
            workers_per_connection: self.connection_workers.max(1),
            read_idle: (self.read_idle_seconds > 0)
                .then(|| Duration::from_secs(self.read_idle_seconds)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} holds no usable PEM material")]
    Empty { path: PathBuf },
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build the acceptor from certificate, key and optional chain/client-CA
/// files
pub fn load_tls_acceptor(
    cert: &Path,
    key: &Path,
    chain: Option<&Path>,
    client_ca: Option<&Path>,
) -> Result<TlsAcceptor, TlsConfigError> {
    let read = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    let mut certs: Vec<_> = rustls_pemfile::certs(&mut read(cert)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsConfigError::Io {
            path: cert.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::Empty {
            path: cert.to_path_buf(),
        });
    }
    if let Some(chain) = chain {
        let extra: Vec<_> = rustls_pemfile::certs(&mut read(chain)?)
            .collect::<Result<_, _>>()
            .map_err(|source| TlsConfigError::Io {
                path: chain.to_path_buf(),
                source,
            })?;
        certs.extend(extra);
    }

    let private_key = rustls_pemfile::private_key(&mut read(key)?)
        .map_err(|source| TlsConfigError::Io {
            path: key.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::Empty {
            path: key.to_path_buf(),
        })?;

    let builder = rustls::ServerConfig::builder();
    let config = match client_ca {
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, private_key)?,
        Some(ca) => {
            let mut roots = rustls::RootCertStore::empty();
            let ca_certs: Vec<_> = rustls_pemfile::certs(&mut read(ca)?)
                .collect::<Result<_, _>>()
                .map_err(|source| TlsConfigError::Io {
                    path: ca.to_path_buf(),
                    source,
                })?;
            if ca_certs.is_empty() {
                return Err(TlsConfigError::Empty {
                    path: ca.to_path_buf(),
                });
            }
            for ca_cert in ca_certs {
                roots.add(ca_cert)?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsConfigError::Rustls(rustls::Error::General(e.to_string())))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, private_key)?
        }
    };
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_surface() {
        let opts = Opts::parse_from(["ldapd"]);
        let config = opts.server_config();
        assert_eq!(config.mfa_timeout, Duration::from_secs(60));
        assert_eq!(config.workers_per_connection, 3);
        assert!(config.read_idle.is_none());
        assert!(!config.allow_anonymous_bind);
        assert!(config.approx_as_inequality);
        assert_eq!(opts.port, 389);
    }

    #[test]
    fn callback_url_follows_http_listener() {
        let opts = Opts::parse_from(["ldapd", "--http-port", "9000"]);
        assert_eq!(
            opts.server_config().mfa_callback_url,
            "http://0.0.0.0:9000/multifactor/create"
        );
    }
}
