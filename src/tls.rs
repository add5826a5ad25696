//! Client-side TLS configuration.
//!
//! TLS is opt-in; when requested, certificate verification against the
//! caller-supplied CA bundle and hostname matching are mandatory. There is no
//! insecure escape hatch.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;

use crate::errors::{Error, Result};

/// TLS settings for a connection. `ca_certs` is a PEM bundle holding the
/// certificate authorities the server certificate must chain to.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub ca_certs: PathBuf,
}

impl TlsOptions {
    pub fn new(ca_certs: impl Into<PathBuf>) -> TlsOptions {
        TlsOptions {
            ca_certs: ca_certs.into(),
        }
    }
}

/// Build a verifying rustls client config from the CA bundle.
pub fn client_config(opts: &TlsOptions) -> Result<rustls::ClientConfig> {
    let file = File::open(&opts.ca_certs).map_err(|e| {
        Error::driver(format!(
            "Could not open CA bundle {}: {e}",
            opts.ca_certs.display()
        ))
    })?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    let mut loaded = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            Error::driver(format!(
                "Could not read certificate from {}: {e}",
                opts.ca_certs.display()
            ))
        })?;
        roots
            .add(cert)
            .map_err(|e| Error::driver(format!("Rejected CA certificate: {e}")))?;
        loaded += 1;
    }
    if loaded == 0 {
        return Err(Error::driver(format!(
            "CA bundle {} contains no certificates",
            opts.ca_certs.display()
        )));
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Resolve the TLS server name for a host: IP literals verify as IP SANs,
/// anything else as a DNS name.
pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::driver(format!("Invalid TLS server name {host:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_accepts_ips_and_hostnames() {
        assert!(matches!(
            server_name_for("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name_for("db.example.com").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name_for("not a hostname").is_err());
    }

    #[test]
    fn missing_ca_bundle_is_a_driver_error() {
        let opts = TlsOptions::new("/definitely/not/here.pem");
        assert!(matches!(client_config(&opts), Err(Error::Driver(_))));
    }
}
