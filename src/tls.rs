//! rustls server configuration for the API endpoint.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::certs;

use crate::config::TlsSettings;
use crate::error::{ExporterError, ExporterResult};

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => {}
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no valid private key found in file",
    ))
}

fn load_root_cert_store(path: &Path) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "failed to parse CA cert"))?;
    }
    Ok(roots)
}

/// Builds the server TLS config: server cert and key, with client
/// certificates verified against the configured CA pool.
pub fn build_server_config(settings: &TlsSettings) -> ExporterResult<Arc<rustls::ServerConfig>> {
    let certs = load_certs(&settings.certificate)
        .map_err(|e| ExporterError::io(format!("loading {}", settings.certificate.display()), e))?;
    let key = load_private_key(&settings.key)
        .map_err(|e| ExporterError::io(format!("loading {}", settings.key.display()), e))?;
    let roots = load_root_cert_store(&settings.ca_certificate).map_err(|e| {
        ExporterError::io(
            format!("loading {}", settings.ca_certificate.display()),
            e,
        )
    })?;

    let client_verifier = WebPkiClientVerifier::builder(roots.into())
        .build()
        .map_err(|e| {
            ExporterError::io(
                "building client certificate verifier",
                io::Error::other(e),
            )
        })?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ExporterError::io("building TLS config", io::Error::other(e)))?;

    Ok(Arc::new(config))
}
