//! TLS support: building client and server configurations from PEM files.
//!
//! The endpoint treats key material as opaque files. A key file must hold
//! the certificate chain and private key in PEM form; a trust store holds
//! the root certificates a client (or a server verifying client
//! certificates) will accept. When no trust store is configured, the
//! bundled webpki roots are used.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};
use crate::params::TlsParameters;

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#1, PKCS#8, or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| Error::Tls(format!("{}: {e}", path.display())))? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(Error::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

fn root_store(trust_file: Option<&Path>) -> Result<RootCertStore> {
    match trust_file {
        Some(path) => {
            let mut store = RootCertStore::empty();
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
            }
            Ok(store)
        }
        None => Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        )),
    }
}

/// Build the client-side configuration: the trust store file when one is
/// configured, the bundled webpki roots otherwise.
pub fn client_config(trust_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(trust_file)?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Build the server-side configuration from a PEM key file holding the
/// certificate chain and private key. Client certificates are requested
/// or required per `tls_params` when a trust store is available.
pub fn server_config(
    key_file: &Path,
    trust_file: Option<&Path>,
    tls_params: TlsParameters,
) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(key_file)?;
    let key = load_private_key(key_file)?;

    let builder = ServerConfig::builder();
    let builder = if tls_params.need_client_auth || tls_params.want_client_auth {
        let roots = Arc::new(root_store(trust_file)?);
        let verifier = if tls_params.need_client_auth {
            WebPkiClientVerifier::builder(roots).build()
        } else {
            WebPkiClientVerifier::builder(roots)
                .allow_unauthenticated()
                .build()
        }
        .map_err(|e| Error::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}
