// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport helpers: TLS contexts built from PEM files and a boxed client stream.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use crate::errors::TlsError;

/// Byte stream the protocol runs over, with or without TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a TCP connection to `host:port`, wrapped in TLS when a connector is given.
pub async fn connect_stream(
    host: &str,
    port: u16,
    tls: Option<&TlsConnector>,
) -> io::Result<BoxedStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    match tls {
        None => Ok(Box::new(tcp)),
        Some(connector) => {
            let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid server name {host}: {e}"),
                )
            })?;
            let stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Builds the acceptor for the log server.
///
/// When `ca` is given, clients must present a certificate signed by it.
pub fn server_tls_acceptor(
    cert: &Path,
    key: &Path,
    ca: Option<&Path>,
) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let builder = match ca {
        Some(ca) => {
            let roots = load_root_store(ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };
    let config = builder.with_single_cert(certs, key)?;

    info!("CA usage: {}", ca.is_some());
    info!("Certificate: true");

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the connector used by sinks and emitters.
///
/// Without a CA file the platform's root certificates are trusted.
pub fn client_tls_connector(
    ca: Option<&Path>,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<TlsConnector, TlsError> {
    let roots = match ca {
        Some(ca) => load_root_store(ca)?,
        None => load_platform_roots()?,
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (cert, key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        (Some(_), None) => return Err(TlsError::MissingKey),
        (None, _) => builder.with_no_client_auth(),
    };

    info!("CA usage: {}", ca.is_some());
    info!("Certificate: {}", cert.is_some());

    Ok(TlsConnector::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if ignored > 0 {
        warn!("Ignored {} unparsable certificates in {}", ignored, path.display());
    }
    if added == 0 {
        return Err(TlsError::NoRootCertificates);
    }
    Ok(roots)
}

fn load_platform_roots() -> Result<RootCertStore, TlsError> {
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("Failed to load a platform certificate: {}", error);
    }

    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(native.certs);
    if roots.is_empty() {
        return Err(TlsError::NoRootCertificates);
    }
    Ok(roots)
}
