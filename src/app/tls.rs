//! TLS material: the client-facing acceptor and the upstream connector.

use log::info;
use native_tls::{Certificate, Identity, TlsAcceptor, TlsConnector};

use crate::config::Config;
use crate::errors::Error;

/// TLS handles shared by every connection task.
#[derive(Clone)]
pub struct TlsState {
    /// Terminates client TLS on `tls_port`.
    pub acceptor: Option<tokio_native_tls::TlsAcceptor>,
    /// Originates TLS towards the upstream when `upstream_tls` is set.
    pub connector: Option<tokio_native_tls::TlsConnector>,
}

pub fn init_tls(config: &Config) -> Result<TlsState, Error> {
    let acceptor = match (&config.tls_port, &config.tls_cert, &config.tls_key) {
        (Some(port), Some(cert), Some(key)) => {
            info!("Building TLS acceptor for port {port}");
            Some(build_acceptor(cert, key)?)
        }
        _ => None,
    };

    let connector = if config.upstream_tls {
        info!(
            "Building upstream TLS connector (verify: {})",
            config.upstream_tls_verify
        );
        Some(build_upstream_connector(config)?)
    } else {
        None
    };

    Ok(TlsState {
        acceptor,
        connector,
    })
}

fn build_acceptor(cert_path: &str, key_path: &str) -> Result<tokio_native_tls::TlsAcceptor, Error> {
    let cert = std::fs::read(cert_path)
        .map_err(|err| Error::BadConfig(format!("cannot read tls_cert '{cert_path}': {err}")))?;
    let key = std::fs::read(key_path)
        .map_err(|err| Error::BadConfig(format!("cannot read tls_key '{key_path}': {err}")))?;

    let identity = Identity::from_pkcs8(&cert, &key)
        .map_err(|err| Error::BadConfig(format!("invalid TLS identity: {err}")))?;

    let acceptor = TlsAcceptor::builder(identity)
        .build()
        .map_err(|err| Error::BadConfig(format!("cannot build TLS acceptor: {err}")))?;

    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}

fn build_upstream_connector(config: &Config) -> Result<tokio_native_tls::TlsConnector, Error> {
    let mut builder = TlsConnector::builder();

    if !config.upstream_tls_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(ref ca_path) = config.upstream_tls_ca {
        let ca = std::fs::read(ca_path).map_err(|err| {
            Error::BadConfig(format!("cannot read upstream_tls_ca '{ca_path}': {err}"))
        })?;
        let certificate = Certificate::from_pem(&ca)
            .map_err(|err| Error::BadConfig(format!("invalid CA certificate: {err}")))?;
        builder.add_root_certificate(certificate);
    }

    let connector = builder
        .build()
        .map_err(|err| Error::BadConfig(format!("cannot build upstream TLS connector: {err}")))?;

    Ok(tokio_native_tls::TlsConnector::from(connector))
}
