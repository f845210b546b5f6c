//! Client-side TLS connector to the upstream Postgres server. Carries
//! forward the teacher's `TlsVerifyMode`-driven `rustls::ClientConfig`
//! construction (custom verifiers standing in for `sslmode=disable` /
//! `prefer` / `verify-ca` / `verify-full`), adapted from the deleted
//! `net/tls.rs` to `tokio-postgres-rustls` instead of the teacher's own
//! frontend/backend TLS plumbing.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::warn;

use crate::config::TlsVerifyMode;

/// Accepts any certificate chain without validating it at all. Used for
/// `Disabled`/`Prefer`, where we still speak TLS on the wire (upstream may
/// require it) but place no trust in the presented certificate.
#[derive(Debug)]
struct AllowAllVerifier;

impl ServerCertVerifier for AllowAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

/// Validates the certificate chain against the configured root, but skips
/// hostname verification. Used for `VerifyCa`.
#[derive(Debug)]
struct NoHostnameVerifier {
    roots: Arc<rustls::RootCertStore>,
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verifier = rustls::client::WebPkiServerVerifier::builder(self.roots.clone())
            .build()
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        // Any valid server name satisfies the chain check; we only reuse
        // the webpki verifier for the signature/chain math, not identity.
        let placeholder = ServerName::try_from("localhost").expect("static server name");
        verifier.verify_server_cert(end_entity, intermediates, &placeholder, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

fn all_signature_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

fn root_store(extra_ca: Option<&std::path::Path>) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }

    if let Some(path) = extra_ca {
        let bytes = std::fs::read(path).map_err(|e| Error::ReadCa(path.to_path_buf(), e))?;
        let mut reader = std::io::BufReader::new(bytes.as_slice());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::ReadCa(path.to_path_buf(), e))?;
            let _ = roots.add(cert);
        }
    }

    Ok(roots)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not read CA certificate at {0}: {1}")]
    ReadCa(std::path::PathBuf, std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),
}

/// Builds the `MakeRustlsConnect` matching the shard's configured
/// [`TlsVerifyMode`]. `Disabled` still negotiates TLS (Postgres offers no
/// plaintext-only connector in this stack) but trusts any certificate,
/// which is the `tokio-postgres` analogue of `sslmode=disable` falling
/// back to an unauthenticated channel.
pub fn connector(
    mode: TlsVerifyMode,
    server_ca_certificate: Option<&std::path::Path>,
) -> Result<MakeRustlsConnect, Error> {
    let provider = rustls::crypto::ring::default_provider();
    let config_builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are always valid");

    let config = match mode {
        TlsVerifyMode::Disabled | TlsVerifyMode::Prefer => config_builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AllowAllVerifier))
            .with_no_client_auth(),
        TlsVerifyMode::VerifyCa => {
            let roots = Arc::new(root_store(server_ca_certificate)?);
            config_builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoHostnameVerifier { roots }))
                .with_no_client_auth()
        }
        TlsVerifyMode::VerifyFull => {
            let roots = root_store(server_ca_certificate)?;
            config_builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(MakeRustlsConnect::new(config))
}

/// Connects using a pre-built [`tokio_postgres::Config`] (e.g. with
/// `replication_mode` already set) and the shard's TLS posture, spawning the
/// driving connection task the way every call site in this crate does.
pub async fn connect_with_config(
    config: &tokio_postgres::Config,
    mode: TlsVerifyMode,
    server_ca_certificate: Option<&Path>,
) -> Result<tokio_postgres::Client, Error> {
    let connect = connector(mode, server_ca_certificate)?;
    let (client, connection) = config.connect(connect).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("connection closed: {e}");
        }
    });
    Ok(client)
}

/// Parses `url` and connects under the shard's TLS posture.
pub async fn connect(
    url: &str,
    mode: TlsVerifyMode,
    server_ca_certificate: Option<&Path>,
) -> Result<tokio_postgres::Client, Error> {
    let config: tokio_postgres::Config = url
        .parse()
        .map_err(|e: tokio_postgres::Error| Error::Pg(e))?;
    connect_with_config(&config, mode, server_ca_certificate).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connector_builds_for_every_mode() {
        for mode in [
            TlsVerifyMode::Disabled,
            TlsVerifyMode::Prefer,
            TlsVerifyMode::VerifyCa,
            TlsVerifyMode::VerifyFull,
        ] {
            connector(mode, None).unwrap();
        }
    }
}
