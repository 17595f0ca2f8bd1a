//! TLS client configuration for each `sslmode`.
//!
//! - `allow`, `prefer`, `require`: encrypt, but accept any certificate.
//! - `verify-ca`: verify the chain against the trusted roots, not the host name.
//! - `verify-full`: verify the chain and the host name.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::{SslMode, TlsFiles, TlsVersion};
use crate::error::{PgError, PgResult};

static PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

static WEBPKI_ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    Arc::new(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
});

/// Accepts any server certificate. Used by the modes that only ask for
/// encryption.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &PROVIDER.signature_verification_algorithms,
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
            &PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        PROVIDER.signature_verification_algorithms.supported_schemes()
    }
}

/// Full chain verification that tolerates a host name mismatch.
#[derive(Debug)]
struct ChainOnly(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref err)) if is_name_mismatch(err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

// Newer rustls releases report the mismatch with a context-carrying variant,
// so match on the variant name rather than its shape.
fn is_name_mismatch(err: &rustls::CertificateError) -> bool {
    matches!(err, rustls::CertificateError::NotValidForName)
        || format!("{:?}", err).starts_with("NotValidForName")
}

/// Build the rustls configuration for `mode`. `Ok(None)` for `disable`.
pub fn client_config(mode: SslMode, files: &TlsFiles) -> PgResult<Option<Arc<ClientConfig>>> {
    let verifier: Arc<dyn ServerCertVerifier> = match mode {
        SslMode::Disable => return Ok(None),
        SslMode::Allow | SslMode::Prefer | SslMode::Require => {
            if files.root_cert.is_some() {
                debug!(sslmode = mode.as_str(), "sslrootcert is ignored without certificate verification");
            }
            Arc::new(AcceptAnyCertificate)
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let roots = match &files.root_cert {
                Some(path) => Arc::new(load_roots(path)?),
                None => {
                    warn!(sslmode = mode.as_str(), "no sslrootcert configured, verifying against the public web PKI roots");
                    Arc::clone(&WEBPKI_ROOTS)
                }
            };
            let webpki = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&PROVIDER))
                .build()
                .map_err(|e| PgError::Tls(format!("could not build certificate verifier: {}", e)))?;
            if mode == SslMode::VerifyCa {
                Arc::new(ChainOnly(webpki)) as Arc<dyn ServerCertVerifier>
            } else {
                webpki as Arc<dyn ServerCertVerifier>
            }
        }
    };

    let builder = ClientConfig::builder_with_provider(Arc::clone(&PROVIDER))
        .with_protocol_versions(&protocol_versions(files)?)
        .map_err(|e| PgError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match (&files.cert, &files.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| PgError::Tls(format!("invalid client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(PgError::Config(
                "sslcert and sslkey must be provided together".to_string(),
            ))
        }
    };
    Ok(Some(Arc::new(config)))
}

fn protocol_versions(files: &TlsFiles) -> PgResult<Vec<&'static rustls::SupportedProtocolVersion>> {
    let min = files.min_version.unwrap_or(TlsVersion::Tls12);
    let max = files.max_version.unwrap_or(TlsVersion::Tls13);
    if min > max {
        return Err(PgError::Config(
            "ssl_min_protocol_version is above ssl_max_protocol_version".to_string(),
        ));
    }
    let mut versions = Vec::with_capacity(2);
    if min <= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

fn open(path: &Path) -> PgResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| PgError::Config(format!("cannot open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> PgResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PgError::Config(format!("invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(PgError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_roots(path: &Path) -> PgResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| PgError::Config(format!("invalid root certificate: {}", e)))?;
    }
    Ok(roots)
}

fn load_key(path: &Path) -> PgResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| PgError::Config(format!("invalid private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| PgError::Config(format!("no private key found in {}", path.display())))
}

/// Run the TLS handshake over an established TCP stream.
pub async fn handshake(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> PgResult<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Tls(format!("invalid server name {:?}", host)))?;
    debug!(host, "performing TLS handshake");
    tokio_rustls::TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| PgError::Tls(e.to_string()))
}
