//! Identity-pinned TLS.
//!
//! The mesh trust model is key continuity, not CA trust: a peer's identity is
//! a stable hash of the public key in its leaf certificate, and the verifier
//! never consults a trust root. When dialing a known peer the expected
//! identity is pinned and the handshake fails on mismatch. Client
//! certificates are optional on accept — peers without one authenticate with
//! a bearer token at the HTTP layer instead.

use mgate_core::{identity_from_spki, GateError, GateResult, TlsInfo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// SNI sent on mesh dials. Routing never depends on it; identity does the
/// work the hostname would in a CA model.
pub const MESH_SNI: &str = "mesh.internal";

/// Compute the mesh identity of a certificate: SHA-256 over its
/// SubjectPublicKeyInfo DER.
pub fn spki_identity(cert: &CertificateDer<'_>) -> GateResult<String> {
    let parsed = ParsedCertificate::try_from(cert)
        .map_err(|e| GateError::Handshake(format!("cannot parse peer certificate: {e}")))?;
    Ok(identity_from_spki(parsed.subject_public_key_info().as_ref()))
}

/// One-shot delivery of the peer identity computed inside the verification
/// callback.
///
/// Always resolves: the callback sends the identity before the handshake can
/// complete, and when no certificate was presented the callback never runs,
/// which [`IdentityHandoff::resolve`] reads as "none presented".
pub struct IdentityHandoff {
    rx: oneshot::Receiver<String>,
}

impl IdentityHandoff {
    pub fn resolve(mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Certificate verifier for the key-continuity model.
///
/// Parses the leaf, computes its identity, optionally enforces a pinned
/// expected identity, and hands the identity to the caller. Signatures are
/// verified with the provider's algorithms; chains and trust roots are not.
#[derive(Debug)]
struct RawKeyVerifier {
    provider: Arc<CryptoProvider>,
    expected: Option<String>,
    identity_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl RawKeyVerifier {
    fn new(provider: Arc<CryptoProvider>, expected: Option<String>) -> (Arc<Self>, IdentityHandoff) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                provider,
                expected,
                identity_tx: Mutex::new(Some(tx)),
            }),
            IdentityHandoff { rx },
        )
    }

    fn check_peer(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let identity = spki_identity(end_entity).map_err(|e| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::Other(
                rustls::OtherError(Arc::new(e)),
            ))
        })?;

        if let Some(expected) = &self.expected {
            if *expected != identity {
                debug!(expected = %expected, actual = %identity, "pinned identity mismatch");
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }

        // Receiver may already be gone if the caller abandoned the handshake.
        if let Some(tx) = self.identity_tx.lock().unwrap().take() {
            let _ = tx.send(identity);
        }
        Ok(())
    }
}

impl ServerCertVerifier for RawKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_peer(end_entity)?;
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for RawKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check_peer(end_entity)?;
        Ok(ClientCertVerified::assertion())
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        // absent certs fall back to bearer-token identity
        false
    }
}

/// This node's key material and identity.
pub struct NodeIdentity {
    pub identity: String,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl NodeIdentity {
    /// Generate a fresh self-signed identity certificate.
    pub fn generate() -> GateResult<Self> {
        let mut params = rcgen::CertificateParams::new(vec![MESH_SNI.to_string()])
            .map_err(|e| GateError::Config(format!("cert params: {e}")))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mgate node");

        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| GateError::Config(format!("keygen: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| GateError::Config(format!("self-sign: {e}")))?;

        let cert_der = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Self::from_der(vec![cert_der], key)
    }

    /// Load PEM cert/key from disk, generating and saving them on first run.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> GateResult<Self> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read(cert_path)?;
            let key_pem = std::fs::read(key_path)?;
            return Self::from_pem(&cert_pem, &key_pem);
        }

        let mut params = rcgen::CertificateParams::new(vec![MESH_SNI.to_string()])
            .map_err(|e| GateError::Config(format!("cert params: {e}")))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mgate node");
        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| GateError::Config(format!("keygen: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| GateError::Config(format!("self-sign: {e}")))?;

        if let Some(dir) = cert_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(cert_path, cert.pem())?;
        std::fs::write(key_path, key_pair.serialize_pem())?;

        let cert_der = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Self::from_der(vec![cert_der], key)
    }

    /// Build from PEM-encoded certificate chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> GateResult<Self> {
        let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GateError::Config(format!("bad cert PEM: {e}")))?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| GateError::Config(format!("bad key PEM: {e}")))?
            .ok_or_else(|| GateError::Config("no private key found in PEM".into()))?;
        Self::from_der(cert_chain, key)
    }

    fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> GateResult<Self> {
        let leaf = cert_chain
            .first()
            .ok_or_else(|| GateError::Config("empty certificate chain".into()))?;
        let identity = spki_identity(leaf)?;
        Ok(Self {
            identity,
            cert_chain,
            key,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Per-connection server config. A fresh config per accept keeps the
    /// identity handoff single-producer/single-consumer.
    pub fn server_config(
        &self,
        alpn: &[&str],
    ) -> GateResult<(Arc<rustls::ServerConfig>, IdentityHandoff)> {
        let (verifier, handoff) = RawKeyVerifier::new(self.provider.clone(), None);
        let mut config = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| GateError::Config(format!("tls versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| GateError::Config(format!("tls server config: {e}")))?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok((Arc::new(config), handoff))
    }

    /// Per-connection client config, optionally pinned to an expected peer
    /// identity.
    pub fn client_config(
        &self,
        expected: Option<&str>,
        alpn: &[&str],
    ) -> GateResult<(Arc<rustls::ClientConfig>, IdentityHandoff)> {
        let (verifier, handoff) =
            RawKeyVerifier::new(self.provider.clone(), expected.map(|s| s.to_string()));
        let mut config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| GateError::Config(format!("tls versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| GateError::Config(format!("tls client config: {e}")))?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok((Arc::new(config), handoff))
    }
}

/// Run a handshake future, racing it against caller cancellation.
///
/// Cancellation drops the in-flight handshake (closing the transport) and is
/// surfaced as [`GateError::Cancelled`], distinct from transport failures.
async fn handshake_cancellable<F, T>(
    hs: F,
    cancel: Option<mpsc::Receiver<()>>,
) -> GateResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match cancel {
        None => hs.await.map_err(|e| GateError::Handshake(e.to_string())),
        Some(mut rx) => {
            tokio::select! {
                res = hs => res.map_err(|e| GateError::Handshake(e.to_string())),
                _ = rx.recv() => Err(GateError::Cancelled),
            }
        }
    }
}

/// Accept-side TLS termination.
///
/// Returns the encrypted stream plus the negotiated [`TlsInfo`] (ALPN, peer
/// identity when a client cert was presented, SNI).
pub async fn tls_accept<S>(
    io: S,
    node: &NodeIdentity,
    alpn: &[&str],
    cancel: Option<mpsc::Receiver<()>>,
) -> GateResult<(tokio_rustls::server::TlsStream<S>, TlsInfo)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (config, handoff) = node.server_config(alpn)?;
    let acceptor = TlsAcceptor::from(config);
    let stream = handshake_cancellable(acceptor.accept(io), cancel).await?;

    let conn = &stream.get_ref().1;
    let info = TlsInfo {
        alpn: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).to_string()),
        sni: conn.server_name().map(|s| s.to_string()),
        peer_identity: handoff.resolve(),
    };
    Ok((stream, info))
}

/// Dial-side TLS, optionally pinned to `expected`.
pub async fn tls_connect<S>(
    io: S,
    node: &NodeIdentity,
    expected: Option<&str>,
    alpn: &[&str],
    cancel: Option<mpsc::Receiver<()>>,
) -> GateResult<(tokio_rustls::client::TlsStream<S>, TlsInfo)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (config, handoff) = node.client_config(expected, alpn)?;
    let connector = TlsConnector::from(config);
    let server_name =
        ServerName::try_from(MESH_SNI.to_string()).expect("constant SNI is a valid DNS name");
    let stream = handshake_cancellable(connector.connect(server_name, io), cancel).await?;

    let conn = &stream.get_ref().1;
    let info = TlsInfo {
        alpn: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).to_string()),
        sni: Some(MESH_SNI.to_string()),
        peer_identity: handoff.resolve(),
    };
    Ok((stream, info))
}
