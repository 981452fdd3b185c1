//! Transport construction and the connection lifecycle manager.
//!
//! The manager owns the tonic channel, exposes a reactive state signal, and
//! hands live transport handles to the reflection client and the invoker.
//! State transitions go through one helper that mutates under the lock,
//! then invokes the callback and the watch signal strictly after the lock
//! is released, so callback code may call back into the manager.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::error::{Error, Result};
use crate::invoke::Invoker;
use crate::reflection::ReflectionClient;

/// Keepalive is fixed rather than tunable: ping every 30s with a 20s ack
/// timeout, pings permitted on idle channels. Servers that police idle
/// channels (ENHANCE_YOUR_CALM) tolerate this cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// TLS settings for a connection. Certificates and keys are raw PEM bytes;
/// where they came from is the host's business.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// Disable certificate chain verification. Logged as a warning.
    pub insecure_skip_verify: bool,
    /// CA certificate bundle (PEM). Native roots are used when absent.
    pub ca_cert: Option<Vec<u8>>,
    /// Client certificate (PEM) for mutual TLS. Requires `client_key`.
    pub client_cert: Option<Vec<u8>>,
    /// Client private key (PEM) for mutual TLS. Requires `client_cert`.
    pub client_key: Option<Vec<u8>>,
}

/// Everything needed to open one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    /// host:port of the target server.
    pub address: String,
    /// Bound on the dial; no bound when absent.
    pub timeout: Option<Duration>,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// A state transition with its human-readable message.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: ConnectionState,
    pub message: String,
}

/// Callback invoked on every state transition, outside the manager's lock.
pub type StateCallback = Arc<dyn Fn(ConnectionState, &str) + Send + Sync>;

struct Inner {
    channel: Option<Channel>,
    address: String,
    state: ConnectionState,
    callback: Option<StateCallback>,
}

/// Owns the transport for one endpoint at a time.
pub struct ConnectionManager {
    inner: RwLock<Inner>,
    state_tx: watch::Sender<StateChange>,
    // Serializes connect/disconnect; accessors only take the inner lock.
    op_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(StateChange {
            state: ConnectionState::Disconnected,
            message: "not connected".into(),
        });
        ConnectionManager {
            inner: RwLock::new(Inner {
                channel: None,
                address: String::new(),
                state: ConnectionState::Disconnected,
                callback: None,
            }),
            state_tx,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register the state-change callback, replacing any previous one.
    pub fn on_state_change(&self, callback: StateCallback) {
        self.write().callback = Some(callback);
    }

    /// Watch-based subscription to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.read().state
    }

    pub fn address(&self) -> String {
        self.read().address.clone()
    }

    /// Handle to the live transport.
    pub fn channel(&self) -> Result<Channel> {
        self.read()
            .channel
            .clone()
            .ok_or_else(|| Error::TransportUnavailable("not connected".into()))
    }

    /// A reflection client over the live transport.
    pub fn reflection_client(&self) -> Result<ReflectionClient> {
        Ok(ReflectionClient::new(self.channel()?))
    }

    /// An invoker over the live transport.
    pub fn invoker(&self) -> Result<Invoker> {
        Ok(Invoker::new(self.channel()?))
    }

    /// Open a transport to `config.address`, replacing any existing one.
    ///
    /// Dial errors surface through both the return value and the
    /// state-change callback.
    pub async fn connect(&self, config: ConnectConfig) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.transition(
            ConnectionState::Connecting,
            format!("connecting to {}", config.address),
        );

        match dial(&config).await {
            Ok(channel) => {
                let previous = {
                    let mut inner = self.write();
                    inner.address = config.address.clone();
                    inner.channel.replace(channel)
                };
                // Dropping the old handle releases it without blocking the
                // new transition; its sockets tear down once in-flight
                // clones finish.
                drop(previous);
                self.transition(
                    ConnectionState::Connected,
                    format!("connected to {}", config.address),
                );
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Error, e.to_string());
                Err(e)
            }
        }
    }

    /// Close the current transport. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.op_lock.lock().await;
        let previous = self.write().channel.take();
        match previous {
            None => self.transition(ConnectionState::Disconnected, "already disconnected"),
            Some(channel) => {
                drop(channel);
                self.transition(ConnectionState::Disconnected, "disconnected");
            }
        }
    }

    /// Mutate state under the lock, then notify outside it. Invoking the
    /// callback while holding the lock would deadlock any callback that
    /// calls back into the manager.
    fn transition(&self, state: ConnectionState, message: impl Into<String>) {
        let message = message.into();
        let callback = {
            let mut inner = self.write();
            inner.state = state;
            inner.callback.clone()
        };
        if let Some(callback) = callback {
            callback(state, &message);
        }
        let _ = self.state_tx.send(StateChange { state, message });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn dial(config: &ConnectConfig) -> Result<Channel> {
    let tls = &config.tls;
    if tls.enabled && tls.client_cert.is_some() != tls.client_key.is_some() {
        return Err(Error::Tls(
            "client certificate and client key must both be provided".into(),
        ));
    }

    if tls.enabled && tls.insecure_skip_verify {
        tracing::warn!(address = %config.address, "TLS certificate verification disabled");
        return dial_skip_verify(config).await;
    }

    let scheme = if tls.enabled { "https" } else { "http" };
    let uri = format!("{scheme}://{}", config.address);
    let mut endpoint = build_endpoint(&uri, config)?;

    if tls.enabled {
        endpoint = endpoint
            .tls_config(build_tonic_tls(tls)?)
            .map_err(|e| Error::Tls(e.to_string()))?;
    }

    endpoint.connect().await.map_err(|e| {
        Error::TransportUnavailable(format!("failed to connect to {}: {e}", config.address))
    })
}

/// Common endpoint settings: keepalive (fixed) and the dial timeout.
fn build_endpoint(uri: &str, config: &ConnectConfig) -> Result<Endpoint> {
    let mut endpoint: Endpoint = Channel::from_shared(uri.to_string())
        .map_err(|e| Error::TransportUnavailable(format!("invalid address: {e}")))?;

    endpoint = endpoint
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    if let Some(timeout) = config.timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    Ok(endpoint)
}

/// tonic-native TLS for the verifying path.
fn build_tonic_tls(tls: &TlsOptions) -> Result<ClientTlsConfig> {
    let mut config = ClientTlsConfig::new();

    if let Some(ca) = &tls.ca_cert {
        // Validate eagerly; tonic defers parsing until the handshake.
        parse_pem_certs(ca, "CA certificate")?;
        config = config.ca_certificate(Certificate::from_pem(ca.clone()));
    } else {
        config = config.with_native_roots();
    }

    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        parse_pem_certs(cert, "client certificate")?;
        parse_pem_key(key)?;
        config = config.identity(Identity::from_pem(cert.clone(), key.clone()));
    }

    Ok(config)
}

/// Skip-verify requires a hand-built rustls connector; tonic's TLS config
/// has no hook for replacing the certificate verifier.
async fn dial_skip_verify(config: &ConnectConfig) -> Result<Channel> {
    use hyper_util::rt::TokioIo;
    use tower::service_fn;

    let rustls_config = build_skip_verify_rustls(&config.tls)?;
    let uri = format!("https://{}", config.address);
    let endpoint = build_endpoint(&uri, config)?;

    let connector = tokio_rustls::TlsConnector::from(Arc::new(rustls_config));
    let host = config
        .address
        .split(':')
        .next()
        .unwrap_or(&config.address)
        .to_string();
    let address = config.address.clone();

    endpoint
        .connect_with_connector(service_fn(move |_: http::Uri| {
            let connector = connector.clone();
            let sni = host.clone();
            let address = address.clone();
            async move {
                let tcp = tokio::net::TcpStream::connect(&address).await?;
                let server_name = rustls::pki_types::ServerName::try_from(sni.as_str())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
                    .to_owned();
                let stream = connector.connect(server_name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| {
            Error::TransportUnavailable(format!("failed to connect to {}: {e}", config.address))
        })
}

fn build_skip_verify_rustls(tls: &TlsOptions) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DisabledCertVerifier));

    let mut config = if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        let certs = parse_pem_certs(cert, "client certificate")?;
        let key = parse_pem_key(key)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Tls(format!("client certificate rejected: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    apply_key_log(&mut config);
    Ok(config)
}

/// Honor SSLKEYLOGFILE on the hand-built connector path for debugging with
/// packet captures.
fn apply_key_log(config: &mut rustls::ClientConfig) {
    if std::env::var("SSLKEYLOGFILE").is_ok() {
        config.key_log = Arc::new(rustls::KeyLogFile::new());
    }
}

fn parse_pem_certs(
    pem: &[u8],
    what: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("{what} is not valid PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{what} contains no PEM certificates")));
    }
    Ok(certs)
}

fn parse_pem_key(pem: &[u8]) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| Error::Tls(format!("client key is not valid PEM: {e}")))?
        .ok_or_else(|| Error::Tls("client key contains no PEM private key".into()))
}

/// Accepts every server certificate. Only reachable behind the
/// `insecure_skip_verify` flag.
#[derive(Debug)]
struct DisabledCertVerifier;

impl rustls::client::danger::ServerCertVerifier for DisabledCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A structurally valid PEM certificate section. `rustls-pemfile` checks
    /// PEM framing, not DER content, which is exactly the byte contract the
    /// config validation enforces.
    fn sample_cert_pem() -> Vec<u8> {
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(b"certificate placeholder der");
        format!("-----BEGIN CERTIFICATE-----\n{encoded}\n-----END CERTIFICATE-----\n").into_bytes()
    }

    fn tls(f: impl FnOnce(&mut TlsOptions)) -> TlsOptions {
        let mut options = TlsOptions {
            enabled: true,
            ..Default::default()
        };
        f(&mut options);
        options
    }

    #[test]
    fn default_tls_uses_native_roots() {
        let result = build_tonic_tls(&tls(|_| {}));
        assert!(result.is_ok());
    }

    #[test]
    fn garbage_ca_bytes_are_rejected() {
        let options = tls(|t| t.ca_cert = Some(b"not a pem".to_vec()));
        let err = build_tonic_tls(&options).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(err.to_string().contains("CA certificate"));
    }

    #[test]
    fn valid_ca_pem_is_accepted() {
        let options = tls(|t| t.ca_cert = Some(sample_cert_pem()));
        assert!(build_tonic_tls(&options).is_ok());
    }

    #[test]
    fn skip_verify_config_builds_without_roots() {
        let result = build_skip_verify_rustls(&tls(|t| t.insecure_skip_verify = true));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cert_without_key_is_rejected_before_dialing() {
        let config = ConnectConfig {
            address: "localhost:1".into(),
            timeout: None,
            tls: tls(|t| t.client_cert = Some(sample_cert_pem())),
        };
        let err = dial(&config).await.unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn manager_starts_disconnected() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.channel().is_err());
        assert!(manager.address().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_notifies() {
        let manager = ConnectionManager::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_state_change(Arc::new(move |state, message| {
            sink.lock().unwrap().push((state, message.to_string()));
        }));

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(s, _)| *s == ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn callback_may_reenter_the_manager() {
        let manager = Arc::new(ConnectionManager::new());
        let reentrant = manager.clone();
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = observed.clone();
        manager.on_state_change(Arc::new(move |_, _| {
            // Reading state from inside the callback must not deadlock.
            sink.lock().unwrap().push(reentrant.state());
        }));

        manager.disconnect().await;
        assert_eq!(
            observed.lock().unwrap().as_slice(),
            &[ConnectionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn failed_dial_transitions_through_connecting_to_error() {
        let manager = ConnectionManager::new();
        let states = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = states.clone();
        manager.on_state_change(Arc::new(move |state, _| {
            sink.lock().unwrap().push(state);
        }));

        // Nothing listens on this port; the dial fails fast.
        let result = manager
            .connect(ConnectConfig {
                address: "127.0.0.1:1".into(),
                timeout: Some(Duration::from_secs(2)),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(
            states.lock().unwrap().as_slice(),
            &[ConnectionState::Connecting, ConnectionState::Error]
        );
    }
}
