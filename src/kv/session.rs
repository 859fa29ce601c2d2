//! One multiplexed connection to one data-service node.
//!
//! A session owns its socket through two tasks: a reader that turns bytes
//! into frames, and a mux that owns the write half, the opaque counter and
//! the in-flight table. Everything that touches the in-flight table runs on
//! the mux task, so it needs no lock.

use super::error_map::ErrorMap;
use super::ops;
use super::opcode::{HelloFeature, Opcode, Status};
use super::sasl::{Authenticator, Mechanism, SaslError, select_mechanism};
use super::wire::{FrameDecoder, RequestFrame, ResponseFrame, WireError};
use crate::config::{Credentials, IpProtocol, TlsOptions};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

/// Read chunk size for the reader task
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Diagnostics ring depth per session
const EVENT_RING_SIZE: usize = 16;

pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// Session lifecycle, surfaced by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Connecting,
    TlsHandshaking,
    Hello,
    SaslListing,
    SaslStepping,
    SelectBucket,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Coarse endpoint state for diagnostics reports
    pub fn endpoint_state(self) -> &'static str {
        match self {
            SessionState::Active => "connected",
            SessionState::Draining => "disconnecting",
            SessionState::Closed => "disconnected",
            _ => "connecting",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("i/o failure during handshake: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame during handshake: {0}")]
    Wire(#[from] WireError),
    #[error("sasl failure: {0}")]
    Sasl(#[from] SaslError),
    #[error("authentication rejected by server (status 0x{0:02x})")]
    AuthRejected(u16),
    #[error("{0:?} rejected with status 0x{1:02x}")]
    UnexpectedStatus(Opcode, u16),
    #[error("handshake timed out in {0}")]
    Timeout(&'static str),
    #[error("no address of the requested family for {0}")]
    NoUsableAddress(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// Why a send did not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSendError {
    /// Rejected before hitting the socket; safe to retry elsewhere
    NotAvailable,
    /// The socket died with the request in flight; the server may or may
    /// not have applied it
    ClosedInFlight,
    /// The session was closed and cancelled everything it held
    Canceled,
}

/// A config payload that arrived out-of-band (NMVB body, unknown-collection
/// response), forwarded to the topology manager.
#[derive(Debug, Clone)]
pub struct ConfigHint {
    pub payload: Vec<u8>,
    pub origin_host: String,
}

/// Everything a session needs to come up.
#[derive(Clone)]
pub struct SessionConfig {
    /// HELLO key identifying this client in server logs
    pub client_id: String,
    pub bucket: Option<String>,
    pub credentials: Credentials,
    pub enable_compression: bool,
    pub connect_timeout: Duration,
    pub resolve_timeout: Duration,
    pub ip_protocol: IpProtocol,
    pub enable_tcp_keep_alive: bool,
    pub tcp_keep_alive_interval: Duration,
    /// Present for `couchbases://` clusters
    pub tls: Option<TlsConnector>,
    /// Out-of-band config payloads go here
    pub config_tx: Option<mpsc::UnboundedSender<ConfigHint>>,
}

/// What the HELLO/SASL ladder produced.
#[derive(Debug, Default)]
pub struct Negotiated {
    pub features: Vec<HelloFeature>,
    pub error_map: Option<ErrorMap>,
    pub mechanism: Option<Mechanism>,
}

impl Negotiated {
    pub fn supports(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub what: String,
}

enum Command {
    Send { frame: RequestFrame, reply: oneshot::Sender<Result<ResponseFrame, SessionSendError>> },
    Drain { done: oneshot::Sender<()> },
    Close,
}

struct SessionInner {
    endpoint: String,
    local_endpoint: String,
    bucket: Option<String>,
    negotiated: Negotiated,
    state: Mutex<SessionState>,
    events: Mutex<VecDeque<SessionEvent>>,
    tx: mpsc::Sender<Command>,
}

/// Cloneable handle to one live connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Resolve, connect (TLS if configured) and run the handshake ladder.
    pub async fn connect(
        host: &str,
        port: u16,
        config: SessionConfig,
    ) -> Result<Session, HandshakeError> {
        let addrs = timeout(
            config.resolve_timeout,
            tokio::net::lookup_host(format!("{host}:{port}")),
        )
        .await
        .map_err(|_| HandshakeError::Timeout("resolve"))??;
        let addrs: Vec<_> = addrs
            .filter(|addr| match config.ip_protocol {
                IpProtocol::Any => true,
                IpProtocol::ForceIpv4 => addr.is_ipv4(),
                IpProtocol::ForceIpv6 => addr.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            return Err(HandshakeError::NoUsableAddress(host.to_string()));
        }

        let mut last_error = None;
        for addr in addrs {
            match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
                Err(_) => last_error = Some(HandshakeError::Timeout("connect")),
                Ok(Err(e)) => last_error = Some(HandshakeError::Io(e)),
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    if config.enable_tcp_keep_alive {
                        let keepalive = socket2::TcpKeepalive::new()
                            .with_time(config.tcp_keep_alive_interval)
                            .with_interval(config.tcp_keep_alive_interval);
                        let _ = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive);
                    }
                    let local = stream
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    let endpoint = format!("{host}:{port}");

                    let transport: BoxedTransport = match &config.tls {
                        None => Box::new(stream),
                        Some(connector) => {
                            let name = rustls::pki_types::ServerName::try_from(host.to_string())
                                .map_err(|e| HandshakeError::Tls(e.to_string()))?;
                            let tls_stream =
                                timeout(config.connect_timeout, connector.connect(name, stream))
                                    .await
                                    .map_err(|_| HandshakeError::Timeout("tls"))??;
                            Box::new(tls_stream)
                        }
                    };
                    return Session::establish(transport, endpoint, local, config).await;
                }
            }
        }
        Err(last_error.unwrap_or(HandshakeError::Timeout("connect")))
    }

    /// Run the handshake ladder on an established transport and spawn the
    /// reader/mux tasks. Split out from [`connect`] so tests can drive a
    /// session over an in-process duplex stream.
    ///
    /// [`connect`]: Session::connect
    pub(crate) async fn establish(
        mut stream: BoxedTransport,
        endpoint: String,
        local_endpoint: String,
        config: SessionConfig,
    ) -> Result<Session, HandshakeError> {
        let mut decoder = FrameDecoder::new();
        let mut opaque = 1u32;

        // HELLO
        let reply = roundtrip(
            &mut stream,
            &mut decoder,
            ops::hello(&config.client_id, ops::DEFAULT_FEATURES),
            &mut opaque,
        )
        .await?;
        let mut negotiated = Negotiated { features: ops::parse_hello(&reply), ..Default::default() };
        debug!(endpoint = %endpoint, features = ?negotiated.features, "hello complete");

        // Error map, only when the server can use extended errors
        if negotiated.supports(HelloFeature::Xerror) {
            let reply =
                roundtrip(&mut stream, &mut decoder, ops::get_error_map(), &mut opaque).await?;
            if reply.status() == Some(Status::Success) {
                negotiated.error_map = ErrorMap::parse(&reply.value).ok();
            }
        }

        // SASL; certificate auth already authenticated during TLS
        if config.credentials.uses_sasl() {
            negotiated.mechanism =
                Some(authenticate(&mut stream, &mut decoder, &mut opaque, &config.credentials).await?);
        }

        // Bucket selection gates all data traffic
        if let Some(bucket) = &config.bucket {
            let reply =
                roundtrip(&mut stream, &mut decoder, ops::select_bucket(bucket), &mut opaque)
                    .await?;
            if reply.status() != Some(Status::Success) {
                return Err(HandshakeError::UnexpectedStatus(
                    Opcode::SelectBucket,
                    reply.status_raw,
                ));
            }
        }

        let compress =
            config.enable_compression && negotiated.supports(HelloFeature::Snappy);
        let (tx, cmd_rx) = mpsc::channel(1024);
        let inner = Arc::new(SessionInner {
            endpoint: endpoint.clone(),
            local_endpoint,
            bucket: config.bucket.clone(),
            negotiated,
            state: Mutex::new(SessionState::Active),
            events: Mutex::new(VecDeque::with_capacity(EVENT_RING_SIZE)),
            tx,
        });
        inner.record_event("session established");

        let (read_half, write_half) = tokio::io::split(stream);
        let (resp_tx, resp_rx) = mpsc::channel(1024);
        tokio::spawn(read_loop(read_half, decoder, resp_tx));
        tokio::spawn(mux_loop(MuxState {
            inner: Arc::clone(&inner),
            write_half,
            cmd_rx,
            resp_rx,
            compress,
            config_tx: config.config_tx.clone(),
            opaque,
            in_flight: HashMap::new(),
        }));

        Ok(Session { inner })
    }

    /// Submit a request and await its response. The session assigns the
    /// opaque; callers enforce their own deadline around this future.
    pub async fn send(&self, frame: RequestFrame) -> Result<ResponseFrame, SessionSendError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Send { frame, reply })
            .await
            .map_err(|_| SessionSendError::NotAvailable)?;
        rx.await.map_err(|_| SessionSendError::ClosedInFlight)?
    }

    /// Stop accepting sends, let in-flight requests finish, then release
    /// the socket.
    pub async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Drain { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Hard close: cancel everything in flight.
    pub async fn close(&self) {
        let _ = self.inner.tx.send(Command::Close).await;
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("session state lock")
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn local_endpoint(&self) -> &str {
        &self.inner.local_endpoint
    }

    pub fn bucket(&self) -> Option<&str> {
        self.inner.bucket.as_deref()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.inner.negotiated
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.inner.events.lock().expect("session event lock").iter().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("session state lock");
        if *state != next {
            trace!(endpoint = %self.endpoint, ?next, "session state change");
            *state = next;
        }
    }

    fn record_event(&self, what: &str) {
        let mut events = self.events.lock().expect("session event lock");
        if events.len() == EVENT_RING_SIZE {
            events.pop_front();
        }
        events.push_back(SessionEvent { at: Utc::now(), what: what.to_string() });
    }
}

/// One blocking request/response exchange used only during the handshake,
/// before the mux exists.
async fn roundtrip(
    stream: &mut BoxedTransport,
    decoder: &mut FrameDecoder,
    mut frame: RequestFrame,
    opaque: &mut u32,
) -> Result<ResponseFrame, HandshakeError> {
    frame.opaque = *opaque;
    *opaque = opaque.wrapping_add(1);
    stream.write_all(&frame.encode(false)).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if let Some(reply) = decoder.next()? {
            if reply.opaque != frame.opaque {
                warn!(
                    expected = frame.opaque,
                    got = reply.opaque,
                    "dropping out-of-order frame during handshake"
                );
                continue;
            }
            return Ok(reply);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        decoder.extend(&buf[..n]);
    }
}

/// SASL ladder: list mechanisms, pick the strongest, run the exchange.
async fn authenticate(
    stream: &mut BoxedTransport,
    decoder: &mut FrameDecoder,
    opaque: &mut u32,
    credentials: &Credentials,
) -> Result<Mechanism, HandshakeError> {
    let reply = roundtrip(stream, decoder, ops::sasl_list_mechs(), opaque).await?;
    if reply.status() != Some(Status::Success) {
        return Err(HandshakeError::UnexpectedStatus(Opcode::SaslListMechs, reply.status_raw));
    }
    let offered = String::from_utf8_lossy(&reply.value).to_string();

    let (username, secret, oauth) = match credentials {
        Credentials::UsernamePassword { username, password } => {
            (username.as_str(), password.as_str(), false)
        }
        Credentials::OauthBearer { token } => ("", token.as_str(), true),
        Credentials::Certificate { .. } => unreachable!("certificate auth skips sasl"),
    };
    let mechanism = select_mechanism(&offered, oauth)?;
    let authenticator = Authenticator::new(mechanism, username, secret);

    match authenticator {
        Authenticator::OneShot { mechanism, initial } => {
            let reply = roundtrip(
                stream,
                decoder,
                ops::sasl_auth(mechanism.name(), initial),
                opaque,
            )
            .await?;
            match reply.status() {
                Some(Status::Success) => Ok(mechanism),
                _ => Err(HandshakeError::AuthRejected(reply.status_raw)),
            }
        }
        Authenticator::Scram { mechanism, mut client } => {
            let first = client.client_first().into_bytes();
            let reply =
                roundtrip(stream, decoder, ops::sasl_auth(mechanism.name(), first), opaque).await?;
            if reply.status() != Some(Status::AuthContinue) {
                return Err(HandshakeError::AuthRejected(reply.status_raw));
            }
            let client_final = client.step(&reply.value)?;
            let reply = roundtrip(
                stream,
                decoder,
                ops::sasl_step(mechanism.name(), client_final.into_bytes()),
                opaque,
            )
            .await?;
            if reply.status() != Some(Status::Success) {
                return Err(HandshakeError::AuthRejected(reply.status_raw));
            }
            client.verify_server_final(&reply.value)?;
            Ok(mechanism)
        }
    }
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<BoxedTransport>,
    mut decoder: FrameDecoder,
    resp_tx: mpsc::Sender<ResponseFrame>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(frame)) => {
                            if resp_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "protocol violation on read path, closing session");
                            return;
                        }
                    }
                }
            }
        }
    }
}

struct MuxState {
    inner: Arc<SessionInner>,
    write_half: tokio::io::WriteHalf<BoxedTransport>,
    cmd_rx: mpsc::Receiver<Command>,
    resp_rx: mpsc::Receiver<ResponseFrame>,
    compress: bool,
    config_tx: Option<mpsc::UnboundedSender<ConfigHint>>,
    opaque: u32,
    in_flight: HashMap<u32, oneshot::Sender<Result<ResponseFrame, SessionSendError>>>,
}

async fn mux_loop(mut mux: MuxState) {
    let mut draining = false;
    let mut drain_done: Option<oneshot::Sender<()>> = None;
    let origin_host = mux
        .inner
        .endpoint
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| mux.inner.endpoint.clone());

    enum Event {
        Cmd(Option<Command>),
        Resp(Option<ResponseFrame>),
    }

    loop {
        let event = tokio::select! {
            cmd = mux.cmd_rx.recv() => Event::Cmd(cmd),
            frame = mux.resp_rx.recv() => Event::Resp(frame),
        };
        match event {
            Event::Cmd(Some(Command::Send { mut frame, reply })) => {
                if draining {
                    let _ = reply.send(Err(SessionSendError::NotAvailable));
                    continue;
                }
                frame.opaque = mux.opaque;
                mux.opaque = mux.opaque.wrapping_add(1);
                let bytes = frame.encode(mux.compress);
                if let Err(e) = mux.write_half.write_all(&bytes).await {
                    warn!(endpoint = %mux.inner.endpoint, error = %e, "write failed");
                    let _ = reply.send(Err(SessionSendError::NotAvailable));
                    fail_in_flight(&mut mux.in_flight, SessionSendError::ClosedInFlight);
                    break;
                }
                mux.in_flight.insert(frame.opaque, reply);
            }
            Event::Cmd(Some(Command::Drain { done })) => {
                draining = true;
                drain_done = Some(done);
                mux.inner.set_state(SessionState::Draining);
                mux.inner.record_event("drain requested");
                if mux.in_flight.is_empty() {
                    break;
                }
            }
            Event::Cmd(Some(Command::Close)) | Event::Cmd(None) => {
                mux.inner.record_event("hard close");
                fail_in_flight(&mut mux.in_flight, SessionSendError::Canceled);
                break;
            }
            Event::Resp(Some(frame)) => {
                forward_config_hint(&mux.config_tx, &frame, &origin_host);
                if let Some(duration) = frame.server_duration_us {
                    trace!(opaque = frame.opaque, server_duration_us = duration, "server duration");
                }
                match mux.in_flight.remove(&frame.opaque) {
                    Some(reply) => {
                        let _ = reply.send(Ok(frame));
                    }
                    None => {
                        debug!(
                            endpoint = %mux.inner.endpoint,
                            opaque = frame.opaque,
                            "response for unknown opaque (late cancel or server push)"
                        );
                    }
                }
                if draining && mux.in_flight.is_empty() {
                    break;
                }
            }
            Event::Resp(None) => {
                // reader ended: socket closed under us
                mux.inner.record_event("socket closed");
                fail_in_flight(&mut mux.in_flight, SessionSendError::ClosedInFlight);
                break;
            }
        }
    }

    mux.inner.set_state(SessionState::Closed);
    if let Some(done) = drain_done {
        let _ = done.send(());
    }
}

fn fail_in_flight(
    in_flight: &mut HashMap<u32, oneshot::Sender<Result<ResponseFrame, SessionSendError>>>,
    error: SessionSendError,
) {
    for (_, reply) in in_flight.drain() {
        let _ = reply.send(Err(error));
    }
}

/// NMVB and unknown-collection responses carry a fresh config payload;
/// forward it so the topology manager can apply it immediately.
fn forward_config_hint(
    config_tx: &Option<mpsc::UnboundedSender<ConfigHint>>,
    frame: &ResponseFrame,
    origin_host: &str,
) {
    let Some(tx) = config_tx else { return };
    let interesting = matches!(
        frame.status(),
        Some(Status::NotMyVbucket) | Some(Status::UnknownCollection)
    ) || frame.opcode() == Some(Opcode::GetClusterConfig);
    if interesting && !frame.value.is_empty() && frame.value.starts_with(b"{") {
        let _ = tx.send(ConfigHint {
            payload: frame.value.clone(),
            origin_host: origin_host.to_string(),
        });
    }
}

/// Build the TLS connector once per cluster.
pub fn build_tls_connector(
    tls: &TlsOptions,
    credentials: &Credentials,
) -> Result<TlsConnector, HandshakeError> {
    fn pem_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, HandshakeError> {
        let mut reader = io::BufReader::new(std::fs::File::open(path)?);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HandshakeError::Tls(e.to_string()))
    }

    let mut roots = rustls::RootCertStore::empty();
    match &tls.trust_certificate {
        Some(path) => {
            for cert in pem_certs(path)? {
                roots.add(cert).map_err(|e| HandshakeError::Tls(e.to_string()))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let mut config = match credentials {
        Credentials::Certificate { cert_path, key_path } => {
            let certs = pem_certs(cert_path)?;
            let mut reader = io::BufReader::new(std::fs::File::open(key_path)?);
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|e| HandshakeError::Tls(e.to_string()))?
                .ok_or_else(|| HandshakeError::Tls(format!("no private key in {key_path}")))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| HandshakeError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    if tls.accept_all_certificates {
        config.dangerous().set_certificate_verifier(Arc::new(danger::NoVerification));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Verifier for `accept_all_certificates`; development setups only.
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
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

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA512,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA512,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }
}
