//! # Server engine
//!
//! One server scheme owns a listener and the brokers accepted from it:
//! `listen -> accept -> admission (ip/mac hook) -> TLS -> driver`. Three
//! drivers are available per listener kind:
//! - **Web**: HTTP/1.1 with Basic/Digest challenges and WebSocket upgrade;
//! - **ProxyHttp**: CONNECT tunneling with `Proxy-Authenticate`;
//! - **ProxySocks5**: RFC 1928/1929 with the credential store, relaying
//!   through the partners map.

pub mod credentials;
mod drivers;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::server::AuthServer;
use crate::auth::{Algorithm, AuthType};
use crate::core::broker::{BrokerId, Timeouts};
use crate::core::partners::Partners;
use crate::core::reactor::Reactor;
use crate::core::transport::server_acceptor;
use crate::errors::{ErrorKind, NetError, Result};
use crate::http::codec::{Request, Response};
use crate::utils::net::lookup_mac;

static NEXT_SCHEME: AtomicU64 = AtomicU64::new(1);

/// Typed event sink implemented by the application.
pub trait ServerEvents: Send + Sync + 'static {
    /// Admission filter; returning `false` drops the socket before any
    /// protocol work.
    fn on_accept(&self, _ip: IpAddr, _mac: &str) -> bool {
        true
    }
    fn on_open(&self, _id: BrokerId) {}
    fn on_close(&self, _id: BrokerId) {}
    fn on_error(&self, _id: BrokerId, _kind: ErrorKind, _message: &str) {}
    /// WebSocket message from an upgraded connection.
    fn on_message(&self, _id: BrokerId, _data: &[u8], _is_text: bool) {}
    /// Plain HTTP request; the returned response is written as-is.
    fn on_request(&self, _id: BrokerId, _request: &Request) -> Response {
        Response::new(404)
    }
}

/// What an accepted connection is served as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerKind {
    #[default]
    Web,
    ProxyHttp,
    ProxySocks5,
}

/// TLS material for the listener.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub chain: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kind: ServerKind,
    pub max_connections: usize,
    pub ipv6_only: bool,
    pub tls: Option<TlsPaths>,
    pub auth_type: AuthType,
    pub algorithm: Algorithm,
    pub realm: Option<String>,
    pub opaque: Option<String>,
    pub subprotocols: Vec<String>,
    pub deflate: bool,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kind: ServerKind::Web,
            max_connections: 512,
            ipv6_only: false,
            tls: None,
            auth_type: AuthType::None,
            algorithm: Algorithm::Md5,
            realm: None,
            opaque: None,
            subprotocols: Vec::new(),
            deflate: true,
            timeouts: Timeouts::default(),
        }
    }
}

pub(crate) struct ConnHandle {
    pub tx: mpsc::UnboundedSender<(Vec<u8>, bool)>,
    pub token: CancellationToken,
}

/// One listener plus its accepted brokers.
pub struct Scheme {
    id: u64,
    reactor: Reactor,
    events: Arc<dyn ServerEvents>,
    settings: Mutex<Settings>,
    credentials: Arc<credentials::CredentialStore>,
    pub(crate) partners: Arc<Partners>,
    pub(crate) active: Mutex<HashMap<BrokerId, ConnHandle>>,
    pub(crate) conn_count: AtomicUsize,
    running: AtomicBool,
}

impl Scheme {
    pub fn new(reactor: Reactor, events: Arc<dyn ServerEvents>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SCHEME.fetch_add(1, Ordering::Relaxed),
            reactor,
            events,
            settings: Mutex::new(Settings::default()),
            credentials: Arc::new(credentials::CredentialStore::new()),
            partners: Arc::new(Partners::new()),
            active: Mutex::new(HashMap::new()),
            conn_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub(crate) fn events(&self) -> &Arc<dyn ServerEvents> {
        &self.events
    }

    pub(crate) fn settings_snapshot(&self) -> Settings {
        self.settings.lock().expect("settings poisoned").clone()
    }

    /// The user table consulted by every auth flavor this listener speaks.
    pub fn credentials(&self) -> &Arc<credentials::CredentialStore> {
        &self.credentials
    }

    fn update<F: FnOnce(&mut Settings)>(&self, f: F) {
        f(&mut self.settings.lock().expect("settings poisoned"));
    }

    pub fn kind(&self, kind: ServerKind) {
        self.update(|s| s.kind = kind);
    }

    pub fn max_connections(&self, n: usize) {
        self.update(|s| s.max_connections = n.max(1));
    }

    pub fn ipv6_only(&self, on: bool) {
        self.update(|s| s.ipv6_only = on);
    }

    pub fn cert(
        &self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
        chain: Option<PathBuf>,
    ) {
        let tls = TlsPaths { cert: cert.into(), key: key.into(), chain };
        self.update(|s| s.tls = Some(tls));
    }

    pub fn auth(&self, auth_type: AuthType, algorithm: Algorithm) {
        self.update(|s| {
            s.auth_type = auth_type;
            s.algorithm = algorithm;
        });
    }

    pub fn realm(&self, realm: impl Into<String>) {
        let realm = realm.into();
        self.update(|s| s.realm = Some(realm));
    }

    pub fn opaque(&self, opaque: impl Into<String>) {
        let opaque = opaque.into();
        self.update(|s| s.opaque = Some(opaque));
    }

    pub fn subprotocols(&self, subprotocols: Vec<String>) {
        self.update(|s| s.subprotocols = subprotocols);
    }

    pub fn deflate(&self, on: bool) {
        self.update(|s| s.deflate = on);
    }

    pub fn timeouts(&self, read: u64, write: u64, connect: u64) {
        self.update(|s| s.timeouts = Timeouts { read, write, connect });
    }

    /// Bind and start accepting. Returns the bound address (useful with
    /// port 0).
    pub async fn listen(self: &Arc<Self>, host: &str, port: u16) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::Protocol("listener already running".into()));
        }
        let settings = self.settings_snapshot();
        let listener = bind(host, port, settings.ipv6_only).await?;
        let bound = listener.local_addr()?;

        // the auth engine is shared by every accepted connection
        let auth = Arc::new(AuthServer::new(settings.auth_type, settings.algorithm));
        if let Some(realm) = &settings.realm {
            auth.set_realm(realm.clone());
        }
        if let Some(opaque) = &settings.opaque {
            auth.set_opaque(opaque.clone());
        }
        let store = Arc::clone(&self.credentials);
        auth.set_extract_pass(Arc::new(move |user| store.extract_pass(user)));

        let acceptor = match &settings.tls {
            Some(paths) => Some(server_acceptor(
                &paths.cert,
                &paths.key,
                paths.chain.as_deref(),
            )?),
            None => None,
        };

        tracing::info!(
            scheme = self.id,
            address = %bound,
            kind = ?settings.kind,
            tls = acceptor.is_some(),
            "listener established"
        );
        let scheme = Arc::clone(self);
        self.reactor.spawn(async move {
            drivers::accept_loop(scheme, listener, acceptor, auth, settings).await;
        });
        Ok(bound)
    }

    /// Stop accepting and close every live connection.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.partners.clear();
        let active = self.active.lock().expect("active map poisoned");
        for handle in active.values() {
            handle.token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn should_run(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.reactor.is_stopped()
    }

    /// Live connection count.
    pub fn connections(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }

    /// Send a WebSocket message to one upgraded connection.
    pub fn send(&self, id: BrokerId, data: impl Into<Vec<u8>>, is_text: bool) -> Result<()> {
        let active = self.active.lock().expect("active map poisoned");
        let handle = active
            .get(&id)
            .ok_or_else(|| NetError::Protocol(format!("broker {id} is not active")))?;
        handle.tx.send((data.into(), is_text)).map_err(|_| NetError::PeerClosed)
    }

    /// Close one connection.
    pub fn close(&self, id: BrokerId) {
        if let Some(handle) = self.active.lock().expect("active map poisoned").get(&id) {
            handle.token.cancel();
        }
    }

    pub(crate) fn register(&self, id: BrokerId, handle: ConnHandle) {
        self.active.lock().expect("active map poisoned").insert(id, handle);
    }

    pub(crate) fn unregister(&self, id: BrokerId) {
        self.active.lock().expect("active map poisoned").remove(&id);
    }
}

/// Bind honoring `ipv6_only`. Numeric hosts bind directly; names resolve
/// first.
async fn bind(host: &str, port: u16, ipv6_only: bool) -> Result<TcpListener> {
    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                NetError::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve bind host {host:?}"),
                ))
            })?
            .ip(),
    };
    let addr = SocketAddr::new(ip, port);
    let socket = if addr.is_ipv6() { TcpSocket::new_v6()? } else { TcpSocket::new_v4()? };
    socket.set_reuseaddr(true)?;
    if addr.is_ipv6() {
        set_ipv6_only(&socket, ipv6_only)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

#[cfg(unix)]
fn set_ipv6_only(socket: &TcpSocket, on: bool) -> Result<()> {
    use std::os::fd::AsRawFd;
    let value: libc::c_int = if on { 1 } else { 0 };
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // the option struct is a plain int.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetError::Transport(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_ipv6_only(_socket: &TcpSocket, _on: bool) -> Result<()> {
    Ok(())
}

/// Admission: capacity, then the user hook with the peer's IP and MAC.
pub(crate) fn admit(scheme: &Scheme, peer: SocketAddr, settings: &Settings) -> bool {
    let live = scheme.conn_count.load(Ordering::SeqCst);
    let ceiling = settings.max_connections.min(scheme.reactor().watch_ceiling());
    if live >= ceiling {
        scheme.events().on_error(
            0,
            ErrorKind::ResourceExhausted,
            &format!("connection ceiling {ceiling} reached, refusing {peer}"),
        );
        return false;
    }
    let mac = lookup_mac(peer.ip());
    if !scheme.events().on_accept(peer.ip(), &mac) {
        log::info!("scheme {}: admission hook refused {peer} (mac {mac:?})", scheme.id);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEvents;
    impl ServerEvents for NullEvents {}

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let scheme = Scheme::new(Reactor::new(), Arc::new(NullEvents));
        let bound = scheme.listen("127.0.0.1", 0).await.unwrap();
        assert_ne!(bound.port(), 0);
        assert!(scheme.is_running());
        // double listen is refused
        assert!(scheme.listen("127.0.0.1", 0).await.is_err());
        scheme.stop();
    }

    #[tokio::test]
    async fn admission_honors_capacity() {
        struct RejectAll;
        impl ServerEvents for RejectAll {
            fn on_accept(&self, _ip: IpAddr, _mac: &str) -> bool {
                false
            }
        }
        let scheme = Scheme::new(Reactor::new(), Arc::new(RejectAll));
        let settings = scheme.settings_snapshot();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(!admit(&scheme, peer, &settings));

        let scheme = Scheme::new(Reactor::new(), Arc::new(NullEvents));
        scheme.max_connections(1);
        let settings = scheme.settings_snapshot();
        assert!(admit(&scheme, peer, &settings));
        scheme.conn_count.store(1, Ordering::SeqCst);
        assert!(!admit(&scheme, peer, &settings));
    }
}
