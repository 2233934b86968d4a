//! End-to-end exchanges over loopback: the bundled client against the
//! bundled server drivers, covering the auth challenge dance and proxy
//! traversal with switchover.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_net::auth::{Algorithm, AuthType};
use lib_net::client;
use lib_net::core::reactor::Reactor;
use lib_net::http::codec::{Request, Response};
use lib_net::server::{self, ServerEvents, ServerKind};
use lib_net::{BrokerId, ErrorKind};

struct Backend;

impl ServerEvents for Backend {
    fn on_accept(&self, ip: IpAddr, _mac: &str) -> bool {
        ip.is_loopback()
    }

    fn on_request(&self, _id: BrokerId, request: &Request) -> Response {
        match request.target.as_str() {
            "/payload" => Response::with_body(200, "origin payload", "text/plain"),
            _ => Response::new(404),
        }
    }
}

struct ProxyEvents;
impl ServerEvents for ProxyEvents {}

#[derive(Default)]
struct Capture {
    bodies: Mutex<Vec<String>>,
    errors: Mutex<Vec<ErrorKind>>,
    opens: AtomicUsize,
    signal: tokio::sync::Notify,
}

impl client::ClientEvents for Capture {
    fn on_open(&self, _id: BrokerId) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, _id: BrokerId, data: &[u8], _is_text: bool) {
        self.bodies
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).into_owned());
        self.signal.notify_one();
    }

    fn on_error(&self, _id: BrokerId, kind: ErrorKind, _message: &str) {
        self.errors.lock().unwrap().push(kind);
        self.signal.notify_one();
    }
}

async fn await_outcome(capture: &Capture) {
    let _ = tokio::time::timeout(Duration::from_secs(10), capture.signal.notified()).await;
    // let in-flight callbacks settle
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn basic_auth_challenge_then_success() {
    let reactor = Reactor::new();
    let server = server::Scheme::new(reactor.clone(), Arc::new(Backend));
    server.kind(ServerKind::Web);
    server.auth(AuthType::Basic, Algorithm::Md5);
    server.realm("R");
    server.credentials().add("u", "p");
    let bound = server.listen("127.0.0.1", 0).await.unwrap();
    let url = format!("http://127.0.0.1:{}/payload", bound.port());

    // no credentials: error, no body
    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme.init(&url, lib_net::ws::CompressMode::None).unwrap();
    scheme.retry_limit(0);
    scheme.start().unwrap();
    await_outcome(&capture).await;
    assert!(capture.bodies.lock().unwrap().is_empty());
    assert!(!capture.errors.lock().unwrap().is_empty());
    scheme.stop();

    // credentials: 401 then 200 on the same connection
    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme.init(&url, lib_net::ws::CompressMode::None).unwrap();
    scheme.retry_limit(0);
    scheme.credentials("u", "p");
    scheme.auth(AuthType::Basic, Algorithm::Md5);
    scheme.start().unwrap();
    await_outcome(&capture).await;
    let bodies = capture.bodies.lock().unwrap().clone();
    assert!(
        bodies.iter().any(|b| b == "origin payload"),
        "expected the origin body, got {bodies:?} / {:?}",
        capture.errors.lock().unwrap()
    );
    scheme.stop();
    server.stop();
    reactor.stop();
}

#[tokio::test]
async fn digest_auth_round_trip() {
    let reactor = Reactor::new();
    let server = server::Scheme::new(reactor.clone(), Arc::new(Backend));
    server.kind(ServerKind::Web);
    server.auth(AuthType::Digest, Algorithm::Sha256);
    server.realm("digest-realm");
    server.credentials().add("Mufasa", "Circle Of Life");
    let bound = server.listen("127.0.0.1", 0).await.unwrap();

    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme
        .init(
            &format!("http://127.0.0.1:{}/payload", bound.port()),
            lib_net::ws::CompressMode::None,
        )
        .unwrap();
    scheme.retry_limit(0);
    scheme.credentials("Mufasa", "Circle Of Life");
    scheme.auth(AuthType::Digest, Algorithm::Sha256);
    scheme.start().unwrap();
    await_outcome(&capture).await;
    let bodies = capture.bodies.lock().unwrap().clone();
    assert!(
        bodies.iter().any(|b| b == "origin payload"),
        "digest exchange failed: {bodies:?} / {:?}",
        capture.errors.lock().unwrap()
    );
    scheme.stop();
    server.stop();
    reactor.stop();
}

#[tokio::test]
async fn http_connect_proxy_switchover_fires_one_open() {
    let reactor = Reactor::new();

    let origin = server::Scheme::new(reactor.clone(), Arc::new(Backend));
    origin.kind(ServerKind::Web);
    let origin_addr = origin.listen("127.0.0.1", 0).await.unwrap();

    let proxy = server::Scheme::new(reactor.clone(), Arc::new(ProxyEvents));
    proxy.kind(ServerKind::ProxyHttp);
    proxy.auth(AuthType::Basic, Algorithm::Md5);
    proxy.realm("proxy");
    proxy.credentials().add("pu", "pp");
    let proxy_addr = proxy.listen("127.0.0.1", 0).await.unwrap();

    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme
        .init(
            &format!("http://127.0.0.1:{}/payload", origin_addr.port()),
            lib_net::ws::CompressMode::None,
        )
        .unwrap();
    scheme.retry_limit(0);
    scheme
        .proxy(&format!("http://pu:pp@127.0.0.1:{}", proxy_addr.port()))
        .unwrap();
    scheme.start().unwrap();
    await_outcome(&capture).await;

    let bodies = capture.bodies.lock().unwrap().clone();
    assert!(
        bodies.iter().any(|b| b == "origin payload"),
        "tunneled fetch failed: {bodies:?} / {:?}",
        capture.errors.lock().unwrap()
    );
    // exactly one on_open, after the origin handshake; none at proxy success
    assert_eq!(capture.opens.load(Ordering::SeqCst), 1);

    scheme.stop();
    proxy.stop();
    origin.stop();
    reactor.stop();
}

#[tokio::test]
async fn socks5_proxy_traversal() {
    let reactor = Reactor::new();

    let origin = server::Scheme::new(reactor.clone(), Arc::new(Backend));
    origin.kind(ServerKind::Web);
    let origin_addr = origin.listen("127.0.0.1", 0).await.unwrap();

    let proxy = server::Scheme::new(reactor.clone(), Arc::new(ProxyEvents));
    proxy.kind(ServerKind::ProxySocks5);
    proxy.credentials().add("su", "sp");
    let proxy_addr = proxy.listen("127.0.0.1", 0).await.unwrap();

    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme
        .init(
            &format!("http://127.0.0.1:{}/payload", origin_addr.port()),
            lib_net::ws::CompressMode::None,
        )
        .unwrap();
    scheme.retry_limit(0);
    scheme
        .proxy(&format!("socks5://su:sp@127.0.0.1:{}", proxy_addr.port()))
        .unwrap();
    scheme.start().unwrap();
    await_outcome(&capture).await;

    let bodies = capture.bodies.lock().unwrap().clone();
    assert!(
        bodies.iter().any(|b| b == "origin payload"),
        "SOCKS5 fetch failed: {bodies:?} / {:?}",
        capture.errors.lock().unwrap()
    );
    assert_eq!(capture.opens.load(Ordering::SeqCst), 1);

    scheme.stop();
    proxy.stop();
    origin.stop();
    reactor.stop();
}
