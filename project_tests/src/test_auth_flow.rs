//! # Live Authentication Flow Test
//!
//! Boots the web driver on a loopback listener with one configured user and
//! exercises the whole challenge/response dance with the bundled client:
//! 1. a request without credentials must fail with an auth error;
//! 2. a request with Basic credentials must land a 200 body;
//! 3. a request with Digest credentials must land a 200 body (nonce,
//!    nc and response recomputed client-side).

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use lib_net::auth::{Algorithm, AuthType};
use lib_net::client;
use lib_net::core::reactor::Reactor;
use lib_net::http::codec::{Request, Response};
use lib_net::loggers;
use lib_net::server::{self, ServerEvents, ServerKind};
use lib_net::{BrokerId, ErrorKind};

struct Backend;

impl ServerEvents for Backend {
    fn on_accept(&self, ip: IpAddr, _mac: &str) -> bool {
        ip.is_loopback()
    }

    fn on_request(&self, _id: BrokerId, request: &Request) -> Response {
        match request.target.as_str() {
            "/secret" => Response::with_body(200, "the eagle has landed", "text/plain"),
            _ => Response::new(404),
        }
    }
}

#[derive(Default)]
struct Capture {
    bodies: Mutex<Vec<String>>,
    errors: Mutex<Vec<ErrorKind>>,
    done: tokio::sync::Notify,
}

impl client::ClientEvents for Capture {
    fn on_message(&self, _id: BrokerId, data: &[u8], _is_text: bool) {
        self.bodies
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).into_owned());
        self.done.notify_one();
    }

    fn on_error(&self, _id: BrokerId, kind: ErrorKind, message: &str) {
        log::debug!("client error: {kind:?}: {message}");
        self.errors.lock().unwrap().push(kind);
        self.done.notify_one();
    }
}

async fn fetch(
    reactor: &Reactor,
    url: &str,
    credentials: Option<(&str, &str)>,
    auth: AuthType,
    algorithm: Algorithm,
) -> (Vec<String>, Vec<ErrorKind>) {
    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme
        .init(url, lib_net::ws::CompressMode::None)
        .expect("bad url");
    scheme.retry_limit(0);
    if let Some((user, pass)) = credentials {
        scheme.credentials(user, pass);
        scheme.auth(auth, algorithm);
    }
    scheme.start().expect("start failed");
    let _ = tokio::time::timeout(Duration::from_secs(10), capture.done.notified()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let bodies = capture.bodies.lock().unwrap().clone();
    let errors = capture.errors.lock().unwrap().clone();
    scheme.stop();
    (bodies, errors)
}

#[tokio::main]
async fn main() -> Result<()> {
    loggers::setup_env_logging();
    let reactor = Reactor::new();

    for (auth_type, algorithm, label) in [
        (AuthType::Basic, Algorithm::Md5, "basic"),
        (AuthType::Digest, Algorithm::Md5, "digest-md5"),
        (AuthType::Digest, Algorithm::Sha256, "digest-sha256"),
    ] {
        let server = server::Scheme::new(reactor.clone(), Arc::new(Backend));
        server.kind(ServerKind::Web);
        server.auth(auth_type, algorithm);
        server.realm("project-tests");
        server.credentials().add("u", "p");
        let bound = server.listen("127.0.0.1", 0).await?;
        let url = format!("http://127.0.0.1:{}/secret", bound.port());

        // without credentials: the exchange must not produce the body
        let (bodies, errors) = fetch(&reactor, &url, None, auth_type, algorithm).await;
        if bodies.iter().any(|b| b.contains("eagle")) {
            bail!("[{label}] body served without credentials");
        }
        if errors.is_empty() {
            bail!("[{label}] no auth error surfaced without credentials");
        }
        println!("[{label}] unauthenticated request rejected: OK ({:?})", errors[0]);

        // with credentials: challenge, retry, 200
        let (bodies, errors) = fetch(&reactor, &url, Some(("u", "p")), auth_type, algorithm).await;
        if !bodies.iter().any(|b| b.contains("eagle")) {
            bail!("[{label}] authenticated request failed: bodies {bodies:?}, errors {errors:?}");
        }
        println!("[{label}] authenticated request succeeded: OK");

        // wrong password: rejected again
        let (bodies, _errors) =
            fetch(&reactor, &url, Some(("u", "wrong")), auth_type, algorithm).await;
        if bodies.iter().any(|b| b.contains("eagle")) {
            bail!("[{label}] body served with a wrong password");
        }
        println!("[{label}] wrong password rejected: OK");

        server.stop();
    }

    reactor.stop();
    println!("auth flow: all checks passed");
    Ok(())
}
