//! # WebSocket Echo Gateway
//!
//! Sample server for the framework's web driver: accepts HTTP and WebSocket
//! connections, answers `/health`, echoes every WebSocket message back to
//! its sender, and optionally terminates TLS and enforces Basic/Digest
//! authentication against a static user table.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;

use lib_net::auth::{Algorithm, AuthType};
use lib_net::core::reactor::Reactor;
use lib_net::http::codec::{Request, Response};
use lib_net::loggers;
use lib_net::server::{Scheme, ServerEvents, ServerKind};
use lib_net::{BrokerId, ErrorKind};

#[derive(Parser, Debug, Clone)]
struct Config {
    #[clap(long, env = "WS_HOST", default_value = "0.0.0.0")]
    host: String,

    #[clap(long, env = "WS_PORT", default_value = "9002")]
    port: u16,

    #[clap(long, env = "WS_MAX_CONNECTIONS", default_value = "512")]
    max_connections: usize,

    #[clap(long, env = "WS_LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,

    #[clap(long, env = "WS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Authentication mode: none, basic or digest.
    #[clap(long, env = "WS_AUTH", default_value = "none")]
    auth: String,

    /// Static credentials as user:pass (repeatable).
    #[clap(long = "user", env = "WS_USERS", value_delimiter = ',')]
    users: Vec<String>,

    #[clap(long, env = "WS_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    #[clap(long, env = "WS_TLS_KEY")]
    tls_key: Option<PathBuf>,

    #[clap(long, env = "WS_TLS_CHAIN")]
    tls_chain: Option<PathBuf>,

    /// Comma-separated list of supported subprotocols.
    #[clap(long, env = "WS_SUBPROTOCOLS", value_delimiter = ',')]
    subprotocols: Vec<String>,
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

struct EchoGateway {
    scheme: std::sync::OnceLock<Arc<Scheme>>,
}

impl EchoGateway {
    fn scheme(&self) -> Option<&Arc<Scheme>> {
        self.scheme.get()
    }
}

impl ServerEvents for EchoGateway {
    fn on_accept(&self, ip: IpAddr, mac: &str) -> bool {
        log::debug!("admission: {ip} (mac {mac:?})");
        true
    }

    fn on_open(&self, id: BrokerId) {
        log::info!("connection {id} open");
    }

    fn on_close(&self, id: BrokerId) {
        log::info!("connection {id} closed");
    }

    fn on_error(&self, id: BrokerId, kind: ErrorKind, message: &str) {
        log::warn!("connection {id}: {kind:?}: {message}");
    }

    fn on_message(&self, id: BrokerId, data: &[u8], is_text: bool) {
        // Just an echo server, really
        if let Some(scheme) = self.scheme() {
            if let Err(err) = scheme.send(id, data.to_vec(), is_text) {
                log::warn!("echo to {id} failed: {err}");
            }
        }
    }

    fn on_request(&self, _id: BrokerId, request: &Request) -> Response {
        match request.target.as_str() {
            "/health" => {
                let payload = serde_json::to_vec(&Health {
                    status: "ok",
                    connections: self.scheme().map(|s| s.connections()).unwrap_or(0),
                })
                .unwrap_or_default();
                Response::with_body(200, payload, "application/json")
            }
            _ => Response::new(404),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    loggers::setup_logging("server_ws", &config.log_dir, &config.log_level)?;

    let reactor = Reactor::new();
    let events = Arc::new(EchoGateway { scheme: std::sync::OnceLock::new() });
    let scheme = Scheme::new(reactor.clone(), events.clone());
    let _ = events.scheme.set(Arc::clone(&scheme));

    scheme.kind(ServerKind::Web);
    scheme.max_connections(config.max_connections);
    scheme.subprotocols(config.subprotocols.clone());
    match config.auth.to_lowercase().as_str() {
        "basic" => scheme.auth(AuthType::Basic, Algorithm::Md5),
        "digest" => scheme.auth(AuthType::Digest, Algorithm::Sha256),
        _ => {}
    }
    for entry in &config.users {
        if let Some((user, pass)) = entry.split_once(':') {
            scheme.credentials().add(user, pass);
        } else {
            log::warn!("ignoring malformed --user entry {entry:?}");
        }
    }
    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        scheme.cert(cert, key, config.tls_chain.clone());
    }

    let bound = scheme.listen(&config.host, config.port).await?;
    log::info!("echo gateway ready on {bound}");

    let runner = reactor.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });

    wait_for_shutdown().await;
    log::info!("shutdown signal received");
    scheme.stop();
    reactor.stop();
    let _ = loop_handle.await;
    log::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
