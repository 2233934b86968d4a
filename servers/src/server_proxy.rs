//! # Tunneling Proxy Server
//!
//! Sample server for the proxy drivers: HTTP CONNECT mode or SOCKS5 mode on
//! one listener. With configured users, CONNECT mode challenges through
//! `Proxy-Authenticate` and SOCKS5 mode requires the username/password
//! sub-negotiation; without users both run open.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::signal;

use lib_net::auth::{Algorithm, AuthType};
use lib_net::core::reactor::Reactor;
use lib_net::loggers;
use lib_net::server::{Scheme, ServerEvents, ServerKind};
use lib_net::{BrokerId, ErrorKind};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Http,
    Socks5,
}

#[derive(Parser, Debug, Clone)]
struct Config {
    #[clap(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    host: String,

    #[clap(long, env = "PROXY_PORT", default_value = "3128")]
    port: u16,

    #[clap(long, env = "PROXY_MODE", value_enum, default_value = "http")]
    mode: Mode,

    #[clap(long, env = "PROXY_MAX_CONNECTIONS", default_value = "512")]
    max_connections: usize,

    /// Bind IPv6 sockets v6-only instead of dual-stack.
    #[clap(long, env = "PROXY_IPV6_ONLY")]
    ipv6_only: bool,

    #[clap(long, env = "PROXY_LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,

    #[clap(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// CONNECT authentication: none, basic or digest (SOCKS5 derives its
    /// requirement from the user table).
    #[clap(long, env = "PROXY_AUTH", default_value = "basic")]
    auth: String,

    #[clap(long, env = "PROXY_REALM", default_value = "proxy")]
    realm: String,

    /// Static credentials as user:pass (repeatable).
    #[clap(long = "user", env = "PROXY_USERS", value_delimiter = ',')]
    users: Vec<String>,
}

struct ProxyEvents;

impl ServerEvents for ProxyEvents {
    fn on_accept(&self, ip: IpAddr, mac: &str) -> bool {
        log::debug!("admission: {ip} (mac {mac:?})");
        true
    }

    fn on_open(&self, id: BrokerId) {
        log::debug!("tunnel client {id} connected");
    }

    fn on_close(&self, id: BrokerId) {
        log::debug!("tunnel client {id} gone");
    }

    fn on_error(&self, id: BrokerId, kind: ErrorKind, message: &str) {
        log::warn!("tunnel client {id}: {kind:?}: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    loggers::setup_logging("server_proxy", &config.log_dir, &config.log_level)?;

    let reactor = Reactor::new();
    let scheme = Scheme::new(reactor.clone(), Arc::new(ProxyEvents));
    scheme.kind(match config.mode {
        Mode::Http => ServerKind::ProxyHttp,
        Mode::Socks5 => ServerKind::ProxySocks5,
    });
    scheme.max_connections(config.max_connections);
    scheme.ipv6_only(config.ipv6_only);
    scheme.realm(config.realm.clone());
    match config.auth.to_lowercase().as_str() {
        "basic" => scheme.auth(AuthType::Basic, Algorithm::Md5),
        "digest" => scheme.auth(AuthType::Digest, Algorithm::Md5),
        _ => {}
    }
    let mut user_count = 0usize;
    for entry in &config.users {
        if let Some((user, pass)) = entry.split_once(':') {
            scheme.credentials().add(user, pass);
            user_count += 1;
        } else {
            log::warn!("ignoring malformed --user entry {entry:?}");
        }
    }
    if user_count == 0 {
        // nothing to verify against; an auth requirement would lock everyone out
        scheme.auth(AuthType::None, Algorithm::Md5);
        log::warn!("no users configured, running as an open proxy");
    }

    let bound = scheme.listen(&config.host, config.port).await?;
    log::info!("proxy ({:?}) ready on {bound}, {user_count} user(s)", config.mode);

    let runner = reactor.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });

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
                std::future::pending::<()>().await;
            }
        } => {}
    }
    log::info!("shutdown signal received");
    scheme.stop();
    reactor.stop();
    let _ = loop_handle.await;
    log::info!("shutdown complete");
    Ok(())
}
