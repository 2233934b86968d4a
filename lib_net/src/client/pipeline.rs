//! Connection pipeline: resolve, dial, proxy traversal, TLS switchover,
//! then hand-off to the application driver. The outer loop owns retry and
//! reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use super::drivers;
use super::{ProxyConfig, ProxyKind, Scheme, Settings};
use crate::core::broker::{Broker, Phase, Role};
use crate::core::transport::{client_connector, Transport};
use crate::errors::{NetError, Result};
use crate::http::connect::{ConnectSm, Step as ConnectStep};
use crate::socks5::client::{Socks5Client, Step as SocksStep};
use crate::socks5::TargetAddr;
use crate::utils::net::{is_secure_scheme, url_host, url_port};

/// How one connection ended.
pub(crate) enum Outcome {
    /// Orderly end of the exchange (peer closed, or one-shot done).
    Finished,
    /// The server redirected; reconnect against this URL.
    Redirect(Url),
}

/// Outer retry loop, one live connection at a time.
pub(crate) async fn run(scheme: Arc<Scheme>, mut settings: Settings) {
    let mut attempt: u16 = 0;
    while scheme.should_run() {
        match connect_once(&scheme, &settings, attempt).await {
            Ok(Outcome::Finished) => {
                attempt = 0;
                if !(settings.keepalive && scheme.should_run()) {
                    break;
                }
                log::debug!("scheme {}: reconnecting after clean close", scheme.id());
            }
            Ok(Outcome::Redirect(url)) => {
                log::info!("scheme {}: following redirect to {url}", scheme.id());
                settings.url = url;
                // a redirect is progress, not a failed attempt
            }
            Err(err) => {
                scheme.events().on_error(0, err.kind(), &err.to_string());
                attempt += 1;
                if attempt > settings.retry_limit {
                    log::warn!(
                        "scheme {}: giving up after {attempt} attempts: {err}",
                        scheme.id()
                    );
                    break;
                }
                let delay = backoff(attempt);
                log::debug!(
                    "scheme {}: attempt {attempt}/{} failed ({err}), retrying in {delay:?}",
                    scheme.id(),
                    settings.retry_limit
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Linear back-off proportional to the attempt count, capped.
fn backoff(attempt: u16) -> Duration {
    Duration::from_millis((u64::from(attempt) * 500).min(5_000))
}

async fn connect_once(scheme: &Arc<Scheme>, settings: &Settings, attempt: u16) -> Result<Outcome> {
    let origin_host = url_host(&settings.url)?;
    let origin_port = url_port(&settings.url)?;
    let (dial_host, dial_port, role) = match &settings.proxy {
        Some(proxy) => (proxy.host.clone(), proxy.port, Role::ClientToProxy),
        None => (origin_host.clone(), origin_port, Role::ClientToServer),
    };

    let mut broker = Broker::new(scheme.id(), role);
    broker.timeouts = settings.timeouts;
    broker.retry.limit = settings.retry_limit;
    broker.retry.current = attempt;
    broker.budgets = settings.bandwidth;

    let stream = dial(&dial_host, dial_port, settings.timeouts.connect).await?;
    broker.attach(Transport::Plain(stream))?;
    log::debug!(
        "broker {}: connected to {dial_host}:{dial_port} ({:?})",
        broker.id(),
        broker.role()
    );

    // proxy traversal happens on the same buffers, then the broker flips to
    // the origin; no on_open fires for the proxy hop
    let mut residue = Vec::new();
    if let Some(proxy) = &settings.proxy {
        broker.advance(Phase::ProxyHandshake)?;
        residue = proxy_handshake(&mut broker, proxy, settings, &origin_host, origin_port).await?;
        broker.switch_connect()?;
    } else {
        broker.advance(Phase::AppReady)?;
    }

    // a tunneled TLS session is established after proxy success, not before
    if is_secure_scheme(settings.url.scheme()) {
        if !residue.is_empty() {
            return Err(NetError::Proxy(
                "proxy delivered bytes before the TLS handshake".into(),
            ));
        }
        let connector = client_connector(&settings.tls)?;
        let transport = broker
            .transport
            .take()
            .ok_or_else(|| NetError::Protocol("broker lost its transport".into()))?;
        let transport = transport.start_tls_client(&connector, &origin_host).await?;
        broker.transport = Some(transport);
        log::debug!("broker {}: TLS established with {origin_host}", broker.id());
    }

    match settings.url.scheme() {
        "ws" | "wss" => drivers::drive_ws(scheme, settings, broker, residue).await,
        _ => drivers::drive_http(scheme, settings, broker, residue).await,
    }
}

/// Resolve and dial, trying each address in resolver order.
async fn dial(host: &str, port: u16, connect_secs: u64) -> Result<TcpStream> {
    let deadline = Duration::from_secs(connect_secs.max(1));
    let addrs = tokio::time::timeout(deadline, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| NetError::Timeout("resolve"))??;
    let mut last: Option<NetError> = None;
    for addr in addrs {
        match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(err)) => {
                log::debug!("dial {addr}: {err}");
                last = Some(err.into());
            }
            Err(_) => last = Some(NetError::Timeout("connect")),
        }
    }
    Err(last.unwrap_or_else(|| {
        NetError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses for {host}:{port}"),
        ))
    }))
}

/// Drive the configured proxy handshake. Proxy bytes land in the broker's
/// read buffer and the state machines consume them chunk by chunk. Returns
/// any bytes the proxy delivered past the handshake.
async fn proxy_handshake(
    broker: &mut Broker,
    proxy: &ProxyConfig,
    settings: &Settings,
    origin_host: &str,
    origin_port: u16,
) -> Result<Vec<u8>> {
    let read_secs = Duration::from_secs(settings.timeouts.read.max(1));
    let mut transport = broker
        .transport
        .take()
        .ok_or_else(|| NetError::Protocol("proxy handshake without a transport".into()))?;
    let mut buf = [0u8; 4096];

    enum Sm {
        Connect(ConnectSm),
        Socks(Socks5Client),
    }
    let mut sm = match proxy.kind {
        ProxyKind::Http => {
            let mut sm = ConnectSm::new(
                origin_host,
                origin_port,
                proxy.auth_type,
                proxy.algorithm,
                proxy.credentials.clone(),
            );
            transport.write_all(&sm.start()).await?;
            Sm::Connect(sm)
        }
        ProxyKind::Socks5 => {
            let target = match origin_host.parse::<std::net::IpAddr>() {
                Ok(ip) => TargetAddr::Ip(std::net::SocketAddr::new(ip, origin_port)),
                Err(_) => TargetAddr::Domain(origin_host.to_string(), origin_port),
            };
            let mut sm = Socks5Client::new(target, proxy.credentials.clone());
            transport.write_all(&sm.greeting()).await?;
            Sm::Socks(sm)
        }
    };

    let result = 'exchange: loop {
        let n = match tokio::time::timeout(read_secs, transport.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => break Err(err.into()),
            Err(_) => break Err(NetError::Timeout("proxy handshake read")),
        };
        if n == 0 {
            break Err(NetError::PeerClosed);
        }
        broker.read_buf.add(buf[..n].to_vec());

        while let Some(chunk) = (!broker.read_buf.is_empty()).then(|| broker.read_buf.get()) {
            let step = match &mut sm {
                Sm::Connect(sm) => sm.feed(&chunk).map(|step| match step {
                    ConnectStep::Pending => Progress::Pending,
                    ConnectStep::Send(bytes) => Progress::Send(bytes),
                    ConnectStep::Done => Progress::Done(sm.take_residue()),
                }),
                Sm::Socks(sm) => sm.feed(&chunk).map(|step| match step {
                    SocksStep::Pending => Progress::Pending,
                    SocksStep::Send(bytes) => Progress::Send(bytes),
                    SocksStep::Done => Progress::Done(sm.take_residue()),
                }),
            };
            match step {
                Ok(Progress::Pending) => {}
                Ok(Progress::Send(bytes)) => {
                    if let Err(err) = transport.write_all(&bytes).await {
                        break 'exchange Err(err.into());
                    }
                }
                Ok(Progress::Done(residue)) => break 'exchange Ok(residue),
                Err(err) => break 'exchange Err(err),
            }
        }
    };
    broker.transport = Some(transport);
    result
}

enum Progress {
    Pending,
    Send(Vec<u8>),
    Done(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(4), Duration::from_millis(2000));
        assert_eq!(backoff(40), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn dial_refused_maps_to_transport_error() {
        // bind then drop to get a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = dial("127.0.0.1", port, 1).await.unwrap_err();
        assert!(matches!(err, NetError::Transport(_) | NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn dial_connects_to_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = dial("127.0.0.1", port, 2).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
