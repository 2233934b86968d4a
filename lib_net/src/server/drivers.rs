//! Accepted-connection drivers: the web (HTTP + WebSocket upgrade) driver
//! and the CONNECT / SOCKS5 proxy drivers with partner relaying.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::{admit, ConnHandle, Scheme, ServerKind, Settings};
use crate::auth::server::{AuthServer, AuthStatus};
use crate::auth::AuthType;
use crate::core::broker::{Broker, Phase, Role};
use crate::core::transport::Transport;
use crate::errors::{NetError, Result};
use crate::http::codec::{self, HttpCodec, Message, Request, Response};
use crate::socks5::server::{Event as SocksEvent, Socks5Server};
use crate::socks5::{Reply, TargetAddr};
use crate::ws::frame::{Assembler, DeflateCodec, Frame, WsMessage};
use crate::ws::handshake::ServerHandshake;

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

pub(crate) async fn accept_loop(
    scheme: Arc<Scheme>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    auth: Arc<AuthServer>,
    settings: Settings,
) {
    let token = scheme.reactor().cancelled();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        if !scheme.should_run() {
            break;
        }
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(scheme = scheme.id(), error = %err, "accept failed");
                continue;
            }
        };
        if !admit(&scheme, peer, &settings) {
            continue;
        }
        scheme.conn_count.fetch_add(1, Ordering::SeqCst);
        let scheme = Arc::clone(&scheme);
        let acceptor = acceptor.clone();
        let auth = Arc::clone(&auth);
        let settings = settings.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&scheme, stream, peer, acceptor, auth, settings).await
            {
                scheme.events().on_error(0, err.kind(), &err.to_string());
            }
            scheme.conn_count.fetch_sub(1, Ordering::SeqCst);
        });
    }
    log::info!("scheme {}: accept loop stopped", scheme.id());
}

async fn handle_connection(
    scheme: &Arc<Scheme>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    auth: Arc<AuthServer>,
    settings: Settings,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut broker = Broker::new(scheme.id(), Role::ServerAccepted);
    broker.timeouts = settings.timeouts;
    broker.attach(Transport::Plain(stream))?;
    log::debug!("broker {}: accepted from {peer}", broker.id());

    if let Some(acceptor) = &acceptor {
        let transport = broker
            .transport
            .take()
            .ok_or_else(|| NetError::Protocol("accepted broker lost its socket".into()))?;
        let deadline = Duration::from_secs(settings.timeouts.connect.max(1));
        let transport = tokio::time::timeout(deadline, transport.start_tls_server(acceptor))
            .await
            .map_err(|_| NetError::Timeout("TLS accept"))??;
        broker.transport = Some(transport);
    }
    broker.advance(Phase::AppReady)?;

    let id = broker.id();
    scheme.events().on_open(id);
    let result = match settings.kind {
        ServerKind::Web => serve_web(scheme, &settings, &auth, broker).await,
        ServerKind::ProxyHttp => serve_proxy_http(scheme, &settings, &auth, broker).await,
        ServerKind::ProxySocks5 => serve_socks5(scheme, &settings, broker).await,
    };
    scheme.events().on_close(id);
    result
}

/// One read sized by the broker's timeout; `Ok(0)` means the peer left.
async fn timed_read(
    rd: &mut ReadHalf<Transport>,
    buf: &mut [u8],
    read_secs: u64,
    token: &CancellationToken,
) -> Result<usize> {
    let deadline = Duration::from_secs(read_secs.max(1));
    tokio::select! {
        _ = token.cancelled() => Ok(0),
        read = tokio::time::timeout(deadline, rd.read(buf)) => {
            Ok(read.map_err(|_| NetError::Timeout("read"))??)
        }
    }
}

// ---------------------------------------------------------------------------
// Web driver (HTTP + WebSocket upgrade)
// ---------------------------------------------------------------------------

async fn serve_web(
    scheme: &Arc<Scheme>,
    settings: &Settings,
    auth: &AuthServer,
    mut broker: Broker,
) -> Result<()> {
    let id = broker.id();
    let transport = broker
        .transport
        .take()
        .ok_or_else(|| NetError::Protocol("driver started without a transport".into()))?;
    let (mut rd, mut wr) = tokio::io::split(transport);
    let token = CancellationToken::new();
    let mut codec = HttpCodec::request();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        // pull one request; an idle keep-alive connection closes quietly
        let request = loop {
            if let Some(message) = codec.feed(&[])? {
                break expect_request(message)?;
            }
            let n = match timed_read(&mut rd, &mut buf, settings.timeouts.read, &token).await {
                Ok(n) => n,
                Err(NetError::Timeout(_)) => {
                    log::debug!("broker {id}: idle, closing");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if n == 0 {
                return Ok(());
            }
            if let Some(message) = codec.feed(&buf[..n])? {
                break expect_request(message)?;
            }
        };

        // authentication gate
        if settings.auth_type != AuthType::None {
            let status = match request.headers.get("Authorization") {
                Some(header) => auth.check(&request.method, header),
                None => AuthStatus::Fault,
            };
            match status {
                AuthStatus::Good => {}
                status => {
                    let stale = status == AuthStatus::Stale;
                    let mut response = Response::new(401);
                    response.headers.set("WWW-Authenticate", auth.challenge(stale));
                    wr.write_all(&response.encode()).await?;
                    log::debug!("broker {id}: 401 ({status:?}) for {}", request.target);
                    if codec::wants_close(&request.headers) {
                        let _ = wr.shutdown().await;
                        return Ok(());
                    }
                    codec.reset();
                    continue;
                }
            }
        }

        if is_upgrade(&request) {
            broker.advance(Phase::AppActive)?;
            return serve_ws(scheme, settings, id, rd, wr, token, codec, request).await;
        }

        let response = scheme.events().on_request(id, &request);
        let close = codec::wants_close(&request.headers) || codec::wants_close(&response.headers);
        wr.write_all(&response.encode()).await?;
        log::debug!("broker {id}: {} {} -> {}", request.method, request.target, response.code);
        if close {
            let _ = wr.shutdown().await;
            return Ok(());
        }
        codec.reset();
    }
}

fn expect_request(message: Message) -> Result<Request> {
    match message {
        Message::Request(request) => Ok(request),
        Message::Response(_) => {
            Err(NetError::Protocol("response received where a request was due".into()))
        }
    }
}

fn is_upgrade(request: &Request) -> bool {
    let upgrade = request
        .headers
        .get("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = request
        .headers
        .get("Connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade && connection
}

#[allow(clippy::too_many_arguments)]
async fn serve_ws(
    scheme: &Arc<Scheme>,
    settings: &Settings,
    id: u64,
    mut rd: ReadHalf<Transport>,
    mut wr: WriteHalf<Transport>,
    token: CancellationToken,
    mut codec: HttpCodec,
    request: Request,
) -> Result<()> {
    let handshake = ServerHandshake::new(settings.subprotocols.clone(), settings.deflate);
    let (response, negotiated) = match handshake.accept(&request) {
        Ok(accepted) => accepted,
        Err(err) => {
            let mut response = Response::new(400);
            response.body = err.to_string().into_bytes();
            response.headers.set("Content-Type", "text/plain");
            let _ = wr.write_all(&response.encode()).await;
            return Err(err);
        }
    };
    wr.write_all(&response.encode()).await?;
    log::info!(
        "broker {id}: WebSocket upgraded (subprotocol: {:?}, deflate: {})",
        negotiated.subprotocol,
        negotiated.deflate.is_some()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    scheme.register(id, ConnHandle { tx, token: token.clone() });

    let deflate = negotiated.deflate.is_some();
    let mut assembler = Assembler::new(MAX_MESSAGE_BYTES);
    let mut inflate = deflate.then(DeflateCodec::new);
    let mut squeeze = deflate.then(DeflateCodec::new);
    let mut wire = codec.take_residue();
    let mut buf = vec![0u8; READ_CHUNK];
    let read_secs = settings.timeouts.read.max(1);
    let mut watchdog = tokio::time::interval(Duration::from_secs(read_secs));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    watchdog.tick().await;
    let mut last_activity = Instant::now();

    let events = Arc::clone(scheme.events());
    let result: Result<()> = 'conn: loop {
        while let Some(decoded) = match Frame::decode(&wire, MAX_FRAME_BYTES) {
            Ok(decoded) => decoded,
            Err(err) => break 'conn Err(err),
        } {
            let (frame, used) = decoded;
            wire.drain(..used);
            let pushed = match assembler.push(frame, inflate.as_mut()) {
                Ok(pushed) => pushed,
                Err(err) => break 'conn Err(err),
            };
            let Some(message) = pushed else { continue };
            last_activity = Instant::now();
            match message {
                WsMessage::Text(text) => events.on_message(id, text.as_bytes(), true),
                WsMessage::Binary(data) => events.on_message(id, &data, false),
                WsMessage::Ping(payload) => {
                    if let Err(err) = wr.write_all(&Frame::pong(payload).encode(false)).await {
                        break 'conn Err(err.into());
                    }
                }
                WsMessage::Pong(_) => {}
                WsMessage::Close(close) => {
                    let code = close.as_ref().map(|(c, _)| *c).unwrap_or(1000);
                    let _ = wr.write_all(&Frame::close(code, "").encode(false)).await;
                    break 'conn Ok(());
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                let _ = wr.write_all(&Frame::close(1001, "going away").encode(false)).await;
                break 'conn Ok(());
            }
            outgoing = rx.recv() => match outgoing {
                Some((data, is_text)) => {
                    let opcode = if is_text { crate::ws::Opcode::Text } else { crate::ws::Opcode::Binary };
                    let mut frame = Frame::new(opcode, data);
                    if let Some(codec) = squeeze.as_mut() {
                        match codec.compress(&frame.payload) {
                            Ok(payload) => {
                                frame.payload = payload;
                                frame.rsv1 = true;
                            }
                            Err(err) => break 'conn Err(err),
                        }
                    }
                    if let Err(err) = wr.write_all(&frame.encode(false)).await {
                        break 'conn Err(err.into());
                    }
                }
                None => break 'conn Ok(()),
            },
            _ = watchdog.tick() => {
                let idle = last_activity.elapsed();
                if idle >= Duration::from_secs(read_secs * 2) {
                    break 'conn Err(NetError::Timeout("websocket idle"));
                }
                if idle >= Duration::from_secs(read_secs) {
                    if let Err(err) = wr.write_all(&Frame::ping(Vec::new()).encode(false)).await {
                        break 'conn Err(err.into());
                    }
                }
            }
            read = rd.read(&mut buf) => {
                match read {
                    Ok(0) => break 'conn Ok(()),
                    Ok(n) => {
                        last_activity = Instant::now();
                        wire.extend_from_slice(&buf[..n]);
                    }
                    Err(err) => break 'conn Err(err.into()),
                }
            }
        }
    };

    scheme.unregister(id);
    let _ = wr.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// HTTP CONNECT proxy driver
// ---------------------------------------------------------------------------

async fn serve_proxy_http(
    scheme: &Arc<Scheme>,
    settings: &Settings,
    auth: &AuthServer,
    mut broker: Broker,
) -> Result<()> {
    let id = broker.id();
    let mut transport = broker
        .transport
        .take()
        .ok_or_else(|| NetError::Protocol("driver started without a transport".into()))?;
    let mut codec = HttpCodec::request();
    let mut buf = vec![0u8; READ_CHUNK];
    let read_deadline = Duration::from_secs(settings.timeouts.read.max(1));

    loop {
        let request = loop {
            if let Some(message) = codec.feed(&[])? {
                break expect_request(message)?;
            }
            let n = tokio::time::timeout(read_deadline, transport.read(&mut buf))
                .await
                .map_err(|_| NetError::Timeout("read"))??;
            if n == 0 {
                return Ok(());
            }
            if let Some(message) = codec.feed(&buf[..n])? {
                break expect_request(message)?;
            }
        };

        if !request.method.eq_ignore_ascii_case("CONNECT") {
            let mut response = Response::new(405);
            response.headers.set("Allow", "CONNECT");
            response.headers.set("Connection", "close");
            transport.write_all(&response.encode()).await?;
            return Ok(());
        }

        if settings.auth_type != AuthType::None {
            let status = match request.headers.get("Proxy-Authorization") {
                Some(header) => auth.check(&request.method, header),
                None => AuthStatus::Fault,
            };
            if status != AuthStatus::Good {
                let stale = status == AuthStatus::Stale;
                let mut response = Response::new(407);
                response
                    .headers
                    .set("Proxy-Authenticate", auth.challenge(stale));
                transport.write_all(&response.encode()).await?;
                log::debug!("broker {id}: 407 ({status:?}) for {}", request.target);
                codec.reset();
                continue;
            }
        }

        let Some((host, port)) = split_authority(&request.target) else {
            let response = Response::new(400);
            transport.write_all(&response.encode()).await?;
            return Err(NetError::Proxy(format!(
                "bad CONNECT target {:?}",
                request.target
            )));
        };

        let connect_deadline = Duration::from_secs(settings.timeouts.connect.max(1));
        let upstream = match tokio::time::timeout(
            connect_deadline,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let response = Response::new(502);
                transport.write_all(&response.encode()).await?;
                return Err(err.into());
            }
            Err(_) => {
                let response = Response::new(504);
                transport.write_all(&response.encode()).await?;
                return Err(NetError::Timeout("upstream connect"));
            }
        };
        let _ = upstream.set_nodelay(true);

        let mut response = Response::new(200);
        response.reason = "Connection Established".into();
        transport.write_all(&response.encode()).await?;
        log::info!("broker {id}: CONNECT tunnel to {host}:{port}");

        // bytes the client pipelined behind the CONNECT belong upstream
        let residue = codec.take_residue();
        return relay(scheme, id, transport, Transport::Plain(upstream), residue).await;
    }
}

/// `host:port` authority split, IPv6 brackets respected.
fn split_authority(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port) = target.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

// ---------------------------------------------------------------------------
// SOCKS5 proxy driver
// ---------------------------------------------------------------------------

async fn serve_socks5(
    scheme: &Arc<Scheme>,
    settings: &Settings,
    mut broker: Broker,
) -> Result<()> {
    let id = broker.id();
    let mut transport = broker
        .transport
        .take()
        .ok_or_else(|| NetError::Protocol("driver started without a transport".into()))?;
    let verifier: Option<crate::socks5::server::VerifyFn> = if scheme.credentials().is_empty() {
        None
    } else {
        let store = Arc::clone(scheme.credentials());
        Some(Box::new(move |user: &str, pass: &str| store.verify(user, pass)))
    };
    let mut sm = Socks5Server::new(verifier);
    let mut buf = vec![0u8; READ_CHUNK];
    let read_deadline = Duration::from_secs(settings.timeouts.read.max(1));

    let target = loop {
        let n = tokio::time::timeout(read_deadline, transport.read(&mut buf))
            .await
            .map_err(|_| NetError::Timeout("read"))??;
        if n == 0 {
            return Ok(());
        }
        match sm.feed(&buf[..n])? {
            SocksEvent::Pending => {}
            SocksEvent::Send(bytes) => transport.write_all(&bytes).await?,
            SocksEvent::Reject(bytes) => {
                transport.write_all(&bytes).await?;
                let _ = transport.close().await;
                return Ok(());
            }
            SocksEvent::Connect(target) => break target,
        }
        // drain any pipelined phase already buffered
        loop {
            match sm.feed(&[])? {
                SocksEvent::Pending => break,
                SocksEvent::Send(bytes) => transport.write_all(&bytes).await?,
                SocksEvent::Reject(bytes) => {
                    transport.write_all(&bytes).await?;
                    let _ = transport.close().await;
                    return Ok(());
                }
                SocksEvent::Connect(target) => return finish_socks5(scheme, settings, id, transport, sm, target).await,
            }
        }
    };
    finish_socks5(scheme, settings, id, transport, sm, target).await
}

async fn finish_socks5(
    scheme: &Arc<Scheme>,
    settings: &Settings,
    id: u64,
    mut transport: Transport,
    mut sm: Socks5Server,
    target: TargetAddr,
) -> Result<()> {
    let connect_deadline = Duration::from_secs(settings.timeouts.connect.max(1));
    let dialed = match &target {
        TargetAddr::Ip(addr) => {
            tokio::time::timeout(connect_deadline, TcpStream::connect(*addr)).await
        }
        TargetAddr::Domain(host, port) => {
            tokio::time::timeout(connect_deadline, TcpStream::connect((host.as_str(), *port)))
                .await
        }
    };
    let upstream = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let reply = sm.complete(Reply::from_io(&err), None);
            transport.write_all(&reply).await?;
            return Err(err.into());
        }
        Err(_) => {
            let reply = sm.complete(Reply::HostUnreachable, None);
            transport.write_all(&reply).await?;
            return Err(NetError::Timeout("upstream connect"));
        }
    };
    let _ = upstream.set_nodelay(true);
    let bind = upstream.local_addr().ok();
    let reply = sm.complete(Reply::Succeeded, bind);
    transport.write_all(&reply).await?;
    log::info!("broker {id}: SOCKS5 tunnel to {target} (user {:?})", sm.user());

    let residue = sm.take_residue();
    relay(scheme, id, transport, Transport::Plain(upstream), residue).await
}

// ---------------------------------------------------------------------------
// Tunnel relay
// ---------------------------------------------------------------------------

/// Pair the two sides in the partners map and shuttle bytes until either
/// closes or the pairing is destroyed.
async fn relay(
    scheme: &Arc<Scheme>,
    client_id: u64,
    mut client: Transport,
    mut upstream: Transport,
    residue: Vec<u8>,
) -> Result<()> {
    let upstream_id = crate::core::broker::next_id();
    let token = CancellationToken::new();
    if !scheme
        .partners
        .merge(client_id, token.clone(), upstream_id, token.clone())
    {
        return Err(NetError::Protocol(format!(
            "broker {client_id} is already paired"
        )));
    }
    if !residue.is_empty() {
        upstream.write_all(&residue).await?;
    }
    let shuttled = tokio::select! {
        _ = token.cancelled() => None,
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => Some(result),
    };
    scheme.partners.del(client_id);
    let _ = client.close().await;
    let _ = upstream.close().await;
    match shuttled {
        Some(Ok((up, down))) => {
            log::debug!("broker {client_id}: tunnel closed ({up} bytes up, {down} bytes down)");
            Ok(())
        }
        Some(Err(err)) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_split() {
        assert_eq!(split_authority("origin:443"), Some(("origin".into(), 443)));
        assert_eq!(
            split_authority("[2001:db8::1]:8443"),
            Some(("2001:db8::1".into(), 8443))
        );
        assert_eq!(split_authority("no-port"), None);
        assert_eq!(split_authority("bad:port:x"), None);
    }

    #[test]
    fn upgrade_detection() {
        let mut request = Request::new("GET", "/ws");
        assert!(!is_upgrade(&request));
        request.headers.set("Upgrade", "websocket");
        request.headers.set("Connection", "keep-alive, Upgrade");
        assert!(is_upgrade(&request));
        request.headers.set("Upgrade", "h2c");
        assert!(!is_upgrade(&request));
    }
}
