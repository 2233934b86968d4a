//! # Live WebSocket Echo Test
//!
//! Boots the web driver with a subprotocol set and deflate enabled, then
//! drives the bundled client through the upgrade:
//! 1. plain text echo round trip;
//! 2. binary echo round trip;
//! 3. the same with permessage-deflate negotiated, which must survive the
//!    compress/decompress pair on both directions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use lib_net::client;
use lib_net::core::reactor::Reactor;
use lib_net::loggers;
use lib_net::server::{self, ServerEvents, ServerKind};
use lib_net::ws::CompressMode;
use lib_net::{BrokerId, ErrorKind};

struct Echo {
    scheme: std::sync::OnceLock<Arc<server::Scheme>>,
}

impl ServerEvents for Echo {
    fn on_message(&self, id: BrokerId, data: &[u8], is_text: bool) {
        if let Some(scheme) = self.scheme.get() {
            let _ = scheme.send(id, data.to_vec(), is_text);
        }
    }
}

#[derive(Default)]
struct Capture {
    messages: Mutex<Vec<(Vec<u8>, bool)>>,
    opened: Mutex<Vec<BrokerId>>,
    errors: Mutex<Vec<ErrorKind>>,
    signal: tokio::sync::Notify,
}

impl client::ClientEvents for Capture {
    fn on_open(&self, id: BrokerId) {
        self.opened.lock().unwrap().push(id);
        self.signal.notify_one();
    }

    fn on_message(&self, _id: BrokerId, data: &[u8], is_text: bool) {
        self.messages.lock().unwrap().push((data.to_vec(), is_text));
        self.signal.notify_one();
    }

    fn on_error(&self, _id: BrokerId, kind: ErrorKind, message: &str) {
        log::warn!("client error: {kind:?}: {message}");
        self.errors.lock().unwrap().push(kind);
        self.signal.notify_one();
    }
}

async fn wait_until<F: Fn() -> bool>(capture: &Capture, cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), capture.signal.notified()).await;
    }
    cond()
}

async fn echo_round_trip(reactor: &Reactor, port: u16, compress: CompressMode) -> Result<()> {
    let label = match compress {
        CompressMode::None => "plain",
        _ => "deflate",
    };
    let capture = Arc::new(Capture::default());
    let scheme = client::Scheme::new(reactor.clone(), capture.clone());
    scheme.init(&format!("ws://127.0.0.1:{port}/echo"), compress)?;
    scheme.retry_limit(0);
    scheme.wait_for_messages(true);
    scheme.subprotocols(vec!["echo.v1".into()]);
    scheme.start()?;

    if !wait_until(&capture, || !capture.opened.lock().unwrap().is_empty()).await {
        bail!("[{label}] upgrade never completed: {:?}", capture.errors.lock().unwrap());
    }
    let id = capture.opened.lock().unwrap()[0];
    println!("[{label}] upgrade complete (broker {id}): OK");

    scheme.send(id, b"ping text".to_vec(), true)?;
    if !wait_until(&capture, || {
        capture
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|(m, is_text)| *is_text && m == b"ping text")
    })
    .await
    {
        bail!("[{label}] text echo never arrived");
    }
    println!("[{label}] text echo: OK");

    let blob: Vec<u8> = (0u16..2048).map(|i| (i % 251) as u8).collect();
    scheme.send(id, blob.clone(), false)?;
    if !wait_until(&capture, || {
        capture
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|(m, is_text)| !*is_text && *m == blob)
    })
    .await
    {
        bail!("[{label}] binary echo never arrived");
    }
    println!("[{label}] binary echo (2 KiB): OK");

    scheme.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    loggers::setup_env_logging();
    let reactor = Reactor::new();

    let events = Arc::new(Echo { scheme: std::sync::OnceLock::new() });
    let server = server::Scheme::new(reactor.clone(), events.clone());
    let _ = events.scheme.set(Arc::clone(&server));
    server.kind(ServerKind::Web);
    server.subprotocols(vec!["echo.v1".into()]);
    server.deflate(true);
    let bound = server.listen("127.0.0.1", 0).await?;

    echo_round_trip(&reactor, bound.port(), CompressMode::None).await?;
    echo_round_trip(&reactor, bound.port(), CompressMode::PerMessage).await?;

    server.stop();
    reactor.stop();
    println!("ws echo: all checks passed");
    Ok(())
}
