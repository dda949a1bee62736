//! vnet session layer demo
//!
//! Attaches a builtin server and two clients, binds a listener, redirects a
//! local connect to it, completes a transport connect for an external
//! client that reads its notifications from shared memory, then tears
//! everything down again.
//!
//! Usage: `vnet-session-demo [config.toml]`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vnet_session::{init_logger, AttachArgs, ConnectArgs, SessionLayer, SessionLayerConfig};
use vnet_session_core::{
    AppOptions, CallbackMask, EndpointArg, ListenKey, OptionFlags, Protocol, RedirectedConnect,
    SessionCallbacks, SessionHandle, TransportConnect, TransportEndpoint, TransportLayer,
    TransportSession,
};
use vnet_session_shm::{EventQueue, RegionBacking, Segment};

/// Transport stand-in that accepts everything and logs it
struct LoggingTransport;

impl TransportLayer for LoggingTransport {
    fn listen(&self, key: &ListenKey, listener: SessionHandle) -> vnet_session_core::Result<()> {
        info!("transport: listen {} as {}", key, listener);
        Ok(())
    }

    fn unlisten(&self, key: &ListenKey, listener: SessionHandle) -> vnet_session_core::Result<()> {
        info!("transport: unlisten {} ({})", key, listener);
        Ok(())
    }

    fn connect(&self, request: &TransportConnect) -> vnet_session_core::Result<()> {
        info!("transport: connect #{} to {}", request.request_id, request.destination);
        Ok(())
    }

    fn disconnect(&self, handle: SessionHandle) -> vnet_session_core::Result<()> {
        info!("transport: disconnect {}", handle);
        Ok(())
    }
}

/// Builtin server application
struct EchoServer;

impl SessionCallbacks for EchoServer {
    fn redirect_connect(&self, request: &RedirectedConnect) -> vnet_session_core::Result<()> {
        info!(
            "server: redirected connect from app {} on {} ({} byte request)",
            request.client_app_index,
            request.listener,
            request.payload.len()
        );
        Ok(())
    }
}

fn load_config() -> Result<SessionLayerConfig> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => SessionLayerConfig::from_file(&path)?,
        None => SessionLayerConfig::default(),
    };
    if !cfg!(unix) {
        config.segment_backing = RegionBacking::Anonymous;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logger(&config.log_level)?;

    let layer = SessionLayer::new(config, Arc::new(LoggingTransport))?;

    // Server A: 1MB segment, 256-slot queue, accepts redirected connects
    let server_options = AppOptions {
        segment_size: 1024 * 1024,
        evt_queue_size: 256,
        ..Default::default()
    }
    .with_flags(OptionFlags::USE_FIFO);
    let server = layer.attach(AttachArgs::builtin(Arc::new(EchoServer), server_options))?;
    println!("attach A: {}", serde_json::to_string(&server)?);

    let bind = layer.bind(
        server.app_index,
        EndpointArg::endpoint(TransportEndpoint::new([1, 2, 3, 4], 80), Protocol::Tcp),
    )?;
    println!("bind A: {}", serde_json::to_string(&bind)?);

    // B competes for the same listen key
    let rival = layer.attach(AttachArgs::builtin(Arc::new(EchoServer), AppOptions::default()))?;
    match layer.bind(rival.app_index, EndpointArg::uri("tcp://1.2.3.4/80")) {
        Ok(_) => println!("bind B: unexpectedly succeeded"),
        Err(e) => println!("bind B: {} (code {})", e, e.code()),
    }

    // C is an external client reading its queue from shared memory
    let client = layer.attach(AttachArgs::external(7, CallbackMask::all(), AppOptions::default()))?;
    println!("attach C: {}", serde_json::to_string(&client)?);

    let mut redirect = ConnectArgs::new(client.app_index, EndpointArg::uri("tcp://1.2.3.4/80"));
    redirect.mp = bytes::Bytes::from_static(b"GET / HTTP/1.1");
    let status = layer.connect(redirect)?;
    println!("connect C -> A: {:?} (code {})", status, status.code());

    let mut remote = ConnectArgs::new(client.app_index, EndpointArg::uri("tcp://5.6.7.8/443"));
    remote.api_context = 42;
    let status = layer.connect(remote)?;
    println!("connect C -> remote: {:?} (code {})", status, status.code());

    if let vnet_session::ConnectStatus::Pending { request_id } = status {
        let handle = layer.connect_notify(
            request_id,
            Ok(TransportSession {
                thread_index: 0,
                remote: TransportEndpoint::new([5, 6, 7, 8], 443),
            }),
        )?;

        let segment = match layer.config().segment_backing {
            RegionBacking::Posix => Segment::open(&client.segment_name).context("client cannot map its segment")?,
            RegionBacking::Anonymous => layer
                .segments()
                .get(&client.segment_name)
                .context("client segment missing")?,
        };
        let queue = EventQueue::attach(segment, client.event_queue_address)?;
        while let Some(event) = queue.recv(Duration::from_millis(100)).await? {
            println!("client C event: {:?}", event);
        }

        if let Some(handle) = handle {
            layer.disconnect(handle, client.app_index)?;
        }
    }

    layer.unbind(server.app_index, EndpointArg::uri("tcp://1.2.3.4/80"))?;
    for app in [server.app_index, rival.app_index, client.app_index] {
        layer.detach(app)?;
    }
    println!(
        "detached all: {} applications, {} segments left",
        layer.application_count(),
        layer.segments().names().len()
    );

    Ok(())
}
