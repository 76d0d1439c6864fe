//! Relay Loopback Demo
//!
//! Runs a host and a set of clients against the in-process loopback relay.
//! Clients ping the host on a fixed cadence and the host echoes every packet
//! back, all driven from a single-threaded tick loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use relay_transport::net::events::RELIABLE_CHANNEL;
use relay_transport::net::slots::PeerId;
use relay_transport::{
    LoopbackRelay, RelaySessionDescriptor, RelayTransport, Transport, TransportConfig,
    TransportEvent, VERSION,
};

/// Ticks between client pings
const PING_INTERVAL_TICKS: u64 = 30;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Relay Loopback Demo v{}", VERSION);

    // Load configuration
    let config = TransportConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let relay = LoopbackRelay::new();

    // Host side
    let allocation = relay.create_allocation(config.max_connections);
    let join_code = relay.join_code(&allocation);
    info!("Host allocation {} (join code {})", allocation.allocation_id, join_code);

    let mut host = RelayTransport::with_config(relay.clone(), &config);
    host.configure(RelaySessionDescriptor::from_allocation(
        &allocation,
        config.secure,
    )?);

    let inbox: Rc<RefCell<Vec<(PeerId, Bytes)>>> = Rc::new(RefCell::new(Vec::new()));
    let host_inbox = inbox.clone();
    host.subscribe(move |event: &TransportEvent| match event {
        TransportEvent::ServerConnected { peer, address } => {
            info!("Peer {} connected from {}", peer, address);
        }
        TransportEvent::ServerDataReceived { peer, payload, .. } => {
            host_inbox.borrow_mut().push((*peer, payload.clone()));
        }
        TransportEvent::ServerDisconnected { peer } => {
            info!("Peer {} disconnected", peer);
        }
        _ => {}
    });
    host.server_start()?;
    info!("Host listening on {}", host.server_uri());

    // Client side
    let echoes = Rc::new(Cell::new(0u64));
    let mut clients = Vec::with_capacity(config.loopback.clients);
    for index in 0..config.loopback.clients {
        let join = relay.join_allocation(&join_code)?;
        let mut client = RelayTransport::with_config(relay.clone(), &config);
        client.configure(RelaySessionDescriptor::from_join_allocation(
            &join,
            config.secure,
        )?);

        let client_echoes = echoes.clone();
        client.subscribe(move |event: &TransportEvent| match event {
            TransportEvent::ClientConnected => info!("Client {} connected", index),
            TransportEvent::ClientDataReceived { .. } => {
                client_echoes.set(client_echoes.get() + 1);
            }
            TransportEvent::ClientDisconnected => warn!("Client {} lost its connection", index),
            _ => {}
        });

        client.client_connect(&join_code)?;
        clients.push(client);
    }

    info!(
        "Running {} clients at {}ms per tick",
        clients.len(),
        config.tick_rate_ms
    );

    let mut ticker = interval(Duration::from_millis(config.tick_rate_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        host.poll();
        for client in clients.iter_mut() {
            client.poll();
        }

        // Echo everything the host received this tick
        let received: Vec<_> = inbox.borrow_mut().drain(..).collect();
        for (peer, payload) in received {
            host.server_send(peer, &payload, RELIABLE_CHANNEL);
        }

        if tick % PING_INTERVAL_TICKS == 0 {
            for (index, client) in clients.iter_mut().enumerate() {
                if client.client_connected() {
                    let ping = format!("ping {} {}", index, tick);
                    client.client_send(ping.as_bytes(), RELIABLE_CHANNEL);
                }
            }
        }

        tick += 1;
        if config.loopback.run_ticks > 0 && tick >= config.loopback.run_ticks {
            info!("Reached {} ticks", tick);
            break;
        }
    }

    info!("Shutting down...");

    for client in clients.iter_mut() {
        client.shutdown();
    }
    let stats = host.stats();
    host.shutdown();

    info!(
        "Host sent {} packets ({} bytes), received {} packets ({} bytes), dropped {}",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.dropped_sends
    );
    info!("Clients received {} echoes", echoes.get());
    info!("Shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relay_transport=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
