//! # Demo 2: Tunnel legs over WebSocket
//!
//! Same topology as the echo demo, but both legs ride WebSocket streams:
//! the agent registers at `ws://.../connect?key=...` and pickup connections
//! arrive at a WebSocket pickup endpoint. Useful where the agent's network
//! only allows HTTP(S) egress.
//!
//! Demonstrates:
//! - Control connection over an accepted WebSocket
//! - WebSocket pickup legs (`serve_ws` + `ws_pickup_dial`)
//! - The line protocol riding Binary frames unchanged

use anyhow::Result;
use connman::ConnectionManager;
use revdial::http::target_query_param;
use revdial::{
    ws_accept_with_target, ws_connect, ws_pickup_dial, DialerRegistry, Listener, PickupHandler,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BASE_PATH: &str = "/revdial";
const AGENT_KEY: &str = "kiosk-4";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    println!("==========================================================");
    println!("  DEMO 2: Tunnel legs over WebSocket");
    println!("  Control and pickups both ride Binary frames");
    println!("==========================================================\n");

    // ── Public side ─────────────────────────────────────────────
    let registration = TcpListener::bind("127.0.0.1:0").await?;
    let registration_addr = registration.local_addr()?;
    let pickups = TcpListener::bind("127.0.0.1:0").await?;
    let pickup_addr = pickups.local_addr()?;

    let registry = DialerRegistry::new();
    let manager = ConnectionManager::new(registry.clone(), BASE_PATH);
    let handler = PickupHandler::new(registry.clone(), BASE_PATH);
    tokio::spawn(async move {
        let _ = handler.serve_ws(pickups).await;
    });
    println!("[Server] Registration endpoint: ws://{registration_addr}/connect");
    println!("[Server] Pickup endpoint:       ws://{pickup_addr}{BASE_PATH}");

    // ── NAT'd side ──────────────────────────────────────────────
    let register_url = format!("ws://{registration_addr}/connect?key={AGENT_KEY}");
    let pickup_url = format!("ws://{pickup_addr}");
    tokio::spawn(async move {
        if let Err(e) = run_agent(&register_url, &pickup_url).await {
            eprintln!("[Agent] failed: {e}");
        }
    });

    let (stream, peer) = registration.accept().await?;
    let (control, target) = ws_accept_with_target(stream).await?;
    let key = target_query_param(&target, "key").unwrap_or("unknown").to_string();
    manager.set(&key, Box::new(control)).await;
    println!("[Server] WebSocket control from {peer} registered as {key:?}");
    assert_eq!(manager.list().await, vec![AGENT_KEY.to_string()]);

    // ── Dial through the frame-hopping tunnel ───────────────────
    for i in 1..=2 {
        let mut conn = manager.dial(AGENT_KEY).await?;
        let payload = format!("frame hop #{i}");
        conn.write_all(payload.as_bytes()).await?;
        conn.flush().await?;
        let mut buf = vec![0u8; payload.len()];
        conn.read_exact(&mut buf).await?;
        assert_eq!(buf, payload.as_bytes());
        println!("[Server] Round-tripped {payload:?} over WebSocket legs");
    }

    let stats = manager.stats().await;
    assert_eq!(stats.active, 1);
    println!(
        "[Server] stats: active={} reconnecting={} pending_dials={} pending_keys={}",
        stats.active, stats.reconnecting, stats.pending_dials, stats.pending_keys
    );

    manager.remove(AGENT_KEY).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("\n  All assertions passed!\n");
    Ok(())
}

/// The NAT'd process: one outbound WebSocket, echoes over picked-up frames.
async fn run_agent(register_url: &str, pickup_url: &str) -> Result<()> {
    let control = ws_connect(register_url).await?;
    println!("[Agent] Control WebSocket established");

    let listener = Listener::new(Box::new(control), ws_pickup_dial(pickup_url));
    while let Ok(mut conn) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    println!("[Agent] Control closed; exiting");
    Ok(())
}
