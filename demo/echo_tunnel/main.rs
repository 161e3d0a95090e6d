//! # Demo 1: Echo service behind NAT
//!
//! **Topology**: one process playing both sides. The "agent" half owns a
//! trivial echo service and sits behind an imaginary NAT: it can dial out
//! but cannot be dialed. The "server" half is publicly reachable and opens
//! connections to the agent on demand.
//!
//! Demonstrates:
//! - Registration over a hijacked HTTP connection (`GET /register` + 200 OK)
//! - Keyed connection management (`set` / `dial` / `remove`)
//! - Pickup connections carrying payload over plain TCP
//! - Several tunneled connections riding one control connection
//! - Teardown via `remove`

use anyhow::Result;
use connman::{ConnectionManager, Error};
use revdial::http::{
    read_request_head, read_response_status, write_hijack_response, write_upgrade_request,
};
use revdial::{tcp_pickup_dial, DialerRegistry, Listener, PickupHandler};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const BASE_PATH: &str = "/revdial";
const AGENT_KEY: &str = "edge-7";

fn separator(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {title}");
    println!("{}\n", "=".repeat(60));
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    println!("==========================================================");
    println!("  DEMO 1: Echo service behind NAT");
    println!("  One control connection out, many data connections back");
    println!("==========================================================");

    // ── Public side: registration + pickup endpoints ────────────
    let registration = TcpListener::bind("127.0.0.1:0").await?;
    let registration_addr = registration.local_addr()?.to_string();
    let pickups = TcpListener::bind("127.0.0.1:0").await?;
    let pickup_addr = pickups.local_addr()?.to_string();

    let registry = DialerRegistry::new();
    let manager = ConnectionManager::new(registry.clone(), BASE_PATH);
    let handler = PickupHandler::new(registry.clone(), BASE_PATH);
    tokio::spawn(async move {
        let _ = handler.serve(pickups).await;
    });
    println!("[Server] Registration endpoint: http://{registration_addr}/register");
    println!("[Server] Pickup endpoint:       http://{pickup_addr}{BASE_PATH}");

    // ── NAT'd side: dial out once, then serve echoes ────────────
    separator("AGENT REGISTRATION: one outbound connection");

    let agent_registration = registration_addr.clone();
    let agent_pickups = pickup_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_agent(&agent_registration, &agent_pickups).await {
            eprintln!("[Agent] failed: {e}");
        }
    });

    // Accept the agent's registration and hand the hijacked connection over.
    let (mut control, peer) = registration.accept().await?;
    let head = read_request_head(&mut control).await?;
    assert_eq!(head.method, "GET");
    assert_eq!(head.path(), "/register");
    let key = head.query_param("key").unwrap_or("unknown").to_string();
    write_hijack_response(&mut control).await?;
    manager.set(&key, Box::new(control)).await;
    println!("[Server] Agent {key:?} registered from {peer}");
    assert_eq!(manager.list().await, vec![AGENT_KEY.to_string()]);

    // ── Server-initiated connections ────────────────────────────
    separator("DIALING BACK: three tunneled connections");

    for i in 1..=3 {
        let mut conn = manager.dial(AGENT_KEY).await?;
        let payload = format!("request #{i} through the tunnel");
        conn.write_all(payload.as_bytes()).await?;
        conn.flush().await?;
        let mut buf = vec![0u8; payload.len()];
        conn.read_exact(&mut buf).await?;
        assert_eq!(buf, payload.as_bytes());
        println!("[Server] Echoed {} bytes over connection #{i}", buf.len());
    }

    separator("INTERLEAVED: two connections open at once");

    let mut left = manager.dial(AGENT_KEY).await?;
    let mut right = manager.dial(AGENT_KEY).await?;
    right.write_all(b"interleaved: right").await?;
    left.write_all(b"interleaved: left").await?;
    let mut buf = [0u8; 18];
    right.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"interleaved: right");
    let mut buf = [0u8; 17];
    left.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"interleaved: left");
    println!("[Server] Both connections served, out of order");

    let stats = manager.stats().await;
    assert_eq!(stats.active, 1);
    println!(
        "[Server] stats: active={} reconnecting={} pending_dials={} pending_keys={}",
        stats.active, stats.reconnecting, stats.pending_dials, stats.pending_keys
    );

    // ── Teardown ────────────────────────────────────────────────
    separator("TEARDOWN: remove closes the tunnel");

    manager.remove(AGENT_KEY).await;
    let err = manager.dial(AGENT_KEY).await.unwrap_err();
    assert!(matches!(err, Error::NoConnection(_)));
    println!("[Server] Dial after remove fails: {err}");

    // Give the agent a beat to notice the control connection closing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("\n  All assertions passed!\n");
    Ok(())
}

/// The NAT'd process: registers once, then answers pickups with an echo loop.
async fn run_agent(registration_addr: &str, pickup_addr: &str) -> Result<()> {
    let mut control = TcpStream::connect(registration_addr).await?;
    write_upgrade_request(
        &mut control,
        registration_addr,
        &format!("/register?key={AGENT_KEY}"),
    )
    .await?;
    let status = read_response_status(&mut control).await?;
    anyhow::ensure!(status == 200, "registration rejected with status {status}");
    println!("[Agent] Registered as {AGENT_KEY:?}; waiting for dials");

    let listener = Listener::new(Box::new(control), tcp_pickup_dial(pickup_addr));
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
    println!("[Agent] Control connection closed; shutting down");
    Ok(())
}
