//! Manager behavior over real control connections and a TCP pickup endpoint.

use connman::{ConnectionManager, Error, MAX_PENDING_DIALS};
use revdial::{
    pickup_via, tcp_pickup_dial, Conn, DialerRegistry, Listener, ListenerError, PickupDial,
    PickupHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const BASE_PATH: &str = "/revdial";

fn pair() -> (Conn, Conn) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(a), Box::new(b))
}

async fn pickup_endpoint(registry: &DialerRegistry) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = PickupHandler::new(registry.clone(), BASE_PATH);
    tokio::spawn(async move {
        let _ = handler.serve(listener).await;
    });
    addr
}

fn spawn_echo(listener: Listener) -> Arc<Listener> {
    let listener = Arc::new(listener);
    let accept_side = Arc::clone(&listener);
    tokio::spawn(async move {
        while let Ok(mut conn) = accept_side.accept().await {
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
    });
    listener
}

async fn echo_check(conn: &mut Conn, payload: &[u8]) {
    conn.write_all(payload).await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

/// TCP pickup that also counts how many pickups this agent served.
fn counting_dial_fn(addr: String, count: Arc<AtomicUsize>) -> impl PickupDial {
    move |conn_path: String| {
        let addr = addr.clone();
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            let stream = TcpStream::connect(&addr).await?;
            pickup_via(stream, &addr, &conn_path).await
        }
    }
}

async fn wait_until_reconnecting(manager: &ConnectionManager, key: &str) {
    timeout(Duration::from_secs(2), async {
        loop {
            if manager.list_reconnecting().await.iter().any(|k| k == key) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("key never entered its grace period")
}

async fn wait_until_parked(manager: &ConnectionManager, n: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            if manager.stats().await.pending_dials >= n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dials never parked")
}

#[tokio::test]
async fn set_then_dial_roundtrip() {
    let registry = DialerRegistry::new();
    let addr = pickup_endpoint(&registry).await;
    let manager = ConnectionManager::new(registry.clone(), BASE_PATH);

    let (public, natted) = pair();
    manager.set("agent-1", public).await;
    let _agent = spawn_echo(Listener::new(natted, tcp_pickup_dial(addr)));

    let mut conn = manager.dial("agent-1").await.unwrap();
    echo_check(&mut conn, b"hello through the manager").await;

    assert_eq!(manager.list().await, vec!["agent-1".to_string()]);
    let stats = manager.stats().await;
    assert_eq!(stats.active, 1);
    assert_eq!(stats.reconnecting, 0);
    assert_eq!(stats.pending_dials, 0);
    assert_eq!(stats.pending_keys, 0);
}

#[tokio::test]
async fn unknown_key_fails_fast() {
    let manager = ConnectionManager::new(DialerRegistry::new(), BASE_PATH);
    let err = manager.dial("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NoConnection(_)));
}

#[tokio::test]
async fn replacement_closes_the_previous_dialer() {
    let registry = DialerRegistry::new();
    let addr = pickup_endpoint(&registry).await;
    let manager = ConnectionManager::new(registry.clone(), BASE_PATH);

    let first_pickups = Arc::new(AtomicUsize::new(0));
    let (public1, natted1) = pair();
    manager.set("agent", public1).await;
    let agent1 = spawn_echo(Listener::new(
        natted1,
        counting_dial_fn(addr.clone(), Arc::clone(&first_pickups)),
    ));

    let mut conn = manager.dial("agent").await.unwrap();
    echo_check(&mut conn, b"first agent").await;
    drop(conn);
    assert_eq!(first_pickups.load(Ordering::SeqCst), 1);

    // Same key reconnects; the old control connection must be shut down.
    let second_pickups = Arc::new(AtomicUsize::new(0));
    let (public2, natted2) = pair();
    manager.set("agent", public2).await;
    let _agent2 = spawn_echo(Listener::new(
        natted2,
        counting_dial_fn(addr.clone(), Arc::clone(&second_pickups)),
    ));

    let res = timeout(Duration::from_secs(2), agent1.accept()).await.unwrap();
    assert!(matches!(res, Err(ListenerError::Closed)));

    assert_eq!(registry.len().await, 1);
    assert_eq!(manager.list().await, vec!["agent".to_string()]);
    assert_eq!(manager.stats().await.reconnecting, 0);

    let mut conn = manager.dial("agent").await.unwrap();
    echo_check(&mut conn, b"second agent").await;
    assert_eq!(second_pickups.load(Ordering::SeqCst), 1);
    assert_eq!(first_pickups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_within_grace_unparks_dials() {
    let registry = DialerRegistry::new();
    let addr = pickup_endpoint(&registry).await;
    let manager =
        ConnectionManager::with_grace_period(registry.clone(), BASE_PATH, Duration::from_secs(5));

    let (public1, natted1) = pair();
    manager.set("agent", public1).await;
    let agent1 = spawn_echo(Listener::new(natted1, tcp_pickup_dial(addr.clone())));

    let mut conn = manager.dial("agent").await.unwrap();
    echo_check(&mut conn, b"before the drop").await;
    drop(conn);

    // The peer goes away; dials now park instead of failing.
    agent1.close().await;
    wait_until_reconnecting(&manager, "agent").await;

    let m = manager.clone();
    let parked = tokio::spawn(async move { m.dial("agent").await });
    wait_until_parked(&manager, 1).await;

    // It comes back under the same key.
    let (public2, natted2) = pair();
    let _agent2 = spawn_echo(Listener::new(natted2, tcp_pickup_dial(addr.clone())));
    manager.set("agent", public2).await;

    let mut conn = timeout(Duration::from_secs(2), parked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    echo_check(&mut conn, b"after reconnect").await;

    let stats = manager.stats().await;
    assert_eq!(stats.active, 1);
    assert_eq!(stats.reconnecting, 0);
    assert_eq!(stats.pending_dials, 0);
    assert_eq!(stats.pending_keys, 0);
}

#[tokio::test]
async fn grace_expiry_fails_parked_and_late_dials() {
    let registry = DialerRegistry::new();
    let addr = pickup_endpoint(&registry).await;
    let manager = ConnectionManager::with_grace_period(
        registry.clone(),
        BASE_PATH,
        Duration::from_millis(300),
    );

    let (public, natted) = pair();
    manager.set("agent", public).await;
    let agent = spawn_echo(Listener::new(natted, tcp_pickup_dial(addr)));

    agent.close().await;
    wait_until_reconnecting(&manager, "agent").await;

    let m = manager.clone();
    let parked = tokio::spawn(async move { m.dial("agent").await });
    let res = timeout(Duration::from_secs(2), parked).await.unwrap().unwrap();
    assert!(matches!(res, Err(Error::ReconnectTimeout(_))));

    // The first late dial reaps the expired entry, the next sees nothing.
    let err = manager.dial("agent").await.unwrap_err();
    assert!(matches!(err, Error::ReconnectTimeout(_)));
    let err = manager.dial("agent").await.unwrap_err();
    assert!(matches!(err, Error::NoConnection(_)));
    assert_eq!(manager.stats().await.reconnecting, 0);
}

#[tokio::test]
async fn pending_dials_are_capped() {
    let registry = DialerRegistry::new();
    let manager =
        ConnectionManager::with_grace_period(registry.clone(), BASE_PATH, Duration::from_secs(60));

    let (public, natted) = pair();
    manager.set("agent", public).await;
    drop(natted);
    wait_until_reconnecting(&manager, "agent").await;

    let mut handles = Vec::new();
    for _ in 0..MAX_PENDING_DIALS {
        let m = manager.clone();
        handles.push(tokio::spawn(async move { m.dial("agent").await }));
    }
    wait_until_parked(&manager, MAX_PENDING_DIALS).await;

    let err = manager.dial("agent").await.unwrap_err();
    assert!(matches!(err, Error::TooManyPendingDials(_)));
    let stats = manager.stats().await;
    assert_eq!(stats.pending_dials, MAX_PENDING_DIALS);
    assert_eq!(stats.pending_keys, 1);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn remove_closes_and_forgets() {
    let registry = DialerRegistry::new();
    let addr = pickup_endpoint(&registry).await;
    let manager = ConnectionManager::new(registry.clone(), BASE_PATH);

    let (public, natted) = pair();
    manager.set("agent", public).await;
    let agent = spawn_echo(Listener::new(natted, tcp_pickup_dial(addr)));

    let mut conn = manager.dial("agent").await.unwrap();
    echo_check(&mut conn, b"still here").await;
    drop(conn);

    manager.remove("agent").await;

    // No grace period after an explicit remove.
    let err = manager.dial("agent").await.unwrap_err();
    assert!(matches!(err, Error::NoConnection(_)));

    let res = timeout(Duration::from_secs(2), agent.accept()).await.unwrap();
    assert!(matches!(res, Err(ListenerError::Closed)));

    assert!(registry.is_empty().await);
    let stats = manager.stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.reconnecting, 0);
    assert_eq!(stats.pending_dials, 0);
    assert_eq!(stats.pending_keys, 0);
}
