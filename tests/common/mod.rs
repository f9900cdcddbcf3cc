//! Shared helpers for the loopback integration tests.
//!
//! Each test brings up real nodes on 127.0.0.1 with OS-assigned ports.
//! Peers learn about each other through directed announcements (broadcast
//! datagrams are unreliable inside CI sandboxes); everything after discovery
//! exercises the real UDP/TCP paths.

#![allow(dead_code)]

use landrop::{Config, Controller};
use std::future::Future;
use std::time::Duration;

/// Node with OS-assigned ports, suitable for many instances on one host.
pub fn test_config() -> Config {
    Config {
        discovery_port: 0,
        transfer_port: 0,
        ..Config::default()
    }
}

pub async fn start_node(config: Config) -> Controller {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Controller::start(config).await.expect("node starts")
}

/// Make two nodes mutually visible via directed announcements.
pub async fn link(a: &Controller, b: &Controller) {
    for _ in 0..50 {
        a.announce_to("127.0.0.1", b.discovery_port())
            .await
            .expect("announce a->b");
        b.announce_to("127.0.0.1", a.discovery_port())
            .await
            .expect("announce b->a");

        let a_sees_b = a.list_peers().iter().any(|p| p.peer_id == b.peer_id());
        let b_sees_a = b.list_peers().iter().any(|p| p.peer_id == a.peer_id());
        if a_sees_b && b_sees_a {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("nodes failed to discover each other");
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, predicate: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
