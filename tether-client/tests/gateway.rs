mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tether_client::{
    AdmissionControl, Category, Clock, ConnectionState, Denial, Gateway, GatewayError, ManualClock,
    ProviderLink, QuotaConfig, ReconnectConfig, TransportConfig,
};
use tokio::sync::mpsc;

use common::{Peer, pair, quick_config};

/// A link whose every dial creates a fresh in-memory pipe; the far ends
/// come out of the returned receiver.
fn piped_link(config: TransportConfig) -> (ProviderLink, mpsc::UnboundedReceiver<Peer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = ProviderLink::with_connector("pipe", move || {
        let (transport, peer) = pair(&config);
        let _ = tx.send(peer);
        Box::pin(async move { Ok(transport) })
    });
    (link, rx)
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        heartbeat_interval: Duration::from_secs(3600),
        base_backoff:       Duration::from_millis(10),
        max_backoff:        Duration::from_millis(50),
        ..ReconnectConfig::default()
    }
}

fn steady_quota() -> QuotaConfig {
    QuotaConfig { jitter: false, min_message_interval: Duration::ZERO, utc_offset_secs: Some(0), ..QuotaConfig::default() }
}

fn gateway(quota: QuotaConfig) -> (Gateway, mpsc::UnboundedReceiver<Peer>) {
    let (link, peers) = piped_link(quick_config());
    let reconnector = link.supervisor().config(fast_reconnect()).build().unwrap();
    (Gateway::new("pipe", link, reconnector, AdmissionControl::new(quota)), peers)
}

#[tokio::test]
async fn calls_are_refused_before_start() {
    let (gw, _peers) = gateway(steady_quota());
    assert!(matches!(gw.send_message("sendText", json!({})).await, Err(GatewayError::NotConnected)));
    assert_eq!(gw.admission().stats().messages, 0, "refused calls consume no quota");
}

#[tokio::test]
async fn quota_denial_is_not_an_io_error() {
    let (gw, mut peers) = gateway(QuotaConfig { max_messages_per_day: 1, ..steady_quota() });
    gw.start().await.unwrap();
    peers.recv().await.unwrap().echo_methods();

    assert_eq!(gw.send_message("sendText", json!({"text": "one"})).await.unwrap(), json!("sendText"));
    match gw.send_message("sendText", json!({"text": "two"})).await {
        Err(GatewayError::Denied(Denial::DailyLimit { category: Category::Messages, limit: 1 })) => {}
        other => panic!("expected a daily-limit denial, got {other:?}"),
    }
    assert!(gw.is_connected());
    gw.stop().await;
}

#[tokio::test]
async fn each_operation_draws_from_its_own_quota() {
    let quota = QuotaConfig { max_group_ops_per_day: 1, max_friend_ops_per_day: 1, ..steady_quota() };
    let (gw, mut peers) = gateway(quota);
    gw.start().await.unwrap();
    peers.recv().await.unwrap().echo_methods();

    gw.send_media("sendImage", json!({})).await.unwrap();
    gw.group_operation("createGroup", json!({})).await.unwrap();
    gw.friend_operation("addFriend", json!({})).await.unwrap();
    assert!(gw.group_operation("createGroup", json!({})).await.unwrap_err().is_denial());
    assert!(gw.friend_operation("addFriend", json!({})).await.unwrap_err().is_denial());

    let stats = gw.admission().stats();
    assert_eq!((stats.messages, stats.media, stats.groups, stats.friends), (1, 1, 1, 1));
    gw.stop().await;
}

#[tokio::test]
async fn silence_period_blocks_calls_on_a_live_link() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let quota = QuotaConfig {
        account_created_at: Some(clock.now() - chrono::TimeDelta::hours(24)),
        silence_days: 3,
        ..steady_quota()
    };
    let (link, mut peers) = piped_link(quick_config());
    let reconnector = link.supervisor().config(fast_reconnect()).build().unwrap();
    let gw = Gateway::new("pipe", link, reconnector, AdmissionControl::with_clock(quota, clock.clone()));
    gw.start().await.unwrap();
    peers.recv().await.unwrap().echo_methods();

    assert!(matches!(
        gw.send_message("sendText", json!({})).await,
        Err(GatewayError::Denied(Denial::SilencePeriod { .. }))
    ));
    clock.advance(chrono::TimeDelta::days(3));
    assert!(gw.send_message("sendText", json!({})).await.is_ok());
    gw.stop().await;
}

#[tokio::test]
async fn messages_are_paced() {
    let quota = QuotaConfig { min_message_interval: Duration::from_millis(150), ..steady_quota() };
    let (gw, mut peers) = gateway(quota);
    gw.start().await.unwrap();
    peers.recv().await.unwrap().echo_methods();

    gw.send_message("sendText", Value::Null).await.unwrap();
    let started = Instant::now();
    gw.send_message("sendText", Value::Null).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100), "second message went out after {:?}", started.elapsed());
    gw.stop().await;
}

#[tokio::test]
async fn lost_peer_is_redialed() {
    let (gw, mut peers) = gateway(steady_quota());
    gw.start().await.unwrap();
    assert_eq!(gw.reconnector().state(), ConnectionState::Connected);

    let first = peers.recv().await.unwrap();
    drop(first);

    let second = tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("no redial")
        .unwrap();
    second.echo_methods();

    for _ in 0..500 {
        if gw.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(gw.is_connected());
    assert_eq!(gw.reconnector().stats().reconnect_count, 1);
    assert_eq!(gw.send_message("sendText", json!({})).await.unwrap(), json!("sendText"));
    gw.stop().await;
}

#[tokio::test]
async fn stop_is_final() {
    let (gw, mut peers) = gateway(steady_quota());
    gw.start().await.unwrap();
    let peer = peers.recv().await.unwrap();
    gw.stop().await;
    gw.stop().await;

    assert_eq!(gw.reconnector().state(), ConnectionState::Stopped);
    assert!(matches!(gw.send_message("sendText", json!({})).await, Err(GatewayError::NotConnected)));

    // Closing on stop is not treated as a failure: nothing redials.
    drop(peer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peers.try_recv().is_err());
}

#[tokio::test]
async fn superseded_connection_closing_is_ignored() {
    let downs = Arc::new(AtomicUsize::new(0));
    let (link, mut peers) = piped_link(quick_config());
    let reconnector = link
        .supervisor()
        .config(fast_reconnect())
        .on_disconnected({ let downs = Arc::clone(&downs); move || { downs.fetch_add(1, Ordering::SeqCst); } })
        .build()
        .unwrap();
    let gw = Gateway::new("pipe", link, reconnector, AdmissionControl::new(steady_quota()));
    gw.start().await.unwrap();

    // Two manual redials: generations 2 and 3 replace generation 1.
    let first = peers.recv().await.unwrap();
    gw.link().connect().await.unwrap();
    let second = peers.recv().await.unwrap();
    gw.link().connect().await.unwrap();
    let third = peers.recv().await.unwrap();
    third.echo_methods();

    drop(first);
    drop(second);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(downs.load(Ordering::SeqCst), 0);
    assert_eq!(gw.reconnector().state(), ConnectionState::Connected);
    assert!(peers.try_recv().is_err(), "a stale close triggered a redial");
    assert_eq!(gw.send_message("sendText", json!({})).await.unwrap(), json!("sendText"));
    gw.stop().await;
}
