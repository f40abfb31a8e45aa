//! WebSocket session (C8): a single logical subscription stream over one
//! or two live sockets. State machine is `connecting -> welcomed ->
//! reconnecting -> closed` (spec.md §4.8); realized here as a driver task
//! per session plus a `Mutex`-guarded shared state block, following the
//! teacher's single read-loop-per-socket shape in `twitch.rs` generalized
//! to dual-socket graceful handoff and per-subscription routing.

pub mod protocol;
pub mod transport;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result, RevocationReason};
use crate::helix::HelixClient;
use crate::oauth::provider::TokenSource;
use protocol::{ServerMessage, SessionInfo};
use transport::{Dialer, Transport};

/// Reconnect budget: at most this many ungraceful-disconnect attempts per
/// minute before the session gives up and closes (spec.md §7).
const MAX_DISCONNECT_ATTEMPTS: u32 = 10;
const WELCOME_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum RoutedEvent {
    Notification(Value),
    Revoked(RevocationReason),
}

struct ActiveSub {
    event_type: String,
    version: String,
    condition: Value,
    sender: mpsc::Sender<RoutedEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connecting,
    Welcomed,
    Closed,
}

struct State {
    status: Status,
    session_id: Option<String>,
    keepalive_timeout: Duration,
    seen: VecDeque<String>,
    seen_set: HashSet<String>,
    routes: HashMap<String, Arc<ActiveSub>>,
}

struct Inner {
    dialer: Arc<dyn Dialer>,
    helix: Arc<HelixClient>,
    token: Arc<dyn TokenSource>,
    welcome_url: String,
    seen_capacity: usize,
    keepalive_slack: Duration,
    state: Mutex<State>,
    refcount: AtomicUsize,
    needs_recreate: AtomicBool,
    cancel: CancellationToken,
}

/// A live EventSub WebSocket session, shared across every [`crate::subscription::Subscription`]
/// created from the same caller identity.
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Dials `welcome_url` and blocks until the first `session_welcome`
    /// arrives (or the attempt fails). The returned session's driver loop
    /// keeps running in the background until `shutdown()` or cancellation.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        helix: Arc<HelixClient>,
        token: Arc<dyn TokenSource>,
        welcome_url: impl Into<String>,
        seen_capacity: usize,
        keepalive_slack: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Session>> {
        let inner = Arc::new(Inner {
            dialer,
            helix,
            token,
            welcome_url: welcome_url.into(),
            seen_capacity: seen_capacity.max(64),
            keepalive_slack,
            state: Mutex::new(State {
                status: Status::Connecting,
                session_id: None,
                keepalive_timeout: Duration::from_secs(10),
                seen: VecDeque::new(),
                seen_set: HashSet::new(),
                routes: HashMap::new(),
            }),
            refcount: AtomicUsize::new(0),
            needs_recreate: AtomicBool::new(false),
            cancel,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_driver(Arc::clone(&inner), Some(ready_tx)));

        ready_rx
            .await
            .map_err(|_| Error::Transport("session driver terminated before welcome".into()))??;

        Ok(Arc::new(Session { inner }))
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.state.lock().await.session_id.clone()
    }

    pub async fn register(
        &self,
        subscription_id: String,
        event_type: String,
        version: String,
        condition: Value,
        sender: mpsc::Sender<RoutedEvent>,
    ) {
        let sub = Arc::new(ActiveSub {
            event_type,
            version,
            condition,
            sender,
        });
        self.inner.state.lock().await.routes.insert(subscription_id, sub);
    }

    pub async fn unregister(&self, subscription_id: &str) {
        self.inner.state.lock().await.routes.remove(subscription_id);
    }

    /// Returns the post-increment reference count.
    pub fn incr_ref(&self) -> usize {
        self.inner.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the post-decrement reference count.
    pub fn decr_ref(&self) -> usize {
        self.inner.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

enum ConnectionOutcome {
    GracefulReconnect(Box<dyn Transport>),
    Disconnected,
    Closed,
}

async fn run_driver(inner: Arc<Inner>, mut ready_tx: Option<oneshot::Sender<Result<()>>>) {
    let mut next_url = inner.welcome_url.clone();
    let mut carried: Option<Box<dyn Transport>> = None;
    let mut backoff = Backoff::helix_default();
    let mut disconnect_attempts = 0u32;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let transport = match carried.take() {
            Some(t) => t,
            None => match inner.dialer.dial(&next_url).await {
                Ok(t) => t,
                Err(e) => {
                    let is_initial_attempt = ready_tx.is_some();
                    fail_initial(&mut ready_tx, e);
                    if is_initial_attempt {
                        // initial connect already failed and reported; stop.
                        return;
                    }
                    disconnect_attempts += 1;
                    if disconnect_attempts > MAX_DISCONNECT_ATTEMPTS {
                        error!("reconnect budget exhausted, closing session");
                        break;
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            },
        };

        match run_single_connection(&inner, transport, &mut ready_tx).await {
            ConnectionOutcome::GracefulReconnect(new_transport) => {
                carried = Some(new_transport);
                backoff = Backoff::helix_default();
                disconnect_attempts = 0;
            }
            ConnectionOutcome::Disconnected => {
                disconnect_attempts += 1;
                if disconnect_attempts > MAX_DISCONNECT_ATTEMPTS {
                    error!("reconnect budget exhausted, closing session");
                    break;
                }
                tokio::time::sleep(backoff.next_delay()).await;
                next_url = inner.welcome_url.clone();
            }
            ConnectionOutcome::Closed => break,
        }
    }

    let mut state = inner.state.lock().await;
    state.status = Status::Closed;
    state.routes.clear();
}

fn fail_initial(ready_tx: &mut Option<oneshot::Sender<Result<()>>>, err: Error) {
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(err));
    } else {
        warn!(error = ?err, "reconnect attempt failed");
    }
}

async fn run_single_connection(
    inner: &Arc<Inner>,
    mut transport: Box<dyn Transport>,
    ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
) -> ConnectionOutcome {
    let first = match tokio::time::timeout(WELCOME_TIMEOUT, transport.recv()).await {
        Ok(Ok(Some(text))) => text,
        Ok(Ok(None)) => {
            fail_initial(ready_tx, Error::Transport("socket closed before welcome".into()));
            return ConnectionOutcome::Disconnected;
        }
        Ok(Err(e)) => {
            fail_initial(ready_tx, e);
            return ConnectionOutcome::Disconnected;
        }
        Err(_) => {
            fail_initial(ready_tx, Error::Transport("timed out waiting for welcome".into()));
            return ConnectionOutcome::Disconnected;
        }
    };

    let (welcome_id, welcome_msg) = match protocol::parse(&first) {
        Ok(v) => v,
        Err(e) => {
            fail_initial(ready_tx, e);
            return ConnectionOutcome::Disconnected;
        }
    };
    let info = match welcome_msg {
        ServerMessage::Welcome(info) => info,
        _ => {
            fail_initial(
                ready_tx,
                Error::Protocol("expected session_welcome as first message".into()),
            );
            return ConnectionOutcome::Disconnected;
        }
    };

    {
        let mut state = inner.state.lock().await;
        remember_seen(&mut state, inner.seen_capacity, welcome_id);
        state.session_id = Some(info.id.clone());
        state.status = Status::Welcomed;
        state.keepalive_timeout = Duration::from_secs(info.keepalive_timeout_seconds.unwrap_or(10));
    }
    info!(session_id = %info.id, "eventsub session welcome");

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    } else if inner.needs_recreate.swap(false, Ordering::SeqCst) {
        recreate_subscriptions(inner).await;
    }

    loop {
        let watchdog = {
            let timeout = inner.state.lock().await.keepalive_timeout;
            timeout.mul_f64(1.5) + inner.keepalive_slack
        };

        tokio::select! {
            _ = inner.cancel.cancelled() => {
                transport.close().await;
                return ConnectionOutcome::Closed;
            }
            _ = tokio::time::sleep(watchdog) => {
                warn!("keepalive watchdog fired, will reconnect");
                transport.close().await;
                inner.needs_recreate.store(true, Ordering::SeqCst);
                return ConnectionOutcome::Disconnected;
            }
            msg = transport.recv() => {
                match msg {
                    Ok(Some(text)) => match protocol::parse(&text) {
                        Ok((id, ServerMessage::Reconnect(reconnect_info))) => {
                            let Some(reconnect_url) = reconnect_info.reconnect_url else {
                                warn!("session_reconnect without reconnect_url");
                                transport.close().await;
                                inner.needs_recreate.store(true, Ordering::SeqCst);
                                return ConnectionOutcome::Disconnected;
                            };
                            {
                                let mut state = inner.state.lock().await;
                                remember_seen(&mut state, inner.seen_capacity, id);
                            }
                            info!(%reconnect_url, "received session_reconnect");
                            match graceful_reconnect(inner, &mut transport, &reconnect_url).await {
                                Ok((new_transport, new_info, drained)) => {
                                    transport.close().await;
                                    for (did, dmsg) in drained {
                                        dispatch(inner, did, dmsg).await;
                                    }
                                    {
                                        let mut state = inner.state.lock().await;
                                        state.session_id = Some(new_info.id.clone());
                                        state.keepalive_timeout =
                                            Duration::from_secs(new_info.keepalive_timeout_seconds.unwrap_or(10));
                                    }
                                    info!(session_id = %new_info.id, "graceful reconnect complete");
                                    return ConnectionOutcome::GracefulReconnect(new_transport);
                                }
                                Err(e) => {
                                    warn!(error = ?e, "graceful reconnect failed");
                                    transport.close().await;
                                    inner.needs_recreate.store(true, Ordering::SeqCst);
                                    return ConnectionOutcome::Disconnected;
                                }
                            }
                        }
                        Ok((id, msg)) => {
                            dispatch(inner, id, msg).await;
                        }
                        Err(e) => {
                            warn!(error = ?e, "failed to parse websocket frame");
                        }
                    },
                    Ok(None) => {
                        info!("websocket closed");
                        inner.needs_recreate.store(true, Ordering::SeqCst);
                        return ConnectionOutcome::Disconnected;
                    }
                    Err(e) => {
                        warn!(error = ?e, "websocket read error");
                        inner.needs_recreate.store(true, Ordering::SeqCst);
                        return ConnectionOutcome::Disconnected;
                    }
                }
            }
        }
    }
}

/// Dials `reconnect_url` while `old` stays open, waiting for the new
/// socket's welcome. Messages arriving on `old` meanwhile are parsed and
/// returned for dispatch after the swap, so dedup still catches a
/// duplicate delivered on both sockets (spec.md §8 property 4).
async fn graceful_reconnect(
    inner: &Arc<Inner>,
    old: &mut Box<dyn Transport>,
    reconnect_url: &str,
) -> Result<(Box<dyn Transport>, SessionInfo, Vec<(String, ServerMessage)>)> {
    let mut new_transport = inner.dialer.dial(reconnect_url).await?;
    let mut drained = Vec::new();

    let welcomed = tokio::time::timeout(WELCOME_TIMEOUT, async {
        loop {
            tokio::select! {
                old_msg = old.recv() => {
                    match old_msg {
                        Ok(Some(text)) => match protocol::parse(&text) {
                            Ok(parsed) => drained.push(parsed),
                            Err(e) => warn!(error = ?e, "failed to parse frame drained from old socket"),
                        },
                        Ok(None) => {}
                        Err(e) => warn!(error = ?e, "old socket read error during handoff"),
                    }
                }
                new_msg = new_transport.recv() => {
                    match new_msg? {
                        Some(text) => {
                            let (_, msg) = protocol::parse(&text)?;
                            if let ServerMessage::Welcome(welcome_info) = msg {
                                return Ok(welcome_info);
                            }
                        }
                        None => return Err(Error::Transport("new socket closed before welcome".into())),
                    }
                }
            }
        }
    })
    .await;

    match welcomed {
        Ok(Ok(welcome_info)) => Ok((new_transport, welcome_info, drained)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Transport(
            "timed out waiting for welcome on reconnect socket".into(),
        )),
    }
}

fn remember_seen(state: &mut State, capacity: usize, message_id: String) {
    state.seen_set.insert(message_id.clone());
    state.seen.push_back(message_id);
    while state.seen.len() > capacity {
        if let Some(oldest) = state.seen.pop_front() {
            state.seen_set.remove(&oldest);
        }
    }
}

async fn dispatch(inner: &Arc<Inner>, message_id: String, msg: ServerMessage) {
    let first_seen = {
        let mut state = inner.state.lock().await;
        if state.seen_set.contains(&message_id) {
            false
        } else {
            remember_seen(&mut state, inner.seen_capacity, message_id.clone());
            true
        }
    };
    if !first_seen {
        debug!(message_id = %message_id, "duplicate websocket message dropped");
        return;
    }

    match msg {
        ServerMessage::Keepalive => {
            debug!("keepalive");
        }
        ServerMessage::Notification(n) => {
            let route = { inner.state.lock().await.routes.get(&n.subscription.id).cloned() };
            match route {
                Some(sub) => {
                    if sub.sender.send(RoutedEvent::Notification(n.event)).await.is_err() {
                        debug!(subscription_id = %n.subscription.id, "notification receiver dropped");
                    }
                }
                None => {
                    debug!(subscription_id = %n.subscription.id, "notification for unknown subscription id, dropping");
                }
            }
        }
        ServerMessage::Revocation(r) => {
            let route = { inner.state.lock().await.routes.remove(&r.subscription.id) };
            if let Some(sub) = route {
                let reason = RevocationReason::parse(&r.subscription.status);
                let _ = sub.sender.send(RoutedEvent::Revoked(reason)).await;
            }
        }
        ServerMessage::Welcome(_) | ServerMessage::Reconnect(_) => {
            debug!("unexpected welcome/reconnect frame outside handshake, ignoring");
        }
        ServerMessage::Unknown(t) => {
            debug!(message_type = %t, "unhandled websocket message type");
        }
    }
}

async fn recreate_subscriptions(inner: &Arc<Inner>) {
    let session_id = { inner.state.lock().await.session_id.clone() };
    let Some(session_id) = session_id else {
        return;
    };
    let subs: Vec<Arc<ActiveSub>> = { inner.state.lock().await.routes.values().cloned().collect() };
    if subs.is_empty() {
        return;
    }

    let mut recreated = HashMap::new();
    for sub in subs {
        let body = json!({
            "type": sub.event_type,
            "version": sub.version,
            "condition": sub.condition,
            "transport": { "method": "websocket", "session_id": session_id },
        });
        let result = inner
            .helix
            .call(
                "create_eventsub_subscription",
                None,
                Some(body),
                inner.token.as_ref(),
                &inner.cancel,
            )
            .await;
        match result {
            Ok(resp) => {
                let new_id = resp
                    .get("data")
                    .and_then(|d| d.get(0))
                    .and_then(|s| s.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match new_id {
                    Some(new_id) => {
                        info!(event_type = %sub.event_type, new_subscription_id = %new_id, "recreated subscription after reconnect");
                        recreated.insert(new_id, sub);
                    }
                    None => warn!(event_type = %sub.event_type, "recreate response missing subscription id"),
                }
            }
            Err(e) => warn!(error = ?e, event_type = %sub.event_type, "failed to recreate subscription after reconnect"),
        }
    }
    inner.state.lock().await.routes = recreated;
}

#[cfg(test)]
mod tests {
    use super::transport::fake::{FakeDialer, FakeTransport};
    use super::*;
    use crate::oauth::flows::ClientCredentialsFlow;
    use crate::oauth::provider::TokenProvider;
    use crate::oauth::token::AccessToken;
    use crate::ratelimit::RateLimitManager;
    use std::time::Duration as StdDuration;

    fn welcome_frame(id: &str, keepalive: u64) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"w-{id}","message_type":"session_welcome"}},"payload":{{"session":{{"id":"{id}","status":"connected","keepalive_timeout_seconds":{keepalive},"reconnect_url":null}}}}}}"#
        )
    }

    fn notification_frame(msg_id: &str, sub_id: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"{msg_id}","message_type":"notification","subscription_type":"channel.follow"}},"payload":{{"subscription":{{"id":"{sub_id}","type":"channel.follow","version":"2","status":"enabled"}},"event":{{"user_id":"1"}}}}}}"#
        )
    }

    fn revocation_frame(msg_id: &str, sub_id: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"{msg_id}","message_type":"revocation"}},"payload":{{"subscription":{{"id":"{sub_id}","type":"channel.follow","version":"2","status":"authorization_revoked"}}}}}}"#
        )
    }

    fn reconnect_frame(msg_id: &str, url: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"{msg_id}","message_type":"session_reconnect"}},"payload":{{"session":{{"id":"ignored","status":"reconnecting","keepalive_timeout_seconds":10,"reconnect_url":"{url}"}}}}}}"#
        )
    }

    async fn helix_stub() -> Arc<HelixClient> {
        Arc::new(HelixClient::new(reqwest::Client::new(), "cid", Arc::new(RateLimitManager::new())))
    }

    async fn token_stub() -> Arc<TokenProvider<ClientCredentialsFlow>> {
        let flow = Arc::new(ClientCredentialsFlow::new("cid", "secret"));
        TokenProvider::new(flow, reqwest::Client::new(), AccessToken::new_app("AT".into(), StdDuration::from_secs(3600)))
    }

    #[tokio::test]
    async fn connect_succeeds_on_welcome() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1", 10)).unwrap();

        let session = Session::connect(
            dialer,
            helix_stub().await,
            token_stub().await,
            "wss://example/ws",
            64,
            StdDuration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(session.session_id().await.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn notification_routes_to_registered_subscription() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1", 10)).unwrap();

        let session = Session::connect(
            dialer,
            helix_stub().await,
            token_stub().await,
            "wss://example/ws",
            64,
            StdDuration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (route_tx, mut route_rx) = mpsc::channel(8);
        session
            .register("sub1".into(), "channel.follow".into(), "2".into(), json!({}), route_tx)
            .await;

        tx.send(notification_frame("m1", "sub1")).unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(1), route_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RoutedEvent::Notification(_)));
    }

    #[tokio::test]
    async fn duplicate_message_id_is_delivered_once() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1", 10)).unwrap();

        let session = Session::connect(
            dialer,
            helix_stub().await,
            token_stub().await,
            "wss://example/ws",
            64,
            StdDuration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (route_tx, mut route_rx) = mpsc::channel(8);
        session
            .register("sub1".into(), "channel.follow".into(), "2".into(), json!({}), route_tx)
            .await;

        tx.send(notification_frame("dup1", "sub1")).unwrap();
        tx.send(notification_frame("dup1", "sub1")).unwrap();

        let _first = tokio::time::timeout(StdDuration::from_secs(1), route_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(StdDuration::from_millis(100), route_rx.recv()).await;
        assert!(second.is_err(), "duplicate should not be redelivered");
    }

    #[tokio::test]
    async fn revocation_terminates_the_stream() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1", 10)).unwrap();

        let session = Session::connect(
            dialer,
            helix_stub().await,
            token_stub().await,
            "wss://example/ws",
            64,
            StdDuration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (route_tx, mut route_rx) = mpsc::channel(8);
        session
            .register("sub1".into(), "channel.follow".into(), "2".into(), json!({}), route_tx)
            .await;

        tx.send(revocation_frame("r1", "sub1")).unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(1), route_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RoutedEvent::Revoked(RevocationReason::AuthorizationRevoked)));
    }

    #[tokio::test]
    async fn graceful_reconnect_swaps_socket_and_closes_old() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx1, transport1) = FakeTransport::new();
        let closed_flag = Arc::clone(&transport1.closed);
        dialer.push(transport1).await;
        tx1.send(welcome_frame("S1", 10)).unwrap();

        let session = Session::connect(
            Arc::clone(&dialer),
            helix_stub().await,
            token_stub().await,
            "wss://example/ws",
            64,
            StdDuration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (tx2, transport2) = FakeTransport::new();
        dialer.push(transport2).await;
        tx1.send(reconnect_frame("rc1", "wss://example/new")).unwrap();
        tx2.send(welcome_frame("S2", 10)).unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(session.session_id().await.as_deref(), Some("S2"));
        assert!(closed_flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
