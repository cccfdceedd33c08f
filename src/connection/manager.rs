/// Connection state machine
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TwsError};
use crate::events::PumpHandle;
use crate::requests::RequestCorrelator;
use crate::types::ConnectionState;

/// Owns the connection state; the only writer of it
pub struct ConnectionManager {
    state: watch::Sender<ConnectionState>,
    next_valid_id: watch::Sender<Option<i64>>,
    server_version: AtomicI32,
    pump: PumpHandle,
    correlator: Arc<RequestCorrelator>,
}

impl ConnectionManager {
    pub fn new(pump: PumpHandle, correlator: Arc<RequestCorrelator>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (next_valid_id, _) = watch::channel(None);

        ConnectionManager {
            state,
            next_valid_id,
            server_version: AtomicI32::new(0),
            pump,
            correlator,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn next_valid_id(&self) -> Option<i64> {
        *self.next_valid_id.borrow()
    }

    pub fn server_version(&self) -> Option<i32> {
        match self.server_version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Connected and the next valid id has arrived
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected && self.next_valid_id().is_some()
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected if self.next_valid_id().is_some() => Ok(()),
            ConnectionState::Connected => Err(TwsError::NotReady),
            ConnectionState::Failed => Err(TwsError::ConnectionFailed(
                "session failed, reset() required".to_string(),
            )),
            other => Err(TwsError::NotConnected(other.as_str().to_string())),
        }
    }

    /// Atomically move from one of `from` to `to`; returns the actual state on refusal
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> std::result::Result<(), ConnectionState> {
        let mut previous = to;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            debug!("Connection state {} -> {}", previous.as_str(), to.as_str());
            Ok(())
        } else {
            Err(previous)
        }
    }

    pub async fn connect(&self, host: &str, port: u16, client_id: i32, timeout: Duration) -> Result<()> {
        match self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting) {
            Ok(()) => {}
            Err(ConnectionState::Connected) => {
                debug!("Already connected, connect() is a no-op");
                return Ok(());
            }
            Err(ConnectionState::Connecting) => return Err(TwsError::AlreadyConnecting),
            Err(ConnectionState::Failed) => {
                return Err(TwsError::ConnectionFailed(
                    "session failed, reset() required".to_string(),
                ))
            }
            Err(other) => {
                return Err(TwsError::NotConnected(format!(
                    "cannot connect while {}",
                    other.as_str()
                )))
            }
        }

        let deadline = Instant::now() + timeout;
        self.next_valid_id.send_replace(None);
        self.correlator.reopen().await;
        let mut state_rx = self.state.subscribe();

        info!("🔌 Connecting to {}:{} (client id {})", host, port, client_id);

        if let Err(e) = self.pump.connect(host, port, client_id).await {
            error!("❌ Connect to {}:{} failed: {}", host, port, e);
            let _ = self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
            return Err(e);
        }

        let acked = tokio::time::timeout_at(deadline, async {
            state_rx
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| *s)
        })
        .await;

        match acked {
            Ok(Ok(ConnectionState::Connected)) => {}
            Ok(Ok(ConnectionState::Failed)) => {
                return Err(TwsError::ConnectionFailed(
                    "fatal error during handshake".to_string(),
                ))
            }
            Ok(Ok(other)) => {
                return Err(TwsError::NotConnected(format!(
                    "connection closed during handshake ({})",
                    other.as_str()
                )))
            }
            Ok(Err(_)) => return Err(TwsError::Internal("state channel closed".to_string())),
            Err(_) => {
                warn!("⏱️  No connect acknowledgment from {}:{} within {:?}", host, port, timeout);
                if let Err(e) = self.pump.disconnect().await {
                    debug!("Disconnect after connect timeout failed: {}", e);
                }
                let _ = self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
                return Err(TwsError::ConnectTimeout(timeout));
            }
        }

        let mut id_rx = self.next_valid_id.subscribe();
        let ready = tokio::time::timeout_at(deadline, async {
            id_rx.wait_for(Option::is_some).await.map(|id| *id)
        })
        .await;

        match ready {
            Ok(Ok(Some(id))) => info!("✅ Connected to {}:{} (next valid id {})", host, port, id),
            _ => warn!(
                "⚠️  Connected to {}:{} but next valid id not received yet, requests will be rejected until it arrives",
                host, port
            ),
        }

        Ok(())
    }

    /// Fail pending requests, close the session and wait for the close to land
    pub async fn disconnect(&self, timeout: Duration) -> Result<()> {
        match self.transition(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Disconnecting,
        ) {
            Ok(()) => {}
            Err(ConnectionState::Failed) => {
                self.correlator.fail_all("disconnect requested").await;
                return self.pump.disconnect().await;
            }
            Err(state) => {
                debug!("disconnect() while {}, nothing to do", state.as_str());
                return Ok(());
            }
        }

        info!("🔌 Disconnecting");
        self.correlator.fail_all("disconnect requested").await;

        let mut state_rx = self.state.subscribe();
        let result = self.pump.disconnect().await;
        if let Err(e) = &result {
            warn!("Session disconnect reported an error: {}", e);
        }

        let closed = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| *s != ConnectionState::Disconnecting)
                .await
                .map(|s| *s)
        })
        .await;
        if closed.is_err() {
            debug!("No close confirmation within {:?}, marking disconnected", timeout);
        }

        let _ = self.transition(&[ConnectionState::Disconnecting], ConnectionState::Disconnected);
        self.next_valid_id.send_replace(None);
        info!("🔌 Disconnected");

        result
    }

    /// Leave `Failed` (or any other state) and return to `Disconnected`
    pub async fn reset(&self, timeout: Duration) -> Result<()> {
        match self.state() {
            ConnectionState::Failed => {
                if let Err(e) = self.pump.disconnect().await {
                    debug!("Disconnect during reset failed: {}", e);
                }
                let _ = self.transition(&[ConnectionState::Failed], ConnectionState::Disconnected);
                self.next_valid_id.send_replace(None);
                info!("🔄 Connection reset");
                Ok(())
            }
            ConnectionState::Disconnected => Ok(()),
            _ => self.disconnect(timeout).await,
        }
    }

    pub fn on_connect_ack(&self, server_version: i32) {
        self.server_version.store(server_version, Ordering::SeqCst);
        if let Err(state) = self.transition(&[ConnectionState::Connecting], ConnectionState::Connected) {
            warn!("Ignoring connect acknowledgment while {}", state.as_str());
        } else {
            debug!("Connect acknowledged, server version {}", server_version);
        }
    }

    pub fn on_next_valid_id(&self, id: i64) {
        self.next_valid_id.send_replace(Some(id));
        debug!("Next valid id {}", id);
    }

    pub async fn on_connection_closed(&self) {
        match self.state() {
            ConnectionState::Disconnecting => {
                let _ = self.transition(&[ConnectionState::Disconnecting], ConnectionState::Disconnected);
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                warn!("⚠️  Connection closed by peer");
                let _ = self.transition(
                    &[ConnectionState::Connected, ConnectionState::Connecting],
                    ConnectionState::Disconnected,
                );
                self.next_valid_id.send_replace(None);
                self.correlator.fail_all("connection closed by peer").await;
            }
            state => debug!("Connection closed while {}", state.as_str()),
        }
    }

    /// Connectivity lost; terminal until `reset`
    pub async fn on_fatal(&self, code: i32, message: &str) {
        error!("❌ Fatal TWS error {}: {}", code, message);
        if self.state() != ConnectionState::Disconnected {
            self.state.send_replace(ConnectionState::Failed);
        }
        self.next_valid_id.send_replace(None);
        self.correlator
            .fail_all(&format!("connectivity lost ({}): {}", code, message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectBehavior, PaperSession};
    use crate::events::EventPump;

    fn start(session: PaperSession) -> (Arc<ConnectionManager>, Arc<RequestCorrelator>, PumpHandle) {
        let (pump, handle) = EventPump::new(Box::new(session));
        let correlator = Arc::new(RequestCorrelator::new());
        let manager = Arc::new(ConnectionManager::new(handle.clone(), Arc::clone(&correlator)));
        tokio::spawn(pump.run(Arc::clone(&manager), Arc::clone(&correlator)));
        (manager, correlator, handle)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let session = PaperSession::new();
        let (manager, correlator, _pump) = start(session.clone());
        let states = manager.subscribe();

        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_ready());
        assert_eq!(manager.server_version(), Some(crate::broker::paper_session::SERVER_VERSION));
        assert!(states.has_changed().unwrap());

        // Connecting again is a no-op
        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.connect_calls(), 1);

        // The counter follows the session's next valid id
        assert!(correlator.next_request_id() >= crate::requests::INITIAL_REQUEST_ID);

        manager.disconnect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_to_disconnected() {
        let session = PaperSession::new().with_connect_behavior(ConnectBehavior::NoAck);
        let (manager, _correlator, _pump) = start(session.clone());

        let result = manager.connect("127.0.0.1", 7497, 1, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TwsError::ConnectTimeout(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting() {
        let session = PaperSession::new()
            .with_connect_behavior(ConnectBehavior::DelayedAck(Duration::from_millis(200)));
        let (manager, _correlator, _pump) = start(session.clone());

        let m = Arc::clone(&manager);
        let first = tokio::spawn(async move { m.connect("127.0.0.1", 7497, 1, Duration::from_secs(2)).await });

        let mut states = manager.subscribe();
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        let second = manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(2)).await;
        assert!(matches!(second, Err(TwsError::AlreadyConnecting)));

        first.await.unwrap().unwrap();
        assert_eq!(session.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_until_next_valid_id() {
        let session = PaperSession::new().with_connect_behavior(ConnectBehavior::AckWithoutNextId);
        let (manager, _correlator, _pump) = start(session.clone());

        manager.connect("127.0.0.1", 7497, 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(matches!(manager.ensure_ready(), Err(TwsError::NotReady)));

        session.emit_next_valid_id();
        let mut states = manager.next_valid_id.subscribe();
        states.wait_for(Option::is_some).await.unwrap();
        assert!(manager.ensure_ready().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_error_fails_until_reset() {
        let session = PaperSession::new();
        let (manager, correlator, _pump) = start(session.clone());
        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();

        let waiter = correlator.submit(4242, Duration::from_secs(5)).await.unwrap();
        session.simulate_connectivity_loss();

        assert!(matches!(correlator.wait(waiter).await, Err(TwsError::SessionClosed(_))));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(
            manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await,
            Err(TwsError::ConnectionFailed(_))
        ));

        manager.reset(Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_refuses_late_registrations_until_reconnect() {
        let session = PaperSession::new();
        let (manager, correlator, _pump) = start(session.clone());
        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();
        manager.disconnect(Duration::from_secs(1)).await.unwrap();

        // A fetch that passed the readiness check just before the disconnect
        assert!(matches!(
            correlator.submit(31, Duration::from_secs(30)).await,
            Err(TwsError::SessionClosed(_))
        ));

        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();
        let _waiter = correlator.submit(31, Duration::from_secs(30)).await.unwrap();
        assert_eq!(correlator.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let session = PaperSession::new();
        let (manager, correlator, _pump) = start(session.clone());
        manager.connect("127.0.0.1", 7497, 1, Duration::from_secs(1)).await.unwrap();

        let waiter = correlator.submit(77, Duration::from_secs(5)).await.unwrap();
        session.simulate_peer_close();

        assert!(matches!(correlator.wait(waiter).await, Err(TwsError::SessionClosed(_))));
        let mut states = manager.subscribe();
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }
}
