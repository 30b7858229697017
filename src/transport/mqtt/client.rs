//! Impure I/O operations for the MQTT transport
//!
//! This module drives the rumqttc event loop from a dedicated pump task and
//! exposes it through the [`Transport`] trait.

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{
    ConnectRequest, Qos, Subscription, Transport, TransportConnector, TransportError,
    TransportEvent, TransportEventSender,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, SubscribeFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long a subscription may wait for its SubAck
const SUBACK_TIMEOUT: Duration = Duration::from_secs(30);

type PendingSubAck = Arc<Mutex<Option<oneshot::Sender<Vec<u8>>>>>;

/// MQTT transport for one connect attempt
pub struct MqttTransport {
    client_id: String,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    pending_suback: PendingSubAck,
    subscribe_lock: Mutex<()>,
    events: TransportEventSender,
    resubscribe: Vec<Subscription>,
    auto_reconnect: bool,
    reconnect_config: ReconnectConfig,
}

impl MqttTransport {
    pub fn new(
        request: ConnectRequest,
        events: TransportEventSender,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(&request)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client_id: request.client_id,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            pump_handle: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            pending_suback: Arc::new(Mutex::new(None)),
            subscribe_lock: Mutex::new(()),
            events,
            resubscribe: request.resubscribe,
            auto_reconnect: request.auto_reconnect,
            reconnect_config,
        })
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the first ConnAck or the first connection error
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
    ) -> Result<(), TransportError> {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(TransportError::Connection(reason.clone()));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
            }

            if state_rx.changed().await.is_err() {
                return Err(TransportError::Connection(
                    "State channel closed".to_string(),
                ));
            }
        }
    }

    fn check_connection_state(&self) -> Result<(), TransportError> {
        if HealthMonitor::can_publish(&self.state_rx.borrow()) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn set_state(&self, event: ConnectionEvent) {
        let new_state = HealthMonitor::determine_next_state(event);
        let old_state = self.state_tx.send_replace(new_state.clone());
        if old_state != new_state {
            HealthMonitor::log_state_transition(&self.client_id, &old_state, &new_state);
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let event_loop = self.event_loop.lock().await.take().ok_or_else(|| {
            TransportError::Connection("Event loop already started".to_string())
        })?;

        let pump = EventPump {
            client_id: self.client_id.clone(),
            client: self.client.clone(),
            event_loop,
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            pending_suback: self.pending_suback.clone(),
            events: self.events.clone(),
            resubscribe: self.resubscribe.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_config: self.reconnect_config.clone(),
            ever_connected: false,
            reconnect_attempts: 0,
        };

        info!(client_id = %self.client_id, "Starting MQTT event loop");
        let handle = tokio::spawn(pump.run());
        *self.pump_handle.lock().await = Some(handle);

        Self::wait_for_connection_confirmation(self.state_rx.clone()).await
    }

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        self.check_connection_state()?;

        let _guard = self.subscribe_lock.lock().await;
        let (suback_tx, suback_rx) = oneshot::channel();
        *self.pending_suback.lock().await = Some(suback_tx);

        let filters: Vec<SubscribeFilter> = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), MessageHandler::to_mqtt_qos(s.qos)))
            .collect();
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let return_codes = match tokio::time::timeout(SUBACK_TIMEOUT, suback_rx).await {
            Ok(Ok(codes)) => codes,
            Ok(Err(_)) => {
                return Err(TransportError::Subscribe(
                    "Connection closed before SubAck".to_string(),
                ));
            }
            Err(_) => {
                self.pending_suback.lock().await.take();
                return Err(TransportError::Subscribe("SubAck timeout".to_string()));
            }
        };

        if let Err(e) = MessageHandler::validate_subscription_success(&return_codes) {
            warn!(client_id = %self.client_id, "{}", e);
            let rejected = return_codes
                .iter()
                .position(|&code| code >= 0x80)
                .and_then(|index| subscriptions.get(index))
                .map(|s| s.topic.clone())
                .unwrap_or_default();
            return Err(TransportError::SubscriptionRejected { topic: rejected });
        }

        debug!(
            client_id = %self.client_id,
            count = subscriptions.len(),
            "Subscriptions confirmed"
        );
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.client
            .publish(topic, MessageHandler::to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        debug!(client_id = %self.client_id, topic, ?qos, "Published message");
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        let handle = self.pump_handle.lock().await.take();

        if let Some(mut handle) = handle {
            if let Err(e) = self.client.try_disconnect() {
                debug!(client_id = %self.client_id, "Disconnect request not queued: {}", e);
            }

            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {
                    info!(client_id = %self.client_id, "Event loop shut down gracefully");
                }
                Ok(Err(e)) => {
                    warn!(client_id = %self.client_id, "Event loop task ended with error: {}", e);
                }
                Err(_) => {
                    warn!(
                        client_id = %self.client_id,
                        "Event loop didn't shut down within {:?}, forcing abort", grace
                    );
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        self.set_state(ConnectionEvent::ClientDisconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state_rx.borrow())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// State owned by the task polling the rumqttc event loop
struct EventPump {
    client_id: String,
    client: AsyncClient,
    event_loop: EventLoop,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    pending_suback: PendingSubAck,
    events: TransportEventSender,
    resubscribe: Vec<Subscription>,
    auto_reconnect: bool,
    reconnect_config: ReconnectConfig,
    ever_connected: bool,
    reconnect_attempts: u32,
}

impl EventPump {
    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(client_id = %self.client_id, "Shutdown signal received, stopping event loop");
                        break;
                    }
                }
                event_result = self.event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route).await
                        }
                        Err(e) => self.connection_dropped(e.to_string()).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        debug!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let new_state = HealthMonitor::determine_next_state(event);
        let old_state = self.state_tx.send_replace(new_state.clone());
        if old_state != new_state {
            HealthMonitor::log_state_transition(&self.client_id, &old_state, &new_state);
        }
    }

    /// Returns true to continue the loop, false to stop
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                if self.ever_connected {
                    self.resubscribe_to_topics();
                }
                self.ever_connected = true;
                self.reconnect_attempts = 0;
                let _ = self.events.send(TransportEvent::Connected);
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(client_id = %self.client_id, topic = %topic, "Received MQTT message");
                let _ = self.events.send(TransportEvent::Message { topic, payload });
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                match self.pending_suback.lock().await.take() {
                    Some(waiter) => {
                        let _ = waiter.send(return_codes);
                    }
                    None => {
                        debug!(client_id = %self.client_id, packet_id, ?return_codes, "Unclaimed SubAck");
                    }
                }
                true
            }
            EventRoute::Disconnected => {
                self.connection_dropped("Broker disconnected".to_string())
                    .await
            }
            EventRoute::DisconnectSent => {
                self.transition(ConnectionEvent::ClientDisconnected);
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Handle a lost connection; returns true when the loop should keep polling
    async fn connection_dropped(&mut self, reason: String) -> bool {
        if self.ever_connected {
            self.transition(ConnectionEvent::NetworkError(reason.clone()));
            let _ = self.events.send(TransportEvent::ConnectionLost(reason));
        } else {
            error!(client_id = %self.client_id, "MQTT connection failed: {}", reason);
            self.transition(ConnectionEvent::NetworkError(reason));
        }
        self.pending_suback.lock().await.take();

        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            self.auto_reconnect,
            self.ever_connected,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                info!(
                    client_id = %self.client_id,
                    "Attempting reconnection {} after {}ms delay", attempt, delay_ms
                );
                interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!(client_id = %self.client_id, "Shutdown requested, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortDisabled => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(client_id = %self.client_id, "Max reconnection attempts exceeded");
                false
            }
        }
    }

    /// Restore subscriptions after the broker started a clean session
    fn resubscribe_to_topics(&self) {
        if self.resubscribe.is_empty() {
            return;
        }

        let filters: Vec<SubscribeFilter> = self
            .resubscribe
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), MessageHandler::to_mqtt_qos(s.qos)))
            .collect();
        match self.client.try_subscribe_many(filters) {
            Ok(()) => debug!(client_id = %self.client_id, "Re-subscribed after reconnection"),
            Err(e) => error!(client_id = %self.client_id, "Failed to re-subscribe: {}", e),
        }
    }
}

/// Sleep unless shutdown is requested; returns true if the sleep completed
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// Creates an [`MqttTransport`] for each connect attempt
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    reconnect_config: ReconnectConfig,
}

impl MqttConnector {
    pub fn new(reconnect_config: ReconnectConfig) -> Self {
        Self { reconnect_config }
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    async fn create(
        &self,
        request: ConnectRequest,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = MqttTransport::new(request, events, self.reconnect_config.clone())?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, 5).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(rx, 60_000));
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let waiter = tokio::spawn(MqttTransport::wait_for_connection_confirmation(rx));
        tx.send(ConnectionState::Connected).unwrap();
        assert!(waiter.await.unwrap().is_ok());

        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let waiter = tokio::spawn(MqttTransport::wait_for_connection_confirmation(rx));
        tx.send(ConnectionState::Disconnected("refused".to_string()))
            .unwrap();
        assert_eq!(
            waiter.await.unwrap(),
            Err(TransportError::Connection("refused".to_string()))
        );
    }
}
