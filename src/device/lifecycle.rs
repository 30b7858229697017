//! Connection lifecycle: the connect handshake and disconnect
//!
//! A handshake walks `ResolvingBroker -> EnsuringCertificate ->
//! ConnectingTransport -> SettingUpSubscriptions -> SendingIntrospection ->
//! Connected` and reports exactly one outcome to every caller that joined it.
//! Only broker resolution is retried, and only with auto-reconnect on.

use super::incoming::spawn_router;
use super::{lock, read, write, ConnectionOptions, Device, TransportSlot};
use crate::error::{sanitize_error_message, ConnectError};
use crate::interfaces::Interface;
use crate::pairing::ClientCertificate;
use crate::protocol::{Introspection, TopicBuilder};
use crate::transport::{ConnectRequest, Qos, Subscription, Transport};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn, Instrument};
use url::Url;

/// Outcome of a connect attempt
pub type ConnectResult = Result<(), ConnectError>;

/// Channel on which a connect outcome is delivered
pub type ConnectResultSender = oneshot::Sender<ConnectResult>;

/// Timing knobs of the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimings {
    /// Fixed wait between broker resolution attempts
    pub broker_retry_interval: Duration,
    /// Maximum wait for the transport handshake when auto-reconnect is off
    pub connect_timeout: Duration,
    /// Time granted to in-flight deliveries on disconnect
    pub disconnect_grace: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            broker_retry_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(2),
        }
    }
}

/// A handshake in progress and everyone waiting for it
pub(super) struct InFlight {
    waiters: Vec<ConnectResultSender>,
    abort: watch::Sender<bool>,
}

/// What to do after a failed broker resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Decide whether a broker resolution failure is retried (pure function)
pub fn broker_retry_decision(auto_reconnect: bool, retry_interval: Duration) -> BrokerRetryDecision {
    if auto_reconnect {
        BrokerRetryDecision::RetryAfter(retry_interval)
    } else {
        BrokerRetryDecision::Fail
    }
}

/// Subscriptions for the control topic and every server-owned interface (pure function)
pub fn build_subscriptions(base_topic: &str, interfaces: &[Interface]) -> Vec<Subscription> {
    let mut subscriptions = vec![Subscription::new(
        TopicBuilder::consumer_properties_topic(base_topic),
        Qos::ExactlyOnce,
    )];
    subscriptions.extend(
        interfaces
            .iter()
            .filter(|interface| interface.is_server_owned())
            .map(|interface| {
                Subscription::new(
                    TopicBuilder::interface_filter(base_topic, &interface.name),
                    Qos::ExactlyOnce,
                )
            }),
    );
    subscriptions
}

/// Steps of the connection handshake
enum HandshakeState {
    ResolvingBroker {
        attempt: u32,
    },
    EnsuringCertificate {
        broker_url: Url,
    },
    ConnectingTransport {
        broker_url: Url,
        certificate: ClientCertificate,
    },
    SettingUpSubscriptions {
        slot: TransportSlot,
    },
    SendingIntrospection {
        slot: TransportSlot,
    },
    Connected {
        slot: TransportSlot,
    },
}

impl HandshakeState {
    fn name(&self) -> &'static str {
        match self {
            Self::ResolvingBroker { .. } => "resolving_broker",
            Self::EnsuringCertificate { .. } => "ensuring_certificate",
            Self::ConnectingTransport { .. } => "connecting_transport",
            Self::SettingUpSubscriptions { .. } => "setting_up_subscriptions",
            Self::SendingIntrospection { .. } => "sending_introspection",
            Self::Connected { .. } => "connected",
        }
    }
}

/// Snapshots a handshake works on
struct HandshakeContext {
    options: ConnectionOptions,
    interfaces: Vec<Interface>,
    subscriptions: Vec<Subscription>,
    abort: watch::Receiver<bool>,
}

/// Resolve once abort is requested; never resolves if the sender is gone
async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `future` unless the handshake is aborted first
async fn abortable<F: Future>(
    abort: &mut watch::Receiver<bool>,
    future: F,
) -> Result<F::Output, ConnectError> {
    if *abort.borrow() {
        return Err(ConnectError::Aborted);
    }

    tokio::select! {
        biased;
        _ = wait_for_abort(abort) => Err(ConnectError::Aborted),
        output = future => Ok(output),
    }
}

impl Device {
    /// Start connecting; the outcome is delivered once on `result`
    ///
    /// Returns immediately. An already connected device reports success
    /// without a new handshake, and a call made while a handshake is running
    /// joins it. Must be called from within a tokio runtime.
    pub fn connect(&self, result: ConnectResultSender) {
        if self.is_connected() {
            let _ = result.send(Ok(()));
            return;
        }

        let abort_rx = {
            let mut handshake = lock(&self.inner.handshake);
            if let Some(in_flight) = handshake.as_mut() {
                debug!(device_id = %self.device_id(), "Joining handshake in flight");
                in_flight.waiters.push(result);
                return;
            }

            let (abort_tx, abort_rx) = watch::channel(false);
            *handshake = Some(InFlight {
                waiters: vec![result],
                abort: abort_tx,
            });
            abort_rx
        };

        let device = self.clone();
        let span = crate::handshake_span!(
            device_id = %self.device_id(),
            realm = %self.realm()
        );
        tokio::spawn(
            async move {
                let _lifecycle = device.inner.lifecycle.lock().await;
                let outcome = device.run_handshake(abort_rx).await;
                device.finish_handshake(outcome);
            }
            .instrument(span),
        );
    }

    /// Connect and wait for the outcome
    pub async fn connect_and_wait(&self) -> ConnectResult {
        let (tx, rx) = oneshot::channel();
        self.connect(tx);
        rx.await.unwrap_or(Err(ConnectError::Aborted))
    }

    /// Disconnect from the broker
    ///
    /// Aborts any handshake in flight (its callers receive
    /// [`ConnectError::Aborted`]), waits for it to stop, then closes the
    /// transport allowing the configured grace period for in-flight delivery.
    pub async fn disconnect(&self) {
        self.request_abort();
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.inner.ready_generation.store(0, Ordering::SeqCst);
        let slot = write(&self.inner.transport).take();
        if let Some(slot) = slot {
            info!(device_id = %self.device_id(), "Disconnecting");
            if let Err(e) = slot
                .transport
                .disconnect(self.inner.timings.disconnect_grace)
                .await
            {
                warn!(
                    device_id = %self.device_id(),
                    error = %sanitize_error_message(&e.to_string()),
                    "Transport disconnect failed"
                );
            }
        }

        self.report_connectivity(false);
    }

    fn request_abort(&self) {
        if let Some(in_flight) = lock(&self.inner.handshake).as_ref() {
            let _ = in_flight.abort.send(true);
        }
    }

    fn finish_handshake(&self, outcome: ConnectResult) {
        match &outcome {
            Ok(()) => info!(device_id = %self.device_id(), "Device connected"),
            Err(e) => warn!(
                device_id = %self.device_id(),
                error = %sanitize_error_message(&e.to_string()),
                "Connect failed"
            ),
        }

        let in_flight = lock(&self.inner.handshake).take();
        if let Some(in_flight) = in_flight {
            for waiter in in_flight.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn run_handshake(&self, abort: watch::Receiver<bool>) -> ConnectResult {
        let interfaces = read(&self.inner.registry).snapshot();
        if interfaces.is_empty() {
            return Err(ConnectError::NoInterfacesRegistered);
        }

        let mut context = HandshakeContext {
            options: read(&self.inner.options).clone(),
            subscriptions: build_subscriptions(&self.inner.base_topic, &interfaces),
            interfaces,
            abort,
        };

        let mut state = HandshakeState::ResolvingBroker { attempt: 1 };
        loop {
            debug!(device_id = %self.device_id(), state = state.name(), "Handshake step");
            state = match state {
                HandshakeState::Connected { slot } => {
                    self.inner
                        .ready_generation
                        .store(slot.generation, Ordering::SeqCst);
                    // Otherwise the transport's next Connected event announces
                    if slot.transport.is_connected() {
                        self.report_connectivity(true);
                        if !slot.transport.is_connected() {
                            self.report_connectivity(false);
                        }
                    } else {
                        warn!(
                            device_id = %self.device_id(),
                            "Link dropped during handshake, waiting for the transport to reconnect"
                        );
                    }
                    return Ok(());
                }
                other => self.step(other, &mut context).await?,
            };
        }
    }

    async fn step(
        &self,
        state: HandshakeState,
        context: &mut HandshakeContext,
    ) -> Result<HandshakeState, ConnectError> {
        let identity = &self.inner.identity;

        match state {
            HandshakeState::ResolvingBroker { attempt } => {
                let resolved = abortable(
                    &mut context.abort,
                    self.inner
                        .pairing
                        .broker_url(identity)
                        .instrument(crate::pairing_span!(endpoint = "broker_url", attempt)),
                )
                .await?;

                match resolved {
                    Ok(broker_url) => Ok(HandshakeState::EnsuringCertificate { broker_url }),
                    Err(e) => match broker_retry_decision(
                        context.options.auto_reconnect,
                        self.inner.timings.broker_retry_interval,
                    ) {
                        BrokerRetryDecision::Fail => Err(ConnectError::BrokerResolution(e)),
                        BrokerRetryDecision::RetryAfter(delay) => {
                            warn!(
                                device_id = %identity.device_id,
                                attempt,
                                error = %sanitize_error_message(&e.to_string()),
                                "Broker resolution failed, retrying in {:?}", delay
                            );
                            abortable(&mut context.abort, tokio::time::sleep(delay)).await?;
                            Ok(HandshakeState::ResolvingBroker {
                                attempt: attempt + 1,
                            })
                        }
                    },
                }
            }

            HandshakeState::EnsuringCertificate { broker_url } => {
                let certificate = abortable(
                    &mut context.abort,
                    self.inner
                        .pairing
                        .ensure_certificate(identity, &self.inner.persistency_dir)
                        .instrument(crate::pairing_span!(endpoint = "credentials")),
                )
                .await?
                .map_err(ConnectError::Certificate)?;

                Ok(HandshakeState::ConnectingTransport {
                    broker_url,
                    certificate,
                })
            }

            HandshakeState::ConnectingTransport {
                broker_url,
                certificate,
            } => {
                let request = ConnectRequest {
                    broker_url,
                    client_id: identity.client_id(),
                    certificate,
                    trust_anchors: context.options.trust_anchors.clone(),
                    auto_reconnect: context.options.auto_reconnect,
                    keep_alive: self.inner.keep_alive,
                    resubscribe: context.subscriptions.clone(),
                };
                let (events_tx, events_rx) = mpsc::unbounded_channel();

                let transport =
                    abortable(&mut context.abort, self.inner.connector.create(request, events_tx))
                        .await?
                        .map_err(ConnectError::TransportConnect)?;

                let (slot, previous) = self.install_transport(transport);
                spawn_router(self, slot.generation, events_rx);
                if let Some(previous) = previous {
                    debug!(device_id = %identity.device_id, "Closing previous transport");
                    let _ = previous.transport.disconnect(Duration::ZERO).await;
                }

                let connected = if context.options.auto_reconnect {
                    abortable(
                        &mut context.abort,
                        slot.transport
                            .connect()
                            .instrument(crate::transport_span!(operation = "connect")),
                    )
                    .await?
                } else {
                    let timeout = self.inner.timings.connect_timeout;
                    match abortable(
                        &mut context.abort,
                        tokio::time::timeout(timeout, slot.transport.connect()),
                    )
                    .await?
                    {
                        Ok(result) => result,
                        Err(_) => {
                            self.abandon_transport(&slot).await;
                            return Err(ConnectError::TransportConnectTimeout(timeout));
                        }
                    }
                };

                if let Err(e) = connected {
                    self.abandon_transport(&slot).await;
                    return Err(ConnectError::TransportConnect(e));
                }

                Ok(HandshakeState::SettingUpSubscriptions { slot })
            }

            HandshakeState::SettingUpSubscriptions { slot } => {
                let subscribed = abortable(
                    &mut context.abort,
                    slot.transport
                        .subscribe(&context.subscriptions)
                        .instrument(crate::transport_span!(
                            operation = "subscribe",
                            count = context.subscriptions.len()
                        )),
                )
                .await?;

                if let Err(e) = subscribed {
                    self.abandon_transport(&slot).await;
                    return Err(ConnectError::SubscriptionSetup(e));
                }

                Ok(HandshakeState::SendingIntrospection { slot })
            }

            HandshakeState::SendingIntrospection { slot } => {
                let payload = Introspection::from_interfaces(&context.interfaces).payload();
                let published = abortable(
                    &mut context.abort,
                    slot.transport
                        .publish(&self.inner.base_topic, payload.into_bytes(), Qos::ExactlyOnce)
                        .instrument(crate::transport_span!(operation = "introspection")),
                )
                .await?;

                if let Err(e) = published {
                    self.abandon_transport(&slot).await;
                    return Err(ConnectError::Introspection(e));
                }

                Ok(HandshakeState::Connected { slot })
            }

            HandshakeState::Connected { slot } => Ok(HandshakeState::Connected { slot }),
        }
    }

    /// Store a new transport handle, returning it and the one it replaced
    fn install_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> (TransportSlot, Option<TransportSlot>) {
        let slot = TransportSlot {
            transport,
            generation: self.inner.next_generation.fetch_add(1, Ordering::SeqCst),
        };
        self.inner.ready_generation.store(0, Ordering::SeqCst);
        let previous = write(&self.inner.transport).replace(slot.clone());
        (slot, previous)
    }

    /// Drop a transport whose handshake failed and ask it to close
    async fn abandon_transport(&self, slot: &TransportSlot) {
        {
            let mut current = write(&self.inner.transport);
            if current
                .as_ref()
                .map(|c| c.generation == slot.generation)
                .unwrap_or(false)
            {
                *current = None;
            }
        }

        if let Err(e) = slot.transport.disconnect(Duration::ZERO).await {
            debug!(device_id = %self.device_id(), "Disconnect after failed handshake: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{Aggregation, InterfaceType, Ownership};

    fn interface(name: &str, ownership: Ownership) -> Interface {
        Interface {
            name: name.to_string(),
            major_version: 1,
            minor_version: 0,
            interface_type: InterfaceType::Datastream,
            ownership,
            aggregation: Aggregation::Individual,
            description: None,
            mappings: Vec::new(),
        }
    }

    #[test]
    fn test_broker_retry_decision() {
        let interval = Duration::from_secs(30);
        assert_eq!(
            broker_retry_decision(true, interval),
            BrokerRetryDecision::RetryAfter(interval)
        );
        assert_eq!(
            broker_retry_decision(false, interval),
            BrokerRetryDecision::Fail
        );
    }

    #[test]
    fn test_build_subscriptions() {
        let interfaces = vec![
            interface("org.example.Commands", Ownership::Server),
            interface("org.example.Sensors", Ownership::Device),
            interface("org.example.Settings", Ownership::Server),
        ];

        let subscriptions = build_subscriptions("test/dev", &interfaces);
        let topics: Vec<&str> = subscriptions.iter().map(|s| s.topic.as_str()).collect();

        assert_eq!(
            topics,
            vec![
                "test/dev/control/consumer/properties",
                "test/dev/org.example.Commands/#",
                "test/dev/org.example.Settings/#",
            ]
        );
        assert!(subscriptions.iter().all(|s| s.qos == Qos::ExactlyOnce));
    }

    #[test]
    fn test_default_timings() {
        let timings = ConnectionTimings::default();
        assert_eq!(timings.broker_retry_interval, Duration::from_secs(30));
        assert_eq!(timings.connect_timeout, Duration::from_secs(30));
        assert_eq!(timings.disconnect_grace, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_abortable_runs_future() {
        let (_tx, mut rx) = watch::channel(false);
        let output = abortable(&mut rx, async { 42 }).await;
        assert_eq!(output.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_abortable_stops_on_abort() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let output = abortable(&mut rx, std::future::pending::<()>()).await;
        assert!(matches!(output, Err(ConnectError::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abortable_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
            tx
        });

        let output = abortable(&mut rx, tokio::time::sleep(Duration::from_secs(3600))).await;
        assert!(matches!(output, Err(ConnectError::Aborted)));
        drop(aborter.await.unwrap());
    }
}
