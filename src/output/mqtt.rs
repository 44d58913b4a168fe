//! MQTT broker sink built on `rumqttc`.
//!
//! The rumqttc event loop runs in its own task and reconnects on failure.
//! Connection state is shared with the sink through an atomic flag so the
//! publish queue can tell whether draining is worthwhile.

use super::{BrokerSink, PublishError, PublishFuture};
use crate::queue::OutboundMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before the event loop is polled again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Upper bound for handing one message to the client
    pub timeout: Duration,
}

impl MqttConfig {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// [`BrokerSink`] publishing through a rumqttc client.
pub struct MqttSink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    timeout: Duration,
    event_loop: JoinHandle<()>,
}

impl MqttSink {
    /// Create the client and spawn its event loop.
    ///
    /// Returns immediately; the connection is established in the background
    /// and [`BrokerSink::is_available`] turns true once the broker acknowledges it.
    pub fn connect(config: &MqttConfig) -> Self {
        info!("Connecting to MQTT broker {}:{}", config.host, config.port);

        let (client, mut eventloop) = AsyncClient::new(config.options(), REQUEST_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let state = Arc::clone(&connected);

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("MQTT connected: {:?}", ack.code);
                        state.store(true, Ordering::Release);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker closed the connection");
                        state.store(false, Ordering::Release);
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        state.store(false, Ordering::Release);
                        warn!("MQTT connection error: {}. Reconnecting...", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self {
            client,
            connected,
            timeout: config.timeout,
            event_loop,
        }
    }

    /// Disconnect from the broker and stop the event loop.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {}", e);
        }
        // give the event loop a chance to flush the disconnect
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.event_loop.abort();
    }
}

impl BrokerSink for MqttSink {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> PublishFuture<'a> {
        Box::pin(async move {
            if !self.is_available() {
                return Err(PublishError::BrokerUnavailable);
            }

            let send = self.client.publish(
                message.topic.as_str(),
                QoS::AtMostOnce,
                true,
                message.payload.as_bytes(),
            );
            match tokio::time::timeout(self.timeout, send).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PublishError::Client(e.to_string())),
                Err(_) => Err(PublishError::Timeout(self.timeout)),
            }
        })
    }
}
