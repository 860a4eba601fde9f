//! MQTT transport bridge.
//!
//! Mirrors the I/O cache to an MQTT broker over topics shaped
//! `<root>/io/<i|o>/<name>/<dataType>`. Inbound publishes become cache
//! mutations carrying the bridge's own origin; cache notifications are
//! re-published outward unless they originated here or are snapshot replays,
//! which is what keeps a value from ping-ponging between the broker and the
//! cache forever.
//!
//! The bridge owns its reconnect loop: while the broker is unreachable it
//! retries at a fixed interval and logs the failure once per outage, not once
//! per attempt.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::backend::Bridge;
use crate::cache::{IoCache, IoCacheListener, ListenerRef, Namespace, Origin};
use crate::config::MqttConfig;

/// Topic prefixes for one root segment, precomputed once.
#[derive(Debug, Clone)]
struct TopicScheme {
    input_prefix: String,
    output_prefix: String,
}

impl TopicScheme {
    fn new(root: &str) -> Self {
        Self {
            input_prefix: format!("{root}/io/i/"),
            output_prefix: format!("{root}/io/o/"),
        }
    }

    fn input_filter(&self) -> String {
        format!("{}+/+", self.input_prefix)
    }

    fn output_filter(&self) -> String {
        format!("{}+/+", self.output_prefix)
    }

    fn publish_topic(&self, namespace: Namespace, name: &str, data_type: &str) -> String {
        let prefix = match namespace {
            Namespace::Input => &self.input_prefix,
            Namespace::Output => &self.output_prefix,
        };
        format!("{prefix}{name}/{data_type}")
    }

    /// Splits `<root>/io/<i|o>/<name>/<dataType>`. The dataType is the final
    /// segment; the name is everything in between and may itself contain `/`.
    fn parse<'a>(&self, topic: &'a str) -> Option<(Namespace, &'a str, &'a str)> {
        let (namespace, rest) = if let Some(rest) = topic.strip_prefix(&self.input_prefix) {
            (Namespace::Input, rest)
        } else if let Some(rest) = topic.strip_prefix(&self.output_prefix) {
            (Namespace::Output, rest)
        } else {
            return None;
        };
        let (name, data_type) = rest.rsplit_once('/')?;
        if name.is_empty() || data_type.is_empty() {
            return None;
        }
        Some((namespace, name, data_type))
    }
}

/// Re-publication queued by the cache listener, consumed by the publisher task.
#[derive(Debug)]
struct MqttPublish {
    topic: String,
    payload: Vec<u8>,
}

/// Cache listener half of the bridge. Runs on the cache worker thread, so it
/// only encodes the topic and hands off to the publisher task.
struct MqttCacheListener {
    origin: Origin,
    scheme: TopicScheme,
    publish_tx: mpsc::UnboundedSender<MqttPublish>,
}

impl MqttCacheListener {
    fn republish(
        &self,
        namespace: Namespace,
        name: &str,
        data_type: &str,
        value: &[u8],
        origin: Origin,
    ) -> Result<()> {
        // check origin to avoid an infinite send/receive loop over MQTT
        if origin == self.origin || origin.is_cache() {
            return Ok(());
        }
        self.publish_tx
            .send(MqttPublish {
                topic: self.scheme.publish_topic(namespace, name, data_type),
                payload: value.to_vec(),
            })
            .map_err(|_| eyre::eyre!("mqtt publisher task is gone"))
    }
}

impl IoCacheListener for MqttCacheListener {
    fn on_input(&self, name: &str, data_type: &str, value: &[u8], origin: Origin) -> Result<()> {
        self.republish(Namespace::Input, name, data_type, value, origin)
    }

    fn on_output(&self, name: &str, data_type: &str, value: &[u8], origin: Origin) -> Result<()> {
        self.republish(Namespace::Output, name, data_type, value, origin)
    }
}

pub struct MqttBridge {
    config: MqttConfig,
    cache: Arc<IoCache>,
}

impl MqttBridge {
    pub fn new(config: MqttConfig, cache: Arc<IoCache>) -> Self {
        Self { config, cache }
    }

    fn handle_publish(&self, scheme: &TopicScheme, topic: &str, payload: &[u8], origin: Origin) {
        match scheme.parse(topic) {
            Some((Namespace::Input, name, data_type)) => {
                debug!(%name, %data_type, len = payload.len(), "Inbound MQTT input");
                self.cache.set_input(name, data_type, payload, origin);
            }
            Some((Namespace::Output, name, data_type)) => {
                debug!(%name, %data_type, len = payload.len(), "Inbound MQTT output");
                self.cache.set_output(name, data_type, payload, origin);
            }
            None => debug!(%topic, "Ignoring MQTT message on unrecognized topic"),
        }
    }
}

#[async_trait::async_trait]
impl Bridge for MqttBridge {
    async fn run(&mut self) -> Result<()> {
        let scheme = TopicScheme::new(&self.config.topic_root);
        let origin = Origin::unique();

        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel();
        let listener: ListenerRef = Arc::new(MqttCacheListener {
            origin,
            scheme: scheme.clone(),
            publish_tx,
        });
        self.cache.register_listener(listener);

        let options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // publisher task: drains re-publications queued by the cache listener
        // so the cache worker never touches the network
        let publish_client = client.clone();
        tokio::spawn(async move {
            while let Some(MqttPublish { topic, payload }) = publish_rx.recv().await {
                if let Err(e) = publish_client
                    .publish(topic, QoS::AtMostOnce, false, payload)
                    .await
                {
                    debug!("Could not send MQTT message: {e}");
                }
            }
        });

        let reconnect_interval = Duration::from_millis(self.config.reconnect_ms);
        let mut in_error_state = false;
        info!(
            "Connecting to MQTT broker at {}:{}...",
            self.config.host, self.config.port
        );
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    in_error_state = false;
                    client
                        .subscribe(scheme.input_filter(), QoS::AtMostOnce)
                        .await?;
                    client
                        .subscribe(scheme.output_filter(), QoS::AtMostOnce)
                        .await?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&scheme, &publish.topic, &publish.payload, origin);
                }
                Ok(_) => {}
                Err(e) => {
                    // only log the error once until a proper connection can
                    // be established again
                    if !in_error_state {
                        error!(
                            "MQTT broker unreachable ({e}) - will continuously retry every {} ms...",
                            self.config.reconnect_ms
                        );
                        in_error_state = true;
                    }
                    tokio::time::sleep(reconnect_interval).await;
                }
            }
        }
    }
}
