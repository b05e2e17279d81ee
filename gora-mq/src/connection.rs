use crate::errors::{MqError, Result};

use gora_core::broker::{Broker, BrokerConfig, Channel};
use gora_core::message::MessageProperties;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A broker connection and the single channel shared by every RPC client,
/// RPC server and topic client of a process.
///
/// Outbound writes go through one lock so that concurrent publishers never
/// interleave on the channel.
pub struct BrokerConnection {
    config: BrokerConfig,
    channel: Arc<dyn Channel>,
    write_lock: Mutex<()>,
}

impl BrokerConnection {
    /// Connects to the broker. Unreachable brokers and rejected credentials
    /// both surface as `MqError::Connection`.
    pub async fn connect(config: BrokerConfig, broker: &dyn Broker) -> Result<Arc<Self>> {
        let channel = broker
            .connect(&config)
            .await
            .map_err(MqError::Connection)?;

        info!(url = %config.url, "connected to broker");

        Ok(Arc::new(BrokerConnection {
            config,
            channel,
            write_lock: Mutex::new(()),
        }))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// The shared channel, as long as it is still open.
    pub fn channel(&self) -> Result<Arc<dyn Channel>> {
        if self.channel.is_open() {
            Ok(Arc::clone(&self.channel))
        } else {
            Err(MqError::ChannelUnavailable)
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub(crate) async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let channel = self.channel()?;
        let _guard = self.write_lock.lock().await;
        channel.send_to_queue(queue, body, properties).await?;
        Ok(())
    }

    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let channel = self.channel()?;
        let _guard = self.write_lock.lock().await;
        channel
            .publish(exchange, routing_key, body, properties)
            .await?;
        Ok(())
    }

    /// Closes the channel. Private queues declared on it go away with it.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "failed to close broker channel");
        }
        info!(url = %self.config.url, "broker connection closed");
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.config.url)
            .field("open", &self.channel.is_open())
            .finish()
    }
}
