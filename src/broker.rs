use crate::hub::BroadcastHub;
use crate::model::Message;
use anyhow::Result;
use futures::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;

const CHANNEL_PREFIX: &str = "chat.";
const SUBSCRIBE_PATTERN: &str = "chat.*";
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Redis-backed pub/sub backend for multi-instance deployments. One channel
/// per chat, JSON message payloads.
#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    pub async fn publish(&self, message: &Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let channel = format!("{}{}", CHANNEL_PREFIX, message.chat_id);
        let mut conn = self.conn.clone();
        let _subscribers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Spawn the task that feeds broker traffic into the local topic
    /// registry. Runs for the life of the process, resubscribing with a
    /// delay whenever the connection drops.
    pub fn spawn_forwarder(&self, hub: BroadcastHub) {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = forward(&client, &hub).await {
                    tracing::warn!(error = %e, "broker subscription lost, retrying");
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        });
    }
}

async fn forward(client: &redis::Client, hub: &BroadcastHub) -> Result<()> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe(SUBSCRIBE_PATTERN).await?;
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = msg.get_payload()?;
        match serde_json::from_str::<Message>(&payload) {
            Ok(message) => hub.deliver_local(message),
            Err(e) => {
                tracing::warn!(channel = msg.get_channel_name(), error = %e, "discarding malformed broker payload");
            }
        }
    }
    Ok(())
}
