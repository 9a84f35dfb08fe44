//! MQTT broker plumbing shared by every binary.
//!
//! [`Broker`] wraps a `rumqttc` async client plus its event loop and
//! adds the three behaviors the daemons rely on:
//!
//! - a **property cache**: retained topics are re-published only when
//!   the value actually changed, and whatever was published gets
//!   cleared (empty retained payload) on shutdown;
//! - **prefix-relative** publish/subscribe, so engine code deals in
//!   topic suffixes (`rssi`, `bss/<mac>/level`, …);
//! - the **self-sync** flush protocol: before exiting, a unique token
//!   is round-tripped through the broker to guarantee every earlier
//!   publish has been flushed.
//!
//! QoS follows the original daemons: 0 against a localhost broker,
//! 1 otherwise, unless pinned in the config file.

use std::collections::HashMap;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::Result;

/// Topic used by the self-sync flush protocol.
const SELF_SYNC_TOPIC: &str = "tmp/selfsync";

/// An incoming broker message, already decoded to UTF-8.
#[derive(Debug)]
pub struct Incoming {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

/// Last-published-value cache for retained properties.
///
/// Values are stored as plain strings; absent and empty are the same
/// thing here — clearing a property publishes an empty payload, and a
/// property that was never published needs no clear.
#[derive(Debug, Default)]
pub struct PropertyCache {
    values: HashMap<String, String>,
}

impl PropertyCache {
    /// Record `value` for `topic`. Returns true when the value differs
    /// from the cached one, i.e. a publish is due.
    pub fn update(&mut self, topic: &str, value: Option<&str>) -> bool {
        let new = value.unwrap_or("");
        let old = self.values.get(topic).map_or("", String::as_str);
        if new == old {
            return false;
        }
        if new.is_empty() {
            self.values.remove(topic);
        } else {
            self.values.insert(topic.to_string(), new.to_string());
        }
        true
    }

    /// Topics currently holding a non-empty retained value.
    pub fn occupied(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// One broker connection owned by a single event loop.
pub struct Broker {
    client: AsyncClient,
    eventloop: EventLoop,
    prefix: String,
    qos: QoS,
    cache: PropertyCache,
    sync_token: Option<String>,
}

impl Broker {
    /// Open a connection. `name` becomes `<name>-<pid>` as the client
    /// id; `prefix` is prepended to every relative topic.
    pub fn connect(name: &str, cfg: &BrokerConfig, prefix: String) -> Self {
        let id = format!("{name}-{}", std::process::id());
        let mut options = MqttOptions::new(id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keepalive_secs));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let qos = match cfg.effective_qos() {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        Self {
            client,
            eventloop,
            prefix,
            qos,
            cache: PropertyCache::default(),
            sync_token: None,
        }
    }

    /// The configured topic prefix (always `/`-terminated).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Strip the prefix from an incoming topic, if it matches.
    pub fn strip_prefix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(&self.prefix)
    }

    /// Subscribe to a prefix-relative topic (wildcards allowed).
    pub async fn subscribe(&self, suffix: &str) -> Result<()> {
        let topic = format!("{}{suffix}", self.prefix);
        self.client.subscribe(topic, self.qos).await?;
        Ok(())
    }

    /// Subscribe to an absolute topic.
    pub async fn subscribe_abs(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, self.qos).await?;
        Ok(())
    }

    /// Publish a retained property on a prefix-relative topic, but only
    /// when the value changed. `None` clears the topic. Returns whether
    /// a publish happened.
    pub async fn publish_if_changed(&mut self, suffix: &str, value: Option<&str>) -> Result<bool> {
        if !self.cache.update(suffix, value) {
            return Ok(false);
        }
        let topic = format!("{}{suffix}", self.prefix);
        debug!("publish {topic}={:?}", value.unwrap_or(""));
        self.client
            .publish(topic, self.qos, true, value.unwrap_or(""))
            .await?;
        Ok(true)
    }

    /// Publish a non-retained event on a prefix-relative topic.
    pub async fn publish_event(&self, suffix: &str, value: &str) -> Result<()> {
        let topic = format!("{}{suffix}", self.prefix);
        debug!("publish {topic}={value:?}");
        self.client.publish(topic, self.qos, false, value).await?;
        Ok(())
    }

    /// Publish on an absolute topic.
    pub async fn publish_abs(&self, topic: &str, value: &str, retain: bool) -> Result<()> {
        self.client
            .publish(topic.to_string(), self.qos, retain, value)
            .await?;
        Ok(())
    }

    /// Drive the connection. Resolves with the next incoming publish;
    /// connection housekeeping (acks, pings) yields `Ok(None)`.
    pub async fn poll(&mut self) -> Result<Option<Incoming>> {
        match self.eventloop.poll().await? {
            Event::Incoming(Packet::Publish(p)) => Ok(Some(Incoming {
                topic: p.topic.clone(),
                payload: String::from_utf8_lossy(&p.payload).into_owned(),
                retained: p.retain,
            })),
            _ => Ok(None),
        }
    }

    /// True when `msg` is our own self-sync token coming back.
    pub fn is_self_sync(&self, msg: &Incoming) -> bool {
        msg.topic == SELF_SYNC_TOPIC
            && self
                .sync_token
                .as_ref()
                .is_some_and(|token| *token == msg.payload)
    }

    /// Clear every retained property this process published.
    pub async fn clear_retained(&mut self) -> Result<()> {
        for suffix in self.cache.occupied() {
            let topic = format!("{}{suffix}", self.prefix);
            self.client.publish(topic, self.qos, true, "").await?;
        }
        self.cache.clear();
        Ok(())
    }

    /// Flush-and-exit protocol: clear retained state, then publish a
    /// unique token to the self-sync topic and drain the connection
    /// until the token comes back.
    pub async fn self_sync_shutdown(&mut self) -> Result<()> {
        self.clear_retained().await?;

        let token = uuid::Uuid::new_v4().to_string();
        self.subscribe_abs(SELF_SYNC_TOPIC).await?;
        self.publish_abs(SELF_SYNC_TOPIC, &token, false).await?;
        self.sync_token = Some(token);

        loop {
            match self.poll().await {
                Ok(Some(msg)) if self.is_self_sync(&msg) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    warn!("broker lost during shutdown sync: {e}");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_publish_economy() {
        let mut cache = PropertyCache::default();
        let mut publishes = 0;
        for value in ["-89", "-89", "-91", "-91", "-89"] {
            if cache.update("rssi", Some(value)) {
                publishes += 1;
            }
        }
        // distinct consecutive values: -89, -91, -89
        assert_eq!(publishes, 3);
    }

    #[test]
    fn test_cache_none_equals_empty() {
        let mut cache = PropertyCache::default();
        assert!(!cache.update("ber", None));
        assert!(!cache.update("ber", Some("")));
        assert!(cache.update("ber", Some("0.5% -- 1%")));
        assert!(cache.update("ber", None));
        assert!(!cache.update("ber", None));
    }

    #[test]
    fn test_cache_occupied_tracks_clears() {
        let mut cache = PropertyCache::default();
        cache.update("rssi", Some("-89"));
        cache.update("ber", Some("<0.01%"));
        cache.update("ber", None);
        let occupied = cache.occupied();
        assert_eq!(occupied, vec!["rssi".to_string()]);
    }
}
