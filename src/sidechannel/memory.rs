//! In-process pub/sub hub with sender-side gating: messages on gated
//! channels are only handed to subscribers whose admission was checked at
//! join time, so an uninvited subscriber of a `swap:*` topic receives
//! nothing at all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Invite, Sidechannel, SidechannelError, SidechannelMessage, Welcome, check_admission,
};

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    gated_prefix: String,
}

struct HubInner {
    /// channel -> owner pubkey, set by `host`.
    owners: HashMap<String, String>,
    /// pubkey -> subscribed channels.
    subscriptions: HashMap<String, HashSet<String>>,
    /// channel -> pubkeys admitted past the gate.
    admitted: HashMap<String, HashSet<String>>,
    /// pubkey -> delivery queue.
    outboxes: HashMap<String, mpsc::UnboundedSender<SidechannelMessage>>,
    clock_unix: i64,
}

impl MemoryHub {
    pub fn new(gated_prefix: &str, clock_unix: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                owners: HashMap::new(),
                subscriptions: HashMap::new(),
                admitted: HashMap::new(),
                outboxes: HashMap::new(),
                clock_unix,
            })),
            gated_prefix: gated_prefix.to_string(),
        }
    }

    pub fn set_clock(&self, clock_unix: i64) {
        self.lock().clock_unix = clock_unix;
    }

    /// An endpoint identified by `pubkey_hex` on this hub.
    pub fn endpoint(&self, pubkey_hex: &str) -> MemoryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().outboxes.insert(pubkey_hex.to_string(), tx);
        MemoryEndpoint {
            hub: self.clone(),
            pubkey_hex: pubkey_hex.to_string(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().expect("sidechannel hub mutex poisoned")
    }
}

pub struct MemoryEndpoint {
    hub: MemoryHub,
    pubkey_hex: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SidechannelMessage>>,
}

#[async_trait]
impl Sidechannel for MemoryEndpoint {
    async fn subscribe(&self, channels: &[String]) -> Result<(), SidechannelError> {
        let mut inner = self.hub.lock();
        let subs = inner
            .subscriptions
            .entry(self.pubkey_hex.clone())
            .or_default();
        for channel in channels {
            subs.insert(channel.clone());
        }
        Ok(())
    }

    async fn host(&self, channel: &str, welcome: &Welcome) -> Result<(), SidechannelError> {
        welcome.verify().map_err(SidechannelError::AdmissionDenied)?;
        let mut inner = self.hub.lock();
        inner
            .owners
            .insert(channel.to_string(), welcome.owner_pubkey.clone());
        inner
            .admitted
            .entry(channel.to_string())
            .or_default()
            .insert(welcome.owner_pubkey.clone());
        inner
            .subscriptions
            .entry(self.pubkey_hex.clone())
            .or_default()
            .insert(channel.to_string());
        Ok(())
    }

    async fn join(
        &self,
        channel: &str,
        invite: Option<&Invite>,
        _welcome: Option<&Welcome>,
    ) -> Result<(), SidechannelError> {
        let mut inner = self.hub.lock();
        let owner = inner.owners.get(channel).cloned().unwrap_or_default();
        check_admission(
            &self.hub.gated_prefix,
            channel,
            &owner,
            &self.pubkey_hex,
            invite,
            inner.clock_unix,
        )?;
        inner
            .admitted
            .entry(channel.to_string())
            .or_default()
            .insert(self.pubkey_hex.clone());
        inner
            .subscriptions
            .entry(self.pubkey_hex.clone())
            .or_default()
            .insert(channel.to_string());
        Ok(())
    }

    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<(), SidechannelError> {
        let inner = self.hub.lock();
        let gated = channel.starts_with(&self.hub.gated_prefix);

        if gated {
            let admitted = inner
                .admitted
                .get(channel)
                .is_some_and(|set| set.contains(&self.pubkey_hex));
            if !admitted {
                return Err(SidechannelError::AdmissionDenied(
                    super::CapabilityError::InviteRequired(channel.to_string()),
                ));
            }
        }

        for (pubkey, subs) in &inner.subscriptions {
            if pubkey == &self.pubkey_hex || !subs.contains(channel) {
                continue;
            }
            // Sender-side gating: uninvited subscribers never see the bytes.
            if gated
                && !inner
                    .admitted
                    .get(channel)
                    .is_some_and(|set| set.contains(pubkey))
            {
                continue;
            }
            if let Some(tx) = inner.outboxes.get(pubkey) {
                let _ = tx.send(SidechannelMessage {
                    channel: channel.to_string(),
                    sender_pubkey: self.pubkey_hex.clone(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<SidechannelMessage, SidechannelError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(SidechannelError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn key_hex(key: &SigningKey) -> String {
        hex::encode(key.verifying_key().as_bytes())
    }

    #[tokio::test]
    async fn uninvited_subscriber_receives_nothing() {
        let hub = MemoryHub::new("swap:", 1_000);
        let owner_key = SigningKey::generate(&mut OsRng);
        let guest_key = SigningKey::generate(&mut OsRng);
        let snoop_key = SigningKey::generate(&mut OsRng);

        let owner = hub.endpoint(&key_hex(&owner_key));
        let guest = hub.endpoint(&key_hex(&guest_key));
        let snoop = hub.endpoint(&key_hex(&snoop_key));

        let welcome = Welcome::issue("swap:t1", &owner_key, 1_000);
        owner.host("swap:t1", &welcome).await.unwrap();

        let invite = Invite::issue("swap:t1", &key_hex(&guest_key), &owner_key, 2_000);
        guest
            .join("swap:t1", Some(&invite), Some(&welcome))
            .await
            .unwrap();

        // The snoop can subscribe to the topic but cannot join the gate.
        snoop.subscribe(&["swap:t1".to_string()]).await.unwrap();
        assert!(snoop.join("swap:t1", None, Some(&welcome)).await.is_err());

        owner.send("swap:t1", b"secret".to_vec()).await.unwrap();

        let got = guest.recv().await.unwrap();
        assert_eq!(got.payload, b"secret");

        // Nothing was queued for the snoop.
        let pending = {
            let mut rx = snoop.rx.lock().await;
            rx.try_recv()
        };
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn public_channels_deliver_to_all_subscribers() {
        let hub = MemoryHub::new("swap:", 1_000);
        let a_key = SigningKey::generate(&mut OsRng);
        let b_key = SigningKey::generate(&mut OsRng);
        let a = hub.endpoint(&key_hex(&a_key));
        let b = hub.endpoint(&key_hex(&b_key));

        b.subscribe(&["lobby".to_string()]).await.unwrap();
        a.send("lobby", b"hi".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().payload, b"hi");
    }
}
