//! Sidechannel transport boundary. The coordinator consumes a topic-based
//! pub/sub transport whose admission to `swap:`-prefixed channels is gated by
//! owner-issued invites. Capabilities are signed records; at the envelope
//! layer they travel as opaque strings.

pub mod memory;

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::canonical;
use crate::envelope::codec;

const CAPABILITY_VERSION: u64 = 1;

#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("capability signature verification failed")]
    BadSig,
    #[error("capability expired at {expires_unix} (now {now_unix})")]
    Expired { expires_unix: i64, now_unix: i64 },
    #[error("capability is for channel {capability:?}, not {channel:?}")]
    WrongChannel { capability: String, channel: String },
    #[error("invite is for {invitee:?}, not {sender:?}")]
    WrongInvitee { invitee: String, sender: String },
    #[error("capability issuer {got:?} is not the channel owner {want:?}")]
    WrongOwner { want: String, got: String },
    #[error("invite required for gated channel {0:?}")]
    InviteRequired(String),
    #[error("malformed capability: {0}")]
    Malformed(String),
}

/// Signed declaration of a channel's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub v: u64,
    pub channel: String,
    pub owner_pubkey: String,
    pub issued_unix: i64,
    pub signature: String,
}

impl Welcome {
    pub fn issue(channel: &str, owner_key: &SigningKey, issued_unix: i64) -> Self {
        let mut welcome = Self {
            v: CAPABILITY_VERSION,
            channel: channel.to_string(),
            owner_pubkey: hex::encode(owner_key.verifying_key().as_bytes()),
            issued_unix,
            signature: String::new(),
        };
        welcome.signature = hex::encode(owner_key.sign(&welcome.signing_bytes()).to_bytes());
        welcome
    }

    pub fn verify(&self) -> Result<(), CapabilityError> {
        verify_capability(&self.owner_pubkey, &self.signature, &self.signing_bytes())
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("welcome serialization must not fail")
    }

    pub fn decode(s: &str) -> Result<Self, CapabilityError> {
        serde_json::from_str(s).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }

    fn signing_bytes(&self) -> Vec<u8> {
        capability_signing_bytes(self)
    }
}

/// Signed grant admitting one invitee public key to a channel until a
/// deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub v: u64,
    pub channel: String,
    pub owner_pubkey: String,
    pub invitee_pubkey: String,
    pub expires_unix: i64,
    pub signature: String,
}

impl Invite {
    pub fn issue(
        channel: &str,
        invitee_pubkey: &str,
        owner_key: &SigningKey,
        expires_unix: i64,
    ) -> Self {
        let mut invite = Self {
            v: CAPABILITY_VERSION,
            channel: channel.to_string(),
            owner_pubkey: hex::encode(owner_key.verifying_key().as_bytes()),
            invitee_pubkey: invitee_pubkey.to_string(),
            expires_unix,
            signature: String::new(),
        };
        invite.signature = hex::encode(owner_key.sign(&invite.signing_bytes()).to_bytes());
        invite
    }

    pub fn verify(&self) -> Result<(), CapabilityError> {
        verify_capability(&self.owner_pubkey, &self.signature, &self.signing_bytes())
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("invite serialization must not fail")
    }

    pub fn decode(s: &str) -> Result<Self, CapabilityError> {
        serde_json::from_str(s).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }

    fn signing_bytes(&self) -> Vec<u8> {
        capability_signing_bytes(self)
    }
}

/// Admission check for `sender` on `channel`. Channels carrying
/// `gated_prefix` require a valid, unexpired invite naming the sender and
/// signed by the channel owner; everything else is open.
pub fn check_admission(
    gated_prefix: &str,
    channel: &str,
    channel_owner: &str,
    sender_pubkey: &str,
    invite: Option<&Invite>,
    now_unix: i64,
) -> Result<(), CapabilityError> {
    if !channel.starts_with(gated_prefix) {
        return Ok(());
    }
    // The channel owner does not invite itself.
    if sender_pubkey == channel_owner {
        return Ok(());
    }

    let invite = invite.ok_or_else(|| CapabilityError::InviteRequired(channel.to_string()))?;
    invite.verify()?;
    if invite.channel != channel {
        return Err(CapabilityError::WrongChannel {
            capability: invite.channel.clone(),
            channel: channel.to_string(),
        });
    }
    if invite.owner_pubkey != channel_owner {
        return Err(CapabilityError::WrongOwner {
            want: channel_owner.to_string(),
            got: invite.owner_pubkey.clone(),
        });
    }
    if invite.invitee_pubkey != sender_pubkey {
        return Err(CapabilityError::WrongInvitee {
            invitee: invite.invitee_pubkey.clone(),
            sender: sender_pubkey.to_string(),
        });
    }
    if now_unix >= invite.expires_unix {
        return Err(CapabilityError::Expired {
            expires_unix: invite.expires_unix,
            now_unix,
        });
    }
    Ok(())
}

fn capability_signing_bytes<T: Serialize>(capability: &T) -> Vec<u8> {
    let mut value =
        serde_json::to_value(capability).expect("capability serialization must not fail");
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    canonical::encode_canonical(&value).expect("capability has no floats")
}

fn verify_capability(
    pubkey_hex: &str,
    signature_hex: &str,
    bytes: &[u8],
) -> Result<(), CapabilityError> {
    let key = codec::parse_pubkey(pubkey_hex).map_err(|_| CapabilityError::BadSig)?;
    let raw = hex::decode(signature_hex).map_err(|_| CapabilityError::BadSig)?;
    let raw: [u8; 64] = raw.try_into().map_err(|_| CapabilityError::BadSig)?;
    let signature = ed25519_dalek::Signature::from_bytes(&raw);
    use ed25519_dalek::Verifier as _;
    key.verify(bytes, &signature)
        .map_err(|_| CapabilityError::BadSig)
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct SidechannelMessage {
    pub channel: String,
    pub sender_pubkey: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SidechannelError {
    #[error("admission denied: {0}")]
    AdmissionDenied(#[from] CapabilityError),
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// The consumed pub/sub transport surface.
#[async_trait]
pub trait Sidechannel: Send + Sync {
    async fn subscribe(&self, channels: &[String]) -> Result<(), SidechannelError>;

    /// Declares a channel with this endpoint as owner, publishing `welcome`.
    async fn host(&self, channel: &str, welcome: &Welcome) -> Result<(), SidechannelError>;

    /// Joins a channel, presenting an invite for gated channels.
    async fn join(
        &self,
        channel: &str,
        invite: Option<&Invite>,
        welcome: Option<&Welcome>,
    ) -> Result<(), SidechannelError>;

    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<(), SidechannelError>;

    /// Next message on any subscribed channel.
    async fn recv(&self) -> Result<SidechannelMessage, SidechannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn invite_admission_checks() {
        let owner = SigningKey::generate(&mut OsRng);
        let owner_hex = hex::encode(owner.verifying_key().as_bytes());
        let guest = SigningKey::generate(&mut OsRng);
        let guest_hex = hex::encode(guest.verifying_key().as_bytes());

        let invite = Invite::issue("swap:t1", &guest_hex, &owner, 2_000);
        invite.verify().unwrap();

        check_admission("swap:", "swap:t1", &owner_hex, &guest_hex, Some(&invite), 1_000)
            .unwrap();

        // No invite.
        assert!(matches!(
            check_admission("swap:", "swap:t1", &owner_hex, &guest_hex, None, 1_000),
            Err(CapabilityError::InviteRequired(_))
        ));
        // Expired.
        assert!(matches!(
            check_admission("swap:", "swap:t1", &owner_hex, &guest_hex, Some(&invite), 2_000),
            Err(CapabilityError::Expired { .. })
        ));
        // Someone else's invite.
        let other_hex = hex::encode(
            SigningKey::generate(&mut OsRng)
                .verifying_key()
                .as_bytes(),
        );
        assert!(matches!(
            check_admission("swap:", "swap:t1", &owner_hex, &other_hex, Some(&invite), 1_000),
            Err(CapabilityError::WrongInvitee { .. })
        ));
        // Public channels need nothing.
        check_admission("swap:", "lobby", &owner_hex, &guest_hex, None, 1_000).unwrap();
    }

    #[test]
    fn tampered_invite_fails_verification() {
        let owner = SigningKey::generate(&mut OsRng);
        let mut invite = Invite::issue("swap:t1", "aa", &owner, 2_000);
        invite.channel = "swap:t2".to_string();
        assert!(matches!(invite.verify(), Err(CapabilityError::BadSig)));
    }

    #[test]
    fn welcome_round_trips_as_opaque_string() {
        let owner = SigningKey::generate(&mut OsRng);
        let welcome = Welcome::issue("lobby", &owner, 1_000);
        let decoded = Welcome::decode(&welcome.encode()).unwrap();
        assert_eq!(decoded, welcome);
        decoded.verify().unwrap();
    }
}
