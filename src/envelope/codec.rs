//! Detached ed25519 signatures over the canonical encoding of unsigned
//! envelopes. 32-byte public keys and 64-byte signatures, both carried as
//! lowercase hex.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

use super::canonical::{self, CanonicalError};
use super::{Envelope, SignedEnvelope};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("signature verification failed")]
    BadSig,
    #[error("malformed signer key: {0}")]
    MalformedKey(String),
    #[error("canonical encoding does not round-trip")]
    CanonMismatch,
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Signs the canonical encoding of `envelope` with `key`.
pub fn sign(envelope: &Envelope, key: &SigningKey) -> Result<SignedEnvelope, CodecError> {
    let bytes = canonical_bytes(envelope)?;
    let signature = key.sign(&bytes);
    Ok(SignedEnvelope {
        envelope: envelope.clone(),
        signer_pubkey: hex::encode(key.verifying_key().as_bytes()),
        signature: hex::encode(signature.to_bytes()),
    })
}

/// Verifies the signature of a signed envelope against its canonical bytes.
pub fn verify(signed: &SignedEnvelope) -> Result<(), CodecError> {
    let key = parse_pubkey(&signed.signer_pubkey)?;
    let signature = parse_signature(&signed.signature)?;
    let bytes = canonical_bytes(&signed.envelope)?;
    key.verify(&bytes, &signature)
        .map_err(|_| CodecError::BadSig)
}

/// Parses a 64-char lowercase hex ed25519 public key.
pub fn parse_pubkey(pubkey_hex: &str) -> Result<VerifyingKey, CodecError> {
    let raw = decode_hex_exact::<32>(pubkey_hex)
        .ok_or_else(|| CodecError::MalformedKey(format!("pubkey {pubkey_hex:?}")))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|_| CodecError::MalformedKey("not a valid curve point".to_string()))
}

fn parse_signature(signature_hex: &str) -> Result<Signature, CodecError> {
    let raw = decode_hex_exact::<64>(signature_hex).ok_or(CodecError::BadSig)?;
    Ok(Signature::from_bytes(&raw))
}

fn decode_hex_exact<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let raw = hex::decode(s).ok()?;
    raw.try_into().ok()
}

fn canonical_bytes(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let wire = envelope.to_wire()?;
    let bytes = canonical::encode_canonical(&wire)?;
    // The encoding must survive a decode/encode cycle; anything else means
    // the envelope is not representable on the wire.
    let reparsed: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| CodecError::CanonMismatch)?;
    if canonical::encode_canonical(&reparsed)? != bytes {
        return Err(CodecError::CanonMismatch);
    }
    Ok(bytes)
}
