//! In-process Lightning network: a shared hub of invoices keyed by bolt11,
//! with one `MemoryLightning` endpoint per peer. Paying an invoice settles it
//! immediately and reveals the preimage to the payer, mirroring the only
//! behavior the protocol allows (no hodl).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

use super::{CreatedInvoice, LightningError, LightningRpc, PaymentOutcome};

#[derive(Clone, Default)]
pub struct MemoryLightningHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    invoices: HashMap<String, InvoiceEntry>,
}

struct InvoiceEntry {
    receiver: String,
    amount_msat: u64,
    preimage: [u8; 32],
    settled: bool,
}

impl MemoryLightningHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint acting as `node_id` on this hub.
    pub fn node(&self, node_id: &str) -> MemoryLightning {
        MemoryLightning {
            hub: self.clone(),
            node_id: node_id.to_string(),
        }
    }

    /// Millisatoshis received by `node_id` through settled invoices.
    pub fn settled_msat(&self, node_id: &str) -> u64 {
        self.inner
            .lock()
            .expect("lightning hub mutex poisoned")
            .invoices
            .values()
            .filter(|e| e.settled && e.receiver == node_id)
            .map(|e| e.amount_msat)
            .sum()
    }
}

#[derive(Clone)]
pub struct MemoryLightning {
    hub: MemoryLightningHub,
    node_id: String,
}

#[async_trait]
impl LightningRpc for MemoryLightning {
    async fn invoice(
        &self,
        amount_msat: u64,
        label: &str,
        _description: &str,
    ) -> Result<CreatedInvoice, LightningError> {
        let mut preimage = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut preimage);
        let payment_hash_hex = hex::encode(Sha256::digest(preimage));

        // Synthetic bolt11: opaque to everything in the coordinator, unique
        // per invoice.
        let bolt11 = format!("lnsim1{amount_msat}m{payment_hash_hex}x{label}");

        let mut inner = self
            .hub
            .inner
            .lock()
            .expect("lightning hub mutex poisoned");
        inner.invoices.insert(
            bolt11.clone(),
            InvoiceEntry {
                receiver: self.node_id.clone(),
                amount_msat,
                preimage,
                settled: false,
            },
        );

        Ok(CreatedInvoice {
            bolt11,
            payment_hash_hex,
        })
    }

    async fn pay(&self, bolt11: &str) -> Result<PaymentOutcome, LightningError> {
        let mut inner = self
            .hub
            .inner
            .lock()
            .expect("lightning hub mutex poisoned");
        let entry = inner
            .invoices
            .get_mut(bolt11)
            .ok_or(LightningError::UnknownInvoice)?;
        if entry.settled {
            return Err(LightningError::AlreadySettled);
        }
        entry.settled = true;
        Ok(PaymentOutcome {
            preimage_hex: hex::encode(entry.preimage),
        })
    }
}
