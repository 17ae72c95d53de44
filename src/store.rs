//! Persistence seam for settlement state.
//!
//! The trait is object-safe and synchronous; the in-memory implementation
//! guards each record family with its own `RwLock`. All status transitions go
//! through compare-and-set updates so concurrent confirm/cancel/callback
//! writers cannot interleave a stale read with a write.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::batch::BatchSettlement;
use crate::types::{PaymentIntent, PaymentStatus, TransferRecord};
use crate::utils::now_ms;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("status conflict: record is {current:?}")]
    StatusConflict { current: PaymentStatus },
}

/// Either kind of settlement record a callback may target. Callbacks carry a
/// computation id, not an entity kind, so resolution returns this union.
#[derive(Debug, Clone)]
pub enum Entity {
    Intent(PaymentIntent),
    Transfer(TransferRecord),
}

pub enum EntityMut<'a> {
    Intent(&'a mut PaymentIntent),
    Transfer(&'a mut TransferRecord),
}

pub trait SettlementStore: Send + Sync {
    fn insert_intent(&self, intent: PaymentIntent);
    fn get_intent(&self, id: &str) -> Option<PaymentIntent>;
    /// Newest-first listing with an optional status filter.
    fn list_intents(&self, status: Option<PaymentStatus>) -> Vec<PaymentIntent>;

    /// Unconditional atomic read-modify-write.
    fn update_intent(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut PaymentIntent),
    ) -> Result<PaymentIntent, StoreError>;

    /// Atomic read-modify-write gated on the current status. The closure runs
    /// only when the record's status is one of `expected`.
    fn update_intent_if_status(
        &self,
        id: &str,
        expected: &[PaymentStatus],
        apply: &mut dyn FnMut(&mut PaymentIntent),
    ) -> Result<PaymentIntent, StoreError>;

    fn insert_transfer(&self, transfer: TransferRecord);
    fn get_transfer(&self, id: &str) -> Option<TransferRecord>;
    fn update_transfer(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut TransferRecord),
    ) -> Result<TransferRecord, StoreError>;

    /// Resolve whichever record owns this computation id, if any.
    fn find_by_computation_id(&self, computation_id: &str) -> Option<Entity>;

    /// Atomic update of whichever record owns this computation id. Returns
    /// `false` when no record matches.
    fn update_by_computation_id(
        &self,
        computation_id: &str,
        apply: &mut dyn FnMut(EntityMut<'_>),
    ) -> bool;

    fn insert_batch(&self, batch: BatchSettlement);
    fn get_batch(&self, id: &str) -> Option<BatchSettlement>;
    fn update_batch(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut BatchSettlement),
    ) -> Result<BatchSettlement, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    intents: RwLock<HashMap<String, PaymentIntent>>,
    transfers: RwLock<HashMap<String, TransferRecord>>,
    batches: RwLock<HashMap<String, BatchSettlement>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettlementStore for MemoryStore {
    fn insert_intent(&self, intent: PaymentIntent) {
        self.intents
            .write()
            .expect("intents lock poisoned")
            .insert(intent.id.clone(), intent);
    }

    fn get_intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents
            .read()
            .expect("intents lock poisoned")
            .get(id)
            .cloned()
    }

    fn list_intents(&self, status: Option<PaymentStatus>) -> Vec<PaymentIntent> {
        let mut out: Vec<PaymentIntent> = self
            .intents
            .read()
            .expect("intents lock poisoned")
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_ms.cmp(&a.created_ms).then(a.id.cmp(&b.id)));
        out
    }

    fn update_intent(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut PaymentIntent),
    ) -> Result<PaymentIntent, StoreError> {
        let mut map = self.intents.write().expect("intents lock poisoned");
        let intent = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(intent);
        intent.updated_ms = now_ms();
        Ok(intent.clone())
    }

    fn update_intent_if_status(
        &self,
        id: &str,
        expected: &[PaymentStatus],
        apply: &mut dyn FnMut(&mut PaymentIntent),
    ) -> Result<PaymentIntent, StoreError> {
        let mut map = self.intents.write().expect("intents lock poisoned");
        let intent = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !expected.contains(&intent.status) {
            return Err(StoreError::StatusConflict {
                current: intent.status,
            });
        }
        apply(intent);
        intent.updated_ms = now_ms();
        Ok(intent.clone())
    }

    fn insert_transfer(&self, transfer: TransferRecord) {
        self.transfers
            .write()
            .expect("transfers lock poisoned")
            .insert(transfer.id.clone(), transfer);
    }

    fn get_transfer(&self, id: &str) -> Option<TransferRecord> {
        self.transfers
            .read()
            .expect("transfers lock poisoned")
            .get(id)
            .cloned()
    }

    fn update_transfer(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut TransferRecord),
    ) -> Result<TransferRecord, StoreError> {
        let mut map = self.transfers.write().expect("transfers lock poisoned");
        let transfer = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(transfer);
        transfer.updated_ms = now_ms();
        Ok(transfer.clone())
    }

    fn find_by_computation_id(&self, computation_id: &str) -> Option<Entity> {
        if let Some(intent) = self
            .intents
            .read()
            .expect("intents lock poisoned")
            .values()
            .find(|i| i.computation.computation_id.as_deref() == Some(computation_id))
        {
            return Some(Entity::Intent(intent.clone()));
        }
        self.transfers
            .read()
            .expect("transfers lock poisoned")
            .values()
            .find(|t| t.computation.computation_id.as_deref() == Some(computation_id))
            .map(|t| Entity::Transfer(t.clone()))
    }

    fn update_by_computation_id(
        &self,
        computation_id: &str,
        apply: &mut dyn FnMut(EntityMut<'_>),
    ) -> bool {
        {
            let mut intents = self.intents.write().expect("intents lock poisoned");
            if let Some(intent) = intents
                .values_mut()
                .find(|i| i.computation.computation_id.as_deref() == Some(computation_id))
            {
                apply(EntityMut::Intent(intent));
                intent.updated_ms = now_ms();
                return true;
            }
        }
        let mut transfers = self.transfers.write().expect("transfers lock poisoned");
        if let Some(transfer) = transfers
            .values_mut()
            .find(|t| t.computation.computation_id.as_deref() == Some(computation_id))
        {
            apply(EntityMut::Transfer(transfer));
            transfer.updated_ms = now_ms();
            return true;
        }
        false
    }

    fn insert_batch(&self, batch: BatchSettlement) {
        self.batches
            .write()
            .expect("batches lock poisoned")
            .insert(batch.id.clone(), batch);
    }

    fn get_batch(&self, id: &str) -> Option<BatchSettlement> {
        self.batches
            .read()
            .expect("batches lock poisoned")
            .get(id)
            .cloned()
    }

    fn update_batch(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut BatchSettlement),
    ) -> Result<BatchSettlement, StoreError> {
        let mut map = self.batches.write().expect("batches lock poisoned");
        let batch = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(batch);
        batch.updated_ms = now_ms();
        Ok(batch.clone())
    }
}
