//! [`DocumentReplica`] backed by a Yrs document.
//!
//! Remote updates are applied in a transaction whose origin is `"remote"`,
//! so other observers of the same `Doc` can tell them apart too.
//! Local edits go through [`YrsReplica::transact_local`], which hands the
//! resulting v1 update to every registered listener.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::replica::{
    ChangeListener, ChangeSubscription, DocumentReplica, ListenerRegistry, ReplicaError,
    UpdateOrigin,
};

/// A Yrs document shared with the sync client.
pub struct YrsReplica {
    doc: Doc,
    listeners: ListenerRegistry,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self::with_doc(Doc::new())
    }

    /// Wrap an existing document.
    pub fn with_doc(doc: Doc) -> Self {
        Self {
            doc,
            listeners: ListenerRegistry::new(),
        }
    }

    /// The underlying document, for the editor's own reads.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a local edit and publish the update it produced.
    ///
    /// The transaction is committed before listeners run.
    pub fn transact_local<R>(&self, edit: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
        let (result, update) = {
            let mut txn = self.doc.transact_mut_with(UpdateOrigin::Local.as_str());
            let result = edit(&mut txn);
            let update = txn.encode_update_v1();
            (result, update)
        };
        self.listeners.notify(&update, UpdateOrigin::Local);
        result
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentReplica for YrsReplica {
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), ReplicaError> {
        let decoded = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(origin.as_str());
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        self.listeners.notify(update, origin);
        Ok(())
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn on_local_change(&self, listener: ChangeListener) -> ChangeSubscription {
        self.listeners.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use yrs::{GetString, Text};

    fn body_text(replica: &YrsReplica) -> String {
        let text = replica.doc().get_or_insert_text("body");
        let txn = replica.doc().transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_local_edit_notifies_listener() {
        let replica = YrsReplica::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = replica.on_local_change(Arc::new(move |update: &[u8], origin| {
            sink.lock().unwrap().push((update.to_vec(), origin));
        }));

        let text = replica.doc().get_or_insert_text("body");
        replica.transact_local(|txn| text.insert(txn, 0, "hello"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, UpdateOrigin::Local);
        assert!(!seen[0].0.is_empty());
    }

    #[test]
    fn test_remote_apply_converges() {
        let a = YrsReplica::new();
        let b = YrsReplica::new();
        let text = a.doc().get_or_insert_text("body");
        a.transact_local(|txn| text.insert(txn, 0, "shared"));

        b.apply_update(&a.encode_state(), UpdateOrigin::Remote).unwrap();
        assert_eq!(body_text(&b), "shared");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = YrsReplica::new();
        let b = YrsReplica::new();
        let text = a.doc().get_or_insert_text("body");
        a.transact_local(|txn| text.insert(txn, 0, "once"));
        let state = a.encode_state();

        b.apply_update(&state, UpdateOrigin::Remote).unwrap();
        b.apply_update(&state, UpdateOrigin::Remote).unwrap();
        assert_eq!(body_text(&b), "once");
    }

    #[test]
    fn test_remote_apply_reports_remote_origin() {
        let a = YrsReplica::new();
        let b = YrsReplica::new();
        let text = a.doc().get_or_insert_text("body");
        a.transact_local(|txn| text.insert(txn, 0, "x"));

        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        let _sub = b.on_local_change(Arc::new(move |_: &[u8], origin| {
            sink.lock().unwrap().push(origin);
        }));
        b.apply_update(&a.encode_state(), UpdateOrigin::Remote).unwrap();

        assert_eq!(*origins.lock().unwrap(), vec![UpdateOrigin::Remote]);
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let replica = YrsReplica::new();
        let result = replica.apply_update(&[0xFF, 0xFE, 0xFD], UpdateOrigin::Remote);
        assert!(result.is_err());
    }
}
