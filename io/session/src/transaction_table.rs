//! Live transactions keyed by stream id.
//!
//! The outgoing, incoming and pushed counters are updated only by
//! [`add`](TransactionTable::add) and [`remove`](TransactionTable::remove),
//! so `outgoing + incoming` always equals the number of entries.

use crate::codec::StreamId;
use crate::error::SessionError;
use crate::transaction::{Initiator, Transaction};

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct TransactionTable {
    transactions: BTreeMap<StreamId, Transaction>,
    outgoing: usize,
    incoming: usize,
    pushed: usize,
    next_seq_no: u32,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next transaction created on this session.
    pub fn next_seq_no(&mut self) -> u32 {
        let seq_no = self.next_seq_no;
        self.next_seq_no = self.next_seq_no.wrapping_add(1);
        seq_no
    }

    pub fn add(&mut self, txn: Transaction) -> Result<(), SessionError> {
        let id = txn.id();
        if self.transactions.contains_key(&id) {
            return Err(SessionError::DuplicateStream(id));
        }
        match txn.initiator() {
            Initiator::Local => self.outgoing += 1,
            Initiator::Remote => self.incoming += 1,
        }
        if txn.is_pushed() {
            self.pushed += 1;
        }
        self.transactions.insert(id, txn);
        Ok(())
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Transaction> {
        let txn = self.transactions.remove(&id)?;
        match txn.initiator() {
            Initiator::Local => self.outgoing -= 1,
            Initiator::Remote => self.incoming -= 1,
        }
        if txn.is_pushed() {
            self.pushed -= 1;
        }
        Some(txn)
    }

    pub fn get(&self, id: StreamId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Transaction> {
        self.transactions.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.transactions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn outgoing(&self) -> usize {
        self.outgoing
    }

    pub fn incoming(&self) -> usize {
        self.incoming
    }

    pub fn pushed(&self) -> usize {
        self.pushed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Ids of the live transactions in creation order.
    ///
    /// Broadcast operations work from this snapshot: entries that disappear
    /// before their turn are skipped by the caller, and transactions created
    /// after the snapshot are not visited.
    pub fn snapshot(&self) -> Vec<StreamId> {
        let mut ids: Vec<(u32, StreamId)> = self
            .transactions
            .values()
            .map(|t| (t.seq_no(), t.id()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}
