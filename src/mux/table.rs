//! Stream table
//!
//! Maps stream ids to their writer or reader state. Entries are created on
//! first reference; whether an id is written or read follows from its parity
//! and the local role.
//!
//! Evicting a read stream that still had credit outstanding leaves a
//! retired entry behind. The writer may not have seen the final StopRead
//! yet and can still give that credit back; the retired entry absorbs such
//! ForgoCredit packets until the writer starts the next lifetime of the id
//! with a Write or StopWrite.

use super::error::ViolationKind;
use super::packet::Role;
use super::stream::{Completion, Phase, ReaderState, StreamState, WriterState};
use super::StreamId;
use std::collections::HashMap;
use tracing::debug;

/// Stream table
///
/// Owns the state of every live stream of a connection.
#[derive(Debug)]
pub struct StreamTable {
    /// Local role
    role: Role,
    /// Live streams
    streams: HashMap<StreamId, StreamState>,
    /// Credit outstanding on evicted read streams
    retired: HashMap<StreamId, u64>,
}

impl StreamTable {
    /// Create an empty table for an endpoint with `role`
    pub fn new(role: Role) -> Self {
        StreamTable {
            role,
            streams: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Get the local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get a stream by ID
    pub fn get(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    /// Get a live stream by ID, without creating it
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    /// Get or create a stream
    ///
    /// A new entry is a writer if the local role writes `id`, otherwise a
    /// reader, with no credit, no limits and phase Open.
    pub fn get_or_create(&mut self, id: StreamId) -> &mut StreamState {
        let role = self.role;
        self.streams.entry(id).or_insert_with(|| {
            debug!(id, %role, writer = role.writes(id), "stream created");
            if role.writes(id) {
                StreamState::Writer(WriterState::new(id))
            } else {
                StreamState::Reader(ReaderState::new(id))
            }
        })
    }

    /// Get or create the writer state of `id`
    ///
    /// Fails with [`ViolationKind::IdOutOfRole`] if the local role reads `id`.
    pub fn writer_mut(&mut self, id: StreamId) -> Result<&mut WriterState, ViolationKind> {
        if !self.role.writes(id) {
            return Err(ViolationKind::IdOutOfRole);
        }
        self.get_or_create(id)
            .as_writer_mut()
            .ok_or(ViolationKind::IdOutOfRole)
    }

    /// Get or create the reader state of `id`
    ///
    /// Fails with [`ViolationKind::IdOutOfRole`] if the local role writes `id`.
    pub fn reader_mut(&mut self, id: StreamId) -> Result<&mut ReaderState, ViolationKind> {
        if !self.role.reads(id) {
            return Err(ViolationKind::IdOutOfRole);
        }
        self.get_or_create(id)
            .as_reader_mut()
            .ok_or(ViolationKind::IdOutOfRole)
    }

    /// Get the phase of a stream; unknown streams are Open
    pub fn phase(&self, id: StreamId) -> Phase {
        self.streams.get(&id).map_or(Phase::Open, StreamState::phase)
    }

    /// Get the completion signals of a stream
    pub fn completion(&self, id: StreamId) -> Completion {
        self.streams
            .get(&id)
            .map(StreamState::completion)
            .unwrap_or_default()
    }

    /// Remove a stream whose phase is Closed
    ///
    /// Returns false, keeping the entry, if the stream is unknown or not
    /// closed. A read stream with credit outstanding is retired.
    pub fn try_evict(&mut self, id: StreamId) -> bool {
        let closed = self
            .streams
            .get(&id)
            .map_or(false, |stream| stream.phase().is_closed());
        if !closed {
            return false;
        }
        if let Some(StreamState::Reader(reader)) = self.streams.remove(&id) {
            let outstanding = reader.credit_balance();
            if outstanding > 0 {
                self.retired.insert(id, outstanding);
            }
        }
        debug!(id, "stream evicted");
        true
    }

    /// Credit still outstanding on a retired read stream
    pub fn retired_credit(&self, id: StreamId) -> Option<u64> {
        self.retired.get(&id).copied()
    }

    /// Apply a ForgoCredit to a retired read stream
    ///
    /// Draws on the credit left outstanding at eviction and returns the part
    /// of `amount` it could not cover, which belongs to the live stream.
    pub fn forgo_retired(&mut self, id: StreamId, amount: u64) -> u64 {
        let Some(outstanding) = self.retired.get_mut(&id) else {
            return amount;
        };
        let covered = amount.min(*outstanding);
        *outstanding -= covered;
        if *outstanding == 0 {
            self.retired.remove(&id);
        }
        debug!(id, covered, "forgo on retired stream");
        amount - covered
    }

    /// Drop the retired entry of `id` once its writer moved on
    pub fn end_retirement(&mut self, id: StreamId) {
        if self.retired.remove(&id).is_some() {
            debug!(id, "retired stream reused");
        }
    }

    /// Get number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Check if there are no live streams
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Get all stream IDs
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Drop every stream
    pub fn clear(&mut self) {
        self.streams.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_by_parity() {
        let mut table = StreamTable::new(Role::Proactive);
        assert!(table.is_empty());

        assert!(matches!(table.get_or_create(0), StreamState::Writer(_)));
        assert!(matches!(table.get_or_create(1), StreamState::Reader(_)));
        assert_eq!(table.len(), 2);

        let mut table = StreamTable::new(Role::Reactive);
        assert!(matches!(table.get_or_create(1), StreamState::Writer(_)));
        assert!(matches!(table.get_or_create(64), StreamState::Reader(_)));
    }

    #[test]
    fn test_role_mismatch() {
        let mut table = StreamTable::new(Role::Proactive);
        assert_eq!(table.writer_mut(1).unwrap_err(), ViolationKind::IdOutOfRole);
        assert_eq!(table.reader_mut(2).unwrap_err(), ViolationKind::IdOutOfRole);
        assert!(table.is_empty());

        table.writer_mut(2).unwrap().grant_credit(5).unwrap();
        assert_eq!(table.writer_mut(2).unwrap().credit(), 5);
    }

    #[test]
    fn test_try_evict_requires_closed() {
        let mut table = StreamTable::new(Role::Reactive);
        assert!(!table.try_evict(3));

        table.writer_mut(3).unwrap().announce_stop_write(0).unwrap();
        assert_eq!(table.phase(3), Phase::FinalPending);
        assert!(!table.try_evict(3));

        table.writer_mut(3).unwrap().send_final().unwrap();
        assert!(table.completion(3).write_closed);
        assert!(table.try_evict(3));
        assert!(table.get(3).is_none());
        assert_eq!(table.phase(3), Phase::Open);
    }

    #[test]
    fn test_evicted_reader_keeps_outstanding_credit() {
        let mut table = StreamTable::new(Role::Proactive);
        let reader = table.reader_mut(1).unwrap();
        reader.grant(10).unwrap();
        reader.record_write(4).unwrap();
        reader.observe_stop_write(0).unwrap();
        reader.record_final().unwrap();
        reader.announce_stop_read(0).unwrap();

        assert!(table.try_evict(1));
        assert!(table.get(1).is_none());
        assert_eq!(table.retired_credit(1), Some(6));

        assert_eq!(table.forgo_retired(1, 2), 0);
        assert_eq!(table.retired_credit(1), Some(4));
        assert_eq!(table.forgo_retired(1, 7), 3);
        assert_eq!(table.retired_credit(1), None);
        assert_eq!(table.forgo_retired(1, 1), 1);
    }

    #[test]
    fn test_end_retirement() {
        let mut table = StreamTable::new(Role::Proactive);
        let reader = table.reader_mut(3).unwrap();
        reader.grant(5).unwrap();
        reader.observe_stop_write(0).unwrap();
        reader.record_final().unwrap();
        assert!(table.try_evict(3));
        assert_eq!(table.retired_credit(3), Some(5));

        table.end_retirement(3);
        assert_eq!(table.retired_credit(3), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stream_ids_and_clear() {
        let mut table = StreamTable::new(Role::Proactive);
        table.get_or_create(4);
        table.get_or_create(9);

        let mut ids = table.stream_ids();
        ids.sort();
        assert_eq!(ids, vec![4, 9]);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.completion(4), Completion::default());
    }
}
