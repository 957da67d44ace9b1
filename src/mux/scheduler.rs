//! Fair outbound scheduler
//!
//! Every stream with pending packets owns a FIFO queue. Streams take turns
//! in round-robin order, one packet per turn, so no stream waits for more
//! than one packet from each other ready stream. Streams with nothing to
//! send are not in the rotation.

use super::packet::Packet;
use super::StreamId;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Round-robin scheduler over per-stream packet queues
#[derive(Debug, Default)]
pub struct FairScheduler {
    /// Pending packets per stream, in send order
    queues: HashMap<StreamId, VecDeque<Packet>>,
    /// Streams with at least one pending packet, in turn order
    ready: VecDeque<StreamId>,
    /// Total pending packets
    pending: usize,
}

impl FairScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet behind earlier packets of the same stream
    pub fn push(&mut self, packet: Packet) {
        let id = packet.id();
        let queue = self.queues.entry(id).or_default();
        if queue.is_empty() {
            self.ready.push_back(id);
        }
        queue.push_back(packet);
        self.pending += 1;
    }

    /// Take the next packet to send
    pub fn next(&mut self) -> Option<Packet> {
        let id = self.ready.pop_front()?;
        let queue = self.queues.get_mut(&id)?;
        let packet = queue.pop_front()?;
        self.pending -= 1;

        if queue.is_empty() {
            self.queues.remove(&id);
        } else {
            self.ready.push_back(id);
        }

        trace!(id, kind = %packet.kind(), ready = self.ready.len(), "scheduled packet");
        Some(packet)
    }

    /// Get number of pending packets
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Get number of pending packets of one stream
    pub fn pending_for(&self, id: StreamId) -> usize {
        self.queues.get(&id).map_or(0, VecDeque::len)
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Streams with pending packets, in turn order
    pub fn ready_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.ready.iter().copied()
    }

    /// Drop every pending packet
    pub fn clear(&mut self) {
        self.queues.clear();
        self.ready.clear();
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn write(id: StreamId, tag: u8) -> Packet {
        Packet::Write {
            id,
            amount: 1,
            data: Bytes::copy_from_slice(&[tag]),
        }
    }

    #[test]
    fn test_empty() {
        let mut scheduler = FairScheduler::new();
        assert!(scheduler.is_empty());
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn test_round_robin_interleaves() {
        let mut scheduler = FairScheduler::new();
        for tag in 0..3 {
            scheduler.push(write(1, tag));
        }
        scheduler.push(write(3, 10));
        scheduler.push(write(5, 20));
        assert_eq!(scheduler.pending(), 5);
        assert_eq!(scheduler.ready_streams().collect::<Vec<_>>(), vec![1, 3, 5]);

        let order: Vec<StreamId> = std::iter::from_fn(|| scheduler.next())
            .map(|p| p.id())
            .collect();
        assert_eq!(order, vec![1, 3, 5, 1, 1]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_per_stream_order_preserved() {
        let mut scheduler = FairScheduler::new();
        scheduler.push(Packet::GiveCredit { id: 2, amount: 1 });
        scheduler.push(write(1, 0));
        scheduler.push(Packet::StopRead { id: 2, amount: 0 });
        scheduler.push(write(1, 1));

        let packets: Vec<Packet> = std::iter::from_fn(|| scheduler.next()).collect();
        let stream_two: Vec<&Packet> = packets.iter().filter(|p| p.id() == 2).collect();
        assert_eq!(
            stream_two,
            vec![
                &Packet::GiveCredit { id: 2, amount: 1 },
                &Packet::StopRead { id: 2, amount: 0 }
            ]
        );
        let stream_one: Vec<&Packet> = packets.iter().filter(|p| p.id() == 1).collect();
        assert_eq!(stream_one, vec![&write(1, 0), &write(1, 1)]);
    }

    #[test]
    fn test_idle_stream_rejoins_at_back() {
        let mut scheduler = FairScheduler::new();
        scheduler.push(write(1, 0));
        scheduler.push(write(3, 0));
        scheduler.push(write(3, 1));

        assert_eq!(scheduler.next().map(|p| p.id()), Some(1));
        assert_eq!(scheduler.pending_for(1), 0);

        scheduler.push(write(1, 1));
        assert_eq!(scheduler.next().map(|p| p.id()), Some(3));
        assert_eq!(scheduler.next().map(|p| p.id()), Some(1));
        assert_eq!(scheduler.next().map(|p| p.id()), Some(3));
    }

    #[test]
    fn test_every_stream_served_within_n_rounds() {
        let mut scheduler = FairScheduler::new();
        let streams: Vec<StreamId> = (0..16).map(|i| i * 2 + 1).collect();
        for &id in &streams {
            for tag in 0..50 {
                scheduler.push(write(id, tag));
            }
        }

        let n = streams.len();
        for _ in 0..20 {
            let window: Vec<StreamId> = (0..n).filter_map(|_| scheduler.next()).map(|p| p.id()).collect();
            for id in &streams {
                assert!(window.contains(id), "stream {} starved", id);
            }
        }
    }

    #[test]
    fn test_clear() {
        let mut scheduler = FairScheduler::new();
        scheduler.push(write(1, 0));
        scheduler.clear();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.ready_streams().count(), 0);
    }
}
