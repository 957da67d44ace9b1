//! Multiplexed connection
//!
//! [`Connection`] is a sans-I/O state machine. Inbound bytes are fed with
//! [`Connection::receive`] and come out as [`Event`]s; producer requests are
//! validated against the stream table, queued on the fair scheduler and
//! handed out as bytes by [`Connection::poll_transmit`].
//!
//! Any protocol violation by the peer terminates the connection. The
//! violation is recorded once and returned by every later call.

use super::codec::{Header, ItemFraming, PacketCodec};
use super::error::{ConnectionError, EncodeError, Error, Result, ViolationKind};
use super::packet::{Packet, PacketKind, Role};
use super::scheduler::FairScheduler;
use super::settings::MuxSettings;
use super::stream::{Completion, Phase, StreamState};
use super::table::StreamTable;
use super::StreamId;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, error, trace, warn};

/// Something the peer did, delivered to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Regular items arrived on a stream this endpoint reads
    Items {
        id: StreamId,
        amount: u64,
        data: Bytes,
    },
    /// The terminal item arrived; the peer will write nothing more
    Final { id: StreamId, data: Bytes },
    /// The peer granted credit on a stream this endpoint writes
    CreditGranted {
        id: StreamId,
        amount: u64,
        credit: u64,
    },
    /// The peer capped the credit it will still grant
    StopRead { id: StreamId, limit: u64 },
    /// The peer capped the items it will still write
    StopWrite { id: StreamId, limit: u64 },
    /// The peer asked this endpoint to forgo credit above `maximum`
    Oops { id: StreamId, maximum: u64 },
    /// The peer gave back credit
    CreditForgone { id: StreamId, amount: u64 },
    /// Advisory promise from the stream's reader
    PromiseWrite { id: StreamId, amount: u64 },
    /// Advisory promise from the stream's writer
    PromiseRead { id: StreamId, amount: u64 },
    /// Both directions completed and the stream was evicted
    Completed { id: StreamId },
}

/// Multiplexed connection state
pub struct Connection<F: ItemFraming> {
    /// Local role
    role: Role,
    /// Local settings
    settings: MuxSettings,
    /// Item layout of the protocol built on top
    framing: F,
    /// Per-stream state
    table: StreamTable,
    /// Outbound packets
    scheduler: FairScheduler,
    /// Undecoded inbound bytes
    inbound: BytesMut,
    /// Decoded events not yet taken by the consumer
    events: VecDeque<Event>,
    /// Set once the connection is terminated
    error: Option<ConnectionError>,
}

impl<F: ItemFraming> Connection<F> {
    /// Create a connection with default settings
    pub fn new(role: Role, framing: F) -> Self {
        Self::with_settings(role, MuxSettings::new(), framing)
    }

    /// Create a connection with the given settings
    pub fn with_settings(role: Role, settings: MuxSettings, framing: F) -> Self {
        Connection {
            role,
            settings,
            framing,
            table: StreamTable::new(role),
            scheduler: FairScheduler::new(),
            inbound: BytesMut::new(),
            events: VecDeque::new(),
            error: None,
        }
    }

    /// Get the local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the settings
    pub fn settings(&self) -> &MuxSettings {
        &self.settings
    }

    /// Get the item framing
    pub fn framing(&self) -> &F {
        &self.framing
    }

    /// Get the stream table
    pub fn streams(&self) -> &StreamTable {
        &self.table
    }

    /// Credit of a stream: usable credit if this endpoint writes it, the
    /// outstanding balance if it reads it
    pub fn credit(&self, id: StreamId) -> u64 {
        match self.table.get(id) {
            Some(StreamState::Writer(w)) => w.credit(),
            Some(StreamState::Reader(r)) => r.credit_balance(),
            None => 0,
        }
    }

    /// Get the phase of a stream
    pub fn phase(&self, id: StreamId) -> Phase {
        self.table.phase(id)
    }

    /// Get the completion signals of a live stream
    pub fn completion(&self, id: StreamId) -> Completion {
        self.table.completion(id)
    }

    /// Get number of packets waiting to be transmitted
    pub fn pending_packets(&self) -> usize {
        self.scheduler.pending()
    }

    /// Check if the connection was terminated
    pub fn is_terminated(&self) -> bool {
        self.error.is_some()
    }

    /// Get the terminal error, if any
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    // ========== Inbound ==========

    /// Feed bytes received from the transport
    ///
    /// Decodes every complete packet and applies it. A trailing partial
    /// packet stays buffered until more bytes arrive. A Write is checked
    /// against credit as soon as its header is complete, so the payload
    /// held here never exceeds what this endpoint granted.
    pub fn receive(&mut self, bytes: &[u8]) -> std::result::Result<(), ConnectionError> {
        self.check_alive()?;
        self.inbound.extend_from_slice(bytes);

        loop {
            match self.decode_next() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => return Err(self.terminate(err)),
            }
        }
    }

    /// Signal that the transport delivered its last byte
    ///
    /// Leftover bytes of an unfinished packet are a violation.
    pub fn finish(&mut self) -> std::result::Result<(), ConnectionError> {
        self.check_alive()?;
        if !self.inbound.is_empty() {
            let err = ConnectionError::connection(ViolationKind::MalformedPacket);
            return Err(self.terminate(err));
        }
        Ok(())
    }

    /// Take the next event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Check if events are waiting
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Decode and apply one packet; false if more bytes are needed
    fn decode_next(&mut self) -> std::result::Result<bool, ConnectionError> {
        if self.inbound.is_empty() {
            return Ok(false);
        }

        let (header, used) = match PacketCodec::decode_header(&self.inbound, self.role) {
            Ok(decoded) => decoded,
            Err(err) if err.is_incomplete() => return Ok(false),
            Err(err) => return Err(ConnectionError::connection(err.into())),
        };
        trace!(kind = %header.kind(), id = header.id(), "decoded header");

        match header {
            Header::Control(packet) => {
                self.inbound.advance(used);
                self.apply_control(packet)?;
            }
            Header::Write { id, amount } => {
                let terminal = self.table.phase(id) == Phase::FinalPending;
                if !terminal {
                    let violation = |kind| ConnectionError::on_stream(kind, id);
                    let reader = self.table.reader_mut(id).map_err(violation)?;
                    reader.check_write(amount).map_err(violation)?;
                }
                let rest = &self.inbound[used..];
                let len = match PacketCodec::payload_len(&self.framing, id, amount, rest, terminal) {
                    Ok(len) => len,
                    Err(err) if err.is_incomplete() => return Ok(false),
                    Err(err) => return Err(ConnectionError::on_stream(err.into(), id)),
                };
                self.inbound.advance(used);
                let data = self.inbound.split_to(len).freeze();
                self.apply_write(id, amount, data, terminal)?;
            }
        }
        Ok(true)
    }

    fn apply_write(
        &mut self,
        id: StreamId,
        amount: u64,
        data: Bytes,
        terminal: bool,
    ) -> std::result::Result<(), ConnectionError> {
        let violation = |kind| ConnectionError::on_stream(kind, id);
        self.table.end_retirement(id);
        let reader = self.table.reader_mut(id).map_err(violation)?;

        if terminal {
            reader.record_final().map_err(violation)?;
            self.events.push_back(Event::Final { id, data });
            self.maybe_evict(id);
        } else {
            reader.record_write(amount).map_err(violation)?;
            self.events.push_back(Event::Items { id, amount, data });
        }
        Ok(())
    }

    fn apply_control(&mut self, packet: Packet) -> std::result::Result<(), ConnectionError> {
        let id = packet.id();
        let violation = |kind| ConnectionError::on_stream(kind, id);

        match packet {
            Packet::GiveCredit { amount, .. } => {
                let writer = self.table.writer_mut(id).map_err(violation)?;
                let credit = writer.grant_credit(amount).map_err(violation)?;
                self.events.push_back(Event::CreditGranted { id, amount, credit });
            }
            Packet::StopRead { amount, .. } => {
                let writer = self.table.writer_mut(id).map_err(violation)?;
                writer.observe_stop_read(amount).map_err(violation)?;
                self.events.push_back(Event::StopRead { id, limit: amount });
                self.maybe_evict(id);
            }
            Packet::StopWrite { amount, .. } => {
                self.table.end_retirement(id);
                let reader = self.table.reader_mut(id).map_err(violation)?;
                reader.observe_stop_write(amount).map_err(violation)?;
                self.events.push_back(Event::StopWrite { id, limit: amount });
            }
            Packet::ForgoCredit { amount, .. } => {
                // Credit of an evicted lifetime may still come back
                let amount = self.table.forgo_retired(id, amount);
                if amount > 0 {
                    let reader = self.table.reader_mut(id).map_err(violation)?;
                    reader.observe_forgo(amount).map_err(violation)?;
                    self.events.push_back(Event::CreditForgone { id, amount });
                }
            }
            Packet::Oops { maximum, .. } => self.apply_oops(id, maximum),
            Packet::PromiseWrite { amount, .. } => {
                self.record_promise(id, amount);
                self.events.push_back(Event::PromiseWrite { id, amount });
            }
            Packet::PromiseRead { amount, .. } => {
                self.record_promise(id, amount);
                self.events.push_back(Event::PromiseRead { id, amount });
            }
            Packet::Write { .. } => return Err(violation(ViolationKind::MalformedPacket)),
        }
        Ok(())
    }

    /// Promises only annotate live streams; they never create one
    fn record_promise(&mut self, id: StreamId, amount: u64) {
        match self.table.get_mut(id) {
            Some(stream) => stream.hints_mut().promise_received(amount),
            None => trace!(id, amount, "promise for unknown stream"),
        }
    }

    /// Advisory: never fails, whatever the packet says
    fn apply_oops(&mut self, id: StreamId, maximum: u64) {
        self.events.push_back(Event::Oops { id, maximum });

        let auto_forgo = self.settings.get_auto_forgo_on_oops();
        let Some(writer) = self
            .table
            .get_mut(id)
            .and_then(StreamState::as_writer_mut)
        else {
            return;
        };
        let Some(excess) = writer.observe_oops(maximum) else {
            return;
        };
        if auto_forgo && writer.forgo_credit(excess).is_ok() {
            warn!(id, maximum, excess, "forgoing credit after oops");
            self.scheduler.push(Packet::ForgoCredit { id, amount: excess });
        }
    }

    // ========== Outbound ==========

    /// Write `amount` regular items, encoded in `data`
    ///
    /// Returns [`Error::WouldBlock`] without changing anything if the stream
    /// lacks credit. Writes larger than the configured maximum are split
    /// into several packets.
    pub fn write(&mut self, id: StreamId, amount: u64, data: Bytes) -> Result<()> {
        self.check_alive()?;
        if amount == 0 {
            return Err(EncodeError::ZeroAmount(PacketKind::Write).into());
        }

        let chunks = self.carve(id, amount, data)?;

        let writer = self.table.writer_mut(id).map_err(|kind| usage(id, kind))?;
        match writer.phase() {
            Phase::FinalPending => return Err(usage(id, ViolationKind::MissingFinalItem)),
            Phase::Closed => return Err(usage(id, ViolationKind::UnexpectedFinalItem)),
            Phase::Open | Phase::Closing => {}
        }
        if writer.local_write_limit().map_or(false, |left| amount > left) {
            return Err(usage(id, ViolationKind::LimitExceeded));
        }
        if amount > writer.credit() {
            return Err(Error::WouldBlock {
                id,
                needed: amount,
                available: writer.credit(),
            });
        }
        writer
            .consume_credit_for_write(amount)
            .map_err(|kind| usage(id, kind))?;

        for packet in chunks {
            self.scheduler.push(packet);
        }
        Ok(())
    }

    /// Write the terminal item of a stream whose write limit reached zero
    pub fn write_final(&mut self, id: StreamId, data: Bytes) -> Result<()> {
        self.check_alive()?;
        let expected = self
            .framing
            .terminal_len(id)
            .ok_or_else(|| usage(id, ViolationKind::UnexpectedFinalItem))?;
        if data.len() != expected {
            return Err(usage(id, ViolationKind::MalformedPacket));
        }

        let writer = self.table.writer_mut(id).map_err(|kind| usage(id, kind))?;
        writer.send_final().map_err(|kind| usage(id, kind))?;

        self.scheduler.push(Packet::Write { id, amount: 1, data });
        self.maybe_evict(id);
        Ok(())
    }

    /// Grant credit on a stream this endpoint reads
    pub fn give_credit(&mut self, id: StreamId, amount: u64) -> Result<()> {
        self.check_alive()?;
        if amount == 0 {
            return Err(EncodeError::ZeroAmount(PacketKind::GiveCredit).into());
        }
        let reader = self.table.reader_mut(id).map_err(|kind| usage(id, kind))?;
        reader.grant(amount).map_err(|kind| usage(id, kind))?;

        self.scheduler.push(Packet::GiveCredit { id, amount });
        Ok(())
    }

    /// Cap the credit this endpoint will still grant on a stream
    pub fn stop_read(&mut self, id: StreamId, limit: u64) -> Result<()> {
        self.check_alive()?;
        let reader = self.table.reader_mut(id).map_err(|kind| usage(id, kind))?;
        reader.announce_stop_read(limit).map_err(|kind| usage(id, kind))?;

        self.scheduler.push(Packet::StopRead { id, amount: limit });
        self.maybe_evict(id);
        Ok(())
    }

    /// Cap the items this endpoint will still write on a stream
    ///
    /// Once the cap is used up, [`Connection::write_final`] must follow.
    pub fn stop_write(&mut self, id: StreamId, limit: u64) -> Result<()> {
        self.check_alive()?;
        if self.framing.terminal_len(id).is_none() {
            warn!(id, "stop write on a stream without terminal item");
        }
        let writer = self.table.writer_mut(id).map_err(|kind| usage(id, kind))?;
        writer
            .announce_stop_write(limit)
            .map_err(|kind| usage(id, kind))?;

        self.scheduler.push(Packet::StopWrite { id, amount: limit });
        Ok(())
    }

    /// Give back unused credit on a stream this endpoint writes
    pub fn forgo_credit(&mut self, id: StreamId, amount: u64) -> Result<()> {
        self.check_alive()?;
        if amount == 0 {
            return Err(EncodeError::ZeroAmount(PacketKind::ForgoCredit).into());
        }
        let writer = self.table.writer_mut(id).map_err(|kind| usage(id, kind))?;
        writer.forgo_credit(amount).map_err(|kind| usage(id, kind))?;

        self.scheduler.push(Packet::ForgoCredit { id, amount });
        Ok(())
    }

    /// Ask the writer of a stream to forgo credit above `maximum`
    pub fn oops(&mut self, id: StreamId, maximum: u64) -> Result<()> {
        self.check_alive()?;
        let reader = self.table.reader_mut(id).map_err(|kind| usage(id, kind))?;
        reader.hints_mut().oops(maximum);

        self.scheduler.push(Packet::Oops { id, maximum });
        Ok(())
    }

    /// Advisory promise to the writer of a stream this endpoint reads
    pub fn promise_write(&mut self, id: StreamId, amount: u64) -> Result<()> {
        self.check_alive()?;
        if amount == 0 {
            return Err(EncodeError::ZeroAmount(PacketKind::PromiseWrite).into());
        }
        let reader = self.table.reader_mut(id).map_err(|kind| usage(id, kind))?;
        reader.hints_mut().promise_sent(amount);

        self.scheduler.push(Packet::PromiseWrite { id, amount });
        Ok(())
    }

    /// Advisory promise to the reader of a stream this endpoint writes
    pub fn promise_read(&mut self, id: StreamId, amount: u64) -> Result<()> {
        self.check_alive()?;
        if amount == 0 {
            return Err(EncodeError::ZeroAmount(PacketKind::PromiseRead).into());
        }
        let writer = self.table.writer_mut(id).map_err(|kind| usage(id, kind))?;
        writer.hints_mut().promise_sent(amount);

        self.scheduler.push(Packet::PromiseRead { id, amount });
        Ok(())
    }

    /// Serialize the next scheduled packet
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        if self.error.is_some() {
            return None;
        }
        while let Some(packet) = self.scheduler.next() {
            match PacketCodec::encode(&packet, self.role.peer()) {
                Ok(bytes) => return Some(bytes),
                Err(err) => error!(%err, id = packet.id(), "dropping unencodable packet"),
            }
        }
        None
    }

    /// Serialize scheduled packets into `buf` until it holds at least
    /// `max_bytes` or nothing is pending
    ///
    /// Returns the number of packets written.
    pub fn transmit_into(&mut self, buf: &mut BytesMut, max_bytes: usize) -> usize {
        let mut count = 0;
        while buf.len() < max_bytes {
            match self.poll_transmit() {
                Some(bytes) => {
                    buf.extend_from_slice(&bytes);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Serialize every scheduled packet into `buf`
    pub fn transmit_all(&mut self, buf: &mut BytesMut) -> usize {
        self.transmit_into(buf, usize::MAX)
    }

    /// Terminate the connection
    ///
    /// The single place where a violation ends the connection. The first
    /// error is kept; pending output and undecoded input are dropped.
    pub fn terminate(&mut self, err: ConnectionError) -> ConnectionError {
        if let Some(existing) = &self.error {
            return existing.clone();
        }
        error!(%err, role = %self.role, "connection terminated");
        self.scheduler.clear();
        self.inbound.clear();
        self.error = Some(err.clone());
        err
    }

    fn check_alive(&self) -> std::result::Result<(), ConnectionError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Split a write into packets of at most `max_write_items` items
    fn carve(&self, id: StreamId, amount: u64, mut data: Bytes) -> Result<Vec<Packet>> {
        let malformed = || usage(id, ViolationKind::MalformedPacket);
        let total = self
            .framing
            .items_len(id, amount, &data)
            .map_err(|_| malformed())?
            .ok_or_else(malformed)?;
        if total != data.len() {
            return Err(malformed());
        }

        let max = self.settings.get_max_write_items();
        let mut packets = Vec::new();
        let mut left = amount;
        while left > 0 {
            let n = left.min(max);
            let len = if n == left {
                data.len()
            } else {
                self.framing
                    .items_len(id, n, &data)
                    .map_err(|_| malformed())?
                    .ok_or_else(malformed)?
            };
            if len > data.len() {
                return Err(malformed());
            }
            packets.push(Packet::Write {
                id,
                amount: n,
                data: data.split_to(len),
            });
            left -= n;
        }
        Ok(packets)
    }

    fn maybe_evict(&mut self, id: StreamId) {
        if !self.settings.get_auto_evict() || !self.table.completion(id).is_complete() {
            return;
        }
        if self.table.try_evict(id) {
            debug!(id, "stream completed");
            self.events.push_back(Event::Completed { id });
        }
    }
}

fn usage(id: StreamId, kind: ViolationKind) -> Error {
    Error::Usage { id, kind }
}
