//! Per-stream state machines
//!
//! For a given endpoint every stream id is either written or read, never
//! both. [`WriterState`] and [`ReaderState`] track the same protocol from
//! the two sides; each is validated only against packets this endpoint has
//! sent or received.
//!
//! Validated operations return `Err(ViolationKind)` without changing any
//! state. Advisory packets go through [`Hints`], which never fails.

use super::error::ViolationKind;
use super::flow_control::{CreditWindow, LimitTracker};
use super::StreamId;
use tracing::debug;

/// Closing phase of a stream's write side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Regular items may be written
    Open,
    /// A StopWrite capped the remaining items, some are still allowed
    Closing,
    /// Only the terminal item may be written
    FinalPending,
    /// The terminal item was written
    Closed,
}

impl Phase {
    /// Check if regular items may still be written
    pub fn accepts_items(&self) -> bool {
        matches!(self, Phase::Open | Phase::Closing)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, Phase::Closed)
    }

    fn after_limit(self, limit: &LimitTracker) -> Phase {
        match self {
            Phase::Open | Phase::Closing if limit.is_exhausted() => Phase::FinalPending,
            Phase::Open if limit.remaining().is_some() => Phase::Closing,
            other => other,
        }
    }
}

/// Completion signals of a stream
///
/// An id may only be reused once both are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    /// The writer wrote its terminal item
    pub write_closed: bool,
    /// The reader announced it grants no more credit
    pub read_closed: bool,
}

impl Completion {
    /// Check if both directions completed
    pub fn is_complete(&self) -> bool {
        self.write_closed && self.read_closed
    }
}

/// Bookkeeping for advisory packets
///
/// Nothing here is ever checked against the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hints {
    promised_sent: u64,
    promised_received: u64,
    oops_maximum: Option<u64>,
}

impl Hints {
    /// Record a promise this endpoint sent
    pub fn promise_sent(&mut self, amount: u64) {
        self.promised_sent = self.promised_sent.saturating_add(amount);
    }

    /// Record a promise the peer sent
    pub fn promise_received(&mut self, amount: u64) {
        self.promised_received = self.promised_received.saturating_add(amount);
    }

    /// Record the maximum of the latest Oops
    pub fn oops(&mut self, maximum: u64) {
        self.oops_maximum = Some(maximum);
    }

    /// Total amount promised by this endpoint
    pub fn promised_sent(&self) -> u64 {
        self.promised_sent
    }

    /// Total amount promised by the peer
    pub fn promised_received(&self) -> u64 {
        self.promised_received
    }

    /// Maximum of the latest Oops, sent or received
    pub fn oops_maximum(&self) -> Option<u64> {
        self.oops_maximum
    }
}

/// State of a stream this endpoint writes to
#[derive(Debug, Clone)]
pub struct WriterState {
    id: StreamId,
    credit: CreditWindow,
    remote_read_limit: LimitTracker,
    local_write_limit: LimitTracker,
    phase: Phase,
    hints: Hints,
}

impl WriterState {
    /// Create a writer with no credit and no limits
    pub fn new(id: StreamId) -> Self {
        WriterState {
            id,
            credit: CreditWindow::new(),
            remote_read_limit: LimitTracker::new(),
            local_write_limit: LimitTracker::new(),
            phase: Phase::Open,
            hints: Hints::default(),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get usable credit
    pub fn credit(&self) -> u64 {
        self.credit.available()
    }

    /// Get the phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Remaining credit the reader may still grant, if capped
    pub fn remote_read_limit(&self) -> Option<u64> {
        self.remote_read_limit.remaining()
    }

    /// Remaining items this endpoint may still write, if capped
    pub fn local_write_limit(&self) -> Option<u64> {
        self.local_write_limit.remaining()
    }

    /// Get advisory bookkeeping
    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    /// Get mutable advisory bookkeeping
    pub fn hints_mut(&mut self) -> &mut Hints {
        &mut self.hints
    }

    /// Get completion signals
    pub fn completion(&self) -> Completion {
        Completion {
            write_closed: self.phase.is_closed(),
            read_closed: self.remote_read_limit.is_exhausted(),
        }
    }

    /// Apply a received GiveCredit
    pub fn grant_credit(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        let mut credit = self.credit;
        let mut limit = self.remote_read_limit;
        limit.charge(amount)?;
        credit.grant(amount)?;

        self.credit = credit;
        self.remote_read_limit = limit;
        Ok(self.credit.available())
    }

    /// Charge a regular Write of `amount` items about to be sent
    ///
    /// Returns the credit left afterwards.
    pub fn consume_credit_for_write(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        match self.phase {
            Phase::FinalPending => return Err(ViolationKind::MissingFinalItem),
            Phase::Closed => return Err(ViolationKind::UnexpectedFinalItem),
            Phase::Open | Phase::Closing => {}
        }

        let mut credit = self.credit;
        let mut limit = self.local_write_limit;
        credit.consume(amount)?;
        limit.charge(amount)?;

        self.credit = credit;
        self.local_write_limit = limit;
        self.set_phase(self.phase.after_limit(&limit));
        Ok(self.credit.available())
    }

    /// Mark the terminal item as sent
    pub fn send_final(&mut self) -> Result<(), ViolationKind> {
        if self.phase != Phase::FinalPending {
            return Err(ViolationKind::UnexpectedFinalItem);
        }
        self.set_phase(Phase::Closed);
        Ok(())
    }

    /// Cap the items still to be written, before sending StopWrite
    ///
    /// A closed writer has nothing left to cap.
    pub fn announce_stop_write(&mut self, limit: u64) -> Result<(), ViolationKind> {
        if self.phase.is_closed() {
            return Err(ViolationKind::UnexpectedFinalItem);
        }
        self.local_write_limit.shrink(limit)?;
        self.set_phase(self.phase.after_limit(&self.local_write_limit));
        Ok(())
    }

    /// Apply a received StopRead
    pub fn observe_stop_read(&mut self, limit: u64) -> Result<(), ViolationKind> {
        self.remote_read_limit.shrink(limit)
    }

    /// Give back unused credit, before sending ForgoCredit
    ///
    /// Refused once the terminal item is out: the reader may already have
    /// dropped the stream.
    pub fn forgo_credit(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        if self.phase.is_closed() {
            return Err(ViolationKind::UnexpectedFinalItem);
        }
        self.credit.forgo(amount)
    }

    /// Apply a received Oops
    ///
    /// Returns the credit above `maximum`, which the writer may forgo. A
    /// closed writer has none to forgo.
    pub fn observe_oops(&mut self, maximum: u64) -> Option<u64> {
        self.hints.oops(maximum);
        if self.phase.is_closed() {
            return None;
        }
        self.credit().checked_sub(maximum).filter(|&excess| excess > 0)
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            debug!(id = self.id, from = ?self.phase, to = ?phase, "writer phase change");
            self.phase = phase;
        }
    }
}

/// State of a stream this endpoint reads from
#[derive(Debug, Clone)]
pub struct ReaderState {
    id: StreamId,
    balance: CreditWindow,
    local_read_limit: LimitTracker,
    remote_write_limit: LimitTracker,
    phase: Phase,
    hints: Hints,
}

impl ReaderState {
    /// Create a reader with no credit and no limits
    pub fn new(id: StreamId) -> Self {
        ReaderState {
            id,
            balance: CreditWindow::new(),
            local_read_limit: LimitTracker::new(),
            remote_write_limit: LimitTracker::new(),
            phase: Phase::Open,
            hints: Hints::default(),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Credit granted and not yet consumed by the writer
    pub fn credit_balance(&self) -> u64 {
        self.balance.available()
    }

    /// Get the phase observed for the writer
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Remaining credit this endpoint may still grant, if capped
    pub fn local_read_limit(&self) -> Option<u64> {
        self.local_read_limit.remaining()
    }

    /// Remaining items the writer may still send, if capped
    pub fn remote_write_limit(&self) -> Option<u64> {
        self.remote_write_limit.remaining()
    }

    /// Check if the next Write must carry the terminal item
    pub fn expects_final(&self) -> bool {
        self.phase == Phase::FinalPending
    }

    /// Get advisory bookkeeping
    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    /// Get mutable advisory bookkeeping
    pub fn hints_mut(&mut self) -> &mut Hints {
        &mut self.hints
    }

    /// Get completion signals
    pub fn completion(&self) -> Completion {
        Completion {
            write_closed: self.phase.is_closed(),
            read_closed: self.local_read_limit.is_exhausted(),
        }
    }

    /// Grant credit, before sending GiveCredit
    pub fn grant(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        let mut balance = self.balance;
        let mut limit = self.local_read_limit;
        limit.charge(amount)?;
        balance.grant(amount)?;

        self.balance = balance;
        self.local_read_limit = limit;
        Ok(self.balance.available())
    }

    /// Cap the credit still to be granted, before sending StopRead
    pub fn announce_stop_read(&mut self, limit: u64) -> Result<(), ViolationKind> {
        self.local_read_limit.shrink(limit)
    }

    /// Check a regular Write of `amount` items without applying it
    ///
    /// Lets the connection reject a Write from its header alone, before
    /// buffering the payload.
    pub fn check_write(&self, amount: u64) -> Result<(), ViolationKind> {
        match self.phase {
            Phase::FinalPending => return Err(ViolationKind::MissingFinalItem),
            Phase::Closed => return Err(ViolationKind::UnexpectedFinalItem),
            Phase::Open | Phase::Closing => {}
        }
        if !self.balance.can_consume(amount) {
            return Err(ViolationKind::CreditExceeded);
        }
        if !self.remote_write_limit.allows(amount) {
            return Err(ViolationKind::LimitExceeded);
        }
        Ok(())
    }

    /// Apply a received regular Write of `amount` items
    ///
    /// Returns the balance left afterwards.
    pub fn record_write(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        self.check_write(amount)?;

        let mut balance = self.balance;
        let mut limit = self.remote_write_limit;
        balance.consume(amount)?;
        limit.charge(amount)?;

        self.balance = balance;
        self.remote_write_limit = limit;
        self.set_phase(self.phase.after_limit(&limit));
        Ok(self.balance.available())
    }

    /// Apply a received Write carrying the terminal item
    pub fn record_final(&mut self) -> Result<(), ViolationKind> {
        if self.phase != Phase::FinalPending {
            return Err(ViolationKind::UnexpectedFinalItem);
        }
        self.set_phase(Phase::Closed);
        Ok(())
    }

    /// Apply a received StopWrite
    pub fn observe_stop_write(&mut self, limit: u64) -> Result<(), ViolationKind> {
        self.remote_write_limit.shrink(limit)?;
        self.set_phase(self.phase.after_limit(&self.remote_write_limit));
        Ok(())
    }

    /// Apply a received ForgoCredit
    pub fn observe_forgo(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        self.balance.forgo(amount)
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            debug!(id = self.id, from = ?self.phase, to = ?phase, "reader phase change");
            self.phase = phase;
        }
    }
}

/// State of one stream, from the side this endpoint plays
#[derive(Debug, Clone)]
pub enum StreamState {
    Writer(WriterState),
    Reader(ReaderState),
}

impl StreamState {
    /// Get stream ID
    pub fn id(&self) -> StreamId {
        match self {
            StreamState::Writer(w) => w.id(),
            StreamState::Reader(r) => r.id(),
        }
    }

    /// Get the phase
    pub fn phase(&self) -> Phase {
        match self {
            StreamState::Writer(w) => w.phase(),
            StreamState::Reader(r) => r.phase(),
        }
    }

    /// Get completion signals
    pub fn completion(&self) -> Completion {
        match self {
            StreamState::Writer(w) => w.completion(),
            StreamState::Reader(r) => r.completion(),
        }
    }

    /// Get mutable advisory bookkeeping
    pub fn hints_mut(&mut self) -> &mut Hints {
        match self {
            StreamState::Writer(w) => w.hints_mut(),
            StreamState::Reader(r) => r.hints_mut(),
        }
    }

    /// Get the writer state, if this endpoint writes the stream
    pub fn as_writer_mut(&mut self) -> Option<&mut WriterState> {
        match self {
            StreamState::Writer(w) => Some(w),
            StreamState::Reader(_) => None,
        }
    }

    /// Get the reader state, if this endpoint reads the stream
    pub fn as_reader_mut(&mut self) -> Option<&mut ReaderState> {
        match self {
            StreamState::Reader(r) => Some(r),
            StreamState::Writer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_writer_credit() {
        let mut writer = WriterState::new(0);
        assert_eq!(
            writer.consume_credit_for_write(1),
            Err(ViolationKind::CreditExceeded)
        );

        writer.grant_credit(5).unwrap();
        assert_eq!(writer.consume_credit_for_write(3), Ok(2));
        assert_eq!(
            writer.consume_credit_for_write(3),
            Err(ViolationKind::CreditExceeded)
        );
        assert_eq!(writer.credit(), 2);
    }

    #[test]
    fn test_writer_stop_write_zero_goes_final_pending() {
        let mut writer = WriterState::new(2);
        writer.announce_stop_write(0).unwrap();
        assert_eq!(writer.phase(), Phase::FinalPending);

        writer.grant_credit(10).unwrap();
        assert_eq!(
            writer.consume_credit_for_write(1),
            Err(ViolationKind::MissingFinalItem)
        );

        writer.send_final().unwrap();
        assert_eq!(writer.phase(), Phase::Closed);
        assert_eq!(writer.send_final(), Err(ViolationKind::UnexpectedFinalItem));
        assert_eq!(
            writer.consume_credit_for_write(1),
            Err(ViolationKind::UnexpectedFinalItem)
        );
        assert!(writer.completion().write_closed);
    }

    #[test]
    fn test_writer_closing_counts_down() {
        let mut writer = WriterState::new(0);
        writer.grant_credit(10).unwrap();
        writer.announce_stop_write(4).unwrap();
        assert_eq!(writer.phase(), Phase::Closing);

        writer.consume_credit_for_write(3).unwrap();
        assert_eq!(writer.phase(), Phase::Closing);
        assert_eq!(
            writer.consume_credit_for_write(2),
            Err(ViolationKind::LimitExceeded)
        );
        assert_eq!(writer.credit(), 7);

        writer.consume_credit_for_write(1).unwrap();
        assert_eq!(writer.phase(), Phase::FinalPending);
        assert_eq!(writer.local_write_limit(), Some(0));
    }

    #[test]
    fn test_writer_final_not_allowed_while_open() {
        let mut writer = WriterState::new(0);
        assert_eq!(writer.send_final(), Err(ViolationKind::UnexpectedFinalItem));
        assert_eq!(writer.phase(), Phase::Open);
    }

    #[test]
    fn test_writer_stop_write_cannot_grow() {
        let mut writer = WriterState::new(0);
        writer.announce_stop_write(5).unwrap();
        assert_eq!(writer.announce_stop_write(6), Err(ViolationKind::LimitIncreased));
        writer.announce_stop_write(0).unwrap();
        assert_eq!(writer.phase(), Phase::FinalPending);
    }

    #[test]
    fn test_writer_observe_stop_read() {
        let mut writer = WriterState::new(0);
        writer.observe_stop_read(10).unwrap();
        assert_eq!(writer.observe_stop_read(20), Err(ViolationKind::LimitIncreased));
        assert_eq!(writer.remote_read_limit(), Some(10));

        writer.grant_credit(4).unwrap();
        assert_eq!(writer.remote_read_limit(), Some(6));
        assert_eq!(writer.grant_credit(7), Err(ViolationKind::LimitExceeded));
        assert_eq!(writer.credit(), 4);

        writer.grant_credit(6).unwrap();
        assert!(writer.completion().read_closed);
        assert!(!writer.completion().is_complete());
    }

    #[test]
    fn test_writer_grant_failure_leaves_state() {
        let mut writer = WriterState::new(0);
        writer.grant_credit(u64::MAX).unwrap();
        assert_eq!(writer.grant_credit(1), Err(ViolationKind::CreditOverflow));
        assert_eq!(writer.credit(), u64::MAX);

        let mut writer = WriterState::new(0);
        writer.observe_stop_read(u64::MAX).unwrap();
        writer.grant_credit(u64::MAX).unwrap();
        writer.consume_credit_for_write(1).unwrap();
        assert_eq!(writer.grant_credit(2), Err(ViolationKind::LimitExceeded));
        assert_eq!(writer.credit(), u64::MAX - 1);
        assert_eq!(writer.remote_read_limit(), Some(0));
    }

    #[test]
    fn test_writer_forgo_and_oops() {
        let mut writer = WriterState::new(0);
        writer.grant_credit(10).unwrap();
        assert_eq!(writer.observe_oops(4), Some(6));
        assert_eq!(writer.observe_oops(10), None);
        assert_eq!(writer.hints().oops_maximum(), Some(10));

        assert_eq!(writer.forgo_credit(6), Ok(4));
        assert_eq!(writer.forgo_credit(5), Err(ViolationKind::ForgoExceedsBalance));
    }

    #[test]
    fn test_closed_writer_refuses_forgo_and_stop_write() {
        let mut writer = WriterState::new(1);
        writer.grant_credit(10).unwrap();
        writer.announce_stop_write(0).unwrap();
        writer.send_final().unwrap();

        assert_eq!(writer.forgo_credit(10), Err(ViolationKind::UnexpectedFinalItem));
        assert_eq!(writer.announce_stop_write(0), Err(ViolationKind::UnexpectedFinalItem));
        assert_eq!(writer.observe_oops(0), None);
        assert_eq!(writer.hints().oops_maximum(), Some(0));
        assert_eq!(writer.credit(), 10);
        assert_eq!(writer.phase(), Phase::Closed);
    }

    #[test]
    fn test_reader_records_writes() {
        let mut reader = ReaderState::new(1);
        reader.grant(5).unwrap();
        assert_eq!(reader.record_write(3), Ok(2));
        assert_eq!(reader.record_write(3), Err(ViolationKind::CreditExceeded));
        assert_eq!(reader.credit_balance(), 2);
    }

    #[test]
    fn test_reader_check_write_changes_nothing() {
        let mut reader = ReaderState::new(1);
        assert_eq!(reader.check_write(1), Err(ViolationKind::CreditExceeded));

        reader.grant(5).unwrap();
        reader.observe_stop_write(3).unwrap();
        assert_eq!(reader.check_write(4), Err(ViolationKind::LimitExceeded));
        assert_eq!(reader.check_write(3), Ok(()));
        assert_eq!(reader.credit_balance(), 5);
        assert_eq!(reader.remote_write_limit(), Some(3));
    }

    #[test]
    fn test_reader_final_handshake() {
        let mut reader = ReaderState::new(3);
        assert!(!reader.expects_final());
        assert_eq!(reader.record_final(), Err(ViolationKind::UnexpectedFinalItem));

        reader.observe_stop_write(0).unwrap();
        assert!(reader.expects_final());
        reader.record_final().unwrap();
        assert_eq!(reader.phase(), Phase::Closed);

        assert_eq!(reader.record_final(), Err(ViolationKind::UnexpectedFinalItem));
        assert_eq!(reader.record_write(1), Err(ViolationKind::UnexpectedFinalItem));
    }

    #[test]
    fn test_reader_closing_after_writes() {
        let mut reader = ReaderState::new(1);
        reader.grant(10).unwrap();
        reader.observe_stop_write(2).unwrap();
        assert_eq!(reader.phase(), Phase::Closing);
        assert_eq!(reader.record_write(3), Err(ViolationKind::LimitExceeded));
        assert_eq!(reader.credit_balance(), 10);

        reader.record_write(2).unwrap();
        assert!(reader.expects_final());
        assert_eq!(reader.record_write(1), Err(ViolationKind::MissingFinalItem));
    }

    #[test]
    fn test_reader_stop_write_cannot_grow() {
        let mut reader = ReaderState::new(1);
        reader.observe_stop_write(3).unwrap();
        assert_eq!(reader.observe_stop_write(4), Err(ViolationKind::LimitIncreased));
        assert_eq!(reader.remote_write_limit(), Some(3));
        assert_eq!(reader.phase(), Phase::Closing);
    }

    #[test]
    fn test_reader_stop_read_caps_grants() {
        let mut reader = ReaderState::new(1);
        reader.announce_stop_read(3).unwrap();
        assert_eq!(reader.grant(4), Err(ViolationKind::LimitExceeded));
        reader.grant(3).unwrap();
        assert!(reader.completion().read_closed);
        assert_eq!(reader.announce_stop_read(1), Err(ViolationKind::LimitIncreased));
    }

    #[test]
    fn test_reader_forgo() {
        let mut reader = ReaderState::new(1);
        reader.grant(4).unwrap();
        assert_eq!(reader.observe_forgo(5), Err(ViolationKind::ForgoExceedsBalance));
        assert_eq!(reader.observe_forgo(4), Ok(0));
    }

    #[test]
    fn test_stream_state_dispatch() {
        let mut state = StreamState::Reader(ReaderState::new(7));
        assert_eq!(state.id(), 7);
        assert_eq!(state.phase(), Phase::Open);
        assert!(state.as_writer_mut().is_none());
        assert!(state.as_reader_mut().is_some());

        state.hints_mut().promise_received(3);
        state.hints_mut().promise_received(u64::MAX);
        if let StreamState::Reader(reader) = &state {
            assert_eq!(reader.hints().promised_received(), u64::MAX);
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Give(u64),
        Write(u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![(1u64..50).prop_map(Step::Give), (1u64..50).prop_map(Step::Write)]
    }

    proptest! {
        #[test]
        fn prop_credit_conservation(steps in proptest::collection::vec(step(), 1..40)) {
            let mut writer = WriterState::new(0);
            let mut reader = ReaderState::new(0);
            let mut granted: u64 = 0;
            let mut written: u64 = 0;

            for step in steps {
                match step {
                    Step::Give(amount) => {
                        reader.grant(amount).unwrap();
                        writer.grant_credit(amount).unwrap();
                        granted += amount;
                    }
                    Step::Write(amount) => {
                        let valid = written + amount <= granted;
                        prop_assert_eq!(writer.consume_credit_for_write(amount).is_ok(), valid);
                        prop_assert_eq!(reader.record_write(amount).is_ok(), valid);
                        if valid {
                            written += amount;
                        }
                    }
                }
                prop_assert_eq!(writer.credit(), granted - written);
                prop_assert_eq!(reader.credit_balance(), granted - written);
            }
        }
    }
}
