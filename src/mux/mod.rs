//! Credit-based stream multiplexer
//!
//! Carries many independent, flow-controlled logical streams over one
//! reliable byte transport. Each stream has exactly one writer and one
//! reader; the reader grants credit, the writer spends it, and either side
//! may cap the other's remaining budget to close the stream gracefully.
//!
//! # Architecture
//!
//! - `varint` and `codec` turn packets into bytes and back, without state
//! - `flow_control` and `stream` hold the per-stream accounting
//! - `table` maps ids to stream state, `scheduler` orders outbound packets
//! - `connection` ties these together as a sans-I/O state machine
//! - `endpoint` drives a connection over a blocking [`Transport`]
//!
//! Which endpoint writes a stream follows from the parity of its id: the
//! proactive endpoint writes even ids, the reactive endpoint odd ones.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use lcmux::mux::{ByteItems, Connection, Event, Role};
//!
//! let mut proactive = Connection::new(Role::Proactive, ByteItems::new());
//! let mut reactive = Connection::new(Role::Reactive, ByteItems::new());
//!
//! proactive.give_credit(1, 5).unwrap();
//! while let Some(bytes) = proactive.poll_transmit() {
//!     reactive.receive(&bytes).unwrap();
//! }
//! reactive.poll_event();
//!
//! reactive.write(1, 3, Bytes::from_static(b"abc")).unwrap();
//! while let Some(bytes) = reactive.poll_transmit() {
//!     proactive.receive(&bytes).unwrap();
//! }
//! assert_eq!(
//!     proactive.poll_event(),
//!     Some(Event::Items { id: 1, amount: 3, data: Bytes::from_static(b"abc") })
//! );
//! ```
//!
//! [`Transport`]: crate::session::Transport

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod flow_control;
pub mod packet;
pub mod scheduler;
pub mod settings;
pub mod stream;
pub mod table;
pub mod varint;

pub use codec::{ByteItems, FixedSizeItems, ItemFraming, PacketCodec};
pub use connection::{Connection, Event};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{ConnectionError, Error, Result, ViolationKind};
pub use packet::{Packet, PacketKind, Role};
pub use settings::{MuxSettings, MuxSettingsBuilder};
pub use stream::{Completion, Phase};

/// Stream identifier
pub type StreamId = u64;

/// Largest stream id stored inline in the header byte
pub const MAX_INLINE_ID: u64 = 62;

/// Header id value announcing a variable-length id
pub const ESCAPE_ID: u8 = 63;
