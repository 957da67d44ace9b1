//! Blocking endpoint driver
//!
//! Couples a [`Connection`] with a [`Transport`]: flushes scheduled packets,
//! reads inbound bytes with a timeout, and retries writes that are waiting
//! for credit.

use super::codec::ItemFraming;
use super::connection::{Connection, Event};
use super::error::{Error, Result};
use super::packet::Role;
use super::settings::{MuxSettings, MuxSettingsBuilder};
use super::StreamId;
use crate::session::{PollEvents, Transport};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace};

/// Multiplexed connection over a blocking transport
pub struct Endpoint<T: Transport, F: ItemFraming> {
    /// Byte transport
    transport: T,
    /// Protocol state
    connection: Connection<F>,
    /// Scratch buffer for transport reads
    read_buf: Vec<u8>,
    /// Outbound bytes not yet written
    write_buf: BytesMut,
    /// Transport timeout
    timeout: Option<Duration>,
    /// The peer closed its side
    eof: bool,
}

impl<T: Transport, F: ItemFraming> Endpoint<T, F> {
    /// Create an endpoint with default settings
    pub fn new(role: Role, transport: T, framing: F) -> Self {
        Self::with_settings(role, MuxSettings::new(), transport, framing)
    }

    /// Create an endpoint with the given settings
    pub fn with_settings(role: Role, settings: MuxSettings, transport: T, framing: F) -> Self {
        let read_buf = vec![0; settings.get_read_chunk_size()];
        let timeout = settings.get_io_timeout();
        Endpoint {
            transport,
            connection: Connection::with_settings(role, settings, framing),
            read_buf,
            write_buf: BytesMut::new(),
            timeout,
            eof: false,
        }
    }

    /// Get the connection state
    pub fn connection(&self) -> &Connection<F> {
        &self.connection
    }

    /// Get the mutable connection state
    pub fn connection_mut(&mut self) -> &mut Connection<F> {
        &mut self.connection
    }

    /// Set the transport timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the transport timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check if the peer closed its side
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Get a reference to the transport
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the transport
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write every scheduled packet to the transport
    pub fn flush(&mut self) -> Result<()> {
        let chunk = self.connection.settings().get_read_chunk_size();
        loop {
            let packets = self.connection.transmit_into(&mut self.write_buf, chunk);
            if self.write_buf.is_empty() {
                return Ok(());
            }
            trace!(packets, bytes = self.write_buf.len(), "flushing");
            self.transport.write_all(&self.write_buf, self.timeout)?;
            self.write_buf.clear();
        }
    }

    /// Read once from the transport and feed the connection
    ///
    /// Returns the number of bytes read. Fails with [`Error::Timeout`] if
    /// nothing arrives in time and [`Error::ConnectionClosed`] at EOF.
    pub fn pump(&mut self) -> Result<usize> {
        if self.eof {
            return Err(Error::ConnectionClosed);
        }
        if !self.transport.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }

        let n = self.transport.read(&mut self.read_buf)?;
        if n == 0 {
            debug!(role = %self.connection.role(), "transport closed by peer");
            self.eof = true;
            self.connection.finish()?;
            return Err(Error::ConnectionClosed);
        }

        self.connection.receive(&self.read_buf[..n])?;
        Ok(n)
    }

    /// Wait for the next event, flushing and reading as needed
    pub fn next_event(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.connection.poll_event() {
                return Ok(event);
            }
            self.flush()?;
            self.pump()?;
        }
    }

    /// Write items, waiting for credit if the stream has too little
    ///
    /// Events that arrive while waiting stay queued for
    /// [`Endpoint::next_event`].
    pub fn write_blocking(&mut self, id: StreamId, amount: u64, data: Bytes) -> Result<()> {
        loop {
            match self.connection.write(id, amount, data.clone()) {
                Err(Error::WouldBlock { needed, available, .. }) => {
                    trace!(id, needed, available, "waiting for credit");
                    self.flush()?;
                    self.pump()?;
                }
                other => return other,
            }
        }
    }

    /// Flush pending packets and close the transport
    pub fn close(&mut self) -> Result<()> {
        if !self.connection.is_terminated() {
            self.flush()?;
        }
        self.transport.close()?;
        Ok(())
    }
}

/// Endpoint builder
pub struct EndpointBuilder {
    role: Role,
    settings: MuxSettingsBuilder,
}

impl EndpointBuilder {
    /// Create a builder for an endpoint with `role`
    pub fn new(role: Role) -> Self {
        EndpointBuilder {
            role,
            settings: MuxSettingsBuilder::new(),
        }
    }

    /// Set max items per Write
    pub fn max_write_items(mut self, max: u64) -> Self {
        self.settings = self.settings.max_write_items(max);
        self
    }

    /// Set auto forgo on Oops
    pub fn auto_forgo_on_oops(mut self, enable: bool) -> Self {
        self.settings = self.settings.auto_forgo_on_oops(enable);
        self
    }

    /// Set auto evict
    pub fn auto_evict(mut self, enable: bool) -> Self {
        self.settings = self.settings.auto_evict(enable);
        self
    }

    /// Set read chunk size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.settings = self.settings.read_chunk_size(size);
        self
    }

    /// Set transport timeout
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings = self.settings.io_timeout(timeout);
        self
    }

    /// Build the endpoint
    pub fn build<T: Transport, F: ItemFraming>(
        self,
        transport: T,
        framing: F,
    ) -> Result<Endpoint<T, F>> {
        let settings = self.settings.build()?;
        Ok(Endpoint::with_settings(self.role, settings, transport, framing))
    }
}
