use core::fmt;

use heapless::Vec;
use managed::ManagedSlice;

use crate::config::{TCP_MAX_CONNECTION_COUNT, TCP_MAX_LISTENER_COUNT};
use crate::socket::tcp::{Connection, State};
use crate::storage::Full;
use crate::wire::{IpEndpoint, IpListenEndpoint};

/// A handle, identifying a connection in a [ConnectionSet].
///
/// Handles carry the generation of their slot, so a handle to a connection
/// that has since been freed resolves to nothing, even once the slot is
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    index: usize,
    generation: u16,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A handle, identifying a listening endpoint in a [ConnectionSet].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(u16);

impl fmt::Display for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Error returned by [crate::iface::Interface::listen].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum ListenError {
    InvalidPort,
    AddressInUse,
    TableFull,
}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenError::InvalidPort => write!(f, "invalid port"),
            ListenError::AddressInUse => write!(f, "address in use"),
            ListenError::TableFull => write!(f, "listener table full"),
        }
    }
}

impl core::error::Error for ListenError {}

/// An item of a connection set.
///
/// This is a public type so that the storage for a set can be allocated
/// up front, e.g. as a fixed array.
#[derive(Debug)]
pub struct ConnectionStorage {
    inner: Option<Connection>,
    generation: u16,
}

impl ConnectionStorage {
    pub const EMPTY: Self = Self {
        inner: None,
        generation: 0,
    };
}

/// A passive-open endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Listener {
    pub handle: ListenHandle,
    pub endpoint: IpListenEndpoint,
    /// How many half-open connections may wait to be accepted.
    pub backlog: u8,
    pub accepts_pending: u8,
}

/// Where an incoming segment belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    Active(Handle),
    TimeWait(Handle),
    Listen(ListenHandle),
    Unmatched,
}

/// The connection table: slots holding the control blocks, and the three
/// collections a segment is matched against.
///
/// Active and TIME-WAIT connections are kept as ordered handle lists with the
/// most recently used first; a hit on an active connection or a listener
/// moves it to the front, since segments tend to come in bursts.
#[derive(Debug)]
pub struct ConnectionSet<'a> {
    slots: ManagedSlice<'a, ConnectionStorage>,
    active: Vec<Handle, TCP_MAX_CONNECTION_COUNT>,
    time_wait: Vec<Handle, TCP_MAX_CONNECTION_COUNT>,
    listeners: Vec<Listener, TCP_MAX_LISTENER_COUNT>,
    next_listener: u16,
}

impl<'a> ConnectionSet<'a> {
    /// Create a connection set using the provided storage.
    pub fn new<S>(slots: S) -> ConnectionSet<'a>
    where
        S: Into<ManagedSlice<'a, ConnectionStorage>>,
    {
        ConnectionSet {
            slots: slots.into(),
            active: Vec::new(),
            time_wait: Vec::new(),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Register a connection as active, at the front of the collection.
    pub(crate) fn add(&mut self, mut connection: Connection) -> Result<Handle, Full> {
        if self.active.is_full() {
            return Err(Full);
        }
        let index = match self.slots.iter().position(|slot| slot.inner.is_none()) {
            Some(index) => index,
            None => match &mut self.slots {
                ManagedSlice::Borrowed(_) => return Err(Full),
                ManagedSlice::Owned(slots) => {
                    slots.push(ConnectionStorage::EMPTY);
                    slots.len() - 1
                }
            },
        };

        if connection.is_backlog_pending() {
            if let Some(listener) = connection.listener().and_then(|l| self.listener_mut(l)) {
                listener.accepts_pending = listener.accepts_pending.saturating_add(1);
            }
        }

        let slot = &mut self.slots[index];
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        connection.set_handle(handle);
        net_trace!("iface: adding {} as {}", connection, handle);
        slot.inner = Some(connection);
        self.active.insert(0, handle).map_err(|_| Full)?;
        Ok(handle)
    }

    /// Get a connection by its handle, if it is still there.
    pub fn get(&self, handle: Handle) -> Option<&Connection> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.inner.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.inner.as_mut())
    }

    /// Free a connection's slot. Its handle is dead from here on.
    pub(crate) fn remove(&mut self, handle: Handle) -> Option<Connection> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)?;
        let mut connection = slot.inner.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        self.active.retain(|h| *h != handle);
        self.time_wait.retain(|h| *h != handle);
        if let Some(listener) = connection.take_backlog().and_then(|l| self.listener_mut(l)) {
            listener.accepts_pending = listener.accepts_pending.saturating_sub(1);
        }
        net_trace!("iface: removed {} ({})", handle, connection);
        Some(connection)
    }

    /// Find what an incoming segment from `remote` to `local` belongs to.
    ///
    /// Active connections are searched first, then TIME-WAIT ones, then
    /// listeners, where one bound to the exact local address wins over a
    /// wildcard one.
    pub(crate) fn demux(&mut self, local: &IpEndpoint, remote: &IpEndpoint) -> Lookup {
        let matches = |slots: &ManagedSlice<'a, ConnectionStorage>, handle: &Handle| {
            slots[handle.index].inner.as_ref().is_some_and(|conn| {
                conn.local_endpoint() == *local && conn.remote_endpoint() == *remote
            })
        };

        if let Some(position) = self.active.iter().position(|h| matches(&self.slots, h)) {
            self.active[..=position].rotate_right(1);
            return Lookup::Active(self.active[0]);
        }
        if let Some(handle) = self.time_wait.iter().find(|h| matches(&self.slots, h)) {
            return Lookup::TimeWait(*handle);
        }

        let exact = self.listeners.iter().position(|listener| {
            listener.endpoint.port == local.port
                && listener.endpoint.is_exact()
                && listener.endpoint.addr == Some(local.addr)
        });
        let position = exact.or_else(|| {
            self.listeners.iter().position(|listener| {
                listener.endpoint.port == local.port
                    && !listener.endpoint.is_exact()
                    && listener.endpoint.accepts_addr(&local.addr)
            })
        });
        match position {
            Some(position) => {
                self.listeners[..=position].rotate_right(1);
                Lookup::Listen(self.listeners[0].handle)
            }
            None => Lookup::Unmatched,
        }
    }

    /// Move a connection that entered TIME-WAIT out of the active collection.
    ///
    /// When the TIME-WAIT collection is full its oldest entry is freed to
    /// make room.
    pub(crate) fn move_to_time_wait(&mut self, handle: Handle) {
        self.active.retain(|h| *h != handle);
        if self.time_wait.is_full() {
            if let Some(oldest) = self.time_wait.last().copied() {
                net_debug!("iface: TIME-WAIT full, dropping {}", oldest);
                self.remove(oldest);
            }
        }
        if self.time_wait.insert(0, handle).is_err() {
            self.remove(handle);
        }
    }

    /// Credit the listener's backlog once a connection has left SYN-RECEIVED.
    pub(crate) fn settle_backlog(&mut self, handle: Handle) {
        let Some(connection) = self.get_mut(handle) else {
            return;
        };
        if connection.state() == State::SynReceived {
            return;
        }
        if let Some(listener) = connection.take_backlog().and_then(|l| self.listener_mut(l)) {
            listener.accepts_pending = listener.accepts_pending.saturating_sub(1);
        }
    }

    /// Number of connections that are neither closed nor in TIME-WAIT.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of connections in TIME-WAIT.
    pub fn time_wait_count(&self) -> usize {
        self.time_wait.len()
    }

    pub(crate) fn active_handles(&self) -> Vec<Handle, TCP_MAX_CONNECTION_COUNT> {
        self.active.clone()
    }

    pub(crate) fn time_wait_handles(&self) -> Vec<Handle, TCP_MAX_CONNECTION_COUNT> {
        self.time_wait.clone()
    }

    /// Iterate over every live connection.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|slot| slot.inner.as_ref())
    }

    pub(crate) fn add_listener(
        &mut self,
        endpoint: IpListenEndpoint,
        backlog: u8,
    ) -> Result<ListenHandle, ListenError> {
        if endpoint.port == 0 {
            return Err(ListenError::InvalidPort);
        }
        let in_use = self.listeners.iter().any(|l| {
            l.endpoint.port == endpoint.port
                && l.endpoint.is_exact() == endpoint.is_exact()
                && (!endpoint.is_exact() || l.endpoint.addr == endpoint.addr)
        });
        if in_use {
            return Err(ListenError::AddressInUse);
        }
        if self.listeners.is_full() {
            return Err(ListenError::TableFull);
        }

        let mut id = self.next_listener;
        while self.listeners.iter().any(|l| l.handle.0 == id) {
            id = id.wrapping_add(1);
        }
        self.next_listener = id.wrapping_add(1);

        let handle = ListenHandle(id);
        self.listeners
            .insert(
                0,
                Listener {
                    handle,
                    endpoint,
                    backlog,
                    accepts_pending: 0,
                },
            )
            .map_err(|_| ListenError::TableFull)?;
        net_debug!("iface: listening on {} as {}", endpoint, handle);
        Ok(handle)
    }

    /// Stop listening. Connections still in SYN-RECEIVED lose their listener.
    pub(crate) fn remove_listener(&mut self, handle: ListenHandle) -> bool {
        let Some(position) = self.listeners.iter().position(|l| l.handle == handle) else {
            return false;
        };
        self.listeners.remove(position);
        for slot in self.slots.iter_mut() {
            if let Some(connection) = slot.inner.as_mut() {
                if connection.listener() == Some(handle) {
                    connection.detach_listener();
                }
            }
        }
        true
    }

    pub(crate) fn listener(&self, handle: ListenHandle) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.handle == handle)
    }

    fn listener_mut(&mut self, handle: ListenHandle) -> Option<&mut Listener> {
        self.listeners.iter_mut().find(|l| l.handle == handle)
    }
}
