//! Connection registry and adoption channel.
//!
//! The registry is a fixed arena indexed by connection handle. Each slot
//! owns a single-slot disconnect signal (set from the stack's event
//! context) and a `closed` signal (set by the connection's background task
//! once the slot has been released).
//!
//! Slot lifecycle:
//!
//! ```text
//!   Vacant --insert--> Open{gen} --disconnect signal--> run() releases --> Vacant
//!                          |
//!                          +--rollback (cancelled / never adopted)--------> Vacant
//! ```
//!
//! Generations let a stale [`Connection`] view detect that its handle has
//! since been reused.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::ble::gatt::EnvAttributes;
use crate::ble::stack::Radio;
use crate::ble::ConnHandle;
use crate::error::Error;

/// A registry entry: the handle plus the generation it was opened under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionId {
    pub handle: ConnHandle,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Vacant,
    Open { generation: u32 },
}

struct Slot<M: RawMutex> {
    state: Mutex<M, Cell<SlotState>>,
    /// Carries the HCI disconnect reason.
    disconnect: Signal<M, u8>,
    closed: Signal<M, ()>,
}

impl<M: RawMutex> Slot<M> {
    fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(SlotState::Vacant)),
            disconnect: Signal::new(),
            closed: Signal::new(),
        }
    }

    fn state(&self) -> SlotState {
        self.state.lock(Cell::get)
    }
}

pub struct ConnectionRegistry<M: RawMutex, const N: usize> {
    slots: [Slot<M>; N],
    next_generation: Mutex<M, Cell<u32>>,
}

impl<M: RawMutex, const N: usize> ConnectionRegistry<M, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
            next_generation: Mutex::new(Cell::new(0)),
        }
    }

    fn slot(&self, handle: ConnHandle) -> Option<&Slot<M>> {
        self.slots.get(handle as usize)
    }

    /// Open a slot for `handle`. Never overwrites a live entry.
    pub fn insert(&self, handle: ConnHandle) -> Result<ConnectionId, Error> {
        let slot = self.slot(handle).ok_or(Error::InvalidHandle)?;

        let generation = slot.state.lock(|state| {
            if let SlotState::Open { .. } = state.get() {
                return Err(Error::HandleInUse);
            }
            let generation = self.next_generation.lock(|g| {
                let next = g.get();
                g.set(next.wrapping_add(1));
                next
            });
            state.set(SlotState::Open { generation });
            Ok(generation)
        })?;

        slot.disconnect.reset();
        slot.closed.reset();

        Ok(ConnectionId { handle, generation })
    }

    /// Wake the background task of the connection on `handle`.
    ///
    /// Signalling an already-signalled connection only overwrites the reason.
    pub fn signal_disconnect(&self, handle: ConnHandle, reason: u8) -> Result<(), Error> {
        let slot = self.slot(handle).ok_or(Error::UnknownConnection)?;
        match slot.state() {
            SlotState::Open { .. } => {
                slot.disconnect.signal(reason);
                Ok(())
            }
            SlotState::Vacant => Err(Error::UnknownConnection),
        }
    }

    pub fn contains(&self, handle: ConnHandle) -> bool {
        self.slot(handle)
            .is_some_and(|slot| matches!(slot.state(), SlotState::Open { .. }))
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state(), SlotState::Open { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow a view of the connection identified by `id`.
    pub fn connection(&self, id: ConnectionId) -> Connection<'_, M, N> {
        Connection { registry: self, id }
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.slot(id.handle).is_some_and(|slot| {
            slot.state()
                == SlotState::Open {
                    generation: id.generation,
                }
        })
    }

    /// Vacate the slot if it still belongs to `id`.
    fn release(&self, id: ConnectionId) -> bool {
        let Some(slot) = self.slot(id.handle) else {
            return false;
        };
        slot.state.lock(|state| {
            if state.get()
                == (SlotState::Open {
                    generation: id.generation,
                })
            {
                state.set(SlotState::Vacant);
                true
            } else {
                false
            }
        })
    }

    /// Undo an [`insert`](Self::insert) whose connection was never served
    /// to completion.
    pub fn rollback(&self, id: ConnectionId) {
        if self.release(id) {
            debug!("conn {}: rolled back", id.handle);
        }
        if let Some(slot) = self.slot(id.handle) {
            slot.closed.signal(());
        }
    }
}

impl<M: RawMutex, const N: usize> Default for ConnectionRegistry<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A borrowed handle to one registry entry.
pub struct Connection<'r, M: RawMutex, const N: usize> {
    registry: &'r ConnectionRegistry<M, N>,
    id: ConnectionId,
}

impl<M: RawMutex, const N: usize> Clone for Connection<'_, M, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: RawMutex, const N: usize> Copy for Connection<'_, M, N> {}

impl<'r, M: RawMutex, const N: usize> Connection<'r, M, N> {
    pub fn handle(&self) -> ConnHandle {
        self.id.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the registry entry still belongs to this connection.
    pub fn is_open(&self) -> bool {
        self.registry.is_current(self.id)
    }

    /// Background task: wait for the disconnect signal, then remove the
    /// entry and mark the connection closed.
    pub async fn run(&self) {
        if !self.is_open() {
            return;
        }
        let Some(slot) = self.registry.slot(self.id.handle) else {
            return;
        };

        let reason = slot.disconnect.wait().await;
        self.registry.release(self.id);
        slot.closed.signal(());
        info!("conn {}: closed (reason {=u8:#x})", self.id.handle, reason);
    }

    /// Resolve once the connection is closed; immediately if it never was
    /// open or is already gone.
    pub async fn disconnected(&self) {
        let Some(slot) = self.registry.slot(self.id.handle) else {
            return;
        };
        while self.is_open() {
            slot.closed.wait().await;
        }
    }
}

/// Capacity-1 handoff of a freshly connected central from the event
/// context to the controller.
pub struct PendingConnection<M: RawMutex> {
    slot: Signal<M, ConnectionId>,
}

impl<M: RawMutex> PendingConnection<M> {
    pub fn new() -> Self {
        Self {
            slot: Signal::new(),
        }
    }

    /// Fails if an earlier connection has not been claimed yet.
    pub fn publish(&self, id: ConnectionId) -> Result<(), Error> {
        if self.slot.signaled() {
            return Err(Error::Overloaded);
        }
        self.slot.signal(id);
        Ok(())
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.signaled()
    }

    /// Wait for and take the pending connection.
    pub async fn claim(&self) -> ConnectionId {
        self.slot.wait().await
    }

    pub fn try_claim(&self) -> Option<ConnectionId> {
        self.slot.try_take()
    }
}

impl<M: RawMutex> Default for PendingConnection<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the event dispatcher and the controller.
pub struct PeripheralState<M: RawMutex, const N: usize> {
    registry: ConnectionRegistry<M, N>,
    pending: PendingConnection<M>,
    attributes: Mutex<M, Cell<Option<EnvAttributes>>>,
}

impl<M: RawMutex, const N: usize> PeripheralState<M, N> {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            pending: PendingConnection::new(),
            attributes: Mutex::new(Cell::new(None)),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry<M, N> {
        &self.registry
    }

    pub fn pending(&self) -> &PendingConnection<M> {
        &self.pending
    }

    /// Registered value handles, once services are up.
    pub fn attributes(&self) -> Option<EnvAttributes> {
        self.attributes.lock(Cell::get)
    }

    pub fn set_attributes(&self, attrs: EnvAttributes) {
        self.attributes.lock(|a| a.set(Some(attrs)));
    }
}

impl<M: RawMutex, const N: usize> Default for PeripheralState<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped ownership of an adopted connection.
///
/// Dropped while still armed (the serving future was cancelled or bailed
/// out early) it asks the stack to drop the link and rolls the registry
/// entry back, so nothing outlives its owner.
pub struct ConnectionGuard<'a, R: Radio, M: RawMutex, const N: usize> {
    radio: &'a R,
    registry: &'a ConnectionRegistry<M, N>,
    id: ConnectionId,
    armed: bool,
}

impl<'a, R: Radio, M: RawMutex, const N: usize> ConnectionGuard<'a, R, M, N> {
    pub fn new(radio: &'a R, registry: &'a ConnectionRegistry<M, N>, id: ConnectionId) -> Self {
        Self {
            radio,
            registry,
            id,
            armed: true,
        }
    }

    /// The connection closed normally.
    pub fn complete(mut self) {
        self.armed = false;
    }
}

impl<R: Radio, M: RawMutex, const N: usize> Drop for ConnectionGuard<'_, R, M, N> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("conn {}: abandoned, disconnecting", self.id.handle);
        if let Err(e) = self.radio.disconnect(self.id.handle) {
            warn!("conn {}: disconnect failed: {:?}", self.id.handle, e);
        }
        self.registry.rollback(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Registry = ConnectionRegistry<NoopRawMutex, 4>;

    #[test]
    fn insert_and_signal() {
        let registry = Registry::new();
        let id = registry.insert(3).unwrap();
        assert_eq!(id.handle, 3);
        assert!(registry.contains(3));
        assert_eq!(registry.len(), 1);
        assert!(registry.signal_disconnect(3, 0x13).is_ok());
        // Second signal is harmless.
        assert!(registry.signal_disconnect(3, 0x13).is_ok());
    }

    #[test]
    fn insert_never_overwrites() {
        let registry = Registry::new();
        let first = registry.insert(1).unwrap();
        assert_eq!(registry.insert(1), Err(Error::HandleInUse));
        assert!(registry.connection(first).is_open());
    }

    #[test]
    fn out_of_range_handle() {
        let registry = Registry::new();
        assert_eq!(registry.insert(4), Err(Error::InvalidHandle));
        assert_eq!(registry.signal_disconnect(9, 0), Err(Error::UnknownConnection));
        assert!(!registry.contains(9));
    }

    #[test]
    fn unknown_disconnect_rejected() {
        let registry = Registry::new();
        assert_eq!(registry.signal_disconnect(2, 0x13), Err(Error::UnknownConnection));
    }

    #[test]
    fn run_releases_slot() {
        let registry = Registry::new();
        let id = registry.insert(3).unwrap();
        let conn = registry.connection(id);
        registry.signal_disconnect(3, 0x13).unwrap();

        block_on(join(conn.run(), conn.disconnected()));

        assert!(!registry.contains(3));
        assert!(registry.is_empty());
        assert!(!conn.is_open());
    }

    #[test]
    fn disconnected_immediate_when_not_open() {
        let registry = Registry::new();
        let id = registry.insert(0).unwrap();
        registry.rollback(id);
        block_on(registry.connection(id).disconnected());
        block_on(registry.connection(id).run());
    }

    #[test]
    fn stale_view_does_not_release_reused_handle() {
        let registry = Registry::new();
        let old = registry.insert(2).unwrap();
        registry.rollback(old);
        let new = registry.insert(2).unwrap();
        assert_ne!(old, new);

        assert!(!registry.connection(old).is_open());
        registry.rollback(old);
        assert!(registry.connection(new).is_open());
    }

    #[test]
    fn pending_slot_holds_one() {
        let pending: PendingConnection<NoopRawMutex> = PendingConnection::new();
        let a = ConnectionId {
            handle: 1,
            generation: 0,
        };
        let b = ConnectionId {
            handle: 2,
            generation: 1,
        };
        assert!(pending.publish(a).is_ok());
        assert!(pending.is_occupied());
        assert_eq!(pending.publish(b), Err(Error::Overloaded));
        assert_eq!(block_on(pending.claim()), a);
        assert!(!pending.is_occupied());
        assert!(pending.try_claim().is_none());
    }
}
