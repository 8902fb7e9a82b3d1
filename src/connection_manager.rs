//! Live connections and their bonding back-references.
use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::config::MAX_CONNECTIONS;
use crate::notify::{BondingChange, BondingChangeHandler};
use crate::store::BondingStore;
use crate::types::{BondingChangeOp, BondingId, BondingKind, Identity, IdentityResolvingKey};
use crate::Error;

/// Snapshot of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connection {
    pub handle: ConnHandle,
    /// Transport of the link.
    pub transport: BondingKind,
    /// Address the remote connected with.
    pub peer_addr: BdAddr,
    /// Identity of the remote, once resolved.
    pub identity: Option<Identity>,
    pub irk: Option<IdentityResolvingKey>,
    /// The bonding this connection belongs to.
    pub bonding: Option<BondingId>,
    pub encrypted: bool,
}

impl Connection {
    /// Does this connection reach the remote of the BLE bonding with `identity` and `irk`?
    fn is_remote(&self, identity: &Identity, irk: &IdentityResolvingKey) -> bool {
        self.transport == BondingKind::Ble
            && (self.irk.as_ref() == Some(irk)
                || self.identity.map(|i| i.addr) == Some(identity.addr)
                || self.peer_addr == identity.addr)
    }
}

/// Lookup and update of live connections.
pub trait ConnectionRegistry {
    /// Find a connection by peer or identity address.
    fn find_by_addr(&self, addr: &BdAddr) -> Option<Connection>;

    /// Find a BLE connection whose remote resolved to `irk`.
    fn find_by_irk(&self, irk: &IdentityResolvingKey) -> Option<Connection>;

    fn get(&self, handle: ConnHandle) -> Option<Connection>;

    /// Visit every live connection.
    fn for_each(&self, f: &mut dyn FnMut(&Connection));

    /// Point `handle` at `bonding`, or clear the back-reference.
    fn set_bonding(&self, handle: ConnHandle, bonding: Option<BondingId>) -> Result<(), Error>;

    /// Is any live connection bound to `bonding`?
    fn is_bonding_connected(&self, bonding: BondingId, kind: BondingKind) -> bool {
        let mut connected = false;
        self.for_each(&mut |conn| connected |= conn.transport == kind && conn.bonding == Some(bonding));
        connected
    }
}

/// Bounded in-RAM connection table.
pub struct ConnectionManager<M: RawMutex> {
    connections: Mutex<M, RefCell<[Option<Connection>; MAX_CONNECTIONS]>>,
}

impl<M: RawMutex> Default for ConnectionManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> ConnectionManager<M> {
    pub const fn new() -> Self {
        Self {
            connections: Mutex::new(RefCell::new([None; MAX_CONNECTIONS])),
        }
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut [Option<Connection>; MAX_CONNECTIONS]) -> R) -> R {
        self.connections.lock(|connections| f(&mut connections.borrow_mut()))
    }

    fn find(&self, mut f: impl FnMut(&Connection) -> bool) -> Option<Connection> {
        self.with_mut(|connections| connections.iter().flatten().find(|c| f(c)).copied())
    }

    fn update(&self, handle: ConnHandle, f: impl FnOnce(&mut Connection)) -> Result<(), Error> {
        self.with_mut(|connections| {
            let conn = connections
                .iter_mut()
                .flatten()
                .find(|c| c.handle == handle)
                .ok_or(Error::NotFound)?;
            f(conn);
            Ok(())
        })
    }

    /// Register a new link.
    ///
    /// The link is bound right away to a bonding `store` holds for `peer_addr`.
    pub fn connect(
        &self,
        store: &dyn BondingStore,
        handle: ConnHandle,
        transport: BondingKind,
        peer_addr: BdAddr,
    ) -> Result<(), Error> {
        let bonding = match transport {
            BondingKind::Ble => store.get_ble_pairing_by_addr(&peer_addr).map(|(id, _)| id),
            BondingKind::BtClassic => store.get_bt_classic_pairing_by_addr(&peer_addr).map(|(id, _)| id),
        };
        self.with_mut(|connections| {
            let Some(slot) = connections.iter_mut().find(|c| c.is_none()) else {
                trace!("[link][connect] no available slot found for handle {:?}", handle);
                return Err(Error::StorageFull);
            };
            *slot = Some(Connection {
                handle,
                transport,
                peer_addr,
                identity: None,
                irk: None,
                bonding,
                encrypted: false,
            });
            Ok(())
        })
    }

    pub fn disconnected(&self, handle: ConnHandle) -> Result<(), Error> {
        self.with_mut(|connections| {
            for slot in connections.iter_mut() {
                if matches!(slot, Some(c) if c.handle == handle) {
                    *slot = None;
                    return Ok(());
                }
            }
            trace!("[link][disconnect] connection handle {:?} not found", handle);
            Err(Error::NotFound)
        })
    }

    /// The remote of `handle` resolved to `identity`.
    pub fn resolved(&self, handle: ConnHandle, identity: Identity, irk: IdentityResolvingKey) -> Result<(), Error> {
        self.update(handle, |conn| {
            conn.identity = Some(identity);
            conn.irk = Some(irk);
        })
    }

    pub fn set_encrypted(&self, handle: ConnHandle, encrypted: bool) -> Result<(), Error> {
        self.update(handle, |conn| conn.encrypted = encrypted)
    }

    pub fn log_status(&self) {
        self.with_mut(|connections| {
            for (idx, conn) in connections.iter().enumerate() {
                if let Some(conn) = conn {
                    debug!("[link][idx = {}] {:?}", idx, conn);
                }
            }
        })
    }
}

impl<M: RawMutex> ConnectionRegistry for ConnectionManager<M> {
    fn find_by_addr(&self, addr: &BdAddr) -> Option<Connection> {
        self.find(|c| c.peer_addr == *addr || c.identity.map(|i| i.addr) == Some(*addr))
    }

    fn find_by_irk(&self, irk: &IdentityResolvingKey) -> Option<Connection> {
        self.find(|c| c.irk.as_ref() == Some(irk))
    }

    fn get(&self, handle: ConnHandle) -> Option<Connection> {
        self.find(|c| c.handle == handle)
    }

    fn for_each(&self, f: &mut dyn FnMut(&Connection)) {
        // Visit a copy so the callback may call back into the table
        let connections = self.with_mut(|connections| *connections);
        for conn in connections.iter().flatten() {
            f(conn);
        }
    }

    fn set_bonding(&self, handle: ConnHandle, bonding: Option<BondingId>) -> Result<(), Error> {
        self.update(handle, |conn| conn.bonding = bonding)
    }
}

impl<M: RawMutex> BondingChangeHandler for ConnectionManager<M> {
    fn bonding_changed(&self, store: &dyn BondingStore, change: &BondingChange) {
        match (change.op, change.kind) {
            (BondingChangeOp::WillDelete, kind) => self.with_mut(|connections| {
                for conn in connections.iter_mut().flatten() {
                    if conn.transport == kind && conn.bonding == Some(change.id) {
                        debug!("[link] {:?} loses bonding {:?}", conn.handle, change.id);
                        conn.bonding = None;
                    }
                }
            }),
            (_, BondingKind::Ble) => {
                let Some(pairing) = store.get_ble_pairing_by_id(change.id) else {
                    return;
                };
                let info = pairing.pairing_info;
                self.with_mut(|connections| {
                    for conn in connections.iter_mut().flatten() {
                        if conn.is_remote(&info.identity, &info.irk) {
                            conn.bonding = Some(change.id);
                        }
                    }
                })
            }
            (_, BondingKind::BtClassic) => {
                let Some(pairing) = store.get_bt_classic_pairing_by_id(change.id) else {
                    return;
                };
                self.with_mut(|connections| {
                    for conn in connections.iter_mut().flatten() {
                        if conn.transport == BondingKind::BtClassic && conn.peer_addr == pairing.addr {
                            conn.bonding = Some(change.id);
                        }
                    }
                })
            }
        }
    }
}
