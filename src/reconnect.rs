//! Advertising for reconnection by the gateway.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::connection_manager::ConnectionRegistry;
use crate::driver::BtDriver;
use crate::notify::{BondingChange, BondingChangeHandler};
use crate::store::BondingStore;
use crate::types::{BondingChangeOp, BondingKind};

/// Advertises while a BLE gateway is bonded but not connected.
///
/// Only edges reach the driver. Call [`Reconnect::update`] whenever a connection comes
/// or goes; bonding changes are picked up through the notifier.
pub struct Reconnect<'d, M: RawMutex> {
    advertising: Mutex<M, RefCell<Option<bool>>>,
    driver: &'d dyn BtDriver,
    connections: &'d dyn ConnectionRegistry,
}

impl<'d, M: RawMutex> Reconnect<'d, M> {
    pub fn new(driver: &'d dyn BtDriver, connections: &'d dyn ConnectionRegistry) -> Self {
        Self {
            advertising: Mutex::new(RefCell::new(None)),
            driver,
            connections,
        }
    }

    pub fn update(&self, store: &dyn BondingStore) {
        self.apply(self.wanted(store, None));
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.lock(|advertising| advertising.borrow().unwrap_or(false))
    }

    fn wanted(&self, store: &dyn BondingStore, deleting: Option<&BondingChange>) -> bool {
        match store.active_gateway() {
            Some((id, BondingKind::Ble)) => {
                let going = matches!(deleting, Some(c) if c.id == id && c.kind == BondingKind::Ble);
                !going && !self.connections.is_bonding_connected(id, BondingKind::Ble)
            }
            _ => false,
        }
    }

    fn apply(&self, enabled: bool) {
        let changed = self
            .advertising
            .lock(|advertising| advertising.borrow_mut().replace(enabled) != Some(enabled));
        if changed {
            debug!("[reconnect] advertising: {}", enabled);
            self.driver.set_reconnect_advertising(enabled);
        }
    }
}

impl<M: RawMutex> BondingChangeHandler for Reconnect<'_, M> {
    fn bonding_changed(&self, store: &dyn BondingStore, change: &BondingChange) {
        let deleting = (change.op == BondingChangeOp::WillDelete).then_some(change);
        self.apply(self.wanted(store, deleting));
    }
}
