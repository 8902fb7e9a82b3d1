//! Bonding change fan-out.
//!
//! Every successful store mutation is reported to a fixed sequence of stages, invoked
//! synchronously before the mutating call returns:
//!
//! 1. [`Stage::LocalAddress`]: address pinning must be settled first,
//! 2. [`Stage::Connections`]: live connection back-references,
//! 3. [`Stage::Pairability`],
//! 4. [`Stage::Reconnect`]: reconnection advertising,
//! 5. [`Stage::ClassicConnectability`]: BT Classic changes only.
//!
//! The stage order does not depend on the order handlers were subscribed in. After the
//! last stage the change is published on the event bus.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::driver::{BtDriver, Event, EventSink};
use crate::store::BondingStore;
use crate::types::{BondingChangeOp, BondingId, BondingKind};

/// A bonding mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BondingChange {
    pub id: BondingId,
    pub kind: BondingKind,
    pub op: BondingChangeOp,
}

/// A subsystem that reacts to bonding changes.
pub trait BondingChangeHandler {
    /// Called with the store that changed. The store lock is not held, so the handler
    /// may read from `store`. On [`BondingChangeOp::WillDelete`] the bonding is still
    /// readable.
    fn bonding_changed(&self, store: &dyn BondingStore, change: &BondingChange);
}

/// Position of a handler in the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    LocalAddress = 0,
    Connections = 1,
    Pairability = 2,
    Reconnect = 3,
    ClassicConnectability = 4,
}

const STAGES: usize = 5;

/// Ordered bonding change dispatcher.
pub struct Notifier<'d, M: RawMutex> {
    stages: Mutex<M, RefCell<[Option<&'d dyn BondingChangeHandler>; STAGES]>>,
    events: &'d dyn EventSink,
}

impl<'d, M: RawMutex> Notifier<'d, M> {
    pub fn new(events: &'d dyn EventSink) -> Self {
        Self {
            stages: Mutex::new(RefCell::new([None; STAGES])),
            events,
        }
    }

    /// Install `handler` at `stage`, replacing any previous handler of that stage.
    pub fn subscribe(&self, stage: Stage, handler: &'d dyn BondingChangeHandler) {
        self.stages.lock(|stages| {
            stages.borrow_mut()[stage as usize] = Some(handler);
        });
    }

    /// Run every stage for `change`, then publish it.
    pub fn notify(&self, store: &dyn BondingStore, change: BondingChange) {
        debug!("[notify] {:?} {:?} {:?}", change.kind, change.id, change.op);
        // Handlers run without our lock held so they may subscribe or notify themselves
        let stages = self.stages.lock(|stages| *stages.borrow());
        for handler in stages.iter().flatten() {
            handler.bonding_changed(store, &change);
        }
        self.events.publish(Event::BondingChanged {
            id: change.id,
            kind: change.kind,
            op: change.op,
        });
    }

    /// Publish an event that is not a bonding change.
    pub fn publish(&self, event: Event) {
        self.events.publish(event);
    }
}

/// Recomputes BR/EDR connectability when a BT Classic bonding changes.
pub struct ClassicConnectability<'d> {
    driver: &'d dyn BtDriver,
}

impl<'d> ClassicConnectability<'d> {
    pub fn new(driver: &'d dyn BtDriver) -> Self {
        Self { driver }
    }
}

impl BondingChangeHandler for ClassicConnectability<'_> {
    fn bonding_changed(&self, _store: &dyn BondingStore, change: &BondingChange) {
        if change.kind == BondingKind::BtClassic {
            self.driver.update_classic_connectability();
        }
    }
}
