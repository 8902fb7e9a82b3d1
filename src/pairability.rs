//! BLE discoverability and BT Classic pairability.
//!
//! Subsystems that want the device to be pairable take a reference with one of the
//! `use_*` calls and drop it with the matching `release_*`. Every change only schedules
//! an evaluation; [`Pairability::poll`] performs it on the background task, reading the
//! counts as they are at that point, so bursts of use/release collapse into a single
//! driver update.
//!
//! While the device is BLE discoverable, private address cycling is paused so that the
//! remote sees a single address during the whole pairing window.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};

use crate::driver::BtDriver;
use crate::local_addr::LocalAddress;
use crate::notify::{BondingChange, BondingChangeHandler};
use crate::store::BondingStore;

struct State {
    bt_classic_refcount: u32,
    ble_refcount: u32,
    /// Expiry of the timed BLE grant, which holds one BLE reference while set.
    ble_period_deadline: Option<Instant>,
    pairable_due_to_no_gateway_bondings: bool,
    eval_pending: bool,
    bondings_changed: bool,
    ble_discoverable: Option<bool>,
    classic_pairable: Option<bool>,
}

impl State {
    fn inc(count: &mut u32) {
        *count = unwrap!(count.checked_add(1), "pairability refcount overflow");
    }

    fn dec(count: &mut u32) {
        *count = unwrap!(count.checked_sub(1), "bug: pairability released more often than used");
    }
}

pub struct Pairability<'d, M: RawMutex> {
    state: Mutex<M, RefCell<State>>,
    driver: &'d dyn BtDriver,
    local_addr: &'d LocalAddress<'d, M>,
    wake: Signal<M, ()>,
}

impl<'d, M: RawMutex> Pairability<'d, M> {
    /// The first [`Self::poll`] applies the boot time policy and pushes the initial state
    /// to the driver.
    pub fn new(driver: &'d dyn BtDriver, local_addr: &'d LocalAddress<'d, M>) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                bt_classic_refcount: 0,
                ble_refcount: 0,
                ble_period_deadline: None,
                pairable_due_to_no_gateway_bondings: false,
                eval_pending: true,
                bondings_changed: true,
                ble_discoverable: None,
                classic_pairable: None,
            })),
            driver,
            local_addr,
            wake: Signal::new(),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut State)) {
        self.update(|state| {
            f(state);
            true
        })
    }

    /// Like [`Self::modify`], evaluating only when `f` reports a change.
    fn update(&self, f: impl FnOnce(&mut State) -> bool) {
        let schedule = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            f(&mut state) && !core::mem::replace(&mut state.eval_pending, true)
        });
        if schedule {
            self.wake.signal(());
        }
    }

    /// Make the device pairable over both transports.
    pub fn use_all(&self) {
        self.modify(|state| {
            State::inc(&mut state.bt_classic_refcount);
            State::inc(&mut state.ble_refcount);
        })
    }

    pub fn release_all(&self) {
        self.modify(|state| {
            State::dec(&mut state.bt_classic_refcount);
            State::dec(&mut state.ble_refcount);
        })
    }

    pub fn use_bt(&self) {
        self.modify(|state| State::inc(&mut state.bt_classic_refcount))
    }

    pub fn release_bt(&self) {
        self.modify(|state| State::dec(&mut state.bt_classic_refcount))
    }

    pub fn use_ble(&self) {
        self.modify(|state| State::inc(&mut state.ble_refcount))
    }

    pub fn release_ble(&self) {
        self.modify(|state| State::dec(&mut state.ble_refcount))
    }

    /// Make the device BLE discoverable for `duration` from now.
    ///
    /// Calling this again while a grant is running does not take another reference, it
    /// only moves the expiry, possibly closer.
    pub fn use_ble_for_period(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        self.modify(|state| {
            if state.ble_period_deadline.is_none() {
                State::inc(&mut state.ble_refcount);
            }
            state.ble_period_deadline = Some(deadline);
        });
        debug!("[pairability] BLE pairable for {} ms", duration.as_millis());
    }

    /// Current `(bt_classic, ble)` reference counts.
    pub fn refcounts(&self) -> (u32, u32) {
        self.state.lock(|state| {
            let state = state.borrow();
            (state.bt_classic_refcount, state.ble_refcount)
        })
    }

    /// BLE discoverability as last pushed to the driver.
    pub fn is_ble_discoverable(&self) -> bool {
        self.state.lock(|state| state.borrow().ble_discoverable.unwrap_or(false))
    }

    pub fn is_classic_pairable(&self) -> bool {
        self.state.lock(|state| state.borrow().classic_pairable.unwrap_or(false))
    }

    /// Keep a factory fresh device pairable.
    ///
    /// Without an active gateway and without an ANCS capable BLE bonding, a reference is
    /// taken on both transports. It is released as soon as either appears.
    pub fn update_due_to_bonding_change(&self, store: &dyn BondingStore) {
        let needed = store.active_gateway().is_none() && !store.has_ble_ancs_bonding();
        // Check and flip the latch in one go so that concurrent callers count once
        self.update(|state| {
            if state.pairable_due_to_no_gateway_bondings == needed {
                return false;
            }
            info!(
                "[pairability] {} pairability for lack of gateway bondings",
                if needed { "forcing" } else { "dropping" }
            );
            state.pairable_due_to_no_gateway_bondings = needed;
            if needed {
                State::inc(&mut state.bt_classic_refcount);
                State::inc(&mut state.ble_refcount);
            } else {
                State::dec(&mut state.bt_classic_refcount);
                State::dec(&mut state.ble_refcount);
            }
            true
        });
    }

    /// Expire the timed BLE grant and run a scheduled evaluation.
    pub fn poll(&self, store: &dyn BondingStore, now: Instant) {
        let expired = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.ble_period_deadline {
                Some(deadline) if deadline <= now => {
                    state.ble_period_deadline = None;
                    true
                }
                _ => false,
            }
        });
        if expired {
            debug!("[pairability] timed BLE grant expired");
            self.release_ble();
        }

        let bondings_changed = self
            .state
            .lock(|state| core::mem::replace(&mut state.borrow_mut().bondings_changed, false));
        if bondings_changed {
            self.update_due_to_bonding_change(store);
        }

        let pending = self
            .state
            .lock(|state| core::mem::replace(&mut state.borrow_mut().eval_pending, false));
        if pending {
            self.evaluate();
        }
    }

    fn evaluate(&self) {
        let (ble, classic, was_ble, was_classic) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let ble = state.ble_refcount > 0;
            let classic = state.bt_classic_refcount > 0;
            let was_ble = state.ble_discoverable.replace(ble);
            let was_classic = state.classic_pairable.replace(classic);
            (ble, classic, was_ble, was_classic)
        });

        if was_ble != Some(ble) {
            info!("[pairability] BLE discoverable: {}", ble);
            self.driver.set_ble_discoverable(ble);
            // The address must not change while discoverable
            match (was_ble.unwrap_or(false), ble) {
                (false, true) => self.local_addr.pause_cycling(),
                (true, false) => self.local_addr.resume_cycling(),
                _ => {}
            }
        }
        if was_classic != Some(classic) {
            info!("[pairability] BT Classic pairable: {}", classic);
            self.driver.set_classic_pairable(classic);
            self.driver.update_classic_connectability();
        }
    }

    /// Expiry of the timed BLE grant.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock(|state| state.borrow().ble_period_deadline)
    }

    /// Wait until an evaluation is scheduled.
    pub async fn wait(&self) {
        self.wake.wait().await
    }
}

impl<M: RawMutex> BondingChangeHandler for Pairability<'_, M> {
    fn bonding_changed(&self, _store: &dyn BondingStore, _change: &BondingChange) {
        // Bondings being deleted are still stored now, decide once the change is done
        self.modify(|state| state.bondings_changed = true);
    }
}
