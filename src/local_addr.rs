//! Private address cycling.
//!
//! The radio rotates its private resolvable address unless cycling is paused. Pausing is
//! reference counted: the address stays pinned while anybody needs it stable, for
//! instance while the device is discoverable or while a bonded remote requires a fixed
//! address.
use core::cell::RefCell;

use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::driver::BtDriver;
use crate::notify::{BondingChange, BondingChangeHandler};
use crate::store::BondingStore;
use crate::types::{BondingChangeOp, BondingKind};

/// Policies that keep address cycling paused for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalAddressConfig {
    /// Recovery firmware never cycles.
    pub always_paused_recovery: bool,
    /// Radios whose address resolution misbehaves with cycling enabled.
    pub always_paused_legacy_radio: bool,
}

impl LocalAddressConfig {
    fn always_paused(&self) -> bool {
        self.always_paused_recovery || self.always_paused_legacy_radio
    }
}

#[derive(Default)]
struct State {
    pause_count: u32,
    paused_due_to_pinned: bool,
    pinned: Option<BdAddr>,
}

pub struct LocalAddress<'d, M: RawMutex> {
    state: Mutex<M, RefCell<State>>,
    driver: &'d dyn BtDriver,
    config: LocalAddressConfig,
}

impl<'d, M: RawMutex> LocalAddress<'d, M> {
    pub fn new(driver: &'d dyn BtDriver, config: LocalAddressConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State::default())),
            driver,
            config,
        }
    }

    /// Load or create the pinned address and apply the boot time pinning state.
    pub fn init(&self, store: &dyn BondingStore) {
        let pinned = match store.get_ble_pinned_address() {
            Some(addr) => addr,
            None => {
                let addr = self.driver.generate_private_resolvable_address();
                if !store.set_ble_pinned_address(Some(&addr)) {
                    warn!("[local addr] failed to persist pinned address");
                }
                info!("[local addr] generated pinned address {:?}", addr);
                addr
            }
        };
        self.state.lock(|state| state.borrow_mut().pinned = Some(pinned));

        self.update_pinning(store.has_pinned_ble_pairings());
        if self.config.always_paused() {
            info!("[local addr] cycling permanently paused");
            self.pause_cycling();
        }
    }

    /// Stop rotating the address. Each call must be balanced by [`Self::resume_cycling`].
    pub fn pause_cycling(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.pause_count = unwrap!(state.pause_count.checked_add(1), "pause count overflow");
            if state.pause_count == 1 {
                debug!("[local addr] pausing cycling");
                self.driver.set_local_address(false, state.pinned.as_ref());
            }
        })
    }

    pub fn resume_cycling(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.pause_count = unwrap!(
                state.pause_count.checked_sub(1),
                "bug: resuming address cycling that was not paused"
            );
            if state.pause_count == 0 {
                debug!("[local addr] resuming cycling");
                self.driver.set_local_address(true, None);
            }
        })
    }

    pub fn is_cycling_paused(&self) -> bool {
        self.state.lock(|state| state.borrow().pause_count > 0)
    }

    pub fn pinned_address(&self) -> Option<BdAddr> {
        self.state.lock(|state| state.borrow().pinned)
    }

    fn update_pinning(&self, required: bool) {
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let changed = state.paused_due_to_pinned != required;
            state.paused_due_to_pinned = required;
            changed
        });
        match (changed, required) {
            (true, true) => self.pause_cycling(),
            (true, false) => self.resume_cycling(),
            _ => {}
        }
    }
}

impl<M: RawMutex> BondingChangeHandler for LocalAddress<'_, M> {
    fn bonding_changed(&self, store: &dyn BondingStore, change: &BondingChange) {
        if change.kind != BondingKind::Ble {
            return;
        }
        // A bonding being deleted is still stored, leave it out
        let mut required = false;
        store.for_each_ble_pairing(&mut |id, pairing| {
            if !(change.op == BondingChangeOp::WillDelete && id == change.id) {
                required |= pairing.requires_address_pinning;
            }
        });
        self.update_pinning(required);
    }
}
