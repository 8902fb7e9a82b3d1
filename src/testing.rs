//! Recording fakes of the external collaborators.

use std::cell::{Cell, RefCell};
use std::vec::Vec;

use bt_hci::param::{BdAddr, ConnHandle};

use crate::conn_params::ConnParams;
use crate::driver::{BtDriver, Event, EventSink, HrmSampler};
use crate::notify::{BondingChange, BondingChangeHandler};
use crate::store::BondingStore;
use crate::types::{EncryptionInfo, Identity, IdentityResolvingKey, LongTermKey, PairingInfo};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Call {
    SetLocalAddress { allow_cycling: bool, pinned: Option<BdAddr> },
    GenerateAddress,
    BleDiscoverable(bool),
    ClassicPairable(bool),
    UpdateClassicConnectability,
    ReconnectAdvertising(bool),
    HrmAdvertising(bool),
    Disconnect(ConnHandle),
    RequestConnParams(ConnHandle, ConnParams),
    Start,
    Stop,
    PowerDown,
}

#[derive(Default)]
pub struct FakeDriver {
    pub calls: RefCell<Vec<Call>>,
    pub start_fails: Cell<bool>,
}

impl FakeDriver {
    pub fn take(&self) -> Vec<Call> {
        self.calls.take()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl BtDriver for FakeDriver {
    fn set_local_address(&self, allow_cycling: bool, pinned: Option<&BdAddr>) {
        self.record(Call::SetLocalAddress {
            allow_cycling,
            pinned: pinned.copied(),
        });
    }

    fn generate_private_resolvable_address(&self) -> BdAddr {
        self.record(Call::GenerateAddress);
        BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    fn set_ble_discoverable(&self, discoverable: bool) {
        self.record(Call::BleDiscoverable(discoverable));
    }

    fn set_classic_pairable(&self, pairable: bool) {
        self.record(Call::ClassicPairable(pairable));
    }

    fn update_classic_connectability(&self) {
        self.record(Call::UpdateClassicConnectability);
    }

    fn set_reconnect_advertising(&self, enabled: bool) {
        self.record(Call::ReconnectAdvertising(enabled));
    }

    fn set_hrm_advertising(&self, enabled: bool) {
        self.record(Call::HrmAdvertising(enabled));
    }

    fn disconnect(&self, handle: ConnHandle) {
        self.record(Call::Disconnect(handle));
    }

    fn request_conn_params(&self, handle: ConnHandle, params: &ConnParams) {
        self.record(Call::RequestConnParams(handle, *params));
    }

    fn start(&self) -> bool {
        self.record(Call::Start);
        !self.start_fails.get()
    }

    fn stop(&self) {
        self.record(Call::Stop);
    }

    fn power_down(&self) {
        self.record(Call::PowerDown);
    }
}

#[derive(Default)]
pub struct FakeEvents {
    pub events: RefCell<Vec<Event>>,
}

impl FakeEvents {
    pub fn take(&self) -> Vec<Event> {
        self.events.take()
    }
}

impl EventSink for FakeEvents {
    fn publish(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

#[derive(Default)]
pub struct FakeSampler {
    pub sampling: Cell<bool>,
    pub starts: Cell<usize>,
}

impl HrmSampler for FakeSampler {
    fn start_sampling(&self) {
        self.sampling.set(true);
        self.starts.set(self.starts.get() + 1);
    }

    fn stop_sampling(&self) {
        self.sampling.set(false);
    }
}

/// Records every change it sees, tagged with `tag`.
pub struct Recorder<'a> {
    pub tag: &'static str,
    pub log: &'a RefCell<Vec<(&'static str, BondingChange)>>,
}

impl BondingChangeHandler for Recorder<'_> {
    fn bonding_changed(&self, _store: &dyn BondingStore, change: &BondingChange) {
        self.log.borrow_mut().push((self.tag, *change));
    }
}

/// Pairing info of a remote that distributed identity information.
pub fn pairing_info(seed: u8) -> PairingInfo {
    PairingInfo {
        local_encryption_info: EncryptionInfo {
            ltk: LongTermKey(0x1000 + u128::from(seed)),
            rand: 0x55,
            ediv: 0x1234,
        },
        remote_encryption_info: EncryptionInfo {
            ltk: LongTermKey(0x2000 + u128::from(seed)),
            rand: 0xaa,
            ediv: 0x4321,
        },
        irk: IdentityResolvingKey(0x3000 + u128::from(seed)),
        identity: Identity::random([seed, 1, 2, 3, 4, 0xc0]),
        is_local_encryption_info_valid: true,
        is_remote_encryption_info_valid: true,
        is_remote_identity_info_valid: true,
        ..Default::default()
    }
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}
