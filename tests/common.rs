#![allow(unused)]
use std::cell::{Cell, RefCell};

use bondkeep::conn_params::ConnParams;
use bondkeep::driver::{BtDriver, Event, EventSink, HrmSampler};
use bondkeep::{BdAddr, ConnHandle, EncryptionInfo, Identity, IdentityResolvingKey, LongTermKey, PairingInfo};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Call {
    SetLocalAddress(bool),
    BleDiscoverable(bool),
    ClassicPairable(bool),
    UpdateClassicConnectability,
    ReconnectAdvertising(bool),
    HrmAdvertising(bool),
    Disconnect(ConnHandle),
    RequestConnParams(ConnHandle),
    Start,
    Stop,
    PowerDown,
}

#[derive(Default)]
pub struct Driver {
    pub calls: RefCell<Vec<Call>>,
}

impl Driver {
    pub fn take(&self) -> Vec<Call> {
        self.calls.take()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl BtDriver for Driver {
    fn set_local_address(&self, allow_cycling: bool, _pinned: Option<&BdAddr>) {
        self.record(Call::SetLocalAddress(allow_cycling));
    }

    fn generate_private_resolvable_address(&self) -> BdAddr {
        BdAddr::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60])
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

    fn request_conn_params(&self, handle: ConnHandle, _params: &ConnParams) {
        self.record(Call::RequestConnParams(handle));
    }

    fn start(&self) -> bool {
        self.record(Call::Start);
        true
    }

    fn stop(&self) {
        self.record(Call::Stop);
    }

    fn power_down(&self) {
        self.record(Call::PowerDown);
    }
}

#[derive(Default)]
pub struct Events {
    pub events: RefCell<Vec<Event>>,
}

impl Events {
    pub fn take(&self) -> Vec<Event> {
        self.events.take()
    }
}

impl EventSink for Events {
    fn publish(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

#[derive(Default)]
pub struct Sampler {
    pub sampling: Cell<bool>,
}

impl HrmSampler for Sampler {
    fn start_sampling(&self) {
        self.sampling.set(true);
    }

    fn stop_sampling(&self) {
        self.sampling.set(false);
    }
}

pub fn pairing_info(seed: u8) -> PairingInfo {
    PairingInfo {
        local_encryption_info: EncryptionInfo {
            ltk: LongTermKey(u128::from(seed) << 8),
            rand: 7,
            ediv: 9,
        },
        remote_encryption_info: EncryptionInfo {
            ltk: LongTermKey(u128::from(seed) << 16),
            rand: 11,
            ediv: 13,
        },
        irk: IdentityResolvingKey(u128::from(seed) << 24),
        identity: Identity::public([seed, 0x11, 0x22, 0x33, 0x44, 0x55]),
        is_local_encryption_info_valid: true,
        is_remote_encryption_info_valid: true,
        is_remote_identity_info_valid: true,
        ..Default::default()
    }
}
