//! Interfaces of the collaborators the bonding subsystem drives.
//!
//! The radio driver, the UI event bus and the heart rate sampling service live outside
//! of this crate. Every call made through these traits is a fire-and-forget request:
//! failures are handled (and logged) on the other side.

use bt_hci::param::{BdAddr, ConnHandle};

use crate::conn_params::ConnParams;
use crate::types::{BondingChangeOp, BondingId, BondingKind, SystemCapabilities};

/// Radio driver surface.
pub trait BtDriver {
    /// Enable or disable private address rotation. When rotation is disabled and
    /// `pinned` is given, that address must be used.
    fn set_local_address(&self, allow_cycling: bool, pinned: Option<&BdAddr>);

    /// Create a new private resolvable address from the local IRK.
    fn generate_private_resolvable_address(&self) -> BdAddr;

    /// Make the device LE discoverable and pairable, or stop being so.
    fn set_ble_discoverable(&self, discoverable: bool);

    /// Allow or refuse BR/EDR pairing.
    fn set_classic_pairable(&self, pairable: bool);

    /// Recompute BR/EDR page scan state after a pairability or bonding change.
    fn update_classic_connectability(&self);

    /// Advertise for reconnection by a bonded gateway, or stop.
    fn set_reconnect_advertising(&self, enabled: bool);

    /// Include the heart rate service in advertising, or stop.
    fn set_hrm_advertising(&self, enabled: bool);

    /// Terminate the link.
    fn disconnect(&self, handle: ConnHandle);

    /// Ask the remote for new connection parameters.
    fn request_conn_params(&self, handle: ConnHandle, params: &ConnParams);

    /// Bring up the stack. Returns false if the controller failed to start.
    fn start(&self) -> bool;

    /// Tear down the stack.
    fn stop(&self);

    /// Power down a controller that was never started.
    fn power_down(&self);
}

/// Notifications published towards the UI and other listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A bonding was added, changed or is about to be deleted.
    BondingChanged {
        id: BondingId,
        kind: BondingKind,
        op: BondingChangeOp,
    },
    /// The cached gateway capabilities changed.
    CapabilitiesChanged {
        capabilities: SystemCapabilities,
        /// Bits that flipped.
        changed: u64,
    },
    /// The stack started or stopped.
    StackStateChanged { running: bool },
    /// Ask the user whether `device` may receive heart rate data.
    HrmPermissionRequest { device: BdAddr },
    /// The number of connections sharing heart rate data changed.
    HrmSharingChanged { sharing_count: usize },
    /// Periodic reminder that heart rate data is being shared.
    HrmReminder { sharing_count: usize },
    /// A bonded remote asked to launch an app.
    AppLaunch { handle: ConnHandle, app: [u8; 16] },
}

/// Event bus.
pub trait EventSink {
    fn publish(&self, event: Event);
}

/// Heart rate sampling service.
pub trait HrmSampler {
    /// Subscribe to periodic heart rate samples for sharing.
    fn start_sampling(&self);
    /// Drop the sharing subscription.
    fn stop_sampling(&self);
}
