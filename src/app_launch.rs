//! App launch requests from bonded remotes.
use bt_hci::param::ConnHandle;

use crate::connection_manager::ConnectionRegistry;
use crate::driver::{Event, EventSink};
use crate::Error;

/// Length of an app UUID.
pub const APP_UUID_LEN: usize = 16;

/// Turns app UUID writes from bonded remotes into [`Event::AppLaunch`].
pub struct AppLaunch<'d> {
    connections: &'d dyn ConnectionRegistry,
    events: &'d dyn EventSink,
}

impl<'d> AppLaunch<'d> {
    pub fn new(connections: &'d dyn ConnectionRegistry, events: &'d dyn EventSink) -> Self {
        Self { connections, events }
    }

    /// A remote wrote `value` to the app launch characteristic.
    ///
    /// Fails with [`Error::InvalidArgument`] unless `value` is exactly one UUID, and with
    /// [`Error::NotFound`] if the link is unknown or not bonded.
    pub fn handle_write(&self, handle: ConnHandle, value: &[u8]) -> Result<(), Error> {
        let app: [u8; APP_UUID_LEN] = value.try_into().map_err(|_| Error::InvalidArgument)?;
        let conn = self.connections.get(handle).ok_or(Error::NotFound)?;
        if conn.bonding.is_none() {
            warn!("[app launch] ignoring request from unbonded {:?}", handle);
            return Err(Error::NotFound);
        }
        debug!("[app launch] {:?} launches {:?}", handle, app);
        self.events.publish(Event::AppLaunch { handle, app });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bt_hci::param::BdAddr;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::connection_manager::ConnectionManager;
    use crate::kv::RamSettingsFile;
    use crate::notify::Notifier;
    use crate::store::{BondingStore, FullDb};
    use crate::testing::{pairing_info, FakeEvents};
    use crate::types::BondingKind;

    #[test]
    fn only_bonded_links_launch_apps() {
        let events = FakeEvents::default();
        let connections: ConnectionManager<NoopRawMutex> = ConnectionManager::new();
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::new(RamSettingsFile::<4096>::new(), &notifier);
        let launcher = AppLaunch::new(&connections, &events);

        let info = pairing_info(1);
        db.store_ble_pairing(&info, false, None, false, 0);
        events.take();
        let bonded = ConnHandle::new(1);
        let stranger = ConnHandle::new(2);
        connections.connect(&db, bonded, BondingKind::Ble, info.identity.addr).unwrap();
        connections
            .connect(&db, stranger, BondingKind::Ble, BdAddr::new([0x77; 6]))
            .unwrap();

        let app = [0xab; APP_UUID_LEN];
        assert_eq!(launcher.handle_write(bonded, &app[..15]), Err(Error::InvalidArgument));
        assert_eq!(launcher.handle_write(stranger, &app), Err(Error::NotFound));
        assert_eq!(launcher.handle_write(ConnHandle::new(3), &app), Err(Error::NotFound));
        assert!(events.take().is_empty());

        launcher.handle_write(bonded, &app).unwrap();
        assert_eq!(events.take(), [Event::AppLaunch { handle: bonded, app }]);
    }
}
