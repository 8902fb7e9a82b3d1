//! Heart rate sharing permissions.
//!
//! A remote subscribing to the heart rate service only receives data once the user has
//! granted it permission. The answer is remembered per device until the stack is torn
//! down, so a device that reconnects is not asked again.
//!
//! While at least one connection shares, the sampling service is kept subscribed and a
//! reminder is published every [`HRM_REMINDER_INTERVAL_SECS`].
use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::config::{HRM_MAX_DEVICES, HRM_REMINDER_INTERVAL_SECS, MAX_CONNECTIONS};
use crate::driver::{BtDriver, Event, EventSink, HrmSampler};

/// The user's answer for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Permission {
    Unknown,
    Granted,
    Declined,
}

const REMINDER_INTERVAL: Duration = Duration::from_secs(HRM_REMINDER_INTERVAL_SECS as u64);

struct DevicePermission {
    device: BdAddr,
    permission: Permission,
}

struct Subscriber {
    handle: ConnHandle,
    device: BdAddr,
    subscribed: bool,
}

#[derive(Default)]
struct State {
    permissions: Vec<DevicePermission, HRM_MAX_DEVICES>,
    connections: Vec<Subscriber, MAX_CONNECTIONS>,
    sharing_count: usize,
    reminder: Option<Instant>,
}

impl State {
    fn permission(&self, device: &BdAddr) -> Permission {
        self.permissions
            .iter()
            .find(|p| p.device == *device)
            .map(|p| p.permission)
            .unwrap_or(Permission::Unknown)
    }

    fn set_permission(&mut self, device: &BdAddr, permission: Permission) {
        if let Some(entry) = self.permissions.iter_mut().find(|p| p.device == *device) {
            entry.permission = permission;
            return;
        }
        if self.permissions.is_full() {
            // Forget the oldest device that is not connected
            let idle = self
                .permissions
                .iter()
                .position(|p| !self.connections.iter().any(|s| s.device == p.device));
            let Some(index) = idle else {
                warn!("[hrm] every remembered device is connected, not tracking {:?}", device);
                return;
            };
            self.permissions.remove(index);
        }
        let _ = self.permissions.push(DevicePermission {
            device: *device,
            permission,
        });
    }

    fn is_sharing(&self, subscriber: &Subscriber) -> bool {
        subscriber.subscribed && self.permission(&subscriber.device) == Permission::Granted
    }

    fn count_sharing(&self) -> usize {
        self.connections.iter().filter(|s| self.is_sharing(s)).count()
    }
}

/// What to tell the outside world after a state change, decided under the lock.
#[derive(Default)]
struct Actions {
    prompt: Option<BdAddr>,
    stop_hrm_advertising: bool,
    disconnect: Vec<ConnHandle, MAX_CONNECTIONS>,
    sharing: Option<(usize, usize)>,
}

pub struct HrmSharing<'d, M: RawMutex> {
    state: Mutex<M, RefCell<State>>,
    driver: &'d dyn BtDriver,
    sampler: &'d dyn HrmSampler,
    events: &'d dyn EventSink,
    wake: Signal<M, ()>,
}

impl<'d, M: RawMutex> HrmSharing<'d, M> {
    pub fn new(driver: &'d dyn BtDriver, sampler: &'d dyn HrmSampler, events: &'d dyn EventSink) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State::default())),
            driver,
            sampler,
            events,
            wake: Signal::new(),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut State, &mut Actions)) {
        let mut actions = Actions::default();
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let before = state.sharing_count;
            f(&mut state, &mut actions);
            let after = state.count_sharing();
            state.sharing_count = after;
            if before != after {
                actions.sharing = Some((before, after));
                match (before, after) {
                    (0, _) => state.reminder = Some(Instant::now() + REMINDER_INTERVAL),
                    (_, 0) => state.reminder = None,
                    _ => {}
                }
            }
        });
        self.run(actions);
    }

    fn run(&self, actions: Actions) {
        if let Some(device) = actions.prompt {
            self.events.publish(Event::HrmPermissionRequest { device });
        }
        if actions.stop_hrm_advertising {
            self.driver.set_hrm_advertising(false);
        }
        for handle in actions.disconnect {
            self.driver.disconnect(handle);
        }
        if let Some((before, after)) = actions.sharing {
            info!("[hrm] sharing with {} connections", after);
            if before == 0 {
                self.sampler.start_sampling();
                self.wake.signal(());
            } else if after == 0 {
                self.sampler.stop_sampling();
                self.wake.signal(());
            }
            self.events.publish(Event::HrmSharingChanged { sharing_count: after });
        }
    }

    /// The remote on `handle`, with identity `device`, subscribed to or unsubscribed
    /// from heart rate notifications.
    pub fn subscription_changed(&self, handle: ConnHandle, device: BdAddr, subscribed: bool) {
        self.modify(|state, actions| {
            match state.connections.iter_mut().find(|s| s.handle == handle) {
                Some(subscriber) => subscriber.subscribed = subscribed,
                None => {
                    if state
                        .connections
                        .push(Subscriber {
                            handle,
                            device,
                            subscribed,
                        })
                        .is_err()
                    {
                        warn!("[hrm] no room to track {:?}", handle);
                        return;
                    }
                }
            }
            if !subscribed {
                return;
            }
            match state.permission(&device) {
                Permission::Unknown => {
                    state.set_permission(&device, Permission::Unknown);
                    actions.prompt = Some(device);
                }
                Permission::Granted => actions.stop_hrm_advertising = true,
                Permission::Declined => {}
            }
        })
    }

    /// The user answered the permission prompt for `device`.
    pub fn permission_response(&self, device: BdAddr, granted: bool) {
        let permission = if granted {
            Permission::Granted
        } else {
            Permission::Declined
        };
        debug!("[hrm] {:?} for {:?}", permission, device);
        self.modify(|state, actions| {
            state.set_permission(&device, permission);
            if granted && state.connections.iter().any(|s| s.device == device && s.subscribed) {
                actions.stop_hrm_advertising = true;
            }
        })
    }

    /// The link went away. The permission of its device is kept.
    pub fn disconnected(&self, handle: ConnHandle) {
        self.modify(|state, _| state.connections.retain(|s| s.handle != handle))
    }

    /// Withdraw the permission of the device on `handle` and drop the link, the only way
    /// to end its subscription from our side.
    pub fn revoke(&self, handle: ConnHandle) {
        self.modify(|state, actions| {
            let Some(device) = state.connections.iter().find(|s| s.handle == handle).map(|s| s.device) else {
                return;
            };
            state.set_permission(&device, Permission::Declined);
            let _ = actions.disconnect.push(handle);
        })
    }

    /// Withdraw every permission and drop every subscribed link.
    pub fn revoke_all(&self) {
        self.modify(|state, actions| {
            for entry in state.permissions.iter_mut() {
                entry.permission = Permission::Declined;
            }
            // Connected devices that never answered are declined too
            let subscribers: Vec<(BdAddr, ConnHandle, bool), MAX_CONNECTIONS> = state
                .connections
                .iter()
                .map(|s| (s.device, s.handle, s.subscribed))
                .collect();
            for (device, handle, subscribed) in subscribers {
                if state.permission(&device) == Permission::Unknown {
                    state.set_permission(&device, Permission::Declined);
                }
                if subscribed {
                    let _ = actions.disconnect.push(handle);
                }
            }
        })
    }

    /// Forget all permissions and subscriptions, when the stack goes down.
    pub fn deinit(&self) {
        self.modify(|state, _| {
            state.permissions.clear();
            state.connections.clear();
        })
    }

    pub fn permission(&self, device: &BdAddr) -> Permission {
        self.state.lock(|state| state.borrow().permission(device))
    }

    pub fn is_sharing(&self, handle: ConnHandle) -> bool {
        self.state.lock(|state| {
            let state = state.borrow();
            state
                .connections
                .iter()
                .find(|s| s.handle == handle)
                .map(|s| state.is_sharing(s))
                .unwrap_or(false)
        })
    }

    pub fn sharing_count(&self) -> usize {
        self.state.lock(|state| state.borrow().sharing_count)
    }

    /// Publish the reminder if it is due, and re-arm it.
    pub fn poll(&self, now: Instant) {
        let reminder = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.reminder {
                Some(at) if at <= now && state.sharing_count > 0 => {
                    state.reminder = Some(now + REMINDER_INTERVAL);
                    Some(state.sharing_count)
                }
                _ => None,
            }
        });
        if let Some(sharing_count) = reminder {
            debug!("[hrm] reminding about {} sharing connections", sharing_count);
            self.events.publish(Event::HrmReminder { sharing_count });
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock(|state| state.borrow().reminder)
    }

    /// Wait until the reminder is armed or cancelled.
    pub async fn wait(&self) {
        self.wake.wait().await
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::testing::{Call, FakeDriver, FakeEvents, FakeSampler};

    struct Fixture {
        driver: FakeDriver,
        sampler: FakeSampler,
        events: FakeEvents,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                driver: FakeDriver::default(),
                sampler: FakeSampler::default(),
                events: FakeEvents::default(),
            }
        }

        fn hrm(&self) -> HrmSharing<'_, NoopRawMutex> {
            HrmSharing::new(&self.driver, &self.sampler, &self.events)
        }
    }

    const PHONE: [u8; 6] = [1, 2, 3, 4, 5, 6];

    fn phone() -> BdAddr {
        BdAddr::new(PHONE)
    }

    #[test]
    fn permission_survives_reconnection() {
        let f = Fixture::new();
        let hrm = f.hrm();
        let first = ConnHandle::new(1);

        hrm.subscription_changed(first, phone(), true);
        assert!(!hrm.is_sharing(first));
        assert_eq!(f.events.take(), [Event::HrmPermissionRequest { device: phone() }]);

        hrm.permission_response(phone(), true);
        assert!(hrm.is_sharing(first));
        assert!(f.sampler.sampling.get());
        assert!(hrm.next_deadline().is_some());

        hrm.disconnected(first);
        assert!(!hrm.is_sharing(first));
        assert!(!f.sampler.sampling.get());
        assert_eq!(hrm.next_deadline(), None);

        let second = ConnHandle::new(2);
        f.events.take();
        f.driver.take();
        hrm.subscription_changed(second, phone(), true);
        assert!(hrm.is_sharing(second));
        assert_eq!(f.sampler.starts.get(), 2);
        assert_eq!(f.events.take(), [Event::HrmSharingChanged { sharing_count: 1 }]);
        assert_eq!(f.driver.take(), [Call::HrmAdvertising(false)]);
    }

    #[test]
    fn sampling_follows_the_first_and_last_sharer() {
        let f = Fixture::new();
        let hrm = f.hrm();
        let other = BdAddr::new([9; 6]);
        hrm.permission_response(phone(), true);
        hrm.permission_response(other, true);

        hrm.subscription_changed(ConnHandle::new(1), phone(), true);
        hrm.subscription_changed(ConnHandle::new(2), other, true);
        assert_eq!(hrm.sharing_count(), 2);
        assert_eq!(f.sampler.starts.get(), 1);

        hrm.subscription_changed(ConnHandle::new(1), phone(), false);
        assert!(f.sampler.sampling.get());
        hrm.revoke(ConnHandle::new(2));
        assert!(!f.sampler.sampling.get());
        assert_eq!(hrm.permission(&other), Permission::Declined);
        assert!(f.driver.take().contains(&Call::Disconnect(ConnHandle::new(2))));
    }

    #[test]
    fn connected_devices_keep_their_permission() {
        let f = Fixture::new();
        let hrm = f.hrm();
        hrm.permission_response(phone(), true);
        hrm.subscription_changed(ConnHandle::new(1), phone(), true);
        assert!(hrm.is_sharing(ConnHandle::new(1)));

        // Fill the permission memory with devices that are not connected
        for i in 0..HRM_MAX_DEVICES - 1 {
            hrm.permission_response(BdAddr::new([0x20 + i as u8; 6]), true);
        }
        let newcomer = BdAddr::new([0x77; 6]);
        hrm.subscription_changed(ConnHandle::new(2), newcomer, true);

        assert_eq!(hrm.permission(&phone()), Permission::Granted);
        assert!(hrm.is_sharing(ConnHandle::new(1)));
        assert!(f.sampler.sampling.get());
        // The oldest idle device made room
        assert_eq!(hrm.permission(&BdAddr::new([0x20; 6])), Permission::Unknown);
        assert_eq!(hrm.permission(&BdAddr::new([0x21; 6])), Permission::Granted);

        hrm.revoke_all();
        assert_eq!(hrm.permission(&phone()), Permission::Declined);
        assert_eq!(hrm.permission(&newcomer), Permission::Declined);
        assert_eq!(hrm.sharing_count(), 0);
        let calls = f.driver.take();
        assert!(calls.contains(&Call::Disconnect(ConnHandle::new(1))));
        assert!(calls.contains(&Call::Disconnect(ConnHandle::new(2))));
    }

    #[test]
    fn declined_device_is_not_prompted_again() {
        let f = Fixture::new();
        let hrm = f.hrm();
        hrm.subscription_changed(ConnHandle::new(1), phone(), true);
        hrm.permission_response(phone(), false);
        f.events.take();

        hrm.subscription_changed(ConnHandle::new(1), phone(), false);
        hrm.subscription_changed(ConnHandle::new(1), phone(), true);
        assert!(f.events.take().is_empty());
        assert_eq!(hrm.sharing_count(), 0);

        hrm.deinit();
        assert_eq!(hrm.permission(&phone()), Permission::Unknown);
    }

    #[test]
    fn reminder_rearms_while_sharing() {
        let f = Fixture::new();
        let hrm = f.hrm();
        hrm.permission_response(phone(), true);
        hrm.subscription_changed(ConnHandle::new(1), phone(), true);
        f.events.take();

        let due = hrm.next_deadline().unwrap();
        hrm.poll(due - Duration::from_secs(1));
        assert!(f.events.take().is_empty());
        hrm.poll(due);
        assert_eq!(f.events.take(), [Event::HrmReminder { sharing_count: 1 }]);
        assert_eq!(hrm.next_deadline(), Some(due + REMINDER_INTERVAL));

        hrm.revoke_all();
        assert_eq!(hrm.next_deadline(), None);
        assert_eq!(hrm.permission(&phone()), Permission::Declined);
    }
}
