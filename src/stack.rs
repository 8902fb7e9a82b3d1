//! Bluetooth stack lifecycle.
//!
//! The stack runs when the system runlevel allows it and airplane mode is off. A manual
//! override can force it either way, regardless of airplane mode.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::driver::{BtDriver, Event, EventSink};
use crate::hrm::HrmSharing;
use crate::store::BondingStore;

/// Manual control of the stack, for tests and the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackOverride {
    #[default]
    None,
    Stop,
    Run,
}

struct State {
    enabled: bool,
    airplane_mode: bool,
    override_: StackOverride,
    /// `None` until the first evaluation.
    running: Option<bool>,
    /// A transition is being carried out. Changes made meanwhile are picked up by it.
    busy: bool,
    /// Starting failed. Retried on the next change.
    start_failed: bool,
}

impl State {
    fn is_active(&self) -> bool {
        self.enabled
            && match self.override_ {
                StackOverride::Run => true,
                StackOverride::Stop => false,
                StackOverride::None => !self.airplane_mode,
            }
    }

    fn next_transition(&self) -> Option<Transition> {
        let active = self.is_active();
        match self.running {
            None if !active => Some(Transition::PowerDown),
            None | Some(false) if active && !self.start_failed => Some(Transition::Start),
            Some(true) if !active => Some(Transition::Stop),
            _ => None,
        }
    }
}

enum Transition {
    PowerDown,
    Start,
    Stop,
}

pub struct StackLifecycle<'d, M: RawMutex> {
    state: Mutex<M, RefCell<State>>,
    driver: &'d dyn BtDriver,
    events: &'d dyn EventSink,
    store: &'d dyn BondingStore,
    hrm: &'d HrmSharing<'d, M>,
}

impl<'d, M: RawMutex> StackLifecycle<'d, M> {
    pub fn new(
        driver: &'d dyn BtDriver,
        events: &'d dyn EventSink,
        store: &'d dyn BondingStore,
        hrm: &'d HrmSharing<'d, M>,
    ) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                enabled: false,
                airplane_mode: false,
                override_: StackOverride::None,
                running: None,
                busy: false,
                start_failed: false,
            })),
            driver,
            events,
            store,
            hrm,
        }
    }

    /// Load the persisted airplane mode and bring the stack to its initial state.
    pub fn init(&self) {
        let airplane_mode = self.store.get_airplane_mode_enabled();
        self.modify(|state| state.airplane_mode = airplane_mode);
    }

    /// The runlevel allows (or no longer allows) the stack to run.
    pub fn set_enabled(&self, enabled: bool) {
        self.modify(|state| state.enabled = enabled);
    }

    /// Enter or leave airplane mode. The setting is persisted.
    pub fn set_airplane_mode(&self, enabled: bool) {
        if !self.store.set_airplane_mode_enabled(enabled) {
            warn!("[stack] failed to persist airplane mode");
        }
        self.modify(|state| state.airplane_mode = enabled);
    }

    pub fn set_override(&self, override_: StackOverride) {
        self.modify(|state| state.override_ = override_);
    }

    pub fn airplane_mode(&self) -> bool {
        self.state.lock(|state| state.borrow().airplane_mode)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock(|state| state.borrow().running.unwrap_or(false))
    }

    fn modify(&self, f: impl FnOnce(&mut State)) {
        let owner = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            f(&mut state);
            state.start_failed = false;
            !core::mem::replace(&mut state.busy, true)
        });
        if !owner {
            return;
        }
        // The driver may call back into us, so it runs outside the lock. Whatever changed
        // during a transition is settled by the next round.
        loop {
            let transition = self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let transition = state.next_transition();
                if transition.is_none() {
                    state.busy = false;
                }
                transition
            });
            let Some(transition) = transition else {
                return;
            };
            let (running, start_failed) = match transition {
                Transition::PowerDown => {
                    info!("[stack] not starting, powering down controller");
                    self.driver.power_down();
                    (false, false)
                }
                Transition::Start => {
                    info!("[stack] starting");
                    if self.driver.start() {
                        self.events.publish(Event::StackStateChanged { running: true });
                        (true, false)
                    } else {
                        error!("[stack] controller failed to start");
                        (false, true)
                    }
                }
                Transition::Stop => {
                    info!("[stack] stopping");
                    self.hrm.deinit();
                    self.driver.stop();
                    self.events.publish(Event::StackStateChanged { running: false });
                    (false, false)
                }
            };
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                state.running = Some(running);
                state.start_failed = start_failed;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use bt_hci::param::{BdAddr, ConnHandle};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::conn_params::ConnParams;
    use crate::hrm::Permission;
    use crate::kv::RamSettingsFile;
    use crate::notify::Notifier;
    use crate::store::FullDb;
    use crate::testing::{Call, FakeDriver, FakeEvents, FakeSampler};

    #[test]
    fn edges_drive_the_controller() {
        let driver = FakeDriver::default();
        let events = FakeEvents::default();
        let sampler = FakeSampler::default();
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::new(RamSettingsFile::<1024>::new(), &notifier);
        let hrm: HrmSharing<NoopRawMutex> = HrmSharing::new(&driver, &sampler, &events);
        let stack = StackLifecycle::new(&driver, &events, &db, &hrm);

        stack.init();
        assert_eq!(driver.take(), [Call::PowerDown]);
        assert!(events.take().is_empty());

        stack.set_enabled(true);
        stack.set_enabled(true);
        assert_eq!(driver.take(), [Call::Start]);
        assert_eq!(events.take(), [Event::StackStateChanged { running: true }]);

        let phone = BdAddr::new([3; 6]);
        hrm.permission_response(phone, true);
        hrm.subscription_changed(ConnHandle::new(1), phone, true);
        driver.take();

        stack.set_airplane_mode(true);
        assert!(db.get_airplane_mode_enabled());
        assert_eq!(driver.take(), [Call::Stop]);
        assert!(!stack.is_running());
        assert_eq!(hrm.permission(&phone), Permission::Unknown);
        assert!(!sampler.sampling.get());

        stack.set_override(StackOverride::Run);
        assert!(stack.is_running());
        stack.set_override(StackOverride::None);
        assert!(!stack.is_running());
        assert_eq!(driver.take(), [Call::Start, Call::Stop]);
    }

    /// Forwards to a [`FakeDriver`], and stops the stack from within `start`.
    struct StoppingDriver<'a> {
        inner: FakeDriver,
        stack: Cell<Option<&'a StackLifecycle<'a, NoopRawMutex>>>,
    }

    impl BtDriver for StoppingDriver<'_> {
        fn set_local_address(&self, allow_cycling: bool, pinned: Option<&BdAddr>) {
            self.inner.set_local_address(allow_cycling, pinned)
        }

        fn generate_private_resolvable_address(&self) -> BdAddr {
            self.inner.generate_private_resolvable_address()
        }

        fn set_ble_discoverable(&self, discoverable: bool) {
            self.inner.set_ble_discoverable(discoverable)
        }

        fn set_classic_pairable(&self, pairable: bool) {
            self.inner.set_classic_pairable(pairable)
        }

        fn update_classic_connectability(&self) {
            self.inner.update_classic_connectability()
        }

        fn set_reconnect_advertising(&self, enabled: bool) {
            self.inner.set_reconnect_advertising(enabled)
        }

        fn set_hrm_advertising(&self, enabled: bool) {
            self.inner.set_hrm_advertising(enabled)
        }

        fn disconnect(&self, handle: ConnHandle) {
            self.inner.disconnect(handle)
        }

        fn request_conn_params(&self, handle: ConnHandle, params: &ConnParams) {
            self.inner.request_conn_params(handle, params)
        }

        fn start(&self) -> bool {
            if let Some(stack) = self.stack.take() {
                stack.set_override(StackOverride::Stop);
            }
            self.inner.start()
        }

        fn stop(&self) {
            self.inner.stop()
        }

        fn power_down(&self) {
            self.inner.power_down()
        }
    }

    #[test]
    fn change_during_start_is_not_lost() {
        let events = FakeEvents::default();
        let sampler = FakeSampler::default();
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::new(RamSettingsFile::<1024>::new(), &notifier);
        let driver = StoppingDriver {
            inner: FakeDriver::default(),
            stack: Cell::new(None),
        };
        let hrm: HrmSharing<NoopRawMutex> = HrmSharing::new(&driver.inner, &sampler, &events);
        let stack = StackLifecycle::new(&driver, &events, &db, &hrm);

        stack.init();
        driver.stack.set(Some(&stack));
        stack.set_enabled(true);

        assert_eq!(driver.inner.take(), [Call::PowerDown, Call::Start, Call::Stop]);
        assert_eq!(
            events.take(),
            [
                Event::StackStateChanged { running: true },
                Event::StackStateChanged { running: false }
            ]
        );
        assert!(!stack.is_running());

        stack.set_override(StackOverride::None);
        assert!(stack.is_running());
        assert_eq!(driver.inner.take(), [Call::Start]);
    }

    #[test]
    fn persisted_airplane_mode_and_failed_start() {
        let driver = FakeDriver::default();
        let events = FakeEvents::default();
        let sampler = FakeSampler::default();
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::new(RamSettingsFile::<1024>::new(), &notifier);
        db.set_airplane_mode_enabled(true);
        let hrm: HrmSharing<NoopRawMutex> = HrmSharing::new(&driver, &sampler, &events);
        let stack = StackLifecycle::new(&driver, &events, &db, &hrm);

        stack.init();
        stack.set_enabled(true);
        assert!(stack.airplane_mode());
        assert!(!stack.is_running());

        driver.start_fails.set(true);
        stack.set_airplane_mode(false);
        assert!(!stack.is_running());
        driver.start_fails.set(false);
        stack.set_override(StackOverride::Run);
        assert!(stack.is_running());
        assert_eq!(events.take(), [Event::StackStateChanged { running: true }]);
    }
}
