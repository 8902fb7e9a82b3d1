use bondkeep::conn_params::ConnParamsManager;
use bondkeep::connection_manager::{ConnectionManager, ConnectionRegistry};
use bondkeep::driver::Event;
use bondkeep::hrm::HrmSharing;
use bondkeep::kv::RamSettingsFile;
use bondkeep::local_addr::{LocalAddress, LocalAddressConfig};
use bondkeep::notify::{ClassicConnectability, Notifier, Stage};
use bondkeep::pairability::Pairability;
use bondkeep::reconnect::Reconnect;
use bondkeep::runner::Runner;
use bondkeep::stack::StackLifecycle;
use bondkeep::store::{BondingStore, FullDb};
use bondkeep::{BdAddr, BondingChangeOp, BondingKind, ConnHandle, LinkKey};
use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::{Duration, Timer};

mod common;

use common::{pairing_info, Call, Driver, Events, Sampler};

#[tokio::test]
async fn pairing_a_gateway_ends_bootstrap_pairability() {
    let _ = env_logger::try_init();
    let driver = Driver::default();
    let events = Events::default();
    let sampler = Sampler::default();

    let local_addr: LocalAddress<NoopRawMutex> = LocalAddress::new(&driver, LocalAddressConfig::default());
    let connections: ConnectionManager<NoopRawMutex> = ConnectionManager::new();
    let pairability = Pairability::new(&driver, &local_addr);
    let reconnect: Reconnect<NoopRawMutex> = Reconnect::new(&driver, &connections);
    let classic = ClassicConnectability::new(&driver);
    let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
    notifier.subscribe(Stage::ClassicConnectability, &classic);
    notifier.subscribe(Stage::Reconnect, &reconnect);
    notifier.subscribe(Stage::Pairability, &pairability);
    notifier.subscribe(Stage::Connections, &connections);
    notifier.subscribe(Stage::LocalAddress, &local_addr);
    let db = FullDb::new(RamSettingsFile::<4096>::new(), &notifier);
    let hrm = HrmSharing::new(&driver, &sampler, &events);
    let conn_params = ConnParamsManager::new(&driver);
    let runner = Runner::new(&db, &pairability, &hrm, &conn_params);

    local_addr.init(&db);

    let scenario = async {
        Timer::after(Duration::from_millis(20)).await;
        // Nothing bonded yet
        assert!(pairability.is_ble_discoverable());
        assert!(pairability.is_classic_pairable());
        assert!(local_addr.is_cycling_paused());

        let info = pairing_info(1);
        let handle = ConnHandle::new(0x40);
        connections.connect(&db, handle, BondingKind::Ble, info.identity.addr).unwrap();
        let id = db.store_ble_pairing(&info, true, Some("Phone"), false, 0);
        assert_eq!(connections.get(handle).unwrap().bonding, Some(id));
        assert_eq!(
            events.take(),
            [Event::BondingChanged {
                id,
                kind: BondingKind::Ble,
                op: BondingChangeOp::DidAdd
            }]
        );

        Timer::after(Duration::from_millis(20)).await;
        assert!(!pairability.is_ble_discoverable());
        assert!(!pairability.is_classic_pairable());
        assert!(!local_addr.is_cycling_paused());
        assert_eq!(pairability.refcounts(), (0, 0));

        connections.disconnected(handle).unwrap();
        reconnect.update(&db);
        assert!(reconnect.is_advertising());

        pairability.use_ble_for_period(Duration::from_millis(100));
        Timer::after(Duration::from_millis(30)).await;
        assert!(pairability.is_ble_discoverable());
        Timer::after(Duration::from_millis(150)).await;
        assert!(!pairability.is_ble_discoverable());

        db.delete_all_pairings();
        assert!(!reconnect.is_advertising());
        Timer::after(Duration::from_millis(20)).await;
        assert!(pairability.is_ble_discoverable());
    };
    select(runner.run(), scenario).await;
}

#[tokio::test]
async fn classic_changes_recompute_connectability() {
    let _ = env_logger::try_init();
    let driver = Driver::default();
    let events = Events::default();
    let classic = ClassicConnectability::new(&driver);
    let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
    notifier.subscribe(Stage::ClassicConnectability, &classic);
    let db = FullDb::new(RamSettingsFile::<4096>::new(), &notifier);

    db.store_ble_pairing(&pairing_info(1), false, None, false, 0);
    assert!(driver.take().is_empty());
    let car = BdAddr::new([0xca; 6]);
    let id = db.store_bt_classic_pairing(&car, Some(&LinkKey(77)), Some("Car"), None);
    db.delete_bt_classic_pairing_by_id(id);
    assert_eq!(
        driver.take(),
        [Call::UpdateClassicConnectability, Call::UpdateClassicConnectability]
    );
}

#[tokio::test]
async fn heart_rate_sharing_across_reconnection() {
    let _ = env_logger::try_init();
    let driver = Driver::default();
    let events = Events::default();
    let sampler = Sampler::default();
    let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
    let db = FullDb::new(RamSettingsFile::<4096>::new(), &notifier);
    let hrm: HrmSharing<NoopRawMutex> = HrmSharing::new(&driver, &sampler, &events);
    let stack = StackLifecycle::new(&driver, &events, &db, &hrm);
    stack.init();
    stack.set_enabled(true);
    assert!(stack.is_running());
    events.take();

    let phone = pairing_info(3).identity.addr;
    let first = ConnHandle::new(1);
    hrm.subscription_changed(first, phone, true);
    assert!(!hrm.is_sharing(first));
    assert_eq!(events.take(), [Event::HrmPermissionRequest { device: phone }]);

    hrm.permission_response(phone, true);
    assert!(hrm.is_sharing(first));
    assert!(sampler.sampling.get());

    hrm.disconnected(first);
    assert!(!hrm.is_sharing(first));
    assert!(!sampler.sampling.get());

    let second = ConnHandle::new(2);
    events.take();
    hrm.subscription_changed(second, phone, true);
    assert!(hrm.is_sharing(second));
    assert!(sampler.sampling.get());
    assert!(!events
        .take()
        .iter()
        .any(|e| matches!(e, Event::HrmPermissionRequest { .. })));

    // Airplane mode tears the stack down and forgets the answer
    stack.set_airplane_mode(true);
    assert!(!sampler.sampling.get());
    hrm.subscription_changed(second, phone, true);
    assert_eq!(events.take().last(), Some(&Event::HrmPermissionRequest { device: phone }));
    assert!(driver.take().contains(&Call::Stop));
}
