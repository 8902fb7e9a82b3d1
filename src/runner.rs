//! Background task of the bonding services.
use embassy_futures::select::{select3, select4};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Instant, Timer};

use crate::conn_params::ConnParamsManager;
use crate::hrm::HrmSharing;
use crate::pairability::Pairability;
use crate::store::BondingStore;

/// Runs deferred pairability evaluations and fires the timers of the services.
pub struct Runner<'d, M: RawMutex> {
    store: &'d dyn BondingStore,
    pairability: &'d Pairability<'d, M>,
    hrm: &'d HrmSharing<'d, M>,
    conn_params: &'d ConnParamsManager<'d, M>,
}

impl<'d, M: RawMutex> Runner<'d, M> {
    pub fn new(
        store: &'d dyn BondingStore,
        pairability: &'d Pairability<'d, M>,
        hrm: &'d HrmSharing<'d, M>,
        conn_params: &'d ConnParamsManager<'d, M>,
    ) -> Self {
        Self {
            store,
            pairability,
            hrm,
            conn_params,
        }
    }

    /// Do all work that is due at `now`.
    pub fn poll(&self, now: Instant) {
        self.pairability.poll(self.store, now);
        self.hrm.poll(now);
        self.conn_params.poll(now);
    }

    /// The earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pairability.next_deadline(),
            self.hrm.next_deadline(),
            self.conn_params.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub async fn run(&self) -> ! {
        loop {
            self.poll(Instant::now());
            let work = (self.pairability.wait(), self.hrm.wait(), self.conn_params.wait());
            match self.next_deadline() {
                Some(deadline) => {
                    trace!("[runner] sleeping until {}", deadline.as_millis());
                    select4(work.0, work.1, work.2, Timer::at(deadline)).await;
                }
                None => {
                    select3(work.0, work.1, work.2).await;
                }
            }
        }
    }
}
