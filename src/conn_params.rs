//! Connection parameter negotiation.
//!
//! Several consumers on the device care how quickly a remote reacts to traffic: a file
//! transfer wants the shortest connection interval, an idle link wants the longest one
//! to save power. Each consumer requests a [`ResponseTime`] for a while, per connection.
//! The connection runs at the fastest response time requested by any unexpired request.
//!
//! A request is sent to the remote only when that effective response time changes. If
//! the remote then settles on an interval outside of what was asked for, the request is
//! repeated once.
use core::cell::RefCell;

use bt_hci::param::ConnHandle;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::config::{CONN_PARAMS_MAX_CONSUMERS, MAX_CONNECTIONS};
use crate::driver::BtDriver;
use crate::Error;

/// Connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// Minimum connection interval.
    pub min_connection_interval: Duration,
    /// Maximum connection interval.
    pub max_connection_interval: Duration,
    /// Maximum slave latency.
    pub max_latency: u16,
    /// Supervision timeout.
    pub supervision_timeout: Duration,
}

impl ConnParams {
    /// Does the connection interval `interval` fall within the requested range?
    pub fn accepts(&self, interval: Duration) -> bool {
        self.min_connection_interval <= interval && interval <= self.max_connection_interval
    }
}

/// How fast the remote should react, from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseTime {
    /// Lowest power, used when nobody asks for anything.
    Max,
    Middle,
    /// Shortest interval, for bulk transfers.
    Min,
}

impl ResponseTime {
    pub fn params(self) -> ConnParams {
        match self {
            ResponseTime::Max => ConnParams {
                min_connection_interval: Duration::from_micros(435_000),
                max_connection_interval: Duration::from_micros(450_000),
                max_latency: 4,
                supervision_timeout: Duration::from_secs(10),
            },
            ResponseTime::Middle => ConnParams {
                min_connection_interval: Duration::from_micros(150_000),
                max_connection_interval: Duration::from_micros(172_500),
                max_latency: 0,
                supervision_timeout: Duration::from_secs(6),
            },
            ResponseTime::Min => ConnParams {
                min_connection_interval: Duration::from_micros(15_000),
                max_connection_interval: Duration::from_micros(30_000),
                max_latency: 0,
                supervision_timeout: Duration::from_secs(6),
            },
        }
    }
}

/// Index of a consumer, below [`CONN_PARAMS_MAX_CONSUMERS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Consumer(pub u8);

#[derive(Clone, Copy)]
struct Request {
    response_time: ResponseTime,
    expires: Instant,
}

struct ConnState {
    handle: ConnHandle,
    requests: [Option<Request>; CONN_PARAMS_MAX_CONSUMERS],
    effective: ResponseTime,
    rerequested: bool,
}

impl ConnState {
    fn new(handle: ConnHandle) -> Self {
        Self {
            handle,
            requests: [None; CONN_PARAMS_MAX_CONSUMERS],
            effective: ResponseTime::Max,
            rerequested: false,
        }
    }

    fn expire(&mut self, now: Instant) {
        for request in self.requests.iter_mut() {
            if matches!(request, Some(r) if r.expires <= now) {
                *request = None;
            }
        }
    }

    fn desired(&self) -> ResponseTime {
        self.requests
            .iter()
            .flatten()
            .map(|r| r.response_time)
            .max()
            .unwrap_or(ResponseTime::Max)
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.requests.iter().flatten().map(|r| r.expires).min()
    }

    /// Recompute the effective response time, returning it if it changed.
    fn update(&mut self, now: Instant) -> Option<ResponseTime> {
        self.expire(now);
        let desired = self.desired();
        if desired == self.effective {
            return None;
        }
        self.effective = desired;
        self.rerequested = false;
        Some(desired)
    }
}

/// Tracks response time requests of every live connection.
pub struct ConnParamsManager<'d, M: RawMutex> {
    state: Mutex<M, RefCell<Vec<ConnState, MAX_CONNECTIONS>>>,
    driver: &'d dyn BtDriver,
    wake: Signal<M, ()>,
}

impl<'d, M: RawMutex> ConnParamsManager<'d, M> {
    pub fn new(driver: &'d dyn BtDriver) -> Self {
        Self {
            state: Mutex::new(RefCell::new(Vec::new())),
            driver,
            wake: Signal::new(),
        }
    }

    /// Start tracking `handle`. The link starts out at [`ResponseTime::Max`].
    pub fn connected(&self, handle: ConnHandle) -> Result<(), Error> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.iter().any(|c| c.handle == handle) {
                return Ok(());
            }
            state.push(ConnState::new(handle)).map_err(|_| Error::StorageFull)
        })
    }

    /// Forget `handle` and every request made on it.
    pub fn disconnected(&self, handle: ConnHandle) {
        self.state.lock(|state| state.borrow_mut().retain(|c| c.handle != handle));
    }

    /// Ask for `response_time` on `handle` for `duration`, replacing any earlier request
    /// of `consumer`.
    pub fn request(
        &self,
        handle: ConnHandle,
        consumer: Consumer,
        response_time: ResponseTime,
        duration: Duration,
    ) -> Result<(), Error> {
        let index = usize::from(consumer.0);
        if index >= CONN_PARAMS_MAX_CONSUMERS {
            return Err(Error::InvalidArgument);
        }
        let now = Instant::now();
        self.modify(handle, now, |conn| {
            conn.requests[index] = Some(Request {
                response_time,
                expires: now + duration,
            });
        })
    }

    /// Withdraw the request of `consumer` on `handle`.
    pub fn cancel(&self, handle: ConnHandle, consumer: Consumer) -> Result<(), Error> {
        let index = usize::from(consumer.0);
        if index >= CONN_PARAMS_MAX_CONSUMERS {
            return Err(Error::InvalidArgument);
        }
        self.modify(handle, Instant::now(), |conn| conn.requests[index] = None)
    }

    fn modify(&self, handle: ConnHandle, now: Instant, f: impl FnOnce(&mut ConnState)) -> Result<(), Error> {
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let conn = state.iter_mut().find(|c| c.handle == handle).ok_or(Error::NotFound)?;
            f(conn);
            Ok::<_, Error>(conn.update(now))
        })?;
        if let Some(response_time) = changed {
            self.send(handle, response_time);
        }
        self.wake.signal(());
        Ok(())
    }

    fn send(&self, handle: ConnHandle, response_time: ResponseTime) {
        debug!("[conn params] requesting {:?} on {:?}", response_time, handle);
        self.driver.request_conn_params(handle, &response_time.params());
    }

    /// The effective response time of `handle`.
    pub fn response_time(&self, handle: ConnHandle) -> Option<ResponseTime> {
        self.state
            .lock(|state| state.borrow().iter().find(|c| c.handle == handle).map(|c| c.effective))
    }

    /// The remote applied new parameters. Repeat our request once if they are not what
    /// we asked for.
    pub fn remote_updated(&self, handle: ConnHandle, interval: Duration) {
        let retry = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let conn = state.iter_mut().find(|c| c.handle == handle)?;
            if conn.effective.params().accepts(interval) {
                conn.rerequested = false;
                return None;
            }
            if conn.rerequested {
                return None;
            }
            conn.rerequested = true;
            Some(conn.effective)
        });
        if let Some(response_time) = retry {
            warn!(
                "[conn params] remote picked {} us on {:?}, asking again",
                interval.as_micros(),
                handle
            );
            self.send(handle, response_time);
        }
    }

    /// Drop expired requests and renegotiate where the effective response time changed.
    pub fn poll(&self, now: Instant) {
        let mut changed: Vec<(ConnHandle, ResponseTime), MAX_CONNECTIONS> = Vec::new();
        self.state.lock(|state| {
            for conn in state.borrow_mut().iter_mut() {
                if let Some(response_time) = conn.update(now) {
                    let _ = changed.push((conn.handle, response_time));
                }
            }
        });
        for (handle, response_time) in changed {
            self.send(handle, response_time);
        }
    }

    /// When the earliest pending request expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock(|state| state.borrow().iter().filter_map(ConnState::next_expiry).min())
    }

    /// Wait until the set of pending requests changes.
    pub async fn wait(&self) {
        self.wake.wait().await
    }
}
