//! Peripheral controller: advertise, adopt one central, serve it until it
//! disconnects, advertise again.
//!
//! ```text
//! Idle --start--> Advertising --payload up--> AwaitingAdoption --claim--> Connected
//!                     ^                                                      |
//!                     +---------------------- Disconnecting <--disconnect----+
//! ```
//!
//! Advertising is stopped before a connection is served and only
//! restarted once that connection's `disconnected()` has resolved, so at
//! most one central is ever connected.

use core::cell::Cell;
use core::convert::Infallible;

use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;

use crate::ble::advertising::{AdvertisingConfig, AdvertisingPayload};
use crate::ble::connection::{ConnectionGuard, ConnectionId, PeripheralState};
use crate::ble::gatt::{EnvAttributes, SERVICES};
use crate::ble::stack::Radio;
use crate::config::{ADV_INTERVAL_US, ADV_RETRY_DELAY_MS, ADV_TIMEOUT_MS};
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    Advertising,
    AwaitingAdoption,
    Connected,
    Disconnecting,
}

/// Per-cycle advertising parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertisingParams {
    pub interval_us: u32,
    /// Stop advertising after this long; `None` advertises indefinitely.
    pub timeout_ms: Option<u32>,
}

impl AdvertisingParams {
    pub const fn new(interval_us: u32) -> Self {
        Self {
            interval_us,
            timeout_ms: None,
        }
    }

    pub const fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Interval in the 0.625 ms units the controller expects.
    pub const fn interval_units(&self) -> u32 {
        self.interval_us / 625
    }
}

impl Default for AdvertisingParams {
    fn default() -> Self {
        Self {
            interval_us: ADV_INTERVAL_US,
            timeout_ms: ADV_TIMEOUT_MS,
        }
    }
}

pub struct PeripheralController<'a, R: Radio, M: RawMutex, const N: usize> {
    radio: &'a R,
    state: &'a PeripheralState<M, N>,
    payload: AdvertisingPayload,
    params: AdvertisingParams,
    phase: Cell<Phase>,
}

impl<'a, R: Radio, M: RawMutex, const N: usize> PeripheralController<'a, R, M, N> {
    /// Encodes the advertising payload up front; an oversized
    /// configuration is rejected here rather than on every cycle.
    pub fn new(
        radio: &'a R,
        state: &'a PeripheralState<M, N>,
        config: &AdvertisingConfig<'_>,
        params: AdvertisingParams,
    ) -> Result<Self, Error> {
        let payload = config.build()?;
        debug!(
            "adv payload: {} bytes, scan response: {} bytes",
            payload.adv_data().len(),
            payload.scan_data().len()
        );
        Ok(Self {
            radio,
            state,
            payload,
            params,
            phase: Cell::new(Phase::Idle),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    fn set_phase(&self, phase: Phase) {
        trace!("peripheral: {:?} -> {:?}", self.phase.get(), phase);
        self.phase.set(phase);
    }

    /// Activate the radio and register the GATT table. Only the first call
    /// does anything.
    pub fn start(&self) -> Result<(), Error> {
        if self.phase() != Phase::Idle {
            return Ok(());
        }

        self.radio.activate()?;
        let handles = self.radio.register_services(SERVICES)?;
        let attrs = EnvAttributes::from_handles(&handles)?;
        self.state.set_attributes(attrs);
        info!(
            "peripheral: services registered (temp {}, hum {}, in {}, out {})",
            attrs.temperature.0,
            attrs.humidity.0,
            attrs.input.0,
            attrs.output.0
        );

        self.set_phase(Phase::Advertising);
        Ok(())
    }

    /// Advertise until a central connects (or the configured window ends)
    /// and claim it.
    ///
    /// Advertising is stopped on every exit, including cancellation. A
    /// connection that was published but not claimed when the wait is
    /// dropped is disconnected and rolled back.
    pub async fn advertise<D: DelayNs>(&self, delay: &mut D) -> Result<ConnectionId, Error> {
        if self.phase() == Phase::Idle {
            return Err(Error::NotRegistered);
        }

        self.set_phase(Phase::Advertising);
        self.radio
            .start_advertising(&self.params, &self.payload)?;
        let _guard = AdvertisingGuard {
            radio: self.radio,
            state: self.state,
        };
        debug!("peripheral: advertising every {} us", self.params.interval_us);

        self.set_phase(Phase::AwaitingAdoption);
        let pending = self.state.pending();
        let id = match self.params.timeout_ms {
            None => pending.claim().await,
            Some(ms) => match select(pending.claim(), delay.delay_ms(ms)).await {
                Either::First(id) => id,
                // A central that connected as the window closed still counts.
                Either::Second(()) => pending.try_claim().ok_or(Error::AdvertisingTimeout)?,
            },
        };

        info!("conn {}: adopted", id.handle);
        Ok(id)
    }

    /// Serve an adopted connection until it is fully closed.
    pub async fn serve(&self, id: ConnectionId) {
        let registry = self.state.registry();
        let conn = registry.connection(id);
        let guard = ConnectionGuard::new(self.radio, registry, id);

        self.set_phase(Phase::Connected);
        join(conn.run(), conn.disconnected()).await;
        guard.complete();

        self.set_phase(Phase::Disconnecting);
        info!("conn {}: disconnected", id.handle);
        self.set_phase(Phase::Advertising);
    }

    /// Start, then advertise and serve forever. Only start-up errors are
    /// returned; advertising failures are retried.
    pub async fn run<D: DelayNs>(&self, delay: &mut D) -> Result<Infallible, Error> {
        self.start()?;

        loop {
            match self.advertise(delay).await {
                Ok(id) => self.serve(id).await,
                Err(Error::AdvertisingTimeout) => debug!("peripheral: advertising window elapsed"),
                Err(e) => {
                    warn!("peripheral: advertising failed: {:?}", e);
                    delay.delay_ms(ADV_RETRY_DELAY_MS).await;
                }
            }
        }
    }
}

struct AdvertisingGuard<'a, R: Radio, M: RawMutex, const N: usize> {
    radio: &'a R,
    state: &'a PeripheralState<M, N>,
}

impl<R: Radio, M: RawMutex, const N: usize> Drop for AdvertisingGuard<'_, R, M, N> {
    fn drop(&mut self) {
        if let Err(e) = self.radio.stop_advertising() {
            warn!("peripheral: stop advertising failed: {:?}", e);
        }
        if let Some(id) = self.state.pending().try_claim() {
            warn!("conn {}: never adopted, dropping", id.handle);
            if let Err(e) = self.radio.disconnect(id.handle) {
                warn!("conn {}: disconnect failed: {:?}", id.handle, e);
            }
            self.state.registry().rollback(id);
        }
    }
}
