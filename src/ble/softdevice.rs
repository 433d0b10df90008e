//! [`Radio`] on top of the Nordic SoftDevice S140 (via `nrf-softdevice`).
//!
//! `nrf-softdevice` exposes advertising and GATT serving as futures rather
//! than raw event callbacks. [`SoftdeviceRadio::run_events`] bridges the
//! two: it performs the advertising the controller requests and turns the
//! resulting connection, its GATT writes and its termination into
//! [`StackEvent`]s for the dispatcher.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties};
use nrf_softdevice::ble::gatt_server::{
    self, GetValueError, NotifyValueError, SetValueError, WriteOp,
};
use nrf_softdevice::ble::{peripheral, Address, AddressType, Connection, Uuid};
use nrf_softdevice::{raw, Softdevice};

use crate::ble::advertising::{AdvBuffer, AdvertisingPayload};
use crate::ble::events::{EventDispatcher, StackEvent};
use crate::ble::gatt::{characteristic_count, BleUuid, CharacteristicDescriptor, ServiceDescriptor};
use crate::ble::peripheral::AdvertisingParams;
use crate::ble::stack::Radio;
use crate::ble::{AttrHandle, ConnHandle, ConnParams, PeerAddress};
use crate::config::{HCI_REMOTE_USER_TERMINATED, MAX_ATTR_VALUE_LEN, MAX_CHARACTERISTICS};
use crate::error::StackError;
use crate::sensor::SensorSource;

type CsMutex<T> = Mutex<CriticalSectionRawMutex, T>;

/// One advertising cycle as requested by the controller.
struct AdvRequest {
    /// 0.625 ms units.
    interval: u32,
    /// 10 ms units.
    timeout: Option<u16>,
    adv_data: AdvBuffer,
    scan_data: AdvBuffer,
}

pub struct SoftdeviceRadio {
    sd: &'static Softdevice,
    handles: Vec<AttrHandle, MAX_CHARACTERISTICS>,
    current: CsMutex<RefCell<Option<Connection>>>,
    adv_request: Signal<CriticalSectionRawMutex, AdvRequest>,
    adv_stop: Signal<CriticalSectionRawMutex, ()>,
}

impl SoftdeviceRadio {
    /// Register `services` with the SoftDevice. Registration needs
    /// exclusive access, so it happens here, before the SoftDevice task
    /// is spawned.
    pub fn new(
        sd: &'static mut Softdevice,
        services: &[ServiceDescriptor],
    ) -> Result<Self, StackError> {
        let mut handles = Vec::new();
        for service in services {
            let mut sb = ServiceBuilder::new(sd, to_sd_uuid(&service.uuid)?)
                .map_err(|_| StackError::RegisterFailed)?;
            for ch in service.characteristics {
                let value_handle = add_characteristic(&mut sb, ch)?;
                handles
                    .push(AttrHandle(value_handle))
                    .map_err(|_| StackError::RegisterFailed)?;
            }
            let _ = sb.build();
        }
        info!("softdevice: {} characteristics registered", handles.len());

        Ok(Self {
            sd,
            handles,
            current: Mutex::new(RefCell::new(None)),
            adv_request: Signal::new(),
            adv_stop: Signal::new(),
        })
    }

    pub fn softdevice(&self) -> &'static Softdevice {
        self.sd
    }

    fn with_connection<T>(
        &self,
        conn: ConnHandle,
        f: impl FnOnce(&Connection) -> Result<T, StackError>,
    ) -> Result<T, StackError> {
        self.current.lock(|current| match current.borrow().as_ref() {
            Some(c) if c.handle() == Some(conn) => f(c),
            _ => Err(StackError::NotConnected),
        })
    }

    /// Advertise on request and serve the resulting connection, feeding
    /// connect / write / disconnect events into `dispatcher`.
    pub async fn run_events<S: SensorSource, const N: usize>(
        &self,
        dispatcher: &EventDispatcher<'_, SoftdeviceRadio, S, CriticalSectionRawMutex, N>,
    ) -> ! {
        loop {
            let request = self.adv_request.wait().await;
            let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
                adv_data: &request.adv_data,
                scan_data: &request.scan_data,
            };
            let config = peripheral::Config {
                interval: request.interval,
                timeout: request.timeout,
                ..Default::default()
            };

            let conn = match select(
                peripheral::advertise_connectable(self.sd, adv, &config),
                self.adv_stop.wait(),
            )
            .await
            {
                Either::First(Ok(conn)) => conn,
                Either::First(Err(e)) => {
                    warn!("softdevice: advertising ended: {:?}", defmt::Debug2Format(&e));
                    continue;
                }
                Either::Second(()) => continue,
            };

            let Some(handle) = conn.handle() else {
                warn!("softdevice: connection without handle");
                continue;
            };
            let peer = peer_address(&conn.peer_address());
            request_conn_params(&conn, &ConnParams::preferred());

            self.current.lock(|c| *c.borrow_mut() = Some(conn.clone()));
            dispatcher.dispatch(StackEvent::CentralConnect { conn: handle, peer });

            let bridge = GattBridge { dispatcher };
            let reason = gatt_server::run(&conn, &bridge, |_| {}).await;
            debug!("softdevice: gatt server stopped: {:?}", defmt::Debug2Format(&reason));

            self.current.lock(|c| *c.borrow_mut() = None);
            dispatcher.dispatch(StackEvent::CentralDisconnect {
                conn: handle,
                peer,
                reason: HCI_REMOTE_USER_TERMINATED,
            });
        }
    }
}

impl Radio for SoftdeviceRadio {
    fn activate(&self) -> Result<(), StackError> {
        // Enabled in main before anything else runs.
        Ok(())
    }

    fn register_services(
        &self,
        services: &[ServiceDescriptor],
    ) -> Result<Vec<AttrHandle, MAX_CHARACTERISTICS>, StackError> {
        if characteristic_count(services) != self.handles.len() {
            return Err(StackError::RegisterFailed);
        }
        Ok(self.handles.clone())
    }

    fn start_advertising(
        &self,
        params: &AdvertisingParams,
        payload: &AdvertisingPayload,
    ) -> Result<(), StackError> {
        let adv_data = AdvBuffer::from_slice(payload.adv_data())
            .map_err(|_| StackError::AdvertiseFailed)?;
        let scan_data = AdvBuffer::from_slice(payload.scan_data())
            .map_err(|_| StackError::AdvertiseFailed)?;
        let timeout = params
            .timeout_ms
            .map(|ms| (ms / 10).min(u16::MAX as u32) as u16);

        self.adv_stop.reset();
        self.adv_request.signal(AdvRequest {
            interval: params.interval_units(),
            timeout,
            adv_data,
            scan_data,
        });
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), StackError> {
        self.adv_request.reset();
        self.adv_stop.signal(());
        Ok(())
    }

    fn read_value(&self, attr: AttrHandle, buf: &mut [u8]) -> Result<usize, StackError> {
        gatt_server::get_value(self.sd, attr.0, buf).map_err(|e| match e {
            GetValueError::Raw(raw) => StackError::Raw(raw as u32),
            GetValueError::Truncated => StackError::ValueAccess,
        })
    }

    fn write_value(&self, attr: AttrHandle, data: &[u8]) -> Result<(), StackError> {
        gatt_server::set_value(self.sd, attr.0, data).map_err(|e| match e {
            SetValueError::Raw(raw) => StackError::Raw(raw as u32),
            SetValueError::Truncated => StackError::ValueAccess,
        })
    }

    fn notify(&self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), StackError> {
        self.with_connection(conn, |c| {
            gatt_server::notify_value(c, attr.0, data).map_err(|e| match e {
                NotifyValueError::Raw(raw) => StackError::Raw(raw as u32),
                NotifyValueError::Disconnected => StackError::NotifyFailed,
            })
        })
    }

    fn disconnect(&self, conn: ConnHandle) -> Result<(), StackError> {
        self.with_connection(conn, |c| c.disconnect().map_err(|_| StackError::NotConnected))
    }
}

/// Forwards GATT writes from `gatt_server::run` to the dispatcher.
struct GattBridge<'d, 'a, S: SensorSource, const N: usize> {
    dispatcher: &'d EventDispatcher<'a, SoftdeviceRadio, S, CriticalSectionRawMutex, N>,
}

impl<S: SensorSource, const N: usize> gatt_server::Server for GattBridge<'_, '_, S, N> {
    type Event = ();

    fn on_write(
        &self,
        conn: &Connection,
        handle: u16,
        _op: WriteOp,
        _offset: usize,
        _data: &[u8],
    ) -> Option<Self::Event> {
        if let Some(conn) = conn.handle() {
            self.dispatcher.dispatch(StackEvent::GattWrite {
                conn,
                attr: AttrHandle(handle),
            });
        }
        None
    }
}

fn add_characteristic(
    sb: &mut ServiceBuilder<'_>,
    ch: &CharacteristicDescriptor,
) -> Result<u16, StackError> {
    let mut props = Properties::new();
    if ch.can_read() {
        props = props.read();
    }
    if ch.can_write() {
        props = props.write();
    }
    if ch.can_notify() {
        props = props.notify();
    }

    let attr = Attribute::new([0u8; 2]).variable_len(MAX_ATTR_VALUE_LEN as u16);
    let handles = sb
        .add_characteristic(to_sd_uuid(&ch.uuid)?, attr, Metadata::new(props))
        .map_err(|_| StackError::RegisterFailed)?
        .build();
    Ok(handles.value_handle)
}

fn request_conn_params(conn: &Connection, params: &ConnParams) {
    if !params.is_valid() {
        warn!("softdevice: conn params out of range, keeping central's: {:?}", params);
        return;
    }
    let result = conn.set_conn_params(raw::ble_gap_conn_params_t {
        min_conn_interval: params.min_interval,
        max_conn_interval: params.max_interval,
        slave_latency: params.latency,
        conn_sup_timeout: params.supervision_timeout,
    });
    match result {
        Ok(()) => debug!("softdevice: requested conn params {:?}", params),
        Err(e) => warn!("softdevice: conn param request failed: {:?}", e),
    }
}

fn to_sd_uuid(uuid: &BleUuid) -> Result<Uuid, StackError> {
    match uuid {
        BleUuid::Uuid16(v) => Ok(Uuid::new_16(*v)),
        BleUuid::Uuid128(bytes) => Ok(Uuid::new_128(bytes)),
        // The SoftDevice only knows 16-bit and vendor 128-bit UUIDs.
        BleUuid::Uuid32(_) => Err(StackError::RegisterFailed),
    }
}

fn peer_address(address: &Address) -> PeerAddress {
    let kind = match address.address_type() {
        AddressType::Public => 0u8,
        AddressType::RandomStatic => 1u8,
        AddressType::RandomPrivateResolvable => 2u8,
        AddressType::RandomPrivateNonResolvable => 3u8,
        AddressType::Anonymous => 4u8,
    };
    PeerAddress::new(kind, address.bytes())
}
