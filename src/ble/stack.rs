//! The radio / BLE stack as seen by the rest of the crate.
//!
//! Every call is synchronous and non-blocking so it can be made from the
//! stack's event context as well as from tasks. Completion of
//! asynchronous work (a central connecting, a link dropping) comes back
//! through [`crate::ble::events::EventDispatcher`].

use heapless::Vec;

use crate::ble::advertising::AdvertisingPayload;
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::peripheral::AdvertisingParams;
use crate::ble::{AttrHandle, ConnHandle};
use crate::config::MAX_CHARACTERISTICS;
use crate::error::StackError;

pub trait Radio {
    /// Enable the radio. Idempotent.
    fn activate(&self) -> Result<(), StackError>;

    /// Register the GATT table; one value handle per characteristic, in
    /// declaration order.
    fn register_services(
        &self,
        services: &[ServiceDescriptor],
    ) -> Result<Vec<AttrHandle, MAX_CHARACTERISTICS>, StackError>;

    /// Begin connectable undirected advertising.
    fn start_advertising(
        &self,
        params: &AdvertisingParams,
        payload: &AdvertisingPayload,
    ) -> Result<(), StackError>;

    /// Stop advertising. A no-op if not advertising.
    fn stop_advertising(&self) -> Result<(), StackError>;

    /// Copy the local value of `attr` into `buf`, returning its length.
    fn read_value(&self, attr: AttrHandle, buf: &mut [u8]) -> Result<usize, StackError>;

    /// Replace the local value of `attr`.
    fn write_value(&self, attr: AttrHandle, data: &[u8]) -> Result<(), StackError>;

    /// Push `data` on `attr` to the central on `conn`.
    fn notify(&self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), StackError>;

    /// Request link termination. The stack reports completion as a
    /// disconnect event.
    fn disconnect(&self, conn: ConnHandle) -> Result<(), StackError>;
}

impl<R: Radio + ?Sized> Radio for &R {
    fn activate(&self) -> Result<(), StackError> {
        (**self).activate()
    }

    fn register_services(
        &self,
        services: &[ServiceDescriptor],
    ) -> Result<Vec<AttrHandle, MAX_CHARACTERISTICS>, StackError> {
        (**self).register_services(services)
    }

    fn start_advertising(
        &self,
        params: &AdvertisingParams,
        payload: &AdvertisingPayload,
    ) -> Result<(), StackError> {
        (**self).start_advertising(params, payload)
    }

    fn stop_advertising(&self) -> Result<(), StackError> {
        (**self).stop_advertising()
    }

    fn read_value(&self, attr: AttrHandle, buf: &mut [u8]) -> Result<usize, StackError> {
        (**self).read_value(attr, buf)
    }

    fn write_value(&self, attr: AttrHandle, data: &[u8]) -> Result<(), StackError> {
        (**self).write_value(attr, data)
    }

    fn notify(&self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), StackError> {
        (**self).notify(conn, attr, data)
    }

    fn disconnect(&self, conn: ConnHandle) -> Result<(), StackError> {
        (**self).disconnect(conn)
    }
}
