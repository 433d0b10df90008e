//! Stack event decoding and dispatch.
//!
//! [`EventDispatcher::dispatch`] runs in the stack's event context: it
//! must not block, must not fail, and does only the synchronous work each
//! event needs. Anything that waits happens in the controller task.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::ble::connection::PeripheralState;
use crate::ble::gatt::BleUuid;
use crate::ble::stack::Radio;
use crate::ble::{AttrHandle, ConnHandle, PeerAddress};
use crate::command::Command;
use crate::config::MAX_ATTR_VALUE_LEN;
use crate::sensor::{format_record, SensorSource};

/// Every event the stack can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent<'a> {
    /// A central connected to us.
    CentralConnect { conn: ConnHandle, peer: PeerAddress },
    /// A central disconnected from us.
    CentralDisconnect {
        conn: ConnHandle,
        peer: PeerAddress,
        reason: u8,
    },
    /// A central wrote a local characteristic value.
    GattWrite { conn: ConnHandle, attr: AttrHandle },
    /// A central is reading a local characteristic value.
    GattReadRequest { conn: ConnHandle, attr: AttrHandle },
    ScanResult {
        peer: PeerAddress,
        rssi: i8,
        data: &'a [u8],
    },
    ScanDone,
    /// We (as central) connected to a peripheral.
    PeripheralConnect { conn: ConnHandle, peer: PeerAddress },
    PeripheralDisconnect {
        conn: ConnHandle,
        peer: PeerAddress,
        reason: u8,
    },
    Gattc(GattcEvent<'a>),
    IndicateDone {
        conn: ConnHandle,
        attr: AttrHandle,
        status: u8,
    },
    MtuExchanged { conn: ConnHandle, mtu: u16 },
    L2cap(L2capEvent),
    ConnectionUpdate {
        conn: ConnHandle,
        /// 1.25 ms units.
        interval: u16,
        latency: u16,
        /// 10 ms units.
        supervision_timeout: u16,
    },
    EncryptionUpdate {
        conn: ConnHandle,
        encrypted: bool,
        authenticated: bool,
        bonded: bool,
        key_size: u8,
    },
    /// Bond store lookup.
    GetSecret {
        sec_type: u8,
        index: u8,
        key: &'a [u8],
    },
    /// Bond store update.
    SetSecret {
        sec_type: u8,
        key: &'a [u8],
        value: &'a [u8],
    },
    PasskeyAction {
        conn: ConnHandle,
        action: u8,
        passkey: u32,
    },
    /// Anything newer than this decoder.
    Unknown { code: u16 },
}

/// GATT client role events. Never acted on; decoded for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattcEvent<'a> {
    ServiceResult {
        conn: ConnHandle,
        start: u16,
        end: u16,
        uuid: BleUuid,
    },
    CharacteristicResult {
        conn: ConnHandle,
        value_handle: u16,
        props: u8,
        uuid: BleUuid,
    },
    DescriptorResult {
        conn: ConnHandle,
        handle: u16,
        uuid: BleUuid,
    },
    ReadResult {
        conn: ConnHandle,
        value_handle: u16,
        data: &'a [u8],
    },
    WriteDone {
        conn: ConnHandle,
        value_handle: u16,
        status: u16,
    },
    Notify {
        conn: ConnHandle,
        value_handle: u16,
        data: &'a [u8],
    },
    Indicate {
        conn: ConnHandle,
        value_handle: u16,
        data: &'a [u8],
    },
    /// End of a discovery or read procedure.
    Done { conn: ConnHandle, status: u16 },
}

/// L2CAP channel events. Never acted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum L2capEvent {
    Accept { conn: ConnHandle, cid: u16, psm: u16 },
    Connect { conn: ConnHandle, cid: u16, status: u16 },
    Disconnect { conn: ConnHandle, cid: u16, status: u16 },
    Recv { conn: ConnHandle, cid: u16 },
    SendReady { conn: ConnHandle, cid: u16 },
}

/// What the dispatcher hands back to the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventResponse {
    /// Handled (or ignored); nothing to report.
    Ack,
    /// Read request accepted (GATT status 0).
    ReadAccepted,
    /// No bond store: secret lookup finds nothing.
    NoSecret,
    /// No bond store: secret not persisted.
    SecretNotStored,
}

/// The stack callback.
pub struct EventDispatcher<'a, R, S, M, const N: usize>
where
    R: Radio,
    S: SensorSource,
    M: RawMutex,
{
    radio: &'a R,
    sensor: &'a S,
    state: &'a PeripheralState<M, N>,
}

impl<'a, R, S, M, const N: usize> EventDispatcher<'a, R, S, M, N>
where
    R: Radio,
    S: SensorSource,
    M: RawMutex,
{
    pub fn new(radio: &'a R, sensor: &'a S, state: &'a PeripheralState<M, N>) -> Self {
        Self {
            radio,
            sensor,
            state,
        }
    }

    pub fn dispatch(&self, event: StackEvent<'_>) -> EventResponse {
        match event {
            StackEvent::CentralConnect { conn, peer } => self.on_central_connect(conn, &peer),
            StackEvent::CentralDisconnect { conn, peer, reason } => {
                self.on_central_disconnect(conn, &peer, reason)
            }
            StackEvent::GattWrite { conn, attr } => self.on_gatt_write(conn, attr),
            StackEvent::GattReadRequest { conn, attr } => {
                trace!("conn {}: read attr {}", conn, attr.0);
                return EventResponse::ReadAccepted;
            }
            StackEvent::ScanResult { peer, rssi, data } => {
                trace!("scan: {:?} rssi {} ({} bytes)", peer, rssi, data.len());
            }
            StackEvent::ScanDone => debug!("scan done"),
            StackEvent::PeripheralConnect { conn, .. } => {
                debug!("conn {}: peripheral connect (central role unused)", conn)
            }
            StackEvent::PeripheralDisconnect { conn, reason, .. } => {
                debug!("conn {}: peripheral disconnect {=u8:#x}", conn, reason)
            }
            StackEvent::Gattc(ev) => debug!("gattc: {:?}", ev),
            StackEvent::IndicateDone { conn, attr, status } => {
                debug!("conn {}: indicate on {} done ({})", conn, attr.0, status)
            }
            StackEvent::MtuExchanged { conn, mtu } => info!("conn {}: mtu {}", conn, mtu),
            StackEvent::L2cap(ev) => debug!("l2cap: {:?}", ev),
            StackEvent::ConnectionUpdate {
                conn,
                interval,
                latency,
                supervision_timeout,
            } => info!(
                "conn {}: params interval={} latency={} timeout={}",
                conn,
                interval,
                latency,
                supervision_timeout
            ),
            StackEvent::EncryptionUpdate {
                conn,
                encrypted,
                key_size,
                ..
            } => debug!("conn {}: encrypted={} key_size={}", conn, encrypted, key_size),
            StackEvent::GetSecret { sec_type, .. } => {
                debug!("get secret type {}: no bond store", sec_type);
                return EventResponse::NoSecret;
            }
            StackEvent::SetSecret { sec_type, .. } => {
                debug!("set secret type {}: no bond store", sec_type);
                return EventResponse::SecretNotStored;
            }
            StackEvent::PasskeyAction { conn, action, .. } => {
                debug!("conn {}: passkey action {} ignored", conn, action)
            }
            StackEvent::Unknown { code } => warn!("unhandled stack event {}", code),
        }
        EventResponse::Ack
    }

    fn on_central_connect(&self, conn: ConnHandle, peer: &PeerAddress) {
        info!("conn {}: central connected {:?}", conn, peer);

        if conn as usize >= N {
            error!("conn {}: handle outside registry, left unregistered", conn);
            return;
        }

        let pending = self.state.pending();
        if pending.is_occupied() {
            warn!("conn {}: previous connection not adopted yet, overload", conn);
            return;
        }

        let registry = self.state.registry();
        let id = match registry.insert(conn) {
            Ok(id) => id,
            Err(e) => {
                warn!("conn {}: not registered: {:?}", conn, e);
                return;
            }
        };

        if let Err(e) = pending.publish(id) {
            warn!("conn {}: publish failed: {:?}", conn, e);
            registry.rollback(id);
        }
    }

    fn on_central_disconnect(&self, conn: ConnHandle, peer: &PeerAddress, reason: u8) {
        info!("conn {}: central disconnected {:?} reason {=u8:#x}", conn, peer, reason);
        if self
            .state
            .registry()
            .signal_disconnect(conn, reason)
            .is_err()
        {
            warn!("conn {}: disconnect for unknown handle ignored", conn);
        }
    }

    fn on_gatt_write(&self, conn: ConnHandle, attr: AttrHandle) {
        let Some(attrs) = self.state.attributes() else {
            warn!("conn {}: write before registration ignored", conn);
            return;
        };
        if attr != attrs.input {
            debug!("conn {}: write to attr {} ignored", conn, attr.0);
            return;
        }

        let mut buf = [0u8; MAX_ATTR_VALUE_LEN];
        let len = match self.radio.read_value(attr, &mut buf) {
            Ok(len) => len.min(buf.len()),
            Err(e) => {
                warn!("conn {}: reading command failed: {:?}", conn, e);
                return;
            }
        };

        match Command::parse(&buf[..len]) {
            Some(Command::ReadNow) => match self.sensor.read_sample() {
                Ok(sample) => {
                    let record = format_record(&sample);
                    self.respond(conn, attrs.output, record.as_bytes());
                }
                Err(e) => warn!("conn {}: sensor fault, no response: {:?}", conn, e),
            },
            Some(Command::ReadHistory) => self.respond(conn, attrs.output, &[]),
            None => debug!("conn {}: unknown command {=[u8]:x}", conn, &buf[..len]),
        }
    }

    fn respond(&self, conn: ConnHandle, output: AttrHandle, data: &[u8]) {
        match self.radio.notify(conn, output, data) {
            Ok(()) => debug!("conn {}: notified {} bytes", conn, data.len()),
            Err(e) => warn!("conn {}: notify failed: {:?}", conn, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::AdvertisingPayload;
    use crate::ble::gatt::{EnvAttributes, ServiceDescriptor};
    use crate::ble::peripheral::AdvertisingParams;
    use crate::config::MAX_CHARACTERISTICS;
    use crate::error::{SensorError, StackError};
    use crate::sensor::{parse_record, Sample};
    use core::cell::{Cell, RefCell};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use heapless::Vec;

    const ATTRS: EnvAttributes = EnvAttributes {
        temperature: AttrHandle(10),
        humidity: AttrHandle(12),
        input: AttrHandle(14),
        output: AttrHandle(16),
    };

    #[derive(Default)]
    struct Recorder {
        input: RefCell<Vec<u8, 32>>,
        notifies: RefCell<Vec<(ConnHandle, AttrHandle, Vec<u8, 32>), 8>>,
        disconnects: RefCell<Vec<ConnHandle, 8>>,
    }

    impl Radio for Recorder {
        fn activate(&self) -> Result<(), StackError> {
            Ok(())
        }
        fn register_services(
            &self,
            _: &[ServiceDescriptor],
        ) -> Result<Vec<AttrHandle, MAX_CHARACTERISTICS>, StackError> {
            Ok(Vec::new())
        }
        fn start_advertising(
            &self,
            _: &AdvertisingParams,
            _: &AdvertisingPayload,
        ) -> Result<(), StackError> {
            Ok(())
        }
        fn stop_advertising(&self) -> Result<(), StackError> {
            Ok(())
        }
        fn read_value(&self, _: AttrHandle, buf: &mut [u8]) -> Result<usize, StackError> {
            let input = self.input.borrow();
            buf[..input.len()].copy_from_slice(&input);
            Ok(input.len())
        }
        fn write_value(&self, _: AttrHandle, _: &[u8]) -> Result<(), StackError> {
            Ok(())
        }
        fn notify(&self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), StackError> {
            let _ = self
                .notifies
                .borrow_mut()
                .push((conn, attr, Vec::from_slice(data).unwrap()));
            Ok(())
        }
        fn disconnect(&self, conn: ConnHandle) -> Result<(), StackError> {
            let _ = self.disconnects.borrow_mut().push(conn);
            Ok(())
        }
    }

    /// Every stack call fails; `read_value` reports `reported_len` after
    /// copying what fits of `input`.
    struct Failing {
        input: &'static [u8],
        reported_len: Result<usize, StackError>,
        notify_attempts: Cell<usize>,
    }

    impl Failing {
        fn new(input: &'static [u8], reported_len: Result<usize, StackError>) -> Self {
            Self {
                input,
                reported_len,
                notify_attempts: Cell::new(0),
            }
        }
    }

    impl Radio for Failing {
        fn activate(&self) -> Result<(), StackError> {
            Err(StackError::ActivateFailed)
        }
        fn register_services(
            &self,
            _: &[ServiceDescriptor],
        ) -> Result<Vec<AttrHandle, MAX_CHARACTERISTICS>, StackError> {
            Err(StackError::RegisterFailed)
        }
        fn start_advertising(
            &self,
            _: &AdvertisingParams,
            _: &AdvertisingPayload,
        ) -> Result<(), StackError> {
            Err(StackError::AdvertiseFailed)
        }
        fn stop_advertising(&self) -> Result<(), StackError> {
            Err(StackError::AdvertiseFailed)
        }
        fn read_value(&self, _: AttrHandle, buf: &mut [u8]) -> Result<usize, StackError> {
            let n = self.input.len().min(buf.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.reported_len
        }
        fn write_value(&self, _: AttrHandle, _: &[u8]) -> Result<(), StackError> {
            Err(StackError::ValueAccess)
        }
        fn notify(&self, _: ConnHandle, _: AttrHandle, _: &[u8]) -> Result<(), StackError> {
            self.notify_attempts.set(self.notify_attempts.get() + 1);
            Err(StackError::Raw(0x3401))
        }
        fn disconnect(&self, _: ConnHandle) -> Result<(), StackError> {
            Err(StackError::NotConnected)
        }
    }

    struct Fixed(Result<Sample, SensorError>);

    impl SensorSource for Fixed {
        fn read_sample(&self) -> Result<Sample, SensorError> {
            self.0
        }
    }

    type State = PeripheralState<NoopRawMutex, 4>;

    fn registered_state() -> State {
        let state = State::new();
        state.set_attributes(ATTRS);
        state
    }

    fn write(
        radio: &Recorder,
        dispatcher: &EventDispatcher<'_, Recorder, Fixed, NoopRawMutex, 4>,
        data: &[u8],
    ) {
        *radio.input.borrow_mut() = Vec::from_slice(data).unwrap();
        dispatcher.dispatch(StackEvent::GattWrite {
            conn: 3,
            attr: ATTRS.input,
        });
    }

    #[test]
    fn read_now_notifies_record() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(21.3, 55.2)));
        let state = registered_state();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        write(&radio, &dispatcher, b"RN");

        let notifies = radio.notifies.borrow();
        assert_eq!(notifies.len(), 1);
        let (conn, attr, data) = &notifies[0];
        assert_eq!((*conn, *attr), (3, ATTRS.output));
        assert_eq!(data.as_slice(), b"21.30_55.20");
        let sample = parse_record(data).unwrap();
        assert!((sample.temperature - 21.3).abs() < 0.01);
    }

    #[test]
    fn read_history_notifies_empty() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(21.3, 55.2)));
        let state = registered_state();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        write(&radio, &dispatcher, b"RH");

        let notifies = radio.notifies.borrow();
        assert_eq!(notifies.len(), 1);
        assert!(notifies[0].2.is_empty());
    }

    #[test]
    fn other_tokens_and_attrs_ignored() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(21.3, 55.2)));
        let state = registered_state();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        write(&radio, &dispatcher, b"XX");
        write(&radio, &dispatcher, b"");
        *radio.input.borrow_mut() = Vec::from_slice(b"RN").unwrap();
        dispatcher.dispatch(StackEvent::GattWrite {
            conn: 3,
            attr: ATTRS.temperature,
        });

        assert!(radio.notifies.borrow().is_empty());
    }

    #[test]
    fn sensor_fault_sends_nothing() {
        let radio = Recorder::default();
        let sensor = Fixed(Err(SensorError::Timeout));
        let state = registered_state();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        write(&radio, &dispatcher, b"RN");
        assert!(radio.notifies.borrow().is_empty());
    }

    #[test]
    fn write_before_registration_ignored() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        write(&radio, &dispatcher, b"RN");
        assert!(radio.notifies.borrow().is_empty());
    }

    #[test]
    fn connect_registers_and_publishes() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        let response = dispatcher.dispatch(StackEvent::CentralConnect {
            conn: 3,
            peer: PeerAddress::default(),
        });
        assert_eq!(response, EventResponse::Ack);
        assert!(state.registry().contains(3));
        assert_eq!(state.pending().try_claim().map(|id| id.handle), Some(3));
    }

    #[test]
    fn second_connect_is_overload() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        for conn in [1, 2] {
            dispatcher.dispatch(StackEvent::CentralConnect {
                conn,
                peer: PeerAddress::default(),
            });
        }

        assert!(state.registry().contains(1));
        assert!(!state.registry().contains(2));
        assert_eq!(state.pending().try_claim().map(|id| id.handle), Some(1));
        assert!(radio.disconnects.borrow().is_empty());
    }

    #[test]
    fn out_of_range_connect_left_unregistered() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        dispatcher.dispatch(StackEvent::CentralConnect {
            conn: 40,
            peer: PeerAddress::default(),
        });
        assert!(state.registry().is_empty());
        assert!(!state.pending().is_occupied());
    }

    #[test]
    fn unknown_disconnect_is_harmless() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        let response = dispatcher.dispatch(StackEvent::CentralDisconnect {
            conn: 2,
            peer: PeerAddress::default(),
            reason: 0x13,
        });
        assert_eq!(response, EventResponse::Ack);
    }

    #[test]
    fn fixed_responses() {
        let radio = Recorder::default();
        let sensor = Fixed(Ok(Sample::new(1.0, 2.0)));
        let state = State::new();
        let dispatcher = EventDispatcher::new(&radio, &sensor, &state);

        assert_eq!(
            dispatcher.dispatch(StackEvent::GattReadRequest {
                conn: 0,
                attr: AttrHandle(10)
            }),
            EventResponse::ReadAccepted
        );
        assert_eq!(
            dispatcher.dispatch(StackEvent::GetSecret {
                sec_type: 0,
                index: 0,
                key: &[]
            }),
            EventResponse::NoSecret
        );
        assert_eq!(
            dispatcher.dispatch(StackEvent::SetSecret {
                sec_type: 0,
                key: &[1],
                value: &[2]
            }),
            EventResponse::SecretNotStored
        );
        for event in [
            StackEvent::ScanDone,
            StackEvent::MtuExchanged { conn: 0, mtu: 247 },
            StackEvent::L2cap(L2capEvent::Recv { conn: 0, cid: 64 }),
            StackEvent::Gattc(GattcEvent::Done { conn: 0, status: 0 }),
            StackEvent::Unknown { code: 99 },
        ] {
            assert_eq!(dispatcher.dispatch(event), EventResponse::Ack);
        }
        assert!(state.registry().is_empty());
        assert!(radio.notifies.borrow().is_empty());
    }

    fn dispatch_with(radio: &Failing) -> (EventResponse, State) {
        let sensor = Fixed(Ok(Sample::new(21.3, 55.2)));
        let state = registered_state();
        let response = {
            let dispatcher = EventDispatcher::new(radio, &sensor, &state);
            dispatcher.dispatch(StackEvent::CentralConnect {
                conn: 3,
                peer: PeerAddress::default(),
            });
            dispatcher.dispatch(StackEvent::GattWrite {
                conn: 3,
                attr: ATTRS.input,
            })
        };
        (response, state)
    }

    fn assert_registry_untouched(state: &State) {
        assert_eq!(state.registry().len(), 1);
        assert!(state.registry().contains(3));
        assert_eq!(state.pending().try_claim().map(|id| id.handle), Some(3));
    }

    #[test]
    fn notify_failure_is_contained() {
        let radio = Failing::new(b"RN", Ok(2));
        let (response, state) = dispatch_with(&radio);

        assert_eq!(response, EventResponse::Ack);
        assert_eq!(radio.notify_attempts.get(), 1);
        assert_registry_untouched(&state);
    }

    #[test]
    fn read_failure_is_contained() {
        let radio = Failing::new(b"RN", Err(StackError::ValueAccess));
        let (response, state) = dispatch_with(&radio);

        assert_eq!(response, EventResponse::Ack);
        assert_eq!(radio.notify_attempts.get(), 0);
        assert_registry_untouched(&state);
    }

    #[test]
    fn overlong_read_is_clamped() {
        // The stack claims more bytes than the buffer holds.
        let radio = Failing::new(b"RN", Ok(200));
        let (response, state) = dispatch_with(&radio);

        assert_eq!(response, EventResponse::Ack);
        // 24 bytes starting "RN" are not a command.
        assert_eq!(radio.notify_attempts.get(), 0);
        assert_registry_untouched(&state);
    }
}
