//! swarm-env-sensor firmware for nRF52840 + SoftDevice S140.
//!
//! Tasks:
//! - `softdevice_task`: runs the SoftDevice event loop.
//! - `radio_task`: advertising / GATT serving, feeds stack events to the dispatcher.
//! - `peripheral_task`: the advertise → adopt → serve → advertise loop.
//! - `sensor_task`: polls the DHT22 and refreshes the characteristics.
//!
//! The main task logs a heartbeat.

#![no_std]
#![no_main]

use core::mem;

use defmt::{error, info, unwrap};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_nrf::gpio::{Flex, OutputDrive, Pull};
use embassy_nrf::interrupt;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Delay, Duration, Timer};
use nrf_softdevice::{raw, Softdevice};
use panic_probe as _;
use static_cell::StaticCell;

use swarm_env_sensor::ble::softdevice::SoftdeviceRadio;
use swarm_env_sensor::config::{DEVICE_NAME, HEARTBEAT_SECS, MAX_CONNECTIONS};
use swarm_env_sensor::sensor::dht22::Dht22;
use swarm_env_sensor::sensor::SensorPoller;
use swarm_env_sensor::{
    device_advertising, AdvertisingParams, EventDispatcher, PeripheralController,
    PeripheralState, SampleCache, SERVICES,
};

type State = PeripheralState<CriticalSectionRawMutex, MAX_CONNECTIONS>;
type Cache = SampleCache<CriticalSectionRawMutex>;

static RADIO: StaticCell<SoftdeviceRadio> = StaticCell::new();
static STATE: StaticCell<State> = StaticCell::new();
static CACHE: StaticCell<Cache> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("swarm-env-sensor starting");

    // SoftDevice reserves priorities 0, 1 and 4.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = interrupt::Priority::P2;
    nrf_config.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    let sd_config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 247 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: DEVICE_NAME.as_ptr() as _,
            current_len: DEVICE_NAME.len() as u16,
            max_len: DEVICE_NAME.len() as u16,
            write_perm: unsafe { mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    };

    let sd = Softdevice::enable(&sd_config);
    let radio = match SoftdeviceRadio::new(sd, SERVICES) {
        Ok(radio) => RADIO.init(radio),
        Err(e) => defmt::panic!("GATT registration failed: {:?}", e),
    };
    let state: &'static State = STATE.init(State::new());
    let cache: &'static Cache = CACHE.init(Cache::new());

    // DHT22 data line: open-drain, external pull-up.
    let mut dht_pin = Flex::new(p.P0_14);
    dht_pin.set_as_input_output(Pull::None, OutputDrive::Standard0Disconnect1);

    unwrap!(spawner.spawn(softdevice_task(radio.softdevice())));
    unwrap!(spawner.spawn(radio_task(radio, state, cache)));
    unwrap!(spawner.spawn(peripheral_task(radio, state)));
    unwrap!(spawner.spawn(sensor_task(radio, state, cache, dht_pin)));

    loop {
        Timer::after(Duration::from_secs(HEARTBEAT_SECS)).await;
        info!(
            "heartbeat: {} connection(s), latest sample {:?}",
            state.registry().len(),
            cache.latest()
        );
    }
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn radio_task(
    radio: &'static SoftdeviceRadio,
    state: &'static State,
    cache: &'static Cache,
) -> ! {
    let dispatcher = EventDispatcher::new(radio, cache, state);
    radio.run_events(&dispatcher).await
}

#[embassy_executor::task]
async fn peripheral_task(radio: &'static SoftdeviceRadio, state: &'static State) {
    let controller = match PeripheralController::new(
        radio,
        state,
        &device_advertising(),
        AdvertisingParams::default(),
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("advertising payload rejected: {:?}", e);
            return;
        }
    };

    match controller.run(&mut Delay).await {
        Ok(never) => match never {},
        Err(e) => error!("peripheral stopped: {:?}", e),
    }
}

#[embassy_executor::task]
async fn sensor_task(
    radio: &'static SoftdeviceRadio,
    state: &'static State,
    cache: &'static Cache,
    pin: Flex<'static>,
) -> ! {
    let mut poller = SensorPoller::new(radio, Dht22::new(pin, Delay), cache, state);
    match poller.run(&mut Delay).await {}
}
