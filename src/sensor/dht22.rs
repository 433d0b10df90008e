//! DHT22 / AM2302 single-wire driver.
//!
//! Frame: 40 bits, MSB first.
//!
//! ```text
//! [hum hi][hum lo][temp hi][temp lo][checksum]
//! ```
//!
//! Humidity and temperature are tenths; bit 15 of the temperature word is
//! the sign. Checksum is the low byte of the sum of the first four bytes.
//!
//! The bus is open-drain with an external pull-up, so the data pin must
//! implement both `InputPin` and `OutputPin` (e.g. an embassy-nrf `Flex`
//! configured as `OutputDrive::Standard0Disconnect1`).

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use super::{Measure, Sample};
use crate::error::SensorError;

/// Host start pulse (ms). Datasheet minimum is 1 ms.
const START_LOW_MS: u32 = 1;
/// Release before the sensor responds (µs).
const START_RELEASE_US: u32 = 30;
/// A bit is `1` if the line is still high this long after its rising edge.
const BIT_SAMPLE_US: u32 = 35;
/// Longest single level in the protocol, with margin (µs).
const LEVEL_TIMEOUT_US: u32 = 100;

/// Validate and decode one 5-byte frame.
pub fn decode_frame(frame: [u8; 5]) -> Result<Sample, SensorError> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(SensorError::Checksum);
    }

    let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f32 / 10.0;
    let raw_temp = u16::from_be_bytes([frame[2], frame[3]]);
    let magnitude = (raw_temp & 0x7FFF) as f32 / 10.0;
    let temperature = if raw_temp & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    };

    Ok(Sample::new(temperature, humidity))
}

pub struct Dht22<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(mut pin: P, delay: D) -> Self {
        // Idle high.
        let _ = pin.set_high();
        Self { pin, delay }
    }

    /// Run one full transaction. Blocks for about 5 ms.
    pub fn read(&mut self) -> Result<Sample, SensorError> {
        self.pin.set_low().map_err(|_| SensorError::Bus)?;
        self.delay.delay_ms(START_LOW_MS);
        self.pin.set_high().map_err(|_| SensorError::Bus)?;
        self.delay.delay_us(START_RELEASE_US);

        // Response: 80 µs low, 80 µs high, then the first bit's low phase.
        self.wait_for(false)?;
        self.wait_for(true)?;
        self.wait_for(false)?;

        let mut frame = [0u8; 5];
        for bit in 0..40 {
            self.wait_for(true)?;
            self.delay.delay_us(BIT_SAMPLE_US);
            if self.pin.is_high().map_err(|_| SensorError::Bus)? {
                frame[bit / 8] |= 0x80 >> (bit % 8);
                self.wait_for(false)?;
            }
        }

        decode_frame(frame)
    }

    fn wait_for(&mut self, high: bool) -> Result<(), SensorError> {
        for _ in 0..LEVEL_TIMEOUT_US {
            if self.pin.is_high().map_err(|_| SensorError::Bus)? == high {
                return Ok(());
            }
            self.delay.delay_us(1);
        }
        Err(SensorError::Timeout)
    }
}

impl<P, D> Measure for Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn measure(&mut self) -> Result<Sample, SensorError> {
        self.read()
    }
}
