//! Temperature / humidity samples.
//!
//! Characteristic values are little-endian `i16` hundredths (°C and %RH).
//! The command channel answers with an ASCII record `"<temp>_<humidity>"`
//! built from the same truncated hundredths, so both views always agree.

pub mod dht22;

use core::cell::Cell;
use core::convert::Infallible;
use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::ble::connection::PeripheralState;
use crate::ble::stack::Radio;
use crate::config::{SENSOR_POLL_INTERVAL_MS, SENSOR_WARMUP_MS};
use crate::error::{Error, SensorError};

/// One temperature / relative-humidity reading.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub humidity: f32,
}

impl Sample {
    pub const fn new(temperature: f32, humidity: f32) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

/// Reading × 100, truncated toward zero (saturates at the `i16` range).
pub fn to_centi(value: f32) -> i16 {
    (value * 100.0) as i16
}

pub fn encode_temperature(celsius: f32) -> [u8; 2] {
    to_centi(celsius).to_le_bytes()
}

pub fn encode_humidity(percent: f32) -> [u8; 2] {
    to_centi(percent).to_le_bytes()
}

pub fn decode_temperature(raw: [u8; 2]) -> f32 {
    i16::from_le_bytes(raw) as f32 / 100.0
}

pub fn decode_humidity(raw: [u8; 2]) -> f32 {
    i16::from_le_bytes(raw) as f32 / 100.0
}

/// Longest record: `"-327.68_-327.68"`.
pub type Record = String<24>;

/// ASCII response record, two decimals per field.
pub fn format_record(sample: &Sample) -> Record {
    let mut out = Record::new();
    write_centi(&mut out, to_centi(sample.temperature));
    let _ = out.push('_');
    write_centi(&mut out, to_centi(sample.humidity));
    out
}

fn write_centi(out: &mut Record, centi: i16) {
    let sign = if centi < 0 { "-" } else { "" };
    let abs = centi.unsigned_abs();
    // Fits: the widest field is 7 chars.
    let _ = write!(out, "{}{}.{:02}", sign, abs / 100, abs % 100);
}

/// Inverse of [`format_record`].
pub fn parse_record(bytes: &[u8]) -> Option<Sample> {
    let text = core::str::from_utf8(bytes).ok()?;
    let (temp, hum) = text.split_once('_')?;
    Some(Sample::new(temp.parse().ok()?, hum.parse().ok()?))
}

/// "Read current (temperature, humidity) sample".
///
/// Called from the stack's event context, so implementations must not block.
pub trait SensorSource {
    fn read_sample(&self) -> Result<Sample, SensorError>;
}

impl<T: SensorSource + ?Sized> SensorSource for &T {
    fn read_sample(&self) -> Result<Sample, SensorError> {
        (**self).read_sample()
    }
}

/// A driver that performs a (blocking) measurement.
pub trait Measure {
    fn measure(&mut self) -> Result<Sample, SensorError>;
}

/// Latest polled sample, shared between the poller and the event context.
pub struct SampleCache<M: RawMutex> {
    latest: Mutex<M, Cell<Option<Sample>>>,
}

impl<M: RawMutex> SampleCache<M> {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(Cell::new(None)),
        }
    }

    pub fn store(&self, sample: Sample) {
        self.latest.lock(|c| c.set(Some(sample)));
    }

    pub fn latest(&self) -> Option<Sample> {
        self.latest.lock(Cell::get)
    }
}

impl<M: RawMutex> Default for SampleCache<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> SensorSource for SampleCache<M> {
    fn read_sample(&self) -> Result<Sample, SensorError> {
        self.latest().ok_or(SensorError::NotReady)
    }
}

/// Periodic measurement task: refreshes the cache and the
/// temperature / humidity characteristic values.
pub struct SensorPoller<'a, R, T, M, const N: usize>
where
    R: Radio,
    T: Measure,
    M: RawMutex,
{
    radio: &'a R,
    sensor: T,
    cache: &'a SampleCache<M>,
    state: &'a PeripheralState<M, N>,
}

impl<'a, R, T, M, const N: usize> SensorPoller<'a, R, T, M, N>
where
    R: Radio,
    T: Measure,
    M: RawMutex,
{
    pub fn new(
        radio: &'a R,
        sensor: T,
        cache: &'a SampleCache<M>,
        state: &'a PeripheralState<M, N>,
    ) -> Self {
        Self {
            radio,
            sensor,
            cache,
            state,
        }
    }

    /// Take one measurement.
    ///
    /// On a sensor fault the cache and characteristics are left as they
    /// were. Characteristic write failures are logged only.
    pub fn poll_once(&mut self) -> Result<Sample, Error> {
        let sample = self.sensor.measure()?;
        self.cache.store(sample);

        let Some(attrs) = self.state.attributes() else {
            debug!("sensor: services not registered yet, cache only");
            return Ok(sample);
        };

        if let Err(e) = self
            .radio
            .write_value(attrs.temperature, &encode_temperature(sample.temperature))
        {
            warn!("sensor: temperature write failed: {:?}", e);
        }
        if let Err(e) = self
            .radio
            .write_value(attrs.humidity, &encode_humidity(sample.humidity))
        {
            warn!("sensor: humidity write failed: {:?}", e);
        }

        Ok(sample)
    }

    /// Warm up, then poll forever.
    pub async fn run<D: DelayNs>(&mut self, delay: &mut D) -> Infallible {
        delay.delay_ms(SENSOR_WARMUP_MS).await;
        loop {
            match self.poll_once() {
                Ok(sample) => debug!(
                    "sensor: {} C, {} %RH",
                    sample.temperature,
                    sample.humidity
                ),
                Err(e) => warn!("sensor: read failed: {:?}", e),
            }
            delay.delay_ms(SENSOR_POLL_INTERVAL_MS).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[test]
    fn temperature_encoding() {
        assert_eq!(i16::from_le_bytes(encode_temperature(23.45)), 2345);
        assert_eq!(i16::from_le_bytes(encode_temperature(-5.0)), -500);
        assert_eq!(encode_temperature(21.3), [0x52, 0x08]);
        assert!((decode_temperature(encode_temperature(23.45)) - 23.45).abs() < 0.01);
    }

    #[test]
    fn encoding_truncates_toward_zero() {
        assert_eq!(to_centi(0.019), 1);
        assert_eq!(to_centi(-0.019), -1);
        assert_eq!(to_centi(1000.0), 32767);
    }

    #[test]
    fn humidity_encoding() {
        assert_eq!(i16::from_le_bytes(encode_humidity(55.2)), 5520);
        assert!((decode_humidity(encode_humidity(55.2)) - 55.2).abs() < 0.01);
    }

    #[test]
    fn record_format() {
        assert_eq!(format_record(&Sample::new(21.3, 55.2)).as_str(), "21.30_55.20");
        assert_eq!(format_record(&Sample::new(-0.5, 100.0)).as_str(), "-0.50_100.00");
        assert_eq!(format_record(&Sample::new(-12.07, 3.0)).as_str(), "-12.07_3.00");
    }

    #[test]
    fn record_parse() {
        let sample = parse_record(b"21.30_55.20").unwrap();
        assert!((sample.temperature - 21.3).abs() < 0.01);
        assert!((sample.humidity - 55.2).abs() < 0.01);

        assert!(parse_record(b"").is_none());
        assert!(parse_record(b"21.30").is_none());
        assert!(parse_record(b"abc_def").is_none());
    }

    #[test]
    fn extreme_record_fits() {
        let record = format_record(&Sample::new(-400.0, -400.0));
        assert_eq!(record.as_str(), "-327.68_-327.68");
    }

    #[test]
    fn cache_reports_not_ready_until_stored() {
        let cache: SampleCache<NoopRawMutex> = SampleCache::new();
        assert_eq!(cache.read_sample(), Err(SensorError::NotReady));
        cache.store(Sample::new(20.0, 40.0));
        assert_eq!(cache.read_sample(), Ok(Sample::new(20.0, 40.0)));
    }
}
