//! Simulated sensor values and their wire encodings.

use std::ops::RangeInclusive;

use crossbeam::atomic::AtomicCell;
use rand::Rng;

/// IEEE-11073 exponent used for temperatures (hundredths of a degree).
const TEMPERATURE_EXPONENT: i8 = -2;

/// Default Measurement Interval in seconds.
pub const DEFAULT_MEASUREMENT_INTERVAL: u16 = 5;

/// Immediate Alert `Alert Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AlertLevel {
   #[strum(to_string = "No Alert")]
   NoAlert,
   #[strum(to_string = "Mild Alert")]
   Mild,
   #[strum(to_string = "High Alert")]
   High,
   #[strum(to_string = "Unknown")]
   Unknown(u8),
}

impl From<u8> for AlertLevel {
   fn from(value: u8) -> Self {
      match value {
         0x00 => Self::NoAlert,
         0x01 => Self::Mild,
         0x02 => Self::High,
         other => Self::Unknown(other),
      }
   }
}

/// Battery Level Status as simulated (a reduced form of the SIG field).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum BatteryStatus {
   Good = 1,
   Low = 2,
   Critical = 3,
}

/// Temperature Type location codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum TemperatureType {
   Armpit = 1,
   Body = 2,
   Ear = 3,
   Finger = 4,
   GastroIntestinalTract = 5,
   Mouth = 6,
   Rectum = 7,
   Toe = 8,
   Tympanum = 9,
}

/// IEEE-11073 32-bit FLOAT as the Health Thermometer profile sends it: the
/// 24-bit signed mantissa in little-endian order, then the exponent byte.
///
/// Read as one little-endian `u32` this puts the exponent in the top byte,
/// which is what GATT clients decode. Encoders that write the exponent first
/// (`[exp, m0, m1, m2]`) produce a value clients read as a different
/// temperature.
pub fn encode_ieee11073_float(celsius: f64) -> [u8; 4] {
   let mantissa = (celsius * 100.0).round() as i32;
   let [m0, m1, m2, _] = mantissa.to_le_bytes();
   [m0, m1, m2, TEMPERATURE_EXPONENT as u8]
}

/// Temperature Measurement value: flags (Celsius, no timestamp, no type)
/// followed by the FLOAT.
pub fn temperature_measurement(celsius: f64) -> Vec<u8> {
   let mut value = Vec::with_capacity(5);
   value.push(0x00);
   value.extend_from_slice(&encode_ieee11073_float(celsius));
   value
}

pub fn random_battery_level(range: RangeInclusive<u8>) -> u8 {
   rand::thread_rng().gen_range(range)
}

pub fn random_battery_status() -> BatteryStatus {
   let raw = rand::thread_rng().gen_range(1..=3);
   BatteryStatus::from_repr(raw).unwrap_or(BatteryStatus::Good)
}

/// Random body temperature in 35.00..=39.00, rounded to hundredths.
pub fn random_temperature() -> f64 {
   let raw: f64 = rand::thread_rng().gen_range(35.0..=39.0);
   (raw * 100.0).round() / 100.0
}

/// Scan Interval Window: interval then window, both u16 LE.
pub fn parse_scan_interval_window(value: &[u8]) -> Option<(u16, u16)> {
   match *value {
      [i0, i1, w0, w1] => Some((u16::from_le_bytes([i0, i1]), u16::from_le_bytes([w0, w1]))),
      _ => None,
   }
}

pub fn parse_u16_le(value: &[u8]) -> Option<u16> {
   match *value {
      [lo, hi] => Some(u16::from_le_bytes([lo, hi])),
      _ => None,
   }
}

/// Values clients wrote to the simulated peripheral.
pub struct SensorState {
   scan_parameters: AtomicCell<Option<(u16, u16)>>,
   alert_level: AtomicCell<Option<AlertLevel>>,
   measurement_interval: AtomicCell<u16>,
}

impl Default for SensorState {
   fn default() -> Self {
      Self {
         scan_parameters: AtomicCell::new(None),
         alert_level: AtomicCell::new(None),
         measurement_interval: AtomicCell::new(DEFAULT_MEASUREMENT_INTERVAL),
      }
   }
}

impl SensorState {
   /// Last `(interval, window)` written.
   pub fn scan_parameters(&self) -> Option<(u16, u16)> {
      self.scan_parameters.load()
   }

   pub fn set_scan_parameters(&self, interval: u16, window: u16) {
      self.scan_parameters.store(Some((interval, window)));
   }

   pub fn alert_level(&self) -> Option<AlertLevel> {
      self.alert_level.load()
   }

   pub fn set_alert_level(&self, level: AlertLevel) {
      self.alert_level.store(Some(level));
   }

   pub fn measurement_interval(&self) -> u16 {
      self.measurement_interval.load()
   }

   pub fn set_measurement_interval(&self, seconds: u16) {
      self.measurement_interval.store(seconds);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_ieee11073_float() {
      // 36.5 C = 3650 * 10^-2
      assert_eq!(encode_ieee11073_float(36.5), [0x42, 0x0e, 0x00, 0xfe]);
      assert_eq!(encode_ieee11073_float(39.0), [0x3c, 0x0f, 0x00, 0xfe]);
      assert_eq!(encode_ieee11073_float(-1.0), [0x9c, 0xff, 0xff, 0xfe]);
   }

   #[test]
   fn test_ieee11073_float_exponent_in_high_byte() {
      let raw = u32::from_le_bytes(encode_ieee11073_float(36.5));
      assert_eq!((raw >> 24) as u8 as i8, TEMPERATURE_EXPONENT);
      assert_eq!(raw & 0x00ff_ffff, 3650);
   }

   #[test]
   fn test_temperature_measurement_layout() {
      let value = temperature_measurement(37.25);
      assert_eq!(value, vec![0x00, 0x8d, 0x0e, 0x00, 0xfe]);
   }

   #[test]
   fn test_alert_levels() {
      assert_eq!(AlertLevel::from(0), AlertLevel::NoAlert);
      assert_eq!(AlertLevel::from(2), AlertLevel::High);
      assert_eq!(AlertLevel::from(7), AlertLevel::Unknown(7));
      assert_eq!(AlertLevel::Mild.to_string(), "Mild Alert");
      assert_eq!(AlertLevel::Unknown(9).to_string(), "Unknown");
   }

   #[test]
   fn test_lookup_tables() {
      assert_eq!(BatteryStatus::from_repr(3), Some(BatteryStatus::Critical));
      assert_eq!(BatteryStatus::from_repr(0), None);
      assert_eq!(TemperatureType::Body as u8, 2);
      assert_eq!(TemperatureType::from_repr(9), Some(TemperatureType::Tympanum));
   }

   #[test]
   fn test_random_values_in_range() {
      for _ in 0..200 {
         let level = random_battery_level(10..=100);
         assert!((10..=100).contains(&level));

         let temp = random_temperature();
         assert!((35.0..=39.0).contains(&temp));
         assert_eq!((temp * 100.0).round() / 100.0, temp);

         assert!((1..=3).contains(&(random_battery_status() as u8)));
      }
   }

   #[test]
   fn test_scan_interval_window() {
      assert_eq!(
         parse_scan_interval_window(&[0x10, 0x00, 0x08, 0x00]),
         Some((16, 8))
      );
      assert_eq!(
         parse_scan_interval_window(&[0x00, 0x40, 0x30, 0x00]),
         Some((0x4000, 0x30))
      );
      assert_eq!(parse_scan_interval_window(&[0x10, 0x00, 0x08]), None);
      assert_eq!(parse_scan_interval_window(&[]), None);
   }

   #[test]
   fn test_u16_le() {
      assert_eq!(parse_u16_le(&[0x05, 0x00]), Some(5));
      assert_eq!(parse_u16_le(&[0x2c, 0x01]), Some(300));
      assert_eq!(parse_u16_le(&[0x05]), None);
   }

   #[test]
   fn test_sensor_state() {
      let state = SensorState::default();
      assert_eq!(state.measurement_interval(), DEFAULT_MEASUREMENT_INTERVAL);
      assert_eq!(state.scan_parameters(), None);

      state.set_scan_parameters(48, 24);
      state.set_alert_level(AlertLevel::Mild);
      state.set_measurement_interval(60);

      assert_eq!(state.scan_parameters(), Some((48, 24)));
      assert_eq!(state.alert_level(), Some(AlertLevel::Mild));
      assert_eq!(state.measurement_interval(), 60);
   }
}
