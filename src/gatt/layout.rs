//! The fixed shape of each simulated service.
//!
//! Which characteristics a service carries, their flags, notification
//! periods and descriptors, and where each object lands in the tree.

use std::time::Duration;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::bluez::{paths, sig_uuid};

pub const BATTERY_SERVICE_UUID: Uuid = sig_uuid(0x180f);
pub const BATTERY_LEVEL_UUID: Uuid = sig_uuid(0x2a19);
pub const BATTERY_LEVEL_STATUS_UUID: Uuid = sig_uuid(0x2a1b);

pub const SCAN_PARAMETERS_SERVICE_UUID: Uuid =
   Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
pub const SCAN_INTERVAL_WINDOW_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
pub const SCAN_REFRESH_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef2);

pub const IMMEDIATE_ALERT_SERVICE_UUID: Uuid = sig_uuid(0x1802);
pub const ALERT_LEVEL_UUID: Uuid = sig_uuid(0x2a06);

pub const HEALTH_THERMOMETER_SERVICE_UUID: Uuid = sig_uuid(0x1809);
pub const TEMPERATURE_MEASUREMENT_UUID: Uuid = sig_uuid(0x2a1c);
pub const TEMPERATURE_TYPE_UUID: Uuid = sig_uuid(0x2a1d);
pub const INTERMEDIATE_TEMPERATURE_UUID: Uuid = sig_uuid(0x2a1e);
pub const MEASUREMENT_INTERVAL_UUID: Uuid = sig_uuid(0x2a21);

pub const USER_DESCRIPTION_UUID: Uuid = sig_uuid(0x2901);
pub const CLIENT_CONFIGURATION_UUID: Uuid = sig_uuid(0x2902);

/// Services the peripheral can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum SimulatedService {
   #[strum(to_string = "Battery Service")]
   Battery,
   #[strum(to_string = "Scan Parameters Service")]
   ScanParameters,
   #[strum(to_string = "Find Me Service")]
   FindMe,
   #[strum(to_string = "Health Thermometer Service")]
   HealthThermometer,
}

impl SimulatedService {
   /// Selects a service by the prefix of `name`, e.g. "Battery Service (BAS)".
   pub fn from_name(name: &str) -> Option<Self> {
      <Self as strum::IntoEnumIterator>::iter().find(|svc| name.starts_with(&svc.to_string()))
   }

   pub const fn uuid(self) -> Uuid {
      match self {
         Self::Battery => BATTERY_SERVICE_UUID,
         Self::ScanParameters => SCAN_PARAMETERS_SERVICE_UUID,
         Self::FindMe => IMMEDIATE_ALERT_SERVICE_UUID,
         Self::HealthThermometer => HEALTH_THERMOMETER_SERVICE_UUID,
      }
   }

   pub const fn characteristics(self) -> &'static [CharacteristicKind] {
      use CharacteristicKind::*;
      match self {
         Self::Battery => &[BatteryLevel, BatteryLevelStatus],
         Self::ScanParameters => &[ScanIntervalWindow, ScanRefresh],
         Self::FindMe => &[AlertLevel],
         Self::HealthThermometer => &[
            TemperatureMeasurement,
            IntermediateTemperature,
            TemperatureType,
            MeasurementInterval,
         ],
      }
   }

   /// Object paths for this service exported at `index`.
   pub fn layout(self, index: usize) -> ServiceLayout {
      let path = paths::service_path(index, self == Self::HealthThermometer);
      let characteristics = self
         .characteristics()
         .iter()
         .enumerate()
         .map(|(i, &kind)| {
            let char_path = paths::characteristic_path(&path, i);
            CharacteristicLayout {
               kind,
               descriptor: kind.descriptor().map(|desc| DescriptorLayout {
                  kind: desc,
                  path: paths::descriptor_path(&char_path, 0),
               }),
               path: char_path,
            }
         })
         .collect();
      ServiceLayout {
         service: self,
         path,
         characteristics,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CharacteristicKind {
   #[strum(to_string = "Battery Level")]
   BatteryLevel,
   #[strum(to_string = "Battery Level Status")]
   BatteryLevelStatus,
   #[strum(to_string = "Scan Interval Window")]
   ScanIntervalWindow,
   #[strum(to_string = "Scan Refresh")]
   ScanRefresh,
   #[strum(to_string = "Alert Level")]
   AlertLevel,
   #[strum(to_string = "Temperature Measurement")]
   TemperatureMeasurement,
   #[strum(to_string = "Intermediate Temperature")]
   IntermediateTemperature,
   #[strum(to_string = "Temperature Type")]
   TemperatureType,
   #[strum(to_string = "Measurement Interval")]
   MeasurementInterval,
}

impl CharacteristicKind {
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::BatteryLevel => BATTERY_LEVEL_UUID,
         Self::BatteryLevelStatus => BATTERY_LEVEL_STATUS_UUID,
         Self::ScanIntervalWindow => SCAN_INTERVAL_WINDOW_UUID,
         Self::ScanRefresh => SCAN_REFRESH_UUID,
         Self::AlertLevel => ALERT_LEVEL_UUID,
         Self::TemperatureMeasurement => TEMPERATURE_MEASUREMENT_UUID,
         Self::IntermediateTemperature => INTERMEDIATE_TEMPERATURE_UUID,
         Self::TemperatureType => TEMPERATURE_TYPE_UUID,
         Self::MeasurementInterval => MEASUREMENT_INTERVAL_UUID,
      }
   }

   pub const fn flags(self) -> &'static [&'static str] {
      match self {
         Self::BatteryLevel | Self::BatteryLevelStatus => &["read", "notify"],
         Self::ScanIntervalWindow | Self::AlertLevel => &["write-without-response"],
         Self::ScanRefresh | Self::IntermediateTemperature => &["notify"],
         Self::TemperatureMeasurement => &["indicate"],
         Self::TemperatureType => &["read"],
         Self::MeasurementInterval => &["read", "write"],
      }
   }

   /// Period of notifications/indications, `None` when it sends none.
   pub const fn notify_period(self) -> Option<Duration> {
      match self {
         Self::BatteryLevel | Self::TemperatureMeasurement => Some(Duration::from_secs(3)),
         Self::BatteryLevelStatus => Some(Duration::from_secs(5)),
         Self::ScanRefresh => Some(Duration::from_secs(10)),
         Self::IntermediateTemperature => Some(Duration::from_secs(2)),
         _ => None,
      }
   }

   pub const fn descriptor(self) -> Option<DescriptorKind> {
      match self {
         Self::BatteryLevel | Self::BatteryLevelStatus | Self::ScanRefresh => {
            Some(DescriptorKind::ClientConfiguration)
         },
         Self::TemperatureMeasurement => Some(DescriptorKind::UserDescription("Temperature Measurement")),
         Self::IntermediateTemperature => {
            Some(DescriptorKind::UserDescription("Intermediate Temperature"))
         },
         Self::TemperatureType => Some(DescriptorKind::UserDescription("Temperature Type")),
         Self::MeasurementInterval => Some(DescriptorKind::UserDescription("Measurement Interval")),
         Self::ScanIntervalWindow | Self::AlertLevel => None,
      }
   }

   /// Whether writes to its CCCD start and stop notifications.
   pub const fn cccd_controls_notify(self) -> bool {
      matches!(self, Self::ScanRefresh)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
   ClientConfiguration,
   UserDescription(&'static str),
}

impl DescriptorKind {
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::ClientConfiguration => CLIENT_CONFIGURATION_UUID,
         Self::UserDescription(_) => USER_DESCRIPTION_UUID,
      }
   }

   pub const fn flags(self) -> &'static [&'static str] {
      match self {
         Self::ClientConfiguration => &["read", "write"],
         Self::UserDescription(_) => &["read"],
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLayout {
   pub kind: DescriptorKind,
   pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicLayout {
   pub kind: CharacteristicKind,
   pub path: String,
   pub descriptor: Option<DescriptorLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
   pub service: SimulatedService,
   pub path: String,
   pub characteristics: SmallVec<[CharacteristicLayout; 4]>,
}

impl ServiceLayout {
   /// Every object path, service first.
   pub fn object_paths(&self) -> Vec<&str> {
      let mut paths = vec![self.path.as_str()];
      for chr in &self.characteristics {
         paths.push(&chr.path);
         if let Some(desc) = &chr.descriptor {
            paths.push(&desc.path);
         }
      }
      paths
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_service_from_name_prefix() {
      assert_eq!(
         SimulatedService::from_name("Battery Service"),
         Some(SimulatedService::Battery)
      );
      assert_eq!(
         SimulatedService::from_name("Health Thermometer Service (HTS)"),
         Some(SimulatedService::HealthThermometer)
      );
      assert_eq!(SimulatedService::from_name("battery service"), None);
      assert_eq!(SimulatedService::from_name("Heart Rate Service"), None);
   }

   #[test]
   fn test_uuids() {
      assert_eq!(
         SimulatedService::Battery.uuid().to_string(),
         "0000180f-0000-1000-8000-00805f9b34fb"
      );
      assert_eq!(
         SCAN_REFRESH_UUID.to_string(),
         "12345678-1234-5678-1234-56789abcdef2"
      );
      assert_eq!(
         CharacteristicKind::MeasurementInterval.uuid().to_string(),
         "00002a21-0000-1000-8000-00805f9b34fb"
      );
   }

   #[test]
   fn test_battery_layout() {
      let layout = SimulatedService::Battery.layout(0);
      assert_eq!(
         layout.object_paths(),
         vec![
            "/org/test/gatt/application/service0",
            "/org/test/gatt/application/service0/char0",
            "/org/test/gatt/application/service0/char0/desc0",
            "/org/test/gatt/application/service0/char1",
            "/org/test/gatt/application/service0/char1/desc0",
         ]
      );
      assert!(
         layout
            .characteristics
            .iter()
            .all(|c| c.descriptor.as_ref().map(|d| d.kind) == Some(DescriptorKind::ClientConfiguration))
      );
   }

   #[test]
   fn test_thermometer_layout() {
      let layout = SimulatedService::HealthThermometer.layout(2);
      assert_eq!(layout.path, "/org/test/gatt/application/ht_service2");
      assert_eq!(layout.characteristics.len(), 4);
      assert_eq!(
         layout.characteristics[3].path,
         "/org/test/gatt/application/ht_service2/char3"
      );
      assert_eq!(
         layout.characteristics[2].descriptor,
         Some(DescriptorLayout {
            kind: DescriptorKind::UserDescription("Temperature Type"),
            path: "/org/test/gatt/application/ht_service2/char2/desc0".into(),
         })
      );
   }

   #[test]
   fn test_find_me_has_no_descriptors() {
      let layout = SimulatedService::FindMe.layout(1);
      assert_eq!(layout.object_paths().len(), 2);
      assert_eq!(
         layout.characteristics[0].kind.flags(),
         &["write-without-response"]
      );
   }

   #[test]
   fn test_notify_periods() {
      use CharacteristicKind::*;
      let secs = |k: CharacteristicKind| k.notify_period().map(|d| d.as_secs());
      assert_eq!(secs(BatteryLevel), Some(3));
      assert_eq!(secs(BatteryLevelStatus), Some(5));
      assert_eq!(secs(ScanRefresh), Some(10));
      assert_eq!(secs(TemperatureMeasurement), Some(3));
      assert_eq!(secs(IntermediateTemperature), Some(2));
      assert_eq!(secs(MeasurementInterval), None);
      assert!(ScanRefresh.cccd_controls_notify());
      assert!(!BatteryLevel.cccd_controls_notify());
   }
}
