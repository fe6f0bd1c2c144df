//! Exported GattService1, GattCharacteristic1 and GattDescriptor1 objects.

use std::{collections::HashMap, sync::Arc};

use log::{debug, error, info, warn};
use tokio::{task::JoinHandle, time};
use uuid::Uuid;
use zbus::{
   ObjectServer, fdo, interface,
   object_server::InterfaceRef,
   zvariant::{OwnedObjectPath, OwnedValue},
};

use crate::{
   error::Result,
   event::{EventSender, HarnessEvent},
   gatt::{
      layout::{CharacteristicKind, CharacteristicLayout, DescriptorKind, DescriptorLayout},
      sensor::{
         self, AlertLevel, SensorState, TemperatureType, parse_scan_interval_window, parse_u16_le,
      },
   },
};

const CCCD_DISABLED: u16 = 0x0000;
const CCCD_NOTIFY: u16 = 0x0001;

/// Value returned by `ReadValue`, `None` when the characteristic is not
/// readable.
pub fn read_value(kind: CharacteristicKind, state: &SensorState) -> Option<Vec<u8>> {
   match kind {
      CharacteristicKind::BatteryLevel => {
         let level = sensor::random_battery_level(10..=100);
         info!("Battery Level read: {level}%");
         Some(vec![level])
      },
      CharacteristicKind::BatteryLevelStatus => {
         let status = sensor::random_battery_status();
         info!("Battery Level Status read: {status}");
         Some(vec![status as u8])
      },
      CharacteristicKind::TemperatureMeasurement | CharacteristicKind::IntermediateTemperature => {
         Some(sensor::temperature_measurement(sensor::random_temperature()))
      },
      CharacteristicKind::TemperatureType => Some(vec![TemperatureType::Body as u8]),
      CharacteristicKind::MeasurementInterval => {
         Some(state.measurement_interval().to_le_bytes().to_vec())
      },
      CharacteristicKind::ScanIntervalWindow
      | CharacteristicKind::ScanRefresh
      | CharacteristicKind::AlertLevel => None,
   }
}

/// Value sent with each periodic notification.
pub fn notification_value(kind: CharacteristicKind) -> Option<Vec<u8>> {
   match kind {
      CharacteristicKind::BatteryLevel => Some(vec![sensor::random_battery_level(5..=100)]),
      CharacteristicKind::BatteryLevelStatus => Some(vec![sensor::random_battery_status() as u8]),
      // Refresh required
      CharacteristicKind::ScanRefresh => Some(vec![0x00]),
      CharacteristicKind::TemperatureMeasurement | CharacteristicKind::IntermediateTemperature => {
         Some(sensor::temperature_measurement(sensor::random_temperature()))
      },
      _ => None,
   }
}

/// Applies a client write. Malformed values are logged and dropped; the
/// returned event describes an accepted write.
pub fn apply_write(
   kind: CharacteristicKind,
   state: &SensorState,
   value: &[u8],
) -> fdo::Result<Option<HarnessEvent>> {
   match kind {
      CharacteristicKind::ScanIntervalWindow => {
         let Some((interval, window)) = parse_scan_interval_window(value) else {
            error!("Invalid Scan Interval Window size: {}", value.len());
            return Ok(None);
         };
         state.set_scan_parameters(interval, window);
         info!("Scan Interval Window updated by client: interval={interval} window={window}");
         Ok(Some(HarnessEvent::ScanParametersWritten { interval, window }))
      },
      CharacteristicKind::AlertLevel => {
         let Some(&raw) = value.first() else {
            warn!("Empty Alert Level write received");
            return Ok(None);
         };
         let level = AlertLevel::from(raw);
         state.set_alert_level(level);
         info!("Immediate Alert Level written: {level}");
         Ok(Some(HarnessEvent::AlertLevelWritten(level)))
      },
      CharacteristicKind::MeasurementInterval => {
         let Some(seconds) = parse_u16_le(value) else {
            error!("Invalid Measurement Interval size: {}", value.len());
            return Ok(None);
         };
         state.set_measurement_interval(seconds);
         info!("Measurement Interval updated: {seconds}s");
         Ok(Some(HarnessEvent::MeasurementIntervalWritten(seconds)))
      },
      other => Err(fdo::Error::NotSupported(format!("{other} is not writable"))),
   }
}

fn object_path(path: &str) -> Result<OwnedObjectPath> {
   Ok(OwnedObjectPath::try_from(path.to_string())?)
}

pub struct GattService {
   uuid: Uuid,
   characteristics: Vec<OwnedObjectPath>,
}

impl GattService {
   pub fn new(uuid: Uuid, characteristics: &[CharacteristicLayout]) -> Result<Self> {
      Ok(Self {
         uuid,
         characteristics: characteristics
            .iter()
            .map(|c| object_path(&c.path))
            .collect::<Result<_>>()?,
      })
   }
}

#[interface(name = "org.bluez.GattService1")]
impl GattService {
   #[zbus(property, name = "UUID")]
   fn uuid(&self) -> String {
      self.uuid.to_string()
   }

   #[zbus(property)]
   fn primary(&self) -> bool {
      true
   }

   #[zbus(property)]
   fn characteristics(&self) -> Vec<OwnedObjectPath> {
      self.characteristics.clone()
   }
}

pub struct GattCharacteristic {
   kind: CharacteristicKind,
   path: OwnedObjectPath,
   service: OwnedObjectPath,
   descriptors: Vec<OwnedObjectPath>,
   value: Vec<u8>,
   notifier: Option<JoinHandle<()>>,
   state: Arc<SensorState>,
   event_tx: EventSender,
}

impl GattCharacteristic {
   pub fn new(
      layout: &CharacteristicLayout,
      service: &str,
      state: Arc<SensorState>,
      event_tx: EventSender,
   ) -> Result<Self> {
      Ok(Self {
         kind: layout.kind,
         path: object_path(&layout.path)?,
         service: object_path(service)?,
         descriptors: layout
            .descriptor
            .iter()
            .map(|d| object_path(&d.path))
            .collect::<Result<_>>()?,
         value: Vec::new(),
         notifier: None,
         state,
         event_tx,
      })
   }

   pub const fn kind(&self) -> CharacteristicKind {
      self.kind
   }

   pub const fn is_notifying(&self) -> bool {
      self.notifier.is_some()
   }

   /// Starts the periodic sender unless one is already running.
   pub fn start_notifications(&mut self, this: InterfaceRef<Self>) {
      if self.notifier.is_some() {
         return;
      }
      let Some(period) = self.kind.notify_period() else {
         return;
      };
      let kind = self.kind;

      self.notifier = Some(tokio::spawn(async move {
         let mut ticker = time::interval(period);
         // First value goes out one period after subscribing
         ticker.tick().await;
         loop {
            ticker.tick().await;
            let Some(value) = notification_value(kind) else {
               break;
            };
            debug!("{kind} notification: {}", hex::encode(&value));
            let mut chr = this.get_mut().await;
            chr.value = value;
            if let Err(e) = chr.value_changed(this.signal_emitter()).await {
               warn!("Failed to send {kind} notification: {e}");
            }
         }
      }));
      info!("{kind}: Notifications started");
   }

   pub fn stop_notifications(&mut self) {
      if let Some(notifier) = self.notifier.take() {
         notifier.abort();
         info!("{}: Notifications stopped", self.kind);
      }
   }
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl GattCharacteristic {
   async fn read_value(&mut self, _options: HashMap<String, OwnedValue>) -> fdo::Result<Vec<u8>> {
      let value = read_value(self.kind, &self.state)
         .ok_or_else(|| fdo::Error::NotSupported(format!("{} is not readable", self.kind)))?;
      self.value.clone_from(&value);
      Ok(value)
   }

   async fn write_value(
      &mut self,
      value: Vec<u8>,
      _options: HashMap<String, OwnedValue>,
   ) -> fdo::Result<()> {
      debug!("{} WriteValue: {}", self.kind, hex::encode(&value));
      if let Some(event) = apply_write(self.kind, &self.state, &value)? {
         self.value = value;
         self.event_tx.emit(event);
      }
      Ok(())
   }

   async fn start_notify(&mut self, #[zbus(object_server)] server: &ObjectServer) -> fdo::Result<()> {
      if self.notifier.is_some() {
         return Ok(());
      }
      if self.kind.notify_period().is_none() {
         return Err(fdo::Error::NotSupported(format!(
            "{} does not notify",
            self.kind
         )));
      }
      let this = server.interface::<_, Self>(self.path.as_str()).await?;
      self.start_notifications(this);
      Ok(())
   }

   async fn stop_notify(&mut self) {
      self.stop_notifications();
   }

   #[zbus(property, name = "UUID")]
   fn uuid(&self) -> String {
      self.kind.uuid().to_string()
   }

   #[zbus(property)]
   fn service(&self) -> OwnedObjectPath {
      self.service.clone()
   }

   #[zbus(property)]
   fn flags(&self) -> Vec<String> {
      self.kind.flags().iter().map(|f| (*f).to_string()).collect()
   }

   #[zbus(property)]
   fn descriptors(&self) -> Vec<OwnedObjectPath> {
      self.descriptors.clone()
   }

   #[zbus(property)]
   fn value(&self) -> Vec<u8> {
      self.value.clone()
   }

   #[zbus(property)]
   fn notifying(&self) -> bool {
      self.is_notifying()
   }
}

pub struct GattDescriptor {
   kind: DescriptorKind,
   parent: CharacteristicKind,
   characteristic: OwnedObjectPath,
}

impl GattDescriptor {
   pub fn new(layout: &DescriptorLayout, parent: &CharacteristicLayout) -> Result<Self> {
      Ok(Self {
         kind: layout.kind,
         parent: parent.kind,
         characteristic: object_path(&parent.path)?,
      })
   }
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl GattDescriptor {
   async fn read_value(&self, _options: HashMap<String, OwnedValue>) -> Vec<u8> {
      match self.kind {
         DescriptorKind::ClientConfiguration => {
            debug!("{} CCCD: ReadValue", self.parent);
            CCCD_DISABLED.to_le_bytes().to_vec()
         },
         DescriptorKind::UserDescription(text) => text.as_bytes().to_vec(),
      }
   }

   async fn write_value(
      &self,
      value: Vec<u8>,
      _options: HashMap<String, OwnedValue>,
      #[zbus(object_server)] server: &ObjectServer,
   ) -> fdo::Result<()> {
      if let DescriptorKind::UserDescription(_) = self.kind {
         return Err(fdo::Error::NotSupported("descriptor is read-only".into()));
      }
      debug!("{} CCCD write: {}", self.parent, hex::encode(&value));
      if !self.parent.cccd_controls_notify() {
         return Ok(());
      }
      let Some(cccd) = parse_u16_le(&value) else {
         return Ok(());
      };

      let chr = server
         .interface::<_, GattCharacteristic>(self.characteristic.as_str())
         .await?;
      match cccd {
         CCCD_NOTIFY => chr.get_mut().await.start_notifications(chr.clone()),
         CCCD_DISABLED => chr.get_mut().await.stop_notifications(),
         other => warn!("Unknown CCCD value: {other:#06x}"),
      }
      Ok(())
   }

   #[zbus(property, name = "UUID")]
   fn uuid(&self) -> String {
      self.kind.uuid().to_string()
   }

   #[zbus(property)]
   fn characteristic(&self) -> OwnedObjectPath {
      self.characteristic.clone()
   }

   #[zbus(property)]
   fn flags(&self) -> Vec<String> {
      self.kind.flags().iter().map(|f| (*f).to_string()).collect()
   }
}
