//! Bluetooth device manager.
//!
//! This module drives one BlueZ adapter: discovery, pairing, connection
//! lifecycle, profile connection and device property queries.

use std::{
   collections::{BTreeMap, HashMap},
   str::FromStr,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind,
   InternalErrorKind, Session,
};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};
use uuid::Uuid;
use zbus::{Connection, MatchRule, Message, MessageStream, zvariant::OwnedValue};

use crate::{
   bluez::{BLUEZ_SERVICE, DEVICE_INTERFACE, PROPERTIES_INTERFACE, paths},
   error::{HarnessError, Result},
   event::{EventSender, HarnessEvent},
};

/// Time BlueZ gets to drop a removed device object
const UNPAIR_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
   AlreadyPaired,
   Paired,
   /// `Pair()` timed out or returned before bonding finished; the pairing
   /// may still complete in the background.
   Pending,
}

/// Transport restriction for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
   Auto,
   #[strum(serialize = "bredr", serialize = "br/edr")]
   BrEdr,
   Le,
}

impl From<Transport> for DiscoveryTransport {
   fn from(value: Transport) -> Self {
      match value {
         Transport::Auto => Self::Auto,
         Transport::BrEdr => Self::BrEdr,
         Transport::Le => Self::Le,
      }
   }
}

/// Discovery filter for `transport` with every other field left to BlueZ.
pub fn discovery_filter(transport: Transport) -> DiscoveryFilter {
   let mut filter = DiscoveryFilter::default();
   filter.transport = transport.into();
   filter
}

/// A device known to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub path: String,
   pub address: Address,
   pub alias: SmolStr,
}

impl DiscoveredDevice {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "path": self.path,
          "address": self.address.to_string(),
          "alias": self.alias.as_str(),
      })
   }
}

/// Manages devices of a single adapter.
pub struct DeviceManager {
   adapter: Adapter,
   conn: Connection,
   event_tx: EventSender,
   discovery: Mutex<Option<JoinHandle<()>>>,
   pairing_watch: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
   pub async fn new(
      session: &Session,
      conn: Connection,
      adapter_name: &str,
      event_tx: EventSender,
   ) -> Result<Self> {
      let adapter = session.adapter(adapter_name)?;
      info!("Initializing adapter: {adapter_name}");

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         match adapter.set_powered(true).await {
            Ok(()) => info!("Powered on adapter: {adapter_name}"),
            Err(e) => warn!("Failed to power on adapter {adapter_name}: {e}"),
         }
      }

      Ok(Self {
         adapter,
         conn,
         event_tx,
         discovery: Mutex::new(None),
         pairing_watch: Mutex::new(None),
      })
   }

   pub fn adapter_name(&self) -> &str {
      self.adapter.name()
   }

   /// D-Bus object path of a device on this adapter.
   pub fn device_path(&self, address: Address) -> String {
      paths::device_path(self.adapter.name(), address)
   }

   // === Queries ===

   /// Paired devices as address -> name.
   pub async fn paired_devices(&self) -> Result<BTreeMap<Address, SmolStr>> {
      let mut paired = BTreeMap::new();
      for addr in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_paired().await.unwrap_or(false) {
            paired.insert(addr, device_name(&device).await);
         }
      }
      Ok(paired)
   }

   /// Connected devices as address -> name.
   pub async fn connected_devices(&self) -> Result<BTreeMap<Address, SmolStr>> {
      let mut connected = BTreeMap::new();
      for addr in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_connected().await.unwrap_or(false) {
            connected.insert(addr, device_name(&device).await);
         }
      }
      Ok(connected)
   }

   /// Every device object BlueZ holds for this adapter.
   pub async fn discovered_devices(&self) -> Result<Vec<DiscoveredDevice>> {
      let mut devices = Vec::new();
      for address in self.adapter.device_addresses().await? {
         let alias = match self.adapter.device(address) {
            Ok(device) => device.alias().await.ok(),
            Err(e) => {
               warn!("Failed to extract device info for {address}: {e}");
               continue;
            },
         };
         devices.push(DiscoveredDevice {
            path: self.device_path(address),
            address,
            alias: alias.map_or_else(|| SmolStr::new_static("Unknown"), SmolStr::from),
         });
      }
      Ok(devices)
   }

   /// Reads `Paired`; failures read as `false`.
   pub async fn is_paired(&self, address: Address) -> bool {
      let paired = match self.adapter.device(address) {
         Ok(device) => device.is_paired().await,
         Err(e) => Err(e),
      };
      paired.unwrap_or_else(|e| {
         debug!("Error while checking pairing of {address}: {e}");
         false
      })
   }

   /// Reads `Connected`; failures read as `false`.
   pub async fn is_connected(&self, address: Address) -> bool {
      let connected = match self.adapter.device(address) {
         Ok(device) => device.is_connected().await,
         Err(e) => Err(e),
      };
      connected.unwrap_or_else(|e| {
         debug!("Error while checking connection of {address}: {e}");
         false
      })
   }

   /// Service UUIDs the device advertises; empty when unavailable.
   pub async fn connected_profile_uuids(&self, address: Address) -> Vec<Uuid> {
      let uuids = match self.adapter.device(address) {
         Ok(device) => device.uuids().await,
         Err(e) => Err(e),
      };
      match uuids {
         Ok(uuids) => {
            let mut uuids: Vec<_> = uuids.unwrap_or_default().into_iter().collect();
            uuids.sort();
            uuids
         },
         Err(e) => {
            info!("Failed to get UUIDs for {address}: {e}");
            Vec::new()
         },
      }
   }

   // === Discovery ===

   /// Starts a discovery session unless the adapter is already discovering.
   ///
   /// The session lasts until [`Self::stop_discovery`]; devices found in the
   /// meantime are emitted as [`HarnessEvent::DeviceFound`].
   pub async fn start_discovery(&self) -> Result<()> {
      if self.adapter.is_discovering().await? {
         info!("Discovery already in progress.");
         return Ok(());
      }
      self.spawn_discovery().await?;
      info!("Discovery started.");
      Ok(())
   }

   /// Opens a discovery session with the current filter and forwards found
   /// devices until the returned task is aborted.
   async fn spawn_discovery(&self) -> Result<()> {
      let events = self.adapter.discover_devices().await?;
      let event_tx = self.event_tx.clone();
      let name = SmolStr::from(self.adapter.name());
      let handle = tokio::spawn(async move {
         let mut events = Box::pin(events);
         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
               debug!("Device found on {name}: {addr}");
               event_tx.emit(HarnessEvent::DeviceFound(addr));
            }
         }
      });

      if let Some(previous) = self.discovery.lock().replace(handle) {
         previous.abort();
      }
      Ok(())
   }

   /// Ends the discovery session started by this manager.
   pub async fn stop_discovery(&self) -> Result<()> {
      let handle = self.discovery.lock().take();
      match handle {
         Some(handle) => {
            // Dropping the event stream releases the discovery session
            handle.abort();
            info!("Discovery stopped.");
         },
         None if self.adapter.is_discovering().await? => {
            info!("Discovery is running but was not started by this harness.");
         },
         None => info!("Discovery is not running."),
      }
      Ok(())
   }

   /// Restricts discovery to `transport`.
   ///
   /// BlueZ applies a filter when a session starts, so a session this
   /// manager owns is closed and reopened under the new filter.
   pub async fn set_discovery_filter(&self, transport: Transport) -> Result<()> {
      let running = self.discovery.lock().take();
      let restart = running.is_some();
      if let Some(handle) = running {
         handle.abort();
         // Wait for the event stream to drop so the old session is released
         let _ = handle.await;
      }

      self.adapter.set_discovery_filter(discovery_filter(transport)).await?;
      info!("Discovery filter set: {transport}");

      if restart {
         self.spawn_discovery().await?;
         info!("Discovery restarted with the new filter.");
      }
      Ok(())
   }

   pub async fn set_discoverable(&self, enable: bool) -> Result<()> {
      self.adapter.set_discoverable(enable).await?;
      if enable {
         info!("Bluetooth device is now discoverable.");
      } else {
         info!("Bluetooth device is now non-discoverable.");
      }
      Ok(())
   }

   // === Lifecycle ===

   pub async fn pair(&self, address: Address) -> Result<PairOutcome> {
      let device = self.adapter.device(address)?;
      if device.is_paired().await? {
         info!("Device {address} is already paired.");
         return Ok(PairOutcome::AlreadyPaired);
      }

      info!("Initiating pairing with {address}");
      if let Err(e) = device.pair().await {
         if is_no_reply(&e) {
            info!("Pair() timed out for {address}, ignoring as pairing may still succeed.");
            return Ok(PairOutcome::Pending);
         }
         error!("Pairing failed with {address}: {e}");
         return Err(e.into());
      }

      if device.is_paired().await? {
         info!("Successfully paired with {address}");
         Ok(PairOutcome::Paired)
      } else {
         Ok(PairOutcome::Pending)
      }
   }

   /// Connects and reports the resulting `Connected` property.
   pub async fn connect(&self, address: Address) -> Result<bool> {
      let device = self.adapter.device(address)?;
      device.connect().await?;
      let connected = device.is_connected().await?;
      if connected {
         info!("Connection successful to {address}");
      }
      Ok(connected)
   }

   pub async fn disconnect(&self, address: Address) -> Result<()> {
      let device = self.adapter.device(address)?;
      if !device.is_connected().await? {
         info!("Device {address} is already disconnected.");
         return Ok(());
      }
      device.disconnect().await?;
      Ok(())
   }

   pub async fn connect_profile(&self, address: Address, profile: Uuid) -> Result<()> {
      let device = self.adapter.device(address)?;
      device.connect_profile(&profile).await?;
      info!("Profile {profile} successfully connected to {address}");
      Ok(())
   }

   /// Removes the device; absent devices count as unpaired.
   pub async fn unpair(&self, address: Address) -> Result<()> {
      if !self.adapter.device_addresses().await?.contains(&address) {
         info!(
            "Device with address {address} not found on {}",
            self.adapter.name()
         );
         return Ok(());
      }

      self.adapter.remove_device(address).await?;
      info!("Requested unpair of device {address}");
      time::sleep(UNPAIR_SETTLE_DELAY).await;

      if self.adapter.device_addresses().await?.contains(&address) {
         warn!("Device {address} still exists after attempted unpair");
         return Err(HarnessError::DeviceStillPresent(address));
      }
      info!("Device {address} unpaired successfully");
      Ok(())
   }

   // === Signals ===

   /// Emits [`HarnessEvent::PairingChanged`] whenever a device's `Paired`
   /// property changes.
   pub async fn watch_pairing(&self) -> Result<()> {
      let rule = MatchRule::builder()
         .msg_type(zbus::message::Type::Signal)
         .sender(BLUEZ_SERVICE)?
         .interface(PROPERTIES_INTERFACE)?
         .member("PropertiesChanged")?
         .add_arg(DEVICE_INTERFACE)?
         .build();
      let mut stream = MessageStream::for_match_rule(rule, &self.conn, None).await?;

      let event_tx = self.event_tx.clone();
      let handle = tokio::spawn(async move {
         while let Some(msg) = stream.next().await {
            let msg = match msg {
               Ok(msg) => msg,
               Err(e) => {
                  warn!("Error receiving pairing signal: {e}");
                  continue;
               },
            };
            if let Some((address, paired)) = pairing_change(&msg) {
               info!("Pairing state of {address} changed: {paired}");
               event_tx.emit(HarnessEvent::PairingChanged { address, paired });
            }
         }
      });

      if let Some(previous) = self.pairing_watch.lock().replace(handle) {
         previous.abort();
      }
      Ok(())
   }

   pub fn shutdown(&self) {
      if let Some(handle) = self.discovery.lock().take() {
         handle.abort();
      }
      if let Some(handle) = self.pairing_watch.lock().take() {
         handle.abort();
      }
   }
}

impl Drop for DeviceManager {
   fn drop(&mut self) {
      self.shutdown();
   }
}

async fn device_name(device: &bluer::Device) -> SmolStr {
   device
      .name()
      .await
      .ok()
      .flatten()
      .map_or_else(|| SmolStr::new_static("Unknown"), SmolStr::from)
}

/// `Pair()` outliving the D-Bus reply timeout is not a failure.
fn is_no_reply(e: &bluer::Error) -> bool {
   match &e.kind {
      ErrorKind::AuthenticationTimeout => true,
      ErrorKind::Internal(InternalErrorKind::DBus(name)) => name.contains("NoReply"),
      _ => e.message.contains("NoReply"),
   }
}

/// Extracts `(address, paired)` from a Device1 `PropertiesChanged` signal.
fn pairing_change(msg: &Message) -> Option<(Address, bool)> {
   let header = msg.header();
   let path = header.path()?;
   let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
      msg.body().deserialize().ok()?;
   if interface != DEVICE_INTERFACE {
      return None;
   }
   let paired = changed.get("Paired")?.downcast_ref::<bool>().ok()?;
   let address = paths::address_from_device_path(path.as_str())?;
   Some((address, paired))
}

/// Parses a textual address the way test scripts pass them.
pub fn parse_address(address: &str) -> Result<Address> {
   Address::from_str(address.trim())
      .map_err(|e| HarnessError::InvalidArgument(format!("{address}: {e}")))
}

#[cfg(test)]
mod tests {
   use std::collections::HashMap;

   use zbus::zvariant::Value;

   use super::*;

   fn properties_changed(path: &str, interface: &str, key: &str, value: Value<'_>) -> Message {
      let changed: HashMap<&str, Value<'_>> = HashMap::from([(key, value)]);
      let invalidated: Vec<&str> = Vec::new();
      Message::signal(path, PROPERTIES_INTERFACE, "PropertiesChanged")
         .unwrap()
         .build(&(interface, changed, invalidated))
         .unwrap()
   }

   #[test]
   fn test_discovery_filter_sets_transport_only() {
      let filter = discovery_filter(Transport::Le);
      assert_eq!(filter.transport, DiscoveryTransport::Le);
      assert!(filter.uuids.is_empty());
      assert_eq!(filter.rssi, None);
      assert!(!filter.duplicate_data);

      assert_eq!(discovery_filter(Transport::BrEdr).transport, DiscoveryTransport::BrEdr);
      assert_eq!("br/edr".parse::<Transport>().unwrap(), Transport::BrEdr);
   }

   #[test]
   fn test_pairing_change_extracts_address() {
      let msg = properties_changed(
         "/org/bluez/hci0/dev_00_1A_7D_DA_71_13",
         DEVICE_INTERFACE,
         "Paired",
         Value::from(true),
      );
      assert_eq!(
         pairing_change(&msg),
         Some((Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]), true))
      );
   }

   #[test]
   fn test_pairing_change_ignores_other_properties() {
      let msg = properties_changed(
         "/org/bluez/hci0/dev_00_1A_7D_DA_71_13",
         DEVICE_INTERFACE,
         "Connected",
         Value::from(true),
      );
      assert_eq!(pairing_change(&msg), None);

      let msg = properties_changed(
         "/org/bluez/hci0",
         "org.bluez.Adapter1",
         "Paired",
         Value::from(false),
      );
      assert_eq!(pairing_change(&msg), None);
   }

   #[test]
   fn test_transport_names() {
      assert_eq!(Transport::from_str("le").unwrap(), Transport::Le);
      assert_eq!(Transport::from_str("bredr").unwrap(), Transport::BrEdr);
      assert_eq!(Transport::from_str("auto").unwrap(), Transport::Auto);
      assert!(Transport::from_str("usb").is_err());
   }

   #[test]
   fn test_parse_address() {
      assert_eq!(
         parse_address(" 00:1A:7D:DA:71:13 ").unwrap(),
         Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13])
      );
      assert!(matches!(
         parse_address("00:1A:7D"),
         Err(HarnessError::InvalidArgument(_))
      ));
   }

   #[test]
   fn test_no_reply_detection() {
      let timeout = bluer::Error {
         kind: ErrorKind::AuthenticationTimeout,
         message: String::new(),
      };
      assert!(is_no_reply(&timeout));

      let rejected = bluer::Error {
         kind: ErrorKind::AuthenticationRejected,
         message: "Authentication Rejected".into(),
      };
      assert!(!is_no_reply(&rejected));
   }
}
