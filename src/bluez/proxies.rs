//! zbus proxies for the interfaces `bluer` does not cover.
//!
//! BlueZ media and registration managers on the system bus, obexd on the
//! session bus, and oFono's HFP objects.

use std::collections::HashMap;

use zbus::{
   proxy,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

/// `{ object_path: { interface: { property: value } } }`
pub type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

// === BlueZ ===

#[proxy(
   interface = "org.freedesktop.DBus.ObjectManager",
   default_service = "org.bluez",
   default_path = "/"
)]
pub trait BluezObjectManager {
   fn get_managed_objects(&self) -> zbus::Result<ManagedObjects>;
}

#[proxy(
   interface = "org.bluez.AgentManager1",
   default_service = "org.bluez",
   default_path = "/org/bluez"
)]
pub trait AgentManager1 {
   fn register_agent(&self, agent: &ObjectPath<'_>, capability: &str) -> zbus::Result<()>;

   fn request_default_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;

   fn unregister_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// AVRCP remote control of a connected device.
#[proxy(interface = "org.bluez.MediaControl1", default_service = "org.bluez")]
pub trait MediaControl1 {
   fn play(&self) -> zbus::Result<()>;
   fn pause(&self) -> zbus::Result<()>;
   fn stop(&self) -> zbus::Result<()>;
   fn next(&self) -> zbus::Result<()>;
   fn previous(&self) -> zbus::Result<()>;
   fn volume_up(&self) -> zbus::Result<()>;
   fn volume_down(&self) -> zbus::Result<()>;
   fn fast_forward(&self) -> zbus::Result<()>;
   fn rewind(&self) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.MediaPlayer1", default_service = "org.bluez")]
pub trait MediaPlayer1 {
   /// "playing", "stopped", "paused", "forward-seek", "reverse-seek" or "error".
   #[zbus(property)]
   fn status(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn track(&self) -> zbus::Result<HashMap<String, OwnedValue>>;

   /// Playback position in milliseconds.
   #[zbus(property)]
   fn position(&self) -> zbus::Result<u32>;
}

#[proxy(interface = "org.bluez.MediaTransport1", default_service = "org.bluez")]
pub trait MediaTransport1 {
   /// A2DP volume, 0..=127.
   #[zbus(property)]
   fn volume(&self) -> zbus::Result<u16>;

   #[zbus(property)]
   fn set_volume(&self, volume: u16) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.GattManager1", default_service = "org.bluez")]
pub trait GattManager1 {
   fn register_application(
      &self,
      application: &ObjectPath<'_>,
      options: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.LEAdvertisingManager1", default_service = "org.bluez")]
pub trait LEAdvertisingManager1 {
   fn register_advertisement(
      &self,
      advertisement: &ObjectPath<'_>,
      options: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_advertisement(&self, advertisement: &ObjectPath<'_>) -> zbus::Result<()>;
}

// === obexd (session bus) ===

#[proxy(
   interface = "org.bluez.obex.Client1",
   default_service = "org.bluez.obex",
   default_path = "/org/bluez/obex"
)]
pub trait ObexClient1 {
   fn create_session(
      &self,
      destination: &str,
      args: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<OwnedObjectPath>;

   fn remove_session(&self, session: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.obex.ObjectPush1", default_service = "org.bluez.obex")]
pub trait ObjectPush1 {
   fn send_file(
      &self,
      sourcefile: &str,
   ) -> zbus::Result<(OwnedObjectPath, HashMap<String, OwnedValue>)>;
}

#[proxy(interface = "org.bluez.obex.Transfer1", default_service = "org.bluez.obex")]
pub trait Transfer1 {
   /// "queued", "active", "suspended", "complete" or "error".
   #[zbus(property)]
   fn status(&self) -> zbus::Result<String>;

   fn cancel(&self) -> zbus::Result<()>;
}

// === oFono ===

#[proxy(interface = "org.ofono.Manager", default_service = "org.ofono", default_path = "/")]
pub trait OfonoManager {
   fn get_modems(&self) -> zbus::Result<Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)>>;
}

#[proxy(interface = "org.ofono.VoiceCallManager", default_service = "org.ofono")]
pub trait VoiceCallManager {
   fn dial(&self, number: &str, hide_callerid: &str) -> zbus::Result<OwnedObjectPath>;

   fn dial_last(&self) -> zbus::Result<()>;

   fn hangup_all(&self) -> zbus::Result<()>;

   fn get_calls(&self) -> zbus::Result<Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)>>;

   fn create_multiparty(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

   fn hangup_multiparty(&self) -> zbus::Result<()>;

   fn private_chat(&self, call: &ObjectPath<'_>) -> zbus::Result<Vec<OwnedObjectPath>>;

   fn hold_and_answer(&self) -> zbus::Result<()>;

   fn release_and_answer(&self) -> zbus::Result<()>;

   fn release_and_swap(&self) -> zbus::Result<()>;

   fn swap_calls(&self) -> zbus::Result<()>;

   fn transfer(&self) -> zbus::Result<()>;

   fn send_tones(&self, tones: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   fn call_added(
      &self,
      path: OwnedObjectPath,
      properties: HashMap<String, OwnedValue>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   fn call_removed(&self, path: OwnedObjectPath) -> zbus::Result<()>;
}

#[proxy(interface = "org.ofono.VoiceCall", default_service = "org.ofono")]
pub trait VoiceCall {
   fn answer(&self) -> zbus::Result<()>;

   fn hangup(&self) -> zbus::Result<()>;

   #[zbus(signal)]
   fn property_changed(&self, name: String, value: OwnedValue) -> zbus::Result<()>;
}

#[proxy(interface = "org.ofono.CallVolume", default_service = "org.ofono")]
pub trait CallVolume {
   fn set_property(&self, property: &str, value: Value<'_>) -> zbus::Result<()>;

   fn get_properties(&self) -> zbus::Result<HashMap<String, OwnedValue>>;
}
