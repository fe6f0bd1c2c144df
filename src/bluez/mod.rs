//! BlueZ, obexd and oFono object model.
//!
//! Well-known bus names, interface names, the object paths the harness
//! exports, profile UUIDs, path derivation and the zbus proxies for every
//! interface `bluer` does not wrap.

pub mod paths;
pub mod proxies;

use std::collections::HashMap;

use uuid::Uuid;
use zbus::zvariant::{OwnedValue, Value};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_PATH: &str = "/org/bluez";
pub const OBEX_SERVICE: &str = "org.bluez.obex";
pub const OBEX_PATH: &str = "/org/bluez/obex";
pub const OFONO_SERVICE: &str = "org.ofono";

pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const MEDIA_CONTROL_INTERFACE: &str = "org.bluez.MediaControl1";
pub const MEDIA_PLAYER_INTERFACE: &str = "org.bluez.MediaPlayer1";
pub const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Where the pairing agent is exported.
pub const AGENT_PATH: &str = "/test/agent";
/// Root of the simulated GATT application.
pub const GATT_APPLICATION_PATH: &str = "/org/test/gatt/application";
/// Where the LE advertisement is exported.
pub const ADVERTISEMENT_PATH: &str = "/org/bluez/example/advertisement";

/// Expands a 16-bit SIG-assigned number onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
   Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

pub const A2DP_SOURCE_UUID: Uuid = sig_uuid(0x110a);
pub const A2DP_SINK_UUID: Uuid = sig_uuid(0x110b);
pub const OPP_UUID: Uuid = sig_uuid(0x1105);
pub const HFP_HF_UUID: Uuid = sig_uuid(0x111e);
pub const HFP_AG_UUID: Uuid = sig_uuid(0x111f);

/// Profiles a test may ask for by name.
pub const PROFILE_UUIDS: &[(&str, Uuid)] = &[
   ("A2DP Sink", A2DP_SINK_UUID),
   ("A2DP Source", A2DP_SOURCE_UUID),
   ("OPP", OPP_UUID),
   ("HFP AG", HFP_AG_UUID),
   ("HFP HF", HFP_HF_UUID),
];

/// Looks up a profile UUID by its human name (case-insensitive).
pub fn profile_uuid(name: &str) -> Option<Uuid> {
   PROFILE_UUIDS
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, uuid)| *uuid)
}

/// Removes `key` from a property map and converts it, `None` when absent or
/// of another type.
pub fn take_property<T>(properties: &mut HashMap<String, OwnedValue>, key: &str) -> Option<T>
where
   T: TryFrom<Value<'static>>,
{
   properties
      .remove(key)
      .and_then(|value| T::try_from(Value::from(value)).ok())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_take_property() {
      let mut props = HashMap::from([
         ("Name".to_string(), OwnedValue::try_from(Value::from("Phone")).unwrap()),
         ("Connected".to_string(), OwnedValue::try_from(Value::from(true)).unwrap()),
      ]);
      assert_eq!(take_property::<bool>(&mut props, "Connected"), Some(true));
      assert_eq!(take_property::<u32>(&mut props, "Name"), None);
      assert_eq!(take_property::<String>(&mut props, "Missing"), None);
      assert!(props.is_empty());
   }

   #[test]
   fn test_sig_uuid_expansion() {
      assert_eq!(
         sig_uuid(0x180f).to_string(),
         "0000180f-0000-1000-8000-00805f9b34fb"
      );
      assert_eq!(
         A2DP_SINK_UUID.to_string(),
         "0000110b-0000-1000-8000-00805f9b34fb"
      );
   }

   #[test]
   fn test_profile_lookup() {
      assert_eq!(profile_uuid("OPP"), Some(OPP_UUID));
      assert_eq!(profile_uuid("a2dp source"), Some(A2DP_SOURCE_UUID));
      assert_eq!(profile_uuid("HSP"), None);
   }
}
