//! Object path derivation.
//!
//! BlueZ names device objects after the adapter and the device address;
//! the simulated GATT tree is laid out below the application path with
//! indexed services, characteristics and descriptors.

use std::str::FromStr;

use bluer::Address;
use smol_str::SmolStr;

use crate::bluez::{BLUEZ_PATH, GATT_APPLICATION_PATH};

/// `/org/bluez/hci0`
pub fn adapter_path(adapter: &str) -> String {
   format!("{BLUEZ_PATH}/{adapter}")
}

/// `AA:BB:CC:DD:EE:FF` -> `AA_BB_CC_DD_EE_FF`
pub fn formatted_address(address: Address) -> SmolStr {
   // Display already renders upper-case hex
   address.to_string().replace(':', "_").into()
}

/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`
pub fn device_path(adapter: &str, address: Address) -> String {
   format!("{}/dev_{}", adapter_path(adapter), formatted_address(address))
}

/// Recovers the address from a device object path.
pub fn address_from_device_path(path: &str) -> Option<Address> {
   let (_, tail) = path.rsplit_once("dev_")?;
   // Child objects (players, transports) hang below the device
   let tail = tail.split('/').next()?;
   Address::from_str(&tail.replace('_', ":")).ok()
}

/// Whether `path` is an object of `address` on `adapter`.
pub fn belongs_to_device(path: &str, adapter: &str, address: Address) -> bool {
   path.starts_with(&adapter_path(adapter)) && path.contains(formatted_address(address).as_str())
}

/// `{application}/service{index}`, or `ht_service{index}` for thermometers.
pub fn service_path(index: usize, thermometer: bool) -> String {
   if thermometer {
      format!("{GATT_APPLICATION_PATH}/ht_service{index}")
   } else {
      format!("{GATT_APPLICATION_PATH}/service{index}")
   }
}

pub fn characteristic_path(service: &str, index: usize) -> String {
   format!("{service}/char{index}")
}

pub fn descriptor_path(characteristic: &str, index: usize) -> String {
   format!("{characteristic}/desc{index}")
}

#[cfg(test)]
mod tests {
   use super::*;

   fn addr() -> Address {
      Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13])
   }

   #[test]
   fn test_device_path() {
      assert_eq!(
         device_path("hci0", addr()),
         "/org/bluez/hci0/dev_00_1A_7D_DA_71_13"
      );
      assert_eq!(formatted_address(addr()), "00_1A_7D_DA_71_13");
   }

   #[test]
   fn test_address_from_device_path() {
      assert_eq!(
         address_from_device_path("/org/bluez/hci0/dev_00_1A_7D_DA_71_13"),
         Some(addr())
      );
      assert_eq!(
         address_from_device_path("/org/bluez/hci1/dev_00_1A_7D_DA_71_13/player0"),
         Some(addr())
      );
      assert_eq!(address_from_device_path("/org/bluez/hci0"), None);
      assert_eq!(address_from_device_path("/org/bluez/hci0/dev_garbage"), None);
   }

   #[test]
   fn test_belongs_to_device() {
      let fd = "/org/bluez/hci0/dev_00_1A_7D_DA_71_13/fd3";
      assert!(belongs_to_device(fd, "hci0", addr()));
      assert!(!belongs_to_device(fd, "hci1", addr()));
      assert!(!belongs_to_device(fd, "hci0", Address::any()));
   }

   #[test]
   fn test_gatt_paths() {
      let svc = service_path(1, false);
      assert_eq!(svc, "/org/test/gatt/application/service1");
      assert_eq!(
         service_path(0, true),
         "/org/test/gatt/application/ht_service0"
      );
      let chr = characteristic_path(&svc, 2);
      assert_eq!(chr, "/org/test/gatt/application/service1/char2");
      assert_eq!(
         descriptor_path(&chr, 0),
         "/org/test/gatt/application/service1/char2/desc0"
      );
   }
}
