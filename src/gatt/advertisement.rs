use log::info;
use uuid::Uuid;
use zbus::interface;

use crate::config::PeripheralConfig;

/// Exported `org.bluez.LEAdvertisement1` for the simulated peripheral.
pub struct LeAdvertisement {
   local_name: String,
   service_uuids: Vec<Uuid>,
   include_tx_power: bool,
}

impl LeAdvertisement {
   pub fn new(config: &PeripheralConfig, service_uuid: Uuid) -> Self {
      Self {
         local_name: config.local_name.clone(),
         service_uuids: vec![service_uuid],
         include_tx_power: config.include_tx_power,
      }
   }
}

#[interface(name = "org.bluez.LEAdvertisement1")]
impl LeAdvertisement {
   fn release(&self) {
      info!("Advertisement released");
   }

   #[zbus(property, name = "Type")]
   fn advertisement_type(&self) -> String {
      "peripheral".to_string()
   }

   #[zbus(property)]
   fn local_name(&self) -> String {
      self.local_name.clone()
   }

   #[zbus(property, name = "ServiceUUIDs")]
   fn service_uuids(&self) -> Vec<String> {
      self.service_uuids.iter().map(Uuid::to_string).collect()
   }

   #[zbus(property)]
   fn include_tx_power(&self) -> bool {
      self.include_tx_power
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::gatt::layout::BATTERY_SERVICE_UUID;

   #[test]
   fn test_advertised_properties() {
      let adv = LeAdvertisement::new(&PeripheralConfig::default(), BATTERY_SERVICE_UUID);
      assert_eq!(adv.advertisement_type(), "peripheral");
      assert_eq!(adv.local_name(), "GATT_Test_Server");
      assert_eq!(
         adv.service_uuids(),
         vec!["0000180f-0000-1000-8000-00805f9b34fb".to_string()]
      );
      assert!(adv.include_tx_power());
   }
}
