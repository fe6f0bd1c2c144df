//! Simulated GATT peripheral.
//!
//! Services are exported as D-Bus objects below the application path and
//! registered with BlueZ through GattManager1; an LE advertisement announces
//! the peripheral. Notifications run on tokio timers.

pub mod advertisement;
pub mod layout;
pub mod objects;
pub mod sensor;

use std::{collections::HashMap, sync::Arc};

use log::{error, info, warn};
use smol_str::SmolStr;
use tokio::sync::Mutex;
use uuid::Uuid;
use zbus::{Connection, fdo::ObjectManager, proxy::CacheProperties, zvariant::ObjectPath};

use crate::{
   bluez::{
      ADVERTISEMENT_PATH, GATT_APPLICATION_PATH, paths,
      proxies::{GattManager1Proxy, LEAdvertisingManager1Proxy},
   },
   config::PeripheralConfig,
   error::{HarnessError, Result},
   event::EventSender,
};
use self::{
   advertisement::LeAdvertisement,
   layout::{ServiceLayout, SimulatedService},
   objects::{GattCharacteristic, GattDescriptor, GattService},
   sensor::SensorState,
};

#[derive(Default)]
struct ServerState {
   services: Vec<ServiceLayout>,
   registered: bool,
   advertising: bool,
}

pub struct GattServer {
   conn: Connection,
   adapter: SmolStr,
   config: PeripheralConfig,
   sensors: Arc<SensorState>,
   event_tx: EventSender,
   state: Mutex<ServerState>,
}

impl GattServer {
   pub fn new(conn: Connection, adapter: &str, config: PeripheralConfig, event_tx: EventSender) -> Self {
      Self {
         conn,
         adapter: adapter.into(),
         config,
         sensors: Arc::new(SensorState::default()),
         event_tx,
         state: Mutex::new(ServerState::default()),
      }
   }

   /// Values clients have written so far.
   pub fn sensors(&self) -> &SensorState {
      &self.sensors
   }

   pub async fn is_running(&self) -> bool {
      self.state.lock().await.registered
   }

   pub async fn is_advertising(&self) -> bool {
      self.state.lock().await.advertising
   }

   /// Layouts of the exported services, in registration order.
   pub async fn services(&self) -> Vec<ServiceLayout> {
      self.state.lock().await.services.clone()
   }

   async fn gatt_manager(&self) -> Result<GattManager1Proxy<'static>> {
      Ok(GattManager1Proxy::builder(&self.conn)
         .path(paths::adapter_path(&self.adapter))?
         .cache_properties(CacheProperties::No)
         .build()
         .await?)
   }

   async fn advertising_manager(&self) -> Result<LEAdvertisingManager1Proxy<'static>> {
      Ok(LEAdvertisingManager1Proxy::builder(&self.conn)
         .path(paths::adapter_path(&self.adapter))?
         .cache_properties(CacheProperties::No)
         .build()
         .await?)
   }

   /// Adds the service named by `service_name` and (re-)registers the
   /// application with BlueZ.
   ///
   /// When registration fails the new service is unexported and the
   /// previous services are registered again; if that fails too, the whole
   /// server is torn down.
   pub async fn create_gatt_server(&self, service_name: &str) -> Result<ServiceLayout> {
      let Some(service) = SimulatedService::from_name(service_name) else {
         error!("Unknown service: {service_name}");
         return Err(HarnessError::UnknownService(service_name.to_string()));
      };

      let mut state = self.state.lock().await;
      self
         .conn
         .object_server()
         .at(GATT_APPLICATION_PATH, ObjectManager)
         .await?;

      let layout = service.layout(state.services.len());
      if let Err(e) = self.export(&layout).await {
         error!("Failed to export {service}: {e}");
         self.unexport(&layout).await;
         if state.services.is_empty() {
            self.teardown(&mut state).await;
         }
         return Err(e);
      }

      state.services.push(layout.clone());
      let Err(e) = self.register_application(&mut state).await else {
         info!("GATT application registered with {service}");
         return Ok(layout);
      };
      error!("Failed to register application: {e}");
      state.services.pop();
      self.unexport(&layout).await;

      let restored = if state.services.is_empty() {
         false
      } else {
         match self.register_application(&mut state).await {
            Ok(()) => {
               info!("Previous GATT services registered again");
               true
            },
            Err(e) => {
               error!("Failed to restore previous GATT services: {e}");
               false
            },
         }
      };
      if !restored {
         self.teardown(&mut state).await;
      }
      Err(e)
   }

   /// Registers the application, unregistering it first when live.
   async fn register_application(&self, state: &mut ServerState) -> Result<()> {
      let manager = self.gatt_manager().await?;
      let app = ObjectPath::from_static_str_unchecked(GATT_APPLICATION_PATH);
      if state.registered {
         // BlueZ reads the object tree only at registration
         if let Err(e) = manager.unregister_application(&app).await {
            warn!("Failed to unregister application before update: {e}");
         }
         state.registered = false;
      }
      manager.register_application(&app, HashMap::new()).await?;
      state.registered = true;
      Ok(())
   }

   /// Removes every exported service and the application's ObjectManager.
   async fn teardown(&self, state: &mut ServerState) {
      for layout in std::mem::take(&mut state.services) {
         self.unexport(&layout).await;
      }
      if let Err(e) = self
         .conn
         .object_server()
         .remove::<ObjectManager, _>(GATT_APPLICATION_PATH)
         .await
      {
         warn!("Failed removing application object: {e}");
      }
   }

   async fn export(&self, layout: &ServiceLayout) -> Result<()> {
      let server = self.conn.object_server();
      server
         .at(
            layout.path.as_str(),
            GattService::new(layout.service.uuid(), &layout.characteristics)?,
         )
         .await?;
      for chr in &layout.characteristics {
         let object = GattCharacteristic::new(
            chr,
            &layout.path,
            self.sensors.clone(),
            self.event_tx.clone(),
         )?;
         server.at(chr.path.as_str(), object).await?;
         if let Some(desc) = &chr.descriptor {
            server
               .at(desc.path.as_str(), GattDescriptor::new(desc, chr)?)
               .await?;
         }
      }
      Ok(())
   }

   /// Stops notifications and removes every object of `layout`.
   async fn unexport(&self, layout: &ServiceLayout) {
      let server = self.conn.object_server();
      for chr in &layout.characteristics {
         if let Ok(iface) = server
            .interface::<_, GattCharacteristic>(chr.path.as_str())
            .await
         {
            iface.get_mut().await.stop_notifications();
         }
         if let Some(desc) = &chr.descriptor
            && let Err(e) = server.remove::<GattDescriptor, _>(desc.path.as_str()).await
         {
            warn!("Failed removing descriptor {}: {e}", desc.path);
         }
         if let Err(e) = server.remove::<GattCharacteristic, _>(chr.path.as_str()).await {
            warn!("Failed removing characteristic {}: {e}", chr.path);
         }
      }
      if let Err(e) = server.remove::<GattService, _>(layout.path.as_str()).await {
         warn!("Failed removing service {}: {e}", layout.path);
      }
   }

   /// Exports and registers the advertisement for `service_uuid`.
   pub async fn start_advertising(&self, service_uuid: Uuid) -> Result<()> {
      let mut state = self.state.lock().await;
      if state.advertising {
         info!("Advertising already running.");
         return Ok(());
      }

      let server = self.conn.object_server();
      let _ = server.remove::<LeAdvertisement, _>(ADVERTISEMENT_PATH).await;
      server
         .at(
            ADVERTISEMENT_PATH,
            LeAdvertisement::new(&self.config, service_uuid),
         )
         .await?;

      let path = ObjectPath::from_static_str_unchecked(ADVERTISEMENT_PATH);
      let registered = match self.advertising_manager().await {
         Ok(manager) => manager
            .register_advertisement(&path, HashMap::new())
            .await
            .map_err(HarnessError::from),
         Err(e) => Err(e),
      };
      if let Err(e) = registered {
         error!("Failed to register advertisement: {e}");
         let _ = server.remove::<LeAdvertisement, _>(ADVERTISEMENT_PATH).await;
         return Err(e);
      }

      state.advertising = true;
      info!("Advertisement registered");
      Ok(())
   }

   pub async fn stop_advertising(&self) -> Result<()> {
      let mut state = self.state.lock().await;
      self.stop_advertising_locked(&mut state).await;
      Ok(())
   }

   async fn stop_advertising_locked(&self, state: &mut ServerState) {
      if !state.advertising {
         info!("Advertising is already stopped.");
         return;
      }
      state.advertising = false;

      let path = ObjectPath::from_static_str_unchecked(ADVERTISEMENT_PATH);
      match self.advertising_manager().await {
         Ok(manager) => match manager.unregister_advertisement(&path).await {
            Ok(()) => info!("Advertisement stopped successfully."),
            Err(e) => error!("Failed to stop advertisement: {e}"),
         },
         Err(e) => warn!("Error unregistering advertisement: {e}"),
      }

      // Removed even when unregistering failed
      if let Err(e) = self
         .conn
         .object_server()
         .remove::<LeAdvertisement, _>(ADVERTISEMENT_PATH)
         .await
      {
         warn!("Error removing advertisement object: {e}");
      }
   }

   /// Stops notifications and advertising, unregisters the application and
   /// removes every exported object.
   pub async fn stop_gatt_server(&self) -> Result<()> {
      let mut state = self.state.lock().await;
      if !state.registered && state.services.is_empty() {
         info!("Server is already stopped.");
         return Ok(());
      }

      self.stop_advertising_locked(&mut state).await;

      if state.registered {
         let app = ObjectPath::from_static_str_unchecked(GATT_APPLICATION_PATH);
         match self.gatt_manager().await {
            Ok(manager) => match manager.unregister_application(&app).await {
               Ok(()) => info!("GATT application unregistered."),
               Err(e) => error!("Failed to unregister application: {e}"),
            },
            Err(e) => warn!("Error unregistering application: {e}"),
         }
         state.registered = false;
      }

      self.teardown(&mut state).await;
      Ok(())
   }
}
