//! BlueZ test harness.
//!
//! Drives a Bluetooth controller through BlueZ, obexd and oFono over D-Bus,
//! and simulates a GATT peripheral for client-side tests. [`Harness`] bundles
//! every controller behind one system-bus connection.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;
use zbus::Connection;

pub mod bluetooth;
pub mod bluez;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;
pub mod media;
pub mod obex;
pub mod telephony;

pub use crate::error::{HarnessError, Result};
use crate::{
   bluetooth::{
      agent::{Agent, AgentCapability, PairingPrompt},
      manager::DeviceManager,
   },
   config::Config,
   event::EventSender,
   gatt::GattServer,
   media::MediaController,
   obex::ObexController,
   telephony::TelephonyController,
};

pub struct Harness {
   config: Config,
   conn: Connection,
   devices: DeviceManager,
   media: MediaController,
   obex: ObexController,
   telephony: TelephonyController,
   gatt: GattServer,
   agent: Mutex<Option<Agent>>,
}

impl Harness {
   /// Connects to the system bus and binds every controller to the
   /// configured adapter.
   pub async fn new(config: Config, event_tx: EventSender) -> Result<Self> {
      let conn = Connection::system().await?;
      let session = bluer::Session::new().await?;

      let devices =
         DeviceManager::new(&session, conn.clone(), &config.adapter, event_tx.clone()).await?;
      let media = MediaController::new(conn.clone(), &config.adapter, &config.media.player);
      let obex = ObexController::new(config.obex.clone(), event_tx.clone());
      let telephony = TelephonyController::new(conn.clone(), event_tx.clone());
      let gatt = GattServer::new(
         conn.clone(),
         &config.adapter,
         config.peripheral.clone(),
         event_tx,
      );

      info!("Harness ready on adapter {}", config.adapter);
      Ok(Self {
         config,
         conn,
         devices,
         media,
         obex,
         telephony,
         gatt,
         agent: Mutex::new(None),
      })
   }

   pub const fn config(&self) -> &Config {
      &self.config
   }

   pub const fn connection(&self) -> &Connection {
      &self.conn
   }

   pub const fn devices(&self) -> &DeviceManager {
      &self.devices
   }

   pub const fn media(&self) -> &MediaController {
      &self.media
   }

   pub const fn obex(&self) -> &ObexController {
      &self.obex
   }

   pub const fn telephony(&self) -> &TelephonyController {
      &self.telephony
   }

   pub const fn gatt(&self) -> &GattServer {
      &self.gatt
   }

   /// Registers the pairing agent, replacing a previous one. Without an
   /// explicit capability the configured one is used.
   pub async fn register_agent(
      &self,
      capability: Option<AgentCapability>,
      prompt: Arc<dyn PairingPrompt>,
   ) -> Result<AgentCapability> {
      let capability = capability.unwrap_or(self.config.agent_capability);
      let mut agent = self.agent.lock().await;
      if let Some(previous) = agent.take()
         && let Err(e) = previous.unregister().await
      {
         warn!("Failed to unregister previous agent: {e}");
      }
      *agent = Some(Agent::register(&self.conn, capability, prompt).await?);
      Ok(capability)
   }

   pub async fn unregister_agent(&self) -> Result<()> {
      match self.agent.lock().await.take() {
         Some(agent) => agent.unregister().await,
         None => {
            info!("No agent registered.");
            Ok(())
         },
      }
   }

   /// Tears down everything the harness started.
   pub async fn shutdown(&self) {
      if let Err(e) = self.gatt.stop_gatt_server().await {
         warn!("Failed to stop GATT server: {e}");
      }
      if let Err(e) = self.gatt.stop_advertising().await {
         warn!("Failed to stop advertising: {e}");
      }
      self.media.stop_a2dp_stream();
      self.obex.stop_receiver().await;
      self.telephony.shutdown();
      if let Err(e) = self.devices.stop_discovery().await {
         warn!("Failed to stop discovery: {e}");
      }
      self.devices.shutdown();
      if let Err(e) = self.unregister_agent().await {
         warn!("Failed to unregister agent: {e}");
      }
   }
}
