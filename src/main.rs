//! Command line front end of the BlueZ test harness.
//!
//! Lists devices, runs the simulated GATT peripheral, or answers pairing
//! requests with an auto-accepting agent.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::json;
use tokio::signal;

use btharness::{
   Harness, Result,
   bluetooth::agent::{AgentCapability, AutoAccept},
   config::Config,
   event::EventQueue,
};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
   /// Adapter to drive, overriding the configuration
   #[arg(short, long)]
   adapter: Option<String>,

   #[command(subcommand)]
   command: Command,
}

#[derive(Subcommand)]
enum Command {
   /// Print paired, connected and known devices as JSON
   Devices,
   /// Serve simulated GATT services and advertise until Ctrl-C
   Peripheral {
      /// e.g. "Battery Service", "Health Thermometer Service"
      #[arg(short, long = "service", required = true)]
      services: Vec<String>,
   },
   /// Register an auto-accepting pairing agent until Ctrl-C
   Agent {
      #[arg(short, long)]
      capability: Option<AgentCapability>,
   },
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let cli = Cli::parse();
   let mut config = Config::load()?;
   if let Some(adapter) = cli.adapter {
      config.adapter = adapter;
   }

   let events = EventQueue::new();
   let harness = Harness::new(config, events.clone()).await?;

   let event_log = tokio::spawn({
      let events = events.clone();
      async move {
         while let Some(event) = events.recv().await {
            info!("Event: {event:?}");
         }
      }
   });

   let result = match cli.command {
      Command::Devices => print_devices(&harness).await,
      Command::Peripheral { services } => run_peripheral(&harness, &services).await,
      Command::Agent { capability } => run_agent(&harness, capability).await,
   };

   events.close();
   if let Err(e) = event_log.await {
      error!("Event logger failed: {e}");
   }
   result
}

async fn print_devices(harness: &Harness) -> Result<()> {
   let devices = harness.devices();
   let as_json = |map: std::collections::BTreeMap<bluer::Address, smol_str::SmolStr>| {
      map.into_iter()
         .map(|(addr, name)| (addr.to_string(), json!(name.as_str())))
         .collect::<serde_json::Map<_, _>>()
   };

   let report = json!({
       "adapter": devices.adapter_name(),
       "paired": as_json(devices.paired_devices().await?),
       "connected": as_json(devices.connected_devices().await?),
       "known": devices
          .discovered_devices()
          .await?
          .iter()
          .map(|d| d.to_json())
          .collect::<Vec<_>>(),
   });
   println!("{report:#}");
   Ok(())
}

async fn run_peripheral(harness: &Harness, services: &[String]) -> Result<()> {
   let gatt = harness.gatt();
   let mut first_uuid = None;
   for name in services {
      let layout = gatt.create_gatt_server(name).await?;
      info!("Serving {} at {}", layout.service, layout.path);
      first_uuid.get_or_insert(layout.service.uuid());
   }
   if let Some(uuid) = first_uuid {
      gatt.start_advertising(uuid).await?;
   }

   signal::ctrl_c().await?;
   info!("Shutting down peripheral...");
   harness.shutdown().await;
   Ok(())
}

async fn run_agent(harness: &Harness, capability: Option<AgentCapability>) -> Result<()> {
   let capability = harness
      .register_agent(capability, Arc::new(AutoAccept))
      .await?;
   harness.devices().watch_pairing().await?;
   info!("Agent running with capability {capability}, press Ctrl-C to stop");

   signal::ctrl_c().await?;
   info!("Shutting down agent...");
   if let Err(e) = harness.unregister_agent().await {
      error!("Failed to unregister agent: {e}");
   }
   harness.shutdown().await;
   Ok(())
}
