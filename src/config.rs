//! Configuration management for the harness.
//!
//! This module handles loading and saving configuration from disk: the
//! adapter to drive, agent capability, OBEX receive parameters, the A2DP
//! player command and the simulated peripheral's advertisement.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::agent::AgentCapability,
   error::{HarnessError, Result},
};

/// Main configuration structure for the harness.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_adapter")]
   pub adapter: String,

   #[serde(default)]
   pub agent_capability: AgentCapability,

   #[serde(default)]
   pub obex: ObexConfig,

   #[serde(default)]
   pub media: MediaConfig,

   #[serde(default)]
   pub peripheral: PeripheralConfig,
}

/// OBEX Object Push parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObexConfig {
   #[serde(default = "default_save_directory")]
   pub save_directory: PathBuf,

   #[serde(default = "default_receive_timeout")]
   pub receive_timeout_secs: u64,

   #[serde(default = "default_poll_interval")]
   pub poll_interval_ms: u64,

   #[serde(default = "default_transfer_timeout")]
   pub transfer_timeout_secs: u64,

   #[serde(default = "default_target")]
   pub target: String,
}

/// A2DP streaming parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaConfig {
   #[serde(default = "default_player")]
   pub player: String,
}

/// Simulated peripheral advertisement.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
   #[serde(default = "default_local_name")]
   pub local_name: String,

   #[serde(default = "default_include_tx_power")]
   pub include_tx_power: bool,
}

fn default_adapter() -> String {
   "hci0".to_string()
}

fn default_save_directory() -> PathBuf {
   PathBuf::from("/tmp")
}

const fn default_receive_timeout() -> u64 {
   20
}

const fn default_poll_interval() -> u64 {
   500
}

const fn default_transfer_timeout() -> u64 {
   300
}

fn default_target() -> String {
   "opp".to_string()
}

fn default_player() -> String {
   "paplay".to_string()
}

fn default_local_name() -> String {
   "GATT_Test_Server".to_string()
}

const fn default_include_tx_power() -> bool {
   true
}

impl Default for ObexConfig {
   fn default() -> Self {
      Self {
         save_directory: default_save_directory(),
         receive_timeout_secs: default_receive_timeout(),
         poll_interval_ms: default_poll_interval(),
         transfer_timeout_secs: default_transfer_timeout(),
         target: default_target(),
      }
   }
}

impl ObexConfig {
   pub const fn receive_timeout(&self) -> Duration {
      Duration::from_secs(self.receive_timeout_secs)
   }

   pub const fn poll_interval(&self) -> Duration {
      Duration::from_millis(self.poll_interval_ms)
   }

   pub const fn transfer_timeout(&self) -> Duration {
      Duration::from_secs(self.transfer_timeout_secs)
   }
}

impl Default for MediaConfig {
   fn default() -> Self {
      Self {
         player: default_player(),
      }
   }
}

impl Default for PeripheralConfig {
   fn default() -> Self {
      Self {
         local_name: default_local_name(),
         include_tx_power: default_include_tx_power(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: default_adapter(),
         agent_capability: AgentCapability::default(),
         obex: ObexConfig::default(),
         media: MediaConfig::default(),
         peripheral: PeripheralConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTHARNESS_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(HarnessError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btharness").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_file_uses_defaults() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.adapter, "hci0");
      assert_eq!(config.agent_capability, AgentCapability::KeyboardDisplay);
      assert_eq!(config.obex.save_directory, PathBuf::from("/tmp"));
      assert_eq!(config.obex.receive_timeout(), Duration::from_secs(20));
      assert_eq!(config.obex.target, "opp");
      assert_eq!(config.media.player, "paplay");
      assert_eq!(config.peripheral.local_name, "GATT_Test_Server");
      assert!(config.peripheral.include_tx_power);
   }

   #[test]
   fn test_partial_sections() {
      let config: Config = toml::from_str(
         r#"
            adapter = "hci1"
            agent_capability = "NoInputNoOutput"

            [obex]
            receive_timeout_secs = 5

            [peripheral]
            local_name = "Bench"
         "#,
      )
      .unwrap();

      assert_eq!(config.adapter, "hci1");
      assert_eq!(config.agent_capability, AgentCapability::NoInputNoOutput);
      assert_eq!(config.obex.receive_timeout(), Duration::from_secs(5));
      // Untouched keys keep their defaults
      assert_eq!(config.obex.poll_interval(), Duration::from_millis(500));
      assert_eq!(config.peripheral.local_name, "Bench");
      assert!(config.peripheral.include_tx_power);
   }

   #[test]
   fn test_roundtrip_through_toml() {
      let config = Config::default();
      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.adapter, config.adapter);
      assert_eq!(back.obex.transfer_timeout_secs, 300);
   }

   #[test]
   fn test_save_and_load_under_override_home() {
      let dir = tempfile::tempdir().unwrap();
      // SAFETY: tests in this module are the only users of this variable
      unsafe { env::set_var("BTHARNESS_HOME", dir.path()) };

      let loaded = Config::load().unwrap();
      assert_eq!(loaded.adapter, "hci0");
      assert!(dir.path().join("btharness").join("config.toml").exists());

      unsafe { env::remove_var("BTHARNESS_HOME") };
   }
}
