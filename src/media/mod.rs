//! A2DP streaming and AVRCP remote control.
//!
//! Media objects (MediaControl1, MediaPlayer1, MediaTransport1) hang below the
//! device object and are located through the BlueZ ObjectManager.

use std::{collections::HashMap, path::Path, process::Stdio};

use bluer::Address;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::process::{Child, Command};
use zbus::{Connection, zvariant::OwnedObjectPath};

use crate::{
   bluez::{
      DEVICE_INTERFACE, MEDIA_CONTROL_INTERFACE, MEDIA_PLAYER_INTERFACE,
      MEDIA_TRANSPORT_INTERFACE, paths,
      proxies::{
         BluezObjectManagerProxy, MediaControl1Proxy, MediaPlayer1Proxy, MediaTransport1Proxy,
      },
      take_property,
   },
   error::{HarnessError, Result},
};

/// Highest A2DP transport volume.
pub const MAX_VOLUME: u16 = 127;

/// AVRCP commands understood by MediaControl1.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum MediaCommand {
   Play,
   Pause,
   Stop,
   Next,
   Previous,
   Rewind,
   FastForward,
   VolumeUp,
   VolumeDown,
}

/// A2DP role of the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum A2dpRole {
   Source,
   Sink,
}

impl A2dpRole {
   /// Source wins when a device advertises both.
   pub fn from_uuids<S: AsRef<str>>(uuids: &[S]) -> Option<Self> {
      let has = |short: &str| {
         uuids
            .iter()
            .any(|uuid| uuid.as_ref().to_ascii_lowercase().contains(short))
      };
      if has("110a") {
         Some(Self::Source)
      } else if has("110b") {
         Some(Self::Sink)
      } else {
         None
      }
   }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
   pub title: String,
   pub artist: String,
   pub album: String,
   /// Milliseconds
   #[serde(skip)]
   pub duration: u32,
}

impl TrackInfo {
   /// Reads the MediaPlayer1 `Track` dictionary.
   pub fn from_metadata(mut metadata: HashMap<String, zbus::zvariant::OwnedValue>) -> Self {
      Self {
         title: take_property(&mut metadata, "Title").unwrap_or_default(),
         artist: take_property(&mut metadata, "Artist").unwrap_or_default(),
         album: take_property(&mut metadata, "Album").unwrap_or_default(),
         duration: take_property(&mut metadata, "Duration").unwrap_or_default(),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackInfo {
   pub status: String,
   pub track: TrackInfo,
   /// Milliseconds
   pub position: u32,
   /// Milliseconds
   pub duration: u32,
}

impl PlaybackInfo {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

pub struct MediaController {
   conn: Connection,
   adapter: SmolStr,
   player: String,
   stream: Mutex<Option<Child>>,
}

impl MediaController {
   pub fn new(conn: Connection, adapter: &str, player: &str) -> Self {
      Self {
         conn,
         adapter: adapter.into(),
         player: player.to_string(),
         stream: Mutex::new(None),
      }
   }

   /// First object of `address` on this adapter implementing `interface`.
   async fn find_object(
      &self,
      address: Address,
      interface: &'static str,
   ) -> Result<OwnedObjectPath> {
      let objects = BluezObjectManagerProxy::new(&self.conn)
         .await?
         .get_managed_objects()
         .await?;
      let found = objects.into_iter().find_map(|(path, interfaces)| {
         (interfaces.contains_key(interface)
            && paths::belongs_to_device(path.as_str(), &self.adapter, address))
         .then_some(path)
      });
      match found {
         Some(path) => {
            info!("Found {interface} at {}", path.as_str());
            Ok(path)
         },
         None => {
            info!("No {interface} found for {address} under {}", self.adapter);
            Err(HarnessError::InterfaceNotFound { interface, address })
         },
      }
   }

   pub async fn media_control(&self, address: Address, command: MediaCommand) -> Result<()> {
      let path = self.find_object(address, MEDIA_CONTROL_INTERFACE).await?;
      let control = MediaControl1Proxy::builder(&self.conn)
         .path(path)?
         .build()
         .await?;

      let sent = match command {
         MediaCommand::Play => control.play().await,
         MediaCommand::Pause => control.pause().await,
         MediaCommand::Stop => control.stop().await,
         MediaCommand::Next => control.next().await,
         MediaCommand::Previous => control.previous().await,
         MediaCommand::Rewind => control.rewind().await,
         MediaCommand::FastForward => control.fast_forward().await,
         MediaCommand::VolumeUp => control.volume_up().await,
         MediaCommand::VolumeDown => control.volume_down().await,
      };
      if let Err(e) = sent {
         warn!("AVRCP command {command} failed: {e}");
         return Err(e.into());
      }
      info!("AVRCP {command} sent successfully to {address}");
      Ok(())
   }

   /// Parses the command name first so bad input never reaches the bus.
   pub async fn media_control_by_name(&self, address: Address, command: &str) -> Result<()> {
      let command = command.parse::<MediaCommand>().map_err(|_| {
         info!("Invalid media control command: {command}");
         HarnessError::InvalidArgument(format!("unknown media command: {command}"))
      })?;
      self.media_control(address, command).await
   }

   pub async fn playback_info(&self, address: Address) -> Result<PlaybackInfo> {
      let path = self.find_object(address, MEDIA_PLAYER_INTERFACE).await?;
      let player = MediaPlayer1Proxy::builder(&self.conn)
         .path(path)?
         .build()
         .await?;

      let status = player.status().await?;
      let track = TrackInfo::from_metadata(player.track().await?);
      let position = player.position().await?;
      Ok(PlaybackInfo {
         status,
         duration: track.duration,
         track,
         position,
      })
   }

   async fn transport(&self, address: Address) -> Result<MediaTransport1Proxy<'static>> {
      let path = self.find_object(address, MEDIA_TRANSPORT_INTERFACE).await?;
      Ok(MediaTransport1Proxy::builder(&self.conn)
         .path(path)?
         .build()
         .await?)
   }

   pub async fn volume(&self, address: Address) -> Result<u16> {
      Ok(self.transport(address).await?.volume().await?)
   }

   pub async fn set_volume(&self, address: Address, volume: u16) -> Result<()> {
      if volume > MAX_VOLUME {
         return Err(HarnessError::InvalidArgument(format!(
            "volume {volume} outside 0..={MAX_VOLUME}"
         )));
      }
      self.transport(address).await?.set_volume(volume).await?;
      info!("Volume set to {volume}");
      Ok(())
   }

   /// Role of a connected device, `None` when not connected or neither role.
   pub async fn a2dp_role(&self, address: Address) -> Result<Option<A2dpRole>> {
      let device_path = paths::device_path(&self.adapter, address);
      let mut objects = BluezObjectManagerProxy::new(&self.conn)
         .await?
         .get_managed_objects()
         .await?;

      let Some(mut device) = objects
         .iter_mut()
         .find(|(path, _)| path.as_str() == device_path)
         .and_then(|(_, interfaces)| interfaces.remove(DEVICE_INTERFACE))
      else {
         warn!("Unknown A2DP role {address}");
         return Ok(None);
      };

      if !take_property::<bool>(&mut device, "Connected").unwrap_or(false) {
         warn!("Unknown A2DP role {address}: not connected");
         return Ok(None);
      }
      let uuids: Vec<String> = take_property(&mut device, "UUIDs").unwrap_or_default();
      let role = A2dpRole::from_uuids(&uuids);
      if role.is_none() {
         warn!("Unknown A2DP role {address}");
      }
      Ok(role)
   }

   /// Plays `file` through the configured player, replacing a running stream.
   pub fn start_a2dp_stream(&self, address: Address, file: &Path) -> Result<()> {
      info!(
         "Device path: {}",
         paths::device_path(&self.adapter, address)
      );
      if !file.exists() {
         // The player reports the failure itself
         warn!("File path {} does not exist", file.display());
      }

      info!("Starting stream with {}", file.display());
      let child = Command::new(&self.player)
         .arg(file)
         .stdout(Stdio::null())
         .stderr(Stdio::null())
         .kill_on_drop(true)
         .spawn()?;

      if let Some(mut previous) = self.stream.lock().replace(child) {
         let _ = previous.start_kill();
      }
      Ok(())
   }

   /// Terminates the stream; `false` when none was running.
   pub fn stop_a2dp_stream(&self) -> bool {
      let Some(mut child) = self.stream.lock().take() else {
         return false;
      };
      if let Err(e) = child.start_kill() {
         warn!("Failed to stop stream: {e}");
      }
      info!("Stream stopped");
      true
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use zbus::zvariant::{OwnedValue, Value};

   use super::*;

   fn owned(value: Value<'_>) -> OwnedValue {
      OwnedValue::try_from(value).unwrap()
   }

   #[test]
   fn test_command_names() {
      assert_eq!(MediaCommand::from_str("play").unwrap(), MediaCommand::Play);
      assert_eq!(
         MediaCommand::from_str("fast_forward").unwrap(),
         MediaCommand::FastForward
      );
      assert_eq!(MediaCommand::VolumeDown.to_string(), "volume_down");
      assert!(MediaCommand::from_str("shuffle").is_err());
      assert!(MediaCommand::from_str("Play").is_err());
   }

   #[test]
   fn test_role_from_uuids() {
      let source = ["0000110A-0000-1000-8000-00805F9B34FB"];
      assert_eq!(A2dpRole::from_uuids(&source), Some(A2dpRole::Source));

      let sink = [
         "0000110e-0000-1000-8000-00805f9b34fb",
         "0000110b-0000-1000-8000-00805f9b34fb",
      ];
      assert_eq!(A2dpRole::from_uuids(&sink), Some(A2dpRole::Sink));

      let both = [
         "0000110b-0000-1000-8000-00805f9b34fb",
         "0000110a-0000-1000-8000-00805f9b34fb",
      ];
      assert_eq!(A2dpRole::from_uuids(&both), Some(A2dpRole::Source));

      let none: [&str; 0] = [];
      assert_eq!(A2dpRole::from_uuids(&none), None);
      assert_eq!(A2dpRole::Sink.to_string(), "sink");
   }

   #[test]
   fn test_track_metadata() {
      let metadata = HashMap::from([
         ("Title".to_string(), owned(Value::from("Song"))),
         ("Artist".to_string(), owned(Value::from("Band"))),
         ("Duration".to_string(), owned(Value::from(215_000u32))),
         ("TrackNumber".to_string(), owned(Value::from(3u32))),
      ]);
      let track = TrackInfo::from_metadata(metadata);
      assert_eq!(track.title, "Song");
      assert_eq!(track.artist, "Band");
      assert_eq!(track.album, "");
      assert_eq!(track.duration, 215_000);
   }

   #[test]
   fn test_playback_json() {
      let info = PlaybackInfo {
         status: "playing".into(),
         track: TrackInfo {
            title: "Song".into(),
            ..Default::default()
         },
         position: 1200,
         duration: 3000,
      };
      let json = info.to_json();
      assert_eq!(json["status"], "playing");
      assert_eq!(json["track"]["title"], "Song");
      assert_eq!(json["position"], 1200);
      assert_eq!(json["duration"], 3000);
      assert!(json["track"].get("duration").is_none());
   }
}
