//! BlueZ pairing agent.
//!
//! Exports `org.bluez.Agent1` and forwards every pairing prompt to a
//! caller-supplied [`PairingPrompt`], which plays the part of the UI.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use zbus::{
   Connection, interface,
   zvariant::{ObjectPath, OwnedObjectPath},
};

use crate::{
   bluez::{AGENT_PATH, paths, proxies::AgentManager1Proxy},
   error::Result,
};

/// Largest passkey BlueZ accepts (six decimal digits).
const MAX_PASSKEY: u32 = 999_999;

/// IO capability announced when registering the agent.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum AgentCapability {
   DisplayOnly,
   DisplayYesNo,
   KeyboardOnly,
   NoInputNoOutput,
   #[default]
   KeyboardDisplay,
}

/// A prompt raised by BlueZ during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingRequest {
   PinCode { device: Address },
   Passkey { device: Address },
   Confirm { device: Address, passkey: u32 },
   Authorize { device: Address },
   AuthorizeService { device: Address, uuid: String },
   DisplayPinCode { device: Address, pincode: String },
   DisplayPasskey { device: Address, passkey: u32, entered: u16 },
   Cancel,
   Release,
}

impl PairingRequest {
   /// Short name of the prompt, stable for test logs.
   pub const fn kind(&self) -> &'static str {
      match self {
         Self::PinCode { .. } => "pin",
         Self::Passkey { .. } => "passkey",
         Self::Confirm { .. } => "confirm",
         Self::Authorize { .. } => "authorize",
         Self::AuthorizeService { .. } => "authorize_service",
         Self::DisplayPinCode { .. } => "display_pin",
         Self::DisplayPasskey { .. } => "display_passkey",
         Self::Cancel => "cancel",
         Self::Release => "release",
      }
   }
}

/// What the prompt answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingAnswer {
   Accept,
   Reject,
   PinCode(String),
   Passkey(u32),
}

/// The "UI" side of pairing. May block.
pub trait PairingPrompt: Send + Sync {
   fn prompt(&self, request: &PairingRequest) -> PairingAnswer;
}

impl<F> PairingPrompt for F
where
   F: Fn(&PairingRequest) -> PairingAnswer + Send + Sync,
{
   fn prompt(&self, request: &PairingRequest) -> PairingAnswer {
      self(request)
   }
}

/// Accepts everything, answering PIN `0000` and passkey `0`.
pub struct AutoAccept;

impl PairingPrompt for AutoAccept {
   fn prompt(&self, request: &PairingRequest) -> PairingAnswer {
      match request {
         PairingRequest::PinCode { .. } => PairingAnswer::PinCode("0000".into()),
         PairingRequest::Passkey { .. } => PairingAnswer::Passkey(0),
         _ => PairingAnswer::Accept,
      }
   }
}

/// Errors returned to BlueZ.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub enum AgentError {
   #[zbus(error)]
   ZBus(zbus::Error),
   Rejected(String),
   Canceled(String),
}

fn into_pin(answer: PairingAnswer) -> std::result::Result<String, AgentError> {
   match answer {
      PairingAnswer::PinCode(pin) if (1..=16).contains(&pin.len()) => Ok(pin),
      PairingAnswer::Reject => Err(AgentError::Rejected("PIN request rejected".into())),
      other => Err(AgentError::Rejected(format!("Expected a PIN code, got {other:?}"))),
   }
}

fn into_passkey(answer: PairingAnswer) -> std::result::Result<u32, AgentError> {
   match answer {
      PairingAnswer::Passkey(key) if key <= MAX_PASSKEY => Ok(key),
      PairingAnswer::Reject => Err(AgentError::Rejected("Passkey request rejected".into())),
      other => Err(AgentError::Rejected(format!("Expected a passkey, got {other:?}"))),
   }
}

fn into_accept(answer: PairingAnswer) -> std::result::Result<(), AgentError> {
   match answer {
      PairingAnswer::Accept => Ok(()),
      _ => Err(AgentError::Rejected("Rejected by user".into())),
   }
}

fn device_address(device: &OwnedObjectPath) -> Address {
   paths::address_from_device_path(device.as_str()).unwrap_or_else(|| {
      warn!("Agent request for non-device object {device}");
      Address::any()
   })
}

/// The exported `org.bluez.Agent1` object.
pub struct PairingAgent {
   prompt: Arc<dyn PairingPrompt>,
}

impl PairingAgent {
   pub fn new(prompt: Arc<dyn PairingPrompt>) -> Self {
      Self { prompt }
   }

   async fn ask(&self, request: PairingRequest) -> PairingAnswer {
      info!("Pairing prompt: {} {request:?}", request.kind());
      let prompt = self.prompt.clone();
      let answer = tokio::task::spawn_blocking(move || prompt.prompt(&request))
         .await
         .unwrap_or_else(|e| {
            warn!("Pairing prompt panicked: {e}");
            PairingAnswer::Reject
         });
      debug!("Pairing answer: {answer:?}");
      answer
   }
}

#[interface(name = "org.bluez.Agent1")]
impl PairingAgent {
   async fn release(&self) {
      self.ask(PairingRequest::Release).await;
   }

   async fn request_pin_code(
      &self,
      device: OwnedObjectPath,
   ) -> std::result::Result<String, AgentError> {
      let device = device_address(&device);
      into_pin(self.ask(PairingRequest::PinCode { device }).await)
   }

   async fn display_pin_code(&self, device: OwnedObjectPath, pincode: String) {
      let device = device_address(&device);
      self.ask(PairingRequest::DisplayPinCode { device, pincode }).await;
   }

   async fn request_passkey(&self, device: OwnedObjectPath) -> std::result::Result<u32, AgentError> {
      let device = device_address(&device);
      into_passkey(self.ask(PairingRequest::Passkey { device }).await)
   }

   async fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
      let device = device_address(&device);
      self
         .ask(PairingRequest::DisplayPasskey {
            device,
            passkey,
            entered,
         })
         .await;
   }

   async fn request_confirmation(
      &self,
      device: OwnedObjectPath,
      passkey: u32,
   ) -> std::result::Result<(), AgentError> {
      let device = device_address(&device);
      into_accept(self.ask(PairingRequest::Confirm { device, passkey }).await)
   }

   async fn request_authorization(
      &self,
      device: OwnedObjectPath,
   ) -> std::result::Result<(), AgentError> {
      let device = device_address(&device);
      into_accept(self.ask(PairingRequest::Authorize { device }).await)
   }

   async fn authorize_service(
      &self,
      device: OwnedObjectPath,
      uuid: String,
   ) -> std::result::Result<(), AgentError> {
      let device = device_address(&device);
      into_accept(self.ask(PairingRequest::AuthorizeService { device, uuid }).await)
   }

   async fn cancel(&self) {
      self.ask(PairingRequest::Cancel).await;
   }
}

/// A registered agent. Dropping it leaves the registration in place;
/// call [`Agent::unregister`].
pub struct Agent {
   conn: Connection,
   capability: AgentCapability,
}

impl Agent {
   /// Exports the agent, registers it and makes it the default agent.
   pub async fn register(
      conn: &Connection,
      capability: AgentCapability,
      prompt: Arc<dyn PairingPrompt>,
   ) -> Result<Self> {
      let server = conn.object_server();
      // Replace a previous export so the new prompt is used
      let _ = server.remove::<PairingAgent, _>(AGENT_PATH).await;
      server.at(AGENT_PATH, PairingAgent::new(prompt)).await?;

      let path = ObjectPath::from_static_str_unchecked(AGENT_PATH);
      let manager = AgentManager1Proxy::new(conn).await?;
      manager.register_agent(&path, capability.into()).await?;
      manager.request_default_agent(&path).await?;

      info!("Registered agent at {AGENT_PATH} with capability: {capability}");
      Ok(Self {
         conn: conn.clone(),
         capability,
      })
   }

   pub const fn capability(&self) -> AgentCapability {
      self.capability
   }

   pub async fn unregister(self) -> Result<()> {
      let path = ObjectPath::from_static_str_unchecked(AGENT_PATH);
      let manager = AgentManager1Proxy::new(&self.conn).await?;
      let result = manager.unregister_agent(&path).await;
      let _ = self
         .conn
         .object_server()
         .remove::<PairingAgent, _>(AGENT_PATH)
         .await;
      result?;
      info!("Unregistered agent from BlueZ");
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_capability_names_match_bluez() {
      assert_eq!(AgentCapability::KeyboardDisplay.to_string(), "KeyboardDisplay");
      assert_eq!(
         AgentCapability::from_str("NoInputNoOutput").unwrap(),
         AgentCapability::NoInputNoOutput
      );
      assert!(AgentCapability::from_str("Keyboard").is_err());
   }

   #[test]
   fn test_request_kinds() {
      let device = Address::any();
      assert_eq!(PairingRequest::PinCode { device }.kind(), "pin");
      assert_eq!(
         PairingRequest::Confirm { device, passkey: 1 }.kind(),
         "confirm"
      );
      assert_eq!(
         PairingRequest::DisplayPasskey {
            device,
            passkey: 1,
            entered: 0
         }
         .kind(),
         "display_passkey"
      );
      assert_eq!(PairingRequest::Cancel.kind(), "cancel");
   }

   #[test]
   fn test_pin_answers() {
      assert_eq!(into_pin(PairingAnswer::PinCode("1234".into())).unwrap(), "1234");
      assert!(into_pin(PairingAnswer::PinCode(String::new())).is_err());
      assert!(into_pin(PairingAnswer::Accept).is_err());
      assert!(matches!(
         into_pin(PairingAnswer::Reject),
         Err(AgentError::Rejected(_))
      ));
   }

   #[test]
   fn test_passkey_answers() {
      assert_eq!(into_passkey(PairingAnswer::Passkey(123_456)).unwrap(), 123_456);
      assert!(into_passkey(PairingAnswer::Passkey(1_000_000)).is_err());
      assert!(into_passkey(PairingAnswer::PinCode("1".into())).is_err());
   }

   #[test]
   fn test_confirmation_needs_accept() {
      assert!(into_accept(PairingAnswer::Accept).is_ok());
      assert!(into_accept(PairingAnswer::Reject).is_err());
      assert!(into_accept(PairingAnswer::Passkey(0)).is_err());
   }

   #[test]
   fn test_closure_prompt_and_auto_accept() {
      let device = Address::any();
      let reject_all = |_: &PairingRequest| PairingAnswer::Reject;
      assert_eq!(
         reject_all.prompt(&PairingRequest::Authorize { device }),
         PairingAnswer::Reject
      );

      assert_eq!(
         AutoAccept.prompt(&PairingRequest::PinCode { device }),
         PairingAnswer::PinCode("0000".into())
      );
      assert_eq!(
         AutoAccept.prompt(&PairingRequest::Confirm { device, passkey: 42 }),
         PairingAnswer::Accept
      );
   }

   #[tokio::test]
   async fn test_agent_forwards_to_prompt() {
      let agent = PairingAgent::new(Arc::new(|req: &PairingRequest| match req {
         PairingRequest::Passkey { .. } => PairingAnswer::Passkey(4242),
         _ => PairingAnswer::Reject,
      }));
      let answer = agent
         .ask(PairingRequest::Passkey {
            device: Address::any(),
         })
         .await;
      assert_eq!(answer, PairingAnswer::Passkey(4242));
   }
}
