//! HFP call control through oFono.
//!
//! The modem of a device is found by its address; its VoiceCallManager is
//! bound once by [`TelephonyController::setup_hfp`], after which added calls
//! are tracked and their state changes reported as [`HarnessEvent::Call`].

use std::{collections::HashMap, fmt, sync::Arc};

use bluer::Address;
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use zbus::{
   Connection,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluez::{
      paths,
      proxies::{CallVolumeProxy, OfonoManagerProxy, VoiceCallManagerProxy, VoiceCallProxy},
      take_property,
   },
   error::{HarnessError, Result},
   event::{EventSender, HarnessEvent},
};

pub const MAX_CALL_VOLUME: u8 = 100;

/// Call states as reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum CallState {
   Active,
   Held,
   Disconnected,
   Incoming,
   Dialing,
   Ringing,
   Waiting,
   /// A state oFono reported that has no mapping, passed through as sent.
   Other(SmolStr),
}

impl CallState {
   /// Maps an oFono VoiceCall `State`; `alerting` is reported as ringing.
   pub fn from_ofono(state: &str) -> Self {
      match state.to_ascii_lowercase().as_str() {
         "active" => Self::Active,
         "held" => Self::Held,
         "disconnected" => Self::Disconnected,
         "incoming" => Self::Incoming,
         "dialing" => Self::Dialing,
         "alerting" => Self::Ringing,
         "waiting" => Self::Waiting,
         _ => Self::Other(state.into()),
      }
   }

   /// State announced for a freshly added call.
   pub fn initial(incoming: Option<bool>, state: Option<&str>) -> Self {
      let incoming_state = state.is_some_and(|s| s.eq_ignore_ascii_case("incoming"));
      if incoming == Some(true) || incoming_state {
         Self::Incoming
      } else {
         Self::Dialing
      }
   }
}

impl fmt::Display for CallState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Other(raw) => f.write_str(raw),
         known => f.write_str(known.into()),
      }
   }
}

/// `hide_callerid` argument of `Dial`.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum HideCallerId {
   #[default]
   Default,
   Enabled,
   Disabled,
}

/// A call as listed by `GetCalls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
   pub path: OwnedObjectPath,
   pub number: SmolStr,
   pub state: Option<CallState>,
}

impl CallInfo {
   fn from_properties(path: OwnedObjectPath, mut properties: HashMap<String, OwnedValue>) -> Self {
      let number = take_property::<String>(&mut properties, "LineIdentification")
         .map_or_else(|| SmolStr::new_static("Unknown"), SmolStr::from);
      let state = take_property::<String>(&mut properties, "State")
         .as_deref()
         .map(CallState::from_ofono);
      Self {
         path,
         number,
         state,
      }
   }
}

/// Calls seen since `setup_hfp`.
#[derive(Default)]
struct CallTable {
   numbers: HashMap<OwnedObjectPath, SmolStr>,
   active: Option<OwnedObjectPath>,
   watchers: HashMap<OwnedObjectPath, JoinHandle<()>>,
}

impl CallTable {
   fn add(&mut self, path: OwnedObjectPath, number: SmolStr) {
      self.active = Some(path.clone());
      self.numbers.insert(path, number);
   }

   /// Stores the state watcher of a tracked call. A call that was removed
   /// while its watcher was being set up gets the watcher aborted instead.
   fn attach_watcher(&mut self, path: OwnedObjectPath, watcher: JoinHandle<()>) -> bool {
      if !self.numbers.contains_key(&path) {
         watcher.abort();
         return false;
      }
      if let Some(previous) = self.watchers.insert(path, watcher) {
         previous.abort();
      }
      true
   }

   fn remove(&mut self, path: &OwnedObjectPath) {
      self.numbers.remove(path);
      if let Some(watcher) = self.watchers.remove(path) {
         watcher.abort();
      }
      if self.active.as_ref() == Some(path) {
         self.active = None;
      }
   }

   fn number(&self, path: &OwnedObjectPath) -> SmolStr {
      self
         .numbers
         .get(path)
         .cloned()
         .unwrap_or_else(|| SmolStr::new_static("Unknown"))
   }

   fn clear(&mut self) {
      for (_, watcher) in self.watchers.drain() {
         watcher.abort();
      }
      self.numbers.clear();
      self.active = None;
   }
}

/// Signal handling shared by the watcher tasks.
#[derive(Clone)]
struct CallTracker {
   conn: Connection,
   event_tx: EventSender,
   table: Arc<Mutex<CallTable>>,
}

impl CallTracker {
   async fn call_added(&self, path: OwnedObjectPath, properties: &HashMap<String, OwnedValue>) {
      let number = properties
         .get("LineIdentification")
         .and_then(|v| v.downcast_ref::<&str>().ok())
         .map_or_else(|| SmolStr::new_static("Unknown"), SmolStr::from);
      let state = properties
         .get("State")
         .and_then(|v| v.downcast_ref::<&str>().ok());
      let incoming = properties
         .get("Incoming")
         .and_then(|v| v.downcast_ref::<bool>().ok());
      let initial = CallState::initial(incoming, state);
      info!("New call: {}, Number={number}, State={initial}", path.as_str());

      self.table.lock().add(path.clone(), number.clone());

      match self.watch_state(path.clone()).await {
         Ok(watcher) => {
            if !self.table.lock().attach_watcher(path.clone(), watcher) {
               debug!("Call {} ended before its watcher started", path.as_str());
            }
         },
         Err(e) => warn!("Failed to watch call {}: {e}", path.as_str()),
      }

      self.event_tx.emit(HarnessEvent::Call {
         path,
         number,
         state: initial,
      });
   }

   fn call_removed(&self, path: &OwnedObjectPath) {
      info!("Call removed: {}", path.as_str());
      self.table.lock().remove(path);
   }

   async fn watch_state(&self, path: OwnedObjectPath) -> Result<JoinHandle<()>> {
      let call = VoiceCallProxy::builder(&self.conn)
         .path(path.clone())?
         .build()
         .await?;
      let mut changes = call.receive_property_changed().await?;
      let tracker = self.clone();

      Ok(tokio::spawn(async move {
         while let Some(signal) = changes.next().await {
            let Ok(args) = signal.args() else {
               continue;
            };
            if args.name() != "State" {
               continue;
            }
            let Ok(raw) = args.value().downcast_ref::<&str>() else {
               continue;
            };
            let state = CallState::from_ofono(raw);
            if let CallState::Other(_) = state {
               debug!("Unmapped call state {raw} on {}", path.as_str());
            }
            let number = tracker.table.lock().number(&path);
            info!("Call {} is now {state}", path.as_str());
            tracker.event_tx.emit(HarnessEvent::Call {
               path: path.clone(),
               number,
               state,
            });
         }
      }))
   }
}

pub struct TelephonyController {
   tracker: CallTracker,
   manager: Mutex<Option<VoiceCallManagerProxy<'static>>>,
   signal_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelephonyController {
   pub fn new(conn: Connection, event_tx: EventSender) -> Self {
      Self {
         tracker: CallTracker {
            conn,
            event_tx,
            table: Arc::new(Mutex::new(CallTable::default())),
         },
         manager: Mutex::new(None),
         signal_tasks: Mutex::new(Vec::new()),
      }
   }

   /// First oFono modem whose path names the device.
   pub async fn modem_path(&self, address: Address) -> Result<OwnedObjectPath> {
      let formatted = paths::formatted_address(address);
      let modems = OfonoManagerProxy::new(&self.tracker.conn)
         .await?
         .get_modems()
         .await
         .inspect_err(|e| error!("Failed to get oFono modem path: {e}"))?;
      modems
         .into_iter()
         .map(|(path, _)| path)
         .find(|path| path.as_str().contains(formatted.as_str()))
         .ok_or_else(|| {
            warn!("No oFono path for {address}");
            HarnessError::ModemNotFound(address)
         })
   }

   /// Binds the device's VoiceCallManager and starts tracking its calls.
   pub async fn setup_hfp(&self, address: Address) -> Result<()> {
      let modem = self.modem_path(address).await?;
      let manager = VoiceCallManagerProxy::builder(&self.tracker.conn)
         .path(modem)?
         .build()
         .await?;
      let mut added = manager.receive_call_added().await?;
      let mut removed = manager.receive_call_removed().await?;

      self.shutdown();

      let tracker = self.tracker.clone();
      let added_task = tokio::spawn(async move {
         while let Some(signal) = added.next().await {
            match signal.args() {
               Ok(args) => {
                  tracker
                     .call_added(args.path().clone(), args.properties())
                     .await;
               },
               Err(e) => warn!("Malformed CallAdded: {e}"),
            }
         }
      });

      let tracker = self.tracker.clone();
      let removed_task = tokio::spawn(async move {
         while let Some(signal) = removed.next().await {
            match signal.args() {
               Ok(args) => tracker.call_removed(args.path()),
               Err(e) => warn!("Malformed CallRemoved: {e}"),
            }
         }
      });

      self.signal_tasks.lock().extend([added_task, removed_task]);
      *self.manager.lock() = Some(manager);
      info!("VoiceCallManager initialized for {address}");
      Ok(())
   }

   fn manager(&self) -> Result<VoiceCallManagerProxy<'static>> {
      self
         .manager
         .lock()
         .clone()
         .ok_or(HarnessError::NoVoiceCallManager)
   }

   fn active_call_path(&self) -> Result<OwnedObjectPath> {
      self
         .tracker
         .table
         .lock()
         .active
         .clone()
         .ok_or(HarnessError::NoActiveCall)
   }

   async fn active_call(&self) -> Result<VoiceCallProxy<'static>> {
      let path = self.active_call_path()?;
      Ok(VoiceCallProxy::builder(&self.tracker.conn)
         .path(path)?
         .build()
         .await?)
   }

   /// Tracked calls as path -> number.
   pub fn active_calls(&self) -> HashMap<OwnedObjectPath, SmolStr> {
      self.tracker.table.lock().numbers.clone()
   }

   pub async fn answer_call(&self) -> Result<()> {
      self.active_call().await?.answer().await?;
      info!("Answered call");
      Ok(())
   }

   pub async fn hangup_active_call(&self) -> Result<()> {
      let call = self.active_call().await.inspect_err(|e| {
         if matches!(e, HarnessError::NoActiveCall) {
            warn!("No active call to hang up.");
         }
      })?;
      call.hangup().await?;
      info!("Hung up call: {}", call.inner().path());
      Ok(())
   }

   pub async fn hangup_all(&self) -> Result<()> {
      self.manager()?.hangup_all().await?;
      info!("Hung up all calls");
      Ok(())
   }

   pub async fn dial(&self, number: &str, hide_caller_id: HideCallerId) -> Result<OwnedObjectPath> {
      let path = self
         .manager()?
         .dial(number, hide_caller_id.into())
         .await
         .inspect_err(|e| error!("Failed to dial {number}: {e}"))?;
      info!("Dialed number {number}, call path: {}", path.as_str());
      Ok(path)
   }

   pub async fn dial_last(&self) -> Result<()> {
      self.manager()?.dial_last().await?;
      info!("Dialed last number");
      Ok(())
   }

   pub async fn calls(&self) -> Result<Vec<CallInfo>> {
      let calls = self.manager()?.get_calls().await?;
      Ok(calls
         .into_iter()
         .map(|(path, properties)| CallInfo::from_properties(path, properties))
         .collect())
   }

   pub async fn create_multiparty(&self) -> Result<Vec<OwnedObjectPath>> {
      let calls = self.manager()?.create_multiparty().await?;
      info!("Multiparty call created, calls: {}", calls.len());
      Ok(calls)
   }

   pub async fn hangup_multiparty(&self) -> Result<()> {
      self.manager()?.hangup_multiparty().await?;
      info!("Hung up multiparty call");
      Ok(())
   }

   pub async fn private_chat(&self, call: &ObjectPath<'_>) -> Result<Vec<OwnedObjectPath>> {
      let calls = self.manager()?.private_chat(call).await?;
      info!("Activated private chat for call: {call}");
      Ok(calls)
   }

   pub async fn hold_and_answer(&self) -> Result<()> {
      self.manager()?.hold_and_answer().await?;
      info!("Active call put on hold and waiting call answered");
      Ok(())
   }

   pub async fn release_and_answer(&self) -> Result<()> {
      self.manager()?.release_and_answer().await?;
      info!("Released active call and answered waiting call");
      Ok(())
   }

   pub async fn release_and_swap(&self) -> Result<()> {
      self.manager()?.release_and_swap().await?;
      info!("Released active call and resumed held call");
      Ok(())
   }

   pub async fn swap_calls(&self) -> Result<()> {
      self.manager()?.swap_calls().await?;
      info!("Swapped active and held calls");
      Ok(())
   }

   pub async fn transfer(&self) -> Result<()> {
      self.manager()?.transfer().await?;
      info!("Transferred calls");
      Ok(())
   }

   pub async fn send_tones(&self, tones: &str) -> Result<()> {
      self.manager()?.send_tones(tones).await?;
      info!("Sent DTMF tones {tones}");
      Ok(())
   }

   /// Sets the modem's `SpeakerVolume` (percent).
   pub async fn set_call_volume(&self, address: Address, volume: u8) -> Result<()> {
      if volume > MAX_CALL_VOLUME {
         return Err(HarnessError::InvalidArgument(format!(
            "call volume {volume} outside 0..={MAX_CALL_VOLUME}"
         )));
      }
      let modem = self.modem_path(address).await?;
      let call_volume = CallVolumeProxy::builder(&self.tracker.conn)
         .path(modem)?
         .build()
         .await?;
      call_volume
         .set_property("SpeakerVolume", Value::U8(volume))
         .await?;
      info!("Call volume set to {volume} on {address}");
      Ok(())
   }

   /// Stops call tracking and forgets every tracked call.
   pub fn shutdown(&self) {
      for task in self.signal_tasks.lock().drain(..) {
         task.abort();
      }
      self.tracker.table.lock().clear();
   }
}

impl Drop for TelephonyController {
   fn drop(&mut self) {
      self.shutdown();
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   fn call(n: u32) -> OwnedObjectPath {
      OwnedObjectPath::try_from(format!("/hfp/org/bluez/hci0/dev_00_1A_7D_DA_71_13/voicecall{n:02}"))
         .unwrap()
   }

   fn owned(value: Value<'_>) -> OwnedValue {
      OwnedValue::try_from(value).unwrap()
   }

   #[test]
   fn test_state_mapping() {
      assert_eq!(CallState::from_ofono("alerting"), CallState::Ringing);
      assert_eq!(CallState::from_ofono("ACTIVE"), CallState::Active);
      assert_eq!(CallState::from_ofono("waiting"), CallState::Waiting);
      assert_eq!(CallState::Ringing.to_string(), "ringing");
   }

   #[test]
   fn test_unmapped_state_passes_through() {
      assert_eq!(
         CallState::from_ofono("ringing"),
         CallState::Other("ringing".into())
      );
      let state = CallState::from_ofono("Conference");
      assert_eq!(state, CallState::Other("Conference".into()));
      assert_eq!(state.to_string(), "Conference");
   }

   #[test]
   fn test_initial_state() {
      assert_eq!(CallState::initial(Some(true), Some("active")), CallState::Incoming);
      assert_eq!(CallState::initial(None, Some("Incoming")), CallState::Incoming);
      assert_eq!(CallState::initial(Some(false), Some("dialing")), CallState::Dialing);
      assert_eq!(CallState::initial(None, None), CallState::Dialing);
   }

   #[test]
   fn test_hide_caller_id_names() {
      assert_eq!(HideCallerId::default().to_string(), "default");
      assert_eq!(
         HideCallerId::from_str("enabled").unwrap(),
         HideCallerId::Enabled
      );
      let arg: &str = HideCallerId::Disabled.into();
      assert_eq!(arg, "disabled");
   }

   #[test]
   fn test_call_info_from_properties() {
      let info = CallInfo::from_properties(
         call(1),
         HashMap::from([
            ("LineIdentification".to_string(), owned(Value::from("+15551234"))),
            ("State".to_string(), owned(Value::from("alerting"))),
         ]),
      );
      assert_eq!(info.number, "+15551234");
      assert_eq!(info.state, Some(CallState::Ringing));

      let held = CallInfo::from_properties(
         call(3),
         HashMap::from([("State".to_string(), owned(Value::from("hold_pending")))]),
      );
      assert_eq!(held.state, Some(CallState::Other("hold_pending".into())));

      let anonymous = CallInfo::from_properties(call(2), HashMap::new());
      assert_eq!(anonymous.number, "Unknown");
      assert_eq!(anonymous.state, None);
   }

   #[test]
   fn test_call_table_tracks_active_call() {
      let mut table = CallTable::default();
      table.add(call(1), "111".into());
      table.add(call(2), "222".into());
      assert_eq!(table.active, Some(call(2)));
      assert_eq!(table.number(&call(1)), "111");

      table.remove(&call(1));
      assert_eq!(table.number(&call(1)), "Unknown");
      assert_eq!(table.active, Some(call(2)));

      table.remove(&call(2));
      assert!(table.active.is_none());
      assert!(table.numbers.is_empty());
   }

   async fn finished(watcher: &tokio::task::AbortHandle) -> bool {
      tokio::time::timeout(std::time::Duration::from_secs(1), async {
         while !watcher.is_finished() {
            tokio::task::yield_now().await;
         }
      })
      .await
      .is_ok()
   }

   #[tokio::test]
   async fn test_watcher_for_removed_call_is_aborted() {
      let mut table = CallTable::default();
      table.add(call(1), "111".into());
      table.remove(&call(1));

      let watcher = tokio::spawn(futures::future::pending::<()>());
      let handle = watcher.abort_handle();
      assert!(!table.attach_watcher(call(1), watcher));
      assert!(table.watchers.is_empty());
      assert!(finished(&handle).await);
   }

   #[tokio::test]
   async fn test_watcher_replaced_for_tracked_call() {
      let mut table = CallTable::default();
      table.add(call(1), "111".into());

      let first = tokio::spawn(futures::future::pending::<()>());
      let first_handle = first.abort_handle();
      assert!(table.attach_watcher(call(1), first));

      let second = tokio::spawn(futures::future::pending::<()>());
      let second_handle = second.abort_handle();
      assert!(table.attach_watcher(call(1), second));
      assert!(finished(&first_handle).await);
      assert!(!second_handle.is_finished());

      table.clear();
      assert!(finished(&second_handle).await);
   }
}
