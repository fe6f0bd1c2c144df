//! OBEX Object Push.
//!
//! Sending goes through obexd on the session bus; receiving runs an
//! `obexpushd` server and polls its output directory for new files.

use std::{
   collections::{HashMap, HashSet},
   ffi::OsString,
   fs,
   io,
   path::{Path, PathBuf},
   process::ExitStatus,
   time::{Duration, Instant},
};

use bluer::Address;
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use nix::{
   sys::signal::{self, Signal},
   unistd::Pid,
};
use parking_lot::Mutex;
use tokio::{
   process::{Child, Command},
   sync::OnceCell,
   time,
};
use zbus::{
   Connection,
   zvariant::{ObjectPath, OwnedObjectPath, Value},
};

use crate::{
   bluez::proxies::{ObexClient1Proxy, ObjectPush1Proxy, Transfer1Proxy},
   config::ObexConfig,
   error::{HarnessError, Result},
   event::{EventSender, HarnessEvent},
};

/// Asks whether a received file is kept. Runs on a blocking thread, so it
/// may wait for user input.
pub type ConfirmFile = Box<dyn FnMut(&Path) -> bool + Send>;

/// Time `obexpushd` gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Transfer1 `Status`.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum TransferStatus {
   Queued,
   Active,
   Suspended,
   Complete,
   Error,
   Cancelled,
}

impl TransferStatus {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Complete | Self::Error | Self::Cancelled)
   }
}

/// Snapshot of a directory's entries.
pub struct DirectoryWatch {
   dir: PathBuf,
   known: HashSet<OsString>,
}

impl DirectoryWatch {
   pub fn new(dir: &Path) -> io::Result<Self> {
      Ok(Self {
         dir: dir.to_path_buf(),
         known: list_dir(dir)?,
      })
   }

   /// Entries that appeared since the snapshot, sorted.
   pub fn new_files(&self) -> io::Result<Vec<PathBuf>> {
      let mut files: Vec<_> = list_dir(&self.dir)?
         .into_iter()
         .filter(|name| !self.known.contains(name))
         .map(|name| self.dir.join(name))
         .collect();
      files.sort();
      Ok(files)
   }
}

fn list_dir(dir: &Path) -> io::Result<HashSet<OsString>> {
   fs::read_dir(dir)?
      .map(|entry| entry.map(|e| e.file_name()))
      .collect()
}

pub struct ObexController {
   session_bus: OnceCell<Connection>,
   config: ObexConfig,
   event_tx: EventSender,
   receiver: Mutex<Option<Child>>,
}

impl ObexController {
   pub fn new(config: ObexConfig, event_tx: EventSender) -> Self {
      Self {
         session_bus: OnceCell::new(),
         config,
         event_tx,
         receiver: Mutex::new(None),
      }
   }

   pub const fn config(&self) -> &ObexConfig {
      &self.config
   }

   /// obexd lives on the session bus, connected on first use.
   async fn session_bus(&self) -> Result<&Connection> {
      Ok(self.session_bus.get_or_try_init(Connection::session).await?)
   }

   pub async fn create_session(&self, address: Address, target: &str) -> Result<OwnedObjectPath> {
      let client = ObexClient1Proxy::new(self.session_bus().await?).await?;
      let args = HashMap::from([("Target", Value::from(target))]);
      match client.create_session(&address.to_string(), args).await {
         Ok(path) => {
            info!("Created OBEX {target} session: {}", path.as_str());
            Ok(path)
         },
         Err(e) => {
            error!("OBEX session creation failed for device {address}: {e}");
            Err(e.into())
         },
      }
   }

   pub async fn remove_session(&self, session: &ObjectPath<'_>) -> Result<()> {
      let client = ObexClient1Proxy::new(self.session_bus().await?).await?;
      client.remove_session(session).await?;
      info!("Removed OBEX session: {session}");
      Ok(())
   }

   /// Pushes `file` and waits for the transfer to finish.
   ///
   /// A missing file reports [`TransferStatus::Error`] without contacting
   /// obexd. Without `session` a new one is created for `target` (the
   /// configured target when `None`). The wait is bounded by the configured
   /// transfer timeout, after which the transfer is cancelled.
   pub async fn send_file(
      &self,
      address: Address,
      file: &Path,
      session: Option<&ObjectPath<'_>>,
      target: Option<&str>,
   ) -> Result<TransferStatus> {
      if !file.exists() {
         info!("File does not exist: {}", file.display());
         return Ok(TransferStatus::Error);
      }
      // obexd resolves paths in its own working directory
      let file = fs::canonicalize(file)?;
      let file = file
         .to_str()
         .ok_or_else(|| HarnessError::InvalidArgument(format!("non UTF-8 path: {}", file.display())))?;

      let session = match session {
         Some(path) => OwnedObjectPath::from(path.to_owned()),
         None => {
            let target = target.unwrap_or(&self.config.target);
            self.create_session(address, target).await?
         },
      };

      let conn = self.session_bus().await?;
      let push = ObjectPush1Proxy::builder(conn).path(session)?.build().await?;
      let (transfer_path, _) = push.send_file(file).await?;
      info!("Started transfer: {}", transfer_path.as_str());

      let transfer = Transfer1Proxy::builder(conn)
         .path(transfer_path.clone())?
         .build()
         .await?;
      let mut changes = transfer.receive_status_changed().await;

      let wait = async {
         while let Some(change) = changes.next().await {
            let raw = match change.get().await {
               Ok(raw) => raw,
               Err(e) => {
                  debug!("Unreadable transfer status: {e}");
                  continue;
               },
            };
            let Ok(status) = raw.parse::<TransferStatus>() else {
               warn!("Unknown transfer status: {raw}");
               continue;
            };
            info!("Transfer status changed to: {status}");
            self.event_tx.emit(HarnessEvent::TransferStatus {
               path: transfer_path.clone(),
               status,
            });
            if status.is_terminal() {
               return status;
            }
         }
         // obexd dropped the transfer object without a final status
         TransferStatus::Error
      };

      match time::timeout(self.config.transfer_timeout(), wait).await {
         Ok(status) => Ok(status),
         Err(_) => {
            warn!("Transfer {} timed out", transfer_path.as_str());
            if let Err(e) = transfer.cancel().await {
               debug!("Failed to cancel transfer: {e}");
            }
            Err(HarnessError::RequestTimeout)
         },
      }
   }

   /// Runs an OPP server until one file arrives or `timeout` elapses.
   ///
   /// The file is offered to `confirm`; a rejected file is deleted. The server
   /// is stopped in every case.
   pub async fn receive_file(
      &self,
      save_dir: &Path,
      timeout: time::Duration,
      confirm: Option<ConfirmFile>,
   ) -> Result<Option<PathBuf>> {
      let received = self.wait_for_file(save_dir, timeout, confirm).await;
      self.stop_receiver().await;
      if let Err(e) = &received {
         error!("Error in receive_file: {e}");
      }
      received
   }

   async fn wait_for_file(
      &self,
      save_dir: &Path,
      timeout: time::Duration,
      confirm: Option<ConfirmFile>,
   ) -> Result<Option<PathBuf>> {
      fs::create_dir_all(save_dir)?;

      match Command::new("killall").args(["-9", "obexpushd"]).output().await {
         Ok(_) => info!("Killed existing obexpushd processes"),
         Err(e) => debug!("killall unavailable: {e}"),
      }

      let watch = DirectoryWatch::new(save_dir)?;
      let child = Command::new("obexpushd")
         .arg("-B")
         .arg("-o")
         .arg(save_dir)
         .arg("-n")
         .kill_on_drop(true)
         .spawn()?;
      if let Some(mut previous) = self.receiver.lock().replace(child) {
         let _ = previous.start_kill();
      }
      info!("OPP server started. Waiting for incoming file...");

      let deadline = Instant::now() + timeout;
      loop {
         if let Some(file) = watch.new_files()?.into_iter().next() {
            info!("Incoming file: {}", file.display());
            if confirm_file(confirm, &file).await {
               info!("User accepted file.");
               return Ok(Some(file));
            }
            info!("User rejected file.");
            fs::remove_file(&file)?;
            return Ok(None);
         }
         if Instant::now() >= deadline {
            info!("No file received within {}s", timeout.as_secs());
            return Ok(None);
         }
         time::sleep(self.config.poll_interval()).await;
      }
   }

   /// Stops the OPP server; `false` when it was not running.
   pub async fn stop_receiver(&self) -> bool {
      let child = self.receiver.lock().take();
      let Some(mut child) = child else {
         info!("No OPP server running or already stopped.");
         return false;
      };
      if !matches!(child.try_wait(), Ok(None)) {
         info!("No OPP server running or already stopped.");
         return false;
      }
      match terminate(&mut child).await {
         Ok(status) => info!("OPP server stopped ({status})."),
         Err(e) => warn!("Failed to stop OPP server: {e}"),
      }
      true
   }
}

/// Offers `file` to `confirm` off the runtime threads. A confirmation that
/// panics rejects the file.
async fn confirm_file(confirm: Option<ConfirmFile>, file: &Path) -> bool {
   let Some(mut confirm) = confirm else {
      return true;
   };
   let file = file.to_path_buf();
   match tokio::task::spawn_blocking(move || confirm(&file)).await {
      Ok(accepted) => accepted,
      Err(e) => {
         error!("File confirmation failed: {e}");
         false
      },
   }
}

/// Sends SIGTERM so the server can clean up, then SIGKILL if it is still
/// running after [`TERMINATE_GRACE`].
async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
   if let Some(status) = child.try_wait()? {
      return Ok(status);
   }
   if let Some(pid) = child.id() {
      match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
         Ok(()) => match time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(status) => return status,
            Err(_) => warn!("OPP server ignored SIGTERM, killing it"),
         },
         Err(e) => warn!("Failed to send SIGTERM to OPP server: {e}"),
      }
   }
   child.kill().await?;
   child.wait().await
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_status_names() {
      assert_eq!(
         TransferStatus::from_str("complete").unwrap(),
         TransferStatus::Complete
      );
      assert_eq!(TransferStatus::Cancelled.to_string(), "cancelled");
      assert!(TransferStatus::from_str("completed").is_err());
   }

   #[test]
   fn test_terminal_states() {
      assert!(TransferStatus::Complete.is_terminal());
      assert!(TransferStatus::Error.is_terminal());
      assert!(TransferStatus::Cancelled.is_terminal());
      assert!(!TransferStatus::Queued.is_terminal());
      assert!(!TransferStatus::Active.is_terminal());
      assert!(!TransferStatus::Suspended.is_terminal());
   }

   #[test]
   fn test_directory_watch_sees_only_new_files() {
      let dir = tempfile::tempdir().unwrap();
      fs::write(dir.path().join("old.txt"), b"old").unwrap();

      let watch = DirectoryWatch::new(dir.path()).unwrap();
      assert!(watch.new_files().unwrap().is_empty());

      fs::write(dir.path().join("b.vcf"), b"b").unwrap();
      fs::write(dir.path().join("a.jpg"), b"a").unwrap();
      assert_eq!(
         watch.new_files().unwrap(),
         vec![dir.path().join("a.jpg"), dir.path().join("b.vcf")]
      );

      fs::remove_file(dir.path().join("old.txt")).unwrap();
      assert_eq!(watch.new_files().unwrap().len(), 2);
   }

   #[test]
   fn test_directory_watch_missing_dir() {
      let dir = tempfile::tempdir().unwrap();
      assert!(DirectoryWatch::new(&dir.path().join("absent")).is_err());
   }

   #[tokio::test]
   async fn test_send_missing_file_reports_error() {
      let obex = ObexController::new(
         ObexConfig::default(),
         std::sync::Arc::new(crate::event::NullBus),
      );
      let dir = tempfile::tempdir().unwrap();
      let status = obex
         .send_file(Address::any(), &dir.path().join("missing.bin"), None, None)
         .await
         .unwrap();
      assert_eq!(status, TransferStatus::Error);
   }

   #[tokio::test]
   async fn test_stop_receiver_when_idle() {
      let obex = ObexController::new(
         ObexConfig::default(),
         std::sync::Arc::new(crate::event::NullBus),
      );
      assert!(!obex.stop_receiver().await);
   }

   #[tokio::test]
   async fn test_confirm_file_decisions() {
      let file = Path::new("/tmp/received.txt");
      assert!(confirm_file(None, file).await);
      assert!(!confirm_file(Some(Box::new(|_: &Path| false)), file).await);
      assert!(
         confirm_file(
            Some(Box::new(|path: &Path| path.ends_with("received.txt"))),
            file
         )
         .await
      );
   }

   #[tokio::test]
   async fn test_panicking_confirm_rejects_file() {
      let confirm: ConfirmFile = Box::new(|_| panic!("prompt crashed"));
      assert!(!confirm_file(Some(confirm), Path::new("/tmp/x")).await);
   }

   #[tokio::test]
   async fn test_blocking_confirm_does_not_stall_runtime() {
      let ticked = std::sync::Arc::new(crossbeam::atomic::AtomicCell::new(false));
      let confirm: ConfirmFile = Box::new({
         let ticked = ticked.clone();
         move |_| {
            std::thread::sleep(Duration::from_millis(300));
            ticked.load()
         }
      });
      let ticker = async {
         time::sleep(Duration::from_millis(10)).await;
         ticked.store(true);
      };
      let (accepted, ()) = tokio::join!(confirm_file(Some(confirm), Path::new("/tmp/x")), ticker);
      assert!(accepted);
   }

   #[tokio::test]
   async fn test_terminate_sends_sigterm_first() {
      use std::os::unix::process::ExitStatusExt;

      let mut child = Command::new("sleep").arg("30").spawn().unwrap();
      let status = terminate(&mut child).await.unwrap();
      assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
   }

   #[tokio::test]
   async fn test_terminate_exited_child() {
      let mut child = Command::new("true").spawn().unwrap();
      child.wait().await.unwrap();
      assert!(terminate(&mut child).await.unwrap().success());
   }
}
