//! Event handling for asynchronous harness notifications.
//!
//! Pairing changes, call state transitions, discovered devices, OBEX
//! transfer progress and writes received by the simulated peripheral are
//! reported through an [`EventBus`] rather than returned from a call.

use std::sync::Arc;

use bluer::Address;
use crossbeam::{atomic::AtomicCell, queue::SegQueue};
use log::debug;
use smol_str::SmolStr;
use tokio::sync::Notify;
use zbus::zvariant::OwnedObjectPath;

use crate::{
   gatt::sensor::AlertLevel, obex::TransferStatus, telephony::CallState,
};

/// Events that can be emitted by the harness.
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessEvent {
   DeviceFound(Address),
   PairingChanged {
      address: Address,
      paired: bool,
   },
   Call {
      path: OwnedObjectPath,
      number: SmolStr,
      state: CallState,
   },
   TransferStatus {
      path: OwnedObjectPath,
      status: TransferStatus,
   },
   AlertLevelWritten(AlertLevel),
   ScanParametersWritten {
      interval: u16,
      window: u16,
   },
   MeasurementIntervalWritten(u16),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: HarnessEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event bus that drops everything.
pub struct NullBus;

impl EventBus for NullBus {
   fn emit(&self, _event: HarnessEvent) {}
}

/// Lock-free event queue that can be awaited.
///
/// The queue stays open until [`EventQueue::close`]; events queued before
/// that are still delivered.
pub struct EventQueue {
   queue: SegQueue<HarnessEvent>,
   notifier: Notify,
   closed: AtomicCell<bool>,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         closed: AtomicCell::new(false),
      })
   }

   /// Stops accepting events and wakes every waiting receiver.
   pub fn close(&self) {
      self.closed.store(true);
      self.notifier.notify_waiters();
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load()
   }

   /// Pops an event without waiting.
   pub fn try_recv(&self) -> Option<HarnessEvent> {
      self.queue.pop()
   }

   /// Waits for the next event; `None` once the queue is closed and empty.
   pub async fn recv(&self) -> Option<HarnessEvent> {
      loop {
         // Registered before the checks so an emit or close in between wakes it
         let notified = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if self.is_closed() {
            return None;
         }
         notified.await;
      }
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: HarnessEvent) {
      if self.is_closed() {
         debug!("Event queue closed, dropping {event:?}");
         return;
      }
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;

   #[tokio::test]
   async fn test_queue_delivers_in_order() {
      let queue = EventQueue::new();
      let sender: EventSender = queue.clone();

      sender.emit(HarnessEvent::DeviceFound(Address::any()));
      sender.emit(HarnessEvent::MeasurementIntervalWritten(7));

      assert_eq!(
         queue.recv().await,
         Some(HarnessEvent::DeviceFound(Address::any()))
      );
      assert_eq!(
         queue.recv().await,
         Some(HarnessEvent::MeasurementIntervalWritten(7))
      );
      assert!(queue.try_recv().is_none());
   }

   #[tokio::test]
   async fn test_recv_wakes_on_emit() {
      let queue = EventQueue::new();
      let sender = queue.clone();

      let waiter = tokio::spawn({
         let queue = queue.clone();
         async move { queue.recv().await }
      });
      time::sleep(Duration::from_millis(20)).await;
      sender.emit(HarnessEvent::AlertLevelWritten(AlertLevel::High));

      let got = waiter.await.unwrap();
      assert_eq!(got, Some(HarnessEvent::AlertLevelWritten(AlertLevel::High)));
   }

   #[tokio::test]
   async fn test_recv_drains_then_ends_after_close() {
      let queue = EventQueue::new();
      queue.emit(HarnessEvent::MeasurementIntervalWritten(1));
      queue.close();
      queue.emit(HarnessEvent::MeasurementIntervalWritten(2));

      assert_eq!(
         queue.recv().await,
         Some(HarnessEvent::MeasurementIntervalWritten(1))
      );
      assert_eq!(queue.recv().await, None);
      assert_eq!(queue.recv().await, None);
   }

   #[tokio::test]
   async fn test_close_wakes_waiting_receiver() {
      let queue = EventQueue::new();
      let waiter = tokio::spawn({
         let queue = queue.clone();
         async move { queue.recv().await }
      });
      time::sleep(Duration::from_millis(20)).await;
      assert!(!waiter.is_finished());

      queue.close();
      let got = time::timeout(Duration::from_secs(1), waiter).await;
      assert_eq!(got.unwrap().unwrap(), None);
   }

   #[tokio::test(start_paused = true)]
   async fn test_open_queue_keeps_waiting() {
      let queue = EventQueue::new();
      // Only the receiver holds the queue, yet it stays open
      let pending = time::timeout(Duration::from_secs(60), queue.recv()).await;
      assert!(pending.is_err());
   }
}
