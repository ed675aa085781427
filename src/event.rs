//! Named events: registration, synchronous callback fan-out, blocking waits.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use fxhash::FxBuildHasher;
use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, Result};

/// Opaque application-defined event identifier.
pub type Event = u64;

/// Reserved identifier, registered on every manager.
pub const EVENT_NULL: Event = 0;

/// Data attached to an emission, handed to every callback by reference.
pub type EventPayload = Option<Arc<dyn Any + Send + Sync>>;

/// Callback invoked synchronously on the emitting thread.
pub type EventCallback = Arc<dyn Fn(&EventPayload) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct EventFlag {
    fired: Mutex<bool>,
    cv: Condvar,
}

struct EventSlot {
    callbacks: Vec<EventCallback>,
    flag: Arc<EventFlag>,
}

/// Event table of one pipeline: each registered event carries its callback
/// list (kept in registration order) and a broadcastable fired flag.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct EventManager {
    #[derivative(Debug = "ignore")]
    table: Mutex<HashMap<Event, EventSlot, FxBuildHasher>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> EventManager {
        let manager = EventManager {
            table: Mutex::new(HashMap::default()),
        };
        // the reserved null event always exists
        let _ = manager.register_event(EVENT_NULL);
        manager
    }

    /// Register `event`. Re-registration is a no-op and keeps any callbacks
    /// already attached.
    pub fn register_event(&self, event: Event) -> Result<()> {
        let mut table = self.table.lock();
        table.entry(event).or_insert_with(|| EventSlot {
            callbacks: Vec::new(),
            flag: Arc::new(EventFlag::default()),
        });
        Ok(())
    }

    pub fn is_registered(&self, event: Event) -> bool {
        self.table.lock().contains_key(&event)
    }

    /// Attach a callback; rejected when `event` was never registered.
    pub fn register_callback(&self, event: Event, callback: EventCallback) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table
            .get_mut(&event)
            .ok_or(PipelineError::EventNotFound(event))?;
        slot.callbacks.push(callback);
        Ok(())
    }

    /// Invoke every callback of `event` on the calling thread, in
    /// registration order, then set the fired flag and release waiters.
    ///
    /// A failing callback is logged and counted but does not stop the
    /// fan-out; the total is reported as
    /// [`PipelineError::CallbackFail`].
    pub fn emit_event(&self, event: Event, data: &EventPayload) -> Result<()> {
        let (callbacks, flag) = {
            let table = self.table.lock();
            let slot = table
                .get(&event)
                .ok_or(PipelineError::EventNotFound(event))?;
            (slot.callbacks.clone(), slot.flag.clone())
        };

        let total = callbacks.len();
        let mut failed = 0;
        for (idx, callback) in callbacks.iter().enumerate() {
            if let Err(e) = callback(data) {
                failed += 1;
                error!("callback {idx} for event {event:#x} failed: {e}");
            }
        }

        {
            let mut fired = flag.fired.lock();
            *fired = true;
            flag.cv.notify_all();
        }

        if failed > 0 {
            Err(PipelineError::CallbackFail { failed, total })
        } else {
            Ok(())
        }
    }

    /// Block until `event` has been emitted at least once. Returns
    /// immediately when it already has.
    pub fn wait_for_event(&self, event: Event) -> Result<()> {
        let flag = {
            let table = self.table.lock();
            table
                .get(&event)
                .ok_or(PipelineError::EventNotFound(event))?
                .flag
                .clone()
        };
        let mut fired = flag.fired.lock();
        while !*fired {
            flag.cv.wait(&mut fired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EVENT_EOF: Event = 0x3;

    #[test]
    fn callbacks_require_a_registered_event() {
        let manager = EventManager::new();
        let callback: EventCallback = Arc::new(|_| Ok(()));
        assert!(matches!(
            manager.register_callback(EVENT_EOF, callback.clone()),
            Err(PipelineError::EventNotFound(EVENT_EOF))
        ));
        manager.register_event(EVENT_EOF).unwrap();
        manager.register_callback(EVENT_EOF, callback).unwrap();
    }

    #[test]
    fn emit_rejects_unknown_events() {
        let manager = EventManager::new();
        assert!(matches!(
            manager.emit_event(0x99, &None),
            Err(PipelineError::EventNotFound(0x99))
        ));
    }

    #[test]
    fn re_registration_keeps_callbacks() {
        let manager = EventManager::new();
        manager.register_event(EVENT_EOF).unwrap();
        let hits = Arc::new(Mutex::new(0));
        {
            let hits = hits.clone();
            manager
                .register_callback(
                    EVENT_EOF,
                    Arc::new(move |_| {
                        *hits.lock() += 1;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        manager.register_event(EVENT_EOF).unwrap();
        manager.emit_event(EVENT_EOF, &None).unwrap();
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let manager = EventManager::new();
        manager.register_event(EVENT_EOF).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            manager
                .register_callback(
                    EVENT_EOF,
                    Arc::new(move |_| {
                        order.lock().push(tag);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        manager.emit_event(EVENT_EOF, &None).unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn a_failing_callback_does_not_stop_the_fanout() {
        let manager = EventManager::new();
        manager.register_event(EVENT_EOF).unwrap();
        manager
            .register_callback(EVENT_EOF, Arc::new(|_| Err(PipelineError::Failure)))
            .unwrap();
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = ran.clone();
            manager
                .register_callback(
                    EVENT_EOF,
                    Arc::new(move |_| {
                        *ran.lock() = true;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let result = manager.emit_event(EVENT_EOF, &None);
        assert!(matches!(
            result,
            Err(PipelineError::CallbackFail {
                failed: 1,
                total: 2
            })
        ));
        assert!(*ran.lock());
    }

    #[test]
    fn wait_returns_once_emitted() {
        let manager = Arc::new(EventManager::new());
        manager.register_event(EVENT_EOF).unwrap();
        let waiter = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.wait_for_event(EVENT_EOF))
        };
        std::thread::sleep(Duration::from_millis(20));
        manager.emit_event(EVENT_EOF, &None).unwrap();
        waiter.join().unwrap().unwrap();
        // already fired, returns immediately
        manager.wait_for_event(EVENT_EOF).unwrap();
    }

    #[test]
    fn payload_reaches_the_callbacks() {
        let manager = EventManager::new();
        manager.register_event(EVENT_EOF).unwrap();
        let seen = Arc::new(Mutex::new(0u32));
        {
            let seen = seen.clone();
            manager
                .register_callback(
                    EVENT_EOF,
                    Arc::new(move |data| {
                        let value = data
                            .as_ref()
                            .and_then(|d| d.downcast_ref::<u32>())
                            .copied()
                            .ok_or(PipelineError::Failure)?;
                        *seen.lock() = value;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        manager
            .emit_event(EVENT_EOF, &Some(Arc::new(1234u32)))
            .unwrap();
        assert_eq!(*seen.lock(), 1234);
    }
}
