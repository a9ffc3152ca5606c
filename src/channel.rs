//! Hardware control channel abstraction.
//!
//! All hardware interaction in this crate is expressed through the
//! [`ChannelAccess`] trait: a synchronous get/put/subscribe service for named
//! remote values. The orchestration core never encodes the wire protocol;
//! each hierarchy node computes the channel names it needs from its position
//! (linac, cryomodule, cavity number) once at construction and binds them
//! eagerly, so connection problems surface as a fallible construction outcome
//! instead of deferred `None` checks at first use.
//!
//! [`SimChannelService`] is the in-memory implementation used by the tests
//! and the simulation binary. It records every put (so tests can assert that
//! a rejected run issued no hardware writes) and supports put-failure
//! injection per channel.

use crate::error::{SetupError, SetupResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Value carried by a control channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelValue {
    /// Analog value (amplitudes, detune, loaded Q, ...).
    Float(f64),
    /// Discrete value (strobes, state enums, step counts).
    Int(i64),
    /// Free-text value.
    Text(String),
}

impl ChannelValue {
    /// Numeric view of the value; `Int` coerces, `Text` does not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Text(_) => None,
        }
    }

    /// Integer view of the value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Float(v) => Some(*v as i64),
            ChannelValue::Int(v) => Some(*v),
            ChannelValue::Text(_) => None,
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Float(v)
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        ChannelValue::Int(v)
    }
}

/// Callback invoked with each new value of a subscribed channel.
pub type ChannelCallback = Box<dyn Fn(&ChannelValue) + Send + Sync>;

/// Synchronous access to named hardware control channels.
///
/// Implementations wrap the actual control-system client. Calls are expected
/// to be fast (local gets, queued puts); long waits belong in the procedures,
/// not in the channel layer.
pub trait ChannelAccess: Send + Sync {
    /// Establish a binding for `name`. Called once per channel at node
    /// construction; an error here fails the whole hierarchy build.
    fn bind(&self, name: &str) -> SetupResult<()>;

    /// Read the current value of `name`.
    fn get(&self, name: &str) -> SetupResult<ChannelValue>;

    /// Write `value` to `name`.
    fn put(&self, name: &str, value: ChannelValue) -> SetupResult<()>;

    /// Register `callback` to run on every subsequent write to `name`.
    fn subscribe(&self, name: &str, callback: ChannelCallback) -> SetupResult<()>;
}

/// In-memory channel service for tests and the simulation binary.
///
/// Unbound channels read as an error; [`bind`](ChannelAccess::bind) seeds a
/// channel with `Float(0.0)` if it has no value yet, which keeps the
/// simulated machine in a benign state (RF off, no faults, motor idle).
#[derive(Default)]
pub struct SimChannelService {
    values: RwLock<HashMap<String, ChannelValue>>,
    put_log: Mutex<Vec<(String, ChannelValue)>>,
    failing_puts: RwLock<Vec<String>>,
    subscribers: Mutex<HashMap<String, Vec<Arc<dyn Fn(&ChannelValue) + Send + Sync>>>>,
}

impl SimChannelService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly set a channel value without logging a put or notifying
    /// subscribers. Tests use this to arrange hardware state.
    pub fn set(&self, name: &str, value: ChannelValue) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value);
        }
    }

    /// Make every subsequent put to `name` fail with a channel error.
    pub fn fail_puts_to(&self, name: &str) {
        if let Ok(mut failing) = self.failing_puts.write() {
            failing.push(name.to_string());
        }
    }

    /// All puts issued so far, in order.
    pub fn puts(&self) -> Vec<(String, ChannelValue)> {
        self.put_log.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Puts issued to channels whose name contains `fragment`.
    pub fn puts_matching(&self, fragment: &str) -> Vec<(String, ChannelValue)> {
        self.puts()
            .into_iter()
            .filter(|(name, _)| name.contains(fragment))
            .collect()
    }

    /// Forget the put history (e.g. after hierarchy construction).
    pub fn clear_puts(&self) {
        if let Ok(mut log) = self.put_log.lock() {
            log.clear();
        }
    }
}

impl ChannelAccess for SimChannelService {
    fn bind(&self, name: &str) -> SetupResult<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| SetupError::Channel(format!("{name}: value map poisoned")))?;
        values
            .entry(name.to_string())
            .or_insert(ChannelValue::Float(0.0));
        Ok(())
    }

    fn get(&self, name: &str) -> SetupResult<ChannelValue> {
        let values = self
            .values
            .read()
            .map_err(|_| SetupError::Channel(format!("{name}: value map poisoned")))?;
        values
            .get(name)
            .cloned()
            .ok_or_else(|| SetupError::Channel(format!("{name}: not bound")))
    }

    fn put(&self, name: &str, value: ChannelValue) -> SetupResult<()> {
        {
            let failing = self
                .failing_puts
                .read()
                .map_err(|_| SetupError::Channel(format!("{name}: failure list poisoned")))?;
            if failing.iter().any(|f| f == name) {
                return Err(SetupError::Channel(format!("{name}: put rejected")));
            }
        }

        if let Ok(mut log) = self.put_log.lock() {
            log.push((name.to_string(), value.clone()));
        }
        self.set(name, value.clone());

        // Snapshot the callbacks so a subscriber that itself calls `put`
        // does not deadlock on the subscriber map.
        let callbacks: Vec<_> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .get(name)
                .map(|c| c.iter().map(Arc::clone).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for callback in callbacks {
            callback(&value);
        }
        Ok(())
    }

    fn subscribe(&self, name: &str, callback: ChannelCallback) -> SetupResult<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| SetupError::Channel(format!("{name}: subscriber map poisoned")))?;
        subscribers
            .entry(name.to_string())
            .or_default()
            .push(Arc::from(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bind_seeds_default_and_get_roundtrip() {
        let service = SimChannelService::new();
        service.bind("ACCL:L0B:0110:ADES").unwrap();
        assert_eq!(
            service.get("ACCL:L0B:0110:ADES").unwrap(),
            ChannelValue::Float(0.0)
        );
        assert!(service.get("ACCL:L0B:0110:AACT").is_err());
    }

    #[test]
    fn test_put_logs_and_notifies_subscribers() {
        let service = SimChannelService::new();
        service.bind("CH").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        service
            .subscribe(
                "CH",
                Box::new(move |_| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        service.put("CH", ChannelValue::Float(1.5)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(service.puts().len(), 1);
        assert_eq!(service.get("CH").unwrap(), ChannelValue::Float(1.5));
    }

    #[test]
    fn test_subscriber_may_put_from_its_callback() {
        let service = Arc::new(SimChannelService::new());
        service.bind("TRIGGER").unwrap();
        service.bind("ECHO").unwrap();

        let echo = Arc::clone(&service);
        service
            .subscribe(
                "TRIGGER",
                Box::new(move |value| {
                    let _ = echo.put("ECHO", value.clone());
                }),
            )
            .unwrap();

        service.put("TRIGGER", ChannelValue::Int(7)).unwrap();
        assert_eq!(service.get("ECHO").unwrap(), ChannelValue::Int(7));
        assert_eq!(service.puts().len(), 2);
    }

    #[test]
    fn test_put_failure_injection() {
        let service = SimChannelService::new();
        service.bind("CH").unwrap();
        service.fail_puts_to("CH");
        assert!(service.put("CH", ChannelValue::Int(1)).is_err());
        // Rejected puts never reach the log.
        assert!(service.puts().is_empty());
    }
}
