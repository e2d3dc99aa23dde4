//! Local-first signals
//!
//! A signal starts **Local**: consumers live in an in-process list and
//! `emit` calls them directly. Once the owning object exists in the engine
//! the signal is bound to a [`SignalHost`], and the next `attach` or `emit`
//! moves every pending consumer onto an engine-native [`SignalBackend`].
//! The move happens once and is never reversed.
//!
//! ```text
//!   Local ──(first attach/emit after bind)──▶ Proxied ──(close)──▶ Closed
//!     └──────────────────────(close)─────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ext_variant::{Callable, ObjectId, Value};
use parking_lot::RwLock;

use crate::deferred::DeferredQueue;
use crate::error::{Result, SignalError};
use crate::flags::ConsumerFlags;

/// A subscription to a signal
#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub callable: Callable,
    pub flags: ConsumerFlags,
}

impl Consumer {
    pub fn new(callable: Callable, flags: ConsumerFlags) -> Self {
        Self { callable, flags }
    }

    pub fn is_deferred(&self) -> bool {
        self.flags.contains(ConsumerFlags::DEFERRED)
    }

    pub fn is_one_shot(&self) -> bool {
        self.flags.contains(ConsumerFlags::ONE_SHOT)
    }
}

/// Engine-native signal a local signal hands its consumers to
pub trait SignalBackend: Send + Sync {
    fn connect(&self, consumer: &Consumer) -> Result<()>;
    fn disconnect(&self, callable: &Callable);
    fn is_connected(&self, callable: &Callable) -> bool;
    fn emit(&self, args: &[Value]) -> Result<()>;
    fn connections(&self) -> Vec<Consumer>;

    /// Called once when the owning signal closes
    fn release(&self) {}
}

/// Creates engine-native signals for an object
pub trait SignalHost: Send + Sync {
    fn proxy(&self, signal: &str) -> Result<Arc<dyn SignalBackend>>;
}

struct Entry {
    consumer: Consumer,
    fired: AtomicBool,
}

enum SignalState {
    Local {
        entries: Vec<Arc<Entry>>,
        host: Option<Arc<dyn SignalHost>>,
    },
    Proxied(Arc<dyn SignalBackend>),
    Closed,
}

struct Inner {
    name: String,
    emitter: RwLock<Value>,
    deferred: DeferredQueue,
    state: RwLock<SignalState>,
}

/// Named, many-consumer event stream. Clones share state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    /// Local signal whose deferred deliveries go to the global queue
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_queue(name, DeferredQueue::global().clone())
    }

    /// Local signal with its own deferred queue
    pub fn with_queue(name: impl Into<String>, deferred: DeferredQueue) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                emitter: RwLock::new(Value::Nil),
                deferred,
                state: RwLock::new(SignalState::Local {
                    entries: Vec::new(),
                    host: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Object that emits this signal, `Nil` until bound
    pub fn emitter(&self) -> Value {
        self.inner.emitter.read().clone()
    }

    pub fn is_proxied(&self) -> bool {
        matches!(*self.inner.state.read(), SignalState::Proxied(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.read(), SignalState::Closed)
    }

    /// Record the engine object owning this signal. The switch to the
    /// engine-native signal happens on next use.
    pub fn bind(&self, owner: ObjectId, host: Arc<dyn SignalHost>) {
        *self.inner.emitter.write() = Value::Object(owner);
        let mut state = self.inner.state.write();
        if let SignalState::Local { host: slot, .. } = &mut *state {
            *slot = Some(host);
        }
    }

    fn pending_upgrade(&self) -> bool {
        matches!(
            &*self.inner.state.read(),
            SignalState::Local { host: Some(_), .. }
        )
    }

    /// Move local consumers to the engine. Re-checks under the write lock
    /// so two racing first uses upgrade exactly once.
    fn upgrade(&self) -> Result<()> {
        if !self.pending_upgrade() {
            return Ok(());
        }
        let mut state = self.inner.state.write();
        let (entries, host) = match &*state {
            SignalState::Local {
                entries,
                host: Some(host),
            } => (entries.clone(), host.clone()),
            _ => return Ok(()),
        };
        let backend = host.proxy(&self.inner.name)?;
        for entry in entries.iter().filter(|e| !e.fired.load(Ordering::Acquire)) {
            backend.connect(&entry.consumer)?;
        }
        log::debug!(
            "Signal '{}' proxied with {} consumers",
            self.inner.name,
            entries.len()
        );
        *state = SignalState::Proxied(backend);
        Ok(())
    }

    /// Subscribe `callable`. Attaching the same callable twice fails.
    pub fn attach(&self, callable: Callable, flags: ConsumerFlags) -> Result<()> {
        self.upgrade()?;
        let mut state = self.inner.state.write();
        match &mut *state {
            SignalState::Local { entries, .. } => {
                if entries.iter().any(|e| e.consumer.callable == callable) {
                    return Err(self.already_connected(&callable));
                }
                entries.push(Arc::new(Entry {
                    consumer: Consumer::new(callable, flags),
                    fired: AtomicBool::new(false),
                }));
                Ok(())
            }
            SignalState::Proxied(backend) => {
                if backend.is_connected(&callable) {
                    return Err(self.already_connected(&callable));
                }
                backend.connect(&Consumer::new(callable, flags))
            }
            SignalState::Closed => Err(SignalError::Closed(self.inner.name.clone())),
        }
    }

    fn already_connected(&self, callable: &Callable) -> SignalError {
        SignalError::AlreadyConnected {
            signal: self.inner.name.clone(),
            callable: callable.id(),
        }
    }

    /// Unsubscribe every entry for `callable`. Absent callables are ignored.
    pub fn remove(&self, callable: &Callable) {
        let mut state = self.inner.state.write();
        match &mut *state {
            SignalState::Local { entries, .. } => {
                entries.retain(|e| e.consumer.callable != *callable);
            }
            SignalState::Proxied(backend) => {
                if backend.is_connected(callable) {
                    backend.disconnect(callable);
                }
            }
            SignalState::Closed => {}
        }
    }

    /// Deliver `args` to every consumer
    pub fn emit(&self, args: &[Value]) -> Result<()> {
        self.upgrade()?;
        let target = match &*self.inner.state.read() {
            SignalState::Local { entries, .. } => Ok(entries.clone()),
            SignalState::Proxied(backend) => Err(backend.clone()),
            SignalState::Closed => return Err(SignalError::Closed(self.inner.name.clone())),
        };
        let snapshot = match target {
            Ok(entries) => entries,
            Err(backend) => return backend.emit(args),
        };

        let mut spent = false;
        for entry in &snapshot {
            if entry.consumer.is_one_shot() {
                if entry.fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                spent = true;
            }
            if entry.consumer.is_deferred() {
                let callable = entry.consumer.callable.clone();
                let args = args.to_vec();
                let name = self.inner.name.clone();
                self.inner.deferred.push(move || {
                    if let Err(e) = callable.call(&args) {
                        log::warn!("Deferred consumer of '{name}' failed: {e}");
                    }
                });
            } else if let Err(e) = entry.consumer.callable.call(args) {
                log::warn!("Consumer of '{}' failed: {e}", self.inner.name);
            }
        }

        if spent {
            if let SignalState::Local { entries, .. } = &mut *self.inner.state.write() {
                entries.retain(|e| !e.fired.load(Ordering::Acquire));
            }
        }
        Ok(())
    }

    /// Snapshot of current consumers
    pub fn consumers(&self) -> impl Iterator<Item = Consumer> {
        let list: Vec<Consumer> = match &*self.inner.state.read() {
            SignalState::Local { entries, .. } => entries
                .iter()
                .filter(|e| !e.fired.load(Ordering::Acquire))
                .map(|e| e.consumer.clone())
                .collect(),
            SignalState::Proxied(backend) => backend.connections(),
            SignalState::Closed => Vec::new(),
        };
        list.into_iter()
    }

    /// Drop every consumer and release the engine-side signal
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), SignalState::Closed);
        if let SignalState::Proxied(backend) = previous {
            backend.release();
        }
    }
}

impl Default for Signal {
    /// Unnamed local signal, replaced when the owning instance is created
    fn default() -> Self {
        Self::new("")
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("proxied", &self.is_proxied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Callable, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let callable = Callable::from_fn(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Nil)
        });
        (callable, hits)
    }

    #[test]
    fn test_immediate_and_one_shot() {
        let signal = Signal::with_queue("changed", DeferredQueue::new());
        let (immediate, immediate_hits) = counter();
        let (once, once_hits) = counter();
        signal.attach(immediate, ConsumerFlags::NONE).unwrap();
        signal.attach(once.clone(), ConsumerFlags::ONE_SHOT).unwrap();

        signal.emit(&[]).unwrap();
        assert!(!signal.consumers().any(|c| c.callable == once));
        signal.emit(&[]).unwrap();

        assert_eq!(immediate_hits.load(Ordering::SeqCst), 2);
        assert_eq!(once_hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.consumers().count(), 1);
    }

    #[test]
    fn test_duplicate_attach() {
        let signal = Signal::with_queue("hit", DeferredQueue::new());
        let (callable, _) = counter();
        signal.attach(callable.clone(), ConsumerFlags::NONE).unwrap();
        let err = signal.attach(callable.clone(), ConsumerFlags::DEFERRED).unwrap_err();
        assert!(matches!(err, SignalError::AlreadyConnected { .. }));
        assert_eq!(signal.consumers().count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let signal = Signal::with_queue("hit", DeferredQueue::new());
        let (callable, hits) = counter();
        signal.attach(callable.clone(), ConsumerFlags::NONE).unwrap();
        signal.remove(&callable);
        signal.remove(&callable);
        signal.emit(&[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deferred_waits_for_flush() {
        let queue = DeferredQueue::new();
        let signal = Signal::with_queue("later", queue.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callable = Callable::from_fn(move |args| {
            sink.lock().push(args[0].clone());
            Ok(Value::Nil)
        });
        signal.attach(callable, ConsumerFlags::DEFERRED).unwrap();
        signal.emit(&[Value::Int(1)]).unwrap();
        signal.emit(&[Value::Int(2)]).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(queue.flush(), 2);
        assert_eq!(*seen.lock(), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_closed_signal_rejects_use() {
        let signal = Signal::with_queue("gone", DeferredQueue::new());
        signal.close();
        assert!(signal.is_closed());
        let (callable, _) = counter();
        assert_eq!(
            signal.attach(callable, ConsumerFlags::NONE),
            Err(SignalError::Closed("gone".into()))
        );
        assert!(signal.emit(&[]).is_err());
    }

    #[test]
    fn test_emit_from_many_threads() {
        let signal = Signal::with_queue("busy", DeferredQueue::new());
        let (callable, hits) = counter();
        let (once, once_hits) = counter();
        signal.attach(callable, ConsumerFlags::NONE).unwrap();
        signal.attach(once, ConsumerFlags::ONE_SHOT).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        signal.emit(&[]).unwrap();
                    }
                });
            }
        });
        assert_eq!(hits.load(Ordering::SeqCst), 800);
        assert_eq!(once_hits.load(Ordering::SeqCst), 1);
    }
}
