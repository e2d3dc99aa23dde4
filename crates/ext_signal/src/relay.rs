//! Channel-backed signals
//!
//! A relay owns one background thread that receives from a channel and
//! forwards every message to [`Signal::emit`]. Closing the relay drains
//! what is already queued, joins the thread and closes the signal.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use ext_variant::Value;

use crate::error::{Result, SignalError};
use crate::signal::Signal;

/// Message accepted by a relay channel
pub enum Relayed {
    /// Arguments to emit as-is
    Values(Vec<Value>),
    /// Closure producing the arguments, run on the relay thread
    Thunk(Box<dyn FnOnce() -> Vec<Value> + Send>),
}

impl Relayed {
    fn into_args(self) -> Vec<Value> {
        match self {
            Relayed::Values(values) => values,
            Relayed::Thunk(f) => f(),
        }
    }
}

impl From<Vec<Value>> for Relayed {
    fn from(values: Vec<Value>) -> Self {
        Relayed::Values(values)
    }
}

/// Observes whether a relay thread is still running
#[derive(Clone)]
pub struct RelayWatch(Weak<()>);

impl RelayWatch {
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Background relay from a channel into a signal
pub struct ChannelRelay {
    signal: Signal,
    sender: Sender<Relayed>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    watch: RelayWatch,
}

impl ChannelRelay {
    /// Start relaying into `signal`. A capacity of zero means unbounded.
    pub fn spawn(signal: Signal, capacity: usize) -> Result<Self> {
        let (tx, rx) = if capacity == 0 {
            unbounded()
        } else {
            bounded(capacity)
        };
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let token = Arc::new(());
        let watch = RelayWatch(Arc::downgrade(&token));

        let relay_signal = signal.clone();
        let handle = thread::Builder::new()
            .name(format!("relay-{}", signal.name()))
            .spawn(move || {
                let _token = token;
                run_relay(relay_signal, rx, shutdown_rx);
            })
            .map_err(|e| SignalError::Spawn {
                signal: signal.name().to_owned(),
                message: e.to_string(),
            })?;

        log::debug!("Relay started for signal '{}'", signal.name());
        Ok(Self {
            signal,
            sender: tx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            watch,
        })
    }

    /// Sending half handed to user code
    pub fn sender(&self) -> Sender<Relayed> {
        self.sender.clone()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn watch(&self) -> RelayWatch {
        self.watch.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.watch.is_alive()
    }

    /// Stop the relay and wait for its thread. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Relay for signal '{}' panicked", self.signal.name());
            }
            log::debug!("Relay stopped for signal '{}'", self.signal.name());
        }
    }
}

impl Drop for ChannelRelay {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sending half of a channel-backed signal, held by user code
///
/// Unwired senders (before the owning instance exists, or after it is
/// freed) reject every message.
#[derive(Clone, Default)]
pub struct SignalSender {
    name: String,
    tx: Option<Sender<Relayed>>,
}

impl SignalSender {
    pub fn new(name: impl Into<String>, tx: Sender<Relayed>) -> Self {
        Self {
            name: name.into(),
            tx: Some(tx),
        }
    }

    pub fn is_wired(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `args` for emission on the relay thread
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        self.push(Relayed::Values(args))
    }

    /// Queue a closure whose result is emitted on the relay thread
    pub fn send_with<F>(&self, produce: F) -> Result<()>
    where
        F: FnOnce() -> Vec<Value> + Send + 'static,
    {
        self.push(Relayed::Thunk(Box::new(produce)))
    }

    fn push(&self, message: Relayed) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SignalError::Closed(self.name.clone()))?;
        tx.send(message)
            .map_err(|_| SignalError::Closed(self.name.clone()))
    }
}

impl std::fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSender")
            .field("name", &self.name)
            .field("wired", &self.is_wired())
            .finish()
    }
}

fn forward(signal: &Signal, message: Relayed) {
    let args = message.into_args();
    if let Err(e) = signal.emit(&args) {
        log::warn!("Relay emit on '{}' failed: {e}", signal.name());
    }
}

fn run_relay(signal: Signal, rx: Receiver<Relayed>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(rx) -> message => match message {
                Ok(message) => forward(&signal, message),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for message in rx.try_iter() {
                    forward(&signal, message);
                }
                break;
            }
        }
    }
    signal.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredQueue;
    use crate::flags::ConsumerFlags;
    use ext_variant::Callable;
    use parking_lot::Mutex;

    #[test]
    fn test_relay_forwards_and_closes() {
        let signal = Signal::with_queue("scored", DeferredQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        signal
            .attach(
                Callable::from_fn(move |args| {
                    sink.lock().extend_from_slice(args);
                    Ok(Value::Nil)
                }),
                ConsumerFlags::NONE,
            )
            .unwrap();

        let mut relay = ChannelRelay::spawn(signal.clone(), 8).unwrap();
        let tx = relay.sender();
        tx.send(vec![Value::Int(1)].into()).unwrap();
        tx.send(Relayed::Thunk(Box::new(|| vec![Value::Int(2)]))).unwrap();
        let watch = relay.watch();
        relay.close();

        assert!(!watch.is_alive());
        assert!(signal.is_closed());
        assert_eq!(*seen.lock(), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_unwired_sender_rejects() {
        let sender = SignalSender::default();
        assert!(!sender.is_wired());
        assert!(matches!(
            sender.send(vec![Value::Nil]),
            Err(SignalError::Closed(_))
        ));
    }

    #[test]
    fn test_signal_sender_thunk() {
        let signal = Signal::with_queue("ticked", DeferredQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        signal
            .attach(
                Callable::from_fn(move |args| {
                    sink.lock().extend_from_slice(args);
                    Ok(Value::Nil)
                }),
                ConsumerFlags::NONE,
            )
            .unwrap();
        let mut relay = ChannelRelay::spawn(signal, 0).unwrap();
        let sender = SignalSender::new("ticked", relay.sender());
        sender.send_with(|| vec![Value::Int(7)]).unwrap();
        relay.close();
        assert_eq!(*seen.lock(), vec![Value::Int(7)]);
    }

    #[test]
    fn test_close_returns_while_user_holds_sender() {
        let signal = Signal::with_queue("held", DeferredQueue::new());
        let mut relay = ChannelRelay::spawn(signal, 0).unwrap();
        let _kept = relay.sender();
        relay.close();
        assert!(!relay.is_running());
        relay.close();
    }
}
