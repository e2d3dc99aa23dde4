//! Local to proxied transition

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ext_signal::*;
use ext_variant::{Callable, ObjectId, Value};
use parking_lot::Mutex;

/// Engine stand-in keeping its own connection list
#[derive(Default)]
struct FakeEngineSignal {
    connections: Mutex<Vec<Consumer>>,
    released: AtomicUsize,
}

impl SignalBackend for FakeEngineSignal {
    fn connect(&self, consumer: &Consumer) -> Result<()> {
        self.connections.lock().push(consumer.clone());
        Ok(())
    }

    fn disconnect(&self, callable: &Callable) {
        self.connections.lock().retain(|c| c.callable != *callable);
    }

    fn is_connected(&self, callable: &Callable) -> bool {
        self.connections.lock().iter().any(|c| c.callable == *callable)
    }

    fn emit(&self, args: &[Value]) -> Result<()> {
        let snapshot = self.connections.lock().clone();
        for consumer in snapshot {
            consumer.callable.call(args)?;
            if consumer.is_one_shot() {
                self.disconnect(&consumer.callable);
            }
        }
        Ok(())
    }

    fn connections(&self) -> Vec<Consumer> {
        self.connections.lock().clone()
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeHost {
    backend: Arc<FakeEngineSignal>,
    proxies: AtomicUsize,
}

impl SignalHost for FakeHost {
    fn proxy(&self, _signal: &str) -> Result<Arc<dyn SignalBackend>> {
        self.proxies.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.clone())
    }
}

fn counting() -> (Callable, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    (
        Callable::from_fn(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Nil)
        }),
        hits,
    )
}

fn host() -> Arc<FakeHost> {
    Arc::new(FakeHost {
        backend: Arc::new(FakeEngineSignal::default()),
        proxies: AtomicUsize::new(0),
    })
}

#[test]
fn test_transition_preserves_delivery() {
    let _ = env_logger::builder().is_test(true).try_init();
    let signal = Signal::with_queue("health_changed", DeferredQueue::new());
    let (early, early_hits) = counting();
    signal.attach(early, ConsumerFlags::NONE).unwrap();
    signal.emit(&[]).unwrap();
    assert!(!signal.is_proxied());

    let host = host();
    signal.bind(ObjectId(42), host.clone());
    assert_eq!(signal.emitter(), Value::Object(ObjectId(42)));

    signal.emit(&[]).unwrap();
    assert!(signal.is_proxied());
    signal.emit(&[]).unwrap();

    assert_eq!(early_hits.load(Ordering::SeqCst), 3);
    assert_eq!(host.proxies.load(Ordering::SeqCst), 1);
    assert_eq!(signal.consumers().count(), 1);
}

#[test]
fn test_duplicate_detected_after_transition() {
    let signal = Signal::with_queue("hit", DeferredQueue::new());
    let (callable, _) = counting();
    signal.attach(callable.clone(), ConsumerFlags::NONE).unwrap();
    signal.bind(ObjectId(7), host());
    assert!(matches!(
        signal.attach(callable.clone(), ConsumerFlags::NONE),
        Err(SignalError::AlreadyConnected { .. })
    ));
    assert!(signal.is_proxied());
    signal.remove(&callable);
    assert_eq!(signal.consumers().count(), 0);
}

#[test]
fn test_racing_first_uses_upgrade_once() {
    let signal = Signal::with_queue("race", DeferredQueue::new());
    let (callable, hits) = counting();
    signal.attach(callable, ConsumerFlags::NONE).unwrap();
    let host = host();
    signal.bind(ObjectId(1), host.clone());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| signal.emit(&[]).unwrap());
        }
    });

    assert_eq!(host.proxies.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 8);
    assert_eq!(host.backend.connections().len(), 1);
}

#[test]
fn test_close_releases_engine_signal() {
    let signal = Signal::with_queue("bye", DeferredQueue::new());
    let host = host();
    signal.bind(ObjectId(3), host.clone());
    signal.emit(&[]).unwrap();
    signal.close();
    assert_eq!(host.backend.released.load(Ordering::SeqCst), 1);
}
