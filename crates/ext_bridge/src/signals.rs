//! Engine-native signal backends
//!
//! Instance signals start local. Once the instance is paired with its
//! engine object they are bound to an [`EngineSignalHost`], and the first
//! use hands their consumers to the engine's signal of the same name.

use std::sync::Arc;

use ext_signal::{Consumer, SignalBackend, SignalError, SignalHost};
use ext_variant::{Callable, ObjectId, Value};

use crate::engine::EngineInterface;

/// Creates engine-native signals on one object
pub struct EngineSignalHost {
    engine: Arc<dyn EngineInterface>,
    object: ObjectId,
}

impl EngineSignalHost {
    pub fn new(engine: Arc<dyn EngineInterface>, object: ObjectId) -> Self {
        Self { engine, object }
    }
}

impl SignalHost for EngineSignalHost {
    fn proxy(&self, signal: &str) -> ext_signal::Result<Arc<dyn SignalBackend>> {
        Ok(Arc::new(EngineSignal {
            engine: self.engine.clone(),
            object: self.object,
            name: signal.to_owned(),
        }))
    }
}

/// A signal owned by the engine
pub struct EngineSignal {
    engine: Arc<dyn EngineInterface>,
    object: ObjectId,
    name: String,
}

impl EngineSignal {
    fn backend_error(&self, err: crate::BridgeError) -> SignalError {
        SignalError::backend(&self.name, err.to_string())
    }
}

impl SignalBackend for EngineSignal {
    fn connect(&self, consumer: &Consumer) -> ext_signal::Result<()> {
        self.engine
            .signal_connect(self.object, &self.name, &consumer.callable, consumer.flags)
            .map_err(|e| self.backend_error(e))
    }

    fn disconnect(&self, callable: &Callable) {
        self.engine.signal_disconnect(self.object, &self.name, callable);
    }

    fn is_connected(&self, callable: &Callable) -> bool {
        self.engine.signal_is_connected(self.object, &self.name, callable)
    }

    fn emit(&self, args: &[Value]) -> ext_signal::Result<()> {
        self.engine
            .signal_emit(self.object, &self.name, args)
            .map_err(|e| self.backend_error(e))
    }

    fn connections(&self) -> Vec<Consumer> {
        self.engine.signal_connections(self.object, &self.name)
    }

    fn release(&self) {
        for consumer in self.connections() {
            self.disconnect(&consumer.callable);
        }
        log::debug!("Released engine signal '{}' on {}", self.name, self.object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;
    use ext_signal::{ConsumerFlags, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_proxied_signal_keeps_consumers() {
        let engine = Arc::new(HeadlessEngine::new());
        let object = engine.construct_object("Node").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let signal = Signal::new("hit");
        signal
            .attach(
                Callable::from_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Nil)
                }),
                ConsumerFlags::NONE,
            )
            .unwrap();
        signal.emit(&[]).unwrap();

        signal.bind(object, Arc::new(EngineSignalHost::new(engine.clone(), object)));
        signal.emit(&[]).unwrap();
        assert!(signal.is_proxied());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(engine.signal_connections(object, "hit").len(), 1);

        signal.close();
        assert!(engine.signal_connections(object, "hit").is_empty());
    }
}
