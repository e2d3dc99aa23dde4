//! End-to-end scenarios against the headless engine

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ext_bridge::*;
use ext_signal::{ConsumerFlags, Signal, SignalError, SignalSender};
use ext_transport::{LocalTransport, MemoryTransport};
use ext_variant::{Callable, Value, VariantType};
use rand::Rng;

#[derive(Default)]
struct Counter {
    value: i64,
    changed: Signal,
    ticks: SignalSender,
}

impl Counter {
    fn increment(&mut self) -> i64 {
        self.value += 1;
        self.value
    }
}

impl ExtensionClass for Counter {
    const NAME: &'static str = "Counter";
    const PARENT: &'static str = "Node";

    fn declare(class: &mut ClassBuilder<Self>) {
        class.property("value", |c: &Counter| c.value, |c: &mut Counter, v| c.value = v);
        class.method("increment", Counter::increment);
        class.signal("changed", &[("value", VariantType::Int)], |c| &mut c.changed);
        class.channel_signal("ticks", &[("tick", VariantType::Int)], |c| &mut c.ticks);
    }
}

fn setup() -> (ExtensionBridge, Arc<HeadlessEngine>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Arc::new(HeadlessEngine::new());
    let natives = engine.natives().clone();
    // SAFETY: the headless engine lives in this process
    let transport: Arc<dyn MemoryTransport> = Arc::new(unsafe { LocalTransport::new() });
    let bridge =
        ExtensionBridge::with_transport(engine.clone(), natives, BridgeConfig::default(), transport)
            .unwrap();
    bridge.register::<Counter>().unwrap();
    (bridge, engine)
}

fn changed_signal(bridge: &ExtensionBridge, handle: InstanceHandle) -> Signal {
    bridge
        .lifecycle()
        .instance(handle)
        .unwrap()
        .with::<Counter, _>(|c| c.changed.clone())
        .unwrap()
}

fn counting(hits: &Arc<AtomicUsize>) -> Callable {
    let hits = hits.clone();
    Callable::from_fn(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Nil)
    })
}

#[test]
fn test_counter_direct_calls() {
    let (bridge, _engine) = setup();
    let desc = bridge.registry().class("Counter").unwrap();
    let increment = desc.method_id("increment").unwrap();
    let (handle, _) = bridge.create("Counter").unwrap();

    for expected in 1..=3 {
        let mut frame = CallFrame::stage(&[], &[], Some(VariantType::Int)).unwrap();
        bridge
            .calls()
            .call_direct(Some(handle), increment, &mut frame)
            .unwrap();
        assert_eq!(frame.take_return().unwrap(), Some(Value::Int(expected)));
    }
    assert_eq!(bridge.get(handle, "value").unwrap(), Some(Value::Int(3)));

    let staged = bridge
        .calls()
        .invoke_direct(Some(handle), increment, &[])
        .unwrap();
    assert_eq!(staged, Value::Int(4));
    assert_eq!(bridge.call(handle, "get_value", vec![]).unwrap(), Value::Int(4));
}

#[test]
fn test_destroy_releases_everything() {
    let (bridge, _engine) = setup();
    let (handle, _) = bridge.create("Counter").unwrap();
    let state = bridge.lifecycle().instance(handle).unwrap();
    assert_eq!(state.signal_count(), 2);
    assert_eq!(state.relay_count(), 1);
    let sender = state.with::<Counter, _>(|c| c.ticks.clone()).unwrap();
    assert!(sender.is_wired());

    bridge.destroy(handle).unwrap();
    assert!(state.is_freed());
    assert_eq!(state.signal_count(), 0);
    assert_eq!(state.relay_count(), 0);
    assert!(!bridge.lifecycle().instances().contains(handle));
    assert!(matches!(sender.send(vec![Value::Int(1)]), Err(SignalError::Closed(_))));

    assert!(matches!(
        bridge.destroy(handle),
        Err(BridgeError::StaleHandle(_))
    ));
    assert!(bridge.call(handle, "increment", vec![]).is_err());
}

#[test]
fn test_one_shot_consumer_fires_once() {
    let (bridge, engine) = setup();
    let (handle, object) = bridge.create("Counter").unwrap();
    let signal = changed_signal(&bridge, handle);

    let steady = Arc::new(AtomicUsize::new(0));
    let once = Arc::new(AtomicUsize::new(0));
    signal.attach(counting(&steady), ConsumerFlags::NONE).unwrap();
    let one_shot = counting(&once);
    signal
        .attach(one_shot.clone(), ConsumerFlags::ONE_SHOT)
        .unwrap();
    assert_eq!(signal.consumers().count(), 2);

    signal.emit(&[Value::Int(1)]).unwrap();
    signal.emit(&[Value::Int(2)]).unwrap();
    assert_eq!(steady.load(Ordering::SeqCst), 2);
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert!(signal.consumers().all(|c| c.callable != one_shot));
    assert_eq!(engine.signal_connections(object, "changed").len(), 1);
}

#[test]
fn test_duplicate_attach_rejected() {
    let (bridge, _engine) = setup();
    let (handle, _) = bridge.create("Counter").unwrap();
    let signal = changed_signal(&bridge, handle);

    let hits = Arc::new(AtomicUsize::new(0));
    let callable = counting(&hits);
    signal.attach(callable.clone(), ConsumerFlags::NONE).unwrap();
    assert!(matches!(
        signal.attach(callable.clone(), ConsumerFlags::ONE_SHOT),
        Err(SignalError::AlreadyConnected { .. })
    ));
    assert_eq!(signal.consumers().count(), 1);

    signal.emit(&[Value::Int(7)]).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deferred_consumer_waits_for_frame() {
    let (bridge, engine) = setup();
    let (handle, _) = bridge.create("Counter").unwrap();
    let signal = changed_signal(&bridge, handle);

    let hits = Arc::new(AtomicUsize::new(0));
    signal
        .attach(counting(&hits), ConsumerFlags::DEFERRED)
        .unwrap();
    signal.emit(&[Value::Int(1)]).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert_eq!(engine.process_frame(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_channel_signal_reaches_engine() {
    let (bridge, engine) = setup();
    let (handle, object) = bridge.create("Counter").unwrap();
    let sender = bridge
        .lifecycle()
        .instance(handle)
        .unwrap()
        .with::<Counter, _>(|c| c.ticks.clone())
        .unwrap();

    let last = Arc::new(AtomicI64::new(0));
    let sink = last.clone();
    let callable = Callable::from_fn(move |args| {
        if let [Value::Int(n)] = args {
            sink.store(*n, Ordering::SeqCst);
        }
        Ok(Value::Nil)
    });
    engine
        .signal_connect(object, "ticks", &callable, ConsumerFlags::NONE)
        .unwrap();

    let worker = std::thread::spawn(move || sender.send(vec![Value::Int(42)]));
    worker.join().unwrap().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while last.load(Ordering::SeqCst) != 42 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(last.load(Ordering::SeqCst), 42);
    bridge.destroy(handle).unwrap();
}

#[test]
fn test_editor_hint_override() {
    let engine = Arc::new(HeadlessEngine::new().with_editor(true));
    let bridge = ExtensionBridge::new(engine.clone(), BridgeConfig::default()).unwrap();
    assert!(bridge.in_editor());

    let forced = ExtensionBridge::new(engine, BridgeConfig::default().with_editor_hint(false)).unwrap();
    assert!(!forced.in_editor());
}

#[test]
fn test_config_from_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "strict_registration = true").unwrap();
    writeln!(file, "scratch_buffers = 2").unwrap();
    let config = BridgeConfig::load(file.path()).unwrap();
    assert!(config.strict_registration);
    assert_eq!(config.scratch_buffers, 2);
    assert_eq!(config.scratch_buffer_size, BridgeConfig::default().scratch_buffer_size);

    let dir = tempfile::tempdir().unwrap();
    assert!(BridgeConfig::load(dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_concurrent_create_and_destroy() {
    let (bridge, _engine) = setup();
    let increment = bridge
        .registry()
        .class("Counter")
        .unwrap()
        .method_id("increment")
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let mut rng = rand::thread_rng();
                let mut live = Vec::new();
                for _ in 0..100 {
                    match rng.gen_range(0..3) {
                        0 if !live.is_empty() => {
                            let index = rng.gen_range(0..live.len());
                            let handle: InstanceHandle = live.swap_remove(index);
                            bridge.destroy(handle).unwrap();
                        }
                        1 if !live.is_empty() => {
                            let handle = live[rng.gen_range(0..live.len())];
                            let value = bridge
                                .calls()
                                .invoke_direct(Some(handle), increment, &[])
                                .unwrap();
                            assert!(matches!(value, Value::Int(n) if n > 0));
                        }
                        _ => live.push(bridge.create("Counter").unwrap().0),
                    }
                }
                for handle in live {
                    bridge.destroy(handle).unwrap();
                }
            });
        }
    });

    assert!(bridge.lifecycle().instances().is_empty());
}
