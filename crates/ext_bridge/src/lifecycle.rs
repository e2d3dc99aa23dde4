//! Instance lifecycle
//!
//! `create` pairs an engine object with a host value, `destroy` tears the
//! pair down. Teardown order is fixed:
//!
//! 1. relays closed and joined, signals closed
//! 2. resources released
//! 3. `on_free`
//! 4. handle removed from the table
//!
//! Calls arriving during teardown see a freed instance and fail with
//! [`BridgeError::StaleHandle`].
//!
//! A `create` that fails after the engine object exists tears down
//! whatever was built and frees the engine object again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ext_signal::{ChannelRelay, DeferredQueue, Signal, SignalHost, SignalSender};
use ext_variant::ObjectId;

use crate::class::{ChildDecl, ClassDescriptor, InstanceContext, SignalSlot};
use crate::engine::EngineInterface;
use crate::error::{BridgeError, Result};
use crate::instance::{HostState, InstanceHandle, InstanceTable};
use crate::registry::ClassRegistry;
use crate::signals::EngineSignalHost;

/// Sent after construction when the engine asks for it
pub const NOTIFICATION_POSTINITIALIZE: i32 = 0;
/// Sent when a node and its children have entered the tree
pub const NOTIFICATION_READY: i32 = 13;

pub struct Lifecycle {
    engine: Arc<dyn EngineInterface>,
    registry: Arc<ClassRegistry>,
    instances: Arc<InstanceTable<HostState>>,
    deferred: DeferredQueue,
    relay_capacity: usize,
    in_editor: bool,
}

impl Lifecycle {
    pub fn new(
        engine: Arc<dyn EngineInterface>,
        registry: Arc<ClassRegistry>,
        instances: Arc<InstanceTable<HostState>>,
        deferred: DeferredQueue,
        relay_capacity: usize,
        in_editor: bool,
    ) -> Self {
        Self {
            engine,
            registry,
            instances,
            deferred,
            relay_capacity,
            in_editor,
        }
    }

    pub fn instances(&self) -> &Arc<InstanceTable<HostState>> {
        &self.instances
    }

    /// Live instance behind `handle`
    pub fn instance(&self, handle: InstanceHandle) -> Result<Arc<HostState>> {
        self.instances
            .get(handle)
            .filter(|s| !s.is_freed())
            .ok_or(BridgeError::StaleHandle(handle))
    }

    /// Construct the engine object and the host value and pair them
    pub fn create(
        &self,
        class: &Arc<ClassDescriptor>,
        notify_postinit: bool,
    ) -> Result<(InstanceHandle, ObjectId)> {
        if class.is_abstract() {
            return Err(BridgeError::engine(format!(
                "Class '{}' is abstract",
                class.name()
            )));
        }
        let object = self.engine.construct_object(class.native_parent())?;
        if class.caps().refcounted {
            if let Err(e) = self.engine.init_ref(object) {
                self.discard(class, None, object, &e);
                return Err(e);
            }
        }

        let in_editor = self.in_editor && !class.is_tool();
        let value = class.construct();
        let (handle, state) = self
            .instances
            .insert_with(|h| HostState::new(h, class.clone(), object, value, in_editor));

        if let Err(e) = self.pair(class, &state, notify_postinit) {
            self.discard(class, Some(handle), object, &e);
            return Err(e);
        }

        log::debug!("Created {} {:?} on {}", class.name(), handle, object);
        Ok((handle, object))
    }

    fn pair(&self, class: &ClassDescriptor, state: &HostState, notify_postinit: bool) -> Result<()> {
        let (handle, object) = (state.handle(), state.object());
        self.engine.set_instance(object, class.name(), handle)?;
        self.wire_signals(state)?;
        if notify_postinit {
            self.engine.notify(object, NOTIFICATION_POSTINITIALIZE)?;
        }
        let ctx = InstanceContext {
            handle,
            object,
            class: class.name(),
            in_editor: state.in_editor(),
        };
        state.with_value(|value| (class.hooks.on_create)(value, &ctx))
    }

    /// Undo a half-built pair: the host half if one exists, then the
    /// engine object
    fn discard(
        &self,
        class: &ClassDescriptor,
        handle: Option<InstanceHandle>,
        object: ObjectId,
        error: &BridgeError,
    ) {
        log::warn!("Failed to create {}: {error}", class.name());
        if let Some(handle) = handle {
            if let Err(e) = self.destroy(handle) {
                log::warn!("Failed to tear down {handle:?}: {e}");
            }
        }
        if let Err(e) = self.engine.free_object(object) {
            log::error!("Failed to free {object}: {e}");
        }
    }

    /// Give every declared signal field a fresh signal bound to the
    /// engine object. Channel signals also get a relay.
    fn wire_signals(&self, state: &HostState) -> Result<()> {
        let class = state.class().clone();
        if class.signals().is_empty() {
            return Ok(());
        }
        let host: Arc<dyn SignalHost> =
            Arc::new(EngineSignalHost::new(self.engine.clone(), state.object()));

        state.with_value(|value| -> Result<()> {
            for decl in class.signals() {
                let signal = Signal::with_queue(decl.name.clone(), self.deferred.clone());
                signal.bind(state.object(), host.clone());
                match &decl.slot {
                    SignalSlot::Emitter(field) => {
                        if let Some(slot) = field.access(&mut *value) {
                            *slot = signal.clone();
                        }
                    }
                    SignalSlot::Channel(field) => {
                        let relay = ChannelRelay::spawn(signal.clone(), self.relay_capacity)?;
                        if let Some(slot) = field.access(&mut *value) {
                            *slot = SignalSender::new(decl.name.clone(), relay.sender());
                        }
                        state.relays.lock().push(relay);
                    }
                }
                state.signals.lock().push(signal);
            }
            Ok(())
        })?
    }

    /// Tear down the instance behind `handle`. A second call for the same
    /// handle fails with [`BridgeError::StaleHandle`].
    pub fn destroy(&self, handle: InstanceHandle) -> Result<()> {
        let state = self
            .instances
            .get(handle)
            .ok_or(BridgeError::StaleHandle(handle))?;
        if state.freed.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::StaleHandle(handle));
        }
        let class = state.class().clone();

        let relays = std::mem::take(&mut *state.relays.lock());
        for mut relay in relays {
            relay.close();
        }
        let signals = std::mem::take(&mut *state.signals.lock());
        for signal in &signals {
            signal.close();
        }

        let teardown = state.with_value(|value| {
            for resource in &class.resources {
                resource.field.release(&mut *value);
            }
            (class.hooks.on_free)(value);
        });

        self.instances.remove(handle);
        teardown?;
        log::debug!("Destroyed {} {:?}", class.name(), handle);
        Ok(())
    }

    /// Destroy every live instance; returns how many were destroyed
    pub fn destroy_all(&self) -> usize {
        let mut destroyed = 0;
        for handle in self.instances.handles() {
            match self.destroy(handle) {
                Ok(()) => destroyed += 1,
                Err(e) => log::warn!("Failed to destroy {handle:?}: {e}"),
            }
        }
        destroyed
    }

    /// Engine notification. Ready runs the tree pass first; user hooks
    /// stay silent for non-tool instances in the editor.
    pub fn notification(&self, handle: InstanceHandle, what: i32, reversed: bool) -> Result<()> {
        let state = self.instance(handle)?;
        if what == NOTIFICATION_READY {
            self.ready(&state)?;
        }
        if state.in_editor() {
            return Ok(());
        }
        let hook = state.class().hooks.notification;
        state.with_value(|value| hook(value, what, reversed))
    }

    /// Assert declared children, then run the user ready hook. Runs once
    /// per instance.
    pub fn ready(&self, state: &HostState) -> Result<()> {
        if state.ready_done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let class = state.class().clone();
        for child in class.children() {
            let node = self.assert_child(state, child)?;
            state.with_value(|value| {
                if let Some(slot) = child.field.access(value) {
                    *slot = node;
                }
            })?;
        }
        if !state.in_editor() {
            state.with_value(|value| (class.hooks.ready)(value))?;
        }
        Ok(())
    }

    /// Adopt the node at the child's path or create one there
    fn assert_child(&self, state: &HostState, child: &ChildDecl) -> Result<ObjectId> {
        let owner = state.object();
        if let Some(existing) = self.engine.get_node(owner, &child.path) {
            let actual = self.engine.get_class(existing).unwrap_or_default();
            if !self.registry.is_a(&actual, &child.class) {
                return Err(BridgeError::engine(format!(
                    "{}: child '{}' is a {actual}, not a {}",
                    state.class().name(),
                    child.path,
                    child.class
                )));
            }
            log::debug!("Adopted child '{}' of {}", child.path, owner);
            return Ok(existing);
        }

        let (parent, name) = match child.path.rsplit_once('/') {
            Some((dir, name)) => {
                let parent = self.engine.get_node(owner, dir).ok_or_else(|| {
                    BridgeError::engine(format!(
                        "{}: no node at '{dir}' to hold '{name}'",
                        state.class().name()
                    ))
                })?;
                (parent, name)
            }
            None => (owner, child.path.as_str()),
        };
        let node = match self.registry.class(&child.class) {
            Some(desc) => self.create(&desc, true)?.1,
            None => {
                let node = self.engine.construct_object(&child.class)?;
                self.engine.notify(node, NOTIFICATION_POSTINITIALIZE)?;
                node
            }
        };
        self.engine.add_child(parent, node, name)?;
        log::debug!("Created child '{}' of {}", child.path, owner);
        Ok(node)
    }

    /// Host rendering of the instance, if the class provides one
    pub fn stringify(&self, handle: InstanceHandle) -> Result<Option<String>> {
        let state = self.instance(handle)?;
        let hook = state.class().hooks.stringify;
        state.with_value(|value| hook(value))
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("instances", &self.instances.len())
            .field("relay_capacity", &self.relay_capacity)
            .field("in_editor", &self.in_editor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassBuilder, ExtensionClass, Releasable};
    use crate::headless::HeadlessEngine;
    use crate::native::NativeClassDb;
    use ext_signal::ConsumerFlags;
    use ext_variant::{Callable, Value, VariantType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Handle;

    impl Releasable for Handle {
        fn release(&mut self) {
            RELEASED.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Turret {
        fired: Signal,
        heat: SignalSender,
        barrel: ObjectId,
        socket: Handle,
        readied: u32,
        notes: Vec<i32>,
    }

    impl ExtensionClass for Turret {
        const NAME: &'static str = "Turret";
        const PARENT: &'static str = "Node2D";

        fn declare(class: &mut ClassBuilder<Self>) {
            class.signal("fired", &[("shots", VariantType::Int)], |t| &mut t.fired);
            class.channel_signal("heat", &[("level", VariantType::Float)], |t| &mut t.heat);
            class.child("Barrel", "Sprite2D", |t| &mut t.barrel);
            class.resource("socket", |t| &mut t.socket);
            class.method("readied", |t: &Turret| t.readied as i64);
            class.method("notes", |t: &Turret| t.notes.len() as i64);
            class.method("barrel", |t: &Turret| t.barrel);
        }

        fn ready(&mut self) {
            self.readied += 1;
        }

        fn notification(&mut self, what: i32, _reversed: bool) {
            self.notes.push(what);
        }

        fn stringify(&self) -> Option<String> {
            Some(format!("Turret({})", self.readied))
        }
    }

    #[derive(Default)]
    struct Shape;

    impl ExtensionClass for Shape {
        const NAME: &'static str = "Shape";
        const PARENT: &'static str = "Resource";
        const ABSTRACT: bool = true;

        fn declare(_class: &mut ClassBuilder<Self>) {}
    }

    #[derive(Default)]
    struct Ammo;

    impl ExtensionClass for Ammo {
        const NAME: &'static str = "Ammo";
        const PARENT: &'static str = "Resource";

        fn declare(_class: &mut ClassBuilder<Self>) {}
    }

    struct Fixture {
        engine: Arc<HeadlessEngine>,
        lifecycle: Lifecycle,
        registry: Arc<ClassRegistry>,
    }

    fn fixture(editor: bool) -> Fixture {
        let engine = Arc::new(HeadlessEngine::new().with_editor(editor));
        let registry = Arc::new(ClassRegistry::new(
            engine.clone(),
            Arc::new(NativeClassDb::builtin()),
            false,
            editor,
        ));
        registry.register::<Turret>().unwrap();
        registry.register::<Shape>().unwrap();
        let lifecycle = Lifecycle::new(
            engine.clone(),
            registry.clone(),
            Arc::new(InstanceTable::new()),
            DeferredQueue::new(),
            0,
            editor,
        );
        Fixture {
            engine,
            lifecycle,
            registry,
        }
    }

    #[test]
    fn test_create_pairs_object() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, object) = f.lifecycle.create(&class, true).unwrap();

        assert_eq!(f.engine.instance_of(object), Some(handle));
        assert_eq!(f.engine.notifications(object), vec![NOTIFICATION_POSTINITIALIZE]);
        let state = f.lifecycle.instance(handle).unwrap();
        assert_eq!(state.signal_count(), 2);
        assert_eq!(state.relay_count(), 1);
        state
            .with::<Turret, _>(|t| {
                assert_eq!(t.fired.name(), "fired");
                assert!(t.heat.is_wired());
            })
            .unwrap();
    }

    #[test]
    fn test_destroy_closes_everything() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, _) = f.lifecycle.create(&class, false).unwrap();
        let state = f.lifecycle.instance(handle).unwrap();
        let signal = state.with::<Turret, _>(|t| t.fired.clone()).unwrap();
        let before = RELEASED.load(Ordering::SeqCst);

        f.lifecycle.destroy(handle).unwrap();
        assert!(signal.is_closed());
        assert_eq!(state.relay_count(), 0);
        assert!(RELEASED.load(Ordering::SeqCst) > before);
        assert!(!f.lifecycle.instances().contains(handle));
        assert!(matches!(
            f.lifecycle.destroy(handle),
            Err(BridgeError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_failed_notify_discards_both_halves() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let objects = f.engine.object_count();
        f.engine.refuse("notify");

        assert!(f.lifecycle.create(&class, true).is_err());
        assert!(f.lifecycle.instances().is_empty());
        assert_eq!(f.engine.object_count(), objects);
        // without the notification the pair still forms
        assert!(f.lifecycle.create(&class, false).is_ok());
    }

    #[test]
    fn test_failed_set_instance_frees_engine_object() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let objects = f.engine.object_count();
        let released = RELEASED.load(Ordering::SeqCst);
        f.engine.refuse("set_instance");

        assert!(f.lifecycle.create(&class, false).is_err());
        assert!(f.lifecycle.instances().is_empty());
        assert_eq!(f.engine.object_count(), objects);
        assert!(RELEASED.load(Ordering::SeqCst) > released);
    }

    #[test]
    fn test_failed_init_ref_frees_engine_object() {
        let f = fixture(false);
        f.registry.register::<Ammo>().unwrap();
        let class = f.registry.class("Ammo").unwrap();
        let objects = f.engine.object_count();
        f.engine.refuse("init_ref");

        assert!(f.lifecycle.create(&class, false).is_err());
        assert!(f.lifecycle.instances().is_empty());
        assert_eq!(f.engine.object_count(), objects);
    }

    #[test]
    fn test_abstract_class_is_not_created() {
        let f = fixture(false);
        let class = f.registry.class("Shape").unwrap();
        assert!(f.lifecycle.create(&class, false).is_err());
        assert!(f.lifecycle.instances().is_empty());
    }

    #[test]
    fn test_ready_creates_child_once() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, object) = f.lifecycle.create(&class, false).unwrap();

        f.lifecycle.notification(handle, NOTIFICATION_READY, false).unwrap();
        f.lifecycle.notification(handle, NOTIFICATION_READY, false).unwrap();

        let barrel = f.engine.get_node(object, "Barrel").unwrap();
        assert_eq!(f.engine.children(object), vec![barrel]);
        let state = f.lifecycle.instance(handle).unwrap();
        state
            .with::<Turret, _>(|t| {
                assert_eq!(t.barrel, barrel);
                assert_eq!(t.readied, 1);
                assert_eq!(t.notes, vec![NOTIFICATION_READY, NOTIFICATION_READY]);
            })
            .unwrap();
    }

    #[test]
    fn test_ready_adopts_existing_child() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, object) = f.lifecycle.create(&class, false).unwrap();
        let existing = f.engine.construct_object("Sprite2D").unwrap();
        f.engine.add_child(object, existing, "Barrel").unwrap();

        f.lifecycle.notification(handle, NOTIFICATION_READY, false).unwrap();
        assert_eq!(f.engine.children(object), vec![existing]);
        let state = f.lifecycle.instance(handle).unwrap();
        assert_eq!(state.with::<Turret, _>(|t| t.barrel).unwrap(), existing);
    }

    #[test]
    fn test_ready_rejects_wrong_child_class() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, object) = f.lifecycle.create(&class, false).unwrap();
        let timer = f.engine.construct_object("Timer").unwrap();
        f.engine.add_child(object, timer, "Barrel").unwrap();

        assert!(f.lifecycle.notification(handle, NOTIFICATION_READY, false).is_err());
    }

    #[test]
    fn test_editor_silences_user_hooks() {
        let f = fixture(true);
        let class = f.registry.class("Turret").unwrap();
        let (handle, object) = f.lifecycle.create(&class, false).unwrap();
        f.lifecycle.notification(handle, NOTIFICATION_READY, false).unwrap();

        assert!(f.engine.get_node(object, "Barrel").is_some());
        let state = f.lifecycle.instance(handle).unwrap();
        state
            .with::<Turret, _>(|t| {
                assert_eq!(t.readied, 0);
                assert!(t.notes.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_channel_signal_reaches_engine_consumers() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, _) = f.lifecycle.create(&class, false).unwrap();
        let state = f.lifecycle.instance(handle).unwrap();
        let sender = state.with::<Turret, _>(|t| t.heat.clone()).unwrap();
        let signal = state.signals.lock()[1].clone();
        assert_eq!(signal.name(), "heat");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        signal
            .attach(
                Callable::from_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Nil)
                }),
                ConsumerFlags::NONE,
            )
            .unwrap();
        sender.send(vec![Value::Float(0.5)]).unwrap();
        sender.send(vec![Value::Float(0.9)]).unwrap();

        // closing drains what was queued
        f.lifecycle.destroy(handle).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(sender.send(vec![]).is_err());
    }

    #[test]
    fn test_stringify() {
        let f = fixture(false);
        let class = f.registry.class("Turret").unwrap();
        let (handle, _) = f.lifecycle.create(&class, false).unwrap();
        assert_eq!(
            f.lifecycle.stringify(handle).unwrap().as_deref(),
            Some("Turret(0)")
        );
    }
}
