//! The extension bridge
//!
//! [`ExtensionBridge`] owns every piece of the bridge for one engine: the
//! class registry, the instance table and lifecycle, the virtual resolver
//! and the call bridge. The C callbacks reach it through the process-wide
//! instance installed with [`ExtensionBridge::install`].

use std::sync::Arc;

use ext_signal::DeferredQueue;
use ext_transport::{LocalTransport, MemoryTransport, ScratchPool};
use ext_variant::{ObjectId, Value};
use once_cell::sync::OnceCell;

use crate::call::CallBridge;
use crate::class::{ClassDescriptor, ExtensionClass};
use crate::config::BridgeConfig;
use crate::engine::EngineInterface;
use crate::error::{BridgeError, Result};
use crate::instance::{HostState, InstanceHandle, InstanceTable};
use crate::lifecycle::Lifecycle;
use crate::native::NativeClassDb;
use crate::registry::{ClassRegistry, InitLevel};
use crate::virtuals::VirtualResolver;

static GLOBAL: OnceCell<ExtensionBridge> = OnceCell::new();

pub struct ExtensionBridge {
    engine: Arc<dyn EngineInterface>,
    config: BridgeConfig,
    registry: Arc<ClassRegistry>,
    lifecycle: Lifecycle,
    resolver: VirtualResolver,
    calls: CallBridge,
    deferred: DeferredQueue,
    in_editor: bool,
}

impl ExtensionBridge {
    /// Bridge for an engine sharing this address space
    pub fn new(engine: Arc<dyn EngineInterface>, config: BridgeConfig) -> Result<Self> {
        // SAFETY: engine frames are addressed by plain pointers in this process
        let transport: Arc<dyn MemoryTransport> = Arc::new(unsafe { LocalTransport::new() });
        Self::with_transport(engine, Arc::new(NativeClassDb::builtin()), config, transport)
    }

    /// Bridge with an explicit class database and memory transport
    pub fn with_transport(
        engine: Arc<dyn EngineInterface>,
        natives: Arc<NativeClassDb>,
        config: BridgeConfig,
        transport: Arc<dyn MemoryTransport>,
    ) -> Result<Self> {
        let in_editor = config
            .editor_hint_override
            .unwrap_or_else(|| engine.is_editor_hint());
        let registry = Arc::new(ClassRegistry::new(
            engine.clone(),
            natives,
            config.strict_registration,
            in_editor,
        ));
        let instances = Arc::new(InstanceTable::<HostState>::new());
        let deferred = DeferredQueue::new();
        let lifecycle = Lifecycle::new(
            engine.clone(),
            registry.clone(),
            instances.clone(),
            deferred.clone(),
            config.relay_channel_capacity,
            in_editor,
        );
        let resolver = VirtualResolver::new(registry.clone(), in_editor);
        let scratch = ScratchPool::new(transport, config.scratch())?;
        let calls = CallBridge::new(registry.clone(), instances, scratch);

        log::info!(
            "Extension bridge ready (editor: {in_editor}, strict: {})",
            config.strict_registration
        );
        Ok(Self {
            engine,
            config,
            registry,
            lifecycle,
            resolver,
            calls,
            deferred,
            in_editor,
        })
    }

    /// Make this bridge the one the C callbacks use
    pub fn install(self) -> Result<&'static ExtensionBridge> {
        GLOBAL
            .set(self)
            .map_err(|_| BridgeError::engine("An extension bridge is already installed"))?;
        GLOBAL
            .get()
            .ok_or_else(|| BridgeError::engine("Extension bridge vanished after install"))
    }

    /// Installed bridge, if any
    pub fn global() -> Option<&'static ExtensionBridge> {
        GLOBAL.get()
    }

    pub fn engine(&self) -> &Arc<dyn EngineInterface> {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn resolver(&self) -> &VirtualResolver {
        &self.resolver
    }

    pub fn calls(&self) -> &CallBridge {
        &self.calls
    }

    /// Queue of closures run on the engine main context
    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn in_editor(&self) -> bool {
        self.in_editor
    }

    // ========== Registration ==========

    pub fn register<T: ExtensionClass>(&self) -> Result<Arc<ClassDescriptor>> {
        self.registry.register::<T>()
    }

    /// Register `T` when the engine reaches its init level
    pub fn queue<T: ExtensionClass>(&self) {
        self.registry.queue::<T>();
    }

    /// Engine init level reached; registers the classes due there
    pub fn initialize(&self, level: InitLevel) -> Vec<(String, BridgeError)> {
        log::debug!("Initializing level {level:?}");
        self.registry.flush(level)
    }

    /// Engine deinit level reached. Leaving the scene level destroys the
    /// remaining instances and unregisters every class.
    pub fn deinitialize(&self, level: InitLevel) {
        log::debug!("Deinitializing level {level:?}");
        if level != InitLevel::Scene {
            return;
        }
        let destroyed = self.lifecycle.destroy_all();
        if destroyed > 0 {
            log::warn!("Destroyed {destroyed} instances still alive at shutdown");
        }
        self.registry.unregister_all();
        self.resolver.clear();
    }

    // ========== Instances ==========

    /// Instantiate a registered class the way the engine does
    pub fn create(&self, class: &str) -> Result<(InstanceHandle, ObjectId)> {
        let desc = self
            .registry
            .class(class)
            .ok_or_else(|| BridgeError::ClassNotFound(class.to_owned()))?;
        self.lifecycle.create(&desc, true)
    }

    pub fn destroy(&self, handle: InstanceHandle) -> Result<()> {
        self.lifecycle.destroy(handle)
    }

    pub fn notification(&self, handle: InstanceHandle, what: i32) -> Result<()> {
        self.lifecycle.notification(handle, what, false)
    }

    /// Call a method by name
    pub fn call(&self, handle: InstanceHandle, method: &str, args: Vec<Value>) -> Result<Value> {
        self.calls.call(handle, method, args)
    }

    pub fn get(&self, handle: InstanceHandle, property: &str) -> Result<Option<Value>> {
        self.calls.get_property(handle, property)
    }

    pub fn set(&self, handle: InstanceHandle, property: &str, value: Value) -> Result<bool> {
        self.calls.set_property(handle, property, value)
    }

    /// Run queued deferred work; returns how many closures ran
    pub fn flush_deferred(&self) -> usize {
        self.deferred.flush()
    }
}

impl std::fmt::Debug for ExtensionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionBridge")
            .field("registry", &self.registry)
            .field("lifecycle", &self.lifecycle)
            .field("in_editor", &self.in_editor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;
    use crate::headless::HeadlessEngine;
    use ext_transport::{SandboxConfig, SandboxTransport};
    use ext_variant::{Basis, Transform3D, Vector3};

    #[derive(Default)]
    struct Beacon {
        pulses: i64,
    }

    impl ExtensionClass for Beacon {
        const NAME: &'static str = "Beacon";
        const PARENT: &'static str = "Node";

        fn declare(class: &mut ClassBuilder<Self>) {
            class.property("pulses", |b: &Beacon| b.pulses, |b: &mut Beacon, v| b.pulses = v);
            class.method("pulse", |b: &mut Beacon, times: i64| {
                b.pulses += times;
                b.pulses
            });
            class.method("placed", |_: &Beacon, basis: Basis| {
                Transform3D::new(basis, Vector3::new(0.0, 1.0, 0.0))
            });
        }
    }

    fn bridge(transport: Arc<dyn MemoryTransport>) -> ExtensionBridge {
        let engine = Arc::new(HeadlessEngine::new());
        let natives = engine.natives().clone();
        ExtensionBridge::with_transport(engine, natives, BridgeConfig::default(), transport).unwrap()
    }

    #[test]
    fn test_queue_and_initialize() {
        let bridge = bridge(Arc::new(unsafe { LocalTransport::new() }));
        bridge.queue::<Beacon>();
        assert!(bridge.initialize(InitLevel::Core).is_empty());
        assert!(!bridge.registry().contains("Beacon"));
        assert!(bridge.initialize(InitLevel::Scene).is_empty());
        assert!(bridge.registry().contains("Beacon"));
    }

    #[test]
    fn test_direct_call_through_sandbox() {
        let sandbox: Arc<dyn MemoryTransport> = Arc::new(SandboxTransport::new(SandboxConfig::default()));
        let bridge = bridge(sandbox);
        let desc = bridge.register::<Beacon>().unwrap();
        let (handle, _) = bridge.create("Beacon").unwrap();
        let pulse = desc.method_id("pulse").unwrap();

        let result = bridge
            .calls()
            .invoke_direct(Some(handle), pulse, &[Value::Int(4)])
            .unwrap();
        assert_eq!(result, Value::Int(4));
        assert_eq!(bridge.get(handle, "pulses").unwrap(), Some(Value::Int(4)));
    }

    #[test]
    fn test_direct_call_with_aggregates() {
        let bridge = bridge(Arc::new(unsafe { LocalTransport::new() }));
        let desc = bridge.register::<Beacon>().unwrap();
        let (handle, _) = bridge.create("Beacon").unwrap();
        let placed = desc.method_id("placed").unwrap();

        for _ in 0..2 {
            let result = bridge
                .calls()
                .invoke_direct(Some(handle), placed, &[Value::Basis(Basis::IDENTITY)])
                .unwrap();
            assert_eq!(
                result,
                Value::Transform3D(Transform3D::new(Basis::IDENTITY, Vector3::new(0.0, 1.0, 0.0)))
            );
        }
    }

    #[test]
    fn test_deinitialize_cleans_up() {
        let bridge = bridge(Arc::new(unsafe { LocalTransport::new() }));
        let desc = bridge.register::<Beacon>().unwrap();
        let pulse = desc.method_id("pulse").unwrap();
        let (handle, _) = bridge.create("Beacon").unwrap();
        bridge.resolver().resolve_named("Beacon", "_process");
        bridge.deinitialize(InitLevel::Editor);
        assert!(bridge.lifecycle().instance(handle).is_ok());
        bridge.deinitialize(InitLevel::Scene);
        assert!(bridge.lifecycle().instances().is_empty());
        assert!(bridge.registry().is_empty());
        assert!(bridge.registry().method(pulse).is_none());
        assert_eq!(bridge.resolver().cached(), 0);
    }

    #[test]
    fn test_unknown_class() {
        let bridge = bridge(Arc::new(unsafe { LocalTransport::new() }));
        assert!(matches!(
            bridge.create("Nope"),
            Err(BridgeError::ClassNotFound(_))
        ));
    }
}
