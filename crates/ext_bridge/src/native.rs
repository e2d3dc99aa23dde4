//! Engine class hierarchy known to the bridge
//!
//! Registration needs three facts about engine classes: their parent,
//! which virtual methods they declare (with signatures) and a few
//! capabilities (reference counted, node, editor-only). The built-in table
//! covers the classes extensions commonly derive from; more can be added
//! with [`NativeClassDb::insert`].

use std::collections::HashMap;
use std::fmt;

use ext_variant::VariantType;

/// Signature of an engine-declared virtual method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSignature {
    /// Engine name, e.g. `_process`
    pub name: String,
    pub args: Vec<VariantType>,
    pub ret: Option<VariantType>,
}

impl VirtualSignature {
    pub fn new(name: &str, args: &[VariantType], ret: Option<VariantType>) -> Self {
        Self {
            name: name.to_owned(),
            args: args.to_vec(),
            ret,
        }
    }
}

impl fmt::Display for VirtualSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<_> = self.args.iter().map(|a| a.name()).collect();
        write!(f, "({})", args.join(", "))?;
        if let Some(ret) = self.ret {
            write!(f, " -> {ret}")?;
        }
        Ok(())
    }
}

/// Capabilities of an engine class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeCaps {
    pub refcounted: bool,
    pub node: bool,
    /// Editor infrastructure; extensions of it run as tools
    pub editor_only: bool,
    /// Extensions of it are added to the editor as plugins
    pub editor_plugin: bool,
}

/// One engine class
#[derive(Debug, Clone)]
pub struct NativeClass {
    pub name: String,
    pub parent: Option<String>,
    pub caps: NativeCaps,
    pub virtuals: Vec<VirtualSignature>,
    pub methods: Vec<String>,
}

/// Engine class table
#[derive(Debug, Clone, Default)]
pub struct NativeClassDb {
    classes: HashMap<String, NativeClass>,
}

impl NativeClassDb {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of the engine classes extensions commonly derive from
    pub fn builtin() -> Self {
        use VariantType::*;

        let mut db = Self::new();
        db.insert(
            "Object",
            None,
            NativeCaps::default(),
            vec![],
            &["get_class", "is_class", "set", "get", "connect", "disconnect", "emit_signal", "notification", "to_string", "free"],
        );
        db.insert(
            "RefCounted",
            Some("Object"),
            NativeCaps {
                refcounted: true,
                ..Default::default()
            },
            vec![],
            &["reference", "unreference", "get_reference_count"],
        );
        db.insert(
            "Resource",
            Some("RefCounted"),
            NativeCaps {
                refcounted: true,
                ..Default::default()
            },
            vec![
                VirtualSignature::new("_setup_local_to_scene", &[], None),
                VirtualSignature::new("_get_rid", &[], Some(Rid)),
            ],
            &["get_path", "set_path", "duplicate", "emit_changed"],
        );
        db.insert(
            "Node",
            Some("Object"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![
                VirtualSignature::new("_process", &[Float], None),
                VirtualSignature::new("_physics_process", &[Float], None),
                VirtualSignature::new("_enter_tree", &[], None),
                VirtualSignature::new("_exit_tree", &[], None),
                VirtualSignature::new("_ready", &[], None),
                VirtualSignature::new("_input", &[Object], None),
                VirtualSignature::new("_unhandled_input", &[Object], None),
                VirtualSignature::new("_get_configuration_warnings", &[], Some(PackedStringArray)),
            ],
            &["add_child", "remove_child", "get_node", "get_parent", "get_name", "set_name", "queue_free", "is_inside_tree"],
        );
        db.insert(
            "CanvasItem",
            Some("Node"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![VirtualSignature::new("_draw", &[], None)],
            &["queue_redraw", "show", "hide", "is_visible"],
        );
        db.insert(
            "Node2D",
            Some("CanvasItem"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![],
            &["get_position", "set_position", "rotate", "translate"],
        );
        db.insert(
            "Node3D",
            Some("Node"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![],
            &["get_transform", "set_transform", "rotate", "translate"],
        );
        db.insert(
            "Sprite2D",
            Some("Node2D"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![],
            &["set_texture", "get_texture"],
        );
        db.insert(
            "Timer",
            Some("Node"),
            NativeCaps {
                node: true,
                ..Default::default()
            },
            vec![],
            &["start", "stop", "is_stopped"],
        );
        db.insert(
            "AudioStreamPlayback",
            Some("RefCounted"),
            NativeCaps {
                refcounted: true,
                ..Default::default()
            },
            vec![
                VirtualSignature::new("_start", &[Float], None),
                VirtualSignature::new("_stop", &[], None),
                VirtualSignature::new("_is_playing", &[], Some(Bool)),
                VirtualSignature::new("_seek", &[Float], None),
            ],
            &[],
        );
        db.insert(
            "Script",
            Some("Resource"),
            NativeCaps {
                refcounted: true,
                editor_only: true,
                ..Default::default()
            },
            vec![],
            &["get_source_code", "set_source_code", "reload"],
        );
        db.insert(
            "ScriptLanguage",
            Some("Object"),
            NativeCaps {
                editor_only: true,
                ..Default::default()
            },
            vec![],
            &[],
        );
        db.insert(
            "ScriptLanguageExtension",
            Some("ScriptLanguage"),
            NativeCaps {
                editor_only: true,
                ..Default::default()
            },
            vec![
                VirtualSignature::new("_get_name", &[], Some(String)),
                VirtualSignature::new("_get_extension", &[], Some(String)),
            ],
            &[],
        );
        db.insert(
            "EditorPlugin",
            Some("Node"),
            NativeCaps {
                node: true,
                editor_only: true,
                editor_plugin: true,
                ..Default::default()
            },
            vec![
                VirtualSignature::new("_get_plugin_name", &[], Some(String)),
                VirtualSignature::new("_has_main_screen", &[], Some(Bool)),
            ],
            &["add_control_to_container", "get_editor_interface"],
        );
        db
    }

    /// Add or replace a class
    pub fn insert(
        &mut self,
        name: &str,
        parent: Option<&str>,
        caps: NativeCaps,
        virtuals: Vec<VirtualSignature>,
        methods: &[&str],
    ) {
        self.classes.insert(
            name.to_owned(),
            NativeClass {
                name: name.to_owned(),
                parent: parent.map(str::to_owned),
                caps,
                virtuals,
                methods: methods.iter().map(|m| (*m).to_owned()).collect(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&NativeClass> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// The class and every ancestor, nearest first
    pub fn ancestry<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a NativeClass> + 'a {
        let mut next = self.classes.get(name);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent.as_deref().and_then(|p| self.classes.get(p));
            Some(current)
        })
    }

    /// Whether `name` is `base` or derives from it
    pub fn is_a(&self, name: &str, base: &str) -> bool {
        self.ancestry(name).any(|c| c.name == base)
    }

    /// Capabilities accumulated over the ancestry
    pub fn caps(&self, name: &str) -> NativeCaps {
        self.ancestry(name).fold(NativeCaps::default(), |acc, c| NativeCaps {
            refcounted: acc.refcounted || c.caps.refcounted,
            node: acc.node || c.caps.node,
            editor_only: acc.editor_only || c.caps.editor_only,
            editor_plugin: acc.editor_plugin || c.caps.editor_plugin,
        })
    }

    /// Every virtual declared by the class or its ancestors
    pub fn virtuals(&self, name: &str) -> HashMap<String, VirtualSignature> {
        let mut table = HashMap::new();
        for class in self.ancestry(name) {
            for virtual_method in &class.virtuals {
                table
                    .entry(virtual_method.name.clone())
                    .or_insert_with(|| virtual_method.clone());
            }
        }
        table
    }

    /// Whether the class or an ancestor defines `method`
    pub fn has_method(&self, name: &str, method: &str) -> bool {
        self.ancestry(name).any(|c| c.methods.iter().any(|m| m == method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestry() {
        let db = NativeClassDb::builtin();
        let chain: Vec<_> = db.ancestry("Node2D").map(|c| c.name.as_str()).collect();
        assert_eq!(chain, vec!["Node2D", "CanvasItem", "Node", "Object"]);
        assert!(db.is_a("Sprite2D", "Node"));
        assert!(!db.is_a("Resource", "Node"));
    }

    #[test]
    fn test_caps_accumulate() {
        let db = NativeClassDb::builtin();
        assert!(db.caps("Resource").refcounted);
        assert!(db.caps("Sprite2D").node);
        let plugin = db.caps("EditorPlugin");
        assert!(plugin.editor_only && plugin.editor_plugin && plugin.node);
        assert!(db.caps("ScriptLanguageExtension").editor_only);
    }

    #[test]
    fn test_inherited_virtuals() {
        let db = NativeClassDb::builtin();
        let virtuals = db.virtuals("Node2D");
        assert!(virtuals.contains_key("_process"));
        assert!(virtuals.contains_key("_draw"));
        assert!(!virtuals.contains_key("_seek"));
        assert_eq!(virtuals["_process"].to_string(), "(float)");
    }

    #[test]
    fn test_inherited_methods() {
        let db = NativeClassDb::builtin();
        assert!(db.has_method("Node2D", "queue_free"));
        assert!(db.has_method("Node2D", "get_class"));
        assert!(!db.has_method("Node2D", "increment"));
    }
}
