use std::collections::HashMap;

/// A synthetic module made available to `import`/`require` inside a VM's
/// script, the way `net` is registered in the original kernel. There is no
/// ES module graph here — a kernel module is just a Rust-built object handed
/// out under a fixed name, not a file that gets fetched and compiled.
pub trait KernelModule {
    /// The name scripts import this module by. Must match the key it's
    /// registered under — the original kernel's `net` module disagreed with
    /// its own `GetName()` and reported `"console"`, which is the kind of
    /// bug this trait makes structurally impossible.
    fn name(&self) -> &'static str;

    /// Builds the module's object for a fresh context.
    fn init<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object>;
}

/// The original kernel's `net` module: registered, importable, and
/// deliberately empty. Kept as a stub since real networking from inside a
/// VM is out of scope, and scripts that `import net from "net"` expect the
/// name to at least resolve to something.
pub struct NetModule;

impl KernelModule for NetModule {
    fn name(&self) -> &'static str {
        "net"
    }

    fn init<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object> {
        v8::ObjectTemplate::new(scope).new_instance(scope).unwrap()
    }
}

/// Holds every module registered with a kernel, keyed by the name scripts
/// import it under. Built once when the kernel's context is created and
/// read for the lifetime of the VM.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<&'static str, v8::Global<v8::Object>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: HashMap::new(),
        }
    }

    /// Initializes `module` against the current context and adds it to the
    /// registry under its own name.
    pub fn register(&mut self, scope: &mut v8::HandleScope, module: &dyn KernelModule) {
        let object = module.init(scope);
        let global = v8::Global::new(scope, object);
        self.modules.insert(module.name(), global);
    }

    /// Looks up a previously registered module by name.
    pub fn get<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
    ) -> Option<v8::Local<'s, v8::Object>> {
        self.modules.get(name).map(|global| v8::Local::new(scope, global))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_module_registers_under_its_own_name() {
        crate::kernel::initialize_v8();

        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        let mut scope = v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(&mut scope);
        let mut scope = v8::ContextScope::new(&mut scope, context);

        let mut registry = ModuleRegistry::new();
        registry.register(&mut scope, &NetModule);

        assert!(registry.contains("net"));
        assert!(registry.get(&mut scope, "net").is_some());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["net"]);
    }
}
