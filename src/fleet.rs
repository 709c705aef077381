use crate::vm::VmHandle;
use std::collections::HashMap;
use std::sync::RwLock;

/// The host-wide registry of VMs, keyed by fingerprint. Transports resolve
/// a VM here before routing a call to it; the index endpoint enumerates it.
/// Holds only `VmHandle`s — the VMs themselves live on their own serve
/// threads.
#[derive(Default)]
pub struct Core {
    vms: RwLock<HashMap<String, VmHandle>>,
}

impl Core {
    pub fn new() -> Self {
        Core::default()
    }

    /// Adds a VM to the fleet. A second registration under the same
    /// fingerprint replaces the first — fingerprints name programs, and the
    /// newest instance of a program wins.
    pub fn register(&self, handle: VmHandle) {
        self.vms
            .write()
            .unwrap()
            .insert(handle.fingerprint().to_string(), handle);
    }

    /// Fingerprints of every VM currently in `Running` state.
    pub fn all_active_script_container_ids(&self) -> Vec<String> {
        self.vms
            .read()
            .unwrap()
            .values()
            .filter(|vm| vm.is_running())
            .map(|vm| vm.fingerprint().to_string())
            .collect()
    }

    pub fn resolve_vm(&self, fingerprint: &str) -> Option<VmHandle> {
        self.vms.read().unwrap().get(fingerprint).cloned()
    }

    /// Asks every registered VM to shut down. Serve threads notice on their
    /// next tick; this call does not wait for them.
    pub fn signal_shutdown_all(&self) {
        for vm in self.vms.read().unwrap().values() {
            vm.signal_shutdown();
        }
    }
}
