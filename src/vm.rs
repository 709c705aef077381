use crate::config::VmConfig;
use crate::errors::RpcError;
use crate::event_loop::LoopHandle;
use crate::image::VmImage;
use crate::kernel::Kernel;
use crate::registry::{FunctionSignature, RpcCallSource};
use crate::rpc::{self, FunctionCallState, RpcRequest};
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle state of a `CoreVm`. Transitions are monotonic:
/// `StillWait` → `Starting` → `Running` → `Closed`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    StillWait = 0,
    Starting = 1,
    Running = 2,
    Closed = 3,
}

impl VmState {
    fn from_u8(value: u8) -> VmState {
        match value {
            0 => VmState::StillWait,
            1 => VmState::Starting,
            2 => VmState::Running,
            _ => VmState::Closed,
        }
    }
}

/// One running program instance: a kernel plus the lifecycle state machine
/// wrapped around it. The `CoreVm` itself is pinned to the thread that owns
/// its isolate; everything another thread legitimately needs — state reads,
/// shutdown, invoking shared functions — goes through the `Send` + `Clone`
/// [`VmHandle`] instead.
pub struct CoreVm {
    image: VmImage,
    fingerprint: String,
    kernel: Kernel,
    state: Arc<AtomicU8>,
    close_signal: Arc<AtomicBool>,
    start_timestamp: AtomicU64,
    policy: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl CoreVm {
    pub fn new(image: VmImage, config: VmConfig) -> CoreVm {
        let fingerprint = image.fingerprint();
        CoreVm {
            image,
            fingerprint,
            kernel: Kernel::new(config),
            state: Arc::new(AtomicU8::new(VmState::StillWait as u8)),
            close_signal: Arc::new(AtomicBool::new(false)),
            start_timestamp: AtomicU64::new(0),
            policy: Box::new(|_origin| false),
        }
    }

    pub fn image(&self) -> &VmImage {
        &self.image
    }

    pub fn vm_name(&self) -> &str {
        &self.image.manifest().name
    }

    pub fn owner(&self) -> &str {
        &self.image.manifest().owner
    }

    pub fn repo_url(&self) -> &str {
        &self.image.manifest().repo_url
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: VmState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Unix seconds at which the VM entered `Starting`; 0 until then.
    pub fn starting_timestamp(&self) -> u64 {
        self.start_timestamp.load(Ordering::SeqCst)
    }

    /// The cross-thread face of this VM. Hand one to each transport; clones
    /// are cheap and every clone stays valid for the VM's whole life.
    pub fn handle(&self) -> VmHandle {
        VmHandle {
            fingerprint: self.fingerprint.clone(),
            state: Arc::clone(&self.state),
            close_signal: Arc::clone(&self.close_signal),
            handle: self.kernel.event_loop.handle(),
        }
    }

    /// Overrides the CSRF/origin-check policy consulted by
    /// `is_allowed_x_requested`. The conservative default answers `false`
    /// for every origin; a transport that wants cross-origin calls installs
    /// its own policy instead of the kernel guessing at one.
    pub fn set_allowed_x_policy(&mut self, policy: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.policy = Box::new(policy);
    }

    pub fn is_allowed_x_requested(&self, origin: &str) -> bool {
        (self.policy)(origin)
    }

    /// Runs the image's main script once, seals the shared-function
    /// register, transitions to `Running`, then serves the event loop until
    /// `signal_shutdown` (or the kernel itself closing) drives the VM to
    /// `Closed`. Callable only from `StillWait` or `Closed` — a VM that is
    /// already `Starting`/`Running` refuses a second serve. A main-script
    /// failure also lands in `Closed`, bubbling the script error up.
    pub fn serve(&mut self) -> Result<()> {
        match self.state() {
            VmState::StillWait | VmState::Closed => {}
            other => bail!("cannot serve a VM in state {other:?}"),
        }

        self.set_state(VmState::Starting);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.start_timestamp.store(now, Ordering::SeqCst);
        tracing::debug!(fingerprint = %self.fingerprint, "vm is starting");

        let origin = self.kernel.config().main_script_origin;
        if let Err(err) = self.kernel.run_main_script(&origin, self.image.main_script()) {
            self.kernel.close();
            self.set_state(VmState::Closed);
            return Err(err);
        }

        self.kernel.freeze_register();
        self.set_state(VmState::Running);
        tracing::debug!(fingerprint = %self.fingerprint, "event loop started");

        while !self.close_signal.load(Ordering::SeqCst) && !self.kernel.is_closed() {
            self.kernel.serve_one(Duration::from_millis(50));
        }

        self.kernel.close();
        self.set_state(VmState::Closed);
        tracing::debug!(fingerprint = %self.fingerprint, "event loop stopped");
        Ok(())
    }

    pub fn signal_shutdown(&self) {
        self.close_signal.store(true, Ordering::SeqCst);
    }

    pub fn all_shared_functions(&self, source: RpcCallSource) -> Vec<FunctionSignature> {
        self.kernel.all_signatures(source)
    }
}

/// A `Send + Sync + Clone` handle to a serving VM: state reads, shutdown,
/// signature lookup, and call submission, all safe to use from transport
/// threads while the VM's own thread sits in `serve`. Carries nothing
/// isolate-shaped — only atomics and the loop's submission handle.
#[derive(Clone)]
pub struct VmHandle {
    fingerprint: String,
    state: Arc<AtomicU8>,
    close_signal: Arc<AtomicBool>,
    handle: LoopHandle,
}

impl VmHandle {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == VmState::Running
    }

    pub fn signal_shutdown(&self) {
        self.close_signal.store(true, Ordering::SeqCst);
    }

    /// Looks the signature up in the VM's register, on the VM's own thread.
    /// `Ok(None)` is a clean miss (transports map it to 404/NotFound);
    /// an error means the register itself is corrupted.
    pub fn get_shared_function(
        &self,
        source: RpcCallSource,
        signature: &FunctionSignature,
    ) -> Result<Option<SharedFunctionHandle>> {
        if !self.is_running() {
            bail!("vm is not running");
        }

        let wanted = signature.clone();
        let found = self.handle.submit_and_wait(move |scope, op| {
            let state_rc = Kernel::state(scope);
            let state = state_rc.borrow();
            match state.register.lookup(source, &wanted) {
                Ok(Some(_)) => op.resolve(vec![1]),
                Ok(None) => op.resolve(vec![0]),
                Err(err) => op.reject(err),
            }
        })?;

        if found.first() == Some(&1) {
            Ok(Some(SharedFunctionHandle {
                vm: self.clone(),
                source,
                signature: signature.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Blocks until the call's terminal state arrives. The five-phase
    /// pipeline runs on the VM's serve thread; this thread only waits on
    /// the resolve channel. A VM that closes mid-call unblocks the waiter
    /// with an aborted state.
    pub fn invoke(&self, source: RpcCallSource, request: RpcRequest) -> FunctionCallState {
        if !self.is_running() {
            return FunctionCallState::aborted("vm is not running");
        }
        if !request.is_connected() {
            return FunctionCallState::aborted(RpcError::ConnectionClosed.to_string());
        }

        let rx = rpc::submit_call(&self.handle, source, request);
        match rx.recv() {
            Ok(state) => state,
            Err(mpsc::RecvError) => FunctionCallState::aborted("vm closed"),
        }
    }
}

/// One resolved shared function, pinned to the table it was found in. The
/// transport resolves once, then invokes any number of times.
pub struct SharedFunctionHandle {
    vm: VmHandle,
    source: RpcCallSource,
    signature: FunctionSignature,
}

impl SharedFunctionHandle {
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Runs one call against this function. The request's signature is
    /// replaced with the resolved one, so a caller cannot drift away from
    /// the function it looked up.
    pub fn invoke(&self, mut request: RpcRequest) -> FunctionCallState {
        request.signature = self.signature.clone();
        self.vm.invoke(self.source, request)
    }
}
