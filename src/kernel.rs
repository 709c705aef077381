use crate::bindings;
use crate::config::VmConfig;
use crate::console::ConsoleCache;
use crate::errors::JsError;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::image::fingerprint_of;
use crate::modules::{KernelModule, ModuleRegistry};
use crate::registry::{CType, FunctionSignature, GlobalRegister, RegisterEntry, RpcCallSource, SharedFunction};
use crate::rpc::{self, FunctionCallState, RpcRequest, SharedFunctionRequestContext};
use anyhow::{bail, Error};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Once;
use std::time::Duration;

/// Everything stored in the isolate's slot. Reachable from any native
/// callback via `Kernel::state`, which is what gives otherwise-stateless v8
/// callbacks a way back into Rust state.
pub struct KernelState {
    pub context: v8::Global<v8::Context>,
    pub handle: LoopHandle,
    pub register: GlobalRegister,
    pub modules: ModuleRegistry,
    pub console: Rc<ConsoleCache>,
    pub config: VmConfig,
    fingerprint: Option<String>,
    main_script_ran: bool,
    // Calls whose shield bindings were never explicitly released (see
    // `SharedFunctionRequestContext::release_shield`). Drained and released
    // in bulk on `Kernel::close`.
    pub(crate) live_calls: Vec<Rc<SharedFunctionRequestContext>>,
}

/// Owns the isolate and its event loop. One `Kernel` is one fleet member:
/// a single-threaded JS environment serving calls for exactly one VM.
pub struct Kernel {
    isolate: v8::OwnedIsolate,
    pub event_loop: EventLoop,
}

/// Process-wide V8 bootstrap. Safe to call from any number of kernels or
/// threads; only the first call does anything.
pub fn initialize_v8() {
    static V8_INIT: Once = Once::new();
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

impl Kernel {
    pub fn new(config: VmConfig) -> Kernel {
        let flags = concat!(" --harmony-import-assertions", " --no-validate-asm");

        match config.seed {
            Some(seed) => v8::V8::set_flags_from_string(&format!(
                "{flags} --predictable --random-seed={seed}"
            )),
            None => v8::V8::set_flags_from_string(flags),
        }

        initialize_v8();

        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = bindings::create_new_context(scope);
            let scope = &mut v8::ContextScope::new(scope, context);
            let global = context.global(scope);
            bindings::set_function_to(scope, global, "__registerLocal", register_local);
            bindings::set_function_to(scope, global, "__registerPublic", register_public);
            v8::Global::new(scope, context)
        };

        let event_loop = EventLoop::new();
        let console = Rc::new(ConsoleCache::with_default_sink());

        isolate.set_slot(Rc::new(RefCell::new(KernelState {
            context,
            handle: event_loop.handle(),
            register: GlobalRegister::new(),
            modules: ModuleRegistry::new(),
            console,
            config,
            fingerprint: None,
            main_script_ran: false,
            live_calls: Vec::new(),
        })));

        Kernel { isolate, event_loop }
    }

    /// Registers a kernel module under its own name, both in the module
    /// table (for lookup) and as a plain global namespace object — there is
    /// no `import`/module-graph machinery here, just one flat object per
    /// module. Valid only before the main script runs.
    pub fn add_import_module(&mut self, module: &dyn KernelModule) -> Result<(), Error> {
        if self.get_state().borrow().main_script_ran {
            bail!("cannot register module '{}' after the main script ran", module.name());
        }

        let scope = &mut self.handle_scope();
        let object = module.init(scope);
        let global = scope.get_current_context().global(scope);
        bindings::set_property_to(scope, global, module.name(), object.into());

        let state_rc = Kernel::state(scope);
        state_rc.borrow_mut().modules.register(scope, module);
        Ok(())
    }

    /// Runs the VM's main script: top-level code that registers shared
    /// functions via `__registerLocal`/`__registerPublic` but does not
    /// itself handle a call. Runs at most once per kernel; the script also
    /// stamps the kernel's fingerprint.
    pub fn run_main_script(&mut self, filename: &str, source: &str) -> Result<(), Error> {
        {
            let state_rc = self.get_state();
            let mut state = state_rc.borrow_mut();
            if state.main_script_ran {
                bail!("main script already executed");
            }
            state.main_script_ran = true;
            state.fingerprint = Some(fingerprint_of(source));
        }

        let scope = &mut self.handle_scope();
        let origin = bindings::create_script_origin(scope, filename);
        let source = v8::String::new(scope, source).unwrap();

        let tc_scope = &mut v8::TryCatch::new(scope);
        let script = match v8::Script::compile(tc_scope, source, Some(&origin)) {
            Some(script) => script,
            None => {
                let exception = tc_scope.exception().unwrap();
                bail!(JsError::from_v8_exception(tc_scope, exception, None));
            }
        };

        match script.run(tc_scope) {
            Some(_) => Ok(()),
            None => {
                let exception = tc_scope.exception().unwrap();
                bail!(JsError::from_v8_exception(tc_scope, exception, None));
            }
        }
    }

    /// The hex digest of the main script, stamped when it ran. `None` on a
    /// kernel that never executed a script.
    pub fn fingerprint(&self) -> Option<String> {
        self.get_state().borrow().fingerprint.clone()
    }

    pub fn all_signatures(&self, source: RpcCallSource) -> Vec<FunctionSignature> {
        self.get_state().borrow().register.signatures(source)
    }

    /// Reads an opaque value previously published in the global register.
    /// The two shared-function tables live in the same register but are
    /// reached through the typed signature APIs instead.
    pub fn global_register_read(&self, key: &str) -> Option<v8::Global<v8::Value>> {
        match self.get_state().borrow().register.read(key) {
            Some(RegisterEntry::Opaque(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn global_register_write(&self, key: impl Into<String>, value: v8::Global<v8::Value>) -> Result<(), Error> {
        self.get_state()
            .borrow_mut()
            .register
            .write(key, RegisterEntry::Opaque(value))
    }

    /// Seals the global register. Called at the Starting→Running
    /// transition; registration attempts from inside a later JS frame throw
    /// instead of mutating the tables.
    pub fn freeze_register(&self) {
        self.get_state().borrow_mut().register.freeze();
    }

    /// Dispatches one RPC request through the five-phase pipeline and pumps
    /// the event loop on this thread until the call's terminal state
    /// arrives. This is the single-threaded driver for callers that own the
    /// kernel directly (the CLI, tests); a transport talking to a serving
    /// VM submits through `VmHandle::invoke` and lets the VM's own serve
    /// loop do the pumping instead.
    pub fn call(&mut self, source: RpcCallSource, request: RpcRequest) -> FunctionCallState {
        let rx = rpc::submit_call(&self.event_loop.handle(), source, request);
        let context = self.context();

        loop {
            match rx.try_recv() {
                Ok(state) => return state,
                Err(mpsc::TryRecvError::Disconnected) => {
                    return FunctionCallState::aborted("kernel closed")
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }

            let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context.clone());
            self.event_loop.serve_one(scope, Duration::from_millis(1));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.is_closed()
    }

    /// Serves one queued event-loop operation (if any is ready within
    /// `timeout`). Used by `CoreVm::serve`'s main poll loop once the VM has
    /// left `Starting`.
    pub fn serve_one(&mut self, timeout: Duration) -> bool {
        let context = self.context();
        let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);
        self.event_loop.serve_one(scope, timeout)
    }

    /// Closes the loop (cancelling everything still queued), aborts any
    /// call that never produced a terminal state so its waiter unblocks,
    /// and reclaims every leaked shield binding. Correct only because
    /// nothing can run script on this isolate afterwards. Idempotent.
    pub fn close(&mut self) {
        self.event_loop.close();

        let state_rc = self.get_state();
        let live_calls: Vec<_> = state_rc.borrow_mut().live_calls.drain(..).collect();
        for call in live_calls {
            call.abort("kernel closed");
            call.release_shield();
        }
    }

    pub fn config(&self) -> VmConfig {
        self.get_state().borrow().config.clone()
    }

    pub fn console(&self) -> Rc<ConsoleCache> {
        self.get_state().borrow().console.clone()
    }
}

// Queued operation closures own V8 globals, which must be dropped while
// the isolate is still alive; draining the loop here covers kernels that
// were never explicitly closed.
impl Drop for Kernel {
    fn drop(&mut self) {
        self.close();
    }
}

// State management, mirroring the isolate-slot recipe.
impl Kernel {
    pub fn state(isolate: &v8::Isolate) -> Rc<RefCell<KernelState>> {
        isolate.get_slot::<Rc<RefCell<KernelState>>>().unwrap().clone()
    }

    pub fn get_state(&self) -> Rc<RefCell<KernelState>> {
        Kernel::state(&self.isolate)
    }

    pub fn handle_scope(&mut self) -> v8::HandleScope {
        let context = self.context();
        v8::HandleScope::with_context(&mut self.isolate, context)
    }

    pub fn context(&self) -> v8::Global<v8::Context> {
        self.get_state().borrow().context.clone()
    }
}

/// Shared body of the two registration natives the main script calls:
/// `__registerLocal(name, paramTags, returnTag, fn)` and its `rpc_public`
/// twin. Bad arguments throw into the registering frame; so does a
/// registration attempt after the register froze.
fn register_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, source: RpcCallSource) {
    let name = args.get(0).to_rust_string_lossy(scope);

    let params = match v8::Local::<v8::Array>::try_from(args.get(1)) {
        Ok(array) => array,
        Err(_) => {
            bindings::throw_type_error(scope, "second argument must be an array of type tags");
            return;
        }
    };
    let mut param_types = Vec::with_capacity(params.length() as usize);
    for i in 0..params.length() {
        let tag = params
            .get_index(scope, i)
            .map(|value| value.to_rust_string_lossy(scope))
            .unwrap_or_default();
        match tag.parse::<CType>() {
            Ok(c_type) => param_types.push(c_type),
            Err(err) => {
                bindings::throw_type_error(scope, &err.to_string());
                return;
            }
        }
    }

    let return_type = match args.get(2).to_rust_string_lossy(scope).parse::<CType>() {
        Ok(c_type) => c_type,
        Err(err) => {
            bindings::throw_type_error(scope, &err.to_string());
            return;
        }
    };

    let function = match v8::Local::<v8::Function>::try_from(args.get(3)) {
        Ok(function) => function,
        Err(_) => {
            bindings::throw_type_error(scope, "fourth argument must be a function");
            return;
        }
    };
    let function = v8::Global::new(scope, function);
    let signature = FunctionSignature::new(name, param_types, return_type);

    let state_rc = Kernel::state(scope);
    let registered = state_rc
        .borrow_mut()
        .register
        .register_shared_function(source, SharedFunction { signature, function });
    if let Err(err) = registered {
        bindings::throw_message(scope, &err.to_string());
    }
}

fn register_local(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    register_callback(scope, args, RpcCallSource::Local);
}

fn register_public(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    register_callback(scope, args, RpcCallSource::Public);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_manager::CallMethod;
    use crate::registry::CType;
    use crate::rpc::{CallState, ParamCapsule};

    fn test_kernel() -> Kernel {
        let mut kernel = Kernel::new(VmConfig {
            rpc_call_timeout_ms: 200,
            poll_backoff_ms: 1,
            ..VmConfig::default()
        });
        kernel
            .run_main_script(
                "main.js",
                r#"
                __registerLocal("echo", ["string"], "string", function (value, request) {
                    request.Resolve(value);
                });
                __registerLocal("boom", [], "string", function () {
                    throw new Error("kaboom");
                });
                __registerLocal("never", [], "string", function () {
                    // settles nothing; the wrapper promise fulfills and the
                    // timeout clock has to finish the call
                });
                __registerLocal("pending", [], "string", function () {
                    return new Promise(() => {});
                });
                __registerLocal("rejecting", [], "string", function () {
                    return new Promise((_, reject) => reject("boom"));
                });
                __registerLocal("chatty", [], "string", function (request) {
                    console.log("hello", "world");
                    request.Resolve("done");
                });
                __registerLocal("promisey", [], "string", function (request) {
                    new Promise((resolve) => resolve(1)).then(() => request.Resolve("later"));
                });
                __registerLocal("timered", [], "string", function (request) {
                    setTimeout(() => {}, 50);
                    clearTimeout(undefined);
                    request.Resolve("timers stubbed");
                });
                "#,
            )
            .unwrap();
        kernel
    }

    fn request(name: &str, params: Vec<CType>, return_type: CType, values: Vec<ParamCapsule>) -> RpcRequest {
        RpcRequest {
            call_id: "test".to_string(),
            call_method: CallMethod::Ipc,
            signature: FunctionSignature::new(name, params, return_type),
            params: values,
            http: None,
        }
    }

    #[test]
    fn registered_function_is_visible_in_local_signatures() {
        let kernel = test_kernel();
        let signatures = kernel.all_signatures(RpcCallSource::Local);
        assert!(signatures.iter().any(|s| s.name == "echo"));
        assert!(kernel.all_signatures(RpcCallSource::Public).is_empty());
    }

    #[test]
    fn main_script_stamps_the_fingerprint() {
        let kernel = test_kernel();
        let fingerprint = kernel.fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
    }

    #[test]
    fn main_script_runs_at_most_once() {
        let mut kernel = test_kernel();
        assert!(kernel.run_main_script("main.js", "print('again')").is_err());
    }

    #[test]
    fn echo_call_resolves_with_its_argument() {
        let mut kernel = test_kernel();
        let params = vec![ParamCapsule {
            c_type: CType::String,
            value: serde_json::json!("hello"),
        }];
        let req = request("echo", vec![CType::String], CType::String, params);
        let state = kernel.call(RpcCallSource::Local, req);

        assert_eq!(state.state, CallState::Ok);
        assert_eq!(state.return_values.unwrap()[0].value, serde_json::json!("hello"));
        kernel.close();
    }

    #[test]
    fn unregistered_function_fails_cleanly() {
        let mut kernel = test_kernel();
        let req = request("missing", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Failed);
        assert_eq!(state.error.unwrap(), "function not found");
        kernel.close();
    }

    #[test]
    fn capsule_type_mismatch_fails_before_entering_js() {
        let mut kernel = test_kernel();
        let params = vec![ParamCapsule {
            c_type: CType::Number,
            value: serde_json::json!(42),
        }];
        let req = request("echo", vec![CType::String], CType::String, params);
        let state = kernel.call(RpcCallSource::Local, req);

        assert_eq!(state.state, CallState::Failed);
        assert_eq!(state.error.unwrap(), "not same parameter");
        kernel.close();
    }

    #[test]
    fn synchronous_throw_becomes_an_exception_state() {
        let mut kernel = test_kernel();
        let req = request("boom", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Exception);
        assert!(state.error.unwrap().contains("kaboom"));
        kernel.close();
    }

    #[test]
    fn rejected_promise_becomes_an_exception_state() {
        let mut kernel = test_kernel();
        let req = request("rejecting", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Exception);
        assert_eq!(state.error.unwrap(), "boom");
        kernel.close();
    }

    #[test]
    fn never_settled_call_eventually_times_out() {
        let mut kernel = test_kernel();
        let req = request("never", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Timeout);
        kernel.close();
    }

    #[test]
    fn forever_pending_promise_times_out_through_the_poller() {
        let mut kernel = test_kernel();
        let req = request("pending", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Timeout);
        kernel.close();
    }

    #[test]
    fn resolve_from_a_promise_continuation_is_delivered() {
        let mut kernel = test_kernel();
        let req = request("promisey", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Ok);
        assert_eq!(state.return_values.unwrap()[0].value, serde_json::json!("later"));
        kernel.close();
    }

    #[test]
    fn shield_console_lines_reach_the_cache_tagged_by_call_id() {
        let mut kernel = test_kernel();
        let req = request("chatty", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Ok);

        let lines = kernel.console().drain();
        assert!(lines
            .iter()
            .any(|line| line.tag == "RPC(TEST):-$" && line.message == "hello world"));
        kernel.close();
    }

    #[test]
    fn shielded_promise_creation_is_logged() {
        let mut kernel = test_kernel();
        let req = request("promisey", vec![], CType::String, vec![]);
        kernel.call(RpcCallSource::Local, req);

        let lines = kernel.console().drain();
        assert!(lines
            .iter()
            .any(|line| line.tag == "rpc(test)" && line.message == "New Promise registrated"));
        kernel.close();
    }

    #[test]
    fn timer_globals_are_stubbed_inside_a_call() {
        let mut kernel = test_kernel();
        let req = request("timered", vec![], CType::String, vec![]);
        let state = kernel.call(RpcCallSource::Local, req);
        assert_eq!(state.state, CallState::Ok);
        kernel.close();
    }

    #[test]
    fn registration_after_freeze_throws_into_the_script() {
        let mut kernel = Kernel::new(VmConfig::default());
        kernel.run_main_script("main.js", "print('no registrations')").unwrap();
        kernel.freeze_register();

        // A frozen register refuses new functions; the throw surfaces as a
        // script error on a later evaluation.
        let scope = &mut kernel.handle_scope();
        let source = v8::String::new(
            scope,
            "__registerLocal('late', [], 'string', function () {})",
        )
        .unwrap();
        let tc_scope = &mut v8::TryCatch::new(scope);
        let script = v8::Script::compile(tc_scope, source, None).unwrap();
        let result = script.run(tc_scope);
        assert!(result.is_none());
        assert!(tc_scope.has_caught());
    }

    #[test]
    fn modules_cannot_register_after_the_main_script() {
        let mut kernel = Kernel::new(VmConfig::default());
        kernel.run_main_script("main.js", "print('ready')").unwrap();
        assert!(kernel.add_import_module(&crate::modules::NetModule).is_err());
    }

    #[test]
    fn opaque_register_entries_round_trip() {
        let mut kernel = Kernel::new(VmConfig::default());
        let value = {
            let scope = &mut kernel.handle_scope();
            let value = v8::Number::new(scope, 7.0);
            v8::Global::new(scope, v8::Local::<v8::Value>::from(value))
        };
        kernel.global_register_write("lucky", value).unwrap();

        assert!(kernel.global_register_read("lucky").is_some());
        assert!(kernel.global_register_read("missing").is_none());
        // The shared-function tables are not exposed as opaque values.
        assert!(kernel.global_register_read("rpc").is_none());
    }
}
