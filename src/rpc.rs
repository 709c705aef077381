use crate::bindings::{self, set_data_bound_function_to};
use crate::config::VmConfig;
use crate::console::ConsoleCache;
use crate::context_manager::CallMethod;
use crate::context_manager::HttpContext;
use crate::errors::{generic_error, JsError, RpcError};
use crate::event_loop::LoopHandle;
use crate::kernel::Kernel;
use crate::registry::{CType, FunctionSignature, RpcCallSource};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// A single parameter or return value on the wire: a type tag plus its JSON
/// representation. `Bytes` is the one tag whose JSON shape isn't the type's
/// natural encoding — see `json_to_v8`/`v8_to_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamCapsule {
    #[serde(rename = "cType")]
    pub c_type: CType,
    pub value: serde_json::Value,
}

/// Terminal outcome of a call, exactly one of which is ever delivered per
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ok,
    Failed,
    Exception,
    Timeout,
    Aborted,
}

/// The response body a transport serializes back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallState {
    pub state: CallState,
    #[serde(rename = "return", skip_serializing_if = "Option::is_none")]
    pub return_values: Option<Vec<ParamCapsule>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionCallState {
    pub fn ok(values: Vec<ParamCapsule>) -> Self {
        FunctionCallState {
            state: CallState::Ok,
            return_values: Some(values),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        FunctionCallState {
            state: CallState::Failed,
            return_values: None,
            error: Some(message.into()),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        FunctionCallState {
            state: CallState::Exception,
            return_values: None,
            error: Some(message.into()),
        }
    }

    pub fn timeout() -> Self {
        FunctionCallState {
            state: CallState::Timeout,
            return_values: None,
            error: Some("function call timed out".to_string()),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        FunctionCallState {
            state: CallState::Aborted,
            return_values: None,
            error: Some(message.into()),
        }
    }
}

/// Everything the pipeline needs about an inbound call before it ever
/// touches V8: which function, which transport, and the live transport
/// context (absent for local/CLI calls, which are always connected).
pub struct RpcRequest {
    pub call_id: String,
    pub call_method: CallMethod,
    pub signature: FunctionSignature,
    pub params: Vec<ParamCapsule>,
    pub http: Option<HttpContext>,
}

impl RpcRequest {
    pub fn is_connected(&self) -> bool {
        self.http.as_ref().map(|http| http.is_connected()).unwrap_or(true)
    }
}

/// Per-call state shared between the five pipeline phases and every native
/// function exposed to the running script (`Resolve`, `Reject`, the shield's
/// console hooks, the `Promise` bookkeeping).
///
/// `try_latch` is the single point that decides whether a response has
/// already gone out. It flips the flag *before* anything is sent, unlike a
/// send-then-flag sequence, which leaves a window where two terminal
/// responses can both believe they were first.
pub struct SharedFunctionRequestContext {
    call_id: String,
    responded: AtomicBool,
    destroyed: AtomicBool,
    timeout_armed: AtomicBool,
    request: RpcRequest,
    return_type: Cell<CType>,
    console: Rc<ConsoleCache>,
    handle: LoopHandle,
    timeout: Duration,
    poll_backoff: Duration,
    sender: Mutex<Option<mpsc::Sender<FunctionCallState>>>,
    // Set the first time `context_external` pins this context into a
    // `v8::External`. Deliberately *not* released when the call's terminal
    // state is sent: script code that stashed a reference to the request
    // object could still invoke those bindings later (a stray `.then()`
    // firing on a later tick), and freeing the backing context out from
    // under a live `External` would be a use-after-free. `release_shield`
    // exists for a caller that can prove no such reference survives; until
    // then this is an accepted per-call leak, reclaimed in bulk when the
    // kernel that owns the isolate shuts down.
    shield_ptr: Cell<Option<*const SharedFunctionRequestContext>>,
}

impl SharedFunctionRequestContext {
    pub fn new(
        request: RpcRequest,
        console: Rc<ConsoleCache>,
        handle: LoopHandle,
        config: &VmConfig,
        sender: mpsc::Sender<FunctionCallState>,
    ) -> Rc<Self> {
        let call_id = request.call_id.clone();
        let return_type = request.signature.return_type;
        Rc::new(SharedFunctionRequestContext {
            call_id,
            responded: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            timeout_armed: AtomicBool::new(false),
            request,
            return_type: Cell::new(return_type),
            console,
            handle,
            timeout: Duration::from_millis(config.rpc_call_timeout_ms),
            poll_backoff: Duration::from_millis(config.poll_backoff_ms.max(1)),
            sender: Mutex::new(Some(sender)),
            shield_ptr: Cell::new(None),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn request(&self) -> &RpcRequest {
        &self.request
    }

    pub fn is_connected(&self) -> bool {
        self.request.is_connected()
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Atomically claims the right to send the terminal response. Only the
    /// caller that wins this exchange may call `send_terminal`.
    fn try_latch(&self) -> bool {
        self.responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn send_terminal(&self, state: FunctionCallState) {
        self.destroyed.store(true, Ordering::SeqCst);
        // The close line goes out before the state is delivered, so no log
        // line for this call can trail its terminal response.
        self.console.log_internal(&self.call_id, "request closed");
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(state);
        }
    }

    /// Balances the strong reference `context_external` leaked into the
    /// script's reach. Only safe once the caller can guarantee no live JS
    /// reference to the request object from this call can fire again — see
    /// the note on `shield_ptr`. Safe to call more than once; every call
    /// after the first is a no-op.
    pub fn release_shield(&self) {
        if let Some(ptr) = self.shield_ptr.take() {
            unsafe { drop(Rc::from_raw(ptr)) };
        }
    }

    /// Native `Resolve(...)`: marshals the arguments into capsules typed
    /// against the registered return type and delivers `state="ok"`. A
    /// second terminal write raises a throw into the running JS frame
    /// instead of overwriting the latched state.
    fn resolve_callback(&self, scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) {
        if !self.try_latch() {
            bindings::throw_message(scope, &RpcError::AlreadyResponded.to_string());
            return;
        }

        let mut values = Vec::new();
        for i in 0..args.length() {
            match v8_to_json(scope, args.get(i), self.return_type.get()) {
                Ok(value) => values.push(ParamCapsule {
                    c_type: self.return_type.get(),
                    value,
                }),
                Err(err) => {
                    self.send_terminal(FunctionCallState::failed(err.to_string()));
                    return;
                }
            }
        }

        if !self.is_connected() {
            self.send_terminal(FunctionCallState::aborted(RpcError::ConnectionClosed.to_string()));
            bindings::throw_message(scope, &RpcError::ConnectionClosed.to_string());
            return;
        }

        self.send_terminal(FunctionCallState::ok(values));
    }

    /// Native `Reject(...)`: joins every argument's string form into the
    /// error message, matching the original's permissive reject signature.
    fn reject_callback(&self, scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) {
        if !self.try_latch() {
            bindings::throw_message(scope, &RpcError::AlreadyResponded.to_string());
            return;
        }

        let message = join_arguments(scope, args);

        if !self.is_connected() {
            self.send_terminal(FunctionCallState::aborted(RpcError::ConnectionClosed.to_string()));
            bindings::throw_message(scope, &RpcError::ConnectionClosed.to_string());
            return;
        }

        self.send_terminal(FunctionCallState::failed(message));
    }

    /// Called when the user function's promise rejected or a JS frame threw
    /// outside the reach of `Resolve`/`Reject`.
    pub fn function_call_exception(&self, message: impl Into<String>) {
        if self.try_latch() {
            self.send_terminal(FunctionCallState::exception(message.into()));
        }
    }

    /// Called when a phase observes the caller's connection gone, or the
    /// kernel closes underneath an in-flight call.
    pub fn abort(&self, message: impl Into<String>) {
        if self.try_latch() {
            self.send_terminal(FunctionCallState::aborted(message.into()));
        }
    }

    /// Called by the pipeline itself when a phase fails before the script
    /// ever ran (lookup miss, signature mismatch) and so has no caught
    /// exception or transport disconnect to report instead.
    pub fn fail(&self, message: impl Into<String>) {
        if self.try_latch() {
            self.send_terminal(FunctionCallState::failed(message.into()));
        }
    }

    /// The settle handler for the wrapper's promise: the user function's
    /// synchronous body has returned, so if nothing has produced a response
    /// yet the timeout clock starts running.
    pub fn function_call_final(self: &Rc<Self>) {
        if !self.has_responded() {
            self.arm_timeout();
        }
        self.console.log_internal(&self.call_id, "function call finalized");
    }

    /// Schedules the call's timeout on the event loop. If nothing has
    /// latched a response by the time it fires, it latches `timeout`
    /// itself. Armed at most once per call.
    pub fn arm_timeout(self: &Rc<Self>) {
        if self.timeout_armed.swap(true, Ordering::SeqCst) || self.has_responded() {
            return;
        }

        let ctx = Rc::clone(self);
        let scheduled = self.handle.schedule_after(self.timeout, move |_scope, op| {
            if ctx.try_latch() {
                ctx.send_terminal(FunctionCallState::timeout());
            }
            op.resolve(Vec::new());
        });
        if scheduled.is_err() {
            self.abort("kernel closed");
        }
    }

    fn new_promise_registered(&self) {
        self.console.log_internal(&self.call_id, "New Promise registrated");
    }

    fn promise_resolved(&self) {
        self.console.log_internal(&self.call_id, "Promise was resolved");
    }

    fn promise_rejected(&self) {
        self.console.log_internal(&self.call_id, "Promise was rejected");
    }

    fn console_log(&self, scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) {
        self.console.log_call(&self.call_id, join_arguments(scope, args));
    }

    fn console_error(&self, scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) {
        self.console.error_call(&self.call_id, join_arguments(scope, args));
    }
}

fn join_arguments(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> String {
    let mut parts = Vec::new();
    for i in 0..args.length() {
        parts.push(args.get(i).to_rust_string_lossy(scope));
    }
    parts.join(" ")
}

/// Pins `ctx` behind a raw pointer wrapped as a `v8::External`, so the
/// (otherwise stateless) native functions the shield installs can recover
/// it via `args.data()`. The first call leaks exactly one strong reference;
/// later calls re-wrap the same pointer. Only `release_shield` ever
/// reclaims it.
fn context_external<'s>(
    scope: &mut v8::HandleScope<'s>,
    ctx: &Rc<SharedFunctionRequestContext>,
) -> v8::Local<'s, v8::External> {
    let ptr = match ctx.shield_ptr.get() {
        Some(ptr) => ptr,
        None => {
            let ptr = Rc::into_raw(Rc::clone(ctx));
            ctx.shield_ptr.set(Some(ptr));
            ptr
        }
    };
    v8::External::new(scope, ptr as *mut std::ffi::c_void)
}

/// Reads the `SharedFunctionRequestContext` an `External` data slot was
/// bound to. Every shield-bound native function goes through this instead
/// of capturing Rust state directly, since `v8::MapFnTo<FunctionCallback>`
/// only accepts non-capturing function items.
///
/// # Safety
/// Sound as long as the external's backing reference is still pinned —
/// `release_shield` only runs once nothing can execute script anymore.
fn ctx_from_data<'s>(args: &v8::FunctionCallbackArguments<'s>) -> &'s SharedFunctionRequestContext {
    let external = v8::Local::<v8::External>::try_from(args.data()).unwrap();
    unsafe { &*(external.value() as *const SharedFunctionRequestContext) }
}

/// Reconstructs a temporary owned `Rc` to the context an `External` was
/// bound to, for the callbacks (the `.then()` continuations) that need
/// `Rc`-receiver methods like `arm_timeout`. `increment_strong_count`
/// bumps the count `context_external` already leaked before `from_raw`
/// hands back an owned handle, so dropping this `Rc` at the end of the
/// trampoline balances back to exactly that leaked count rather than
/// freeing it early.
fn ctx_rc_from_data(args: &v8::FunctionCallbackArguments) -> Rc<SharedFunctionRequestContext> {
    let external = v8::Local::<v8::External>::try_from(args.data()).unwrap();
    let ptr = external.value() as *const SharedFunctionRequestContext;
    unsafe {
        Rc::increment_strong_count(ptr);
        Rc::from_raw(ptr)
    }
}

fn resolve_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    ctx_from_data(&args).resolve_callback(scope, &args);
}

fn reject_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    ctx_from_data(&args).reject_callback(scope, &args);
}

fn console_log_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    ctx_from_data(&args).console_log(scope, &args);
}

fn console_error_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    ctx_from_data(&args).console_error(scope, &args);
}

/// `http.IsConnected()`: a fresh read of the liveness flag on every call,
/// never a snapshot.
fn is_connected_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let connected = ctx_from_data(&args).is_connected();
    rv.set(v8::Boolean::new(scope, connected).into());
}

/// Phase 4's `.then()` continuation for a fulfilled wrapper promise. The
/// settled value itself was already delivered through `Resolve` (or is
/// still to come, in which case the timeout clock starts here).
fn on_fulfilled_trampoline(
    _scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut _rv: v8::ReturnValue,
) {
    ctx_rc_from_data(&args).function_call_final();
}

/// Phase 4's `.then()` continuation for a rejected wrapper promise —
/// delivers `state="exception"` carrying the stringified rejection reason.
fn on_rejected_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut _rv: v8::ReturnValue,
) {
    let ctx = ctx_rc_from_data(&args);
    let reason = args.get(0).to_rust_string_lossy(scope);
    ctx.function_call_exception(reason);
}

/// No-op stand-in for the timer globals inside the shield: a call runs to
/// its terminal state through `Resolve`/`Reject`/a returned promise, never
/// through a real timer firing later on an event loop the shield doesn't
/// expose.
fn timer_stub(_scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {}

fn new_promise_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let ctx = ctx_from_data(&args);
    ctx.new_promise_registered();

    let hooks = bindings::new_plain_object(scope);
    set_data_bound_function_to(
        scope,
        hooks,
        "resolveProxy",
        |_scope: &mut v8::HandleScope,
         args: v8::FunctionCallbackArguments,
         mut _rv: v8::ReturnValue| {
            ctx_from_data(&args).promise_resolved();
        },
        args.data(),
    );
    set_data_bound_function_to(
        scope,
        hooks,
        "rejectProxy",
        |_scope: &mut v8::HandleScope,
         args: v8::FunctionCallbackArguments,
         mut _rv: v8::ReturnValue| {
            ctx_from_data(&args).promise_rejected();
        },
        args.data(),
    );
    rv.set(hooks.into());
}

/// The wrapper every call runs under. Evaluated fresh in the context at
/// phase 2; rebinds the ambient globals to host-controlled hooks, swaps
/// `Promise` for an instrumented subclass whose settle hooks the host can
/// observe, and forces the user function's result into that class so phase
/// 4 always has a promise to watch. The user function receives its own
/// arguments first and the request object last.
const SHIELD_WRAPPER: &str = r#"
((funct, proxyobject, request, ...parms) => {
    console = { log: proxyobject.proxyShieldConsoleLog, error: proxyobject.proxyShieldErrorLog };
    clearInterval = () => proxyobject.clearInterval();
    clearTimeout = () => proxyobject.clearTimeout();
    setInterval = () => proxyobject.setInterval();
    setTimeout = () => proxyobject.setTimeout();
    Resolve = (...parms) => proxyobject.resolve(...parms);
    Promise = class extends Promise {
        constructor(executor) {
            const { resolveProxy, rejectProxy } = proxyobject.newPromise();
            const wrappedExecutor = (resolve, reject) => {
                executor(
                    (value) => {
                        resolveProxy();
                        resolve(value);
                    },
                    (reason) => {
                        rejectProxy();
                        reject(reason);
                    }
                );
            };
            super(wrappedExecutor);
        }
    };
    return new Promise((resolve, reject) => {
        try {
            resolve(funct(...parms, request));
        } catch (err) {
            reject(err);
        }
    });
})
"#;

const SHIELD_ORIGIN: &str = "rpc_function_call_proxy_shield.js";

/// Entry point for one call: enqueues phase 1 on the VM's event loop and
/// hands back the channel its terminal `FunctionCallState` arrives on.
/// If the kernel is already closed the channel reports disconnection
/// instead — callers map that to an aborted state.
pub fn submit_call(
    handle: &LoopHandle,
    source: RpcCallSource,
    request: RpcRequest,
) -> mpsc::Receiver<FunctionCallState> {
    let (tx, rx) = mpsc::channel();
    let _ = handle.submit(move |scope, op| {
        phase_init(scope, source, request, tx);
        op.resolve(Vec::new());
    });
    rx
}

/// Chains the next phase onto the loop. A failed submission means the
/// kernel closed between phases; the call aborts so its waiter unblocks.
fn enqueue_phase(
    ctx: &Rc<SharedFunctionRequestContext>,
    phase: impl FnOnce(&mut v8::HandleScope) + 'static,
) {
    let submitted = ctx.handle.submit(move |scope, op| {
        phase(scope);
        op.resolve(Vec::new());
    });
    if submitted.is_err() {
        ctx.abort("kernel closed");
    }
}

/// Phase 1 — init. Resolves the shared function, enforces the registered
/// signature against the inbound capsules, marshals them into JS values,
/// and builds the request object. Nothing user-authored runs yet.
fn phase_init(
    scope: &mut v8::HandleScope,
    source: RpcCallSource,
    request: RpcRequest,
    sender: mpsc::Sender<FunctionCallState>,
) {
    let state_rc = Kernel::state(scope);
    let (console, handle, config) = {
        let state = state_rc.borrow();
        (state.console.clone(), state.handle.clone(), state.config.clone())
    };

    let ctx = SharedFunctionRequestContext::new(request, console, handle, &config, sender);
    tracing::trace!(call_id = %ctx.call_id, "phase 1: init");

    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let (function, registered) = {
        let state = state_rc.borrow();
        match state.register.lookup(source, &ctx.request.signature) {
            Ok(Some(found)) => (found.function.clone(), found.signature.clone()),
            Ok(None) => {
                ctx.fail(RpcError::FunctionNotFound.to_string());
                return;
            }
            Err(err) => {
                ctx.fail(err.to_string());
                return;
            }
        }
    };
    ctx.return_type.set(registered.return_type);

    if let Err(err) = validate_parameters(&registered, &ctx.request.params) {
        ctx.fail(err.to_string());
        return;
    }

    let mut user_args = Vec::with_capacity(ctx.request.params.len());
    for capsule in &ctx.request.params {
        match json_to_v8(scope, capsule) {
            Ok(value) => user_args.push(v8::Global::new(scope, value)),
            Err(err) => {
                marshalling_failure(&ctx, err);
                return;
            }
        }
    }

    let request_obj = make_request_object(scope, &ctx);

    // Anchors the context until kernel shutdown, so the leaked shield
    // binding always has a live owner to be reclaimed from.
    state_rc.borrow_mut().live_calls.push(Rc::clone(&ctx));

    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let next = Rc::clone(&ctx);
    enqueue_phase(&ctx, move |scope| {
        phase_prepare_shield(scope, next, function, request_obj, user_args)
    });
}

/// Engine-level marshalling failures abort the call; a capsule that simply
/// doesn't match its declared tag fails like any other signature mismatch.
fn marshalling_failure(ctx: &SharedFunctionRequestContext, err: anyhow::Error) {
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::EngineError) => ctx.abort(RpcError::EngineError.to_string()),
        _ => ctx.fail(err.to_string()),
    }
}

/// Phase 2 — shield preparation. Evaluates the wrapper script, builds the
/// proxy object, and assembles the final argument list
/// `(function, proxy, request, ...userArgs)`.
fn phase_prepare_shield(
    scope: &mut v8::HandleScope,
    ctx: Rc<SharedFunctionRequestContext>,
    function: v8::Global<v8::Function>,
    request_obj: v8::Global<v8::Object>,
    user_args: Vec<v8::Global<v8::Value>>,
) {
    tracing::trace!(call_id = %ctx.call_id, "phase 2: shield preparation");
    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let origin = bindings::create_script_origin(scope, SHIELD_ORIGIN);
    let source = v8::String::new(scope, SHIELD_WRAPPER).unwrap();
    let wrapper = v8::Script::compile(scope, source, Some(&origin))
        .and_then(|script| script.run(scope))
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());

    let wrapper = match wrapper {
        Some(wrapper) => v8::Global::new(scope, wrapper),
        None => {
            ctx.abort(RpcError::EngineError.to_string());
            return;
        }
    };

    let proxy = make_proxy_object(scope, &ctx);

    let mut call_args: Vec<v8::Global<v8::Value>> = Vec::with_capacity(user_args.len() + 3);
    let function = v8::Local::new(scope, &function);
    call_args.push(v8::Global::new(scope, v8::Local::<v8::Value>::from(function)));
    call_args.push(v8::Global::new(scope, v8::Local::<v8::Value>::from(proxy)));
    let request_obj = v8::Local::new(scope, &request_obj);
    call_args.push(v8::Global::new(scope, v8::Local::<v8::Value>::from(request_obj)));
    call_args.extend(user_args);

    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let next = Rc::clone(&ctx);
    enqueue_phase(&ctx, move |scope| phase_invoke(scope, next, wrapper, call_args));
}

/// Phase 3 — invoke. Calls the wrapper under the `undefined` receiver. The
/// wrapper guarantees a promise result; anything else is an engine fault.
fn phase_invoke(
    scope: &mut v8::HandleScope,
    ctx: Rc<SharedFunctionRequestContext>,
    wrapper: v8::Global<v8::Function>,
    call_args: Vec<v8::Global<v8::Value>>,
) {
    tracing::trace!(call_id = %ctx.call_id, "phase 3: invoke");
    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let wrapper = v8::Local::new(scope, &wrapper);
    let args: Vec<v8::Local<v8::Value>> = call_args.iter().map(|g| v8::Local::new(scope, g)).collect();
    let undefined = v8::undefined(scope);

    let tc_scope = &mut v8::TryCatch::new(scope);
    let result = wrapper.call(tc_scope, undefined.into(), &args);

    if tc_scope.has_caught() {
        let exception = tc_scope.exception().unwrap();
        let js_error = JsError::from_v8_exception(tc_scope, exception, None);
        ctx.function_call_exception(js_error.message);
        return;
    }

    let promise = result.and_then(|value| v8::Local::<v8::Promise>::try_from(value).ok());
    match promise {
        Some(promise) => {
            let promise = v8::Global::new(tc_scope, promise);
            let next = Rc::clone(&ctx);
            enqueue_phase(&ctx, move |scope| phase_attach(scope, next, promise));
        }
        None => ctx.abort(RpcError::EngineError.to_string()),
    }
}

/// Phase 4 — attach continuations. `then(onResolve, onReject)` wires the
/// wrapper promise's settlement back into the request context.
fn phase_attach(
    scope: &mut v8::HandleScope,
    ctx: Rc<SharedFunctionRequestContext>,
    promise: v8::Global<v8::Promise>,
) {
    tracing::trace!(call_id = %ctx.call_id, "phase 4: attach continuations");
    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let promise_local = v8::Local::new(scope, &promise);
    let external = context_external(scope, &ctx);
    let on_fulfilled = bindings::build_data_bound_function(scope, on_fulfilled_trampoline, external.into());
    let on_rejected = bindings::build_data_bound_function(scope, on_rejected_trampoline, external.into());
    promise_local.then2(scope, on_fulfilled, on_rejected);

    let next = Rc::clone(&ctx);
    enqueue_phase(&ctx, move |scope| phase_poll(scope, next, promise));
}

/// Phase 5 — poll. Re-checks the promise until it leaves `Pending`, backing
/// off through the loop's timer bucket between checks so other operations
/// interleave. A pending promise also starts the timeout clock: a user
/// function that neither settles nor calls `Resolve` must not pin its
/// caller forever.
fn phase_poll(
    scope: &mut v8::HandleScope,
    ctx: Rc<SharedFunctionRequestContext>,
    promise: v8::Global<v8::Promise>,
) {
    if ctx.has_responded() {
        return;
    }
    if !ctx.is_connected() {
        ctx.abort(RpcError::ConnectionClosed.to_string());
        return;
    }

    let promise_local = v8::Local::new(scope, &promise);
    match promise_local.state() {
        // The phase-4 handler already delivered (or armed the timeout).
        v8::PromiseState::Fulfilled => {}
        // Drain the reject handlers registered in phase 4.
        v8::PromiseState::Rejected => scope.perform_microtask_checkpoint(),
        v8::PromiseState::Pending => {
            ctx.arm_timeout();
            let next = Rc::clone(&ctx);
            let scheduled = ctx.handle.schedule_after(ctx.poll_backoff, move |scope, op| {
                phase_poll(scope, next, promise);
                op.resolve(Vec::new());
            });
            if scheduled.is_err() {
                ctx.abort("kernel closed");
            }
        }
    }
}

/// Builds the request object handed to the user function: `Resolve`,
/// `Reject`, the transport tag, and (for HTTP calls) the `http` block with
/// its live `IsConnected()` probe.
fn make_request_object(
    scope: &mut v8::HandleScope,
    ctx: &Rc<SharedFunctionRequestContext>,
) -> v8::Global<v8::Object> {
    let external = context_external(scope, ctx);
    let request = bindings::new_plain_object(scope);

    set_data_bound_function_to(scope, request, "Resolve", resolve_trampoline, external.into());
    set_data_bound_function_to(scope, request, "Reject", reject_trampoline, external.into());

    let call_method = v8::String::new(scope, ctx.request.call_method.as_str()).unwrap();
    bindings::set_constant_to(scope, request, "CallMethod", call_method.into());

    if let Some(http) = &ctx.request.http {
        let http_obj = bindings::create_object_under(scope, request, "http");

        set_data_bound_function_to(scope, http_obj, "IsConnected", is_connected_trampoline, external.into());

        let content_length = v8::Number::new(scope, http.content_length as f64);
        bindings::set_constant_to(scope, http_obj, "ContentLength", content_length.into());

        let host = v8::String::new(scope, &http.host).unwrap();
        bindings::set_constant_to(scope, http_obj, "Host", host.into());

        let proto = v8::String::new(scope, &http.proto).unwrap();
        bindings::set_constant_to(scope, http_obj, "Proto", proto.into());

        let remote_addr = v8::String::new(scope, &http.remote_ip.to_string()).unwrap();
        bindings::set_constant_to(scope, http_obj, "RemoteAddr", remote_addr.into());

        let request_uri = v8::String::new(scope, &http.request_uri).unwrap();
        bindings::set_constant_to(scope, http_obj, "RequestURI", request_uri.into());

        let cookies_json = serde_json::to_string(&http.cookies).unwrap_or_default();
        let cookies_src = v8::String::new(scope, &cookies_json).unwrap();
        let cookies = v8::json::parse(scope, cookies_src).unwrap();
        bindings::set_constant_to(scope, http_obj, "Cookies", cookies);

        let headers_json = serde_json::to_string(&http.headers).unwrap_or_default();
        let headers_src = v8::String::new(scope, &headers_json).unwrap();
        let headers = v8::json::parse(scope, headers_src).unwrap();
        bindings::set_constant_to(scope, http_obj, "Headers", headers);
    }

    v8::Global::new(scope, request)
}

/// Builds the proxy object the shield wrapper delegates to: the console
/// hooks, the timer stubs, `resolve`/`reject`, and the `Promise`
/// bookkeeping hook.
fn make_proxy_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    ctx: &Rc<SharedFunctionRequestContext>,
) -> v8::Local<'s, v8::Object> {
    let external = context_external(scope, ctx);
    let proxy = bindings::new_plain_object(scope);

    set_data_bound_function_to(scope, proxy, "proxyShieldConsoleLog", console_log_trampoline, external.into());
    set_data_bound_function_to(scope, proxy, "proxyShieldErrorLog", console_error_trampoline, external.into());
    bindings::set_function_to(scope, proxy, "setTimeout", timer_stub);
    bindings::set_function_to(scope, proxy, "setInterval", timer_stub);
    bindings::set_function_to(scope, proxy, "clearTimeout", timer_stub);
    bindings::set_function_to(scope, proxy, "clearInterval", timer_stub);
    set_data_bound_function_to(scope, proxy, "resolve", resolve_trampoline, external.into());
    set_data_bound_function_to(scope, proxy, "reject", reject_trampoline, external.into());
    set_data_bound_function_to(scope, proxy, "newPromise", new_promise_trampoline, external.into());

    proxy
}

/// Validates the supplied parameter capsules against the registered
/// signature, producing the exact wire error the original raised on a
/// mismatch rather than a differently worded one.
pub fn validate_parameters(signature: &FunctionSignature, params: &[ParamCapsule]) -> Result<()> {
    if params.len() != signature.params.len() {
        return Err(anyhow!(RpcError::SignatureMismatch));
    }
    for (given, expected) in params.iter().zip(signature.params.iter()) {
        if given.c_type != *expected {
            return Err(anyhow!(RpcError::SignatureMismatch));
        }
    }
    Ok(())
}

/// Converts a parameter capsule into a `v8::Value` ready to pass as an
/// argument. `Bytes` round-trips through a JSON array of byte values, since
/// JSON itself has no binary type; everything else goes through
/// `v8::json::parse` directly.
pub fn json_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    capsule: &ParamCapsule,
) -> Result<v8::Local<'s, v8::Value>> {
    match capsule.c_type {
        CType::Bytes => {
            let bytes: Vec<u8> = serde_json::from_value(capsule.value.clone())
                .map_err(|_| anyhow!(RpcError::SignatureMismatch))?;
            // Copy into v8's backing store directly, the same way a blob
            // column is handed to JS.
            let buffer = v8::ArrayBuffer::new(scope, bytes.len());
            let buffer_store = buffer.get_backing_store();
            for (i, byte) in bytes.iter().enumerate() {
                buffer_store[i].set(*byte);
            }
            // Wrap as a typed array view so the JS side and `v8_to_json`
            // agree on what a `Bytes` value looks like.
            let view = v8::Uint8Array::new(scope, buffer, 0, bytes.len())
                .ok_or_else(|| anyhow!(RpcError::EngineError))?;
            Ok(view.into())
        }
        _ => {
            let text = serde_json::to_string(&capsule.value)
                .map_err(|_| anyhow!(RpcError::SignatureMismatch))?;
            let source = v8::String::new(scope, &text).ok_or_else(|| anyhow!(RpcError::EngineError))?;
            v8::json::parse(scope, source).ok_or_else(|| anyhow!(RpcError::EngineError))
        }
    }
}

/// The inverse of `json_to_v8`: turns a `v8::Value` returned (or resolved)
/// from the running script into the JSON shape a `ParamCapsule` carries,
/// again special-casing a typed array into a byte-value array.
pub fn v8_to_json(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    expected: CType,
) -> Result<serde_json::Value> {
    if expected == CType::Bytes {
        let view = v8::Local::<v8::ArrayBufferView>::try_from(value)
            .map_err(|_| anyhow!(RpcError::SignatureMismatch))?;
        let mut bytes = vec![0u8; view.byte_length()];
        view.copy_contents(&mut bytes);
        return Ok(serde_json::to_value(bytes).unwrap());
    }

    let stringified = v8::json::stringify(scope, value).ok_or_else(|| anyhow!(RpcError::EngineError))?;
    let text = stringified.to_rust_string_lossy(scope);
    serde_json::from_str(&text).map_err(|_| anyhow!(generic_error("return value is not JSON-representable")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    fn with_scope<R>(f: impl FnOnce(&mut v8::HandleScope) -> R) -> R {
        crate::kernel::initialize_v8();
        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        let mut scope = v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(&mut scope);
        let mut scope = v8::ContextScope::new(&mut scope, context);
        f(&mut scope)
    }

    fn echo_signature() -> FunctionSignature {
        FunctionSignature::new("echo", vec![CType::String], CType::String)
    }

    fn local_request(signature: FunctionSignature, params: Vec<ParamCapsule>) -> RpcRequest {
        RpcRequest {
            call_id: "test-call".to_string(),
            call_method: CallMethod::Ipc,
            signature,
            params,
            http: None,
        }
    }

    fn test_context(
        event_loop: &EventLoop,
        request: RpcRequest,
    ) -> (Rc<SharedFunctionRequestContext>, mpsc::Receiver<FunctionCallState>) {
        let (tx, rx) = mpsc::channel();
        let ctx = SharedFunctionRequestContext::new(
            request,
            Rc::new(ConsoleCache::with_default_sink()),
            event_loop.handle(),
            &VmConfig::default(),
            tx,
        );
        (ctx, rx)
    }

    #[test]
    fn local_request_without_http_is_always_connected() {
        let request = local_request(echo_signature(), Vec::new());
        assert!(request.is_connected());
    }

    #[test]
    fn validate_parameters_rejects_arity_mismatch() {
        let signature = echo_signature();
        let err = validate_parameters(&signature, &[]).unwrap_err();
        assert_eq!(err.to_string(), RpcError::SignatureMismatch.to_string());
    }

    #[test]
    fn validate_parameters_rejects_type_mismatch() {
        let signature = echo_signature();
        let params = vec![ParamCapsule {
            c_type: CType::Number,
            value: serde_json::json!(1),
        }];
        assert!(validate_parameters(&signature, &params).is_err());
    }

    #[test]
    fn validate_parameters_accepts_matching_signature() {
        let signature = echo_signature();
        let params = vec![ParamCapsule {
            c_type: CType::String,
            value: serde_json::json!("hi"),
        }];
        assert!(validate_parameters(&signature, &params).is_ok());
    }

    #[test]
    fn latch_only_lets_one_terminal_writer_win() {
        let event_loop = EventLoop::new();
        let (ctx, rx) = test_context(&event_loop, local_request(echo_signature(), Vec::new()));

        ctx.fail("first");
        ctx.abort("second");
        ctx.function_call_exception("third");

        let state = rx.recv().unwrap();
        assert_eq!(state.state, CallState::Failed);
        assert_eq!(state.error.unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resolve_through_the_request_object_delivers_ok() {
        with_scope(|scope| {
            let event_loop = EventLoop::new();
            let (ctx, rx) = test_context(&event_loop, local_request(echo_signature(), Vec::new()));

            let request_obj = make_request_object(scope, &ctx);
            let request_obj = v8::Local::new(scope, &request_obj);
            let global = scope.get_current_context().global(scope);
            bindings::set_property_to(scope, global, "request", request_obj.into());

            let source = v8::String::new(scope, "request.Resolve('hello')").unwrap();
            let script = v8::Script::compile(scope, source, None).unwrap();
            script.run(scope).unwrap();

            let state = rx.recv().unwrap();
            assert_eq!(state.state, CallState::Ok);
            assert_eq!(state.return_values.unwrap()[0].value, serde_json::json!("hello"));
        });
    }

    #[test]
    fn reject_through_the_request_object_delivers_failed() {
        with_scope(|scope| {
            let event_loop = EventLoop::new();
            let (ctx, rx) = test_context(&event_loop, local_request(echo_signature(), Vec::new()));

            let request_obj = make_request_object(scope, &ctx);
            let request_obj = v8::Local::new(scope, &request_obj);
            let global = scope.get_current_context().global(scope);
            bindings::set_property_to(scope, global, "request", request_obj.into());

            let source = v8::String::new(scope, "request.Reject('bad', 'input')").unwrap();
            let script = v8::Script::compile(scope, source, None).unwrap();
            script.run(scope).unwrap();

            let state = rx.recv().unwrap();
            assert_eq!(state.state, CallState::Failed);
            assert_eq!(state.error.unwrap(), "bad input");
        });
    }

    #[test]
    fn double_resolve_throws_into_the_js_frame() {
        with_scope(|scope| {
            let event_loop = EventLoop::new();
            let (ctx, rx) = test_context(&event_loop, local_request(echo_signature(), Vec::new()));

            let request_obj = make_request_object(scope, &ctx);
            let request_obj = v8::Local::new(scope, &request_obj);
            let global = scope.get_current_context().global(scope);
            bindings::set_property_to(scope, global, "request", request_obj.into());

            let source = v8::String::new(
                scope,
                "request.Resolve('first'); let threw = false; try { request.Resolve('second') } catch (e) { threw = true }; threw",
            )
            .unwrap();
            let script = v8::Script::compile(scope, source, None).unwrap();
            let result = script.run(scope).unwrap();
            assert!(result.boolean_value(scope));

            // Exactly one terminal state came through.
            let state = rx.recv().unwrap();
            assert_eq!(state.state, CallState::Ok);
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn bytes_round_trip_through_v8_and_back() {
        with_scope(|scope| {
            let capsule = ParamCapsule {
                c_type: CType::Bytes,
                value: serde_json::json!([1, 2, 3]),
            };
            let value = json_to_v8(scope, &capsule).unwrap();
            let back = v8_to_json(scope, value, CType::Bytes).unwrap();
            assert_eq!(back, serde_json::json!([1, 2, 3]));
        });
    }
}
