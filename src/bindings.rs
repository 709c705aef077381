/// Populates a new JavaScript context with the handful of bare-minimum
/// globals every kernel context needs. Everything a call actually needs
/// (console, Promise, timers, the request object) is installed per-call by
/// the proxy shield in `rpc` rather than baked into the global object,
/// since it must be swappable per in-flight request.
pub fn create_new_context<'s>(scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, v8::Context> {
    // Here we need an EscapableHandleScope so V8 doesn't drop the
    // newly created HandleScope on return. (https://v8.dev/docs/embed#handles-and-garbage-collection)
    let scope = &mut v8::EscapableHandleScope::new(scope);

    // Create and enter a new JavaScript context.
    let context = v8::Context::new(scope);
    let global = context.global(scope);
    let scope = &mut v8::ContextScope::new(scope, context);

    // Simple print function bound to Rust's println! macro, useful while a
    // main script registers its functions (outside of any RPC call, before
    // the shield is installed).
    set_function_to(
        scope,
        global,
        "print",
        |scope: &mut v8::HandleScope,
         args: v8::FunctionCallbackArguments,
         mut _rv: v8::ReturnValue| {
            let value = args.get(0).to_rust_string_lossy(scope);
            println!("{value}");
        },
    );

    scope.escape(context)
}

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.set(scope, key.into(), value);
}

/// Adds a read-only property with the given name and value, into the given object.
pub fn set_constant_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.define_own_property(scope, key.into(), value, v8::PropertyAttribute::READ_ONLY);
}

/// Adds a `Function` object which calls the given Rust function
pub fn set_function_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let template = v8::FunctionTemplate::new(scope, callback);
    let val = template.get_function(scope).unwrap();

    target.set(scope, key.into(), val.into());
}

/// Adds a `Function` object bound to a piece of `v8::External` data, so the
/// (otherwise stateless) callback can recover per-instance state via
/// `args.data()`. Used throughout the proxy shield and request object,
/// where every bound method needs to reach back into the
/// `SharedFunctionRequestContext` that created it.
pub fn set_data_bound_function_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
    data: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let value = build_data_bound_function(scope, callback, data);

    target.set(scope, key.into(), value.into());
}

/// Creates an object with a given name under a `target` object.
pub fn create_object_under<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<v8::Object>,
    name: &'static str,
) -> v8::Local<'s, v8::Object> {
    let template = v8::ObjectTemplate::new(scope);
    let key = v8::String::new(scope, name).unwrap();
    let value = template.new_instance(scope).unwrap();

    target.set(scope, key.into(), value.into());
    value
}

/// Creates a bare object attached to nothing — not the global object, not
/// any other object's property. Used for the proxy shield and the request
/// object, both of which are handed to a call positionally rather than
/// left reachable from the global namespace.
pub fn new_plain_object<'s>(scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object> {
    v8::ObjectTemplate::new(scope).new_instance(scope).unwrap()
}

/// Builds a data-bound `Function` value without attaching it to any object,
/// for callers (like a `Promise.then` continuation) that need the function
/// value itself rather than a named property.
pub fn build_data_bound_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
    data: v8::Local<v8::Value>,
) -> v8::Local<'s, v8::Function> {
    v8::FunctionBuilder::new(callback).data(data).build(scope).unwrap()
}

/// Creates a v8 script origin for traditional (non-module) script
/// execution — the name shows up in stack traces and error output.
pub fn create_script_origin<'s>(scope: &mut v8::HandleScope<'s>, name: &str) -> v8::ScriptOrigin<'s> {
    let name = v8::String::new(scope, name).unwrap();
    let source_map = v8::undefined(scope);

    v8::ScriptOrigin::new(scope, name.into(), 0, 0, false, 0, source_map.into(), false, false, false)
}

/// Throws a plain-string v8 exception, for callbacks that only have a
/// message and no underlying `anyhow::Error` (e.g. the request-context
/// latch's double-response throw).
pub fn throw_message(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

/// Useful utility to throw v8 type errors.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}
