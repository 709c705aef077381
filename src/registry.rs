use crate::errors::generic_error;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A parameter or return type tag, as carried on the wire and checked
/// against a registered signature before a call is allowed to enter JS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CType {
    Boolean,
    Number,
    String,
    Array,
    Object,
    Bytes,
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CType::Boolean => "boolean",
            CType::Number => "number",
            CType::String => "string",
            CType::Array => "array",
            CType::Object => "object",
            CType::Bytes => "bytes",
        };
        write!(f, "{name}")
    }
}

impl FromStr for CType {
    type Err = anyhow::Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "boolean" => Ok(CType::Boolean),
            "number" => Ok(CType::Number),
            "string" => Ok(CType::String),
            "array" => Ok(CType::Array),
            "object" => Ok(CType::Object),
            "bytes" => Ok(CType::Bytes),
            other => Err(generic_error(format!("unsupported datatype: {other}"))),
        }
    }
}

/// Name plus ordered parameter type tags identifying a shared function.
/// The return type is deliberately excluded from the canonical key —
/// callers aren't expected to know it ahead of the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<CType>,
    pub return_type: CType,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>, params: Vec<CType>, return_type: CType) -> Self {
        FunctionSignature {
            name: name.into(),
            params,
            return_type,
        }
    }

    /// The canonical signature string used as a table key: function name
    /// plus ordered parameter type tags, joined the same way regardless of
    /// which table the function ends up in.
    pub fn canonical(&self) -> String {
        let mut key = self.name.clone();
        for param in &self.params {
            key.push(':');
            key.push_str(&param.to_string());
        }
        key
    }
}

/// A callable JS function exported to RPC, plus the signature it was
/// registered under. The function handle is a global so it outlives the
/// handle scope that registered it.
pub struct SharedFunction {
    pub signature: FunctionSignature,
    pub function: v8::Global<v8::Function>,
}

/// Which of the two tables a lookup should consult. `Local` is for
/// same-process/CLI callers and reads `rpc`; `Public` is for anything
/// arriving over a transport and reads `rpc_public`. A function registered
/// in only one table is invisible to the other's callers — registration
/// takes this explicitly so main-script code decides its own exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallSource {
    Local,
    Public,
}

impl RpcCallSource {
    fn table_key(&self) -> &'static str {
        match self {
            RpcCallSource::Local => "rpc",
            RpcCallSource::Public => "rpc_public",
        }
    }
}

/// One value published in the kernel's global register. The two
/// shared-function tables are the registered-by-construction entries;
/// anything else a module wants to publish goes in as an opaque JS value.
pub enum RegisterEntry {
    SharedFunctions(HashMap<String, SharedFunction>),
    Opaque(v8::Global<v8::Value>),
}

/// Outcome of a signature lookup: `Ok(None)` just means the function isn't
/// registered; an error means the table itself is missing from the register
/// or holds something other than a shared-function table — a corrupted
/// registration, kept distinguishable from a clean miss.
pub type LookupResult<'a> = Result<Option<&'a SharedFunction>, anyhow::Error>;

/// The kernel-wide name-keyed register. Holds the `rpc` / `rpc_public`
/// shared-function tables plus whatever opaque values modules publish.
/// Mutated only during main-script execution; frozen when the VM
/// transitions to `Running` and read-only for the rest of its life.
pub struct GlobalRegister {
    entries: HashMap<String, RegisterEntry>,
    frozen: bool,
}

impl GlobalRegister {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("rpc".to_string(), RegisterEntry::SharedFunctions(HashMap::new()));
        entries.insert(
            "rpc_public".to_string(),
            RegisterEntry::SharedFunctions(HashMap::new()),
        );
        GlobalRegister { entries, frozen: false }
    }

    pub fn read(&self, key: &str) -> Option<&RegisterEntry> {
        self.entries.get(key)
    }

    pub fn write(&mut self, key: impl Into<String>, entry: RegisterEntry) -> Result<(), anyhow::Error> {
        if self.frozen {
            return Err(generic_error("global register is sealed"));
        }
        self.entries.insert(key.into(), entry);
        Ok(())
    }

    /// One-way. Called at the Starting→Running transition; every mutation
    /// afterwards is refused.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn register_shared_function(
        &mut self,
        source: RpcCallSource,
        function: SharedFunction,
    ) -> Result<(), anyhow::Error> {
        if self.frozen {
            return Err(generic_error("global register is sealed"));
        }
        match self.entries.get_mut(source.table_key()) {
            Some(RegisterEntry::SharedFunctions(table)) => {
                table.insert(function.signature.canonical(), function);
                Ok(())
            }
            Some(RegisterEntry::Opaque(_)) => Err(generic_error(format!(
                "register entry '{}' is not a shared function table",
                source.table_key()
            ))),
            None => Err(generic_error(format!(
                "shared function table '{}' is missing from the global register",
                source.table_key()
            ))),
        }
    }

    pub fn lookup(&self, source: RpcCallSource, signature: &FunctionSignature) -> LookupResult {
        match self.entries.get(source.table_key()) {
            Some(RegisterEntry::SharedFunctions(table)) => Ok(table.get(&signature.canonical())),
            Some(RegisterEntry::Opaque(_)) => Err(generic_error(format!(
                "register entry '{}' is not a shared function table",
                source.table_key()
            ))),
            None => Err(generic_error(format!(
                "shared function table '{}' is missing from the global register",
                source.table_key()
            ))),
        }
    }

    /// Tolerant enumeration: a missing or mistyped table yields an empty
    /// list rather than an error, so identity queries keep working against
    /// a VM whose register was never populated.
    pub fn signatures(&self, source: RpcCallSource) -> Vec<FunctionSignature> {
        match self.entries.get(source.table_key()) {
            Some(RegisterEntry::SharedFunctions(table)) => {
                table.values().map(|f| f.signature.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl Default for GlobalRegister {
    fn default() -> Self {
        GlobalRegister::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_function(scope: &mut v8::HandleScope) -> v8::Global<v8::Function> {
        let source = v8::String::new(scope, "(function() {})").unwrap();
        let script = v8::Script::compile(scope, source, None).unwrap();
        let value = script.run(scope).unwrap();
        let function = v8::Local::<v8::Function>::try_from(value).unwrap();
        v8::Global::new(scope, function)
    }

    fn with_scope<R>(f: impl FnOnce(&mut v8::HandleScope) -> R) -> R {
        crate::kernel::initialize_v8();
        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        let mut scope = v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(&mut scope);
        let mut scope = v8::ContextScope::new(&mut scope, context);
        f(&mut scope)
    }

    #[test]
    fn canonical_signature_excludes_return_type() {
        let a = FunctionSignature::new("echo", vec![CType::String], CType::String);
        let b = FunctionSignature::new("echo", vec![CType::String], CType::Number);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn type_tags_round_trip_through_from_str() {
        for tag in ["boolean", "number", "string", "array", "object", "bytes"] {
            assert_eq!(tag.parse::<CType>().unwrap().to_string(), tag);
        }
        assert!("float".parse::<CType>().is_err());
    }

    #[test]
    fn local_and_public_tables_are_independent() {
        with_scope(|scope| {
            let signature = FunctionSignature::new("echo", vec![CType::String], CType::String);
            let mut register = GlobalRegister::new();
            register
                .register_shared_function(
                    RpcCallSource::Local,
                    SharedFunction {
                        signature: signature.clone(),
                        function: dummy_function(scope),
                    },
                )
                .unwrap();

            assert!(register.lookup(RpcCallSource::Local, &signature).unwrap().is_some());
            assert!(register.lookup(RpcCallSource::Public, &signature).unwrap().is_none());
        });
    }

    #[test]
    fn missing_table_entry_is_a_clean_miss_not_an_error() {
        let register = GlobalRegister::new();
        let signature = FunctionSignature::new("nope", vec![], CType::String);
        let result = register.lookup(RpcCallSource::Local, &signature);
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn mistyped_table_is_an_error_not_a_miss() {
        with_scope(|scope| {
            let mut register = GlobalRegister::new();
            let junk = v8::undefined(scope);
            let junk = v8::Global::new(scope, v8::Local::<v8::Value>::from(junk));
            register.write("rpc", RegisterEntry::Opaque(junk)).unwrap();

            let signature = FunctionSignature::new("echo", vec![], CType::String);
            assert!(register.lookup(RpcCallSource::Local, &signature).is_err());
        });
    }

    #[test]
    fn frozen_register_refuses_registration() {
        with_scope(|scope| {
            let mut register = GlobalRegister::new();
            register.freeze();

            let signature = FunctionSignature::new("late", vec![], CType::String);
            let result = register.register_shared_function(
                RpcCallSource::Local,
                SharedFunction {
                    signature,
                    function: dummy_function(scope),
                },
            );
            assert!(result.is_err());
            assert!(register.is_frozen());
        });
    }
}
