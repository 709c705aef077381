use clap::{Args, Parser, Subcommand};
use custodia_kernel::config::VmConfig;
use custodia_kernel::errors::{generic_error, unwrap_or_exit};
use custodia_kernel::image::{VmImage, VmManifest};
use custodia_kernel::kernel::Kernel;
use custodia_kernel::registry::RpcCallSource;
use custodia_kernel::rpc::RpcRequest;
use custodia_kernel::vm::CoreVm;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Run a VM's main script and serve RPC calls until the process is interrupted",
        arg_required_else_help = true
    )]
    Serve(ServeArgs),
    #[command(
        about = "Run a VM's main script, invoke one local call, and print the resulting FunctionCallState",
        arg_required_else_help = true
    )]
    Call(CallArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(help = "Path to the VM's main script")]
    script: PathBuf,
    #[arg(long, help = "Pending-promise call timeout in milliseconds", default_value_t = 30_000)]
    rpc_call_timeout_ms: u64,
}

#[derive(Debug, Args)]
struct CallArgs {
    #[arg(help = "Path to the VM's main script")]
    script: PathBuf,
    #[arg(help = "A call request as JSON; reads stdin when omitted")]
    request: Option<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Call(args) => run_call(args),
    }
}

/// Runs a VM's full lifecycle: main script, then `Running`, then the serve
/// loop until something external kills the process or calls
/// `VmHandle::signal_shutdown` through the library API. There is no signal
/// handler installed here — that belongs to a real transport, out of scope
/// for this demo entry point.
fn run_serve(args: ServeArgs) {
    let source = unwrap_or_exit(fs::read_to_string(&args.script).map_err(|e| generic_error(e.to_string())));

    let name = args
        .script
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vm".to_string());
    let manifest = VmManifest {
        name,
        owner: String::new(),
        repo_url: String::new(),
    };
    let config = VmConfig {
        main_script_origin: args.script.to_string_lossy().into_owned(),
        rpc_call_timeout_ms: args.rpc_call_timeout_ms,
        ..VmConfig::default()
    };

    let mut vm = CoreVm::new(VmImage::new(manifest, source), config);
    unwrap_or_exit(vm.serve());
}

/// A quick way to exercise a shared function without standing up a
/// transport: runs the main script directly against a bare `Kernel` (not
/// the `CoreVm` state machine, which would block in its serve loop), then
/// performs exactly one local call.
fn run_call(args: CallArgs) {
    let source = unwrap_or_exit(fs::read_to_string(&args.script).map_err(|e| generic_error(e.to_string())));

    let request_text = match args.request {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            unwrap_or_exit(
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|e| generic_error(e.to_string())),
            );
            buf
        }
    };

    let wire: CliCallRequest = unwrap_or_exit(
        serde_json::from_str(&request_text).map_err(|e| generic_error(format!("invalid call request JSON: {e}"))),
    );
    let request = RpcRequest {
        call_id: wire.call_id,
        call_method: wire.call_method,
        signature: custodia_kernel::registry::FunctionSignature::new(
            wire.function,
            wire.params.iter().map(|p| p.c_type).collect(),
            wire.return_type,
        ),
        params: wire.params,
        http: None,
    };

    let filename = args.script.to_string_lossy().into_owned();
    let mut kernel = Kernel::new(VmConfig::default());
    unwrap_or_exit(kernel.run_main_script(&filename, &source));

    let state = kernel.call(RpcCallSource::Local, request);
    kernel.close();
    println!("{}", serde_json::to_string_pretty(&state).unwrap());
}

/// The CLI's own wire shape for a local call: the full `RpcRequest` carries
/// an `HttpContext` that doesn't serialize (it owns a cancellation watcher
/// thread), so the CLI only ever decodes this trimmed shape and always
/// attaches `http: None`.
#[derive(serde::Deserialize)]
struct CliCallRequest {
    call_id: String,
    call_method: custodia_kernel::context_manager::CallMethod,
    function: String,
    params: Vec<custodia_kernel::rpc::ParamCapsule>,
    return_type: custodia_kernel::registry::CType,
}
