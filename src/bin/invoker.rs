//! invoker: ask a booster to launch an application
//!
//! Exits with the application's exit status once the daemon relays it.

use applauncherd::daemon::client::{
    build_request, parse_args, InvocationOutcome, InvokerClient, InvokerCommand, InvokerOptions,
};
use applauncherd::daemon::config::LauncherConfig;
use applauncherd::error::LauncherError;
use applauncherd::logging::{self, LogTarget};
use std::env;
use std::process;
use std::thread;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let options = match parse_args(&args) {
        Ok(InvokerCommand::Help) => {
            print_usage();
            process::exit(0);
        }
        Ok(InvokerCommand::Invoke(options)) => options,
        Err(msg) => {
            eprintln!("invoker: {}", msg);
            print_usage();
            process::exit(1);
        }
    };

    // Diagnostics only; the user-facing messages go to stderr directly
    let _ = logging::init("invoker", LogTarget::Stderr, false);

    process::exit(invoke(&options));
}

fn invoke(options: &InvokerOptions) -> i32 {
    let request = match build_request(options) {
        Ok(request) => request,
        Err(LauncherError::LoadFailed(_)) => {
            eprintln!("invoker: Can't find application to invoke.");
            return 1;
        }
        Err(e) => {
            eprintln!("invoker: {}", e);
            return 1;
        }
    };

    let config = LauncherConfig::load(None);
    let mut client = InvokerClient::new(&config);
    let outcome = client.invoke(options, &request);
    let code = outcome.exit_code(options.test_mode);

    match &outcome {
        InvocationOutcome::Rejected(rejected) => eprintln!("invoker: {}", rejected.message),
        InvocationOutcome::ConnectFailed => eprintln!(
            "invoker: Can't connect to {}",
            client.socket_path(options.booster_type).display()
        ),
        InvocationOutcome::ProtocolError(msg) => eprintln!("invoker: {}", msg),
        other => tracing::debug!("{} finished: {:?}", options.app, other),
    }
    if !options.delay.is_zero() {
        thread::sleep(options.delay);
    }
    code
}

fn print_usage() {
    println!("Usage: invoker [options] --type=TYPE <application> [args...]");
    println!();
    println!("Launch an application through the booster of the given type.");
    println!();
    println!("Options:");
    println!("  -t, --type=TYPE       Booster type: m, q (or qt), d, e");
    println!("  -s, --single-instance Launch at most one instance of the application");
    println!("      --test-mode       Report launcher outcomes as distinct exit codes");
    println!("  -r, --retry N         Retry the connection N times, one second apart");
    println!("  -n, --no-wait         Don't wait for the application to exit");
    println!("  -d, --delay SECS      Sleep SECS seconds before exiting");
    println!("  -h, --help            Print this help and exit");
}
