use std::ffi::CString;
use std::thread;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use finix::{
    cli::{Cli, parse_args},
    error::SupervisorError,
    runlevel,
    runtime::Paths,
    supervisor::{ExitAction, Supervisor},
};

fn main() {
    let args = parse_args();
    let base_level = args
        .log_level
        .map(|level| level.as_str().to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&base_level))
        .with_filter_reloading();
    let reload_handle = builder.reload_handle();
    builder.init();

    let pid1 = nix::unistd::getpid().as_raw() == 1;
    let paths = resolve_paths(&args);
    info!(
        "finix starting (pid1={pid1}, config {})",
        paths.conf.display()
    );

    let mut supervisor = match Supervisor::new(paths, pid1) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("{err}");
            rescue(pid1);
        }
    };

    supervisor.set_debug_hook(Box::new(move |debug| {
        let directive = if debug { "debug" } else { base_level.as_str() };
        if let Err(err) = reload_handle.reload(EnvFilter::new(directive)) {
            error!("cannot adjust log filter: {err}");
        }
    }));

    let action = supervisor
        .bootstrap(args.runlevel)
        .and_then(|_| supervisor.run());

    match action {
        Ok(ExitAction::Shutdown(shutdown)) if pid1 => {
            unsafe { libc::sync() };
            if let Err(err) = runlevel::execute_shutdown(shutdown) {
                error!("reboot(2) failed: {err}");
                rescue(true);
            }
        }
        Ok(ExitAction::Shutdown(shutdown)) => {
            info!("would {shutdown} (not process 1); exiting");
        }
        Ok(ExitAction::Quit) => info!("finix exiting"),
        Err(err @ SupervisorError::Fatal { .. }) => {
            error!("{err}");
            rescue(pid1);
        }
        Err(err) => {
            error!("supervisor failed: {err}");
            std::process::exit(1);
        }
    }
}

fn resolve_paths(args: &Cli) -> Paths {
    if let Some(root) = &args.root {
        return Paths::rooted(root);
    }
    let mut paths = Paths::system();
    if let Some(conf) = &args.config {
        paths.conf = conf.clone();
    }
    if let Some(confdir) = &args.confdir {
        paths.conf_dir = confdir.clone();
    }
    if let Some(rundir) = &args.rundir {
        paths.run_dir = rundir.clone();
    }
    paths
}

/// Last resort for fatal startup failures: hand the console to a shell when
/// one exists, otherwise idle so the kernel does not panic on PID 1 exiting.
fn rescue(pid1: bool) -> ! {
    error!("entering rescue mode");
    if pid1
        && let Ok(shell) = CString::new("/bin/sh")
    {
        let _ = nix::unistd::execv(&shell, &[&shell]);
    }
    if !pid1 {
        std::process::exit(1);
    }
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
