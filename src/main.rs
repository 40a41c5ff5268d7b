use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vmi_core::config::{validate_config, Config, ConfigLoader};
use vmi_core::{
    CancelToken, Core, GuestTrace, ModuleScope, ProcessFlags, ReplayGuest, VmiError, Walk,
    WaitOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Arch {
    X86,
    X64,
}

impl From<Arch> for ProcessFlags {
    fn from(arch: Arch) -> Self {
        match arch {
            Arch::X86 => ProcessFlags::X86,
            Arch::X64 => ProcessFlags::X64,
        }
    }
}

/// Replays a recorded guest trace through the introspection core
#[derive(Debug, Parser)]
#[command(name = "vmi-core", version, about)]
struct Args {
    /// JSON trace of the guest to replay
    trace: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Block until a process with this name is created
    #[arg(long, value_name = "NAME", requires = "arch")]
    wait_for: Option<String>,

    /// Bitness of the awaited process
    #[arg(long, value_enum)]
    arch: Option<Arch>,

    /// Give up waiting after this many milliseconds
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.with_target)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConfigLoader::new(path)
            .load()
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    validate_config(&config)?;
    init_logging(&config);

    info!("Starting vmi-core v{}", vmi_core::VERSION);

    let trace = GuestTrace::load(&args.trace)
        .with_context(|| format!("reading trace {}", args.trace.display()))?;
    info!(
        "Trace has {} running processes and {} events",
        trace.processes.len(),
        trace.events.len()
    );

    let guest = Arc::new(ReplayGuest::with_breakpoint_limit(
        trace,
        config.dispatch.max_breakpoints,
    ));
    let core = Arc::new(Core::with_config(guest.clone(), &config));

    // Callbacks hold the context weakly; the subscription table lives inside it.
    core.listen_process_create({
        let core = Arc::downgrade(&core);
        move |process| {
            let Some(core) = core.upgrade() else {
                return Ok(());
            };
            let name = core.process_name(process)?;
            info!("process {} created: {}", process, name);
            Ok(())
        }
    })?;
    core.listen_process_delete({
        let core = Arc::downgrade(&core);
        move |process| {
            let Some(core) = core.upgrade() else {
                return Ok(());
            };
            let name = core.process_name(process)?;
            info!("process {} exiting: {}", process, name);
            Ok(())
        }
    })?;
    core.listen_module_load(ModuleScope::Global, {
        let core = Arc::downgrade(&core);
        move |process, module| {
            let Some(core) = core.upgrade() else {
                return Ok(());
            };
            let name = core.module_name(process, module)?;
            let span = core.module_span(process, module)?;
            info!("process {} loaded {} at {}", process, name, span);
            Ok(())
        }
    })?;

    let cancel = CancelToken::new();
    let pending = match (&args.wait_for, args.arch) {
        (Some(name), Some(arch)) => {
            let mut options = WaitOptions::new().with_cancel(cancel.clone());
            if let Some(ms) = args.timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            Some(core.arm_wait_for_process(name, arch.into(), &options)?)
        }
        (Some(_), None) => bail!("--wait-for needs --arch"),
        _ => None,
    };

    let waiter = pending.map(|pending| {
        let core = Arc::clone(&core);
        tokio::task::spawn_blocking(move || {
            pending
                .wait_process()
                .and_then(|process| Ok((process, core.process_pid(process)?)))
        })
    });

    let replay = {
        let core = Arc::clone(&core);
        let guest = guest.clone();
        tokio::task::spawn_blocking(move || {
            let mut failures = 0;
            while let Some(report) = guest.step(&core) {
                failures += report.failures.len();
            }
            failures
        })
    };

    tokio::select! {
        result = replay => {
            let failures = result?;
            if failures > 0 {
                warn!("{} callback failures during replay", failures);
            }
            info!("Replay finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling waits");
            cancel.cancel();
            core.cancel_all_waits();
        }
    }

    if let Some(waiter) = waiter {
        // The trace is exhausted; nothing more can match unless a timeout is pending.
        if args.timeout_ms.is_none() {
            cancel.cancel();
        }
        match waiter.await? {
            Ok((process, pid)) => info!("Found process {} with pid {}", process, pid),
            Err(VmiError::Timeout(after)) => warn!("No match within {:?}", after),
            Err(VmiError::Cancelled) => warn!("Wait cancelled before a match"),
            Err(err) => error!("Wait failed: {}", err),
        }
    }

    let mut running = Vec::new();
    core.list_processes(|process| {
        running.push(process);
        Walk::Continue
    })?;
    for process in running {
        if let Ok(desc) = core.resolve(process) {
            info!("{} -> {}", process, desc);
        }
    }

    Ok(())
}
