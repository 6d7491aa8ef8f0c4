//! Entry point spawned by `xproc_rpc::spawn::start_process` (§5).
//!
//! Grounded on teleprox's `bootstrap.py`: parse the config, fork/detach
//! *before* anything else touches threads or sockets, then build the async
//! runtime only in the final (possibly daemonized) process. Forking a
//! process that has already started a tokio runtime is unsound (the child
//! only gets the forking thread, not the runtime's worker threads), so
//! daemonization happens with plain `std`/`libc` ahead of `#[tokio::main]`.

use std::io::Read;
use std::time::Duration;

use xproc_rpc::log::{self, LogType};
use xproc_rpc::spawn::{BootstrapConfig, BootstrapStatus, report_status};
use xproc_rpc::Server;

fn main() {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .expect("failed to read bootstrap config from stdin");
    let config: BootstrapConfig =
        serde_json::from_str(&raw).expect("malformed bootstrap config on stdin");

    #[cfg(unix)]
    if config.daemon {
        daemonize();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the async runtime");
    runtime.block_on(run(config));
}

/// POSIX double fork (teleprox's bootstrap.py): the first fork's parent
/// exits immediately; the intermediate child calls `setsid()` to drop its
/// controlling terminal; the second fork's parent also exits, leaving only
/// the final grandchild (reparented to init) running, with stdio redirected
/// to `/dev/null`.
#[cfg(unix)]
fn daemonize() {
    use std::ffi::CString;

    unsafe {
        match libc::fork() {
            -1 => panic!("first fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            panic!("setsid failed");
        }
        match libc::fork() {
            -1 => panic!("second fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }

        let root = CString::new("/").expect("no interior nul");
        libc::chdir(root.as_ptr());

        std::io::Write::flush(&mut std::io::stdout()).ok();
        std::io::Write::flush(&mut std::io::stderr()).ok();

        let devnull = CString::new("/dev/null").expect("no interior nul");
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }
    }
}

async fn run(config: BootstrapConfig) {
    log::setup_logging(&config.log_level, LogType::Bootstrap);
    let pid = std::process::id();

    let listen_addr = config
        .listen_addr
        .strip_prefix("tcp://")
        .unwrap_or(&config.listen_addr);

    let server = match Server::bind(listen_addr, Duration::from_millis(200)).await {
        Ok(server) => server,
        Err(e) => {
            let status = BootstrapStatus::Error {
                error: e.chain().map(|cause| cause.to_string()).collect(),
                pid,
            };
            if let Err(e) = report_status(&config.bootstrap_addr, &status).await {
                tracing::error!("could not report startup failure to spawner: {e:?}");
            }
            return;
        }
    };

    if let Some(name) = &config.process_name {
        tracing::info!(process_name = %name, "bootstrapped process");
    }
    if !config.child_name_prefix.is_empty() {
        tracing::debug!(prefix = %config.child_name_prefix, "child name prefix applies to processes this one spawns in turn");
    }
    if let Some(addr) = &config.log_addr {
        tracing::warn!(log_addr = %addr, "log forwarding was requested but is not implemented; logging locally only");
    }
    let status = BootstrapStatus::Ready {
        address: server.address(),
        pid,
    };
    if let Err(e) = report_status(&config.bootstrap_addr, &status).await {
        tracing::warn!("failed to report bootstrap status: {e:?}");
    }

    xproc_rpc::registry::register_server(server.clone())
        .expect("no server already registered for this thread");

    if config.main_thread_dispatch {
        // This binary has no GUI main loop of its own to pin dispatch to,
        // but it can still honor the contract (§4.4): requests are queued by
        // the accept/read tasks and dispatched one at a time here, on the
        // single task that owns this branch, standing in for "the main
        // thread" an embedder would otherwise drive this from.
        tracing::info!("main-thread dispatch requested; draining the dispatch queue on this task");
        let handle = server.run_main_thread_dispatch(xproc_rpc::consts::CHANNEL_SIZE);
        while handle.tick().await {}
    } else {
        server.run_forever().await;
    }
}
