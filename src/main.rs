use std::thread::Builder;

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};

use poolhttpd::server::{CancelToken, Config, Server};

fn main() -> Result<()> {
    println!("{}/{}.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = Config::from_command_line()?;

    // Block before any thread is spawned so every thread inherits the mask and only the
    // watcher below ever sees these signals.
    let mut shutdown_signals = SigSet::empty();
    shutdown_signals.add(Signal::SIGINT);
    shutdown_signals.add(Signal::SIGTERM);
    shutdown_signals
        .thread_block()
        .context("failed to block SIGINT and SIGTERM")?;
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;

    let server = Server::new(&config)?;
    println!("listening on: http://{}/", server.local_addr()?);
    println!("serving {} with {} workers", config.wwwroot, server.threads());

    let cancel = CancelToken::new();
    let watcher_cancel = cancel.clone();
    Builder::new()
        .name("signals".to_string())
        .spawn(move || match shutdown_signals.wait() {
            Ok(signal) => {
                println!("caught {:?}", signal);
                watcher_cancel.cancel();
            }
            Err(e) => eprintln!("warning: failed to wait for signals: {}", e),
        })
        .context("failed to spawn signal thread")?;

    server.run(&cancel);
    Ok(())
}
