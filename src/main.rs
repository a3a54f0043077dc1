mod cli;
mod core;
mod network;
mod platform;
mod util;

use std::process;

fn main() {
    // When the exec sentinel environment is present this process was
    // re-executed to enter a container; it must join the namespaces before
    // anything spawns a thread, so this runs ahead of all other setup.
    platform::linux::process::maybe_exec_entry();

    env_logger::init();

    let args = cli::parse();
    if let Err(e) = cli::commands::dispatch(args) {
        eprintln!("xdocker: {e:#}");
        process::exit(1);
    }
}
