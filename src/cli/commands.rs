use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tabwriter::TabWriter;

use crate::cli::{Cli, Command, NetworkCommand, RunArgs};
use crate::core::config::{self, Settings};
use crate::core::images;
use crate::core::model::{ContainerRecord, ContainerStatus};
use crate::core::state::Store;
use crate::network::NetworkManager;
use crate::platform::linux::cgroups::ResourceLimits;
use crate::platform::linux::lifecycle::{self, RunOptions};
use crate::platform::linux::process;

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    // The init child runs inside fresh namespaces with its cwd already on
    // the merged mount; it must not touch host state.
    if matches!(cli.command, Command::Init) {
        return process::init_container();
    }

    config::ensure_layout()?;
    let settings = config::load_settings()?;

    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Run(args) => cmd_run(args, &settings),
        Command::Exec { container, cmd } => {
            let code = lifecycle::exec(&container, &cmd)?;
            std::process::exit(code);
        }
        Command::Ps => cmd_ps(),
        Command::Inspect { container } => cmd_inspect(&container),
        Command::Logs { container } => cmd_logs(&container),
        Command::Images => cmd_images(),
        Command::Rmi { image } => images::remove_image(&image),
        Command::Rename { image, new_name } => images::rename_image(&image, &new_name),
        Command::Rm { container, force } => lifecycle::remove(&container, force),
        Command::Stop { container } => lifecycle::stop(&container),
        Command::Start { container } => lifecycle::start(&container, &settings),
        Command::Restart { container } => lifecycle::restart(&container, &settings),
        Command::Pause { container } => lifecycle::pause(&container),
        Command::Continue { container } => lifecycle::resume(&container),
        Command::Commit { container, tag } => cmd_commit(&container, &tag),
        Command::Export { container, output } => cmd_export(&container, output.as_deref()),
        Command::Network { command } => cmd_network(command),
    }
}

// ─── run ────────────────────────────────────────────────────────────────────

fn cmd_run(args: RunArgs, settings: &Settings) -> Result<()> {
    let detach = args.detach;
    let code = lifecycle::run(
        RunOptions {
            tty: args.interactive || args.tty,
            detach,
            image: args.image,
            command: args.cmd,
            limits: ResourceLimits {
                memory: args.memory,
                cpu_percent: args.cpuper,
                cpu_shares: args.cpushare,
                cpuset_cpus: args.cpuset,
            },
            volume: args.volume,
            name: args.name,
            envs: args.envs,
            network: args.network,
            ports: args.ports,
        },
        settings,
    )?;

    if detach {
        return Ok(());
    }
    // Foreground containers propagate the payload's exit status.
    std::process::exit(code);
}

// ─── ps ─────────────────────────────────────────────────────────────────────

fn cmd_ps() -> Result<()> {
    let store = Store::open();
    let records = store.list_records()?;

    let mut tw = TabWriter::new(io::stdout()).minwidth(12).padding(3);
    writeln!(tw, "ID\tNAME\tPID\tIMAGE\tSTATUS\tCOMMAND\tCREATED")?;
    for mut record in records {
        store.refresh_status(&mut record)?;
        let pid = if record.pid.is_empty() {
            "-"
        } else {
            record.pid.as_str()
        };
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            record.id,
            record.name,
            pid,
            record.image,
            record.status,
            record.command,
            record.create_time
        )?;
    }
    tw.flush()?;
    Ok(())
}

// ─── inspect / logs ─────────────────────────────────────────────────────────

fn cmd_inspect(container: &str) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(container)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    let json =
        serde_json::to_string_pretty(&record).context("failed to render container record")?;
    println!("{json}");
    Ok(())
}

fn cmd_logs(container: &str) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(container)?;

    let path = store.log_path(&name);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    print!("{content}");
    Ok(())
}

// ─── images / commit / export ───────────────────────────────────────────────

fn cmd_images() -> Result<()> {
    let images = images::list_images()?;

    let mut tw = TabWriter::new(io::stdout()).minwidth(12).padding(3);
    writeln!(tw, "IMAGE ID\tNAME\tTAG\tSIZE\tCREATED")?;
    for image in images {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            image.id, image.name, image.tag, image.size, image.create_time
        )?;
    }
    tw.flush()?;
    Ok(())
}

/// Resolve a container flag to a record that must be running (commit and
/// export read through the live merged mount).
fn running_record(store: &Store, container: &str) -> Result<ContainerRecord> {
    let name = store.resolve(container)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;
    if record.status != ContainerStatus::Running {
        bail!("container is not running");
    }
    Ok(record)
}

fn cmd_commit(container: &str, tag: &str) -> Result<()> {
    let store = Store::open();
    let record = running_record(&store, container)?;

    let mnt_url = config::container_root(&record.id).join("mnt");
    images::commit_image(&mnt_url, &record.image, tag)
}

fn cmd_export(container: &str, output: Option<&str>) -> Result<()> {
    let store = Store::open();
    let record = running_record(&store, container)?;

    let out_dir = match output {
        Some(path) => {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                env::current_dir()?.join(path)
            }
        }
        None => env::current_dir()?,
    };

    let mnt_url = config::container_root(&record.id).join("mnt");
    let dest = out_dir.join(format!("{}.tar", record.name));
    images::pack_dir(&mnt_url, &dest)?;
    println!("{}", dest.display());
    Ok(())
}

// ─── network ────────────────────────────────────────────────────────────────

fn cmd_network(command: NetworkCommand) -> Result<()> {
    let mut manager = NetworkManager::open()?;
    match command {
        NetworkCommand::Create {
            driver,
            subnet,
            name,
        } => manager.create(&driver, &subnet, &name),
        NetworkCommand::List => {
            let mut tw = TabWriter::new(io::stdout()).minwidth(12).padding(3);
            writeln!(tw, "NAME\tIpRange\tDriver\tGateway")?;
            for network in manager.list() {
                writeln!(
                    tw,
                    "{}\t{}\t{}\t{}",
                    network.name, network.ip_range, network.driver, network.gateway
                )?;
            }
            tw.flush()?;
            Ok(())
        }
        NetworkCommand::Remove { name } => manager.remove(&name),
    }
}
