//! vmlink: start, connect to and reconfigure a build VM from the command line.
//!
//! Every configuration change goes through the connection engine's
//! lock-down, so a running VM is powered off first and a connection that
//! was up is re-established afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info};

use vmlink::command::CommandQueue;
use vmlink::config::{Config, default_config_content, ensure_default_config};
use vmlink::config_watcher::ConfigFileWatcher;
use vmlink::connection::{ConnectionStatus, VmConnection};
use vmlink::logging;
use vmlink::paths::VmlinkPaths;
use vmlink::ssh::OpenSshConnector;
use vmlink::ui::{AnswerPolicy, HeadlessUi, Question};
use vmlink::vm::{
    self, FetchFlags, PortForwardingRule, Protocol, ReservedPort, ReservedPortList, SharedPath, VideoMode,
};

/// Build VM connection manager
#[derive(Parser, Debug)]
#[command(name = "vmlink", version, about = "Start, connect to and configure a build VM")]
struct Cli {
    /// Config file (default: ~/.config/vmlink/vmlink.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Answer yes to every question, including closing a VM started elsewhere
    #[arg(long, global = true, conflicts_with = "no")]
    yes: bool,

    /// Answer no to every question
    #[arg(long, global = true)]
    no: bool,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a commented default config file
    Init,
    /// Start the VM if needed and connect over SSH
    Connect {
        /// Stay connected until interrupted, reloading SSH settings on change
        #[arg(long)]
        hold: bool,
    },
    /// Disconnect and close the VM
    Disconnect,
    /// Show the connection state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show the VM's configuration
    Info {
        #[arg(long)]
        storage: bool,
        #[arg(long)]
        snapshots: bool,
        #[arg(long)]
        json: bool,
    },
    SetMemory {
        megabytes: u32,
    },
    SetCpus {
        count: u32,
    },
    /// Grow the system disk
    SetStorage {
        megabytes: u64,
    },
    /// WIDTHxHEIGHT[xDEPTH]
    SetVideoMode {
        mode: VideoMode,
    },
    /// Map a host directory into the guest
    Share {
        which: SharedPathArg,
        path: PathBuf,
    },
    /// Forward one of the reserved guest services
    SetReservedPort {
        which: ReservedPortArg,
        host_port: u16,
    },
    /// Replace a numbered list of forwarded ports
    SetPortList {
        which: PortListArg,
        ports: Vec<u16>,
    },
    Forward {
        name: String,
        host_port: u16,
        guest_port: u16,
        #[arg(long)]
        udp: bool,
    },
    Unforward {
        name: String,
    },
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Name defaults to a timestamp
    Take { name: Option<String> },
    Restore { name: String },
    Remove { name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SharedPathArg {
    Home,
    Workspace,
    Config,
    Ssh,
    Targets,
}

impl From<SharedPathArg> for SharedPath {
    fn from(arg: SharedPathArg) -> Self {
        match arg {
            SharedPathArg::Home => SharedPath::Home,
            SharedPathArg::Workspace => SharedPath::Workspace,
            SharedPathArg::Config => SharedPath::Config,
            SharedPathArg::Ssh => SharedPath::Ssh,
            SharedPathArg::Targets => SharedPath::Targets,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReservedPortArg {
    Ssh,
    Www,
    Dbus,
}

impl From<ReservedPortArg> for ReservedPort {
    fn from(arg: ReservedPortArg) -> Self {
        match arg {
            ReservedPortArg::Ssh => ReservedPort::Ssh,
            ReservedPortArg::Www => ReservedPort::Www,
            ReservedPortArg::Dbus => ReservedPort::DBus,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PortListArg {
    Qmllive,
    Free,
}

impl From<PortListArg> for ReservedPortList {
    fn from(arg: PortListArg) -> Self {
        match arg {
            PortListArg::Qmllive => ReservedPortList::QmlLive,
            PortListArg::Free => ReservedPortList::Free,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = VmlinkPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(&paths.logs, cli.verbose);
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());

    if let Command::Init = cli.command {
        if ensure_default_config(&config_path, &default_config_content())? {
            println!("wrote {}", config_path.display());
        } else {
            println!("{} already exists", config_path.display());
        }
        return Ok(());
    }

    let config = Config::load(&config_path)?;
    paths.ensure().context("failed to create application directories")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let result = runtime.block_on(run(cli, config, config_path, paths));

    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli, config: Config, config_path: PathBuf, paths: VmlinkPaths) -> Result<()> {
    let queue = CommandQueue::new();
    let vm = vm::create(&config.vm, Arc::clone(&queue), &paths.state);

    // Unattended default: go ahead with our own VM, leave others' alone.
    let policy = if cli.yes {
        AnswerPolicy::yes()
    } else if cli.no {
        AnswerPolicy::no()
    } else {
        AnswerPolicy::yes()
            .with(Question::CloseVm, false)
            .with(Question::ResetVm, false)
    };
    let ui = Arc::new(HeadlessUi::new(policy));

    let connection = VmConnection::new(
        Arc::clone(&vm),
        ui,
        Arc::new(OpenSshConnector::new()),
        config.ssh.clone(),
        config.connection_options(),
    );
    // Only poll while something is in progress.
    connection.set_application_active(false);
    connection.refresh().await?;
    debug!(vm = %vm.name(), backend = %vm.kind(), status = ?connection.status(), "initial probe done");

    let result = dispatch(cli.command, &connection, &config, config_path).await;

    // Let queued work (a shutdown command, a commit) finish.
    queue.wait().await;
    result
}

async fn dispatch(command: Command, connection: &VmConnection, config: &Config, config_path: PathBuf) -> Result<()> {
    let vm = Arc::clone(connection.virtual_machine());
    match command {
        Command::Init => bail!("init does not need the connection engine"),
        Command::Connect { hold } => {
            connection.connect_to(config.connect_options()).await?;
            println!("connected to {} ({})", vm.name(), config.ssh.target());
            if hold {
                hold_connection(connection, config_path).await?;
            }
        }
        Command::Disconnect => {
            connection.disconnect_from().await?;
            println!("{}: {}", vm.name(), connection.state());
        }
        Command::Status { json } => print_status(vm.name(), &connection.status(), json)?,
        Command::Info { storage, snapshots, json } => {
            let mut flags = FetchFlags::NONE;
            if storage {
                flags = flags | FetchFlags::STORAGE;
            }
            if snapshots {
                flags = flags | FetchFlags::SNAPSHOTS;
            }
            let info = vm.fetch_info(flags).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{info:#?}");
            }
        }
        Command::SetMemory { megabytes } => {
            locked(connection, async { vm.set_memory_size_mb(megabytes).await }).await?;
        }
        Command::SetCpus { count } => {
            locked(connection, async { vm.set_cpu_count(count).await }).await?;
        }
        Command::SetStorage { megabytes } => {
            locked(connection, async { vm.set_storage_size_mb(megabytes).await }).await?;
        }
        Command::SetVideoMode { mode } => {
            locked(connection, async { vm.set_video_mode(mode).await }).await?;
        }
        Command::Share { which, path } => {
            let which = SharedPath::from(which);
            locked(connection, async { vm.set_shared_path(which, &path).await }).await?;
        }
        Command::SetReservedPort { which, host_port } => {
            let which = ReservedPort::from(which);
            locked(connection, async { vm.set_reserved_port_forwarding(which, host_port).await }).await?;
        }
        Command::SetPortList { which, ports } => {
            let which = ReservedPortList::from(which);
            locked(connection, async { vm.set_reserved_port_list_forwarding(which, &ports).await }).await?;
        }
        Command::Forward {
            name,
            host_port,
            guest_port,
            udp,
        } => {
            let rule = PortForwardingRule {
                name,
                protocol: if udp { Protocol::Udp } else { Protocol::Tcp },
                host_port,
                guest_port,
            };
            locked(connection, async { vm.add_port_forwarding(&rule).await }).await?;
        }
        Command::Unforward { name } => {
            locked(connection, async { vm.remove_port_forwarding(&name).await }).await?;
        }
        Command::Snapshot(SnapshotCommand::Take { name }) => {
            let name = name.unwrap_or_else(|| chrono::Local::now().format("vmlink-%Y%m%d-%H%M%S").to_string());
            locked(connection, async { vm.take_snapshot(&name).await }).await?;
            println!("took snapshot {name}");
        }
        Command::Snapshot(SnapshotCommand::Restore { name }) => {
            locked(connection, async { vm.restore_snapshot(&name).await }).await?;
        }
        Command::Snapshot(SnapshotCommand::Remove { name }) => {
            locked(connection, async { vm.remove_snapshot(&name).await }).await?;
        }
    }
    Ok(())
}

/// Run `change` with the VM locked down, then release. The release happens
/// even when the change fails.
async fn locked<F>(connection: &VmConnection, change: F) -> Result<()>
where
    F: std::future::Future<Output = Result<(), vm::VmError>>,
{
    connection
        .lock_down(true)
        .await
        .context("could not power the virtual machine off")?;
    info!(vm = %connection.virtual_machine().name(), "locked down");

    let result = change.await;
    connection.lock_down(false).await?;
    result?;
    Ok(())
}

async fn hold_connection(connection: &VmConnection, config_path: PathBuf) -> Result<()> {
    let reload_target = connection.clone();
    let _watcher = ConfigFileWatcher::start(config_path, move |config| {
        reload_target.set_ssh_parameters(config.ssh);
    })
    .context("failed to watch the config file")?;

    let mut events = connection.subscribe();
    println!("holding connection, press Ctrl-C to disconnect");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => bail!("connection engine stopped"),
            },
        }
    }
    connection.disconnect_from().await?;
    Ok(())
}

#[derive(Serialize)]
struct StatusReport<'a> {
    vm: &'a str,
    checked_at: String,
    #[serde(flatten)]
    status: &'a ConnectionStatus,
}

fn print_status(vm: &str, status: &ConnectionStatus, json: bool) -> Result<()> {
    if json {
        let report = StatusReport {
            vm,
            checked_at: chrono::Utc::now().to_rfc3339(),
            status,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{vm}: {}", status.state);
    if !status.error_string.is_empty() {
        println!("  error: {}", status.error_string);
    }
    println!("  vm: {:?}, ssh: {:?}", status.vm_state, status.ssh_state);
    Ok(())
}
