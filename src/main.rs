mod config;
mod docker;
mod error;
mod host;
mod log;
mod mounts;
mod session;
mod update;

use crate::config::{
    load_file_overrides, resolve_config_path, Config, Overrides, Settings, CONFIG_FILE_NAME,
    DEFAULT_CONFIG_YAML,
};
use crate::docker::{CommandRunner, Dock, RealCommandRunner};
use crate::error::AliDockError;
use crate::host::HostUser;
use crate::log::Log;
use crate::mounts::resolve_mounts;
use crate::session::{Session, SessionMode, READY_ATTEMPTS, READY_INTERVAL};
use crate::update::{image_update_due, warn_if_alidock_outdated};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "alidock",
    version,
    about = "Run your development environment from a container easily",
    after_help = config_help()
)]
struct Cli {
    /// Configuration file [env: ALIDOCK_CONFIG] [default: ~/.alidock-config.yaml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Only print errors
    #[arg(long, global = true, conflicts_with = "debug")]
    quiet: bool,
    /// Print debug messages
    #[arg(long, global = true)]
    debug: bool,
    #[command(flatten)]
    start: StartArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Only honoured when the container gets created.
#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Base name of the container, the user id is appended
    #[arg(long, global = true)]
    dock_name: Option<String>,
    /// Image to create the container from
    #[arg(long, global = true)]
    image_name: Option<String>,
    /// Host directory shared with the container as its home
    #[arg(long, global = true)]
    dir_outside: Option<String>,
    /// Seconds between two update checks
    #[arg(long, global = true)]
    update_period: Option<String>,
    /// Never check for image updates
    #[arg(long, global = true)]
    no_update_image: bool,
    /// Never check for alidock updates
    #[arg(long, global = true)]
    no_update_alidock: bool,
    /// Expose NVIDIA GPUs to the container
    #[arg(long, global = true)]
    nvidia: bool,
    /// Expose AMD ROCm devices to the container
    #[arg(long, global = true)]
    rocm: bool,
    /// Share the host /cvmfs with the container
    #[arg(long, global = true)]
    cvmfs: bool,
    /// Publish a browser-based X11 bridge instead of forwarding X11 over ssh
    #[arg(long, global = true)]
    web: bool,
    /// Extra host directory, as <source>[:<label>[:rw|ro]], mounted under /mnt/<label>
    #[arg(long, global = true, value_name = "SPEC")]
    mount: Vec<String>,
}

impl StartArgs {
    fn overrides(&self) -> Result<Overrides, AliDockError> {
        let update_period = self
            .update_period
            .as_deref()
            .map(|raw| {
                raw.trim().parse::<u64>().map_err(|_| {
                    AliDockError::Config(format!(
                        "invalid --update-period '{raw}': expected a number of seconds"
                    ))
                })
            })
            .transpose()?;
        Ok(Overrides {
            dock_name: self.dock_name.clone(),
            image_name: self.image_name.clone(),
            dir_outside: self.dir_outside.clone(),
            update_period,
            dont_update_image: self.no_update_image.then_some(true),
            dont_update_alidock: self.no_update_alidock.then_some(true),
            nvidia: self.nvidia.then_some(true),
            rocm: self.rocm.then_some(true),
            cvmfs: self.cvmfs.then_some(true),
            web: self.web.then_some(true),
            mount: (!self.mount.is_empty()).then(|| self.mount.clone()),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the container if needed and open a shell into it (default)
    Enter {
        /// Attach to a tmux session inside the container
        #[arg(long)]
        tmux: bool,
        /// Attach to tmux in control mode, for iTerm2 integration
        #[arg(long)]
        tmux_control: bool,
    },
    /// Open a root shell into the running container
    Root,
    /// Start the container if needed and run a command in it
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Start the container without entering it
    Start,
    /// Exit with 0 when the container is running, 1 otherwise
    Status,
    /// Destroy the container
    Stop,
}

fn config_help() -> String {
    format!("Configuration file ~/{CONFIG_FILE_NAME}, shown with its defaults:\n\n{DEFAULT_CONFIG_YAML}")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = Log::new(cli.quiet, cli.debug);
    match run(cli, &log) {
        Ok(code) => code,
        Err(err) => {
            log.error(err.to_string());
            ExitCode::from(err.exit_code())
        }
    }
}

/// Whether the command line asks for anything that only applies when the container is created.
fn sets_start_options(cli_overrides: &Overrides) -> bool {
    let creation_only = Overrides {
        update_period: None,
        dont_update_image: None,
        dont_update_alidock: None,
        ..cli_overrides.clone()
    };
    creation_only != Overrides::default()
}

fn run(cli: Cli, log: &Log) -> Result<ExitCode, AliDockError> {
    let command = cli.command.unwrap_or(Commands::Enter {
        tmux: false,
        tmux_control: false,
    });
    let mode = match &command {
        Commands::Enter { tmux, tmux_control } => {
            Some(SessionMode::select(*tmux, *tmux_control, Vec::new())?)
        }
        Commands::Exec { command } => Some(SessionMode::select(false, false, command.clone())?),
        _ => None,
    };

    let cli_overrides = cli.start.overrides()?;
    let start_options_given = sets_start_options(&cli_overrides);
    let config_path = resolve_config_path(cli.config.as_ref());
    let file_overrides = load_file_overrides(&config_path, log);
    let user = HostUser::current();
    let cfg = Config::resolve(Settings::default(), file_overrides, cli_overrides, user.uid)?;
    log.debug(format!(
        "container {} from {}, sharing {}",
        cfg.dock_name,
        cfg.image_name,
        cfg.dir_outside.display()
    ));

    let runner = RealCommandRunner;
    let dock = Dock::new(&cfg, log, &runner, user);

    match command {
        Commands::Status => {
            if let Some(record) = dock.is_running()? {
                log.info(format!(
                    "container {} is running from {}",
                    record.name, record.image
                ));
                log.debug(format!("image id {}", record.image_id));
                Ok(ExitCode::SUCCESS)
            } else {
                log.info(format!("container {} is not running", cfg.dock_name));
                Ok(ExitCode::from(1))
            }
        }
        Commands::Stop => {
            log.info(format!("destroying container {}", cfg.dock_name));
            dock.stop()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Root => {
            let code = Session::new(&dock, log).root_shell()?;
            Ok(exit_code_from(code))
        }
        Commands::Start => {
            ensure_started(&dock, log, start_options_given)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enter { .. } | Commands::Exec { .. } => {
            let Some(mode) = mode else {
                return Err(AliDockError::Config("no session mode selected".to_string()));
            };
            ensure_started(&dock, log, start_options_given)?;
            let session = Session::new(&dock, log);
            if !session.wait_ready(READY_ATTEMPTS, READY_INTERVAL)? {
                log.warning(format!(
                    "container is not answering yet, check {}",
                    cfg.log_file().display()
                ));
            }
            if let SessionMode::Shell | SessionMode::Tmux { .. } = mode {
                log.info("starting a shell into the container");
            }
            let code = session.attach(&mode)?;
            Ok(exit_code_from(code))
        }
    }
}

/// Creates the container when absent, pulling a newer image first if one is due.
fn ensure_started<R: CommandRunner>(
    dock: &Dock<'_, R>,
    log: &Log,
    start_options_given: bool,
) -> Result<(), AliDockError> {
    let cfg = dock.config();
    warn_if_alidock_outdated(cfg, log);
    if let Some(record) = dock.is_running()? {
        if start_options_given {
            log.warning(format!(
                "container {} is already running: start options are ignored, stop it first to apply them",
                record.name
            ));
        }
        report_web_port(log, record.web_port);
        return Ok(());
    }

    let mounts = resolve_mounts(&cfg.mount)?;
    if image_update_due(dock, log) {
        log.info(format!("pulling updated image {}", cfg.image_name));
        if let Err(err) = dock.pull(&cfg.image_name) {
            log.warning(format!("cannot update {}: {err}", cfg.image_name));
        }
    }
    log.info(format!("creating container {}, hold on", cfg.dock_name));
    dock.run(&mounts)?;
    if let Some(record) = dock.is_running()? {
        report_web_port(log, record.web_port);
    }
    Ok(())
}

fn report_web_port(log: &Log, web_port: Option<u16>) {
    if let Some(port) = web_port {
        log.info(format!("desktop available at http://localhost:{port}/vnc.html"));
    }
}

fn exit_code_from(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
