use crate::docker::{CommandRunner, ContainerRecord, Dock};
use crate::error::AliDockError;
use crate::log::Log;
use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

pub const READY_ATTEMPTS: u32 = 50;
pub const READY_INTERVAL: Duration = Duration::from_millis(500);
const SSH_KEY: &str = ".alidock-ssh/alidock.pem";
const LEGACY_SSH_KEY: &str = ".ssh/id_rsa";

/// What to run once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Shell,
    Tmux { control: bool },
    Command(Vec<String>),
}

impl SessionMode {
    pub fn select(
        tmux: bool,
        tmux_control: bool,
        command: Vec<String>,
    ) -> Result<Self, AliDockError> {
        let inside_tmux = env::var_os("TMUX").is_some_and(|value| !value.is_empty());
        Self::select_with(tmux, tmux_control, command, inside_tmux)
    }

    fn select_with(
        tmux: bool,
        tmux_control: bool,
        command: Vec<String>,
        inside_tmux: bool,
    ) -> Result<Self, AliDockError> {
        if tmux && tmux_control {
            return Err(AliDockError::Config(
                "--tmux and --tmux-control cannot be used together".to_string(),
            ));
        }
        if (tmux || tmux_control) && !command.is_empty() {
            return Err(AliDockError::Config(
                "a tmux session cannot be combined with a command".to_string(),
            ));
        }
        if tmux || tmux_control {
            if inside_tmux {
                return Err(AliDockError::AlreadyMultiplexed);
            }
            return Ok(Self::Tmux {
                control: tmux_control,
            });
        }
        if command.is_empty() {
            Ok(Self::Shell)
        } else {
            Ok(Self::Command(command))
        }
    }
}

/// Private key used to log into the container. Older releases kept it under `.ssh`.
pub fn identity_file(dir_outside: &Path) -> PathBuf {
    let current = dir_outside.join(SSH_KEY);
    let legacy = dir_outside.join(LEGACY_SSH_KEY);
    if !current.is_file() && legacy.is_file() {
        legacy
    } else {
        current
    }
}

fn ssh_command(port: u16, identity: &Path, web: bool, control_path: Option<&Path>) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "ssh".to_string(),
        "localhost".to_string(),
        "-p".to_string(),
        port.to_string(),
        "-F/dev/null".to_string(),
        "-oForwardX11Trusted=no".to_string(),
        "-oUserKnownHostsFile=/dev/null".to_string(),
        "-oStrictHostKeyChecking=no".to_string(),
        "-oLogLevel=QUIET".to_string(),
        "-i".to_string(),
        identity.to_string_lossy().to_string(),
    ];
    if !web {
        argv.push("-Y".to_string());
    }
    if let Some(control_path) = control_path {
        argv.push("-oControlMaster=auto".to_string());
        argv.push(format!("-oControlPath={}", control_path.display()));
        argv.push("-oControlPersist=yes".to_string());
    }
    argv
}

/// Connects an interactive or one-shot session to the running container.
pub struct Session<'d, 'a, R: CommandRunner> {
    dock: &'d Dock<'a, R>,
    log: &'d Log,
}

impl<'d, 'a, R: CommandRunner> Session<'d, 'a, R> {
    pub fn new(dock: &'d Dock<'a, R>, log: &'d Log) -> Self {
        Self { dock, log }
    }

    fn running(&self) -> Result<ContainerRecord, AliDockError> {
        let cfg = self.dock.config();
        self.dock.is_running()?.ok_or_else(|| {
            AliDockError::AttachmentUnavailable(format!(
                "container {} is not running: start it with `alidock start`",
                cfg.dock_name
            ))
        })
    }

    /// ssh command line for the running container. X11 is forwarded unless the container
    /// publishes the web bridge, whatever the current invocation asked for.
    pub fn connection_command(&self) -> Result<Vec<String>, AliDockError> {
        let cfg = self.dock.config();
        let record = self.running()?;
        let web = record.web_port.is_some();
        let port = record.ssh_port.ok_or_else(|| {
            AliDockError::AttachmentUnavailable(format!(
                "cannot find the SSH port of container {}: check {}",
                cfg.dock_name,
                cfg.log_file().display()
            ))
        })?;
        // Connection sharing is not available with the Windows OpenSSH client.
        let control_path = if cfg!(windows) {
            None
        } else {
            Some(PathBuf::from(format!("/tmp/{}-ssh-%C", cfg.dock_name)))
        };
        Ok(ssh_command(
            port,
            &identity_file(&cfg.dir_outside),
            web,
            control_path.as_deref(),
        ))
    }

    /// Polls sshd in the container with a no-op command at a fixed interval.
    pub fn wait_ready(&self, max_attempts: u32, interval: Duration) -> Result<bool, AliDockError> {
        let mut argv = self.connection_command()?;
        argv.push("/bin/true".to_string());
        let (program, args) = argv.split_at(1);
        for attempt in 1..=max_attempts {
            let output = self
                .dock
                .runner()
                .run(&program[0], args, true)
                .map_err(|err| {
                    AliDockError::AttachmentUnavailable(format!("cannot run ssh: {err}"))
                })?;
            if output.success() {
                self.log.debug(format!("ssh ready after {attempt} attempt(s)"));
                return Ok(true);
            }
            if attempt < max_attempts {
                thread::sleep(interval);
            }
        }
        Ok(false)
    }

    pub fn attach_command(&self, mode: &SessionMode) -> Result<Vec<String>, AliDockError> {
        let cfg = self.dock.config();
        let mut argv = self.connection_command()?;
        match mode {
            SessionMode::Shell => {}
            SessionMode::Tmux { control } => {
                argv.push("-t".to_string());
                argv.push("tmux".to_string());
                argv.push("-u".to_string());
                if *control {
                    argv.push("-CC".to_string());
                }
                argv.extend(["new-session", "-A", "-s"].map(String::from));
                argv.push(cfg.base_name.clone());
            }
            SessionMode::Command(command) => {
                if io::stdin().is_terminal() {
                    argv.push("-t".to_string());
                }
                argv.extend(command.iter().cloned());
            }
        }
        Ok(argv)
    }

    pub fn attach(&self, mode: &SessionMode) -> Result<i32, AliDockError> {
        let argv = self.attach_command(mode)?;
        replace_process(&argv)
    }

    pub fn root_command(&self) -> Result<Vec<String>, AliDockError> {
        let record = self.running()?;
        let mut argv = vec!["docker".to_string(), "exec".to_string(), "-i".to_string()];
        if io::stdin().is_terminal() {
            argv.push("-t".to_string());
        }
        argv.extend(["-u", "root"].map(String::from));
        argv.push(record.name);
        argv.extend(["/bin/bash", "-l"].map(String::from));
        Ok(argv)
    }

    pub fn root_shell(&self) -> Result<i32, AliDockError> {
        let argv = self.root_command()?;
        replace_process(&argv)
    }
}

/// Hands the terminal over to `argv`. On unix the current process image is replaced and
/// this only returns on failure; elsewhere the child is awaited and its exit code returned.
pub fn replace_process(argv: &[String]) -> Result<i32, AliDockError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AliDockError::Config("empty command line".to_string()))?;
    let resolved = which::which(program).map_err(|err| {
        AliDockError::AttachmentUnavailable(format!("cannot find `{program}`: {err}"))
    })?;
    let mut cmd = Command::new(resolved);
    cmd.args(args);
    exec_or_wait(cmd)
}

#[cfg(unix)]
fn exec_or_wait(mut cmd: Command) -> Result<i32, AliDockError> {
    use std::os::unix::process::CommandExt;
    Err(cmd.exec().into())
}

#[cfg(not(unix))]
fn exec_or_wait(mut cmd: Command) -> Result<i32, AliDockError> {
    let status = cmd.status()?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::docker::tests::{test_config, test_user, MockRunner, INSPECT_JSON};
    use std::fs;
    use tempfile::tempdir;

    const NO_PORTS_JSON: &str = r#"[{"Name": "/alidock-1000", "NetworkSettings": {"Ports": {}}}]"#;
    const WEB_INSPECT_JSON: &str = r#"[{
        "Name": "/alidock-1000",
        "NetworkSettings": {"Ports": {
            "22/tcp": [{"HostPort": "32774"}],
            "14500/tcp": [{"HostPort": "32775"}]
        }}
    }]"#;

    #[test]
    fn conflicting_tmux_flavours_are_rejected() {
        let err = SessionMode::select_with(true, true, Vec::new(), false)
            .expect_err("both flavours should fail");
        assert!(matches!(err, AliDockError::Config(_)));
    }

    #[test]
    fn tmux_inside_tmux_is_refused() {
        let err = SessionMode::select_with(true, false, Vec::new(), true)
            .expect_err("nesting should fail");
        assert!(matches!(err, AliDockError::AlreadyMultiplexed));
        assert_eq!(
            SessionMode::select_with(false, false, Vec::new(), true).unwrap(),
            SessionMode::Shell
        );
    }

    #[test]
    fn mode_selection() {
        assert_eq!(
            SessionMode::select_with(false, true, Vec::new(), false).unwrap(),
            SessionMode::Tmux { control: true }
        );
        assert_eq!(
            SessionMode::select_with(false, false, vec!["make".to_string()], false).unwrap(),
            SessionMode::Command(vec!["make".to_string()])
        );
        assert!(SessionMode::select_with(true, false, vec!["ls".to_string()], false).is_err());
    }

    #[test]
    fn absent_container_has_no_connection() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(1, "[]", "Error: No such container: alidock-1000");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let err = Session::new(&dock, &log)
            .connection_command()
            .expect_err("absent container");
        assert!(matches!(err, AliDockError::AttachmentUnavailable(_)));
    }

    #[test]
    fn missing_port_points_at_log() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, NO_PORTS_JSON, "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let err = Session::new(&dock, &log)
            .connection_command()
            .expect_err("no port");
        assert!(err.to_string().contains("log.txt"));
    }

    #[test]
    fn connection_command_uses_published_port() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, INSPECT_JSON, "");
        runner.push_output(0, INSPECT_JSON, "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let session = Session::new(&dock, &log);

        let argv = session.connection_command().unwrap();
        assert_eq!(argv[..4], ["ssh", "localhost", "-p", "32774"]);
        assert!(argv.contains(&"-Y".to_string()));
        let key = cfg.dir_outside.join(".alidock-ssh/alidock.pem");
        assert!(argv.contains(&key.to_string_lossy().to_string()));

        // Asking for the bridge now does not matter: the container was created without it.
        let web_cfg = test_config(
            dir.path(),
            Overrides {
                web: Some(true),
                ..Overrides::default()
            },
        );
        let web_dock = Dock::new(&web_cfg, &log, &runner, test_user());
        let argv = Session::new(&web_dock, &log).connection_command().unwrap();
        assert!(argv.contains(&"-Y".to_string()));
    }

    #[test]
    fn container_with_web_bridge_skips_x11_forwarding() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, WEB_INSPECT_JSON, "");
        runner.push_output(0, WEB_INSPECT_JSON, "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let argv = Session::new(&dock, &log)
            .attach_command(&SessionMode::Shell)
            .unwrap();
        assert!(!argv.contains(&"-Y".to_string()));
    }

    #[test]
    fn multiplexing_is_optional() {
        let key = Path::new("/home/u/alidock/.alidock-ssh/alidock.pem");
        let plain = ssh_command(2222, key, true, None);
        assert!(!plain.iter().any(|arg| arg.starts_with("-oControl")));
        let shared = ssh_command(2222, key, true, Some(Path::new("/tmp/a-ssh-%C")));
        assert!(shared.contains(&"-oControlPath=/tmp/a-ssh-%C".to_string()));
        assert!(shared.contains(&"-oControlMaster=auto".to_string()));
    }

    #[test]
    fn legacy_key_is_used_when_current_is_missing() {
        let dir = tempdir().unwrap();
        assert_eq!(identity_file(dir.path()), dir.path().join(SSH_KEY));

        fs::create_dir_all(dir.path().join(".ssh")).unwrap();
        fs::write(dir.path().join(LEGACY_SSH_KEY), "legacy").unwrap();
        assert_eq!(identity_file(dir.path()), dir.path().join(LEGACY_SSH_KEY));

        fs::create_dir_all(dir.path().join(".alidock-ssh")).unwrap();
        fs::write(dir.path().join(SSH_KEY), "current").unwrap();
        assert_eq!(identity_file(dir.path()), dir.path().join(SSH_KEY));
    }

    #[test]
    fn wait_ready_returns_on_first_success() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, INSPECT_JSON, "");
        runner.push_output(255, "", "");
        runner.push_output(255, "", "");
        runner.push_output(0, "", "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let ready = Session::new(&dock, &log)
            .wait_ready(READY_ATTEMPTS, Duration::ZERO)
            .unwrap();
        assert!(ready);

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].program, "ssh");
        assert_eq!(calls[1].args.last().map(String::as_str), Some("/bin/true"));
    }

    #[test]
    fn wait_ready_gives_up_after_budget() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, INSPECT_JSON, "");
        for _ in 0..3 {
            runner.push_output(255, "", "");
        }
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let ready = Session::new(&dock, &log)
            .wait_ready(3, Duration::ZERO)
            .unwrap();
        assert!(!ready);
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn tmux_session_is_appended() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(0, INSPECT_JSON, "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let argv = Session::new(&dock, &log)
            .attach_command(&SessionMode::Tmux { control: true })
            .unwrap();
        let tail = argv[argv.len() - 8..].join(" ");
        assert_eq!(tail, "-t tmux -u -CC new-session -A -s alidock");
    }

    #[test]
    fn root_shell_needs_running_container() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Overrides::default());
        let log = Log::silent();
        let runner = MockRunner::default();
        runner.push_output(1, "[]", "Error: No such container: alidock-1000");
        runner.push_output(0, INSPECT_JSON, "");
        let dock = Dock::new(&cfg, &log, &runner, test_user());
        let session = Session::new(&dock, &log);
        assert!(matches!(
            session.root_command(),
            Err(AliDockError::AttachmentUnavailable(_))
        ));
        let argv = session.root_command().unwrap();
        assert_eq!(argv[0], "docker");
        assert!(argv.ends_with(&[
            "-u".to_string(),
            "root".to_string(),
            "alidock-1000".to_string(),
            "/bin/bash".to_string(),
            "-l".to_string()
        ]));
    }
}
