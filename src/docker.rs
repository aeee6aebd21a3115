use crate::config::{Config, DIR_INSIDE};
use crate::error::{runtime_failure, runtime_spawn_failure, AliDockError};
use crate::host::{lookup_group_gid, HostUser};
use crate::log::Log;
use crate::mounts::{MountMode, MountSpec};
use gtmpl_value::Value;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const SSH_PORT: &str = "22/tcp";
pub const WEB_PORT: &str = "14500/tcp";
const SHM_SIZE: &str = "1g";
const AUX_VOLUME_TARGET: &str = "/home/alidock/.sw";
const CVMFS_PATH: &str = "/cvmfs";
const ROCM_DEVICES: &[&str] = &["/dev/kfd", "/dev/dri"];
const ROCM_GROUP: &str = "video";
const INIT_TEMPLATE: &str = include_str!("../templates/init.sh.tmpl");
const HOST_INIT_TEMPLATE: &str = include_str!("../templates/init-host.sh.tmpl");

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs external programs (`docker`, `ssh`, `bash`) on behalf of the launcher.
pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if capture_output {
            let output = cmd.stdin(Stdio::null()).output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
}

/// What the runtime tells us about the container; never cached across invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub ssh_port: Option<u16>,
    pub web_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

fn published_port(ports: &HashMap<String, Option<Vec<PortBinding>>>, key: &str) -> Option<u16> {
    ports
        .get(key)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.parse().ok())
}

pub fn parse_inspect_output(stdout: &[u8]) -> Result<Option<ContainerRecord>, AliDockError> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(stdout)?;
    Ok(entries.into_iter().next().map(|entry| ContainerRecord {
        name: entry.name.trim_start_matches('/').to_string(),
        image: entry.config.image,
        image_id: entry.image,
        ssh_port: published_port(&entry.network_settings.ports, SSH_PORT),
        web_port: published_port(&entry.network_settings.ports, WEB_PORT),
    }))
}

/// Quotes a `--mount` field when it contains CSV metacharacters.
fn mount_field(key: &str, value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{key}={}\"", value.replace('"', "\"\""))
    } else {
        format!("{key}={value}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    Bind {
        source: PathBuf,
        target: String,
        read_only: bool,
        propagation: Option<&'static str>,
    },
    Volume {
        name: String,
        target: String,
    },
}

impl MountEntry {
    fn target(&self) -> &str {
        match self {
            Self::Bind { target, .. } | Self::Volume { target, .. } => target,
        }
    }

    pub fn to_arg(&self) -> String {
        match self {
            Self::Bind {
                source,
                target,
                read_only,
                propagation,
            } => {
                let mut fields = vec![
                    "type=bind".to_string(),
                    mount_field("source", &source.to_string_lossy()),
                    mount_field("target", target),
                ];
                if *read_only {
                    fields.push("readonly".to_string());
                }
                if let Some(propagation) = propagation {
                    fields.push(format!("bind-propagation={propagation}"));
                }
                fields.join(",")
            }
            Self::Volume { name, target } => {
                format!(
                    "type=volume,{},{}",
                    mount_field("source", name),
                    mount_field("target", target)
                )
            }
        }
    }
}

/// Lifecycle of the single per-user container.
pub struct Dock<'a, R: CommandRunner> {
    config: &'a Config,
    log: &'a Log,
    runner: &'a R,
    user: HostUser,
    group_file: PathBuf,
    dev_root: PathBuf,
}

impl<'a, R: CommandRunner> Dock<'a, R> {
    pub fn new(config: &'a Config, log: &'a Log, runner: &'a R, user: HostUser) -> Self {
        Self {
            config,
            log,
            runner,
            user,
            group_file: PathBuf::from("/etc/group"),
            dev_root: PathBuf::from("/"),
        }
    }

    /// Points host device and group lookups at another root.
    #[cfg(test)]
    pub fn with_host_root(mut self, root: &Path) -> Self {
        self.group_file = root.join("etc").join("group");
        self.dev_root = root.to_path_buf();
        self
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn runner(&self) -> &R {
        self.runner
    }

    fn docker(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, AliDockError> {
        let command = render_command("docker", args);
        self.log.debug(format!("running {command}"));
        self.runner
            .run("docker", args, capture_output)
            .map_err(|err| runtime_spawn_failure(&command, &err))
    }

    fn docker_checked(
        &self,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, AliDockError> {
        let output = self.docker(args, capture_output)?;
        if !output.success() {
            return Err(runtime_failure(
                &render_command("docker", args),
                output.status_code,
                &output.stderr_text(),
            ));
        }
        Ok(output)
    }

    pub fn is_running(&self) -> Result<Option<ContainerRecord>, AliDockError> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            self.config.dock_name.clone(),
        ];
        let output = self.docker(&args, true)?;
        if !output.success() {
            let stderr = output.stderr_text();
            if is_missing_object(&stderr) {
                return Ok(None);
            }
            return Err(runtime_failure(
                &render_command("docker", &args),
                output.status_code,
                &stderr,
            ));
        }
        parse_inspect_output(&output.stdout)
    }

    /// Removes the container; an absent container is not an error.
    pub fn stop(&self) -> Result<(), AliDockError> {
        let args = vec![
            "rm".to_string(),
            "--force".to_string(),
            self.config.dock_name.clone(),
        ];
        let output = self.docker(&args, true)?;
        if output.success() || is_missing_object(&output.stderr_text()) {
            return Ok(());
        }
        Err(runtime_failure(
            &render_command("docker", &args),
            output.status_code,
            &output.stderr_text(),
        ))
    }

    pub fn pull(&self, image: &str) -> Result<(), AliDockError> {
        let args = vec!["pull".to_string(), image.to_string()];
        self.docker_checked(&args, false).map(|_| ())
    }

    /// Repo digests of the local copy of `image`, or `None` when it was never pulled.
    pub fn local_repo_digests(&self, image: &str) -> Result<Option<Vec<String>>, AliDockError> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .RepoDigests}}".to_string(),
            image.to_string(),
        ];
        let output = self.docker(&args, true)?;
        if !output.success() {
            let stderr = output.stderr_text();
            if is_missing_object(&stderr) {
                return Ok(None);
            }
            return Err(runtime_failure(
                &render_command("docker", &args),
                output.status_code,
                &stderr,
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let digests: Option<Vec<String>> = serde_json::from_str(text.trim())?;
        Ok(Some(digests.unwrap_or_default()))
    }

    pub fn runtimes(&self) -> Result<Vec<String>, AliDockError> {
        let args = vec![
            "info".to_string(),
            "--format".to_string(),
            "{{json .Runtimes}}".to_string(),
        ];
        let output = self.docker_checked(&args, true)?;
        let text = String::from_utf8_lossy(&output.stdout);
        let runtimes: BTreeMap<String, serde_json::Value> = serde_json::from_str(text.trim())?;
        Ok(runtimes.into_keys().collect())
    }

    fn template_context(&self) -> gtmpl_value::Value {
        let cfg = self.config;
        let text = |value: String| Value::String(value);
        let mut ctx = HashMap::new();
        ctx.insert("shared_dir".to_string(), text(DIR_INSIDE.to_string()));
        ctx.insert("run_dir".to_string(), text(cfg.run_dir_inside()));
        ctx.insert(
            "host_shared_dir".to_string(),
            text(cfg.dir_outside.to_string_lossy().to_string()),
        );
        ctx.insert("user_name".to_string(), text(self.user.name.clone()));
        ctx.insert("user_id".to_string(), text(self.user.uid.to_string()));
        ctx.insert("group_id".to_string(), text(self.user.gid.to_string()));
        ctx.insert("dock_name".to_string(), text(cfg.dock_name.clone()));
        ctx.insert("web".to_string(), Value::Bool(cfg.web));
        ctx.insert("cvmfs".to_string(), Value::Bool(cfg.cvmfs));
        ctx.insert("nvidia".to_string(), Value::Bool(cfg.nvidia));
        Value::Map(ctx)
    }

    fn render_script(&self, template: &str, path: &Path) -> Result<(), AliDockError> {
        let rendered = gtmpl::template(template, self.template_context())
            .map_err(|err| AliDockError::Template(err.to_string()))?;
        fs::write(path, rendered)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn run_host_init(&self, script: &Path) -> Result<(), AliDockError> {
        let args = vec![script.to_string_lossy().to_string()];
        let output = self
            .runner
            .run("bash", &args, true)
            .map_err(|err| {
                AliDockError::HostInit(format!("cannot run {}: {err}", script.display()))
            })?;
        if !output.success() {
            let stderr = output.stderr_text();
            return Err(AliDockError::HostInit(if stderr.is_empty() {
                format!("{} exited with status {}", script.display(), output.status_code)
            } else {
                stderr
            }));
        }
        Ok(())
    }

    pub fn mount_entries(&self, user_mounts: &[MountSpec]) -> Vec<MountEntry> {
        let cfg = self.config;
        let mut entries = vec![MountEntry::Bind {
            source: cfg.dir_outside.clone(),
            target: DIR_INSIDE.to_string(),
            read_only: false,
            propagation: None,
        }];
        if env::consts::OS != "linux" {
            entries.push(MountEntry::Volume {
                name: format!("{}-sw", cfg.dock_name),
                target: AUX_VOLUME_TARGET.to_string(),
            });
        }
        if cfg.cvmfs {
            entries.push(MountEntry::Bind {
                source: PathBuf::from(CVMFS_PATH),
                target: CVMFS_PATH.to_string(),
                read_only: true,
                propagation: Some("rslave"),
            });
        }
        for spec in user_mounts {
            let entry = MountEntry::Bind {
                source: spec.source.clone(),
                target: spec.target(),
                read_only: spec.mode == MountMode::ReadOnly,
                propagation: None,
            };
            entries.retain(|existing| existing.target() != entry.target());
            entries.push(entry);
        }
        entries
    }

    fn accelerator_args(&self) -> Result<Vec<String>, AliDockError> {
        let mut args = Vec::new();
        if self.config.nvidia {
            let runtimes = self.runtimes()?;
            if !runtimes.iter().any(|name| name == "nvidia") {
                return Err(AliDockError::RuntimeCapabilityMissing(format!(
                    "the nvidia runtime is not available (found: {}); install the NVIDIA container toolkit",
                    runtimes.join(", ")
                )));
            }
            args.extend([
                "--runtime".to_string(),
                "nvidia".to_string(),
                "--env".to_string(),
                "NVIDIA_VISIBLE_DEVICES=all".to_string(),
            ]);
        }
        if self.config.rocm {
            for device in ROCM_DEVICES {
                let host_path = self.dev_root.join(device.trim_start_matches('/'));
                if !host_path.exists() {
                    return Err(AliDockError::RuntimeCapabilityMissing(format!(
                        "ROCm devices requested but {device} does not exist on this host"
                    )));
                }
                args.push("--device".to_string());
                args.push(device.to_string());
            }
            let gid = lookup_group_gid(&self.group_file, ROCM_GROUP).ok_or_else(|| {
                AliDockError::RuntimeCapabilityMissing(format!(
                    "ROCm devices requested but group '{ROCM_GROUP}' does not exist on this host"
                ))
            })?;
            args.push("--group-add".to_string());
            args.push(gid.to_string());
        }
        Ok(args)
    }

    /// Builds the `docker run` arguments after all host-side checks have passed.
    pub fn run_args(&self, user_mounts: &[MountSpec]) -> Result<Vec<String>, AliDockError> {
        let cfg = self.config;
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            cfg.dock_name.clone(),
            "--hostname".to_string(),
            cfg.base_name.clone(),
            "--cap-add".to_string(),
            "SYS_PTRACE".to_string(),
            "--shm-size".to_string(),
            SHM_SIZE.to_string(),
            "--env".to_string(),
            format!("ALIDOCK_USER={}", self.user.name),
            "--env".to_string(),
            format!("ALIDOCK_UID={}", self.user.uid),
            "--env".to_string(),
            format!("ALIDOCK_WEB={}", if cfg.web { "1" } else { "0" }),
        ];
        for entry in self.mount_entries(user_mounts) {
            args.push("--mount".to_string());
            args.push(entry.to_arg());
        }
        args.extend(self.accelerator_args()?);
        args.push("--publish".to_string());
        args.push(SSH_PORT.to_string());
        if cfg.web {
            args.push("--publish".to_string());
            args.push(WEB_PORT.to_string());
        }
        args.push(cfg.image_name.clone());
        args.push(format!("{}/init.sh", cfg.run_dir_inside()));
        Ok(args)
    }

    /// Creates and starts the container. Only valid when no container with our name exists.
    pub fn run(&self, user_mounts: &[MountSpec]) -> Result<(), AliDockError> {
        if let Some(existing) = self.is_running()? {
            return Err(AliDockError::Config(format!(
                "container {} is already running",
                existing.name
            )));
        }
        let cfg = self.config;
        let run_dir = cfg.run_dir();
        fs::create_dir_all(&run_dir)?;

        self.render_script(INIT_TEMPLATE, &run_dir.join("init.sh"))?;
        if cfg!(unix) {
            let host_init = run_dir.join("init-host.sh");
            self.render_script(HOST_INIT_TEMPLATE, &host_init)?;
            self.run_host_init(&host_init)?;
        }

        let args = self.run_args(user_mounts)?;
        let result = self.docker_checked(&args, true);
        if let Err(err) = result {
            // The name must stay free for the next attempt.
            if let Err(cleanup) = self.stop() {
                self.log.debug(format!(
                    "cannot remove {} after the failed start: {cleanup}",
                    cfg.dock_name
                ));
            }
            return Err(err);
        }
        Ok(())
    }
}
