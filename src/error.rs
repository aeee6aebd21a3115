use std::fmt::Display;
use std::io;
use thiserror::Error;

pub const EXIT_DOMAIN_ERROR: u8 = 10;
pub const EXIT_RUNTIME_API_ERROR: u8 = 11;
pub const EXIT_RUNTIME_UNREACHABLE: u8 = 12;

#[derive(Debug, Error)]
pub enum AliDockError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid mount specification: {0}")]
    InvalidMountSpec(String),
    #[error("missing runtime capability: {0}")]
    RuntimeCapabilityMissing(String),
    #[error("{0}")]
    AttachmentUnavailable(String),
    #[error("already inside a tmux session: refusing to nest another one")]
    AlreadyMultiplexed,
    #[error("update check failed: {0}")]
    Probe(String),
    #[error("container runtime error: {0}")]
    RuntimeApi(String),
    #[error("cannot reach the container runtime: {0}")]
    RuntimeUnreachable(String),
    #[error("host initialization failed: {0}")]
    HostInit(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AliDockError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::RuntimeApi(_) => EXIT_RUNTIME_API_ERROR,
            Self::RuntimeUnreachable(_) => EXIT_RUNTIME_UNREACHABLE,
            _ => EXIT_DOMAIN_ERROR,
        }
    }
}

pub fn probe_error(err: impl Display) -> AliDockError {
    AliDockError::Probe(err.to_string())
}

/// Returns whether the stderr of a failed runtime command means the daemon could not be
/// reached, together with a hint for the user.
pub fn classify_runtime_failure(stderr: &str) -> (bool, Option<&'static str>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            true,
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry."),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            false,
            Some("A required host port is already in use. Free the conflicting port and retry."),
        );
    }

    if lower.contains("permission denied") && lower.contains("docker.sock") {
        return (
            true,
            Some("Your user cannot access the Docker socket. Add it to the `docker` group."),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") {
        return (
            false,
            Some("Authenticate with `docker login` if the image is private."),
        );
    }

    (false, None)
}

pub fn runtime_failure(command: &str, status_code: i32, stderr: &str) -> AliDockError {
    let (unreachable, hint) = classify_runtime_failure(stderr);
    let mut message = format!("command failed with status {status_code} while running `{command}`");
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(hint) = hint {
        message = format!("{message}\nHint: {hint}");
    }
    if unreachable {
        AliDockError::RuntimeUnreachable(message)
    } else {
        AliDockError::RuntimeApi(message)
    }
}

pub fn runtime_spawn_failure(command: &str, err: &io::Error) -> AliDockError {
    if err.kind() == io::ErrorKind::NotFound {
        return AliDockError::RuntimeUnreachable(format!(
            "failed to run `{command}`: {err}\nHint: Install Docker and ensure `docker` is on your PATH."
        ));
    }
    AliDockError::RuntimeApi(format!("failed to run `{command}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_family() {
        assert_eq!(AliDockError::RuntimeApi("x".into()).exit_code(), 11);
        assert_eq!(AliDockError::RuntimeUnreachable("x".into()).exit_code(), 12);
        assert_eq!(AliDockError::AlreadyMultiplexed.exit_code(), 10);
        assert_eq!(AliDockError::InvalidMountSpec("x".into()).exit_code(), 10);
        assert_eq!(AliDockError::HostInit("x".into()).exit_code(), 10);
    }

    #[test]
    fn daemon_down_is_unreachable() {
        let err = runtime_failure(
            "docker container inspect alidock-1000",
            1,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert!(matches!(err, AliDockError::RuntimeUnreachable(_)));
        assert!(err.to_string().contains("Hint:"));
    }

    #[test]
    fn port_conflict_is_api_error_with_hint() {
        let err = runtime_failure("docker run", 125, "Bind for 0.0.0.0:22 failed: port is already allocated");
        match err {
            AliDockError::RuntimeApi(message) => assert!(message.contains("host port")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_unreachable() {
        let err = runtime_spawn_failure("docker pull x", &io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.exit_code(), EXIT_RUNTIME_UNREACHABLE);
    }
}
