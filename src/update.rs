//! Throttled update checks for the launcher itself and for the container image.
//!
//! Each kind of check keeps the UNIX time of its last successful probe in a file under the
//! state directory. A probe runs only when that time is at least one period old. A failed
//! probe leaves the file alone, so the next invocation probes again. With nag semantics a
//! positive result is not recorded either, and the update keeps being reported until it is
//! resolved.

use crate::config::Config;
use crate::docker::{CommandRunner, Dock};
use crate::error::{probe_error, AliDockError};
use crate::log::Log;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RELEASE_GRACE_MINUTES: i64 = 15;
const DEFAULT_RELEASE_API_URL: &str = "https://api.github.com/repos/alidock/alidock/releases/latest";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const MANIFEST_MEDIA_TYPES: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    AliDock,
    Image,
}

impl CheckKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::AliDock => "alidock-update-check",
            Self::Image => "image-update-check",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateChecker {
    state_dir: PathBuf,
}

impl UpdateChecker {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    pub fn state_file(&self, kind: CheckKind) -> PathBuf {
        self.state_dir.join(kind.file_name())
    }

    /// Time of the last recorded check, or 0 when there is none.
    pub fn last_checked(&self, kind: CheckKind) -> i64 {
        fs::read_to_string(self.state_file(kind))
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn check_throttled<F>(
        &self,
        kind: CheckKind,
        period: u64,
        nag_on_positive: bool,
        probe: F,
    ) -> Result<bool, AliDockError>
    where
        F: FnOnce() -> Result<bool, AliDockError>,
    {
        self.check_throttled_at(Utc::now().timestamp(), kind, period, nag_on_positive, probe)
    }

    pub fn check_throttled_at<F>(
        &self,
        now: i64,
        kind: CheckKind,
        period: u64,
        nag_on_positive: bool,
        probe: F,
    ) -> Result<bool, AliDockError>
    where
        F: FnOnce() -> Result<bool, AliDockError>,
    {
        let last = self.last_checked(kind);
        let period = i64::try_from(period).unwrap_or(i64::MAX);
        if last <= now && now - last < period {
            return Ok(false);
        }
        let available = probe()?;
        if !(available && nag_on_positive) {
            write_timestamp(&self.state_file(kind), now)?;
        }
        Ok(available)
    }
}

fn write_timestamp(path: &Path, timestamp: i64) -> Result<(), AliDockError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "update-check".to_string());
    let tmp_path = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    fs::write(&tmp_path, format!("{timestamp}\n"))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn http_client() -> Result<Client, AliDockError> {
    Client::builder()
        .timeout(PROBE_TIMEOUT)
        .user_agent(concat!("alidock/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(probe_error)
}

/// Release tag baked in by the release pipeline; development builds have none.
pub fn current_release() -> Option<&'static str> {
    option_env!("ALIDOCK_RELEASE_TAG").filter(|tag| !tag.trim().is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

fn release_api_url() -> String {
    env::var("ALIDOCK_RELEASE_API_URL").unwrap_or_else(|_| DEFAULT_RELEASE_API_URL.to_string())
}

pub fn fetch_latest_release() -> Result<ReleaseInfo, AliDockError> {
    let client = http_client()?;
    let response = client
        .get(release_api_url())
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .map_err(probe_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(AliDockError::Probe(format!(
            "cannot resolve latest release: HTTP {status}"
        )));
    }
    response.json().map_err(probe_error)
}

fn parse_version_key(version_tag: &str) -> Option<Vec<u64>> {
    let mut values = Vec::new();
    for part in version_tag.trim().trim_start_matches('v').split('.') {
        values.push(part.parse::<u64>().ok()?);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// A release counts as an update only once it is older than the grace window, so mirrors
/// have caught up by the time users are told about it.
pub fn release_is_newer(current: &str, release: &ReleaseInfo, now: DateTime<Utc>) -> bool {
    let newer = match (parse_version_key(current), parse_version_key(&release.tag_name)) {
        (Some(current), Some(latest)) => latest > current,
        _ => false,
    };
    let settled = release
        .published_at
        .map(|published| now - published >= ChronoDuration::minutes(RELEASE_GRACE_MINUTES))
        .unwrap_or(false);
    newer && settled
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Self {
        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => {
                let last_slash = image.rfind('/').map(|idx| idx + 1).unwrap_or(0);
                match image[last_slash..].rfind(':') {
                    Some(idx) => (
                        &image[..last_slash + idx],
                        image[last_slash + idx + 1..].to_string(),
                    ),
                    None => (image, "latest".to_string()),
                }
            }
        };
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        Self {
            registry,
            repository,
            reference,
        }
    }

    /// Loopback registries are spoken to over plain HTTP, as the docker daemon does.
    pub fn manifest_url(&self) -> String {
        let host = self
            .registry
            .split_once(':')
            .map_or(self.registry.as_str(), |(host, _)| host);
        let scheme = if host == "localhost" || host.starts_with("127.") {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            self.registry, self.repository, self.reference
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.strip_prefix('"')?;
        let end = after_key.find('"')?;
        let value = after_key[..end].to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
        rest = after_key[end + 1..].trim_start_matches(',').trim();
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn fetch_bearer_token(
    client: &Client,
    challenge: &BearerChallenge,
) -> Result<String, AliDockError> {
    let mut query = Vec::new();
    if let Some(service) = &challenge.service {
        query.push(("service", service.as_str()));
    }
    if let Some(scope) = &challenge.scope {
        query.push(("scope", scope.as_str()));
    }
    let response = client
        .get(&challenge.realm)
        .query(&query)
        .send()
        .map_err(probe_error)?;
    if !response.status().is_success() {
        return Err(AliDockError::Probe(format!(
            "registry token request failed: HTTP {}",
            response.status()
        )));
    }
    let payload: TokenPayload = response.json().map_err(probe_error)?;
    payload
        .token
        .or(payload.access_token)
        .ok_or_else(|| AliDockError::Probe("registry returned no token".to_string()))
}

fn content_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get("docker-content-digest")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Digest of the manifest the registry currently serves for `image`.
pub fn fetch_remote_digest(image: &str) -> Result<String, AliDockError> {
    let client = http_client()?;
    let reference = ImageReference::parse(image);
    let url = reference.manifest_url();
    let mut response = client
        .head(&url)
        .header(ACCEPT, MANIFEST_MEDIA_TYPES)
        .send()
        .map_err(probe_error)?;
    if response.status() == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| {
                AliDockError::Probe(format!("registry {} requires credentials", reference.registry))
            })?;
        let token = fetch_bearer_token(&client, &challenge)?;
        response = client
            .head(&url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .map_err(probe_error)?;
    }
    if !response.status().is_success() {
        return Err(AliDockError::Probe(format!(
            "cannot inspect {image} on its registry: HTTP {}",
            response.status()
        )));
    }
    content_digest(response.headers())
        .ok_or_else(|| AliDockError::Probe(format!("registry sent no digest for {image}")))
}

/// Local repo digests look like `repo@sha256:...`.
pub fn digest_differs(local_repo_digests: &[String], remote_digest: &str) -> bool {
    !local_repo_digests.iter().any(|entry| {
        entry
            .rsplit_once('@')
            .map(|(_, digest)| digest == remote_digest)
            .unwrap_or(false)
    })
}

pub fn image_update_probe<R: CommandRunner>(dock: &Dock<'_, R>) -> Result<bool, AliDockError> {
    let image = &dock.config().image_name;
    let Some(local) = dock.local_repo_digests(image)? else {
        return Ok(false);
    };
    if local.is_empty() {
        // Locally built image: nothing to compare against.
        return Ok(false);
    }
    let remote = fetch_remote_digest(image)?;
    Ok(digest_differs(&local, &remote))
}

/// Reports a newer launcher release on every invocation until it is installed.
pub fn warn_if_alidock_outdated(cfg: &Config, log: &Log) {
    if cfg.dont_update_alidock {
        log.debug("alidock update check disabled");
        return;
    }
    let Some(current) = current_release() else {
        log.debug("development build: not checking for alidock updates");
        return;
    };
    let checker = UpdateChecker::new(cfg.state_dir());
    let mut latest_tag = None;
    let result = checker.check_throttled(CheckKind::AliDock, cfg.update_period, true, || {
        let release = fetch_latest_release()?;
        let newer = release_is_newer(current, &release, Utc::now());
        latest_tag = Some(release.tag_name);
        Ok(newer)
    });
    match result {
        Ok(true) => log.warning(format!(
            "alidock {} is available (you are using {current}): get it from https://github.com/alidock/alidock/releases",
            latest_tag.unwrap_or_default()
        )),
        Ok(false) => {}
        Err(err) => log.warning(format!("cannot check for alidock updates: {err}")),
    }
}

/// Returns whether the configured image should be pulled before creating the container.
pub fn image_update_due<R: CommandRunner>(dock: &Dock<'_, R>, log: &Log) -> bool {
    let cfg = dock.config();
    if cfg.dont_update_image {
        log.debug("image update check disabled");
        return false;
    }
    let checker = UpdateChecker::new(cfg.state_dir());
    match checker.check_throttled(CheckKind::Image, cfg.update_period, false, || {
        image_update_probe(dock)
    }) {
        Ok(available) => available,
        Err(err) => {
            log.warning(format!("cannot check for image updates: {err}"));
            false
        }
    }
}
