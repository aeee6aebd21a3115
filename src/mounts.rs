use crate::config::expand_path;
use crate::error::AliDockError;
use std::env;
use std::path::{Component, Path, PathBuf};

const MOUNT_DELIMITER: char = ':';
const MOUNT_FIELDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

impl MountMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "" | "rw" => Some(Self::ReadWrite),
            "ro" => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub label: String,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn target(&self) -> String {
        format!("/mnt/{}", self.label)
    }
}

/// Splits `input` on `delim` into at most `max_fields` fields. A backslash escapes the next
/// character; once the last field is reached further delimiters are kept verbatim.
pub fn split_escaped(input: &str, delim: char, max_fields: usize) -> Vec<String> {
    let mut fields = Vec::with_capacity(max_fields);
    let mut current = String::new();
    let mut escaped = false;
    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == delim && fields.len() + 1 < max_fields {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        current.push('\\');
    }
    fields.push(current);
    fields
}

pub fn resolve_mounts(raw_specs: &[String]) -> Result<Vec<MountSpec>, AliDockError> {
    raw_specs.iter().map(|raw| parse_mount(raw)).collect()
}

pub fn parse_mount(raw: &str) -> Result<MountSpec, AliDockError> {
    let fields = split_escaped(raw, MOUNT_DELIMITER, MOUNT_FIELDS);
    let source_raw = fields.first().map(String::as_str).unwrap_or_default();
    let label_raw = fields.get(1).map(String::as_str).unwrap_or_default();
    let mode_raw = fields.get(2).map(String::as_str).unwrap_or_default();

    if source_raw.is_empty() {
        return Err(AliDockError::InvalidMountSpec(format!(
            "'{raw}': source path is empty"
        )));
    }
    let source = absolute_path(Path::new(&expand_path(source_raw)));
    if source.is_file() {
        return Err(AliDockError::InvalidMountSpec(format!(
            "'{raw}': {} is a file, only directories can be mounted",
            source.display()
        )));
    }

    let label = if label_raw.is_empty() {
        default_label(&source)
    } else {
        label_raw.to_string()
    };
    if label.contains('/') || label == "." || label == ".." {
        return Err(AliDockError::InvalidMountSpec(format!(
            "'{raw}': label '{label}' must be a single path component"
        )));
    }

    let mode = MountMode::parse(mode_raw).ok_or_else(|| {
        AliDockError::InvalidMountSpec(format!(
            "'{raw}': mode '{mode_raw}' must be either rw or ro"
        ))
    })?;

    Ok(MountSpec {
        source,
        label,
        mode,
    })
}

fn default_label(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string())
}

/// Makes `path` absolute against the current directory and drops `.`/`..` lexically, so
/// paths that do not exist yet are accepted.
fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
