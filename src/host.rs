use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

impl HostUser {
    pub fn current() -> Self {
        let name = id_output(&["-un"])
            .or_else(|| env::var("USER").ok())
            .or_else(|| env::var("USERNAME").ok())
            .unwrap_or_else(|| "alidock".to_string());
        Self {
            uid: current_uid(),
            gid: id_output(&["-g"])
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            name,
        }
    }
}

fn id_output(args: &[&str]) -> Option<String> {
    if !cfg!(unix) {
        return None;
    }
    let output = Command::new("id").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn current_uid() -> u32 {
    id_output(&["-u"])
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Looks up a group id by name in an `/etc/group`-formatted file.
pub fn lookup_group_gid(group_file: &Path, group: &str) -> Option<u32> {
    let content = fs::read_to_string(group_file).ok()?;
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            if name != group {
                return None;
            }
            fields.nth(1)?.trim().parse().ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn group_lookup_reads_gid_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("group");
        fs::write(
            &path,
            "# comment\nroot:x:0:\nvideo:x:44:alice,bob\nrender:x:109:\n",
        )
        .unwrap();
        assert_eq!(lookup_group_gid(&path, "video"), Some(44));
        assert_eq!(lookup_group_gid(&path, "render"), Some(109));
        assert_eq!(lookup_group_gid(&path, "docker"), None);
    }

    #[test]
    fn group_lookup_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(lookup_group_gid(&dir.path().join("nope"), "video"), None);
    }
}
