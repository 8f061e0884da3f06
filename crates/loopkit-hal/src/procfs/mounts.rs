//! Parsing helpers for `/proc/self/mounts` (and similar fstab-format tables).

use std::path::{Path, PathBuf};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

pub fn parse_mounts(content: &str) -> Vec<MountRecord> {
    content
        .lines()
        .filter_map(|line| {
            // <source> <target> <fstype> <options> <freq> <passno>
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountRecord {
                source: unescape_mount_path(source),
                target: PathBuf::from(unescape_mount_path(target)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Render records back into table format. Used by the fake kernel.
pub fn render_mounts(records: &[MountRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let options = if record.options.is_empty() {
            "rw"
        } else {
            record.options.as_str()
        };
        out.push_str(&format!(
            "{} {} {} {} 0 0\n",
            escape_mount_path(&record.source),
            escape_mount_path(&record.target.to_string_lossy()),
            record.fstype,
            options
        ));
    }
    out
}

/// Source of the first record mounted exactly at `target`.
pub fn source_for_target<'a>(records: &'a [MountRecord], target: &Path) -> Option<&'a str> {
    let target = normalize_path(target);
    records
        .iter()
        .find(|record| normalize_path(&record.target) == target)
        .map(|record| record.source.as_str())
}

/// Mount points whose source is exactly `source`, in table order.
pub fn targets_for_source(records: &[MountRecord], source: &str) -> Vec<PathBuf> {
    records
        .iter()
        .filter(|record| record.source == source)
        .map(|record| record.target.clone())
        .collect()
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn escape_mount_path(raw: &str) -> String {
    raw.replace('\\', "\\134")
        .replace(' ', "\\040")
        .replace('\t', "\\011")
        .replace('\n', "\\012")
}

pub fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 && s.ends_with('/') {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}
