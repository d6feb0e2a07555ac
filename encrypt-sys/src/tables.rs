// SPDX-License-Identifier: GPL-3.0-only

//! Line-oriented edits of `/etc/crypttab` and `/etc/fstab`.
//!
//! Every edit reads the whole file, rewrites whole lines and reports whether
//! anything changed, so callers can skip the write entirely when not.

use std::path::Path;

use crate::error::Result;

pub const TPM_UNLOCK_OPTION: &str = "tpm2-device=auto";
pub const MOUNT_TIMEOUT_OPTION: &str = "x-systemd.device-timeout=0";

/// Result of an edit: the new contents and whether they differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEdit {
    pub contents: String,
    pub changed: bool,
}

impl TableEdit {
    fn unchanged(contents: &str) -> Self {
        Self {
            contents: contents.to_string(),
            changed: false,
        }
    }
}

/// One crypttab line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrypttabLine {
    Comment(String),
    Blank(String),
    /// Fewer than two fields.
    Malformed(String),
    Entry {
        raw: String,
        target: String,
        source: String,
    },
}

pub fn fields(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

pub fn parse_crypttab(contents: &str) -> Vec<CrypttabLine> {
    contents
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                return CrypttabLine::Blank(line.to_string());
            }
            if line.trim_start().starts_with('#') {
                return CrypttabLine::Comment(line.to_string());
            }
            match fields(line).as_slice() {
                [target, source, ..] => CrypttabLine::Entry {
                    raw: line.to_string(),
                    target: target.to_string(),
                    source: source.to_string(),
                },
                _ => CrypttabLine::Malformed(line.to_string()),
            }
        })
        .collect()
}

/// Drops the entries for which `is_stale(target, source)` holds. Lines that
/// are not entries are kept verbatim.
pub fn prune_crypttab(
    lines: &[CrypttabLine],
    mut is_stale: impl FnMut(&str, &str) -> bool,
) -> TableEdit {
    let mut kept = Vec::with_capacity(lines.len());
    let mut changed = false;
    for line in lines {
        match line {
            CrypttabLine::Comment(raw) | CrypttabLine::Blank(raw) | CrypttabLine::Malformed(raw) => {
                kept.push(raw.as_str())
            }
            CrypttabLine::Entry {
                raw,
                target,
                source,
            } => {
                if is_stale(target, source) {
                    tracing::info!("Removing stale crypttab entry: {}", raw);
                    changed = true;
                } else {
                    kept.push(raw.as_str());
                }
            }
        }
    }

    TableEdit {
        contents: join_lines(&kept),
        changed,
    }
}

/// Adds `tpm2-device=auto` to the options of the first entry whose source is
/// `UUID=<uuid>`. A no-op when the option is already there.
pub fn tag_tpm_unlock(contents: &str, uuid: &str) -> TableEdit {
    let needle = format!("UUID={uuid}");
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();

    let Some(index) = lines
        .iter()
        .position(|line| !line.trim_start().starts_with('#') && fields(line).get(1) == Some(&needle.as_str()))
    else {
        return TableEdit::unchanged(contents);
    };
    if lines[index].contains(TPM_UNLOCK_OPTION) {
        return TableEdit::unchanged(contents);
    }

    let mut entry: Vec<String> = fields(&lines[index]).into_iter().map(str::to_string).collect();
    match entry.len() {
        0 | 1 => return TableEdit::unchanged(contents),
        2 => entry.extend(["none".to_string(), TPM_UNLOCK_OPTION.to_string()]),
        3 => entry.push(TPM_UNLOCK_OPTION.to_string()),
        _ => {
            entry[3].push(',');
            entry[3].push_str(TPM_UNLOCK_OPTION);
        }
    }
    lines[index] = entry.join("\t");

    TableEdit {
        contents: join_lines(&lines),
        changed: true,
    }
}

/// Adds `x-systemd.device-timeout=0` to the first six-field fstab entry whose
/// source is `device` or `UUID=<uuid>`. A no-op when already present.
pub fn extend_mount_timeout(contents: &str, device: &str, uuid: &str) -> TableEdit {
    let uuid_source = format!("UUID={uuid}");
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();

    let matching = lines.iter().position(|line| {
        let entry = fields(line);
        entry.len() == 6
            && !entry[0].starts_with('#')
            && (entry[0] == device || (!uuid.is_empty() && entry[0] == uuid_source))
    });
    let Some(index) = matching else {
        return TableEdit::unchanged(contents);
    };

    let mut entry: Vec<String> = fields(&lines[index]).into_iter().map(str::to_string).collect();
    if entry[3].contains(MOUNT_TIMEOUT_OPTION) {
        return TableEdit::unchanged(contents);
    }
    entry[3].push(',');
    entry[3].push_str(MOUNT_TIMEOUT_OPTION);
    lines[index] = entry.join("\t");

    TableEdit {
        contents: join_lines(&lines),
        changed: true,
    }
}

fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

pub fn read_table(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)?)
}

/// Writes `edit` back to `path` if it changed anything. Returns whether a
/// write happened.
pub fn write_if_changed(path: &Path, edit: &TableEdit) -> Result<bool> {
    if !edit.changed {
        return Ok(false);
    }
    std::fs::write(path, &edit.contents)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRYPTTAB: &str = "\
# <target name> <source device> <key file> <options>
dm-sdb1\tUUID=aaaa\tnone\tluks
dm-sdc1 UUID=bbbb none luks
broken

dm-sdd1\t/dev/sdd1\tnone\tluks
";

    #[test]
    fn prune_removes_only_stale_entries() {
        let lines = parse_crypttab(CRYPTTAB);
        let edit = prune_crypttab(&lines, |_, source| source == "UUID=bbbb");
        assert!(edit.changed);
        assert_eq!(
            edit.contents,
            "# <target name> <source device> <key file> <options>\n\
             dm-sdb1\tUUID=aaaa\tnone\tluks\n\
             broken\n\
             \n\
             dm-sdd1\t/dev/sdd1\tnone\tluks\n"
        );
    }

    #[test]
    fn prune_keeps_blank_lines_between_entries() {
        let contents = "dm-a UUID=aaaa none luks\n\n\ndm-b UUID=bbbb none luks\n";
        let lines = parse_crypttab(contents);
        assert_eq!(lines[1], CrypttabLine::Blank(String::new()));

        let edit = prune_crypttab(&lines, |target, _| target == "dm-b");
        assert_eq!(edit.contents, "dm-a UUID=aaaa none luks\n\n\n");
    }

    #[test]
    fn prune_without_stale_entries_reports_no_change() {
        let lines = parse_crypttab(CRYPTTAB);
        let edit = prune_crypttab(&lines, |_, _| false);
        assert!(!edit.changed);

        let again = prune_crypttab(&parse_crypttab(&edit.contents), |_, _| false);
        assert!(!again.changed);
    }

    #[test]
    fn tpm_tag_is_appended_once() {
        let edit = tag_tpm_unlock(CRYPTTAB, "aaaa");
        assert!(edit.changed);
        assert!(
            edit.contents
                .contains("dm-sdb1\tUUID=aaaa\tnone\tluks,tpm2-device=auto\n")
        );

        let again = tag_tpm_unlock(&edit.contents, "aaaa");
        assert!(!again.changed);
        assert_eq!(again.contents, edit.contents);
    }

    #[test]
    fn tpm_tag_adds_missing_option_field() {
        let edit = tag_tpm_unlock("dm-sde1 UUID=eeee\n", "eeee");
        assert_eq!(edit.contents, "dm-sde1\tUUID=eeee\tnone\ttpm2-device=auto\n");
        assert!(!tag_tpm_unlock(CRYPTTAB, "ffff").changed);
    }

    const FSTAB: &str = "\
# /etc/fstab
UUID=1111 / ext4 defaults 0 1
/dev/sdb1 /data ext4 defaults,nofail 0 2
UUID=2222 /home ext4 defaults 0 2
";

    #[test]
    fn mount_timeout_is_idempotent() {
        let edit = extend_mount_timeout(FSTAB, "/dev/sdb1", "9999");
        assert!(edit.changed);
        assert!(edit.contents.contains(
            "/dev/sdb1\t/data\text4\tdefaults,nofail,x-systemd.device-timeout=0\t0\t2\n"
        ));
        assert!(edit.contents.starts_with("# /etc/fstab\nUUID=1111 / ext4"));

        let again = extend_mount_timeout(&edit.contents, "/dev/sdb1", "9999");
        assert!(!again.changed);
        assert_eq!(
            again.contents.matches(MOUNT_TIMEOUT_OPTION).count(),
            1
        );
    }

    #[test]
    fn mount_timeout_matches_uuid_source() {
        let edit = extend_mount_timeout(FSTAB, "/dev/sdz9", "2222");
        assert!(edit.contents.contains("UUID=2222\t/home\text4\tdefaults,x-systemd.device-timeout=0"));
        assert!(!extend_mount_timeout(FSTAB, "/dev/sdz9", "").changed);
    }

    #[test]
    fn unchanged_edit_is_not_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fstab");
        std::fs::write(&path, FSTAB).expect("write");

        let edit = extend_mount_timeout(FSTAB, "/dev/none", "");
        assert!(!write_if_changed(&path, &edit).expect("write"));

        let edit = extend_mount_timeout(FSTAB, "/dev/sdb1", "");
        assert!(write_if_changed(&path, &edit).expect("write"));
        assert_eq!(read_table(&path).expect("read"), edit.contents);
    }
}
