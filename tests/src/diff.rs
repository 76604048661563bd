use {
    anyhow::{Result, bail},
    blockvault_protocol::EntryKind,
    blockvault_sdk::fs::Filesystem,
    fs_err::{read_dir, symlink_metadata},
    std::{fs::Metadata, path::Path},
};

#[cfg(target_family = "unix")]
fn unix_mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(target_family = "unix"))]
fn unix_mode(_metadata: &Metadata) -> Option<u32> {
    None
}

fn local_kind(metadata: &Metadata) -> EntryKind {
    if metadata.is_symlink() {
        EntryKind::Symlink
    } else if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

fn child_path(path: &str, name: &str) -> String {
    if path == "/" {
        format!("/{name}")
    } else {
        format!("{path}/{name}")
    }
}

/// Compares the local tree at `local` with the vault tree at `path`.
pub fn diff(local: &Path, fs: &Filesystem, path: &str) -> Result<()> {
    let metadata = symlink_metadata(local)?;
    let stat = fs.stat(path)?;
    let kind = local_kind(&metadata);
    if kind != stat.kind {
        bail!("kind mismatch for {path}: local {kind}, vault {}", stat.kind);
    }
    match kind {
        EntryKind::Directory => {
            let mut local_names = Vec::new();
            for entry in read_dir(local)? {
                let name = entry?.file_name();
                match name.to_str() {
                    Some(name) => local_names.push(name.to_owned()),
                    None => bail!("non-unicode name {name:?} in {}", local.display()),
                }
            }
            local_names.sort();
            let mut vault_names: Vec<String> = fs
                .readdir(path)?
                .into_iter()
                .map(|entry| entry.name)
                .collect();
            vault_names.sort();
            if local_names != vault_names {
                bail!("entries mismatch for {path}: local {local_names:?}, vault {vault_names:?}");
            }
            for name in &local_names {
                diff(&local.join(name), fs, &child_path(path, name))?;
            }
        }
        EntryKind::File => {
            let expected = fs_err::read(local)?;
            if stat.size != u64::try_from(expected.len())? {
                bail!(
                    "size mismatch for {path}: local {}, vault {}",
                    expected.len(),
                    stat.size
                );
            }
            let actual = fs.read(path, 0, expected.len().saturating_add(1))?;
            if actual != expected {
                bail!("content mismatch for {path}");
            }
            if let Some(mode) = unix_mode(&metadata) {
                if mode != stat.mode {
                    bail!(
                        "mode mismatch for {path}: local {mode:#o}, vault {:#o}",
                        stat.mode
                    );
                }
            }
        }
        EntryKind::Symlink => {
            let expected = fs_err::read_link(local)?;
            let actual = fs.readlink(path)?;
            if expected.to_str() != Some(actual.as_str()) {
                bail!(
                    "symlink target mismatch for {path}: local {}, vault {actual}",
                    expected.display()
                );
            }
        }
    }
    Ok(())
}
