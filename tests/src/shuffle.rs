use {
    anyhow::{Context as _, Result},
    blockvault_sdk::{device::DEFAULT_DIR_MODE, fs::Filesystem},
    fs_err::{
        OpenOptions, create_dir, read_dir, remove_dir_all, remove_file, rename,
        symlink_metadata,
    },
    rand::{
        Rng,
        distr::{Distribution, weighted::WeightedIndex},
        rngs::StdRng,
        seq::IndexedRandom,
    },
    std::{
        io::{Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
    tracing::debug,
};

const FILE_MODE: u32 = 0o644;

/// A local directory and a vault that are expected to hold the same tree.
pub struct Mirror<'a> {
    pub local: &'a Path,
    pub fs: &'a Filesystem,
}

impl Mirror<'_> {
    pub fn vault_path(&self, path: &Path) -> Result<String> {
        let names = path
            .strip_prefix(self.local)?
            .iter()
            .map(|name| name.to_str().context("non-unicode name"))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("/{}", names.join("/")))
    }
}

fn find_paths_inner(
    dir: &Path,
    allow_files: bool,
    allow_symlinks: bool,
    allow_dirs: bool,
    allow_root: bool,
    output: &mut Vec<PathBuf>,
) -> Result<()> {
    if allow_dirs && allow_root {
        output.push(dir.into());
    }
    for entry in read_dir(dir)? {
        let entry = entry?.path();
        let file_type = symlink_metadata(&entry)?.file_type();
        if file_type.is_dir() {
            find_paths_inner(
                &entry,
                allow_files,
                allow_symlinks,
                allow_dirs,
                true,
                output,
            )?;
        } else if file_type.is_symlink() {
            if allow_symlinks {
                output.push(entry);
            }
        } else if allow_files {
            output.push(entry);
        }
    }
    Ok(())
}

pub fn choose_path(
    dir: &Path,
    allow_files: bool,
    allow_symlinks: bool,
    allow_dirs: bool,
    allow_root: bool,
    rng: &mut StdRng,
) -> Result<Option<PathBuf>> {
    let mut paths = Vec::new();
    find_paths_inner(
        dir,
        allow_files,
        allow_symlinks,
        allow_dirs,
        allow_root,
        &mut paths,
    )?;
    Ok(paths.choose(rng).cloned())
}

fn choose_dir(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<PathBuf> {
    choose_path(mirror.local, false, false, true, true, rng)?.context("root is always a candidate")
}

fn random_name(rng: &mut StdRng) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789_.";
    let len = if rng.random_bool(0.02) {
        rng.random_range(200..=255)
    } else {
        rng.random_range(1..=10)
    };
    loop {
        let name: String = (0..len)
            .filter_map(|_| CHARS.choose(rng).map(|c| char::from(*c)))
            .collect();
        if name != "." && name != ".." {
            return name;
        }
    }
}

pub fn random_content(rng: &mut StdRng, max_len: usize) -> Vec<u8> {
    let mut content = vec![0u8; rng.random_range(0..=max_len)];
    rng.fill(content.as_mut_slice());
    content
}

#[cfg(target_family = "unix")]
fn set_local_mode(path: &Path, mode: u32) -> Result<()> {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt};

    fs_err::set_permissions(path, Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(target_family = "unix"))]
fn set_local_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn create(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let path = choose_dir(mirror, rng)?.join(random_name(rng));
    if symlink_metadata(&path).is_ok() {
        return Ok(());
    }
    let vault_path = mirror.vault_path(&path)?;
    if rng.random_bool(0.15) {
        create_dir(&path)?;
        mirror.fs.mkdir(&vault_path, DEFAULT_DIR_MODE)?;
        debug!("created dir {vault_path}");
    } else {
        let content = random_content(rng, 30_000);
        fs_err::write(&path, &content)?;
        set_local_mode(&path, FILE_MODE)?;
        let file = mirror.fs.create(&vault_path, FILE_MODE)?;
        file.write(0, &content)?;
        debug!("created file {vault_path} ({} bytes)", content.len());
    }
    Ok(())
}

fn write_at(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(path) = choose_path(mirror.local, true, false, false, false, rng)? else {
        return Ok(());
    };
    let size = symlink_metadata(&path)?.len();
    let offset = rng.random_range(0..=size.saturating_add(5000));
    let data = random_content(rng, 10_000);
    if data.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&data)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.write(&vault_path, offset, &data)?;
    debug!("wrote {} bytes at {offset} to {vault_path}", data.len());
    Ok(())
}

fn truncate(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(path) = choose_path(mirror.local, true, false, false, false, rng)? else {
        return Ok(());
    };
    let size = symlink_metadata(&path)?.len();
    let new_size = rng.random_range(0..=size.saturating_mul(2).saturating_add(1000));
    OpenOptions::new().write(true).open(&path)?.set_len(new_size)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.truncate(&vault_path, new_size)?;
    debug!("truncated {vault_path} from {size} to {new_size}");
    Ok(())
}

fn random_rename(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(from) = choose_path(mirror.local, true, true, true, false, rng)? else {
        return Ok(());
    };
    let to = if rng.random_bool(0.3) {
        choose_dir(mirror, rng)?.join(random_name(rng))
    } else {
        from.parent()
            .context("chosen path is never the root")?
            .join(random_name(rng))
    };
    if to == from || to.starts_with(&from) {
        return Ok(());
    }
    // Replacing is only exercised for file over file.
    if let Ok(target) = symlink_metadata(&to) {
        if !target.is_file() || !symlink_metadata(&from)?.is_file() {
            return Ok(());
        }
    }
    rename(&from, &to)?;
    let (from, to) = (mirror.vault_path(&from)?, mirror.vault_path(&to)?);
    mirror.fs.rename(&from, &to)?;
    debug!("renamed {from} -> {to}");
    Ok(())
}

fn delete(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    if rng.random_bool(0.1) {
        let Some(path) = choose_path(mirror.local, false, false, true, false, rng)? else {
            return Ok(());
        };
        remove_dir_all(&path)?;
        let vault_path = mirror.vault_path(&path)?;
        mirror.fs.remove_all(&vault_path)?;
        debug!("removed dir {vault_path}");
    } else {
        let Some(path) = choose_path(mirror.local, true, true, false, false, rng)? else {
            return Ok(());
        };
        remove_file(&path)?;
        let vault_path = mirror.vault_path(&path)?;
        mirror.fs.unlink(&vault_path)?;
        debug!("removed {vault_path}");
    }
    Ok(())
}

fn change_mode(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(path) = choose_path(mirror.local, true, false, false, false, rng)? else {
        return Ok(());
    };
    let mode = *[0o777, 0o774, 0o744, 0o700, 0o666, 0o664, 0o644, 0o600]
        .choose(rng)
        .context("mode list is not empty")?;
    set_local_mode(&path, mode)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.chmod(&vault_path, mode)?;
    debug!("changed mode of {vault_path} to {mode:#o}");
    Ok(())
}

#[cfg(target_family = "unix")]
fn make_symlink(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let path = choose_dir(mirror, rng)?.join(random_name(rng));
    if symlink_metadata(&path).is_ok() {
        return Ok(());
    }
    let target = format!("../{}", random_name(rng));
    std::os::unix::fs::symlink(&target, &path)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.symlink(&target, &vault_path)?;
    debug!("created symlink {vault_path} -> {target}");
    Ok(())
}

#[cfg(not(target_family = "unix"))]
fn make_symlink(_mirror: &Mirror<'_>, _rng: &mut StdRng) -> Result<()> {
    Ok(())
}

fn file_to_dir(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(path) = choose_path(mirror.local, true, false, false, false, rng)? else {
        return Ok(());
    };
    remove_file(&path)?;
    create_dir(&path)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.unlink(&vault_path)?;
    mirror.fs.mkdir(&vault_path, DEFAULT_DIR_MODE)?;
    debug!("replaced file with dir {vault_path}");
    Ok(())
}

fn dir_to_file(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let Some(path) = choose_path(mirror.local, false, false, true, false, rng)? else {
        return Ok(());
    };
    let content = random_content(rng, 30_000);
    remove_dir_all(&path)?;
    fs_err::write(&path, &content)?;
    set_local_mode(&path, FILE_MODE)?;
    let vault_path = mirror.vault_path(&path)?;
    mirror.fs.remove_all(&vault_path)?;
    mirror.fs.create(&vault_path, FILE_MODE)?.write(0, &content)?;
    debug!("replaced dir with file {vault_path}");
    Ok(())
}

type Shuffler = fn(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()>;

/// Applies a random batch of identical mutations to both sides of `mirror`.
pub fn shuffle(mirror: &Mirror<'_>, rng: &mut StdRng) -> Result<()> {
    let num_mutations = rng.random_range(1..=30);
    let shufflers: &[(Shuffler, u32)] = &[
        (create, 10),
        (write_at, 15),
        (truncate, 5),
        (random_rename, 5),
        (delete, 8),
        (change_mode, 3),
        (make_symlink, 2),
        (file_to_dir, 2),
        (dir_to_file, 2),
    ];
    let distribution = WeightedIndex::new(shufflers.iter().map(|(_, weight)| *weight))?;
    for _ in 0..num_mutations {
        let (shuffler, _) = shufflers
            .get(distribution.sample(rng))
            .context("weighted index is in range")?;
        shuffler(mirror, rng)?;
    }
    Ok(())
}
