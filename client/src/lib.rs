pub mod cli;
pub mod config;

use {
    anyhow::{Context as _, Result, bail},
    blockvault_protocol::{DateTimeUtc, EntryKind, VaultPath},
    blockvault_sdk::{
        CreateOptions, UnlockOptions, Vault,
        blockstore::{BlockContainer, OnDiskContainer},
        config::ConfigLocation,
        device::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE},
        fs::Filesystem,
    },
    byte_unit::{Byte, UnitType},
    chrono::{DateTime, Local},
    cli::{Cli, Command},
    config::Config,
    fs_err::{File, OpenOptions},
    std::{
        env::{self, VarError},
        fmt::Display,
        io::{self, Read, Write},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, prelude::*},
};

pub const PASSWORD_ENV_VAR: &str = "BLOCKVAULT_PASSWORD";

const COPY_CHUNK_LEN: usize = 1024 * 1024;
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn run(cli: Cli, config: Config) -> Result<()> {
    let password = read_password(matches!(cli.command, Command::Create { .. }))?;
    execute(cli, &config, &password)
}

fn read_password(confirm: bool) -> Result<String> {
    match env::var(PASSWORD_ENV_VAR) {
        Ok(password) => return Ok(password),
        Err(VarError::NotPresent) => {}
        Err(VarError::NotUnicode(_)) => bail!("{PASSWORD_ENV_VAR} is not valid unicode"),
    }
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("no password provided");
    }
    if confirm && rpassword::prompt_password("Repeat password: ")? != password {
        bail!("passwords do not match");
    }
    Ok(password)
}

fn config_location(cli: &Cli) -> ConfigLocation {
    match &cli.external_config {
        Some(path) => ConfigLocation::External(path.clone()),
        None => ConfigLocation::Internal,
    }
}

fn execute(cli: Cli, config: &Config, password: &str) -> Result<()> {
    if matches!(cli.command, Command::Create { .. }) {
        fs_err::create_dir_all(&cli.container)?;
    }
    let container: Arc<dyn BlockContainer> =
        Arc::new(OnDiskContainer::new(cli.container.clone())?);

    if let Command::Create {
        cipher,
        block_size,
        exclusive,
    } = cli.command
    {
        let mut options = CreateOptions::new(config.ledger_location()?);
        options.cipher = cipher.unwrap_or(config.default_cipher);
        options.block_size = match block_size {
            Some(size) => usize::try_from(size.as_u64()).context("block size is too large")?,
            None => config.block_size()?,
        };
        options.kdf = config.kdf;
        options.config_location = config_location(&cli);
        options.exclusive = exclusive;
        let vault = Vault::create(container, password, options)?;
        info!(
            "created filesystem {} ({}, {} byte blocks)",
            vault.filesystem_id(),
            vault.cipher_name(),
            vault.config().block_size
        );
        vault.unmount()?;
        return Ok(());
    }

    let mut options = UnlockOptions::new(config.ledger_location()?);
    options.config_location = config_location(&cli);
    options.allow_fresh_ledger = cli.trust_new_ledger;
    let vault = Vault::unlock(container, password, options)?;
    handle_command(&vault, cli.command)?;
    vault.unmount()?;
    Ok(())
}

fn handle_command(vault: &Vault, command: Command) -> Result<()> {
    let fs = vault.filesystem();
    let mut out = io::stdout().lock();
    match command {
        Command::Create { .. } => bail!("filesystem is already created"),
        Command::Info => {
            let statfs = fs.statfs()?;
            let used = statfs
                .num_blocks
                .saturating_mul(u64::try_from(statfs.block_size)?);
            writeln!(out, "filesystem id: {}", vault.filesystem_id())?;
            writeln!(out, "root blob: {}", vault.root_blob())?;
            writeln!(out, "cipher: {}", vault.cipher_name())?;
            writeln!(out, "client id: {}", vault.client_id())?;
            if let Some(client) = vault.config().exclusive_client_id {
                writeln!(out, "exclusive to client: {client}")?;
            }
            writeln!(out, "created with: {}", vault.config().created_with_version)?;
            writeln!(
                out,
                "block size: {} ({} bytes of payload)",
                statfs.block_size, statfs.payload_size
            )?;
            writeln!(
                out,
                "blocks: {} ({})",
                statfs.num_blocks,
                pretty_size(used)
            )?;
        }
        Command::Ls { path } => {
            for entry in fs.readdir(path.as_str())? {
                let stat = fs.stat(path.join_one(&entry.name)?.as_str())?;
                let size = match stat.kind {
                    EntryKind::File => pretty_size(stat.size).to_string(),
                    EntryKind::Directory => "DIR".into(),
                    EntryKind::Symlink => "LINK".into(),
                };
                writeln!(
                    out,
                    "{:04o} {:>12} {} {}",
                    stat.mode,
                    size,
                    pretty_time(stat.mtime),
                    entry.name
                )?;
            }
        }
        Command::Stat { path } => {
            let stat = fs.stat(path.as_str())?;
            writeln!(out, "path: {path}")?;
            writeln!(out, "kind: {}", stat.kind)?;
            writeln!(out, "blob: {}", stat.blob_id)?;
            writeln!(out, "size: {} ({} bytes)", pretty_size(stat.size), stat.size)?;
            writeln!(out, "mode: {:#o}", stat.mode)?;
            writeln!(out, "owner: {}:{}", stat.uid, stat.gid)?;
            writeln!(out, "accessed: {}", pretty_time(stat.atime))?;
            writeln!(out, "modified: {}", pretty_time(stat.mtime))?;
            writeln!(out, "changed: {}", pretty_time(stat.ctime))?;
            if stat.kind == EntryKind::Symlink {
                writeln!(out, "target: {}", fs.readlink(path.as_str())?)?;
            }
        }
        Command::Cat { path } => {
            let file = fs.open(path.as_str())?;
            let mut offset = 0;
            loop {
                let chunk = file.read(offset, COPY_CHUNK_LEN)?;
                if chunk.is_empty() {
                    break;
                }
                out.write_all(&chunk)?;
                offset = offset.saturating_add(u64::try_from(chunk.len())?);
            }
            out.flush()?;
        }
        Command::Put { local_path, path } => put(fs, &local_path, &path)?,
        Command::Get { path, local_path } => get(fs, &path, &local_path)?,
        Command::Mkdir { path, parents } => {
            if parents {
                fs.mkdir_all(path.as_str())?;
            } else {
                fs.mkdir(path.as_str(), DEFAULT_DIR_MODE)?;
            }
        }
        Command::Rm { path, recursive } => {
            if recursive {
                fs.remove_all(path.as_str())?;
            } else if fs.stat(path.as_str())?.kind == EntryKind::Directory {
                fs.rmdir(path.as_str())?;
            } else {
                fs.unlink(path.as_str())?;
            }
        }
        Command::Mv { from, to } => fs.rename(from.as_str(), to.as_str())?,
        Command::Ln { target, path } => fs.symlink(&target, path.as_str())?,
        Command::Chmod { mode, path } => fs.chmod(path.as_str(), mode)?,
    }
    Ok(())
}

fn put(fs: &Filesystem, local_path: &Path, path: &VaultPath) -> Result<()> {
    let metadata = fs_err::symlink_metadata(local_path)?;
    if metadata.is_symlink() {
        let target = fs_err::read_link(local_path)?;
        let target = target
            .to_str()
            .with_context(|| format!("symlink target is not unicode: {}", target.display()))?;
        fs.symlink(target, path.as_str())?;
    } else if metadata.is_dir() {
        debug!("creating directory {path}");
        fs.mkdir(path.as_str(), unix_mode(&metadata).unwrap_or(DEFAULT_DIR_MODE))?;
        for entry in fs_err::read_dir(local_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .with_context(|| format!("file name is not unicode: {name:?}"))?;
            put(fs, &entry.path(), &path.join_one(name)?)?;
        }
    } else {
        debug!("uploading {} to {path}", local_path.display());
        let file = fs.create(
            path.as_str(),
            unix_mode(&metadata).unwrap_or(DEFAULT_FILE_MODE),
        )?;
        let mut local = File::open(local_path)?;
        let mut buf = vec![0u8; COPY_CHUNK_LEN];
        let mut offset = 0;
        loop {
            let len = local.read(&mut buf)?;
            let Some(chunk) = buf.get(..len).filter(|chunk| !chunk.is_empty()) else {
                break;
            };
            file.write(offset, chunk)?;
            offset = offset.saturating_add(u64::try_from(len)?);
        }
    }
    Ok(())
}

fn get(fs: &Filesystem, path: &VaultPath, local_path: &Path) -> Result<()> {
    let stat = fs.stat(path.as_str())?;
    match stat.kind {
        EntryKind::Directory => {
            fs_err::create_dir(local_path)?;
            for entry in fs.readdir(path.as_str())? {
                get(fs, &path.join_one(&entry.name)?, &local_path.join(&entry.name))?;
            }
        }
        EntryKind::File => {
            let file = fs.open(path.as_str())?;
            let mut local = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(local_path)?;
            let mut offset = 0;
            loop {
                let chunk = file.read(offset, COPY_CHUNK_LEN)?;
                if chunk.is_empty() {
                    break;
                }
                local.write_all(&chunk)?;
                offset = offset.saturating_add(u64::try_from(chunk.len())?);
            }
            set_unix_mode(local_path, stat.mode)?;
        }
        EntryKind::Symlink => create_symlink(&fs.readlink(path.as_str())?, local_path)?,
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn unix_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(target_family = "unix"))]
fn unix_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(target_family = "unix")]
fn set_unix_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs_err::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(target_family = "unix"))]
fn set_unix_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(target_family = "unix")]
fn create_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("failed to create symlink {}", path.display()))
}

#[cfg(not(target_family = "unix"))]
fn create_symlink(target: &str, path: &Path) -> Result<()> {
    bail!(
        "cannot create symlink {} -> {target}: unsupported on this platform",
        path.display()
    )
}

fn pretty_size(size: u64) -> impl Display {
    format!(
        "{:.2}",
        Byte::from_u64(size).get_appropriate_unit(UnitType::Binary)
    )
}

fn pretty_time(value: DateTimeUtc) -> impl Display {
    DateTime::<Local>::from(value).format(DATE_TIME_FORMAT)
}

/// Logs to stderr, and also to `log_file` if set.
pub fn setup_logger(log_file: Option<&PathBuf>, log_filter: &str) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(EnvFilter::try_new(log_filter)?)
        .init();
    Ok(())
}
