//! Randomized end-to-end check: the same mutations are applied to a local
//! directory and to a vault, and the two trees must stay identical across
//! remounts. Finally the container is rolled back and the mount must fail.

mod diff;
mod shuffle;

use {
    anyhow::{Result, bail},
    blockvault_sdk::{
        CreateOptions, Error, UnlockError, UnlockOptions, Vault,
        blockstore::{BlockContainer, LedgerLocation, OnDiskContainer},
        crypto::{CipherName, KdfParams},
    },
    clap::Parser,
    diff::diff,
    fs_err::{create_dir_all, read_dir, remove_dir_all, rename},
    rand::{Rng, SeedableRng, rngs::StdRng, seq::IndexedRandom},
    shuffle::{Mirror, random_content, shuffle},
    std::{
        path::{Path, PathBuf},
        process::ExitCode,
        sync::Arc,
    },
    tempfile::TempDir,
    tracing::{error, info},
    tracing_subscriber::EnvFilter,
};

const PASSWORD: &str = "correct horse battery staple";

#[derive(Debug, Parser)]
struct Args {
    /// Number of shuffle rounds.
    #[clap(long, default_value_t = 300)]
    rounds: u32,
    /// Seed of a previous run to reproduce. Random if omitted.
    #[clap(long)]
    seed: Option<u64>,
    /// Cipher to test. Random if omitted.
    #[clap(long)]
    cipher: Option<CipherName>,
    #[clap(long, default_value_t = 1024)]
    block_size: usize,
}

struct Env {
    local: PathBuf,
    container_dir: PathBuf,
    state_dir: PathBuf,
}

impl Env {
    fn new(dir: &Path) -> Result<Self> {
        let env = Self {
            local: dir.join("local"),
            container_dir: dir.join("container"),
            state_dir: dir.join("state"),
        };
        create_dir_all(&env.local)?;
        create_dir_all(&env.container_dir)?;
        Ok(env)
    }

    fn container(&self) -> Result<Arc<dyn BlockContainer>> {
        Ok(Arc::new(OnDiskContainer::new(self.container_dir.clone())?))
    }

    fn ledger(&self) -> LedgerLocation {
        LedgerLocation::Directory(self.state_dir.clone())
    }

    fn unlock(&self) -> Result<Vault, UnlockError> {
        Vault::unlock(self.container()?, PASSWORD, UnlockOptions::new(self.ledger()))
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    create_dir_all(dst)?;
    for entry in read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dst.join(entry.file_name()))?;
        } else {
            fs_err::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match try_main(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn try_main(args: Args) -> Result<()> {
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    let mut rng = StdRng::seed_from_u64(seed);
    let cipher = match args.cipher {
        Some(cipher) => cipher,
        None => *CipherName::ALL.choose(&mut rng).unwrap_or(&CipherName::default()),
    };
    info!(seed, %cipher, block_size = args.block_size, "starting");

    let dir = TempDir::new()?;
    let result = run(dir.path(), &args, cipher, &mut rng);
    if result.is_err() {
        let dir = dir.keep();
        error!("failed with seed {seed}, files kept in {}", dir.display());
    }
    result
}

fn run(dir: &Path, args: &Args, cipher: CipherName, rng: &mut StdRng) -> Result<()> {
    let env = Env::new(dir)?;
    let mut options = CreateOptions::new(env.ledger());
    options.cipher = cipher;
    options.block_size = args.block_size;
    options.kdf = KdfParams::insecure_for_tests();
    let mut vault = Vault::create(env.container()?, PASSWORD, options)?;

    for round in 0..args.rounds {
        let mirror = Mirror {
            local: &env.local,
            fs: vault.filesystem(),
        };
        shuffle(&mirror, rng)?;
        diff(&env.local, vault.filesystem(), "/")?;
        if rng.random_bool(0.2) {
            vault.unmount()?;
            vault = env.unlock()?;
            diff(&env.local, vault.filesystem(), "/")?;
            info!(round, blocks = vault.filesystem().statfs()?.num_blocks, "remounted");
        }
    }

    check_rollback(&env, vault, rng)?;
    info!("all checks passed");
    Ok(())
}

/// Restores an earlier copy of the whole container and expects the mount to fail.
fn check_rollback(env: &Env, vault: Vault, rng: &mut StdRng) -> Result<()> {
    vault.unmount()?;
    let snapshot = env.container_dir.with_file_name("snapshot");
    copy_dir_all(&env.container_dir, &snapshot)?;

    let vault = env.unlock()?;
    vault
        .filesystem()
        .create("/rollback-probe", 0o600)?
        .write(0, &random_content(rng, 1000))?;
    vault.unmount()?;

    remove_dir_all(&env.container_dir)?;
    rename(&snapshot, &env.container_dir)?;
    match env.unlock() {
        Err(UnlockError::Storage(Error::Rollback { block, .. })) => {
            info!(%block, "rollback detected");
            Ok(())
        }
        Err(err) => bail!("expected a rollback error, got: {err}"),
        Ok(_) => bail!("rolled back container was mounted"),
    }
}
