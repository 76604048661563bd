use {
    blockvault_protocol::VaultPath,
    blockvault_sdk::crypto::CipherName,
    byte_unit::Byte,
    clap::{Parser, Subcommand},
    std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Cli {
    /// Path to the config file. Defaults to `blockvault.json5` in the user config dir.
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the encrypted blocks.
    #[clap(long, short)]
    pub container: PathBuf,
    /// Keep the encrypted filesystem config in this file instead of inside the container.
    #[clap(long)]
    pub external_config: Option<PathBuf>,
    /// Mount even if this machine has no integrity ledger for the filesystem yet.
    #[clap(long)]
    pub trust_new_ledger: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Create a new empty filesystem in the container.
    Create {
        #[arg(long)]
        cipher: Option<CipherName>,
        /// Size of an encrypted block, e.g. "32 KiB".
        #[arg(long)]
        block_size: Option<Byte>,
        /// Allow only this machine to mount the filesystem.
        #[arg(long)]
        exclusive: bool,
    },
    /// Show filesystem parameters and usage.
    Info,
    Ls {
        #[arg(default_value = "/")]
        path: VaultPath,
    },
    Stat {
        path: VaultPath,
    },
    /// Print a file to stdout.
    Cat {
        path: VaultPath,
    },
    /// Copy a local file or directory into the filesystem.
    Put {
        local_path: PathBuf,
        path: VaultPath,
    },
    /// Copy a file or directory out of the filesystem.
    Get {
        path: VaultPath,
        local_path: PathBuf,
    },
    Mkdir {
        path: VaultPath,
        /// Create missing parents too.
        #[arg(short, long)]
        parents: bool,
    },
    Rm {
        path: VaultPath,
        /// Remove directories and their contents.
        #[arg(short, long)]
        recursive: bool,
    },
    Mv {
        from: VaultPath,
        to: VaultPath,
    },
    Ln {
        target: String,
        path: VaultPath,
    },
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        path: VaultPath,
    },
}

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode: {value:?}"))
}
