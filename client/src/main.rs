use {
    anyhow::Result,
    blockvault::{cli::Cli, config::Config, run, setup_logger},
    clap::Parser,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.clone())?;
    setup_logger(config.log_file.as_ref(), &config.log_filter)?;
    run(cli, config)
}
