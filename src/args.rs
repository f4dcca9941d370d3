//! Command line arguments for the check controller

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: SubCommands,
}

#[derive(Parser, Debug, Clone)]
pub enum SubCommands {
    /// Run the check controller
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to a YAML config file. Missing is not an error; all settings
    /// have defaults and can also be set through environment variables.
    #[clap(short, long)]
    pub config: Option<String>,
    /// Override the configured prometheus pushgateway URL
    #[clap(long)]
    pub prometheus_gateway: Option<String>,
    /// Install/update the `Check` CRD before starting
    #[clap(long, default_value_t = true)]
    pub install_crd: bool,
}
