// TF2 provisioner - Main entry point
// Create a configured TF2 server container for one profile, region and instance

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tf2_provisioner::config::Settings;
use tf2_provisioner::provision::identity::RunIdentity;
use tf2_provisioner::provision::{ProvisionError, ProvisionOptions, Provisioner};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Provision a TF2 dedicated server container")]
struct Cli {
    /// Profile under profiles/ to apply on top of the global one
    #[arg(short = 'p', long = "profile-name")]
    profile_name: String,

    /// Region the server is in, used in the container name
    #[arg(short = 'r', long = "region-name")]
    region_name: String,

    /// Instance number within the region, starting at 1
    #[arg(short = 'i', long = "instance-number")]
    instance_number: u32,

    /// CPUs the container may run on, e.g. "0-1"
    #[arg(short = 'c', long = "cpu-affinity")]
    cpu_affinity: Option<String>,

    /// Install SourceBans++ and configure it from the [sbpp] settings
    #[arg(long = "with-sbpp")]
    with_sbpp: bool,

    /// Kill and remove an existing container with the same name
    #[arg(short = 'o', long)]
    overwrite: bool,

    /// Delete an existing data directory before installing
    #[arg(short = 'e', long, conflicts_with = "force_reuse")]
    erase: bool,

    /// Install over an existing data directory
    #[arg(short = 'f', long = "force-reuse")]
    force_reuse: bool,

    /// Skip upgrading the container's packages
    #[arg(short = 's', long = "skip-apt")]
    skip_apt: bool,

    /// Exit after the final restart without waiting for the server
    #[arg(short = 'n', long = "no-wait")]
    no_wait: bool,

    /// Address the server is reachable on, detected when omitted
    #[arg(long = "host-ip")]
    host_ip: Option<IpAddr>,

    /// Directory holding settings, profiles and the plugin catalog
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

async fn run(cli: Cli) -> Result<(), ProvisionError> {
    let identity = RunIdentity::new(&cli.profile_name, &cli.region_name, cli.instance_number)?;
    let settings = Settings::load(&cli.root, identity.profile())?;
    let options = ProvisionOptions {
        cpu_affinity: cli.cpu_affinity,
        with_sbpp: cli.with_sbpp,
        overwrite: cli.overwrite,
        erase: cli.erase,
        force_reuse: cli.force_reuse,
        skip_apt: cli.skip_apt,
        no_wait: cli.no_wait,
        host_ip: cli.host_ip,
    };

    let provisioner = Provisioner::new(&cli.root, identity, settings, options).await?;
    provisioner.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    // Keep the HTTP and Docker client internals quiet
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info")
            .add_directive("hyper=warn".parse().expect("static directive"))
            .add_directive("bollard=warn".parse().expect("static directive"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
