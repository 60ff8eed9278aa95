//! DRBD Flexvolume Provisioner
//!
//! Dynamic Kubernetes volume provisioner backed by a DRBD Manage cluster.
//! Pending claims whose StorageClass names this provisioner are satisfied by
//! creating a replicated DRBD resource and publishing it as a flexvolume
//! PersistentVolume; released volumes are torn down again.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drbd_flex_provisioner::{
    Controller, DrbdConfig, DrbdManage, Error, FlexProvisioner, ProvisionerConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// DRBD Flexvolume Provisioner - dynamic volumes on a DRBD Manage cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Provisioner name StorageClasses select (qualified name, e.g.
    /// external/drbd)
    #[arg(long, env = "PROVISIONER_NAME", default_value = "external/drbd")]
    provisioner: String,

    /// Flexvolume driver recorded on created volumes
    #[arg(long, env = "FLEX_DRIVER", default_value = "linbit/drbd-flexvolume")]
    driver: String,

    /// Default replica count when a StorageClass sets none
    #[arg(long, env = "DEFAULT_REDUNDANCY", default_value = "2")]
    redundancy: String,

    /// Default filesystem when a StorageClass sets none
    #[arg(long, env = "DEFAULT_FILESYSTEM", default_value = "ext4")]
    filesystem: String,

    /// Identity written onto created volumes; only volumes carrying it are
    /// reclaimed by this instance
    #[arg(long, env = "PROVISIONER_IDENTITY", default_value = "drbd-flex-provisioner")]
    identity: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    validate_provisioner_name(&args.provisioner)?;

    info!("Starting DRBD Flexvolume Provisioner");
    info!("  Version: {}", drbd_flex_provisioner::VERSION);
    info!("  Provisioner: {}", args.provisioner);
    info!("  Driver: {}", args.driver);
    info!("  Default redundancy: {}", args.redundancy);

    let config = ProvisionerConfig {
        name: args.provisioner,
        driver: args.driver,
        default_redundancy: args.redundancy,
        default_fs: args.filesystem,
        identity: args.identity,
    };

    let drbd = Arc::new(DrbdManage::new(DrbdConfig::default()));
    let provisioner = Arc::new(FlexProvisioner::new(config, drbd));

    let client = kube::Client::try_default().await?;
    let controller = Controller::new(client, provisioner);

    controller.run().await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

/// Check the provisioner name is a qualified name: an optional DNS-1123
/// domain prefix, a slash, and a non-empty path segment.
fn validate_provisioner_name(name: &str) -> Result<()> {
    let valid = match name.split_once('/') {
        Some((domain, path)) => {
            !domain.is_empty()
                && !path.is_empty()
                && domain
                    .split('.')
                    .all(|label| {
                        !label.is_empty()
                            && label
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '-')
                            && !label.starts_with('-')
                            && !label.ends_with('-')
                    })
        }
        None => !name.is_empty() && !name.contains('/'),
    };

    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid provisioner name {name:?}: expected a qualified name like external/drbd"
        )))
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
