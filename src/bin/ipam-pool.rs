//! ipam-pool CNI plugin binary
//!
//! Invoked by the container runtime once per network attachment event.
//! The runtime passes the command and container through the CNI
//! environment and the network configuration on stdin.
//!
//! # Examples
//!
//! ```bash
//! # Allocate
//! CNI_COMMAND=ADD CNI_CONTAINERID=abc123 \
//!   CNI_ARGS="K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0" \
//!   ipam-pool < /etc/cni/net.d/10-macvlan.conf
//!
//! # Release
//! CNI_COMMAND=DEL CNI_CONTAINERID=abc123 ipam-pool < /etc/cni/net.d/10-macvlan.conf
//! ```

use anyhow::Context;
use clap::Parser;
use ipam_pool::error::Error;
use ipam_pool::{IpamConfig, IpamManager, Mode};
use ipnet::IpNet;
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// ipam-pool - IP address management for container networks
#[derive(Parser, Debug)]
#[command(name = "ipam-pool")]
#[command(version = ipam_pool::VERSION)]
#[command(about = "IP address management for container network attachments", long_about = None)]
struct Cli {
    /// CNI command (ADD, DEL, CHECK, VERSION)
    #[arg(long, env = "CNI_COMMAND")]
    command: String,

    /// Container the attachment belongs to
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    /// Extra CNI arguments, `KEY=VALUE;KEY=VALUE`
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    cni_args: String,

    /// Flat-file overlay when the network configuration names none
    #[arg(long, env = "IPAM_POOL_CONFIG")]
    overlay: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.command == "VERSION" {
        println!(
            "{}",
            json!({ "cniVersion": "1.0.0", "supportedVersions": SUPPORTED_VERSIONS })
        );
        return Ok(());
    }

    let mut netconf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut netconf)
        .context("reading network configuration from stdin")?;

    let (config, cni_version) = match IpamConfig::load(&netconf, cli.overlay.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            print_error("0.3.1", 7, &e.to_string());
            return Err(e.into());
        }
    };

    setup_logging(&config, cli.no_color)?;

    match run(&cli, config, &cni_version).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "ipam-pool {} failed", cli.command);
            print_error(&cni_version, 11, &format!("{:#}", e));
            Err(e)
        }
    }
}

async fn run(cli: &Cli, config: IpamConfig, cni_version: &str) -> anyhow::Result<()> {
    if cli.command == "CHECK" {
        debug!("CHECK is a no-op");
        return Ok(());
    }

    let mode: Mode = cli.command.parse()?;
    let pod_ref = pod_ref(&cli.cni_args);
    let gateway = config.range.gateway;

    let ipam = IpamManager::new(config);
    let result = ipam
        .manage(mode, &cli.container_id, &pod_ref, &CancellationToken::new())
        .await;
    let address = settle(mode, result)
        .with_context(|| format!("{} for container {}", mode, cli.container_id))?;

    if let Some(address) = address {
        let mut ip = json!({
            "version": if address.addr().is_ipv4() { "4" } else { "6" },
            "address": address.to_string(),
        });
        if let Some(gateway) = gateway {
            ip["gateway"] = json!(gateway.to_string());
        }
        println!("{}", json!({ "cniVersion": cni_version, "ips": [ip] }));
    }

    Ok(())
}

/// A DEL whose reservation is already gone succeeds with nothing released
fn settle(
    mode: Mode,
    result: ipam_pool::error::Result<Option<IpNet>>,
) -> ipam_pool::error::Result<Option<IpNet>> {
    match result {
        Err(e @ Error::NotFound { .. }) if mode == Mode::Deallocate => {
            warn!(error = %e, "Nothing to release");
            Ok(None)
        }
        other => other,
    }
}

/// `namespace/name` from `K8S_POD_NAMESPACE` and `K8S_POD_NAME`
fn pod_ref(cni_args: &str) -> String {
    let mut namespace = "";
    let mut name = "";
    for pair in cni_args.split(';') {
        match pair.split_once('=') {
            Some(("K8S_POD_NAMESPACE", value)) => namespace = value,
            Some(("K8S_POD_NAME", value)) => name = value,
            _ => {}
        }
    }
    if namespace.is_empty() && name.is_empty() {
        String::new()
    } else {
        format!("{}/{}", namespace, name)
    }
}

fn print_error(cni_version: &str, code: u32, message: &str) {
    println!(
        "{}",
        json!({ "cniVersion": cni_version, "code": code, "msg": message })
    );
}

/// Setup logging to stderr and, when configured, a log file
///
/// stdout carries the CNI result, so nothing is logged there.
fn setup_logging(config: &IpamConfig, no_color: bool) -> anyhow::Result<()> {
    let log_level = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let file_layer = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}
