// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! static-cloud-provider - operator tool for the static IP pool
//!
//! Inspects and edits the lease tracker ConfigMap the static cloud provider
//! allocates LoadBalancer addresses from, and serves its health checks.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use static_cloud_provider::config::StaticCloudConfig;
use static_cloud_provider::health::{HealthServer, LeaseStoreChecker};
use static_cloud_provider::lease::{request_key, LeasePort, Protocol};
use static_cloud_provider::store::ConfigMapStore;
use static_cloud_provider::{AddressRange, LeaseAllocator, LeaseRequest, LeaseStoreClient};

/// Static cloud provider
///
/// Hands out LoadBalancer addresses from a fixed IPv4 pool and tracks the
/// leases in a ConfigMap.
#[derive(Parser, Debug)]
#[command(name = "static-cloud-provider")]
#[command(author = "Kubernetes Authors")]
#[command(version)]
#[command(about = "Static IP pool load balancer for Kubernetes", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long, global = true)]
    master: Option<String>,

    /// Path to the cloud config file
    #[arg(short, long, global = true, default_value = "/etc/kubernetes/cloud-config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the cloud config and print the pool
    Validate,

    /// List all leases
    List,

    /// Show the lease of a service
    Get {
        /// Service namespace
        namespace: String,
        /// Service name
        name: String,
    },

    /// Lease an address to a service
    Ensure {
        /// Service namespace
        namespace: String,
        /// Service name
        name: String,
        /// Specific address to lease
        #[arg(long)]
        ip: Option<Ipv4Addr>,
        /// Exposed port, as PORT or PORT/PROTOCOL (repeatable)
        #[arg(long = "port", value_parser = parse_port)]
        ports: Vec<LeasePort>,
    },

    /// Release the address leased to a service
    Release {
        /// Service namespace
        namespace: String,
        /// Service name
        name: String,
    },

    /// Serve health checks until interrupted
    Serve {
        /// The address to serve health checks on
        #[arg(long, default_value = "0.0.0.0")]
        bind_address: String,

        /// Port for the health check server
        #[arg(long, default_value = "10258")]
        healthz_bind_port: u16,
    },
}

fn parse_port(s: &str) -> anyhow::Result<LeasePort> {
    let (port, protocol) = match s.split_once('/') {
        Some((port, protocol)) => (port, protocol.to_ascii_uppercase().parse::<Protocol>()),
        None => (s, Ok(Protocol::default())),
    };
    Ok(LeasePort {
        port: port
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid port {:?}: {}", port, e))?,
        protocol: protocol.map_err(|e| anyhow::anyhow!(e))?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(&args.config).await?;
    let range = config
        .validate()
        .with_context(|| format!("invalid cloud config: {:?}", args.config))?;

    if let Command::Validate = args.command {
        println!("pool {} ({} addresses)", range, range.len());
        println!(
            "tracker configmap {}/{}",
            config.static_cloud.ip_tracker_config_map_namespace,
            config.static_cloud.ip_tracker_config_map
        );
        return Ok(());
    }

    let client = create_client(&args).await?;
    let store = ConfigMapStore::new(
        client,
        config.static_cloud.ip_tracker_config_map_namespace.clone(),
        config.static_cloud.ip_tracker_config_map.clone(),
    );
    let store_client = LeaseStoreClient::new(store)
        .with_timeout(config.static_cloud.request_timeout)
        .with_retry_policy(config.retry_policy());

    if let Err(e) = run(args.command, range, store_client).await {
        error!("command failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(
    command: Command,
    range: AddressRange,
    client: LeaseStoreClient<ConfigMapStore>,
) -> anyhow::Result<()> {
    match command {
        Command::Validate => Ok(()),
        Command::List => {
            let allocator = LeaseAllocator::new(range, client);
            for lease in allocator.list().await? {
                let ports: Vec<String> = lease
                    .ports
                    .iter()
                    .map(|p| format!("{}/{}", p.port, p.protocol))
                    .collect();
                println!("{}\t{}\t{}", lease.key(), lease.address, ports.join(","));
            }
            Ok(())
        }
        Command::Get { namespace, name } => {
            let allocator = LeaseAllocator::new(range, client);
            let key = request_key(&namespace, &name);
            match allocator.get(&key).await? {
                Some(lease) => println!("{}", serde_json::to_string_pretty(&lease.to_status())?),
                None => anyhow::bail!("no lease held by {}", key),
            }
            Ok(())
        }
        Command::Ensure {
            namespace,
            name,
            ip,
            ports,
        } => {
            let allocator = LeaseAllocator::new(range, client);
            let request = LeaseRequest::new(namespace, name)
                .with_ports(ports)
                .with_requested_address(ip);
            let status = allocator.ensure(&request).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Release { namespace, name } => {
            let allocator = LeaseAllocator::new(range, client);
            allocator.release(&request_key(&namespace, &name)).await?;
            Ok(())
        }
        Command::Serve {
            bind_address,
            healthz_bind_port,
        } => {
            let server = HealthServer::new(bind_address, healthz_bind_port);
            server
                .registry()
                .register(Arc::new(LeaseStoreChecker::new(client)))
                .await;

            let shutdown_token = CancellationToken::new();
            tokio::spawn({
                let shutdown_token = shutdown_token.clone();
                async move {
                    wait_for_shutdown().await;
                    shutdown_token.cancel();
                }
            });

            server.run(shutdown_token).await?;
            info!("static-cloud-provider exited successfully");
            Ok(())
        }
    }
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the cloud config file.
async fn load_config(path: &Path) -> anyhow::Result<StaticCloudConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file: {:?}", path))?;

    StaticCloudConfig::from_yaml(&content)
        .with_context(|| format!("failed to parse config file: {:?}", path))
}

/// Creates a Kubernetes client from the command-line arguments.
async fn create_client(args: &Args) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &args.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &args.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let (mut sigterm, mut sigint) = match (
            signal::unix::signal(signal::unix::SignalKind::terminate()),
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("received Ctrl+C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("80").unwrap(), LeasePort { port: 80, protocol: Protocol::Tcp });
        assert_eq!(parse_port("53/udp").unwrap(), LeasePort { port: 53, protocol: Protocol::Udp });
        assert!(parse_port("http").is_err());
        assert!(parse_port("80/ICMP").is_err());
    }

    #[test]
    fn test_cli_parses_ensure() {
        let args = Args::try_parse_from([
            "static-cloud-provider",
            "--config",
            "cloud.yaml",
            "ensure",
            "default",
            "web",
            "--ip",
            "10.0.0.7",
            "--port",
            "443",
        ])
        .unwrap();
        match args.command {
            Command::Ensure { namespace, name, ip, ports } => {
                assert_eq!(namespace, "default");
                assert_eq!(name, "web");
                assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
                assert_eq!(ports.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
