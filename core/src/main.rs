use anyhow::Result;
use certprov::config::{Cli, Command, ResolvedConfig};
use certprov::{HttpSigningClient, ProvisionOutcome, Provisioner};
use clap::error::ErrorKind;
use std::process::ExitCode;
use std::sync::Arc;
use tls::fingerprint_hex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utilities::{init_logging, log_startup_error, RealFileSystem};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = e.print();
                    ExitCode::SUCCESS
                }
                _ => {
                    log_startup_error(e.render().to_string().trim_end());
                    ExitCode::from(2)
                }
            };
        }
    };

    let resolved = match start(&cli) {
        Ok(resolved) => resolved,
        Err(e) => {
            log_startup_error(&format!("{e:#}"));
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command(), resolved).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Validate arguments and configuration, then switch to the configured log file.
fn start(cli: &Cli) -> Result<ResolvedConfig> {
    let resolved = cli.resolve()?;
    init_logging(
        &resolved.config.log_path_under(&resolved.base_directory),
        &RealFileSystem,
    )?;
    Ok(resolved)
}

async fn run(command: Command, resolved: ResolvedConfig) -> Result<()> {
    let fs = Arc::new(RealFileSystem);
    let client = Arc::new(HttpSigningClient::new(&resolved.config.signing_authority_url)?);
    let provisioner = Provisioner::new(&resolved.config, resolved.paths.clone(), fs, client);

    match command {
        Command::Provision => provision(&provisioner, &resolved).await,
        Command::Status => {
            println!("{}", provisioner.status()?);
            Ok(())
        }
        Command::Fingerprints => print_fingerprints(&provisioner),
    }
}

async fn provision(provisioner: &Provisioner, resolved: &ResolvedConfig) -> Result<()> {
    info!(
        base = %resolved.base_directory.display(),
        authority = %resolved.config.signing_authority_url,
        "Starting certificate provisioning"
    );

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping");
            on_signal.cancel();
        }
    });

    match provisioner.run(&token).await? {
        ProvisionOutcome::AlreadyInstalled => println!("Node identity already installed"),
        ProvisionOutcome::TrustAnchorRepaired => {
            println!("Node identity already installed; trust anchor restored")
        }
        ProvisionOutcome::Installed {
            request_id,
            leaf_fingerprint,
        } => println!("Installed certificate for request {request_id} ({leaf_fingerprint})"),
    }

    provisioner.tls_components()?;
    info!("Installed identity loads into TLS configuration");
    Ok(())
}

fn print_fingerprints(provisioner: &Provisioner) -> Result<()> {
    let (chain, anchors) = provisioner.installed_certificates()?;
    match chain {
        Some(chain) => {
            println!("Identity chain ({}):", chain.len());
            for (i, cert) in chain.certificates().iter().enumerate() {
                println!("  [{i}] {}", fingerprint_hex(cert));
            }
        }
        None => println!("No identity installed"),
    }
    println!("Trust anchors ({}):", anchors.len());
    for (alias, cert) in anchors {
        println!("  {alias}: {}", fingerprint_hex(&cert));
    }
    Ok(())
}
