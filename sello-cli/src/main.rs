use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sello_core::certificate::SigningCertificate;
use sello_core::config::SigningConfig;
use sello_core::document::DocumentKind;
use sello_core::engine::{SealEngine, SealOutcome, SealRequest};
use sello_core::key::{decode_private_key, KeyEnvelope, KeySource, KeyStructure};
use sello_core::material::SigningMaterial;

const EXIT_UNSIGNED: u8 = 2;

/// Seal CFDI documents and inspect signing material.
#[derive(Parser, Debug)]
#[command(name = "sello", version, about, long_about = None)]
struct Cli {
    /// Repeat for more output (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Normalize, canonicalize and sign a document.
    Sign {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        document: PathBuf,
        #[arg(long, default_value = "invoice")]
        kind: DocumentKind,
        /// Write the result here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Pass the document through unsigned.
        #[arg(long)]
        disabled: bool,
    },
    /// Print the canonical string that would be signed.
    Canonicalize {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        document: PathBuf,
        #[arg(long, default_value = "invoice")]
        kind: DocumentKind,
    },
    /// Report how a private key file was recognised.
    InspectKey {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Report serial, owner and validity of a certificate.
    InspectCert {
        #[arg(long)]
        cert: PathBuf,
    },
    /// Check that a key and certificate belong together.
    CheckPair {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        cert: PathBuf,
    },
}

#[derive(Serialize)]
struct KeyReport {
    envelope: KeyEnvelope,
    structure: KeyStructure,
    modulus_bits: usize,
}

#[derive(Serialize)]
struct CertReport {
    serial: String,
    identity: Option<String>,
    subject: String,
    issuer: String,
    not_before: String,
    not_after: String,
    valid_now: bool,
}

#[derive(Serialize)]
struct PairReport {
    matches: bool,
    serial: Option<String>,
    error: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(command: Commands) -> Result<u8> {
    match command {
        Commands::Sign {
            config,
            document,
            kind,
            output,
            disabled,
        } => sign(&config, &document, kind, output.as_deref(), disabled),
        Commands::Canonicalize {
            config,
            document,
            kind,
        } => {
            let (engine, _) = engine_from(&config)?;
            let xml = read_text(&document)?;
            let canonical = engine.canonical_string(&xml, kind)?;
            println!("{canonical}");
            Ok(0)
        }
        Commands::InspectKey { key, password } => {
            let bytes = fs::read(&key).with_context(|| format!("reading {}", key.display()))?;
            let decoded = decode_private_key(
                &KeySource::new(&bytes)
                    .with_password(password.as_deref())
                    .with_file_name(file_name(&key)),
            )?;
            print_json(&KeyReport {
                envelope: decoded.envelope(),
                structure: decoded.structure(),
                modulus_bits: decoded.modulus_bits(),
            })?;
            Ok(0)
        }
        Commands::InspectCert { cert } => {
            let bytes = fs::read(&cert).with_context(|| format!("reading {}", cert.display()))?;
            let certificate = SigningCertificate::from_bytes(&bytes)?;
            print_json(&CertReport {
                serial: certificate.serial(),
                identity: certificate.subject_identity(),
                subject: certificate.subject(),
                issuer: certificate.issuer(),
                not_before: certificate.not_before().to_rfc3339(),
                not_after: certificate.not_after().to_rfc3339(),
                valid_now: certificate.is_valid_at(Utc::now()),
            })?;
            Ok(0)
        }
        Commands::CheckPair {
            key,
            password,
            cert,
        } => {
            let report = match SigningMaterial::load_files(&key, password.as_deref(), &cert) {
                Ok(material) => PairReport {
                    matches: true,
                    serial: Some(material.certificate_serial().to_string()),
                    error: None,
                },
                Err(e) => PairReport {
                    matches: false,
                    serial: None,
                    error: Some(e.to_string()),
                },
            };
            print_json(&report)?;
            Ok(if report.matches { 0 } else { 1 })
        }
    }
}

fn sign(
    config: &Path,
    document: &Path,
    kind: DocumentKind,
    output: Option<&Path>,
    disabled: bool,
) -> Result<u8> {
    let (engine, config) = engine_from(config)?;
    let xml = read_text(document)?;
    let request =
        SealRequest::new(&xml, kind).with_signing_enabled(config.signing_enabled && !disabled);

    let outcome = engine.seal(&request);
    let code = match &outcome {
        SealOutcome::Signed(signed) => {
            tracing::info!(serial = %signed.serial, "signed");
            0
        }
        SealOutcome::Disabled { .. } => {
            eprintln!("signing disabled; document returned unchanged");
            0
        }
        SealOutcome::Unsigned { reason, .. } => {
            eprintln!("document left unsigned: {reason}");
            EXIT_UNSIGNED
        }
    };

    match output {
        Some(path) => fs::write(path, outcome.document())
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", outcome.document()),
    }
    Ok(code)
}

fn engine_from(path: &Path) -> Result<(SealEngine, SigningConfig)> {
    let config = SigningConfig::from_properties_file(path)?;
    let engine = SealEngine::from_config(&config);
    Ok((engine, config))
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
