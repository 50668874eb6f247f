#![cfg(feature = "cli")]
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use prost::Message;
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use vinecdm::certificate::ServiceCertificate;
use vinecdm::codec;
use vinecdm::config::Config;
use vinecdm::device::Device;
use vinecdm::key::Key;
use vinecdm::pssh::Pssh;

const TEST_PSSH: &str = "AAAAW3Bzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAADsIARIQ62dqu8s0Xpa7z2FmMPGj2hoNd2lkZXZpbmVfdGVzdCIQZmtqM2xqYVNkZmFsa3IzaioCSEQyAA==";
const TEST_LICENSE_SERVER: &str = "https://cwip-shaka-proxy.appspot.com/no_auth";

#[derive(Parser)]
#[command(name = "vinecdm", version, about = "vinecdm CLI")]
struct Cli {
    /// Enable debug logging.
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue, global = true)]
    debug: bool,

    /// YAML config file.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a license and print its content keys.
    License {
        /// PSSH box or Widevine PSSH data, base64.
        pssh: String,
        /// License server URL.
        server: String,
        /// Device file or directory (overrides the config).
        #[arg(short = 'w', long = "device")]
        device: Option<PathBuf>,
        /// License type (STREAMING, OFFLINE, AUTOMATIC).
        #[arg(short = 't', long = "type")]
        license_type: Option<String>,
        /// Encrypt the client id to the server's service certificate.
        #[arg(short = 'p', long = "privacy", action = ArgAction::SetTrue)]
        privacy: bool,
    },
    /// Request a license for a public test asset.
    Test {
        #[arg(short = 'w', long = "device")]
        device: Option<PathBuf>,
        #[arg(short = 'p', long = "privacy", action = ArgAction::SetTrue)]
        privacy: bool,
    },
    /// Print what a PSSH says about its content.
    InspectPssh { pssh: String },
    /// Print device metadata and check its key pair.
    DeviceInfo { path: PathBuf },
    /// Pack a device directory into a single .wvd file.
    Pack {
        dir: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli
        .config
        .as_deref()
        .map(Config::from_path)
        .transpose()
        .context("Failed to load config")?;

    match cli.command {
        Commands::License {
            pssh,
            server,
            device,
            license_type,
            privacy,
        } => {
            let config = resolve_config(config, device, license_type, privacy)?;
            run_license(&config, &pssh, &server)
        }
        Commands::Test { device, privacy } => {
            let config = resolve_config(config, device, None, privacy)?;
            run_license(&config, TEST_PSSH, TEST_LICENSE_SERVER)
        }
        Commands::InspectPssh { pssh } => run_inspect_pssh(&pssh),
        Commands::DeviceInfo { path } => run_device_info(&path),
        Commands::Pack { dir, output } => run_pack(&dir, output.as_deref()),
    }
}

/// Merge command line flags over the config file.
fn resolve_config(
    config: Option<Config>,
    device: Option<PathBuf>,
    license_type: Option<String>,
    privacy: bool,
) -> anyhow::Result<Config> {
    let mut config = match (config, device) {
        (Some(mut config), Some(device)) => {
            config.device = device;
            config
        }
        (Some(config), None) => config,
        (None, Some(device)) => Config::for_device(device),
        (None, None) => anyhow::bail!("No device given; pass --device or --config"),
    };
    if let Some(license_type) = license_type {
        config.license_type = license_type;
    }
    config.privacy_mode |= privacy;
    Ok(config)
}

fn run_license(config: &Config, pssh: &str, server: &str) -> anyhow::Result<()> {
    let pssh: Pssh = pssh.parse().context("Failed to parse PSSH")?;
    let license_type = config.license_type()?;

    let cdm = config.build_cdm().context("Failed to load device")?;
    let device = cdm.device();
    info!(
        "[+] Loaded Device ({} {} L{})",
        device.system_id, device.device_type, device.security_level
    );

    if let Some(keys) = cdm.cached_keys(&pssh) {
        info!("[+] Found {} cached keys", keys.len());
        print_keys(&keys);
        return Ok(());
    }

    let client = reqwest::blocking::Client::new();

    let service_certificate = if config.privacy_mode {
        let cert = match config.service_certificate()? {
            Some(cert) => cert,
            None => fetch_service_certificate(&client, server)?,
        };
        info!(
            "[+] Set Service Privacy Certificate: {}",
            cert.provider_id().unwrap_or_default()
        );
        Some(cert)
    } else {
        None
    };

    let session = cdm.open(&pssh, service_certificate, license_type)?;
    info!("[+] Opened CDM Session: {}", hex::encode(session.id()));

    let challenge = cdm.get_license_challenge(session.id())?;
    info!("[+] Created License Request Message (Challenge)");

    let license = post(&client, server, challenge).context("Failed to send challenge")?;
    info!("[+] Got License Message");

    let result = cdm.parse_license(session.id(), &license);
    cdm.close(session.id())?;
    let keys = result?;
    info!("[+] License Parsed Successfully");

    print_keys(&keys);
    Ok(())
}

fn fetch_service_certificate(
    client: &reqwest::blocking::Client,
    server: &str,
) -> anyhow::Result<ServiceCertificate> {
    let response = post(client, server, codec::SERVICE_CERTIFICATE_CHALLENGE.to_vec())
        .context("Failed to request service certificate")?;
    Ok(ServiceCertificate::from_bytes(&response)?)
}

fn post(client: &reqwest::blocking::Client, url: &str, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let response = client.post(url).body(body).send()?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().unwrap_or_default();
        error!("[-] Server returned [{}] {}", status, text);
        anyhow::bail!("HTTP {}", status);
    }
    Ok(response.bytes()?.to_vec())
}

/// Keys go to stdout, one `kid:key` per line.
fn print_keys(keys: &[Key]) {
    for key in keys {
        if !key.exportable() {
            warn!("Key {} restricts output", key.kid.as_simple());
        }
        println!(
            "[{}] {}:{}",
            key.key_type.as_str_name(),
            key.kid.as_simple(),
            key.key_hex().as_str()
        );
    }
}

fn run_inspect_pssh(pssh: &str) -> anyhow::Result<()> {
    let pssh: Pssh = pssh.parse()?;
    let header = pssh.header();
    println!("version: {}", pssh.version);
    println!("algorithm: {}", header.algorithm);
    if let Some(provider) = header.provider.as_deref() {
        println!("provider: {}", provider);
    }
    if let Some(content_id) = header.content_id.as_deref() {
        println!("content_id: {}", hex::encode(content_id));
    }
    for kid in header.key_ids.iter() {
        println!("kid: {}", kid.as_simple());
    }
    Ok(())
}

#[derive(Serialize)]
struct DeviceMeta {
    device_type: String,
    security_level: u8,
    system_id: u32,
    flags: u8,
    send_key_control_nonce: bool,
    key_pair_ok: bool,
    has_vmp: bool,
    client_info: BTreeMap<String, String>,
}

fn run_device_info(path: &Path) -> anyhow::Result<()> {
    let device = Device::load(path).context("Failed to load device")?;
    let meta = DeviceMeta {
        device_type: device.device_type.to_string(),
        security_level: device.security_level,
        system_id: device.system_id,
        flags: device.flags,
        send_key_control_nonce: device.send_key_control_nonce(),
        key_pair_ok: device.verify_key_pair().is_ok(),
        has_vmp: device.vmp.is_some(),
        client_info: device
            .client_id
            .client_info
            .iter()
            .filter_map(|nv| Some((nv.name.clone()?, nv.value.clone().unwrap_or_default())))
            .collect(),
    };
    print!("{}", serde_yaml::to_string(&meta)?);
    Ok(())
}

fn run_pack(dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let device = Device::from_dir(dir).context("Failed to load device directory")?;
    device.verify_key_pair()?;

    let out_path = match output {
        Some(path) => path.to_path_buf(),
        None => dir.join(format!(
            "{}_{}_l{}.wvd",
            device.device_type, device.system_id, device.security_level
        )),
    };
    device.save(&out_path)?;

    info!("Packed Widevine Device (.wvd) file, {}", out_path.display());
    info!(" + Type: {}", device.device_type);
    info!(" + System ID: {}", device.system_id);
    info!(" + Security Level: {}", device.security_level);
    info!(" + Client ID: {} bytes", device.client_id.encode_to_vec().len());
    // Round trip the file so a bad pack is caught here rather than at use.
    let reloaded = Device::from_path(&out_path)?;
    anyhow::ensure!(reloaded == device, "Packed device does not reload identically");
    Ok(())
}
