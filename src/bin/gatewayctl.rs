//! gatewayctl: operator tool for the speech gateway.
//!
//! Usage:
//!   gatewayctl gen-key [--keyring]          Generate a master encryption key
//!   gatewayctl set-key <value>              Encrypt and store the provider key
//!   gatewayctl clear-key                    Delete the stored provider key
//!   gatewayctl check-key                    Report credential store status
//!   gatewayctl show-config                  Print effective config, secrets redacted
//!
//! Every command accepts `--config <path>`; `GATEWAY_*` variables apply on top.

use anyhow::{bail, Context};
use speech_gateway::credential::{store_in_keyring, MasterKey};
use speech_gateway::GatewayConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "gen-key" => cmd_gen_key(rest),
        "set-key" => cmd_set_key(rest).await,
        "clear-key" => cmd_clear_key(rest).await,
        "check-key" => cmd_check_key(rest).await,
        "show-config" => cmd_show_config(rest),
        "version" | "--version" | "-V" => {
            println!("gatewayctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"gatewayctl: speech gateway operator tool

USAGE:
    gatewayctl <COMMAND> [--config <path>]

COMMANDS:
    gen-key [--keyring]     Generate a master key (print it, or store it in the OS keyring)
    set-key <value>         Encrypt and store the upstream provider key
    clear-key               Delete the stored provider key
    check-key               Show whether a provider key is stored and decryptable
    show-config             Print the effective configuration with secrets redacted
    version                 Show version information
    help                    Show this help message

ENVIRONMENT:
    GATEWAY_ENCRYPTION_KEY  Base64 master key
    GATEWAY_CREDENTIAL_PATH Encrypted credential file
    RUST_LOG                Log filter (default: info)"#
    );
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn positional(args: &[String]) -> Option<&str> {
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if arg == "--config" {
            skip = true;
            continue;
        }
        if !arg.starts_with("--") {
            return Some(arg);
        }
    }
    None
}

fn load_config(args: &[String]) -> anyhow::Result<GatewayConfig> {
    let path = flag_value(args, "--config").map(PathBuf::from);
    let cfg = GatewayConfig::load(path.as_deref()).context("loading configuration")?;
    cfg.validate().context("validating configuration")?;
    Ok(cfg)
}

fn cmd_gen_key(args: &[String]) -> anyhow::Result<()> {
    let key = MasterKey::generate();
    if args.iter().any(|a| a == "--keyring") {
        store_in_keyring(&key).context("storing master key in OS keyring")?;
        println!("stored master key {} in OS keyring", key.key_id());
    } else {
        println!("{}", key.to_base64().as_str());
        eprintln!("key id: {}", key.key_id());
    }
    Ok(())
}

async fn cmd_set_key(args: &[String]) -> anyhow::Result<()> {
    let Some(value) = positional(args) else {
        bail!("set-key requires a value");
    };
    let cfg = load_config(args)?;
    if cfg.credential.store_path.is_none() {
        bail!("credential.store_path is not set; a stored key would not outlive this process");
    }
    let store = cfg.credential.open_store().await?;
    store.set_key(value.trim()).await?;
    let version = store.record().map(|r| r.version).unwrap_or_default();
    println!("provider key stored (version {version})");
    Ok(())
}

async fn cmd_clear_key(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let store = cfg.credential.open_store().await?;
    if store.clear_key().await? {
        println!("provider key cleared");
    } else {
        println!("no provider key stored");
    }
    Ok(())
}

async fn cmd_check_key(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let store = cfg.credential.open_store().await?;
    let status = store.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.stored && !status.decryptable {
        bail!("stored provider key cannot be decrypted with the current master key");
    }
    Ok(())
}

fn cmd_show_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    println!("{}", serde_json::to_string_pretty(&cfg.redacted()?)?);
    Ok(())
}
