// File:    main.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Command line front end for OTP image management and a loopback tunnel benchmark.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! `otpbox` command line tool.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};
use otpbox_core::crypto::to_hex;
use otpbox_core::image::{OtpImage, create_image};
use otpbox_core::position::load_position;
use otpbox_core::{Config, Error, Result};
use sha2::{Digest, Sha256};

mod bench;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the JSON configuration file
    #[arg(short, long, default_value = "otpbox.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the OTP image
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Push data packages through two processors sharing the image
    Bench {
        /// Number of data packages to send
        #[arg(short, long, default_value_t = 1000)]
        packages: usize,

        /// Payload size of each package in bytes
        #[arg(short, long, default_value_t = 1400)]
        size: usize,

        /// Bind a fresh key to every n-th package
        #[arg(short, long, default_value_t = 16)]
        key_every: usize,
    },
}

#[derive(Subcommand)]
enum ImageAction {
    /// Create a new image of random bytes
    Create {
        /// The size of the image in megabytes (MB)
        #[arg(short, long, default_value_t = 64)]
        size: u32,

        /// Where to write the image instead of the configured path
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Show size, fingerprint and saved position of an image
    Info {
        /// Image to inspect instead of the configured one
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        info!("No configuration at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

fn fingerprint(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn image_info(config: &Config, path: &Path) -> Result<()> {
    let image = OtpImage::open(path)?;
    let clusters = image.size_in_clusters();
    println!("Image:        {}", image.path().display());
    println!("Clusters:     {clusters}");
    println!("Size:         {} MiB", clusters * 4096 / (1024 * 1024));
    println!("SHA-256:      {}", fingerprint(path)?);
    match load_position(&config.otp_position_path)? {
        Some(position) if position.image_clusters == clusters => {
            println!("Out position: {}", position.out_ordinal);
            println!("In position:  {}", position.in_ordinal);
            println!("Rewinds:      {}", position.out_rewinds());
        }
        Some(_) => println!("Saved position belongs to another image"),
        None => println!("No saved position"),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Image { action } => {
            let config = load_config(&cli.config)?;
            match action {
                ImageAction::Create { size, path } => {
                    let path = path.unwrap_or(config.otp_image_path);
                    info!("Creating OTP image at '{}' with size {size} MB.", path.display());
                    let clusters = create_image(&path, size)?;
                    println!("{clusters}");
                }
                ImageAction::Info { path } => {
                    let path = path.unwrap_or_else(|| config.otp_image_path.clone());
                    image_info(&config, &path)?;
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if cli.config.exists() && !force {
                    return Err(Error::Config(format!(
                        "{} already exists, use --force to overwrite",
                        cli.config.display()
                    )));
                }
                Config::default().save(&cli.config)?;
                info!("Wrote default configuration to {}", cli.config.display());
            }
            ConfigAction::Show => {
                let config = load_config(&cli.config)?;
                let text = serde_json::to_string_pretty(&config)
                    .map_err(|e| Error::Config(e.to_string()))?;
                println!("{text}");
            }
        },
        Commands::Bench {
            packages,
            size,
            key_every,
        } => {
            let config = load_config(&cli.config)?;
            let report = bench::run(config, packages, size, key_every)?;
            println!("{report}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
