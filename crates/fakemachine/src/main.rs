//! Command-line front-end for fakemachine.

use std::collections::BTreeMap;
use std::env;

use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Report, Result};
use fakemachine::Machine;
use tracing::warn;

/// Run a command in a transient virtual machine that mirrors the host.
#[derive(Parser)]
#[command(name = "fakemachine", version)]
struct Cli {
    /// Virtualisation backend to use
    #[clap(
        short = 'b',
        long,
        default_value = "auto",
        value_parser = clap::builder::PossibleValuesParser::new(fakemachine::backend_names())
    )]
    backend: String,

    /// Host directory to mount in the machine, as DIR or DIR:PATH
    #[clap(short = 'v', long = "volume", value_name = "DIR[:PATH]")]
    volumes: Vec<String>,

    /// Disk image to expose, as PATH (pre-existing) or PATH:SIZE (created)
    #[clap(short = 'i', long = "image", value_name = "PATH[:SIZE]")]
    images: Vec<String>,

    /// Environment variable for the command; an empty value unsets
    #[clap(short = 'e', long = "environ-var", value_name = "KEY=VALUE")]
    environ: Vec<String>,

    /// Amount of memory for the machine in megabytes
    #[clap(short = 'm', long)]
    memory: Option<u32>,

    /// Number of CPUs for the machine
    #[clap(short = 'c', long)]
    cpus: Option<u32>,

    /// Override the image sector size
    #[clap(short = 'S', long)]
    sectorsize: Option<u32>,

    /// On-disk scratch space size with a unit suffix (e.g. 4G); if unset,
    /// memory backed scratch space is used
    #[clap(short = 's', long)]
    scratchsize: Option<String>,

    /// Show boot/console messages from the machine
    #[clap(long)]
    show_boot: bool,

    /// Only print the command's own output
    #[clap(short = 'q', long)]
    quiet: bool,

    /// The command to run inside the machine
    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

/// Install the tracing/logging stack: environment-based filtering with
/// console output on stderr. RUST_LOG overrides; --quiet drops everything
/// below errors so only the guest command's output remains.
fn install_tracing(quiet: bool) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let default_filter = if quiet { "error" } else { "info" };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Parse a size with an optional binary unit suffix ("512", "4G") to bytes.
fn parse_size(size: &str) -> Result<i64> {
    const UNITS: [(char, i64); 4] = [
        ('K', 1 << 10),
        ('M', 1 << 20),
        ('G', 1 << 30),
        ('T', 1 << 40),
    ];

    let size = size.trim().to_uppercase();
    if size.is_empty() {
        return Err(eyre!("size cannot be empty"));
    }

    let stripped = size.strip_suffix('B').unwrap_or(&size);
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|&(suffix, multiplier)| {
            stripped.strip_suffix(suffix).map(|num| (num, multiplier))
        })
        .unwrap_or((stripped, 1));

    let number: i64 = number
        .trim()
        .parse()
        .map_err(|_| eyre!("invalid number in size '{size}'"))?;
    Ok(number * multiplier)
}

fn setup_volumes(m: &mut Machine, volumes: &[String]) -> Result<()> {
    for spec in volumes {
        match spec.split(':').collect::<Vec<_>>().as_slice() {
            [dir] => m.add_volume(*dir),
            [host, guest] => m.add_volume_at(*host, *guest),
            _ => return Err(eyre!("failed to parse volume: {spec}")),
        }
    }
    Ok(())
}

fn setup_images(m: &mut Machine, images: &[String], quiet: bool) -> Result<()> {
    for spec in images {
        let (path, device) = match spec.split(':').collect::<Vec<_>>().as_slice() {
            [path] => (*path, m.create_image(*path, -1)),
            [path, size] => (*path, m.create_image(*path, parse_size(size)?)),
            _ => return Err(eyre!("failed to parse image: {spec}")),
        };
        let device = device.with_context(|| format!("failed to create image {path}"))?;
        if !quiet {
            println!("Exposing {path} as {device}");
        }
    }
    Ok(())
}

/// Environment variables propagated from the host when set, in both lower
/// and upper case. The command line can add to or override these.
const PROXY_VARIABLES: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "rsync_proxy",
    "all_proxy",
    "no_proxy",
];

fn references_localhost(value: &str) -> bool {
    ["localhost", "127.0.0.1", "::1"]
        .iter()
        .any(|needle| value.contains(needle))
}

fn build_environ(overrides: &[String]) -> Result<Vec<String>> {
    let mut vars = BTreeMap::new();

    for name in PROXY_VARIABLES {
        for variant in [name.to_lowercase(), name.to_uppercase()] {
            match env::var(&variant) {
                Ok(value) if !value.is_empty() => {
                    vars.insert(variant, value);
                }
                _ => {}
            }
        }
    }

    for spec in overrides {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| eyre!("failed to parse environment variable: {spec}"))?;
        if value.is_empty() {
            vars.remove(key);
        } else {
            vars.insert(key.to_string(), value.to_string());
        }
    }

    for (key, value) in &vars {
        if references_localhost(value) {
            warn!(
                "environment variable {key} contains a reference to localhost, \
                 which may not resolve from inside the machine"
            );
        }
    }

    Ok(vars
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect())
}

fn main() -> Result<(), Report> {
    let cli = Cli::parse();
    install_tracing(cli.quiet);
    color_eyre::install()?;

    let mut m = Machine::with_backend(&cli.backend)?;
    m.set_show_boot(cli.show_boot);
    setup_volumes(&mut m, &cli.volumes)?;
    setup_images(&mut m, &cli.images, cli.quiet)?;
    m.set_environ(build_environ(&cli.environ)?);

    if let Some(size) = &cli.scratchsize {
        let size = parse_size(size).context("couldn't parse scratch size")?;
        if size <= 0 {
            return Err(eyre!("scratch size must be positive"));
        }
        m.set_scratch(size as u64, "");
    }
    if let Some(memory) = cli.memory {
        m.set_memory(memory);
    }
    if let Some(cpus) = cli.cpus {
        m.set_num_cpus(cpus);
    }
    if let Some(sector_size) = cli.sectorsize {
        m.set_sector_size(sector_size);
    }

    let command = if cli.command.is_empty() {
        "/bin/bash".to_string()
    } else {
        cli.command.join(" ")
    };

    let exit_code = m.run(&command)?;
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_unit_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("1GB").unwrap(), 1 << 30);
        assert_eq!(parse_size(" 3T ").unwrap(), 3 << 40);
    }

    #[test]
    fn bad_sizes_are_rejected() {
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("4G4").is_err());
    }

    #[test]
    fn localhost_detection() {
        assert!(references_localhost("http://localhost:3142"));
        assert!(references_localhost("http://127.0.0.1/apt"));
        assert!(references_localhost("http://[::1]:8080"));
        assert!(!references_localhost("http://proxy.example.com"));
    }
}
