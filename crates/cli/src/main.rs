/// Ignition CLI - inspects .ignb startup-program bundles.

use clap::Parser as ClapParser;
use ignition_recorder::bundle;
use std::fs;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(name = "ignition")]
#[command(about = "Ignition — startup-program bundle inspector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print the manifest and disassembly of an .ignb bundle
    Inspect {
        /// Path to the .ignb file
        file: PathBuf,
        /// Print only the manifest
        #[arg(long)]
        manifest: bool,
    },
    /// Show version information
    Version,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { file, manifest } => inspect(&file, manifest),
        Commands::Version => {
            println!("ignition {}", ignition_recorder::ENGINE_VERSION);
            Ok(())
        }
    }
}

fn inspect(file: &PathBuf, manifest_only: bool) -> Result<(), String> {
    let bytes = fs::read(file).map_err(|e| format!("cannot read {}: {}", file.display(), e))?;

    let manifest = bundle::read_manifest(&mut bytes.as_slice())
        .map_err(|e| format!("cannot read manifest: {}", e))?;
    println!("{}", serde_json::to_string_pretty(&manifest).map_err(|e| e.to_string())?);
    if manifest_only {
        return Ok(());
    }

    let program = bundle::read_bundle(&mut bytes.as_slice())
        .map_err(|e| format!("cannot read bundle: {}", e))?;
    log::debug!("loaded {} method(s)", program.methods.len());
    println!();
    print!("{}", program);
    Ok(())
}
