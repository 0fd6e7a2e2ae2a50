use std::path::{Path, PathBuf};

use tether_settings::{ConfigLoader, TetherConfig};

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(args: ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => init(global, &cwd),
        ConfigSubcommand::Show { format } => show(format, &cwd),
        ConfigSubcommand::Edit { global } => edit(global, &cwd),
    }
}

fn config_path(global: bool, cwd: &Path) -> Result<PathBuf, CliError> {
    if global {
        ConfigLoader::global_config_path().ok_or_else(|| {
            CliError::Other(
                "Cannot determine global config path: home directory not available".to_string(),
            )
        })
    } else {
        Ok(ConfigLoader::project_config_path(cwd))
    }
}

fn init(global: bool, cwd: &Path) -> Result<(), CliError> {
    let path = config_path(global, cwd)?;
    if path.exists() {
        return Err(CliError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }

    TetherConfig::starter().save(&path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(format: OutputFormat, cwd: &Path) -> Result<(), CliError> {
    let config = ConfigLoader::load(cwd)?;
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}

fn edit(global: bool, cwd: &Path) -> Result<(), CliError> {
    let path = config_path(global, cwd)?;

    // $VISUAL, then $EDITOR, then vi.
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let status = std::process::Command::new(&editor).arg(&path).status()?;
    if !status.success() {
        return Err(CliError::Other(format!("{editor} exited with {status}")));
    }
    Ok(())
}
