//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::cli::output;
use crate::config::{Config, ConfigManager};
use crate::error::MkimageResult;

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> MkimageResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => show_path(manager),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> MkimageResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn show_path(manager: &ConfigManager) {
    println!("{}", manager.path().display());
}

async fn init_config(manager: &ConfigManager, force: bool) -> MkimageResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        output::step_warn_hint(
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    let config = Config::default();
    manager.save(&config).await?;

    output::step_ok_detail("Configuration initialized", &path.display().to_string());
    Ok(())
}
