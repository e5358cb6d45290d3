use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dialoguer::{Confirm, Input};
use strata_config::{AppConfig, ConfigLoader, DatabaseConfig, MigrationConfig};
use tracing::info;

/// Run the interactive setup wizard. Writes the config file at `config_path` and
/// creates the migration folder next to it.
pub fn run_wizard(config_path: &Path) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("Create {} by hand, for example:", config_path.display());
        println!("---");
        print!("{}", example_toml());
        println!("---");
        println!("Then point --config or STRATA_CONFIG at it.");
        return Ok(());
    }

    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} exists. Overwrite it?", config_path.display()))
            .default(false)
            .interact()
            .context("overwrite prompt cancelled")?;
        if !overwrite {
            bail!("left {} unchanged", config_path.display());
        }
    }

    println!();
    println!("  strata setup");
    println!("  ------------");
    println!();

    let database: String = Input::new()
        .with_prompt("SQLite database file")
        .default("app.db".to_string())
        .interact_text()
        .context("database input cancelled")?;

    let folder: String = Input::new()
        .with_prompt("Migration folder")
        .default("migrations".to_string())
        .interact_text()
        .context("folder input cancelled")?;

    let table: String = Input::new()
        .with_prompt("Tracking table name")
        .default("migration".to_string())
        .interact_text()
        .context("table input cancelled")?;

    let config = AppConfig {
        database: DatabaseConfig {
            path: PathBuf::from(database.trim()),
        },
        migration: MigrationConfig {
            folder: PathBuf::from(folder.trim()),
            table: table.trim().to_string(),
            ..Default::default()
        },
    };
    config.validate()?;

    ConfigLoader::write(config_path, &config)?;

    let mut resolved = config.clone();
    resolved.resolve_paths(config_path.parent().unwrap_or(Path::new(".")));
    std::fs::create_dir_all(&resolved.migration.folder).with_context(|| {
        format!("failed to create {}", resolved.migration.folder.display())
    })?;

    info!("config written to {}", config_path.display());
    println!();
    println!("  Config written to {}", config_path.display());
    println!("  Migrations go in {}", resolved.migration.folder.display());
    println!("  Run `strata make <description>` to add the first one.");
    println!();

    Ok(())
}

fn example_toml() -> &'static str {
    "[database]\n\
     path = \"app.db\"\n\
     \n\
     [migration]\n\
     folder = \"migrations\"\n\
     table = \"migration\"\n\
     extension = \"sql\"\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, example_toml()).unwrap();

        let config = ConfigLoader::parse(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.migration.table, "migration");
    }
}
