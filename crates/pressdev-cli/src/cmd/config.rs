use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use pressdev_core::config::{
    FolderRole, PreferenceSource, Preferences, SECTION_BASIC, SECTION_SITE, KEY_PORT,
};
use pressdev_core::paths::Paths;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show the current settings
    Show,

    /// Change a setting (primary-folder, secondary-folder or port)
    Set {
        /// Setting name, optionally qualified with its section (site.port)
        key: String,
        /// New value; an empty string clears a folder
        value: String,
    },
}

pub fn run(paths: &Paths, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(paths, json),
        ConfigSubcommand::Set { key, value } => set(paths, &key, &value, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(paths: &Paths, json: bool) -> anyhow::Result<()> {
    let prefs = Preferences::load(&paths.preferences_file())
        .with_context(|| format!("cannot read {}", paths.preferences_file().display()))?;
    let settings = prefs.snapshot();

    if json {
        return print_json(&settings);
    }

    let display = |p: Option<&Path>| p.map_or_else(|| "-".to_string(), |p| p.display().to_string());
    print_table(
        &["KEY", "VALUE"],
        vec![
            vec![
                FolderRole::Primary.as_str().to_string(),
                display(settings.folder(FolderRole::Primary)),
            ],
            vec![
                FolderRole::Secondary.as_str().to_string(),
                display(settings.folder(FolderRole::Secondary)),
            ],
            vec![
                KEY_PORT.to_string(),
                settings.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            ],
        ],
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// set
// ---------------------------------------------------------------------------

/// Map a user-facing key to its `(section, key)` pair.
fn locate(key: &str) -> anyhow::Result<(&'static str, &'static str)> {
    let bare = key
        .strip_prefix("basic.")
        .or_else(|| key.strip_prefix("site."))
        .unwrap_or(key);
    if let Some(role) = FolderRole::from_key(bare) {
        return Ok((SECTION_BASIC, role.as_str()));
    }
    if bare == KEY_PORT {
        return Ok((SECTION_SITE, KEY_PORT));
    }
    anyhow::bail!("unknown setting '{key}' (expected primary-folder, secondary-folder or port)")
}

fn set(paths: &Paths, key: &str, value: &str, json: bool) -> anyhow::Result<()> {
    let (section, name) = locate(key)?;

    let value = if section == SECTION_BASIC && !value.is_empty() {
        let folder = std::fs::canonicalize(value)
            .with_context(|| format!("folder '{value}' does not exist"))?;
        anyhow::ensure!(folder.is_dir(), "'{value}' is not a directory");
        folder.to_string_lossy().into_owned()
    } else {
        value.to_string()
    };

    paths.ensure()?;
    let prefs = Preferences::load(&paths.preferences_file())?;
    prefs.set_value(section, name, &value)?;

    if json {
        print_json(&serde_json::json!({ "key": name, "value": value }))?;
    } else {
        println!("{name} = {value}");
    }
    Ok(())
}
