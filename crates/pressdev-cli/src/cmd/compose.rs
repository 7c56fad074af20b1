use pressdev_core::config::{FolderRole, PreferenceSource, Preferences};
use pressdev_core::paths::Paths;
use pressdev_core::services::compose;

/// Print the docker-compose document `up` would write for the current settings.
pub fn run(paths: &Paths) -> anyhow::Result<()> {
    let settings = Preferences::load(&paths.preferences_file())?.snapshot();
    let folder = settings.folder(FolderRole::Primary).ok_or_else(|| {
        anyhow::anyhow!("primary-folder is not set (run `pressdev config set primary-folder <dir>`)")
    })?;
    let port = settings
        .port
        .ok_or_else(|| anyhow::anyhow!("port is not set"))?;

    print!("{}", compose::render(folder, port).to_yaml()?);
    Ok(())
}
