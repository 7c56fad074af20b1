use crate::output::{print_json, print_table};
use pressdev_core::paths::Paths;
use pressdev_core::status::StatusBoard;

pub fn run(paths: &Paths, json: bool) -> anyhow::Result<()> {
    let entries = StatusBoard::read_file(&paths.status_file())?;

    if json {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!("No services have reported yet. Run `pressdev up` first.");
        return Ok(());
    }

    let rows = entries
        .into_iter()
        .map(|(service, entry)| {
            vec![
                service,
                entry.status.to_string(),
                entry.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                entry.message.unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["SERVICE", "STATUS", "UPDATED", "MESSAGE"], rows);
    Ok(())
}
