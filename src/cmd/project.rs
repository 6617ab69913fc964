//! `fixloop init`.

use anyhow::Result;
use std::path::Path;

use fixloop::config::{CONFIG_FILE_NAME, FixloopConfig};

pub fn cmd_init(cwd: &Path, config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.join(CONFIG_FILE_NAME));

    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }

    FixloopConfig::default().save(&path)?;
    println!("Wrote {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add a .fixloop.yml to your workspace to set its check commands (optional)");
    println!("  2. fixloop create --title <title> --ticket <text> --workspace <dir>");
    println!("  3. fixloop run <id>");
    Ok(())
}
