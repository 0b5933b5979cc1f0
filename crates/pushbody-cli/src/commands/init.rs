//! `pushbody init`: scaffold a scenario file.

use std::path::Path;

use anyhow::{bail, Result};
use pushbody_core::Scenario;

pub fn init(path: &str, name: &str) -> Result<()> {
    let output = Path::new(path);
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let scenario = Scenario::scaffold(name);
    std::fs::write(output, scenario.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());

    Ok(())
}
