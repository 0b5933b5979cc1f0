//! `pushbody run`: execute a scenario file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use pushbody_core::{format_transcript, Scenario, Transcript};
use tracing::info;

pub fn run(path: &str, format: &str, strict: bool) -> Result<()> {
    let transcript = run_scenario(Path::new(path))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&transcript)?);
        }
        "text" => {
            print!("{}", format_transcript(&transcript));
        }
        other => bail!("Unsupported output format: {other} (expected text or json)"),
    }

    if strict && !transcript.succeeded() {
        bail!("Scenario '{}' did not succeed", transcript.scenario);
    }

    Ok(())
}

/// Load and run a scenario, without printing.
pub fn run_scenario(path: &Path) -> Result<Transcript> {
    let scenario = Scenario::from_file(path)
        .with_context(|| format!("Failed to load scenario {}", path.display()))?;

    info!(scenario = %scenario.name, path = %path.display(), "running");

    let transcript = scenario
        .run()
        .with_context(|| format!("Failed to run scenario {}", scenario.name))?;
    Ok(transcript)
}
