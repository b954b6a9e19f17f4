//! Prints the server's OpenAPI document as pretty JSON, or writes it to the
//! path given as the only argument:
//!
//!   generate_openapi                 # stdout
//!   generate_openapi docs/api.json   # file

use std::{env, fs, path::PathBuf};

use anyhow::{Context, Result};
use aquarium_monitor::api::handlers::ApiDoc;
use utoipa::OpenApi;

fn render() -> Result<String> {
    ApiDoc::openapi()
        .to_pretty_json()
        .context("Failed to serialise OpenAPI document")
}

fn main() -> Result<()> {
    let json = render()?;

    match env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            fs::write(&path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("OpenAPI document written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
