//! Writes the OpenAPI specification to `openapi.json` in the workspace root.
//!
//! Run with: cargo run --bin gen-openapi -p xhale-server

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

fn main() -> anyhow::Result<()> {
    println!("Generating OpenAPI specification...\n");

    let json = xhale_server::api::get_openapi_json().context("serializing OpenAPI document")?;

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .context("could not find workspace root")?;
    let output_path = workspace_root.join("openapi.json");

    fs::write(&output_path, &json)
        .with_context(|| format!("writing {}", output_path.display()))?;
    println!("Written to: {}", output_path.display());

    if let Ok(spec) = serde_json::from_str::<serde_json::Value>(&json) {
        if let Some(paths) = spec.get("paths").and_then(|p| p.as_object()) {
            println!("Paths: {}", paths.len());
        }
        if let Some(schemas) = spec
            .pointer("/components/schemas")
            .and_then(|s| s.as_object())
        {
            println!("Schemas: {}", schemas.len());
        }
    }

    Ok(())
}
