//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::path::PathBuf;
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Create a prompt set under `<temp_dir>/prompts/`.
///
/// - `character.toml` uses a file-backed hair color list (`lists/colors.list`) and a
///   `<lora>` section.
/// - `scene.yaml` is a YAML document with weights and a deferred `_post` branch.
/// - `lists/colors.list` is a variable file with comment and blank lines.
/// - `notes.md` is not a prompt file.
#[allow(dead_code)]
pub fn create_prompt_set(temp_dir: &TempDir) -> PathBuf {
    let prompts = temp_dir.path().join("prompts");
    std::fs::create_dir_all(prompts.join("lists")).unwrap();

    let character = r#"
_exports = { model = "base-v1" }

[character]
_t = "portrait, $hair hair, %outfit.?"
_exports = { subject = "person" }

[character.hair]
_load_from_file = "lists/colors.list"

[character.outfit]
plain = "linen shirt"

["<lora>"]
film = "film grain"
"#;
    std::fs::write(prompts.join("character.toml"), character).unwrap();

    let scene = r#"
scene:
  _t: $time light
  time:
    - dawn
    - dusk
  _post:
    detail: sharp focus
backdrop:
  _w: [0, 1]
  wall: brick wall
  sea: open sea
"#;
    std::fs::write(prompts.join("scene.yaml"), scene).unwrap();

    let colors = "# hair colors\nblonde\n\n// retired\n  auburn  \n";
    std::fs::write(prompts.join("lists/colors.list"), colors).unwrap();
    std::fs::write(prompts.join("notes.md"), "# notes\n").unwrap();

    prompts
}
