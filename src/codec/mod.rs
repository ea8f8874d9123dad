//! Prompt file loading and output encoding.
//!
//! ## Key Components
//!
//! - [`DocCodec`] trait - turns file text into a [`PromptDocument`]
//! - [`CodecMap`] - global registry of codecs keyed by file extension (accessible via [`CODECS`])
//! - [`PromptFile`] - a prompt file read from disk, parsed by the codec for its extension
//! - [`summary`] - the round-trip summary blob and output helpers
//!
//! ## Built-in Codecs
//!
//! - **TOML** (`.toml`, `.txt`) - via [`formats::TomlCodec`]
//! - **YAML** (`.yaml`, `.yml`) - via [`formats::YamlCodec`]
//!
//! Register custom codecs via [`CodecMap::insert`]:
//!
//! ```rust
//! use std::path::Path;
//! use toml_prompt::{codec::{CODECS, DocCodec}, document::PromptDocument, PromptError};
//!
//! #[derive(Default)]
//! struct JsonCodec;
//!
//! impl DocCodec for JsonCodec {
//!     fn parse(&self, content: &str, root_dir: &Path) -> Result<PromptDocument, PromptError> {
//!         // JSON is a subset of YAML
//!         PromptDocument::from_yaml_str(content, root_dir)
//!     }
//! }
//! CODECS.insert::<JsonCodec>("json".to_string());
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::{
    fs::{read, read_to_string},
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use walkdir::{DirEntry, WalkDir};

use crate::{document::PromptDocument, error::PromptError};

pub mod formats;
pub mod summary;

pub use formats::{TomlCodec, YamlCodec};
pub use summary::{normalize_prompt, Summary};

/// Global singleton codec map with builtin codecs (toml, txt, yaml, yml)
pub static CODECS: Lazy<CodecMap> = Lazy::new(CodecMap::create);

pub trait DocCodec: Send + Sync {
    /// Parse file content. `root_dir` anchors `_load_from_file` references.
    fn parse(&self, content: &str, root_dir: &Path) -> Result<PromptDocument, PromptError>;
}

pub struct CodecMap(Arc<RwLock<Vec<(String, Arc<dyn DocCodec>)>>>);

impl Clone for CodecMap {
    fn clone(&self) -> Self {
        CodecMap(self.0.clone())
    }
}

impl CodecMap {
    pub fn create() -> Self {
        let toml: Arc<dyn DocCodec> = Arc::new(TomlCodec);
        let yaml: Arc<dyn DocCodec> = Arc::new(YamlCodec);
        CodecMap(Arc::new(RwLock::new(vec![
            ("toml".to_string(), toml.clone()),
            ("txt".to_string(), toml),
            ("yaml".to_string(), yaml.clone()),
            ("yml".to_string(), yaml),
        ])))
    }

    pub fn insert<T: DocCodec + Default + 'static>(&self, extension: String) {
        let mut writer = self.0.write();
        let codec: Arc<dyn DocCodec> = Arc::new(T::default());
        if let Some(entry) = writer.iter_mut().find(|(ext, _)| ext == &extension) {
            entry.1 = codec;
        } else {
            writer.push((extension, codec));
        }
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn DocCodec>> {
        self.0
            .read()
            .iter()
            .find(|(codec_ext, _value)| ext == codec_ext)
            .map(|(_codec_ext, value)| value.clone())
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0
            .read()
            .iter()
            .map(|(codec_ext, _value)| codec_ext.clone())
            .collect::<Vec<String>>()
    }
}

/// A prompt file read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFile {
    pub path: PathBuf,
    pub text: String,
}

impl PromptFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<PromptFile, PromptError> {
        tracing::debug!("Reading {:?}", path.as_ref());
        Ok(PromptFile {
            path: path.as_ref().to_path_buf(),
            text: read_to_string(path)?,
        })
    }

    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Directory `_load_from_file` paths are resolved against.
    pub fn root_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Parse a fresh document. Call once per run: runs mutate their document.
    pub fn load(&self) -> Result<PromptDocument, PromptError> {
        let ext = self.extension();
        let codec = CODECS
            .get(&ext)
            .ok_or_else(|| PromptError::UnknownFormat(format!("{:?}", self.path)))?;
        codec.parse(&self.text, &self.root_dir())
    }

    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }
}

/// SHA-256 hex digest of a file, used to detect prompt file changes.
pub fn content_hash<P: AsRef<Path>>(path: P) -> Result<String, PromptError> {
    let bytes = read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Relative paths (with `/` separators) of every prompt file below `base`, sorted.
pub fn list_prompt_files<P: AsRef<Path>>(base: P) -> Result<Vec<String>, PromptError> {
    fn is_hidden(entry: &DirEntry) -> bool {
        entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    }
    let base = base.as_ref();
    let extensions = CODECS.extensions();
    let mut files = Vec::new();
    for entry in WalkDir::new(base)
        .into_iter()
        .filter_entry(|e| !is_hidden(e) || e.path() == base)
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let known = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|ce| ce.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !known {
            continue;
        }
        let rel = entry.path().strip_prefix(base)?;
        files.push(
            rel.components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect::<Vec<String>>()
                .join("/"),
        );
    }
    files.sort();
    Ok(files)
}

/// Trimmed lines of a variable file, without blanks and `#` / `//` comment lines.
pub fn load_file_lines<P: AsRef<Path>>(root_dir: P, rel: &str) -> Result<Vec<String>, PromptError> {
    let path = root_dir.as_ref().join(rel);
    tracing::debug!("Reading variable file {:?}", path);
    let text = read_to_string(&path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
        .map(str::to_string)
        .collect())
}
