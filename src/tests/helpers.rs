//! Shared test utilities for whole-run scenarios

use crate::{
    decode::{decode_prompt, DecodeOptions, DecodeOutput},
    document::PromptDocument,
    markup::{ParsedPrompt, PromptParser},
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Document from TOML text, rooted at the working directory.
pub fn toml_doc(text: &str) -> PromptDocument {
    PromptDocument::from_toml_str(text, ".").unwrap()
}

/// Document from JSON text. JSON is read through the YAML codec.
pub fn json_doc(text: &str) -> PromptDocument {
    PromptDocument::from_yaml_str(text, ".").unwrap()
}

/// Parse `selector` against a fresh copy of `doc`.
pub fn parse(doc: &PromptDocument, selector: &str, seed: u64) -> ParsedPrompt {
    init_logging();
    let mut parser = PromptParser::new(doc.clone(), Some(seed));
    parser.feed(selector).unwrap();
    parser.finish().unwrap()
}

/// Full decode run against a fresh copy of `doc`.
pub fn decode(doc: &PromptDocument, selector: &str, seed: u64) -> DecodeOutput {
    init_logging();
    decode_prompt(doc.clone(), selector, seed, DecodeOptions::default()).unwrap()
}
