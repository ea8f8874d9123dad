//! One complete decode run: selector text in, prompts, lora list and exports out.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    codec::summary::{normalize_prompt, Summary, LORA_LOW_SEPARATOR, SEED_KEY},
    document::PromptDocument,
    error::PromptError,
    expand::{remove_comment_out, select_dynamic_prompt},
    markup::PromptParser,
    resolver::Resolution,
};

/// Selector preprocessing switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Strip `#`, `//` and `/* */` comments from the selector.
    pub strip_comments: bool,
    /// Draw `{a|b|c}` inline choices in the selector.
    pub inline_choices: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            strip_comments: true,
            inline_choices: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOutput {
    pub positive: String,
    pub negative: String,
    pub lora_list: String,
    pub seed: u64,
    /// Every export of the run, `prompt_seed` first.
    pub exports: IndexMap<String, String>,
    pub summary: Summary,
}

impl DecodeOutput {
    pub fn summary_text(&self) -> String {
        self.summary.encode()
    }

    pub fn exports_json(&self) -> Result<String, PromptError> {
        self.summary.exports_json()
    }
}

fn join_fragments(fragments: &[String]) -> String {
    let joined = fragments
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<&str>>()
        .join(",");
    normalize_prompt(&joined)
}

/// Resolve `selector` against `document` with a run seeded by `seed`.
///
/// The document is consumed: `_load_from_file` entries and route instructions mutate it.
pub fn decode_prompt(
    document: PromptDocument,
    selector: &str,
    seed: u64,
    options: DecodeOptions,
) -> Result<DecodeOutput, PromptError> {
    let mut ctx = Resolution::new(Some(seed));
    ctx.exports.insert(SEED_KEY.to_string(), seed.to_string());
    for (key, value) in &document.root().meta.exports {
        if ctx.exports.get(key) != Some(value) {
            tracing::debug!("Export: {} = {}", key, value);
            ctx.exports.insert(key.clone(), value.clone());
        }
    }

    let mut selector = selector.to_string();
    if options.strip_comments {
        selector = remove_comment_out(&selector);
    }
    if options.inline_choices {
        selector = select_dynamic_prompt(&mut ctx.rand, &selector);
    }
    tracing::debug!("Decode selector: {:?}", selector);

    let mut parser = PromptParser::with_resolution(document, ctx);
    parser.feed(&selector)?;
    let parsed = parser.finish()?;

    let positive = join_fragments(&parsed.positive);
    let negative = join_fragments(&parsed.negative);
    let mut lora_list = parsed.loras.join("\n");
    if !parsed.loras_low.is_empty() {
        lora_list.push_str(LORA_LOW_SEPARATOR);
        lora_list.push_str(&parsed.loras_low.join("\n"));
    }

    let summary = Summary {
        positive: positive.clone(),
        negative: negative.clone(),
        lora_list: lora_list.clone(),
        seed,
        exports: parsed
            .exports
            .iter()
            .filter(|(key, _)| key.as_str() != SEED_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };
    tracing::info!(
        "Decoded {} positive / {} negative chars, {} lora lines",
        positive.len(),
        negative.len(),
        parsed.loras.len() + parsed.loras_low.len()
    );

    Ok(DecodeOutput {
        positive,
        negative,
        lora_list,
        seed,
        exports: parsed.exports,
        summary,
    })
}
