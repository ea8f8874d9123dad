//! The summary blob: one text block carrying every output of a decode run.
//!
//! ```text
//! prompt_seed: 42
//! style: soft
//!
//! ---- Positive ----
//! a quiet scene,night sky
//!
//! ---- Negative ----
//! blurry
//!
//! ---- LoRA ----
//! <lora:film:0.6>
//! --
//! <lora:detail:0.3>
//! ```
//!
//! Sections are anchored on their fixed order: the first `Positive` marker, the last
//! `LoRA` marker, the last `Negative` marker between them, and an optional `Seed` marker
//! after the lora list. [`Summary::decode`] therefore recovers every field exactly as long
//! as export values are single-line, export keys contain no colon, the negative prompt has
//! no `---- Negative ----` line and the lora list has no marker line.

use std::fmt;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Match, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PromptError;

/// Export key carrying the run seed.
pub const SEED_KEY: &str = "prompt_seed";

/// Separator between high and low lora lines in a lora list.
pub const LORA_LOW_SEPARATOR: &str = "\n--\n";

const SECTION_GAP: &str = "\n\n";

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

static COMMA_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r",+").expect("comma pattern"));

static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([^:\n]+): ?(.*)$").expect("header line pattern"));

static SECTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^---- (Positive|Negative|LoRA|Seed) ----$").expect("section marker pattern"));

/// Collapse whitespace runs, drop the space after commas, collapse comma runs and strip
/// one leading comma.
pub fn normalize_prompt(s: &str) -> String {
    let s = WHITESPACE.replace_all(s, " ");
    let s = s.replace(", ", ",");
    let s = COMMA_RUN.replace_all(&s, ",");
    s.strip_prefix(',').unwrap_or(&s).to_string()
}

/// `key: value` lines, in order. Lines not in that shape are ignored.
pub fn parse_header(s: &str) -> IndexMap<String, String> {
    HEADER_LINE
        .captures_iter(s)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Split a lora list into its high and low parts around the `--` line.
pub fn split_lora_list(lora_list: &str) -> (String, String) {
    match lora_list.split_once(LORA_LOW_SEPARATOR) {
        Some((high, low)) => (high.to_string(), low.to_string()),
        None => (lora_list.to_string(), String::new()),
    }
}

/// Look up a dotted path in JSON text. Array elements are addressed by index; strings are
/// returned bare, other values as JSON. A missing path yields `default`.
pub fn extract_json_path(json_text: &str, path: &str, default: &str) -> Result<String, PromptError> {
    let root: Value = serde_json::from_str(json_text)?;
    let mut current = &root;
    for key in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(default.to_string()),
        }
    }
    Ok(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Lora tag lines for `(name, strength)` pairs, skipping zero strengths and `[none]`.
pub fn lora_tags<S: AsRef<str>>(entries: &[(S, f64)]) -> String {
    entries
        .iter()
        .filter(|(name, strength)| strength.abs() >= 1e-10 && name.as_ref() != "[none]")
        .map(|(name, strength)| format!("<lora:{}:{:.6}>", name.as_ref().replace('\\', "/"), strength))
        .collect::<Vec<String>>()
        .join("\n")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub positive: String,
    pub negative: String,
    pub lora_list: String,
    pub seed: u64,
    /// Exports other than the seed, in run order.
    pub exports: IndexMap<String, String>,
}

impl Summary {
    /// Header map as written: the seed first, then the exports.
    pub fn header(&self) -> IndexMap<String, String> {
        let mut header = IndexMap::new();
        header.insert(SEED_KEY.to_string(), self.seed.to_string());
        for (key, value) in &self.exports {
            if key != SEED_KEY {
                header.insert(key.clone(), value.clone());
            }
        }
        header
    }

    /// The header as a JSON object of strings.
    pub fn exports_json(&self) -> Result<String, PromptError> {
        Ok(serde_json::to_string(&self.header())?)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(s: &str) -> Result<Summary, PromptError> {
        let markers = SECTION_MARKER
            .captures_iter(s)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(0)?)))
            .collect::<Vec<(&str, Match)>>();
        let missing = |name: &str| PromptError::Serialization(format!("summary has no {name} section"));

        let positive = markers
            .iter()
            .find(|(name, _)| *name == "Positive")
            .map(|(_, m)| *m)
            .ok_or_else(|| missing("positive"))?;
        let lora = markers
            .iter()
            .rev()
            .find(|(name, m)| *name == "LoRA" && m.start() > positive.end())
            .map(|(_, m)| *m)
            .ok_or_else(|| missing("lora"))?;
        let negative = markers
            .iter()
            .rev()
            .find(|(name, m)| *name == "Negative" && m.start() > positive.end() && m.end() < lora.start())
            .map(|(_, m)| *m)
            .ok_or_else(|| missing("negative"))?;
        let seed_marker = markers
            .iter()
            .find(|(name, m)| *name == "Seed" && m.start() > lora.end())
            .map(|(_, m)| *m);

        let head = &s[..positive.start()];
        let mut header = parse_header(head.strip_suffix(SECTION_GAP).unwrap_or(head));
        let seed_text = match (header.shift_remove(SEED_KEY), seed_marker) {
            (Some(seed), _) => seed,
            (None, Some(marker)) => section_body(s, marker, None).to_string(),
            (None, None) => return Err(missing("seed")),
        };
        let seed = seed_text
            .trim()
            .parse::<u64>()
            .map_err(|_| PromptError::Serialization(format!("summary seed '{}' is not an integer", seed_text.trim())))?;

        Ok(Summary {
            positive: section_body(s, positive, Some(negative)).to_string(),
            negative: section_body(s, negative, Some(lora)).to_string(),
            lora_list: section_body(s, lora, seed_marker).to_string(),
            seed,
            exports: header,
        })
    }
}

/// Text between `marker` and `next`, without the gap written before the next marker.
fn section_body<'s>(s: &'s str, marker: Match, next: Option<Match>) -> &'s str {
    let start = (marker.end() + 1).min(s.len());
    match next {
        Some(next) => {
            let body = &s[start.min(next.start())..next.start()];
            body.strip_suffix(SECTION_GAP).unwrap_or(body)
        }
        None => &s[start..],
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self
            .header()
            .iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<String>>()
            .join("\n");
        write!(
            f,
            "{header}\n\n---- Positive ----\n{}\n\n---- Negative ----\n{}\n\n---- LoRA ----\n{}",
            self.positive, self.negative, self.lora_list
        )
    }
}
