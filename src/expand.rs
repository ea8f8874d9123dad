//! Template text expansion for a single resolved fragment.
//!
//! Legacy `${name}` variables are substituted first, through a lookup supplied by the
//! resolver. Expansion then runs in three steps: shorthand references (`$name`, `%name`) become
//! `<var>`/`<tag>` markers, comments are stripped, and inline `{a|b|c}` choices are drawn.
//! The markers are left for the markup parser, which resolves them through the tree
//! resolver so a fragment can reference any path in the document.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::{error::PromptError, query::join_path, random::PromptRandom};

/// Upper bound on shorthand rewrite passes for a single fragment.
pub const MAX_EXPANSION_PASSES: usize = 16;

static SHORTHAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([$%]:*[a-zA-Z_.*?]+)").expect("shorthand pattern"));

static LEGACY_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-zA-Z0-9_.]+)\}").expect("legacy variable pattern"));

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)((//|#).+$|/\*[\s\S]*?\*/)").expect("comment pattern"));

static DYNAMIC_CHOICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^}]+)\}").expect("dynamic choice pattern"));

/// Rewrite `$name` into `<var>prefix.name</var>` and `%name` into `<tag>prefix.name</tag>`.
///
/// A leading `::` makes the reference absolute (`$::a.b` → `<var>a.b</var>`).
pub fn expand_prompt_var<S: AsRef<str>>(value: &str, prefix: &[S]) -> String {
    let mut value = value.to_string();
    let mut passes = 0;
    while SHORTHAND.is_match(&value) {
        if passes == MAX_EXPANSION_PASSES {
            tracing::warn!(
                "Shorthand expansion for '{}' did not settle after {} passes",
                join_path(prefix),
                MAX_EXPANSION_PASSES
            );
            break;
        }
        value = SHORTHAND
            .replace_all(&value, |caps: &Captures| {
                let reference = &caps[1];
                let kind = if reference.starts_with('$') { "var" } else { "tag" };
                let name = &reference[1..];
                let path = match name.strip_prefix("::") {
                    Some(absolute) => absolute.to_string(),
                    None if prefix.is_empty() => name.to_string(),
                    None => format!("{}.{}", join_path(prefix), name),
                };
                format!("<{kind}>{path}</{kind}>")
            })
            .into_owned();
        passes += 1;
    }
    value
}

/// Replace each `${name}` with `lookup(name)`. The name keeps its leading `.` when the
/// reference points at the root variable table.
pub fn expand_legacy_vars<F>(value: &str, mut lookup: F) -> Result<String, PromptError>
where
    F: FnMut(&str) -> Result<String, PromptError>,
{
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in LEGACY_VAR.captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&value[last..whole.start()]);
        out.push_str(&lookup(name.as_str())?);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Strip `// …` and `# …` to end of line, and `/* … */` blocks (which may span lines).
pub fn remove_comment_out(s: &str) -> String {
    COMMENT.replace_all(s, "").into_owned()
}

/// Replace each `{a|b|c}` with one trimmed alternative. Every group consumes one draw.
pub fn select_dynamic_prompt(rand: &mut PromptRandom, s: &str) -> String {
    DYNAMIC_CHOICE
        .replace_all(s, |caps: &Captures| {
            let alternatives = caps[1].split('|').collect::<Vec<&str>>();
            rand.choose(&alternatives)
                .map(|alt| alt.trim().to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// The full expansion pipeline applied to one fragment's raw text.
pub fn expand_fragment<S: AsRef<str>>(rand: &mut PromptRandom, raw: &str, prefix: &[S]) -> String {
    select_dynamic_prompt(rand, &remove_comment_out(&expand_prompt_var(raw, prefix)))
}
