//! # toml-prompt
//!
//! Resolves hand-authored, deeply nested prompt documents (TOML or YAML) into flat prompt text.
//!
//! ## Overview
//!
//! A prompt document is a tree of text fragments, choice lists, weights and templates. A short
//! *selector* picks paths through it with a small query language (`a.b`, `a.?`, `a.*`, `a.??`,
//! `a.**`, `a.b+c`, `name()`), optionally wrapped in control markup (`<case>`, `<random>`,
//! `<when>`, `<else>`, `<neg>`, `<lora:name:strength>`, processing instructions). One run is
//! deterministic for a given seed.
//!
//! ### Key Features
//!
//! - **Path queries**: alternation, wildcard, weighted random picks and recursive picks
//! - **Templates**: `_t` strings with `$var` / `%tag` references resolved anywhere in the tree
//! - **Deferred branches**: `_post`, `_all` and `_one` selectors queued in declared order
//! - **Exports**: `_exports` tables collected into a key/value map that travels with the output
//! - **Summary blob**: a text block carrying every output, readable back field for field
//!
//! ## Architecture
//!
//! - **[`query`]**: selector compilation (`build_search_keys`) and path segments
//! - **[`document`]**: the parsed tree (`PromptDocument`, `PromptNode`, `Branch`)
//! - **[`resolver`]**: the tree walk (`Resolver`, key enumeration, route mutations)
//! - **[`expand`]**: template shorthand, comments and inline `{a|b}` choices
//! - **[`markup`]**: the selector markup parser (`PromptParser`)
//! - **[`decode`]**: one full run (`decode_prompt`)
//! - **[`codec`]**: file loading by extension and the summary blob
//! - **[`random`]**: the seeded random source shared by a run
//!
//! ## Quick Start
//!
//! ```rust
//! use toml_prompt::{decode::{decode_prompt, DecodeOptions}, document::PromptDocument};
//!
//! # fn main() -> Result<(), toml_prompt::PromptError> {
//! let doc = PromptDocument::from_toml_str(
//!     r#"
//! [portrait]
//! _t = "portrait of a $who, $light"
//! who = "knight"
//! light = "soft light"
//! "#,
//!     ".",
//! )?;
//! let out = decode_prompt(doc, "portrait <neg>blurry</neg>", 42, DecodeOptions::default())?;
//! assert_eq!(out.positive, "portrait of a knight,soft light");
//! assert_eq!(out.negative, "blurry");
//! println!("{}", out.summary_text());
//! # Ok(())
//! # }
//! ```
//!
//! ### Loading Files
//!
//! ```rust,no_run
//! use toml_prompt::{codec::PromptFile, decode::{decode_prompt, DecodeOptions}};
//!
//! # fn main() -> Result<(), toml_prompt::PromptError> {
//! let file = PromptFile::open("prompts/scene.toml")?;
//! let out = decode_prompt(file.load()?, "scene.?", 7, DecodeOptions::default())?;
//! println!("{}", out.positive);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod decode;
pub mod document;
pub mod error;
pub mod expand;
pub mod markup;
pub mod query;
pub mod random;
pub mod resolver;
#[cfg(test)]
mod tests;

pub use error::*;
