//! Selector markup: a small tag language layered over the tree resolver.
//!
//! A selector is plain text (comma / newline separated selector paths) optionally wrapped in
//! control tags:
//!
//! | Tag                         | Effect                                                    |
//! |-----------------------------|-----------------------------------------------------------|
//! | `<raw>`                     | text is a positive fragment                               |
//! | `<neg>`                     | text is a negative fragment                               |
//! | `<tag>` / `<var>`           | text is resolved as selectors; `var` joins without comma  |
//! | `<case>` + `<when key=K>`   | first `when` whose key was loaded wins                    |
//! | `<random a=1 b=2>` + `when` | weighted pick of one attribute key, matched by `when`     |
//! | `<when key=K>`              | plain gate on a loaded key                                |
//! | `<else>`                    | taken when the enclosing `case` / `random` did not match  |
//!
//! Processing instructions (`<?name args...>`, arguments split shell-style) mutate the run:
//! `export`, `route`, `grep`, `set`, `lora` / `lora_low`, `random_count`. The shorthand
//! `<lora:name:strength[:clip]>` is rewritten to `<?lora "name" "strength" ["clip"]>`.
//!
//! Every resolved fragment is fed back through the parser wrapped in `<raw>...</raw>`, so
//! `<var>` / `<tag>` markers produced by template expansion resolve recursively. Nested
//! parses share the run state and start with empty tag and condition stacks.

use std::mem;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::{
    document::{PromptDocument, PromptNode},
    error::PromptError,
    query::{build_search_keys, split_path},
    resolver::{apply_route, Resolution, Resolver},
};

/// Document section holding per-lora prompt fragments.
pub const LORA_SECTION: &str = "<lora>";

/// Innermost tag assumed when no tag is open.
const DEFAULT_TAG: &str = "tag";

static LORA_SHORTHAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(lora[_a-z]*):([^:>]+):([0-9\-.]+)(:([0-9\-.]+))?>").expect("lora shorthand pattern")
});

static KEY_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\r\n]").expect("key separator pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    StartTag {
        name: String,
        attrs: Vec<(String, Option<String>)>,
        self_closing: bool,
    },
    EndTag(String),
    Instruction(String),
    Text(String),
}

/// Rewrite `<lora:name:strength[:clip]>` (and `lora_low`, `lora_h`, ...) into instruction form.
pub fn expand_lora_shorthand(s: &str) -> String {
    LORA_SHORTHAND
        .replace_all(s, |caps: &Captures| match caps.get(5) {
            Some(clip) => format!(
                "<?{} \"{}\" \"{}\" \"{}\">",
                &caps[1],
                &caps[2],
                &caps[3],
                clip.as_str()
            ),
            None => format!("<?{} \"{}\" \"{}\">", &caps[1], &caps[2], &caps[3]),
        })
        .into_owned()
}

/// Split markup into tags, instructions and text. Comments and declarations are dropped; a
/// `<` that does not open markup is text.
pub fn tokenize(input: &str) -> Result<Vec<Token>, PromptError> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = input;
    while let Some(pos) = rest.find('<') {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match scan_markup(tail)? {
            Some((token, consumed)) => {
                if !text.is_empty() {
                    tokens.push(Token::Text(mem::take(&mut text)));
                }
                tokens.extend(token);
                rest = &tail[consumed..];
            }
            None => {
                text.push('<');
                rest = &tail[1..];
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

fn unterminated(kind: &str, tail: &str) -> PromptError {
    let excerpt = tail.chars().take(40).collect::<String>();
    PromptError::Markup(format!("unterminated {kind} at '{excerpt}'"))
}

/// Markup starting at `tail[0] == '<'`, with the number of bytes it spans.
fn scan_markup(tail: &str) -> Result<Option<(Option<Token>, usize)>, PromptError> {
    let next = tail[1..].chars().next();
    if let Some(body) = tail.strip_prefix("<!--") {
        let end = body.find("-->").ok_or_else(|| unterminated("comment", tail))?;
        return Ok(Some((None, 4 + end + 3)));
    }
    if let Some(body) = tail.strip_prefix("<?") {
        let end = body.find('>').ok_or_else(|| unterminated("processing instruction", tail))?;
        let data = body[..end].trim().to_string();
        return Ok(Some((Some(Token::Instruction(data)), 2 + end + 1)));
    }
    if let Some(body) = tail.strip_prefix("</") {
        if !body.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Ok(None);
        }
        let end = body.find('>').ok_or_else(|| unterminated("end tag", tail))?;
        let name = body[..end]
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        return Ok(Some((Some(Token::EndTag(name)), 2 + end + 1)));
    }
    if let Some(body) = tail.strip_prefix("<!") {
        let end = body.find('>').ok_or_else(|| unterminated("declaration", tail))?;
        return Ok(Some((None, 2 + end + 1)));
    }
    match next {
        Some(c) if c.is_ascii_alphabetic() => {
            let (token, consumed) = scan_start_tag(tail)?;
            Ok(Some((Some(token), consumed)))
        }
        _ => Ok(None),
    }
}

fn scan_start_tag(tail: &str) -> Result<(Token, usize), PromptError> {
    let bytes = tail.as_bytes();
    let len = bytes.len();
    let mut i = 1;
    while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let name = tail[1..i].to_lowercase();
    let mut attrs = Vec::new();
    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return Err(unterminated("start tag", tail));
        }
        match bytes[i] {
            b'>' => {
                let token = Token::StartTag {
                    name,
                    attrs,
                    self_closing: false,
                };
                return Ok((token, i + 1));
            }
            b'/' if bytes.get(i + 1) == Some(&b'>') => {
                let token = Token::StartTag {
                    name,
                    attrs,
                    self_closing: true,
                };
                return Ok((token, i + 2));
            }
            b'/' => {
                i += 1;
                continue;
            }
            _ => {}
        }
        let start = i;
        while i < len && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        let attr = tail[start..i].to_lowercase();
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            attrs.push((attr, None));
            continue;
        }
        i += 1;
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let value = match bytes.get(i) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                let close = tail[i + 1..]
                    .find(quote as char)
                    .ok_or_else(|| unterminated("attribute value", tail))?;
                let value = &tail[i + 1..i + 1 + close];
                i += close + 2;
                value
            }
            _ => {
                let start = i;
                while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                &tail[start..i]
            }
        };
        attrs.push((attr, Some(value.to_string())));
    }
}

/// Shell-style argument split: whitespace separated, single quotes literal, double quotes
/// honoring `\"` and `\\`, a bare backslash escaping the next character.
pub fn split_args(s: &str) -> Result<Vec<String>, PromptError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(PromptError::Instruction(format!("unclosed quote in '{s}'"))),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek() {
                            Some(&next) if next == '"' || next == '\\' => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        Some(c) => current.push(c),
                        None => return Err(PromptError::Instruction(format!("unclosed quote in '{s}'"))),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

fn attr<'t>(attrs: &'t [(String, Option<String>)], name: &str) -> Option<&'t str> {
    attrs
        .iter()
        .find(|(key, _)| key == name)
        .and_then(|(_, value)| value.as_deref())
}

fn when_key(attrs: &[(String, Option<String>)]) -> Result<&str, PromptError> {
    attr(attrs, "key").ok_or_else(|| PromptError::Markup("<when> requires a key attribute".to_string()))
}

/// Tag, condition and random-key stacks of one (possibly nested) parse.
#[derive(Debug, Default)]
struct Frame {
    tags: Vec<String>,
    cond: Vec<bool>,
    random_key: Vec<String>,
    simple_join: bool,
    before_simple_join: bool,
}

impl Frame {
    fn nested(simple_join: bool) -> Frame {
        Frame {
            simple_join,
            ..Frame::default()
        }
    }

    fn active(&self) -> bool {
        self.cond.last().copied().unwrap_or(true)
    }

    fn innermost(&self) -> &str {
        self.tags.last().map(String::as_str).unwrap_or(DEFAULT_TAG)
    }

    fn is_closed(&self) -> bool {
        self.tags.is_empty() && self.cond.is_empty() && self.random_key.is_empty()
    }
}

/// Output of a finished parse.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrompt {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    pub loras: Vec<String>,
    pub loras_low: Vec<String>,
    pub exports: IndexMap<String, String>,
}

/// Parser for one run. Owns the document, which instructions may mutate.
pub struct PromptParser {
    doc: PromptDocument,
    ctx: Resolution,
    positive: Vec<String>,
    negative: Vec<String>,
    loras: Vec<String>,
    loras_low: Vec<String>,
    frame: Frame,
}

impl PromptParser {
    pub fn new(doc: PromptDocument, seed: Option<u64>) -> PromptParser {
        PromptParser::with_resolution(doc, Resolution::new(seed))
    }

    /// Start from a prepared context, e.g. with exports already seeded.
    pub fn with_resolution(doc: PromptDocument, ctx: Resolution) -> PromptParser {
        PromptParser {
            doc,
            ctx,
            positive: Vec::new(),
            negative: Vec::new(),
            loras: Vec::new(),
            loras_low: Vec::new(),
            frame: Frame::default(),
        }
    }

    pub fn document(&self) -> &PromptDocument {
        &self.doc
    }

    pub fn resolution(&self) -> &Resolution {
        &self.ctx
    }

    pub fn positive(&self) -> &[String] {
        &self.positive
    }

    pub fn negative(&self) -> &[String] {
        &self.negative
    }

    /// Feed selector markup. May be called repeatedly; open tags carry over between calls.
    pub fn feed(&mut self, data: &str) -> Result<(), PromptError> {
        let mut frame = mem::take(&mut self.frame);
        let result = self.feed_frame(&mut frame, data);
        self.frame = frame;
        result
    }

    /// Finish the run. Tags left open are an error.
    pub fn finish(self) -> Result<ParsedPrompt, PromptError> {
        if !self.frame.is_closed() {
            return Err(PromptError::Markup(format!(
                "tags not closed at end of selector: {:?}",
                self.frame.tags
            )));
        }
        Ok(ParsedPrompt {
            positive: self.positive,
            negative: self.negative,
            loras: self.loras,
            loras_low: self.loras_low,
            exports: self.ctx.exports,
        })
    }

    fn feed_frame(&mut self, frame: &mut Frame, data: &str) -> Result<(), PromptError> {
        for token in tokenize(&expand_lora_shorthand(data))? {
            match token {
                Token::StartTag {
                    name,
                    attrs,
                    self_closing,
                } => {
                    self.start_tag(frame, &name, &attrs)?;
                    if self_closing {
                        Self::end_tag(frame, &name)?;
                    }
                }
                Token::EndTag(name) => Self::end_tag(frame, &name)?,
                Token::Instruction(data) => self.instruction(frame, &data)?,
                Token::Text(text) => self.data(frame, &text)?,
            }
        }
        Ok(())
    }

    fn start_tag(&mut self, frame: &mut Frame, name: &str, attrs: &[(String, Option<String>)]) -> Result<(), PromptError> {
        let parent = frame.innermost().to_string();
        match name {
            "when" => match parent.as_str() {
                "case" => {
                    let key = when_key(attrs)?;
                    let matched = self.ctx.is_visited(key);
                    Self::first_match(frame, matched, "Case", key);
                }
                "random" => {
                    let key = when_key(attrs)?;
                    let matched = frame.random_key.last().is_some_and(|picked| picked == key);
                    Self::first_match(frame, matched, "Random", key);
                }
                _ => {
                    let key = when_key(attrs)?;
                    let open = frame.active() && self.ctx.is_visited(key);
                    if open {
                        tracing::debug!("When: {}", key);
                    }
                    frame.cond.push(open);
                }
            },
            "else" => {
                let open = frame.active();
                if open {
                    tracing::debug!("Else");
                }
                frame.cond.push(open);
            }
            "case" => frame.cond.push(frame.active()),
            "random" => {
                if frame.active() {
                    let key = self.pick_random_key(attrs)?;
                    frame.cond.push(true);
                    frame.random_key.push(key);
                } else {
                    frame.cond.push(false);
                    frame.random_key.push(String::new());
                }
            }
            _ => {}
        }
        frame.tags.push(name.to_string());
        Ok(())
    }

    /// `when` inside `case` / `random`: the first match closes the enclosing block.
    fn first_match(frame: &mut Frame, matched: bool, label: &str, key: &str) {
        let open = frame.cond.last().copied().unwrap_or(false);
        if open && matched {
            if let Some(top) = frame.cond.last_mut() {
                *top = false;
            }
            frame.cond.push(true);
            tracing::debug!("{}: {}", label, key);
        } else {
            frame.cond.push(false);
        }
    }

    fn pick_random_key(&mut self, attrs: &[(String, Option<String>)]) -> Result<String, PromptError> {
        let weights = attrs
            .iter()
            .map(|(key, value)| match value {
                None => Ok(1.0),
                Some(value) => value.trim().parse::<f64>().map_err(|_| {
                    PromptError::InvalidWeights(format!("<random> weight for '{key}' is not a number: '{value}'"))
                }),
            })
            .collect::<Result<Vec<f64>, PromptError>>()?;
        if attrs.is_empty() {
            return Err(PromptError::Markup("<random> needs at least one key".to_string()));
        }
        let idx = self.ctx.rand.choose_weighted(&weights)?;
        let key = attrs[idx].0.clone();
        tracing::debug!(
            "Random: {} in {:?}",
            key,
            attrs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
        );
        Ok(key)
    }

    fn end_tag(frame: &mut Frame, name: &str) -> Result<(), PromptError> {
        if frame.tags.last().map(String::as_str) != Some(name) {
            return Err(PromptError::Markup(format!(
                "closing </{}> does not match open tags {:?}",
                name, frame.tags
            )));
        }
        frame.tags.pop();
        if matches!(name, "case" | "when" | "else" | "random") {
            frame.cond.pop();
        }
        if name == "random" {
            frame.random_key.pop();
        }
        Ok(())
    }

    fn data(&mut self, frame: &mut Frame, text: &str) -> Result<(), PromptError> {
        if !frame.active() {
            return Ok(());
        }
        let tag = frame.innermost().to_string();
        match tag.as_str() {
            "raw" | "when" | "else" => {
                if text.trim().is_empty() {
                    return Ok(());
                }
                let join = frame.simple_join || frame.before_simple_join;
                match self.positive.last_mut() {
                    Some(last) if join => {
                        last.push_str(text);
                        frame.before_simple_join = false;
                    }
                    _ => self.positive.push(text.to_string()),
                }
            }
            "neg" => {
                if !text.trim().is_empty() {
                    self.negative.push(text.to_string());
                }
            }
            "tag" | "var" => {
                let simple_join = tag == "var";
                for key in KEY_SEPARATOR.split(text) {
                    let keys = build_search_keys(key.trim())
                        .iter()
                        .map(|k| split_path(k))
                        .collect::<Vec<_>>();
                    self.feed_keys(frame, keys, simple_join)?;
                }
            }
            _ => {
                let trimmed = text.trim();
                if !trimmed.is_empty() && trimmed != "," {
                    return Err(PromptError::Markup(format!("unexpected text '{trimmed}' in <{tag}>")));
                }
            }
        }
        Ok(())
    }

    /// Resolve `keys`, then every batch of deferred selectors they queue.
    fn feed_keys(&mut self, frame: &mut Frame, keys: Vec<Vec<String>>, simple_join: bool) -> Result<(), PromptError> {
        let mut keys = keys;
        loop {
            let posts = self.feed_prompt(frame, &keys, simple_join)?;
            if posts.is_empty() {
                return Ok(());
            }
            keys = posts.iter().map(|k| split_path(k)).collect();
        }
    }

    /// Resolve one batch and feed the joined fragments back as `<raw>`. Returns queued posts.
    fn feed_prompt(&mut self, frame: &mut Frame, keys: &[Vec<String>], simple_join: bool) -> Result<Vec<String>, PromptError> {
        let mut resolver = Resolver::new(&mut self.doc, &mut self.ctx);
        let fragments = resolver.collect(keys, &[])?;
        let posts = resolver.take_posts();
        let prompt = fragments
            .into_iter()
            .filter(|fragment| !fragment.trim().is_empty())
            .collect::<Vec<String>>()
            .join(",");
        if !prompt.is_empty() {
            let mut nested = Frame::nested(simple_join);
            self.feed_frame(&mut nested, &format!("<raw>{prompt}</raw>"))?;
            if !nested.is_closed() {
                return Err(PromptError::Markup(format!("tag not closed in '{prompt}'")));
            }
            frame.before_simple_join = simple_join;
        }
        Ok(posts)
    }

    fn instruction(&mut self, frame: &mut Frame, data: &str) -> Result<(), PromptError> {
        if !frame.active() {
            return Ok(());
        }
        let args = split_args(data)?;
        let Some((name, args)) = args.split_first() else {
            return Err(PromptError::Instruction("empty processing instruction".to_string()));
        };
        match name.as_str() {
            "export" => self.pi_export(args),
            "route" => apply_route(&mut self.doc, args),
            "grep" => self.pi_grep(args),
            "set" => self.pi_set(args),
            "lora" | "lora_high" | "lora_h" => self.pi_lora(frame, args, false),
            "lora_low" | "lora_l" => self.pi_lora(frame, args, true),
            "random_count" => self.pi_random_count(args),
            other => Err(PromptError::UnknownInstruction(other.to_string())),
        }
    }

    fn pi_export(&mut self, args: &[String]) -> Result<(), PromptError> {
        let [key, value, ..] = args else {
            return Err(PromptError::Instruction(format!("export expects a key and a value, got {args:?}")));
        };
        tracing::debug!("Export: {} = {}", key, value);
        self.ctx.exports.insert(key.clone(), value.clone());
        Ok(())
    }

    fn pi_set(&mut self, args: &[String]) -> Result<(), PromptError> {
        let [key, value, ..] = args else {
            return Err(PromptError::Instruction(format!("set expects a key and a value, got {args:?}")));
        };
        let path = split_path(key.trim());
        self.doc.load_file_var(&path)?;
        *self.doc.require_mut(&path)? = PromptNode::Choices(vec![value.clone()]);
        tracing::debug!("Set: {} = {}", key, value);
        Ok(())
    }

    fn pi_grep(&mut self, args: &[String]) -> Result<(), PromptError> {
        let [key, needle, ..] = args else {
            return Err(PromptError::Instruction(format!("grep expects a key and a substring, got {args:?}")));
        };
        let path = split_path(key.trim());
        self.doc.load_file_var(&path)?;
        let node = self.doc.require_mut(&path)?;
        let values = match node {
            PromptNode::Choices(values) => mem::take(values),
            PromptNode::Leaf(text) => vec![mem::take(text)],
            PromptNode::Branch(branch) => vec![branch.meta.template.clone().unwrap_or_default()],
        };
        let kept = values
            .into_iter()
            .filter(|value| value.contains(needle.as_str()))
            .collect::<Vec<String>>();
        tracing::debug!("Grep: {} '{}' -> {:?}", key, needle, kept);
        *node = PromptNode::Choices(kept);
        Ok(())
    }

    fn pi_random_count(&mut self, args: &[String]) -> Result<(), PromptError> {
        let count = args
            .first()
            .and_then(|n| n.trim().parse::<u64>().ok())
            .ok_or_else(|| PromptError::Instruction(format!("random_count expects a count, got {args:?}")))?;
        self.ctx.rand.set_count(count)
    }

    fn pi_lora(&mut self, frame: &mut Frame, args: &[String], low: bool) -> Result<(), PromptError> {
        let Some(name) = args.first() else {
            return Err(PromptError::Instruction("lora expects a name".to_string()));
        };
        let name = name.replace('\\', "/");
        let strength = args.get(1).map(String::as_str).unwrap_or("1.0");
        let tag = match args.get(2) {
            Some(clip) => format!("<lora:{name}:{strength}:{clip}>"),
            None => format!("<lora:{name}:{strength}>"),
        };
        let list = if low { &mut self.loras_low } else { &mut self.loras };
        if list.contains(&tag) {
            tracing::debug!("LoRA (Duplicated): {}", tag);
            return Ok(());
        }
        tracing::debug!("LoRA: {}", tag);
        list.push(tag);
        self.ctx.exclude_keys.insert(name.clone());

        let mut candidates = vec![name.clone()];
        if let Some(base) = name.rsplit('/').next() {
            if base != name {
                candidates.push(base.to_string());
            }
        }
        for candidate in candidates {
            let present = self
                .doc
                .root()
                .child(LORA_SECTION)
                .and_then(PromptNode::as_branch)
                .is_some_and(|section| section.child(&candidate).is_some());
            if present {
                let keys = vec![vec![LORA_SECTION.to_string(), candidate]];
                self.feed_keys(frame, keys, false)?;
            }
        }
        Ok(())
    }
}
