//! Path query language for addressing nodes in a prompt document.
//!
//! A selector is a dotted path (`scene.light.?`) whose segments may be `+` alternations
//! (`a.b+d.c`) or one of the operators below. [`build_search_keys`] compiles a selector into
//! every concrete path it denotes, prefixes included, so that resolving the list in order
//! emits each ancestor's template before its descendants'.
//!
//! | Segment  | Meaning                                                        |
//! |----------|----------------------------------------------------------------|
//! | `name`   | literal child                                                  |
//! | `name()` | literal child, then its `_f` sub-template                      |
//! | `?`      | one random branch child                                        |
//! | `?$`     | one random leaf child (terminal `?` compiles to this)          |
//! | `??`     | random descent to a leaf (must be last)                        |
//! | `*`      | every branch child                                             |
//! | `*$`     | every leaf child (terminal `*` compiles to this)               |
//! | `*!`     | every child                                                    |
//! | `**`     | every templated descendant, then every leaf (must be last)     |

/// Marks a terminal `?` / `*` so it selects among leaf children.
pub const TERMINAL_SUFFIX: char = '$';

/// Separator between path segments.
pub const PATH_SEP: char = '.';

/// Which children a fan-out segment visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildFilter {
    /// Children that have content children of their own.
    Branches,
    /// Leaves, choice lists and childless branches.
    Leaves,
    Any,
}

impl ChildFilter {
    pub fn accepts(&self, is_terminal: bool) -> bool {
        match self {
            ChildFilter::Branches => !is_terminal,
            ChildFilter::Leaves => is_terminal,
            ChildFilter::Any => true,
        }
    }
}

/// One classified path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment<'a> {
    Literal(&'a str),
    Call(&'a str),
    Pick { terminal: bool },
    PickRecursive,
    All(ChildFilter),
    AllRecursive,
}

impl<'a> Segment<'a> {
    pub fn parse(segment: &'a str) -> Segment<'a> {
        match segment {
            "?" => Segment::Pick { terminal: false },
            "?$" => Segment::Pick { terminal: true },
            "??" => Segment::PickRecursive,
            "*" => Segment::All(ChildFilter::Branches),
            "*$" => Segment::All(ChildFilter::Leaves),
            "*!" => Segment::All(ChildFilter::Any),
            "**" => Segment::AllRecursive,
            s if s.len() > 2 && s.ends_with("()") => Segment::Call(&s[..s.len() - 2]),
            s => Segment::Literal(s),
        }
    }

    /// `??` and `**` consume the rest of the walk and may not be followed by more segments.
    pub fn must_be_last(&self) -> bool {
        matches!(self, Segment::PickRecursive | Segment::AllRecursive)
    }
}

pub fn split_path(path: &str) -> Vec<String> {
    path.split(PATH_SEP).map(str::to_string).collect()
}

pub fn join_path<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<&str>>()
        .join(".")
}

/// Compile a selector into the ordered list of concrete paths it denotes.
///
/// The cross product of all `+` alternatives is produced depth first, left to right, with
/// every prefix path emitted before its extensions.
///
/// ```
/// use toml_prompt::query::build_search_keys;
///
/// assert_eq!(
///     build_search_keys("a.b+d.c"),
///     vec!["a", "a.b", "a.b.c", "a.d", "a.d.c"]
/// );
/// assert_eq!(build_search_keys("a.b.?"), vec!["a", "a.b", "a.b.?$"]);
/// ```
pub fn build_search_keys(selector: &str) -> Vec<String> {
    if selector.is_empty() {
        return Vec::new();
    }
    let segments = selector
        .split(PATH_SEP)
        .map(|alternatives| alternatives.split('+').collect::<Vec<&str>>())
        .collect::<Vec<_>>();
    let mut keys = Vec::new();
    let mut prefix = Vec::new();
    expand_segments(&segments, &mut prefix, &mut keys);
    keys
}

fn expand_segments<'a>(segments: &[Vec<&'a str>], prefix: &mut Vec<&'a str>, keys: &mut Vec<String>) {
    let Some((alternatives, rest)) = segments.split_first() else {
        return;
    };
    for key in alternatives {
        if rest.is_empty() {
            let mut path = prefix.join(".");
            if !prefix.is_empty() {
                path.push(PATH_SEP);
            }
            path.push_str(key);
            if *key == "?" || *key == "*" {
                path.push(TERMINAL_SUFFIX);
            }
            keys.push(path);
        } else {
            prefix.push(key);
            keys.push(prefix.join("."));
            expand_segments(rest, prefix, keys);
            prefix.pop();
        }
    }
}
