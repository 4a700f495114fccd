//! Finding typed entities in a line.

use regex::{Captures, Regex, RegexBuilder};

use crate::entity::{EntityType, UserAgentField};

/// Compiled matchers can exceed the default limit once unicode classes of
/// several entity types are combined.
const REGEX_SIZE_LIMIT: usize = 1 << 26;

const SCANNED_COUNT: usize = EntityType::SCANNED.len();

/// Every match of each requested entity type in one line, in line order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntityMatches<'a> {
    matches: [Vec<&'a str>; SCANNED_COUNT],
}

impl<'a> EntityMatches<'a> {
    /// The `occurrence`-th (1-indexed) match of `entity_type`.
    pub fn get(&self, entity_type: EntityType, occurrence: usize) -> Option<&'a str> {
        occurrence
            .checked_sub(1)
            .and_then(|i| self.all(entity_type).get(i).copied())
    }

    pub fn all(&self, entity_type: EntityType) -> &[&'a str] {
        self.matches
            .get(entity_type.index())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn push(&mut self, entity_type: EntityType, value: &'a str) {
        if let Some(bucket) = self.matches.get_mut(entity_type.index()) {
            bucket.push(value);
        }
    }
}

/// Finds entities in a line.
pub trait EntityScanner: std::fmt::Debug + Send + Sync + 'static {
    fn scan<'a>(&self, line: &'a str) -> EntityMatches<'a>;
}

/// Scans a line once with a single alternation of the requested types.
///
/// Where two types could match at the same position the one earlier in
/// [`EntityType::SCANNED`] wins. The interior of a quoted string is scanned
/// again for the other types, so an address inside quotes is both part of
/// `$quoted` and an `$ip`.
#[derive(Debug, Clone)]
pub struct RegexScanner {
    types: Vec<EntityType>,
    outer: Option<Regex>,
    inner: Option<Regex>,
}

impl RegexScanner {
    pub fn new(types: impl IntoIterator<Item = EntityType>) -> Result<Self, regex::Error> {
        let requested: Vec<EntityType> = types.into_iter().collect();
        let types: Vec<EntityType> = EntityType::SCANNED
            .into_iter()
            .filter(|t| requested.contains(t))
            .collect();
        let inner_types: Vec<EntityType> = types
            .iter()
            .copied()
            .filter(|t| *t != EntityType::Quoted)
            .collect();

        let outer = build(&types)?;
        let inner = if types.contains(&EntityType::Quoted) {
            build(&inner_types)?
        } else {
            None
        };
        Ok(Self {
            types,
            outer,
            inner,
        })
    }

    pub fn types(&self) -> &[EntityType] {
        &self.types
    }

    fn matched<'a>(&self, captures: &Captures<'a>) -> Option<(EntityType, &'a str)> {
        self.types.iter().find_map(|t| {
            captures
                .name(t.name())
                .map(|m| (*t, m.as_str()))
        })
    }
}

fn build(types: &[EntityType]) -> Result<Option<Regex>, regex::Error> {
    if types.is_empty() {
        return Ok(None);
    }
    let alternation = types
        .iter()
        .filter_map(|t| t.pattern().map(|p| format!("(?P<{}>{p})", t.name())))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map(Some)
}

impl EntityScanner for RegexScanner {
    fn scan<'a>(&self, line: &'a str) -> EntityMatches<'a> {
        let mut matches = EntityMatches::default();
        let Some(outer) = &self.outer else {
            return matches;
        };

        for captures in outer.captures_iter(line) {
            let Some((entity_type, value)) = self.matched(&captures) else {
                continue;
            };
            if entity_type != EntityType::Quoted {
                matches.push(entity_type, value);
                continue;
            }

            let interior = unquote(value);
            matches.push(EntityType::Quoted, interior);
            if let Some(inner) = &self.inner {
                for captures in inner.captures_iter(interior) {
                    if let Some((entity_type, value)) = self.matched(&captures) {
                        matches.push(entity_type, value);
                    }
                }
            }
        }
        matches
    }
}

fn unquote(quoted: &str) -> &str {
    if quoted.len() >= 2 {
        &quoted[1..quoted.len() - 1]
    } else {
        quoted
    }
}

/// Browser tokens in the order they must be checked: several browsers also
/// announce the engines they are compatible with.
const BROWSERS: [(&str, &str); 9] = [
    ("Edg/", "Edge"),
    ("OPR/", "Opera"),
    ("Chrome/", "Chrome"),
    ("CriOS/", "Chrome"),
    ("Firefox/", "Firefox"),
    ("FxiOS/", "Firefox"),
    ("Safari/", "Safari"),
    ("curl/", "curl"),
    ("Wget/", "Wget"),
];

const OPERATING_SYSTEMS: [(&str, &str); 9] = [
    ("Windows Phone", "Windows Phone"),
    ("Windows", "Windows"),
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("CrOS", "Chrome OS"),
    ("Mac OS X", "Mac OS X"),
    ("Linux", "Linux"),
    ("FreeBSD", "FreeBSD"),
];

/// Extract `field` from a user agent string.
pub fn user_agent_field(user_agent: &str, field: UserAgentField) -> Option<&str> {
    match field {
        UserAgentField::Name => browser(user_agent).map(|(name, _)| name),
        UserAgentField::Version => browser(user_agent).and_then(|(_, version)| version),
        UserAgentField::Os => OPERATING_SYSTEMS
            .iter()
            .find(|(token, _)| user_agent.contains(token))
            .map(|(_, os)| *os),
    }
}

fn browser(user_agent: &str) -> Option<(&str, Option<&str>)> {
    for (token, name) in BROWSERS {
        if let Some(start) = user_agent.find(token) {
            let version = if name == "Safari" {
                version_after(user_agent, "Version/")
                    .or_else(|| version_at(user_agent, start + token.len()))
            } else {
                version_at(user_agent, start + token.len())
            };
            return Some((name, version));
        }
    }

    // fall back to the leading product token, e.g. `Lynx/2.8.9rel.1`
    let (product, rest) = user_agent.split_once('/')?;
    if product.is_empty() || product.contains(char::is_whitespace) {
        return None;
    }
    Some((product, version_at(user_agent, user_agent.len() - rest.len())))
}

fn version_after<'a>(user_agent: &'a str, token: &str) -> Option<&'a str> {
    user_agent
        .find(token)
        .and_then(|start| version_at(user_agent, start + token.len()))
}

fn version_at(user_agent: &str, start: usize) -> Option<&str> {
    let rest = user_agent.get(start..)?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ';' || c == ')' || c == '(')
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}
