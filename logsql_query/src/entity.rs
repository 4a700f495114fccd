//! Compilation of `$` references into extraction units.
//!
//! `$N` picks the N-th whitespace delimited field of a line. `$<type>[k]`
//! picks the k-th match of a typed pattern, `$line` the whole line, and
//! `$user_agent[k].<field>` a part of a user agent string.
//!
//! Inside a projection an unnumbered reference continues after the highest
//! occurrence of its type seen so far, so `SELECT $ip, $ip` reads the first
//! and second address. Inside a filter it always means occurrence 1.

use std::{collections::HashMap, num::NonZeroUsize};

use crate::{Error, Result};

/// Pattern of a positional field.
pub const FIELD_PATTERN: &str = r"\S+";

/// The fixed catalogue of typed entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Ip,
    Date,
    Email,
    Quoted,
    Url,
    Phone,
    UserAgent,
    Line,
}

impl EntityType {
    /// Every type found by scanning a line, in matcher priority order.
    pub const SCANNED: [Self; 7] = [
        Self::UserAgent,
        Self::Url,
        Self::Email,
        Self::Date,
        Self::Ip,
        Self::Phone,
        Self::Quoted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Date => "date",
            Self::Email => "email",
            Self::Quoted => "quoted",
            Self::Url => "url",
            Self::Phone => "phone",
            Self::UserAgent => "user_agent",
            Self::Line => "line",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ip" => Self::Ip,
            "date" => Self::Date,
            "email" => Self::Email,
            "quoted" => Self::Quoted,
            "url" => Self::Url,
            "phone" => Self::Phone,
            "user_agent" => Self::UserAgent,
            "line" => Self::Line,
            _ => return None,
        })
    }

    /// The pattern matching one instance of this type. `$line` has none.
    pub fn pattern(&self) -> Option<&'static str> {
        Some(match self {
            Self::Ip => {
                r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9][0-9]|[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9][0-9]|[0-9])\b"
            }
            Self::Date => {
                r"\b(?:(?:19[789][0-9]|2[0-9]{3})[-/](?:0[1-9]|1[0-2])[-/](?:0[1-9]|[12][0-9]|3[01])|(?:0[1-9]|[12][0-9]|3[01])[-/](?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec|0[1-9]|1[0-2])[-/](?:19[789][0-9]|2[0-9]{3}))\b"
            }
            Self::Email => r"[\w.!#$%&'*+\-=?^`{|}~]+@(?:[\w-]+\.)+\w{2,}",
            Self::Quoted => r#""[^"]*"|'[^']*'"#,
            Self::Url => r#"(?:https?|ftp)://[^\s/$.?#"'][^()\[\]\s"']*"#,
            Self::Phone => r"(?:\(\d{3}\)|\b\d{3})[-. ]?\d{3}[-. ]?\d{4}\b",
            Self::UserAgent => {
                r#"(?:Mozilla|Opera|Links|Lynx|curl|Wget|Dalvik)/[^"\r\n]*[^"\s]"#
            }
            Self::Line => return None,
        })
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Parts of a user agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserAgentField {
    Name,
    Version,
    Os,
}

impl UserAgentField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Version => "version",
            Self::Os => "os",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "name" => Some(Self::Name),
            "version" => Some(Self::Version),
            "os" => Some(Self::Os),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// 1-indexed whitespace delimited field.
    Positional(NonZeroUsize),
    Typed {
        entity_type: EntityType,
        occurrence: NonZeroUsize,
        field: Option<UserAgentField>,
    },
}

/// How the execution layer finds an entity: the `skip + 1`-th match of
/// `pattern` in the line. A missing pattern means the whole line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    pub pattern: Option<&'static str>,
    pub skip: usize,
}

/// A compiled extraction unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Canonical reference, e.g. `$ip1` or `$user_agent2.os`.
    pub name: String,
    pub kind: EntityKind,
    pub matcher: Matcher,
}

impl Entity {
    pub fn new(kind: EntityKind) -> Self {
        let (name, matcher) = match kind {
            EntityKind::Positional(n) => (
                format!("${n}"),
                Matcher {
                    pattern: Some(FIELD_PATTERN),
                    skip: n.get() - 1,
                },
            ),
            EntityKind::Typed {
                entity_type: EntityType::Line,
                ..
            } => (
                "$line".to_string(),
                Matcher {
                    pattern: None,
                    skip: 0,
                },
            ),
            EntityKind::Typed {
                entity_type,
                occurrence,
                field,
            } => {
                let name = match field {
                    Some(field) => {
                        format!("${}{occurrence}.{}", entity_type.name(), field.name())
                    }
                    None => format!("${}{occurrence}", entity_type.name()),
                };
                (
                    name,
                    Matcher {
                        pattern: entity_type.pattern(),
                        skip: occurrence.get() - 1,
                    },
                )
            }
        };
        Self {
            name,
            kind,
            matcher,
        }
    }

    /// Key used for this entity in JSON output.
    pub fn output_name(&self) -> &str {
        self.name.trim_start_matches('$')
    }

    /// The scanned type this entity needs, if any.
    pub fn scanned_type(&self) -> Option<EntityType> {
        match self.kind {
            EntityKind::Typed { entity_type, .. } if entity_type != EntityType::Line => {
                Some(entity_type)
            }
            _ => None,
        }
    }
}

/// Which clause a reference appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Projection,
    Filter,
}

/// A reference as written, before occurrence defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reference {
    Positional(NonZeroUsize),
    Typed {
        entity_type: EntityType,
        occurrence: Option<NonZeroUsize>,
        field: Option<UserAgentField>,
    },
}

fn parse_reference(token: &str) -> Result<Reference> {
    let body = token
        .strip_prefix('$')
        .ok_or_else(|| Error::Parse(format!("'{token}' is not an entity reference")))?;
    if body.is_empty() {
        return Err(Error::Parse("empty entity reference '$'".to_string()));
    }

    if body.bytes().all(|b| b.is_ascii_digit()) {
        return body
            .parse::<NonZeroUsize>()
            .map(Reference::Positional)
            .map_err(|_| Error::Parse(format!("invalid field position in '{token}'")));
    }

    let (head, field) = match body.split_once('.') {
        Some((head, field)) => (head, Some(field)),
        None => (body, None),
    };
    let name = head.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = &head[name.len()..];
    let entity_type =
        EntityType::from_name(name).ok_or_else(|| Error::UnknownEntity(token.to_string()))?;

    let occurrence = if number.is_empty() {
        None
    } else {
        Some(
            number
                .parse::<NonZeroUsize>()
                .map_err(|_| Error::Parse(format!("invalid occurrence in '{token}'")))?,
        )
    };
    if entity_type == EntityType::Line && occurrence.is_some_and(|n| n.get() != 1) {
        return Err(Error::Parse(format!("'{token}': a line has one occurrence")));
    }

    let field = match field {
        None => None,
        Some(field) if entity_type == EntityType::UserAgent => Some(
            UserAgentField::from_name(field)
                .ok_or_else(|| Error::UnknownEntity(token.to_string()))?,
        ),
        Some(_) => return Err(Error::UnknownEntity(token.to_string())),
    };

    Ok(Reference::Typed {
        entity_type,
        occurrence,
        field,
    })
}

/// Assigns occurrences to references and collects the distinct entities of
/// one statement.
#[derive(Debug, Default)]
pub struct EntityCompiler {
    highest: HashMap<EntityType, usize>,
    entities: Vec<Entity>,
}

impl EntityCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one `$` token found in `clause`.
    pub fn compile(&mut self, token: &str, clause: Clause) -> Result<&Entity> {
        let kind = match parse_reference(token)? {
            Reference::Positional(n) => EntityKind::Positional(n),
            Reference::Typed {
                entity_type,
                occurrence,
                field,
            } => {
                let highest = self.highest.get(&entity_type).copied().unwrap_or(0);
                let occurrence = match (occurrence, clause) {
                    (Some(n), _) => n.get(),
                    (None, Clause::Filter) => 1,
                    (None, Clause::Projection) if entity_type == EntityType::Line => 1,
                    // a sub-field reads the user agent most recently selected
                    (None, Clause::Projection) if field.is_some() => highest.max(1),
                    (None, Clause::Projection) => highest + 1,
                };
                if clause == Clause::Projection {
                    self.highest
                        .insert(entity_type, highest.max(occurrence));
                }
                EntityKind::Typed {
                    entity_type,
                    occurrence: NonZeroUsize::new(occurrence)
                        .ok_or_else(|| Error::Parse(format!("invalid occurrence in '{token}'")))?,
                    field,
                }
            }
        };

        let entity = Entity::new(kind);
        let index = match self.entities.iter().position(|e| e.name == entity.name) {
            Some(index) => index,
            None => {
                self.entities.push(entity);
                self.entities.len() - 1
            }
        };
        Ok(&self.entities[index])
    }

    pub fn finish(self) -> Vec<Entity> {
        self.entities
    }
}
