//! Applying a plan's filter and projection to individual records.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    Error, Result,
    entity::{EntityKind, EntityType},
    front_end::{Projection, QueryPlan},
    predicate::{Datum, Operand},
    scanner::{EntityScanner, RegexScanner, user_agent_field},
};

/// How output records are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Raw lines pass through as text, projections are joined by a space.
    #[default]
    Text,
    /// Every record is a JSON object.
    Json,
}

/// One record read from an object.
#[derive(Debug, Clone, Copy)]
pub enum SourceRecord<'a> {
    /// A raw log line.
    Text(&'a str),
    /// A JSON object and its compact text.
    Json {
        text: &'a str,
        fields: &'a Map<String, Value>,
    },
}

impl<'a> SourceRecord<'a> {
    /// The text entities are extracted from.
    pub fn text(&self) -> &'a str {
        match *self {
            Self::Text(text) | Self::Json { text, .. } => text,
        }
    }

    fn field(&self, path: &[String]) -> Option<&'a Value> {
        let Self::Json { fields, .. } = *self else {
            return None;
        };
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(fields.get(first)?, |value, key| value.get(key))
    }
}

/// Filters and projects records for one statement.
#[derive(Debug)]
pub struct RecordEvaluator {
    plan: Arc<QueryPlan>,
    scanner: Arc<dyn EntityScanner>,
    format: OutputFormat,
    needs_scan: bool,
    needs_fields: bool,
}

impl RecordEvaluator {
    /// Build an evaluator scanning with a [`RegexScanner`] for the entity
    /// types the plan references.
    pub fn new(plan: Arc<QueryPlan>, format: OutputFormat) -> Result<Self> {
        let scanner = RegexScanner::new(plan.scanned_types())
            .map_err(|e| Error::Matcher(e.to_string()))?;
        Ok(Self::with_scanner(plan, Arc::new(scanner), format))
    }

    pub fn with_scanner(
        plan: Arc<QueryPlan>,
        scanner: Arc<dyn EntityScanner>,
        format: OutputFormat,
    ) -> Self {
        let needs_scan = !plan.scanned_types().is_empty();
        let needs_fields = plan
            .entities
            .iter()
            .any(|e| matches!(e.kind, EntityKind::Positional(_)));
        Self {
            plan,
            scanner,
            format,
            needs_scan,
            needs_fields,
        }
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// The rendered record if it passes the filter, without a delimiter.
    pub fn evaluate(&self, record: SourceRecord<'_>) -> Option<String> {
        let entities = self.extract(record.text());
        let resolve = |operand| self.resolve(&entities, record, operand);

        if self
            .plan
            .predicate
            .as_ref()
            .is_some_and(|predicate| !predicate.evaluate(&resolve))
        {
            return None;
        }

        let json = self.format == OutputFormat::Json || matches!(record, SourceRecord::Json { .. });
        let rendered = match (&self.plan.projection, record) {
            (Projection::Wildcard, SourceRecord::Json { text, .. }) => text.to_string(),
            (Projection::Wildcard, SourceRecord::Text(line)) if json => {
                let mut object = Map::with_capacity(1);
                object.insert(
                    EntityType::Line.name().to_string(),
                    Value::String(line.to_string()),
                );
                Value::Object(object).to_string()
            }
            (Projection::Wildcard, SourceRecord::Text(line)) => line.to_string(),
            (Projection::Columns(columns), _) if json => {
                let object: Map<String, Value> = columns
                    .iter()
                    .map(|column| {
                        let value = match &column.source {
                            Operand::Field(path) => record.field(path).cloned(),
                            other => resolve(other).as_text().map(|t| Value::String(t.into_owned())),
                        };
                        (column.name.clone(), value.unwrap_or(Value::Null))
                    })
                    .collect();
                Value::Object(object).to_string()
            }
            (Projection::Columns(columns), _) => columns
                .iter()
                .map(|column| {
                    resolve(&column.source)
                        .as_text()
                        .unwrap_or_default()
                        .into_owned()
                })
                .collect::<Vec<_>>()
                .join(" "),
        };
        Some(rendered)
    }

    fn resolve<'a>(
        &'a self,
        entities: &[Option<&'a str>],
        record: SourceRecord<'a>,
        operand: &'a Operand,
    ) -> Datum<'a> {
        match operand {
            Operand::Entity(i) => entities
                .get(*i)
                .copied()
                .flatten()
                .map_or(Datum::Null, Datum::Str),
            Operand::Field(path) => record.field(path).map_or(Datum::Null, Datum::from_json),
            Operand::Literal(literal) => Datum::from_literal(literal),
        }
    }

    /// Value of every plan entity in `line`, by entity index.
    fn extract<'a>(&self, line: &'a str) -> Vec<Option<&'a str>> {
        if self.plan.entities.is_empty() {
            return Vec::new();
        }
        let fields: Vec<&str> = if self.needs_fields {
            line.split_whitespace().collect()
        } else {
            Vec::new()
        };
        let matches = if self.needs_scan {
            self.scanner.scan(line)
        } else {
            Default::default()
        };

        self.plan
            .entities
            .iter()
            .map(|entity| match entity.kind {
                EntityKind::Positional(n) => fields.get(n.get() - 1).copied(),
                EntityKind::Typed {
                    entity_type: EntityType::Line,
                    ..
                } => Some(line),
                EntityKind::Typed {
                    entity_type,
                    occurrence,
                    field: None,
                } => matches.get(entity_type, occurrence.get()),
                EntityKind::Typed {
                    entity_type,
                    occurrence,
                    field: Some(field),
                } => matches
                    .get(entity_type, occurrence.get())
                    .and_then(|ua| user_agent_field(ua, field)),
            })
            .collect()
    }
}
