//! Turning one restricted SQL statement into a [`QueryPlan`].
//!
//! The table name and `$` references are not valid SQL identifiers in every
//! form the query language allows (`FROM my-logs`, `$user_agent.os`), so
//! both are found on the token stream and rewritten before the statement
//! reaches the SQL parser: the table becomes [`SOURCE_NAME`] and every entity
//! becomes a double quoted identifier holding its canonical name.

use std::ops::Range;

use logsql_config::is_valid_table_name;
use sqlparser::{
    ast::{Expr, Query, Select, SelectItem, SetExpr, Statement, Value as SqlValue},
    dialect::GenericDialect,
    parser::Parser,
};
use tracing::debug;

use crate::{
    Error, Result,
    entity::{Clause, Entity, EntityCompiler, EntityType},
    lexer::{Token, TokenKind, tokenize},
    predicate::{Operand, Predicate},
};

/// Name every statement selects from once rewritten.
pub const SOURCE_NAME: &str = "s3object";

/// Keywords of the relational features the engine does not provide.
const UNSUPPORTED_KEYWORDS: [&str; 8] = [
    "join",
    "group",
    "order",
    "having",
    "union",
    "intersect",
    "except",
    "offset",
];

/// A projected value.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Key in JSON output.
    pub name: String,
    pub source: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `SELECT *`
    Wildcard,
    Columns(Vec<Column>),
}

/// Everything needed to run one statement against any object of a table.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub table: String,
    /// The statement as pushed down, e.g. `SELECT "$ip1" FROM s3object`.
    pub rewritten_expression: String,
    pub entities: Vec<Entity>,
    pub projection: Projection,
    pub predicate: Option<Predicate>,
    /// Maximum number of records across all objects.
    pub limit: Option<usize>,
}

impl QueryPlan {
    /// Entity types that must be scanned for in each line.
    pub fn scanned_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> =
            self.entities.iter().filter_map(Entity::scanned_type).collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Location of the table name following the first top-level `FROM`.
fn table_span(statement: &str, tokens: &[Token<'_>]) -> Result<(Range<usize>, Range<usize>)> {
    let mut depth = 0usize;
    let from = tokens
        .iter()
        .find(|t| {
            match t.kind {
                TokenKind::Open => depth += 1,
                TokenKind::Close => depth = depth.saturating_sub(1),
                _ => {}
            }
            depth == 0 && t.is_keyword("from")
        })
        .ok_or_else(|| Error::Parse("expected FROM <table>".to_string()))?;

    let bytes = statement.as_bytes();
    let start = from.end()
        + bytes[from.end()..]
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
    if start == bytes.len() {
        return Err(Error::Parse("missing table name after FROM".to_string()));
    }

    let end = match tokens.iter().find(|t| t.start == start) {
        Some(t) if t.kind == TokenKind::Quoted => t.end(),
        _ => {
            start
                + bytes[start..]
                    .iter()
                    .take_while(|b| !b.is_ascii_whitespace() && !b";,()".contains(b))
                    .count()
        }
    };
    if end == start {
        return Err(Error::Parse("missing table name after FROM".to_string()));
    }
    Ok((from.span(), start..end))
}

fn unquote(name: &str) -> &str {
    let quoted = name.len() >= 2
        && [b'"', b'\'', b'`'].contains(&name.as_bytes()[0])
        && name.as_bytes()[0] == name.as_bytes()[name.len() - 1];
    if quoted { &name[1..name.len() - 1] } else { name }
}

fn checked_table(statement: &str, span: Range<usize>) -> Result<String> {
    let table = unquote(&statement[span]);
    if !is_valid_table_name(table) {
        return Err(Error::InvalidTableName(table.to_string()));
    }
    Ok(table.to_string())
}

/// The table a statement selects from.
pub fn extract_table(statement: &str) -> Result<String> {
    let tokens = tokenize(statement)?;
    let (_, span) = table_span(statement, &tokens)?;
    checked_table(statement, span)
}

/// Plan one statement.
pub fn plan(statement: &str) -> Result<QueryPlan> {
    let tokens = tokenize(statement)?;

    match tokens.iter().find(|t| t.kind != TokenKind::Whitespace) {
        None => return Err(Error::Parse("empty statement".to_string())),
        Some(t) if t.is_keyword("select") => {}
        Some(t) => {
            return Err(Error::Parse(format!(
                "only SELECT statements are supported, found '{}'",
                t.text
            )));
        }
    }

    let (from, table_span) = table_span(statement, &tokens)?;
    let table = checked_table(statement, table_span.clone())?;

    if let Some(t) = tokens.iter().find(|t| {
        !table_span.contains(&t.start) && UNSUPPORTED_KEYWORDS.iter().any(|k| t.is_keyword(k))
    }) {
        return Err(Error::Parse(format!(
            "{} is not supported",
            t.text.to_ascii_uppercase()
        )));
    }

    let mut compiler = EntityCompiler::new();
    let mut edits = vec![(table_span, SOURCE_NAME.to_string())];
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Entity) {
        let clause = if token.start < from.start {
            Clause::Projection
        } else {
            Clause::Filter
        };
        let entity = compiler.compile(token.text, clause)?;
        edits.push((token.span(), format!("\"{}\"", entity.name)));
    }
    edits.sort_by_key(|(span, _)| span.start);
    let entities = compiler.finish();

    let mut rewritten = String::with_capacity(statement.len() + 16);
    let mut copied = 0;
    for (span, replacement) in edits {
        rewritten.push_str(&statement[copied..span.start]);
        rewritten.push_str(&replacement);
        copied = span.end;
    }
    rewritten.push_str(&statement[copied..]);

    let query = parse_query(&rewritten)?;
    let select = single_select(&query)?;

    let limit = query.limit.as_ref().map(parse_limit).transpose()?;
    let projection = compile_projection(&select.projection, &entities)?;
    let predicate = select
        .selection
        .as_ref()
        .map(|expr| Predicate::compile(expr, &entities))
        .transpose()?;

    let plan = QueryPlan {
        table,
        rewritten_expression: Statement::Query(query).to_string(),
        entities,
        projection,
        predicate,
        limit,
    };
    debug!(table = %plan.table, expression = %plan.rewritten_expression, entities = plan.entities.len(), "planned statement");
    Ok(plan)
}

fn parse_query(sql: &str) -> Result<Box<Query>> {
    let mut statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| Error::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(Error::Parse("expected exactly one statement".to_string()));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        _ => Err(Error::Parse("only SELECT statements are supported".to_string())),
    }
}

fn single_select(query: &Query) -> Result<&Select> {
    if query.with.is_some() {
        return Err(Error::Parse("WITH is not supported".to_string()));
    }
    if query.offset.is_some() || query.fetch.is_some() {
        return Err(Error::Parse("OFFSET is not supported".to_string()));
    }
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(Error::Parse(
            "only a single SELECT over one table is supported".to_string(),
        ));
    };
    match select.from.as_slice() {
        [relation] if relation.joins.is_empty() => {}
        _ => {
            return Err(Error::Parse(
                "exactly one table must be selected from, without joins".to_string(),
            ));
        }
    }
    if select.distinct.is_some() {
        return Err(Error::Parse("DISTINCT is not supported".to_string()));
    }
    if select.having.is_some() {
        return Err(Error::Parse("HAVING is not supported".to_string()));
    }
    Ok(select)
}

fn parse_limit(expr: &Expr) -> Result<usize> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse::<usize>()
            .map_err(|_| Error::Parse(format!("invalid LIMIT '{n}'"))),
        other => Err(Error::Parse(format!("invalid LIMIT '{other}'"))),
    }
}

fn compile_projection(items: &[SelectItem], entities: &[Entity]) -> Result<Projection> {
    if let [SelectItem::Wildcard(_)] = items {
        return Ok(Projection::Wildcard);
    }

    let columns = items
        .iter()
        .map(|item| {
            let (expr, alias) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
                _ => {
                    return Err(Error::Parse(
                        "* cannot be combined with other columns".to_string(),
                    ));
                }
            };
            let source = match expr {
                Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                    Operand::compile(expr, entities)?
                }
                other => {
                    return Err(Error::Parse(format!(
                        "unsupported projection '{other}', only columns and entities can be selected"
                    )));
                }
            };
            let name = alias.unwrap_or_else(|| match &source {
                Operand::Entity(i) => entities[*i].output_name().to_string(),
                Operand::Field(path) => path.join("."),
                Operand::Literal(_) => String::new(),
            });
            Ok(Column { name, source })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Projection::Columns(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entity_names(plan: &QueryPlan) -> Vec<&str> {
        plan.entities.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn rewrites_table_and_entities() {
        let plan = plan("SELECT $ip, $1 FROM weblog").unwrap();
        assert_eq!(plan.table, "weblog");
        assert_eq!(
            plan.rewritten_expression,
            r#"SELECT "$ip1", "$1" FROM s3object"#
        );
        assert_eq!(entity_names(&plan), vec!["$ip1", "$1"]);
        assert_eq!(
            plan.projection,
            Projection::Columns(vec![
                Column {
                    name: "ip1".to_string(),
                    source: Operand::Entity(0)
                },
                Column {
                    name: "1".to_string(),
                    source: Operand::Entity(1)
                },
            ])
        );
        assert!(plan.predicate.is_none());
        assert_eq!(plan.limit, None);
    }

    #[test]
    fn hyphenated_and_quoted_tables() {
        let plan = plan("select * from my-logs where a = 1 limit 5").unwrap();
        assert_eq!(plan.table, "my-logs");
        assert_eq!(plan.projection, Projection::Wildcard);
        assert_eq!(plan.limit, Some(5));
        assert_eq!(
            plan.rewritten_expression,
            "SELECT * FROM s3object WHERE a = 1 LIMIT 5"
        );

        assert_eq!(extract_table(r#"SELECT * FROM "weblog""#).unwrap(), "weblog");
        assert_eq!(extract_table("SELECT * FROM `weblog`;").unwrap(), "weblog");
    }

    #[test]
    fn repeated_entities_in_projection() {
        let plan = plan("SELECT $ip, $ip, $ip FROM t1").unwrap();
        assert_eq!(entity_names(&plan), vec!["$ip1", "$ip2", "$ip3"]);
        let occurrences: Vec<usize> = plan
            .entities
            .iter()
            .map(|e| match e.kind {
                EntityKind::Typed { occurrence, .. } => occurrence.get(),
                EntityKind::Positional(_) => 0,
            })
            .collect();
        assert_eq!(occurrences, vec![1, 2, 3]);
    }

    #[test]
    fn unnumbered_and_numbered_plan_identically() {
        let a = plan("SELECT $ip FROM t1 WHERE $ip LIKE '10.%'").unwrap();
        let b = plan("SELECT $ip1 FROM t1 WHERE $ip1 LIKE '10.%'").unwrap();
        assert_eq!(a.entities, b.entities);
        assert_eq!(a.rewritten_expression, b.rewritten_expression);
    }

    #[test]
    fn filter_entities_default_to_first_occurrence() {
        let plan = plan("SELECT $email, $email FROM t1 WHERE $email = 'a@b.io'").unwrap();
        assert_eq!(entity_names(&plan), vec!["$email1", "$email2"]);
        assert_eq!(
            plan.rewritten_expression,
            r#"SELECT "$email1", "$email2" FROM s3object WHERE "$email1" = 'a@b.io'"#
        );
    }

    #[test]
    fn entities_in_strings_are_left_alone() {
        let plan = plan("SELECT $line FROM t1 WHERE $line LIKE '%$ip%'").unwrap();
        assert_eq!(entity_names(&plan), vec!["$line"]);
        assert!(plan.scanned_types().is_empty());
    }

    #[test]
    fn json_columns_and_aliases() {
        let plan = plan("SELECT request.method AS m, status, $user_agent.os FROM api").unwrap();
        assert_eq!(
            plan.projection,
            Projection::Columns(vec![
                Column {
                    name: "m".to_string(),
                    source: Operand::Field(vec!["request".to_string(), "method".to_string()])
                },
                Column {
                    name: "status".to_string(),
                    source: Operand::Field(vec!["status".to_string()])
                },
                Column {
                    name: "user_agent1.os".to_string(),
                    source: Operand::Entity(0)
                },
            ])
        );
        assert_eq!(plan.scanned_types(), vec![EntityType::UserAgent]);
    }

    #[test]
    fn keywords_inside_table_names() {
        let plan = plan("SELECT * FROM order-events").unwrap();
        assert_eq!(plan.table, "order-events");
    }

    #[test]
    fn from_inside_parentheses_is_not_the_table() {
        let plan = plan("SELECT * FROM weblog WHERE a IN (SELECT 1 FROM other)");
        assert!(matches!(plan, Err(Error::Parse(_))));
        assert_eq!(
            extract_table("SELECT * FROM weblog WHERE a IN (SELECT 1 FROM other)").unwrap(),
            "weblog"
        );
    }

    #[test]
    fn unsupported_statements() {
        for sql in [
            "",
            "   ",
            "DELETE FROM weblog",
            "INSERT INTO weblog VALUES (1)",
            "SELECT $ip",
            "SELECT * FROM",
            "SELECT * FROM weblog, other",
            "SELECT * FROM weblog JOIN other ON a = b",
            "SELECT count(*) FROM weblog GROUP BY $ip",
            "SELECT * FROM weblog ORDER BY a",
            "SELECT * FROM weblog LIMIT 10 OFFSET 2",
            "SELECT * FROM weblog UNION SELECT * FROM other",
            "SELECT a FROM weblog HAVING a > 1",
            "SELECT DISTINCT a FROM weblog",
            "SELECT upper(a) FROM weblog",
            "SELECT *, a FROM weblog",
            "SELECT * FROM weblog LIMIT -1",
            "SELECT * FROM weblog WHERE",
            "SELECT * FROM weblog WHERE a = 'unterminated",
        ] {
            assert!(matches!(plan(sql), Err(Error::Parse(_))), "{sql:?}");
        }
    }

    #[test]
    fn unknown_entities() {
        assert_eq!(
            plan("SELECT $mac FROM weblog").unwrap_err(),
            Error::UnknownEntity("$mac".to_string())
        );
        assert!(matches!(
            plan("SELECT $0 FROM weblog"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn invalid_table_names() {
        for (sql, table) in [
            ("SELECT * FROM 1weblog", "1weblog"),
            ("SELECT * FROM a", "a"),
            ("SELECT * FROM web.log", "web.log"),
            (r#"SELECT * FROM "web log""#, "web log"),
            ("SELECT * FROM -x", "-x"),
        ] {
            assert_eq!(
                extract_table(sql).unwrap_err(),
                Error::InvalidTableName(table.to_string()),
                "{sql}"
            );
            assert_eq!(
                plan(sql).unwrap_err(),
                Error::InvalidTableName(table.to_string()),
                "{sql}"
            );
        }
    }

    fn table_name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9_-]{1,30}"
    }

    fn from_keyword() -> impl Strategy<Value = String> {
        prop::collection::vec(any::<bool>(), 4).prop_map(|upper| {
            "from"
                .chars()
                .zip(upper)
                .map(|(c, u)| if u { c.to_ascii_uppercase() } else { c })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn extracts_the_table_after_from(
            table in table_name(),
            from in from_keyword(),
            before in "[ \t\n]{1,3}",
            after in "[ \t\n]{0,3}",
        ) {
            let sql = format!("SELECT $ip, $2{before}{from}{before}{table}{after}");
            prop_assert_eq!(extract_table(&sql).unwrap(), table.clone());

            let sql = format!("SELECT * {from}{before}{table}{before}WHERE $ip = 'from x'{after}");
            prop_assert_eq!(extract_table(&sql).unwrap(), table);
        }

        #[test]
        fn rejects_names_outside_the_grammar(
            table in "[0-9_-][A-Za-z0-9_-]{0,10}|[A-Za-z]",
        ) {
            let sql = format!("SELECT * FROM {table}");
            prop_assert_eq!(extract_table(&sql).unwrap_err(), Error::InvalidTableName(table));
        }
    }
}
