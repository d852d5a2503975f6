//! SELECT extraction
//!
//! The grammar lives in the `sqlparser` crate; this module is the only
//! place that touches its AST. It boils a parsed SELECT down to the small
//! summary the partitioning analysis needs: table references with joins,
//! equality predicates, area-restrictor calls, and the clause text needed to
//! re-render per-chunk queries. Everything else in the analyzer works on the
//! summary, never on the AST.

use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator,
    LimitClause, ObjectNamePart, OrderByKind, SelectItem, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::error::{CzarError, CzarResult};

/// Aggregate functions the merge synthesizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(Self::Count),
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "avg" => Some(Self::Avg),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Avg => "AVG",
        }
    }
}

/// One aggregate call in the projection.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub kind: AggregateKind,
    /// Argument text, `*` for `COUNT(*)`.
    pub arg_sql: String,
}

/// One projection item, rendered back to SQL text.
#[derive(Debug, Clone)]
pub struct ProjectionItem {
    pub sql: String,
    pub alias: Option<String>,
    pub aggregate: Option<Aggregate>,
    /// Bare column name when the item is a plain (possibly qualified)
    /// column reference.
    pub column: Option<String>,
}

/// How a table entered the FROM list.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    /// Join keyword text, e.g. `JOIN` or `LEFT OUTER JOIN`.
    pub kind_sql: String,
    pub on_sql: Option<String>,
    pub outer: bool,
}

/// A table reference with optional alias and join context.
#[derive(Debug, Clone)]
pub struct TableRefSummary {
    pub db: Option<String>,
    pub table: String,
    pub alias: Option<String>,
    /// `None` for the first FROM entry and comma-joined tables.
    pub join: Option<JoinSpec>,
}

impl TableRefSummary {
    /// The name other clauses use to qualify this table's columns.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// A possibly-qualified column reference inside a predicate.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
}

/// An equality predicate between two column references.
#[derive(Debug, Clone)]
pub struct EqPredicate {
    pub left: ColumnRef,
    pub right: ColumnRef,
    /// True when the predicate sits in the ON clause of an outer join.
    pub in_outer_on: bool,
}

/// A `qserv_areaspec_*` call found in the WHERE clause.
#[derive(Debug, Clone)]
pub struct RestrictorCall {
    /// Lower-cased function name.
    pub name: String,
    pub args: Vec<String>,
}

/// Everything the analyzer needs to know about one SELECT.
#[derive(Debug, Clone, Default)]
pub struct SelectSummary {
    pub projection: Vec<ProjectionItem>,
    pub tables: Vec<TableRefSummary>,
    pub join_predicates: Vec<EqPredicate>,
    pub restrictors: Vec<RestrictorCall>,
    /// WHERE conjuncts with restrictor calls removed.
    pub where_conjuncts: Vec<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<String>,
    pub distinct: bool,
    pub limit: Option<u64>,
}

impl SelectSummary {
    pub fn has_aggregates(&self) -> bool {
        self.projection.iter().any(|p| p.aggregate.is_some())
    }

    /// Whether the final result needs a merge step beyond a plain append.
    pub fn needs_merge(&self) -> bool {
        self.has_aggregates()
            || self.distinct
            || self.limit.is_some()
            || !self.group_by.is_empty()
            || !self.order_by.is_empty()
    }
}

const RESTRICTOR_PREFIX: &str = "qserv_areaspec_";

/// Parse one SELECT statement into its analysis summary.
///
/// # Errors
/// `Syntax` when the SQL does not parse, `Unsupported` for statements or
/// constructs outside the modeled subset.
pub fn parse_select(sql: &str) -> CzarResult<SelectSummary> {
    let statements = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| CzarError::Syntax(e.to_string()))?;
    let statement = match statements.as_slice() {
        [single] => single,
        _ => {
            return Err(CzarError::Unsupported(
                "exactly one statement expected".to_string(),
            ));
        }
    };
    let Statement::Query(query) = statement else {
        return Err(CzarError::Unsupported(
            "only SELECT statements are distributed".to_string(),
        ));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(CzarError::Unsupported(
            "set operations are not modeled".to_string(),
        ));
    };

    let mut summary = SelectSummary {
        distinct: select.distinct.is_some(),
        ..SelectSummary::default()
    };

    for item in &select.projection {
        summary.projection.push(projection_item(item)?);
    }

    for twj in &select.from {
        summary
            .tables
            .push(table_ref(&twj.relation, None)?);
        for join in &twj.joins {
            let spec = join_spec(&join.join_operator)?;
            collect_on_predicates(&join.join_operator, spec.outer, &mut summary.join_predicates);
            summary.tables.push(table_ref(&join.relation, Some(spec))?);
        }
    }

    if let Some(selection) = &select.selection {
        for conjunct in conjuncts(selection) {
            if let Some(restrictor) = restrictor_call(conjunct)? {
                summary.restrictors.push(restrictor);
                continue;
            }
            if let Some(pred) = eq_predicate(conjunct, false) {
                summary.join_predicates.push(pred);
            }
            summary.where_conjuncts.push(conjunct.to_string());
        }
    }

    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        summary.group_by = exprs.iter().map(ToString::to_string).collect();
    }
    summary.having = select.having.as_ref().map(ToString::to_string);

    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            summary.order_by = exprs.iter().map(ToString::to_string).collect();
        }
    }

    summary.limit = match &query.limit_clause {
        Some(LimitClause::LimitOffset {
            limit: Some(expr), ..
        }) => expr.to_string().parse().ok(),
        Some(LimitClause::OffsetCommaLimit { limit, .. }) => limit.to_string().parse().ok(),
        _ => None,
    };

    Ok(summary)
}

fn projection_item(item: &SelectItem) -> CzarResult<ProjectionItem> {
    match item {
        SelectItem::UnnamedExpr(expr) => Ok(ProjectionItem {
            sql: expr.to_string(),
            alias: None,
            aggregate: aggregate_of(expr),
            column: bare_column(expr),
        }),
        SelectItem::ExprWithAlias { expr, alias } => Ok(ProjectionItem {
            sql: expr.to_string(),
            alias: Some(alias.value.clone()),
            aggregate: aggregate_of(expr),
            column: bare_column(expr),
        }),
        SelectItem::Wildcard(_) => Ok(ProjectionItem {
            sql: "*".to_string(),
            alias: None,
            aggregate: None,
            column: None,
        }),
        SelectItem::QualifiedWildcard(kind, _) => Ok(ProjectionItem {
            sql: format!("{kind}.*"),
            alias: None,
            aggregate: None,
            column: None,
        }),
    }
}

fn aggregate_of(expr: &Expr) -> Option<Aggregate> {
    let Expr::Function(func) = expr else {
        return None;
    };
    if func.over.is_some() {
        return None; // window functions merge differently; not modeled
    }
    let kind = AggregateKind::from_name(&func.name.to_string().to_lowercase())?;
    let args = function_args(func)?;
    Some(Aggregate {
        kind,
        arg_sql: args.join(","),
    })
}

fn bare_column(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
        _ => None,
    }
}

fn table_ref(factor: &TableFactor, join: Option<JoinSpec>) -> CzarResult<TableRefSummary> {
    let TableFactor::Table { name, alias, .. } = factor else {
        return Err(CzarError::Unsupported(
            "derived tables and table functions are not modeled".to_string(),
        ));
    };
    let mut parts: Vec<String> = name
        .0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => ident.value.clone(),
            other => other.to_string(),
        })
        .collect();
    let table = parts
        .pop()
        .ok_or_else(|| CzarError::Syntax("empty table name".to_string()))?;
    let db = parts.pop();
    Ok(TableRefSummary {
        db,
        table,
        alias: alias.as_ref().map(|a| a.name.value.clone()),
        join,
    })
}

fn join_spec(operator: &JoinOperator) -> CzarResult<JoinSpec> {
    let (kind_sql, outer, constraint) = match operator {
        JoinOperator::Join(c) => ("JOIN", false, Some(c)),
        JoinOperator::Inner(c) => ("INNER JOIN", false, Some(c)),
        JoinOperator::Left(c) => ("LEFT JOIN", true, Some(c)),
        JoinOperator::LeftOuter(c) => ("LEFT OUTER JOIN", true, Some(c)),
        JoinOperator::Right(c) => ("RIGHT JOIN", true, Some(c)),
        JoinOperator::RightOuter(c) => ("RIGHT OUTER JOIN", true, Some(c)),
        JoinOperator::FullOuter(c) => ("FULL OUTER JOIN", true, Some(c)),
        JoinOperator::CrossJoin(_) => ("CROSS JOIN", false, None),
        _ => {
            return Err(CzarError::Unsupported(
                "join flavor is not modeled".to_string(),
            ));
        }
    };
    let on_sql = match constraint {
        Some(JoinConstraint::On(expr)) => Some(expr.to_string()),
        Some(JoinConstraint::None) | None => None,
        Some(_) => {
            return Err(CzarError::Unsupported(
                "USING and NATURAL joins are not modeled".to_string(),
            ));
        }
    };
    Ok(JoinSpec {
        kind_sql: kind_sql.to_string(),
        on_sql,
        outer,
    })
}

fn collect_on_predicates(operator: &JoinOperator, outer: bool, out: &mut Vec<EqPredicate>) {
    let constraint = match operator {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return,
    };
    if let JoinConstraint::On(expr) = constraint {
        for conjunct in conjuncts(expr) {
            if let Some(pred) = eq_predicate(conjunct, outer) {
                out.push(pred);
            }
        }
    }
}

/// Split an expression on top-level ANDs, unwrapping parentheses.
fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        Expr::Nested(inner) => conjuncts(inner),
        other => vec![other],
    }
}

fn eq_predicate(expr: &Expr, in_outer_on: bool) -> Option<EqPredicate> {
    let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = expr
    else {
        return None;
    };
    Some(EqPredicate {
        left: column_ref(left)?,
        right: column_ref(right)?,
        in_outer_on,
    })
}

fn column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            qualifier: None,
            column: ident.value.clone(),
        }),
        Expr::CompoundIdentifier(parts) => {
            let column = parts.last()?.value.clone();
            let qualifier = match parts.len() {
                2 => Some(parts[0].value.clone()),
                3 => Some(format!("{}.{}", parts[0].value, parts[1].value)),
                _ => return None,
            };
            Some(ColumnRef { qualifier, column })
        }
        _ => None,
    }
}

fn restrictor_call(expr: &Expr) -> CzarResult<Option<RestrictorCall>> {
    let Expr::Function(func) = expr else {
        return Ok(None);
    };
    let name = func.name.to_string().to_lowercase();
    if !name.starts_with(RESTRICTOR_PREFIX) {
        return Ok(None);
    }
    let args = function_args(func).ok_or_else(|| {
        CzarError::Plan(format!("{name} does not accept subquery arguments"))
    })?;
    Ok(Some(RestrictorCall { name, args }))
}

fn function_args(func: &sqlparser::ast::Function) -> Option<Vec<String>> {
    match &func.args {
        FunctionArguments::List(list) => {
            Some(list.args.iter().map(ToString::to_string).collect())
        }
        FunctionArguments::None => Some(Vec::new()),
        FunctionArguments::Subquery(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_star_is_an_aggregate() {
        let summary =
            parse_select("SELECT COUNT(*) FROM Object WHERE qserv_areaspec_box(0,0,1,1)").unwrap();
        assert_eq!(summary.projection.len(), 1);
        let agg = summary.projection[0].aggregate.as_ref().expect("aggregate");
        assert_eq!(agg.kind, AggregateKind::Count);
        assert_eq!(agg.arg_sql, "*");
        assert_eq!(summary.restrictors.len(), 1);
        assert_eq!(summary.restrictors[0].args, vec!["0", "0", "1", "1"]);
        assert!(summary.where_conjuncts.is_empty(), "restrictor removed");
    }

    #[test]
    fn join_predicates_come_from_on_clauses() {
        let summary =
            parse_select("SELECT o.id, s.flux FROM Object o JOIN Source s ON o.id=s.objectId")
                .unwrap();
        assert_eq!(summary.tables.len(), 2);
        assert_eq!(summary.tables[0].alias.as_deref(), Some("o"));
        assert_eq!(summary.tables[1].join.as_ref().unwrap().kind_sql, "JOIN");
        assert_eq!(summary.join_predicates.len(), 1);
        let pred = &summary.join_predicates[0];
        assert_eq!(pred.left.qualifier.as_deref(), Some("o"));
        assert_eq!(pred.right.column, "objectId");
        assert!(!pred.in_outer_on);
    }

    #[test]
    fn where_equalities_are_join_predicates_and_kept() {
        let summary = parse_select(
            "SELECT a.id FROM Object a, Object b WHERE a.id=b.id AND a.flux>5",
        )
        .unwrap();
        assert_eq!(summary.join_predicates.len(), 1);
        assert_eq!(summary.where_conjuncts.len(), 2, "both conjuncts survive");
    }

    #[test]
    fn order_group_limit_flags_are_extracted() {
        let summary = parse_select(
            "SELECT id, COUNT(*) FROM Object GROUP BY id ORDER BY id DESC LIMIT 10",
        )
        .unwrap();
        assert_eq!(summary.group_by, vec!["id"]);
        assert_eq!(summary.order_by, vec!["id DESC"]);
        assert_eq!(summary.limit, Some(10));
        assert!(summary.needs_merge());
    }

    #[test]
    fn non_select_statements_are_unsupported() {
        assert!(matches!(
            parse_select("INSERT INTO t VALUES (1)"),
            Err(CzarError::Unsupported(_))
        ));
        assert!(matches!(
            parse_select("SELEC nonsense"),
            Err(CzarError::Syntax(_))
        ));
    }
}
