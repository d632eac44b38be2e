use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::{Connection, params_from_iter};
use parking_lot::Mutex;
use serde::Serialize;

use crate::chain::{FilterField, Predicate};
use crate::engine::{RankBy, RankPosition};

pub const FACT_TABLE: &str = "utilization";

/// One provider/service row as read for the ranked table.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub record_id: i64,
    pub provider_id: i64,
    pub num_beneficiaries: i64,
    pub avg_charged: f64,
    pub avg_allowed: f64,
    pub avg_paid: f64,
}

/// Patients summed over one charged-amount group. Rows without a charged
/// amount form the `None` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSum {
    pub key: Option<i64>,
    pub patients: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HcpcsDescription {
    pub hcpcs_code: String,
    pub hcpcs_desc: Option<String>,
}

/// Read access to the fact table. All predicates are ANDed; an empty slice
/// means the whole table.
pub trait RelationAccessor: Send + Sync {
    /// Distinct values of `field`'s column, ascending.
    fn distinct_values(
        &self,
        field: FilterField,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<String>>;

    /// First `n` rows ordered by `order`. Ties fall back to provider id, then
    /// record id, both ascending.
    fn top_n(
        &self,
        n: usize,
        order: RankBy,
        direction: RankPosition,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<FactRow>>;

    /// `num_beneficiaries` summed per `(floor(avg_charged / width) + 1) * width`,
    /// ascending by group key, with the NULL-charged group last.
    fn group_sum(&self, width: i64, predicates: &[Predicate]) -> anyhow::Result<Vec<GroupSum>>;

    fn hcpcs_descriptions(
        &self,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<HcpcsDescription>>;
}

pub struct DuckDbRelation {
    conn: Mutex<Connection>,
}

impl DuckDbRelation {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open duckdb at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        let count: i64 = conn
            .prepare(
                r#"
                SELECT COUNT(*)::BIGINT
                FROM information_schema.tables
                WHERE table_schema = 'main' AND table_name = ?
            "#,
            )?
            .query_row([FACT_TABLE], |row| row.get(0))?;
        if count == 0 {
            return Err(anyhow!(
                "table {FACT_TABLE} not found. Run: providers-dashboard build"
            ));
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Each query gets its own handle so concurrent sessions don't serialize on one.
    fn connection(&self) -> anyhow::Result<Connection> {
        self.conn
            .lock()
            .try_clone()
            .context("clone duckdb connection")
    }
}

impl RelationAccessor for DuckDbRelation {
    fn distinct_values(
        &self,
        field: FilterField,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<String>> {
        let col = field.column();
        let (where_sql, binds) = where_clause(predicates, &[format!("{col} IS NOT NULL")]);
        let sql = format!("SELECT {col} FROM {FACT_TABLE} {where_sql} GROUP BY {col} ORDER BY {col}");

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
            row.get::<usize, String>(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn top_n(
        &self,
        n: usize,
        order: RankBy,
        direction: RankPosition,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<FactRow>> {
        let order_col = order.column();
        let dir = match direction {
            RankPosition::Top => "DESC",
            RankPosition::Bottom => "ASC",
        };
        let (where_sql, binds) = where_clause(predicates, &[]);
        let sql = format!(
            r#"
            SELECT
              record_id,
              provider_id,
              num_beneficiaries,
              avg_charged,
              avg_allowed,
              avg_paid
            FROM {FACT_TABLE}
            {where_sql}
            ORDER BY {order_col} {dir} NULLS LAST, provider_id ASC, record_id ASC
            LIMIT {n}
        "#
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
            Ok(FactRow {
                record_id: row.get::<usize, i64>(0)?,
                provider_id: row.get::<usize, Option<i64>>(1)?.unwrap_or(0),
                num_beneficiaries: row.get::<usize, Option<i64>>(2)?.unwrap_or(0),
                avg_charged: row.get::<usize, Option<f64>>(3)?.unwrap_or(0.0),
                avg_allowed: row.get::<usize, Option<f64>>(4)?.unwrap_or(0.0),
                avg_paid: row.get::<usize, Option<f64>>(5)?.unwrap_or(0.0),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn group_sum(&self, width: i64, predicates: &[Predicate]) -> anyhow::Result<Vec<GroupSum>> {
        if width <= 0 {
            return Err(anyhow!("group width must be positive, got {width}"));
        }
        let (where_sql, binds) = where_clause(predicates, &[]);
        let sql = format!(
            r#"
            SELECT
              (CAST(FLOOR(avg_charged / {width}) AS BIGINT) + 1) * {width} AS charged_group,
              CAST(SUM(COALESCE(num_beneficiaries, 0)) AS BIGINT) AS patients
            FROM {FACT_TABLE}
            {where_sql}
            GROUP BY charged_group
            ORDER BY charged_group ASC NULLS LAST
        "#
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
            Ok(GroupSum {
                key: row.get::<usize, Option<i64>>(0)?,
                patients: row.get::<usize, i64>(1)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn hcpcs_descriptions(
        &self,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<HcpcsDescription>> {
        let (where_sql, binds) = where_clause(predicates, &["hcpcs_code IS NOT NULL".to_string()]);
        let sql = format!(
            r#"
            SELECT hcpcs_code, ANY_VALUE(hcpcs_desc) AS hcpcs_desc
            FROM {FACT_TABLE}
            {where_sql}
            GROUP BY hcpcs_code
            ORDER BY hcpcs_code ASC
        "#
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
            Ok(HcpcsDescription {
                hcpcs_code: row.get::<usize, String>(0)?,
                hcpcs_desc: row.get::<usize, Option<String>>(1)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Builds `WHERE col IN (?, ...) AND ...`; column names come from the fixed
/// chain, values are bound.
fn where_clause(predicates: &[Predicate], extra: &[String]) -> (String, Vec<String>) {
    let mut conds: Vec<String> = extra.to_vec();
    let mut binds = Vec::new();
    for p in predicates.iter().filter(|p| !p.values.is_empty()) {
        let placeholders = vec!["?"; p.values.len()].join(", ");
        conds.push(format!("{} IN ({placeholders})", p.field.column()));
        binds.extend(p.values.iter().cloned());
    }
    if conds.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", conds.join(" AND ")), binds)
    }
}
