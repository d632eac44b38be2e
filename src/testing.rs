//! Shared fixtures: a small utilization extract loaded either into an
//! in-memory DuckDB or into a counting in-process relation.

use anyhow::anyhow;
use duckdb::{Connection, params};
use parking_lot::Mutex;

use crate::chain::{FilterField, Predicate};
use crate::engine::{RankBy, RankPosition};
use crate::relation::{
    DuckDbRelation, FactRow, GroupSum, HcpcsDescription, RelationAccessor,
};

#[derive(Debug, Clone)]
pub struct Fact {
    pub record_id: i64,
    pub provider_id: i64,
    pub credential: &'static str,
    pub city: &'static str,
    pub zip_code: &'static str,
    pub state: &'static str,
    pub provider_type: &'static str,
    pub place_of_service: &'static str,
    pub hcpcs_code: &'static str,
    pub num_beneficiaries: i64,
    pub avg_allowed: f64,
    pub avg_charged: f64,
    pub avg_paid: f64,
}

impl Fact {
    fn column(&self, field: FilterField) -> &'static str {
        match field {
            FilterField::State => self.state,
            FilterField::City => self.city,
            FilterField::ZipCode => self.zip_code,
            FilterField::PlaceOfService => self.place_of_service,
            FilterField::ProviderType => self.provider_type,
            FilterField::Credential => self.credential,
            FilterField::HcpcsCode => self.hcpcs_code,
        }
    }

    fn matches(&self, predicates: &[Predicate]) -> bool {
        predicates
            .iter()
            .all(|p| p.values.is_empty() || p.values.iter().any(|v| v == self.column(p.field)))
    }

    fn row(&self) -> FactRow {
        FactRow {
            record_id: self.record_id,
            provider_id: self.provider_id,
            num_beneficiaries: self.num_beneficiaries,
            avg_charged: self.avg_charged,
            avg_allowed: self.avg_allowed,
            avg_paid: self.avg_paid,
        }
    }
}

pub fn hcpcs_desc(code: &str) -> &'static str {
    match code {
        "99213" => "Established patient office visit, low complexity",
        "99214" => "Established patient office visit, moderate complexity",
        "99215" => "Established patient office visit, high complexity",
        _ => "Electrocardiogram, complete",
    }
}

#[allow(clippy::too_many_arguments)]
fn fact(
    record_id: i64,
    provider_id: i64,
    credential: &'static str,
    state: &'static str,
    city: &'static str,
    zip_code: &'static str,
    provider_type: &'static str,
    place_of_service: &'static str,
    hcpcs_code: &'static str,
    num_beneficiaries: i64,
    avg_charged: f64,
) -> Fact {
    Fact {
        record_id,
        provider_id,
        credential,
        city,
        zip_code,
        state,
        provider_type,
        place_of_service,
        hcpcs_code,
        num_beneficiaries,
        avg_allowed: (avg_charged * 0.4).round(),
        avg_charged,
        avg_paid: (avg_charged * 0.3).round(),
    }
}

pub fn sample_facts() -> Vec<Fact> {
    const FP: &str = "Family Practice";
    const GP: &str = "General Practice";
    const NF: &str = "Non-Facility";
    const F: &str = "Facility";
    vec![
        fact(1, 1001, "MD", "TN", "Nashville", "37203", FP, NF, "99213", 40, 150.0),
        fact(2, 1001, "MD", "TN", "Nashville", "37203", FP, NF, "99214", 25, 210.5),
        fact(3, 1002, "DO", "TN", "Nashville", "37203", GP, NF, "99213", 40, 95.0),
        fact(4, 1003, "MD", "TN", "Nashville", "37203", "Internal Medicine", F, "99215", 18, 1450.0),
        fact(5, 1004, "NP", "TN", "Nashville", "37203", FP, NF, "99213", 33, 120.0),
        fact(6, 1005, "MD", "TN", "Nashville", "37211", FP, NF, "99215", 15, 399.99),
        fact(7, 1006, "[unknown]", "TN", "Nashville", "37211", GP, F, "99213", 22, 5000.0),
        fact(8, 1007, "MD", "TN", "Memphis", "38103", FP, NF, "99213", 60, 130.0),
        fact(9, 1008, "PA", "TN", "Memphis", "38103", "Cardiology", F, "93000", 11, 80.0),
        fact(10, 1009, "MD", "TN", "Memphis", "38103", FP, NF, "99214", 40, 260.0),
        fact(11, 1010, "DO", "TN", "Memphis", "38103", GP, NF, "99213", 27, 2600.0),
        fact(12, 2001, "MD", "KY", "Louisville", "40202", FP, NF, "99213", 12, 400.0),
        fact(13, 2002, "MD", "KY", "Lexington", "40507", FP, NF, "99214", 19, 180.0),
        fact(14, 2003, "NP", "KY", "Lexington", "40507", GP, F, "99215", 31, 640.0),
    ]
}

pub fn create_fact_table(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE utilization (
          record_id BIGINT PRIMARY KEY,
          provider_id BIGINT,
          credential TEXT,
          city TEXT,
          zip_code TEXT,
          state TEXT,
          provider_type TEXT,
          place_of_service TEXT,
          hcpcs_code TEXT,
          hcpcs_desc TEXT,
          num_beneficiaries BIGINT,
          avg_allowed DOUBLE,
          avg_charged DOUBLE,
          avg_paid DOUBLE
        );
    "#,
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO utilization VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for f in sample_facts() {
        stmt.execute(params![
            f.record_id,
            f.provider_id,
            f.credential,
            f.city,
            f.zip_code,
            f.state,
            f.provider_type,
            f.place_of_service,
            f.hcpcs_code,
            hcpcs_desc(f.hcpcs_code),
            f.num_beneficiaries,
            f.avg_allowed,
            f.avg_charged,
            f.avg_paid
        ])?;
    }
    Ok(())
}

pub fn duckdb_relation() -> DuckDbRelation {
    let conn = Connection::open_in_memory().expect("open in-memory duckdb");
    create_fact_table(&conn).expect("load fixture rows");
    DuckDbRelation::from_connection(conn).expect("fixture relation")
}

pub fn memory_relation() -> MemoryRelation {
    MemoryRelation::new(sample_facts())
}

/// In-process relation that records every options query it serves.
pub struct MemoryRelation {
    facts: Vec<Fact>,
    log: Mutex<Vec<FilterField>>,
    fail_on: Mutex<Option<FilterField>>,
}

impl MemoryRelation {
    pub fn new(facts: Vec<Fact>) -> Self {
        Self {
            facts,
            log: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    pub fn queried(&self) -> Vec<FilterField> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn fail_on(&self, field: Option<FilterField>) {
        *self.fail_on.lock() = field;
    }

    fn matching<'a>(&'a self, predicates: &'a [Predicate]) -> impl Iterator<Item = &'a Fact> + 'a {
        self.facts.iter().filter(move |f| f.matches(predicates))
    }
}

impl RelationAccessor for MemoryRelation {
    fn distinct_values(
        &self,
        field: FilterField,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<String>> {
        self.log.lock().push(field);
        if *self.fail_on.lock() == Some(field) {
            return Err(anyhow!("connection reset while loading {field} options"));
        }
        let mut out: Vec<String> = self
            .matching(predicates)
            .map(|f| f.column(field).to_string())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn top_n(
        &self,
        n: usize,
        order: RankBy,
        direction: RankPosition,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<FactRow>> {
        let mut rows: Vec<FactRow> = self.matching(predicates).map(Fact::row).collect();
        rows.sort_by(|a, b| {
            let key = |r: &FactRow| match order {
                RankBy::AvgCharged => r.avg_charged,
                RankBy::Patients => r.num_beneficiaries as f64,
            };
            let primary = match direction {
                RankPosition::Top => key(b).total_cmp(&key(a)),
                RankPosition::Bottom => key(a).total_cmp(&key(b)),
            };
            primary
                .then(a.provider_id.cmp(&b.provider_id))
                .then(a.record_id.cmp(&b.record_id))
        });
        rows.truncate(n);
        Ok(rows)
    }

    fn group_sum(&self, width: i64, predicates: &[Predicate]) -> anyhow::Result<Vec<GroupSum>> {
        let mut groups: std::collections::BTreeMap<i64, i64> = Default::default();
        for f in self.matching(predicates) {
            let key = ((f.avg_charged / width as f64).floor() as i64 + 1) * width;
            *groups.entry(key).or_default() += f.num_beneficiaries;
        }
        Ok(groups
            .into_iter()
            .map(|(key, patients)| GroupSum {
                key: Some(key),
                patients,
            })
            .collect())
    }

    fn hcpcs_descriptions(
        &self,
        predicates: &[Predicate],
    ) -> anyhow::Result<Vec<HcpcsDescription>> {
        let mut codes: Vec<&str> = self.matching(predicates).map(|f| f.hcpcs_code).collect();
        codes.sort();
        codes.dedup();
        Ok(codes
            .into_iter()
            .map(|c| HcpcsDescription {
                hcpcs_code: c.to_string(),
                hcpcs_desc: Some(hcpcs_desc(c).to_string()),
            })
            .collect())
    }
}
