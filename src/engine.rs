use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{ResultCache, ResultKey};
use crate::chain::FilterSelection;
use crate::relation::{FactRow, GroupSum, RelationAccessor};

pub const RANK_LIMIT: usize = 10;
pub const BUCKET_WIDTH: i64 = 200;
pub const BUCKET_COUNT: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankPosition {
    Top,
    Bottom,
}

impl RankPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            RankPosition::Top => "Top",
            RankPosition::Bottom => "Bottom",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Top" => Some(RankPosition::Top),
            "Bottom" => Some(RankPosition::Bottom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankBy {
    #[serde(rename = "Avg Charged")]
    AvgCharged,
    Patients,
}

impl RankBy {
    pub fn as_str(self) -> &'static str {
        match self {
            RankBy::AvgCharged => "Avg Charged",
            RankBy::Patients => "Patients",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            RankBy::AvgCharged => "avg_charged",
            RankBy::Patients => "num_beneficiaries",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            RankBy::AvgCharged => "Average Charged Amount",
            RankBy::Patients => "Number of Patients",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Avg Charged" => Some(RankBy::AvgCharged),
            "Patients" => Some(RankBy::Patients),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankSpec {
    pub rank_position: RankPosition,
    pub rank_by: RankBy,
}

impl Default for RankSpec {
    fn default() -> Self {
        Self {
            rank_position: RankPosition::Top,
            rank_by: RankBy::AvgCharged,
        }
    }
}

impl RankSpec {
    /// Parses raw control values, substituting defaults for anything illegal.
    /// The second element is the advisory to show when a default was used.
    pub fn normalize(position: Option<&str>, by: Option<&str>) -> (Self, Option<String>) {
        let parsed_position = position.and_then(RankPosition::parse);
        let parsed_by = by.and_then(RankBy::parse);

        let mut substituted = Vec::new();
        if parsed_position.is_none() {
            substituted.push("\"Top\" will be used for the Rank Position value");
        }
        if parsed_by.is_none() {
            substituted.push("\"Avg Charged\" will be used for the Rank By value");
        }

        let advisory = if substituted.is_empty() {
            None
        } else {
            let plural = if substituted.len() > 1 { "s" } else { "" };
            Some(format!(
                "Rank Position and Rank By selections are required.  Instead of the invalid value{plural} provided, {}.",
                substituted.join(" and ")
            ))
        };

        let spec = Self {
            rank_position: parsed_position.unwrap_or(RankPosition::Top),
            rank_by: parsed_by.unwrap_or(RankBy::AvgCharged),
        };
        (spec, advisory)
    }

    pub fn title(&self) -> String {
        format!(
            "{} {RANK_LIMIT} Providers Ranked by {}",
            self.rank_position.as_str(),
            self.rank_by.describe()
        )
    }
}

/// Everything that determines a result: the settled filters and the rank spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultInputs {
    pub selection: FilterSelection,
    pub rank: RankSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedRow {
    pub provider_id: String,
    pub patients: String,
    pub avg_charged: String,
    pub avg_allowed: String,
    pub avg_paid: String,
}

impl From<&FactRow> for RankedRow {
    fn from(r: &FactRow) -> Self {
        Self {
            provider_id: format_grouped_int(r.provider_id),
            patients: format_grouped_int(r.num_beneficiaries),
            avg_charged: format_grouped(r.avg_charged),
            avg_allowed: format_grouped(r.avg_allowed),
            avg_paid: format_grouped(r.avg_paid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub labels: Vec<String>,
    pub values: Vec<i64>,
}

impl Histogram {
    pub fn total(&self) -> i64 {
        self.values.iter().sum()
    }
}

/// Immutable result for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub inputs: ResultInputs,
    pub rows: Vec<RankedRow>,
    pub histogram: Histogram,
}

impl ResultRecord {
    pub fn title(&self) -> String {
        self.inputs.rank.title()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn rank_providers(
    relation: &dyn RelationAccessor,
    inputs: &ResultInputs,
) -> anyhow::Result<Vec<RankedRow>> {
    let rows = relation.top_n(
        RANK_LIMIT,
        inputs.rank.rank_by,
        inputs.rank.rank_position,
        &inputs.selection.predicates(),
    )?;
    Ok(rows.iter().map(RankedRow::from).collect())
}

/// Lays grouped patient sums into the fixed bucket layout. The first
/// `BUCKET_COUNT - 1` buckets start at the lowest group key and step by
/// `BUCKET_WIDTH`; everything past them, and rows with no charged amount,
/// land in the overflow bucket.
pub fn build_histogram(groups: &[GroupSum]) -> Histogram {
    // With no charged amounts at all, lay out the first bucket at one width.
    let x0 = groups
        .iter()
        .filter_map(|g| g.key)
        .min()
        .unwrap_or(BUCKET_WIDTH);
    let bounds: Vec<i64> = (0..BUCKET_COUNT as i64 - 1)
        .map(|i| x0 + i * BUCKET_WIDTH)
        .collect();

    let mut labels = Vec::with_capacity(BUCKET_COUNT);
    labels.push(format!("0 - {}", format_grouped_int(bounds[0])));
    for pair in bounds.windows(2) {
        labels.push(format!(
            "{} - {}",
            format_grouped_int(pair[0]),
            format_grouped_int(pair[1])
        ));
    }
    labels.push(format!("{}+", format_grouped_int(bounds[bounds.len() - 1])));

    let mut values = vec![0i64; BUCKET_COUNT];
    for g in groups {
        match g.key.and_then(|k| bounds.iter().position(|b| *b == k)) {
            Some(i) => values[i] += g.patients,
            None => values[BUCKET_COUNT - 1] += g.patients,
        }
    }

    Histogram { labels, values }
}

pub fn compute(
    relation: &dyn RelationAccessor,
    inputs: &ResultInputs,
) -> anyhow::Result<ResultRecord> {
    let rows = rank_providers(relation, inputs)?;
    let groups = relation.group_sum(BUCKET_WIDTH, &inputs.selection.predicates())?;
    Ok(ResultRecord {
        inputs: inputs.clone(),
        rows,
        histogram: build_histogram(&groups),
    })
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub key: ResultKey,
    pub record: Arc<ResultRecord>,
    pub cached: bool,
}

/// Serves a result from the cache, computing and storing it on a miss.
/// Concurrent misses on one key may both compute; the writes are identical.
pub fn fetch_or_compute(
    relation: &dyn RelationAccessor,
    cache: &ResultCache,
    inputs: &ResultInputs,
) -> anyhow::Result<Fetched> {
    let key = ResultKey::new(inputs);
    if let Some(record) = cache.get(&key) {
        tracing::debug!("result cache hit: {}", key);
        return Ok(Fetched {
            key,
            record,
            cached: true,
        });
    }

    tracing::debug!("result cache miss: {}", key);
    let t0 = std::time::Instant::now();
    let record = Arc::new(compute(relation, inputs)?);
    tracing::info!(
        "computed result {} in {:.1}ms ({} rows, {} patients)",
        key,
        t0.elapsed().as_secs_f64() * 1000.0,
        record.rows.len(),
        record.histogram.total()
    );
    cache.put(key.clone(), Arc::clone(&record));
    Ok(Fetched {
        key,
        record,
        cached: false,
    })
}

/// Rounds to a whole unit (ties to even) and groups thousands with commas.
pub fn format_grouped(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    format_grouped_digits(value.round_ties_even() as i128)
}

pub fn format_grouped_int(value: i64) -> String {
    format_grouped_digits(value as i128)
}

fn format_grouped_digits(value: i128) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FilterField;
    use crate::testing;

    fn inputs(selection: FilterSelection, position: RankPosition, by: RankBy) -> ResultInputs {
        ResultInputs {
            selection,
            rank: RankSpec {
                rank_position: position,
                rank_by: by,
            },
        }
    }

    #[test]
    fn test_format_grouped() {
        assert_eq!(format_grouped(0.0), "0");
        assert_eq!(format_grouped(999.4), "999");
        assert_eq!(format_grouped(1234.5), "1,234");
        assert_eq!(format_grouped(1235.5), "1,236");
        assert_eq!(format_grouped(1234567.89), "1,234,568");
        assert_eq!(format_grouped(-2500.0), "-2,500");
        assert_eq!(format_grouped_int(100000), "100,000");
    }

    #[test]
    fn test_rank_spec_valid_values() {
        let (spec, advisory) = RankSpec::normalize(Some("Bottom"), Some("Patients"));
        assert_eq!(spec.rank_position, RankPosition::Bottom);
        assert_eq!(spec.rank_by, RankBy::Patients);
        assert!(advisory.is_none());
    }

    #[test]
    fn test_rank_spec_defaults_with_advisory() {
        let (spec, advisory) = RankSpec::normalize(Some(""), Some("Patients"));
        assert_eq!(spec.rank_position, RankPosition::Top);
        assert_eq!(
            advisory.as_deref(),
            Some(
                "Rank Position and Rank By selections are required.  Instead of the invalid value provided, \"Top\" will be used for the Rank Position value."
            )
        );

        let (spec, advisory) = RankSpec::normalize(None, Some("Median"));
        assert_eq!(spec, RankSpec::default());
        let advisory = advisory.unwrap();
        assert!(advisory.contains("invalid values provided"));
        assert!(advisory.ends_with("\"Avg Charged\" will be used for the Rank By value."));
    }

    #[test]
    fn test_titles() {
        let spec = RankSpec {
            rank_position: RankPosition::Bottom,
            rank_by: RankBy::Patients,
        };
        assert_eq!(spec.title(), "Bottom 10 Providers Ranked by Number of Patients");
        assert_eq!(
            RankSpec::default().title(),
            "Top 10 Providers Ranked by Average Charged Amount"
        );
    }

    #[test]
    fn test_histogram_layout() {
        let groups = vec![
            GroupSum { key: Some(200), patients: 184 },
            GroupSum { key: Some(400), patients: 80 },
            GroupSum { key: Some(1600), patients: 18 },
            GroupSum { key: Some(2800), patients: 27 },
            GroupSum { key: Some(5200), patients: 22 },
        ];
        let h = build_histogram(&groups);
        assert_eq!(h.labels.len(), BUCKET_COUNT);
        assert_eq!(h.labels[0], "0 - 200");
        assert_eq!(h.labels[1], "200 - 400");
        assert_eq!(h.labels[9], "1,800 - 2,000");
        assert_eq!(h.labels[10], "2,000+");
        assert_eq!(h.values, vec![184, 80, 0, 0, 0, 0, 0, 18, 0, 0, 49]);
    }

    #[test]
    fn test_histogram_starts_at_lowest_key() {
        let groups = vec![
            GroupSum { key: Some(600), patients: 12 },
            GroupSum { key: Some(2400), patients: 5 },
            GroupSum { key: Some(2600), patients: 7 },
        ];
        let h = build_histogram(&groups);
        assert_eq!(h.labels[0], "0 - 600");
        assert_eq!(h.labels[10], "2,400+");
        assert_eq!(h.values[0], 12);
        // 2,400 is the last boundary and still has its own bucket.
        assert_eq!(h.values[9], 5);
        assert_eq!(h.values[10], 7);
    }

    #[test]
    fn test_histogram_uncharged_rows_overflow() {
        let groups = vec![
            GroupSum { key: Some(400), patients: 10 },
            GroupSum { key: None, patients: 25 },
        ];
        let h = build_histogram(&groups);
        assert_eq!(h.labels[0], "0 - 400");
        assert_eq!(h.values[0], 10);
        assert_eq!(h.values[BUCKET_COUNT - 1], 25);
        assert_eq!(h.total(), 35);

        let only_uncharged = build_histogram(&[GroupSum { key: None, patients: 3 }]);
        assert_eq!(only_uncharged.labels[0], "0 - 200");
        assert_eq!(only_uncharged.values[BUCKET_COUNT - 1], 3);
    }

    #[test]
    fn test_histogram_empty_is_all_zero() {
        let h = build_histogram(&[]);
        assert_eq!(h.values, vec![0; BUCKET_COUNT]);
        assert_eq!(h.labels.len(), BUCKET_COUNT);
        assert_eq!(h.labels[0], "0 - 200");
    }

    #[test]
    fn test_histogram_covers_every_patient() {
        let rel = testing::duckdb_relation();
        for sel in [
            FilterSelection::new(),
            FilterSelection::new().with(FilterField::State, &["TN"]),
            FilterSelection::new().with(FilterField::State, &["KY"]),
            FilterSelection::new().with(FilterField::PlaceOfService, &["Facility"]),
        ] {
            let expected: i64 = testing::sample_facts()
                .iter()
                .filter(|f| {
                    sel.predicates()
                        .iter()
                        .all(|p| p.values.iter().any(|v| match p.field {
                            FilterField::State => v == f.state,
                            FilterField::PlaceOfService => v == f.place_of_service,
                            _ => true,
                        }))
                })
                .map(|f| f.num_beneficiaries)
                .sum();
            let record = compute(&rel, &inputs(sel, RankPosition::Top, RankBy::AvgCharged)).unwrap();
            assert_eq!(record.histogram.total(), expected);
        }
    }

    #[test]
    fn test_top_patients_scenario() {
        let rel = testing::duckdb_relation();
        let sel = FilterSelection::new()
            .with(FilterField::State, &["TN"])
            .with(FilterField::HcpcsCode, &["99213"]);
        let record = compute(&rel, &inputs(sel, RankPosition::Top, RankBy::Patients)).unwrap();

        let patients: Vec<&str> = record.rows.iter().map(|r| r.patients.as_str()).collect();
        assert_eq!(patients, vec!["60", "40", "40", "33", "27", "22"]);
        let providers: Vec<&str> = record.rows.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(providers, vec!["1,007", "1,001", "1,002", "1,004", "1,010", "1,006"]);
    }

    #[test]
    fn test_bottom_charged_over_everything() {
        let rel = testing::duckdb_relation();
        let record = compute(
            &rel,
            &inputs(FilterSelection::new(), RankPosition::Bottom, RankBy::AvgCharged),
        )
        .unwrap();
        assert_eq!(record.rows.len(), RANK_LIMIT);
        let charged: Vec<&str> = record.rows.iter().map(|r| r.avg_charged.as_str()).collect();
        assert_eq!(charged[..4], ["80", "95", "120", "130"]);
        let total: i64 = testing::sample_facts().iter().map(|f| f.num_beneficiaries).sum();
        assert_eq!(record.histogram.total(), total);
    }

    #[test]
    fn test_empty_selection_result() {
        let rel = testing::duckdb_relation();
        let sel = FilterSelection::new().with(FilterField::State, &["WY"]);
        let record = compute(&rel, &inputs(sel, RankPosition::Top, RankBy::AvgCharged)).unwrap();
        assert!(record.is_empty());
        assert_eq!(record.histogram.values, vec![0; BUCKET_COUNT]);
    }

    #[test]
    fn test_fetch_or_compute_memoizes() {
        let rel = testing::duckdb_relation();
        let cache = ResultCache::new(16, std::time::Duration::from_secs(60));
        let input = inputs(
            FilterSelection::new().with(FilterField::State, &["KY"]),
            RankPosition::Top,
            RankBy::AvgCharged,
        );

        let first = fetch_or_compute(&rel, &cache, &input).unwrap();
        assert!(!first.cached);
        let second = fetch_or_compute(&rel, &cache, &input).unwrap();
        assert!(second.cached);
        assert_eq!(first.key, second.key);
        assert!(Arc::ptr_eq(&first.record, &second.record));
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let rel = testing::duckdb_relation();
        let input = inputs(FilterSelection::new(), RankPosition::Top, RankBy::Patients);
        let a = compute(&rel, &input).unwrap();
        let b = compute(&rel, &input).unwrap();
        assert_eq!(a.rows, b.rows);
    }
}
