use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::{Connection, params};
use serde::Serialize;

use crate::chain::FilterField;
use crate::cli::BuildArgs;
use crate::download;
use crate::relation::FACT_TABLE;
use crate::storage::StoragePaths;

const RAW_VIEW: &str = "utilization_raw";

const REQUIRED_COLUMNS: [&str; 12] = [
    "provider_id",
    "credential",
    "city",
    "zip_code",
    "state",
    "provider_type",
    "place_of_service",
    "hcpcs_code",
    "num_beneficiaries",
    "avg_allowed",
    "avg_charged",
    "avg_paid",
];

#[derive(Debug, Serialize)]
struct BuildMeta {
    built_at_unix_secs: u64,
    source: String,
    duckdb_path: String,
    row_count: u64,
}

pub async fn run(opts: BuildArgs) -> anyhow::Result<()> {
    tracing::info!("providers-dashboard build");
    tracing::info!("data_dir={} source={}", opts.data_dir, opts.source);
    if opts.offline {
        tracing::info!("offline=true (will not download a missing extract)");
    }
    if opts.force_download {
        tracing::info!("force_download=true (will re-download the extract)");
    }
    if opts.rebuild {
        tracing::info!("rebuild=true (will reload the {} table)", FACT_TABLE);
    }

    let paths = StoragePaths::new(&opts.data_dir);
    paths.ensure_dirs().context("create data directories")?;

    tracing::info!("Step 1/4: ensure source extract");
    let t0 = std::time::Instant::now();
    let source = download::ensure_source(&paths, &opts).await?;
    tracing::info!(
        "Source ready in {:.1}s: {}",
        t0.elapsed().as_secs_f64(),
        source.display()
    );

    tracing::info!("Step 2/4: open DuckDB");
    let conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    let _ = conn.execute("PRAGMA threads=4", []);

    tracing::info!("Step 3/4: load {}", FACT_TABLE);
    let t1 = std::time::Instant::now();
    if opts.rebuild || !table_exists(&conn, FACT_TABLE)? {
        load_utilization(&conn, &source).with_context(|| format!("load {FACT_TABLE}"))?;
        tracing::info!("Loaded {} in {:.1}s", FACT_TABLE, t1.elapsed().as_secs_f64());
    } else {
        tracing::info!("DuckDB table {} already exists; skipping", FACT_TABLE);
    }

    tracing::info!("Step 4/4: index filter columns + write meta.json");
    let t2 = std::time::Instant::now();
    create_filter_indexes(&conn).context("create filter indexes")?;
    let row_count = one_u64(&conn, &format!("SELECT COUNT(*)::BIGINT FROM {FACT_TABLE}"))?;
    tracing::info!(
        "Indexes ready in {:.1}s ({} rows)",
        t2.elapsed().as_secs_f64(),
        row_count
    );

    let meta = BuildMeta {
        built_at_unix_secs: unix_now_secs(),
        source: opts.source.clone(),
        duckdb_path: paths.duckdb_path.display().to_string(),
        row_count,
    };
    write_json(&paths.meta_path, &meta).context("write meta.json")?;

    tracing::info!("Build complete.");
    tracing::info!("DuckDB: {}", paths.duckdb_path.display());
    Ok(())
}

/// Replaces the fact table with the rows of `source` (CSV or parquet).
/// Text columns are trimmed with blanks stored as NULL; a missing `record_id`
/// column is generated from row order.
pub fn load_utilization(conn: &Connection, source: &Path) -> anyhow::Result<u64> {
    let quoted = sql_quote_path(source);
    let reader = if is_parquet(source) {
        format!("read_parquet('{quoted}')")
    } else {
        // all_varchar keeps leading zeros in zip codes
        format!("read_csv_auto('{quoted}', header = true, all_varchar = true)")
    };
    conn.execute_batch(&format!(
        "CREATE OR REPLACE VIEW {RAW_VIEW} AS SELECT * FROM {reader}"
    ))?;

    let columns = view_columns(conn, RAW_VIEW)?;
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "source {} is missing columns: {}",
            source.display(),
            missing.join(", ")
        ));
    }
    let has = |c: &str| columns.iter().any(|have| have == c);

    let record_id = if has("record_id") {
        "CAST(record_id AS BIGINT)"
    } else {
        "ROW_NUMBER() OVER ()"
    };
    let hcpcs_desc = if has("hcpcs_desc") {
        text_column("hcpcs_desc")
    } else {
        "CAST(NULL AS TEXT)".to_string()
    };

    conn.execute_batch(&format!("DROP TABLE IF EXISTS {FACT_TABLE}"))?;
    let sql = format!(
        r#"
        CREATE TABLE {FACT_TABLE} AS
        SELECT
          {record_id} AS record_id,
          TRY_CAST(provider_id AS BIGINT) AS provider_id,
          {credential} AS credential,
          {city} AS city,
          {zip_code} AS zip_code,
          {state} AS state,
          {provider_type} AS provider_type,
          {place_of_service} AS place_of_service,
          {hcpcs_code} AS hcpcs_code,
          {hcpcs_desc} AS hcpcs_desc,
          TRY_CAST(num_beneficiaries AS BIGINT) AS num_beneficiaries,
          TRY_CAST(avg_allowed AS DOUBLE) AS avg_allowed,
          TRY_CAST(avg_charged AS DOUBLE) AS avg_charged,
          TRY_CAST(avg_paid AS DOUBLE) AS avg_paid
        FROM {RAW_VIEW}
    "#,
        credential = text_column("credential"),
        city = text_column("city"),
        zip_code = text_column("zip_code"),
        state = text_column("state"),
        provider_type = text_column("provider_type"),
        place_of_service = text_column("place_of_service"),
        hcpcs_code = text_column("hcpcs_code"),
    );
    conn.execute_batch(&sql)?;
    conn.execute_batch(&format!("DROP VIEW IF EXISTS {RAW_VIEW}"))?;

    one_u64(conn, &format!("SELECT COUNT(*)::BIGINT FROM {FACT_TABLE}"))
}

fn text_column(col: &str) -> String {
    format!("NULLIF(TRIM(CAST({col} AS VARCHAR)), '')")
}

fn is_parquet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"))
}

/// One index per chain column; option queries filter on every upstream column.
fn create_filter_indexes(conn: &Connection) -> anyhow::Result<()> {
    for field in FilterField::ALL {
        let col = field.column();
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{FACT_TABLE}_{col} ON {FACT_TABLE} ({col})"
        ))?;
    }
    Ok(())
}

fn view_columns(conn: &Connection, view: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT LOWER(column_name)
        FROM information_schema.columns
        WHERE table_schema = 'main' AND table_name = ?
        ORDER BY ordinal_position
    "#,
    )?;
    let rows = stmt.query_map(params![view], |row| row.get::<usize, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(
        r#"
        SELECT COUNT(*)::BIGINT
        FROM information_schema.tables
        WHERE table_schema = 'main' AND table_name = ?
    "#,
    )?;
    let count: i64 = stmt.query_row(params![name], |row| row.get(0))?;
    Ok(count > 0)
}

fn one_u64(conn: &Connection, sql: &str) -> anyhow::Result<u64> {
    let mut stmt = conn.prepare(sql)?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v.max(0) as u64)
}

fn write_json(path: &Path, v: &impl Serialize) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = serde_json::to_string_pretty(v)?;
    std::fs::write(path, s)?;
    Ok(())
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn sql_quote_path(path: &Path) -> String {
    // DuckDB expects single-quoted string literals; escape embedded single quotes.
    path.display().to_string().replace('\'', "''")
}
