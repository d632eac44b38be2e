//! Workbook export of a cached result.
//!
//! Three sheets: `input` echoes the selection, `data` holds the ranked rows and
//! histogram as plain numbers, and `results` presents them through formulas,
//! a table and a column chart. `results` opens as the active sheet.

use anyhow::Context;
use rust_xlsxwriter::{
    Chart, ChartType, Color, Format, FormatAlign, FormatBorder, FormatUnderline, Formula, Table,
    TableStyle, Workbook, Worksheet,
};

use crate::chain::FilterField;
use crate::engine::{RANK_LIMIT, RankedRow, ResultRecord};

pub const CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const FILE_NAME: &str = "results.xlsx";

const ROW_HEADERS: [&str; 5] = [
    "Provider ID",
    "Patients",
    "Avg Charged",
    "Avg Allowed",
    "Avg Paid",
];

const FOOTNOTES: [&str; 3] = [
    "Based on Medicare Provider Utilization and Payment Data published on data.cms.gov.",
    "Only providers listed as individuals and their services within the 50 states/DC are included.  Please note that Provider ID is a generated number created to de-identify providers.",
    "Additional data cleaning/transformations on the data set were performed as needed.",
];
const SELECTION_NOTE: &str = "The specific data shown in the above table & graph is based on user selections (see input tab) in the web application.";

const DATA_WIDTH: f64 = 16.0;

struct Formats {
    bold: Format,
    number: Format,
    header: Format,
    title: Format,
    note: Format,
    note_heading: Format,
}

impl Formats {
    fn new() -> Self {
        Self {
            bold: Format::new().set_bold(),
            number: Format::new()
                .set_num_format("#,##0")
                .set_align(FormatAlign::Left),
            header: Format::new()
                .set_bold()
                .set_background_color(Color::RGB(0x8DB4E2))
                .set_border(FormatBorder::Thin),
            title: Format::new()
                .set_bold()
                .set_font_size(18)
                .set_align(FormatAlign::Center),
            note: Format::new().set_font_size(9),
            note_heading: Format::new()
                .set_font_size(9)
                .set_underline(FormatUnderline::Single),
        }
    }
}

/// Serializes one result as an xlsx workbook.
pub fn encode(record: &ResultRecord) -> anyhow::Result<Vec<u8>> {
    let fmt = Formats::new();
    let mut workbook = Workbook::new();

    workbook.push_worksheet(input_sheet(record, &fmt)?);
    workbook.push_worksheet(data_sheet(record, &fmt)?);
    workbook.push_worksheet(results_sheet(record, &fmt)?);

    workbook
        .save_to_buffer()
        .context("failed to serialize workbook")
}

fn input_sheet(record: &ResultRecord, fmt: &Formats) -> anyhow::Result<Worksheet> {
    let mut ws = Worksheet::new();
    ws.set_name("input")?;

    let rank = record.inputs.rank;
    let mut rows: Vec<(&str, String)> = vec![
        ("Rank Position", rank.rank_position.as_str().to_string()),
        ("Rank By", rank.rank_by.as_str().to_string()),
    ];
    for field in FilterField::ALL {
        let values = record.inputs.selection.get(field);
        let shown = if values.is_empty() {
            "(all)".to_string()
        } else {
            values.join(", ")
        };
        rows.push((field.label(), shown));
    }

    for (i, (label, value)) in rows.iter().enumerate() {
        let row = i as u32;
        ws.write_string_with_format(row, 0, *label, &fmt.bold)?;
        ws.write_string(row, 1, value)?;
    }
    ws.set_column_width(0, 20)?;
    ws.set_column_width(1, 20)?;
    Ok(ws)
}

fn data_sheet(record: &ResultRecord, fmt: &Formats) -> anyhow::Result<Worksheet> {
    let mut ws = Worksheet::new();
    ws.set_name("data")?;

    for (col, label) in ROW_HEADERS.iter().enumerate() {
        ws.write_string_with_format(0, col as u16, *label, &fmt.bold)?;
    }
    for (i, r) in record.rows.iter().enumerate() {
        write_ranked_row(&mut ws, i as u32 + 1, r, fmt)?;
    }

    ws.write_string_with_format(0, 7, "Bar Chart", &fmt.bold)?;
    let hist = &record.histogram;
    for (i, (label, value)) in hist.labels.iter().zip(&hist.values).enumerate() {
        let row = i as u32 + 1;
        ws.write_string(row, 7, label)?;
        ws.write_number_with_format(row, 8, *value as f64, &fmt.number)?;
    }

    for col in [0u16, 1, 2, 3, 4, 7, 8] {
        ws.set_column_width(col, DATA_WIDTH)?;
    }
    Ok(ws)
}

fn write_ranked_row(
    ws: &mut Worksheet,
    row: u32,
    r: &RankedRow,
    fmt: &Formats,
) -> anyhow::Result<()> {
    ws.write_string(row, 0, &r.provider_id)?;
    let numbers = [&r.patients, &r.avg_charged, &r.avg_allowed, &r.avg_paid];
    for (i, text) in numbers.into_iter().enumerate() {
        let col = i as u16 + 1;
        match parse_grouped(text) {
            Some(n) => ws.write_number_with_format(row, col, n, &fmt.number)?,
            None => ws.write_string(row, col, text)?,
        };
    }
    Ok(())
}

/// Inverse of the display grouping: "1,234" -> 1234.0.
fn parse_grouped(text: &str) -> Option<f64> {
    text.replace(',', "").parse().ok()
}

fn results_sheet(record: &ResultRecord, fmt: &Formats) -> anyhow::Result<Worksheet> {
    let mut ws = Worksheet::new();
    ws.set_name("results")?;

    ws.merge_range(0, 0, 0, 4, &record.title(), &fmt.title)?;
    for (col, label) in ROW_HEADERS.iter().enumerate() {
        ws.write_string_with_format(1, col as u16, *label, &fmt.header)?;
    }

    let n = record.rows.len().min(RANK_LIMIT) as u32;
    let columns = ['A', 'B', 'C', 'D', 'E'];
    for i in 0..n {
        let row = i + 2;
        // ranked row i sits on 1-based row i + 2 of the data sheet
        for (col, letter) in columns.iter().enumerate() {
            let formula = Formula::new(format!("=data!{letter}{}", i + 2));
            if col == 0 {
                ws.write_formula(row, 0, formula)?;
            } else {
                ws.write_formula_with_format(row, col as u16, formula, &fmt.number)?;
            }
        }
    }
    if !record.is_empty() {
        let table = Table::new()
            .set_name("TenTable")
            .set_header_row(false)
            .set_style(TableStyle::Light15);
        ws.add_table(2, 0, n + 1, 4, &table)?;
    }
    for col in 0..5u16 {
        ws.set_column_width(col, DATA_WIDTH)?;
    }

    let bins = record.histogram.values.len() as u32;
    let mut chart = Chart::new(ChartType::Column);
    chart.set_style(10);
    chart.title().set_name("Total Patients by Average Charged Amount");
    chart.x_axis().set_name("Avg Charged");
    chart.y_axis().set_name("Patients");
    chart.legend().set_hidden();
    chart
        .add_series()
        .set_categories(("data", 1, 7, bins, 7))
        .set_values(("data", 1, 8, bins, 8));
    chart.set_width(864).set_height(324);
    ws.insert_chart(0, 7, &chart)?;

    ws.write_string_with_format(19, 0, "Source Data:", &fmt.note_heading)?;
    for (i, note) in FOOTNOTES.iter().enumerate() {
        ws.write_string_with_format(20 + i as u32, 0, *note, &fmt.note)?;
    }
    ws.write_string_with_format(24, 0, SELECTION_NOTE, &fmt.note)?;

    ws.set_active(true);
    Ok(ws)
}
