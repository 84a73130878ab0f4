//! CSV output for reports
//!
//! The header row is always written, even for an empty report.

use std::io::Write;

use serde::Serialize;

use super::{DatasetReportRow, ReferrerReportRow};
use crate::error::Result;

pub const DATASET_COLUMNS: [&str; 6] = ["Title", "Name", "Views", "Visits", "Downloads", "PeriodName"];
pub const REFERRER_COLUMNS: [&str; 4] = ["Title", "Name", "ReferredVisits", "PeriodName"];

/// Write the dataset report, returning the number of data rows.
pub fn write_dataset_report<W: Write>(
    writer: W,
    rows: impl IntoIterator<Item = Result<DatasetReportRow>>,
) -> Result<usize> {
    write_report(writer, &DATASET_COLUMNS, rows)
}

/// Write the referrer report, returning the number of data rows.
pub fn write_referrer_report<W: Write>(
    writer: W,
    rows: impl IntoIterator<Item = Result<ReferrerReportRow>>,
) -> Result<usize> {
    write_report(writer, &REFERRER_COLUMNS, rows)
}

fn write_report<W: Write, T: Serialize>(
    writer: W,
    columns: &[&str],
    rows: impl IntoIterator<Item = Result<T>>,
) -> Result<usize> {
    let mut out = ::csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    out.write_record(columns)?;

    let mut written = 0;
    for row in rows {
        out.serialize(row?)?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
