//! Transaction loading, schema validation and date parsing using Polars

use crate::config::LoadOptions;
use crate::error::{Result, RfmError};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

/// Column names of the typed transaction frame
pub const TRANSACTION_ID: &str = "transaction_id";
pub const CUSTOMER_ID: &str = "customer_id";
pub const TIMESTAMP_MS: &str = "timestamp_ms";
pub const AMOUNT: &str = "amount";

/// Date-time layouts tried when no explicit format is configured
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Date-only layouts; day-first with a two digit year before four digits
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%y", "%d/%m/%Y"];

/// A single input transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub customer_id: String,
    /// `None` when the source date was missing or unparseable
    pub transaction_date: Option<NaiveDateTime>,
    pub amount: f64,
}

impl Transaction {
    pub fn new(
        transaction_id: impl Into<String>,
        customer_id: impl Into<String>,
        transaction_date: Option<NaiveDateTime>,
        amount: f64,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            customer_id: customer_id.into(),
            transaction_date,
            amount,
        }
    }
}

/// Validated transactions held as a typed Polars frame
///
/// Columns: `transaction_id` (str), `customer_id` (str),
/// `timestamp_ms` (i64 milliseconds since epoch, nullable), `amount` (f64).
#[derive(Debug, Clone)]
pub struct TransactionTable {
    frame: DataFrame,
}

impl TransactionTable {
    /// Build the table from in-memory transactions
    pub fn from_transactions(transactions: &[Transaction]) -> Result<Self> {
        let ids: Vec<&str> = transactions
            .iter()
            .map(|t| t.transaction_id.as_str())
            .collect();
        let customers: Vec<&str> = transactions
            .iter()
            .map(|t| t.customer_id.as_str())
            .collect();
        let timestamps: Vec<Option<i64>> = transactions
            .iter()
            .map(|t| t.transaction_date.map(|d| d.and_utc().timestamp_millis()))
            .collect();
        let amounts: Vec<f64> = transactions.iter().map(|t| t.amount).collect();

        let frame = DataFrame::new(vec![
            Series::new(TRANSACTION_ID, ids),
            Series::new(CUSTOMER_ID, customers),
            Series::new(TIMESTAMP_MS, timestamps),
            Series::new(AMOUNT, amounts),
        ])?;

        Ok(Self { frame })
    }

    /// Validate a frame of raw text columns and convert it into typed transactions
    pub fn from_raw_frame(raw: &DataFrame, options: &LoadOptions) -> Result<Self> {
        let columns = &options.columns;
        let ids = text_column(raw, &columns.transaction_id)?;
        let customers = text_column(raw, &columns.customer_id)?;
        let dates = text_column(raw, &columns.transaction_date)?;
        let amounts = text_column(raw, &columns.transaction_amount)?;

        let mut transactions = Vec::with_capacity(raw.height());
        let mut unparsed_dates = 0usize;
        let mut dropped = 0usize;

        let rows = ids
            .into_iter()
            .zip(customers.into_iter())
            .zip(dates.into_iter())
            .zip(amounts.into_iter());

        for (index, (((id, customer), date), amount)) in rows.enumerate() {
            let row = index + 1;
            let transaction_id = required_text(id, &columns.transaction_id, row)?;
            let customer_id = required_text(customer, &columns.customer_id, row)?;
            let amount = parse_amount(amount, &columns.transaction_amount, row)?;

            if options.drop_zero_amounts && amount == 0.0 {
                dropped += 1;
                continue;
            }

            let transaction_date =
                date.and_then(|raw| parse_timestamp(raw, options.date_format.as_deref()));
            if transaction_date.is_none() {
                unparsed_dates += 1;
                debug!(
                    row,
                    customer_id,
                    transaction_id,
                    value = date.unwrap_or(""),
                    "missing or unparseable transaction date"
                );
            }

            transactions.push(Transaction::new(
                transaction_id,
                customer_id,
                transaction_date,
                amount,
            ));
        }

        if unparsed_dates > 0 {
            warn!(
                count = unparsed_dates,
                column = columns.transaction_date.as_str(),
                "transactions with a missing or unparseable date"
            );
        }
        if dropped > 0 {
            info!(count = dropped, "dropped zero-amount transactions");
        }

        Self::from_transactions(&transactions)
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    /// Latest valid transaction timestamp, in milliseconds since epoch
    pub fn latest_timestamp_ms(&self) -> Result<Option<i64>> {
        Ok(self.frame.column(TIMESTAMP_MS)?.i64()?.max())
    }
}

/// Load a transaction CSV file
///
/// All columns are read as text so that schema problems can be reported
/// with the offending column and row instead of a generic parse failure.
pub fn load_transactions(path: &Path, options: &LoadOptions) -> Result<TransactionTable> {
    let raw = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    debug!(
        rows = raw.height(),
        columns = raw.width(),
        path = %path.display(),
        "read transaction file"
    );

    let table = TransactionTable::from_raw_frame(&raw, options)?;
    info!(transactions = table.len(), "loaded transactions");
    Ok(table)
}

/// Parse a transaction timestamp
///
/// With an explicit chrono `format` only that layout is accepted (as a
/// date-time or a plain date). Otherwise RFC 3339, ISO-8601 date-times,
/// ISO dates and day-first `d/m/y` dates are tried in turn.
pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(format) = format {
        return parse_with_format(raw, format);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }

    DATETIME_FORMATS
        .iter()
        .chain(DATE_FORMATS.iter())
        .find_map(|format| parse_with_format(raw, format))
}

fn parse_with_format(raw: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, format).ok().or_else(|| {
        NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
}

fn text_column<'a>(raw: &'a DataFrame, name: &str) -> Result<&'a StringChunked> {
    let series = raw
        .column(name)
        .map_err(|_| RfmError::schema(name, "required column is missing"))?;
    series.str().map_err(|_| {
        RfmError::schema(name, format!("expected text values, found {}", series.dtype()))
    })
}

fn required_text<'a>(value: Option<&'a str>, column: &str, row: usize) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(RfmError::schema(column, format!("missing value at row {row}"))),
    }
}

fn parse_amount(value: Option<&str>, column: &str, row: usize) -> Result<f64> {
    let text = required_text(value, column, row)?;
    match text.parse::<f64>() {
        Ok(amount) if amount.is_finite() => Ok(amount),
        _ => Err(RfmError::schema(
            column,
            format!("invalid amount `{text}` at row {row}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv(rows: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "transaction_id,customer_id,transaction_date,transaction_amount"
        )
        .unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file
    }

    fn timestamp(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw, None).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2016, 8, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        assert_eq!(timestamp("2016-08-02"), expected);
        assert_eq!(timestamp("2/8/16"), expected);
        assert_eq!(timestamp("02/08/2016"), expected);
        assert_eq!(timestamp("2016-08-02T00:00:00Z"), expected);
        assert_eq!(
            timestamp("2016-08-02 14:30:00"),
            expected + chrono::Duration::minutes(14 * 60 + 30)
        );
        assert_eq!(parse_timestamp("", None), None);
        assert_eq!(parse_timestamp("not a date", None), None);
    }

    #[test]
    fn test_parse_timestamp_explicit_format() {
        let parsed = parse_timestamp("08-02-2016", Some("%m-%d-%Y")).unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2016, 8, 2).unwrap());

        // The explicit format disables the fallbacks
        assert_eq!(parse_timestamp("2016-08-02", Some("%m-%d-%Y")), None);
    }

    #[test]
    fn test_load_transactions() {
        let file = create_test_csv(&[
            "T1,C1,2016-08-01,100",
            "T2,C1,2016-08-02,50.5",
            "T3,C2,21/10/16,500",
        ]);

        let table = load_transactions(file.path(), &LoadOptions::default()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.latest_timestamp_ms().unwrap(),
            Some(timestamp("2016-10-21").and_utc().timestamp_millis())
        );
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "transaction_id,customer_id,transaction_date").unwrap();
        writeln!(file, "T1,C1,2016-08-01").unwrap();

        let err = load_transactions(file.path(), &LoadOptions::default()).unwrap_err();
        match err {
            RfmError::Schema { column, .. } => assert_eq!(column, "transaction_amount"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_amount_is_schema_error() {
        let file = create_test_csv(&["T1,C1,2016-08-01,100", "T2,C1,2016-08-02,abc"]);

        let err = load_transactions(file.path(), &LoadOptions::default()).unwrap_err();
        match err {
            RfmError::Schema { column, reason } => {
                assert_eq!(column, "transaction_amount");
                assert!(reason.contains("row 2"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_customer_is_schema_error() {
        let file = create_test_csv(&["T1,,2016-08-01,100"]);

        let err = load_transactions(file.path(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, RfmError::Schema { ref column, .. } if column == "customer_id"));
    }

    #[test]
    fn test_unparseable_date_kept_as_null() {
        let file = create_test_csv(&["T1,C1,yesterday,100", "T2,C2,2016-08-02,10"]);

        let table = load_transactions(file.path(), &LoadOptions::default()).unwrap();
        let timestamps = table.frame().column(TIMESTAMP_MS).unwrap();
        assert_eq!(timestamps.null_count(), 1);
    }

    #[test]
    fn test_custom_columns_and_zero_amounts() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "TransactionID,CustomerID,CustomerDOB,TransactionDate,TransactionAmount (INR)"
        )
        .unwrap();
        writeln!(file, "T1,C5841053,10/1/94,2/8/16,25").unwrap();
        writeln!(file, "T2,C2142763,4/4/57,2/8/16,0").unwrap();

        let options = LoadOptions {
            columns: ColumnMap {
                transaction_id: "TransactionID".to_string(),
                customer_id: "CustomerID".to_string(),
                transaction_date: "TransactionDate".to_string(),
                transaction_amount: "TransactionAmount (INR)".to_string(),
            },
            date_format: None,
            drop_zero_amounts: true,
        };

        let table = load_transactions(file.path(), &options).unwrap();
        assert_eq!(table.len(), 1);
    }
}
