/*!
CSV storage for daily bars

Bars are written with the header `date,open,high,low,close,adj_close,volume`. Reading is more
lenient: column names are matched case-insensitively, so files exported by other tools (e.g.
`Date,Open,High,Low,Close,Volume,Adj Close`) load as well.
*/
use super::Bar;
use crate::error::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::io::{Read, Write};
use std::str::FromStr;

/// The date format used when writing bars
pub const BAR_DATE: &str = "%Y-%m-%d";

/// Datetime formats accepted when a date column carries a time of day
const BAR_DATETIMES: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Column positions of the fields of a bar within a CSV record
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Columns {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    adj_close: Option<usize>,
    volume: usize,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Columns> {
        let find = |names: &[&str]| {
            headers.iter().position(|header| {
                let header = header.trim().to_lowercase().replace(' ', "_");
                names.contains(&header.as_str())
            })
        };
        let require = |names: &[&str]| {
            find(names).ok_or_else(|| {
                Error::InsufficientData(format!("missing CSV column {:?}", names[0]))
            })
        };
        Ok(Columns {
            date: require(&["date", "datetime", "timestamp"])?,
            open: require(&["open"])?,
            high: require(&["high"])?,
            low: require(&["low"])?,
            close: require(&["close"])?,
            adj_close: find(&["adj_close", "adjclose"]),
            volume: require(&["volume"])?,
        })
    }
}

/// Parse a date, accepting a trailing time of day
pub fn parse_date(field: &str) -> Option<NaiveDate> {
    let field = field.trim();
    if let Ok(date) = NaiveDate::parse_from_str(field, BAR_DATE) {
        return Some(date);
    }
    BAR_DATETIMES
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(field, format).ok())
        .map(|dt| dt.date())
}

/// Read bars from a Reader
///
/// Records with an unparseable date are skipped, and unparseable numbers become NaN, so that
/// [`clean_bars`](super::clean_bars) can decide what to keep.
pub fn read_bars<R: Read>(rdr: R) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_reader(rdr);
    let columns = Columns::from_headers(reader.headers()?)?;
    let number = |record: &csv::StringRecord, i: usize| {
        record
            .get(i)
            .and_then(|field| f64::from_str(field.trim()).ok())
            .unwrap_or(f64::NAN)
    };
    let mut bars = Vec::new();
    for record in reader.records() {
        let record = record?;
        let date = match record.get(columns.date).and_then(parse_date) {
            Some(date) => date,
            None => continue,
        };
        let close = number(&record, columns.close);
        bars.push(Bar {
            date,
            open: number(&record, columns.open),
            high: number(&record, columns.high),
            low: number(&record, columns.low),
            close,
            adj_close: columns
                .adj_close
                .map(|i| number(&record, i))
                .unwrap_or(close),
            volume: number(&record, columns.volume),
        });
    }
    Ok(bars)
}

/// Write bars to a Writer
/// On success, return how many bars were written
pub fn write_bars<W, I>(wtr: W, bars: I) -> Result<usize>
where
    W: Write,
    I: Iterator<Item = Bar>,
{
    let mut wtr = csv::Writer::from_writer(wtr);
    let mut written = 0;
    for bar in bars {
        wtr.serialize(bar)?;
        written += 1;
    }
    wtr.flush()?;
    Ok(written)
}
