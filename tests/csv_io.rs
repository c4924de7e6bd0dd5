/*!
Test bar CSV IO
*/
use chrono::NaiveDate;
use std::io::{Seek, SeekFrom};
use stockcast::data::{fake::*, store::*, *};
use tempfile::{tempdir, tempfile};

#[test]
fn fake_data_roundtrip() {
    const TEST_DATA_LENGTH: usize = 2000;
    let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    let bars = random_walk_bars(1, start, TEST_DATA_LENGTH).unwrap();
    let mut tmp = tempfile().expect("Tempfile creation should not fail!");
    let written =
        write_bars(&mut tmp, bars.iter().copied()).expect("Writing test data should not fail!");
    assert_eq!(written, TEST_DATA_LENGTH);
    tmp.seek(SeekFrom::Start(0)).expect("Seek should not fail");
    let read = read_bars(&mut tmp).expect("Reading test data should not fail");
    assert_eq!(bars, read);
}

#[test]
fn csv_provider_serves_saved_bars() {
    let dir = tempdir().unwrap();
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let bars = SyntheticProvider::default()
        .fetch("SPY", start, NaiveDate::from_ymd_opt(2023, 12, 29).unwrap())
        .unwrap();
    let provider = CsvProvider::new(dir.path());
    save_bars(&provider.path_for("SPY"), &bars).unwrap();

    let march = provider
        .fetch(
            "SPY",
            NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 3, 31).unwrap(),
        )
        .unwrap();
    assert_eq!(march.len(), 23);
    assert!(march.iter().all(|bar| bar.date.format("%m").to_string() == "03"));

    let late = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    assert!(matches!(
        provider.fetch("SPY", late, late),
        Err(stockcast::Error::SymbolNotFound(_))
    ));
    assert!(matches!(
        provider.fetch("QQQ", start, late),
        Err(stockcast::Error::SymbolNotFound(_))
    ));
}
