pub mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::{IndexEntry, Level, RawFileRecord};

    pub const TEST_SITE: &str = "KPDT";
    pub const TEST_SITE3: &str = "PDT";

    /// 2025-04-09T12:00:00Z
    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 9, 12, 0, 0).unwrap()
    }

    pub fn minutes_after_base(minutes: i64) -> DateTime<Utc> {
        base_time() + Duration::minutes(minutes)
    }

    pub fn index_entry(key: &str, minutes: i64, code: Option<&str>) -> IndexEntry {
        IndexEntry {
            key: key.to_string(),
            timestamp: minutes_after_base(minutes),
            code: code.map(str::to_string),
            sweeps: vec![0],
        }
    }

    /// Archive key of a Level 2 volume scanned `minutes` after the base time.
    pub fn level2_source_key(minutes: i64) -> String {
        let ts = minutes_after_base(minutes);
        format!(
            "{}/{}/{}{}_V06",
            ts.format("%Y/%m/%d"),
            TEST_SITE,
            TEST_SITE,
            ts.format("%Y%m%d_%H%M%S")
        )
    }

    /// Archive key of a Level 3 product file scanned `minutes` after the base
    /// time.
    pub fn level3_source_key(code: &str, minutes: i64) -> String {
        let ts = minutes_after_base(minutes);
        format!(
            "{}/{}/{}/{}_{}_{}",
            TEST_SITE3,
            code,
            ts.format("%Y/%m/%d"),
            TEST_SITE3,
            code,
            ts.format("%Y_%m_%d_%H%M%S")
        )
    }

    pub fn level2_record(minutes: i64) -> RawFileRecord {
        RawFileRecord::from_level2_key(&level2_source_key(minutes), "reflectivity").unwrap()
    }

    pub fn level3_record(product: &str, code: &str, minutes: i64) -> RawFileRecord {
        RawFileRecord::from_level3_key(&level3_source_key(code, minutes), product).unwrap()
    }

    #[test]
    fn test_fixture_keys_parse() {
        let record = level2_record(90);
        assert_eq!(Level::Level2, record.level);
        assert_eq!("KPDT20250409_133000_V06", record.normalized_key);

        let record = level3_record("hydrometeor", "HHC", 0);
        assert_eq!("KPDT20250409_120000_HHC", record.normalized_key);
        assert_eq!("PDT/HHC/2025/04/09/PDT_HHC_2025_04_09_120000", record.source_key);
    }
}
