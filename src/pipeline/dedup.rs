use data_model::{FileIndex, RawFileRecord};

/// Drops records whose normalized key is already indexed. Order is kept.
pub fn filter_new(records: Vec<RawFileRecord>, index: &FileIndex) -> Vec<RawFileRecord> {
    let indexed = index.keys();
    records
        .into_iter()
        .filter(|r| !indexed.contains(r.normalized_key.as_str()))
        .collect()
}
