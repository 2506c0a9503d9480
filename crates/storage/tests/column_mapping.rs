use std::collections::HashSet;

use dagd_storage::Column;

#[test]
fn bits_are_unique_and_indexable() {
    let mut seen_bits = HashSet::new();
    let mut seen_indexes = HashSet::new();
    for column in Column::ALL {
        assert!(seen_bits.insert(column.bit()), "duplicate bit for {column:?}");
        assert!(
            seen_indexes.insert(column.index()),
            "duplicate index for {column:?}"
        );
        assert_eq!(Column::ALL[column.index()], column);
    }
}

#[test]
fn names_are_unique() {
    let mut seen = HashSet::new();
    for column in Column::ALL {
        assert!(seen.insert(column.as_str()), "duplicate name for {column:?}");
    }
}
