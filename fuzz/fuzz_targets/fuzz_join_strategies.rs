#![no_main]

use bindery::{
    DataBinding, DataSet, JoinedDataSet, ListDataRow, RowSequenceDataSet, join_strategy_by_name,
};
use libfuzzer_sys::fuzz_target;

// Byte 0 picks the strategy, each following byte is one member's row count.
fuzz_target!(|data: &[u8]| {
    let Some((selector, sizes)) = data.split_first() else {
        return;
    };
    let name = ["combinatorial", "pairwise", "sequential"][usize::from(*selector) % 3];
    let Some(strategy) = join_strategy_by_name(name) else {
        return;
    };

    let sizes = sizes
        .iter()
        .take(4)
        .map(|size| usize::from(*size % 6))
        .collect::<Vec<_>>();
    let mut joined = JoinedDataSet::new().with_strategy(strategy);
    for (member, size) in sizes.iter().enumerate() {
        let rows = (0..*size).map(|row| ListDataRow::new([row as i64]).into_ref());
        let member_set = RowSequenceDataSet::new(rows, 1).into_ref();
        if joined.add_data_set(member_set).is_err() {
            panic!("member {member} rejected");
        }
    }

    let bindings = (0..sizes.len() as i64).map(DataBinding::at).collect::<Vec<_>>();
    let product = sizes.iter().product::<usize>();
    let count = joined
        .get_rows(&bindings, true)
        .inspect(|row| {
            for binding in &bindings {
                let _ = row.get_value(binding);
            }
        })
        .count();

    match name {
        "combinatorial" => assert_eq!(count, if sizes.is_empty() { 0 } else { product }),
        "sequential" => assert_eq!(count, sizes.iter().copied().max().unwrap_or(0)),
        _ => assert!(count <= product.max(sizes.iter().copied().max().unwrap_or(0))),
    }
});
