#![no_main]

use bindery::{
    DataBinding, DataSet, ListDataRow, MergedDataSet, RowSequenceDataSet, merge_strategy_by_name,
};
use libfuzzer_sys::fuzz_target;

// Byte 0 picks the strategy. The rest is split into members on 0xFF; every
// other byte is one row value, with 0xFE standing for an unbindable row.
fuzz_target!(|data: &[u8]| {
    let Some((selector, body)) = data.split_first() else {
        return;
    };
    let name = ["concatenation", "union", "intersection"][usize::from(*selector) % 3];
    let Some(strategy) = merge_strategy_by_name(name) else {
        return;
    };

    let members = body.split(|byte| *byte == 0xFF).take(4).collect::<Vec<_>>();
    let mut merged = MergedDataSet::new().with_strategy(strategy);
    for values in &members {
        let rows = values.iter().map(|value| {
            if *value == 0xFE {
                ListDataRow::new(Vec::<i64>::new()).into_ref()
            } else {
                ListDataRow::new([i64::from(*value % 8)]).into_ref()
            }
        });
        if merged
            .add_data_set(RowSequenceDataSet::new(rows, 1).into_ref())
            .is_err()
        {
            return;
        }
    }

    let total = members.iter().map(|values| values.len()).sum::<usize>();
    let count = merged.get_rows(&[DataBinding::at(0)], true).count();
    if name == "concatenation" {
        assert_eq!(count, total);
    } else {
        assert!(count <= total);
    }
});
