#![no_main]

use libfuzzer_sys::fuzz_target;
use mpiperf::filter::{parse_rank_list, FilterSet, ValueFilter};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // None of the parsers may panic, whatever the input
        let _ = ValueFilter::from_expr(input);
        let _ = parse_rank_list(input);
        if let Ok(filters) = FilterSet::from_expr(input) {
            // Display output must parse back to the same filters
            let again = FilterSet::from_expr(&filters.to_string());
            assert_eq!(again.ok(), Some(filters));
        }
    }
});
