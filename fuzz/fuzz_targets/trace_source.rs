#![no_main]

use libfuzzer_sys::fuzz_target;
use mpiperf::engine::{analyze, CancellationToken};
use mpiperf::source::{JsonLinesSource, TraceInput};
use mpiperf::EngineConfig;

fuzz_target!(|data: &[u8]| {
    // Decoding and analysing arbitrary input may fail but must not panic
    let mut source = JsonLinesSource::new(data);
    if let Ok(input) = TraceInput::read(&mut source) {
        let config = EngineConfig {
            worker_threads: 1,
            collective_timeout_ms: 50,
            ..Default::default()
        };
        let _ = analyze(input, &config, &CancellationToken::new());
    }
});
