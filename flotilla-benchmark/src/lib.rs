//! Benchmarks live under `benches/`; run them with `cargo bench -p flotilla-benchmark`.
