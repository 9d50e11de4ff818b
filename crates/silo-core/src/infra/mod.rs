//! Infrastructure layer - process-wide sinks that sit outside the pure
//! domain/query algorithms: logging setup. Stands in for the source's
//! `evobench`/perf-logger sinks, which expect an externally supplied
//! callback - here a `tracing::Subscriber` is that externally supplied
//! sink.

pub mod logging;
