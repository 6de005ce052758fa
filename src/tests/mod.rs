// Test modules for Threadsync
// Each module covers the corresponding source module; scenario_tests runs
// end-to-end flows across them.

mod support;

mod crypto_tests;
mod realtime_tests;
mod sync_tests;
