pub mod collector;
pub mod dedup;
pub mod detector;
pub mod expansion;
pub mod harvest;
pub mod page;
pub mod record;
pub mod recovery;
pub mod scroll;
pub mod sink;
pub mod sources;
pub mod stats;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
