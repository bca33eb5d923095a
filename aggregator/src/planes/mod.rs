pub mod check;
pub mod operation;
pub mod quota;
pub mod report;

/// Upper bound on concurrent transport calls issued by one flush pass.
pub const MAX_CONCURRENT_FLUSH: usize = 16;
