// Background jobs

pub mod retention_sweeper;
