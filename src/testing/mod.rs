//! Test infrastructure: a containerized PostgreSQL harness, a programmable
//! mock chain, and integration suites exercising the sync pipeline end to
//! end against a real database.

pub(crate) mod chain;
pub(crate) mod db;
