//! Integration tests: full lane lifecycles through the public API.

mod flaky_store;
mod lifecycle;
