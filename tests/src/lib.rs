//! Integration test member. All tests live under `tests/`.
