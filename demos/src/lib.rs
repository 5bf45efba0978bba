//! Demo member. Runnable examples live under `examples/`.
