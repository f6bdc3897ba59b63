//! Step executors. Currently only HTTP (C2) — the spec has no wait/GraphQL
//! step kinds, so `RunExecutor` (C6) calls `http::HttpStepExecutor` directly
//! rather than dispatching through a trait object.

pub mod http;
