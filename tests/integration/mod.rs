//! Integration tests for the hive orchestration core.
//!
//! Workers are scripted in-process (see `fixtures`), so no external worker
//! binary is needed. Workspaces are real git worktrees in temporary
//! repositories.
//!
//! # Test Categories
//!
//! - `scheduling`: admission order, parallelism and the resource gate
//! - `graph`: cycle rejection and readiness over random graphs
//! - `recovery`: heartbeat kills, restart budgets and backoff
//! - `workspaces`: merge, cleanup and orphan sweeps
//! - `messaging`: delivery retries, failure reports and expiry
//! - `persistence`: saved state and resuming after shutdown or crash
//! - `supervision`: the one-worker-per-role guarantee

mod fixtures;

mod graph;
mod messaging;
mod persistence;
mod recovery;
mod scheduling;
mod supervision;
mod workspaces;
