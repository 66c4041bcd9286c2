//! Workspace root. No library code of its own (spec.md's module mapping
//! lives in `crates/cmdbus-*`); this package exists to hold the
//! integration test suite under `tests/` and the workspace-wide
//! `[workspace.dependencies]` table.
