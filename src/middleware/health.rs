//! A liveness-check route factory: mount `health_handler()` at whatever path an
//! orchestrator's probe expects (`/healthz`, `/livez`, ...). Out of scope per
//! `spec.md`'s Non-goals: no dependency checks (database reachability, downstream
//! service health), no metrics exposition format — just "the process is up and
//! answering requests".

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{handler, Handler};

/// Builds a handler that answers `200 { "status": "ok" }` unconditionally. Register
/// it as a normal route (`app.get("/healthz", health_handler())`) rather than
/// middleware, since a liveness probe is a route like any other, not something every
/// request should run.
pub fn health_handler() -> impl Handler {
    handler(|ctx: &mut Context| async move {
        ctx.json(&serde_json::json!({ "status": "ok" }))?;
        Ok(())
    })
}
