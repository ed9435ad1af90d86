//! Structured observability hooks for deploy lifecycle events.
//!
//! This module provides:
//! - Pipeline-scoped tracing spans via `pipeline_span`
//! - Emission functions for lifecycle events: start, stage transition,
//!   build decision, drift, finish
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::{field, info, warn, Span};

use crate::domain::Decision;

/// Span covering one coordinator invocation.
///
/// The pipeline name is unknown until resolution finishes; fill it in with
/// [`record_pipeline`]. Attach with `tracing::Instrument::instrument`.
pub fn pipeline_span(operation: &str, run_id: &str) -> Span {
    tracing::info_span!(
        "berth.pipeline",
        operation = %operation,
        run_id = %run_id,
        pipeline = field::Empty,
    )
}

/// Record the resolved pipeline name on a span from [`pipeline_span`].
pub fn record_pipeline(span: &Span, pipeline: &str) {
    span.record("pipeline", pipeline);
}

/// Emit event: invocation started for a pipeline.
pub fn emit_started(operation: &str, pipeline: &str, manifest_path: &str) {
    info!(
        event = "pipeline.started",
        operation = %operation,
        pipeline = %pipeline,
        manifest_path = %manifest_path,
    );
}

/// Emit event: coordinator entered a stage.
pub fn emit_stage(pipeline: &str, stage: &str) {
    info!(event = "pipeline.stage", pipeline = %pipeline, stage = %stage);
}

/// Emit event: build decision for one component.
pub fn emit_decision(pipeline: &str, component: &str, decision: &Decision) {
    info!(
        event = "build.decision",
        pipeline = %pipeline,
        component = %component,
        decision = %decision,
    );
}

/// Emit event: component image ready (built or reused).
pub fn emit_image_ready(pipeline: &str, component: &str, image: &str, built: bool) {
    info!(
        event = "build.image_ready",
        pipeline = %pipeline,
        component = %component,
        image = %image,
        built = built,
    );
}

/// Emit event: stored manifest identity differs from this invocation's.
pub fn emit_manifest_drift(pipeline: &str, stored: &str, current: &str) {
    warn!(
        event = "pipeline.manifest_drift",
        pipeline = %pipeline,
        stored = %stored,
        current = %current,
    );
}

/// Emit event: invocation finished.
pub fn emit_finished(operation: &str, pipeline: &str, duration_ms: u64, success: bool) {
    info!(
        event = "pipeline.finished",
        operation = %operation,
        pipeline = %pipeline,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: invocation failed (warning level).
pub fn emit_failed(pipeline: &str, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.failed", pipeline = %pipeline, stage = %stage, error = %error);
}
