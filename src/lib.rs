#![warn(clippy::all, clippy::pedantic)]
#![allow(
    async_fn_in_trait,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

// ── Foundation ───────────────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod ids;
pub mod pii;

// ── Domain ───────────────────────────────────────────────────────────────────
pub mod domain;
pub mod normalizer;

// ── Stores ───────────────────────────────────────────────────────────────────
pub mod audit;
pub mod dedupe;
pub mod session;

// ── Services ─────────────────────────────────────────────────────────────────
pub mod abuse;
pub mod export;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod whatsapp;

// ── Entry points ─────────────────────────────────────────────────────────────
pub mod gateway;

// ── Re-exports ───────────────────────────────────────────────────────────────
pub use config::Settings;
