pub mod dalle;
pub mod with_tracing;
