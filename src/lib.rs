// Oxidized Causal - LLM-guided causal analysis workflow

pub mod config;
pub mod models;
pub mod types;
pub mod context;
pub mod agents;
pub mod llm;
pub mod planner;
pub mod executor;
pub mod display;
pub mod session;
pub mod routes;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
