//! Axum router for the ingestion front-end.
//!
//! ```text
//! /
//! ├── POST /vote                 - submit a law ballot
//! ├── POST /elections/vote       - submit an election ballot
//! ├── GET  /results              - all law tallies
//! ├── GET  /results/{ballot_id}  - one law tally
//! ├── GET  /elections            - registered elections and windows
//! ├── GET  /elections/{id}/regions/{id}/results - election tallies
//! └── GET  /health               - liveness and dependency status
//! ```

use axum::routing::{get, post};
use axum::Router;

use super::handlers::*;
use super::state::AppState;

/// Build the complete router. Submission routes publish to the bus;
/// everything under `/results` and `/elections` reads the tally store
/// only.
pub fn build_router(state: &AppState) -> Router {
    Router::new()
        .route("/vote", post(submit_vote))
        .route("/elections/vote", post(submit_election_vote))
        .route("/results", get(all_law_results))
        .route("/results/{ballot_id}", get(law_results))
        .route("/elections", get(list_elections))
        .route(
            "/elections/{election_id}/regions/{region_id}/results",
            get(election_results),
        )
        .route("/health", get(health))
        .with_state(state.clone())
}
