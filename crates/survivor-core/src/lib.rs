// Library root: league membership, pick routing and race elimination for an
// F1 survivor game, layered over pluggable persistence and auth.

pub mod auto_pick;
pub mod backend;
pub mod cache;
pub mod config;
pub mod elimination;
pub mod error;
pub mod leagues;
pub mod membership;
pub mod model;
pub mod notify;
pub mod picks;
pub mod race_state;
pub mod refresh;
pub mod store;

pub use error::{StoreError, SurvivorError};
