//! piped-lib: the reconciliation core of the `piped` deployment agent.
//!
//! - `toolregistry`, `chartrepo`: on-demand external tools and chart repositories
//! - `kubernetes`, `lambda`: platform models, loaders and clients
//! - `livestate`: watched cluster and account state
//! - `driftdetector`: git state against live state
//! - `executor`, `planner`: deployment stages and sync strategy

pub mod chartrepo;
pub mod config;
pub mod consts;
pub mod diff;
pub mod driftdetector;
pub mod executor;
pub mod git;
pub mod kubernetes;
pub mod lambda;
pub mod livestate;
pub mod metrics;
pub mod planner;
pub mod singleflight;
pub mod toolregistry;
pub mod util;
