//! AWS Lambda platform support: the function manifest, the client and
//! manifest diffs.

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod function;

pub use client::{
  AwsLambdaClient, LambdaClient, LambdaError, ManagedFunction, RoutingTrafficConfig, VersionTraffic,
};
pub use function::{
  ArtifactKind, ArtifactVersion, FunctionManifest, FunctionManifestError, find_artifact_versions,
  load_function_manifest, parse_function_manifest,
};

use crate::diff::{DiffOptions, DiffResult, diff_values};

/// Diff a live function manifest against the one in git.
pub fn diff(live: &FunctionManifest, head: &FunctionManifest, opts: &DiffOptions) -> DiffResult {
  diff_values(&live.to_value(), &head.to_value(), opts)
}
