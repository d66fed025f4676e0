//! Constants shared across the agent.

use std::time::Duration;

/// Prefix of every annotation and label the agent reads or stamps.
pub const LABEL_PREFIX: &str = "pipecd.dev";

pub const ANNOTATION_MANAGED_BY: &str = "pipecd.dev/managed-by";
pub const ANNOTATION_PIPED: &str = "pipecd.dev/piped";
pub const ANNOTATION_APPLICATION: &str = "pipecd.dev/application";
pub const ANNOTATION_COMMIT_HASH: &str = "pipecd.dev/commit-hash";
pub const ANNOTATION_ORIGINAL_API_VERSION: &str = "pipecd.dev/original-api-version";
pub const ANNOTATION_RESOURCE_KEY: &str = "pipecd.dev/resource-key";
pub const ANNOTATION_IGNORE_DRIFT_DETECTION: &str = "pipecd.dev/ignore-drift-detection";
pub const ANNOTATION_SYNC_BY_REPLACE: &str = "pipecd.dev/sync-by-replace";
pub const ANNOTATION_SERVER_SIDE_APPLY: &str = "pipecd.dev/server-side-apply";
pub const ANNOTATION_CONFIG_HASH: &str = "pipecd.dev/config-hash";
pub const ANNOTATION_ORDER: &str = "pipecd.dev/order";

pub const MANAGED_BY_PIPED: &str = "piped";
pub const IGNORE_DRIFT_DETECTION_TRUE: &str = "true";
pub const SYNC_BY_REPLACE_ENABLED: &str = "enabled";
pub const SERVER_SIDE_APPLY_TRUE: &str = "true";

pub const DEFAULT_VARIANT_LABEL: &str = "pipecd.dev/variant";
pub const DEFAULT_PRIMARY_VARIANT: &str = "primary";
pub const DEFAULT_CANARY_VARIANT: &str = "canary";
pub const DEFAULT_BASELINE_VARIANT: &str = "baseline";

/// Tag keys used on Lambda functions. Lambda tags cannot contain `/`.
pub const LAMBDA_TAG_MANAGED_BY: &str = "pipecd-dev-managed-by";
pub const LAMBDA_TAG_PIPED: &str = "pipecd-dev-piped";
pub const LAMBDA_TAG_APPLICATION: &str = "pipecd-dev-application";
pub const LAMBDA_TAG_COMMIT_HASH: &str = "pipecd-dev-commit-hash";

/// The alias every managed Lambda function is invoked through.
pub const LAMBDA_SERVICE_ALIAS: &str = "Service";

/// Stage metadata keys.
pub const CANARY_RESOURCES_KEY: &str = "canary-resources";
pub const BASELINE_RESOURCES_KEY: &str = "baseline-resources";
pub const PRIMARY_PERCENTAGE_KEY: &str = "primary-percentage";
pub const CANARY_PERCENTAGE_KEY: &str = "canary-percentage";
pub const BASELINE_PERCENTAGE_KEY: &str = "baseline-percentage";
pub const PROMOTE_PERCENTAGE_KEY: &str = "promote-percentage";
pub const PROMOTE_VERSION_KEY: &str = "promote-version";
pub const ON_ROLLBACK_KEY: &str = "onRollback";
pub const SCRIPT_ENV_KEY: &str = "env";

/// Environment variable prefix for script-run stages.
pub const SCRIPT_ENV_PREFIX: &str = "SR_";

pub const DEFAULT_APP_CONFIG_FILENAME: &str = "app.pipecd.yaml";
pub const DEFAULT_FUNCTION_MANIFEST_FILENAME: &str = "function.yaml";
pub const KUSTOMIZATION_FILENAME: &str = "kustomization.yaml";

pub const DEFAULT_DRIFT_DETECTION_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LAMBDA_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const PRUNE_DEBOUNCE: Duration = Duration::from_secs(15);
pub const TOOL_INSTALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Value recorded when a version cannot be determined.
pub const UNKNOWN_VERSION: &str = "unknown";
