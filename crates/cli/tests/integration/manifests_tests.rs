//! Manifests command integration tests.

use predicates::prelude::*;

use super::common::{TestEnv, config_map, deployment};

const APP_CONFIG: &str = r#"apiVersion: pipecd.dev/v1beta1
kind: KubernetesApp
spec:
  name: web
"#;

#[test]
fn manifests_prints_plain_yaml_application() {
  let env = TestEnv::new();
  env.write_file("app/app.pipecd.yaml", APP_CONFIG);
  env.write_file("app/deployment.yaml", &deployment("web", 2, "web:v1"));
  env.write_file("app/config.yaml", &config_map("settings", "a"));

  env
    .piped_cmd()
    .arg("manifests")
    .arg(env.path("app"))
    .arg("--tools-dir")
    .arg(env.tools_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("kind: Deployment"))
    .stdout(predicate::str::contains("kind: ConfigMap"))
    .stdout(predicate::str::contains("kind: KubernetesApp").not());
}

#[test]
fn manifests_json_output_is_an_array() {
  let env = TestEnv::new();
  env.write_file("app/app.pipecd.yaml", APP_CONFIG);
  env.write_file("app/deployment.yaml", &deployment("web", 2, "web:v1"));

  let output = env
    .piped_cmd()
    .arg("manifests")
    .arg(env.path("app"))
    .args(["--output", "json", "--tools-dir"])
    .arg(env.tools_path())
    .output()
    .unwrap();
  assert!(output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let manifests = json.as_array().unwrap();
  assert_eq!(manifests.len(), 1);
  assert_eq!(manifests[0]["kind"], "Deployment");
  assert_eq!(manifests[0]["metadata"]["name"], "web");
}

#[test]
fn manifests_honors_custom_config_filename() {
  let env = TestEnv::new();
  env.write_file("app/web.pipecd.yaml", APP_CONFIG);
  env.write_file("app/deployment.yaml", &deployment("web", 2, "web:v1"));

  env
    .piped_cmd()
    .arg("manifests")
    .arg(env.path("app"))
    .args(["--config-filename", "web.pipecd.yaml", "--tools-dir"])
    .arg(env.tools_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("name: web"));
}

#[test]
fn manifests_rejects_non_kubernetes_application() {
  let env = TestEnv::new();
  env.write_file(
    "app/app.pipecd.yaml",
    "apiVersion: pipecd.dev/v1beta1\nkind: LambdaApp\nspec: {}\n",
  );

  env
    .piped_cmd()
    .arg("manifests")
    .arg(env.path("app"))
    .arg("--tools-dir")
    .arg(env.tools_path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("unexpected application kind"));
}

#[test]
fn manifests_missing_app_dir_fails() {
  let env = TestEnv::new();

  env
    .piped_cmd()
    .arg("manifests")
    .arg(env.path("nowhere"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("not found"));
}
