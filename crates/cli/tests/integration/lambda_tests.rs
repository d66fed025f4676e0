//! Lambda command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

const IMAGE_FUNCTION: &str = r#"apiVersion: pipecd.dev/v1beta1
kind: LambdaFunction
spec:
  name: hello
  role: arn:aws:iam::123456789012:role/lambda
  image: ecr.example.com/hello:v1.2.0
  memory: 128
  timeout: 5
"#;

const ZIP_FUNCTION: &str = r#"apiVersion: pipecd.dev/v1beta1
kind: LambdaFunction
spec:
  name: hello
  role: arn:aws:iam::123456789012:role/lambda
  s3Bucket: artifacts
  s3Key: hello.zip
  s3ObjectVersion: "42"
  handler: main
  runtime: go1.x
  memory: 256
  timeout: 30
"#;

#[test]
fn validate_container_image_function() {
  let env = TestEnv::new();
  let file = env.write_file("function.yaml", IMAGE_FUNCTION);

  env
    .piped_cmd()
    .args(["lambda", "validate"])
    .arg(&file)
    .assert()
    .success()
    .stdout(predicate::str::contains("Function manifest for hello is valid"))
    .stdout(predicate::str::contains("Container image"))
    .stdout(predicate::str::contains("v1.2.0"));
}

#[test]
fn validate_s3_function_as_json() {
  let env = TestEnv::new();
  let file = env.write_file("function.yaml", ZIP_FUNCTION);

  let output = env
    .piped_cmd()
    .args(["lambda", "validate", "--output", "json"])
    .arg(&file)
    .output()
    .unwrap();
  assert!(output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["name"], "hello");
  assert_eq!(json["versions"][0]["version"], "42");
  assert_eq!(json["versions"][0]["name"], "hello.zip");
}

#[test]
fn validate_rejects_out_of_range_timeout() {
  let env = TestEnv::new();
  let file = env.write_file("function.yaml", &IMAGE_FUNCTION.replace("timeout: 5", "timeout: 901"));

  env
    .piped_cmd()
    .args(["lambda", "validate"])
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("timeout is missing or out of range"));
}

#[test]
fn validate_rejects_wrong_kind() {
  let env = TestEnv::new();
  let file = env.write_file("function.yaml", &IMAGE_FUNCTION.replace("LambdaFunction", "KubernetesApp"));

  env
    .piped_cmd()
    .args(["lambda", "validate"])
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid manifest kind given"));
}
