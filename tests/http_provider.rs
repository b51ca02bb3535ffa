//! Integration tests for the HTTP sandbox provider against a mock service.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sandbox_session_bridge::config::{BridgeConfig, ProviderSettings, ResourceProfile};
use sandbox_session_bridge::error::{ErrorKind, ProviderError};
use sandbox_session_bridge::provider::{
    CommandLine, ExecRequest, HttpProvider, ProvisionRequest, SandboxProvider,
};
use sandbox_session_bridge::session::{CommandDispatcher, CommandRequest, SandboxSpec, SandboxStatus};

fn settings(server: &MockServer) -> ProviderSettings {
    ProviderSettings {
        endpoint: Some(format!("{}/", server.uri())),
        token: Some("secret-token".into()),
        request_timeout_seconds: 5,
    }
}

fn provider(server: &MockServer) -> HttpProvider {
    HttpProvider::new(&settings(server)).expect("valid settings")
}

#[tokio::test]
async fn test_provision_sends_profile_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({
            "profile": "gpu-t4",
            "gpu": "T4",
            "timeout_seconds": 300,
            "image_id": "im-1"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandbox_id": "sb-42",
            "tunnels": { "8080": "https://t.example" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let profile = ResourceProfile::new("gpu-t4").with_gpu("T4");
    let provisioned = provider(&server)
        .provision(&ProvisionRequest {
            profile: &profile,
            timeout: Duration::from_secs(300),
            image_id: Some("im-1"),
        })
        .await
        .expect("provision failed");

    assert_eq!(provisioned.remote_id, "sb-42");
    assert_eq!(
        provisioned.tunnels.get(&8080).map(String::as_str),
        Some("https://t.example")
    );
}

#[tokio::test]
async fn test_provision_rejection_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
        .mount(&server)
        .await;

    let profile = ResourceProfile::new("default");
    let err = provider(&server)
        .provision(&ProvisionRequest {
            profile: &profile,
            timeout: Duration::from_secs(60),
            image_id: None,
        })
        .await
        .expect_err("provider refused");

    match err {
        ProviderError::Rejected { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "no capacity");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_response_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let profile = ResourceProfile::new("default");
    let err = provider(&server)
        .provision(&ProvisionRequest {
            profile: &profile,
            timeout: Duration::from_secs(60),
            image_id: None,
        })
        .await
        .expect_err("body is not JSON");
    assert!(matches!(err, ProviderError::Protocol(_)));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "sandbox_id": "sb-1" }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let provider = HttpProvider::new(&ProviderSettings {
        request_timeout_seconds: 1,
        ..settings(&server)
    })
    .expect("valid settings");
    let profile = ResourceProfile::new("default");
    let err = provider
        .provision(&ProvisionRequest {
            profile: &profile,
            timeout: Duration::from_secs(60),
            image_id: None,
        })
        .await
        .expect_err("request should time out");
    assert!(matches!(err, ProviderError::Timeout { seconds: 1 }));
}

#[tokio::test]
async fn test_unreachable_provider_is_unavailable() {
    let provider = HttpProvider::new(&ProviderSettings {
        endpoint: Some("http://127.0.0.1:1".into()),
        token: None,
        request_timeout_seconds: 5,
    })
    .expect("valid settings");

    let err = provider.terminate("sb-1").await.expect_err("nothing listens");
    assert!(matches!(err, ProviderError::Unavailable(_)));
}

#[tokio::test]
async fn test_terminate_accepts_missing_sandbox() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sandboxes/sb-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sandboxes/sb-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sandboxes/sb-stuck"))
        .respond_with(ResponseTemplate::new(409).set_body_string("busy"))
        .mount(&server)
        .await;

    let provider = provider(&server);
    provider.terminate("sb-1").await.expect("terminate failed");
    provider.terminate("sb-gone").await.expect("gone counts as terminated");
    let err = provider.terminate("sb-stuck").await.expect_err("conflict");
    assert!(matches!(err, ProviderError::Rejected { status: 409, .. }));
}

#[tokio::test]
async fn test_exec_sends_argv_and_decodes_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .and(body_partial_json(json!({
            "argv": ["sh", "-c", "echo hi"],
            "cwd": "/work",
            "env": { "LANG": "C" },
            "timeout_seconds": 30
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exit_code": 0,
            "stdout": "hi\n",
            "stderr": ""
        })))
        .expect(1)
        .mount(&server)
        .await;

    let command = CommandLine::Shell("echo hi".into());
    let env = HashMap::from([("LANG".to_string(), "C".to_string())]);
    let output = provider(&server)
        .exec(
            "sb-1",
            &ExecRequest {
                command: &command,
                cwd: Some("/work"),
                env: &env,
                timeout: Duration::from_secs(30),
            },
        )
        .await
        .expect("exec failed");

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, b"hi\n");
}

#[tokio::test]
async fn test_exec_on_missing_sandbox_is_gone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-9/exec"))
        .respond_with(ResponseTemplate::new(404).set_body_string("unknown sandbox"))
        .mount(&server)
        .await;

    let command = CommandLine::Argv(vec!["true".into()]);
    let env = HashMap::new();
    let err = provider(&server)
        .exec(
            "sb-9",
            &ExecRequest {
                command: &command,
                cwd: None,
                env: &env,
                timeout: Duration::from_secs(5),
            },
        )
        .await
        .expect_err("sandbox is gone");
    assert!(matches!(err, ProviderError::Gone(body) if body == "unknown sandbox"));
}

#[tokio::test]
async fn test_background_process_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/processes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "process_id": "p-7" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/processes/p-7/wait"))
        .and(body_json(json!({ "timeout_seconds": 20 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exit_code": 3,
            "stderr": "boom"
        })))
        .mount(&server)
        .await;

    let provider = provider(&server);
    let command = CommandLine::Shell("make".into());
    let env = HashMap::new();
    let process_id = provider
        .spawn(
            "sb-1",
            &ExecRequest {
                command: &command,
                cwd: None,
                env: &env,
                timeout: Duration::from_secs(20),
            },
        )
        .await
        .expect("spawn failed");
    assert_eq!(process_id, "p-7");

    let output = provider
        .wait("sb-1", &process_id, Duration::from_secs(20))
        .await
        .expect("wait failed");
    assert_eq!(output.exit_code, 3);
    assert!(output.stdout.is_empty());
    assert_eq!(output.stderr, b"boom");
}

#[tokio::test]
async fn test_snapshot_returns_image_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/snapshot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "image_id": "im-5" })))
        .mount(&server)
        .await;

    let image_id = provider(&server).snapshot("sb-1").await.expect("snapshot failed");
    assert_eq!(image_id, "im-5");
}

#[tokio::test]
async fn test_dispatcher_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sandbox_id": "sb-1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exit_code": 0,
            "stdout": "hi\n",
            "stderr": ""
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sandboxes/sb-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = BridgeConfig::default().with_endpoint(server.uri());
    let provider = Arc::new(HttpProvider::new(&config.provider).expect("valid settings"));
    let dispatcher = CommandDispatcher::new(Arc::new(config), provider);

    let handle = dispatcher
        .create_sandbox(SandboxSpec::with_timeout(600))
        .await
        .expect("create failed")
        .handle
        .to_string();
    let result = dispatcher
        .run_command(&handle, CommandRequest::shell("echo hi"))
        .await
        .expect("command failed");
    assert_eq!(result.stdout, "hi\n");

    let status = dispatcher.terminate(&handle).await.expect("terminate failed");
    assert_eq!(status, SandboxStatus::Terminated);
}

#[tokio::test]
async fn test_dispatcher_surfaces_provisioning_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let config = common::test_config().with_endpoint(server.uri());
    let provider = Arc::new(HttpProvider::new(&config.provider).expect("valid settings"));
    let dispatcher = CommandDispatcher::new(Arc::new(config), provider);

    let err = dispatcher
        .create_sandbox(SandboxSpec::with_timeout(60))
        .await
        .expect_err("provisioning rejected");
    assert_eq!(err.kind(), ErrorKind::ProvisioningError);
    assert!(err.to_string().contains("403"));
}
