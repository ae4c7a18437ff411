//! End-to-end checks against a local Docker daemon.
//!
//! Run with `cargo test -- --ignored`.

use std::sync::Arc;

use codelet::config::types::BackendType;
use codelet::config::CodeletConfig;
use codelet::{CodeletError, DecodedValue, LogLevel, RemoteExecutor, TracingLogger};

fn executor(imports: &[&str]) -> RemoteExecutor {
    RemoteExecutor::builder(CodeletConfig::default())
        .backend(BackendType::Docker)
        .additional_imports(imports.iter().copied())
        .logger(Arc::new(TracingLogger::new(LogLevel::Debug)))
        .build()
        .expect("docker sandbox")
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn state_persists_between_snippets() {
    let mut executor = executor(&[]);
    executor.submit("a = 2").unwrap();
    let result = executor.submit("print(a + 1)").unwrap();
    assert!(result.logs().contains('3'));

    let mut fresh = self::executor(&[]);
    assert!(matches!(
        fresh.submit("print(a + 1)"),
        Err(CodeletError::RemoteExecution { .. })
    ));
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn final_answer_is_detected() {
    let mut executor = executor(&[]);
    let result = executor.submit("final_answer(\"X\")").unwrap();
    assert!(result.is_final_answer());
    assert_eq!(result.output(), &DecodedValue::Text("X".to_string()));

    let result = executor.submit("x = \"X\"").unwrap();
    assert!(!result.is_final_answer());
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn images_come_back_decoded() {
    let mut executor = executor(&["PIL"]);
    let result = executor
        .submit("from PIL import Image\nimage = Image.new('RGB', (10, 10), 'red')\nfinal_answer(image)")
        .unwrap();

    let image = result.output().as_image().expect("image output");
    assert_eq!((image.width(), image.height()), (10, 10));
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn syntax_errors_leave_executor_usable() {
    let mut executor = executor(&[]);
    executor.submit("kept = 5").unwrap();

    let err = executor.submit("print((kept)").unwrap_err();
    assert!(matches!(err, CodeletError::CodeSyntax { .. }));
    assert!(err.to_string().contains("SyntaxError"));

    let result = executor.submit("kept * 2").unwrap();
    assert_eq!(result.output(), &DecodedValue::Number(10.into()));
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn delete_twice_releases_container_once() {
    let mut executor = executor(&[]);
    let container_id = executor
        .backend_info()
        .instance_id
        .expect("container id");

    executor.delete();
    executor.delete();

    let inspect = std::process::Command::new("docker")
        .args(["inspect", &container_id])
        .output()
        .unwrap();
    assert!(!inspect.status.success());
    assert!(matches!(
        executor.submit("1"),
        Err(CodeletError::UseAfterTermination)
    ));
}

#[test]
#[ignore = "requires a running Docker daemon"]
fn executors_are_isolated() {
    let mut first = executor(&[]);
    let mut second = executor(&[]);

    first.submit("a = 1").unwrap();
    assert!(matches!(
        second.submit("a"),
        Err(CodeletError::RemoteExecution { .. })
    ));
}
