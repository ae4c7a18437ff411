//! Blocking executor that runs agent-written Python snippets in a sandbox.
//!
//! A [`RemoteExecutor`] owns exactly one sandbox backend for its whole life.
//! Snippets submitted to it share a single interpreter, so definitions made
//! by one call are visible to the next. The executor must not be shared
//! between agent runs.

pub mod decoder;
pub(crate) mod snippet;

pub use decoder::{decode, decode_raw, DecodedValue, MAX_IMAGE_PAYLOAD_BYTES};
pub use snippet::{final_answer_regex, FINAL_ANSWER_PATTERN};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::config::types::{BackendType, CodeletConfig};
use crate::error::{CodeletError, Result};
use crate::logger::{ExecutorLogger, LogLevel, TracingLogger};
use crate::sandbox::{
    provision_backend, resolve_backend_type, resolve_packages, ErrorInfo, ErrorKind,
    SandboxBackend, SandboxInfo,
};

/// Identity `final_answer`, so a non-terminal call inside a snippet still runs.
const FINAL_ANSWER_DEFINITION: &str = "def final_answer(answer):\n    return answer\n";

/// Where the executor is in its lifecycle.
///
/// `Created` and `Provisioning` are only passed through while the builder
/// runs; a constructed executor starts in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Provisioning,
    Ready,
    Executing,
    Terminated,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What one submitted snippet produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    output: DecodedValue,
    logs: String,
    is_final_answer: bool,
}

impl ExecutionResult {
    pub(crate) fn empty() -> Self {
        Self {
            output: DecodedValue::None,
            logs: String::new(),
            is_final_answer: false,
        }
    }

    /// The final answer's argument, or the snippet's trailing expression.
    pub fn output(&self) -> &DecodedValue {
        &self.output
    }

    /// Stdout printed during this call only.
    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn is_final_answer(&self) -> bool {
        self.is_final_answer
    }

    pub fn into_parts(self) -> (DecodedValue, String, bool) {
        (self.output, self.logs, self.is_final_answer)
    }
}

/// Python helper source defined in the sandbox before the first snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSource {
    pub name: String,
    /// Python definitions, run once at startup
    pub source: String,
    /// Import names the source depends on
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl ToolSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            requirements: Vec::new(),
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Collects construction options for a [`RemoteExecutor`].
pub struct ExecutorBuilder {
    config: CodeletConfig,
    additional_imports: Vec<String>,
    tools: Vec<ToolSource>,
    logger: Option<Arc<dyn ExecutorLogger>>,
    backend: Option<BackendType>,
}

impl ExecutorBuilder {
    pub fn new(config: CodeletConfig) -> Self {
        Self {
            config,
            additional_imports: Vec::new(),
            tools: Vec::new(),
            logger: None,
            backend: None,
        }
    }

    /// Packages to install on top of the configured ones.
    pub fn additional_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_imports
            .extend(imports.into_iter().map(Into::into));
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolSource>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn ExecutorLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Override `executor.backend` from the config.
    pub fn backend(mut self, backend: BackendType) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Provision the sandbox and return a ready executor.
    ///
    /// Nothing is returned unless provisioning, package installation and
    /// tool definition all succeeded; a sandbox that was started is torn
    /// down again on failure.
    pub fn build(self) -> Result<RemoteExecutor> {
        let Self {
            config,
            additional_imports,
            tools,
            logger,
            backend,
        } = self;

        let logger =
            logger.unwrap_or_else(|| Arc::new(TracingLogger::new(config.executor.log_level)));
        logger.log(LogLevel::Debug, &format!("Executor {}", ExecutorState::Created));

        let requested = backend.unwrap_or(config.executor.backend);
        let backend_type = resolve_backend_type(&config, requested)?;

        let base = match backend_type {
            BackendType::E2b => &config.e2b.base_packages,
            BackendType::Docker | BackendType::Auto => &config.docker.base_packages,
        };
        let imports: Vec<String> = config
            .executor
            .additional_imports
            .iter()
            .chain(&additional_imports)
            .cloned()
            .collect();
        let tool_requirements: Vec<String> = tools
            .iter()
            .flat_map(|tool| tool.requirements.iter().cloned())
            .collect();
        let packages = resolve_packages(base, &imports, &tool_requirements);

        logger.log(
            LogLevel::Info,
            &format!(
                "Provisioning {} sandbox with packages: {}",
                backend_type.as_str(),
                if packages.is_empty() {
                    "(none)".to_string()
                } else {
                    packages.join(", ")
                }
            ),
        );
        logger.log(
            LogLevel::Debug,
            &format!("Executor {}", ExecutorState::Provisioning),
        );

        let runtime = build_runtime()?;
        let backend = match block_on(
            &runtime,
            provision_backend(&config, backend_type, &packages),
        ) {
            Ok(backend) => backend,
            Err(e) => {
                logger.log(LogLevel::Error, &e.to_string());
                release_runtime(runtime);
                return Err(e);
            }
        };

        RemoteExecutor::assemble(runtime, backend, &tools, logger)
    }
}

/// Runs snippets in one persistent sandbox interpreter.
///
/// All methods block the calling thread. The sandbox is released by
/// [`delete`](Self::delete) or, failing that, when the executor is dropped.
pub struct RemoteExecutor {
    backend: Box<dyn SandboxBackend>,
    logger: Arc<dyn ExecutorLogger>,
    final_answer_pattern: Regex,
    state: ExecutorState,
    /// Taken on drop; always present before that
    runtime: Option<Runtime>,
}

impl RemoteExecutor {
    /// Provision a sandbox from `config` with `additional_imports` installed.
    pub fn new(
        additional_imports: Vec<String>,
        logger: Arc<dyn ExecutorLogger>,
        config: CodeletConfig,
    ) -> Result<Self> {
        Self::builder(config)
            .additional_imports(additional_imports)
            .logger(logger)
            .build()
    }

    pub fn builder(config: CodeletConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    /// Wrap a provisioned backend, defining `final_answer` and the tools in
    /// its interpreter.
    pub(crate) fn assemble(
        runtime: Runtime,
        backend: Box<dyn SandboxBackend>,
        tools: &[ToolSource],
        logger: Arc<dyn ExecutorLogger>,
    ) -> Result<Self> {
        let mut executor = Self {
            backend,
            logger,
            final_answer_pattern: final_answer_regex(),
            state: ExecutorState::Ready,
            runtime: Some(runtime),
        };

        let definitions = std::iter::once(("final_answer", FINAL_ANSWER_DEFINITION))
            .chain(tools.iter().map(|t| (t.name.as_str(), t.source.as_str())));
        for (name, source) in definitions {
            if let Err(e) = executor.define(name, source) {
                executor.logger.log(LogLevel::Error, &e.to_string());
                executor.delete();
                return Err(e);
            }
        }

        executor.logger.log(
            LogLevel::Info,
            &format!("Sandbox ready ({})", executor.backend.name()),
        );
        Ok(executor)
    }

    fn define(&self, name: &str, source: &str) -> Result<()> {
        let raw = block_on(self.runtime()?, self.backend.run_snippet(source))?;
        match raw.error {
            None => {
                debug!(tool = %name, "Defined in sandbox");
                Ok(())
            }
            Some(error) => Err(CodeletError::provision(
                self.backend.name(),
                format!("Failed to define '{}': {}: {}", name, error.name, error.message),
            )),
        }
    }

    /// Run `code` in the sandbox interpreter.
    ///
    /// Fails with `CodeSyntax` when the snippet does not parse and with
    /// `RemoteExecution` when it raises; the executor stays usable after
    /// both.
    pub fn submit(&mut self, code: &str) -> Result<ExecutionResult> {
        self.ensure_live()?;
        if code.trim().is_empty() {
            return Ok(ExecutionResult::empty());
        }

        let submission = snippet::prepare(code, &self.final_answer_pattern);
        self.logger
            .log(LogLevel::Debug, &format!("Executing snippet:\n{}", code));

        self.state = ExecutorState::Executing;
        let outcome = block_on(self.runtime()?, self.backend.run_snippet(&submission.code));
        self.state = ExecutorState::Ready;
        let raw = outcome.inspect_err(|e| self.logger.log(LogLevel::Error, &e.to_string()))?;

        if !raw.stdout.is_empty() {
            self.logger
                .log(LogLevel::Info, &format!("Execution logs:\n{}", raw.stdout));
        }

        if let Some(error) = raw.error {
            let err = classify_error(error, code, raw.stdout);
            self.logger.log(LogLevel::Error, &err.to_string());
            return Err(err);
        }

        let output = raw
            .result
            .as_ref()
            .map(decode_raw)
            .unwrap_or(DecodedValue::None);
        if submission.is_final_answer {
            self.logger
                .log(LogLevel::Info, &format!("Final answer: {}", output));
        }

        Ok(ExecutionResult {
            output,
            logs: raw.stdout,
            is_final_answer: submission.is_final_answer,
        })
    }

    /// Bind each entry of `variables` as a global in the sandbox interpreter.
    pub fn send_variables(&mut self, variables: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        self.ensure_live()?;
        if variables.is_empty() {
            return Ok(());
        }
        if let Some(bad) = variables.keys().find(|name| !is_identifier(name)) {
            return Err(CodeletError::Config(format!(
                "'{}' is not a valid Python variable name",
                bad
            )));
        }

        let code = variables_snippet(variables)?;
        self.state = ExecutorState::Executing;
        let outcome = block_on(self.runtime()?, self.backend.run_snippet(&code));
        self.state = ExecutorState::Ready;
        let raw = outcome?;

        match raw.error {
            None => {
                self.logger.log(
                    LogLevel::Debug,
                    &format!(
                        "Sent variables: {}",
                        variables.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                );
                Ok(())
            }
            Some(error) => Err(classify_error(error, &code, raw.stdout)),
        }
    }

    /// Terminate the sandbox. Safe to call any number of times; cleanup
    /// failures are logged and never returned.
    pub fn delete(&mut self) {
        if self.state == ExecutorState::Terminated {
            return;
        }
        self.state = ExecutorState::Terminated;

        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        match block_on(runtime, self.backend.terminate()) {
            Ok(()) => self.logger.log(LogLevel::Info, "Sandbox terminated"),
            Err(e) => self.logger.log(
                LogLevel::Error,
                &format!("Failed to terminate sandbox cleanly: {}", e),
            ),
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Packages installed while provisioning, in install order.
    pub fn installed_packages(&self) -> Vec<String> {
        self.backend.info().installed_packages
    }

    pub fn backend_info(&self) -> SandboxInfo {
        self.backend.info()
    }

    pub fn final_answer_pattern(&self) -> &Regex {
        &self.final_answer_pattern
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == ExecutorState::Terminated {
            return Err(CodeletError::UseAfterTermination);
        }
        Ok(())
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or(CodeletError::UseAfterTermination)
    }
}

impl Drop for RemoteExecutor {
    fn drop(&mut self) {
        self.delete();
        if let Some(runtime) = self.runtime.take() {
            release_runtime(runtime);
        }
    }
}

impl fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .finish()
    }
}

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// A runtime cannot be dropped from inside another one.
fn release_runtime(runtime: Runtime) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    }
}

/// Drive `future` to completion on the executor's runtime.
///
/// When the caller is itself inside a tokio runtime the future is driven
/// from a scoped helper thread, since nested `block_on` panics.
fn block_on<F>(runtime: &Runtime, future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    if Handle::try_current().is_err() {
        return runtime.block_on(future);
    }
    std::thread::scope(|scope| {
        scope
            .spawn(|| runtime.block_on(future))
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}

fn classify_error(error: ErrorInfo, code: &str, logs: String) -> CodeletError {
    let summary = if error.message.is_empty() {
        error.name.clone()
    } else {
        format!("{}: {}", error.name, error.message)
    };
    match error.kind {
        ErrorKind::Syntax => CodeletError::CodeSyntax {
            message: if error.traceback.trim().is_empty() {
                summary
            } else {
                error.traceback.trim_end().to_string()
            },
            code: code.to_string(),
        },
        ErrorKind::Runtime => CodeletError::RemoteExecution {
            traceback: if error.traceback.trim().is_empty() {
                summary
            } else {
                error.traceback
            },
            logs,
        },
    }
}

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic());
    valid_start
        && chars.all(|c| c == '_' || c.is_alphanumeric())
        && !PYTHON_KEYWORDS.contains(&name)
}

/// Snippet that decodes `variables` inside the sandbox. The payload is
/// base64 so no quoting of user data is needed.
fn variables_snippet(variables: &serde_json::Map<String, serde_json::Value>) -> Result<String> {
    let payload = serde_json::to_vec(variables)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
    Ok(format!(
        "import base64 as _codelet_b64, json as _codelet_json\n\
         globals().update(_codelet_json.loads(_codelet_b64.b64decode(\"{}\").decode(\"utf-8\")))\n\
         del _codelet_b64, _codelet_json\n",
        encoded
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::tests::RecordingLogger;
    use crate::sandbox::{BackendKind, ConnectionState, PayloadKind, RawExecResult, RawValue};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&str) -> RawExecResult + Send + Sync>;

    /// In-process backend answering snippets from a closure.
    struct ScriptedBackend {
        responder: Responder,
        snippets: Arc<Mutex<Vec<String>>>,
        terminations: Arc<AtomicUsize>,
        fail_terminate: bool,
    }

    #[async_trait]
    impl SandboxBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Container
        }

        fn state(&self) -> ConnectionState {
            if self.terminations.load(Ordering::SeqCst) > 0 {
                ConnectionState::Terminated
            } else {
                ConnectionState::Running
            }
        }

        async fn install_packages(&self, _packages: &[String]) -> Result<()> {
            Ok(())
        }

        async fn run_snippet(&self, code: &str) -> Result<RawExecResult> {
            self.snippets.lock().unwrap().push(code.to_string());
            if code == FINAL_ANSWER_DEFINITION {
                return Ok(RawExecResult::default());
            }
            Ok((self.responder)(code))
        }

        fn info(&self) -> SandboxInfo {
            SandboxInfo {
                backend_type: "scripted".to_string(),
                instance_id: None,
                state: self.state(),
                installed_packages: vec!["pillow".to_string()],
                metadata: HashMap::new(),
            }
        }

        async fn terminate(&self) -> Result<()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            if self.fail_terminate {
                return Err(CodeletError::SandboxCommunication("already gone".to_string()));
            }
            Ok(())
        }
    }

    struct Harness {
        executor: RemoteExecutor,
        snippets: Arc<Mutex<Vec<String>>>,
        terminations: Arc<AtomicUsize>,
        logger: Arc<RecordingLogger>,
    }

    fn harness_with(
        responder: impl Fn(&str) -> RawExecResult + Send + Sync + 'static,
        tools: &[ToolSource],
        fail_terminate: bool,
    ) -> Result<Harness> {
        let snippets = Arc::new(Mutex::new(Vec::new()));
        let terminations = Arc::new(AtomicUsize::new(0));
        let logger = Arc::new(RecordingLogger::default());
        let backend = ScriptedBackend {
            responder: Box::new(responder),
            snippets: snippets.clone(),
            terminations: terminations.clone(),
            fail_terminate,
        };
        let executor =
            RemoteExecutor::assemble(build_runtime()?, Box::new(backend), tools, logger.clone())?;
        Ok(Harness {
            executor,
            snippets,
            terminations,
            logger,
        })
    }

    fn harness(responder: impl Fn(&str) -> RawExecResult + Send + Sync + 'static) -> Harness {
        harness_with(responder, &[], false).unwrap()
    }

    fn value(kind: PayloadKind, data: &str) -> RawExecResult {
        RawExecResult {
            result: Some(RawValue::new(kind, data)),
            ..Default::default()
        }
    }

    fn error(name: &str, message: &str, traceback: &str) -> RawExecResult {
        RawExecResult {
            stdout: "partial\n".to_string(),
            error: Some(ErrorInfo::from_exception(name, message, traceback)),
            ..Default::default()
        }
    }

    #[test]
    fn test_assemble_defines_final_answer_and_tools() {
        let tool = ToolSource::new("add", "def add(a, b):\n    return a + b\n")
            .with_requirements(vec!["numpy".to_string()]);
        let h = harness_with(|_| RawExecResult::default(), &[tool], false).unwrap();

        let snippets = h.snippets.lock().unwrap().clone();
        assert_eq!(snippets.len(), 2);
        assert!(snippets[0].starts_with("def final_answer(answer):"));
        assert!(snippets[1].starts_with("def add(a, b):"));
        assert_eq!(h.executor.state(), ExecutorState::Ready);
    }

    #[test]
    fn test_failing_tool_tears_down_sandbox() {
        let tool = ToolSource::new("broken", "def broken(:\n");
        let terminations = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend {
            responder: Box::new(|code: &str| {
                if code.contains("broken") {
                    error("SyntaxError", "invalid syntax", "")
                } else {
                    RawExecResult::default()
                }
            }),
            snippets: Arc::new(Mutex::new(Vec::new())),
            terminations: terminations.clone(),
            fail_terminate: false,
        };
        let result = RemoteExecutor::assemble(
            build_runtime().unwrap(),
            Box::new(backend),
            &[tool],
            Arc::new(RecordingLogger::default()),
        );

        match result {
            Err(CodeletError::Provision { reason, .. }) => assert!(reason.contains("broken")),
            other => panic!("expected provision error, got {:?}", other),
        }
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_final_answer_is_flagged_and_rewritten() {
        let mut h = harness(|code| {
            if code.contains("\"X\"") {
                value(PayloadKind::Text, "X")
            } else {
                RawExecResult::default()
            }
        });

        let result = h.executor.submit("final_answer(\"X\")").unwrap();
        assert!(result.is_final_answer());
        assert_eq!(result.output(), &DecodedValue::Text("X".to_string()));
        assert_eq!(
            h.snippets.lock().unwrap().last().unwrap(),
            "(\n\"X\"\n)\n"
        );

        let result = h.executor.submit("x = \"X\"").unwrap();
        assert!(!result.is_final_answer());
        assert!(result.output().is_none());
        assert_eq!(h.snippets.lock().unwrap().last().unwrap(), "x = \"X\"");
    }

    #[test]
    fn test_trailing_expression_and_logs() {
        let mut h = harness(|_| RawExecResult {
            stdout: "3\n".to_string(),
            result: Some(RawValue::new(PayloadKind::Json, "{\"a\": [1, 2]}")),
            error: None,
        });

        let (output, logs, is_final) = h.executor.submit("print(3)\nd").unwrap().into_parts();
        assert_eq!(output, DecodedValue::Structured(serde_json::json!({"a": [1, 2]})));
        assert_eq!(logs, "3\n");
        assert!(!is_final);

        let records = h.logger.records.lock().unwrap();
        assert!(records
            .iter()
            .any(|(level, msg)| *level == LogLevel::Info && msg.contains("Execution logs")));
    }

    #[test]
    fn test_empty_snippet_skips_sandbox() {
        let mut h = harness(|_| panic!("sandbox should not be contacted"));
        let before = h.snippets.lock().unwrap().len();

        let result = h.executor.submit("   \n").unwrap();
        assert_eq!(result, ExecutionResult::empty());
        assert_eq!(h.snippets.lock().unwrap().len(), before);
    }

    #[test]
    fn test_syntax_error_is_recoverable() {
        let mut h = harness(|code| {
            if code.contains("print(1") && !code.contains("print(1)") {
                error("SyntaxError", "'(' was never closed", "")
            } else {
                value(PayloadKind::Json, "1")
            }
        });

        let err = h.executor.submit("print(1").unwrap_err();
        match &err {
            CodeletError::CodeSyntax { message, code } => {
                assert_eq!(message, "SyntaxError: '(' was never closed");
                assert_eq!(code, "print(1");
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
        assert!(err.to_string().contains("SyntaxError"));
        assert!(err.is_recoverable());
        assert_eq!(h.executor.state(), ExecutorState::Ready);

        let result = h.executor.submit("print(1)\n1").unwrap();
        assert_eq!(result.output(), &DecodedValue::Number(1.into()));
    }

    #[test]
    fn test_runtime_error_carries_traceback_verbatim() {
        let traceback = "Traceback (most recent call last):\n  File \"<snippet>\", line 1, in <module>\nNameError: name 'a' is not defined\n";
        let mut h = harness(move |_| error("NameError", "name 'a' is not defined", traceback));

        match h.executor.submit("print(a + 1)") {
            Err(CodeletError::RemoteExecution { traceback: tb, logs }) => {
                assert_eq!(tb, traceback);
                assert_eq!(logs, "partial\n");
            }
            other => panic!("expected remote execution error, got {:?}", other),
        }
        assert_eq!(h.executor.state(), ExecutorState::Ready);
    }

    #[test]
    fn test_delete_is_idempotent_and_final() {
        let mut h = harness(|_| RawExecResult::default());
        h.executor.delete();
        h.executor.delete();

        assert_eq!(h.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(h.executor.state(), ExecutorState::Terminated);
        assert!(matches!(
            h.executor.submit("1"),
            Err(CodeletError::UseAfterTermination)
        ));
        assert!(matches!(
            h.executor.send_variables(&serde_json::Map::new()),
            Err(CodeletError::UseAfterTermination)
        ));

        drop(h.executor);
        assert_eq!(h.terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_swallows_backend_errors() {
        let mut h = harness_with(|_| RawExecResult::default(), &[], true).unwrap();
        h.executor.delete();

        assert_eq!(h.executor.state(), ExecutorState::Terminated);
        let records = h.logger.records.lock().unwrap();
        assert!(records
            .iter()
            .any(|(level, msg)| *level == LogLevel::Error && msg.contains("already gone")));
    }

    #[test]
    fn test_drop_releases_sandbox() {
        let h = harness(|_| RawExecResult::default());
        let terminations = h.terminations.clone();
        drop(h);
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_variables() {
        let mut h = harness(|_| RawExecResult::default());
        let mut variables = serde_json::Map::new();
        variables.insert("limit".to_string(), serde_json::json!(10));
        variables.insert("names".to_string(), serde_json::json!(["a", "b"]));
        h.executor.send_variables(&variables).unwrap();

        let sent = h.snippets.lock().unwrap().last().unwrap().clone();
        assert!(sent.contains("globals().update"));
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&variables).unwrap());
        assert!(sent.contains(&encoded));

        let mut bad = serde_json::Map::new();
        bad.insert("not valid".to_string(), serde_json::json!(1));
        assert!(matches!(
            h.executor.send_variables(&bad),
            Err(CodeletError::Config(_))
        ));
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("df"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("class"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }

    #[tokio::test]
    async fn test_usable_from_async_context() {
        let mut h = harness(|_| value(PayloadKind::Text, "ok"));
        let result = h.executor.submit("'ok'").unwrap();
        assert_eq!(result.output().as_str(), Some("ok"));
        drop(h);
    }

    #[test]
    fn test_accessors() {
        let h = harness(|_| RawExecResult::default());
        assert_eq!(h.executor.installed_packages(), vec!["pillow".to_string()]);
        assert_eq!(h.executor.backend_info().backend_type, "scripted");
        assert!(h
            .executor
            .final_answer_pattern()
            .is_match("final_answer(42)"));
    }
}
