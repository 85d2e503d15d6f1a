//! Sequential flow execution with control-flow interpretation.
//!
//! The dispatcher executes atomic steps; this runner owns everything
//! above it: step ordering, `repeat`/`retry` loops, `runFlow` nesting with
//! env scoping, variable definitions, and `${NAME}` substitution applied
//! to step payloads just before dispatch. Substitution is late on purpose,
//! a selector index of `"${ROW}"` only becomes a number here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{info, warn};

use maestro_core::dispatcher::StepExecutor;
use maestro_core::flow::{parse_flow_file, Flow};
use maestro_core::selector::Selector;
use maestro_core::step::{CommandResult, Step};

/// Iteration cap for `repeat.while` loops so a stuck screen cannot hang a
/// run forever.
const MAX_WHILE_ITERATIONS: u32 = 100;
/// Probe timeout for `repeat.while` visibility checks.
const WHILE_PROBE_TIMEOUT_MS: u64 = 1500;

/// Aggregated outcome of one flow run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub first_failure: Option<String>,
}

impl RunSummary {
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, result: &CommandResult) {
        if result.success {
            self.passed += 1;
        } else {
            self.failed += 1;
            if self.first_failure.is_none() {
                self.first_failure = Some(result.message.clone());
            }
        }
    }

    fn record_failure(&mut self, message: impl Into<String>) {
        self.failed += 1;
        if self.first_failure.is_none() {
            self.first_failure = Some(message.into());
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        if self.first_failure.is_none() {
            self.first_failure = other.first_failure;
        }
    }
}

/// Runs flows against one device via a [`StepExecutor`].
pub struct FlowRunner {
    executor: StepExecutor,
    env: HashMap<String, String>,
    base_dir: PathBuf,
    // The flow config's appId, filled into app-lifecycle steps that omit
    // their own.
    app_id: Option<String>,
    // Guards against runFlow cycles that only materialise at runtime
    // (e.g. through substituted file names).
    flow_stack: HashSet<PathBuf>,
}

impl FlowRunner {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            executor,
            env: HashMap::new(),
            base_dir: PathBuf::from("."),
            app_id: None,
            flow_stack: HashSet::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Runs a flow: `onFlowStart` hooks, the steps, then `onFlowComplete`
    /// hooks regardless of the outcome. Step order is strict; the first
    /// failing step stops the main sequence.
    pub async fn run_flow(&mut self, flow: &Flow) -> RunSummary {
        let mut summary = RunSummary::default();
        let saved_env = self.env.clone();
        let saved_base = self.base_dir.clone();
        let saved_app = self.app_id.clone();

        for (key, value) in &flow.config.env {
            self.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        if flow.config.app_id.is_some() {
            self.app_id = flow.config.app_id.clone();
        }
        if let Some(parent) = flow.source_path.parent() {
            if !parent.as_os_str().is_empty() {
                self.base_dir = parent.to_path_buf();
            }
        }
        info!(flow = %flow.source_path.display(), steps = flow.steps.len(), "running flow");

        let hooks_ok = self
            .run_steps(&flow.config.on_flow_start, &mut summary)
            .await;
        if hooks_ok {
            self.run_steps(&flow.steps, &mut summary).await;
        }
        self.run_steps(&flow.config.on_flow_complete, &mut summary)
            .await;

        self.env = saved_env;
        self.base_dir = saved_base;
        self.app_id = saved_app;
        summary
    }

    /// Runs steps in order; stops at (and reports) the first failure.
    async fn run_steps(&mut self, steps: &[Step], summary: &mut RunSummary) -> bool {
        for step in steps {
            if !self.run_step(step, summary).await {
                return false;
            }
        }
        true
    }

    fn run_step<'a>(
        &'a mut self,
        step: &'a Step,
        summary: &'a mut RunSummary,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + 'a>> {
        Box::pin(async move {
            match step {
                Step::DefineVariables { env } => {
                    for (key, value) in env {
                        let value = substitute_str(value, &self.env);
                        self.env.insert(key.clone(), value);
                    }
                    summary.passed += 1;
                    true
                }
                Step::Repeat {
                    times,
                    while_visible,
                    commands,
                } => {
                    self.run_repeat(times.as_deref(), while_visible.as_ref(), commands, summary)
                        .await
                }
                Step::Retry {
                    max_retries,
                    file,
                    commands,
                } => {
                    self.run_retry(*max_retries, file.as_deref(), commands, summary)
                        .await
                }
                Step::RunFlow {
                    file,
                    env,
                    commands,
                } => match file {
                    Some(file) => {
                        let file = substitute_str(file, &self.env);
                        self.run_subflow(&file, env, summary).await
                    }
                    None => {
                        let saved = self.env.clone();
                        for (key, value) in env {
                            self.env
                                .insert(key.clone(), substitute_str(value, &self.env));
                        }
                        let ok = self.run_steps(commands, summary).await;
                        self.env = saved;
                        ok
                    }
                },
                Step::RunScript { file, .. } => {
                    warn!(file = %file, "runScript requires the script engine; skipping");
                    summary.passed += 1;
                    true
                }
                Step::EvalScript { .. } => {
                    warn!("evalScript requires the script engine; skipping");
                    summary.passed += 1;
                    true
                }
                _ => {
                    let mut step = substitute_step(step, &self.env);
                    self.fill_app_id(&mut step);
                    let result = self.executor.execute(&step).await;
                    info!(
                        kind = step.kind_name(),
                        success = result.success,
                        duration_ms = result.duration.as_millis() as u64,
                        "{}",
                        result.message
                    );
                    summary.record(&result);
                    result.success
                }
            }
        })
    }

    /// App-lifecycle steps that omit an appId inherit the flow config's.
    fn fill_app_id(&self, step: &mut Step) {
        let slot = match step {
            Step::LaunchApp { app_id, .. }
            | Step::StopApp { app_id }
            | Step::KillApp { app_id }
            | Step::ClearState { app_id }
            | Step::SetPermissions { app_id, .. } => app_id,
            _ => return,
        };
        if slot.is_none() {
            *slot = self.app_id.clone();
        }
    }

    async fn run_repeat(
        &mut self,
        times: Option<&str>,
        while_visible: Option<&Selector>,
        commands: &[Step],
        summary: &mut RunSummary,
    ) -> bool {
        if let Some(sel) = while_visible {
            let mut probe = sel.clone();
            probe.timeout_ms = Some(WHILE_PROBE_TIMEOUT_MS);
            for _ in 0..MAX_WHILE_ITERATIONS {
                let check = self
                    .executor
                    .execute(&Step::AssertVisible(probe.clone()))
                    .await;
                if !check.success {
                    return true;
                }
                if !self.run_steps(commands, summary).await {
                    return false;
                }
            }
            warn!("repeat.while exceeded {} iterations", MAX_WHILE_ITERATIONS);
            summary.record_failure("repeat.while did not terminate");
            return false;
        }

        let count: u32 = times
            .map(|t| substitute_str(t, &self.env))
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(1);
        for _ in 0..count {
            if !self.run_steps(commands, summary).await {
                return false;
            }
        }
        true
    }

    /// Retry runs its body up to `max_retries` times and only surfaces the
    /// last attempt's failures; earlier attempts are suppressed.
    async fn run_retry(
        &mut self,
        max_retries: u32,
        file: Option<&str>,
        commands: &[Step],
        summary: &mut RunSummary,
    ) -> bool {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            let mut attempt_summary = RunSummary::default();
            let ok = match file {
                Some(file) => {
                    let file = substitute_str(file, &self.env);
                    self.run_subflow(&file, &HashMap::new(), &mut attempt_summary)
                        .await
                }
                None => self.run_steps(commands, &mut attempt_summary).await,
            };
            if ok {
                summary.merge(attempt_summary);
                return true;
            }
            if attempt == attempts {
                summary.merge(attempt_summary);
                return false;
            }
            warn!(attempt, attempts, "retry attempt failed, trying again");
        }
        false
    }

    async fn run_subflow(
        &mut self,
        file: &str,
        overlay: &HashMap<String, String>,
        summary: &mut RunSummary,
    ) -> bool {
        let path = self.base_dir.join(file);
        let canonical = match path.canonicalize() {
            Ok(c) => c,
            Err(e) => {
                summary.record_failure(format!("runFlow target '{}' not found: {}", file, e));
                return false;
            }
        };
        if self.flow_stack.contains(&canonical) {
            summary.record_failure(format!(
                "circular runFlow detected at runtime: {}",
                canonical.display()
            ));
            return false;
        }
        let flow = match parse_flow_file(&canonical) {
            Ok(flow) => flow,
            Err(e) => {
                summary.record_failure(format!("failed to parse '{}': {}", file, e));
                return false;
            }
        };

        self.flow_stack.insert(canonical.clone());
        let saved_env = self.env.clone();
        let saved_base = self.base_dir.clone();
        let saved_app = self.app_id.clone();
        if flow.config.app_id.is_some() {
            self.app_id = flow.config.app_id.clone();
        }
        for (key, value) in &flow.config.env {
            self.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in overlay {
            self.env
                .insert(key.clone(), substitute_str(value, &saved_env));
        }
        if let Some(parent) = canonical.parent() {
            self.base_dir = parent.to_path_buf();
        }

        let ok = self.run_steps(&flow.steps, summary).await;

        self.env = saved_env;
        self.base_dir = saved_base;
        self.app_id = saved_app;
        self.flow_stack.remove(&canonical);
        ok
    }
}

/// Replaces `${NAME}` references with values from the environment;
/// unknown names are left in place.
pub fn substitute_str(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str(&rest[start..start + end + 3]);
                    }
                }
                rest = &rest[start + end + 3..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Applies variable substitution to every string in a step payload via a
/// JSON round-trip.
fn substitute_step(step: &Step, env: &HashMap<String, String>) -> Step {
    if env.is_empty() {
        return step.clone();
    }
    let mut value = match serde_json::to_value(step) {
        Ok(value) => value,
        Err(_) => return step.clone(),
    };
    substitute_value(&mut value, env);
    serde_json::from_value(value).unwrap_or_else(|_| step.clone())
}

fn substitute_value(value: &mut serde_json::Value, env: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => *s = substitute_str(s, env),
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item, env);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, env);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use maestro_core::flow::parse_flow;
    use maestro_core::resolver::TimingConfig;
    use maestro_core::testutil::FakeDriver;

    fn runner(driver: &Arc<FakeDriver>) -> FlowRunner {
        let timing = TimingConfig {
            default_timeout_ms: 40,
            optional_timeout_ms: 30,
            scroll_settle_ms: 1,
            scroll_probe_timeout_ms: 10,
            scrollable_lookup_timeout_ms: 20,
            launch_settle_ms: 1,
            poll_tick_ms: 5,
        };
        FlowRunner::new(StepExecutor::new(driver.clone()).with_timing(timing))
    }

    fn flow_from(source: &str) -> Flow {
        parse_flow(source, Path::new("test.yaml")).unwrap()
    }

    #[test]
    fn substitution_replaces_known_names() {
        let env: HashMap<String, String> = [
            ("USER".to_string(), "alice".to_string()),
            ("ROW".to_string(), "-1".to_string()),
        ]
        .into();
        assert_eq!(substitute_str("hello ${USER}", &env), "hello alice");
        assert_eq!(substitute_str("${ROW}", &env), "-1");
        assert_eq!(substitute_str("${MISSING}", &env), "${MISSING}");
        assert_eq!(substitute_str("no vars", &env), "no vars");
        assert_eq!(substitute_str("${unterminated", &env), "${unterminated");
        assert_eq!(
            substitute_str("${USER} and ${USER}", &env),
            "alice and alice"
        );
    }

    #[tokio::test]
    async fn repeat_times_runs_commands_in_order() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from("- repeat:\n    times: 3\n    commands:\n      - back\n");
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok());
        assert_eq!(summary.passed, 3);
        assert_eq!(driver.recorded(), vec!["back"; 3]);
    }

    #[tokio::test]
    async fn define_variables_flow_into_selectors() {
        let driver = Arc::new(
            FakeDriver::new()
                .with_element("clickable(true).textContains(\"Profile\")", "h-profile")
                .with_element_text("h-profile", "Profile")
                .with_element_bounds(
                    "h-profile",
                    maestro_core::element::Bounds::new(0, 0, 10, 10),
                ),
        );
        let mut runner = runner(&driver);
        let flow = flow_from(
            "- defineVariables:\n    env:\n      TARGET: Profile\n- tapOn: ${TARGET}\n",
        );
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok(), "{:?}", summary.first_failure);
        assert_eq!(driver.recorded(), vec!["click_element h-profile"]);
    }

    #[tokio::test]
    async fn flow_env_feeds_substitution() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from("appId: com.app\nenv:\n  KEY: Enter\n---\n- pressKey: ${KEY}\n");
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok(), "{:?}", summary.first_failure);
        assert_eq!(driver.recorded(), vec!["press_key_code 66"]);
    }

    #[tokio::test]
    async fn bare_launch_app_uses_the_config_app_id() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from("appId: com.example.app\n---\n- launchApp\n");
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok(), "{:?}", summary.first_failure);
        let recorded = driver.recorded();
        assert_eq!(recorded[0], "shell am force-stop com.example.app");
        assert!(recorded
            .last()
            .unwrap()
            .contains("monkey -p com.example.app"));
    }

    #[tokio::test]
    async fn first_failure_stops_the_main_sequence() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from("- tapOn:\n    text: Ghost\n    timeout: 10\n- back\n");
        let summary = runner.run_flow(&flow).await;
        assert!(!summary.is_ok());
        assert_eq!(summary.failed, 1);
        assert!(driver.recorded().is_empty(), "back must not run");
    }

    #[tokio::test]
    async fn on_flow_complete_runs_after_failure() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from(
            "appId: com.app\nonFlowComplete:\n  - back\n---\n- tapOn:\n    text: Ghost\n    timeout: 10\n",
        );
        let summary = runner.run_flow(&flow).await;
        assert!(!summary.is_ok());
        assert_eq!(driver.recorded(), vec!["back"]);
    }

    #[tokio::test]
    async fn retry_suppresses_transient_failures() {
        // The element only exists in the page source served on the third
        // fetch; the first two retry attempts fail, the third succeeds.
        let visible =
            r#"<hierarchy><node class="v" clickable="true" text="Flaky" bounds="[0,0][10,10]"/></hierarchy>"#;
        let driver = Arc::new(FakeDriver::new().with_source_sequence(&[
            "<hierarchy></hierarchy>",
            "<hierarchy></hierarchy>",
            visible,
        ]));
        let mut runner = runner(&driver);
        let flow = flow_from(
            "- retry:\n    maxRetries: 3\n    commands:\n      - tapOn:\n          text: Flaky\n          timeout: 10\n",
        );
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok(), "{:?}", summary.first_failure);
        assert_eq!(summary.failed, 0, "suppressed attempts must not count");
    }

    #[tokio::test]
    async fn retry_surfaces_the_final_failure() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from(
            "- retry:\n    maxRetries: 2\n    commands:\n      - tapOn:\n          text: Never\n          timeout: 10\n",
        );
        let summary = runner.run_flow(&flow).await;
        assert!(!summary.is_ok());
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn run_flow_file_executes_with_env_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sub.yaml"), "- pressKey: ${KEY}\n").unwrap();
        std::fs::write(
            dir.path().join("main.yaml"),
            "- runFlow:\n    file: sub.yaml\n    env:\n      KEY: Home\n",
        )
        .unwrap();

        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = maestro_core::flow::parse_flow_file(&dir.path().join("main.yaml")).unwrap();
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok(), "{:?}", summary.first_failure);
        assert_eq!(driver.recorded(), vec!["press_key_code 3"]);
    }

    #[tokio::test]
    async fn runtime_run_flow_cycle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loop.yaml"), "- runFlow: loop.yaml\n").unwrap();

        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = maestro_core::flow::parse_flow_file(&dir.path().join("loop.yaml")).unwrap();
        let summary = runner.run_flow(&flow).await;
        assert!(!summary.is_ok());
        assert!(summary
            .first_failure
            .unwrap()
            .contains("circular runFlow"));
    }

    #[tokio::test]
    async fn script_steps_pass_with_a_note() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from("- evalScript: \"output.x = 1\"\n- runScript: setup.js\n");
        let summary = runner.run_flow(&flow).await;
        assert!(summary.is_ok());
        assert_eq!(summary.passed, 2);
    }

    #[tokio::test]
    async fn inline_run_flow_scopes_env() {
        let driver = Arc::new(FakeDriver::new());
        let mut runner = runner(&driver);
        let flow = flow_from(
            "- runFlow:\n    env:\n      KEY: Back\n    commands:\n      - pressKey: ${KEY}\n- pressKey: ${KEY}\n",
        );
        let summary = runner.run_flow(&flow).await;
        // The second pressKey sees the unsubstituted name and fails.
        assert!(!summary.is_ok());
        assert_eq!(driver.recorded(), vec!["press_key_code 4"]);
    }
}
