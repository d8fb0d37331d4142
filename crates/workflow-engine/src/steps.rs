use reclaim_core::{ActionLog, ActionRecord, Outcome, Warning};
use reclaim_host_linux::{CommandOutput, HostSystem};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Tool presence, probed at most once per tool for one routine invocation.
pub struct ToolCache<'a> {
    host: &'a dyn HostSystem,
    known: HashMap<String, bool>,
}

impl<'a> ToolCache<'a> {
    pub fn new(host: &'a dyn HostSystem) -> Self {
        Self {
            host,
            known: HashMap::new(),
        }
    }

    pub fn has(&mut self, tool: &str) -> bool {
        if let Some(present) = self.known.get(tool) {
            return *present;
        }
        let present = self.host.tool_available(tool);
        self.known.insert(tool.to_string(), present);
        present
    }
}

/// Runs privileged steps through `sudo -n` and records every attempt.
/// Failures are logged and returned, never raised.
pub struct StepRunner<'a> {
    host: &'a dyn HostSystem,
    dry_run: bool,
    tools: ToolCache<'a>,
    log: ActionLog,
    warnings: Vec<Warning>,
    missing_reported: Vec<String>,
}

impl<'a> StepRunner<'a> {
    pub fn new(host: &'a dyn HostSystem, dry_run: bool, log: ActionLog) -> Self {
        Self {
            host,
            dry_run,
            tools: ToolCache::new(host),
            log,
            warnings: Vec::new(),
            missing_reported: Vec::new(),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn host(&self) -> &'a dyn HostSystem {
        self.host
    }

    /// Runs `sudo -n program args`, or records `<action>_dry_run` instead.
    pub fn attempt(
        &mut self,
        action: &str,
        target: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> Option<CommandOutput> {
        self.attempt_with_details(action, target, None, program, args)
    }

    pub fn attempt_with_details(
        &mut self,
        action: &str,
        target: Option<&str>,
        details: Option<Value>,
        program: &str,
        args: &[&str],
    ) -> Option<CommandOutput> {
        if self.dry_run {
            self.push(format!("{}_dry_run", action), target, Outcome::DryRun, details);
            return None;
        }
        let output = self.sudo(program, args);
        let rc = output.as_ref().and_then(|out| out.status);
        if rc != Some(0) {
            warn!(action, target, ?rc, "step did not succeed");
        }
        self.push(action.to_string(), target, Outcome::completed(rc), details);
        output
    }

    /// Privileged read without a log entry. Always runs, so callers must
    /// only use it outside dry-run mode.
    pub fn sudo(&self, program: &str, args: &[&str]) -> Option<CommandOutput> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-n");
        full.push(program);
        full.extend_from_slice(args);
        match self.host.run("sudo", &full) {
            Ok(output) => Some(output),
            Err(err) => {
                warn!(program, error = %err, "failed to spawn command");
                None
            }
        }
    }

    /// Records a dry-run entry when in dry-run mode; returns whether it did.
    pub fn dry_run_only(&mut self, action: &str, target: Option<&str>) -> bool {
        if self.dry_run {
            self.push(format!("{}_dry_run", action), target, Outcome::DryRun, None);
        }
        self.dry_run
    }

    pub fn note(&mut self, action: &str, target: Option<&str>, details: Option<Value>) {
        self.push(action.to_string(), target, Outcome::Info, details);
    }

    pub fn skip(&mut self, action: &str, target: Option<&str>, reason: &str) {
        debug!(action, target, reason, "step skipped");
        self.push(action.to_string(), target, Outcome::skipped(reason), None);
    }

    /// Checks tool presence; a missing tool is reported once as a warning.
    pub fn require_tool(&mut self, tool: &str) -> bool {
        if self.tools.has(tool) {
            return true;
        }
        if !self.missing_reported.iter().any(|t| t == tool) {
            warn!(tool, "optional tool not available");
            self.missing_reported.push(tool.to_string());
            self.warnings
                .push(Warning::new("tool_missing", json!({ "tool": tool })));
        }
        false
    }

    pub fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn into_parts(self) -> (ActionLog, Vec<Warning>) {
        (self.log, self.warnings)
    }

    fn push(&mut self, action: String, target: Option<&str>, outcome: Outcome, details: Option<Value>) {
        let mut record = ActionRecord::new(action, target, outcome);
        record.details = details;
        self.log.push(record);
    }
}
