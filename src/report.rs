//! Output formatting for the driver.

use crate::scenario::Simulation;
use colored::Colorize;
use serde_json::{json, Map, Value};
use tickfsm_core::{Diagnostic, DiagnosticKind, RegistrySnapshot, TickSummary};

/// One-line rendering of a diagnostic, colored by severity.
pub fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let kind = diagnostic.kind.as_str();
    let label = match diagnostic.kind {
        DiagnosticKind::Registered | DiagnosticKind::Redefined => kind.green(),
        DiagnosticKind::InstanceDestroyed
        | DiagnosticKind::DefinitionDestroyed
        | DiagnosticKind::GroupDestroyed => kind.cyan(),
        DiagnosticKind::UnknownGroup
        | DiagnosticKind::InstanceFailed
        | DiagnosticKind::DefinitionFailed => kind.yellow(),
        DiagnosticKind::InstanceThreshold
        | DiagnosticKind::DefinitionThreshold
        | DiagnosticKind::DeferredFailed => kind.red(),
    };
    match &diagnostic.error {
        Some(error) => format!(
            "[{}] {}: {}",
            label,
            diagnostic.message,
            error.to_string().dimmed()
        ),
        None => format!("[{}] {}", label, diagnostic.message),
    }
}

pub fn format_summary(tick: u32, summary: &TickSummary) -> String {
    let mut line = format!(
        "{} {} stepped={} throttled={} idle={} instances={} transitions={}",
        format!("tick {:>4}", tick).bold(),
        summary.group.cyan(),
        summary.buckets_stepped,
        summary.buckets_throttled,
        summary.buckets_idle,
        summary.instances_stepped,
        summary.transitions,
    );
    if summary.failures > 0 {
        line.push_str(&format!(" {}", format!("failures={}", summary.failures).red()));
    }
    if summary.deferred_applied > 0 {
        line.push_str(&format!(" deferred={}", summary.deferred_applied));
    }
    line
}

/// Table of every live instance in the snapshot.
pub fn format_table(snapshot: &RegistrySnapshot) -> String {
    if snapshot.groups.is_empty() {
        return "(no groups)".dimmed().to_string();
    }

    let mut output = format!(
        "{:<12} {:<16} {:<12} {:>6} {:<16} {:<12} {}",
        "GROUP", "DEFINITION", "RATE", "ID", "CONTEXT", "STATE", "FLAGS"
    )
    .bold()
    .to_string();

    for (group, buckets) in &snapshot.groups {
        for bucket in buckets {
            let rate = bucket.process_rate.to_string();
            if bucket.instances.is_empty() {
                output.push_str(&format!(
                    "\n{:<12} {:<16} {:<12} {}",
                    group,
                    bucket.definition,
                    rate,
                    "(no instances)".dimmed()
                ));
                continue;
            }
            for instance in &bucket.instances {
                let mut flags = Vec::new();
                if !instance.entered {
                    flags.push("pending-enter");
                }
                if !instance.valid {
                    flags.push("invalid");
                }
                output.push_str(&format!(
                    "\n{:<12} {:<16} {:<12} {:>6} {:<16} {:<12} {}",
                    group,
                    bucket.definition,
                    rate,
                    instance.id.to_string(),
                    instance.context,
                    instance.state.green(),
                    flags.join(",").yellow()
                ));
            }
        }
    }
    output.push_str(&format!(
        "\n{}",
        format!("{} instance(s)", snapshot.instance_count()).dimmed()
    ));
    output
}

pub fn diagnostic_json(diagnostic: &Diagnostic) -> Value {
    json!({
        "kind": diagnostic.kind,
        "message": diagnostic.message,
        "code": diagnostic.error.as_ref().map(|e| e.error_code()),
        "error": diagnostic.error.as_ref().map(|e| e.to_string()),
    })
}

/// Final context data of every scenario instance, keyed by name.
pub fn contexts_json(sim: &Simulation) -> Value {
    let mut contexts = Map::new();
    for name in sim.instance_names() {
        if let Some(ctx) = sim.context(name) {
            contexts.insert(name.to_string(), ctx.data());
        }
    }
    Value::Object(contexts)
}

/// Full JSON report of a run.
pub fn run_json(
    sim: &Simulation,
    summaries: &[TickSummary],
    diagnostics: &[Diagnostic],
) -> Value {
    json!({
        "ticks": sim.ticks(),
        "summaries": summaries,
        "diagnostics": diagnostics.iter().map(diagnostic_json).collect::<Vec<_>>(),
        "snapshot": sim.engine().registry().snapshot(),
        "contexts": contexts_json(sim),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;
    use tickfsm_core::{Diagnostics, EngineConfig, FsmError};

    fn simulation() -> Simulation {
        let scenario = Scenario::from_yaml(
            r#"
machines:
  - group: world
    inline:
      name: light
      initial: "off"
      states: [{ name: "off" }, { name: "on" }]
      transitions: [{ from: "off", to: "on", guard: "ctx.switch" }]
instances:
  - { name: porch, machine: light, group: world, ctx: { switch: true } }
"#,
        )
        .unwrap();
        Simulation::load(&scenario, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_table_lists_instances() {
        colored::control::set_override(false);
        let mut sim = simulation();
        sim.step(None);
        sim.step(None);

        let table = format_table(&sim.engine().registry().snapshot());
        assert!(table.starts_with("GROUP"));
        assert!(table.contains("world"));
        assert!(table.contains("light"));
        assert!(table.contains("porch"));
        assert!(table.contains("on"));
        assert!(table.ends_with("1 instance(s)"));
    }

    #[test]
    fn test_empty_table() {
        colored::control::set_override(false);
        assert_eq!(format_table(&RegistrySnapshot::default()), "(no groups)");
    }

    #[test]
    fn test_diagnostic_rendering() {
        colored::control::set_override(false);
        let diagnostics = Diagnostics::new(8);
        let mut rx = diagnostics.subscribe();
        diagnostics.publish(
            DiagnosticKind::InstanceFailed,
            "instance 3 failed",
            Some(FsmError::InvalidContext {
                context: "porch".to_string(),
            }),
        );
        let event = tickfsm_core::diagnostics::drain(&mut rx).remove(0);

        assert_eq!(
            format_diagnostic(&event),
            "[instance_failed] instance 3 failed: context 'porch' is no longer valid"
        );
        let value = diagnostic_json(&event);
        assert_eq!(value["kind"], "instance_failed");
        assert_eq!(value["code"], "INVALID_CONTEXT");
    }

    #[test]
    fn test_run_json_shape() {
        let mut sim = simulation();
        let summaries = sim.step(None);

        let report = run_json(&sim, &summaries, &[]);
        assert_eq!(report["ticks"], 1);
        assert_eq!(report["summaries"][0]["group"], "world");
        assert_eq!(report["contexts"]["porch"]["switch"], true);
        assert_eq!(
            report["snapshot"]["groups"]["world"][0]["definition"],
            "light"
        );
    }
}
