//! Operator console
//!
//! Lines read from stdin are matched against a fixed table of triggers.
//! Each handler renders a plain-text report.

use std::fmt::Write;
use std::sync::Arc;

use crate::jobs::JobManager;
use crate::ports::PortAllocator;

/// What console handlers can look at
pub struct ConsoleContext {
    pub jobs: Arc<JobManager>,
    pub ports: Arc<PortAllocator>,
}

pub type ConsoleHandler = fn(&ConsoleContext) -> String;

pub struct ConsoleCommand {
    pub trigger: &'static str,
    pub description: &'static str,
    pub handler: ConsoleHandler,
}

pub static COMMANDS: &[ConsoleCommand] = &[
    ConsoleCommand {
        trigger: "jobs",
        description: "List active jobs and their instances",
        handler: jobs_report,
    },
    ConsoleCommand {
        trigger: "instances",
        description: "List ready and bound instances",
        handler: instances_report,
    },
    ConsoleCommand {
        trigger: "resources",
        description: "Show resource ceilings and allocation",
        handler: resources_report,
    },
    ConsoleCommand {
        trigger: "ports",
        description: "Show ports in their reuse cooldown",
        handler: ports_report,
    },
    ConsoleCommand {
        trigger: "breakers",
        description: "Show the circuit breaker of every instance",
        handler: breakers_report,
    },
    ConsoleCommand {
        trigger: "help",
        description: "List console commands",
        handler: help_report,
    },
];

/// Runs the command named by `line`
///
/// # Returns
/// The report, or None for an empty line
pub fn dispatch(context: &ConsoleContext, line: &str) -> Option<String> {
    let trigger = line.trim();
    if trigger.is_empty() {
        return None;
    }

    match COMMANDS
        .iter()
        .find(|command| command.trigger.eq_ignore_ascii_case(trigger))
    {
        Some(command) => Some((command.handler)(context)),
        None => Some(format!(
            "Unknown command '{}'. Type 'help' for a list of commands.",
            trigger
        )),
    }
}

fn jobs_report(context: &ConsoleContext) -> String {
    let jobs = context.jobs.active_jobs_snapshot();
    let mut out = format!("{} active job(s)\n", jobs.len());
    for active in jobs {
        let _ = writeln!(
            out,
            "  {} -> {} (port {}, expires {}, cores {})",
            active.job.id,
            active.instance.name(),
            active.instance.port(),
            active.instance.expiration_time().to_rfc3339(),
            active.job.resources.cores
        );
    }
    out
}

fn instances_report(context: &ConsoleContext) -> String {
    let instances = context.jobs.list_instances();
    let mut out = format!(
        "{} instance(s), {} ready, version '{}'\n",
        instances.len(),
        context.jobs.get_ready_instance_count(),
        context.jobs.version()
    );
    for instance in instances {
        let _ = writeln!(
            out,
            "  {} [{}] port {} version {} uses {} job {}",
            instance.name,
            instance.id,
            instance.port,
            instance.version,
            instance.use_count,
            instance.job_id.as_deref().unwrap_or("-")
        );
    }
    out
}

fn resources_report(context: &ConsoleContext) -> String {
    let report = context.jobs.resource_report();
    serde_json::to_string_pretty(&report).unwrap_or_else(|e| format!("Failed to render: {}", e))
}

fn ports_report(context: &ConsoleContext) -> String {
    let mut ports = context.ports.cached_ports();
    ports.sort_unstable();
    let range = &context.ports.settings().range;
    format!(
        "Range {}..{}, {} port(s) cooling down: {:?}",
        range.start,
        range.end,
        ports.len(),
        ports
    )
}

fn breakers_report(context: &ConsoleContext) -> String {
    let mut out = String::new();
    for instance in context.jobs.list_instances() {
        let state = if instance.breaker_tripped { "OPEN" } else { "closed" };
        let _ = writeln!(
            out,
            "  {}: {} ({} consecutive failure(s))",
            instance.name, state, instance.breaker_failures
        );
    }
    if out.is_empty() {
        out.push_str("No instances");
    }
    out
}

fn help_report(_context: &ConsoleContext) -> String {
    let mut out = String::new();
    for command in COMMANDS {
        let _ = writeln!(out, "  {:<10} {}", command.trigger, command.description);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::DeployError;
    use crate::instance::{GridServerInstance, InstanceProvider};
    use crate::jobs::JobManagerSettings;
    use crate::ports::{PortAllocatorSettings, PortProbe};
    use async_trait::async_trait;
    use grid_core::metrics::NoopCounterRegistry;
    use grid_core::random::SeededRandom;

    struct NoInstances;

    #[async_trait]
    impl InstanceProvider for NoInstances {
        async fn create_instance(&self, _version: &str) -> Result<Arc<dyn GridServerInstance>, DeployError> {
            Err(DeployError::Launch("no instances in tests".to_string()))
        }

        async fn discover_instances(&self) -> Result<Vec<Arc<dyn GridServerInstance>>, DeployError> {
            Ok(Vec::new())
        }

        async fn latest_version(&self) -> Result<String, DeployError> {
            Ok("1.0".to_string())
        }

        async fn on_version_change(&self, _version: &str, _is_startup: bool) -> bool {
            true
        }
    }

    struct NothingBound;

    impl PortProbe for NothingBound {
        fn is_port_in_use(&self, _port: u16) -> bool {
            false
        }
    }

    fn context() -> ConsoleContext {
        ConsoleContext {
            jobs: Arc::new(JobManager::new(
                JobManagerSettings::default(),
                Arc::new(NoInstances),
                Arc::new(NoopCounterRegistry),
            )),
            ports: Arc::new(PortAllocator::new(
                PortAllocatorSettings::default(),
                Arc::new(NothingBound),
                Arc::new(SeededRandom::new(1)),
                Arc::new(NoopCounterRegistry),
            )),
        }
    }

    #[test]
    fn test_every_trigger_is_unique() {
        for (i, command) in COMMANDS.iter().enumerate() {
            assert!(
                COMMANDS[i + 1..].iter().all(|other| other.trigger != command.trigger),
                "duplicate trigger {}",
                command.trigger
            );
        }
    }

    #[test]
    fn test_dispatch_by_trigger() {
        let context = context();

        assert!(dispatch(&context, "   ").is_none());
        assert!(dispatch(&context, "JOBS").unwrap().starts_with("0 active job(s)"));
        assert!(dispatch(&context, "help").unwrap().contains("breakers"));
        assert!(dispatch(&context, "reboot").unwrap().starts_with("Unknown command 'reboot'"));
    }

    #[test]
    fn test_ports_report_lists_cooling_ports() {
        let context = context();
        let port = context.ports.find_next_available_port().unwrap();

        let report = dispatch(&context, "ports").unwrap();
        assert!(report.contains("1 port(s) cooling down"));
        assert!(report.contains(&port.to_string()));
    }

    #[test]
    fn test_resources_report_is_json() {
        let report = dispatch(&context(), "resources").unwrap();
        let json: serde_json::Value = serde_json::from_str(&report).unwrap();

        assert_eq!(json["allocatedPhysicalCores"], 0.0);
    }
}
