use std::collections::HashMap;

use fleetmon_common::proto;
use fleetmon_storage::entities::{cron, service};

/// Which agents a service probe is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCover {
    /// Every agent except the skip set.
    All,
    /// Only the agents in the skip set.
    OnlyListed,
}

/// A probe definition, parsed out of its storage row.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub target: String,
    pub kind: u64,
    pub cron_spec: String,
    pub duration: u64,
    pub skip_servers: HashMap<u64, bool>,
    pub cover: ServiceCover,
    pub notify: bool,
    pub notification_group_id: u64,
    pub latency_notify: bool,
    pub min_latency: f32,
    pub max_latency: f32,
    pub enable_show_in_service: bool,
    pub enable_trigger_task: bool,
    pub fail_trigger_tasks: Vec<u64>,
    pub recover_trigger_tasks: Vec<u64>,
}

impl Service {
    pub fn from_model(m: service::Model) -> Self {
        Self {
            id: m.id as u64,
            user_id: m.user_id as u64,
            name: m.name,
            target: m.target,
            kind: m.kind as u64,
            cron_spec: m.cron_spec,
            duration: m.duration.max(0) as u64,
            skip_servers: parse_json_or_default(&m.skip_servers_raw),
            cover: if m.cover == 1 {
                ServiceCover::OnlyListed
            } else {
                ServiceCover::All
            },
            notify: m.notify,
            notification_group_id: m.notification_group_id as u64,
            latency_notify: m.latency_notify,
            min_latency: m.min_latency,
            max_latency: m.max_latency,
            enable_show_in_service: m.enable_show_in_service,
            enable_trigger_task: m.enable_trigger_task,
            fail_trigger_tasks: parse_json_or_default(&m.fail_trigger_tasks_raw),
            recover_trigger_tasks: parse_json_or_default(&m.recover_trigger_tasks_raw),
        }
    }

    /// Whether this probe should run on the given agent, per cover mode.
    pub fn runs_on(&self, server_id: u64) -> bool {
        let listed = self.skip_servers.get(&server_id).copied().unwrap_or(false);
        match self.cover {
            ServiceCover::All => !listed,
            ServiceCover::OnlyListed => listed,
        }
    }

    /// The probe descriptor pushed down agent task streams.
    pub fn to_task(&self) -> proto::Task {
        proto::Task {
            id: self.id,
            r#type: self.kind,
            data: self.target.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronType {
    Scheduled,
    AlertTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronCover {
    /// Every agent except the listed set.
    All,
    /// Only the listed agents.
    OnlyListed,
    /// Only the agent that fired the triggering alert.
    AlertTrigger,
}

/// A user-defined task, either cron-scheduled or fired by alert transitions.
#[derive(Debug, Clone)]
pub struct Cron {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub task_type: CronType,
    pub scheduler: String,
    pub command: String,
    pub servers: Vec<u64>,
    pub cover: CronCover,
    pub push_successful: bool,
    pub notification_group_id: u64,
}

impl Cron {
    pub fn from_model(m: cron::Model) -> Self {
        Self {
            id: m.id as u64,
            user_id: m.user_id as u64,
            name: m.name,
            task_type: if m.task_type == 1 {
                CronType::AlertTriggered
            } else {
                CronType::Scheduled
            },
            scheduler: m.scheduler,
            command: m.command,
            servers: parse_json_or_default(&m.servers_raw),
            cover: match m.cover {
                1 => CronCover::OnlyListed,
                2 => CronCover::AlertTrigger,
                _ => CronCover::All,
            },
            push_successful: m.push_successful,
            notification_group_id: m.notification_group_id as u64,
        }
    }

    pub fn to_task(&self) -> proto::Task {
        proto::Task {
            id: self.id,
            r#type: fleetmon_common::types::task_type::COMMAND,
            data: self.command.clone(),
        }
    }
}

fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    if raw.is_empty() {
        return T::default();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_cover_modes() {
        let mut service = Service {
            id: 1,
            user_id: 0,
            name: "ping".into(),
            target: "203.0.113.1".into(),
            kind: fleetmon_common::types::task_type::ICMP_PING,
            cron_spec: String::new(),
            duration: 60,
            skip_servers: HashMap::from([(2, true)]),
            cover: ServiceCover::All,
            notify: false,
            notification_group_id: 0,
            latency_notify: false,
            min_latency: 0.0,
            max_latency: 0.0,
            enable_show_in_service: true,
            enable_trigger_task: false,
            fail_trigger_tasks: vec![],
            recover_trigger_tasks: vec![],
        };

        assert!(service.runs_on(1));
        assert!(!service.runs_on(2));

        service.cover = ServiceCover::OnlyListed;
        assert!(!service.runs_on(1));
        assert!(service.runs_on(2));
    }
}
