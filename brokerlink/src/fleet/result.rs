//! Aggregate results and their presentation.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;

use crate::driver::{DeviceOutcome, DeviceStatus};

/// Device counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_devices: usize,
    pub successful_devices: usize,
    pub failed_devices: usize,
}

/// Outcome of a fleet run.
///
/// `devices` is keyed by device name and ordered like the device list the
/// run was given, whatever order the devices finished in.
#[derive(Debug, Clone, Serialize)]
pub struct FleetResult {
    /// Per-device outcomes.
    pub devices: IndexMap<String, DeviceOutcome>,

    /// Counts derived from `devices`.
    pub summary: Summary,

    /// Whether any device was changed.
    pub changed: bool,

    /// Whether dispatching stopped before the whole list was run.
    #[serde(skip)]
    pub stopped_early: bool,

    #[serde(skip)]
    continue_on_device_failure: bool,
}

impl FleetResult {
    /// Assemble the result once every dispatched device is accounted for.
    pub fn collect(
        order: &[String],
        mut finished: HashMap<String, DeviceOutcome>,
        continue_on_device_failure: bool,
        stopped_early: bool,
    ) -> Self {
        let devices: IndexMap<String, DeviceOutcome> = order
            .iter()
            .filter_map(|device| finished.remove_entry(device))
            .collect();

        let successful_devices = devices.values().filter(|o| o.is_success()).count();
        let summary = Summary {
            total_devices: devices.len(),
            successful_devices,
            failed_devices: devices.len() - successful_devices,
        };

        Self {
            changed: devices.values().any(|o| o.changed),
            devices,
            summary,
            stopped_early,
            continue_on_device_failure,
        }
    }

    /// Why the run as a whole counts as failed, if it does.
    ///
    /// That is the case when a device failed and failures were not to be
    /// tolerated, or when every device failed.
    pub fn failure(&self) -> Option<String> {
        let failed: Vec<&str> = self
            .devices
            .values()
            .filter(|o| o.status == DeviceStatus::Failed)
            .map(|o| o.device_name.as_str())
            .collect();

        if failed.is_empty() {
            return None;
        }
        if !self.continue_on_device_failure {
            let first = &self.devices[failed[0]];
            return Some(format!(
                "device {} failed: {}",
                first.device_name,
                first.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if failed.len() == self.summary.total_devices {
            return Some(format!(
                "all {} device(s) failed: {}",
                failed.len(),
                failed.join(", ")
            ));
        }
        None
    }

    /// The only outcome, when exactly one device was processed.
    pub fn single(&self) -> Option<&DeviceOutcome> {
        match self.devices.len() {
            1 => self.devices.values().next(),
            _ => None,
        }
    }

    /// Presentation view with the single-device fields lifted to the top.
    pub fn report(&self) -> FleetReport<'_> {
        FleetReport {
            result: self,
            single: self.single().map(|outcome| SingleDeviceView {
                device_name: &outcome.device_name,
                executed_commands: &outcome.executed_commands,
                stdout: &outcome.stdout,
                status: outcome.status,
            }),
        }
    }
}

/// Fields of a lone device repeated at the top level of a report.
#[derive(Debug, Serialize)]
pub struct SingleDeviceView<'a> {
    pub device_name: &'a str,
    pub executed_commands: &'a [String],
    pub stdout: &'a str,
    pub status: DeviceStatus,
}

/// What gets printed for a fleet run.
///
/// Both views borrow the same outcomes, so they cannot disagree.
#[derive(Debug, Serialize)]
pub struct FleetReport<'a> {
    #[serde(flatten)]
    result: &'a FleetResult,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    single: Option<SingleDeviceView<'a>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(device: &str) -> DeviceOutcome {
        DeviceOutcome {
            status: DeviceStatus::Success,
            changed: true,
            error: None,
            executed_commands: vec!["reload".into(), "yes\r".into()],
            stdout: "Proceed? [yes/no]".into(),
            ..DeviceOutcome::abandoned(device, "")
        }
    }

    fn finished(outcomes: Vec<DeviceOutcome>) -> HashMap<String, DeviceOutcome> {
        outcomes
            .into_iter()
            .map(|o| (o.device_name.clone(), o))
            .collect()
    }

    #[test]
    fn test_collect_keeps_device_list_order() {
        let order = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let result = FleetResult::collect(
            &order,
            finished(vec![
                success("a"),
                DeviceOutcome::abandoned("b", "down"),
                success("c"),
            ]),
            true,
            false,
        );

        assert_eq!(result.devices.keys().collect::<Vec<_>>(), vec!["c", "a", "b"]);
        assert_eq!(
            result.summary,
            Summary {
                total_devices: 3,
                successful_devices: 2,
                failed_devices: 1
            }
        );
        assert!(result.changed);
        assert!(result.failure().is_none());
    }

    #[test]
    fn test_failure_policy() {
        let order = vec!["a".to_string(), "b".to_string()];

        let strict = FleetResult::collect(
            &order,
            finished(vec![success("a"), DeviceOutcome::abandoned("b", "down")]),
            false,
            true,
        );
        assert_eq!(strict.failure().unwrap(), "device b failed: down");

        let all_failed = FleetResult::collect(
            &order,
            finished(vec![
                DeviceOutcome::abandoned("a", "down"),
                DeviceOutcome::abandoned("b", "down"),
            ]),
            true,
            false,
        );
        assert_eq!(all_failed.failure().unwrap(), "all 2 device(s) failed: a, b");
    }

    #[test]
    fn test_single_device_is_flattened() {
        let result = FleetResult::collect(
            &["r1".to_string()],
            finished(vec![success("r1")]),
            false,
            false,
        );

        let json = serde_json::to_value(result.report()).unwrap();
        assert_eq!(json["device_name"], "r1");
        assert_eq!(json["stdout"], json["devices"]["r1"]["stdout"]);
        assert_eq!(
            json["executed_commands"],
            json["devices"]["r1"]["executed_commands"]
        );
        assert_eq!(json["summary"]["total_devices"], 1);
        assert_eq!(json["changed"], true);
    }

    #[test]
    fn test_multi_device_report_is_not_flattened() {
        let result = FleetResult::collect(
            &["a".to_string(), "b".to_string()],
            finished(vec![success("a"), success("b")]),
            false,
            false,
        );

        let json = serde_json::to_value(result.report()).unwrap();
        assert!(json.get("device_name").is_none());
        assert!(json.get("stopped_early").is_none());
        assert_eq!(json["devices"].as_object().unwrap().len(), 2);
    }
}
