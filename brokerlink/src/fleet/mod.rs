//! Fleet runs: one [`DeviceRunner`] per device, bounded fan-out.

mod result;

pub use result::{FleetReport, FleetResult, SingleDeviceView, Summary};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use log::{info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, DeviceFilter};
pub use crate::driver::CANCELLED_DETAIL;
use crate::driver::{DeviceOutcome, DeviceRunner, RunParams};
use crate::error::{ConfigError, Error, Result};

/// Which devices a run targets.
#[derive(Debug, Clone)]
pub enum DeviceSelection {
    /// An explicit list, used as given.
    Devices(Vec<String>),

    /// Everything in the broker's inventory matching the filter.
    Filter(DeviceFilter),
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Devices(devices) => write!(f, "{}", devices.join(", ")),
            Self::Filter(filter) => write!(f, "{filter}"),
        }
    }
}

/// Policy knobs for a fleet run.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Keep dispatching after a device fails.
    pub continue_on_device_failure: bool,

    /// Devices run at the same time.
    pub fan_out: usize,

    /// How long in-flight devices get to close their channels after
    /// cancellation before they are abandoned.
    pub cancel_grace: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            continue_on_device_failure: false,
            fan_out: 8,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Fans a device list out to independent device runs.
pub struct FleetOrchestrator<B> {
    broker: B,
    options: FleetOptions,
}

impl<B: Broker> FleetOrchestrator<B> {
    /// Create an orchestrator over `broker`.
    pub fn new(broker: B, options: FleetOptions) -> Self {
        Self { broker, options }
    }

    /// The broker this orchestrator drives.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Resolve the selection to a concrete, duplicate-free device list.
    pub async fn resolve(&self, selection: &DeviceSelection) -> Result<Vec<String>> {
        let devices = match selection {
            DeviceSelection::Devices(devices) => devices.clone(),
            DeviceSelection::Filter(filter) => self.broker.resolve_inventory(filter).await?,
        };

        let mut unique = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }

        if unique.is_empty() {
            return Err(ConfigError::NoDevices(selection.to_string()).into());
        }
        Ok(unique)
    }

    /// Run every selected device and collect the results.
    ///
    /// Device failures end up in the result, never as an `Err`; only
    /// configuration problems and inventory lookups fail the call.
    pub async fn run(
        &self,
        selection: &DeviceSelection,
        params: &RunParams,
        cancel: &CancellationToken,
    ) -> Result<FleetResult> {
        params.validate().map_err(Error::from)?;
        let devices = self.resolve(selection).await?;
        info!(
            "running {} device(s), fan-out {}",
            devices.len(),
            self.options.fan_out
        );

        let run_device = |device: String| {
            let runner = DeviceRunner::new(&self.broker, params).cancel_on(cancel.child_token());
            async move { runner.run(&device).await }
        };

        let fan_out = self.options.fan_out.max(1);
        let mut queue = devices.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut dispatched: Vec<&String> = Vec::new();
        let mut finished: HashMap<String, DeviceOutcome> = HashMap::new();
        let mut stopped_early = false;
        let mut cancelled = false;

        loop {
            while !stopped_early && in_flight.len() < fan_out {
                let Some(device) = queue.next() else { break };
                dispatched.push(device);
                in_flight.push(run_device(device.clone()));
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("fleet run cancelled, {} device(s) in flight", in_flight.len());
                    cancelled = true;
                    stopped_early = true;
                    break;
                }
                Some(outcome) = in_flight.next() => {
                    if !outcome.is_success() && !self.options.continue_on_device_failure {
                        warn!(
                            "{} failed, not dispatching further devices",
                            outcome.device_name
                        );
                        stopped_early = true;
                    }
                    finished.insert(outcome.device_name.clone(), outcome);
                }
            }
        }

        if cancelled {
            let grace_ends = Instant::now() + self.options.cancel_grace;
            while let Ok(Some(outcome)) =
                tokio::time::timeout_at(grace_ends, in_flight.next()).await
            {
                finished.insert(outcome.device_name.clone(), outcome);
            }
            drop(in_flight);

            for device in dispatched {
                if !finished.contains_key(device) {
                    warn!("{}: abandoned after cancellation grace period", device);
                    finished.insert(
                        device.clone(),
                        DeviceOutcome::abandoned(device.clone(), CANCELLED_DETAIL),
                    );
                }
            }
        }

        let result = FleetResult::collect(
            &devices,
            finished,
            self.options.continue_on_device_failure,
            stopped_early,
        );
        info!(
            "fleet run done: {} total, {} succeeded, {} failed",
            result.summary.total_devices,
            result.summary.successful_devices,
            result.summary.failed_devices
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeviceRecord, DeviceScript, MemoryBroker};
    use crate::driver::DeviceStatus;

    fn params() -> RunParams {
        RunParams::new(vec!["show clock".into()], Duration::from_secs(30))
            .delay_before_check(Duration::ZERO)
    }

    fn healthy() -> DeviceScript {
        DeviceScript::responsive("#").greeting("#")
    }

    fn broker() -> MemoryBroker {
        MemoryBroker::new()
            .device(
                DeviceRecord::new("core-a", "10.0.0.1"),
                DeviceScript::responsive("#").always_unreachable(),
            )
            .device(DeviceRecord::new("core-b", "10.0.0.2"), healthy())
            .device(DeviceRecord::new("edge-c", "10.0.1.1"), healthy())
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_with_continue_on_failure() {
        let fleet = FleetOrchestrator::new(
            broker(),
            FleetOptions {
                continue_on_device_failure: true,
                ..Default::default()
            },
        );
        let selection = DeviceSelection::Filter(DeviceFilter::by_name("^core-").unwrap());

        let result = fleet
            .run(&selection, &params(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.summary.total_devices, 2);
        assert_eq!(result.devices["core-a"].status, DeviceStatus::Failed);
        assert_eq!(result.devices["core-b"].status, DeviceStatus::Success);
        assert_eq!(
            result.devices.keys().collect::<Vec<_>>(),
            vec!["core-a", "core-b"]
        );
        assert_eq!(fleet.broker().inventory_queries(), 1);
        assert!(result.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_dispatching_after_first_failure() {
        let fleet = FleetOrchestrator::new(
            broker(),
            FleetOptions {
                fan_out: 1,
                ..Default::default()
            },
        );
        let selection = DeviceSelection::Devices(vec![
            "core-a".into(),
            "core-b".into(),
            "edge-c".into(),
        ]);

        let result = fleet
            .run(&selection, &params(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.summary.total_devices, 1);
        assert_eq!(result.summary.failed_devices, 1);
        assert_eq!(fleet.broker().opens("core-b"), 0);
        assert!(result.failure().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_always_adds_up() {
        for continue_on_device_failure in [false, true] {
            for fan_out in 1..=3 {
                let fleet = FleetOrchestrator::new(
                    broker(),
                    FleetOptions {
                        continue_on_device_failure,
                        fan_out,
                        ..Default::default()
                    },
                );
                let selection = DeviceSelection::Filter(DeviceFilter::by_name(".").unwrap());
                let result = fleet
                    .run(&selection, &params(), &CancellationToken::new())
                    .await
                    .unwrap();

                let summary = result.summary;
                assert_eq!(
                    summary.total_devices,
                    summary.successful_devices + summary.failed_devices
                );
                assert_eq!(summary.total_devices, result.devices.len());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_devices_is_config_error() {
        let fleet = FleetOrchestrator::new(broker(), FleetOptions::default());
        let selection = DeviceSelection::Filter(DeviceFilter::by_name("^nothing$").unwrap());

        let err = fleet
            .run(&selection, &params(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NoDevices(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_channels_opened_after_cancel() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::responsive("r1#")
                .greeting("r1#")
                .unreachable_on(2..=u32::MAX),
        );
        let fleet = FleetOrchestrator::new(
            broker,
            FleetOptions {
                cancel_grace: Duration::from_secs(10),
                ..Default::default()
            },
        );
        let params = RunParams::new(vec!["show clock".into()], Duration::from_secs(300))
            .pacing(Duration::ZERO, Duration::ZERO);
        let selection = DeviceSelection::Devices(vec!["r1".into()]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(21)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fleet.run(&selection, &params, &cancel).await.unwrap();

        // Command channel at 0 s, probes every 2 s from 10 s to 20 s.
        assert_eq!(started.elapsed(), Duration::from_secs(21));
        assert_eq!(fleet.broker().opens("r1"), 7);
        assert_eq!(result.devices["r1"].status, DeviceStatus::Failed);
        assert_eq!(result.devices["r1"].error.as_deref(), Some(CANCELLED_DETAIL));
        assert_eq!(result.devices["r1"].recovery_attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_stuck_closing_is_abandoned_after_grace() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("stuck", "10.0.0.1"),
            DeviceScript::silent()
                .greeting("#")
                .close_delay(Duration::from_secs(3600)),
        );
        let fleet = FleetOrchestrator::new(
            broker,
            FleetOptions {
                cancel_grace: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let selection = DeviceSelection::Devices(vec!["stuck".into()]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fleet.run(&selection, &params(), &cancel).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert_eq!(result.devices["stuck"].error.as_deref(), Some(CANCELLED_DETAIL));
        assert_eq!(result.devices["stuck"].attempts.len(), 0);
        assert_eq!(fleet.broker().closes("stuck"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_finished_devices() {
        let broker = MemoryBroker::new()
            .device(DeviceRecord::new("fast", "10.0.0.1"), healthy())
            .device(
                DeviceRecord::new("slow", "10.0.0.2"),
                healthy().open_delay(Duration::from_secs(3600)),
            )
            .device(DeviceRecord::new("queued", "10.0.0.3"), healthy());
        let fleet = FleetOrchestrator::new(
            broker,
            FleetOptions {
                continue_on_device_failure: true,
                fan_out: 2,
                cancel_grace: Duration::from_secs(5),
            },
        );
        let selection = DeviceSelection::Devices(vec![
            "slow".into(),
            "fast".into(),
            "queued".into(),
        ]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fleet.run(&selection, &params(), &cancel).await.unwrap();

        // "slow" sees the cancel while still opening and ends at once.
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(result.devices["fast"].status, DeviceStatus::Success);
        assert_eq!(
            result.devices["slow"].error.as_deref(),
            Some(CANCELLED_DETAIL)
        );
        // "queued" takes the slot "fast" frees and finishes before the cancel.
        assert_eq!(result.devices["queued"].status, DeviceStatus::Success);
        assert_eq!(result.summary.total_devices, 3);
    }
}
