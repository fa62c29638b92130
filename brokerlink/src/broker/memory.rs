//! In-memory broker with scripted devices.
//!
//! Used by the tests and handy for dry runs: every device is a small
//! script of "when this is sent, answer with that", plus failure
//! injection for unreachable windows, refused writes and remote closes.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use regex::Regex as TextRegex;
use regex::bytes::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::Broker;
use super::inventory::{DeviceFilter, DeviceRecord, Inventory};
use crate::channel::CommandChannel;
use crate::error::{BrokerError, ChannelError};

/// Input a scripted reply reacts to.
#[derive(Debug, Clone)]
enum Trigger {
    Pattern(TextRegex),

    /// Triggers that are not valid regexes match as plain substrings.
    Literal(String),
}

impl Trigger {
    fn parse(trigger: &str) -> Self {
        TextRegex::new(trigger)
            .map(Trigger::Pattern)
            .unwrap_or_else(|_| Trigger::Literal(trigger.to_string()))
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            Trigger::Pattern(pattern) => pattern.is_match(line),
            Trigger::Literal(text) => line.contains(text.as_str()),
        }
    }

    fn is_catch_all(&self) -> bool {
        matches!(self, Trigger::Pattern(pattern) if pattern.as_str() == ".*")
    }
}

/// What a scripted device does when it sees matching input.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    trigger: Trigger,
    output: Vec<String>,
    then_close: bool,
}

impl ScriptedReply {
    /// Reply with `output` whenever sent text matches `trigger`.
    pub fn new(trigger: &str, output: impl Into<String>) -> Self {
        Self {
            trigger: Trigger::parse(trigger),
            output: vec![output.into()],
            then_close: false,
        }
    }

    /// Deliver `more` as a separate read after the output so far.
    pub fn chunk(mut self, more: impl Into<String>) -> Self {
        self.output.push(more.into());
        self
    }

    /// Close the session right after sending the output.
    pub fn then_close(mut self) -> Self {
        self.then_close = true;
        self
    }
}

/// Behavior of one scripted device.
#[derive(Debug, Clone)]
pub struct DeviceScript {
    greeting: String,
    replies: Vec<ScriptedReply>,
    prompt: Option<Regex>,
    unreachable: Vec<RangeInclusive<u32>>,
    refuse_writes: bool,
    open_delay: Duration,
    close_delay: Duration,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            greeting: String::new(),
            replies: Vec::new(),
            prompt: Regex::new(r"[>#$]\s*$").ok(),
            unreachable: Vec::new(),
            refuse_writes: false,
            open_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
        }
    }
}

impl DeviceScript {
    /// A device that echoes nothing and never shows a prompt.
    pub fn silent() -> Self {
        Self::default()
    }

    /// A device that answers every line with `output` followed by `prompt`.
    pub fn responsive(prompt: &str) -> Self {
        Self::default().reply(ScriptedReply::new(".*", format!("\r\n{prompt}")))
    }

    /// Output emitted as soon as a channel is opened.
    pub fn greeting(mut self, text: impl Into<String>) -> Self {
        self.greeting = text.into();
        self
    }

    /// Add a reply; earlier replies take precedence.
    pub fn reply(mut self, reply: ScriptedReply) -> Self {
        self.replies.insert(self.replies.len().saturating_sub(self.catch_all()), reply);
        self
    }

    /// Completion pattern the channel exposes, or none for quiet-period
    /// devices.
    pub fn prompt(mut self, pattern: Option<&str>) -> Self {
        self.prompt = pattern.and_then(|p| Regex::new(p).ok());
        self
    }

    /// Opens numbered in `range` (1-based) fail as unreachable.
    pub fn unreachable_on(mut self, range: RangeInclusive<u32>) -> Self {
        self.unreachable.push(range);
        self
    }

    /// Every open fails as unreachable.
    pub fn always_unreachable(self) -> Self {
        self.unreachable_on(1..=u32::MAX)
    }

    /// Every write is rejected.
    pub fn refuse_writes(mut self) -> Self {
        self.refuse_writes = true;
        self
    }

    /// Opening a channel takes this long.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Closing a channel takes this long.
    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    fn catch_all(&self) -> usize {
        self.replies
            .iter()
            .rev()
            .take_while(|reply| reply.trigger.is_catch_all())
            .count()
    }
}

/// How a scripted relay backend behaves.
#[derive(Debug, Clone)]
pub enum BackendScript {
    /// Send a banner, then echo everything back.
    Echo { banner: String },

    /// Accept the stream and never send a byte.
    Silent,

    /// Hand out a stream whose far end is already gone.
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    opens: HashMap<String, u32>,
    closes: HashMap<String, u32>,
    sent: HashMap<String, Vec<String>>,
    backend_opens: Vec<(String, String)>,
    inventory_queries: u32,
}

/// Scripted broker.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    devices: HashMap<String, DeviceScript>,
    backends: HashMap<(String, String), BackendScript>,
    records: Vec<DeviceRecord>,
    counters: Arc<Mutex<Counters>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device.
    pub fn device(mut self, record: DeviceRecord, script: DeviceScript) -> Self {
        self.devices.insert(record.name.clone(), script);
        self.records.retain(|existing| existing.name != record.name);
        self.records.push(record);
        self
    }

    /// Register a relay backend reachable as `target@routing_key`.
    pub fn backend(mut self, target: &str, routing_key: &str, script: BackendScript) -> Self {
        self.backends
            .insert((target.to_string(), routing_key.to_string()), script);
        self
    }

    /// How many channels were opened to `device`.
    pub fn opens(&self, device: &str) -> u32 {
        self.lock().opens.get(device).copied().unwrap_or(0)
    }

    /// How many channels to `device` were closed from this side.
    pub fn closes(&self, device: &str) -> u32 {
        self.lock().closes.get(device).copied().unwrap_or(0)
    }

    /// Everything sent to `device`, across all channels, in order.
    pub fn sent(&self, device: &str) -> Vec<String> {
        self.lock().sent.get(device).cloned().unwrap_or_default()
    }

    /// Backend streams opened so far, as `(target, routing_key)`.
    pub fn backend_opens(&self) -> Vec<(String, String)> {
        self.lock().backend_opens.clone()
    }

    /// How many inventory queries were made.
    pub fn inventory_queries(&self) -> u32 {
        self.lock().inventory_queries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broker for MemoryBroker {
    type Channel = ScriptedChannel;
    type Stream = DuplexStream;

    async fn open_channel(&self, device: &str) -> Result<ScriptedChannel, BrokerError> {
        let script = self
            .devices
            .get(device)
            .cloned()
            .ok_or_else(|| BrokerError::DeviceUnreachable {
                device: device.to_string(),
                reason: "not in inventory".to_string(),
            })?;

        let open_index = {
            let mut counters = self.lock();
            let count = counters.opens.entry(device.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if !script.open_delay.is_zero() {
            tokio::time::sleep(script.open_delay).await;
        }

        if script.unreachable.iter().any(|range| range.contains(&open_index)) {
            return Err(BrokerError::DeviceUnreachable {
                device: device.to_string(),
                reason: format!("connection refused (open #{open_index})"),
            });
        }

        Ok(ScriptedChannel::new(
            device,
            script,
            Arc::clone(&self.counters),
        ))
    }

    async fn resolve_inventory(&self, filter: &DeviceFilter) -> Result<Vec<String>, BrokerError> {
        self.lock().inventory_queries += 1;
        Ok(Inventory::new(self.records.clone()).select(filter))
    }

    async fn open_backend_stream(
        &self,
        target: &str,
        routing_key: &str,
    ) -> Result<DuplexStream, BrokerError> {
        self.lock()
            .backend_opens
            .push((target.to_string(), routing_key.to_string()));

        let script = self
            .backends
            .get(&(target.to_string(), routing_key.to_string()))
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTarget {
                target: target.to_string(),
                routing_key: routing_key.to_string(),
            })?;

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        if let BackendScript::Closed = script {
            drop(theirs);
            return Ok(ours);
        }
        tokio::spawn(async move {
            match script {
                BackendScript::Echo { banner } => {
                    if theirs.write_all(banner.as_bytes()).await.is_err() {
                        return;
                    }
                    let mut buf = [0u8; 4096];
                    loop {
                        match theirs.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if theirs.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                BackendScript::Closed => {}
                BackendScript::Silent => {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = theirs.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ours)
    }
}

/// Channel to a scripted device.
#[derive(Debug)]
pub struct ScriptedChannel {
    device: String,
    script: DeviceScript,
    pending: VecDeque<Bytes>,
    closing: bool,
    open: bool,
    counters: Arc<Mutex<Counters>>,
}

impl ScriptedChannel {
    fn new(device: &str, script: DeviceScript, counters: Arc<Mutex<Counters>>) -> Self {
        let mut pending = VecDeque::new();
        if !script.greeting.is_empty() {
            pending.push_back(Bytes::from(script.greeting.clone()));
        }
        Self {
            device: device.to_string(),
            script,
            pending,
            closing: false,
            open: true,
            counters,
        }
    }
}

impl CommandChannel for ScriptedChannel {
    async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if !self.open || self.closing {
            return Err(ChannelError::Closed);
        }
        if self.script.refuse_writes {
            return Err(ChannelError::WriteFailed("write refused".to_string()));
        }

        if let Ok(mut counters) = self.counters.lock() {
            counters
                .sent
                .entry(self.device.clone())
                .or_default()
                .push(text.to_string());
        }

        let line = text.trim_end_matches(['\r', '\n']);
        if let Some(reply) = self
            .script
            .replies
            .iter()
            .find(|reply| reply.trigger.is_match(line))
        {
            self.pending.extend(
                reply
                    .output
                    .iter()
                    .filter(|chunk| !chunk.is_empty())
                    .map(|chunk| Bytes::from(chunk.clone())),
            );
            self.closing |= reply.then_close;
        }
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        if self.closing {
            self.open = false;
            return Err(ChannelError::Closed);
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if !self.script.close_delay.is_zero() {
            tokio::time::sleep(self.script.close_delay).await;
        }
        self.open = false;
        if let Ok(mut counters) = self.counters.lock() {
            *counters.closes.entry(self.device.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open && !self.closing
    }

    fn completion_pattern(&self) -> Option<&Regex> {
        self.script.prompt.as_ref()
    }
}
