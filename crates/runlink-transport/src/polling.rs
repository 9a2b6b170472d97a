//! Snapshot polling, the last-resort transport.
//!
//! Each tick fetches the full run snapshot; ticks never overlap because the
//! next tick is only awaited after the fetch resolves. Polling ends on a
//! final status, on the output-size completion heuristic, on the
//! empty-response circuit breaker, or on the wall-clock ceiling.
//!
//! The size heuristic stands in for an explicit completion signal that the
//! backend does not always send. It is an approximation: set
//! `completion_threshold` to `None` to rely on `status` alone.

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use runlink_protocol::{
    Endpoints, LinkError, LinkResult, NormalizedEvent, RunIdentity, RunSnapshot, RunStatus,
};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

use crate::control::{ConnectionControl, ConnectionHandle};
use crate::failure::FailureClass;
use crate::millis;
use crate::sink::{ConnectionState, EventSink, TransportFailure, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub max_duration: Duration,
    /// Consecutive ticks without a usable snapshot that are tolerated; the
    /// next one trips the breaker.
    pub max_empty_responses: u32,
    /// Output size (characters) treated as a finished run. `None` disables it.
    pub completion_threshold: Option<usize>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_duration: Duration::from_secs(10 * 60),
            max_empty_responses: 3,
            completion_threshold: Some(2000),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct PollingFallback {
    client: reqwest::Client,
    config: PollingConfig,
    slot: Mutex<Option<ConnectionHandle>>,
}

impl PollingConfig {
    /// A zero interval cannot drive a timer.
    pub fn validate(&self) -> LinkResult<()> {
        if self.interval.is_zero() {
            return Err(LinkError::Config(
                "polling interval must be greater than zero".to_owned(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(LinkError::Config(
                "polling request timeout must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

impl PollingFallback {
    pub fn new(client: reqwest::Client, config: PollingConfig) -> Self {
        Self {
            client,
            config,
            slot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Start polling. Returns `Ok(false)` without doing anything when a poll
    /// loop is already running.
    #[instrument(
        skip_all,
        fields(thread_id = %identity.thread_id, run_id = %identity.run_id, transport = "polling")
    )]
    pub fn start(
        &self,
        endpoints: &Endpoints,
        identity: &RunIdentity,
        credential: &str,
        sink: EventSink,
    ) -> LinkResult<bool> {
        self.config.validate()?;
        let mut slot = self.slot.lock();
        if let Some(running) = slot.as_ref()
            && !running.is_finished()
        {
            debug!("polling already running");
            return Ok(false);
        }

        let url = endpoints.snapshot(identity)?;
        let control = ConnectionControl::new();
        let span = info_span!(
            "snapshot_poll",
            thread_id = %identity.thread_id,
            run_id = %identity.run_id
        );
        let task = poll_run(PollTask {
            client: self.client.clone(),
            url,
            credential: credential.to_owned(),
            config: self.config.clone(),
            sink: sink.for_kind(TransportKind::Polling),
            control: control.clone(),
        });
        *slot = Some(ConnectionHandle::spawn(control, task.instrument(span)));
        info!(interval = ?self.config.interval, "polling started");
        Ok(true)
    }

    /// Cancel the timer and any in-flight fetch. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(running) = self.slot.lock().take()
            && running.shutdown()
        {
            info!(transport = "polling", "polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollTask {
    client: reqwest::Client,
    url: Url,
    credential: String,
    config: PollingConfig,
    sink: EventSink,
    control: ConnectionControl,
}

enum Fetch {
    Snapshot(RunSnapshot),
    /// No usable response this tick.
    Empty(String),
    /// Authentication rejected or the run is gone.
    Fatal(String),
}

enum PollEnd {
    Completed(RunStatus),
    Failed(TransportFailure),
    Stopped,
}

/// Resolves at `deadline`, or never when the ceiling is beyond the clock.
async fn ceiling(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_run(task: PollTask) {
    task.control.report(&task.sink, ConnectionState::Open);
    let deadline = Instant::now().checked_add(task.config.max_duration);
    let mut ticker = tokio::time::interval(task.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut empty_ticks: u32 = 0;

    let end = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = ceiling(deadline) => break timed_out(&task.config),
            () = task.control.stopped() => break PollEnd::Stopped,
        }

        let fetched = tokio::select! {
            fetched = fetch_snapshot(&task) => fetched,
            () = ceiling(deadline) => break timed_out(&task.config),
            () = task.control.stopped() => break PollEnd::Stopped,
        };

        match fetched {
            Fetch::Snapshot(snapshot) => {
                empty_ticks = 0;
                if let Some(values) = snapshot.to_values() {
                    task.control
                        .emit(&task.sink, NormalizedEvent::ValuesUpdated { values });
                }
                if let Some(status) = completion(&snapshot, task.config.completion_threshold) {
                    let completed = NormalizedEvent::RunCompleted {
                        status: status.clone(),
                    };
                    task.control.emit(&task.sink, completed);
                    break PollEnd::Completed(status);
                }
            }
            Fetch::Empty(why) => {
                empty_ticks += 1;
                debug!(empty_ticks, %why, "empty poll");
                if empty_ticks > task.config.max_empty_responses {
                    break PollEnd::Failed(TransportFailure::transient(format!(
                        "run failed to start: no response after {empty_ticks} consecutive \
                         polls ({why})"
                    )));
                }
            }
            Fetch::Fatal(message) => {
                break PollEnd::Failed(TransportFailure::new(FailureClass::SessionFatal, message));
            }
        }
    };

    match end {
        PollEnd::Completed(status) => {
            info!(%status, "polling finished");
            task.control.report(&task.sink, ConnectionState::Closed);
        }
        PollEnd::Failed(failure) => {
            warn!(class = ?failure.class, message = %failure.message, "polling failed");
            task.control.report(&task.sink, ConnectionState::Failed);
            task.control.fail(&task.sink, failure);
        }
        PollEnd::Stopped => task.control.set_state(ConnectionState::Closed),
    }
}

fn timed_out(config: &PollingConfig) -> PollEnd {
    PollEnd::Failed(TransportFailure::transient(format!(
        "polling timed out after {}s without a final status",
        config.max_duration.as_secs()
    )))
}

async fn fetch_snapshot(task: &PollTask) -> Fetch {
    let response = match task
        .client
        .get(task.url.clone())
        .bearer_auth(&task.credential)
        .header(ACCEPT, "application/json")
        .timeout(task.config.request_timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => return Fetch::Empty(error.to_string()),
    };

    let status = response.status();
    if FailureClass::from_http_status(status.as_u16()).is_session_fatal() {
        return Fetch::Fatal(format!("snapshot request rejected: HTTP {status}"));
    }
    if !status.is_success() {
        return Fetch::Empty(format!("HTTP {status}"));
    }

    match response.text().await {
        Ok(body) => match RunSnapshot::from_body(&body) {
            Some(snapshot) => Fetch::Snapshot(snapshot),
            None => Fetch::Empty("empty snapshot".to_owned()),
        },
        Err(error) => Fetch::Empty(error.to_string()),
    }
}

/// A final status wins; otherwise a large enough output counts as done.
fn completion(snapshot: &RunSnapshot, threshold: Option<usize>) -> Option<RunStatus> {
    if let Some(status) = snapshot.run_status()
        && status.is_final()
    {
        return Some(status);
    }
    match threshold {
        Some(min) if snapshot.output_len() >= min => Some(RunStatus::Completed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use runlink_mock::{MockBackend, MockScript, PollScript};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::sink::{SinkMessage, TransportSignal};

    fn fast(max_empty_responses: u32) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(10),
            max_duration: Duration::from_secs(5),
            max_empty_responses,
            completion_threshold: Some(20),
            request_timeout: Duration::from_secs(1),
        }
    }

    /// What a poll loop reported before it stopped.
    #[derive(Debug)]
    enum Outcome {
        Completed(Vec<NormalizedEvent>),
        Failed(Vec<NormalizedEvent>, TransportFailure),
    }

    async fn outcome(rx: &mut mpsc::UnboundedReceiver<SinkMessage>) -> Outcome {
        let mut events = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("poll signal in time")
                .expect("sink open");
            assert_eq!(message.kind, TransportKind::Polling);
            match message.signal {
                TransportSignal::Event(event) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        return Outcome::Completed(events);
                    }
                }
                TransportSignal::Failed(failure) => return Outcome::Failed(events, failure),
                TransportSignal::State(_) => {}
            }
        }
    }

    async fn start(
        backend: &MockBackend,
        config: PollingConfig,
    ) -> (PollingFallback, mpsc::UnboundedReceiver<SinkMessage>) {
        let endpoints = Endpoints::parse(&backend.base_url()).unwrap();
        let (sink, rx) = EventSink::channel(1, TransportKind::Stream);
        let polling = PollingFallback::new(reqwest::Client::new(), config);
        assert!(polling
            .start(&endpoints, &RunIdentity::new("t1", "r1"), "tok", sink)
            .unwrap());
        (polling, rx)
    }

    fn running() -> MockScript {
        MockScript::new().poll(PollScript::Snapshot(json!({"status": "running"})))
    }

    #[tokio::test]
    async fn polls_until_final_status() {
        let backend = MockBackend::spawn(
            MockScript::new()
                .poll(PollScript::Snapshot(json!({"status": "running", "values": {"step": 1}})))
                .poll(PollScript::Snapshot(json!({
                    "status": "completed",
                    "output": "ok",
                    "values": {"step": 2}
                }))),
        )
        .await
        .unwrap();
        let (_polling, mut rx) = start(&backend, fast(3)).await;

        let Outcome::Completed(events) = outcome(&mut rx).await else {
            panic!("polling should complete");
        };
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            NormalizedEvent::ValuesUpdated { values } if values["step"] == 1
        ));
        assert!(matches!(
            &events[1],
            NormalizedEvent::ValuesUpdated { values } if values["output"] == "ok"
        ));
        assert_eq!(events[2], NormalizedEvent::RunCompleted { status: RunStatus::Completed });
        assert_eq!(backend.counters().poll_requests, 2);
    }

    #[tokio::test]
    async fn breaker_trips_on_fourth_empty_tick() {
        let backend = MockBackend::spawn(MockScript::new().poll(PollScript::Empty))
            .await
            .unwrap();
        let (polling, mut rx) = start(&backend, fast(3)).await;

        match outcome(&mut rx).await {
            Outcome::Failed(events, failure) => {
                assert!(events.is_empty(), "{events:?}");
                assert_eq!(failure.class, FailureClass::Transient);
                assert!(failure.message.starts_with("run failed to start"), "{}", failure.message);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(backend.counters().poll_requests, 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!polling.is_polling());
    }

    #[tokio::test]
    async fn large_output_counts_as_completion() {
        let backend = MockBackend::spawn(MockScript::new().poll(PollScript::Snapshot(json!({
            "status": "running",
            "output": "a finished design document"
        }))))
        .await
        .unwrap();
        let (_polling, mut rx) = start(&backend, fast(3)).await;

        let Outcome::Completed(events) = outcome(&mut rx).await else {
            panic!("polling should complete");
        };
        assert_eq!(
            events.last(),
            Some(&NormalizedEvent::RunCompleted { status: RunStatus::Completed })
        );
    }

    #[tokio::test]
    async fn missing_run_is_fatal_immediately() {
        let backend = MockBackend::spawn(MockScript::new().poll(PollScript::Status(404)))
            .await
            .unwrap();
        let (_polling, mut rx) = start(&backend, fast(3)).await;

        match outcome(&mut rx).await {
            Outcome::Failed(_, failure) => {
                assert_eq!(failure.class, FailureClass::SessionFatal);
                assert!(failure.message.contains("404"), "{}", failure.message);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(backend.counters().poll_requests, 1);
    }

    #[tokio::test]
    async fn wall_clock_ceiling_ends_polling() {
        let backend = MockBackend::spawn(running()).await.unwrap();
        let config = PollingConfig {
            max_duration: Duration::from_millis(80),
            ..fast(3)
        };
        let (_polling, mut rx) = start(&backend, config).await;

        match outcome(&mut rx).await {
            Outcome::Failed(_, failure) => {
                assert_eq!(failure.class, FailureClass::Transient);
                assert!(failure.message.starts_with("polling timed out"), "{}", failure.message);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbounded_ceiling_keeps_polling() {
        let backend = MockBackend::spawn(running()).await.unwrap();
        let config = PollingConfig {
            max_duration: Duration::MAX,
            ..fast(3)
        };
        let (polling, mut rx) = start(&backend, config).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.counters().poll_requests < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("three polls in time");
        while let Ok(message) = rx.try_recv() {
            assert!(!matches!(message.signal, TransportSignal::Failed(_)), "{message:?}");
        }
        assert!(polling.is_polling());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected_before_spawning() {
        let endpoints = Endpoints::parse("http://127.0.0.1:1").unwrap();
        let (sink, _rx) = EventSink::channel(1, TransportKind::Polling);
        let config = PollingConfig {
            interval: Duration::ZERO,
            ..fast(3)
        };
        let polling = PollingFallback::new(reqwest::Client::new(), config);

        let started = polling.start(&endpoints, &RunIdentity::new("t1", "r1"), "tok", sink);
        assert!(matches!(started, Err(LinkError::Config(_))));
        assert!(!polling.is_polling());
    }

    #[tokio::test]
    async fn start_is_reentrant_and_stop_idempotent() {
        let backend = MockBackend::spawn(running()).await.unwrap();
        let (polling, _rx) = start(&backend, fast(3)).await;
        let endpoints = Endpoints::parse(&backend.base_url()).unwrap();
        let (sink, _other) = EventSink::channel(1, TransportKind::Polling);

        assert!(polling.is_polling());
        assert!(!polling
            .start(&endpoints, &RunIdentity::new("t1", "r1"), "tok", sink)
            .unwrap());
        polling.stop();
        polling.stop();
        assert!(!polling.is_polling());
    }

    #[test]
    fn completion_prefers_status_and_respects_disabled_threshold() {
        let failed = RunSnapshot {
            status: Some("failed".into()),
            ..RunSnapshot::default()
        };
        assert_eq!(completion(&failed, None), Some(RunStatus::Failed));

        let long = RunSnapshot {
            status: Some("running".into()),
            output: Some(json!("x".repeat(50))),
            ..RunSnapshot::default()
        };
        assert_eq!(completion(&long, Some(10)), Some(RunStatus::Completed));
        assert_eq!(completion(&long, None), None);
    }
}
