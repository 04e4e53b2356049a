#![cfg(unix)]

use oledlink_worker::{
    ChannelMode, ChildSupervisor, ExitReport, HostFrame, HostMessage, LogSink, OutputLine,
    RestartConfig, RestartPolicy, StateMessage, StreamKind, SupervisorConfig, WorkerError,
    WorkerMessage, WorkerSpec, WorkerState,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<OutputLine>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn stream(&self, stream: StreamKind) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.text.clone())
            .collect()
    }

    fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

impl LogSink for RecordingSink {
    fn line(&self, line: OutputLine) {
        self.lines.lock().push(line);
    }

    fn failure(&self, error: &WorkerError) {
        self.failures.lock().push(error.to_string());
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        send_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(200),
        channel_capacity: 16,
        restart: RestartConfig::default(),
    }
}

fn shell(script: &str) -> WorkerSpec {
    WorkerSpec::new("/bin/sh").arg("-c").arg(script)
}

fn supervisor_with(config: SupervisorConfig) -> (ChildSupervisor, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (ChildSupervisor::new(config, sink.clone()), sink)
}

fn observe_exits(supervisor: &ChildSupervisor) -> mpsc::UnboundedReceiver<ExitReport> {
    let (tx, rx) = mpsc::unbounded_channel();
    supervisor.set_exit_observer(move |report| {
        let _ = tx.send(report);
    });
    rx
}

async fn next_exit(exits: &mut mpsc::UnboundedReceiver<ExitReport>) -> ExitReport {
    tokio::time::timeout(WAIT, exits.recv())
        .await
        .expect("worker did not exit in time")
        .expect("exit observer dropped")
}

#[tokio::test]
async fn missing_executable_fails_to_start() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    let err = supervisor
        .start(WorkerSpec::new("/nonexistent/oled_display"))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Spawn { .. }));
    assert_eq!(supervisor.state(), WorkerState::NotStarted);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn unexpected_exit_is_reported_once() {
    let (supervisor, sink) = supervisor_with(fast_config());
    let mut exits = observe_exits(&supervisor);

    let pid = supervisor.start(shell("exit 3")).await.unwrap();
    let report = next_exit(&mut exits).await;

    assert_eq!(report.pid, pid);
    assert_eq!(report.code, Some(3));
    assert!(!report.requested);
    assert_eq!(supervisor.state(), WorkerState::Exited(Some(3)));
    assert!(supervisor.last_exit().is_some());

    let err = supervisor
        .send(HostMessage::Banner { text: "late".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ChannelClosed { .. }));

    supervisor.stop().await.unwrap();
    assert!(exits.try_recv().is_err());
    assert!(sink
        .failures()
        .iter()
        .any(|failure| failure.contains("exited unexpectedly")));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("cat >/dev/null")).await.unwrap();
    assert!(supervisor.state().is_running());

    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();

    let report = next_exit(&mut exits).await;
    assert!(report.requested);
    assert_eq!(report.code, Some(0));
    assert_eq!(supervisor.state(), WorkerState::Exited(Some(0)));
    assert!(exits.try_recv().is_err());
}

#[tokio::test]
async fn start_while_running_is_rejected() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    supervisor.start(shell("cat >/dev/null")).await.unwrap();

    let err = supervisor.start(shell("true")).await.unwrap_err();
    assert!(matches!(err, WorkerError::AlreadyRunning));

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn worker_ignoring_eof_is_terminated() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("exec sleep 30")).await.unwrap();
    supervisor.stop().await.unwrap();

    let report = next_exit(&mut exits).await;
    assert!(report.requested);
    assert_eq!(report.code, None);
    assert_eq!(report.signal, Some(15));
    assert_eq!(supervisor.state(), WorkerState::Exited(None));
}

#[tokio::test]
async fn output_lines_keep_per_stream_order() {
    let (supervisor, sink) = supervisor_with(fast_config());
    let mut exits = observe_exits(&supervisor);

    supervisor
        .start(shell("printf 'one\\ntwo\\nthree\\n'; echo oops >&2; printf 'tail'"))
        .await
        .unwrap();
    next_exit(&mut exits).await;
    supervisor.stop().await.unwrap();

    assert_eq!(sink.stream(StreamKind::Stdout), vec!["one", "two", "three", "tail"]);
    assert_eq!(sink.stream(StreamKind::Stderr), vec!["oops"]);
}

#[tokio::test]
async fn worker_sees_channel_environment() {
    for (mode, expected) in [(ChannelMode::Ipc, "ipc 1"), (ChannelMode::Stdio, "stdio 1")] {
        let (supervisor, sink) = supervisor_with(fast_config());
        let mut exits = observe_exits(&supervisor);

        supervisor
            .start(shell("echo \"$OLEDLINK_CHANNEL $OLEDLINK_PROTOCOL\"").channel(mode))
            .await
            .unwrap();
        next_exit(&mut exits).await;
        supervisor.stop().await.unwrap();

        assert_eq!(sink.stream(StreamKind::Stdout), vec![expected]);
    }
}

#[tokio::test]
async fn worker_runs_in_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, sink) = supervisor_with(fast_config());
    let mut exits = observe_exits(&supervisor);

    supervisor
        .start(shell("pwd -P").working_dir(dir.path()))
        .await
        .unwrap();
    next_exit(&mut exits).await;
    supervisor.stop().await.unwrap();

    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(
        sink.stream(StreamKind::Stdout),
        vec![expected.display().to_string()]
    );
}

#[tokio::test]
async fn frames_arrive_in_order_and_are_flushed_on_stop() {
    for mode in [ChannelMode::Ipc, ChannelMode::Stdio] {
        let (supervisor, sink) = supervisor_with(fast_config());
        supervisor.start(shell("exec cat").channel(mode)).await.unwrap();

        for volume in 0..100 {
            supervisor
                .send_state(StateMessage::new(json!({"status": "play", "volume": volume})))
                .await
                .unwrap();
        }
        supervisor.stop().await.unwrap();

        let frames: Vec<HostFrame> = sink
            .stream(StreamKind::Stdout)
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(frames.len(), 100, "mode {mode:?}");
        for (index, frame) in frames.iter().enumerate() {
            assert_eq!(frame.seq, index as u64 + 1);
            let HostMessage::State(state) = &frame.message else {
                panic!("unexpected message {:?}", frame.message);
            };
            assert_eq!(state.as_value()["volume"], json!(index));
        }
    }
}

#[tokio::test]
async fn full_channel_times_out_instead_of_blocking() {
    let config = SupervisorConfig {
        send_timeout: Duration::from_millis(50),
        stop_grace: Duration::from_millis(100),
        channel_capacity: 1,
        restart: RestartConfig::default(),
    };
    let (supervisor, _sink) = supervisor_with(config);
    supervisor
        .start(shell("exec sleep 30").channel(ChannelMode::Stdio))
        .await
        .unwrap();

    let text = "x".repeat(256 * 1024);
    let mut timed_out = false;
    for _ in 0..4 {
        match supervisor.send(HostMessage::Banner { text: text.clone() }).await {
            Ok(()) => {}
            Err(WorkerError::SendTimeout { .. }) => {
                timed_out = true;
                break;
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert!(timed_out);

    tokio::time::timeout(WAIT, supervisor.stop())
        .await
        .expect("stop hung")
        .unwrap();
}

#[tokio::test]
async fn frames_left_unwritten_at_stop_are_reported() {
    let config = SupervisorConfig {
        send_timeout: Duration::from_millis(50),
        stop_grace: Duration::from_millis(100),
        channel_capacity: 8,
        restart: RestartConfig::default(),
    };
    let (supervisor, sink) = supervisor_with(config);
    supervisor
        .start(shell("exec sleep 30").channel(ChannelMode::Stdio))
        .await
        .unwrap();

    let text = "x".repeat(256 * 1024);
    let mut accepted = 0;
    loop {
        match supervisor.send(HostMessage::Banner { text: text.clone() }).await {
            Ok(()) => accepted += 1,
            Err(WorkerError::SendTimeout { .. }) => break,
            Err(other) => panic!("unexpected error {other}"),
        }
        assert!(accepted <= 64, "worker pipe never filled up");
    }
    assert!(accepted > 0);

    tokio::time::timeout(WAIT, supervisor.stop())
        .await
        .expect("stop hung")
        .unwrap();

    let expected = WorkerError::ChannelClosed { dropped: accepted }.to_string();
    assert!(
        sink.failures().contains(&expected),
        "missing {expected:?} in {:?}",
        sink.failures()
    );
}

#[tokio::test]
async fn failing_worker_is_restarted_up_to_the_limit() {
    let mut config = fast_config();
    config.restart = RestartConfig {
        policy: RestartPolicy::OnFailure,
        max_restarts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    };
    let (supervisor, sink) = supervisor_with(config);
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("exit 1")).await.unwrap();
    let mut pids = Vec::new();
    for _ in 0..3 {
        let report = next_exit(&mut exits).await;
        assert_eq!(report.code, Some(1));
        pids.push(report.pid);
    }
    pids.dedup();
    assert_eq!(pids.len(), 3);
    assert_eq!(supervisor.restarts(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(exits.try_recv().is_err());
    assert!(sink
        .failures()
        .iter()
        .any(|failure| failure.contains("giving up")));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn clean_exit_is_not_restarted_on_failure_policy() {
    let mut config = fast_config();
    config.restart.policy = RestartPolicy::OnFailure;
    config.restart.initial_backoff_ms = 10;
    let (supervisor, _sink) = supervisor_with(config);
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("exit 0")).await.unwrap();
    next_exit(&mut exits).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(exits.try_recv().is_err());
    assert_eq!(supervisor.restarts(), 0);
    assert_eq!(supervisor.state(), WorkerState::Exited(Some(0)));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_a_pending_restart() {
    let mut config = fast_config();
    config.restart = RestartConfig {
        policy: RestartPolicy::OnFailure,
        max_restarts: 3,
        initial_backoff_ms: 5_000,
        max_backoff_ms: 10_000,
    };
    let (supervisor, _sink) = supervisor_with(config);
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("exit 1")).await.unwrap();
    let report = next_exit(&mut exits).await;
    assert_eq!(report.code, Some(1));

    tokio::time::timeout(Duration::from_secs(1), supervisor.stop())
        .await
        .expect("stop waited out the restart backoff")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(exits.try_recv().is_err());
    assert_eq!(supervisor.state(), WorkerState::Exited(Some(1)));
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.state, WorkerState::Exited(Some(1)));
    assert!(snapshot.last_exit.is_some());
}

#[tokio::test]
async fn clean_exit_is_restarted_on_always_policy() {
    let mut config = fast_config();
    config.restart = RestartConfig {
        policy: RestartPolicy::Always,
        max_restarts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    };
    let (supervisor, _sink) = supervisor_with(config);
    let mut exits = observe_exits(&supervisor);

    supervisor.start(shell("exit 0")).await.unwrap();
    for _ in 0..3 {
        let report = next_exit(&mut exits).await;
        assert_eq!(report.code, Some(0));
        assert!(!report.requested);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(exits.try_recv().is_err());
    assert_eq!(supervisor.restarts(), 2);
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.restarts, 2);
    assert_eq!(snapshot.state, WorkerState::Exited(Some(0)));
    assert_eq!(
        snapshot.spec.map(|spec| spec.executable),
        Some(std::path::PathBuf::from("/bin/sh"))
    );
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn ipc_worker_can_answer_on_its_channel() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    let (tx, mut inbound) = mpsc::unbounded_channel();
    supervisor.set_inbound_handler(move |frame| {
        let _ = tx.send(frame);
    });

    let ready = r#"{"message":{"type":"Ready","params":{"protocol_version":1}}}"#;
    supervisor
        .start(shell(&format!("echo '{ready}' >&0; cat >/dev/null")))
        .await
        .unwrap();

    let frame = tokio::time::timeout(WAIT, inbound.recv())
        .await
        .expect("no frame from worker")
        .unwrap();
    assert_eq!(frame.seq, None);
    assert_eq!(frame.message, WorkerMessage::Ready { protocol_version: 1 });

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn dropping_the_supervisor_kills_the_worker() {
    let (supervisor, _sink) = supervisor_with(fast_config());
    let pid = supervisor.start(shell("exec sleep 30")).await.unwrap();
    drop(supervisor);

    let stat = format!("/proc/{pid}/stat");
    for _ in 0..100 {
        match std::fs::read_to_string(&stat) {
            Err(_) => return,
            // A killed but not yet reaped worker shows up as a zombie.
            Ok(line) if line.rsplit(") ").next().is_some_and(|rest| rest.starts_with('Z')) => {
                return
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("worker {pid} survived its supervisor");
}
