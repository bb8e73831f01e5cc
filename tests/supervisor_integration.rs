//! End-to-end supervision tests driving real shell children.
//! Unix-only: the scripts and signal semantics assume /bin/sh.
#![cfg(unix)]

use std::time::Duration;

use bridge_core::service::ServiceAdapter;
use bridge_core::supervisor::managed_process::{
    LogSource, ManagedProcess, ManagedProcessConfig, ProcessError, StdinMode, StopSignal,
};
use bridge_core::supervisor::state_machine::ProcessState;
use bridge_core::supervisor::ServiceManager;

fn sh(name: &str, script: &str, ready_pattern: Option<&str>, stdin: StdinMode) -> ManagedProcessConfig {
    ManagedProcessConfig {
        name: name.to_string(),
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: vec![],
        working_dir: None,
        ready_pattern: ready_pattern.map(String::from),
        stdin,
    }
}

async fn wait_for_state(process: &ManagedProcess, want: ProcessState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if process.state().await == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_log(process: &ManagedProcess, needle: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if process
            .get_info()
            .await
            .logs
            .iter()
            .any(|l| l.content.contains(needle))
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn start_without_pattern_resolves_immediately() {
    let process = ManagedProcess::new(sh("plain", "sleep 5", None, StdinMode::Null));

    process.start().await.unwrap();
    let info = process.get_info().await;
    assert_eq!(info.state, ProcessState::Running);
    assert!(info.pid.is_some());

    process.stop(StopSignal::Terminate).await.unwrap();
    assert_eq!(process.state().await, ProcessState::Stopped);
    assert!(process.get_info().await.pid.is_none());
}

#[tokio::test]
async fn readiness_pattern_gates_running() {
    let process = ManagedProcess::new(sh(
        "gated",
        "echo booting; echo READY; sleep 5",
        Some("READY"),
        StdinMode::Null,
    ));

    process.start().await.unwrap();
    assert_eq!(process.state().await, ProcessState::Running);
    assert!(wait_for_log(&process, "booting", Duration::from_secs(2)).await);

    process.stop(StopSignal::Terminate).await.unwrap();
}

#[tokio::test]
async fn exit_before_ready_rejects_start() {
    let process = ManagedProcess::new(sh(
        "short-lived",
        "echo nothing to see",
        Some("READY"),
        StdinMode::Null,
    ));

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, ProcessError::ExitedBeforeReady { .. }));
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(2)).await);

    let info = process.get_info().await;
    assert_eq!(info.last_exit.as_ref().and_then(|e| e.code), Some(0));
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
    let process = ManagedProcess::new(sh("idem", "sleep 5", None, StdinMode::Null));

    process.start().await.unwrap();
    let pid = process.get_info().await.pid;

    // Second start is a no-op: same process, same pid.
    process.start().await.unwrap();
    assert_eq!(process.get_info().await.pid, pid);
    assert_eq!(process.state().await, ProcessState::Running);

    process.stop(StopSignal::Terminate).await.unwrap();
}

#[tokio::test]
async fn unexpected_exit_records_last_exit() {
    let process = ManagedProcess::new(sh("crasher", "exit 7", None, StdinMode::Null));

    process.start().await.unwrap();
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(2)).await);

    let info = process.get_info().await;
    assert_eq!(info.last_exit.as_ref().and_then(|e| e.code), Some(7));
    // The exit shows up in the service's own log narrative.
    assert!(info
        .logs
        .iter()
        .any(|l| l.source == LogSource::System && l.content.contains("exit code 7")));
}

#[tokio::test]
async fn interrupt_signal_reaches_the_tree() {
    let process = ManagedProcess::new(sh("interruptible", "sleep 5", None, StdinMode::Null));

    process.start().await.unwrap();
    process.stop(StopSignal::Interrupt).await.unwrap();

    let info = process.get_info().await;
    assert_eq!(info.state, ProcessState::Stopped);
    // SIGINT = 2
    assert_eq!(info.last_exit.as_ref().and_then(|e| e.signal), Some(2));
}

#[tokio::test]
async fn streams_are_tagged_and_ordered_within_themselves() {
    let process = ManagedProcess::new(sh(
        "streams",
        "printf 'a\\nb\\n'; printf 'e\\n' >&2",
        None,
        StdinMode::Null,
    ));

    process.start().await.unwrap();
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(2)).await);
    assert!(wait_for_log(&process, "e", Duration::from_secs(2)).await);

    let logs = process.get_info().await.logs;
    let stdout: Vec<&str> = logs
        .iter()
        .filter(|l| l.source == LogSource::Stdout)
        .map(|l| l.content.as_str())
        .collect();
    let stderr: Vec<&str> = logs
        .iter()
        .filter(|l| l.source == LogSource::Stderr)
        .map(|l| l.content.as_str())
        .collect();

    // Order holds within each stream; no claim across streams.
    assert_eq!(stdout, vec!["a", "b"]);
    assert_eq!(stderr, vec!["e"]);
}

#[tokio::test]
async fn log_buffer_evicts_oldest_end_to_end() {
    let process = ManagedProcess::new(sh("chatty", "seq 1 250", None, StdinMode::Null));

    process.start().await.unwrap();
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(3)).await);
    assert!(wait_for_log(&process, "250", Duration::from_secs(2)).await);

    let logs = process.get_info().await.logs;
    assert_eq!(logs.len(), 200);
    assert!(logs.iter().any(|l| l.content == "250"));
    assert!(!logs.iter().any(|l| l.content == "1"));
}

#[tokio::test]
async fn logs_survive_restart_until_cleared() {
    let process = ManagedProcess::new(sh("echo-one", "echo one", None, StdinMode::Null));

    process.start().await.unwrap();
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(2)).await);
    assert!(wait_for_log(&process, "one", Duration::from_secs(2)).await);

    // Restarting appends to the same buffer...
    process.start().await.unwrap();
    assert!(wait_for_state(&process, ProcessState::Stopped, Duration::from_secs(2)).await);
    assert!(wait_for_log(&process, "one", Duration::from_secs(2)).await);

    // ...and clear empties it regardless of state.
    process.clear_logs().await;
    assert!(process.get_info().await.logs.is_empty());
}

#[tokio::test]
async fn stdin_roundtrip_through_adapter() {
    let adapter = ServiceAdapter::new(
        "echoer",
        "Echoer",
        "line echo loop",
        false,
        true,
        sh(
            "echoer",
            "while read line; do echo \"got:$line\"; done",
            None,
            StdinMode::Piped,
        ),
        None,
    );

    adapter.start().await.unwrap();
    adapter.send_input("hello").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut seen = false;
    while tokio::time::Instant::now() < deadline && !seen {
        seen = adapter
            .snapshot()
            .await
            .logs
            .iter()
            .any(|l| l.content == "got:hello");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen, "input line never echoed back");

    adapter.stop(StopSignal::Terminate).await.unwrap();
}

#[tokio::test]
async fn stop_all_isolates_members() {
    let adapters = vec![
        ServiceAdapter::new(
            "one",
            "One",
            "",
            false,
            false,
            sh("one", "sleep 5", None, StdinMode::Null),
            None,
        ),
        // never started: stop must still succeed for it
        ServiceAdapter::new(
            "two",
            "Two",
            "",
            false,
            false,
            sh("two", "sleep 5", None, StdinMode::Null),
            None,
        ),
        ServiceAdapter::new(
            "three",
            "Three",
            "",
            false,
            false,
            sh("three", "sleep 5", None, StdinMode::Null),
            None,
        ),
    ];
    let manager = ServiceManager::new(adapters);

    manager.start_service("one").await.unwrap();
    manager.start_service("three").await.unwrap();

    let outcomes = manager.stop_all().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

    for snap in manager.get_status().await {
        assert_eq!(snap.state, ProcessState::Stopped, "{} still up", snap.id);
    }
}

#[tokio::test]
async fn concurrent_status_polls_during_start() {
    let adapter = ServiceAdapter::new(
        "slow-ready",
        "Slow",
        "",
        false,
        false,
        sh(
            "slow-ready",
            "sleep 0.2; echo READY; sleep 5",
            Some("READY"),
            StdinMode::Null,
        ),
        None,
    );
    let manager = std::sync::Arc::new(ServiceManager::new(vec![adapter]));

    let starter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_service("slow-ready").await })
    };

    // Wait until the start is actually in flight before polling.
    loop {
        let snaps = manager.get_status().await;
        if snaps[0].state != ProcessState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Poll from two tasks while the start is in flight; snapshots must
    // stay consistent (starting or running, never anything else).
    let mut pollers = Vec::new();
    for _ in 0..2 {
        let manager = manager.clone();
        pollers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let snaps = manager.get_status().await;
                assert_eq!(snaps.len(), 1);
                assert!(matches!(
                    snaps[0].state,
                    ProcessState::Starting | ProcessState::Running
                ));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }));
    }

    starter.await.unwrap().unwrap();
    for poller in pollers {
        poller.await.unwrap();
    }

    let snaps = manager.get_status().await;
    assert_eq!(snaps[0].state, ProcessState::Running);

    manager
        .stop_service("slow-ready", StopSignal::Terminate)
        .await
        .unwrap();
}
