//! Integration tests for the process supervisor.
//!
//! Each test launches a small `sh` script as a stand-in agent. The script is
//! passed via `executable_args`, so the stream-json flags the supervisor adds
//! become ignored positional parameters.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay::{
    EngineEvent, ImageData, LogStream, ProcessState, ProcessTurnSupervisor, SupervisorConfig,
    TurnStream,
};
use futures::StreamExt;
use serde_json::{json, Value};

// ============================================================================
// Fake agent harness
// ============================================================================

const TURN_TIMEOUT: Duration = Duration::from_secs(15);

/// Reads turns forever and never answers.
const SILENT_AGENT: &str = "while IFS= read -r line; do :; done";

fn config(script: &str) -> SupervisorConfig {
    SupervisorConfig {
        executable: "sh".to_string(),
        executable_args: vec!["-c".to_string(), script.to_string(), "fake-agent".to_string()],
        hang_timeout_ms: 10_000,
        idle_timeout_ms: 60_000,
        kill_grace_ms: 200,
        ..Default::default()
    }
}

/// Script answering every input line with `records`, one per line.
fn responder(records: &[Value]) -> String {
    let mut script = String::from("while IFS= read -r line; do\n");
    for record in records {
        script.push_str(&format!("printf '%s\\n' '{}'\n", record));
    }
    script.push_str("done\n");
    script
}

fn spawn(config: SupervisorConfig) -> ProcessTurnSupervisor {
    let supervisor = ProcessTurnSupervisor::new(config);
    assert!(supervisor.spawn(), "fake agent failed to launch");
    assert_eq!(supervisor.state(), ProcessState::Idle);
    supervisor
}

fn counting_hook() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&count);
    (count, move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    })
}

async fn collect(stream: TurnStream) -> Vec<EngineEvent> {
    tokio::time::timeout(TURN_TIMEOUT, stream.collect())
        .await
        .expect("turn never delivered done")
}

async fn wait_for_exit(supervisor: &ProcessTurnSupervisor) {
    tokio::time::timeout(TURN_TIMEOUT, supervisor.wait_for_exit())
        .await
        .expect("agent process never exited");
}

fn assistant_text(text: &str) -> Value {
    json!({"type": "assistant", "message": {"role": "assistant", "content": [
        {"type": "text", "text": text}
    ]}})
}

fn result(text: &str) -> Value {
    json!({"type": "result", "subtype": "success", "is_error": false, "result": text})
}

// ============================================================================
// Turns
// ============================================================================

#[tokio::test]
async fn turn_streams_text_then_final_then_done() {
    let supervisor = spawn(config(&responder(&[
        json!({"type": "system", "subtype": "init"}),
        assistant_text("Hello "),
        assistant_text("world"),
        result("Hello world"),
    ])));

    let events = collect(supervisor.send_turn("hi", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::text_delta("Hello "),
            EngineEvent::text_delta("world"),
            EngineEvent::text_final("Hello world"),
            EngineEvent::Done,
        ]
    );
    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert!(supervisor.is_alive());
}

#[tokio::test]
async fn consecutive_turns_reuse_the_process() {
    let supervisor = spawn(config(&responder(&[result("pong")])));
    let pid = supervisor.pid();
    assert!(pid.is_some());

    for _ in 0..3 {
        let events = collect(supervisor.send_turn("ping", vec![])).await;
        assert_eq!(events, vec![EngineEvent::text_final("pong"), EngineEvent::Done]);
        assert_eq!(supervisor.state(), ProcessState::Idle);
    }
    assert_eq!(supervisor.pid(), pid);
}

#[tokio::test]
async fn turn_input_is_one_stream_json_line() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("stdin.jsonl");
    let script = format!(
        "while IFS= read -r line; do printf '%s\\n' \"$line\" >> '{}'; printf '%s\\n' '{}'; done",
        capture.display(),
        result("seen")
    );
    let supervisor = spawn(config(&script));

    let image = ImageData::from_bytes("image/png", b"\x89PNG\r\n");
    let events = collect(supervisor.send_turn("describe this", vec![image.clone()])).await;
    assert_eq!(events.last(), Some(&EngineEvent::Done));

    let written = std::fs::read_to_string(&capture).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["type"], "user");
    assert_eq!(record["message"]["role"], "user");
    assert_eq!(
        record["message"]["content"][0],
        json!({"type": "text", "text": "describe this"})
    );
    assert_eq!(
        record["message"]["content"][1],
        json!({"type": "image", "source": {
            "type": "base64", "media_type": "image/png", "data": image.data
        }})
    );
}

#[tokio::test]
async fn tool_markup_hidden_from_deltas_but_kept_in_final() {
    let supervisor = spawn(config(&responder(&[
        assistant_text("Checking <tool_"),
        assistant_text("use>grep TODO</tool_use> done."),
        result(""),
    ])));

    let events = collect(supervisor.send_turn("scan", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::text_delta("Checking "),
            EngineEvent::text_delta(" done."),
            EngineEvent::text_final("Checking grep TODO done."),
            EngineEvent::Done,
        ]
    );
}

#[tokio::test]
async fn tool_calls_and_images_are_reported_once() {
    let image = json!({"type": "image", "source": {
        "type": "base64", "media_type": "image/png", "data": "QUJD"
    }});
    let supervisor = spawn(config(&responder(&[
        json!({"type": "assistant", "message": {"role": "assistant", "content": [
            {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "shot.png"}}
        ]}}),
        json!({"type": "user", "message": {"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": [image.clone()]}
        ]}}),
        json!({"type": "user", "message": {"role": "user", "content": [image]}}),
        result("Here it is"),
    ])));

    let events = collect(supervisor.send_turn("show me", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::ToolStart {
                name: "Read".into(),
                input: json!({"file_path": "shot.png"}),
            },
            EngineEvent::ToolEnd,
            EngineEvent::ImageData {
                image: ImageData::new("image/png", "QUJD"),
            },
            EngineEvent::text_final("Here it is"),
            EngineEvent::Done,
        ]
    );
}

#[tokio::test]
async fn mixed_record_is_reported_in_block_order() {
    let supervisor = spawn(config(&responder(&[
        json!({"type": "assistant", "message": {"role": "assistant", "content": [
            {"type": "tool_use", "id": "toolu_1", "name": "Glob", "input": {"pattern": "*.rs"}},
            {"type": "text", "text": "Looking at the sources."}
        ]}}),
        json!({"type": "user", "message": {"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": "lib.rs"}
        ]}}),
        result("One file."),
    ])));

    let events = collect(supervisor.send_turn("list sources", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::ToolStart {
                name: "Glob".into(),
                input: json!({"pattern": "*.rs"}),
            },
            EngineEvent::text_delta("Looking at the sources."),
            EngineEvent::ToolEnd,
            EngineEvent::text_final("One file."),
            EngineEvent::Done,
        ]
    );
}

#[tokio::test]
async fn stderr_lines_are_forwarded_during_a_turn() {
    let script = format!(
        "while IFS= read -r line; do printf 'warming up\\n' >&2; sleep 0.3; printf '%s\\n' '{}'; done",
        result("ready")
    );
    let supervisor = spawn(config(&script));

    let events = collect(supervisor.send_turn("go", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::LogLine {
                stream: LogStream::Stderr,
                line: "warming up".into(),
            },
            EngineEvent::text_final("ready"),
            EngineEvent::Done,
        ]
    );
}

#[tokio::test]
async fn agent_reported_failure_keeps_process_idle() {
    let supervisor = spawn(config(&responder(&[json!({
        "type": "result", "subtype": "error_during_execution", "is_error": true
    })])));

    let events = collect(supervisor.send_turn("fail please", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::error("agent reported error_during_execution"),
            EngineEvent::Done,
        ]
    );
    assert_eq!(supervisor.state(), ProcessState::Idle);
}

#[tokio::test]
async fn trailing_record_without_newline_completes_turn() {
    let script = format!("read -r line; printf '%s' '{}'; exit 0", result("bye"));
    let supervisor = spawn(config(&script));

    let events = collect(supervisor.send_turn("last one", vec![])).await;
    assert_eq!(events, vec![EngineEvent::text_final("bye"), EngineEvent::Done]);

    wait_for_exit(&supervisor).await;
    assert_eq!(supervisor.state(), ProcessState::Dead);
}

// ============================================================================
// Misuse
// ============================================================================

#[tokio::test]
async fn second_turn_while_busy_is_rejected_without_io() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("stdin.jsonl");
    let script = format!(
        "while IFS= read -r line; do printf '%s\\n' \"$line\" >> '{}'; sleep 0.3; printf '%s\\n' '{}'; done",
        capture.display(),
        result("first")
    );
    let supervisor = spawn(config(&script));

    let first = supervisor.send_turn("one", vec![]);
    assert_eq!(supervisor.state(), ProcessState::Busy);
    let second = collect(supervisor.send_turn("two", vec![])).await;
    assert_eq!(
        second,
        vec![EngineEvent::error("engine is busy"), EngineEvent::Done]
    );

    let first = collect(first).await;
    assert_eq!(first, vec![EngineEvent::text_final("first"), EngineEvent::Done]);
    let written = std::fs::read_to_string(&capture).unwrap();
    assert_eq!(written.lines().count(), 1);
}

#[tokio::test]
async fn turn_after_death_is_rejected() {
    let supervisor = spawn(config(SILENT_AGENT));
    assert!(supervisor.force_kill());
    assert_eq!(supervisor.state(), ProcessState::Dead);

    let events = collect(supervisor.send_turn("anyone?", vec![])).await;
    assert_eq!(
        events,
        vec![EngineEvent::error("engine is not running"), EngineEvent::Done]
    );
    wait_for_exit(&supervisor).await;
}

#[tokio::test]
async fn launch_failure_leaves_supervisor_dead() {
    let supervisor = ProcessTurnSupervisor::new(SupervisorConfig {
        executable: "/nonexistent/agent-relay-missing-agent".to_string(),
        ..Default::default()
    });
    assert!(!supervisor.spawn());
    assert_eq!(supervisor.state(), ProcessState::Dead);
    assert_eq!(supervisor.pid(), None);

    let events = collect(supervisor.send_turn("hello", vec![])).await;
    assert_eq!(
        events,
        vec![EngineEvent::error("engine is not running"), EngineEvent::Done]
    );
    wait_for_exit(&supervisor).await;
}

#[tokio::test]
async fn spawn_only_once() {
    let supervisor = spawn(config(SILENT_AGENT));
    let pid = supervisor.pid();
    assert!(!supervisor.spawn());
    assert_eq!(supervisor.pid(), pid);
    assert_eq!(supervisor.state(), ProcessState::Idle);
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn silent_agent_is_detected_as_hung() {
    let supervisor = spawn(SupervisorConfig {
        hang_timeout_ms: 300,
        ..config(SILENT_AGENT)
    });

    let events = collect(supervisor.send_turn("are you there", vec![])).await;
    assert_eq!(
        events,
        vec![EngineEvent::error("hang detected"), EngineEvent::Done]
    );
    assert_eq!(supervisor.state(), ProcessState::Dead);
    wait_for_exit(&supervisor).await;
}

#[tokio::test]
async fn steady_output_keeps_hang_timer_from_firing() {
    let mut script = String::from("while IFS= read -r line; do\nfor i in 1 2 3 4 5 6; do\n");
    script.push_str(&format!("printf '%s\\n' '{}'\nsleep 0.25\ndone\n", assistant_text(".")));
    script.push_str(&format!("printf '%s\\n' '{}'\ndone\n", result("finished")));
    let supervisor = spawn(SupervisorConfig {
        hang_timeout_ms: 1_000,
        ..config(&script)
    });

    let events = collect(supervisor.send_turn("slow work", vec![])).await;
    let deltas = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TextDelta { .. }))
        .count();
    assert_eq!(deltas, 6);
    assert_eq!(
        &events[6..],
        &[EngineEvent::text_final("finished"), EngineEvent::Done]
    );
    assert_eq!(supervisor.state(), ProcessState::Idle);
}

#[tokio::test]
async fn idle_agent_is_shut_down_quietly() {
    let (cleanups, hook) = counting_hook();
    let supervisor = ProcessTurnSupervisor::new(SupervisorConfig {
        idle_timeout_ms: 200,
        ..config(SILENT_AGENT)
    })
    .with_cleanup_hook(hook);
    assert!(supervisor.spawn());

    wait_for_exit(&supervisor).await;
    assert_eq!(supervisor.state(), ProcessState::Dead);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_timer_restarts_after_each_turn() {
    let supervisor = spawn(SupervisorConfig {
        idle_timeout_ms: 400,
        ..config(&responder(&[result("ok")]))
    });

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = collect(supervisor.send_turn("keepalive", vec![])).await;
        assert_eq!(events.last(), Some(&EngineEvent::Done));
        assert_eq!(supervisor.state(), ProcessState::Idle);
    }

    wait_for_exit(&supervisor).await;
    assert_eq!(supervisor.state(), ProcessState::Dead);
}

#[tokio::test]
async fn kill_during_turn_ends_it_once() {
    let (cleanups, hook) = counting_hook();
    let supervisor = ProcessTurnSupervisor::new(config(SILENT_AGENT)).with_cleanup_hook(hook);
    assert!(supervisor.spawn());

    let stream = supervisor.send_turn("long task", vec![]);
    assert!(supervisor.kill());
    assert!(!supervisor.kill());
    assert!(!supervisor.force_kill());

    let events = collect(stream).await;
    assert_eq!(events, vec![EngineEvent::error("terminated"), EngineEvent::Done]);

    wait_for_exit(&supervisor).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(!supervisor.is_alive());
}

#[tokio::test]
async fn exit_mid_turn_is_reported() {
    let supervisor = spawn(config("read -r line; exit 3"));

    let events = collect(supervisor.send_turn("crash", vec![])).await;
    assert_eq!(
        events,
        vec![
            EngineEvent::error("process exited unexpectedly"),
            EngineEvent::Done
        ]
    );
    wait_for_exit(&supervisor).await;
    assert_eq!(supervisor.state(), ProcessState::Dead);
}

#[tokio::test]
async fn closed_stdin_fails_the_turn() {
    let supervisor = spawn(config("exec 0<&-; exec sleep 30"));
    // Let the agent close its end of the pipe first.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let events = collect(supervisor.send_turn("anyone listening", vec![])).await;
    assert_eq!(events.len(), 2, "{:?}", events);
    match &events[0] {
        EngineEvent::Error { message } => {
            assert!(message.starts_with("failed to write turn input: "), "{}", message)
        }
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(events[1], EngineEvent::Done);
    assert_eq!(supervisor.state(), ProcessState::Dead);
    wait_for_exit(&supervisor).await;
}

#[tokio::test]
async fn dropping_supervisor_reaps_the_agent() {
    let (cleanups, hook) = counting_hook();
    let supervisor = ProcessTurnSupervisor::new(config(SILENT_AGENT)).with_cleanup_hook(hook);
    assert!(supervisor.spawn());
    drop(supervisor);

    let reaped = tokio::time::timeout(TURN_TIMEOUT, async {
        while cleanups.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reaped.is_ok());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}
