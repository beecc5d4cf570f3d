use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_pointsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pointsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn setup_defaults_and_validation() {
    let workspace = temp_dir("pointsd-setup-defaults");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, o) = (&mut stdin, &mut reader);
    request_ok(i, o, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));

    let setup = request_ok(i, o, "2", "setup.get", json!({}));
    assert_eq!(setup["grades"]["minValue"], json!(4));
    assert_eq!(setup["grades"]["pointsByValue"]["5"], json!(10));
    assert_eq!(setup["homework"]["onTimePoints"], json!(5));
    assert_eq!(setup["homework"]["latePoints"], json!(0));
    assert_eq!(setup["attendance"]["milestones"][0], json!({ "days": 5, "points": 5 }));
    assert_eq!(setup["locking"]["timeoutMs"], json!(2000));
    assert_eq!(setup["locking"]["busyRetries"], json!(3));

    for (n, (section, patch)) in [
        ("grades", json!({ "minValue": "four" })),
        ("homework", json!({ "onTimePoints": 1, "latePoints": 2 })),
        ("attendance", json!({ "milestones": [{ "days": 0, "points": 5 }] })),
        ("locking", json!({ "timeoutMs": 1 })),
        ("locking", json!({ "unknown": 1 })),
        ("printer", json!({})),
    ]
    .into_iter()
    .enumerate()
    {
        let resp = request(
            i,
            o,
            &format!("bad-{}", n),
            "setup.update",
            json!({ "section": section, "patch": patch }),
        );
        assert_eq!(error_code(&resp), Some("bad_params"), "{} {}", section, resp);
    }
    let not_object = request(
        i,
        o,
        "bad-patch",
        "setup.update",
        json!({ "section": "grades", "patch": [1, 2] }),
    );
    assert_eq!(error_code(&not_object), Some("bad_params"));

    let unchanged = request_ok(i, o, "3", "setup.get", json!({}));
    assert_eq!(unchanged, setup);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rule_changes_apply_to_later_events_and_persist() {
    let workspace = temp_dir("pointsd-setup-rules");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, o) = (&mut stdin, &mut reader);
    request_ok(i, o, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    request_ok(i, o, "2", "students.create", json!({ "id": "s1", "name": "Mari" }));

    request_ok(
        i,
        o,
        "3",
        "setup.update",
        json!({ "section": "grades", "patch": { "minValue": 3, "pointsByValue": { "3": 2, "4": 5, "5": 10 } } }),
    );
    request_ok(
        i,
        o,
        "4",
        "setup.update",
        json!({ "section": "homework", "patch": { "latePoints": 1 } }),
    );
    request_ok(
        i,
        o,
        "5",
        "setup.update",
        json!({ "section": "locking", "patch": { "timeoutMs": 500, "busyRetries": 1 } }),
    );

    let c_grade = request_ok(
        i,
        o,
        "6",
        "awards.gradePosted",
        json!({ "studentId": "s1", "gradeId": "g3", "value": 3 }),
    );
    assert_eq!(c_grade["outcome"]["transaction"]["amount"], json!(2));
    let late = request_ok(
        i,
        o,
        "7",
        "awards.homeworkSubmitted",
        json!({
            "studentId": "s1", "homeworkId": "hw1",
            "submittedAt": "2026-03-02T08:00:00Z", "deadline": "2026-03-01T23:59:00Z"
        }),
    );
    assert_eq!(late["outcome"]["transaction"]["amount"], json!(1));

    drop(stdin);
    let _ = child.wait();

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, o) = (&mut stdin, &mut reader);
    request_ok(i, o, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let setup = request_ok(i, o, "2", "setup.get", json!({}));
    assert_eq!(setup["grades"]["minValue"], json!(3));
    assert_eq!(setup["homework"]["latePoints"], json!(1));
    assert_eq!(setup["locking"]["timeoutMs"], json!(500));
    assert_eq!(setup["locking"]["busyRetries"], json!(1));
    let balance = request_ok(i, o, "3", "points.balance", json!({ "studentId": "s1" }));
    assert_eq!(balance["account"]["totalPoints"], json!(3));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
