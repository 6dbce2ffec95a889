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
    let exe = env!("CARGO_BIN_EXE_obetrackd");
    let mut child = Command::new(exe)
        .args([
            "--jwt-secret",
            "test-secret",
            "--bootstrap-admin",
            "admin@example.com",
            "--password-cost",
            "4",
        ])
        .env_remove("OBETRACK_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn obetrackd");
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
    token: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["auth"] = json!(format!("Bearer {}", t));
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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
    token: Option<&str>,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, token);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!(null))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

/// Opens a fresh workspace and signs in the bootstrap admin.
fn open_as_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> String {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    request_ok(
        stdin,
        reader,
        "signup-admin",
        "users.signup",
        json!({
            "firstName": "Asha",
            "lastName": "Rao",
            "email": "admin@example.com",
            "password": "admin-pass"
        }),
        None,
    );
    let signin = request_ok(
        stdin,
        reader,
        "signin-admin",
        "users.signin",
        json!({ "email": "admin@example.com", "password": "admin-pass" }),
        None,
    );
    assert_eq!(signin["role"], json!("admin"));
    signin["token"].as_str().expect("token").to_string()
}

fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    name: &str,
) -> String {
    let subject = request_ok(
        stdin,
        reader,
        &format!("subject-{}", name),
        "subjects.create",
        json!({
            "name": name,
            "branch": "CSE",
            "year": 3,
            "semester": 5,
            "regulation": "R22",
            "courseCode": format!("CS{}", name.len())
        }),
        Some(token),
    );
    subject["id"].as_str().expect("subject id").to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    roll_no: &str,
    name: &str,
) -> String {
    let student = request_ok(
        stdin,
        reader,
        &format!("student-{}", roll_no),
        "students.create",
        json!({
            "rollNo": roll_no,
            "name": name,
            "fatherName": "Father",
            "branch": "CSE",
            "currentYear": 3,
            "currentSemester": 5,
            "section": "A"
        }),
        Some(token),
    );
    student["id"].as_str().expect("student id").to_string()
}

#[test]
fn mutations_need_a_token_and_admin_methods_need_the_admin_role() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin = open_as_admin(&mut stdin, &mut reader, "obetrack-auth-policy");
    let subject_id = create_subject(&mut stdin, &mut reader, &admin, "Ethics");

    let anonymous = request(
        &mut stdin,
        &mut reader,
        "a1",
        "subjects.create",
        json!({ "name": "X", "branch": "CSE", "year": 1, "semester": 1, "regulation": "R22", "courseCode": "X1" }),
        None,
    );
    assert_eq!(error_code(&anonymous), "unauthorized");
    assert_eq!(anonymous["error"]["status"], json!(401));

    let forged = request(&mut stdin, &mut reader, "a2", "users.profile", json!({}), Some("not.a.jwt"));
    assert_eq!(error_code(&forged), "unauthorized");

    let bad_email = request(
        &mut stdin,
        &mut reader,
        "s0",
        "users.signup",
        json!({ "firstName": "Lee", "lastName": "Ng", "email": "lee-at-example", "password": "pw" }),
        None,
    );
    assert_eq!(error_code(&bad_email), "bad_params");

    let signup = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "users.signup",
        json!({ "firstName": "Lee", "lastName": "Ng", "email": "Lee@Example.com", "password": "pw-1" }),
        None,
    );
    let user_id = signup["userId"].as_str().expect("user id").to_string();

    let dup = request(
        &mut stdin,
        &mut reader,
        "s2",
        "users.signup",
        json!({ "firstName": "Lee", "lastName": "Ng", "email": "lee@example.com", "password": "pw-2" }),
        None,
    );
    assert_eq!(error_code(&dup), "conflict");

    let wrong = request(&mut stdin, &mut reader, "i0", "users.signin", json!({ "email": "lee@example.com", "password": "nope" }), None);
    assert_eq!(error_code(&wrong), "unauthorized");

    let signin = request_ok(&mut stdin, &mut reader, "i1", "users.signin", json!({ "email": "lee@example.com", "password": "pw-1" }), None);
    assert_eq!(signin["role"], json!("user"));
    let user = signin["token"].as_str().expect("token").to_string();

    // Plain users may write records but not run admin deletes.
    request_ok(
        &mut stdin,
        &mut reader,
        "w1",
        "students.create",
        json!({ "rollNo": "21CS050", "name": "Tara", "fatherName": "F", "branch": "CSE", "currentYear": 3, "currentSemester": 5, "section": "B" }),
        Some(&user),
    );
    let forbidden = request(&mut stdin, &mut reader, "w2", "subjects.delete", json!({ "id": subject_id }), Some(&user));
    assert_eq!(error_code(&forbidden), "forbidden");
    assert_eq!(forbidden["error"]["status"], json!(403));
    let forbidden_all = request(&mut stdin, &mut reader, "w3", "courseOutcomes.deleteAll", json!({}), Some(&user));
    assert_eq!(error_code(&forbidden_all), "forbidden");
    let forbidden_role = request(&mut stdin, &mut reader, "w4", "users.setRole", json!({ "userId": user_id, "role": "admin" }), Some(&user));
    assert_eq!(error_code(&forbidden_role), "forbidden");

    let reads = request_ok(&mut stdin, &mut reader, "r1", "subjects.list", json!({}), None);
    assert_eq!(reads.as_array().map(|a| a.len()), Some(1));

    request_ok(&mut stdin, &mut reader, "p1", "users.setRole", json!({ "userId": user_id, "role": "admin" }), Some(&admin));
    let promoted = request_ok(&mut stdin, &mut reader, "i2", "users.signin", json!({ "email": "lee@example.com", "password": "pw-1" }), None);
    assert_eq!(promoted["role"], json!("admin"));
    let new_token = promoted["token"].as_str().expect("token").to_string();

    request_ok(&mut stdin, &mut reader, "w5", "subjects.delete", json!({ "id": subject_id }), Some(&new_token));
    let gone = request(&mut stdin, &mut reader, "r2", "subjects.get", json!({ "id": subject_id }), None);
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
}
