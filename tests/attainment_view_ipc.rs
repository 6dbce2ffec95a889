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

fn upsert_mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    student_id: &str,
    subject_id: &str,
    exam_type: &str,
    marks: f64,
) -> serde_json::Value {
    request(
        stdin,
        reader,
        &format!("m-{}-{}", student_id, exam_type),
        "marks.upsert",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "examType": exam_type,
            "marks": marks,
            "maxMarks": 10,
            "regulation": "R22",
            "year": 3,
            "semester": 5,
            "section": "A"
        }),
        Some(token),
    )
}

#[test]
fn attainment_view_merges_best_of_two_with_question_totals() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, "obetrack-attainment-view");
    let subject_id = create_subject(&mut stdin, &mut reader, &token, "Compilers");
    let ravi = create_student(&mut stdin, &mut reader, &token, "21CS001", "Ravi");
    let meena = create_student(&mut stdin, &mut reader, &token, "21CS002", "Meena");
    let kiran = create_student(&mut stdin, &mut reader, &token, "21CS003", "Kiran");

    for (exam, score) in [("SURPRISE TEST-1", 8.0), ("SURPRISE TEST-2", 10.0), ("SURPRISE TEST-3", 9.0), ("ASSIGNMENT-1", 5.0)] {
        let r = upsert_mark(&mut stdin, &mut reader, &token, &ravi, &subject_id, exam, score);
        assert_eq!(r["ok"], json!(true), "{}", r);
    }
    // Second write for the same exam overwrites.
    let again = upsert_mark(&mut stdin, &mut reader, &token, &ravi, &subject_id, "ASSIGNMENT-1", 7.0);
    assert_eq!(again["result"]["marksEntry"]["marks"], json!(7.0));

    for (exam, score) in [("ASSIGNMENT-1", 9.0), ("ASSIGNMENT-2", 10.0), ("CIE-1", 9.0)] {
        let r = upsert_mark(&mut stdin, &mut reader, &token, &meena, &subject_id, exam, score);
        assert_eq!(r["ok"], json!(true), "{}", r);
    }

    let too_high = upsert_mark(&mut stdin, &mut reader, &token, &meena, &subject_id, "ASSIGNMENT-3", 11.0);
    assert_eq!(error_code(&too_high), "bad_params");

    let best = request_ok(&mut stdin, &mut reader, "b", "marks.bestOfTwo", json!({ "subjectId": subject_id }), None);
    assert_eq!(
        best,
        json!([
            { "studentId": ravi, "rollNo": "21CS001", "name": "Ravi", "surpriseTestAverage": 10.0, "assignmentAverage": 3.0 },
            { "studentId": meena, "rollNo": "21CS002", "name": "Meena", "surpriseTestAverage": 0.0, "assignmentAverage": 10.0 }
        ])
    );

    for (student, marks) in [
        (&ravi, json!({ "Q1": { "a": 1, "b": 1, "c": 1 }, "Q2": { "a": 2, "b": 2 } })),
        (&kiran, json!({ "Q1": { "a": 2, "b": 3, "c": 1 }, "Q2": { "a": 4 } })),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("im-{}", student),
            "internalMarks.create",
            json!({
                "studentId": student,
                "subjectId": subject_id,
                "examType": "CIE-1",
                "marks": marks,
                "year": 3,
                "semester": 5,
                "section": "A"
            }),
            Some(&token),
        );
    }
    let dup = request(
        &mut stdin,
        &mut reader,
        "im-dup",
        "internalMarks.create",
        json!({ "studentId": kiran, "subjectId": subject_id, "examType": "CIE-1", "year": 3, "semester": 5, "section": "A" }),
        Some(&token),
    );
    assert_eq!(error_code(&dup), "conflict");

    let totals = request_ok(&mut stdin, &mut reader, "qt", "internalMarks.questionTotals", json!({ "subjectId": subject_id, "examType": "CIE-1" }), None);
    assert_eq!(totals[1]["internalMarks"], json!({ "Q1": 6.0, "Q2": 4.0, "Q3": 0.0, "Q4": 0.0 }));

    let view = request_ok(&mut stdin, &mut reader, "v", "marks.attainmentView", json!({ "subjectId": subject_id, "examType": "CIE-1" }), None);
    let rows = view.as_array().expect("rows");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["studentId"], json!(ravi));
    assert_eq!(rows[0]["internalMarks"], json!({ "Q1": 3.0, "Q2": 4.0, "Q3": 0.0, "Q4": 0.0 }));
    assert_eq!(rows[1]["studentId"], json!(meena));
    assert!(rows[1].get("internalMarks").is_none());
    assert_eq!(rows[2]["studentId"], json!(kiran));
    assert_eq!(rows[2]["surpriseTestAverage"], json!(0.0));
    assert_eq!(rows[2]["assignmentAverage"], json!(0.0));
    assert_eq!(rows[2]["internalMarks"]["Q1"], json!(6.0));

    let cie2 = request_ok(&mut stdin, &mut reader, "v2", "marks.attainmentView", json!({ "subjectId": subject_id, "examType": "CIE-2" }), None);
    assert_eq!(cie2.as_array().map(|a| a.len()), Some(2));

    let other = create_subject(&mut stdin, &mut reader, &token, "Optics");
    let empty = request_ok(&mut stdin, &mut reader, "v3", "marks.attainmentView", json!({ "subjectId": other, "examType": "CIE-1" }), None);
    assert_eq!(empty, json!([]));

    drop(stdin);
    let _ = child.wait();
}
