use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use tutorbook::engine::Engine;
use tutorbook::model::{AccountDraft, Profile};
use tutorbook::notify::NotifyHub;
use tutorbook::wire;

const PASSWORD: &str = "letmein";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Ulid) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tutorbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("tutorbook.journal"), Arc::new(NotifyHub::new())).unwrap());
    let admin = engine
        .bootstrap_admin(AccountDraft {
            first_name: "Ada".into(),
            last_name: "Admin".into(),
            email: "ada@example.edu".into(),
            nuid: "00000001".into(),
            profile: Profile::Admin,
        })
        .await
        .unwrap();

    let password: Arc<str> = Arc::from(PASSWORD);
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let password = password.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, password).await;
            });
        }
    });

    (addr, admin.id)
}

type Client = Framed<TcpStream, LinesCodec>;

async fn connect(addr: SocketAddr) -> Client {
    let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new());
    let reply = call(&mut client, json!({"op": "auth", "password": PASSWORD})).await;
    assert_eq!(reply["ok"], true);
    client
}

async fn read_line(client: &mut Client) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a line")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn call(client: &mut Client, request: Value) -> Value {
    client.send(request.to_string()).await.unwrap();
    read_line(client).await
}

/// Call and unwrap the `data` of a successful reply.
async fn ok(client: &mut Client, request: Value) -> Value {
    let reply = call(client, request.clone()).await;
    assert_eq!(reply["ok"], true, "{request} failed: {reply}");
    reply["data"].clone()
}

fn principal(id: &Value, role: &str) -> Value {
    json!({"account": id, "role": role})
}

struct Setup {
    admin: Value,
    tutor: Value,
    student: Value,
    tutor_id: Value,
    student_id: Value,
    room_id: Value,
}

async fn setup(client: &mut Client, admin_id: Ulid) -> Setup {
    let admin = json!({"account": admin_id.to_string(), "role": "admin"});
    let tutor = ok(
        client,
        json!({
            "op": "register_account",
            "principal": admin,
            "account": {
                "first_name": "Tara", "last_name": "Tutor", "email": "tara@example.edu",
                "nuid": "00000002", "profile": {"tutor": {"bio": "Algorithms"}}
            }
        }),
    )
    .await;
    let student = ok(
        client,
        json!({
            "op": "register_account",
            "principal": admin,
            "account": {
                "first_name": "Sam", "last_name": "Student", "email": "sam@example.edu",
                "nuid": "00000003", "profile": {"student": {"major": "Physics", "class_year": 2027}}
            }
        }),
    )
    .await;
    let room = ok(
        client,
        json!({"op": "add_location", "principal": admin, "name": "Snell 049", "modality": "in_person"}),
    )
    .await;
    Setup {
        tutor: principal(&tutor["id"], "tutor"),
        student: principal(&student["id"], "student"),
        tutor_id: tutor["id"].clone(),
        student_id: student["id"].clone(),
        room_id: room["id"].clone(),
        admin,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn requests_before_auth_are_refused() {
    let (addr, _) = start_test_server().await;
    let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new());

    let reply = call(&mut client, json!({"op": "list_tutors"})).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "unauthenticated");

    let reply = call(&mut client, json!({"op": "auth", "password": "wrong"})).await;
    assert_eq!(reply["error"]["code"], "auth_failed");
    let closed = tokio::time::timeout(Duration::from_secs(5), client.next()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn malformed_lines_keep_the_connection() {
    let (addr, _) = start_test_server().await;
    let mut client = connect(addr).await;

    client.send("{not json".to_string()).await.unwrap();
    let reply = read_line(&mut client).await;
    assert_eq!(reply["error"]["code"], "bad_request");

    let reply = call(&mut client, json!({"op": "no_such_op"})).await;
    assert_eq!(reply["error"]["code"], "bad_request");

    let tutors = ok(&mut client, json!({"op": "list_tutors"})).await;
    assert_eq!(tutors, json!([]));
}

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let (addr, admin_id) = start_test_server().await;
    let mut client = connect(addr).await;
    let s = setup(&mut client, admin_id).await;

    ok(
        &mut client,
        json!({
            "op": "add_window", "principal": s.tutor, "tutor_id": s.tutor_id,
            "day": 0, "start": "10:00:00", "end": "11:00:00"
        }),
    )
    .await;

    let legal = ok(
        &mut client,
        json!({
            "op": "check_availability", "tutor_id": s.tutor_id,
            "start": "2099-01-05T10:00:00Z", "end": "2099-01-05T11:00:00Z"
        }),
    )
    .await;
    assert_eq!(legal, json!({"verdict": "legal"}));

    let outside = ok(
        &mut client,
        json!({
            "op": "check_availability", "tutor_id": s.tutor_id,
            "start": "2099-01-05T11:30:00Z", "end": "2099-01-05T12:30:00Z"
        }),
    )
    .await;
    assert_eq!(outside["verdict"], "outside_availability");

    let booking = ok(
        &mut client,
        json!({
            "op": "create_booking", "principal": s.student,
            "booking": {
                "tutor_id": s.tutor_id, "students": [s.student_id], "location_id": s.room_id,
                "start": "2099-01-05T10:00:00Z", "end": "2099-01-05T11:00:00Z"
            }
        }),
    )
    .await;
    assert_eq!(booking["status"], "pending");

    let accepted = ok(
        &mut client,
        json!({"op": "accept_booking", "principal": s.tutor, "booking_id": booking["id"]}),
    )
    .await;
    assert_eq!(accepted["status"], "confirmed");

    let clash = ok(
        &mut client,
        json!({
            "op": "check_availability", "tutor_id": s.tutor_id,
            "start": "2099-01-05T10:30:00Z", "end": "2099-01-05T11:00:00Z"
        }),
    )
    .await;
    assert_eq!(clash["verdict"], "time_conflict");
    assert_eq!(clash["booking_id"], booking["id"]);

    let again = call(
        &mut client,
        json!({"op": "reject_booking", "principal": s.tutor, "booking_id": booking["id"]}),
    )
    .await;
    assert_eq!(again["ok"], false);
    assert_eq!(again["error"]["code"], "invalid_state");

    let mine = ok(
        &mut client,
        json!({"op": "list_bookings", "principal": s.student}),
    )
    .await;
    assert_eq!(mine.as_array().unwrap().len(), 1);

    let windows = ok(&mut client, json!({"op": "list_windows", "tutor_id": s.tutor_id})).await;
    assert_eq!(windows[0]["day"], "Mon");

    let slots = ok(
        &mut client,
        json!({"op": "open_slots", "tutor_id": s.tutor_id, "date": "2099-01-05"}),
    )
    .await;
    assert_eq!(slots, json!([]));
}

#[tokio::test]
async fn guard_errors_carry_stable_codes() {
    let (addr, admin_id) = start_test_server().await;
    let mut client = connect(addr).await;
    let s = setup(&mut client, admin_id).await;

    let bad_day = call(
        &mut client,
        json!({
            "op": "add_window", "principal": s.tutor, "tutor_id": s.tutor_id,
            "day": 7, "start": "10:00:00", "end": "11:00:00"
        }),
    )
    .await;
    assert_eq!(bad_day["error"]["code"], "invalid_input");

    let forbidden = call(
        &mut client,
        json!({
            "op": "add_window", "principal": s.student, "tutor_id": s.tutor_id,
            "day": 1, "start": "10:00:00", "end": "11:00:00"
        }),
    )
    .await;
    assert_eq!(forbidden["error"]["code"], "forbidden");

    let past = call(
        &mut client,
        json!({
            "op": "create_confirmed_booking", "principal": s.admin,
            "booking": {
                "tutor_id": s.tutor_id, "students": [s.student_id], "location_id": s.room_id,
                "start": "2001-01-01T10:00:00Z", "end": "2001-01-01T11:00:00Z"
            }
        }),
    )
    .await;
    assert_eq!(past["error"]["code"], "past_time");

    let missing = call(
        &mut client,
        json!({"op": "get_booking", "booking_id": Ulid::new().to_string()}),
    )
    .await;
    assert_eq!(missing["error"]["code"], "not_found");
}

#[tokio::test]
async fn subscribed_tutor_hears_about_requests() {
    let (addr, admin_id) = start_test_server().await;
    let mut client = connect(addr).await;
    let s = setup(&mut client, admin_id).await;
    ok(
        &mut client,
        json!({
            "op": "add_window", "principal": s.tutor, "tutor_id": s.tutor_id,
            "day": 1, "start": "09:00:00", "end": "17:00:00"
        }),
    )
    .await;

    let mut listener = connect(addr).await;
    ok(&mut listener, json!({"op": "subscribe", "principal": s.tutor})).await;

    let denied = call(&mut client, json!({"op": "subscribe", "principal": s.student})).await;
    assert_eq!(denied["error"]["code"], "forbidden");

    let booking = ok(
        &mut client,
        json!({
            "op": "create_booking", "principal": s.student,
            "booking": {
                "tutor_id": s.tutor_id, "students": [s.student_id], "location_id": s.room_id,
                "start": "2099-01-06T14:00:00Z", "end": "2099-01-06T15:00:00Z"
            }
        }),
    )
    .await;

    let pushed = read_line(&mut listener).await;
    let notification = &pushed["notification"];
    assert_eq!(notification["kind"], "requested");
    assert_eq!(notification["booking"]["id"], booking["id"]);
    assert_eq!(notification["tutor"]["email"], "tara@example.edu");
    assert_eq!(notification["students"][0]["email"], "sam@example.edu");

    // Requests still work on a subscribed connection.
    let tutors = ok(&mut listener, json!({"op": "list_tutors"})).await;
    assert_eq!(tutors[0]["id"], s.tutor_id);
}

#[tokio::test]
async fn course_enrollment_over_the_wire() {
    let (addr, admin_id) = start_test_server().await;
    let mut client = connect(addr).await;
    let s = setup(&mut client, admin_id).await;

    let course = ok(
        &mut client,
        json!({
            "op": "add_course", "principal": s.admin, "course_number": "CS5800",
            "title": "Algorithms", "semester": "Fall 2099"
        }),
    )
    .await;
    ok(
        &mut client,
        json!({"op": "assign_tutor", "principal": s.admin, "course_id": course["id"], "tutor_id": s.tutor_id}),
    )
    .await;
    let roster = ok(
        &mut client,
        json!({"op": "enroll_student", "principal": s.admin, "course_id": course["id"], "student_id": s.student_id}),
    )
    .await;
    assert_eq!(roster, json!({"students": [s.student_id], "tutors": [s.tutor_id]}));

    let denied = call(
        &mut client,
        json!({"op": "enroll_student", "principal": s.tutor, "course_id": course["id"], "student_id": s.student_id}),
    )
    .await;
    assert_eq!(denied["error"]["code"], "forbidden");

    let taught = ok(&mut client, json!({"op": "taught_courses", "tutor_id": s.tutor_id})).await;
    assert_eq!(taught[0]["course_number"], "CS5800");
    let enrolled = ok(&mut client, json!({"op": "enrolled_courses", "student_id": s.student_id})).await;
    assert_eq!(enrolled[0]["id"], course["id"]);
    let fetched = ok(&mut client, json!({"op": "get_roster", "course_id": course["id"]})).await;
    assert_eq!(fetched, roster);
}
