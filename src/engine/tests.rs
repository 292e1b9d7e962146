use super::*;
use crate::notify::{RESERVATIONS_CHANNEL, classroom_channel};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_test::{assert_err, assert_ok};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_time(t(h, m))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("classroomd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

async fn add_room(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_classroom(id, name.into(), Some("Main Building".into()), 30)
        .await
        .unwrap();
    id
}

fn request(classroom_id: Ulid, user: &str, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> NewReservation {
    NewReservation {
        id: None,
        classroom_id,
        user_id: user.into(),
        date,
        start,
        end,
        purpose: "Group study".into(),
    }
}

async fn book(engine: &Engine, room: Ulid, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Ulid {
    engine
        .create_reservation(request(room, "20231001", date, start, end))
        .await
        .unwrap()
}

async fn status_of(engine: &Engine, id: Ulid) -> ReservationStatus {
    engine.get_reservation(id).await.unwrap().status
}

// ── Classrooms ───────────────────────────────────────────

#[tokio::test]
async fn create_and_list_classrooms() {
    let engine = new_engine("list_classrooms.wal");
    let b = add_room(&engine, "Room 102").await;
    let a = add_room(&engine, "Room 101").await;

    let rooms = engine.list_classrooms().await;
    let ids: Vec<_> = rooms.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![a, b]);
    assert_eq!(rooms[0].building.as_deref(), Some("Main Building"));
    assert_eq!(rooms[0].capacity, 30);
}

#[tokio::test]
async fn duplicate_classroom_rejected() {
    let engine = new_engine("dup_classroom.wal");
    let id = add_room(&engine, "Room 101").await;
    let result = engine.create_classroom(id, "Again".into(), None, 10).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn blank_room_name_rejected() {
    let engine = new_engine("blank_room.wal");
    assert_err!(engine.create_classroom(Ulid::new(), "  ".into(), None, 10).await);
}

// ── Creating reservations ────────────────────────────────

#[tokio::test]
async fn new_reservation_is_pending() {
    let engine = new_engine("new_pending.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;

    let r = engine.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.classroom_id, room);
    assert_eq!(r.slot, TimeSlot::new(t(9, 0), t(11, 0)));
    assert_eq!(engine.classroom_for_reservation(&id), Some(room));
}

#[tokio::test]
async fn client_supplied_id_is_kept() {
    let engine = new_engine("client_id.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = Ulid::new();
    let mut req = request(room, "20231001", d(2025, 1, 10), t(9, 0), t(10, 0));
    req.id = Some(id);
    assert_eq!(engine.create_reservation(req.clone()).await.unwrap(), id);

    req.date = d(2025, 1, 11);
    let dup = engine.create_reservation(req).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn unknown_classroom_is_not_found() {
    let engine = new_engine("unknown_room.wal");
    let missing = Ulid::new();
    let result = engine
        .create_reservation(request(missing, "u", d(2025, 1, 10), t(9, 0), t(10, 0)))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == missing));

    let q = engine.is_available(missing, d(2025, 1, 10), t(9, 0), t(10, 0), None).await;
    assert!(matches!(q, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn inverted_or_empty_range_rejected() {
    let engine = new_engine("bad_range.wal");
    let room = add_room(&engine, "Room 101").await;
    for (s, e) in [(t(10, 0), t(9, 0)), (t(10, 0), t(10, 0))] {
        let result = engine
            .create_reservation(request(room, "u", d(2025, 1, 10), s, e))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidTimeRange)));
        let q = engine.is_available(room, d(2025, 1, 10), s, e, None).await;
        assert!(matches!(q, Err(EngineError::InvalidTimeRange)));
    }
}

#[tokio::test]
async fn empty_user_id_rejected() {
    let engine = new_engine("empty_user.wal");
    let room = add_room(&engine, "Room 101").await;
    let result = engine
        .create_reservation(request(room, "", d(2025, 1, 10), t(9, 0), t(10, 0)))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn overlapping_request_conflicts_with_existing() {
    let engine = new_engine("overlap_conflict.wal");
    let room = add_room(&engine, "Room 101").await;
    let first = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;

    let result = engine
        .create_reservation(request(room, "20231002", d(2025, 1, 10), t(10, 0), t(12, 0)))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == first));
}

#[tokio::test]
async fn adjacent_requests_both_succeed() {
    let engine = new_engine("adjacent.wal");
    let room = add_room(&engine, "Room 101").await;
    book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    book(&engine, room, d(2025, 1, 10), t(10, 0), t(11, 0)).await;
    book(&engine, room, d(2025, 1, 10), t(8, 0), t(9, 0)).await;
    assert_eq!(engine.occupied_slots(room, d(2025, 1, 10)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn approved_room_scenario() {
    let engine = new_engine("room_c.wal");
    let room = add_room(&engine, "Room C").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.approve_reservation(id).await.unwrap();

    for (date, start, end, expected) in [
        (d(2025, 1, 10), t(10, 30), t(12, 0), false),
        (d(2025, 1, 10), t(11, 0), t(12, 0), true),
        (d(2025, 1, 11), t(9, 0), t(11, 0), true),
    ] {
        let free = engine.is_available(room, date, start, end, None).await.unwrap();
        assert_eq!(free, expected, "{date} {start}-{end}");
    }
}

#[tokio::test]
async fn same_slot_in_other_classroom_is_free() {
    let engine = new_engine("other_room.wal");
    let a = add_room(&engine, "Room 101").await;
    let b = add_room(&engine, "Room 102").await;
    book(&engine, a, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    book(&engine, b, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
}

#[tokio::test]
async fn rejected_and_cancelled_free_the_slot() {
    let engine = new_engine("freed_slot.wal");
    let room = add_room(&engine, "Room 101").await;

    let rejected = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.reject_reservation(rejected).await.unwrap();
    assert!(engine.is_available(room, d(2025, 1, 10), t(9, 0), t(11, 0), None).await.unwrap());

    let cancelled = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.cancel_reservation(cancelled, None).await.unwrap();
    assert!(engine.is_available(room, d(2025, 1, 10), t(9, 0), t(11, 0), None).await.unwrap());

    book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_exactly_one_wins() {
    let engine = Arc::new(new_engine("concurrent_creates.wal"));
    let room = add_room(&engine, "Room 101").await;

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            // Every request overlaps 10:00-10:30.
            let start = t(9, 30 + (i % 3) * 5);
            engine
                .create_reservation(request(room, &format!("user{i}"), d(2025, 1, 10), start, t(10, 30)))
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.occupied_slots(room, d(2025, 1, 10)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_id_raced_into_two_slots_lands_once() {
    let engine = new_engine("same_id_race.wal");
    let room = add_room(&engine, "Room 101").await;
    let other_room = add_room(&engine, "Room 102").await;
    let id = Ulid::new();

    let mut morning = request(room, "20231001", d(2025, 1, 10), t(9, 0), t(10, 0));
    morning.id = Some(id);
    let mut afternoon = request(room, "20231002", d(2025, 1, 10), t(13, 0), t(14, 0));
    afternoon.id = Some(id);
    let mut elsewhere = request(other_room, "20231003", d(2025, 1, 10), t(9, 0), t(10, 0));
    elsewhere.id = Some(id);

    let (a, b, c) = tokio::join!(
        engine.create_reservation(morning),
        engine.create_reservation(afternoon),
        engine.create_reservation(elsewhere),
    );
    let results = [a, b, c];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(r, Err(EngineError::AlreadyExists(x)) if *x == id));
    }

    let rows: Vec<_> = engine
        .all_reservations()
        .await
        .into_iter()
        .filter(|r| r.id == id)
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(engine.classroom_for_reservation(&id), Some(rows[0].classroom_id));
}

#[tokio::test]
async fn failed_create_does_not_claim_id() {
    let engine = new_engine("failed_claim.wal");
    let room = add_room(&engine, "Room 101").await;
    book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;

    let id = Ulid::new();
    let mut clash = request(room, "20231002", d(2025, 1, 10), t(9, 30), t(10, 30));
    clash.id = Some(id);
    assert!(matches!(
        engine.create_reservation(clash.clone()).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(engine.classroom_for_reservation(&id), None);

    clash.start = t(10, 0);
    assert_eq!(engine.create_reservation(clash).await.unwrap(), id);
}

// ── Admin decisions ──────────────────────────────────────

#[tokio::test]
async fn approve_and_reject_only_from_pending() {
    let engine = new_engine("decisions.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;

    assert_ok!(engine.approve_reservation(id).await);
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Approved);

    let again = engine.approve_reservation(id).await;
    assert!(matches!(
        again,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Approved,
            to: ReservationStatus::Approved,
            ..
        })
    ));
    let reject = engine.reject_reservation(id).await;
    assert!(matches!(reject, Err(EngineError::InvalidTransition { .. })));
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Approved);
}

#[tokio::test]
async fn rejected_is_terminal() {
    let engine = new_engine("rejected_terminal.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    engine.reject_reservation(id).await.unwrap();

    assert_err!(engine.approve_reservation(id).await);
    assert_err!(engine.cancel_reservation(id, None).await);
    let edit = ReservationEdit {
        date: d(2025, 1, 10),
        start: t(9, 0),
        end: t(10, 0),
        purpose: Some("retry".into()),
    };
    assert_err!(engine.update_reservation(id, edit, None).await);
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Rejected);
}

#[tokio::test]
async fn unknown_reservation_is_not_found() {
    let engine = new_engine("unknown_res.wal");
    let id = Ulid::new();
    assert!(matches!(engine.approve_reservation(id).await, Err(EngineError::NotFound(x)) if x == id));
    assert!(matches!(engine.cancel_reservation(id, None).await, Err(EngineError::NotFound(_))));
    assert!(engine.get_reservation(id).await.is_none());
}

// ── Editing and cancelling ───────────────────────────────

fn edit(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> ReservationEdit {
    ReservationEdit {
        date,
        start,
        end,
        purpose: Some("Moved".into()),
    }
}

#[tokio::test]
async fn edit_resets_approved_to_pending() {
    let engine = new_engine("edit_reset.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    engine.approve_reservation(id).await.unwrap();

    engine
        .update_reservation(id, edit(d(2025, 1, 12), t(14, 0), t(15, 0)), None)
        .await
        .unwrap();

    let r = engine.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.date, d(2025, 1, 12));
    assert_eq!(r.slot, TimeSlot::new(t(14, 0), t(15, 0)));
    assert_eq!(r.purpose, "Moved");
    assert!(engine.is_available(room, d(2025, 1, 10), t(9, 0), t(10, 0), None).await.unwrap());
}

#[tokio::test]
async fn edit_may_overlap_its_own_old_slot() {
    let engine = new_engine("edit_self.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    assert_ok!(
        engine
            .update_reservation(id, edit(d(2025, 1, 10), t(9, 30), t(10, 30)), None)
            .await
    );
}

#[tokio::test]
async fn edit_conflicting_with_another_fails_and_keeps_row() {
    let engine = new_engine("edit_conflict.wal");
    let room = add_room(&engine, "Room 101").await;
    let mine = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    let other = book(&engine, room, d(2025, 1, 10), t(11, 0), t(12, 0)).await;
    engine.approve_reservation(mine).await.unwrap();

    let result = engine
        .update_reservation(mine, edit(d(2025, 1, 10), t(10, 30), t(11, 30)), None)
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == other));

    let r = engine.get_reservation(mine).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.slot.start, t(9, 0));
}

#[tokio::test]
async fn edit_keeps_day_ordering() {
    let engine = new_engine("edit_order.wal");
    let room = add_room(&engine, "Room 101").await;
    let early = book(&engine, room, d(2025, 1, 10), t(8, 0), t(9, 0)).await;
    let late = book(&engine, room, d(2025, 1, 10), t(13, 0), t(14, 0)).await;
    engine
        .update_reservation(early, edit(d(2025, 1, 10), t(15, 0), t(16, 0)), None)
        .await
        .unwrap();

    let ids: Vec<_> = engine
        .occupied_slots(room, d(2025, 1, 10))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![late, early]);
}

#[tokio::test]
async fn cancel_from_pending_and_approved() {
    let engine = new_engine("cancel.wal");
    let room = add_room(&engine, "Room 101").await;
    let a = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    let b = book(&engine, room, d(2025, 1, 10), t(10, 0), t(11, 0)).await;
    engine.approve_reservation(b).await.unwrap();

    engine.cancel_reservation(a, None).await.unwrap();
    engine.cancel_reservation(b, None).await.unwrap();
    assert_eq!(status_of(&engine, a).await, ReservationStatus::Cancelled);
    assert_eq!(status_of(&engine, b).await, ReservationStatus::Cancelled);
    assert!(matches!(
        engine.cancel_reservation(a, None).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn owner_checks() {
    let engine = new_engine("owner.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = engine
        .create_reservation(request(room, "alice", d(2025, 1, 10), t(9, 0), t(10, 0)))
        .await
        .unwrap();

    assert!(engine.can_modify(id, "alice").await);
    assert!(!engine.can_modify(id, "bob").await);
    assert!(!engine.can_modify(Ulid::new(), "alice").await);

    let stranger = engine.cancel_reservation(id, Some("bob")).await;
    assert!(matches!(stranger, Err(EngineError::NotOwner(x)) if x == id));
    let stranger_edit = engine
        .update_reservation(id, edit(d(2025, 1, 11), t(9, 0), t(10, 0)), Some("bob"))
        .await;
    assert!(matches!(stranger_edit, Err(EngineError::NotOwner(_))));

    engine
        .update_reservation(id, edit(d(2025, 1, 11), t(9, 0), t(10, 0)), Some("alice"))
        .await
        .unwrap();
    engine.cancel_reservation(id, Some("alice")).await.unwrap();
    assert!(!engine.can_modify(id, "alice").await);

    // Owner, but no longer modifiable.
    let again = engine.cancel_reservation(id, Some("alice")).await;
    assert!(matches!(again, Err(EngineError::NotOwner(_))));
}

// ── Time-driven transitions ──────────────────────────────

#[tokio::test]
async fn sweep_moves_yesterday_approved_to_done() {
    let engine = new_engine("sweep_yesterday.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 9), t(9, 0), t(11, 0)).await;
    engine.approve_reservation(id).await.unwrap();

    let moved = engine.advance_statuses(at(d(2025, 1, 10), 8, 0)).await.unwrap();
    assert_eq!(moved, 1);
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Done);
}

#[tokio::test]
async fn sweep_runs_today_through_ongoing_to_done() {
    let engine = new_engine("sweep_today.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.approve_reservation(id).await.unwrap();

    engine.advance_statuses(at(d(2025, 1, 10), 8, 30)).await.unwrap();
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Approved);

    engine.advance_statuses(at(d(2025, 1, 10), 9, 30)).await.unwrap();
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Ongoing);

    engine.advance_statuses(at(d(2025, 1, 10), 11, 0)).await.unwrap();
    assert_eq!(status_of(&engine, id).await, ReservationStatus::Done);
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let engine = new_engine("sweep_idempotent.wal");
    let room = add_room(&engine, "Room 101").await;
    let past = book(&engine, room, d(2025, 1, 9), t(9, 0), t(11, 0)).await;
    let now_running = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    let pending = book(&engine, room, d(2025, 1, 10), t(13, 0), t(14, 0)).await;
    engine.approve_reservation(past).await.unwrap();
    engine.approve_reservation(now_running).await.unwrap();

    let now = at(d(2025, 1, 10), 10, 0);
    assert_eq!(engine.advance_statuses(now).await.unwrap(), 2);
    let after_once = engine.all_reservations().await;
    assert_eq!(engine.advance_statuses(now).await.unwrap(), 0);
    assert_eq!(engine.all_reservations().await, after_once);
    assert_eq!(status_of(&engine, pending).await, ReservationStatus::Pending);
}

#[tokio::test]
async fn ongoing_cannot_be_cancelled_or_edited() {
    let engine = new_engine("ongoing_locked.wal");
    let room = add_room(&engine, "Room 101").await;
    let id = book(&engine, room, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.approve_reservation(id).await.unwrap();
    engine.advance_statuses(at(d(2025, 1, 10), 10, 0)).await.unwrap();

    assert_err!(engine.cancel_reservation(id, None).await);
    assert_err!(
        engine
            .update_reservation(id, edit(d(2025, 1, 10), t(9, 0), t(11, 0)), None)
            .await
    );
    // Ongoing still occupies its slot.
    assert!(!engine.is_available(room, d(2025, 1, 10), t(10, 0), t(10, 30), None).await.unwrap());
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn reservation_listings() {
    let engine = new_engine("listings.wal");
    let a = add_room(&engine, "Room 101").await;
    let b = add_room(&engine, "Room 102").await;
    let r1 = engine
        .create_reservation(request(a, "alice", d(2025, 1, 11), t(9, 0), t(10, 0)))
        .await
        .unwrap();
    let r2 = engine
        .create_reservation(request(b, "alice", d(2025, 1, 10), t(9, 0), t(10, 0)))
        .await
        .unwrap();
    let r3 = engine
        .create_reservation(request(a, "bob", d(2025, 1, 10), t(13, 0), t(14, 0)))
        .await
        .unwrap();
    engine.approve_reservation(r3).await.unwrap();

    let ids = |v: Vec<Reservation>| v.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(engine.user_reservations("alice").await), vec![r2, r1]);
    assert_eq!(ids(engine.all_reservations().await), vec![r2, r3, r1]);
    assert_eq!(
        ids(engine.reservations_by_status(ReservationStatus::Approved).await),
        vec![r3]
    );
    assert_eq!(ids(engine.classroom_reservations(a).await.unwrap()), vec![r3, r1]);
    assert!(engine.classroom_reservations(Ulid::new()).await.is_err());
}

#[tokio::test]
async fn available_classrooms_excludes_busy_rooms() {
    let engine = new_engine("available_rooms.wal");
    let a = add_room(&engine, "Room 101").await;
    let b = add_room(&engine, "Room 102").await;
    let c = add_room(&engine, "Room 103").await;
    book(&engine, a, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    let gone = book(&engine, c, d(2025, 1, 10), t(9, 0), t(11, 0)).await;
    engine.reject_reservation(gone).await.unwrap();

    let free: Vec<_> = engine
        .available_classrooms(d(2025, 1, 10), t(10, 0), t(12, 0))
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(free, vec![b, c]);

    let later = engine
        .available_classrooms(d(2025, 1, 10), t(11, 0), t(12, 0))
        .await
        .unwrap();
    assert_eq!(later.len(), 3);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn notices_for_create_and_decisions_only() {
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(test_wal_path("notices.wal"), notify.clone()).unwrap();
    let room = add_room(&engine, "Room 101").await;
    let mut all = notify.subscribe(RESERVATIONS_CHANNEL);
    let mut per_room = notify.subscribe(&classroom_channel(room));

    let id = book(&engine, room, d(2025, 1, 9), t(9, 0), t(11, 0)).await;
    engine.approve_reservation(id).await.unwrap();

    let raw = all.recv().await.unwrap();
    let first: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(first["type"], "new_reservation");
    let second: serde_json::Value = serde_json::from_str(&all.recv().await.unwrap()).unwrap();
    assert_eq!(second["type"], "reservation_approved");
    assert_eq!(
        second["payload"]["message"],
        "Your reservation for Room 101 on January 9, 2025 has been approved"
    );
    assert_eq!(per_room.recv().await.unwrap(), raw);

    engine.advance_statuses(at(d(2025, 1, 10), 8, 0)).await.unwrap();
    engine.cancel_reservation(id, None).await.unwrap_err();
    assert!(matches!(all.try_recv(), Err(TryRecvError::Empty)));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (room, snapshot) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let room = add_room(&engine, "Room 101").await;
        let a = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
        let b = book(&engine, room, d(2025, 1, 10), t(10, 0), t(11, 0)).await;
        let c = book(&engine, room, d(2025, 1, 9), t(9, 0), t(10, 0)).await;
        engine.approve_reservation(a).await.unwrap();
        engine
            .update_reservation(b, edit(d(2025, 1, 11), t(8, 0), t(9, 0)), None)
            .await
            .unwrap();
        engine.approve_reservation(c).await.unwrap();
        engine.advance_statuses(at(d(2025, 1, 10), 9, 30)).await.unwrap();
        (room, engine.all_reservations().await)
    };

    let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(replayed.all_reservations().await, snapshot);
    let statuses: Vec<_> = snapshot.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ReservationStatus::Done,
            ReservationStatus::Ongoing,
            ReservationStatus::Pending
        ]
    );
    assert_eq!(replayed.list_classrooms().await[0].id, room);
    for r in &snapshot {
        assert_eq!(replayed.classroom_for_reservation(&r.id), Some(room));
    }
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let snapshot = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let room = add_room(&engine, "Room 101").await;
        for h in 8..12 {
            let id = book(&engine, room, d(2025, 1, 10), t(h, 0), t(h + 1, 0)).await;
            engine.approve_reservation(id).await.unwrap();
        }
        let cancelled = book(&engine, room, d(2025, 1, 10), t(14, 0), t(15, 0)).await;
        engine.cancel_reservation(cancelled, None).await.unwrap();
        // Room, 5 requests, 4 approvals, 1 cancel, plus 9 inbox entries.
        assert_eq!(engine.wal_appends_since_compact().await, 20);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Writes after the swap land in the compacted file.
        book(&engine, room, d(2025, 1, 11), t(9, 0), t(10, 0)).await;
        engine.all_reservations().await
    };

    let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(replayed.all_reservations().await, snapshot);
    assert_eq!(replayed.all_reservations().await.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn classrooms_created_during_compaction_survive_restart() {
    let path = test_wal_path("compact_vs_create.wal");
    let expected = {
        let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
        let first = add_room(&engine, "Room 100").await;
        book(&engine, first, d(2025, 1, 10), t(9, 0), t(10, 0)).await;

        for i in 0..20 {
            let compactor = engine.clone();
            let compaction = tokio::spawn(async move { compactor.compact_wal().await });
            let room = Ulid::new();
            engine
                .create_classroom(room, format!("Room {}", 101 + i), None, 30)
                .await
                .unwrap();
            book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
            compaction.await.unwrap().unwrap();
        }
        (engine.list_classrooms().await, engine.all_reservations().await)
    };

    let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(replayed.list_classrooms().await, expected.0);
    assert_eq!(replayed.all_reservations().await, expected.1);
    assert_eq!(expected.0.len(), 21);
}

// ── Notification inbox ───────────────────────────────────

#[tokio::test]
async fn inbox_gets_requests_and_decisions() {
    let engine = new_engine("inbox_flow.wal");
    let room = add_room(&engine, "Room 101").await;
    let a = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
    let b = book(&engine, room, d(2025, 1, 10), t(10, 0), t(11, 0)).await;

    let admin = engine.user_notifications(ADMIN_INBOX, false, None).await;
    assert_eq!(admin.len(), 2);
    assert!(admin.iter().all(|n| n.message == "New Reservation for Room 101"));
    assert_eq!(admin[0].reservation_id, Some(b));

    engine.approve_reservation(a).await.unwrap();
    engine.reject_reservation(b).await.unwrap();
    engine.cancel_reservation(a, None).await.unwrap();

    let mine = engine.user_notifications("20231001", false, None).await;
    let messages: Vec<_> = mine.iter().map(|n| n.message.as_str()).collect();
    assert_eq!(
        messages,
        ["Reservation for Room 101 rejected", "Reservation for Room 101 approved"]
    );
    assert_eq!(engine.user_notifications("20231001", false, Some(1)).await.len(), 1);
    assert_eq!(engine.unread_count("20231001").await, 2);
}

#[tokio::test]
async fn inbox_read_flags_and_deletion() {
    let engine = new_engine("inbox_read.wal");
    let room = add_room(&engine, "Room 101").await;
    for h in 8..11 {
        let id = book(&engine, room, d(2025, 1, 10), t(h, 0), t(h + 1, 0)).await;
        engine.approve_reservation(id).await.unwrap();
    }
    let mine = engine.user_notifications("20231001", false, None).await;
    assert_eq!(mine.len(), 3);

    assert_ok!(engine.mark_notification_read(mine[0].id).await);
    assert_ok!(engine.mark_notification_read(mine[0].id).await);
    assert_eq!(engine.unread_count("20231001").await, 2);
    let unread = engine.user_notifications("20231001", true, None).await;
    assert!(unread.iter().all(|n| n.id != mine[0].id));

    assert_eq!(engine.mark_all_notifications_read("20231001").await.unwrap(), 2);
    assert_eq!(engine.mark_all_notifications_read("20231001").await.unwrap(), 0);
    assert_eq!(engine.unread_count("20231001").await, 0);
    assert_eq!(engine.unread_count(ADMIN_INBOX).await, 3);

    assert_ok!(engine.delete_notification(mine[1].id).await);
    assert!(matches!(
        engine.delete_notification(mine[1].id).await,
        Err(EngineError::NotFound(_))
    ));
    assert_err!(engine.mark_notification_read(Ulid::new()).await);
    assert_eq!(engine.user_notifications("20231001", false, None).await.len(), 2);
}

#[tokio::test]
async fn inbox_survives_replay_and_compaction() {
    let path = test_wal_path("inbox_replay.wal");
    let (mine, admin) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let room = add_room(&engine, "Room 101").await;
        let a = book(&engine, room, d(2025, 1, 10), t(9, 0), t(10, 0)).await;
        let b = book(&engine, room, d(2025, 1, 10), t(10, 0), t(11, 0)).await;
        engine.approve_reservation(a).await.unwrap();
        engine.approve_reservation(b).await.unwrap();
        let first = engine.user_notifications("20231001", false, None).await[0].id;
        engine.mark_notification_read(first).await.unwrap();
        let admin_first = engine.user_notifications(ADMIN_INBOX, false, None).await[0].id;
        engine.delete_notification(admin_first).await.unwrap();

        engine.compact_wal().await.unwrap();
        engine.mark_all_notifications_read(ADMIN_INBOX).await.unwrap();
        (
            engine.user_notifications("20231001", false, None).await,
            engine.user_notifications(ADMIN_INBOX, false, None).await,
        )
    };

    let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(replayed.user_notifications("20231001", false, None).await, mine);
    assert_eq!(replayed.user_notifications(ADMIN_INBOX, false, None).await, admin);
    assert_eq!(replayed.unread_count("20231001").await, 1);
    assert_eq!(replayed.unread_count(ADMIN_INBOX).await, 0);
}
