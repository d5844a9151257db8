use super::*;
use crate::{
    start_session,
    test_support::{context_with, scripted_context, ScriptedBackend},
    FleetProfile,
};
use shared::domain::TaskName;
use std::{sync::atomic::Ordering, time::Duration};

async fn session(ctx: &FleetContext) -> String {
    start_session(ctx)
        .await
        .expect("session")
        .session_id
        .to_string()
}

async fn stored(ctx: &FleetContext, session_id: &str, rover: &str) -> RoverRecord {
    ctx.store
        .get(&SessionId::new(session_id), &RoverId::new(rover))
        .await
        .expect("record")
}

#[tokio::test]
async fn move_records_the_rover_as_moving() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;

    let ack = move_rover(&ctx, &session_id, "Rover-1", "forward")
        .await
        .expect("move");
    assert_eq!(ack.message, "Rover-1 moving forward");

    let record = stored(&ctx, &session_id, "Rover-1").await;
    assert_eq!(record.status, RoverStatus::Moving);
    assert_eq!(record.battery, backend.report("Rover-1").battery);
    assert_eq!(record.coordinates, [0, 1]);
}

#[tokio::test]
async fn second_move_while_moving_is_busy() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;

    move_rover(&ctx, &session_id, "Rover-2", "left")
        .await
        .expect("first move");
    let err = move_rover(&ctx, &session_id, "Rover-2", "right")
        .await
        .expect_err("busy");
    assert_eq!(err.code, ErrorCode::RoverBusy);
    assert_eq!(err.rover, Some(RoverId::new("Rover-2")));
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_moves_on_one_rover_let_exactly_one_through() {
    let (ctx, backend) = scripted_context();
    backend.set_move_delay(Duration::from_millis(100));
    let session_id = session(&ctx).await;

    let (first, second) = tokio::join!(
        move_rover(&ctx, &session_id, "Rover-1", "forward"),
        move_rover(&ctx, &session_id, "Rover-1", "backward"),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    let busy = outcomes
        .iter()
        .find_map(|outcome| outcome.as_ref().err())
        .expect("one rejection");
    assert_eq!(busy.code, ErrorCode::RoverBusy);
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn moves_on_different_rovers_run_in_parallel() {
    let (ctx, backend) = scripted_context();
    backend.set_move_delay(Duration::from_millis(50));
    let session_id = session(&ctx).await;

    let (first, second) = tokio::join!(
        move_rover(&ctx, &session_id, "Rover-1", "forward"),
        move_rover(&ctx, &session_id, "Rover-2", "forward"),
    );
    first.expect("rover 1");
    second.expect("rover 2");
}

#[tokio::test]
async fn invalid_direction_never_reaches_the_backend() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;

    let err = move_rover(&ctx, &session_id, "Rover-1", "up")
        .await
        .expect_err("invalid");
    assert_eq!(err.code, ErrorCode::InvalidDirection);
    assert!(err.message.contains("forward, backward, left, right"));
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 0);

    let err = ctx
        .store
        .get(&SessionId::new(&session_id), &RoverId::new("Rover-1"))
        .await
        .expect_err("untouched");
    assert_eq!(err.code, ErrorCode::NoData);
}

#[tokio::test]
async fn commands_validate_session_and_rover_first() {
    let (ctx, _backend) = scripted_context();
    let session_id = session(&ctx).await;

    let err = move_rover(&ctx, "bogus", "Rover-1", "forward")
        .await
        .expect_err("session");
    assert_eq!(err.code, ErrorCode::InvalidSession);

    let err = reset_rover(&ctx, &session_id, "Rover-6")
        .await
        .expect_err("rover");
    assert_eq!(err.code, ErrorCode::UnknownRover);

    let err = assign_task(&ctx, &session_id, "Rover-1", "")
        .await
        .expect_err("task");
    assert_eq!(err.code, ErrorCode::MissingField);
}

#[tokio::test]
async fn reset_returns_the_rover_to_idle_without_a_task() {
    let (ctx, _backend) = scripted_context();
    let session_id = session(&ctx).await;

    assign_task(&ctx, &session_id, "Rover-4", "Weeding")
        .await
        .expect("task");
    move_rover(&ctx, &session_id, "Rover-4", "right")
        .await
        .expect("move");
    reset_rover(&ctx, &session_id, "Rover-4").await.expect("reset");

    let record = stored(&ctx, &session_id, "Rover-4").await;
    assert_eq!(record.status, RoverStatus::Idle);
    assert_eq!(record.task, None);
    assert_eq!(record.battery, 100);
}

#[tokio::test]
async fn irrigation_assignment_is_recorded() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;
    let mut events = ctx.subscribe();

    let ack = assign_task(&ctx, &session_id, "Rover-3", "Irrigation")
        .await
        .expect("task");
    assert_eq!(ack.message, "Rover-3 assigned Irrigation");
    assert_eq!(
        backend.report("Rover-3").task,
        Some(TaskName::new("Irrigation"))
    );

    let record = stored(&ctx, &session_id, "Rover-3").await;
    assert_eq!(record.task, Some(TaskName::new("Irrigation")));
    assert_eq!(record.status, RoverStatus::Idle);

    match events.recv().await.expect("event") {
        FleetEvent::CommandDispatched {
            rover_id, command, ..
        } => {
            assert_eq!(rover_id, RoverId::new("Rover-3"));
            assert_eq!(command.label(), "assign_task");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        events.recv().await.expect("event"),
        FleetEvent::RoverUpdated { .. }
    ));
}

#[tokio::test]
async fn task_on_a_moving_rover_is_busy() {
    let (ctx, _backend) = scripted_context();
    let session_id = session(&ctx).await;

    move_rover(&ctx, &session_id, "Rover-5", "backward")
        .await
        .expect("move");
    let err = assign_task(&ctx, &session_id, "Rover-5", "Soil Analysis")
        .await
        .expect_err("busy");
    assert_eq!(err.code, ErrorCode::RoverBusy);
}

#[tokio::test]
async fn low_battery_blocks_moves_below_a_raised_reserve() {
    let profile = FleetProfile {
        battery_reserve: 20,
        ..FleetProfile::default()
    };
    let backend = Arc::new(ScriptedBackend::new(&profile));
    backend.set_battery("Rover-1", 12);
    let ctx = context_with(backend.clone(), profile);
    let session_id = session(&ctx).await;

    // first sighting of the rover comes from a status read
    crate::rover_status(&ctx, &session_id, None)
        .await
        .expect("status");

    let err = move_rover(&ctx, &session_id, "Rover-1", "forward")
        .await
        .expect_err("battery");
    assert_eq!(err.code, ErrorCode::InsufficientBattery);
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 0);

    move_rover(&ctx, &session_id, "Rover-2", "forward")
        .await
        .expect("enough battery");
}

#[tokio::test]
async fn tasks_need_battery_for_their_cost_plus_the_reserve() {
    let (ctx, backend) = scripted_context();
    backend.set_battery("Rover-3", 15);
    let session_id = session(&ctx).await;
    crate::rover_status(&ctx, &session_id, None)
        .await
        .expect("status");

    let err = assign_task(&ctx, &session_id, "Rover-3", "Irrigation")
        .await
        .expect_err("battery");
    assert_eq!(err.code, ErrorCode::InsufficientBattery);
    assert_eq!(err.rover, Some(RoverId::new("Rover-3")));
    assert!(err.message.contains("Irrigation uses 10%"));
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 0);

    assign_task(&ctx, &session_id, "Rover-3", "Crop Monitoring")
        .await
        .expect("cheap task");
    assert_eq!(
        stored(&ctx, &session_id, "Rover-3").await.task,
        Some(TaskName::new("Crop Monitoring"))
    );
}

#[tokio::test]
async fn moves_stop_at_the_default_reserve() {
    let (ctx, backend) = scripted_context();
    backend.set_battery("Rover-2", 14);
    let session_id = session(&ctx).await;
    crate::rover_status(&ctx, &session_id, None)
        .await
        .expect("status");

    let err = move_rover(&ctx, &session_id, "Rover-2", "forward")
        .await
        .expect_err("battery");
    assert_eq!(err.code, ErrorCode::InsufficientBattery);
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dispatched_event_names_session_rover_and_command() {
    let (ctx, _backend) = scripted_context();
    let session_id = session(&ctx).await;
    let mut events = ctx.subscribe();

    reset_rover(&ctx, &session_id, "Rover-5").await.expect("reset");

    match events.recv().await.expect("event") {
        FleetEvent::CommandDispatched {
            session_id: event_session,
            rover_id,
            command,
            message,
        } => {
            assert_eq!(event_session.as_str(), session_id);
            assert_eq!(rover_id, RoverId::new("Rover-5"));
            assert_eq!(command, CommandKind::Reset);
            assert_eq!(message, "Rover-5 reset");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn uncertain_commands_leave_the_store_alone() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;
    backend.commands_uncertain.store(true, Ordering::SeqCst);

    let err = move_rover(&ctx, &session_id, "Rover-1", "forward")
        .await
        .expect_err("uncertain");
    assert_eq!(err.code, ErrorCode::CommandUncertain);
    assert_eq!(err.rover, Some(RoverId::new("Rover-1")));

    let err = ctx
        .store
        .get(&SessionId::new(&session_id), &RoverId::new("Rover-1"))
        .await
        .expect_err("nothing stored");
    assert_eq!(err.code, ErrorCode::NoData);
}

#[tokio::test]
async fn queued_resets_all_complete() {
    let (ctx, backend) = scripted_context();
    let session_id = session(&ctx).await;

    let (first, second, third) = tokio::join!(
        reset_rover(&ctx, &session_id, "Rover-2"),
        reset_rover(&ctx, &session_id, "Rover-2"),
        reset_rover(&ctx, &session_id, "Rover-2"),
    );
    first.expect("first");
    second.expect("second");
    third.expect("third");
    assert_eq!(backend.commands_sent.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gates_are_forgotten_with_their_session() {
    let gates = CommandGates::default();
    let session = SessionId::new("s-1");
    let rover = RoverId::new("Rover-1");

    let held = gates.try_acquire(&session, &rover).await.expect("free");
    assert!(gates.try_acquire(&session, &rover).await.is_none());
    drop(held);

    gates.forget_session(&session).await;
    assert!(gates.gates.lock().await.is_empty());
}
