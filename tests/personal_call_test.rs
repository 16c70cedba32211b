mod common;

use callcore::CallError;
use callcore::api::EndPersonal;
use callcore::events::{SignalEvent, Topic};
use callcore::fsm::Phase;
use callcore::types::{CallId, CallType, EndReason, SessionStatus, UserId};
use chatcall::bus::SignalBus;
use common::{World, drain, settle};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn hanging_up_before_answer_ends_without_duration() {
    let world = World::new();
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        bob.session.personal().current_call().await.map(|c| c.phase),
        Some(Phase::Ringing)
    );

    alice.session.personal().hang_up().await.unwrap();
    settle().await;

    let session = world.registry.session(&receipt.call_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Ended);
    assert_eq!(session.duration_seconds, None);
    assert_eq!(session.reason, Some(EndReason::Hangup));
    assert!(bob.session.personal().current_call().await.is_none());
    assert_eq!(bob.observer.finished(&receipt.call_id), vec![SessionStatus::Ended]);
    assert_eq!(alice.script.joins_started(), 0);
    assert_eq!(bob.script.joins_started(), 0);
    assert_eq!(world.notifications.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_is_missed_exactly_once() {
    let world = World::new();
    let mut alice_inbox = world.listen("alice");
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    settle().await;
    assert!(alice.session.personal().countdown_armed().is_some());

    // Registry timer and both client countdowns all expire here.
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(world.status(&receipt.call_id).await, SessionStatus::Missed);
    let missed = drain(&mut alice_inbox)
        .into_iter()
        .filter(|name| *name == "call-missed")
        .count();
    assert_eq!(missed, 1);
    assert_eq!(world.notifications.pending_count(), 0);
    assert_eq!(alice.session.personal().countdown_armed(), None);
    assert_eq!(bob.session.personal().countdown_armed(), None);
    assert_eq!(alice.observer.finished(&receipt.call_id), vec![SessionStatus::Missed]);
    assert_eq!(bob.observer.finished(&receipt.call_id), vec![SessionStatus::Missed]);
    assert_eq!(world.registry.active_call_for(&bob.id()), None);
}

#[tokio::test(start_paused = true)]
async fn duplicated_signals_still_give_one_ring_and_one_join() {
    let world = World::new();
    world.bus.set_redelivery(1);
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(bob.observer.incoming(), vec![receipt.call_id.clone()]);
    assert_eq!(world.status(&receipt.call_id).await, SessionStatus::Ringing);

    bob.session.personal().accept(&receipt.call_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(alice.script.joins_started(), 1);
    assert_eq!(bob.script.joins_started(), 1);
    assert_eq!(world.status(&receipt.call_id).await, SessionStatus::Connected);
    for client in [&alice, &bob] {
        let call = client.session.personal().current_call().await.unwrap();
        assert_eq!(call.phase, Phase::Connected);
        assert_eq!(client.session.personal().media().subscribed().await.len(), 1);
    }

    alice.session.personal().hang_up().await.unwrap();
    settle().await;

    let session = world.registry.session(&receipt.call_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Ended);
    assert!(session.duration_seconds.is_some());
    assert_eq!(alice.observer.finished(&receipt.call_id), vec![SessionStatus::Ended]);
    assert_eq!(bob.observer.finished(&receipt.call_id), vec![SessionStatus::Ended]);
    assert_eq!(bob.session.personal().media().current_call().await, None);
}

#[tokio::test(start_paused = true)]
async fn accepting_a_cancelled_call_fails_without_joining() {
    let world = World::new();
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Video)
        .await
        .unwrap();
    settle().await;
    alice.session.personal().cancel().await.unwrap();
    settle().await;

    assert_eq!(world.status(&receipt.call_id).await, SessionStatus::Cancelled);
    let err = bob
        .session
        .personal()
        .accept(&receipt.call_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotFound(_)));
    assert_eq!(bob.observer.finished(&receipt.call_id), vec![SessionStatus::Cancelled]);
    assert_eq!(bob.script.joins_started(), 0);
    assert_eq!(world.status(&receipt.call_id).await, SessionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn calling_an_engaged_user_is_refused() {
    let world = World::new();
    let alice = world.client("alice");
    let bob = world.client("bob");
    let carol = world.client("carol");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    settle().await;
    bob.session.personal().accept(&receipt.call_id).await.unwrap();
    settle().await;

    let err = carol
        .session
        .personal()
        .invite(UserId::new("bob"), CallType::Voice)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Busy(ref user) if user == &bob.id()));
    assert!(carol.session.personal().current_call().await.is_none());
    assert_eq!(world.registry.active_call_for(&carol.id()), None);

    // Busy while already in a call locally, too.
    let err = alice
        .session
        .personal()
        .invite(UserId::new("carol"), CallType::Voice)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Busy(_)));
}

#[tokio::test(start_paused = true)]
async fn callee_rejection_reaches_caller() {
    let world = World::new();
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    settle().await;
    bob.session
        .personal()
        .reject(&receipt.call_id, Some(EndReason::Busy))
        .await
        .unwrap();
    settle().await;

    let session = world.registry.session(&receipt.call_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Rejected);
    assert_eq!(session.reason, Some(EndReason::Busy));
    assert_eq!(alice.observer.finished(&receipt.call_id), vec![SessionStatus::Rejected]);
    assert!(alice.session.personal().current_call().await.is_none());
    assert_eq!(alice.session.personal().countdown_armed(), None);
}

#[tokio::test(start_paused = true)]
async fn call_end_lost_to_a_lagging_listener_is_caught_up() {
    let world = World::new();
    let alice = world.client("alice");
    let bob = world.client("bob");

    let receipt = alice
        .session
        .personal()
        .invite(bob.id(), CallType::Voice)
        .await
        .unwrap();
    settle().await;
    bob.session.personal().accept(&receipt.call_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        bob.session.personal().current_call().await.map(|c| c.phase),
        Some(Phase::Connected)
    );

    world
        .registry
        .end_call(
            &alice.id(),
            EndPersonal {
                call_id: receipt.call_id.clone(),
                participant_ids: vec![alice.id(), bob.id()],
                reason: Some(EndReason::Hangup),
            },
        )
        .await
        .unwrap();
    // Push the call-ended out of bob's buffer before his listener runs.
    for _ in 0..150 {
        world.bus.publish(
            Topic::User(bob.id()),
            SignalEvent::CallRinging {
                call_id: CallId::new("elsewhere"),
            },
        );
    }
    settle().await;

    assert!(bob.session.personal().current_call().await.is_none());
    assert_eq!(bob.observer.finished(&receipt.call_id), vec![SessionStatus::Ended]);
    assert_eq!(bob.session.personal().media().current_call().await, None);
    assert!(!bob.session.personal().resync().await);
}
