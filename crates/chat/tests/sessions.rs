mod support;

use std::time::Duration;

use parley_chat::{EngineError, GenerationParams, SessionPolicy, Status, Termination};
use parley_storage::{ConversationId, MessageRole, ThreadEntry};
use pretty_assertions::assert_eq;

use support::{Harness, Script, caller, gated, wait_for_chunks, wait_for_opens};

#[tokio::test]
async fn cancel_after_k_chunks_freezes_content() {
    let (gate, script) = gated();
    let harness = Harness::new(vec![script]);
    let mut events = harness.store.subscribe();

    let handle = harness
        .engine
        .submit(
            Some(&caller()),
            &harness.conversation_id,
            "count for me",
            GenerationParams::new(),
        )
        .await
        .unwrap();
    gate.send("one ");
    gate.send("two ");
    wait_for_chunks(&mut events, 2).await;

    handle.cancel();
    assert!(handle.is_cancelled());
    gate.send("three");
    let report = handle.wait().await.unwrap();

    assert_eq!(report.termination, Termination::Aborted);
    assert_eq!(report.chunks_applied, 2);
    assert_eq!(harness.content(0), "one two ");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.content(0), "one two ");
    assert_eq!(harness.engine.status(&harness.conversation_id), Status::Success);
}

#[tokio::test]
async fn stop_before_first_chunk_still_consumes_the_index() {
    let (_gate, script) = gated();
    let harness = Harness::new(vec![script, Script::text(&["next"])]);

    let handle = harness
        .engine
        .submit(
            Some(&caller()),
            &harness.conversation_id,
            "never mind",
            GenerationParams::new(),
        )
        .await
        .unwrap();
    assert!(harness.engine.stop(&harness.conversation_id));
    let report = handle.wait().await.unwrap();

    assert_eq!(report.termination, Termination::Aborted);
    assert_eq!(report.chunks_applied, 0);
    assert_eq!(harness.content(0), "");
    assert!(!harness.engine.stop(&harness.conversation_id));

    let next = harness
        .engine
        .submit(
            Some(&caller()),
            &harness.conversation_id,
            "try again",
            GenerationParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(next.thread_index(), 1);
    next.wait().await.unwrap();
    assert_eq!(harness.thread_len(), 2);
}

#[tokio::test]
async fn reject_policy_refuses_a_second_session() {
    let (gate, script) = gated();
    let harness = Harness::with_policy(
        SessionPolicy::Reject,
        vec![script, Script::text(&["later"])],
    );
    let id = harness.conversation_id.clone();

    let first = harness
        .engine
        .submit(Some(&caller()), &id, "first", GenerationParams::new())
        .await
        .unwrap();
    let second = harness
        .engine
        .submit(Some(&caller()), &id, "second", GenerationParams::new())
        .await;

    assert!(matches!(second, Err(EngineError::SessionActive { .. })));
    assert_eq!(harness.engine.status(&id), Status::Loading);
    assert_eq!(harness.engine.active_session(&id), Some(first.session_id()));
    assert_eq!(harness.thread_len(), 1);
    assert_eq!(harness.transport.open_count(), 1);

    gate.send("done");
    drop(gate);
    let report = first.wait().await.unwrap();
    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(harness.engine.status(&id), Status::Success);

    let third = harness
        .engine
        .submit(Some(&caller()), &id, "third", GenerationParams::new())
        .await
        .unwrap();
    assert_eq!(third.thread_index(), 1);
    third.wait().await.unwrap();
    assert_eq!(harness.content(0), "done");
    assert_eq!(harness.content(1), "later");
}

#[tokio::test]
async fn supersede_policy_cancels_then_starts_after() {
    let (gate, script) = gated();
    let harness = Harness::with_policy(
        SessionPolicy::Supersede,
        vec![script, Script::text(&["fresh answer"])],
    );
    let id = harness.conversation_id.clone();
    let mut events = harness.store.subscribe();

    let first = harness
        .engine
        .submit(Some(&caller()), &id, "first", GenerationParams::new())
        .await
        .unwrap();
    gate.send("partial ");
    wait_for_chunks(&mut events, 1).await;

    let second = harness
        .engine
        .submit(Some(&caller()), &id, "second", GenerationParams::new())
        .await
        .unwrap();
    assert!(first.is_cancelled());
    assert_eq!(second.thread_index(), 1);

    let first_report = first.wait().await.unwrap();
    let second_report = second.wait().await.unwrap();

    assert_eq!(first_report.termination, Termination::Aborted);
    assert_eq!(second_report.termination, Termination::Completed);
    assert_eq!(harness.content(0), "partial ");
    assert_eq!(harness.content(1), "fresh answer");
    assert_eq!(harness.engine.status(&id), Status::Success);
    drop(gate);
}

#[tokio::test]
async fn status_watchers_see_loading_then_success() {
    let (gate, script) = gated();
    let harness = Harness::new(vec![script]);
    let id = harness.conversation_id.clone();
    let mut status = harness.engine.watch_status(&id);
    assert_eq!(*status.borrow_and_update(), Status::Idle);

    let handle = harness
        .engine
        .submit(Some(&caller()), &id, "Hello", GenerationParams::new())
        .await
        .unwrap();
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), Status::Loading);
    assert!(!harness.engine.status(&id).accepts_input());

    drop(gate);
    handle.wait().await.unwrap();

    status.changed().await.unwrap();
    assert_eq!(*status.borrow_and_update(), Status::Success);
}

#[tokio::test]
async fn conversations_stream_independently() {
    let (left_gate, left_script) = gated();
    let (right_gate, right_script) = gated();
    let harness = Harness::new(vec![left_script, right_script]);
    let left = harness.conversation_id.clone();
    let right = ConversationId::new("chat-2");
    harness.store.create_conversation(right.clone()).unwrap();
    let mut events = harness.store.subscribe();

    let left_handle = harness
        .engine
        .submit(Some(&caller()), &left, "left", GenerationParams::new())
        .await
        .unwrap();
    wait_for_opens(&harness.transport, 1).await;
    let right_handle = harness
        .engine
        .submit(Some(&caller()), &right, "right", GenerationParams::new())
        .await
        .unwrap();

    left_gate.send("L1 ");
    right_gate.send("R1 ");
    left_gate.send("L2");
    right_gate.send("R2");
    wait_for_chunks(&mut events, 4).await;
    assert_eq!(harness.engine.status(&left), Status::Loading);
    assert_eq!(harness.engine.status(&right), Status::Loading);

    drop(left_gate);
    left_handle.wait().await.unwrap();
    assert_eq!(harness.engine.status(&left), Status::Success);
    assert_eq!(harness.engine.status(&right), Status::Loading);

    right_gate.fail("network down");
    let right_report = right_handle.wait().await.unwrap();
    assert!(matches!(right_report.termination, Termination::Errored(_)));

    let content = |id: &ConversationId| {
        harness.store.conversation(id).unwrap().thread[0]
            .message
            .content
            .clone()
    };
    assert_eq!(content(&left), "L1 L2");
    assert_eq!(content(&right), "R1 R2");
}

#[tokio::test]
async fn shutdown_cancels_every_session() {
    let (_left_gate, left_script) = gated();
    let (_right_gate, right_script) = gated();
    let harness = Harness::new(vec![left_script, right_script]);
    let right = ConversationId::new("chat-2");
    harness.store.create_conversation(right.clone()).unwrap();

    let left_handle = harness
        .engine
        .submit(
            Some(&caller()),
            &harness.conversation_id,
            "left",
            GenerationParams::new(),
        )
        .await
        .unwrap();
    let right_handle = harness
        .engine
        .submit(Some(&caller()), &right, "right", GenerationParams::new())
        .await
        .unwrap();

    assert_eq!(harness.engine.shutdown(), 2);

    assert_eq!(
        left_handle.wait().await.unwrap().termination,
        Termination::Aborted
    );
    assert_eq!(
        right_handle.wait().await.unwrap().termination,
        Termination::Aborted
    );
    assert_eq!(harness.engine.shutdown(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn success_means_the_slot_is_free() {
    let harness = Harness::with_policy(SessionPolicy::Reject, Vec::new());
    let id = harness.conversation_id.clone();
    let mut status = harness.engine.watch_status(&id);

    for round in 0..200 {
        let submitted = harness
            .engine
            .submit(
                Some(&caller()),
                &id,
                &format!("round {round}"),
                GenerationParams::new(),
            )
            .await;
        assert!(submitted.is_ok(), "round {round}: {submitted:?}");

        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| *status == Status::Success),
        )
        .await
        .expect("timed out waiting for success")
        .unwrap();
    }

    assert_eq!(harness.thread_len(), 200);
    assert_eq!(harness.transport.open_count(), 200);
}

#[tokio::test]
async fn thread_edits_wait_for_the_live_session() {
    let (gate, script) = gated();
    let harness = Harness::with_policy(
        SessionPolicy::Reject,
        vec![Script::text(&["first answer"]), script],
    );
    let id = harness.conversation_id.clone();
    let mut events = harness.store.subscribe();

    harness
        .engine
        .submit(Some(&caller()), &id, "q1", GenerationParams::new())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    wait_for_chunks(&mut events, 1).await;

    let handle = harness
        .engine
        .submit(Some(&caller()), &id, "q2", GenerationParams::new())
        .await
        .unwrap();
    gate.send("Hel");
    wait_for_chunks(&mut events, 1).await;

    let deleted = harness.engine.delete_entry(&id, 0).await;
    let dropped = harness.engine.drop_last_pair(&id).await;
    assert!(matches!(deleted, Err(EngineError::SessionActive { .. })));
    assert!(matches!(dropped, Err(EngineError::SessionActive { .. })));
    assert_eq!(harness.engine.active_session(&id), Some(handle.session_id()));

    gate.send("lo");
    drop(gate);
    assert_eq!(
        handle.wait().await.unwrap().termination,
        Termination::Completed
    );
    assert_eq!(
        harness.store.conversation(&id).unwrap().thread,
        vec![
            ThreadEntry::new("q1", MessageRole::Assistant, "first answer"),
            ThreadEntry::new("q2", MessageRole::Assistant, "Hello"),
        ]
    );

    let removed = harness.engine.delete_entry(&id, 0).await.unwrap();
    assert_eq!(removed.input, "q1");
    assert_eq!(harness.thread_len(), 1);
    assert_eq!(harness.content(0), "Hello");
    assert_eq!(harness.engine.status(&id), Status::Success);
}
