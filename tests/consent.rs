mod common;

use chrono::Duration as ChronoDuration;
use common::{harness, new_event, students};

use campaign_consent::clock::Clock;
use campaign_consent::cohort::RosterChange;
use campaign_consent::db;
use campaign_consent::model::{ConsentStatus, Decision, DeliveryStatus, NotificationType, Readiness};
use campaign_consent::EngineError;

#[tokio::test]
async fn unwritten_record_reads_as_pending() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 2)]).await;

    let record = h.engine.ledger.record(&event.id, "5A-s0").await.unwrap();
    assert_eq!(record.status, ConsentStatus::Pending);
    assert_eq!(record.revision, 0);
    assert!(record.acting_guardian_id.is_none());
    // Reading never materialises a row.
    assert!(db::list_consents(&h.pool, &event.id).await.unwrap().is_empty());

    let err = h.engine.ledger.record(&event.id, "ghost").await.unwrap_err();
    assert!(matches!(err, EngineError::NotEnrolled { .. }));
}

#[tokio::test]
async fn concurrent_guardians_only_one_wins() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 1)]).await;

    let (mum, dad) = tokio::join!(
        h.engine
            .submit_decision(&event.id, "5A-s0", Decision::Agree, "mum", 0),
        h.engine
            .submit_decision(&event.id, "5A-s0", Decision::Disagree, "dad", 0),
    );
    let (winner, loser, loser_guardian) = match (mum, dad) {
        (Ok(rec), Err(err)) => (rec, err, "dad"),
        (Err(err), Ok(rec)) => (rec, err, "mum"),
        other => panic!("exactly one decision must win: {other:?}"),
    };
    assert_eq!(winner.revision, 1);
    assert!(matches!(
        loser,
        EngineError::Conflict {
            expected: 0,
            actual: 1,
            ..
        }
    ));

    let stored = h.engine.ledger.record(&event.id, "5A-s0").await.unwrap();
    assert_eq!(stored, winner);
    assert_eq!(h.engine.ledger.history(&event.id, "5A-s0").await.unwrap().len(), 1);

    // The loser re-reads and retries against the current revision.
    let retried = h
        .engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, loser_guardian, 1)
        .await
        .unwrap();
    assert_eq!(retried.revision, 2);
    assert_eq!(retried.acting_guardian_id.as_deref(), Some(loser_guardian));

    let history = h.engine.ledger.history(&event.id, "5A-s0").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from, ConsentStatus::Pending);
    assert_eq!(history[1].from, winner.status);
    assert_eq!(history[1].to, ConsentStatus::Agree);
}

#[tokio::test]
async fn stale_revision_is_a_conflict() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 1)]).await;
    let err = h
        .engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, "g", 3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict {
            expected: 3,
            actual: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn repeating_a_decision_still_bumps_revision() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 1)]).await;
    let first = h
        .engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, "g", 0)
        .await
        .unwrap();
    let second = h
        .engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, "g", first.revision)
        .await
        .unwrap();
    assert_eq!(second.status, ConsentStatus::Agree);
    assert_eq!(second.revision, 2);
}

#[tokio::test]
async fn decisions_before_scheduling_are_rejected() {
    let h = harness().await;
    h.directory.set_class("5A", students("5A", 1)).await;
    let event = h
        .engine
        .orchestrator
        .create_event(new_event(&["5A"]))
        .await
        .unwrap();
    let err = h
        .engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, "g", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EventNotOpen { .. }));
}

#[tokio::test]
async fn unknown_student_cannot_decide() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 1)]).await;
    let err = h
        .engine
        .submit_decision(&event.id, "5B-s0", Decision::Agree, "g", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotEnrolled { .. }));
}

#[tokio::test]
async fn decision_after_cutoff_is_rejected() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 10)]).await;
    h.decide(&event.id, "5A", 8).await;

    h.clock.set(h.cutoff());
    let err = h
        .engine
        .submit_decision(&event.id, "5A-s9", Decision::Agree, "g", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WindowClosed(_)));

    let record = h.engine.ledger.record(&event.id, "5A-s9").await.unwrap();
    assert_eq!(record.status, ConsentStatus::Pending);
    let class = h.engine.coordinator.evaluate_class(&event.id, "5A").await.unwrap();
    assert_eq!(class.decided(), 8);
    assert_eq!(class.verdict, Readiness::PartiallyReady);
}

#[tokio::test]
async fn threshold_splits_classes_after_cutoff() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 10), ("5B", 10)]).await;
    h.decide(&event.id, "5A", 9).await;
    h.decide(&event.id, "5B", 7).await;

    h.clock.set(h.cutoff() + ChronoDuration::hours(1));
    let eval = h.engine.coordinator.evaluate_event(&event.id).await.unwrap();
    assert_eq!(eval.classes[0].verdict, Readiness::PartiallyReady);
    assert_eq!(eval.classes[1].verdict, Readiness::Closed);
    assert_eq!(eval.directives.len(), 1);
    assert_eq!(eval.directives[0].class_id, "5B");

    // Evaluation is a pure read.
    let again = h.engine.coordinator.evaluate_class(&event.id, "5B").await.unwrap();
    assert_eq!(again, eval.classes[1]);
    assert_eq!(
        h.engine.coordinator.evaluate_class(&event.id, "5B").await.unwrap(),
        again
    );
}

#[tokio::test]
async fn per_event_threshold_overrides_default() {
    let h = harness().await;
    let event = h.scheduled_with(&[("5A", 10)], Some(0.7)).await;
    h.decide(&event.id, "5A", 7).await;
    h.clock.set(h.cutoff());
    let class = h.engine.coordinator.evaluate_class(&event.id, "5A").await.unwrap();
    assert_eq!(class.verdict, Readiness::PartiallyReady);
}

#[tokio::test]
async fn decision_settles_request_and_queues_receipt() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 2)]).await;
    h.engine
        .submit_decision(&event.id, "5A-s0", Decision::Agree, "g", 0)
        .await
        .unwrap();

    let tasks: Vec<_> = h
        .engine
        .dispatcher
        .tasks(&event.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.student_id == "5A-s0")
        .map(|t| (t.kind, t.status))
        .collect();
    assert_eq!(
        tasks,
        vec![
            (NotificationType::ConsentRequest, DeliveryStatus::Acknowledged),
            (NotificationType::DecisionReceipt, DeliveryStatus::Queued),
        ]
    );

    let cached = h.engine.coordinator.cached(&event.id).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].agree, 1);
    assert_eq!(cached[0].pending, 1);
    assert_eq!(cached[0].verdict, Readiness::Blocked);
}

#[tokio::test]
async fn reminders_target_pending_students_only() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 3)]).await;
    h.decide(&event.id, "5A", 1).await;

    let queued = h.engine.orchestrator.send_reminders(&event.id).await.unwrap();
    assert_eq!(queued, 2);
    let reminded: Vec<String> = h
        .engine
        .dispatcher
        .tasks(&event.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == NotificationType::Reminder)
        .map(|t| t.student_id)
        .collect();
    assert_eq!(reminded, vec!["5A-s1".to_string(), "5A-s2".to_string()]);

    // Re-sending reuses the open reminders.
    assert_eq!(h.engine.orchestrator.send_reminders(&event.id).await.unwrap(), 2);
    assert_eq!(h.engine.dispatcher.tasks(&event.id).await.unwrap().len(), 3 + 1 + 2);

    h.clock.set(h.cutoff());
    assert!(matches!(
        h.engine.orchestrator.send_reminders(&event.id).await,
        Err(EngineError::EventNotOpen { .. })
    ));
}

#[tokio::test]
async fn roster_refresh_tracks_joiners_and_leavers() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 3)]).await;
    h.engine
        .submit_decision(&event.id, "5A-s2", Decision::Agree, "g", 0)
        .await
        .unwrap();

    // s2 transfers out, s3 joins.
    h.directory
        .set_class("5A", vec!["5A-s0".into(), "5A-s1".into(), "5A-s3".into()])
        .await;
    h.clock.advance(ChronoDuration::hours(1));
    let resolved = h.engine.orchestrator.refresh_roster(&event.id).await.unwrap();
    assert_eq!(
        resolved[0].change,
        RosterChange::Changed {
            added: vec!["5A-s3".into()],
            removed: vec!["5A-s2".into()],
        }
    );

    let requested: Vec<String> = h
        .engine
        .dispatcher
        .tasks(&event.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == NotificationType::ConsentRequest)
        .map(|t| t.student_id)
        .collect();
    assert!(requested.contains(&"5A-s3".to_string()));

    // The leaver's record is kept but no longer counted.
    let kept = h.engine.ledger.record(&event.id, "5A-s2").await.unwrap();
    assert_eq!(kept.status, ConsentStatus::Agree);
    let eval = h.engine.coordinator.evaluate_event(&event.id).await.unwrap();
    assert_eq!(eval.classes[0].enrolled(), 3);
    assert_eq!(eval.classes[0].agree, 0);
    assert_eq!(eval.inconsistent, vec!["5A-s2".to_string()]);

    // Same membership again stores no new snapshot.
    let resolved = h.engine.orchestrator.refresh_roster(&event.id).await.unwrap();
    assert_eq!(resolved[0].change, RosterChange::Unchanged);
    let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM class_rosters WHERE event_id = ?")
        .bind(&event.id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(snapshots, 2);
}

#[tokio::test]
async fn roster_refresh_retries_lost_requests() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 2)]).await;

    h.directory.set_class("5A", students("5A", 3)).await;
    h.clock.advance(ChronoDuration::hours(1));
    sqlx::query(
        "CREATE TRIGGER reject_tasks BEFORE INSERT ON notification_tasks \
         BEGIN SELECT RAISE(ABORT, 'notifications unavailable'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();
    // The new snapshot is stored before the request wave fails.
    assert!(h.engine.orchestrator.refresh_roster(&event.id).await.is_err());

    sqlx::query("DROP TRIGGER reject_tasks")
        .execute(&h.pool)
        .await
        .unwrap();
    let resolved = h.engine.orchestrator.refresh_roster(&event.id).await.unwrap();
    assert_eq!(resolved[0].change, RosterChange::Unchanged);

    let mut requested: Vec<String> = h
        .engine
        .dispatcher
        .tasks(&event.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == NotificationType::ConsentRequest)
        .map(|t| t.student_id)
        .collect();
    requested.sort();
    assert_eq!(requested, students("5A", 3));
}

#[tokio::test]
async fn disagreements_come_with_feedback() {
    let h = harness().await;
    let event = h.scheduled(&[("5A", 2)]).await;
    h.engine
        .submit_decision(&event.id, "5A-s0", Decision::Disagree, "g-0", 0)
        .await
        .unwrap();
    h.engine
        .submit_decision(&event.id, "5A-s1", Decision::Agree, "g-1", 0)
        .await
        .unwrap();

    let rows: [(Option<&str>, &str); 3] = [
        (Some(event.id.as_str()), "allergic to eggs"),
        (None, "please call before any procedure"),
        (Some("other-event"), "unrelated"),
    ];
    for (event_id, body) in rows {
        sqlx::query(
            "INSERT INTO feedback (student_id, event_id, guardian_id, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind("5A-s0")
        .bind(event_id)
        .bind("g-0")
        .bind(body)
        .bind(h.clock.now())
        .execute(&h.pool)
        .await
        .unwrap();
    }

    let reviews = h.engine.ledger.disagreements(&event.id).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].record.student_id, "5A-s0");
    let bodies: Vec<&str> = reviews[0].feedback.iter().map(|f| f.body.as_str()).collect();
    assert_eq!(bodies, vec!["allergic to eggs", "please call before any procedure"]);
}
