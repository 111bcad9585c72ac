
use std::time::Duration;

use recon_batch::error::BatchError;
use recon_batch::scheduler::job::{CorMethod, FailureKind, Job, JobStatus, Machine, ReconType};
use recon_batch::scheduler::slots::SlotId;
use recon_batch::status::{BatchEvent, StatusEvent};
use test_harness::{
    batch_events, drain_events, fake_scheduler, full_job, job_updates, try_job, wait_for_spawns,
    wait_until,
};

#[tokio::test]
async fn test_three_jobs_on_two_gpus() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    let jobs = vec![full_job("j1"), full_job("j2"), full_job("j3")];
    let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();

    let handle = scheduler.submit(jobs, 2, "Local").await.unwrap();
    assert!(!handle.merged);
    assert_eq!(handle.total_jobs, 3);
    assert_eq!(handle.job_ids, ids);

    // J1 and J2 start right away on slots 0 and 1, J3 waits
    wait_for_spawns(&supervisor, 2).await;
    let snapshot = wait_until(&scheduler, |s| {
        s.run.as_ref().is_some_and(|r| r.running.len() == 2)
    })
    .await;
    let run = snapshot.run.unwrap();
    assert_eq!(run.running.get(&SlotId(0)), Some(&ids[0]));
    assert_eq!(run.running.get(&SlotId(1)), Some(&ids[1]));
    assert_eq!(run.queued, vec![ids[2]]);
    assert!(run.free_slots.is_empty());

    // J1 finishing frees slot 0 for J3
    supervisor.exit("/data/j1.h5", 0);
    wait_for_spawns(&supervisor, 3).await;
    let snapshot = wait_until(&scheduler, |s| {
        s.run
            .as_ref()
            .is_some_and(|r| r.running.get(&SlotId(0)) == Some(&ids[2]))
    })
    .await;
    let run = snapshot.run.unwrap();
    assert_eq!(run.completed, 1);
    assert!(run.queued.is_empty());

    supervisor.exit("/data/j2.h5", 0);
    supervisor.exit("/data/j3.h5", 0);
    scheduler.wait_idle().await.unwrap();

    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(!snapshot.active);
    assert!(snapshot.run.is_none());

    let events = drain_events(&mut rx);
    let last_progress = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last_progress.completed, 3);
    assert_eq!(last_progress.total, 3);
    assert_eq!(last_progress.queue_depth, 0);
    assert_eq!(last_progress.running, 0);
    assert_eq!(last_progress.percent(), 100);

    match batch_events(&events).last() {
        Some(BatchEvent::Completed { summary, .. }) => {
            assert_eq!(summary.total, 3);
            assert_eq!(summary.succeeded, 3);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_queued_status_pushed_on_submit() {
    let (scheduler, _supervisor, mut rx) = fake_scheduler();
    let jobs = vec![full_job("a"), full_job("b")];
    let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();

    scheduler.submit(jobs, 1, "Local").await.unwrap();

    let updates = job_updates(&drain_events(&mut rx));
    let queued: Vec<_> = updates
        .iter()
        .filter(|u| u.text == "Queued")
        .map(|u| u.job_id)
        .collect();
    assert_eq!(queued, ids);
    assert!(updates
        .iter()
        .filter(|u| u.text == "Queued")
        .all(|u| u.color.color() == "blue"));

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_slot_bound_never_exceeded() {
    let (scheduler, supervisor, _rx) = fake_scheduler();
    let jobs: Vec<Job> = (0..10).map(|i| full_job(&format!("scan_{:04}", i))).collect();

    scheduler.submit(jobs, 3, "Local").await.unwrap();

    let mut finished = 0;
    while finished < 10 {
        wait_for_spawns(&supervisor, (finished + 3).min(10)).await;
        let running = supervisor.running();
        assert!(running.len() <= 3);

        // Conservation holds at every observation
        let snapshot = scheduler.snapshot().await.unwrap();
        if let Some(run) = snapshot.run {
            assert_eq!(run.completed + run.running.len() + run.queued.len(), run.total);
            assert!(run.running.len() <= 3);
        }

        if let Some(process) = running.first() {
            process.exit(0);
            finished += 1;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    scheduler.wait_idle().await.unwrap();
    assert!(supervisor.max_running() <= 3);
    assert_eq!(supervisor.processes().len(), 10);
}

#[tokio::test]
async fn test_fifo_dispatch_order() {
    let (scheduler, supervisor, _rx) = fake_scheduler();
    let names = ["first", "second", "third", "fourth"];
    let jobs: Vec<Job> = names.iter().map(|n| full_job(n)).collect();

    scheduler.submit(jobs, 1, "Local").await.unwrap();

    for (i, name) in names.iter().enumerate() {
        wait_for_spawns(&supervisor, i + 1).await;
        // Only one slot, so each job waits for its predecessor
        assert_eq!(supervisor.running().len(), 1);
        supervisor.exit(&format!("/data/{}.h5", name), 0);
    }
    scheduler.wait_idle().await.unwrap();

    let expected: Vec<String> = names.iter().map(|n| format!("/data/{}.h5", n)).collect();
    assert_eq!(supervisor.spawned_files(), expected);
}

#[tokio::test]
async fn test_merge_into_active_run() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();

    let first = scheduler
        .submit(vec![full_job("a1"), full_job("a2")], 1, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;

    // A different GPU count does not resize the running pool
    let second = scheduler
        .submit(vec![full_job("b1"), full_job("b2"), full_job("b3")], 4, "Local")
        .await
        .unwrap();
    assert!(second.merged);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.total_jobs, 5);

    let snapshot = scheduler.snapshot().await.unwrap();
    let run = snapshot.run.unwrap();
    assert_eq!(run.slot_count, 1);
    assert_eq!(run.total, 5);
    assert_eq!(run.running.len(), 1);
    assert_eq!(run.queued.len(), 4);

    for (i, name) in ["a1", "a2", "b1", "b2", "b3"].iter().enumerate() {
        wait_for_spawns(&supervisor, i + 1).await;
        assert_eq!(supervisor.running().len(), 1);
        supervisor.exit(&format!("/data/{}.h5", name), 0);
    }
    scheduler.wait_idle().await.unwrap();

    let events = drain_events(&mut rx);
    let batches = batch_events(&events);
    let started = batches
        .iter()
        .filter(|b| matches!(b, BatchEvent::Started { .. }))
        .count();
    let merged = batches
        .iter()
        .filter(|b| matches!(b, BatchEvent::Merged { added: 3, total: 5, .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(merged, 1);
    match batches.last() {
        Some(BatchEvent::Completed { summary, .. }) => assert_eq!(summary.succeeded, 5),
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_cor_is_skipped_without_holding_slot() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    let no_cor = Job::new("/data/nocor.h5", ReconType::Full);
    let bad_cor = Job::new("/data/badcor.h5", ReconType::Try).with_cor(f64::NAN);
    let auto_try = Job::new("/data/auto.h5", ReconType::Try).with_cor_method(CorMethod::Auto);
    let skipped_ids = [no_cor.id, bad_cor.id];

    scheduler
        .submit(vec![no_cor, bad_cor, auto_try, full_job("ok")], 1, "Local")
        .await
        .unwrap();

    // Skipped jobs never reach the supervisor and free their slot at once
    wait_for_spawns(&supervisor, 1).await;
    assert_eq!(supervisor.spawned_files(), vec!["/data/auto.h5".to_string()]);
    let auto = supervisor.process("/data/auto.h5").unwrap();
    assert!(auto.command.args.contains(&"auto".to_string()));
    assert!(!auto.command.args.contains(&"--rotation-axis".to_string()));

    supervisor.exit("/data/auto.h5", 0);
    wait_for_spawns(&supervisor, 2).await;
    supervisor.exit("/data/ok.h5", 0);
    scheduler.wait_idle().await.unwrap();

    let events = drain_events(&mut rx);
    let updates = job_updates(&events);
    for id in skipped_ids {
        let last = updates.iter().filter(|u| u.job_id == id).last().unwrap();
        assert!(matches!(last.status, JobStatus::Skipped(_)));
        assert_eq!(last.text, "Skipped");
        assert_eq!(last.color.color(), "gray");
    }

    match batch_events(&events).last() {
        Some(BatchEvent::Completed { summary, .. }) => {
            assert_eq!(summary.total, 4);
            assert_eq!(summary.skipped, 2);
            assert_eq!(summary.succeeded, 2);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spawn_failure_and_non_zero_exit() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    let missing = full_job("missing_exe");
    let broken = full_job("broken");
    let (missing_id, broken_id) = (missing.id, broken.id);

    scheduler
        .submit(vec![missing, broken], 1, "Local")
        .await
        .unwrap();

    wait_for_spawns(&supervisor, 1).await;
    supervisor.exit("/data/broken.h5", 2);
    scheduler.wait_idle().await.unwrap();

    let updates = job_updates(&drain_events(&mut rx));
    let last_for = |id: uuid::Uuid| updates.iter().filter(|u| u.job_id == id).last().unwrap();

    let missing = last_for(missing_id);
    assert!(matches!(
        missing.status,
        JobStatus::Failed(FailureKind::SpawnFailed(_))
    ));
    assert_eq!(missing.text, "Failed to start");

    let broken = last_for(broken_id);
    assert_eq!(
        broken.status,
        JobStatus::Failed(FailureKind::NonZeroExit(2))
    );
    assert_eq!(broken.text, "Full Failed");
    assert_eq!(broken.color.color(), "red");
}

#[tokio::test]
async fn test_running_status_names_gpu() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    scheduler
        .submit(vec![try_job("t1"), try_job("t2")], 2, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 2).await;
    supervisor.exit("/data/t1.h5", 0);
    supervisor.exit("/data/t2.h5", 0);
    scheduler.wait_idle().await.unwrap();

    let texts: Vec<String> = job_updates(&drain_events(&mut rx))
        .into_iter()
        .map(|u| u.text)
        .collect();
    assert!(texts.contains(&"Running on GPU 0".to_string()));
    assert!(texts.contains(&"Running on GPU 1".to_string()));
    assert_eq!(texts.iter().filter(|t| *t == "Done try").count(), 2);

    // Local jobs are pinned to their slot
    let devices: Vec<Option<String>> = supervisor
        .processes()
        .iter()
        .map(|p| p.command.env.get("CUDA_VISIBLE_DEVICES").cloned())
        .collect();
    assert_eq!(devices, vec![Some("0".to_string()), Some("1".to_string())]);
}

#[tokio::test]
async fn test_stop_cancels_running_and_queued() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    let jobs: Vec<Job> = (0..5).map(|i| full_job(&format!("s{}", i))).collect();
    let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();

    scheduler.submit(jobs, 2, "Local").await.unwrap();
    wait_for_spawns(&supervisor, 2).await;

    let report = scheduler.stop().await.unwrap();
    assert!(report.was_active());
    assert_eq!(report.cancelled_running, 2);
    assert_eq!(report.cancelled_queued, 3);
    assert_eq!(report.force_killed, 0);

    assert!(!scheduler.is_active());
    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(snapshot.run.is_none());

    // Every process received the terminate request, no new ones started
    assert!(supervisor.running().is_empty());
    assert_eq!(supervisor.processes().len(), 2);
    assert!(supervisor
        .processes()
        .iter()
        .all(|p| p.signal() == Some(15)));

    let events = drain_events(&mut rx);
    let updates = job_updates(&events);
    for id in &ids {
        let last = updates.iter().filter(|u| u.job_id == *id).last().unwrap();
        assert_eq!(last.status, JobStatus::Cancelled);
        assert_eq!(last.text, "Cancelled batch");
    }

    let terminal: Vec<_> = batch_events(&events)
        .into_iter()
        .filter(|b| matches!(b, BatchEvent::Completed { .. } | BatchEvent::Stopped { .. }))
        .collect();
    assert_eq!(terminal.len(), 1);
    match &terminal[0] {
        BatchEvent::Stopped { summary, .. } => assert_eq!(summary.cancelled, 5),
        other => panic!("expected stop, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_force_kills_stubborn_process() {
    let (scheduler, supervisor, _rx) = fake_scheduler();
    scheduler
        .submit(vec![full_job("stubborn"), full_job("polite")], 2, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 2).await;

    let report = scheduler.stop().await.unwrap();
    assert_eq!(report.cancelled_running, 2);
    assert_eq!(report.force_killed, 1);

    assert_eq!(supervisor.process("/data/stubborn.h5").unwrap().signal(), Some(9));
    assert_eq!(supervisor.process("/data/polite.h5").unwrap().signal(), Some(15));
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let (scheduler, _supervisor, mut rx) = fake_scheduler();

    let report = scheduler.stop().await.unwrap();
    assert!(!report.was_active());
    let report = scheduler.stop().await.unwrap();
    assert!(!report.was_active());

    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn test_stop_twice_emits_one_terminal_event() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    scheduler
        .submit(vec![full_job("x")], 1, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;

    assert!(scheduler.stop().await.unwrap().was_active());
    assert!(!scheduler.stop().await.unwrap().was_active());

    let stopped = batch_events(&drain_events(&mut rx))
        .into_iter()
        .filter(|b| matches!(b, BatchEvent::Stopped { .. }))
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_resubmit_after_stop_starts_new_run() {
    let (scheduler, supervisor, _rx) = fake_scheduler();
    let first = scheduler
        .submit(vec![full_job("r1"), full_job("r2")], 1, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;
    scheduler.stop().await.unwrap();

    let second = scheduler
        .submit(vec![full_job("r3")], 2, "Local")
        .await
        .unwrap();
    assert!(!second.merged);
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.total_jobs, 1);

    let snapshot = scheduler.snapshot().await.unwrap();
    let run = snapshot.run.unwrap();
    assert_eq!(run.slot_count, 2);
    assert_eq!(run.completed, 0);

    wait_for_spawns(&supervisor, 2).await;
    supervisor.exit("/data/r3.h5", 0);
    scheduler.wait_idle().await.unwrap();
}

#[tokio::test]
async fn test_invalid_submissions_rejected() {
    let (scheduler, supervisor, _rx) = fake_scheduler();

    let err = scheduler
        .submit(vec![full_job("z")], 0, "Local")
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InvalidSlotCount(0)));

    let err = scheduler.submit(Vec::new(), 2, "Local").await.unwrap_err();
    assert!(matches!(err, BatchError::EmptyBatch));

    // Nothing started
    assert!(!scheduler.is_active());
    assert!(scheduler.snapshot().await.unwrap().run.is_none());
    assert!(supervisor.processes().is_empty());
}

#[tokio::test]
async fn test_remote_machine_routes_through_ssh() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    scheduler
        .submit(vec![full_job("remote1")], 1, "tomo2")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;

    let process = supervisor.process("/data/remote1.h5").unwrap();
    assert_eq!(process.command.program, "ssh");
    assert_eq!(process.command.args[0], "tomo2");
    assert!(process.command.args[1].starts_with("tomocupy recon --reconstruction-type full"));
    // No GPU pinning for remote jobs
    assert!(process.command.env.is_empty());

    let snapshot = scheduler.snapshot().await.unwrap();
    let run = snapshot.run.unwrap();
    assert!(run
        .jobs
        .iter()
        .all(|j| j.machine == Machine::Remote("tomo2".to_string())));

    supervisor.exit("/data/remote1.h5", 0);
    scheduler.wait_idle().await.unwrap();
    drain_events(&mut rx);
}

#[tokio::test]
async fn test_closed_sink_does_not_stop_batch() {
    let (scheduler, supervisor, rx) = fake_scheduler();
    drop(rx);

    scheduler
        .submit(vec![full_job("u1"), full_job("u2")], 2, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 2).await;
    supervisor.exit("/data/u1.h5", 0);
    supervisor.exit("/data/u2.h5", 1);

    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
        .await
        .expect("batch should drain")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_run_and_scheduler() {
    let (scheduler, supervisor, _rx) = fake_scheduler();
    scheduler
        .submit(vec![full_job("d1"), full_job("d2")], 1, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;

    scheduler.shutdown().await;

    assert!(!scheduler.is_active());
    assert!(supervisor.running().is_empty());
    let err = scheduler
        .submit(vec![full_job("d3")], 1, "Local")
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::SchedulerUnavailable));
}

#[tokio::test]
async fn test_dropping_handles_stops_processes() {
    let (scheduler, supervisor, mut rx) = fake_scheduler();
    scheduler
        .submit(vec![full_job("o1")], 1, "Local")
        .await
        .unwrap();
    wait_for_spawns(&supervisor, 1).await;

    drop(scheduler);

    // The task cancels the run and then drops the sink
    let mut stopped = false;
    while let Some(event) =
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap()
    {
        if matches!(event, StatusEvent::Batch(BatchEvent::Stopped { .. })) {
            stopped = true;
        }
    }
    assert!(stopped);
    assert!(supervisor.running().is_empty());
}
