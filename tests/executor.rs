use proxy_task_pool::{
    ConcurrencyBudget, ErrorClass, ExecutorConfig, ExecutorConfigBuilder, ExecutorError,
    ProxyPolicy, ProxyPool, ProxyRecord, ProxySource, RetryPolicy, TaskContext, TaskDescriptor,
    TaskExecutor, TaskId, TaskStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(budget: usize) -> ExecutorConfigBuilder {
    ExecutorConfig::builder()
        .budget(ConcurrencyBudget::fixed(budget))
        .retry(RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20)))
        .group_spacing(None)
        .proxy_policy(ProxyPolicy::Optional)
}

fn unit_tasks(n: usize) -> Vec<TaskDescriptor<()>> {
    (0..n).map(|_| TaskDescriptor::new(())).collect()
}

fn static_proxy(n: u16) -> ProxyRecord {
    ProxyRecord::new_static(format!("10.0.0.{n}"), 8000 + n, "user", "pass")
}

#[tokio::test]
async fn never_exceeds_budget() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(3).build());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let work = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        move |_: TaskContext<()>| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), ErrorClass>(())
            }
        }
    };

    let results = executor.run(unit_tasks(10), work).await.unwrap();
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.status == TaskStatus::Succeeded));
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    let stats = executor.stats();
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.success, 10);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn every_task_reported_exactly_once() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(4).build());

    let results = executor
        .run(
            (0..50u32).map(TaskDescriptor::new).collect(),
            |ctx: TaskContext<u32>| async move {
                match *ctx.payload % 3 {
                    0 => Ok(()),
                    1 => Err(ErrorClass::InvalidPayload("odd task".into())),
                    _ if ctx.attempt == 1 => Err(ErrorClass::ConnectionReset),
                    _ => Ok(()),
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 50);
    let ids: HashSet<TaskId> = results.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, (0..50).map(TaskId).collect::<HashSet<_>>());
    assert!(results.iter().all(|r| r.status.is_terminal()));
    assert_eq!(results.iter().filter(|r| !r.success).count(), 17);
}

#[tokio::test]
async fn rate_limited_twice_then_succeeds() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(5).build());

    let results = executor
        .run(unit_tasks(5), |ctx: TaskContext<()>| async move {
            if ctx.attempt <= 2 {
                Err(ErrorClass::Http(429))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    for result in &results {
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.attempts, 3);
    }
}

#[tokio::test]
async fn retries_are_bounded() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(2).build());
    let calls = Arc::new(AtomicU32::new(0));

    let work = {
        let calls = Arc::clone(&calls);
        move |_: TaskContext<()>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ErrorClass::Http(503)) }
        }
    };

    let results = executor.run(unit_tasks(1), work).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(results[0].status, TaskStatus::Failed);
    assert_eq!(results[0].attempts, 4);
    assert_eq!(results[0].error_class, Some(ErrorClass::Http(503)));
}

#[tokio::test]
async fn invalid_payload_is_not_retried() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(1).build());

    let results = executor
        .run(unit_tasks(1), |_: TaskContext<()>| async {
            Err::<(), _>(ErrorClass::InvalidPayload("missing target".into()))
        })
        .await
        .unwrap();
    assert_eq!(results[0].status, TaskStatus::Failed);
    assert_eq!(results[0].attempts, 1);
}

#[tokio::test]
async fn empty_pool_with_required_proxy_fails_without_attempts() {
    init_logger();
    let executor = TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(3).proxy_policy(ProxyPolicy::Required).build(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let work = {
        let calls = Arc::clone(&calls);
        move |_: TaskContext<()>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), ErrorClass>(()) }
        }
    };

    let results = executor.run(unit_tasks(4), work).await.unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for result in &results {
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::NoProxyAvailable));
        assert_eq!(result.attempts, 0);
    }
}

#[tokio::test]
async fn auth_failure_blacklists_proxy_for_rest_of_run() {
    init_logger();
    let pool = Arc::new(ProxyPool::default());
    pool.add((1..=3).map(static_proxy));
    let bad = static_proxy(1).key();

    let executor = TaskExecutor::new(
        Arc::clone(&pool),
        config(1).proxy_policy(ProxyPolicy::Required).build(),
    );
    let used = Arc::new(Mutex::new(Vec::new()));

    let work = {
        let used = Arc::clone(&used);
        let bad = bad.clone();
        move |ctx: TaskContext<()>| {
            let key = ctx.proxy.as_ref().map(ProxyRecord::key).unwrap_or_default();
            used.lock().unwrap().push(key.clone());
            let rejected = key == bad;
            async move {
                if rejected {
                    Err(ErrorClass::ProxyAuth)
                } else {
                    Ok(())
                }
            }
        }
    };

    let results = executor.run(unit_tasks(20), work).await.unwrap();
    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(results.iter().filter(|r| r.attempts == 2).count(), 1);

    let used = used.lock().unwrap();
    let first_bad = used.iter().position(|k| *k == bad).expect("bad proxy was handed out");
    assert!(used[first_bad + 1..].iter().all(|k| *k != bad));
    assert!(pool.is_blacklisted(&bad));
}

#[tokio::test]
async fn preassigned_proxy_used_first() {
    init_logger();
    let pool = Arc::new(ProxyPool::default());
    pool.add(vec![static_proxy(1)]);
    let executor = TaskExecutor::new(Arc::clone(&pool), config(1).build());

    let results = executor
        .run(
            vec![TaskDescriptor::new(()).with_proxy(static_proxy(9))],
            |ctx: TaskContext<()>| async move {
                if ctx.proxy.map(|p| p.port) == Some(8009) {
                    Ok(())
                } else {
                    Err(ErrorClass::Other("wrong proxy".into()))
                }
            },
        )
        .await
        .unwrap();
    assert!(results[0].success);
    assert_eq!(results[0].proxy_used.as_deref(), Some("10.0.0.9:8009"));
}

#[tokio::test]
async fn hung_task_is_timed_out_and_slot_released() {
    init_logger();
    let executor = TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(1)
            .task_timeout(Duration::from_millis(100))
            .retry(RetryPolicy::none())
            .build(),
    );

    let started = Instant::now();
    let results = executor
        .run(
            vec![TaskDescriptor::new(true), TaskDescriptor::new(false)],
            |ctx: TaskContext<bool>| async move {
                if *ctx.payload {
                    std::future::pending::<()>().await;
                }
                Ok::<(), ErrorClass>(())
            },
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let hung = results.iter().find(|r| r.task_id == TaskId(0)).unwrap();
    assert_eq!(hung.status, TaskStatus::Failed);
    assert_eq!(hung.error_class, Some(ErrorClass::Timeout));
    let next = results.iter().find(|r| r.task_id == TaskId(1)).unwrap();
    assert_eq!(next.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn group_spacing_holds_back_only_that_group() {
    init_logger();
    let spacing = Duration::from_millis(150);
    let executor = TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(3)
            .group_spacing(Some(spacing))
            .poll_interval(Duration::from_millis(10))
            .build(),
    );
    let starts = Arc::new(Mutex::new(Vec::new()));

    let work = {
        let starts = Arc::clone(&starts);
        move |ctx: TaskContext<()>| {
            starts
                .lock()
                .unwrap()
                .push((ctx.group_key.clone().unwrap_or_default(), Instant::now()));
            async { Ok::<(), ErrorClass>(()) }
        }
    };

    let tasks = ["a", "a", "b", "a"]
        .into_iter()
        .map(|g| TaskDescriptor::new(()).with_group(g))
        .collect();
    let results = executor.run(tasks, work).await.unwrap();
    assert_eq!(results.len(), 4);

    let starts = starts.lock().unwrap();
    let a: Vec<Instant> = starts.iter().filter(|(g, _)| g == "a").map(|(_, t)| *t).collect();
    let b: Vec<Instant> = starts.iter().filter(|(g, _)| g == "b").map(|(_, t)| *t).collect();
    assert_eq!(a.len(), 3);
    for pair in a.windows(2) {
        assert!(pair[1] - pair[0] >= spacing - Duration::from_millis(10));
    }
    // "b" is not stuck behind the second "a".
    assert!(b[0] < a[1]);
}

#[tokio::test]
async fn cancellation_abandons_queued_and_lets_in_flight_finish() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(1).build());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let results = executor
        .run_until_cancelled(
            unit_tasks(5),
            |_: TaskContext<()>| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<(), ErrorClass>(())
            },
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    assert_eq!(
        results.iter().filter(|r| r.status == TaskStatus::Succeeded).count(),
        1
    );
    assert_eq!(
        results.iter().filter(|r| r.status == TaskStatus::Abandoned).count(),
        4
    );
}

#[tokio::test]
async fn one_batch_at_a_time() {
    init_logger();
    let executor = Arc::new(TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(1).build(),
    ));

    let first = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .run(unit_tasks(1), |_: TaskContext<()>| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<(), ErrorClass>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = executor
        .run(unit_tasks(1), |_: TaskContext<()>| async { Ok::<(), ErrorClass>(()) })
        .await;
    assert!(matches!(second, Err(ExecutorError::AlreadyRunning)));
    assert_eq!(first.await.unwrap().unwrap().len(), 1);

    // Free again once the first batch is done.
    let third = executor
        .run(unit_tasks(2), |_: TaskContext<()>| async { Ok::<(), ErrorClass>(()) })
        .await
        .unwrap();
    assert_eq!(third.len(), 2);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(2).build());
    executor
        .run(unit_tasks(3), |_: TaskContext<()>| async { Ok::<(), ErrorClass>(()) })
        .await
        .unwrap();
    assert_eq!(executor.stats().completed, 3);

    executor.cleanup();
    executor.cleanup();
    assert_eq!(executor.stats().completed, 0);

    // A cleaned-up executor still runs new batches.
    let results = executor
        .run(unit_tasks(2), |_: TaskContext<()>| async { Ok::<(), ErrorClass>(()) })
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.success));
}

#[tokio::test]
async fn cleanup_during_run_abandons_queued_tasks() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(1).build());

    let (results, ()) = tokio::join!(
        executor.run(unit_tasks(5), |_: TaskContext<()>| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), ErrorClass>(())
        }),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            executor.cleanup();
        }
    );

    let results = results.unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(
        results.iter().filter(|r| r.status == TaskStatus::Succeeded).count(),
        1
    );
    assert_eq!(
        results.iter().filter(|r| r.status == TaskStatus::Abandoned).count(),
        4
    );
    // Counters survive a cleanup that lands mid-run.
    assert_eq!(executor.stats().completed, 5);

    executor.cleanup();
    assert_eq!(executor.stats().completed, 0);
}

#[tokio::test]
async fn cleanup_right_after_start_is_not_lost() {
    init_logger();
    let executor = TaskExecutor::new(Arc::new(ProxyPool::default()), config(1).build());

    let (results, ()) = tokio::join!(
        executor.run(unit_tasks(4), |_: TaskContext<()>| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<(), ErrorClass>(())
        }),
        async {
            tokio::task::yield_now().await;
            executor.cleanup();
        }
    );

    let results = results.unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(
        results.iter().filter(|r| r.status == TaskStatus::Abandoned).count(),
        3
    );
}

#[tokio::test]
async fn progress_is_visible_while_running() {
    init_logger();
    let executor = TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(2)
            .progress_interval(Duration::from_millis(20))
            .build(),
    );

    let run = executor.run(unit_tasks(10), |_: TaskContext<()>| async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<(), ErrorClass>(())
    });
    tokio::pin!(run);

    let mut snapshots = Vec::new();
    let results = loop {
        tokio::select! {
            results = &mut run => break results.unwrap(),
            _ = tokio::time::sleep(Duration::from_millis(10)) => snapshots.push(executor.stats()),
        }
    };

    assert_eq!(results.len(), 10);
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|s| s.total == 10 && s.running <= 2));
    assert!(snapshots.iter().any(|s| s.completed > 0 && s.completed < 10));
    assert!(snapshots.windows(2).all(|w| w[0].completed <= w[1].completed));

    let done = executor.stats();
    assert_eq!(done.completed, 10);
    assert_eq!(done.running, 0);
    assert_eq!(done.success_rate, 1.0);
}

struct PanicOnDrop;

impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        panic!("attempt torn down badly");
    }
}

#[tokio::test]
async fn attempt_lost_on_teardown_still_yields_result() {
    init_logger();
    let executor = TaskExecutor::new(
        Arc::new(ProxyPool::default()),
        config(1)
            .task_timeout(Duration::from_millis(50))
            .build(),
    );

    let results = executor
        .run(
            vec![TaskDescriptor::new(true), TaskDescriptor::new(false)],
            |ctx: TaskContext<bool>| async move {
                if *ctx.payload {
                    let _guard = PanicOnDrop;
                    std::future::pending::<()>().await;
                }
                Ok::<(), ErrorClass>(())
            },
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let lost = results.iter().find(|r| r.task_id == TaskId(0)).unwrap();
    assert_eq!(lost.status, TaskStatus::Failed);
    assert_eq!(lost.error_class, Some(ErrorClass::Panicked));
    assert_eq!(lost.attempts, 1);
    let next = results.iter().find(|r| r.task_id == TaskId(1)).unwrap();
    assert!(next.success);
    assert_eq!(executor.stats().completed, 2);
}

#[tokio::test]
async fn proxy_preference_is_applied() {
    init_logger();
    let pool = Arc::new(ProxyPool::default());
    pool.add(vec![static_proxy(1)]);
    pool.add((1..=3).map(|n| {
        ProxyRecord::new_rotating(format!("10.1.0.{n}"), 9000 + n, "user", "pass", Duration::from_secs(600))
    }));
    let executor = TaskExecutor::new(
        Arc::clone(&pool),
        config(1)
            .proxy_policy(ProxyPolicy::Required)
            .proxy_preference(ProxySource::Static)
            .build(),
    );

    let results = executor
        .run(unit_tasks(8), |_: TaskContext<()>| async { Ok::<(), ErrorClass>(()) })
        .await
        .unwrap();
    let key = static_proxy(1).key();
    assert!(results.iter().all(|r| r.proxy_used.as_deref() == Some(key.as_str())));
}
