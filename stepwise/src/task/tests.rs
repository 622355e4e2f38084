use crate::error::{Error, JoinError};
use crate::runtime::{Builder, Runtime};
use crate::task::{Control, JoinHandle, SubControl};
use crate::Script;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Control: Send, Sync, Clone);
assert_impl_all!(SubControl: Send, Sync, Clone);
assert_impl_all!(JoinHandle<String>: Send, Sync);
assert_impl_all!(Script: Send);
assert_impl_all!(Runtime: Send, Sync, Clone);

const MAX_STEPS: usize = 100_000;

fn drive(script: &mut Script, tick: Duration) -> Result<usize> {
    let mut steps = 0;
    while !script.is_done() {
        if steps == MAX_STEPS {
            bail!("script still running after {} steps", MAX_STEPS);
        }
        if !tick.is_zero() {
            std::thread::sleep(tick);
        }
        script.step()?;
        steps += 1;
    }
    Ok(steps)
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn count_up(ctl: &Control, n: usize, counter: &AtomicUsize) -> Result<()> {
    for _ in 0..n {
        ctl.yield_now()?;
        counter.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

fn sum_below(ctl: &Control, n: usize) -> Result<usize> {
    let mut sum = 0;
    for i in 0..n {
        sum += i;
        ctl.yield_now()?;
    }
    Ok(sum)
}

#[test]
fn test_async_children_with_counters() -> Result<()> {
    let count = counter();
    let sum = counter();

    let mut script = {
        let count = Arc::clone(&count);
        let sum = Arc::clone(&sum);

        Script::start(move |ctl| {
            let c = Arc::clone(&count);
            let task1 = ctl.start_async_with(10, move |ctl, n| count_up(ctl, n, &c));
            task1.join(ctl)?;
            assert_eq!(count.load(Ordering::SeqCst), 10);

            let c = Arc::clone(&count);
            let task2 = ctl.start_async_with(50, move |ctl, n| count_up(ctl, n, &c));
            let s = Arc::clone(&sum);
            let task3 = ctl.start_async(move |ctl| {
                for i in 0..30 {
                    ctl.yield_now()?;
                    s.fetch_add(i, Ordering::SeqCst);
                }
                Ok(())
            });

            task2.join(ctl)?;
            task3.join(ctl)?;
            assert_eq!(count.load(Ordering::SeqCst), 60);

            // Same body, this time inline.
            count_up(ctl, 50, &count)?;

            ctl.cancel();
            Ok(())
        })?
    };

    drive(&mut script, Duration::ZERO)?;

    assert_eq!(sum.load(Ordering::SeqCst), 435);
    assert_eq!(count.load(Ordering::SeqCst), 110);
    Ok(())
}

#[test]
fn test_join_collects_results() -> Result<()> {
    let total = counter();

    let mut script = {
        let total = Arc::clone(&total);
        Script::start(move |ctl| {
            let x = ctl.start_async_with(10, sum_below);
            let y = ctl.start_async_with(20, sum_below);
            let z = ctl.start_async_with(30, |ctl, n| Ok(ctl.delay(n)?));

            // Inline and async runs agree.
            let inline = sum_below(ctl, 20)?;

            let (x, y) = (x.join(ctl)?, y.join(ctl)?);
            z.join(ctl)?;

            assert_eq!(inline, y);
            total.store(x + y, Ordering::SeqCst);
            Ok(())
        })?
    };

    drive(&mut script, Duration::ZERO)?;
    assert_eq!(total.load(Ordering::SeqCst), 235);
    Ok(())
}

#[test]
fn test_child_starts_within_spawning_step() -> Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut script = {
        let log = Arc::clone(&log);
        Script::start(move |ctl| {
            let child_log = Arc::clone(&log);
            ctl.start_async(move |ctl| {
                child_log.lock().push("child");
                ctl.yield_now()?;
                child_log.lock().push("child again");
                Ok(())
            });
            log.lock().push("parent");
            ctl.yield_now()?;
            log.lock().push("parent again");
            ctl.yield_now()?;
            Ok(())
        })?
    };

    script.step()?;
    assert_eq!(*log.lock(), ["parent", "child"]);

    script.step()?;
    assert_eq!(*log.lock(), ["parent", "child", "parent again", "child again"]);
    Ok(())
}

#[test]
fn test_run_on_update_runs_on_driver_thread() -> Result<()> {
    let driver = std::thread::current().id();
    let calls = counter();

    let mut script = {
        let calls = Arc::clone(&calls);
        Script::start(move |ctl| {
            let calls = Arc::clone(&calls);
            let (thread, value) = ctl.run_on_update(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                (std::thread::current().id(), 7)
            })?;

            assert_eq!(thread, driver);
            assert_ne!(std::thread::current().id(), driver);
            assert_eq!(value, 7);
            Ok(())
        })?
    };

    let steps = drive(&mut script, Duration::ZERO)?;
    assert_eq!(steps, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_run_on_update_dropped_on_cancel() -> Result<()> {
    let calls = counter();
    let interrupted = Arc::new(AtomicBool::new(false));

    let mut script = {
        let calls = Arc::clone(&calls);
        let interrupted = Arc::clone(&interrupted);
        Script::start(move |ctl| {
            ctl.cancel();

            let calls = Arc::clone(&calls);
            let res = ctl.run_on_update(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });

            interrupted.store(res.is_err() && ctl.is_cancelled(), Ordering::SeqCst);
            res?;
            Ok(())
        })?
    };

    drive(&mut script, Duration::ZERO)?;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(interrupted.load(Ordering::SeqCst));
    Ok(())
}

#[rstest]
#[case::short(Duration::from_millis(5))]
#[case::long(Duration::from_millis(25))]
fn test_sleep_lower_bound(#[case] duration: Duration) -> Result<()> {
    let slept = Arc::new(Mutex::new(None));

    let mut script = {
        let slept = Arc::clone(&slept);
        Script::start(move |ctl| {
            let start = Instant::now();
            ctl.sleep(duration)?;
            *slept.lock() = Some(start.elapsed());
            Ok(())
        })?
    };

    let start = Instant::now();
    drive(&mut script, Duration::from_millis(1))?;

    assert!(start.elapsed() >= duration);
    let Some(slept) = *slept.lock() else {
        bail!("sleep never finished");
    };
    assert!(slept >= duration);
    Ok(())
}

#[test]
fn test_yield_until_and_while_flag() -> Result<()> {
    let flag = Arc::new(AtomicBool::new(false));
    let stage = counter();

    let mut script = {
        let flag = Arc::clone(&flag);
        let stage = Arc::clone(&stage);
        Script::start(move |ctl| {
            ctl.yield_until_flag(&flag)?;
            stage.store(1, Ordering::SeqCst);
            ctl.yield_while_flag(&flag)?;
            stage.store(2, Ordering::SeqCst);
            Ok(())
        })?
    };

    for _ in 0..3 {
        script.step()?;
        assert_eq!(stage.load(Ordering::SeqCst), 0);
    }

    flag.store(true, Ordering::SeqCst);
    script.step()?;
    script.step()?;
    assert_eq!(stage.load(Ordering::SeqCst), 1);

    flag.store(false, Ordering::SeqCst);
    script.step()?;
    assert_eq!(stage.load(Ordering::SeqCst), 2);
    assert!(script.is_done());
    Ok(())
}

#[rstest]
#[case::never(0, 1)]
#[case::three_times(3, 4)]
fn test_yield_while_checks_before_yielding(
    #[case] yields: usize,
    #[case] expected_steps: usize,
) -> Result<()> {
    let mut script = Script::start(move |ctl| {
        let mut checks = 0;
        ctl.yield_while(|| {
            checks += 1;
            checks <= yields
        })?;

        let mut left = yields;
        ctl.yield_until(|| {
            let done = left == 0;
            left = left.saturating_sub(1);
            done
        })?;
        Ok(())
    })?;

    let steps = drive(&mut script, Duration::ZERO)?;
    assert_eq!(steps, expected_steps + yields);
    Ok(())
}

#[test]
fn test_delay_and_sleep_children() -> Result<()> {
    let leaked = counter();
    let finished = Arc::new(AtomicBool::new(false));

    let mut script = {
        let leaked = Arc::clone(&leaked);
        let finished = Arc::clone(&finished);
        Script::start(move |ctl| {
            for i in 0..20 {
                ctl.start_async(move |ctl| Ok(ctl.delay((i + 1) * 10_000)?));
            }

            ctl.sleep_async(Duration::from_millis(2)).join(ctl)?;
            ctl.sleep_async(Duration::from_secs(10_000)).cancel();

            ctl.delay_async(2).join(ctl)?;
            ctl.delay_async(1_000_000).cancel();

            let leaked = Arc::clone(&leaked);
            let task = ctl.start_async(move |ctl| {
                ctl.delay_async(1_000_000).join(ctl)?;
                leaked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

            ctl.delay(20)?;
            task.cancel();
            assert!(matches!(task.join(ctl), Err(JoinError::Cancelled)));

            ctl.delay(5)?;
            finished.store(true, Ordering::SeqCst);
            Ok(())
        })?
    };

    let start = Instant::now();
    drive(&mut script, Duration::from_millis(1))?;

    assert!(start.elapsed() >= Duration::from_millis(2));
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(leaked.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_child_failures_reach_join() -> Result<()> {
    let checked = Arc::new(AtomicBool::new(false));

    let mut script = {
        let checked = Arc::clone(&checked);
        Script::start(move |ctl| {
            let failing = ctl.start_async::<u32, _>(|ctl| {
                ctl.yield_now()?;
                bail!("boom")
            });
            match failing.join(ctl) {
                Err(JoinError::Failed(err)) => assert_eq!(err.to_string(), "boom"),
                other => panic!("unexpected join outcome: {:?}", other),
            }

            let panicking = ctl.start_async::<u32, _>(|_| panic!("kaboom"));
            match panicking.join(ctl) {
                Err(JoinError::Panicked(msg)) => assert_eq!(msg, "kaboom"),
                other => panic!("unexpected join outcome: {:?}", other),
            }

            checked.store(true, Ordering::SeqCst);
            Ok(())
        })?
    };

    // A failing child does not fail its parent.
    drive(&mut script, Duration::ZERO)?;
    assert!(checked.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_join_interrupted_by_own_cancellation() -> Result<()> {
    let outcome = Arc::new(Mutex::new(None));

    let mut script = {
        let outcome = Arc::clone(&outcome);
        Script::start(move |ctl| {
            let child = ctl.start_async::<(), _>(|ctl| {
                ctl.abyss()?;
                Ok(())
            });
            ctl.yield_now()?;

            ctl.cancel();
            let res = child.join(ctl);
            let interrupted = matches!(res, Err(JoinError::Interrupted(_)));
            *outcome.lock() = Some(interrupted);
            res?;
            Ok(())
        })?
    };

    drive(&mut script, Duration::ZERO)?;
    assert_eq!(*outcome.lock(), Some(true));
    Ok(())
}

#[test]
fn test_sub_control_restart_and_transition() -> Result<()> {
    let runs = counter();
    let transitioned = counter();

    let mut script = {
        let runs = Arc::clone(&runs);
        let transitioned = Arc::clone(&transitioned);
        Script::start(move |ctl| {
            let r = Arc::clone(&runs);
            let handle = ctl.start_async::<(), _>(move |ctl| {
                r.fetch_add(1, Ordering::SeqCst);
                ctl.abyss()?;
                Ok(())
            });
            let sub = handle.sub_control().clone();

            ctl.yield_now()?;
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert!(sub.is_running());

            sub.restart();
            ctl.yield_now()?;
            assert_eq!(runs.load(Ordering::SeqCst), 2);

            let t = Arc::clone(&transitioned);
            sub.transition(move |ctl| {
                t.fetch_add(1, Ordering::SeqCst);
                ctl.abyss()?;
                Ok(())
            });
            ctl.yield_now()?;
            assert_eq!(runs.load(Ordering::SeqCst), 2);
            assert_eq!(transitioned.load(Ordering::SeqCst), 1);

            handle.cancel();
            sub.wait(ctl)?;
            assert!(sub.is_done());
            assert!(!sub.is_running());

            // Stale handle, the record went back to the pool.
            sub.restart();
            ctl.delay(2)?;
            assert_eq!(runs.load(Ordering::SeqCst), 2);
            assert_eq!(transitioned.load(Ordering::SeqCst), 1);
            Ok(())
        })?
    };

    drive(&mut script, Duration::ZERO)?;
    Ok(())
}

#[test]
fn test_children_recycle_records() -> Result<()> {
    let rt = Builder::new().prealloc(0).build()?;

    let mut script = rt.start(|ctl| {
        for n in 1..=5 {
            let sum = ctl.start_async_with(n, sum_below).join(ctl)?;
            assert_eq!(sum, n * (n - 1) / 2);
        }
        Ok(())
    })?;

    drive(&mut script, Duration::ZERO)?;

    // The root and one child record, reused by each sequential child.
    assert_eq!(rt.total_tasks(), 2);
    assert_eq!(rt.idle_tasks(), 1);
    Ok(())
}

#[test]
fn test_child_failure_does_not_leak_into_step() -> Result<()> {
    let mut script = Script::start(|ctl| {
        ctl.start_async::<(), _>(|_| bail!("nobody is listening"));
        ctl.delay(3)?;
        Ok(())
    })?;

    for _ in 0..4 {
        match script.step() {
            Ok(()) => {}
            Err(Error::Failed(err)) => bail!("child failure surfaced in step: {}", err),
            Err(err) => return Err(err.into()),
        }
    }
    assert!(script.is_done());
    Ok(())
}

#[rstest]
#[case::error(false)]
#[case::panic(true)]
fn test_transitioned_child_failure_reaches_join(#[case] panics: bool) -> Result<()> {
    let outcome = Arc::new(Mutex::new(None));

    let mut script = {
        let outcome = Arc::clone(&outcome);
        Script::start(move |ctl| {
            let child = ctl.start_async::<(), _>(|ctl| {
                ctl.abyss()?;
                Ok(())
            });
            ctl.yield_now()?;

            child.sub_control().transition(move |ctl| {
                ctl.yield_now()?;
                if panics {
                    panic!("child boom");
                }
                bail!("child boom")
            });

            let seen = match child.join(ctl) {
                Err(JoinError::Failed(err)) => format!("failed: {}", err),
                Err(JoinError::Panicked(msg)) => format!("panicked: {}", msg),
                Err(err) => format!("other: {}", err),
                Ok(()) => "ok".to_string(),
            };
            *outcome.lock() = Some(seen);
            Ok(())
        })?
    };

    // Any child failure leaking into the root's step aborts the drive.
    drive(&mut script, Duration::ZERO)?;

    let expected = if panics {
        "panicked: child boom"
    } else {
        "failed: child boom"
    };
    assert_eq!(outcome.lock().as_deref(), Some(expected));
    Ok(())
}

#[test]
fn test_child_transitioning_itself_keeps_reporting() -> Result<()> {
    let mut script = Script::start(|ctl| {
        let child = ctl.start_async::<(), _>(|ctl| {
            ctl.transition(|_| bail!("second life"));
            ctl.abyss()?;
            Ok(())
        });

        match child.join(ctl) {
            Err(JoinError::Failed(err)) => assert_eq!(err.to_string(), "second life"),
            _ => bail!("failure of the new body did not reach join"),
        }
        Ok(())
    })?;

    drive(&mut script, Duration::ZERO)?;
    Ok(())
}

#[test]
fn test_requests_from_another_thread_during_step() -> Result<()> {
    let barrier = Arc::new(Barrier::new(2));
    let handles = Arc::new(Mutex::new(None));
    let (a_runs, b_runs, c_runs) = (counter(), counter(), counter());

    let mut script = {
        let barrier = Arc::clone(&barrier);
        let handles = Arc::clone(&handles);
        let a_runs = Arc::clone(&a_runs);
        let c_runs = Arc::clone(&c_runs);
        Script::start(move |ctl| {
            // Holds its second run open until the other thread is done.
            let barrier = Arc::clone(&barrier);
            let runs = Arc::clone(&a_runs);
            let a = ctl.start_async::<(), _>(move |ctl| loop {
                if runs.fetch_add(1, Ordering::SeqCst) == 1 {
                    barrier.wait();
                    barrier.wait();
                }
                ctl.yield_now()?;
            });

            let runs = Arc::clone(&c_runs);
            let c = ctl.start_async::<(), _>(move |ctl| loop {
                runs.fetch_add(1, Ordering::SeqCst);
                ctl.yield_now()?;
            });

            *handles.lock() = Some((
                ctl.clone(),
                a.sub_control().clone(),
                c.sub_control().clone(),
            ));
            ctl.abyss()?;
            Ok(())
        })?
    };

    let other = {
        let barrier = Arc::clone(&barrier);
        let handles = Arc::clone(&handles);
        let b_runs = Arc::clone(&b_runs);
        thread::spawn(move || {
            barrier.wait();
            let (root, a, c) = handles.lock().take().expect("handles published");
            a.cancel();
            c.cancel();
            let b = root.start_async::<(), _>(move |ctl| loop {
                b_runs.fetch_add(1, Ordering::SeqCst);
                ctl.yield_now()?;
            });
            barrier.wait();
            (a, b, c)
        })
    };

    let runs = || {
        (
            a_runs.load(Ordering::SeqCst),
            b_runs.load(Ordering::SeqCst),
            c_runs.load(Ordering::SeqCst),
        )
    };

    script.step()?;
    assert_eq!(runs(), (1, 0, 1));

    // The other thread acts while `a` is parked inside this step.
    script.step()?;
    let (a, b, c) = other.join().expect("requesting thread panicked");

    // `a` was mid-run, its cancellation waits for the next step. `c` was not
    // visited yet and is cancelled right away. `b` joined after the walk
    // started and gets its first run next step.
    assert_eq!(runs(), (2, 0, 1));
    assert!(a.is_running());
    assert!(c.is_done());
    assert!(!b.is_done());

    script.step()?;
    assert_eq!(runs(), (2, 1, 1));
    assert!(a.is_done());

    script.step()?;
    assert_eq!(runs(), (2, 2, 1));

    script.cancel();
    script.step()?;
    assert!(script.is_done());
    assert!(b.is_done());
    Ok(())
}

#[test]
fn test_spawning_from_another_thread_races_the_walk() -> Result<()> {
    const SPAWNED: usize = 32;

    let step = counter();
    let root = Arc::new(Mutex::new(None));

    let mut script = {
        let root = Arc::clone(&root);
        Script::start(move |ctl| {
            *root.lock() = Some(ctl.clone());
            ctl.abyss()?;
            Ok(())
        })?
    };
    step.fetch_add(1, Ordering::SeqCst);
    script.step()?;

    let ctl = root.lock().take().expect("root control published");
    let spawner = {
        let step = Arc::clone(&step);
        thread::spawn(move || {
            (0..SPAWNED)
                .map(|_| {
                    let visits = Arc::new(Mutex::new(Vec::new()));
                    let seen = Arc::clone(&visits);
                    let step = Arc::clone(&step);
                    let handle = ctl.start_async::<(), _>(move |ctl| loop {
                        seen.lock().push(step.load(Ordering::SeqCst));
                        ctl.yield_now()?;
                    });
                    thread::yield_now();
                    (handle, visits)
                })
                .collect::<Vec<_>>()
        })
    };

    while !spawner.is_finished() {
        step.fetch_add(1, Ordering::SeqCst);
        script.step()?;
    }
    for _ in 0..3 {
        step.fetch_add(1, Ordering::SeqCst);
        script.step()?;
    }

    let children = spawner.join().expect("spawning thread panicked");
    let last = step.load(Ordering::SeqCst);
    assert_eq!(children.len(), SPAWNED);

    for (_, visits) in &children {
        let visits = visits.lock();
        // One run per step from the first one on, none twice, none skipped.
        assert!(!visits.is_empty());
        assert!(visits.windows(2).all(|w| w[1] == w[0] + 1), "{:?}", visits);
        assert_eq!(visits.last().copied(), Some(last));
    }

    script.cancel();
    script.step()?;
    assert!(script.is_done());
    assert!(children.iter().all(|(handle, _)| handle.is_done()));
    Ok(())
}

#[test]
fn test_log_respects_tracing_switch() -> Result<()> {
    let rt = Builder::new().prealloc(1).trace(true).build()?;
    assert!(rt.is_tracing());

    let mut script = rt.start(|ctl| {
        ctl.log(format_args!("hello from {}", ctl.id()));
        ctl.yield_now()?;
        ctl.log("still here");
        Ok(())
    })?;

    script.step()?;
    rt.set_tracing(false);
    assert!(!rt.is_tracing());
    script.log("driver side");
    script.step()?;
    assert!(script.is_done());
    Ok(())
}

#[test]
fn test_ids_differ_across_leases() -> Result<()> {
    let rt = Builder::new().prealloc(1).build()?;

    let first = rt.create()?;
    let first_id = first.id();
    drop(first);

    let second = rt.create()?;
    assert_ne!(second.id(), first_id);
    assert_eq!(rt.total_tasks(), 1);
    Ok(())
}
