use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use super::channel::{CommandReceiver, Job};
use super::delay::DelaySet;
use super::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Immediate,
    Delayed,
}

/// 失敗したコールバックの記録
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: TaskKind,
    pub message: String,
}

/// 1フレーム分の実行結果
#[derive(Debug, Default)]
pub struct FrameReport {
    pub immediate_run: usize,
    pub delayed_run: usize,
    pub failures: Vec<TaskFailure>,
}

impl FrameReport {
    pub fn merge(&mut self, other: FrameReport) {
        self.immediate_run += other.immediate_run;
        self.delayed_run += other.delayed_run;
        self.failures.extend(other.failures);
    }
}

/// 1つのコールバックを隔離して実行する。Errもpanicも失敗として報告し、呼び出し元には伝播しない。
pub(crate) fn run_isolated<C>(
    task: Task<C>,
    ctx: &mut C,
    kind: TaskKind,
) -> Result<(), TaskFailure> {
    let message = match panic::catch_unwind(AssertUnwindSafe(|| task(ctx))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{e:#}"),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    warn!(?kind, "scheduled task failed: {}", message);
    Err(TaskFailure { kind, message })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// 毎フレームの駆動役
///
/// 順序は固定: 即時キューをすべてドレイン → 遅延セットをtick。
/// 同じフレームで期限を迎える遅延処理より、そのフレームまでに積まれた即時処理が先に走る。
pub struct FramePump<C> {
    receiver: CommandReceiver<C>,
    delays: DelaySet<C>,
}

impl<C> FramePump<C> {
    pub fn new(receiver: CommandReceiver<C>) -> Self {
        Self {
            receiver,
            delays: DelaySet::new(),
        }
    }

    /// 遅延処理の保留数
    pub fn pending_delayed(&self) -> usize {
        self.delays.len()
    }

    /// 即時キューをドレインする
    ///
    /// 到着済みの遅延処理はここで遅延セットへ移る。実行中に積まれた処理は次フレームに回る。
    pub fn drain(&mut self, ctx: &mut C) -> FrameReport {
        let mut report = FrameReport::default();
        for job in self.receiver.take_pending() {
            match job {
                Job::Immediate(task) => {
                    report.immediate_run += 1;
                    if let Err(failure) = run_isolated(task, ctx, TaskKind::Immediate) {
                        report.failures.push(failure);
                    }
                }
                Job::Delayed { delay_secs, task } => self.delays.insert(delay_secs, task),
            }
        }
        report
    }

    pub fn tick(&mut self, ctx: &mut C, elapsed_secs: f32) -> FrameReport {
        self.delays.tick(ctx, elapsed_secs)
    }

    /// 1フレーム分を実行: drain → tick
    pub fn run_frame(&mut self, ctx: &mut C, elapsed_secs: f32) -> FrameReport {
        let mut report = self.drain(ctx);
        report.merge(self.tick(ctx, elapsed_secs));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{command_channel, Scheduler};
    use std::thread;

    struct Ctx {
        log: Vec<String>,
        scheduler: Scheduler<Ctx>,
    }

    fn setup() -> (FramePump<Ctx>, Ctx) {
        let (scheduler, receiver) = command_channel();
        let ctx = Ctx {
            log: Vec::new(),
            scheduler,
        };
        (FramePump::new(receiver), ctx)
    }

    fn record(tag: &str) -> impl FnOnce(&mut Ctx) -> anyhow::Result<()> + Send + 'static {
        let tag = tag.to_string();
        move |ctx: &mut Ctx| {
            ctx.log.push(tag);
            Ok(())
        }
    }

    #[test]
    fn test_drain_fifo_across_threads() {
        let (mut pump, mut ctx) = setup();
        for tag in ["A", "B", "C"] {
            let scheduler = ctx.scheduler.clone();
            thread::spawn(move || scheduler.enqueue(record(tag)))
                .join()
                .unwrap();
        }

        let report = pump.run_frame(&mut ctx, 0.016);
        assert_eq!(ctx.log, vec!["A", "B", "C"]);
        assert_eq!(report.immediate_run, 3);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_concurrent_producers_all_delivered() {
        let (mut pump, mut ctx) = setup();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let scheduler = ctx.scheduler.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        scheduler.enqueue(record(&format!("{t}-{i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        pump.run_frame(&mut ctx, 0.016);
        assert_eq!(ctx.log.len(), 100);
        // 各スレッド内の順序は保たれる
        for t in 0..4 {
            let prefix = format!("{t}-");
            let own: Vec<&String> = ctx.log.iter().filter(|s| s.starts_with(&prefix)).collect();
            let expected: Vec<String> = (0..25).map(|i| format!("{t}-{i}")).collect();
            assert_eq!(own.len(), 25);
            assert!(own.iter().zip(expected.iter()).all(|(a, b)| *a == b));
        }
    }

    #[test]
    fn test_immediate_runs_before_expiring_delayed() {
        let (mut pump, mut ctx) = setup();
        ctx.scheduler.schedule(0.5, record("delayed"));
        pump.run_frame(&mut ctx, 0.25);
        assert!(ctx.log.is_empty());

        ctx.scheduler.enqueue(record("immediate"));
        pump.run_frame(&mut ctx, 0.25);
        assert_eq!(ctx.log, vec!["immediate", "delayed"]);
    }

    #[test]
    fn test_delayed_fires_once_at_cumulative_delay() {
        let (mut pump, mut ctx) = setup();
        ctx.scheduler.run_after_ms(1000, record("late"));

        let mut fired_at = Vec::new();
        for frame in 0..8 {
            let report = pump.run_frame(&mut ctx, 0.25);
            if report.delayed_run > 0 {
                fired_at.push(frame);
            }
        }
        // 0.25 × 4 = 1.0 で発火（フレーム番号3）
        assert_eq!(fired_at, vec![3]);
        assert_eq!(ctx.log, vec!["late"]);
        assert_eq!(pump.pending_delayed(), 0);
    }

    #[test]
    fn test_enqueue_during_drain_deferred_to_next_frame() {
        let (mut pump, mut ctx) = setup();
        ctx.scheduler.enqueue(|ctx: &mut Ctx| {
            ctx.log.push("first".to_string());
            ctx.scheduler.enqueue(record("second"));
            Ok(())
        });

        pump.run_frame(&mut ctx, 0.016);
        assert_eq!(ctx.log, vec!["first"]);
        pump.run_frame(&mut ctx, 0.016);
        assert_eq!(ctx.log, vec!["first", "second"]);
    }

    #[test]
    fn test_reentrant_schedule_starts_next_tick() {
        let (mut pump, mut ctx) = setup();
        ctx.scheduler.schedule(0.0, |ctx: &mut Ctx| {
            ctx.log.push("outer".to_string());
            ctx.scheduler.schedule(0.0, record("inner"));
            Ok(())
        });

        pump.run_frame(&mut ctx, 0.5);
        assert_eq!(ctx.log, vec!["outer"]);
        assert_eq!(pump.pending_delayed(), 0);

        pump.run_frame(&mut ctx, 0.5);
        assert_eq!(ctx.log, vec!["outer", "inner"]);
    }

    #[test]
    fn test_failing_and_panicking_tasks_are_isolated() {
        let (mut pump, mut ctx) = setup();
        ctx.scheduler.enqueue(record("before"));
        ctx.scheduler
            .enqueue(|_: &mut Ctx| -> anyhow::Result<()> { anyhow::bail!("calibration failed") });
        ctx.scheduler.enqueue(|_: &mut Ctx| -> anyhow::Result<()> { panic!("bad callback") });
        ctx.scheduler.enqueue(record("after"));

        let report = pump.run_frame(&mut ctx, 0.016);
        assert_eq!(ctx.log, vec!["before", "after"]);
        assert_eq!(report.immediate_run, 4);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].message.contains("calibration failed"));
        assert!(report.failures[1].message.contains("bad callback"));
        assert!(report.failures.iter().all(|f| f.kind == TaskKind::Immediate));
    }
}
