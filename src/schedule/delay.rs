use super::pump::{run_isolated, FrameReport, TaskKind};
use super::Task;

struct Delayed<C> {
    remaining: f32,
    task: Task<C>,
}

/// 残り時間つきの保留コールバック集合
///
/// 更新ループのスレッドだけが所有し、毎フレーム一度 [`DelaySet::tick`] する。
/// 残り時間は登録時に一度だけ設定され、以後は単調に減るだけ（一時停止・再設定なし）。
pub struct DelaySet<C> {
    entries: Vec<Delayed<C>>,
}

impl<C> DelaySet<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, delay_secs: f32, task: Task<C>) {
        self.entries.push(Delayed {
            remaining: delay_secs.max(0.0),
            task,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 全エントリの残り時間を `elapsed_secs` 減らし、0以下になったものを登録順に発火する
    ///
    /// 発火したエントリは削除される。発火中に追加されたエントリはこのtickの対象外。
    pub fn tick(&mut self, ctx: &mut C, elapsed_secs: f32) -> FrameReport {
        let elapsed = elapsed_secs.max(0.0);
        for entry in self.entries.iter_mut() {
            entry.remaining -= elapsed;
        }

        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.remaining <= 0.0);
        self.entries = pending;

        let mut report = FrameReport::default();
        for entry in expired {
            report.delayed_run += 1;
            if let Err(failure) = run_isolated(entry.task, ctx, TaskKind::Delayed) {
                report.failures.push(failure);
            }
        }
        report
    }
}

impl<C> Default for DelaySet<C> {
    fn default() -> Self {
        Self::new()
    }
}
