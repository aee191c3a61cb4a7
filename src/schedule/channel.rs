use std::sync::mpsc::{self, Receiver, Sender};

use tracing::debug;

use super::Task;

/// チャネルを流れる作業単位
pub(crate) enum Job<C> {
    Immediate(Task<C>),
    Delayed { delay_secs: f32, task: Task<C> },
}

/// プロデューサ側ハンドル。任意のスレッドから複製して使う。
///
/// 送信はブロックせず失敗もしない（無制限キュー）。
pub struct Scheduler<C> {
    tx: Sender<Job<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: 'static> Scheduler<C> {
    /// 次のフレームのドレインで実行する処理を積む
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static,
    {
        self.push(Job::Immediate(Box::new(f)));
    }

    /// `delay_secs` 秒後に実行する処理を積む。取り消しはできない。
    pub fn schedule<F>(&self, delay_secs: f32, f: F)
    where
        F: FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static,
    {
        // NaNは0扱い（NaN.max(0.0) == 0.0）
        let delay_secs = delay_secs.max(0.0);
        self.push(Job::Delayed {
            delay_secs,
            task: Box::new(f),
        });
    }

    pub fn run_after_ms<F>(&self, ms: u32, f: F)
    where
        F: FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule(ms as f32 / 1000.0, f);
    }

    fn push(&self, job: Job<C>) {
        // 受信側が破棄済み = プロセス終了中。未実行のまま捨てる
        if self.tx.send(job).is_err() {
            debug!("update loop has shut down, dropping task");
        }
    }
}

/// 更新ループ側の受信口
pub struct CommandReceiver<C> {
    rx: Receiver<Job<C>>,
}

impl<C> CommandReceiver<C> {
    /// この時点までに届いているジョブを到着順にすべて取り出す
    pub(crate) fn take_pending(&self) -> Vec<Job<C>> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            jobs.push(job);
        }
        jobs
    }
}

/// 多プロデューサ・単一コンシューマのコマンドチャネルを作成
pub fn command_channel<C>() -> (Scheduler<C>, CommandReceiver<C>) {
    let (tx, rx) = mpsc::channel();
    (Scheduler { tx }, CommandReceiver { rx })
}
