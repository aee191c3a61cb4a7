//! 外部スレッドから更新ループへの処理の受け渡し。
//!
//! プロデューサは [`Scheduler`] を複製して任意のスレッドから即時処理・遅延処理を
//! 積み、更新ループ側の [`FramePump`] が毎フレーム「即時キューのドレイン → 遅延セットの
//! tick」の順で実行する。コールバックはすべて更新ループのスレッドで実行される。

pub mod channel;
pub mod delay;
pub mod pump;

pub use channel::{command_channel, CommandReceiver, Scheduler};
pub use delay::DelaySet;
pub use pump::{FramePump, FrameReport, TaskFailure, TaskKind};

/// 更新ループ上で一度だけ実行される処理
///
/// 引数は更新ループが所有するコンテキスト。`C = ()` なら引数なしのコールバックと同じ。
pub type Task<C> = Box<dyn FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static>;
