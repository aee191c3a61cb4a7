//! 操作画面（別スレッド）から送られる名前付きコマンド。

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};

use crate::overlay::{AvatarBackend, DeviceUpdate, Overlay};
use crate::schedule::Scheduler;
use crate::settings::{
    Background, BlinkSettings, CameraKind, LipSyncSettings, LookTarget, StoredTransform,
};

/// ユーザーが起動できる操作
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Calibrate,
    EndCalibrate,
    ImportModel { path: PathBuf, for_calibration: bool },
    ChangeCamera(CameraKind),
    /// フリーカメラを動かした結果を記録する
    SetFreeCamera(StoredTransform),
    /// 正面・背面カメラの注視設定を記録する（Freeはエラー）
    SetLookTarget { camera: CameraKind, target: LookTarget },
    ShowGrid(bool),
    SetLipSync(LipSyncSettings),
    SetBlink(BlinkSettings),
    /// `custom` のときは色をカスタム色としても記録する
    ChangeBackground { background: Background, custom: bool },
    LoadSettings(PathBuf),
    SaveSettings(PathBuf),
}

/// 操作側スレッドのハンドル
///
/// コマンドは更新ループ上で [`Overlay::apply`] される。失敗はそのフレームのレポートに載る。
pub struct ControlSurface<B: AvatarBackend + 'static> {
    scheduler: Scheduler<Overlay<B>>,
}

impl<B: AvatarBackend + 'static> Clone for ControlSurface<B> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<B: AvatarBackend + 'static> ControlSurface<B> {
    pub fn new(scheduler: Scheduler<Overlay<B>>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler<Overlay<B>> {
        &self.scheduler
    }

    pub fn send(&self, command: ControlCommand) {
        self.scheduler.enqueue(move |overlay| overlay.apply(command));
    }

    /// `delay_secs` 秒後に実行する（キャリブレーションのカウントダウンなど）
    pub fn send_after(&self, delay_secs: f32, command: ControlCommand) {
        self.scheduler.schedule(delay_secs, move |overlay| overlay.apply(command));
    }

    /// 更新ループ上の現在のリップシンク設定を書き換えて反映する
    pub fn update_lip_sync<F>(&self, edit: F)
    where
        F: FnOnce(&mut LipSyncSettings) + Send + 'static,
    {
        self.scheduler.enqueue(move |overlay| {
            let mut lip_sync = overlay.settings().lip_sync.clone();
            edit(&mut lip_sync);
            overlay.apply(ControlCommand::SetLipSync(lip_sync))
        });
    }

    /// 更新ループ上の現在のまばたき設定を書き換えて反映する
    pub fn update_blink<F>(&self, edit: F)
    where
        F: FnOnce(&mut BlinkSettings) + Send + 'static,
    {
        self.scheduler.enqueue(move |overlay| {
            let mut blink = overlay.settings().blink.clone();
            edit(&mut blink);
            overlay.apply(ControlCommand::SetBlink(blink))
        });
    }

    /// マイク一覧を問い合わせる。結果は次のフレームで届く
    pub fn lip_sync_devices(&self) -> Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel();
        self.scheduler.enqueue(move |overlay| {
            // 問い合わせ側が待つのをやめていても構わない
            let _ = tx.send(overlay.lip_sync_devices());
            Ok(())
        });
        rx
    }

    pub fn update_device(&self, update: DeviceUpdate) {
        self.scheduler.enqueue(move |overlay| {
            overlay.apply_device(update);
            Ok(())
        });
    }
}
