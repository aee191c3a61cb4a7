//! 更新ループが所有する状態と、外部コンポーネントへの窓口。

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::control::ControlCommand;
use crate::pose::{Tracker, TrackerId, TrackerPose};
use crate::settings::{
    Background, BlinkSettings, CameraKind, LipSyncSettings, LookTarget, Settings, StoredTransform,
};
use crate::tracker::{Calibrator, IkRig, RoleAssignment, TrackerSet};

/// デバイスの種類（割り当て前の申告）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Head,
    LeftController,
    RightController,
    Tracker,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceUpdate {
    Pose {
        id: TrackerId,
        kind: DeviceKind,
        pose: TrackerPose,
    },
    Lost {
        id: TrackerId,
    },
}

/// 各デバイスの最新姿勢
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<TrackerId, (DeviceKind, TrackerPose)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: DeviceUpdate) {
        match update {
            DeviceUpdate::Pose { id, kind, pose } => {
                self.devices.insert(id, (kind, pose));
            }
            DeviceUpdate::Lost { id } => {
                self.devices.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn first_of(&self, kind: DeviceKind) -> Option<Tracker> {
        self.devices
            .iter()
            .find(|(_, (k, _))| *k == kind)
            .map(|(id, (_, pose))| Tracker::new(*id, *pose))
    }

    /// キャリブレーション用のスナップショット。汎用トラッカーはID順
    pub fn snapshot(&self) -> Result<TrackerSet> {
        let head = self.first_of(DeviceKind::Head).context("head is not tracked")?;
        let left = self
            .first_of(DeviceKind::LeftController)
            .context("left controller is not tracked")?;
        let right = self
            .first_of(DeviceKind::RightController)
            .context("right controller is not tracked")?;
        let trackers = self
            .devices
            .iter()
            .filter(|(_, (k, _))| *k == DeviceKind::Tracker)
            .map(|(id, (_, pose))| Tracker::new(*id, *pose))
            .collect();
        Ok(TrackerSet {
            head,
            controllers: [left, right],
            trackers,
        })
    }
}

/// 描画・モデル読み込み・IKソルバーなど、コア外のコンポーネント
pub trait AvatarBackend {
    type Rig: IkRig;

    fn import_model(&mut self, path: &Path) -> Result<()>;

    /// 読み込み済みモデルのIKリグ
    fn rig_mut(&mut self) -> Option<&mut Self::Rig>;

    fn show_calibration_view(&mut self, visible: bool);

    fn set_camera(&mut self, camera: CameraKind);

    /// フリーカメラの位置・回転
    fn set_free_camera(&mut self, transform: &StoredTransform);

    /// 正面・背面カメラの注視設定（`camera` は Front か Back）
    fn set_look_target(&mut self, camera: CameraKind, target: &LookTarget);

    /// 構図用グリッドの表示
    fn show_grid(&mut self, visible: bool);

    fn set_background(&mut self, background: &Background);

    /// リップシンクに使えるマイク
    fn lip_sync_devices(&self) -> Vec<String>;

    fn set_lip_sync(&mut self, settings: &LipSyncSettings);

    fn set_blink(&mut self, settings: &BlinkSettings);
}

/// 更新ループのコンテキスト。スケジュールされた処理はすべてこれを受け取る
pub struct Overlay<B: AvatarBackend> {
    backend: B,
    settings: Settings,
    calibrator: Calibrator,
    devices: DeviceRegistry,
    calibrating: bool,
}

impl<B: AvatarBackend> Overlay<B> {
    pub fn new(backend: B, calibrator: Calibrator) -> Self {
        Self {
            backend,
            settings: Settings::default(),
            calibrator,
            devices: DeviceRegistry::new(),
            calibrating: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    pub fn current_assignment(&self) -> Option<&RoleAssignment> {
        self.calibrator.current()
    }

    pub fn lip_sync_devices(&self) -> Vec<String> {
        self.backend.lip_sync_devices()
    }

    pub fn apply_device(&mut self, update: DeviceUpdate) {
        self.devices.apply(update);
    }

    pub fn apply(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Calibrate => self.calibrate(),
            ControlCommand::EndCalibrate => {
                self.backend.show_calibration_view(false);
                self.calibrating = false;
                Ok(())
            }
            ControlCommand::ImportModel { path, for_calibration } => {
                self.import_model(&path)?;
                if for_calibration {
                    self.backend.show_calibration_view(true);
                    self.calibrating = true;
                }
                Ok(())
            }
            ControlCommand::ChangeCamera(camera) => {
                self.backend.set_camera(camera);
                self.settings.camera = Some(camera);
                Ok(())
            }
            ControlCommand::SetFreeCamera(transform) => {
                self.backend.set_free_camera(&transform);
                self.settings.free_camera = Some(transform);
                Ok(())
            }
            ControlCommand::SetLookTarget { camera, target } => {
                match camera {
                    CameraKind::Front => self.settings.front_camera_look_target = Some(target),
                    CameraKind::Back => self.settings.back_camera_look_target = Some(target),
                    CameraKind::Free => bail!("free camera has no look target"),
                }
                self.backend.set_look_target(camera, &target);
                Ok(())
            }
            ControlCommand::ShowGrid(visible) => {
                self.backend.show_grid(visible);
                self.settings.show_camera_grid = visible;
                Ok(())
            }
            ControlCommand::SetLipSync(lip_sync) => {
                let lip_sync = lip_sync.sanitized();
                self.backend.set_lip_sync(&lip_sync);
                self.settings.lip_sync = lip_sync;
                Ok(())
            }
            ControlCommand::SetBlink(blink) => {
                self.backend.set_blink(&blink);
                self.settings.blink = blink;
                Ok(())
            }
            ControlCommand::ChangeBackground { background, custom } => {
                self.change_background(background, custom);
                Ok(())
            }
            ControlCommand::LoadSettings(path) => {
                let settings = Settings::load(&path)?;
                info!("settings loaded from {}", path.display());
                self.load_settings(settings)
            }
            ControlCommand::SaveSettings(path) => {
                self.settings.save(&path)?;
                info!("settings saved to {}", path.display());
                Ok(())
            }
        }
    }

    /// 現在のデバイスで分類し、モデルのIKリグをキャリブレーションする
    ///
    /// 成功時のみ割り当てと保存用トラッカー変換を更新する。
    pub fn calibrate(&mut self) -> Result<()> {
        let rig = self.backend.rig_mut().context("no model loaded, cannot calibrate")?;
        let set = self.devices.snapshot().context("calibration needs head and both controllers")?;
        let assignment = self.calibrator.calibrate(rig, &set)?;
        self.settings.store_assignment(assignment);
        Ok(())
    }

    fn import_model(&mut self, path: &Path) -> Result<()> {
        self.backend
            .import_model(path)
            .with_context(|| format!("Failed to import model {}", path.display()))?;
        self.settings.model_path = Some(path.to_path_buf());
        Ok(())
    }

    fn change_background(&mut self, background: Background, custom: bool) {
        self.backend.set_background(&background);
        if let (Background::Color { rgb }, true) = (background, custom) {
            self.settings.custom_background = Some(rgb);
        }
        self.settings.background = background;
    }

    /// 設定を置き換え、各項目を外部コンポーネントに反映し直す
    ///
    /// モデルの読み込みに失敗しても他の項目は反映し、最後にエラーを返す。
    pub fn load_settings(&mut self, settings: Settings) -> Result<()> {
        let model_path = settings.model_path.clone();
        self.settings = settings;

        let model_result = match model_path {
            Some(path) => self.import_model(&path),
            None => Ok(()),
        };
        if let Err(e) = &model_result {
            warn!("{:#}", e);
        }

        self.backend.set_background(&self.settings.background);
        if let Some(transform) = &self.settings.free_camera {
            self.backend.set_free_camera(transform);
        }
        if let Some(target) = &self.settings.front_camera_look_target {
            self.backend.set_look_target(CameraKind::Front, target);
        }
        if let Some(target) = &self.settings.back_camera_look_target {
            self.backend.set_look_target(CameraKind::Back, target);
        }
        if let Some(camera) = self.settings.camera {
            self.backend.set_camera(camera);
        }
        self.backend.show_grid(self.settings.show_camera_grid);
        self.settings.lip_sync = self.settings.lip_sync.clone().sanitized();
        self.backend.set_lip_sync(&self.settings.lip_sync);
        self.backend.set_blink(&self.settings.blink);

        model_result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracker::calibrate::tests::MockRig;
    use crate::tracker::Role;
    use std::path::PathBuf;

    #[derive(Debug, Default)]
    pub(crate) struct MockBackend {
        pub rig: Option<MockRig>,
        pub calls: Vec<String>,
        pub calibration_view: bool,
        pub fail_import: bool,
    }

    impl AvatarBackend for MockBackend {
        type Rig = MockRig;

        fn import_model(&mut self, path: &Path) -> Result<()> {
            self.calls.push(format!("import {}", path.display()));
            if self.fail_import {
                anyhow::bail!("broken model file");
            }
            self.rig = Some(MockRig::new());
            Ok(())
        }

        fn rig_mut(&mut self) -> Option<&mut MockRig> {
            self.rig.as_mut()
        }

        fn show_calibration_view(&mut self, visible: bool) {
            self.calibration_view = visible;
        }

        fn set_camera(&mut self, camera: CameraKind) {
            self.calls.push(format!("camera {:?}", camera));
        }

        fn set_free_camera(&mut self, transform: &StoredTransform) {
            self.calls.push(format!("free_camera {:?}", transform.position));
        }

        fn set_look_target(&mut self, camera: CameraKind, target: &LookTarget) {
            self.calls.push(format!("look_target {:?} distance={}", camera, target.distance));
        }

        fn show_grid(&mut self, visible: bool) {
            self.calls.push(format!("grid {}", visible));
        }

        fn lip_sync_devices(&self) -> Vec<String> {
            vec!["Built-in Microphone".to_string(), "USB Audio".to_string()]
        }

        fn set_background(&mut self, background: &Background) {
            self.calls.push(format!("background {:?}", background));
        }

        fn set_lip_sync(&mut self, settings: &LipSyncSettings) {
            self.calls.push(format!("lip_sync gain={}", settings.gain));
        }

        fn set_blink(&mut self, settings: &BlinkSettings) {
            self.calls.push(format!("blink auto={}", settings.auto_blink));
        }
    }

    fn pose(x: f32, y: f32) -> TrackerPose {
        TrackerPose::new([x, y, 0.0], [0.0, 0.0, 0.0, 1.0])
    }

    pub(crate) fn track(
        overlay: &mut Overlay<MockBackend>,
        id: u32,
        kind: DeviceKind,
        x: f32,
        y: f32,
    ) {
        overlay.apply_device(DeviceUpdate::Pose {
            id: TrackerId(id),
            kind,
            pose: pose(x, y),
        });
    }

    pub(crate) fn tracked_overlay() -> Overlay<MockBackend> {
        let mut overlay = Overlay::new(MockBackend::default(), Calibrator::default());
        track(&mut overlay, 0, DeviceKind::Head, 0.0, 1.6);
        track(&mut overlay, 1, DeviceKind::LeftController, -0.4, 1.2);
        track(&mut overlay, 2, DeviceKind::RightController, 0.4, 1.2);
        overlay
    }

    fn temp_path(name: &str) -> PathBuf {
        let file = format!("talava_overlay_overlay_{}_{}.json", name, std::process::id());
        std::env::temp_dir().join(file)
    }

    #[test]
    fn test_snapshot_requires_head_and_controllers() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.snapshot().is_err());
        registry.apply(DeviceUpdate::Pose {
            id: TrackerId(0),
            kind: DeviceKind::Head,
            pose: pose(0.0, 1.6),
        });
        registry.apply(DeviceUpdate::Pose {
            id: TrackerId(1),
            kind: DeviceKind::LeftController,
            pose: pose(-0.4, 1.2),
        });
        let err = registry.snapshot().unwrap_err();
        assert!(err.to_string().contains("right controller"));
    }

    #[test]
    fn test_snapshot_orders_trackers_by_id() {
        let mut overlay = tracked_overlay();
        track(&mut overlay, 12, DeviceKind::Tracker, 0.0, 1.0);
        track(&mut overlay, 10, DeviceKind::Tracker, 0.1, 0.1);
        track(&mut overlay, 11, DeviceKind::Tracker, -0.1, 0.1);
        let set = overlay.devices().snapshot().unwrap();
        let ids: Vec<u32> = set.trackers.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn test_lost_device_removed() {
        let mut overlay = tracked_overlay();
        track(&mut overlay, 10, DeviceKind::Tracker, 0.0, 1.0);
        overlay.apply_device(DeviceUpdate::Lost { id: TrackerId(10) });
        assert_eq!(overlay.devices().len(), 3);
    }

    #[test]
    fn test_calibrate_without_model_fails() {
        let mut overlay = tracked_overlay();
        let err = overlay.apply(ControlCommand::Calibrate).unwrap_err();
        assert!(err.to_string().contains("no model loaded"));
        assert!(overlay.current_assignment().is_none());
    }

    #[test]
    fn test_calibrate_without_head_fails() {
        let mut overlay = Overlay::new(MockBackend::default(), Calibrator::default());
        overlay
            .apply(ControlCommand::ImportModel { path: "a.vrm".into(), for_calibration: true })
            .unwrap();
        assert!(overlay.apply(ControlCommand::Calibrate).is_err());
        assert!(overlay.settings().head_tracker.is_none());
    }

    #[test]
    fn test_import_for_calibration_then_end() {
        let mut overlay = tracked_overlay();
        overlay
            .apply(ControlCommand::ImportModel { path: "a.vrm".into(), for_calibration: true })
            .unwrap();
        assert!(overlay.is_calibrating());
        assert!(overlay.backend().calibration_view);
        assert_eq!(overlay.settings().model_path, Some(PathBuf::from("a.vrm")));

        overlay.apply(ControlCommand::EndCalibrate).unwrap();
        assert!(!overlay.is_calibrating());
        assert!(!overlay.backend().calibration_view);
    }

    #[test]
    fn test_calibrate_single_tracker_stores_settings() {
        let mut overlay = tracked_overlay();
        track(&mut overlay, 10, DeviceKind::Tracker, 0.0, 1.0);
        overlay
            .apply(ControlCommand::ImportModel { path: "a.vrm".into(), for_calibration: true })
            .unwrap();
        overlay.apply(ControlCommand::Calibrate).unwrap();

        let rig = overlay.backend().rig.as_ref().unwrap();
        assert_eq!(rig.locomotion_weight, 1.0);
        assert!(rig.plant_feet);
        assert!(!rig.has_root_controller);

        let assignment = overlay.current_assignment().unwrap();
        assert_eq!(assignment.get(Role::Hip).map(|t| t.id.0), Some(10));
        assert_eq!(overlay.settings().body_tracker.map(|t| t.position), Some([0.0, 1.0, 0.0]));
        assert!(overlay.settings().left_foot_tracker.is_none());
    }

    #[test]
    fn test_failed_calibration_keeps_settings() {
        let mut overlay = tracked_overlay();
        overlay
            .apply(ControlCommand::ImportModel { path: "a.vrm".into(), for_calibration: false })
            .unwrap();
        overlay.apply(ControlCommand::Calibrate).unwrap();
        let before = overlay.settings().clone();

        track(&mut overlay, 10, DeviceKind::Tracker, 0.0, 1.0);
        overlay.backend_mut().rig.as_mut().unwrap().fail_on_pass = Some(4);
        assert!(overlay.apply(ControlCommand::Calibrate).is_err());
        assert_eq!(overlay.settings(), &before);
        assert_eq!(overlay.current_assignment().map(|a| a.tracker_count), Some(0));
    }

    #[test]
    fn test_lip_sync_gain_clamped() {
        let mut overlay = tracked_overlay();
        let lip_sync = LipSyncSettings { enabled: true, gain: 500.0, ..Default::default() };
        overlay.apply(ControlCommand::SetLipSync(lip_sync)).unwrap();
        assert_eq!(overlay.settings().lip_sync.gain, 256.0);
        assert_eq!(overlay.backend().calls, vec!["lip_sync gain=256"]);
    }

    #[test]
    fn test_show_grid_stored() {
        let mut overlay = tracked_overlay();
        overlay.apply(ControlCommand::ShowGrid(true)).unwrap();
        assert!(overlay.settings().show_camera_grid);
        overlay.apply(ControlCommand::ShowGrid(false)).unwrap();
        assert!(!overlay.settings().show_camera_grid);
        assert_eq!(overlay.backend().calls, vec!["grid true", "grid false"]);
    }

    #[test]
    fn test_look_target_per_camera() {
        let mut overlay = tracked_overlay();
        let target = LookTarget { offset: [0.0, 0.2, 0.0], distance: 1.2 };
        overlay
            .apply(ControlCommand::SetLookTarget { camera: CameraKind::Front, target })
            .unwrap();
        assert_eq!(overlay.settings().front_camera_look_target, Some(target));
        assert!(overlay.settings().back_camera_look_target.is_none());

        let err = overlay
            .apply(ControlCommand::SetLookTarget { camera: CameraKind::Free, target })
            .unwrap_err();
        assert!(err.to_string().contains("free camera"));
        assert_eq!(overlay.backend().calls.len(), 1);
    }

    #[test]
    fn test_lip_sync_devices_from_backend() {
        let overlay = tracked_overlay();
        assert_eq!(overlay.lip_sync_devices(), vec!["Built-in Microphone", "USB Audio"]);
    }

    #[test]
    fn test_custom_background_remembered() {
        let mut overlay = tracked_overlay();
        overlay
            .apply(ControlCommand::ChangeBackground {
                background: Background::Color { rgb: [0.2, 0.4, 0.6] },
                custom: true,
            })
            .unwrap();
        overlay
            .apply(ControlCommand::ChangeBackground {
                background: Background::Transparent,
                custom: false,
            })
            .unwrap();
        assert_eq!(overlay.settings().background, Background::Transparent);
        assert_eq!(overlay.settings().custom_background, Some([0.2, 0.4, 0.6]));
    }

    #[test]
    fn test_save_then_load_reapplies() {
        let path = temp_path("reapply");
        let mut overlay = tracked_overlay();
        overlay
            .apply(ControlCommand::ImportModel { path: "a.vrm".into(), for_calibration: false })
            .unwrap();
        overlay.apply(ControlCommand::ChangeCamera(CameraKind::Back)).unwrap();
        overlay.apply(ControlCommand::ShowGrid(true)).unwrap();
        overlay
            .apply(ControlCommand::SetFreeCamera(StoredTransform {
                position: [0.0, 1.4, 2.0],
                rotation: [0.0, 1.0, 0.0, 0.0],
                local_scale: [1.0, 1.0, 1.0],
            }))
            .unwrap();
        overlay
            .apply(ControlCommand::SetLookTarget {
                camera: CameraKind::Back,
                target: LookTarget { offset: [0.0, 0.1, 0.0], distance: 2.5 },
            })
            .unwrap();
        overlay.apply(ControlCommand::Calibrate).unwrap();
        overlay.apply(ControlCommand::SaveSettings(path.clone())).unwrap();

        let mut fresh = Overlay::new(MockBackend::default(), Calibrator::default());
        fresh.apply(ControlCommand::LoadSettings(path.clone())).unwrap();
        assert_eq!(fresh.settings(), overlay.settings());
        assert!(fresh.settings().show_camera_grid);
        assert!(fresh.backend().rig.is_some());
        let calls = &fresh.backend().calls;
        assert!(calls.contains(&"import a.vrm".to_string()));
        assert!(calls.contains(&"free_camera [0.0, 1.4, 2.0]".to_string()));
        assert!(calls.contains(&"look_target Back distance=2.5".to_string()));
        assert!(calls.contains(&"camera Back".to_string()));
        assert!(calls.contains(&"grid true".to_string()));
        // 注視設定はカメラ切り替えより先に反映する
        let look = calls.iter().position(|c| c.starts_with("look_target")).unwrap();
        let camera = calls.iter().position(|c| c == "camera Back").unwrap();
        assert!(look < camera);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_settings_applies_rest_when_import_fails() {
        let mut overlay = Overlay::new(
            MockBackend { fail_import: true, ..Default::default() },
            Calibrator::default(),
        );
        let settings = Settings {
            model_path: Some("broken.vrm".into()),
            camera: Some(CameraKind::Front),
            ..Default::default()
        };
        assert!(overlay.load_settings(settings).is_err());
        assert!(overlay.backend().calls.contains(&"camera Front".to_string()));
    }
}
