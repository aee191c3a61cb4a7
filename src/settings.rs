//! ユーザー設定ドキュメント（JSON）。
//!
//! グローバルな「現在の設定」は持たず、[`Settings`] を明示的に受け渡す。
//! コアが読み書きするのはロールごとのトラッカー変換だけで、それ以外の項目は
//! 外部コンポーネント（カメラ・背景・リップシンク・まばたき）向けにそのまま保持する。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pose::Tracker;
use crate::tracker::{Role, RoleAssignment};

/// 保存用のトラッカー変換
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredTransform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub local_scale: [f32; 3],
}

impl From<&Tracker> for StoredTransform {
    fn from(t: &Tracker) -> Self {
        Self {
            position: t.pose.position,
            rotation: t.pose.rotation,
            local_scale: t.local_scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraKind {
    Free,
    Front,
    Back,
}

/// 注視点カメラ（正面・背面）の追従設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LookTarget {
    /// 注視点（頭）からのオフセット
    pub offset: [f32; 3],
    /// 注視点からの距離（メートル）
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Background {
    Color { rgb: [f32; 3] },
    Transparent,
}

impl Default for Background {
    fn default() -> Self {
        Background::Color { rgb: [0.0, 0.0, 0.0] }
    }
}

pub const LIP_SYNC_GAIN_MIN: f32 = 1.0;
pub const LIP_SYNC_GAIN_MAX: f32 = 256.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncSettings {
    pub enabled: bool,
    pub device: Option<String>,
    /// 入力ゲイン [1, 256]
    pub gain: f32,
    pub max_weight_enabled: bool,
    pub weight_threshold: f32,
    pub max_weight_emphasis: bool,
}

impl LipSyncSettings {
    /// 範囲外の値を丸めたコピーを返す
    pub fn sanitized(mut self) -> Self {
        self.gain = if self.gain.is_nan() {
            LIP_SYNC_GAIN_MIN
        } else {
            self.gain.clamp(LIP_SYNC_GAIN_MIN, LIP_SYNC_GAIN_MAX)
        };
        self
    }
}

impl Default for LipSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            device: None,
            gain: LIP_SYNC_GAIN_MIN,
            max_weight_enabled: false,
            weight_threshold: 0.0,
            max_weight_emphasis: false,
        }
    }
}

/// まばたきしていないときの表情キー
pub const DEFAULT_FACE: &str = "通常(NEUTRAL)";

/// まばたき設定（時間はすべて秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkSettings {
    pub auto_blink: bool,
    pub interval_min: f32,
    pub interval_max: f32,
    pub close_animation_time: f32,
    pub open_animation_time: f32,
    pub closing_time: f32,
    pub default_face: String,
}

impl Default for BlinkSettings {
    fn default() -> Self {
        Self {
            auto_blink: false,
            interval_min: 1.0,
            interval_max: 10.0,
            close_animation_time: 0.06,
            open_animation_time: 0.03,
            closing_time: 0.1,
            default_face: DEFAULT_FACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model_path: Option<PathBuf>,
    pub head_tracker: Option<StoredTransform>,
    pub body_tracker: Option<StoredTransform>,
    pub left_hand_tracker: Option<StoredTransform>,
    pub right_hand_tracker: Option<StoredTransform>,
    pub left_foot_tracker: Option<StoredTransform>,
    pub right_foot_tracker: Option<StoredTransform>,
    pub background: Background,
    /// ユーザーが最後に選んだカスタム色
    pub custom_background: Option<[f32; 3]>,
    pub camera: Option<CameraKind>,
    pub free_camera: Option<StoredTransform>,
    pub front_camera_look_target: Option<LookTarget>,
    pub back_camera_look_target: Option<LookTarget>,
    pub show_camera_grid: bool,
    pub lip_sync: LipSyncSettings,
    pub blink: BlinkSettings,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }

    pub fn tracker(&self, role: Role) -> Option<&StoredTransform> {
        match role {
            Role::Head => self.head_tracker.as_ref(),
            Role::Hip => self.body_tracker.as_ref(),
            Role::LeftHand => self.left_hand_tracker.as_ref(),
            Role::RightHand => self.right_hand_tracker.as_ref(),
            Role::LeftFoot => self.left_foot_tracker.as_ref(),
            Role::RightFoot => self.right_foot_tracker.as_ref(),
            Role::Unassigned => None,
        }
    }

    /// 割り当て結果のトラッカー変換を丸ごと置き換える。空の部位はNone
    pub fn store_assignment(&mut self, assignment: &RoleAssignment) {
        let stored = |role| assignment.get(role).map(StoredTransform::from);
        self.head_tracker = stored(Role::Head);
        self.body_tracker = stored(Role::Hip);
        self.left_hand_tracker = stored(Role::LeftHand);
        self.right_hand_tracker = stored(Role::RightHand);
        self.left_foot_tracker = stored(Role::LeftFoot);
        self.right_foot_tracker = stored(Role::RightFoot);
    }
}
