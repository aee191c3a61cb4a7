use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::classify::{classify, RoleAssignment, TrackerSet};
use crate::pose::Tracker;

/// 外部キャリブレータの呼び出し回数
///
/// ソルバーの内部状態は1回では収束しきらず姿勢誤差が残るため、同じ入力で3回呼ぶ。
pub const CALIBRATION_PASSES: usize = 3;

/// 外部キャリブレータに渡すオフセット設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratorSettings {
    /// HMDから頭ボーンへのオフセット（メートル）
    #[serde(default = "default_head_offset")]
    pub head_offset: [f32; 3],
    /// コントローラから手ボーンへのオフセット（メートル）
    #[serde(default = "default_hand_offset")]
    pub hand_offset: [f32; 3],
}

fn default_head_offset() -> [f32; 3] { [0.0, -0.15, -0.15] }
fn default_hand_offset() -> [f32; 3] { [0.0, -0.03, -0.07] }

impl Default for CalibratorSettings {
    fn default() -> Self {
        Self {
            head_offset: default_head_offset(),
            hand_offset: default_hand_offset(),
        }
    }
}

/// キャリブレーションで各部位に結びつけるトラッカー。空の部位はアニメーションのみで駆動される。
#[derive(Debug, Clone, Copy)]
pub struct CalibrationTargets<'a> {
    pub head: &'a Tracker,
    pub hip: Option<&'a Tracker>,
    pub left_hand: Option<&'a Tracker>,
    pub right_hand: Option<&'a Tracker>,
    pub left_foot: Option<&'a Tracker>,
    pub right_foot: Option<&'a Tracker>,
}

impl<'a> From<&'a RoleAssignment> for CalibrationTargets<'a> {
    fn from(a: &'a RoleAssignment) -> Self {
        Self {
            head: &a.head,
            hip: a.hip.as_ref(),
            left_hand: a.left_hand.as_ref(),
            right_hand: a.right_hand.as_ref(),
            left_foot: a.left_foot.as_ref(),
            right_foot: a.right_foot.as_ref(),
        }
    }
}

/// 外部IKリグ（ソルバー本体の計算は持たない）
pub trait IkRig {
    /// IKのブレンド重み (0: アニメーションのみ, 1: IKのみ)
    fn set_ik_weight(&mut self, weight: f32);

    /// 外部キャリブレータを1回実行する
    fn calibrate(
        &mut self,
        settings: &CalibratorSettings,
        targets: &CalibrationTargets<'_>,
    ) -> Result<()>;

    fn set_plant_feet(&mut self, enabled: bool);

    fn set_locomotion_weight(&mut self, weight: f32);

    /// スケルトンルートのルートモーション制御コンポーネントを外す。外した場合true
    fn remove_root_controller(&mut self) -> bool;
}

/// キャリブレーションの進行役
///
/// 直近に成功した割り当てを1つだけ保持する（設定の書き出し用。分類には使わない）。
pub struct Calibrator {
    settings: CalibratorSettings,
    current: Option<RoleAssignment>,
}

impl Calibrator {
    pub fn new(settings: CalibratorSettings) -> Self {
        Self {
            settings,
            current: None,
        }
    }

    pub fn settings(&self) -> &CalibratorSettings {
        &self.settings
    }

    pub fn current(&self) -> Option<&RoleAssignment> {
        self.current.as_ref()
    }

    /// 分類してからリグをキャリブレーションする
    ///
    /// 失敗時は再試行せずエラーを返す。保持中の割り当ては更新しない。
    pub fn calibrate<R: IkRig + ?Sized>(
        &mut self,
        rig: &mut R,
        set: &TrackerSet,
    ) -> Result<&RoleAssignment> {
        let assignment = classify(set);
        self.apply(rig, &assignment)?;
        Ok(&*self.current.insert(assignment))
    }

    /// 与えられた割り当てでリグをキャリブレーションする
    ///
    /// 1. IK重みを0に（残ったIKの影響でキャリブレーションが狂うため）
    /// 2. 同じ入力で外部キャリブレータを [`CALIBRATION_PASSES`] 回
    /// 3. 全パス成功後にIK重みを1に戻す
    /// 4. トラッカー1つなら足の接地とロコモーションを有効にし、ルート制御を外す
    ///
    /// 途中で失敗した場合、IK重みは失敗した呼び出しが残した状態のまま。
    pub fn apply<R: IkRig + ?Sized>(&self, rig: &mut R, assignment: &RoleAssignment) -> Result<()> {
        let targets = CalibrationTargets::from(assignment);

        rig.set_ik_weight(0.0);
        for pass in 1..=CALIBRATION_PASSES {
            rig.calibrate(&self.settings, &targets).with_context(|| {
                format!("IK calibration pass {}/{} failed", pass, CALIBRATION_PASSES)
            })?;
            debug!(pass, "calibration pass done");
        }
        rig.set_ik_weight(1.0);

        if assignment.is_single_tracker() {
            // 腰だけでは足のIKを独立に駆動できないのでロコモーションに任せる
            rig.set_plant_feet(true);
            rig.set_locomotion_weight(1.0);
            let removed = rig.remove_root_controller();
            debug!(removed, "single-tracker rig: locomotion enabled");
        }

        info!(
            trackers = assignment.tracker_count,
            hip = assignment.hip.is_some(),
            feet = assignment.left_foot.is_some(),
            "calibrated"
        );
        Ok(())
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibratorSettings::default())
    }
}
