use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// トラッカーの位置と回転
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerPose {
    /// 位置 (x, y, z)
    pub position: [f32; 3],
    /// 回転 (クォータニオン: x, y, z, w)
    pub rotation: [f32; 4],
}

impl TrackerPose {
    pub fn new(position: [f32; 3], rotation: [f32; 4]) -> Self {
        Self { position, rotation }
    }

    /// 原点、回転なし
    pub fn identity() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn translation(&self) -> Vector3<f32> {
        Vector3::from(self.position)
    }

    /// 回転をnalgebraの単位クォータニオンとして返す（非正規化入力は正規化）
    pub fn orientation(&self) -> UnitQuaternion<f32> {
        let [x, y, z, w] = self.rotation;
        UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
    }

    /// ワールド座標の点を、この姿勢のローカル方向に変換する
    ///
    /// 平行移動を差し引いた後に逆回転のみを適用する（スケールは無視）。
    pub fn inverse_transform_direction(&self, point: &Vector3<f32>) -> Vector3<f32> {
        self.orientation().inverse_transform_vector(&(point - self.translation()))
    }
}

impl Default for TrackerPose {
    fn default() -> Self {
        Self::identity()
    }
}

/// トラッカーの不透明なハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackerId(pub u32);

/// 外部から供給されるトラッカーのスナップショット
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tracker {
    pub id: TrackerId,
    pub pose: TrackerPose,
    pub local_scale: [f32; 3],
}

impl Tracker {
    pub fn new(id: TrackerId, pose: TrackerPose) -> Self {
        Self {
            id,
            pose,
            local_scale: [1.0, 1.0, 1.0],
        }
    }
}
