use std::cmp::Ordering;

use nalgebra::Vector3;

use crate::pose::{Tracker, TrackerPose};

/// トラッカーが駆動する骨格の部位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Head,
    Hip,
    LeftHand,
    RightHand,
    LeftFoot,
    RightFoot,
    Unassigned,
}

impl Role {
    /// 割り当て可能な部位（Unassignedを除く）
    pub const ASSIGNABLE: [Role; 6] = [
        Role::Head,
        Role::Hip,
        Role::LeftHand,
        Role::RightHand,
        Role::LeftFoot,
        Role::RightFoot,
    ];
}

/// キャリブレーション時点のデバイス一式
///
/// コントローラは必ず2つ。型で前提条件を表す。
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSet {
    pub head: Tracker,
    pub controllers: [Tracker; 2],
    pub trackers: Vec<Tracker>,
}

/// 部位 → トラッカーの対応
///
/// キャリブレーションごとに丸ごと作り直す。各部位を持つトラッカーは高々1つ。
#[derive(Debug, Clone, PartialEq)]
pub struct RoleAssignment {
    pub head: Tracker,
    pub hip: Option<Tracker>,
    pub left_hand: Option<Tracker>,
    pub right_hand: Option<Tracker>,
    pub left_foot: Option<Tracker>,
    pub right_foot: Option<Tracker>,
    /// 分類に使った汎用トラッカー数
    pub tracker_count: usize,
}

impl RoleAssignment {
    pub fn get(&self, role: Role) -> Option<&Tracker> {
        match role {
            Role::Head => Some(&self.head),
            Role::Hip => self.hip.as_ref(),
            Role::LeftHand => self.left_hand.as_ref(),
            Role::RightHand => self.right_hand.as_ref(),
            Role::LeftFoot => self.left_foot.as_ref(),
            Role::RightFoot => self.right_foot.as_ref(),
            Role::Unassigned => None,
        }
    }

    /// トラッカー1つ（腰のみ）の簡易リグか
    pub fn is_single_tracker(&self) -> bool {
        self.tracker_count == 1
    }

    /// 部位をID単位で比較する（姿勢の値は無視）
    pub fn same_bindings(&self, other: &RoleAssignment) -> bool {
        Role::ASSIGNABLE
            .iter()
            .all(|&r| self.get(r).map(|t| t.id) == other.get(r).map(|t| t.id))
    }
}

/// 頭基準のローカル座標を持つ候補
#[derive(Debug, Clone, Copy)]
struct Candidate {
    local: Vector3<f32>,
    tracker: Tracker,
}

fn to_head_local(head: &TrackerPose, tracker: &Tracker) -> Candidate {
    Candidate {
        local: head.inverse_transform_direction(&tracker.pose.translation()),
        tracker: *tracker,
    }
}

// NaNは同順位扱い。安定ソートなので同順位は入力順を保つ
fn cmp_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn sort_by_x(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| cmp_f32(a.local.x, b.local.x));
}

fn sort_by_y(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| cmp_f32(a.local.y, b.local.y));
}

/// 2つの候補をX昇順で (左, 右) に分ける
fn split_left_right(mut pair: [Candidate; 2]) -> (Tracker, Tracker) {
    sort_by_x(&mut pair);
    (pair[0].tracker, pair[1].tracker)
}

/// トラッカー一式から部位を割り当てる
///
/// 位置はすべて頭のローカル方向に変換してから判定する（体基準の左右）。
/// - 手: ローカルXの小さい方が左手
/// - 汎用トラッカー 0個: 腰・両足なし
/// - 1個: 腰
/// - 2個: 両足（Y 昇順に並べてから X で左右）
/// - 3個以上: 最も高いものが腰、残りのうち低い2つが両足（X で左右）。それ以外は未使用
pub fn classify(set: &TrackerSet) -> RoleAssignment {
    let head = &set.head.pose;

    let hands = [
        to_head_local(head, &set.controllers[0]),
        to_head_local(head, &set.controllers[1]),
    ];
    let (left_hand, right_hand) = split_left_right(hands);

    let mut candidates: Vec<Candidate> =
        set.trackers.iter().map(|t| to_head_local(head, t)).collect();

    let (hip, left_foot, right_foot) = match candidates.len() {
        0 => (None, None, None),
        1 => (Some(candidates[0].tracker), None, None),
        2 => {
            // 低い順に並べてから左右に分ける（X が同値なら低い方が左足）
            sort_by_y(&mut candidates);
            let (left, right) = split_left_right([candidates[0], candidates[1]]);
            (None, Some(left), Some(right))
        }
        _ => {
            // 最も高い（ローカルY最大）ものが腰。同値なら入力順で先のもの
            let hip_index = candidates
                .iter()
                .enumerate()
                .fold(0, |best, (i, c)| {
                    if c.local.y > candidates[best].local.y {
                        i
                    } else {
                        best
                    }
                });
            let hip = candidates.remove(hip_index);

            sort_by_y(&mut candidates);
            let (left, right) = split_left_right([candidates[0], candidates[1]]);
            (Some(hip.tracker), Some(left), Some(right))
        }
    };

    RoleAssignment {
        head: set.head,
        hip,
        left_hand: Some(left_hand),
        right_hand: Some(right_hand),
        left_foot,
        right_foot,
        tracker_count: set.trackers.len(),
    }
}
