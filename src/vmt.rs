use anyhow::{bail, Context, Result};
use rosc::{decoder, OscMessage, OscPacket, OscType};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::overlay::{DeviceKind, DeviceUpdate};
use crate::pose::{TrackerId, TrackerPose};

/// VMT形式の姿勢メッセージのアドレス
pub const VMT_ADDRESS: &str = "/VMT/Room/Unity";

/// 受信のデフォルトアドレス
pub const VMT_DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:39570";

/// enable値 → デバイス種別
/// 0=無効(ロスト), 1=トラッカー, 2=左コントローラ, 3=右コントローラ, 4=HMD, 7=トラッカー(VIVE互換モード)
fn device_kind(enable: i32) -> Result<Option<DeviceKind>> {
    Ok(match enable {
        0 => None,
        1 | 7 => Some(DeviceKind::Tracker),
        2 => Some(DeviceKind::LeftController),
        3 => Some(DeviceKind::RightController),
        4 => Some(DeviceKind::Head),
        other => bail!("unknown enable value: {}", other),
    })
}

fn int_arg(msg: &OscMessage, i: usize) -> Result<i32> {
    match msg.args.get(i) {
        Some(OscType::Int(v)) => Ok(*v),
        other => bail!("arg {} must be int, got {:?}", i, other),
    }
}

fn float_arg(msg: &OscMessage, i: usize) -> Result<f32> {
    match msg.args.get(i) {
        Some(OscType::Float(v)) => Ok(*v),
        Some(OscType::Double(v)) => Ok(*v as f32),
        other => bail!("arg {} must be float, got {:?}", i, other),
    }
}

/// OSCメッセージをデバイス更新に変換
/// 引数: index, enable, timeoffset, x, y, z, qx, qy, qz, qw
pub fn decode_tracker_message(msg: &OscMessage) -> Result<DeviceUpdate> {
    if msg.addr != VMT_ADDRESS {
        bail!("unexpected address: {}", msg.addr);
    }
    if msg.args.len() != 10 {
        bail!("expected 10 args, got {}", msg.args.len());
    }

    let index = int_arg(msg, 0)?;
    let id = TrackerId(u32::try_from(index).with_context(|| format!("negative index: {}", index))?);
    let kind = match device_kind(int_arg(msg, 1)?)? {
        Some(kind) => kind,
        None => return Ok(DeviceUpdate::Lost { id }),
    };
    // args[2] (timeoffset) は使わない
    let position = [float_arg(msg, 3)?, float_arg(msg, 4)?, float_arg(msg, 5)?];
    let rotation = [
        float_arg(msg, 6)?,
        float_arg(msg, 7)?,
        float_arg(msg, 8)?,
        float_arg(msg, 9)?,
    ];

    Ok(DeviceUpdate::Pose {
        id,
        kind,
        pose: TrackerPose::new(position, rotation),
    })
}

/// バンドルを展開してメッセージを順に取り出す
fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for p in bundle.content {
                flatten(p, out);
            }
        }
    }
}

/// 1データグラム分をデコードする。メッセージ単位の失敗は個別に返す
pub fn decode_datagram(data: &[u8]) -> Result<Vec<Result<DeviceUpdate>>> {
    let (_, packet) = decoder::decode_udp(data)?;
    let mut messages = Vec::new();
    flatten(packet, &mut messages);
    Ok(messages.iter().map(decode_tracker_message).collect())
}

/// VMT形式の姿勢を受け取るUDPレシーバ
pub struct VmtReceiver {
    socket: UdpSocket,
}

impl VmtReceiver {
    pub fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// 1データグラムを受信してデコードする。タイムアウト時は `Ok(None)`
    pub fn recv(&self) -> Result<Option<Vec<Result<DeviceUpdate>>>> {
        let mut buf = [0u8; decoder::MTU];
        let size = match self.socket.recv_from(&mut buf) {
            Ok((size, _)) => size,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        decode_datagram(&buf[..size]).map(Some)
    }
}
