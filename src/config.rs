use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::tracker::CalibratorSettings;
use crate::vmt::VMT_DEFAULT_LISTEN_ADDR;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub osc: OscConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 更新ループのフレームレート
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// 起動時に読み込む設定ファイル（JSON）
    #[serde(default)]
    pub settings_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// キャリブレーション要求から実行までの猶予（秒）
    #[serde(default = "default_calibration_delay")]
    pub delay_secs: f32,
    #[serde(flatten)]
    pub offsets: CalibratorSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OscConfig {
    /// VMT形式の姿勢を受け取るアドレス
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_target_fps() -> u32 { 60 }
fn default_calibration_delay() -> f32 { 5.0 }
fn default_listen_addr() -> String { VMT_DEFAULT_LISTEN_ADDR.to_string() }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            settings_file: None,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_calibration_delay(),
            offsets: CalibratorSettings::default(),
        }
    }
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// ファイルがなければデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
