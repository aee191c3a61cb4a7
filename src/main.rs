use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bevy::app::{App, AppExit, ScheduleRunnerPlugin, Update};
use bevy::ecs::prelude::*;

use talava_overlay::config::Config;
use talava_overlay::control::{ControlCommand, ControlSurface};
use talava_overlay::overlay::{AvatarBackend, Overlay};
use talava_overlay::pose::Tracker;
use talava_overlay::schedule::{command_channel, FramePump};
use talava_overlay::settings::{
    Background, BlinkSettings, CameraKind, LipSyncSettings, LookTarget, StoredTransform,
};
use talava_overlay::tracker::{CalibrationTargets, Calibrator, CalibratorSettings, IkRig};
use talava_overlay::vmt::VmtReceiver;

const CONFIG_PATH: &str = "config.toml";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

type LogFile = Arc<Mutex<std::io::BufWriter<std::fs::File>>>;

fn open_log_file() -> Result<LogFile> {
    fs::create_dir_all("logs")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("logs/overlay_{}.log", ts);
    let file = std::fs::File::create(&path)?;
    eprintln!("Log: {}", path);
    Ok(Arc::new(Mutex::new(std::io::BufWriter::new(file))))
}

macro_rules! log {
    ($logfile:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        println!("{}", msg);
        if let Ok(mut f) = $logfile.lock() {
            let _ = writeln!(f, "{}", msg);
            let _ = f.flush();
        }
    }};
}

/// ライブラリの tracing イベントを log! と同じ出力先（stdout + ログファイル）へ流す
struct LogSink(LogFile);

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Ok(mut f) = self.0.lock() {
            f.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Ok(mut f) = self.0.lock() {
            f.flush()?;
        }
        Ok(())
    }
}

fn log_subscriber(logfile: &LogFile) -> impl tracing::Subscriber + Send + Sync + 'static {
    let logfile = logfile.clone();
    tracing_subscriber::fmt()
        .with_writer(move || LogSink(logfile.clone()))
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .finish()
}

fn init_tracing(logfile: &LogFile) -> Result<()> {
    tracing::subscriber::set_global_default(log_subscriber(logfile))
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

// ---------------------------------------------------------------------------
// Headless backend: 描画なし。呼び出しをログに残すだけ
// ---------------------------------------------------------------------------

struct HeadlessRig {
    logfile: LogFile,
    has_root_controller: bool,
}

fn bound_id(t: Option<&Tracker>) -> String {
    t.map(|t| t.id.0.to_string()).unwrap_or_else(|| "-".into())
}

impl IkRig for HeadlessRig {
    fn set_ik_weight(&mut self, weight: f32) {
        log!(self.logfile, "[rig] IK weight = {}", weight);
    }

    fn calibrate(
        &mut self,
        settings: &CalibratorSettings,
        targets: &CalibrationTargets<'_>,
    ) -> Result<()> {
        log!(
            self.logfile,
            "[rig] calibrate head={} hip={} hands=({}, {}) feet=({}, {})",
            targets.head.id.0,
            bound_id(targets.hip),
            bound_id(targets.left_hand),
            bound_id(targets.right_hand),
            bound_id(targets.left_foot),
            bound_id(targets.right_foot),
        );
        log!(
            self.logfile,
            "[rig] head_offset={:?} hand_offset={:?}",
            settings.head_offset,
            settings.hand_offset,
        );
        Ok(())
    }

    fn set_plant_feet(&mut self, enabled: bool) {
        log!(self.logfile, "[rig] plant feet = {}", enabled);
    }

    fn set_locomotion_weight(&mut self, weight: f32) {
        log!(self.logfile, "[rig] locomotion weight = {}", weight);
    }

    fn remove_root_controller(&mut self) -> bool {
        std::mem::replace(&mut self.has_root_controller, false)
    }
}

struct HeadlessBackend {
    logfile: LogFile,
    rig: Option<HeadlessRig>,
}

impl AvatarBackend for HeadlessBackend {
    type Rig = HeadlessRig;

    fn import_model(&mut self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path)
            .with_context(|| format!("model not found: {}", path.display()))?;
        if !meta.is_file() {
            bail!("not a file: {}", path.display());
        }
        log!(self.logfile, "[backend] model loaded: {}", path.display());
        self.rig = Some(HeadlessRig {
            logfile: self.logfile.clone(),
            has_root_controller: true,
        });
        Ok(())
    }

    fn rig_mut(&mut self) -> Option<&mut HeadlessRig> {
        self.rig.as_mut()
    }

    fn show_calibration_view(&mut self, visible: bool) {
        let state = if visible { "on" } else { "off" };
        log!(self.logfile, "[backend] calibration view: {}", state);
    }

    fn set_camera(&mut self, camera: CameraKind) {
        log!(self.logfile, "[backend] camera = {:?}", camera);
    }

    fn set_free_camera(&mut self, transform: &StoredTransform) {
        log!(self.logfile, "[backend] free camera at {:?}", transform.position);
    }

    fn set_look_target(&mut self, camera: CameraKind, target: &LookTarget) {
        log!(
            self.logfile,
            "[backend] {:?} camera look offset={:?} distance={}",
            camera,
            target.offset,
            target.distance
        );
    }

    fn show_grid(&mut self, visible: bool) {
        log!(self.logfile, "[backend] grid = {}", visible);
    }

    fn set_background(&mut self, background: &Background) {
        log!(self.logfile, "[backend] background = {:?}", background);
    }

    // 音声入力を持たない
    fn lip_sync_devices(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_lip_sync(&mut self, settings: &LipSyncSettings) {
        log!(
            self.logfile,
            "[backend] lip sync enabled={} gain={} device={:?}",
            settings.enabled,
            settings.gain,
            settings.device
        );
    }

    fn set_blink(&mut self, settings: &BlinkSettings) {
        log!(
            self.logfile,
            "[backend] auto blink = {} ({}s - {}s)",
            settings.auto_blink,
            settings.interval_min,
            settings.interval_max
        );
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum ConsoleInput {
    /// カウントダウン付きキャリブレーション
    Calibrate,
    Command(ControlCommand),
    /// 現在の設定のうちゲインと有効/無効だけ変える
    LipSync { gain: f32, enabled: Option<bool> },
    Blink { enabled: bool, interval: Option<(f32, f32)> },
    Mic(String),
    ListMics,
    Quit,
}

fn parse_switch(arg: Option<&str>) -> Result<bool> {
    match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        other => bail!("expected on|off, got {:?}", other),
    }
}

fn parse_console(line: &str) -> Result<Option<ConsoleInput>> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = parts.collect();
    let path_arg = || -> Result<PathBuf> {
        if rest.is_empty() {
            bail!("{} needs a path", cmd);
        }
        Ok(PathBuf::from(rest.join(" ")))
    };

    let input = match cmd.to_ascii_lowercase().as_str() {
        "c" => ConsoleInput::Calibrate,
        "e" => ConsoleInput::Command(ControlCommand::EndCalibrate),
        "m" => ConsoleInput::Command(ControlCommand::ImportModel {
            path: path_arg()?,
            for_calibration: true,
        }),
        "s" => ConsoleInput::Command(ControlCommand::SaveSettings(path_arg()?)),
        "l" => ConsoleInput::Command(ControlCommand::LoadSettings(path_arg()?)),
        "cam" => {
            let camera = match rest.first().copied() {
                Some("free") => CameraKind::Free,
                Some("front") => CameraKind::Front,
                Some("back") => CameraKind::Back,
                other => bail!("unknown camera: {:?}", other),
            };
            ConsoleInput::Command(ControlCommand::ChangeCamera(camera))
        }
        "grid" => {
            let visible = parse_switch(rest.first().copied())?;
            ConsoleInput::Command(ControlCommand::ShowGrid(visible))
        }
        "bg" => {
            let background = match rest.as_slice() {
                ["transparent"] => Background::Transparent,
                [r, g, b] => Background::Color {
                    rgb: [r.parse()?, g.parse()?, b.parse()?],
                },
                _ => bail!("usage: bg r g b | bg transparent"),
            };
            let custom = matches!(background, Background::Color { .. });
            ConsoleInput::Command(ControlCommand::ChangeBackground { background, custom })
        }
        "lip" => match rest.as_slice() {
            [gain] => ConsoleInput::LipSync { gain: gain.parse()?, enabled: None },
            [gain, switch] => ConsoleInput::LipSync {
                gain: gain.parse()?,
                enabled: Some(parse_switch(Some(*switch))?),
            },
            _ => bail!("usage: lip <gain> [on|off]"),
        },
        "blink" => match rest.as_slice() {
            [switch] => ConsoleInput::Blink {
                enabled: parse_switch(Some(*switch))?,
                interval: None,
            },
            [switch, min, max] => {
                let (min, max): (f32, f32) = (min.parse()?, max.parse()?);
                if min > max {
                    bail!("blink interval min {} > max {}", min, max);
                }
                ConsoleInput::Blink {
                    enabled: parse_switch(Some(*switch))?,
                    interval: Some((min, max)),
                }
            }
            _ => bail!("usage: blink <on|off> [min max]"),
        },
        "mics" => ConsoleInput::ListMics,
        "mic" => {
            if rest.is_empty() {
                bail!("mic needs a device name");
            }
            ConsoleInput::Mic(rest.join(" "))
        }
        "q" => ConsoleInput::Quit,
        other => bail!("unknown command: {}", other),
    };
    Ok(Some(input))
}

fn spawn_console_thread(
    surface: ControlSurface<HeadlessBackend>,
    calibration_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    logfile: LogFile,
) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        while running.load(Ordering::Acquire) {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let input = match parse_console(&line) {
                Ok(Some(input)) => input,
                Ok(None) => continue,
                Err(e) => {
                    log!(logfile, "{:#}", e);
                    continue;
                }
            };
            match input {
                ConsoleInput::Calibrate => calibration_flag.store(true, Ordering::Release),
                ConsoleInput::Command(cmd) => surface.send(cmd),
                ConsoleInput::LipSync { gain, enabled } => surface.update_lip_sync(move |l| {
                    l.gain = gain;
                    if let Some(enabled) = enabled {
                        l.enabled = enabled;
                    }
                }),
                ConsoleInput::Blink { enabled, interval } => surface.update_blink(move |b| {
                    b.auto_blink = enabled;
                    if let Some((min, max)) = interval {
                        b.interval_min = min;
                        b.interval_max = max;
                    }
                }),
                ConsoleInput::Mic(device) => {
                    surface.update_lip_sync(move |l| l.device = Some(device))
                }
                ConsoleInput::ListMics => {
                    match surface.lip_sync_devices().recv_timeout(Duration::from_secs(1)) {
                        Ok(devices) if devices.is_empty() => log!(logfile, "No microphones"),
                        Ok(devices) => {
                            for (i, name) in devices.iter().enumerate() {
                                log!(logfile, "  [{}] {}", i, name);
                            }
                        }
                        Err(_) => log!(logfile, "Microphone list timed out"),
                    }
                }
                ConsoleInput::Quit => running.store(false, Ordering::Release),
            }
        }
    });
}

// ---------------------------------------------------------------------------
// OSC input thread
// ---------------------------------------------------------------------------

fn spawn_osc_thread(
    receiver: VmtReceiver,
    surface: ControlSurface<HeadlessBackend>,
    running: Arc<AtomicBool>,
    logfile: LogFile,
) -> Result<JoinHandle<()>> {
    receiver.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(std::thread::spawn(move || {
        while running.load(Ordering::Acquire) {
            match receiver.recv() {
                Ok(Some(updates)) => {
                    for update in updates {
                        match update {
                            Ok(update) => surface.update_device(update),
                            Err(e) => log!(logfile, "[osc] {:#}", e),
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => log!(logfile, "[osc] receive failed: {:#}", e),
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Update loop
// ---------------------------------------------------------------------------

struct OverlayLoop {
    pump: FramePump<Overlay<HeadlessBackend>>,
    overlay: Overlay<HeadlessBackend>,
    surface: ControlSurface<HeadlessBackend>,
    last_frame: Instant,
    /// キャリブレーショントリガー（コンソール "c" または SIGUSR1）
    calibration_flag: Arc<AtomicBool>,
    calibration_delay: f32,
    running: Arc<AtomicBool>,
    logfile: LogFile,
}

fn frame_system(mut state: NonSendMut<OverlayLoop>, mut exit: EventWriter<AppExit>) {
    let state = &mut *state;

    if state.calibration_flag.swap(false, Ordering::AcqRel) {
        log!(
            state.logfile,
            "Calibration in {}s... 基準位置に立ってください",
            state.calibration_delay
        );
        state
            .surface
            .send_after(state.calibration_delay, ControlCommand::Calibrate);
    }

    let now = Instant::now();
    let dt = now.duration_since(state.last_frame).as_secs_f32();
    state.last_frame = now;

    let report = state.pump.run_frame(&mut state.overlay, dt);
    for failure in &report.failures {
        log!(state.logfile, "[{:?}] {}", failure.kind, failure.message);
    }
    if report.delayed_run > 0 {
        if let Some(assignment) = state.overlay.current_assignment() {
            log!(
                state.logfile,
                "Trackers: {} (devices: {})",
                assignment.tracker_count,
                state.overlay.devices().len()
            );
        }
    }

    if !state.running.load(Ordering::Acquire) {
        exit.send(AppExit::Success);
    }
}

fn main() -> Result<()> {
    let config = Config::load_or_default(CONFIG_PATH)?;
    let logfile = open_log_file()?;
    init_tracing(&logfile)?;

    log!(logfile, "Talava Overlay {}", env!("GIT_VERSION"));
    log!(logfile, "OSC listen: {}", config.osc.listen_addr);
    log!(logfile, "Target FPS: {}", config.app.target_fps);

    let (scheduler, receiver) = command_channel();
    let surface = ControlSurface::new(scheduler);
    let backend = HeadlessBackend {
        logfile: logfile.clone(),
        rig: None,
    };
    let overlay = Overlay::new(backend, Calibrator::new(config.calibration.offsets));

    if let Some(path) = &config.app.settings_file {
        surface.send(ControlCommand::LoadSettings(PathBuf::from(path)));
    }

    let running = Arc::new(AtomicBool::new(true));
    let calibration_flag = Arc::new(AtomicBool::new(false));

    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, calibration_flag.clone())
        .context("failed to register SIGUSR1 handler")?;

    let vmt = VmtReceiver::bind(&config.osc.listen_addr)?;
    let osc_thread = spawn_osc_thread(vmt, surface.clone(), running.clone(), logfile.clone())?;
    spawn_console_thread(
        surface.clone(),
        calibration_flag.clone(),
        running.clone(),
        logfile.clone(),
    );

    log!(logfile, "");
    log!(logfile, "操作: [c] キャリブレーション  [e] 終了表示  [m path] モデル読込");
    log!(logfile, "      [s path] 設定保存  [l path] 設定読込");
    log!(logfile, "      [cam free|front|back]  [grid on|off]  [bg r g b|transparent]");
    log!(logfile, "      [lip gain on|off]  [mics]  [mic name]  [blink on|off min max]");
    log!(logfile, "      [q] 終了");
    log!(logfile, "");

    let frame_duration = Duration::from_secs_f64(1.0 / config.app.target_fps.max(1) as f64);

    let mut app = App::new();
    app.add_plugins(ScheduleRunnerPlugin::run_loop(frame_duration))
        .insert_non_send_resource(OverlayLoop {
            pump: FramePump::new(receiver),
            overlay,
            surface,
            last_frame: Instant::now(),
            calibration_flag,
            calibration_delay: config.calibration.delay_secs,
            running: running.clone(),
            logfile: logfile.clone(),
        })
        .add_systems(Update, frame_system);

    app.run();

    running.store(false, Ordering::Release);
    let _ = osc_thread.join();
    log!(logfile, "Shutting down...");
    Ok(())
}
