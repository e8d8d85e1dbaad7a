use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::locator::resolve_scrcpy_program;
use crate::app::config::ScrcpySettings;
use crate::app::models::OpOutcome;

/// Per-launch overrides layered over the configured [`ScrcpySettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MirrorOptions {
    pub bitrate: Option<String>,
    pub max_size: Option<u32>,
    pub max_fps: Option<u32>,
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    pub window_x: Option<i32>,
    pub window_y: Option<i32>,
    pub stay_awake: Option<bool>,
    pub show_touches: Option<bool>,
    pub fullscreen: Option<bool>,
    pub always_on_top: Option<bool>,
    pub turn_screen_off: Option<bool>,
    pub enable_audio: Option<bool>,
    pub render_driver: Option<String>,
}

impl MirrorOptions {
    pub fn merged_over(&self, base: &ScrcpySettings) -> ScrcpySettings {
        let mut merged = base.clone();
        if let Some(value) = &self.bitrate {
            merged.bitrate = value.clone();
        }
        if let Some(value) = self.max_size {
            merged.max_size = value;
        }
        if let Some(value) = self.max_fps {
            merged.max_fps = value;
        }
        if self.window_width.is_some() {
            merged.window_width = self.window_width;
        }
        if self.window_height.is_some() {
            merged.window_height = self.window_height;
        }
        if self.window_x.is_some() {
            merged.window_x = self.window_x;
        }
        if self.window_y.is_some() {
            merged.window_y = self.window_y;
        }
        if let Some(value) = self.stay_awake {
            merged.stay_awake = value;
        }
        if let Some(value) = self.show_touches {
            merged.show_touches = value;
        }
        if let Some(value) = self.fullscreen {
            merged.fullscreen = value;
        }
        if let Some(value) = self.always_on_top {
            merged.always_on_top = value;
        }
        if let Some(value) = self.turn_screen_off {
            merged.turn_screen_off = value;
        }
        if let Some(value) = self.enable_audio {
            merged.enable_audio = value;
        }
        if self.render_driver.is_some() {
            merged.render_driver = self.render_driver.clone();
        }
        merged
    }
}

/// Fire-and-forget screen mirroring; nothing is tracked after the launch.
pub trait ScreenLauncher: Send + Sync {
    /// Version string of the mirroring tool, or `None` when it cannot be run.
    fn check_available(&self) -> Option<String>;
    fn launch(&self, target: &str, title: &str, options: &MirrorOptions) -> OpOutcome;
}

pub struct ScrcpyLauncher {
    settings: ScrcpySettings,
}

impl ScrcpyLauncher {
    pub fn new(settings: ScrcpySettings) -> Self {
        Self { settings }
    }

    pub fn program(&self) -> String {
        resolve_scrcpy_program(&self.settings.command_path)
    }
}

pub fn build_scrcpy_args(target: &str, title: &str, settings: &ScrcpySettings) -> Vec<String> {
    let mut args = vec!["-s".to_string(), target.to_string()];
    if !title.trim().is_empty() {
        args.push("--window-title".to_string());
        args.push(title.to_string());
    }
    if !settings.bitrate.trim().is_empty() {
        args.push("-b".to_string());
        args.push(settings.bitrate.trim().to_string());
    }
    if settings.max_size > 0 {
        args.push("-m".to_string());
        args.push(settings.max_size.to_string());
    }
    if settings.max_fps > 0 {
        args.push("--max-fps".to_string());
        args.push(settings.max_fps.to_string());
    }
    if let Some(width) = settings.window_width {
        args.push("--window-width".to_string());
        args.push(width.to_string());
    }
    if let Some(height) = settings.window_height {
        args.push("--window-height".to_string());
        args.push(height.to_string());
    }
    if let Some(x) = settings.window_x {
        args.push("--window-x".to_string());
        args.push(x.to_string());
    }
    if let Some(y) = settings.window_y {
        args.push("--window-y".to_string());
        args.push(y.to_string());
    }
    if let Some(driver) = settings
        .render_driver
        .as_deref()
        .filter(|value| !value.trim().is_empty())
    {
        args.push("--render-driver".to_string());
        args.push(driver.to_string());
    }
    for (enabled, flag) in [
        (settings.stay_awake, "--stay-awake"),
        (settings.show_touches, "--show-touches"),
        (settings.fullscreen, "--fullscreen"),
        (settings.always_on_top, "--always-on-top"),
        (settings.turn_screen_off, "--turn-screen-off"),
    ] {
        if enabled {
            args.push(flag.to_string());
        }
    }
    if !settings.enable_audio {
        args.push("--no-audio".to_string());
    }
    args
}

impl ScreenLauncher for ScrcpyLauncher {
    fn check_available(&self) -> Option<String> {
        let output = Command::new(self.program())
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.lines().next().map(|line| line.trim().to_string())
    }

    fn launch(&self, target: &str, title: &str, options: &MirrorOptions) -> OpOutcome {
        let settings = options.merged_over(&self.settings);
        let args = build_scrcpy_args(target, title, &settings);
        let program = self.program();
        info!(target = %target, program = %program, args = ?args, "launching scrcpy");

        let mut child = match Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!(target = %target, error = %err, "failed to spawn scrcpy");
                return OpOutcome::failure(format!("Failed to launch scrcpy: {err}"));
            }
        };

        // A mirror that dies right away never reached the device.
        std::thread::sleep(Duration::from_millis(150));
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(target = %target, exit_code = ?status.code(), "scrcpy exited immediately");
                OpOutcome::failure(format!("scrcpy exited immediately ({status})"))
            }
            Ok(None) => {
                // Detach: reap in the background so no zombie is left behind.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
                OpOutcome::success("Mirror window launched")
            }
            Err(err) => OpOutcome::failure(format!("Failed to poll scrcpy: {err}")),
        }
    }
}
