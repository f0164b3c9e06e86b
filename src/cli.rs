// Command-line overrides
//
// Flags win over config.toml. Only the handful of settings worth changing
// per run are exposed.

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "frame-pacer", about = "Spinning cube with triple-buffered frame pacing")]
// -h is the window height, so help is long-form only
#[command(disable_help_flag = true)]
pub struct Args {
    /// Client area width in pixels
    #[arg(short = 'w', long)]
    pub width: Option<u32>,

    /// Client area height in pixels
    #[arg(short = 'h', long)]
    pub height: Option<u32>,

    /// Use a software (CPU) Vulkan implementation
    #[arg(long, alias = "software")]
    pub warp: bool,

    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

impl Args {
    /// Parse the process arguments. The single-dash `-warp` spelling is
    /// accepted alongside `--warp`.
    pub fn from_env() -> Self {
        Self::parse_from(normalize(std::env::args_os()))
    }

    /// Layer the flags on top of a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        if self.warp {
            config.graphics.use_software_adapter = true;
        }
    }
}

/// Clap would read `-warp` as `-w arp`.
fn normalize<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| if arg == "-warp" { OsString::from("--warp") } else { arg })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_override_window_size() {
        let args = Args::try_parse_from(["frame-pacer", "-w", "800", "-h", "600"]).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert!(!config.graphics.use_software_adapter);
    }

    #[test]
    fn warp_selects_the_software_adapter() {
        let args = Args::try_parse_from(["frame-pacer", "--warp"]).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        assert!(config.graphics.use_software_adapter);
    }

    #[test]
    fn single_dash_warp_is_accepted() {
        let argv = ["frame-pacer", "-warp", "-w", "640"].map(OsString::from);
        let args = Args::try_parse_from(normalize(argv)).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        assert!(config.graphics.use_software_adapter);
        assert_eq!(config.window.width, 640);
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let args = Args::try_parse_from(["frame-pacer"]).unwrap();
        let mut config = Config::default();
        config.window.width = 1024;
        args.apply(&mut config);
        assert_eq!(config.window.width, 1024);
        assert_eq!(args.config, PathBuf::from("config.toml"));
    }
}
