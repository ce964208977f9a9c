//! Command-line surface.
//!
//! The agent has historically been launched with Go-style single-dash long
//! flags (`-address host -port 2667 -name rig1`). clap only understands
//! `--long`, so [`normalize_flags`] rewrites the known single-dash spellings
//! before parsing. Both styles therefore work, including `-port=2667`.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Overrides;

/// Flags accepted with a single dash.
const LONG_FLAGS: &[&str] = &["address", "ip", "port", "name", "config", "work-dir"];

/// Deployment agent: connects to an orchestrator and provisions/runs an application.
#[derive(Debug, Parser)]
#[command(name = "deploy-agent", version)]
pub struct Cli {
    /// Address of the orchestrator [default: localhost].
    #[arg(long, visible_alias = "ip", value_name = "HOST")]
    pub address: Option<String>,
    /// Port of the orchestrator, 1-65535 [default: 2667].
    #[arg(long, allow_negative_numbers = true)]
    pub port: Option<i64>,
    /// Name reported to the orchestrator; no spaces or newlines [default: unnamed].
    #[arg(long)]
    pub name: Option<String>,
    /// Path to TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Working directory for the deployed application [default: appDir].
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

impl Cli {
    /// Parse `args` (including the program name), accepting single-dash long flags.
    pub fn parse_args<I>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = String>,
    {
        Self::try_parse_from(normalize_flags(args))
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            address: self.address.clone(),
            port: self.port,
            name: self.name.clone(),
            work_dir: self.work_dir.clone(),
        }
    }
}

/// Rewrite `-flag`/`-flag=value` to `--flag` for the flags in [`LONG_FLAGS`].
/// Everything after a bare `--` is left alone.
pub fn normalize_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut out: Vec<String> = args.next().into_iter().collect();
    let mut literal = false;
    for arg in args {
        if !literal {
            if arg == "--" {
                literal = true;
            } else if let Some(flag) = arg.strip_prefix('-').filter(|f| !f.starts_with('-')) {
                let name = flag.split('=').next().unwrap_or(flag);
                if LONG_FLAGS.contains(&name) {
                    out.push(format!("-{arg}"));
                    continue;
                }
            }
        }
        out.push(arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("deploy-agent")
            .chain(list.iter().copied())
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_single_dash_flags() {
        let cli = Cli::parse_args(args(&["-port", "9999", "-name", "bot1"])).unwrap();
        assert_eq!(cli.port, Some(9999));
        assert_eq!(cli.name.as_deref(), Some("bot1"));
        assert!(cli.address.is_none());
    }

    #[test]
    fn test_ip_alias_and_equals() {
        let cli = Cli::parse_args(args(&["-ip=10.0.0.5", "--port=2668"])).unwrap();
        assert_eq!(cli.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(cli.port, Some(2668));

        let cli = Cli::parse_args(args(&["-address", "build-host"])).unwrap();
        assert_eq!(cli.address.as_deref(), Some("build-host"));
    }

    #[test]
    fn test_negative_port_reaches_validation() {
        let cli = Cli::parse_args(args(&["-port", "-1"])).unwrap();
        assert_eq!(cli.overrides().port, Some(-1));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Cli::parse_args(args(&["-verbose"])).is_err());
    }

    #[test]
    fn test_normalize_leaves_values_alone() {
        assert_eq!(
            normalize_flags(args(&["-name", "x", "--", "-port"])),
            args(&["--name", "x", "--", "-port"])
        );
        assert_eq!(normalize_flags(args(&["-work-dir", "/srv"])), args(&["--work-dir", "/srv"]));
    }
}
