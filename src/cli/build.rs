//! The `lode build` command.

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::{OwoColorize, Stream::Stdout};
use tracing::instrument;

use crate::build::{build, RealiseMode};
use crate::eval::NixEvaluator;
use crate::flake::{closure_root_dir, CliFlakeResolver, EvalCache};
use crate::session::{current_system, FlakeOpts, Session, SourceOpts};
use crate::store::CliStore;

#[derive(Args)]
pub struct BuildArgs {
    /// Installables to build (default: .)
    pub installables: Vec<String>,

    /// Show what would be built without building
    #[arg(long)]
    pub dry_run: bool,

    /// Resolve installables without building anything
    #[arg(long, conflicts_with = "dry_run")]
    pub no_build: bool,

    #[command(flatten)]
    pub source: SourceOpts,

    #[command(flatten)]
    pub flake: FlakeOpts,
}

#[instrument(level = "debug", skip_all)]
pub fn cmd_build(args: BuildArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to get current directory")?;

    let mut store = CliStore::new();
    let mut eval = NixEvaluator::new(cwd.clone());
    let mut resolver = CliFlakeResolver;
    let cache = EvalCache::new();

    let mut sess = Session::new(&mut store, &mut eval, &mut resolver, &cache, cwd)
        .with_system(&current_system());
    sess.lock_mode = args.flake.lock_file_mode();
    sess.file = args.source.file.clone();
    sess.root_dir = closure_root_dir();

    let installables = sess.prepare_installables(&args.installables, true)?;

    let mode = if args.dry_run {
        RealiseMode::DryRun
    } else if args.no_build {
        RealiseMode::NoBuild
    } else {
        RealiseMode::Build
    };

    let buildables = build(&mut sess, mode, &installables)?;

    for buildable in &buildables {
        for (name, path) in &buildable.outputs {
            if name == "out" {
                println!("{}", path.if_supports_color(Stdout, |p| p.bold()));
            } else {
                println!("{}\t{}", name, path.if_supports_color(Stdout, |p| p.bold()));
            }
        }
    }

    Ok(())
}
