use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use treewarp::collaborators::{
    AffineRegistry, Collaborators, CommandProvider, MeshSource, ObjDirectory, SwcDirectory,
    TransformProvider,
};
use treewarp::config::{self, PipelineConfig, ProviderKind};
use treewarp::paths::PathResolver;
use treewarp::pipeline::{Pipeline, cancel_flag};
use treewarp::state::{StateStore, read_state};
use treewarp::types::parse_format_list;
use treewarp::{output, scan};

#[derive(Parser)]
#[command(name = "treewarp")]
#[command(about = "Resumable batch registration of tree skeletons into template spaces")]
#[command(long_about = "\
Resumable batch registration of tree skeletons into template spaces

Each item id names a skeleton in the source space. treewarp classifies the
skeleton by region, transforms it into every matching template and writes
the artifacts under one directory per template and item:

  <output>/
  ├── processing_state.json        # Resumable state (per-item records)
  ├── VFB_00101567/                # Primary-region template
  │   └── 720575941350274352/
  │       ├── volume.swc           # Transformed skeleton
  │       ├── volume_man.obj       # Native mesh, or tube mesh fallback
  │       ├── volume.nrrd          # Gzipped voxel mask
  │       └── metadata.json        # Route, files, checksums
  └── VFB_00200000/                # Second region, skeleton only
      └── 720575941350274352/
          ├── volume.swc
          └── metadata.json

Items already recorded as successful are skipped, so an interrupted run is
resumed by running the same command again. Set TREEWARP_OUTPUT_ROOT to move
the output tree without editing the config.

Run 'treewarp gen-config' to generate a documented treewarp.toml.")]
#[command(version)]
struct Cli {
    /// Config file (missing file means stock defaults)
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Override output.dir
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override output.state_file
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process items (all skeletons in input.skeleton_dir when no ids are given)
    Run(RunArgs),
    /// Summarize the state file
    Status,
    /// Print a stock treewarp.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Item ids to process
    ids: Vec<String>,

    /// Process at most this many items not already done
    #[arg(long)]
    limit: Option<usize>,

    /// Comma-separated formats: skeleton,mesh,volume
    #[arg(long)]
    formats: Option<String>,

    /// Override processing.max_workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Show what would be processed and exit
    #[arg(long)]
    dry_run: bool,

    /// Keep existing artifacts above the size threshold
    #[arg(long, overrides_with = "no_skip_existing")]
    skip_existing: bool,

    /// Regenerate every artifact
    #[arg(long, overrides_with = "skip_existing")]
    no_skip_existing: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("treewarp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        Command::Status => {
            let config = load_config(&cli, None)?;
            let paths = resolve_paths(&config);
            let state_path = state_path(&config, &paths);
            match read_state(&state_path)? {
                Some(state) => output::print_status(&state, &state_path.display().to_string()),
                None => println!("No state file at {}", state_path.display()),
            }
        }
        Command::Run(args) => {
            let config = load_config(&cli, Some(args))?;
            let clean = run(&config, args)?;
            if !clean {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Stock defaults, then the config file, then command-line overrides.
fn load_config(cli: &Cli, run: Option<&RunArgs>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let raw = config::load_raw_config(&cli.config)?;
    if raw.is_none() {
        tracing::info!(path = %cli.config.display(), "no config file, using stock defaults");
    }
    let mut config = config::resolve_config(raw)?;

    if let Some(dir) = &cli.output_dir {
        config.output.dir = dir.clone();
    }
    if let Some(state_file) = &cli.state_file {
        config.output.state_file = state_file.clone();
    }
    if let Some(args) = run {
        if let Some(formats) = &args.formats {
            config.output.formats = parse_format_list(formats)?;
        }
        if let Some(workers) = args.max_workers {
            config.processing.max_workers = workers;
        }
        if args.skip_existing {
            config.output.skip_existing = true;
        }
        if args.no_skip_existing {
            config.output.skip_existing = false;
        }
    }

    config.validate()?;
    Ok(config)
}

fn resolve_paths(config: &PipelineConfig) -> PathResolver {
    PathResolver::from_env(&config.output.dir, &config.output.default_prefix)
}

/// Relative state files live in the output base directory.
fn state_path(config: &PipelineConfig, paths: &PathResolver) -> PathBuf {
    let file = &config.output.state_file;
    if file.is_absolute() {
        file.clone()
    } else {
        paths.base().join(file)
    }
}

fn build_collaborators(config: &PipelineConfig) -> Collaborators {
    let transforms: Arc<dyn TransformProvider> = match config.transforms.provider {
        ProviderKind::Affine => {
            if config.transforms.affine.is_empty() {
                tracing::warn!("no affine steps configured; every transform will be unsupported");
            }
            Arc::new(AffineRegistry::new(config.transforms.affine.clone()))
        }
        ProviderKind::Command => Arc::new(CommandProvider::new(config.transforms.command.clone())),
    };
    let prefixes = config.input.strip_prefixes.clone();
    let meshes = config
        .input
        .mesh_dir
        .as_ref()
        .map(|dir| {
            Arc::new(ObjDirectory::new(dir.clone()).with_prefixes(prefixes.clone())) as Arc<dyn MeshSource>
        });
    Collaborators {
        geometry: Arc::new(SwcDirectory::new(config.input.skeleton_dir.clone()).with_prefixes(prefixes)),
        transforms,
        meshes,
    }
}

/// Returns whether the run finished without failed items.
fn run(config: &PipelineConfig, args: &RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let ids = if args.ids.is_empty() {
        scan::discover_items(&config.input.skeleton_dir)?
    } else {
        args.ids.clone()
    };

    let paths = resolve_paths(config);
    let state = StateStore::load(state_path(config, &paths));
    tracing::info!(
        output = %paths.base().display(),
        state = %state.path().display(),
        "resolved output locations"
    );

    let pipeline = Pipeline::new(config, build_collaborators(config), paths, &state)?;
    let plan = pipeline.plan(&ids, args.limit);

    if args.dry_run {
        output::print_plan(&plan);
        return Ok(true);
    }

    let cancel = cancel_flag();
    watch_ctrl_c(Arc::clone(&cancel));

    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_progress_event(&event) {
                println!("{}", line);
            }
        }
    });
    let result = pipeline.run(&plan, &cancel, Some(tx));
    printer.join().map_err(|_| "output thread panicked")?;
    let summary = result?;

    output::print_summary(&summary);
    Ok(summary.is_clean())
}

/// Exit status for a forced quit, as shells report SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// React to the `count`th Ctrl-C: the first cancels the run gracefully, any
/// later one asks for an immediate exit with the returned status.
fn on_interrupt(count: usize, cancel: &AtomicBool) -> Option<i32> {
    if count <= 1 {
        tracing::warn!("interrupt received, finishing in-flight items (Ctrl-C again to quit now)");
        cancel.store(true, Ordering::SeqCst);
        None
    } else {
        tracing::error!("second interrupt, exiting without final checkpoint");
        Some(INTERRUPTED_EXIT)
    }
}

/// Set `cancel` on the first Ctrl-C. Workers finish their current item and
/// the run ends with a checkpoint. A second Ctrl-C exits immediately.
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!(error = %e, "could not start signal runtime; Ctrl-C will not checkpoint");
                return;
            }
        };
        let mut count = 0;
        while runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            count += 1;
            if let Some(code) = on_interrupt(count, &cancel) {
                std::process::exit(code);
            }
        }
    });
}
