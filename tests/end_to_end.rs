//! End-to-end runs over real directories: SWC skeletons and OBJ meshes on
//! disk, the affine provider, and an output tree in a temp dir.
//!
//! Run with: cargo test --test end_to_end

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use tempfile::TempDir;
use treewarp::artifacts::{METADATA_FILENAME, MeshOrigin};
use treewarp::collaborators::{AffineRegistry, AffineStep, Collaborators, MeshSource, ObjDirectory, SwcDirectory};
use treewarp::config::{PipelineConfig, default_templates};
use treewarp::paths::PathResolver;
use treewarp::pipeline::{ItemReport, Pipeline, ProgressEvent, RunSummary};
use treewarp::scan::discover_items;
use treewarp::state::{StateStore, Status, read_state};
use treewarp::types::Format;

const BRAIN: &str = "VFB_00101567";
const VNC: &str = "VFB_00200000";

// =========================================================================
// Fixtures
// =========================================================================

struct Workspace {
    _tmp: TempDir,
    skeletons: PathBuf,
    meshes: PathBuf,
    out: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let skeletons = tmp.path().join("skeletons");
        let meshes = tmp.path().join("meshes");
        let out = tmp.path().join("out");
        fs::create_dir_all(&skeletons).unwrap();
        fs::create_dir_all(&meshes).unwrap();
        Self {
            _tmp: tmp,
            skeletons,
            meshes,
            out,
        }
    }

    fn add_skeleton(&self, id: &str, z_start: f64, z_step: f64, nodes: usize) {
        fs::write(self.skeletons.join(format!("{id}.swc")), chain_swc(z_start, z_step, nodes)).unwrap();
    }

    fn state_path(&self) -> PathBuf {
        self.out.join("processing_state.json")
    }

    fn target_dir(&self, id: &str, template: &str) -> PathBuf {
        self.out.join(template).join(id)
    }
}

/// An unbranched chain in nanometre source coordinates.
fn chain_swc(z_start: f64, z_step: f64, nodes: usize) -> String {
    let mut text = String::from("# id type x y z radius parent\n");
    for i in 0..nodes {
        let parent = if i == 0 { -1 } else { i as i64 };
        let x = 300_000.0 + 400.0 * i as f64;
        let z = z_start + z_step * i as f64;
        text.push_str(&format!("{} 3 {} 150000 {} 350 {}\n", i + 1, x, z, parent));
    }
    text
}

fn identity(source: &str, target: &str) -> AffineStep {
    AffineStep {
        source: source.into(),
        target: target.into(),
        region: None,
        matrix: AffineStep::IDENTITY,
    }
}

/// Identity registrations for both regions.
fn full_registry() -> Vec<AffineStep> {
    vec![
        identity("BANC", "JRC2018F"),
        identity("JRC2018F", "JRC2018U"),
        identity("JRC2018F", "JRC2018VNCunisex"),
    ]
}

fn config(ws: &Workspace, affine: Vec<AffineStep>) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.input.skeleton_dir = ws.skeletons.clone();
    config.input.mesh_dir = Some(ws.meshes.clone());
    config.output.dir = ws.out.clone();
    config.transforms.affine = affine;
    // Coarse grids keep the volumes small.
    config.templates = default_templates()
        .into_iter()
        .map(|mut t| {
            t.pitch = [2.0, 2.0, 2.0];
            t
        })
        .collect();
    config
}

struct Outcome {
    summary: RunSummary,
    reports: Vec<ItemReport>,
}

fn run<S: AsRef<str>>(ws: &Workspace, config: &PipelineConfig, ids: &[S], with_meshes: bool) -> Outcome {
    let prefixes = config.input.strip_prefixes.clone();
    let collaborators = Collaborators {
        geometry: Arc::new(SwcDirectory::new(ws.skeletons.clone()).with_prefixes(prefixes.clone())),
        transforms: Arc::new(AffineRegistry::new(config.transforms.affine.clone())),
        meshes: with_meshes.then(|| {
            Arc::new(ObjDirectory::new(ws.meshes.clone()).with_prefixes(prefixes.clone())) as Arc<dyn MeshSource>
        }),
    };
    let paths = PathResolver::new(&config.output.dir, &config.output.default_prefix, None);
    let state = StateStore::load(ws.state_path());
    let pipeline = Pipeline::new(config, collaborators, paths, &state).unwrap();
    let plan = pipeline.plan(ids, None);

    let (tx, rx) = mpsc::channel();
    let summary = pipeline.run(&plan, &AtomicBool::new(false), Some(tx)).unwrap();
    let reports = rx
        .try_iter()
        .filter_map(|event| match event {
            ProgressEvent::ItemFinished { report, .. } => Some(*report),
            _ => None,
        })
        .collect();
    Outcome { summary, reports }
}

fn sidecar(dir: &Path) -> serde_json::Value {
    let text = fs::read_to_string(dir.join(METADATA_FILENAME)).unwrap();
    serde_json::from_str(&text).unwrap()
}

// =========================================================================
// Happy path
// =========================================================================

#[test]
fn primary_item_gets_every_format_with_native_mesh() {
    let ws = Workspace::new();
    ws.add_skeleton("1001", 152_000.0, 300.0, 60);
    let mut obj = String::new();
    for i in 0..40 {
        obj.push_str(&format!("v {} 150000 160000\n", 300_000 + 1_000 * i));
    }
    for i in 1..39 {
        obj.push_str(&format!("f {} {} {}\n", i, i + 1, i + 2));
    }
    fs::write(ws.meshes.join("1001.obj"), obj).unwrap();

    let cfg = config(&ws, full_registry());
    let outcome = run(&ws, &cfg, &["1001"], true);

    assert_eq!(outcome.summary.succeeded, 1);
    assert!(outcome.summary.is_clean());

    let dir = ws.target_dir("1001", BRAIN);
    for format in Format::ALL {
        let path = dir.join(format.filename());
        assert!(path.is_file(), "missing {}", path.display());
    }
    let mesh = fs::read_to_string(dir.join(Format::Mesh.filename())).unwrap();
    assert!(mesh.starts_with("v 300 150 160\n"), "mesh not scaled to microns: {}", &mesh[..40]);

    let report = &outcome.reports[0];
    assert_eq!(report.targets.len(), 1);
    assert_eq!(report.targets[0].mesh_origin, Some(MeshOrigin::Native));

    let meta = sidecar(&dir);
    assert_eq!(meta["route"], "registered");
    assert_eq!(meta["primary"], true);
    assert_eq!(meta["mesh_origin"], "native");
    assert_eq!(meta["files"]["skeleton"]["sha256"].as_str().unwrap().len(), 64);

    let state = read_state(&ws.state_path()).unwrap().unwrap();
    let record = &state.records["1001"];
    assert_eq!(record.status, Status::Success);
    assert_eq!(record.primary_template.as_deref(), Some(BRAIN));
    assert_eq!(record.primary_files().unwrap().len(), 3);
}

#[test]
fn missing_native_mesh_falls_back_to_tube() {
    let ws = Workspace::new();
    ws.add_skeleton("1002", 152_000.0, 300.0, 60);

    let outcome = run(&ws, &config(&ws, full_registry()), &["1002"], true);

    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(outcome.reports[0].targets[0].mesh_origin, Some(MeshOrigin::Tube));
    assert_eq!(sidecar(&ws.target_dir("1002", BRAIN))["mesh_origin"], "tube");
}

#[test]
fn spanning_item_writes_skeleton_only_for_second_region() {
    let ws = Workspace::new();
    // 20 nodes on each side of z = 150 000.
    ws.add_skeleton("1003", 130_000.0, 1_000.0, 40);

    let outcome = run(&ws, &config(&ws, full_registry()), &["1003"], false);

    assert_eq!(outcome.summary.succeeded, 1);
    let brain = ws.target_dir("1003", BRAIN);
    let vnc = ws.target_dir("1003", VNC);
    assert!(brain.join(Format::Volume.filename()).is_file());
    assert!(vnc.join(Format::Skeleton.filename()).is_file());
    assert!(!vnc.join(Format::Mesh.filename()).exists());
    assert!(!vnc.join(Format::Volume.filename()).exists());
    assert_eq!(sidecar(&vnc)["primary"], false);

    let state = read_state(&ws.state_path()).unwrap().unwrap();
    assert_eq!(state.records["1003"].targets.len(), 2);
}

#[test]
fn discovered_prefixed_skeletons_are_found() {
    let ws = Workspace::new();
    ws.add_skeleton("BANC_5", 152_000.0, 300.0, 60);
    ws.add_skeleton("6", 152_000.0, 300.0, 60);

    let ids = discover_items(&ws.skeletons).unwrap();
    assert_eq!(ids, vec!["6", "BANC_5"]);

    let outcome = run(&ws, &config(&ws, full_registry()), &ids, false);

    assert_eq!(outcome.summary.succeeded, 2, "{:?}", outcome.summary.failed);
    assert!(ws.target_dir("5", BRAIN).join(Format::Skeleton.filename()).is_file());
    let state = read_state(&ws.state_path()).unwrap().unwrap();
    assert_eq!(state.records["5"].status, Status::Success);
}

// =========================================================================
// Failures
// =========================================================================

#[test]
fn item_fails_when_every_target_fails() {
    let ws = Workspace::new();
    ws.add_skeleton("1004", 152_000.0, 300.0, 60);

    let outcome = run(&ws, &config(&ws, Vec::new()), &["1004"], false);

    assert_eq!(outcome.summary.succeeded, 0);
    assert_eq!(outcome.summary.failed.len(), 1);
    let (id, error) = &outcome.summary.failed[0];
    assert_eq!(id, "1004");
    assert!(error.contains("BANC -> JRC2018F (primary)"), "{error}");
    assert!(!ws.out.join(BRAIN).join("1004").exists());

    let state = read_state(&ws.state_path()).unwrap().unwrap();
    assert_eq!(state.records["1004"].status, Status::Failed);
    assert_eq!(state.failures().len(), 1);
}

#[test]
fn missing_skeleton_and_bad_id_are_recorded_as_failed() {
    let ws = Workspace::new();
    ws.add_skeleton("1005", 152_000.0, 300.0, 60);

    let outcome = run(&ws, &config(&ws, full_registry()), &["1005", "2000", "bad id"], false);

    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(outcome.summary.failed.len(), 2);
    let state = read_state(&ws.state_path()).unwrap().unwrap();
    assert_eq!(state.records["2000"].status, Status::Failed);
    assert!(state.records["bad id"].error.as_deref().unwrap().starts_with("identity:"));
}

// =========================================================================
// Resume and idempotence
// =========================================================================

#[test]
fn second_run_skips_finished_items() {
    let ws = Workspace::new();
    ws.add_skeleton("1006", 152_000.0, 300.0, 60);
    let cfg = config(&ws, full_registry());

    let first = run(&ws, &cfg, &["1006"], false);
    assert_eq!(first.summary.succeeded, 1);

    let second = run(&ws, &cfg, &["1006"], false);
    assert_eq!(second.summary.skipped, 1);
    assert_eq!(second.summary.succeeded, 0);
    assert!(second.reports.is_empty());
}

#[test]
fn rerun_without_state_leaves_existing_files_alone() {
    let ws = Workspace::new();
    ws.add_skeleton("1007", 152_000.0, 300.0, 60);
    let cfg = config(&ws, full_registry());

    run(&ws, &cfg, &["1007"], false);
    let dir = ws.target_dir("1007", BRAIN);
    let meta_before = fs::read(dir.join(METADATA_FILENAME)).unwrap();
    fs::remove_file(ws.state_path()).unwrap();

    let again = run(&ws, &cfg, &["1007"], false);

    assert_eq!(again.summary.succeeded, 1);
    let target = &again.reports[0].targets[0];
    assert!(target.created.is_empty(), "recreated {:?}", target.created);
    assert_eq!(target.present.len(), 3);
    assert_eq!(fs::read(dir.join(METADATA_FILENAME)).unwrap(), meta_before);
}

#[test]
fn failed_items_are_retried_after_fixing_the_input() {
    let ws = Workspace::new();
    ws.add_skeleton("1008", 152_000.0, 300.0, 60);
    let cfg = config(&ws, full_registry());

    let first = run(&ws, &cfg, &["1008", "1009"], false);
    assert_eq!(first.summary.succeeded, 1);
    assert_eq!(first.summary.failed.len(), 1);

    ws.add_skeleton("1009", 152_000.0, 300.0, 60);
    let second = run(&ws, &cfg, &["1008", "1009"], false);

    assert_eq!(second.summary.skipped, 1);
    assert_eq!(second.summary.succeeded, 1);
    let state = read_state(&ws.state_path()).unwrap().unwrap();
    assert!(state.records.values().all(|r| r.status == Status::Success));
}
