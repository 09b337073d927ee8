//! Collaborator traits and the shipped implementations.
//!
//! The pipeline never fetches geometry or does registration math itself. It
//! talks to three collaborators:
//!
//! | Trait | Contract | Shipped implementation |
//! |---|---|---|
//! | [`GeometrySource`] | item id → skeleton, distinct `NotFound` | [`SwcDirectory`] |
//! | [`TransformProvider`] | points × step → points, same count | [`AffineRegistry`], [`CommandProvider`] |
//! | [`MeshSource`] (optional) | item id → native mesh if one exists | [`ObjDirectory`] |
//!
//! They are bundled in [`Collaborators`], built once in `main` and passed by
//! reference. A provider that is not thread-safe is wrapped in a
//! [`GuardedProvider`] that funnels every call through one mutex; every
//! provider and fetch call is bounded by the configured timeout.

mod affine;
mod command;
mod files;

pub use affine::{AffineRegistry, AffineStep};
pub use command::{CommandConfig, CommandProvider};
pub use files::{ObjDirectory, SwcDirectory};

use crate::geometry::{Mesh, Skeleton};
use crate::identity::ItemId;
use crate::route::ChainStep;
use crate::types::Point;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("item {0} not found")]
    NotFound(String),
    #[error("could not read item {id}: {reason}")]
    Unreadable { id: String, reason: String },
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("{step}: {reason}")]
    Failed { step: ChainStep, reason: String },
    #[error("{step}: no transform registered")]
    Unsupported { step: ChainStep },
    #[error("{step}: expected {expected} points back, got {actual}")]
    PointCount {
        step: ChainStep,
        expected: usize,
        actual: usize,
    },
    #[error("{step}: timed out after {timeout:?}")]
    Timeout { step: ChainStep, timeout: Duration },
}

/// Retrieves raw item geometry.
pub trait GeometrySource: Send + Sync {
    fn fetch(&self, id: &ItemId) -> Result<Skeleton, FetchError>;
}

/// Retrieves an item's native surface mesh, in the same space as its skeleton.
pub trait MeshSource: Send + Sync {
    /// `Ok(None)` when the item simply has no mesh.
    fn fetch(&self, id: &ItemId) -> Result<Option<Mesh>, FetchError>;
}

/// Moves points between coordinate spaces, one chain step at a time.
pub trait TransformProvider: Send + Sync {
    /// Transform `points` along `step`. Must return exactly one point per
    /// input point, in order.
    fn apply(&self, points: &[Point], step: &ChainStep) -> Result<Vec<Point>, TransformError>;

    /// Whether concurrent calls are safe. Providers that return `false` are
    /// only run with one worker or behind a [`GuardedProvider`].
    fn is_thread_safe(&self) -> bool {
        true
    }
}

/// Everything the pipeline needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub geometry: Arc<dyn GeometrySource>,
    pub transforms: Arc<dyn TransformProvider>,
    pub meshes: Option<Arc<dyn MeshSource>>,
}

/// The call did not return within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(pub Duration);

/// Run `f` on a helper thread and wait at most `timeout` for it.
///
/// With no timeout, `f` runs inline. A call that times out is abandoned, not
/// killed: its thread finishes in the background and its result is dropped.
pub fn call_with_timeout<T, F>(timeout: Option<Duration>, f: F) -> Result<T, Elapsed>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let Some(timeout) = timeout else {
        return Ok(f());
    };
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::spawn(move || {
        // Receiver may be gone after a timeout.
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).map_err(|_| Elapsed(timeout))
}

/// Fetch geometry with the configured timeout.
pub fn fetch_skeleton(
    source: &Arc<dyn GeometrySource>,
    id: &ItemId,
    timeout: Option<Duration>,
) -> Result<Skeleton, FetchError> {
    let source = Arc::clone(source);
    let owned = id.clone();
    call_with_timeout(timeout, move || source.fetch(&owned))
        .map_err(|Elapsed(t)| FetchError::Timeout(t))?
}

/// Fetch a native mesh with the configured timeout.
pub fn fetch_mesh(
    source: &Arc<dyn MeshSource>,
    id: &ItemId,
    timeout: Option<Duration>,
) -> Result<Option<Mesh>, FetchError> {
    let source = Arc::clone(source);
    let owned = id.clone();
    call_with_timeout(timeout, move || source.fetch(&owned))
        .map_err(|Elapsed(t)| FetchError::Timeout(t))?
}

/// Provider wrapper that applies the timeout and holds one process-wide gate
/// around every call when asked to serialize or when the inner provider is
/// not thread-safe.
///
/// The gate is taken on the helper thread, so an abandoned call that is still
/// running keeps the next caller waiting instead of overlapping with it. This
/// matters even with one worker: after a timeout the router moves on while
/// the abandoned call keeps running.
pub struct GuardedProvider {
    inner: Arc<dyn TransformProvider>,
    gate: Option<Arc<Mutex<()>>>,
    timeout: Option<Duration>,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn TransformProvider>, serialize: bool, timeout: Option<Duration>) -> Self {
        let gate = (serialize || !inner.is_thread_safe()).then(|| Arc::new(Mutex::new(())));
        Self {
            inner,
            gate,
            timeout,
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }
}

impl TransformProvider for GuardedProvider {
    fn apply(&self, points: &[Point], step: &ChainStep) -> Result<Vec<Point>, TransformError> {
        let inner = Arc::clone(&self.inner);
        let gate = self.gate.clone();
        let points = points.to_vec();
        let owned_step = step.clone();
        call_with_timeout(self.timeout, move || {
            let _guard = gate
                .as_ref()
                .map(|g| g.lock().unwrap_or_else(|e| e.into_inner()));
            inner.apply(&points, &owned_step)
        })
        .map_err(|Elapsed(timeout)| TransformError::Timeout {
            step: step.clone(),
            timeout,
        })?
    }

    fn is_thread_safe(&self) -> bool {
        self.gate.is_some() || self.inner.is_thread_safe()
    }
}

#[cfg(test)]
pub mod mock {
    //! Recording mock collaborators.
    //!
    //! They use `Mutex` (not `RefCell`) so they are `Sync` and work under the
    //! rayon pool.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that adds a constant to every coordinate and records each
    /// step it was asked to run.
    #[derive(Default)]
    pub struct MockProvider {
        pub offset: f64,
        pub failing: HashSet<String>,
        pub truncate: bool,
        pub thread_safe: bool,
        pub delay: Option<Duration>,
        pub calls: Mutex<Vec<ChainStep>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl MockProvider {
        pub fn offset(offset: f64) -> Self {
            Self {
                offset,
                thread_safe: true,
                ..Default::default()
            }
        }

        pub fn failing_targets(mut self, targets: &[&str]) -> Self {
            self.failing = targets.iter().map(|t| t.to_string()).collect();
            self
        }

        pub fn truncating(mut self) -> Self {
            self.truncate = true;
            self
        }

        pub fn not_thread_safe(mut self) -> Self {
            self.thread_safe = false;
            self
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> Vec<ChainStep> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TransformProvider for MockProvider {
        fn apply(&self, points: &[Point], step: &ChainStep) -> Result<Vec<Point>, TransformError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(step.clone());
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&step.target) {
                return Err(TransformError::Failed {
                    step: step.clone(),
                    reason: "registration unavailable".into(),
                });
            }
            let mut out: Vec<Point> = points
                .iter()
                .map(|p| [p[0] + self.offset, p[1] + self.offset, p[2] + self.offset])
                .collect();
            if self.truncate {
                out.pop();
            }
            Ok(out)
        }

        fn is_thread_safe(&self) -> bool {
            self.thread_safe
        }
    }

    /// In-memory geometry source.
    #[derive(Default)]
    pub struct MockGeometry {
        pub items: HashMap<String, Skeleton>,
        pub fetched: Mutex<Vec<String>>,
        pub delay: Option<Duration>,
    }

    impl MockGeometry {
        pub fn with(items: Vec<(&str, Skeleton)>) -> Self {
            Self {
                items: items.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                fetched: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    impl GeometrySource for MockGeometry {
        fn fetch(&self, id: &ItemId) -> Result<Skeleton, FetchError> {
            self.fetched.lock().unwrap().push(id.to_string());
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.items
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| FetchError::NotFound(id.to_string()))
        }
    }

    /// In-memory native mesh source.
    #[derive(Default)]
    pub struct MockMeshes {
        pub meshes: HashMap<String, Mesh>,
    }

    impl MeshSource for MockMeshes {
        fn fetch(&self, id: &ItemId) -> Result<Option<Mesh>, FetchError> {
            Ok(self.meshes.get(id.as_str()).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::types::Region;
    use std::sync::atomic::Ordering;

    fn step() -> ChainStep {
        ChainStep::new("BANC", "JRC2018F", Region::Primary)
    }

    #[test]
    fn call_with_timeout_returns_value() {
        assert_eq!(call_with_timeout(Some(Duration::from_secs(5)), || 7), Ok(7));
        assert_eq!(call_with_timeout(None, || 8), Ok(8));
    }

    #[test]
    fn call_with_timeout_gives_up() {
        let result = call_with_timeout(Some(Duration::from_millis(20)), || {
            std::thread::sleep(Duration::from_millis(500));
            1
        });
        assert_eq!(result, Err(Elapsed(Duration::from_millis(20))));
    }

    #[test]
    fn guarded_provider_times_out_with_step() {
        let slow = Arc::new(MockProvider::offset(0.0).slow(Duration::from_millis(500)));
        let guarded = GuardedProvider::new(slow, false, Some(Duration::from_millis(20)));
        let err = guarded.apply(&[[0.0; 3]], &step()).unwrap_err();
        assert!(matches!(err, TransformError::Timeout { ref step, .. } if step.target == "JRC2018F"));
    }

    #[test]
    fn serialized_provider_never_overlaps() {
        use rayon::prelude::*;

        let inner = Arc::new(
            MockProvider::offset(1.0)
                .not_thread_safe()
                .slow(Duration::from_millis(5)),
        );
        let guarded = GuardedProvider::new(inner.clone(), true, None);
        assert!(guarded.is_thread_safe());

        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        pool.install(|| {
            (0..16).into_par_iter().for_each(|_| {
                guarded.apply(&[[0.0; 3]], &step()).unwrap();
            });
        });
        assert_eq!(inner.calls().len(), 16);
        assert_eq!(inner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_safe_provider_is_not_gated() {
        let inner = Arc::new(MockProvider::offset(0.0));
        let guarded = GuardedProvider::new(inner, false, None);
        assert!(!guarded.is_serialized());
        assert!(guarded.is_thread_safe());
    }

    #[test]
    fn unsafe_provider_is_gated_without_serialize() {
        let inner = Arc::new(MockProvider::offset(0.0).not_thread_safe());
        let guarded = GuardedProvider::new(inner, false, None);
        assert!(guarded.is_serialized());
        assert!(guarded.is_thread_safe());
    }

    #[test]
    fn abandoned_call_blocks_the_next_one() {
        let inner = Arc::new(
            MockProvider::offset(0.0)
                .not_thread_safe()
                .slow(Duration::from_millis(150)),
        );
        let guarded = GuardedProvider::new(inner.clone(), false, Some(Duration::from_millis(20)));

        let first = guarded.apply(&[[0.0; 3]], &step());
        let second = guarded.apply(&[[0.0; 3]], &step());
        assert!(matches!(first, Err(TransformError::Timeout { .. })));
        assert!(matches!(second, Err(TransformError::Timeout { .. })));

        // Let both abandoned calls drain.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while inner.calls().len() < 2 || inner.in_flight.load(Ordering::SeqCst) > 0 {
            assert!(std::time::Instant::now() < deadline, "abandoned calls never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(inner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn routing_after_timeout_never_overlaps() {
        use crate::route::{RoutingConfig, TemplateRegistry, TransformRouter};
        use crate::test_helpers::test_templates;

        let inner = Arc::new(
            MockProvider::offset(0.0)
                .not_thread_safe()
                .slow(Duration::from_millis(60)),
        );
        let guarded = GuardedProvider::new(inner.clone(), false, Some(Duration::from_millis(20)));
        let router = TransformRouter::new(
            "BANC",
            RoutingConfig::default(),
            TemplateRegistry::new(test_templates()),
        );
        let points = [[300_000.0, 150_000.0, 160_000.0]];
        let _ = router.route(&guarded, &points, Region::Primary);
        let _ = router.route(&guarded, &points, Region::Primary);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while inner.calls().len() < 2 || inner.in_flight.load(Ordering::SeqCst) > 0 {
            assert!(std::time::Instant::now() < deadline, "abandoned calls never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(inner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_distinguishes_not_found() {
        let source: Arc<dyn GeometrySource> = Arc::new(MockGeometry::default());
        let id = crate::identity::parse_item_id("5", &[]).unwrap();
        let err = fetch_skeleton(&source, &id, Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(ref s) if s == "5"));
    }
}
