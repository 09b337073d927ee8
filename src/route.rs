//! Transform routing: source space → intermediate space → template.
//!
//! Every region has an ordered list of candidate template names. The router
//! moves an item into the intermediate space once, then tries each candidate
//! in turn and stops at the first one the provider can reach:
//!
//! | Row | Attempt | Outcome |
//! |---|---|---|
//! | 1..N | `intermediate → candidate[i]` | [`RouteKind::Registered`] |
//! | N+1 | intermediate coordinates as-is | [`RouteKind::Approximate`] (if allowed) |
//! | N+2 | source coordinates as-is | [`RouteKind::Unregistered`] (opt-in) |
//! | (none) | nothing worked | [`RouteFailure`] listing every attempt |
//!
//! The steps that actually ran are kept in [`RoutedTarget::applied`] so other
//! geometry of the same item (native meshes) can be replayed through them.

use crate::collaborators::{TransformError, TransformProvider};
use crate::types::{Point, Region, TemplateSpace};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One provider invocation: move points from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainStep {
    pub source: String,
    pub target: String,
    /// Anatomical region of the item, for providers that register regions
    /// with different models.
    pub region: Region,
}

impl ChainStep {
    pub fn new(source: impl Into<String>, target: impl Into<String>, region: Region) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            region,
        }
    }
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source, self.target, self.region)
    }
}

/// Which row of the fallback table produced a target's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Registered,
    Approximate,
    Unregistered,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteKind::Registered => "registered",
            RouteKind::Approximate => "approximate",
            RouteKind::Unregistered => "unregistered",
        })
    }
}

/// Per-region transform chain: the shared first step and the ordered
/// candidates for the second. Built per item, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformChain {
    pub region: Region,
    pub to_intermediate: ChainStep,
    pub candidates: Vec<String>,
}

impl TransformChain {
    pub fn candidate_step(&self, candidate: &str) -> ChainStep {
        ChainStep::new(&self.to_intermediate.target, candidate, self.region)
    }
}

/// A failed provider call, kept for the error message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub step: ChainStep,
    pub error: String,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Geometry successfully placed in one template.
#[derive(Debug, Clone)]
pub struct RoutedTarget {
    pub region: Region,
    pub template: TemplateSpace,
    pub kind: RouteKind,
    /// Winning candidate name, for registered routes.
    pub alternate: Option<String>,
    /// Steps that produced `positions`, in order.
    pub applied: Vec<ChainStep>,
    pub positions: Vec<Point>,
    /// Failed calls before the winning row.
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    pub region: Region,
    pub attempts: Vec<Attempt>,
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no route to {} target", self.region)?;
        if self.attempts.is_empty() {
            return f.write_str(" (no candidates configured)");
        }
        f.write_str(": ")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{attempt}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RouteFailure {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Space every chain passes through.
    pub intermediate: String,
    /// Candidate template names for primary-region items, in priority order.
    pub primary: Vec<String>,
    /// Candidate template names for secondary-region items, in priority order.
    pub secondary: Vec<String>,
    /// Accept intermediate-space coordinates when no candidate succeeds.
    pub allow_approximate: bool,
    /// Accept untransformed coordinates as a last resort.
    pub allow_unregistered: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            intermediate: "JRC2018F".into(),
            primary: vec!["JRC2018U".into()],
            secondary: vec!["JRC2018VNCunisex".into(), "JRCVNC2018U".into()],
            allow_approximate: true,
            allow_unregistered: false,
        }
    }
}

impl RoutingConfig {
    pub fn candidates(&self, region: Region) -> &[String] {
        match region {
            Region::Primary => &self.primary,
            Region::Secondary => &self.secondary,
        }
    }
}

/// Immutable lookup of configured template spaces by id, name or alias.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: Vec<TemplateSpace>,
}

impl TemplateRegistry {
    /// Build from config, dropping later entries that repeat an id.
    pub fn new(templates: Vec<TemplateSpace>) -> Self {
        let mut unique: Vec<TemplateSpace> = Vec::with_capacity(templates.len());
        for t in templates {
            if unique.iter().any(|u| u.id == t.id) {
                tracing::warn!(template = %t.id, "duplicate template id ignored");
                continue;
            }
            unique.push(t);
        }
        Self { templates: unique }
    }

    pub fn resolve(&self, name: &str) -> Option<&TemplateSpace> {
        self.templates.iter().find(|t| t.answers_to(name))
    }

    pub fn all(&self) -> &[TemplateSpace] {
        &self.templates
    }
}

/// Builds chains and walks the fallback table.
#[derive(Debug, Clone)]
pub struct TransformRouter {
    source: String,
    config: RoutingConfig,
    registry: TemplateRegistry,
}

impl TransformRouter {
    pub fn new(source: impl Into<String>, config: RoutingConfig, registry: TemplateRegistry) -> Self {
        Self {
            source: source.into(),
            config,
            registry,
        }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn build_chain(&self, region: Region) -> TransformChain {
        TransformChain {
            region,
            to_intermediate: ChainStep::new(&self.source, &self.config.intermediate, region),
            candidates: self.config.candidates(region).to_vec(),
        }
    }

    /// Template used when no candidate was reached: the first candidate that
    /// names a configured template, else any template tagged with `region`.
    fn fallback_template(&self, chain: &TransformChain) -> Option<&TemplateSpace> {
        chain
            .candidates
            .iter()
            .find_map(|c| self.registry.resolve(c))
            .or_else(|| self.registry.all().iter().find(|t| t.region == chain.region))
    }

    /// Route every requested region independently. A failure for one region
    /// never prevents another.
    pub fn route_all(
        &self,
        provider: &dyn TransformProvider,
        positions: &[Point],
        regions: &[Region],
    ) -> Vec<(Region, Result<RoutedTarget, RouteFailure>)> {
        regions
            .iter()
            .map(|&region| (region, self.route(provider, positions, region)))
            .collect()
    }

    pub fn route(
        &self,
        provider: &dyn TransformProvider,
        positions: &[Point],
        region: Region,
    ) -> Result<RoutedTarget, RouteFailure> {
        let chain = self.build_chain(region);
        let mut attempts = Vec::new();

        let intermediate = match apply(provider, positions, &chain.to_intermediate) {
            Ok(points) => Some(points),
            Err(e) => {
                attempts.push(Attempt {
                    step: chain.to_intermediate.clone(),
                    error: e.to_string(),
                });
                None
            }
        };

        if let Some(intermediate) = intermediate {
            for candidate in &chain.candidates {
                let step = chain.candidate_step(candidate);
                let Some(template) = self.registry.resolve(candidate) else {
                    attempts.push(Attempt {
                        step,
                        error: "no template with this name is configured".into(),
                    });
                    continue;
                };
                match apply(provider, &intermediate, &step) {
                    Ok(points) => {
                        if !attempts.is_empty() {
                            tracing::info!(
                                %region,
                                alternate = %candidate,
                                failed = attempts.len(),
                                "reached template through alternate name"
                            );
                        }
                        return Ok(RoutedTarget {
                            region,
                            template: template.clone(),
                            kind: RouteKind::Registered,
                            alternate: Some(candidate.clone()),
                            applied: vec![chain.to_intermediate.clone(), step],
                            positions: points,
                            attempts,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(%step, error = %e, "candidate failed");
                        attempts.push(Attempt {
                            step,
                            error: e.to_string(),
                        });
                    }
                }
            }

            if self.config.allow_approximate
                && let Some(template) = self.fallback_template(&chain)
            {
                tracing::warn!(
                    %region,
                    template = %template.id,
                    space = %chain.to_intermediate.target,
                    "no registration to template; writing intermediate-space coordinates"
                );
                return Ok(RoutedTarget {
                    region,
                    template: template.clone(),
                    kind: RouteKind::Approximate,
                    alternate: None,
                    applied: vec![chain.to_intermediate.clone()],
                    positions: intermediate,
                    attempts,
                });
            }
        }

        if self.config.allow_unregistered
            && let Some(template) = self.fallback_template(&chain)
        {
            tracing::warn!(
                %region,
                template = %template.id,
                "no transform succeeded; writing untransformed coordinates"
            );
            return Ok(RoutedTarget {
                region,
                template: template.clone(),
                kind: RouteKind::Unregistered,
                alternate: None,
                applied: Vec::new(),
                positions: positions.to_vec(),
                attempts,
            });
        }

        Err(RouteFailure { region, attempts })
    }
}

/// Call the provider and check it returned one point per input point.
pub fn apply(
    provider: &dyn TransformProvider,
    points: &[Point],
    step: &ChainStep,
) -> Result<Vec<Point>, TransformError> {
    let out = provider.apply(points, step)?;
    if out.len() != points.len() {
        return Err(TransformError::PointCount {
            step: step.clone(),
            expected: points.len(),
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Replay `steps` in order over another point set.
pub fn replay(
    provider: &dyn TransformProvider,
    points: &[Point],
    steps: &[ChainStep],
) -> Result<Vec<Point>, TransformError> {
    let mut current = points.to_vec();
    for step in steps {
        current = apply(provider, &current, step)?;
    }
    Ok(current)
}
