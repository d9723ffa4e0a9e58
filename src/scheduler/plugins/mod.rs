//! Plugin registry and the scheduling profile.
//!
//! Plugins are registered globally by name as factories over the fake
//! cluster store; the profile lists the enabled plugin names per extension
//! point. Resolving a profile instantiates each named plugin exactly once,
//! so a plugin registered at several extension points (the GPU plugin in
//! particular) shares one state across all of them.

pub mod defaults;
pub mod gpu_share;
pub mod open_local;
pub mod simon;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::core::common::{
    DEFAULT_SCHEDULER_NAME, OPEN_GPU_SHARE_PLUGIN_NAME, OPEN_LOCAL_PLUGIN_NAME, SIMON_PLUGIN_NAME,
};
use crate::error::SimonError;
use crate::scheduler::framework::{BindPlugin, FilterPlugin, ReservePlugin, ScorePlugin};
use crate::store::FakeCluster;

/// The extension points one plugin instance implements.
#[derive(Default, Clone)]
pub struct PluginHandles {
    pub filter: Option<Arc<dyn FilterPlugin>>,
    pub score: Option<Arc<dyn ScorePlugin>>,
    pub reserve: Option<Arc<dyn ReservePlugin>>,
    pub bind: Option<Arc<dyn BindPlugin>>,
}

pub type PluginFactory = fn(Arc<FakeCluster>) -> PluginHandles;

lazy_static! {
    pub static ref PLUGIN_REGISTRY: HashMap<&'static str, PluginFactory> = {
        let mut registry: HashMap<&'static str, PluginFactory> = HashMap::new();
        registry.insert("NodeUnschedulable", defaults::node_unschedulable_factory);
        registry.insert("NodeName", defaults::node_name_factory);
        registry.insert("TaintToleration", defaults::taint_toleration_factory);
        registry.insert("NodeAffinity", defaults::node_affinity_factory);
        registry.insert("NodeResourcesFit", defaults::node_resources_fit_factory);
        registry.insert(
            "NodeResourcesLeastAllocated",
            defaults::least_allocated_factory,
        );
        registry.insert("InterPodAffinity", defaults::inter_pod_affinity_factory);
        registry.insert(SIMON_PLUGIN_NAME, simon::factory);
        registry.insert(OPEN_LOCAL_PLUGIN_NAME, open_local::factory);
        registry.insert(OPEN_GPU_SHARE_PLUGIN_NAME, gpu_share::factory);
        registry
    };
}

/// A plugin enabled at some extension point; weight applies to Score only.
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub name: String,
    pub weight: i64,
}

impl PluginEntry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 1,
        }
    }

    pub fn with_weight(name: &str, weight: i64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub scheduler_name: String,
    pub percentage_of_nodes_to_score: u8,
    pub filter: Vec<PluginEntry>,
    pub score: Vec<PluginEntry>,
    pub reserve: Vec<PluginEntry>,
    pub bind: Vec<PluginEntry>,
}

/// The default profile: the orchestrator's predicates and priorities with
/// the custom plugins appended. The default binder is not registered at
/// all; the terminal binder is Simon.
pub fn default_profile() -> Profile {
    Profile {
        scheduler_name: DEFAULT_SCHEDULER_NAME.to_string(),
        percentage_of_nodes_to_score: 100,
        filter: vec![
            PluginEntry::new("NodeUnschedulable"),
            PluginEntry::new("NodeName"),
            PluginEntry::new("TaintToleration"),
            PluginEntry::new("NodeAffinity"),
            PluginEntry::new("NodeResourcesFit"),
            PluginEntry::new("InterPodAffinity"),
            PluginEntry::new(OPEN_LOCAL_PLUGIN_NAME),
            PluginEntry::new(OPEN_GPU_SHARE_PLUGIN_NAME),
        ],
        score: vec![
            PluginEntry::new("NodeResourcesLeastAllocated"),
            PluginEntry::with_weight("InterPodAffinity", 2),
            PluginEntry::new(SIMON_PLUGIN_NAME),
            PluginEntry::new(OPEN_LOCAL_PLUGIN_NAME),
            PluginEntry::new(OPEN_GPU_SHARE_PLUGIN_NAME),
        ],
        reserve: vec![PluginEntry::new(OPEN_GPU_SHARE_PLUGIN_NAME)],
        bind: vec![
            PluginEntry::new(OPEN_LOCAL_PLUGIN_NAME),
            PluginEntry::new(OPEN_GPU_SHARE_PLUGIN_NAME),
            PluginEntry::new(SIMON_PLUGIN_NAME),
        ],
    }
}

/// Plugin sets resolved against a store, one instance per plugin name.
pub struct ResolvedPlugins {
    pub filter: Vec<Arc<dyn FilterPlugin>>,
    pub score: Vec<(Arc<dyn ScorePlugin>, i64)>,
    pub reserve: Vec<Arc<dyn ReservePlugin>>,
    pub bind: Vec<Arc<dyn BindPlugin>>,
}

pub fn resolve_profile(
    profile: &Profile,
    store: Arc<FakeCluster>,
    extra: &HashMap<String, PluginFactory>,
) -> Result<ResolvedPlugins, SimonError> {
    let mut instances: HashMap<String, PluginHandles> = HashMap::new();
    for entry in profile
        .filter
        .iter()
        .chain(&profile.score)
        .chain(&profile.reserve)
        .chain(&profile.bind)
    {
        if !instances.contains_key(&entry.name) {
            let factory = extra
                .get(&entry.name)
                .or_else(|| PLUGIN_REGISTRY.get(entry.name.as_str()))
                .ok_or_else(|| {
                    SimonError::PluginInternal(format!(
                        "plugin {:?} is not registered",
                        entry.name
                    ))
                })?;
            instances.insert(entry.name.clone(), factory(store.clone()));
        }
    }

    let lookup = |name: &str| instances.get(name).cloned().unwrap_or_default();

    let mut resolved = ResolvedPlugins {
        filter: vec![],
        score: vec![],
        reserve: vec![],
        bind: vec![],
    };
    for entry in &profile.filter {
        match lookup(&entry.name).filter {
            Some(plugin) => resolved.filter.push(plugin),
            None => {
                return Err(SimonError::PluginInternal(format!(
                    "plugin {:?} does not implement Filter",
                    entry.name
                )))
            }
        }
    }
    for entry in &profile.score {
        match lookup(&entry.name).score {
            Some(plugin) => resolved.score.push((plugin, entry.weight)),
            None => {
                return Err(SimonError::PluginInternal(format!(
                    "plugin {:?} does not implement Score",
                    entry.name
                )))
            }
        }
    }
    for entry in &profile.reserve {
        match lookup(&entry.name).reserve {
            Some(plugin) => resolved.reserve.push(plugin),
            None => {
                return Err(SimonError::PluginInternal(format!(
                    "plugin {:?} does not implement Reserve",
                    entry.name
                )))
            }
        }
    }
    for entry in &profile.bind {
        match lookup(&entry.name).bind {
            Some(plugin) => resolved.bind.push(plugin),
            None => {
                return Err(SimonError::PluginInternal(format!(
                    "plugin {:?} does not implement Bind",
                    entry.name
                )))
            }
        }
    }
    Ok(resolved)
}
