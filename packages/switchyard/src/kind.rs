//! Kind definitions - the immutable, compiled representation of a machine.
//!
//! An [`FsmKind`] is built once at program start with [`FsmKind::builder`]
//! and shared by reference across every instance of that kind. Composition
//! happens at build time: component kinds contribute their states and
//! transitions to the containing kind's tables, so the running engine only
//! ever consults one merged transition table.
//!
//! # Duplicate resolution
//!
//! When two declarations disagree on `(from, event)`, later-added shadows
//! earlier-added: components contribute in declaration order and locals are
//! considered added last. Resolution happens here, once, so lookup at run
//! time is a single map probe.
//!
//! # Example
//!
//! ```ignore
//! let door = FsmKind::builder("Demo.Door")
//!     .description("A door that opens and closes")
//!     .states(["closed", "opening", "open", "closing"])
//!     .initial("closed")
//!     .transition("closed", "open_cmd", "opening")
//!     .transition("opening", "fully_open", "open")
//!     .on_enter("open", |mut i| {
//!         i.put("opened", serde_json::json!(true));
//!         i
//!     })
//!     .build()?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::warn;

use crate::effect::Effect;
use crate::error::DefineError;
use crate::instance::{DataMap, FsmInstance};
use crate::plugin::Plugin;

/// An entry or exit hook: a pure transformation of the instance.
pub type Hook = Arc<dyn Fn(FsmInstance) -> FsmInstance + Send + Sync>;

/// A validator threading the instance: `Ok` passes (possibly replacing the
/// instance), `Err(reason)` rejects the event before any state change.
pub type Validation =
    Arc<dyn Fn(FsmInstance, &str, &DataMap) -> Result<FsmInstance, String> + Send + Sync>;

/// Handler invoked when a registry broadcast reaches an instance of this kind.
pub type BroadcastHook =
    Arc<dyn Fn(FsmInstance, &str, &serde_json::Value) -> FsmInstance + Send + Sync>;

/// A plugin together with its installation options.
#[derive(Clone)]
pub struct InstalledPlugin {
    /// The plugin implementation.
    pub plugin: Arc<dyn Plugin>,
    /// Options passed to `init`.
    pub options: DataMap,
}

/// One declared transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Source state.
    pub from: String,
    /// Driving event.
    pub event: String,
    /// Target state.
    pub to: String,
}

/// Small hook list; nearly all states carry zero, one, or two hooks.
pub type HookList = SmallVec<[Hook; 2]>;

/// The compiled, immutable definition of a machine.
pub struct FsmKind {
    name: String,
    short_name: String,
    description: Option<String>,
    states: BTreeSet<String>,
    initial_state: String,
    /// Merged declaration-order list (components first, locals last).
    transitions: Vec<Transition>,
    /// Resolved `(from, event) -> to` with later-added-shadows-earlier.
    lookup: HashMap<(String, String), String>,
    enter_hooks: HashMap<String, HookList>,
    exit_hooks: HashMap<String, HookList>,
    validations: Vec<Validation>,
    plugins: Vec<InstalledPlugin>,
    effects: HashMap<String, Effect>,
    named_effects: HashMap<String, Effect>,
    broadcast_handler: Option<BroadcastHook>,
    component_names: Vec<String>,
    unreachable_states: Vec<String>,
}

impl FsmKind {
    /// Start declaring a kind. `name` is the fully-qualified identifier;
    /// its last dotted segment becomes the module short name used in
    /// journal and snapshot paths.
    pub fn builder(name: impl Into<String>) -> KindBuilder {
        KindBuilder::new(name.into())
    }

    /// Fully-qualified kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last dotted segment of the name.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Human description, if declared.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The merged state set.
    pub fn states(&self) -> &BTreeSet<String> {
        &self.states
    }

    /// The declared initial state.
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// The merged transition list in declaration order (components first,
    /// locals last). Shadowed entries are retained here for introspection;
    /// [`FsmKind::resolve`] applies the precedence rule.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Resolve `(from, event)` to the unique target state, if any.
    pub fn resolve(&self, from: &str, event: &str) -> Option<&str> {
        self.lookup
            .get(&(from.to_string(), event.to_string()))
            .map(String::as_str)
    }

    /// Entry hooks for a state, declaration order.
    pub fn enter_hooks(&self, state: &str) -> &[Hook] {
        self.enter_hooks.get(state).map(|h| h.as_slice()).unwrap_or(&[])
    }

    /// Exit hooks for a state, declaration order.
    pub fn exit_hooks(&self, state: &str) -> &[Hook] {
        self.exit_hooks.get(state).map(|h| h.as_slice()).unwrap_or(&[])
    }

    /// Declared validators, declaration order.
    pub fn validations(&self) -> &[Validation] {
        &self.validations
    }

    /// Installed plugins, declaration order.
    pub fn plugins(&self) -> &[InstalledPlugin] {
        &self.plugins
    }

    /// Entry effect tree for a state, if declared.
    pub fn effect_for(&self, state: &str) -> Option<&Effect> {
        self.effects.get(state)
    }

    /// Named effect tree, if declared.
    pub fn named_effect(&self, name: &str) -> Option<&Effect> {
        self.named_effects.get(name)
    }

    /// Handler for registry broadcasts, if declared.
    pub fn broadcast_handler(&self) -> Option<&BroadcastHook> {
        self.broadcast_handler.as_ref()
    }

    /// Names of composed component kinds, declaration order.
    pub fn component_names(&self) -> &[String] {
        &self.component_names
    }

    /// States not reachable from the initial state. Allowed, but reported
    /// at build time.
    pub fn unreachable_states(&self) -> &[String] {
        &self.unreachable_states
    }

    /// One-line rendering of each resolved transition, for discovery.
    pub fn transitions_summary(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut summary = Vec::new();
        // Walk locals-last order backwards so the winning declaration is
        // the one rendered.
        for t in self.transitions.iter().rev() {
            if seen.insert((t.from.clone(), t.event.clone())) {
                summary.push(format!("{} --{}--> {}", t.from, t.event, t.to));
            }
        }
        summary.sort();
        summary
    }
}

impl std::fmt::Debug for FsmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmKind")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("initial_state", &self.initial_state)
            .field("transitions", &self.transitions.len())
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

/// Extract the module short name: the last dotted segment.
pub fn module_short_name(kind_name: &str) -> &str {
    kind_name.rsplit('.').next().unwrap_or(kind_name)
}

// =============================================================================
// Builder
// =============================================================================

/// Accumulates a kind declaration and compiles it with [`KindBuilder::build`].
pub struct KindBuilder {
    name: String,
    description: Option<String>,
    states: Vec<String>,
    initial_state: Option<String>,
    transitions: Vec<Transition>,
    enter_hooks: HashMap<String, HookList>,
    exit_hooks: HashMap<String, HookList>,
    validations: Vec<Validation>,
    components: Vec<Arc<FsmKind>>,
    plugins: Vec<InstalledPlugin>,
    effects: HashMap<String, Effect>,
    named_effects: HashMap<String, Effect>,
    broadcast_handler: Option<BroadcastHook>,
}

impl KindBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            description: None,
            states: Vec::new(),
            initial_state: None,
            transitions: Vec::new(),
            enter_hooks: HashMap::new(),
            exit_hooks: HashMap::new(),
            validations: Vec::new(),
            components: Vec::new(),
            plugins: Vec::new(),
            effects: HashMap::new(),
            named_effects: HashMap::new(),
            broadcast_handler: None,
        }
    }

    /// Human description for discovery output.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare one state.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.push(state.into());
        self
    }

    /// Declare several states.
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(states.into_iter().map(Into::into));
        self
    }

    /// Declare the initial state.
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Declare a transition.
    pub fn transition(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            event: event.into(),
            to: to.into(),
        });
        self
    }

    /// Append an entry hook for a state.
    pub fn on_enter<F>(mut self, state: impl Into<String>, hook: F) -> Self
    where
        F: Fn(FsmInstance) -> FsmInstance + Send + Sync + 'static,
    {
        self.enter_hooks
            .entry(state.into())
            .or_default()
            .push(Arc::new(hook));
        self
    }

    /// Append an exit hook for a state.
    pub fn on_exit<F>(mut self, state: impl Into<String>, hook: F) -> Self
    where
        F: Fn(FsmInstance) -> FsmInstance + Send + Sync + 'static,
    {
        self.exit_hooks
            .entry(state.into())
            .or_default()
            .push(Arc::new(hook));
        self
    }

    /// Append a validator. Validators run in declaration order before any
    /// state change.
    pub fn validate<F>(mut self, validation: F) -> Self
    where
        F: Fn(FsmInstance, &str, &DataMap) -> Result<FsmInstance, String> + Send + Sync + 'static,
    {
        self.validations.push(Arc::new(validation));
        self
    }

    /// Compose another kind: its states and transitions merge into this one
    /// at build time. Components contribute in declaration order; local
    /// declarations shadow them on `(from, event)` collisions.
    ///
    /// Cyclic composition cannot be expressed: a component must already be
    /// built before it can be referenced.
    pub fn component(mut self, component: &Arc<FsmKind>) -> Self {
        self.components.push(component.clone());
        self
    }

    /// Install a plugin with options.
    pub fn plugin<P: Plugin>(mut self, plugin: P, options: DataMap) -> Self {
        self.plugins.push(InstalledPlugin {
            plugin: Arc::new(plugin),
            options,
        });
        self
    }

    /// Declare the effect tree launched when a state is entered.
    pub fn effect(mut self, state: impl Into<String>, effect: Effect) -> Self {
        self.effects.insert(state.into(), effect);
        self
    }

    /// Declare a named effect tree, executable out-of-band.
    pub fn named_effect(mut self, name: impl Into<String>, effect: Effect) -> Self {
        self.named_effects.insert(name.into(), effect);
        self
    }

    /// Declare the handler for registry broadcasts.
    pub fn on_broadcast<F>(mut self, handler: F) -> Self
    where
        F: Fn(FsmInstance, &str, &serde_json::Value) -> FsmInstance + Send + Sync + 'static,
    {
        self.broadcast_handler = Some(Arc::new(handler));
        self
    }

    /// Compile the declaration into an immutable kind.
    ///
    /// Validates initial-state membership and transition state references,
    /// resolves duplicate `(from, event)` pairs, and reports states that
    /// are unreachable from the initial state.
    pub fn build(self) -> Result<Arc<FsmKind>, DefineError> {
        let name = self.name;
        let short_name = module_short_name(&name).to_string();

        // Merge: component states and transitions first (declaration
        // order), locals last.
        let mut states: BTreeSet<String> = BTreeSet::new();
        let mut transitions: Vec<Transition> = Vec::new();
        let mut component_names = Vec::new();
        for component in &self.components {
            states.extend(component.states().iter().cloned());
            transitions.extend(component.transitions().iter().cloned());
            component_names.push(component.name().to_string());
        }
        states.extend(self.states.iter().cloned());
        transitions.extend(self.transitions.iter().cloned());

        if states.is_empty() {
            return Err(DefineError::NoStates { kind: name });
        }

        let initial_state = match self.initial_state {
            Some(s) if states.contains(&s) => s,
            other => {
                return Err(DefineError::BadInitialState {
                    kind: name,
                    state: other.unwrap_or_default(),
                })
            }
        };

        for t in &transitions {
            for state in [&t.from, &t.to] {
                if !states.contains(state.as_str()) {
                    return Err(DefineError::UndeclaredState {
                        kind: name,
                        from: t.from.clone(),
                        event: t.event.clone(),
                        to: t.to.clone(),
                        state: state.clone(),
                    });
                }
            }
        }

        // Front-to-back insertion with overwrite: the last declaration for
        // a `(from, event)` pair wins, which is exactly
        // later-added-shadows-earlier with locals last.
        let mut lookup = HashMap::with_capacity(transitions.len());
        for t in &transitions {
            lookup.insert((t.from.clone(), t.event.clone()), t.to.clone());
        }

        let unreachable_states = find_unreachable(&states, &initial_state, &lookup);
        if !unreachable_states.is_empty() {
            warn!(
                kind = %name,
                unreachable = ?unreachable_states,
                "states unreachable from initial state"
            );
        }

        Ok(Arc::new(FsmKind {
            name,
            short_name,
            description: self.description,
            states,
            initial_state,
            transitions,
            lookup,
            enter_hooks: self.enter_hooks,
            exit_hooks: self.exit_hooks,
            validations: self.validations,
            plugins: self.plugins,
            effects: self.effects,
            named_effects: self.named_effects,
            broadcast_handler: self.broadcast_handler,
            component_names,
            unreachable_states,
        }))
    }
}

/// Breadth-first walk of the resolved transition table from the initial
/// state; anything not visited is unreachable.
fn find_unreachable(
    states: &BTreeSet<String>,
    initial: &str,
    lookup: &HashMap<(String, String), String>,
) -> Vec<String> {
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut frontier: Vec<&str> = vec![initial];
    while let Some(state) = frontier.pop() {
        if !visited.insert(state) {
            continue;
        }
        for ((from, _), to) in lookup {
            if from.as_str() == state && !visited.contains(to.as_str()) {
                frontier.push(to.as_str());
            }
        }
    }
    states
        .iter()
        .filter(|s| !visited.contains(s.as_str()))
        .cloned()
        .collect()
}
